use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use bundlekit_core::{
    ArtifactClass, ArtifactVersion, OutcomeKind, PatchDescriptor, Release, UpdateConfig,
    UpdateError, VersionRequirement,
};
use bundlekit_fetch::{
    build_http_client, FetchClient, FetchRequest, ManifestLoad, ManifestSource, RetryPolicy,
};
use bundlekit_installer::{
    remove_path_if_exists, ArtifactLock, AtomicInstaller, InstallLayout, InstallRecord,
    InstallSession, InstallState, InstallStateStore, InstalledArtifact, StagedContent,
    PARTIAL_SUFFIX,
};
use bundlekit_patch::{DeltaPatcher, PatchOutcome};
use tracing::{debug, info, warn};

use crate::plan::{plan_update, PlanOptions, UpdatePlan};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedArtifact {
    pub class: ArtifactClass,
    pub version: ArtifactVersion,
    pub install_path: PathBuf,
    pub content_sha256: String,
}

impl From<&InstalledArtifact> for ResolvedArtifact {
    fn from(installed: &InstalledArtifact) -> Self {
        Self {
            class: installed.class,
            version: installed.version.clone(),
            install_path: installed.install_path.clone(),
            content_sha256: installed.content_sha256.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    AlreadyCurrent(ResolvedArtifact),
    UpdatedByFetch(ResolvedArtifact),
    UpdatedByPatch(ResolvedArtifact),
}

impl UpdateOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::AlreadyCurrent(_) => OutcomeKind::AlreadyCurrent,
            Self::UpdatedByFetch(_) => OutcomeKind::UpdatedByFetch,
            Self::UpdatedByPatch(_) => OutcomeKind::UpdatedByPatch,
        }
    }

    pub fn artifact(&self) -> &ResolvedArtifact {
        match self {
            Self::AlreadyCurrent(artifact)
            | Self::UpdatedByFetch(artifact)
            | Self::UpdatedByPatch(artifact) => artifact,
        }
    }
}

#[derive(Debug)]
pub enum StageOutcome {
    Patched(StagedContent),
    FullFetch(StagedContent),
    Failed(anyhow::Error),
}

pub struct Updater {
    config: UpdateConfig,
    layout: InstallLayout,
    fetch: FetchClient,
    manifest: ManifestSource,
}

impl Updater {
    pub fn new(config: UpdateConfig, layout: InstallLayout, fetch: FetchClient) -> Self {
        let manifest = ManifestSource::new(config.manifest_url.clone(), layout.manifest_cache_path());
        Self {
            config,
            layout,
            fetch,
            manifest,
        }
    }

    pub fn from_config(config: UpdateConfig, layout: InstallLayout) -> Result<Self> {
        let client = build_http_client(&config.network)?;
        let fetch = FetchClient::new(client, RetryPolicy::from_config(&config.network));
        Ok(Self::new(config, layout, fetch))
    }

    pub fn layout(&self) -> &InstallLayout {
        &self.layout
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    pub fn status(&self, class: ArtifactClass) -> Result<InstallRecord> {
        InstallStateStore::new(&self.layout).load(class)
    }

    /// Returns a usable install of `class` meeting `requirement`, updating it
    /// first when the manifest says so.
    pub fn ensure(
        &self,
        class: ArtifactClass,
        requirement: &VersionRequirement,
    ) -> Result<UpdateOutcome, UpdateError> {
        self.ensure_inner(class, requirement).map_err(|err| {
            let error = UpdateError::classify(err);
            debug!(class = %class, kind = error.kind().as_str(), "update failed");
            error
        })
    }

    fn options(&self) -> PlanOptions {
        PlanOptions {
            allow_downgrade: self.config.allow_downgrade,
            patches_enabled: self.config.patches_enabled,
        }
    }

    fn ensure_inner(
        &self,
        class: ArtifactClass,
        requirement: &VersionRequirement,
    ) -> Result<UpdateOutcome> {
        let store = InstallStateStore::new(&self.layout);
        let record = self.settle_interrupted(&store, class)?;
        let satisfying = record
            .last_confirmed()
            .filter(|installed| requirement.is_satisfied_by(&installed.version));

        if let Some(installed) = satisfying {
            if !self.config.updates_enabled {
                debug!(class = %class, version = %installed.version, "update checks are disabled");
                return Ok(UpdateOutcome::AlreadyCurrent(installed.into()));
            }
            if let Some(manifest) = self.manifest.fresh_cached(self.config.manifest_max_age()) {
                if let Some(entry) = manifest.entry(class) {
                    if let UpdatePlan::UpToDate(current) =
                        plan_update(class, requirement, &record, entry, self.options())?
                    {
                        return Ok(UpdateOutcome::AlreadyCurrent((&current).into()));
                    }
                }
            }
        }

        let manifest = match self.manifest.load(&self.fetch) {
            ManifestLoad::Fresh(manifest) => manifest,
            ManifestLoad::Cached {
                manifest,
                fetched_at_unix,
            } => {
                if let Some(installed) = satisfying {
                    warn!(
                        class = %class,
                        version = %installed.version,
                        "could not reach the server; launching the installed version"
                    );
                    return Ok(UpdateOutcome::AlreadyCurrent(installed.into()));
                }
                info!(class = %class, fetched_at_unix, "could not reach the server; using the cached manifest");
                manifest
            }
            ManifestLoad::Unavailable { reason } => {
                if let Some(installed) = satisfying {
                    warn!(
                        class = %class,
                        version = %installed.version,
                        "could not reach the server; launching the installed version"
                    );
                    return Ok(UpdateOutcome::AlreadyCurrent(installed.into()));
                }
                return Err(UpdateError::ManifestUnavailable { reason }.into());
            }
        };

        let Some(entry) = manifest.entry(class) else {
            if let Some(installed) = satisfying {
                warn!(class = %class, "manifest does not list this artifact; keeping the installed version");
                return Ok(UpdateOutcome::AlreadyCurrent(installed.into()));
            }
            return Err(UpdateError::ManifestUnavailable {
                reason: format!("manifest does not list {class}"),
            }
            .into());
        };

        if let UpdatePlan::UpToDate(current) =
            plan_update(class, requirement, &record, entry, self.options())?
        {
            return Ok(UpdateOutcome::AlreadyCurrent((&current).into()));
        }

        let _lock = ArtifactLock::acquire(&self.layout, class, self.config.lock_timeout())?;
        let installer = AtomicInstaller::new(&self.layout);
        let mut record = store.load(class)?;
        if installer.recover(&record)? {
            info!(class = %class, "local copy is incomplete; re-running the interrupted update");
            record = store.load(class)?;
        }

        let plan = plan_update(class, requirement, &record, entry, self.options())?;
        let (release, patch) = match plan {
            UpdatePlan::UpToDate(current) => {
                info!(class = %class, version = %current.version, "another instance finished this update");
                return Ok(UpdateOutcome::AlreadyCurrent((&current).into()));
            }
            UpdatePlan::NeedsFetch { release } => (release, None),
            UpdatePlan::NeedsPatch {
                base,
                release,
                patch,
            } => (release, Some((base, patch))),
        };

        info!(
            class = %class,
            from = ?record.installed_version().map(ToString::to_string),
            to = %release.version,
            patch = patch.is_some(),
            "updating artifact"
        );
        let session = installer.begin(class, &release.version)?;
        let (staged, patched) = match self.stage(&session, &release, patch.as_ref()) {
            StageOutcome::Patched(staged) => (staged, true),
            StageOutcome::FullFetch(staged) => (staged, false),
            StageOutcome::Failed(err) => {
                if let Err(abort_err) = installer.abort(session) {
                    warn!(error = %format!("{abort_err:#}"), "failed to clean up after a failed update");
                }
                return Err(err);
            }
        };

        let installed = installer.install(&session, staged)?;
        self.prune_downloads(class, &release);
        self.prune_patches(class);

        let resolved = ResolvedArtifact::from(&installed);
        Ok(if patched {
            UpdateOutcome::UpdatedByPatch(resolved)
        } else {
            UpdateOutcome::UpdatedByFetch(resolved)
        })
    }

    // Rolls back a leftover marker unless another instance holds the lock.
    fn settle_interrupted(
        &self,
        store: &InstallStateStore<'_>,
        class: ArtifactClass,
    ) -> Result<InstallRecord> {
        let record = store.load(class)?;
        if record.state != InstallState::Installing {
            return Ok(record);
        }
        let Some(_lock) = ArtifactLock::try_acquire(&self.layout, class)? else {
            debug!(class = %class, "another instance is updating; keeping its previous install");
            return Ok(record);
        };
        if AtomicInstaller::new(&self.layout).recover(&record)? {
            info!(class = %class, "rolled back an interrupted update");
        }
        store.load(class)
    }

    fn stage(
        &self,
        session: &InstallSession,
        release: &Release,
        patch: Option<&(InstalledArtifact, PatchDescriptor)>,
    ) -> StageOutcome {
        if let Some((base, descriptor)) = patch {
            let patcher = DeltaPatcher::new(&self.layout, &self.fetch, &self.config.trusted_patch_keys);
            match patcher.apply(session, base, descriptor, release) {
                PatchOutcome::Patched(staged) => return StageOutcome::Patched(staged),
                PatchOutcome::FullFetch(failure) => {
                    info!(class = %session.class, reason = %failure, "downloading the full release instead");
                }
            }
        }

        match self.fetch_and_stage(session, release) {
            Ok(staged) => StageOutcome::FullFetch(staged),
            Err(err) => StageOutcome::Failed(err),
        }
    }

    fn fetch_and_stage(&self, session: &InstallSession, release: &Release) -> Result<StagedContent> {
        let installer = AtomicInstaller::new(&self.layout);
        let request = FetchRequest {
            url: release.url.clone(),
            final_path: self
                .layout
                .download_path(session.class, &release.version, release.archive_type),
            identity: release.identity(),
            expected_size: release.size,
            label: format!("{} {}", session.class, release.version),
        };

        let fetched = self.fetch.fetch_verified(&request)?;
        match installer.stage_archive(session, &fetched.path, release) {
            Ok(staged) => Ok(staged),
            Err(err) => {
                let mismatch = err.chain().any(|cause| {
                    matches!(
                        cause.downcast_ref::<UpdateError>(),
                        Some(UpdateError::ContentMismatch { .. })
                    )
                });
                if mismatch {
                    warn!(path = %fetched.path.display(), "cached archive extracts to unexpected content; discarding it");
                    let _ = remove_path_if_exists(&fetched.path);
                }
                Err(err)
            }
        }
    }

    fn prune_downloads(&self, class: ArtifactClass, keep: &Release) {
        let dir = self.layout.downloads_dir(class);
        let keep_path = self
            .layout
            .download_path(class, &keep.version, keep.archive_type);
        let Ok(entries) = fs::read_dir(&dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path == keep_path || is_partial(&path) {
                continue;
            }
            if let Err(err) = remove_path_if_exists(&path) {
                warn!(path = %path.display(), error = %err, "failed to prune old download");
            }
        }
    }
    // Patch blobs are only useful against the base they were applied to.
    fn prune_patches(&self, class: ArtifactClass) {
        let dir = self.layout.patches_dir(class);
        let Ok(entries) = fs::read_dir(&dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if let Err(err) = remove_path_if_exists(&path) {
                warn!(path = %path.display(), error = %err, "failed to prune applied patch");
            }
        }
    }
}

fn is_partial(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|name| name.to_string_lossy().ends_with(PARTIAL_SUFFIX))
}
