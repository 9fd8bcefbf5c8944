use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use bundlekit_core::{ArtifactClass, ArtifactVersion, Release, UpdateError};
use bundlekit_security::{content_digest, digests_match};
use tracing::{debug, info, warn};

use crate::artifact::extract_archive;
use crate::fs_utils::{current_unix_timestamp, fsync_dir, remove_path_if_exists};
use crate::layout::InstallLayout;
use crate::state::{
    InstallMarker, InstallRecord, InstallSource, InstallStateStore, InstalledArtifact,
};

static TXID_SEQ: AtomicU64 = AtomicU64::new(0);

pub fn new_txid() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    let seq = TXID_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{nanos:x}-{:x}-{seq}", std::process::id())
}

/// An install in flight. The marker exists for as long as this does.
#[derive(Debug)]
pub struct InstallSession {
    pub class: ArtifactClass,
    pub target: ArtifactVersion,
    pub txid: String,
    staging: PathBuf,
}

impl InstallSession {
    pub fn staging_dir(&self) -> &Path {
        &self.staging
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedContent {
    pub class: ArtifactClass,
    pub version: ArtifactVersion,
    pub dir: PathBuf,
    pub archive_sha256: String,
    pub content_sha256: String,
    pub source: InstallSource,
}

/// Every mutation of the install directory goes through here.
#[derive(Debug, Clone, Copy)]
pub struct AtomicInstaller<'a> {
    layout: &'a InstallLayout,
}

impl<'a> AtomicInstaller<'a> {
    pub fn new(layout: &'a InstallLayout) -> Self {
        Self { layout }
    }

    fn store(&self) -> InstallStateStore<'a> {
        InstallStateStore::new(self.layout)
    }

    /// Restores the public path to the recorded install and discards any
    /// other trees of `class`. Must run under the class lock. Returns whether
    /// an interrupted install was found.
    pub fn recover(&self, record: &InstallRecord) -> Result<bool> {
        let class = record.class;
        let interrupted = record.marker.is_some() || self.layout.marker_path(class).exists();
        let keep = record.installed.as_ref().map(|installed| installed.store_path.clone());

        if interrupted {
            warn!(
                class = %class,
                target = ?record.marker.as_ref().map(|marker| marker.target.to_string()),
                "previous install was interrupted; discarding its staged state"
            );
            self.restore_public_path(class, record.installed.as_ref())?;
        }

        self.sweep_store(class, keep.as_deref());
        if interrupted {
            self.store().clear_marker(class)?;
        }
        Ok(interrupted)
    }

    pub fn begin(&self, class: ArtifactClass, target: &ArtifactVersion) -> Result<InstallSession> {
        self.layout.ensure_base_dirs()?;
        let txid = new_txid();
        self.store().write_marker(
            class,
            &InstallMarker {
                target: target.clone(),
                txid: txid.clone(),
                pid: std::process::id(),
                started_at_unix: current_unix_timestamp(),
            },
        )?;

        let staging = self.layout.store_path(class, target, &txid);
        let prepared = remove_path_if_exists(&staging)
            .map_err(anyhow::Error::from)
            .and_then(|_| fs::create_dir_all(&staging).map_err(anyhow::Error::from))
            .with_context(|| format!("failed to prepare staging dir {}", staging.display()));
        if let Err(err) = prepared {
            let _ = self.store().clear_marker(class);
            return Err(err);
        }

        debug!(class = %class, target = %target, txid = %txid, "install session started");
        Ok(InstallSession {
            class,
            target: target.clone(),
            txid,
            staging,
        })
    }

    pub fn stage_archive(
        &self,
        session: &InstallSession,
        archive_path: &Path,
        release: &Release,
    ) -> Result<StagedContent> {
        if release.version != session.target {
            return Err(anyhow!(
                "release {} does not match session target {}",
                release.version,
                session.target
            ));
        }

        remove_path_if_exists(&session.staging)
            .and_then(|_| fs::create_dir_all(&session.staging))
            .with_context(|| format!("failed to reset {}", session.staging.display()))?;
        let entries = extract_archive(
            archive_path,
            release.archive_type,
            &session.staging,
            release.strip_components,
        )?;

        let content_sha256 = content_digest(&session.staging)?;
        if let Some(expected) = &release.content_sha256 {
            if !digests_match(&content_sha256, expected) {
                return Err(UpdateError::ContentMismatch {
                    class: session.class,
                    expected: expected.clone(),
                    actual: content_sha256,
                }
                .into());
            }
        }

        debug!(class = %session.class, entries, "staged archive contents");
        Ok(StagedContent {
            class: session.class,
            version: release.version.clone(),
            dir: session.staging.clone(),
            archive_sha256: release.sha256.clone(),
            content_sha256,
            source: InstallSource::Fetch,
        })
    }

    /// Publishes staged content with one atomic rename, confirms it, records
    /// it as installed and clears the marker. On failure the public path is
    /// rolled back to the recorded install.
    pub fn install(
        &self,
        session: &InstallSession,
        staged: StagedContent,
    ) -> Result<InstalledArtifact> {
        if staged.dir != session.staging || staged.class != session.class {
            return Err(anyhow!(
                "staged content {} does not belong to this install session",
                staged.dir.display()
            ));
        }

        let class = session.class;
        match self.publish_and_record(session, staged) {
            Ok(installed) => {
                info!(
                    class = %class,
                    version = %installed.version,
                    source = installed.source.as_str(),
                    path = %installed.install_path.display(),
                    "installed artifact"
                );
                Ok(installed)
            }
            Err(err) => {
                warn!(class = %class, txid = %session.txid, "install was not confirmed; restoring the previous install");
                let restored = self.store().load(class).and_then(|record| self.recover(&record));
                if let Err(restore_err) = restored {
                    warn!(
                        class = %class,
                        error = %format!("{restore_err:#}"),
                        "failed to restore the previous install"
                    );
                }
                Err(err)
            }
        }
    }

    fn publish_and_record(
        &self,
        session: &InstallSession,
        staged: StagedContent,
    ) -> Result<InstalledArtifact> {
        let class = session.class;
        let tree = self.publish(class, session)?;
        let install_path = self.layout.install_path(class);

        let published = content_digest(&install_path)?;
        if !digests_match(&published, &staged.content_sha256) {
            return Err(UpdateError::ContentMismatch {
                class,
                expected: staged.content_sha256,
                actual: published,
            }
            .into());
        }

        let installed = InstalledArtifact {
            class,
            version: staged.version,
            archive_sha256: staged.archive_sha256,
            content_sha256: staged.content_sha256,
            install_path,
            store_path: tree.clone(),
            installed_at_unix: current_unix_timestamp(),
            source: staged.source,
        };
        self.store().write_installed(&installed)?;
        self.sweep_store(class, Some(tree.as_path()));
        self.store().clear_marker(class)?;
        Ok(installed)
    }

    pub fn abort(&self, session: InstallSession) -> Result<()> {
        if let Err(err) = remove_path_if_exists(&session.staging) {
            warn!(path = %session.staging.display(), error = %err, "failed to remove staging dir");
        }
        self.store().clear_marker(session.class)?;
        debug!(class = %session.class, txid = %session.txid, "install session aborted");
        Ok(())
    }

    #[cfg(unix)]
    fn publish(&self, class: ArtifactClass, session: &InstallSession) -> Result<PathBuf> {
        self.point_public_path_at(class, &session.staging)?;
        Ok(session.staging.clone())
    }

    #[cfg(not(unix))]
    fn publish(&self, class: ArtifactClass, session: &InstallSession) -> Result<PathBuf> {
        let public = self.layout.install_path(class);
        if public.exists() {
            let aside = self.superseded_path(class, &session.txid);
            fs::rename(&public, &aside)
                .with_context(|| format!("failed to move aside {}", public.display()))?;
        }
        fs::rename(&session.staging, &public).with_context(|| {
            format!(
                "failed to publish {} to {}",
                session.staging.display(),
                public.display()
            )
        })?;
        fsync_dir(&self.layout.artifacts_dir())?;
        Ok(public)
    }

    #[cfg(not(unix))]
    fn superseded_path(&self, class: ArtifactClass, txid: &str) -> PathBuf {
        self.layout.store_dir().join(format!(
            "{}superseded-{txid}",
            self.layout.store_prefix(class)
        ))
    }

    #[cfg(unix)]
    fn restore_public_path(
        &self,
        class: ArtifactClass,
        recorded: Option<&InstalledArtifact>,
    ) -> Result<()> {
        match recorded {
            Some(installed) => self.point_public_path_at(class, &installed.store_path),
            None => self.unpublish(class),
        }
    }

    // The public path is a real directory here. A tree there that does not
    // match the record is an unconfirmed publish; the moved-aside tree goes back.
    #[cfg(not(unix))]
    fn restore_public_path(
        &self,
        class: ArtifactClass,
        recorded: Option<&InstalledArtifact>,
    ) -> Result<()> {
        let public = self.layout.install_path(class);
        let confirmed = recorded.is_some_and(|installed| {
            public.is_dir()
                && content_digest(&public)
                    .is_ok_and(|actual| digests_match(&actual, &installed.content_sha256))
        });
        if confirmed {
            return Ok(());
        }

        let aside = self.find_superseded(class)?;
        if aside.is_none() && recorded.is_some() {
            warn!(
                class = %class,
                path = %public.display(),
                "install tree does not match its record and nothing was moved aside"
            );
            return Ok(());
        }
        if public.exists() {
            warn!(class = %class, path = %public.display(), "removing unconfirmed install tree");
            remove_path_if_exists(&public)
                .with_context(|| format!("failed to remove {}", public.display()))?;
        }
        if let Some(aside) = aside {
            fs::rename(&aside, &public).with_context(|| {
                format!("failed to restore {} to {}", aside.display(), public.display())
            })?;
            warn!(class = %class, path = %public.display(), "restored the previous install tree");
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn find_superseded(&self, class: ArtifactClass) -> Result<Option<PathBuf>> {
        let store_dir = self.layout.store_dir();
        let marker = format!("{}superseded-", self.layout.store_prefix(class));
        let entries = match fs::read_dir(&store_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", store_dir.display()));
            }
        };
        let mut found: Vec<PathBuf> = entries
            .flatten()
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(&marker))
            .map(|entry| entry.path())
            .collect();
        found.sort();
        Ok(found.pop())
    }

    #[cfg(unix)]
    fn point_public_path_at(&self, class: ArtifactClass, tree: &Path) -> Result<()> {
        let artifacts_dir = self.layout.artifacts_dir();
        let public = self.layout.install_path(class);
        let target = tree
            .strip_prefix(&artifacts_dir)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| tree.to_path_buf());

        if fs::read_link(&public).ok().as_deref() == Some(target.as_path()) {
            return Ok(());
        }

        if let Ok(metadata) = fs::symlink_metadata(&public) {
            if metadata.is_dir() {
                let aside = self.layout.store_dir().join(format!(
                    "{}legacy-{}",
                    self.layout.store_prefix(class),
                    new_txid()
                ));
                fs::rename(&public, &aside)
                    .with_context(|| format!("failed to move aside {}", public.display()))?;
            }
        }

        let tmp_link = artifacts_dir.join(format!(".{}.{}.link", class.as_str(), new_txid()));
        remove_path_if_exists(&tmp_link)
            .with_context(|| format!("failed to clear {}", tmp_link.display()))?;
        std::os::unix::fs::symlink(&target, &tmp_link)
            .with_context(|| format!("failed to create {}", tmp_link.display()))?;
        if let Err(err) = fs::rename(&tmp_link, &public) {
            let _ = fs::remove_file(&tmp_link);
            return Err(err).with_context(|| format!("failed to publish {}", public.display()));
        }
        fsync_dir(&artifacts_dir)
    }

    #[cfg(unix)]
    fn unpublish(&self, class: ArtifactClass) -> Result<()> {
        let public = self.layout.install_path(class);
        if let Ok(metadata) = fs::symlink_metadata(&public) {
            if metadata.file_type().is_symlink() {
                fs::remove_file(&public)
                    .with_context(|| format!("failed to remove {}", public.display()))?;
                fsync_dir(&self.layout.artifacts_dir())?;
            }
        }
        Ok(())
    }

    fn sweep_store(&self, class: ArtifactClass, keep: Option<&Path>) {
        let store_dir = self.layout.store_dir();
        let Ok(entries) = fs::read_dir(&store_dir) else {
            return;
        };
        let prefix = self.layout.store_prefix(class);
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(&prefix) || Some(path.as_path()) == keep {
                continue;
            }
            match remove_path_if_exists(&path) {
                Ok(()) => debug!(path = %path.display(), "removed superseded tree"),
                Err(err) => warn!(path = %path.display(), error = %err, "failed to remove superseded tree"),
            }
        }
    }
}
