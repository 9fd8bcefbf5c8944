use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use bundlekit_core::{PatchDescriptor, Release};
use bundlekit_fetch::{FetchClient, FetchRequest};
use bundlekit_installer::{
    copy_dir_recursive, ensure_available_space, remove_path_if_exists, InstallLayout,
    InstallSession, InstallSource, InstalledArtifact, StagedContent,
};
use bundlekit_security::{
    check_signature, content_digest, digest_entries, digests_match, scan_tree, TreeEntry,
    TreeEntryKind,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::delta::apply_delta;
use crate::format::{AddedEntry, EntryKind, PatchBlob, PatchContents, PatchManifestEntry};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchFailure {
    #[error("installed base does not match its record (expected {expected}, got {actual})")]
    BaseMismatch { expected: String, actual: String },
    #[error("patch does not apply here: {0}")]
    NotApplicable(String),
    #[error("patch download failed: {0}")]
    Download(String),
    #[error("patch blob is corrupt: {0}")]
    Corrupt(String),
    #[error("patch signature rejected: {0}")]
    Signature(String),
    #[error("not enough space to stage the patch: {0}")]
    InsufficientSpace(String),
    #[error("patch could not be applied: {0}")]
    Apply(String),
    #[error("patched output does not match the release (expected {expected}, got {actual})")]
    OutputMismatch { expected: String, actual: String },
}

#[derive(Debug)]
pub enum PatchOutcome {
    Patched(StagedContent),
    FullFetch(PatchFailure),
}

pub struct DeltaPatcher<'a> {
    layout: &'a InstallLayout,
    fetch: &'a FetchClient,
    trusted_keys: &'a [String],
}

impl<'a> DeltaPatcher<'a> {
    pub fn new(layout: &'a InstallLayout, fetch: &'a FetchClient, trusted_keys: &'a [String]) -> Self {
        Self {
            layout,
            fetch,
            trusted_keys,
        }
    }

    pub fn apply(
        &self,
        session: &InstallSession,
        base: &InstalledArtifact,
        patch: &PatchDescriptor,
        release: &Release,
    ) -> PatchOutcome {
        match self.try_apply(session, base, patch, release) {
            Ok(staged) => {
                info!(
                    class = %session.class,
                    base = %patch.base,
                    target = %patch.target,
                    "patched artifact in staging"
                );
                PatchOutcome::Patched(staged)
            }
            Err(failure) => {
                warn!(
                    class = %session.class,
                    base = %patch.base,
                    target = %patch.target,
                    reason = %failure,
                    "patch failed; falling back to a full download"
                );
                if let Err(err) = reset_dir(session.staging_dir()) {
                    warn!(error = %format!("{err:#}"), "failed to reset staging after patch failure");
                }
                PatchOutcome::FullFetch(failure)
            }
        }
    }

    fn try_apply(
        &self,
        session: &InstallSession,
        base: &InstalledArtifact,
        patch: &PatchDescriptor,
        release: &Release,
    ) -> Result<StagedContent, PatchFailure> {
        if patch.base != base.version || patch.target != release.version {
            return Err(PatchFailure::NotApplicable(format!(
                "patch {} -> {} cannot turn {} into {}",
                patch.base, patch.target, base.version, release.version
            )));
        }
        let Some(expected_output) = release.content_sha256.as_deref() else {
            return Err(PatchFailure::NotApplicable(
                "release declares no content digest to verify against".to_string(),
            ));
        };

        let actual_base = content_digest(&base.store_path).map_err(apply_failure)?;
        if !digests_match(&actual_base, &base.content_sha256) {
            return Err(PatchFailure::BaseMismatch {
                expected: base.content_sha256.clone(),
                actual: actual_base,
            });
        }

        let blob_path = self.layout.patch_path(session.class, &patch.base, &patch.target);
        let fetched = self
            .fetch
            .fetch_verified(&FetchRequest {
                url: patch.url.clone(),
                final_path: blob_path.clone(),
                identity: patch.identity(),
                expected_size: patch.size,
                label: format!("{} patch {} -> {}", session.class, patch.base, patch.target),
            })
            .map_err(|err| PatchFailure::Download(format!("{err:#}")))?;

        let contents = match self.read_blob(&fetched.path, patch) {
            Ok(contents) => contents,
            Err(failure) => {
                let _ = remove_path_if_exists(&fetched.path);
                return Err(failure);
            }
        };

        let staging = session.staging_dir();
        let needed: u64 = contents.manifest.iter().map(|entry| entry.size).sum();
        ensure_available_space(staging, needed)
            .map_err(|err| PatchFailure::InsufficientSpace(format!("{err:#}")))?;

        reset_dir(staging).map_err(apply_failure)?;
        copy_dir_recursive(&base.store_path, staging).map_err(apply_failure)?;
        apply_contents(staging, &contents).map_err(apply_failure)?;

        let entries = scan_tree(staging).map_err(apply_failure)?;
        verify_manifest(&entries, &contents.manifest)?;
        let produced = digest_entries(&entries);
        if !digests_match(&produced, expected_output) {
            return Err(PatchFailure::OutputMismatch {
                expected: expected_output.to_string(),
                actual: produced,
            });
        }

        Ok(StagedContent {
            class: session.class,
            version: release.version.clone(),
            dir: staging.to_path_buf(),
            archive_sha256: release.sha256.clone(),
            content_sha256: produced,
            source: InstallSource::Patch,
        })
    }

    fn read_blob(&self, path: &Path, patch: &PatchDescriptor) -> Result<PatchContents, PatchFailure> {
        let bytes = fs::read(path)
            .map_err(|err| PatchFailure::Corrupt(format!("failed to read {}: {err}", path.display())))?;
        let blob = PatchBlob::decode(&bytes).map_err(|err| PatchFailure::Corrupt(format!("{err:#}")))?;
        check_signature(&blob.contents, blob.signature(), self.trusted_keys)
            .map_err(|err| PatchFailure::Signature(format!("{err:#}")))?;
        let contents = blob
            .decompress()
            .map_err(|err| PatchFailure::Corrupt(format!("{err:#}")))?;

        if contents.source != patch.base || contents.target != patch.target {
            return Err(PatchFailure::NotApplicable(format!(
                "blob describes {} -> {}, manifest expects {} -> {}",
                contents.source, contents.target, patch.base, patch.target
            )));
        }
        debug!(
            add = contents.add.len(),
            update = contents.update.len(),
            delete = contents.delete.len(),
            "decoded patch"
        );
        Ok(contents)
    }
}

fn apply_failure(err: anyhow::Error) -> PatchFailure {
    PatchFailure::Apply(format!("{err:#}"))
}

fn reset_dir(dir: &Path) -> Result<()> {
    remove_path_if_exists(dir)
        .and_then(|_| fs::create_dir_all(dir))
        .with_context(|| format!("failed to reset {}", dir.display()))
}

fn apply_contents(root: &Path, contents: &PatchContents) -> Result<()> {
    for name in &contents.delete {
        let path = entry_path(root, name)?;
        remove_path_if_exists(&path).with_context(|| format!("failed to delete {name}"))?;
    }

    for entry in &contents.add {
        let path = entry_path(root, entry.name())?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        match entry {
            AddedEntry::Dir { mode, .. } => {
                fs::create_dir_all(&path)
                    .with_context(|| format!("failed to create {}", path.display()))?;
                set_mode(&path, *mode)?;
            }
            AddedEntry::File { name, mode, data } => {
                let bytes = hex::decode(data)
                    .with_context(|| format!("added file {name} carries invalid hex data"))?;
                remove_path_if_exists(&path)
                    .with_context(|| format!("failed to replace {}", path.display()))?;
                fs::write(&path, bytes)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                set_mode(&path, *mode)?;
            }
            AddedEntry::Link { target, .. } => {
                remove_path_if_exists(&path)
                    .with_context(|| format!("failed to replace {}", path.display()))?;
                create_symlink(target, &path)?;
            }
        }
    }

    for file in &contents.update {
        let path = entry_path(root, &file.name)?;
        let scratch = path.with_file_name(format!(
            ".{}.bkdelta",
            path.file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default()
        ));
        apply_delta(&path, &file.ops, &scratch)?;
        fs::rename(&scratch, &path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        set_mode(&path, file.mode)?;
    }
    Ok(())
}

fn verify_manifest(entries: &[TreeEntry], expected: &[PatchManifestEntry]) -> Result<(), PatchFailure> {
    let mismatch = |message: String| PatchFailure::Apply(message);
    let produced: BTreeMap<&str, &TreeEntry> =
        entries.iter().map(|entry| (entry.path.as_str(), entry)).collect();

    if produced.len() != expected.len() {
        return Err(mismatch(format!(
            "patched tree has {} entries, patch expects {}",
            produced.len(),
            expected.len()
        )));
    }

    for item in expected {
        let Some(entry) = produced.get(item.name.as_str()) else {
            return Err(mismatch(format!("patched tree is missing {}", item.name)));
        };
        let kind = match entry.kind {
            TreeEntryKind::Dir => EntryKind::Dir,
            TreeEntryKind::File => EntryKind::File,
            TreeEntryKind::Link => EntryKind::Link,
        };
        if kind != item.kind {
            return Err(mismatch(format!("{} has the wrong kind", item.name)));
        }
        if kind != EntryKind::File {
            continue;
        }
        if entry.size != item.size {
            return Err(mismatch(format!(
                "{} is {} bytes, expected {}",
                item.name, entry.size, item.size
            )));
        }
        if cfg!(unix) && item.mode != 0 && entry.mode != item.mode {
            return Err(mismatch(format!(
                "{} has mode {:o}, expected {:o}",
                item.name, entry.mode, item.mode
            )));
        }
        let digest_ok = match (&entry.sha256, &item.sha256) {
            (Some(actual), Some(wanted)) => digests_match(actual, wanted),
            (_, None) => true,
            (None, Some(_)) => false,
        };
        if !digest_ok {
            return Err(mismatch(format!("{} has the wrong sha256", item.name)));
        }
    }
    Ok(())
}

fn entry_path(root: &Path, name: &str) -> Result<PathBuf> {
    let rel = Path::new(name);
    let mut clean = PathBuf::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return Err(anyhow!("patch entry escapes the artifact root: {name}")),
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(anyhow!("patch entry has an empty name"));
    }
    Ok(root.join(clean))
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if mode == 0 {
        return Ok(());
    }
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
        .with_context(|| format!("failed to set mode on {}", path.display()))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn create_symlink(target: &str, path: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, path)
        .with_context(|| format!("failed to create symlink {} -> {target}", path.display()))
}

#[cfg(not(unix))]
fn create_symlink(target: &str, path: &Path) -> Result<()> {
    Err(anyhow!(
        "symlinks are not supported here: {} -> {target}",
        path.display()
    ))
}
