use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use bundlekit_core::ArchiveType;
use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tracing::debug;

pub fn extract_archive(
    archive_path: &Path,
    archive_type: ArchiveType,
    dst: &Path,
    strip_components: u32,
) -> Result<u64> {
    let file = File::open(archive_path)
        .with_context(|| format!("failed to open archive {}", archive_path.display()))?;
    let reader = BufReader::new(file);
    let result = match archive_type {
        ArchiveType::Tar => unpack_tar(reader, dst, strip_components as usize),
        ArchiveType::TarGz => unpack_tar(GzDecoder::new(reader), dst, strip_components as usize),
    };
    result.with_context(|| format!("failed to extract {}", archive_path.display()))
}

fn unpack_tar<R: Read>(reader: R, dst: &Path, strip_components: usize) -> Result<u64> {
    fs::create_dir_all(dst).with_context(|| format!("failed to create {}", dst.display()))?;
    let root = dst
        .canonicalize()
        .with_context(|| format!("failed to resolve {}", dst.display()))?;

    let mut archive = Archive::new(reader);
    archive.set_preserve_mtime(true);
    let mut extracted = 0_u64;
    let mut deferred_dirs = Vec::new();

    for entry in archive.entries().context("failed to read archive entries")? {
        let mut entry = entry.context("failed to read archive entry")?;
        let raw_path = entry.path().context("archive entry has an invalid path")?.into_owned();
        let Some(rel) = sanitized_rel(&raw_path, strip_components)? else {
            continue;
        };
        let out = root.join(&rel);

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&out)
                    .with_context(|| format!("failed to create {}", out.display()))?;
                ensure_inside(&root, &out)?;
                if let Ok(mode) = entry.header().mode() {
                    deferred_dirs.push((out, mode));
                }
            }
            EntryType::Regular | EntryType::Continuous | EntryType::Symlink => {
                prepare_parent(&root, &out)?;
                entry
                    .unpack(&out)
                    .with_context(|| format!("failed to unpack {}", raw_path.display()))?;
            }
            EntryType::Link => {
                let link_name = entry
                    .link_name()
                    .context("hard link entry has an invalid target")?
                    .ok_or_else(|| anyhow!("hard link {} has no target", raw_path.display()))?;
                let target_rel = sanitized_rel(&link_name, strip_components)?.ok_or_else(|| {
                    anyhow!(
                        "hard link {} points above the stripped root",
                        raw_path.display()
                    )
                })?;
                let target = root.join(target_rel);
                ensure_inside(&root, &target)?;
                prepare_parent(&root, &out)?;
                let _ = fs::remove_file(&out);
                fs::hard_link(&target, &out).with_context(|| {
                    format!(
                        "failed to link {} to {}",
                        out.display(),
                        target.display()
                    )
                })?;
            }
            other => {
                debug!(path = %raw_path.display(), entry_type = ?other, "skipping archive entry");
                continue;
            }
        }
        extracted += 1;
    }

    if extracted == 0 {
        return Err(anyhow!(
            "no entries extracted; strip_components={} may be too large",
            strip_components
        ));
    }

    apply_dir_modes(deferred_dirs)?;
    Ok(extracted)
}

fn prepare_parent(root: &Path, out: &Path) -> Result<()> {
    let parent = out
        .parent()
        .with_context(|| format!("{} has no parent", out.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    ensure_inside(root, parent)
}

/// `path` must resolve under `root` even after following symlinks.
fn ensure_inside(root: &Path, path: &Path) -> Result<()> {
    let resolved = path
        .canonicalize()
        .with_context(|| format!("failed to resolve {}", path.display()))?;
    if !resolved.starts_with(root) {
        return Err(anyhow!(
            "archive entry escapes the extraction root: {}",
            path.display()
        ));
    }
    Ok(())
}

#[cfg(unix)]
fn apply_dir_modes(dirs: Vec<(PathBuf, u32)>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    // Deepest first so read-only parents do not block their children.
    let mut dirs = dirs;
    dirs.sort_by(|a, b| b.0.components().count().cmp(&a.0.components().count()));
    for (dir, mode) in dirs {
        fs::set_permissions(&dir, fs::Permissions::from_mode(mode & 0o7777))
            .with_context(|| format!("failed to set mode on {}", dir.display()))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_dir_modes(_dirs: Vec<(PathBuf, u32)>) -> Result<()> {
    Ok(())
}

pub(crate) fn sanitized_rel(path: &Path, strip_components: usize) -> Result<Option<PathBuf>> {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(value) => components.push(value.to_os_string()),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(anyhow!(
                    "archive entry has an unsafe path: {}",
                    path.display()
                ));
            }
        }
    }

    if components.len() <= strip_components {
        return Ok(None);
    }

    let mut out = PathBuf::new();
    for component in components.into_iter().skip(strip_components) {
        out.push(component);
    }
    Ok(Some(out))
}
