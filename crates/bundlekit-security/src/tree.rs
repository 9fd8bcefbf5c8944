use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};

use crate::checksum::sha256_file_hex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeEntryKind {
    Dir,
    File,
    Link,
}

impl TreeEntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dir => "dir",
            Self::File => "file",
            Self::Link => "link",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub path: String,
    pub kind: TreeEntryKind,
    pub mode: u32,
    pub size: u64,
    pub sha256: Option<String>,
    pub link_target: Option<String>,
}

impl TreeEntry {
    pub fn is_executable(&self) -> bool {
        self.mode & 0o111 != 0
    }

    fn digest_line(&self) -> String {
        match self.kind {
            TreeEntryKind::Dir => format!("d {}", self.path),
            TreeEntryKind::File => format!(
                "f {} {} {}",
                if self.is_executable() { "x" } else { "-" },
                self.path,
                self.sha256.as_deref().unwrap_or_default()
            ),
            TreeEntryKind::Link => format!(
                "l {} {}",
                self.path,
                self.link_target.as_deref().unwrap_or_default()
            ),
        }
    }
}

pub fn scan_tree(root: &Path) -> Result<Vec<TreeEntry>> {
    let mut entries = Vec::new();
    scan_dir(root, root, &mut entries)?;
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

pub fn content_digest(root: &Path) -> Result<String> {
    Ok(digest_entries(&scan_tree(root)?))
}

pub fn digest_entries(entries: &[TreeEntry]) -> String {
    let mut lines: Vec<String> = entries.iter().map(TreeEntry::digest_line).collect();
    lines.sort();

    let mut hasher = Sha256::new();
    for line in lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

fn scan_dir(root: &Path, dir: &Path, entries: &mut Vec<TreeEntry>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
        let path = entry.path();
        let metadata = fs::symlink_metadata(&path)
            .with_context(|| format!("failed to stat {}", path.display()))?;
        let rel = relative_name(root, &path)?;
        let mode = permission_bits(&metadata);

        if metadata.file_type().is_symlink() {
            let target = fs::read_link(&path)
                .with_context(|| format!("failed to read symlink {}", path.display()))?;
            entries.push(TreeEntry {
                path: rel,
                kind: TreeEntryKind::Link,
                mode: 0,
                size: 0,
                sha256: None,
                link_target: Some(target.to_string_lossy().replace('\\', "/")),
            });
        } else if metadata.is_dir() {
            entries.push(TreeEntry {
                path: rel,
                kind: TreeEntryKind::Dir,
                mode,
                size: 0,
                sha256: None,
                link_target: None,
            });
            scan_dir(root, &path, entries)?;
        } else if metadata.is_file() {
            entries.push(TreeEntry {
                path: rel,
                kind: TreeEntryKind::File,
                mode,
                size: metadata.len(),
                sha256: Some(sha256_file_hex(&path)?),
                link_target: None,
            });
        } else {
            return Err(anyhow!(
                "unsupported file type in artifact tree: {}",
                path.display()
            ));
        }
    }
    Ok(())
}

fn relative_name(root: &Path, path: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(root)
        .with_context(|| format!("failed to relativize {}", path.display()))?;
    let parts: Vec<String> = rel
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

#[cfg(unix)]
fn permission_bits(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(_metadata: &fs::Metadata) -> u32 {
    0
}
