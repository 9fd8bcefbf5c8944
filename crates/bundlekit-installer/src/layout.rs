use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use bundlekit_core::{ArchiveType, ArtifactClass, ArtifactIdentity, ArtifactVersion, UpdateConfig};

pub const PARTIAL_SUFFIX: &str = ".part";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    data_root: PathBuf,
    cache_root: PathBuf,
}

impl InstallLayout {
    pub fn new(data_root: impl Into<PathBuf>, cache_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            cache_root: cache_root.into(),
        }
    }

    pub fn from_config<F>(config: &UpdateConfig, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_root = match &config.data_root {
            Some(root) => root.clone(),
            None => default_data_root(&lookup)?,
        };
        let cache_root = match &config.cache_root {
            Some(root) => root.clone(),
            None => default_cache_root(&lookup)?,
        };
        Ok(Self::new(data_root, cache_root))
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.data_root.join("artifacts")
    }

    pub fn store_dir(&self) -> PathBuf {
        self.artifacts_dir().join(".store")
    }

    pub fn install_path(&self, class: ArtifactClass) -> PathBuf {
        self.artifacts_dir().join(class.as_str())
    }

    pub fn store_path(&self, class: ArtifactClass, version: &ArtifactVersion, txid: &str) -> PathBuf {
        self.store_dir()
            .join(format!("{}-{}-{}", class.as_str(), version, txid))
    }

    pub fn store_prefix(&self, class: ArtifactClass) -> String {
        format!("{}-", class.as_str())
    }

    pub fn state_dir(&self) -> PathBuf {
        self.data_root.join("state")
    }

    pub fn record_path(&self, class: ArtifactClass) -> PathBuf {
        self.state_dir().join(format!("{}.record", class.as_str()))
    }

    pub fn marker_path(&self, class: ArtifactClass) -> PathBuf {
        self.state_dir().join(format!("{}.installing", class.as_str()))
    }

    pub fn manifest_cache_path(&self) -> PathBuf {
        self.state_dir().join("manifest-cache.json")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.data_root.join("locks")
    }

    pub fn lock_path(&self, class: ArtifactClass) -> PathBuf {
        self.locks_dir().join(format!("{}.lock", class.as_str()))
    }

    pub fn downloads_dir(&self, class: ArtifactClass) -> PathBuf {
        self.cache_root.join("downloads").join(class.as_str())
    }

    pub fn download_path(
        &self,
        class: ArtifactClass,
        version: &ArtifactVersion,
        archive_type: ArchiveType,
    ) -> PathBuf {
        self.downloads_dir(class)
            .join(format!("{}.{}", version, archive_type.cache_extension()))
    }

    pub fn patches_dir(&self, class: ArtifactClass) -> PathBuf {
        self.cache_root.join("patches").join(class.as_str())
    }

    pub fn patch_path(
        &self,
        class: ArtifactClass,
        base: &ArtifactVersion,
        target: &ArtifactVersion,
    ) -> PathBuf {
        self.patches_dir(class)
            .join(format!("{base}-to-{target}.bkpatch"))
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [
            self.artifacts_dir(),
            self.store_dir(),
            self.state_dir(),
            self.locks_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

pub fn partial_path_for(final_path: &Path, identity: &ArtifactIdentity) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    final_path.with_file_name(format!("{name}.{}{PARTIAL_SUFFIX}", identity.tag()))
}

pub fn default_data_root<F>(lookup: F) -> Result<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    xdg_root(&lookup, "XDG_DATA_HOME", &[".local", "share"])
}

pub fn default_cache_root<F>(lookup: F) -> Result<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    xdg_root(&lookup, "XDG_CACHE_HOME", &[".cache"])
}

fn xdg_root<F>(lookup: &F, xdg_var: &str, home_suffix: &[&str]) -> Result<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(xdg) = lookup(xdg_var).filter(|value| !value.trim().is_empty()) {
        return Ok(PathBuf::from(xdg).join("bundlekit"));
    }
    if cfg!(windows) {
        if let Some(app_data) = lookup("LOCALAPPDATA").filter(|value| !value.trim().is_empty()) {
            return Ok(PathBuf::from(app_data).join("bundlekit"));
        }
    }
    let home = lookup("HOME")
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| anyhow!("HOME is not set; cannot resolve {xdg_var} default"))?;
    let mut root = PathBuf::from(home);
    for part in home_suffix {
        root.push(part);
    }
    Ok(root.join("bundlekit"))
}
