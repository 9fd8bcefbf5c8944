use std::collections::{BTreeMap, HashSet};

use anyhow::{anyhow, Context};
use serde::Deserialize;

use crate::archive::ArchiveType;
use crate::class::ArtifactClass;
use crate::version::{ArtifactIdentity, ArtifactVersion};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Manifest {
    pub artifacts: BTreeMap<ArtifactClass, ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub current: Release,
    pub history: Vec<Release>,
    pub patches: Vec<PatchDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub version: ArtifactVersion,
    pub url: String,
    pub sha256: String,
    pub size: Option<u64>,
    pub content_sha256: Option<String>,
    pub strip_components: u32,
    pub archive_type: ArchiveType,
}

impl Release {
    pub fn identity(&self) -> ArtifactIdentity {
        ArtifactIdentity::new(self.version.clone(), self.sha256.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchDescriptor {
    pub base: ArtifactVersion,
    pub target: ArtifactVersion,
    pub url: String,
    pub sha256: String,
    pub size: Option<u64>,
}

impl PatchDescriptor {
    pub fn identity(&self) -> ArtifactIdentity {
        ArtifactIdentity::new(self.target.clone(), self.sha256.clone())
    }
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    #[serde(default)]
    artifacts: BTreeMap<String, RawEntry>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(flatten)]
    current: RawRelease,
    #[serde(default)]
    history: Vec<RawRelease>,
    #[serde(default)]
    patches: Vec<RawPatch>,
}

#[derive(Debug, Deserialize)]
struct RawRelease {
    version: ArtifactVersion,
    url: String,
    sha256: String,
    size: Option<u64>,
    content_sha256: Option<String>,
    #[serde(default)]
    strip_components: u32,
    archive: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPatch {
    base: ArtifactVersion,
    target: Option<ArtifactVersion>,
    url: String,
    sha256: String,
    size: Option<u64>,
}

impl Manifest {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let file: ManifestFile = toml::from_str(input).context("failed to parse artifact manifest")?;

        let mut artifacts = BTreeMap::new();
        for (key, raw) in file.artifacts {
            let Some(class) = ArtifactClass::parse(&key) else {
                continue;
            };
            let entry = build_entry(raw).with_context(|| format!("invalid manifest entry '{key}'"))?;
            artifacts.insert(class, entry);
        }

        Ok(Self { artifacts })
    }

    pub fn entry(&self, class: ArtifactClass) -> Option<&ManifestEntry> {
        self.artifacts.get(&class)
    }
}

impl ManifestEntry {
    pub fn release(&self, version: &ArtifactVersion) -> Option<&Release> {
        if &self.current.version == version {
            return Some(&self.current);
        }
        self.history.iter().find(|release| &release.version == version)
    }

    pub fn patch_for(
        &self,
        base: &ArtifactVersion,
        target: &ArtifactVersion,
    ) -> Option<&PatchDescriptor> {
        self.patches
            .iter()
            .find(|patch| &patch.base == base && &patch.target == target)
    }
}

fn build_entry(raw: RawEntry) -> anyhow::Result<ManifestEntry> {
    let current = build_release(raw.current)?;

    let mut seen = HashSet::new();
    seen.insert(current.version.clone());
    let mut history = Vec::with_capacity(raw.history.len());
    for raw_release in raw.history {
        let release = build_release(raw_release)?;
        if !seen.insert(release.version.clone()) {
            return Err(anyhow!("duplicate release version '{}'", release.version));
        }
        history.push(release);
    }

    let mut patches = Vec::with_capacity(raw.patches.len());
    for raw_patch in raw.patches {
        let target = raw_patch
            .target
            .unwrap_or_else(|| current.version.clone());
        if raw_patch.base == target {
            return Err(anyhow!("patch base and target are both '{target}'"));
        }
        validate_url(&raw_patch.url)?;
        validate_sha256(&raw_patch.sha256)
            .with_context(|| format!("invalid sha256 for patch from '{}'", raw_patch.base))?;
        patches.push(PatchDescriptor {
            base: raw_patch.base,
            target,
            url: raw_patch.url,
            sha256: raw_patch.sha256,
            size: raw_patch.size,
        });
    }

    Ok(ManifestEntry {
        current,
        history,
        patches,
    })
}

fn build_release(raw: RawRelease) -> anyhow::Result<Release> {
    validate_url(&raw.url)?;
    validate_sha256(&raw.sha256)
        .with_context(|| format!("invalid sha256 for release '{}'", raw.version))?;
    if let Some(content) = &raw.content_sha256 {
        validate_sha256(content)
            .with_context(|| format!("invalid content_sha256 for release '{}'", raw.version))?;
    }

    let archive_type = match raw.archive.as_deref() {
        Some(value) => ArchiveType::parse(value)
            .ok_or_else(|| anyhow!("unsupported archive type '{value}'"))?,
        None => ArchiveType::infer_from_url(&raw.url)
            .ok_or_else(|| anyhow!("cannot infer archive type from url '{}'", raw.url))?,
    };

    Ok(Release {
        version: raw.version,
        url: raw.url,
        sha256: raw.sha256,
        size: raw.size,
        content_sha256: raw.content_sha256,
        strip_components: raw.strip_components,
        archive_type,
    })
}

fn validate_url(url: &str) -> anyhow::Result<()> {
    let lower = url.trim().to_ascii_lowercase();
    if !(lower.starts_with("https://") || lower.starts_with("http://")) {
        return Err(anyhow!("url scheme must be http or https: {url}"));
    }
    Ok(())
}

fn validate_sha256(value: &str) -> anyhow::Result<()> {
    if value.len() != 64
        || !value
            .chars()
            .all(|ch| ch.is_ascii_digit() || matches!(ch, 'a'..='f'))
    {
        return Err(anyhow!("expected 64 lowercase hex characters, got '{value}'"));
    }
    Ok(())
}
