use bundlekit_core::{
    ArtifactClass, ManifestEntry, PatchDescriptor, Release, UpdateError, VersionRequirement,
};
use bundlekit_installer::{InstallRecord, InstalledArtifact};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanOptions {
    pub allow_downgrade: bool,
    pub patches_enabled: bool,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            allow_downgrade: false,
            patches_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdatePlan {
    UpToDate(InstalledArtifact),
    NeedsFetch {
        release: Release,
    },
    NeedsPatch {
        base: InstalledArtifact,
        release: Release,
        patch: PatchDescriptor,
    },
}

impl UpdatePlan {
    pub fn target(&self) -> Option<&Release> {
        match self {
            Self::UpToDate(_) => None,
            Self::NeedsFetch { release } | Self::NeedsPatch { release, .. } => Some(release),
        }
    }
}

/// Decides what, if anything, must change for `requirement` to be met.
///
/// An install newer than a floating requirement's target is left alone unless
/// `allow_downgrade` is set. A patch is only chosen when one exists for the
/// exact installed base and the release declares a content digest to verify
/// the patched tree against.
pub fn plan_update(
    class: ArtifactClass,
    requirement: &VersionRequirement,
    record: &InstallRecord,
    entry: &ManifestEntry,
    options: PlanOptions,
) -> Result<UpdatePlan, UpdateError> {
    let release = match requirement {
        VersionRequirement::Latest => &entry.current,
        VersionRequirement::Exact(version) => {
            entry
                .release(version)
                .ok_or_else(|| UpdateError::UnknownVersion {
                    class,
                    version: version.clone(),
                })?
        }
    };

    let Some(installed) = record.usable() else {
        return Ok(UpdatePlan::NeedsFetch {
            release: release.clone(),
        });
    };

    if installed.version == release.version {
        return Ok(UpdatePlan::UpToDate(installed.clone()));
    }
    if matches!(requirement, VersionRequirement::Latest)
        && !options.allow_downgrade
        && installed.version.is_newer_than(&release.version)
    {
        return Ok(UpdatePlan::UpToDate(installed.clone()));
    }

    if options.patches_enabled && release.content_sha256.is_some() {
        if let Some(patch) = entry.patch_for(&installed.version, &release.version) {
            return Ok(UpdatePlan::NeedsPatch {
                base: installed.clone(),
                release: release.clone(),
                patch: patch.clone(),
            });
        }
    }

    Ok(UpdatePlan::NeedsFetch {
        release: release.clone(),
    })
}
