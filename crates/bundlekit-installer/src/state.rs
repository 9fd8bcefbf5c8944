use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use bundlekit_core::{ArtifactClass, ArtifactVersion};
use tracing::warn;

use crate::fs_utils::{fsync_dir, write_atomic};
use crate::layout::InstallLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallState {
    Absent,
    Installing,
    Installed,
}

impl InstallState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Installing => "installing",
            Self::Installed => "installed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallSource {
    Fetch,
    Patch,
}

impl InstallSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Patch => "patch",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "fetch" => Ok(Self::Fetch),
            "patch" => Ok(Self::Patch),
            _ => Err(anyhow!("invalid source: {value}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledArtifact {
    pub class: ArtifactClass,
    pub version: ArtifactVersion,
    pub archive_sha256: String,
    pub content_sha256: String,
    pub install_path: PathBuf,
    pub store_path: PathBuf,
    pub installed_at_unix: u64,
    pub source: InstallSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallMarker {
    pub target: ArtifactVersion,
    pub txid: String,
    pub pid: u32,
    pub started_at_unix: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRecord {
    pub class: ArtifactClass,
    pub state: InstallState,
    pub installed: Option<InstalledArtifact>,
    pub marker: Option<InstallMarker>,
}

impl InstallRecord {
    pub fn installed_version(&self) -> Option<&ArtifactVersion> {
        self.installed.as_ref().map(|installed| &installed.version)
    }

    pub fn usable(&self) -> Option<&InstalledArtifact> {
        match self.state {
            InstallState::Installed => self.installed.as_ref(),
            _ => None,
        }
    }

    pub fn last_confirmed(&self) -> Option<&InstalledArtifact> {
        self.installed.as_ref()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InstallStateStore<'a> {
    layout: &'a InstallLayout,
}

impl<'a> InstallStateStore<'a> {
    pub fn new(layout: &'a InstallLayout) -> Self {
        Self { layout }
    }

    pub fn load(&self, class: ArtifactClass) -> Result<InstallRecord> {
        let installed = self.read_installed(class)?;
        let marker_path = self.layout.marker_path(class);
        let marker_present = marker_path.exists();
        let marker = if marker_present {
            self.read_marker(class)?
        } else {
            None
        };

        let state = if marker_present {
            InstallState::Installing
        } else if installed.is_some() {
            InstallState::Installed
        } else {
            InstallState::Absent
        };

        Ok(InstallRecord {
            class,
            state,
            installed,
            marker,
        })
    }

    pub fn write_installed(&self, installed: &InstalledArtifact) -> Result<PathBuf> {
        let path = self.layout.record_path(installed.class);
        write_atomic(&path, serialize_installed(installed).as_bytes())
            .with_context(|| format!("failed to write install record: {}", path.display()))?;
        Ok(path)
    }

    pub fn write_marker(&self, class: ArtifactClass, marker: &InstallMarker) -> Result<PathBuf> {
        let path = self.layout.marker_path(class);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(anyhow!(
                    "in-progress marker already exists: {}",
                    path.display()
                ));
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to create marker: {}", path.display()));
            }
        };

        file.write_all(serialize_marker(marker).as_bytes())
            .and_then(|_| file.sync_all())
            .with_context(|| format!("failed to write marker: {}", path.display()))?;
        if let Some(parent) = path.parent() {
            fsync_dir(parent)?;
        }
        Ok(path)
    }

    pub fn clear_marker(&self, class: ArtifactClass) -> Result<()> {
        let path = self.layout.marker_path(class);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to remove marker: {}", path.display()));
            }
        }
        if let Some(parent) = path.parent() {
            fsync_dir(parent)?;
        }
        Ok(())
    }

    fn read_installed(&self, class: ArtifactClass) -> Result<Option<InstalledArtifact>> {
        let path = self.layout.record_path(class);
        let Some(raw) = read_optional(&path)? else {
            return Ok(None);
        };

        let installed = match parse_installed(&raw) {
            Ok(installed) if installed.class == class => installed,
            Ok(installed) => {
                warn!(
                    path = %path.display(),
                    found = %installed.class,
                    "install record names another class; ignoring it"
                );
                return Ok(None);
            }
            Err(err) => {
                warn!(path = %path.display(), error = %format!("{err:#}"), "install record is corrupt; ignoring it");
                return Ok(None);
            }
        };

        if !installed.store_path.is_dir() {
            warn!(
                class = %class,
                path = %installed.store_path.display(),
                "recorded install tree is missing"
            );
            return Ok(None);
        }
        Ok(Some(installed))
    }

    fn read_marker(&self, class: ArtifactClass) -> Result<Option<InstallMarker>> {
        let path = self.layout.marker_path(class);
        let Some(raw) = read_optional(&path)? else {
            return Ok(None);
        };
        match parse_marker(&raw) {
            Ok(marker) => Ok(Some(marker)),
            Err(err) => {
                warn!(path = %path.display(), error = %format!("{err:#}"), "in-progress marker is unreadable");
                Ok(None)
            }
        }
    }
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

fn serialize_installed(installed: &InstalledArtifact) -> String {
    let mut payload = String::new();
    payload.push_str(&format!("class={}\n", installed.class));
    payload.push_str(&format!("version={}\n", installed.version));
    payload.push_str(&format!("archive_sha256={}\n", installed.archive_sha256));
    payload.push_str(&format!("content_sha256={}\n", installed.content_sha256));
    payload.push_str(&format!(
        "install_path={}\n",
        installed.install_path.display()
    ));
    payload.push_str(&format!("store_path={}\n", installed.store_path.display()));
    payload.push_str(&format!(
        "installed_at_unix={}\n",
        installed.installed_at_unix
    ));
    payload.push_str(&format!("source={}\n", installed.source.as_str()));
    payload
}

pub(crate) fn parse_installed(raw: &str) -> Result<InstalledArtifact> {
    let mut class = None;
    let mut version = None;
    let mut archive_sha256 = None;
    let mut content_sha256 = None;
    let mut install_path = None;
    let mut store_path = None;
    let mut installed_at_unix = None;
    let mut source = None;

    for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let Some((k, v)) = line.split_once('=') else {
            return Err(anyhow!("malformed record line: {line}"));
        };
        match k {
            "class" => {
                class = Some(ArtifactClass::parse(v).ok_or_else(|| anyhow!("unknown class: {v}"))?)
            }
            "version" => version = Some(ArtifactVersion::new(v)?),
            "archive_sha256" => archive_sha256 = Some(v.to_string()),
            "content_sha256" => content_sha256 = Some(v.to_string()),
            "install_path" => install_path = Some(PathBuf::from(v)),
            "store_path" => store_path = Some(PathBuf::from(v)),
            "installed_at_unix" => {
                installed_at_unix = Some(v.parse().context("installed_at_unix must be u64")?)
            }
            "source" => source = Some(InstallSource::parse(v)?),
            _ => {}
        }
    }

    Ok(InstalledArtifact {
        class: class.context("missing class")?,
        version: version.context("missing version")?,
        archive_sha256: archive_sha256.context("missing archive_sha256")?,
        content_sha256: content_sha256.context("missing content_sha256")?,
        install_path: install_path.context("missing install_path")?,
        store_path: store_path.context("missing store_path")?,
        installed_at_unix: installed_at_unix.context("missing installed_at_unix")?,
        source: source.unwrap_or(InstallSource::Fetch),
    })
}

fn serialize_marker(marker: &InstallMarker) -> String {
    format!(
        "target={}\ntxid={}\npid={}\nstarted_at_unix={}\n",
        marker.target, marker.txid, marker.pid, marker.started_at_unix
    )
}

pub(crate) fn parse_marker(raw: &str) -> Result<InstallMarker> {
    let mut target = None;
    let mut txid = None;
    let mut pid = None;
    let mut started_at_unix = None;

    for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        match k {
            "target" => target = Some(ArtifactVersion::new(v)?),
            "txid" => txid = Some(v.to_string()),
            "pid" => pid = Some(v.parse().context("pid must be u32")?),
            "started_at_unix" => {
                started_at_unix = Some(v.parse().context("started_at_unix must be u64")?)
            }
            _ => {}
        }
    }

    Ok(InstallMarker {
        target: target.context("missing target")?,
        txid: txid.context("missing txid")?,
        pid: pid.unwrap_or(0),
        started_at_unix: started_at_unix.unwrap_or(0),
    })
}
