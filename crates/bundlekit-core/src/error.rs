use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::class::ArtifactClass;
use crate::version::ArtifactVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    AlreadyCurrent,
    UpdatedByFetch,
    UpdatedByPatch,
    FetchFailed,
    VerifyFailed,
    LockTimeout,
    ManifestUnavailable,
    DiskFull,
    InstallFailed,
}

impl OutcomeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AlreadyCurrent => "already-current",
            Self::UpdatedByFetch => "updated-by-fetch",
            Self::UpdatedByPatch => "updated-by-patch",
            Self::FetchFailed => "fetch-failed",
            Self::VerifyFailed => "verify-failed",
            Self::LockTimeout => "lock-timeout",
            Self::ManifestUnavailable => "manifest-unavailable",
            Self::DiskFull => "disk-full",
            Self::InstallFailed => "install-failed",
        }
    }

    pub fn is_success(self) -> bool {
        matches!(
            self,
            Self::AlreadyCurrent | Self::UpdatedByFetch | Self::UpdatedByPatch
        )
    }
}

#[derive(Debug, Clone, Error)]
pub enum UpdateError {
    #[error("could not reach the server at {url}: {message}")]
    Network { url: String, message: String },

    #[error("{url} returned the status {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("sha256 mismatch for {} (expected {expected}, got {actual})", path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("installed content of {class} does not match (expected {expected}, got {actual})")]
    ContentMismatch {
        class: ArtifactClass,
        expected: String,
        actual: String,
    },

    #[error("another instance is already updating {class}; gave up after {waited:?}")]
    LockTimeout {
        class: ArtifactClass,
        waited: Duration,
    },

    #[error("artifact manifest is unavailable: {reason}")]
    ManifestUnavailable { reason: String },

    #[error("{class} version {version} is not published in the manifest")]
    UnknownVersion {
        class: ArtifactClass,
        version: ArtifactVersion,
    },

    #[error("not enough disk space in {}: {detail}", path.display())]
    DiskSpace { path: PathBuf, detail: String },

    #[error("{message}")]
    Install { message: String },
}

impl UpdateError {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::Network { .. } | Self::HttpStatus { .. } => OutcomeKind::FetchFailed,
            Self::ChecksumMismatch { .. } | Self::ContentMismatch { .. } => {
                OutcomeKind::VerifyFailed
            }
            Self::LockTimeout { .. } => OutcomeKind::LockTimeout,
            Self::ManifestUnavailable { .. } | Self::UnknownVersion { .. } => {
                OutcomeKind::ManifestUnavailable
            }
            Self::DiskSpace { .. } => OutcomeKind::DiskFull,
            Self::Install { .. } => OutcomeKind::InstallFailed,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::HttpStatus { status, .. } => *status >= 500 || matches!(status, 408 | 429),
            _ => false,
        }
    }

    /// Maps an internal error chain onto the caller-facing taxonomy.
    pub fn classify(err: anyhow::Error) -> Self {
        if let Some(typed) = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<UpdateError>())
        {
            return typed.clone();
        }

        if let Some(io_err) = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<io::Error>())
            .filter(|io_err| is_out_of_space(io_err))
        {
            return Self::DiskSpace {
                path: PathBuf::new(),
                detail: io_err.to_string(),
            };
        }

        Self::Install {
            message: format!("{err:#}"),
        }
    }
}

pub fn is_out_of_space(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::StorageFull {
        return true;
    }
    #[cfg(unix)]
    {
        // ENOSPC
        err.raw_os_error() == Some(28)
    }
    #[cfg(not(unix))]
    {
        matches!(err.raw_os_error(), Some(112))
    }
}
