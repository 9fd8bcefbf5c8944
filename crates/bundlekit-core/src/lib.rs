mod archive;
mod class;
mod config;
mod error;
mod manifest;
mod version;

pub use archive::ArchiveType;
pub use class::ArtifactClass;
pub use config::{default_config_path, NetworkConfig, UpdateConfig, DEFAULT_MANIFEST_URL};
pub use error::{is_out_of_space, OutcomeKind, UpdateError};
pub use manifest::{Manifest, ManifestEntry, PatchDescriptor, Release};
pub use version::{ArtifactIdentity, ArtifactVersion, VersionRequirement};
