mod artifact;
mod fs_utils;
mod layout;
mod lock;
mod publish;
mod state;

pub use artifact::extract_archive;
pub use fs_utils::{
    copy_dir_recursive, current_unix_timestamp, ensure_available_space, fsync_dir,
    remove_path_if_exists, write_atomic,
};
pub use layout::{
    default_cache_root, default_data_root, partial_path_for, InstallLayout, PARTIAL_SUFFIX,
};
pub use lock::ArtifactLock;
pub use publish::{new_txid, AtomicInstaller, InstallSession, StagedContent};
pub use state::{
    InstallMarker, InstallRecord, InstallSource, InstallState, InstallStateStore,
    InstalledArtifact,
};
