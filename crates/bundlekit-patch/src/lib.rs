mod apply;
mod delta;
mod format;

pub use apply::{DeltaPatcher, PatchFailure, PatchOutcome};
pub use delta::apply_delta;
pub use format::{
    compress_contents, AddedEntry, DeltaOp, EntryKind, PatchBlob, PatchContents, PatchHeader,
    PatchManifestEntry, PatchSignature, UpdatedFile, PATCH_MAGIC,
};
