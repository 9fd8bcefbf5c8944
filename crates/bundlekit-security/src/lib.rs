mod checksum;
mod ed25519;
mod tree;

pub use checksum::{digests_match, sha256_file_hex, sha256_hex, sha256_reader_hex};
pub use ed25519::{check_signature, verify_ed25519_signature_hex};
pub use tree::{content_digest, digest_entries, scan_tree, TreeEntry, TreeEntryKind};
