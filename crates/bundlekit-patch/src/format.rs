use std::io::{Read, Write};

use anyhow::{anyhow, Context, Result};
use bundlekit_core::ArtifactVersion;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

pub const PATCH_MAGIC: &[u8; 8] = b"BKDELTA1";

const MAX_HEADER_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSignature {
    pub public_key: String,
    pub signature: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchHeader {
    pub signature: Option<PatchSignature>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Dir,
    File,
    Link,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchManifestEntry {
    pub name: String,
    pub kind: EntryKind,
    #[serde(default)]
    pub mode: u32,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AddedEntry {
    Dir { name: String, mode: u32 },
    File { name: String, mode: u32, data: String },
    Link { name: String, target: String },
}

impl AddedEntry {
    pub fn name(&self) -> &str {
        match self {
            Self::Dir { name, .. } | Self::File { name, .. } | Self::Link { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum DeltaOp {
    Copy { offset: u64, len: u64 },
    Insert { data: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatedFile {
    pub name: String,
    pub mode: u32,
    pub ops: Vec<DeltaOp>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchContents {
    pub source: ArtifactVersion,
    pub target: ArtifactVersion,
    pub manifest: Vec<PatchManifestEntry>,
    #[serde(default)]
    pub add: Vec<AddedEntry>,
    #[serde(default)]
    pub update: Vec<UpdatedFile>,
    #[serde(default)]
    pub delete: Vec<String>,
}

/// A decoded patch file. `contents` stays compressed until the signature is checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchBlob {
    pub header: PatchHeader,
    pub contents: Vec<u8>,
}

impl PatchBlob {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let rest = bytes
            .strip_prefix(PATCH_MAGIC.as_slice())
            .ok_or_else(|| anyhow!("not a bundlekit patch (bad magic)"))?;
        if rest.len() < 4 {
            return Err(anyhow!("patch is truncated before the header length"));
        }
        let (len_bytes, rest) = rest.split_at(4);
        let header_len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]])
            as usize;
        if header_len > MAX_HEADER_LEN {
            return Err(anyhow!("patch header is too large: {header_len} bytes"));
        }
        if rest.len() < header_len {
            return Err(anyhow!("patch is truncated inside the header"));
        }
        let (header_bytes, contents) = rest.split_at(header_len);
        let header: PatchHeader =
            serde_json::from_slice(header_bytes).context("failed to parse patch header")?;
        if contents.is_empty() {
            return Err(anyhow!("patch has no contents"));
        }

        Ok(Self {
            header,
            contents: contents.to_vec(),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let header = serde_json::to_vec(&self.header).context("failed to encode patch header")?;
        let header_len = u32::try_from(header.len()).context("patch header is too large")?;

        let mut out = Vec::with_capacity(PATCH_MAGIC.len() + 4 + header.len() + self.contents.len());
        out.extend_from_slice(PATCH_MAGIC);
        out.extend_from_slice(&header_len.to_le_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.contents);
        Ok(out)
    }

    pub fn signature(&self) -> Option<(&str, &str)> {
        self.header
            .signature
            .as_ref()
            .map(|signature| (signature.public_key.as_str(), signature.signature.as_str()))
    }

    pub fn decompress(&self) -> Result<PatchContents> {
        let mut json = Vec::new();
        GzDecoder::new(self.contents.as_slice())
            .read_to_end(&mut json)
            .context("failed to decompress patch contents")?;
        serde_json::from_slice(&json).context("failed to parse patch contents")
    }
}

pub fn compress_contents(contents: &PatchContents) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(contents).context("failed to encode patch contents")?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .context("failed to compress patch contents")?;
    encoder.finish().context("failed to compress patch contents")
}
