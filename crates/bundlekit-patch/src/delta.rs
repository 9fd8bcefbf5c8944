use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};

use crate::format::DeltaOp;

pub fn apply_delta(base: &Path, ops: &[DeltaOp], output: &Path) -> Result<u64> {
    let mut base_file =
        File::open(base).with_context(|| format!("failed to open base file {}", base.display()))?;
    let base_len = base_file
        .metadata()
        .with_context(|| format!("failed to stat {}", base.display()))?
        .len();
    let out_file =
        File::create(output).with_context(|| format!("failed to create {}", output.display()))?;
    let mut writer = BufWriter::new(out_file);

    let mut written = 0_u64;
    for (index, op) in ops.iter().enumerate() {
        match op {
            DeltaOp::Copy { offset, len } => {
                let end = offset
                    .checked_add(*len)
                    .ok_or_else(|| anyhow!("delta op {index} overflows"))?;
                if end > base_len {
                    return Err(anyhow!(
                        "delta op {index} copies {offset}..{end} past the end of {} ({base_len} bytes)",
                        base.display()
                    ));
                }
                base_file
                    .seek(SeekFrom::Start(*offset))
                    .with_context(|| format!("failed to seek in {}", base.display()))?;
                let copied = io::copy(&mut (&mut base_file).take(*len), &mut writer)
                    .with_context(|| format!("failed to write {}", output.display()))?;
                if copied != *len {
                    return Err(anyhow!("delta op {index} copied {copied} of {len} bytes"));
                }
                written += copied;
            }
            DeltaOp::Insert { data } => {
                let bytes = hex::decode(data)
                    .with_context(|| format!("delta op {index} carries invalid hex data"))?;
                writer
                    .write_all(&bytes)
                    .with_context(|| format!("failed to write {}", output.display()))?;
                written += bytes.len() as u64;
            }
        }
    }

    let file = writer
        .into_inner()
        .map_err(|err| err.into_error())
        .with_context(|| format!("failed to flush {}", output.display()))?;
    file.sync_all()
        .with_context(|| format!("failed to sync {}", output.display()))?;
    Ok(written)
}
