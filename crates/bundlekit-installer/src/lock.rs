use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bundlekit_core::{ArtifactClass, UpdateError};
use fs4::FileExt;
use tracing::{debug, info};

use crate::layout::InstallLayout;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct ArtifactLock {
    file: File,
    class: ArtifactClass,
    path: PathBuf,
}

impl ArtifactLock {
    pub fn try_acquire(layout: &InstallLayout, class: ArtifactClass) -> Result<Option<Self>> {
        let path = layout.lock_path(class);
        let file = open_lock_file(&path)?;
        if !try_lock(&file).with_context(|| format!("failed to lock {}", path.display()))? {
            return Ok(None);
        }
        Self::claimed(file, class, path).map(Some)
    }

    pub fn acquire(
        layout: &InstallLayout,
        class: ArtifactClass,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let path = layout.lock_path(class);
        let file = open_lock_file(&path)?;
        if try_lock(&file).with_context(|| format!("failed to lock {}", path.display()))? {
            return Self::claimed(file, class, path);
        }

        info!(class = %class, holder = ?read_holder(&path), "another instance is updating this artifact; waiting");
        let started = Instant::now();
        let Some(timeout) = timeout else {
            file.lock_exclusive()
                .with_context(|| format!("failed to lock {}", path.display()))?;
            debug!(class = %class, waited = ?started.elapsed(), "acquired update lock");
            return Self::claimed(file, class, path);
        };

        let deadline = started + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(UpdateError::LockTimeout {
                    class,
                    waited: started.elapsed(),
                }
                .into());
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
            if try_lock(&file).with_context(|| format!("failed to lock {}", path.display()))? {
                debug!(class = %class, waited = ?started.elapsed(), "acquired update lock");
                return Self::claimed(file, class, path);
            }
        }
    }

    pub fn class(&self) -> ArtifactClass {
        self.class
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn claimed(mut file: File, class: ArtifactClass, path: PathBuf) -> Result<Self> {
        file.set_len(0)
            .and_then(|_| file.write_all(format!("{}\n", std::process::id()).as_bytes()))
            .with_context(|| format!("failed to record lock owner in {}", path.display()))?;
        Ok(Self { file, class, path })
    }
}

impl Drop for ArtifactLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = FileExt::unlock(&self.file);
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))
}

fn try_lock(file: &File) -> io::Result<bool> {
    match file.try_lock_exclusive() {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(false),
        #[cfg(windows)]
        Err(err) if matches!(err.raw_os_error(), Some(32 | 33)) => Ok(false),
        Err(err) => Err(err),
    }
}

fn read_holder(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}
