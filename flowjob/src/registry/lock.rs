//! Region file access under the registry's two-level lock.
//!
//! Threads of one process serialize on a `parking_lot` mutex; processes
//! serialize on an exclusive `flock` of the region file. Both are acquired
//! against the same deadline, and both are released when the
//! [`RegionGuard`] drops.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use parking_lot::{Mutex, MutexGuard};

use crate::error::RegistryError;

use super::slot::{self, Slot, HEADER_SIZE, SLOT_SIZE};

const FLOCK_POLL: Duration = Duration::from_millis(2);

/// Open region file plus its slot count.
#[derive(Debug)]
pub(crate) struct Region {
    file: File,
    max_items: usize,
}

impl Region {
    /// Attach to the region at `path`, initializing it when the file is new.
    ///
    /// Runs under the file lock so two processes starting together agree on
    /// one region. Returns whether this call initialized it. Every call adds
    /// one to the header's attached count; see [`RegionGuard::detach`].
    pub(crate) fn open_or_create(
        path: &Path,
        max_items: usize,
        timeout: Duration,
    ) -> Result<(Self, bool), RegistryError> {
        let header = slot::encode_header(max_items)?;
        let deadline = Instant::now() + timeout;

        loop {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?;
            let _flock = flock_until(&file, deadline, timeout)?;

            // The last detaching process may have unlinked the path between
            // our open and our lock.
            if !names_file(path, &file)? {
                if Instant::now() >= deadline {
                    return Err(RegistryError::LockTimeout {
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
                continue;
            }

            let created = file.metadata()?.len() == 0;
            let region = if created {
                let mut image = vec![0u8; slot::region_len(max_items) as usize];
                image[..HEADER_SIZE].copy_from_slice(&header);
                file.write_all_at(&image, 0)?;
                Self { file, max_items }
            } else {
                Self::validate(file, path)?
            };
            region.set_attached(region.attached()?.saturating_add(1))?;
            return Ok((region, created));
        }
    }

    /// Attach to an existing region, validating its header and length.
    pub(crate) fn open(path: &Path) -> Result<Self, RegistryError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::validate(file, path)
    }

    fn validate(file: File, path: &Path) -> Result<Self, RegistryError> {
        let mut header = [0u8; HEADER_SIZE];
        file.read_exact_at(&mut header, 0)?;
        let max_items = slot::decode_header(&header, path)?;

        let len = file.metadata()?.len();
        if len < slot::region_len(max_items) {
            return Err(RegistryError::InvalidRegion {
                path: path.to_path_buf(),
                reason: format!("file is {len} bytes, layout needs {}", slot::region_len(max_items)),
            });
        }
        Ok(Self { file, max_items })
    }

    pub(crate) fn max_items(&self) -> usize {
        self.max_items
    }

    fn attached(&self) -> Result<u32, RegistryError> {
        let mut raw = [0u8; 4];
        self.file.read_exact_at(&mut raw, slot::ATTACHED_OFFSET)?;
        Ok(u32::from_le_bytes(raw))
    }

    fn set_attached(&self, count: u32) -> Result<(), RegistryError> {
        self.file
            .write_all_at(&count.to_le_bytes(), slot::ATTACHED_OFFSET)?;
        Ok(())
    }
}

/// Whether `path` still names the open `file`.
fn names_file(path: &Path, file: &File) -> Result<bool, RegistryError> {
    let open = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(named) => Ok(named.dev() == open.dev() && named.ino() == open.ino()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// Exclusive `flock` on `file`, polled until `deadline`.
fn flock_until(
    file: &File,
    deadline: Instant,
    timeout: Duration,
) -> Result<Flock<File>, RegistryError> {
    loop {
        let handle = file.try_clone()?;
        match Flock::lock(handle, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => return Ok(flock),
            Err((_, Errno::EINTR)) => continue,
            Err((_, Errno::EWOULDBLOCK)) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(RegistryError::LockTimeout {
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
                thread::sleep(FLOCK_POLL.min(deadline - now));
            }
            Err((_, errno)) => return Err(errno.into()),
        }
    }
}

/// Both lock levels held over an open region.
pub(crate) struct RegionGuard<'a> {
    // Declared first so the file lock is released before the mutex.
    _flock: Flock<File>,
    region: MutexGuard<'a, Region>,
}

/// Take the in-process mutex, then the file lock, within `timeout`.
pub(crate) fn lock(
    region: &Mutex<Region>,
    timeout: Duration,
) -> Result<RegionGuard<'_>, RegistryError> {
    let deadline = Instant::now() + timeout;
    let guard = region
        .try_lock_for(timeout)
        .ok_or(RegistryError::LockTimeout {
            timeout_ms: timeout.as_millis() as u64,
        })?;
    let flock = flock_until(&guard.file, deadline, timeout)?;

    Ok(RegionGuard {
        _flock: flock,
        region: guard,
    })
}

impl RegionGuard<'_> {
    /// Every slot, decoded from one read of the slot area.
    ///
    /// Slots that fail to decode are reported as free so a single corrupt
    /// slot cannot wedge the table.
    pub(crate) fn read_all(&self) -> Result<Vec<Slot>, RegistryError> {
        let max_items = self.region.max_items;
        let mut area = vec![0u8; max_items * SLOT_SIZE];
        self.region
            .file
            .read_exact_at(&mut area, slot::slot_offset(0))?;

        Ok(area
            .chunks_exact(SLOT_SIZE)
            .enumerate()
            .map(|(index, bytes)| {
                Slot::decode(bytes).unwrap_or_else(|reason| {
                    tracing::warn!(slot = index, %reason, "undecodable registry slot treated as free");
                    Slot::Sentinel
                })
            })
            .collect())
    }

    /// Replace slot `index` with one positioned write of the whole slot.
    pub(crate) fn write(&self, index: usize, slot: &Slot) -> Result<(), RegistryError> {
        let bytes = slot.encode()?;
        self.region
            .file
            .write_all_at(&bytes, slot::slot_offset(index))?;
        Ok(())
    }

    /// Drop one attachment and return how many remain.
    pub(crate) fn detach(&self) -> Result<u32, RegistryError> {
        let remaining = self.region.attached()?.saturating_sub(1);
        self.region.set_attached(remaining)?;
        Ok(remaining)
    }
}
