use crate::error::ShmemError;
use crate::memory::page_align;
use core::ptr::NonNull;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use std::num::NonZero;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use tracing::{debug, warn};

const MAX_CREATE_ATTEMPTS: usize = 16;

/// Sequence counter ahead of the payload; odd while a write is in progress.
const HEADER_LEN: usize = std::mem::size_of::<AtomicU64>();

static NEXT_SUFFIX: AtomicU32 = AtomicU32::new(0);

/// A single-slot shared memory object used to pass one descriptor at a time.
///
/// The creator maps it read-write and unlinks the name when dropped; a peer
/// opens the same name read-only. Access is not locked. Writer and reader
/// normally take turns according to the control channel message sequence,
/// and a sequence counter in the header lets the reader detect a write that
/// overlapped its copy.
pub struct Mailbox {
    ptr: NonNull<u8>,
    size: usize,
    name: String,
    writable: bool,
}

impl Mailbox {
    /// Creates a fresh mailbox named `/{prefix}.{pid}.{n}` holding at least
    /// `capacity` payload bytes.
    pub fn create(prefix: &str, capacity: usize, mode: u32) -> Result<Self, ShmemError> {
        let capacity = NonZero::new(capacity).ok_or(ShmemError::ZeroSize)?.get();
        let size = page_align(HEADER_LEN + capacity);
        let mode = Mode::from_bits_truncate(mode as libc::mode_t);
        let pid = std::process::id();

        for _ in 0..MAX_CREATE_ATTEMPTS {
            let suffix = NEXT_SUFFIX.fetch_add(1, Ordering::Relaxed);
            let name = format!("/{}.{}.{}", prefix, pid, suffix);

            let fd = match shm_open(
                name.as_str(),
                OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR | OFlag::O_CLOEXEC,
                mode,
            ) {
                Ok(fd) => fd,
                Err(Errno::EEXIST) => {
                    debug!(name = %name, "mailbox name taken, trying next suffix");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let mapped = ftruncate(&fd, size as i64).and_then(|_| unsafe {
                mmap(
                    None,
                    NonZero::new(size).ok_or(Errno::EINVAL)?,
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                    MapFlags::MAP_SHARED,
                    &fd,
                    0,
                )
            });

            let ptr = match mapped {
                Ok(ptr) => ptr,
                Err(e) => {
                    let _ = shm_unlink(name.as_str());
                    return Err(e.into());
                }
            };

            debug!(name = %name, size, "mailbox created");
            return Ok(Mailbox {
                ptr: ptr.cast(),
                size,
                name,
                writable: true,
            });
        }

        Err(ShmemError::NameExhausted(MAX_CREATE_ATTEMPTS))
    }

    /// Opens an existing mailbox read-only.
    pub fn open(name: &str, capacity: usize) -> Result<Self, ShmemError> {
        let fd = shm_open(name, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())?;

        let available = nix::sys::stat::fstat(&fd)?.st_size.max(0) as usize;
        if available < HEADER_LEN + capacity {
            return Err(ShmemError::RegionTooSmall {
                available,
                requested: HEADER_LEN + capacity,
            });
        }
        let size = NonZero::new(available).ok_or(ShmemError::ZeroSize)?;

        let ptr = unsafe { mmap(None, size, ProtFlags::PROT_READ, MapFlags::MAP_SHARED, &fd, 0)? };

        debug!(name = %name, size = available, "mailbox opened");
        Ok(Mailbox {
            ptr: ptr.cast(),
            size: available,
            name: name.to_string(),
            writable: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Payload bytes available after the header.
    pub fn capacity(&self) -> usize {
        self.size - HEADER_LEN
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    fn sequence(&self) -> &AtomicU64 {
        // The mapping is page aligned and at least HEADER_LEN bytes long.
        unsafe { &*self.ptr.as_ptr().cast::<AtomicU64>() }
    }

    fn payload(&self) -> *mut u8 {
        unsafe { self.ptr.as_ptr().add(HEADER_LEN) }
    }

    pub fn write(&self, bytes: &[u8]) -> Result<(), ShmemError> {
        if !self.writable {
            return Err(ShmemError::ReadOnly);
        }
        if bytes.len() > self.capacity() {
            return Err(ShmemError::PayloadTooLarge {
                len: bytes.len(),
                capacity: self.capacity(),
            });
        }

        let sequence = self.sequence();
        let start = sequence.load(Ordering::Relaxed);
        sequence.store(start.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.payload(), bytes.len());
        }
        sequence.store(start.wrapping_add(2), Ordering::Release);
        Ok(())
    }

    /// Copies the payload into `out`.
    ///
    /// Fails with [`ShmemError::TornRead`] when a write was in progress at
    /// any point during the copy; `out` then holds no usable bytes.
    pub fn read(&self, out: &mut [u8]) -> Result<(), ShmemError> {
        if out.len() > self.capacity() {
            return Err(ShmemError::PayloadTooLarge {
                len: out.len(),
                capacity: self.capacity(),
            });
        }

        let sequence = self.sequence();
        let before = sequence.load(Ordering::Acquire);
        if before % 2 == 1 {
            return Err(ShmemError::TornRead);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(self.payload(), out.as_mut_ptr(), out.len());
        }
        fence(Ordering::Acquire);
        if sequence.load(Ordering::Relaxed) != before {
            return Err(ShmemError::TornRead);
        }
        Ok(())
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr.cast(), self.size);
        }
        if self.writable {
            if let Err(e) = shm_unlink(self.name.as_str()) {
                warn!(name = %self.name, error = ?e, "failed to unlink mailbox");
            } else {
                debug!(name = %self.name, "mailbox unlinked");
            }
        }
    }
}

unsafe impl Send for Mailbox {}
unsafe impl Sync for Mailbox {}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[fixture]
    fn mailbox() -> Mailbox {
        Mailbox::create("shmem-test", 256, 0o600).unwrap()
    }

    #[rstest]
    fn test_reader_sees_writer_bytes(mailbox: Mailbox) -> Result<(), ShmemError> {
        let reader = Mailbox::open(mailbox.name(), 256)?;
        assert!(!reader.is_writable());

        mailbox.write(b"descriptor bytes")?;

        let mut out = [0u8; 16];
        reader.read(&mut out)?;
        assert_eq!(&out, b"descriptor bytes");
        Ok(())
    }

    #[rstest]
    fn test_reader_cannot_write(mailbox: Mailbox) -> Result<(), ShmemError> {
        let reader = Mailbox::open(mailbox.name(), 16)?;
        assert!(matches!(reader.write(b"x"), Err(ShmemError::ReadOnly)));
        Ok(())
    }

    #[rstest]
    fn test_oversized_payload_is_rejected(mailbox: Mailbox) {
        let payload = vec![0u8; mailbox.capacity() + 1];
        assert!(matches!(
            mailbox.write(&payload),
            Err(ShmemError::PayloadTooLarge { .. })
        ));
    }

    #[rstest]
    fn test_overlapping_write_is_detected(mailbox: Mailbox) -> Result<(), ShmemError> {
        let reader = Mailbox::open(mailbox.name(), 256)?;
        let mut accepted = 0usize;

        std::thread::scope(|s| {
            s.spawn(|| {
                for round in 0..5000u32 {
                    mailbox.write(&[round as u8; 256]).unwrap();
                }
            });

            let mut out = [0u8; 256];
            for _ in 0..5000 {
                match reader.read(&mut out) {
                    Ok(()) => {
                        assert!(out.iter().all(|&b| b == out[0]), "mixed payload accepted");
                        accepted += 1;
                    }
                    Err(ShmemError::TornRead) => {}
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
        });

        let mut last = [0u8; 256];
        reader.read(&mut last)?;
        assert_eq!(last, [(4999u32 % 256) as u8; 256]);
        tracing::debug!(accepted, "reads accepted while writing");
        Ok(())
    }

    #[rstest]
    fn test_open_missing_name_reports_errno() {
        let error = match Mailbox::open("/shmem-test.missing.0", 16) {
            Err(error) => error,
            Ok(_) => panic!("opened a mailbox that was never created"),
        };
        assert!(matches!(error, ShmemError::Nix(Errno::ENOENT)));
        assert!(error.to_string().starts_with("system call failed"));
    }

    #[rstest]
    fn test_names_are_unique() -> Result<(), ShmemError> {
        let first = Mailbox::create("shmem-test", 64, 0o600)?;
        let second = Mailbox::create("shmem-test", 64, 0o600)?;
        assert_ne!(first.name(), second.name());
        Ok(())
    }

    #[rstest]
    fn test_drop_unlinks_name(mailbox: Mailbox) {
        let name = mailbox.name().to_string();
        drop(mailbox);
        assert!(Mailbox::open(&name, 16).is_err());
    }
}
