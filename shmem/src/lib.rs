//! # shmem - shared memory building blocks for buffer handoff
//!
//! - [`SharedMemory`]: a memfd-backed region mapped read-write. Its file
//!   descriptor is the exportable handle for one buffer plane.
//! - [`ImportedRegion`]: a read-only mapping of a region exported by a peer.
//! - [`Mailbox`]: a named POSIX shared memory slot carrying one descriptor at
//!   a time from the creator to a read-only peer.
//! - [`Notification`]: an eventfd used as a wake-up channel for epoll loops.
//!
//! ```rust
//! use shmem::{ImportedRegion, SharedMemory};
//!
//! let mut plane = SharedMemory::new(4096)?;
//! plane.as_mut_slice()[..5].copy_from_slice(b"hello");
//!
//! let imported = ImportedRegion::map_readonly(plane.clone_fd()?, 4096)?;
//! assert_eq!(&imported.as_slice()[..5], b"hello");
//! # Ok::<(), shmem::ShmemError>(())
//! ```
//!
//! ```rust
//! use shmem::Mailbox;
//!
//! let writer = Mailbox::create("doc-mailbox", 128, 0o600)?;
//! let reader = Mailbox::open(writer.name(), 128)?;
//!
//! writer.write(b"descriptor")?;
//! let mut out = [0u8; 10];
//! reader.read(&mut out)?;
//! assert_eq!(&out, b"descriptor");
//! # Ok::<(), shmem::ShmemError>(())
//! ```

pub use error::ShmemError;
pub use eventfd::Notification;
pub use mailbox::Mailbox;
pub use memory::{page_align, page_size, ImportedRegion, SharedMemory};

pub mod error;
pub(crate) mod eventfd;
pub(crate) mod mailbox;
pub(crate) mod memory;
