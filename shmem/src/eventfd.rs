use crate::error::ShmemError;
use nix::errno::Errno;
use nix::sys::eventfd::{EfdFlags, EventFd};
use std::os::fd::{AsFd, BorrowedFd};

/// A non-blocking eventfd used to wake a thread parked in `epoll_wait`.
pub struct Notification {
    eventfd: EventFd,
}

impl Notification {
    pub fn new() -> Result<Self, ShmemError> {
        let eventfd =
            EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
                .map_err(|e| ShmemError::Eventfd(e.to_string()))?;

        Ok(Notification { eventfd })
    }

    pub fn notify(&self) -> Result<(), ShmemError> {
        self.eventfd
            .write(1)
            .map_err(|e| ShmemError::Eventfd(e.to_string()))?;
        Ok(())
    }

    /// Clears any pending notification. Returns whether one was pending.
    pub fn drain(&self) -> Result<bool, ShmemError> {
        match self.eventfd.read() {
            Ok(_) => Ok(true),
            Err(Errno::EAGAIN) => Ok(false),
            Err(e) => Err(ShmemError::Eventfd(e.to_string())),
        }
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.eventfd.as_fd()
    }
}
