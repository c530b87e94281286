use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use shmem::Notification;
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

use crate::Result;

/// Token reserved for the wake-up channel.
pub const WAKE_TOKEN: u64 = u64::MAX;

const MAX_EVENTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub token: u64,
    pub readable: bool,
    pub closed: bool,
    pub error: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum WaitResult {
    Ready(Vec<Readiness>),
    TimedOut,
    Flushing,
}

/// Waits on a set of endpoints until one becomes readable, closed or errors.
///
/// An eventfd is registered alongside the endpoints so that
/// [`set_flushing`](Poller::set_flushing) wakes a thread blocked in
/// [`wait`](Poller::wait) even when no endpoint has activity.
pub struct Poller {
    epoll: Epoll,
    wake: Notification,
    flushing: AtomicBool,
}

impl Poller {
    pub fn new() -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        let wake = Notification::new()?;
        epoll.add(wake.fd(), EpollEvent::new(EpollFlags::EPOLLIN, WAKE_TOKEN))?;

        Ok(Poller {
            epoll,
            wake,
            flushing: AtomicBool::new(false),
        })
    }

    pub fn add<F: AsFd>(&self, fd: F, token: u64) -> Result<()> {
        debug_assert_ne!(token, WAKE_TOKEN);
        self.epoll.add(
            fd,
            EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP, token),
        )?;
        Ok(())
    }

    pub fn remove<F: AsFd>(&self, fd: F) -> Result<()> {
        self.epoll.delete(fd)?;
        Ok(())
    }

    /// Blocks until an endpoint is ready, the timeout elapses or the poller
    /// is flushing. `None` waits indefinitely.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<WaitResult> {
        if self.is_flushing() {
            return Ok(WaitResult::Flushing);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut events = [EpollEvent::empty(); MAX_EVENTS];

        loop {
            let epoll_timeout = match deadline {
                None => EpollTimeout::NONE,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    EpollTimeout::try_from(remaining).unwrap_or(EpollTimeout::MAX)
                }
            };

            let nfds = match self.epoll.wait(&mut events, epoll_timeout) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            };

            if self.is_flushing() {
                return Ok(WaitResult::Flushing);
            }

            let ready: Vec<Readiness> = events
                .iter()
                .take(nfds)
                .filter(|event| event.data() != WAKE_TOKEN)
                .map(|event| {
                    let flags = event.events();
                    Readiness {
                        token: event.data(),
                        readable: flags.contains(EpollFlags::EPOLLIN),
                        closed: flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLRDHUP),
                        error: flags.contains(EpollFlags::EPOLLERR),
                    }
                })
                .collect();

            if !ready.is_empty() {
                trace!(count = ready.len(), "poller ready");
                return Ok(WaitResult::Ready(ready));
            }

            if nfds > 0 {
                // Stale wake-up left over from a previous flush.
                self.wake.drain()?;
                continue;
            }

            return Ok(WaitResult::TimedOut);
        }
    }

    /// Sets or clears the flushing flag. While set, every `wait` returns
    /// [`WaitResult::Flushing`] immediately.
    pub fn set_flushing(&self, flushing: bool) -> Result<()> {
        self.flushing.store(flushing, Ordering::SeqCst);
        if flushing {
            self.wake.notify()?;
        } else {
            self.wake.drain()?;
        }
        Ok(())
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::SeqCst)
    }
}
