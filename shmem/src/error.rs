use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShmemError {
    #[error("shared memory size must be non-zero")]
    ZeroSize,

    #[error("region of {available} bytes is smaller than the requested {requested} bytes")]
    RegionTooSmall { available: usize, requested: usize },

    #[error("mailbox is mapped read-only")]
    ReadOnly,

    #[error("{len} bytes do not fit a mailbox of {capacity} bytes")]
    PayloadTooLarge { len: usize, capacity: usize },

    #[error("mailbox was rewritten while being read")]
    TornRead,

    #[error("no free mailbox name after {0} attempts")]
    NameExhausted(usize),

    #[error("system call failed: {0}")]
    Nix(#[from] nix::errno::Errno),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("eventfd error: {0}")]
    Eventfd(String),
}
