use std::io;

use thiserror::Error;

use super::{Command, MAX_CACHE_ENTRIES, MAX_IO_SIZE, MIN_CACHE_ENTRIES, VOLUME_SIZE};

/// Error type for every layer of the JBOD client
#[derive(Error, Debug)]
pub enum JbodError {
    #[error("request of {0} bytes exceeds the {MAX_IO_SIZE} byte limit")]
    TooLong(usize),
    #[error("range {offset:#x}+{len} exceeds the volume size ({VOLUME_SIZE} bytes)")]
    OutOfRange { offset: u32, len: usize },
    #[error("disk {disk} block {block} is outside the array")]
    InvalidBlock { disk: u32, block: u32 },
    #[error("volume is not mounted")]
    NotMounted,
    #[error("volume has no write permission")]
    NotWritable,
    #[error("not connected to a JBOD server")]
    Disconnected,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("server rejected {0:?}")]
    Server(Command),
    #[error("unknown command code {0}")]
    UnknownCommand(u8),
    #[error("cache capacity {0} is outside {MIN_CACHE_ENTRIES}..={MAX_CACHE_ENTRIES}")]
    CacheCapacity(usize),
    #[error("cache is already created")]
    CacheAlreadyCreated,
    #[error("cache is not created")]
    CacheNotCreated,
}

/// Result type for JBOD operations
pub type Result<T> = std::result::Result<T, JbodError>;
