//! A linear byte-addressable volume on top of a remote JBOD server,
//! with a block cache in front of the block protocol.

pub mod device;
pub mod jbod;
pub mod trace;
