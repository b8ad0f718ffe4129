mod block_cache;
mod block_dev;
mod error;
mod layout;
mod net;
mod volume;

extern crate log;

/// Use a block size of 256 bytes
pub const BLOCK_SIZE: usize = 256;
/// JBOD 中磁盘的数量 (地址中 disk 字段占 4 bit)
pub const NUM_DISKS: usize = 16;
/// 每个磁盘上的块数 (地址中 block 字段占 8 bit)
pub const BLOCKS_PER_DISK: usize = 256;
/// 单个磁盘的字节数
pub const DISK_SIZE: usize = BLOCKS_PER_DISK * BLOCK_SIZE;
/// 整个线性卷的字节数
pub const VOLUME_SIZE: usize = NUM_DISKS * DISK_SIZE;
/// 一次 read/write 允许的最大字节数
pub const MAX_IO_SIZE: usize = 2048;
/// 块缓存容量的下界
pub const MIN_CACHE_ENTRIES: usize = 2;
/// 块缓存容量的上界
pub const MAX_CACHE_ENTRIES: usize = 4096;
/// 协议头: 4 字节命令字 + 1 字节 info
pub const HEADER_LEN: usize = 5;
/// Default port of the JBOD server
pub const DEFAULT_PORT: u16 = 3333;
/// Default host of the JBOD server
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// 一个块的数据
pub type Block = [u8; BLOCK_SIZE];

pub use block_cache::{BlockCache, CacheStats, Insertion, SharedBlockCache};
pub use block_dev::{Command, JbodDevice, Request};
pub use error::{JbodError, Result};
pub use layout::{segments, Address, Segment};
pub use net::{
    decode_request, decode_response, encode_request, encode_response, read_full, serve,
    write_full, JbodClient, Response,
};
pub use volume::Volume;
