//! 线性卷的地址布局
//!
//! 整个卷按自然顺序依次铺满 16 个磁盘, 每个磁盘 256 个块, 每个块 256 字节.
//! 一个线性地址按固定的位段拆分成三级:
//!
//! ```text
//!  19      16 15            8 7             0
//! +----------+---------------+---------------+
//! |   disk   |     block     |     byte      |
//! +----------+---------------+---------------+
//! ```
//!
//! 这些位宽是与服务器约定的, 不能随意调整.

use std::fmt::{Debug, Formatter, Result};

use super::{BLOCKS_PER_DISK, BLOCK_SIZE, NUM_DISKS};

/// 一个线性地址拆分后的 (disk, block, byte)
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub disk: u8,
    pub block: u8,
    pub byte: u8,
}

impl Address {
    pub fn new(offset: u32) -> Self {
        Self {
            disk: ((offset >> 16) & 0xF) as u8,
            block: ((offset >> 8) & 0xFF) as u8,
            byte: (offset & 0xFF) as u8,
        }
    }

    /// 还原成线性地址
    pub fn linear(&self) -> u32 {
        ((self.disk as u32) << 16) | ((self.block as u32) << 8) | self.byte as u32
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        f.debug_struct("Address")
            .field("disk", &self.disk)
            .field("block", &self.block)
            .field("byte", &self.byte)
            .finish()
    }
}

/// 一次区间访问在某一个块上的部分
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    pub disk: u8,
    pub block: u8,
    /// 块内起始字节
    pub start: usize,
    /// 块内要访问的字节数
    pub len: usize,
    /// 这段数据在调用者缓冲区中的偏移
    pub buf_offset: usize,
}

impl Segment {
    /// 块内的字节区间
    pub fn range(&self) -> std::ops::Range<usize> {
        self.start..self.start + self.len
    }

    /// 调用者缓冲区中对应的区间
    pub fn buf_range(&self) -> std::ops::Range<usize> {
        self.buf_offset..self.buf_offset + self.len
    }
}

/// 按访问顺序遍历 [offset, offset + len) 覆盖的所有块
///
/// 从起始磁盘开始逐个磁盘遍历; 第一个磁盘从起始块开始, 其后的磁盘从 0 号块开始;
/// 只有访问的第一个块从起始字节开始, 其余块都从 0 开始, 直到块尾或长度用完.
/// 调用者负责保证区间不超过卷的大小.
pub fn segments(offset: u32, len: usize) -> Segments {
    let addr = Address::new(offset);
    Segments {
        disk: addr.disk as usize,
        block: addr.block as usize,
        byte: addr.byte as usize,
        done: 0,
        len,
    }
}

pub struct Segments {
    disk: usize,
    block: usize,
    byte: usize,
    done: usize,
    len: usize,
}

impl Iterator for Segments {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        if self.done >= self.len || self.disk >= NUM_DISKS {
            return None;
        }
        let len = (BLOCK_SIZE - self.byte).min(self.len - self.done);
        let segment = Segment {
            disk: self.disk as u8,
            block: self.block as u8,
            start: self.byte,
            len,
            buf_offset: self.done,
        };
        self.done += len;
        // 转到下一个块, 块用完了就转到下一个磁盘
        self.byte = 0;
        self.block += 1;
        if self.block == BLOCKS_PER_DISK {
            self.block = 0;
            self.disk += 1;
        }
        Some(segment)
    }
}
