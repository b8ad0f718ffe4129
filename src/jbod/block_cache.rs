//! 块缓存层: 在内存中缓存远程磁盘块的数据, 避免频繁的网络往返
//!
//! 每读一个块都要经过一次完整的请求/响应, 代价很高.
//! 因此 I/O 层在访问一个块之前, 首先去 [`BlockCache`] 中查看这个块是否已经被缓存.
//! 命中则直接使用缓存的副本; 未命中才向服务器发起 ReadBlock, 并把结果插入缓存.
//! 写操作采用写直达 (write-through): 块写到服务器之后, 同时更新缓存中的副本.
//!
//! 缓存是一张容量固定的表, 每个表项记录 (disk, block) 以及访问次数 access_count.
//! 表满时替换访问次数最少的表项 (相同时取下标最小者), 用计数近似 LRU, 不需要时间戳.
//!
//! 表项从不被借出: lookup/update/insert 都是把 256 字节拷进拷出.
//! 多个调用者共享时使用 [`SharedBlockCache`], 由锁保证单个表项不会被读到一半.

use std::fmt;
use std::sync::Arc;

use log::{debug, trace};
use spin::Mutex;

use super::{
    Block, JbodError, Result, BLOCKS_PER_DISK, BLOCK_SIZE, MAX_CACHE_ENTRIES, MIN_CACHE_ENTRIES,
    NUM_DISKS,
};

/// 在多个持有者之间共享的块缓存
pub type SharedBlockCache = Arc<Mutex<BlockCache>>;

/// Cached block inside memory
#[derive(Clone)]
struct CacheEntry {
    /// valid 为 false 表示空槽位
    valid: bool,
    disk: u8,
    block: u16,
    access_count: u32,
    bytes: Block,
}

impl CacheEntry {
    fn empty() -> Self {
        Self {
            valid: false,
            disk: 0,
            block: 0,
            access_count: 0,
            bytes: [0u8; BLOCK_SIZE],
        }
    }

    fn matches(&self, disk: u8, block: u16) -> bool {
        self.valid && self.disk == disk && self.block == block
    }

    /// 用新的块整体替换这个槽位
    fn replace(&mut self, disk: u8, block: u16, bytes: &Block) {
        self.valid = true;
        self.disk = disk;
        self.block = block;
        self.access_count = 1;
        self.bytes.copy_from_slice(bytes);
    }
}

/// insert 的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Insertion {
    /// 放入了一个空槽位, 或替换了访问次数最少的表项
    Inserted,
    /// 已经存在同一个 (disk, block), 只更新了内容
    Updated,
    /// 缓存未创建或 (disk, block) 越界
    Rejected,
}

/// 命中率统计
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub queries: u64,
}

impl CacheStats {
    /// 命中率 (百分比), 没有查询时为 0
    pub fn hit_rate(&self) -> f64 {
        if self.queries == 0 {
            return 0.0;
        }
        100.0 * self.hits as f64 / self.queries as f64
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "num_hits: {}, num_queries: {}", self.hits, self.queries)?;
        write!(f, "Hit rate: {:5.1}%", self.hit_rate())
    }
}

/// 容量固定的块缓存表
///
/// 生命周期: `create` 一次, `destroy` 一次. 未创建时 lookup 总是未命中, insert 总是被拒绝.
#[derive(Default)]
pub struct BlockCache {
    entries: Vec<CacheEntry>,
    queries: u64,
    hits: u64,
}

impl BlockCache {
    /// 一个尚未创建的缓存
    pub fn new() -> Self {
        Self::default()
    }

    /// 直接创建一个容量为 `capacity` 的缓存
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let mut cache = Self::new();
        cache.create(capacity)?;
        Ok(cache)
    }

    /// 包装成可共享的缓存
    pub fn shared(self) -> SharedBlockCache {
        Arc::new(Mutex::new(self))
    }

    /// 分配 `capacity` 个空表项; 已创建或容量越界时失败, 不留下任何状态
    pub fn create(&mut self, capacity: usize) -> Result<()> {
        if self.is_enabled() {
            return Err(JbodError::CacheAlreadyCreated);
        }
        if !(MIN_CACHE_ENTRIES..=MAX_CACHE_ENTRIES).contains(&capacity) {
            return Err(JbodError::CacheCapacity(capacity));
        }
        self.entries = vec![CacheEntry::empty(); capacity];
        self.queries = 0;
        self.hits = 0;
        debug!("block cache created with {} entries", capacity);
        Ok(())
    }

    /// 释放所有表项, 回到未创建状态
    pub fn destroy(&mut self) -> Result<()> {
        if !self.is_enabled() {
            return Err(JbodError::CacheNotCreated);
        }
        self.entries = Vec::new();
        debug!("block cache destroyed");
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// 有效表项的数量
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|entry| entry.valid).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 查找 (disk, block); 命中时拷贝出块内容并增加该表项的访问次数
    pub fn lookup(&mut self, disk: u8, block: u16) -> Option<Block> {
        if !self.is_enabled() {
            return None;
        }
        self.queries += 1;
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.matches(disk, block))?;
        entry.access_count += 1;
        self.hits += 1;
        trace!("cache hit disk {} block {}", disk, block);
        Some(entry.bytes)
    }

    /// 覆盖所有匹配表项的内容并增加访问次数; 没有匹配时什么也不做
    pub fn update(&mut self, disk: u8, block: u16, bytes: &Block) {
        for entry in self
            .entries
            .iter_mut()
            .filter(|entry| entry.matches(disk, block))
        {
            entry.bytes.copy_from_slice(bytes);
            entry.access_count += 1;
        }
    }

    /// 插入一个块
    ///
    /// 已存在则等同于 update; 否则优先使用空槽位,
    /// 没有空槽位时替换访问次数最少的表项 (第一个最小值胜出).
    pub fn insert(&mut self, disk: u8, block: u16, bytes: &Block) -> Insertion {
        if !self.is_enabled() || disk as usize >= NUM_DISKS || block as usize >= BLOCKS_PER_DISK {
            return Insertion::Rejected;
        }
        if self.entries.iter().any(|entry| entry.matches(disk, block)) {
            self.update(disk, block, bytes);
            return Insertion::Updated;
        }
        if let Some(slot) = self.entries.iter_mut().find(|entry| !entry.valid) {
            slot.replace(disk, block, bytes);
            return Insertion::Inserted;
        }
        // 表已满: 线性扫描找到访问次数最少的表项.
        // min_by_key 在相同时返回最后一个, 所以这里手写比较保证取下标最小者
        let mut victim = 0;
        for (idx, entry) in self.entries.iter().enumerate() {
            if entry.access_count < self.entries[victim].access_count {
                victim = idx;
            }
        }
        let evicted = &mut self.entries[victim];
        debug!(
            "cache evicts disk {} block {} (accesses {}) for disk {} block {}",
            evicted.disk, evicted.block, evicted.access_count, disk, block
        );
        evicted.replace(disk, block, bytes);
        Insertion::Inserted
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn queries(&self) -> u64 {
        self.queries
    }

    pub fn hit_rate(&self) -> f64 {
        self.stats().hit_rate()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            queries: self.queries,
        }
    }

    pub fn print_hit_rate(&self) {
        eprintln!("{}", self.stats());
    }

    #[cfg(test)]
    fn access_count(&self, disk: u8, block: u16) -> Option<u32> {
        self.entries
            .iter()
            .find(|entry| entry.matches(disk, block))
            .map(|entry| entry.access_count)
    }

    #[cfg(test)]
    fn contains(&self, disk: u8, block: u16) -> bool {
        self.access_count(disk, block).is_some()
    }
}
