//! JBOD 只提供以块为单位的原语, 但是对于卷的使用者而言,
//! 他们更希望直接对一段线性的字节区间进行读写, 而不关心它落在哪个磁盘的哪个块上.
//! 为此需要设计 [`Volume`] 暴露给使用者: 它把 (offset, len) 拆成一串 (disk, block, byte-range),
//! 依次查询块缓存, 未命中时才驱动远程原语.
//!
//! 挂载与写权限在客户端显式记录, 只有服务器确认成功后才改变; 读要求已挂载, 写还要求已获得写权限.

use std::io::{Read, Write};

use log::{debug, warn};
use spin::Mutex;

use super::{
    segments, Block, BlockCache, Command, JbodClient, JbodDevice, JbodError, Request, Result,
    Segment, SharedBlockCache, BLOCKS_PER_DISK, BLOCK_SIZE, MAX_IO_SIZE, VOLUME_SIZE,
};

/// 长度与边界检查, 在任何远程调用之前完成
fn check_range(offset: u32, len: usize) -> Result<()> {
    if len > MAX_IO_SIZE {
        return Err(JbodError::TooLong(len));
    }
    if offset as usize + len > VOLUME_SIZE {
        return Err(JbodError::OutOfRange { offset, len });
    }
    Ok(())
}

/// 设备以及客户端记录的状态, 整体由一把锁保护: 同一时刻只有一个请求在路上
struct State<D> {
    device: D,
    mounted: bool,
    writable: bool,
    /// 服务器端磁头所在的磁盘, None 表示不确定
    head_disk: Option<u8>,
    /// 服务器端磁头所在的块, 读/写一个块之后会前进到下一块
    head_block: Option<usize>,
}

impl<D: JbodDevice> State<D> {
    fn forget_head(&mut self) {
        self.head_disk = None;
        self.head_block = None;
    }

    /// 执行一个远程原语并同步本地记录的磁头位置; 任何失败之后磁头位置都不再可信
    fn call(&mut self, request: Request, block: Option<&mut Block>) -> Result<()> {
        if let Err(e) = self.device.execute(request, block) {
            self.forget_head();
            return Err(e);
        }
        match request.command {
            Command::SeekToDisk => {
                self.head_disk = Some(request.disk);
                self.head_block = None;
            }
            Command::SeekToBlock => self.head_block = Some(request.block as usize),
            // 越过磁盘末尾之后服务器的磁头位置不确定
            Command::ReadBlock | Command::WriteBlock => match self.head_block {
                Some(block) if block + 1 < BLOCKS_PER_DISK => self.head_block = Some(block + 1),
                _ => self.forget_head(),
            },
            Command::Mount | Command::Unmount => self.forget_head(),
            _ => {}
        }
        Ok(())
    }

    /// 把远程磁头移动到 (disk, block), 已经在那里时不发请求
    fn position(&mut self, disk: u8, block: usize) -> Result<()> {
        if self.head_disk != Some(disk) {
            self.call(Request::seek_to_disk(disk), None)?;
        }
        if self.head_block != Some(block) {
            self.call(Request::seek_to_block(block as u8), None)?;
        }
        Ok(())
    }

    /// 取得一个完整的块: 先查缓存, 未命中再向服务器读取并插入缓存.
    ///
    /// 命中时不传输数据, 但仍把远程磁头推进到下一块, 让之后未命中的顺序读不需要额外的寻道.
    fn fetch_block(&mut self, cache: &SharedBlockCache, disk: u8, block: u8) -> Result<Block> {
        let cached = cache.lock().lookup(disk, block as u16);
        if let Some(bytes) = cached {
            if (block as usize) + 1 < BLOCKS_PER_DISK {
                self.position(disk, block as usize + 1)?;
            }
            return Ok(bytes);
        }
        self.position(disk, block as usize)?;
        let mut bytes = [0u8; BLOCK_SIZE];
        self.call(Request::read_block(), Some(&mut bytes))?;
        cache.lock().insert(disk, block as u16, &bytes);
        Ok(bytes)
    }

    /// 把一个完整的块写到服务器, 然后写直达到缓存
    fn store_block(
        &mut self,
        cache: &SharedBlockCache,
        disk: u8,
        block: u8,
        bytes: &Block,
    ) -> Result<()> {
        self.position(disk, block as usize)?;
        let mut outgoing = *bytes;
        self.call(Request::write_block(), Some(&mut outgoing))?;
        cache.lock().insert(disk, block as u16, bytes);
        Ok(())
    }
}

/// 一个由 JBOD 支撑的线性卷
pub struct Volume<D: JbodDevice> {
    state: Mutex<State<D>>,
    cache: SharedBlockCache,
}

impl<D: JbodDevice> Volume<D> {
    /// 在设备上打开一个卷, 缓存尚未创建
    pub fn new(device: D) -> Self {
        Self::with_cache(device, BlockCache::new().shared())
    }

    /// 使用调用者提供的 (可能与他人共享的) 块缓存
    pub fn with_cache(device: D, cache: SharedBlockCache) -> Self {
        Self {
            state: Mutex::new(State {
                device,
                mounted: false,
                writable: false,
                head_disk: None,
                head_block: None,
            }),
            cache,
        }
    }

    pub fn cache(&self) -> SharedBlockCache {
        self.cache.clone()
    }

    pub fn cache_create(&self, capacity: usize) -> Result<()> {
        self.cache.lock().create(capacity)
    }

    pub fn cache_destroy(&self) -> Result<()> {
        self.cache.lock().destroy()
    }

    pub fn cache_print_hit_rate(&self) {
        self.cache.lock().print_hit_rate();
    }

    /// 在底层设备上调用一个函数, 例如查看统计或断开连接
    pub fn with_device<V>(&self, f: impl FnOnce(&mut D) -> V) -> V {
        f(&mut self.state.lock().device)
    }

    pub fn is_mounted(&self) -> bool {
        self.state.lock().mounted
    }

    pub fn is_writable(&self) -> bool {
        self.state.lock().writable
    }

    pub fn mount(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.call(Request::mount(), None)?;
        state.mounted = true;
        debug!("volume mounted");
        Ok(())
    }

    pub fn unmount(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.call(Request::unmount(), None)?;
        state.mounted = false;
        debug!("volume unmounted");
        Ok(())
    }

    pub fn write_permission(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.call(Request::write_permission(), None)?;
        state.writable = true;
        debug!("write permission granted");
        Ok(())
    }

    pub fn revoke_write_permission(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.call(Request::revoke_write_permission(), None)?;
        state.writable = false;
        debug!("write permission revoked");
        Ok(())
    }

    /// 从 offset 开始读满 buf, 返回读到的字节数 (总是 buf.len())
    ///
    /// 任何一次远程调用失败都会让整个读操作失败, 不返回部分结果.
    pub fn read_at(&self, offset: u32, buf: &mut [u8]) -> Result<usize> {
        check_range(offset, buf.len())?;
        let mut state = self.state.lock();
        if !state.mounted {
            return Err(JbodError::NotMounted);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len();
        for seg in segments(offset, len) {
            let block = state
                .fetch_block(&self.cache, seg.disk, seg.block)
                .map_err(|e| {
                    warn!("read {:#x}+{} failed at {:?}: {}", offset, len, seg, e);
                    e
                })?;
            buf[seg.buf_range()].copy_from_slice(&block[seg.range()]);
        }
        Ok(len)
    }

    /// 读取 [offset, offset + len)
    pub fn read(&self, offset: u32, len: usize) -> Result<Vec<u8>> {
        check_range(offset, len)?;
        let mut buf = vec![0u8; len];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// 把 buf 写到 offset 开始的区间, 返回写入的字节数
    ///
    /// 远程接口没有比块更小的写原语, 所以每个块都是读-改-写:
    /// 先取得整块 (保留未被覆盖的字节), 覆盖新数据, 再整块写回并更新缓存.
    pub fn write_at(&self, offset: u32, buf: &[u8]) -> Result<usize> {
        check_range(offset, buf.len())?;
        let mut state = self.state.lock();
        if !state.mounted {
            return Err(JbodError::NotMounted);
        }
        if !state.writable {
            return Err(JbodError::NotWritable);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len();
        let log_failure = |seg: Segment, e: JbodError| {
            warn!("write {:#x}+{} failed at {:?}: {}", offset, len, seg, e);
            e
        };
        for seg in segments(offset, len) {
            let mut block = state
                .fetch_block(&self.cache, seg.disk, seg.block)
                .map_err(|e| log_failure(seg, e))?;
            block[seg.range()].copy_from_slice(&buf[seg.buf_range()]);
            state
                .store_block(&self.cache, seg.disk, seg.block, &block)
                .map_err(|e| log_failure(seg, e))?;
        }
        Ok(buf.len())
    }
}

impl<S: Read + Write + Send> Volume<JbodClient<S>> {
    /// 断开与服务器的连接. 之后的所有操作都会立即失败
    pub fn disconnect(&self) {
        let mut state = self.state.lock();
        state.device.disconnect();
        state.forget_head();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemJbod;
    use crate::jbod::{Address, DISK_SIZE};

    fn ready_volume(cache_entries: Option<usize>) -> Volume<MemJbod> {
        let volume = Volume::new(MemJbod::new());
        if let Some(entries) = cache_entries {
            volume.cache_create(entries).unwrap();
        }
        volume.mount().unwrap();
        volume.write_permission().unwrap();
        volume
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31) ^ seed).collect()
    }

    /// 在第 `after` 次 ReadBlock 之后让所有 ReadBlock 失败
    struct FlakyReads {
        inner: MemJbod,
        after: usize,
    }

    impl JbodDevice for FlakyReads {
        fn execute(&mut self, request: Request, block: Option<&mut Block>) -> Result<()> {
            if request.command == Command::ReadBlock
                && self.inner.op_count(Command::ReadBlock) >= self.after
            {
                return Err(JbodError::Server(Command::ReadBlock));
            }
            self.inner.execute(request, block)
        }
    }

    #[test]
    fn bounds_are_rejected_without_remote_calls() {
        let volume = ready_volume(None);
        let before = volume.with_device(|jbod| jbod.total_ops());

        let mut big = vec![0u8; MAX_IO_SIZE + 1];
        assert!(matches!(
            volume.read_at(0, &mut big),
            Err(JbodError::TooLong(2049))
        ));
        assert!(matches!(
            volume.write_at(0, &big),
            Err(JbodError::TooLong(2049))
        ));
        let tail = (VOLUME_SIZE - 8) as u32;
        assert!(matches!(
            volume.read(tail, 9),
            Err(JbodError::OutOfRange { len: 9, .. })
        ));
        assert!(matches!(
            volume.write_at(tail, &[0u8; 9]),
            Err(JbodError::OutOfRange { .. })
        ));

        assert_eq!(volume.with_device(|jbod| jbod.total_ops()), before);
    }

    #[test]
    fn state_is_checked_locally() {
        let volume = Volume::new(MemJbod::new());
        assert!(matches!(volume.read(0, 16), Err(JbodError::NotMounted)));
        assert!(matches!(
            volume.write_at(0, &[1, 2, 3]),
            Err(JbodError::NotMounted)
        ));
        assert_eq!(volume.with_device(|jbod| jbod.total_ops()), 0);

        volume.mount().unwrap();
        assert!(volume.is_mounted());
        assert!(matches!(
            volume.write_at(0, &[1, 2, 3]),
            Err(JbodError::NotWritable)
        ));
        // 重复挂载被服务器拒绝, 本地状态不变
        assert!(matches!(
            volume.mount(),
            Err(JbodError::Server(Command::Mount))
        ));
        assert!(volume.is_mounted());

        volume.write_permission().unwrap();
        assert!(volume.is_writable());
        volume.write_at(0, &[1, 2, 3]).unwrap();
        volume.revoke_write_permission().unwrap();
        assert!(matches!(
            volume.write_at(0, &[1, 2, 3]),
            Err(JbodError::NotWritable)
        ));
        assert_eq!(volume.read(0, 3).unwrap(), vec![1, 2, 3]);

        volume.unmount().unwrap();
        assert!(matches!(volume.read(0, 3), Err(JbodError::NotMounted)));
    }

    #[test]
    fn zero_length_is_trivial() {
        let volume = ready_volume(None);
        let before = volume.with_device(|jbod| jbod.total_ops());
        assert_eq!(volume.read_at(100, &mut []).unwrap(), 0);
        assert_eq!(volume.write_at(100, &[]).unwrap(), 0);
        assert_eq!(volume.with_device(|jbod| jbod.total_ops()), before);
    }

    #[test]
    fn round_trip_within_block() {
        let volume = ready_volume(None);
        let data = pattern(100, 0x3C);
        assert_eq!(volume.write_at(20, &data).unwrap(), 100);
        assert_eq!(volume.read(20, 100).unwrap(), data);
        assert_eq!(volume.with_device(|jbod| jbod.peek(0, 0)[20]), data[0]);
    }

    #[test]
    fn round_trip_across_block_and_disk_boundaries() {
        for cache in [None, Some(2), Some(64)] {
            let volume = ready_volume(cache);
            let block_edge = 3 * BLOCK_SIZE as u32 - 10;
            let disk_edge = Address {
                disk: 6,
                block: 255,
                byte: 100,
            }
            .linear();
            for (offset, len) in [(block_edge, 700), (disk_edge, MAX_IO_SIZE), (0, 1)] {
                let data = pattern(len, offset as u8);
                assert_eq!(volume.write_at(offset, &data).unwrap(), len);
                assert_eq!(volume.read(offset, len).unwrap(), data, "cache {:?}", cache);
            }
            // 跨盘写落在两个磁盘上
            volume.with_device(|jbod| {
                assert_ne!(jbod.peek(6, 255), &[0u8; BLOCK_SIZE]);
                assert_ne!(jbod.peek(7, 0), &[0u8; BLOCK_SIZE]);
            });
        }
    }

    #[test]
    fn partial_write_preserves_neighbours() {
        let volume = ready_volume(Some(8));
        let base = pattern(3 * BLOCK_SIZE, 0x77);
        volume.write_at(0, &base).unwrap();
        volume.write_at(250, &[0xEE; 12]).unwrap();

        let mut expected = base.clone();
        expected[250..262].copy_from_slice(&[0xEE; 12]);
        assert_eq!(volume.read(0, 3 * BLOCK_SIZE).unwrap(), expected);
    }

    #[test]
    fn end_of_volume_is_reachable() {
        let volume = ready_volume(None);
        let offset = (VOLUME_SIZE - 16) as u32;
        volume.write_at(offset, &[0xAB; 16]).unwrap();
        assert_eq!(volume.read(offset, 16).unwrap(), vec![0xAB; 16]);
        assert_eq!(
            volume.with_device(|jbod| jbod.peek(15, 255)[240..].to_vec()),
            vec![0xAB; 16]
        );
    }

    #[test]
    fn cached_blocks_skip_remote_reads() {
        let volume = ready_volume(Some(16));
        let offset = DISK_SIZE as u32 * 2 + 128;
        let data = pattern(1000, 1);
        volume.write_at(offset, &data).unwrap();
        let reads = volume.with_device(|jbod| jbod.op_count(Command::ReadBlock));

        assert_eq!(volume.read(offset, 1000).unwrap(), data);
        assert_eq!(
            volume.with_device(|jbod| jbod.op_count(Command::ReadBlock)),
            reads
        );
        let stats = volume.cache().lock().stats();
        assert!(stats.hits >= 5);
    }

    #[test]
    fn hits_keep_sequential_misses_consistent() {
        let volume = ready_volume(Some(4));
        let data = pattern(MAX_IO_SIZE, 9);
        volume.write_at(0, &data).unwrap();

        // 只有中间的块在缓存里: 命中与未命中交错
        volume.cache_destroy().unwrap();
        volume.cache_create(4).unwrap();
        volume.read(BLOCK_SIZE as u32 * 2, 10).unwrap();
        volume.read(BLOCK_SIZE as u32 * 4, 10).unwrap();
        assert_eq!(volume.read(0, MAX_IO_SIZE).unwrap(), data);
    }

    #[test]
    fn remote_failure_aborts_the_whole_read() {
        let volume = Volume::new(FlakyReads {
            inner: MemJbod::new(),
            after: usize::MAX,
        });
        volume.mount().unwrap();
        volume.write_permission().unwrap();
        let data = pattern(1024, 5);
        volume.write_at(0, &data).unwrap();

        volume.with_device(|dev| dev.after = dev.inner.op_count(Command::ReadBlock) + 2);
        assert!(matches!(
            volume.read(0, 1024),
            Err(JbodError::Server(Command::ReadBlock))
        ));

        // 失败后磁头位置不可信, 恢复之后仍能正确读取
        volume.with_device(|dev| dev.after = usize::MAX);
        assert_eq!(volume.read(0, 1024).unwrap(), data);
    }

    /// 在第 `after` 次 WriteBlock 之后让所有 WriteBlock 失败
    struct FlakyWrites {
        inner: MemJbod,
        after: usize,
    }

    impl JbodDevice for FlakyWrites {
        fn execute(&mut self, request: Request, block: Option<&mut Block>) -> Result<()> {
            if request.command == Command::WriteBlock
                && self.inner.op_count(Command::WriteBlock) >= self.after
            {
                return Err(JbodError::Server(Command::WriteBlock));
            }
            self.inner.execute(request, block)
        }
    }

    #[test]
    fn remote_failure_aborts_the_whole_write() {
        let volume = Volume::new(FlakyWrites {
            inner: MemJbod::new(),
            after: 2,
        });
        volume.mount().unwrap();
        volume.write_permission().unwrap();
        let data = pattern(4 * BLOCK_SIZE, 0x42);
        assert!(matches!(
            volume.write_at(0, &data),
            Err(JbodError::Server(Command::WriteBlock))
        ));
        volume.with_device(|dev| {
            assert_eq!(dev.inner.peek(0, 1), &data[BLOCK_SIZE..2 * BLOCK_SIZE]);
            assert_eq!(dev.inner.peek(0, 2), &[0u8; BLOCK_SIZE]);
        });

        volume.with_device(|dev| dev.after = usize::MAX);
        assert_eq!(volume.write_at(0, &data).unwrap(), data.len());
        assert_eq!(volume.read(0, data.len()).unwrap(), data);
    }

    #[test]
    fn head_is_forgotten_past_the_last_block() {
        let volume = ready_volume(None);
        let last = Address {
            disk: 3,
            block: 255,
            byte: 0,
        }
        .linear();
        volume.read(last, 4).unwrap();
        let seeks = volume.with_device(|jbod| jbod.op_count(Command::SeekToDisk));
        volume.read(last, 4).unwrap();
        assert_eq!(
            volume.with_device(|jbod| jbod.op_count(Command::SeekToDisk)),
            seeks + 1
        );
    }

    #[test]
    fn volumes_can_share_a_cache() {
        let cache = BlockCache::with_capacity(8).unwrap().shared();
        let a = Volume::with_cache(MemJbod::new(), cache.clone());
        a.mount().unwrap();
        a.read(0, 10).unwrap();
        assert_eq!(cache.lock().queries(), 1);
        assert!(a.cache_create(8).is_err());
    }
}
