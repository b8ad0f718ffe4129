//! 内存中的 JBOD: 模拟服务器端的磁盘阵列
//!
//! 我们用一块内存来模拟 16 个磁盘, 并为它实现 JbodDevice 接口.
//! 它既可以直接交给 Volume 使用 (`--local`), 也可以通过 `serve` 挂在一条连接的另一端扮演服务器.

use crate::jbod::{
    Block, Command, JbodDevice, JbodError, Request, Result, BLOCKS_PER_DISK, BLOCK_SIZE,
    NUM_DISKS,
};

pub struct MemJbod {
    /// disk * BLOCKS_PER_DISK + block
    blocks: Vec<Block>,
    mounted: bool,
    writable: bool,
    disk: usize,
    block: usize,
    /// 每种命令执行过的次数, 以命令码为下标
    ops: [usize; 8],
}

impl Default for MemJbod {
    fn default() -> Self {
        Self::new()
    }
}

impl MemJbod {
    pub fn new() -> Self {
        Self {
            blocks: vec![[0u8; BLOCK_SIZE]; NUM_DISKS * BLOCKS_PER_DISK],
            mounted: false,
            writable: false,
            disk: 0,
            block: 0,
            ops: [0; 8],
        }
    }

    /// 某种命令被执行的次数 (包括失败的)
    pub fn op_count(&self, command: Command) -> usize {
        self.ops[command as usize]
    }

    /// 收到的请求总数
    pub fn total_ops(&self) -> usize {
        self.ops.iter().sum()
    }

    /// 不经过协议直接查看某个块, 用于校验
    pub fn peek(&self, disk: usize, block: usize) -> &Block {
        &self.blocks[disk * BLOCKS_PER_DISK + block]
    }

    /// 当前磁头位置
    pub fn head(&self) -> (usize, usize) {
        (self.disk, self.block)
    }

    fn current(&mut self) -> Option<&mut Block> {
        if self.block >= BLOCKS_PER_DISK {
            return None;
        }
        self.blocks.get_mut(self.disk * BLOCKS_PER_DISK + self.block)
    }

    fn apply(&mut self, request: Request, block: Option<&mut Block>) -> bool {
        match request.command {
            Command::Mount if self.mounted => false,
            Command::Mount => {
                self.mounted = true;
                self.disk = 0;
                self.block = 0;
                true
            }
            Command::Unmount if !self.mounted => false,
            Command::Unmount => {
                self.mounted = false;
                true
            }
            _ if !self.mounted => false,
            Command::WritePermission if self.writable => false,
            Command::WritePermission => {
                self.writable = true;
                true
            }
            Command::RevokeWritePermission if !self.writable => false,
            Command::RevokeWritePermission => {
                self.writable = false;
                true
            }
            Command::SeekToDisk if request.disk as usize >= NUM_DISKS => false,
            Command::SeekToDisk => {
                self.disk = request.disk as usize;
                true
            }
            Command::SeekToBlock => {
                self.block = request.block as usize;
                true
            }
            Command::ReadBlock => match (self.current().copied(), block) {
                (Some(data), Some(buf)) => {
                    buf.copy_from_slice(&data);
                    self.block += 1;
                    true
                }
                _ => false,
            },
            Command::WriteBlock if !self.writable => false,
            Command::WriteBlock => {
                let data = match block {
                    Some(data) => *data,
                    None => return false,
                };
                match self.current() {
                    Some(dst) => *dst = data,
                    None => return false,
                }
                self.block += 1;
                true
            }
        }
    }
}

impl JbodDevice for MemJbod {
    fn execute(&mut self, request: Request, block: Option<&mut Block>) -> Result<()> {
        self.ops[request.command as usize] += 1;
        if self.apply(request, block) {
            Ok(())
        } else {
            Err(JbodError::Server(request.command))
        }
    }
}
