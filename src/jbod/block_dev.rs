//! JBOD 设备仅支持以块为单位的原语操作 (挂载, 寻道, 读块, 写块, 写权限),
//! 需要由具体的设备来实现. I/O 层会调用这些原语, 把字节区间的读写翻译成一串块操作.
//! 泛用性: 可以访问实现了 JbodDevice Trait 的任何设备, 无论是远程服务器还是内存中的模拟.

use std::fmt;

use super::{Block, JbodError, Result};

/// JBOD 命令码, 占命令字的 bits 12-15
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    Mount = 0,
    Unmount = 1,
    SeekToDisk = 2,
    SeekToBlock = 3,
    ReadBlock = 4,
    WriteBlock = 5,
    WritePermission = 6,
    RevokeWritePermission = 7,
}

impl Command {
    pub const ALL: [Command; 8] = [
        Command::Mount,
        Command::Unmount,
        Command::SeekToDisk,
        Command::SeekToBlock,
        Command::ReadBlock,
        Command::WriteBlock,
        Command::WritePermission,
        Command::RevokeWritePermission,
    ];
}

impl TryFrom<u8> for Command {
    type Error = JbodError;

    fn try_from(code: u8) -> Result<Self> {
        Command::ALL
            .iter()
            .copied()
            .find(|command| *command as u8 == code)
            .ok_or(JbodError::UnknownCommand(code))
    }
}

/// 结构化的请求: 只在协议边界才会被打包成 32 位命令字
///
/// 命令字布局: `command << 12 | disk << 8 | block`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    /// 仅 SeekToDisk 使用
    pub disk: u8,
    /// 仅 SeekToBlock 使用
    pub block: u8,
}

impl Request {
    fn bare(command: Command) -> Self {
        Self {
            command,
            disk: 0,
            block: 0,
        }
    }

    pub fn mount() -> Self {
        Self::bare(Command::Mount)
    }

    pub fn unmount() -> Self {
        Self::bare(Command::Unmount)
    }

    pub fn write_permission() -> Self {
        Self::bare(Command::WritePermission)
    }

    pub fn revoke_write_permission() -> Self {
        Self::bare(Command::RevokeWritePermission)
    }

    pub fn seek_to_disk(disk: u8) -> Self {
        Self {
            disk,
            ..Self::bare(Command::SeekToDisk)
        }
    }

    pub fn seek_to_block(block: u8) -> Self {
        Self {
            block,
            ..Self::bare(Command::SeekToBlock)
        }
    }

    pub fn read_block() -> Self {
        Self::bare(Command::ReadBlock)
    }

    pub fn write_block() -> Self {
        Self::bare(Command::WriteBlock)
    }

    /// 打包成线上的 32 位命令字. disk 字段只有 4 bit
    pub fn pack(&self) -> u32 {
        ((self.command as u32) << 12) | (((self.disk & 0xF) as u32) << 8) | self.block as u32
    }

    /// 从命令字中解出请求, 未知的命令码会被拒绝
    pub fn unpack(word: u32) -> Result<Self> {
        let command = Command::try_from(((word >> 12) & 0xF) as u8)?;
        Ok(Self {
            command,
            disk: ((word >> 8) & 0xF) as u8,
            block: (word & 0xFF) as u8,
        })
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.command {
            Command::SeekToDisk => write!(f, "SeekToDisk({})", self.disk),
            Command::SeekToBlock => write!(f, "SeekToBlock({})", self.block),
            command => write!(f, "{:?}", command),
        }
    }
}

/// JBOD 设备接口层
///
/// 一次 execute 对应一次完整的请求/响应往返.
/// - ReadBlock: 成功后 `block` 中是当前块的内容
/// - WriteBlock: `block` 中是要写入当前块的内容
/// - 其余命令不使用 `block`
///
/// 设备拒绝操作时返回 [`JbodError::Server`].
pub trait JbodDevice: Send {
    fn execute(&mut self, request: Request, block: Option<&mut Block>) -> Result<()>;
}

impl<D: JbodDevice + ?Sized> JbodDevice for Box<D> {
    fn execute(&mut self, request: Request, block: Option<&mut Block>) -> Result<()> {
        (**self).execute(request, block)
    }
}
