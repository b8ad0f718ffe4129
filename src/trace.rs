//! 工作负载回放: 逐行读取 trace 文件并在卷上执行
//!
//! ```text
//! # 注释与空行被忽略
//! MOUNT
//! WRITE_PERMIT
//! WRITE 0x1f0 32 0xaa     # 把 [0x1f0, 0x210) 填成 0xaa
//! READ 0x1f0 32
//! REVOKE_WRITE_PERMIT
//! UNMOUNT
//! ```

use std::io::{self, BufRead, Write};

use log::{error, info};
use thiserror::Error;

use crate::jbod::{JbodDevice, JbodError, Volume, MAX_IO_SIZE};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TraceOp {
    Mount,
    Unmount,
    WritePermit,
    RevokeWritePermit,
    Read { addr: u32, len: usize },
    Write { addr: u32, len: usize, byte: u8 },
}

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("cannot read trace: {0}")]
    Io(#[from] io::Error),
    #[error("line {line}: cannot parse `{text}`")]
    Parse { line: usize, text: String },
}

fn number<T: TryFrom<u64>>(token: &str) -> Option<T> {
    let value = match token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok()?,
        None => token.parse().ok()?,
    };
    T::try_from(value).ok()
}

fn parse_tokens(tokens: &[&str]) -> Option<TraceOp> {
    match tokens {
        ["MOUNT"] => Some(TraceOp::Mount),
        ["UNMOUNT"] => Some(TraceOp::Unmount),
        ["WRITE_PERMIT"] => Some(TraceOp::WritePermit),
        ["REVOKE_WRITE_PERMIT"] => Some(TraceOp::RevokeWritePermit),
        ["READ", addr, len] => Some(TraceOp::Read {
            addr: number(addr)?,
            len: number(len)?,
        }),
        ["WRITE", addr, len, byte] => Some(TraceOp::Write {
            addr: number(addr)?,
            len: number(len)?,
            byte: number(byte)?,
        }),
        _ => None,
    }
}

/// 解析第 `line_no` 行, 注释和空行返回 Ok(None)
pub fn parse_line(line_no: usize, line: &str) -> Result<Option<TraceOp>, TraceError> {
    let body = line.split('#').next().unwrap_or("").trim();
    if body.is_empty() {
        return Ok(None);
    }
    let tokens: Vec<&str> = body.split_whitespace().collect();
    match parse_tokens(&tokens) {
        Some(op) => Ok(Some(op)),
        None => Err(TraceError::Parse {
            line: line_no,
            text: line.to_string(),
        }),
    }
}

/// 解析整个 trace
pub fn parse<R: BufRead>(reader: R) -> Result<Vec<TraceOp>, TraceError> {
    let mut ops = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        if let Some(op) = parse_line(idx + 1, &line?)? {
            ops.push(op);
        }
    }
    Ok(ops)
}

/// 回放结果
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub executed: usize,
    pub failed: usize,
}

/// 在卷上依次执行 `ops`; READ 的结果以十六进制写到 `out`.
/// 某条命令失败只会被记录, 回放继续进行.
pub fn replay<D: JbodDevice, W: Write>(
    volume: &Volume<D>,
    ops: &[TraceOp],
    out: &mut W,
) -> io::Result<Summary> {
    let mut summary = Summary::default();
    for op in ops {
        summary.executed += 1;
        let outcome = match op {
            TraceOp::Mount => volume.mount(),
            TraceOp::Unmount => volume.unmount(),
            TraceOp::WritePermit => volume.write_permission(),
            TraceOp::RevokeWritePermit => volume.revoke_write_permission(),
            TraceOp::Read { addr, len } => match volume.read(*addr, *len) {
                Ok(data) => {
                    let hex: Vec<String> = data.iter().map(|b| format!("{:02x}", b)).collect();
                    writeln!(out, "{:#07x} {}", addr, hex.join(""))?;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            TraceOp::Write { len, .. } if *len > MAX_IO_SIZE => Err(JbodError::TooLong(*len)),
            TraceOp::Write { addr, len, byte } => {
                volume.write_at(*addr, &vec![*byte; *len]).map(|_| ())
            }
        };
        if let Err(e) = outcome {
            error!("{:?} failed: {}", op, e);
            summary.failed += 1;
        }
    }
    info!(
        "replayed {} commands, {} failed",
        summary.executed, summary.failed
    );
    Ok(summary)
}
