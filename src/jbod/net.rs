//! JBOD 网络协议: 传输层 + 报文封装
//!
//! 每个报文都以 5 字节的协议头开始:
//!
//! ```text
//! +--------+--------+--------+--------+--------+=====================+
//! |        command word (big-endian)  |  info  | block (256 B, opt.) |
//! +--------+--------+--------+--------+--------+=====================+
//! ```
//!
//! - 请求: 只有 WriteBlock 携带数据块, 此时 info 为 2, 否则为 0
//! - 响应: info 的最低位表示服务器端操作失败; info > 1 表示头部之后跟着一个数据块
//!
//! 一条连接上同一时刻只有一个请求: 发送请求, 然后阻塞等待完整的响应.

use std::io::{self, ErrorKind, Read, Write};
use std::net::TcpStream;

use log::{debug, info, trace, warn};

use super::{Block, Command, JbodDevice, JbodError, Request, Result, BLOCK_SIZE, HEADER_LEN};

/// 响应头中的失败位
const INFO_FAILED: u8 = 0x1;
/// 请求/响应头之后跟着一个数据块
const INFO_BLOCK: u8 = 0x2;

/// 读满 `buf`, 直到全部读完或者遇到硬错误
///
/// 底层的 read 可能只返回一部分数据, 这里不断地从新的偏移处继续读.
/// 对端在读满之前关闭连接视为错误.
pub fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<()> {
    let mut pos = 0;
    while pos < buf.len() {
        match reader.read(&mut buf[pos..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("peer closed after {} of {} bytes", pos, buf.len()),
                ))
            }
            Ok(n) => pos += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// 写完 `buf`, 直到全部写完或者遇到硬错误
pub fn write_full<W: Write + ?Sized>(writer: &mut W, buf: &[u8]) -> io::Result<()> {
    let mut pos = 0;
    while pos < buf.len() {
        match writer.write(&buf[pos..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    format!("wrote {} of {} bytes", pos, buf.len()),
                ))
            }
            Ok(n) => pos += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    writer.flush()
}

fn header(word: u32, info: u8) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&word.to_be_bytes());
    header[4] = info;
    header
}

fn split_header(header: &[u8; HEADER_LEN]) -> (u32, u8) {
    let word = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    (word, header[4])
}

/// 把请求编码成报文; `block` 只在 WriteBlock 时存在
pub fn encode_request(request: &Request, block: Option<&Block>) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HEADER_LEN + BLOCK_SIZE);
    match block {
        Some(block) => {
            packet.extend_from_slice(&header(request.pack(), INFO_BLOCK));
            packet.extend_from_slice(block);
        }
        None => packet.extend_from_slice(&header(request.pack(), 0)),
    }
    packet
}

/// 服务器端: 读取一个请求报文, 返回请求以及可能携带的数据块
pub fn decode_request<R: Read + ?Sized>(reader: &mut R) -> Result<(Request, Option<Block>)> {
    let mut raw = [0u8; HEADER_LEN];
    read_full(reader, &mut raw)?;
    let (word, info) = split_header(&raw);
    let request = Request::unpack(word)?;
    let block = if info & INFO_BLOCK != 0 {
        let mut block = [0u8; BLOCK_SIZE];
        read_full(reader, &mut block)?;
        Some(block)
    } else {
        None
    };
    Ok((request, block))
}

/// 解码后的响应
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Response {
    /// 服务器回显的命令字
    pub word: u32,
    pub info: u8,
}

impl Response {
    pub fn failed(&self) -> bool {
        self.info & INFO_FAILED != 0
    }

    pub fn has_block(&self) -> bool {
        self.info > 1
    }
}

/// 服务器端: 把执行结果编码成响应报文
pub fn encode_response(request: &Request, outcome: &Result<()>, block: Option<&Block>) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HEADER_LEN + BLOCK_SIZE);
    match (outcome, block) {
        (Err(_), _) => packet.extend_from_slice(&header(request.pack(), INFO_FAILED)),
        (Ok(()), Some(block)) => {
            packet.extend_from_slice(&header(request.pack(), INFO_BLOCK));
            packet.extend_from_slice(block);
        }
        (Ok(()), None) => packet.extend_from_slice(&header(request.pack(), 0)),
    }
    packet
}

/// 客户端: 读取一个响应报文
///
/// 头部表明后面有数据块时, 数据块被读进 `block`;
/// 调用者没有提供缓冲区时也会读出并丢弃, 保证后续报文的边界正确.
pub fn decode_response<R: Read + ?Sized>(
    reader: &mut R,
    block: Option<&mut Block>,
) -> Result<Response> {
    let mut raw = [0u8; HEADER_LEN];
    read_full(reader, &mut raw)?;
    let (word, info) = split_header(&raw);
    let response = Response { word, info };
    if response.has_block() {
        let mut scratch = [0u8; BLOCK_SIZE];
        let dst = match block {
            Some(block) => block,
            None => &mut scratch,
        };
        read_full(reader, dst)?;
    }
    Ok(response)
}

/// 连接到 JBOD 服务器的客户端
///
/// `stream` 为 None 表示未连接. 未连接时所有操作立即失败, 不做任何传输.
pub struct JbodClient<S: Read + Write = TcpStream> {
    stream: Option<S>,
}

impl JbodClient<TcpStream> {
    /// 连接到 `host:port`
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;
        info!("connected to JBOD server {}:{}", host, port);
        Ok(Self::from_stream(stream))
    }
}

impl<S: Read + Write> JbodClient<S> {
    /// 在已经建立的字节流上工作
    pub fn from_stream(stream: S) -> Self {
        Self {
            stream: Some(stream),
        }
    }

    /// 一个未连接的客户端
    pub fn disconnected() -> Self {
        Self { stream: None }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// 关闭连接; 再次调用没有效果
    pub fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            info!("disconnected from JBOD server");
        }
    }

    /// 发送请求, 阻塞直到收到完整的响应.
    /// 服务器报告失败时返回 [`JbodError::Server`]; 传输失败时连接处于不确定状态, 调用者应断开重连.
    pub fn operation(&mut self, request: Request, mut block: Option<&mut Block>) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(JbodError::Disconnected)?;

        let payload = match (request.command, block.as_deref()) {
            (Command::WriteBlock, Some(block)) => Some(block),
            _ => None,
        };
        trace!("-> {}", request);
        write_full(stream, &encode_request(&request, payload))?;

        let recv_block = match request.command {
            Command::ReadBlock => block.as_deref_mut(),
            _ => None,
        };
        let response = decode_response(stream, recv_block)?;
        if response.word != request.pack() {
            warn!(
                "response word {:#06x} does not echo request {:#06x}",
                response.word,
                request.pack()
            );
        }
        if response.failed() {
            debug!("<- {} failed (info {:#x})", request, response.info);
            return Err(JbodError::Server(request.command));
        }
        trace!("<- {} ok", request);
        Ok(())
    }
}

impl<S: Read + Write> Drop for JbodClient<S> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl<S: Read + Write + Send> JbodDevice for JbodClient<S> {
    fn execute(&mut self, request: Request, block: Option<&mut Block>) -> Result<()> {
        self.operation(request, block)
    }
}

/// 服务器端循环: 在 `stream` 上不断读取请求, 交给 `device` 执行并写回响应,
/// 直到对端关闭连接.
pub fn serve<S, D>(mut stream: S, device: &mut D) -> Result<()>
where
    S: Read + Write,
    D: JbodDevice + ?Sized,
{
    loop {
        let (request, block) = match decode_request(&mut stream) {
            Ok(decoded) => decoded,
            Err(JbodError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                debug!("client closed the connection");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        // 没有携带数据块的 WriteBlock 交给设备时 block 为 None, 由设备拒绝
        let mut payload = block;
        let mut scratch = [0u8; BLOCK_SIZE];
        let outcome = match request.command {
            Command::ReadBlock => device.execute(request, Some(&mut scratch)),
            Command::WriteBlock => device.execute(request, payload.as_mut()),
            _ => device.execute(request, None),
        };
        let reply = match request.command {
            Command::ReadBlock => Some(&scratch),
            _ => None,
        };
        write_full(&mut stream, &encode_response(&request, &outcome, reply))?;
    }
}
