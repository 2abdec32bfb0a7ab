/// HTTP/1.x 报文头的读取与解析
///
/// 只读取到第一个 `\r\n\r\n` 为止，超出报文头的字节原样返回给调用者，
/// 由调用者决定如何回放（见 [`crate::stream::PrefixedStream`]）。
use crate::error::{DialError, Result};
use bytes::{Bytes, BytesMut};
use http::{Method, StatusCode};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// HTTP 报文头最大大小（8KB）
pub const MAX_HEAD_SIZE: usize = 8 * 1024;

/// 单次读取的缓冲区大小
const READ_CHUNK_SIZE: usize = 2048;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// 读取一个完整的 HTTP 报文头
///
/// 返回 `(head, rest)`：`head` 包含结尾的空行，`rest` 是同一次读取中
/// 多读到的后续字节。
pub async fn read_head<R>(reader: &mut R, limit: usize) -> io::Result<(Bytes, Bytes)>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(READ_CHUNK_SIZE);
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Unexpected EOF while reading HTTP head",
            ));
        }

        // 只需从上次结尾前 3 个字节处继续查找
        let search_from = buffer.len().saturating_sub(HEAD_TERMINATOR.len() - 1);
        buffer.extend_from_slice(&chunk[..n]);

        if let Some(pos) = find_terminator(&buffer[search_from..]) {
            let head_len = search_from + pos + HEAD_TERMINATOR.len();
            let mut head = buffer;
            let rest = head.split_off(head_len);
            return Ok((head.freeze(), rest.freeze()));
        }

        if buffer.len() >= limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("HTTP head exceeds {} bytes", limit),
            ));
        }
    }
}

fn find_terminator(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(HEAD_TERMINATOR.len())
        .position(|window| window == HEAD_TERMINATOR)
}

/// 解析后的请求头
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// 按名称（不区分大小写）查找首个请求头
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// 解析请求行和请求头
pub fn parse_request_head(head: &[u8]) -> Result<RequestHead> {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.lines().skip_while(|line| line.is_empty());

    let request_line = lines
        .next()
        .ok_or_else(|| DialError::invalid_request("Empty HTTP request"))?;
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() != 3 || !parts[2].starts_with("HTTP/") {
        return Err(DialError::invalid_request(format!(
            "Invalid HTTP request line: {}",
            request_line
        )));
    }

    let method = Method::from_bytes(parts[0].as_bytes())
        .map_err(|_| DialError::invalid_request(format!("Invalid HTTP method: {}", parts[0])))?;

    let headers = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| {
            line.split_once(':')
                .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        })
        .collect();

    Ok(RequestHead {
        method,
        target: parts[1].to_string(),
        headers,
    })
}

/// 解析后的状态行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub version: String,
    pub code: u16,
    pub reason: Option<String>,
}

impl StatusLine {
    pub fn is_success(&self) -> bool {
        self.code == StatusCode::OK.as_u16()
    }
}

/// 解析响应报文头的状态行
///
/// 原因短语可以缺失（例如 `HTTP/1.1 403`），此时 `reason` 为 `None`。
pub fn parse_status_line(head: &[u8]) -> Result<StatusLine> {
    let text = String::from_utf8_lossy(head);
    let line = text
        .lines()
        .find(|line| !line.is_empty())
        .ok_or_else(|| DialError::MalformedResponse("empty status line".to_string()))?;

    let (version, status) = line
        .split_once(' ')
        .ok_or_else(|| DialError::MalformedResponse(format!("malformed status line: {}", line)))?;
    if !version.starts_with("HTTP/") {
        return Err(DialError::MalformedResponse(format!(
            "malformed HTTP version: {}",
            version
        )));
    }

    // 状态码与原因短语只在第一个空格处拆分
    let status = status.trim_start();
    let (code, reason) = match status.split_once(' ') {
        Some((code, reason)) => (code, reason.trim()),
        None => (status, ""),
    };
    let code = StatusCode::from_bytes(code.as_bytes())
        .map_err(|_| DialError::MalformedResponse(format!("malformed status code: {}", code)))?;

    Ok(StatusLine {
        version: version.to_string(),
        code: code.as_u16(),
        reason: (!reason.is_empty()).then(|| reason.to_string()),
    })
}
