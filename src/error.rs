/// 自定义错误类型
///
/// 使用 thiserror 区分传输层错误、代理拒绝、握手失败与请求校验错误，
/// 调用者可以据此区分 "代理不可达" 和 "代理可达但拒绝"
use std::io;
use thiserror::Error;

/// 拨号与代理隧道的主要错误类型
#[derive(Error, Debug)]
pub enum DialError {
    /// TCP 连接失败
    #[error("Failed to connect to {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 代理返回的不是合法的 HTTP 响应
    #[error("Malformed proxy response: {0}")]
    MalformedResponse(String),

    /// 代理可达，但 CONNECT 未返回 200
    #[error("Unable to proxy connection, unexpected StatusCode {status}{}", format_reason(.reason))]
    ProxyRejected {
        status: u16,
        reason: Option<String>,
    },

    /// 不支持的网络类型
    #[error("Unsupported network '{0}', expected tcp, tcp4 or tcp6")]
    UnsupportedNetwork(String),

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// SSH 握手失败
    #[error("SSH handshake failed: {0}")]
    Handshake(#[from] russh::Error),

    /// 私钥加载失败
    #[error("Key error: {0}")]
    Key(#[from] russh_keys::Error),

    /// 认证失败
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// 服务器主机密钥被拒绝
    #[error("Host key rejected for {0}")]
    HostKeyRejected(String),

    /// 底层连接不支持劫持
    #[error("unable to hijack connection")]
    HijackUnsupported,

    /// CONNECT 请求校验失败
    #[error("{0}")]
    InvalidRequest(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

fn format_reason(reason: &Option<String>) -> String {
    match reason {
        Some(text) => format!(": {}", text),
        None => String::new(),
    }
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, DialError>;

impl DialError {
    /// 创建连接失败错误
    pub fn connection_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::ConnectionFailed {
            addr: addr.into(),
            source,
        }
    }

    /// 创建代理拒绝错误
    pub fn proxy_rejected(status: u16, reason: Option<String>) -> Self {
        Self::ProxyRejected { status, reason }
    }

    /// 创建请求校验错误
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// 创建认证失败错误
    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthenticationFailed(msg.into())
    }

    /// TCP 建连超时，归入连接失败
    pub fn connect_timeout(addr: impl Into<String>, duration: std::time::Duration) -> Self {
        Self::connection_failed(
            addr,
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timed out after {:?}", duration),
            ),
        )
    }

    /// 创建超时错误
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 是否为传输层错误（连接、读写失败或代理响应不可解析）
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. } | Self::Io(_) | Self::MalformedResponse(_)
        )
    }

    /// 是否为代理拒绝
    pub fn is_proxy_rejected(&self) -> bool {
        matches!(self, Self::ProxyRejected { .. })
    }

    /// 是否为请求校验错误
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidRequest(_))
    }

    /// 检查是否为超时错误（包括 TCP 建连超时）
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::ConnectionFailed { source, .. } => source.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// 检查是否为认证失败
    pub fn is_auth_failed(&self) -> bool {
        matches!(self, Self::AuthenticationFailed(_))
    }

    /// 返回 CONNECT 响应的状态码（仅代理拒绝时有值）
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ProxyRejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}
