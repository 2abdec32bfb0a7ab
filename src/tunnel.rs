/// HTTP CONNECT 隧道握手
///
/// 连接代理服务器，发送 `CONNECT <target> HTTP/1.1`，读取响应状态行。
/// 只有状态码 200 才返回可用的字节管道，其余情况连接都会被关闭。
use crate::error::{DialError, Result};
use crate::http_head::{self, StatusLine, MAX_HEAD_SIZE};
use crate::stream::PrefixedStream;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// CONNECT 请求携带的 User-Agent
const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// 已建立的代理隧道
pub type TunnelStream = PrefixedStream<TcpStream>;

/// 代理响应状态
pub type TunnelStatus = StatusLine;

/// 一次 CONNECT 尝试
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    proxy_addr: String,
    target_addr: String,
    connect_timeout: Option<Duration>,
}

impl TunnelRequest {
    pub fn new(proxy_addr: impl Into<String>, target_addr: impl Into<String>) -> Self {
        Self {
            proxy_addr: proxy_addr.into(),
            target_addr: target_addr.into(),
            connect_timeout: None,
        }
    }

    /// 限制连接代理的 TCP 建连时间（不影响隧道建立后的读写）
    pub fn with_connect_timeout(mut self, connect_timeout: Option<Duration>) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn proxy_addr(&self) -> &str {
        &self.proxy_addr
    }

    pub fn target_addr(&self) -> &str {
        &self.target_addr
    }

    /// CONNECT 请求报文，请求目标原样写入，不做 URL 编码
    pub fn encode(&self) -> String {
        format!(
            "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nUser-Agent: {agent}\r\n\r\n",
            target = self.target_addr,
            agent = USER_AGENT
        )
    }

    /// 执行握手，成功时返回透明的字节管道
    pub async fn establish(self) -> Result<TunnelStream> {
        self.validate_target()?;
        let mut stream = self.open().await?;

        debug!(
            "Sending CONNECT {} to proxy {}",
            self.target_addr, self.proxy_addr
        );
        stream.write_all(self.encode().as_bytes()).await?;
        stream.flush().await?;

        let (head, rest) = http_head::read_head(&mut stream, MAX_HEAD_SIZE).await?;
        let status = http_head::parse_status_line(&head)?;

        if !status.is_success() {
            warn!(
                "Proxy {} refused CONNECT {}: {} {}",
                self.proxy_addr,
                self.target_addr,
                status.code,
                status.reason.as_deref().unwrap_or("")
            );
            // stream 在此处 drop，连接随之关闭
            return Err(DialError::proxy_rejected(status.code, status.reason));
        }

        info!(
            "Proxy {} established tunnel to {}",
            self.proxy_addr, self.target_addr
        );
        Ok(PrefixedStream::new(rest, stream))
    }

    /// 目标原样写入请求行和 Host 头，不能含空白或控制字符
    fn validate_target(&self) -> Result<()> {
        let target = self.target_addr.as_str();
        if target.is_empty() || target.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(DialError::invalid_request(format!(
                "Invalid CONNECT target {:?}",
                target
            )));
        }
        Ok(())
    }

    async fn open(&self) -> Result<TcpStream> {
        let connect = TcpStream::connect(self.proxy_addr.as_str());
        let result = match self.connect_timeout {
            Some(duration) => timeout(duration, connect)
                .await
                .map_err(|_| DialError::connect_timeout(&self.proxy_addr, duration))?,
            None => connect.await,
        };

        let stream = result.map_err(|e| DialError::connection_failed(&self.proxy_addr, e))?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
        Ok(stream)
    }
}

/// 通过 `proxy_addr` 建立到 `target_addr` 的 CONNECT 隧道
pub async fn connect(proxy_addr: &str, target_addr: &str) -> Result<TunnelStream> {
    TunnelRequest::new(proxy_addr, target_addr).establish().await
}
