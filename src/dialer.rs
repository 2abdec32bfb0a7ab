/// 拨号策略
///
/// `Dialer` 只有两种形态：直连，或通过 HTTP CONNECT 代理。形态在构造时
/// 根据环境变量选定一次，之后整个会话都使用同一个形态。
use crate::error::{DialError, Result};
use crate::ssh::{self, SshClient, SshClientConfig};
use crate::tunnel::TunnelRequest;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// 优先读取的安全代理环境变量
pub const HTTPS_PROXY_ENV: &str = "https_proxy";
/// 其次读取的普通代理环境变量
pub const HTTP_PROXY_ENV: &str = "http_proxy";

/// 建立 SSH 客户端连接的方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dialer {
    /// 直接连接目标
    Direct,
    /// 先通过代理建立 CONNECT 隧道
    Proxied { proxy_host: String },
}

impl Dialer {
    /// 根据 `https_proxy` / `http_proxy` 选择拨号方式
    ///
    /// 每次调用都会重新读取环境变量，需要一致决策的调用者应调用一次并复用结果。
    pub fn from_environment() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// 使用自定义的变量查询函数选择拨号方式
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let proxy_addr = [HTTPS_PROXY_ENV, HTTP_PROXY_ENV]
            .iter()
            .filter_map(|name| lookup(name))
            .map(|value| value.trim().to_string())
            .find(|value| !value.is_empty());

        match proxy_addr {
            Some(value) => {
                let proxy_host = normalize_proxy_addr(&value);
                debug!("Using HTTP CONNECT proxy {}", proxy_host);
                Dialer::Proxied { proxy_host }
            }
            None => {
                debug!("No proxy configured, dialing directly");
                Dialer::Direct
            }
        }
    }

    /// 代理地址（仅代理形态有值）
    pub fn proxy_host(&self) -> Option<&str> {
        match self {
            Dialer::Direct => None,
            Dialer::Proxied { proxy_host } => Some(proxy_host),
        }
    }

    /// 连接 `addr` 并完成 SSH 握手
    ///
    /// 代理形态下隧道失败会直接返回错误，不会回退到直连。
    pub async fn dial(
        &self,
        network: &str,
        addr: &str,
        config: &SshClientConfig,
    ) -> Result<SshClient> {
        let family = Family::parse(network)?;

        match self {
            Dialer::Direct => {
                let stream = connect_tcp(family, addr, config.timeout).await?;
                info!("Connected to {} directly", addr);
                ssh::handshake(stream, addr, config).await
            }
            Dialer::Proxied { proxy_host } => {
                let tunnel = TunnelRequest::new(proxy_host.as_str(), addr)
                    .with_connect_timeout(config.timeout)
                    .establish()
                    .await?;
                info!("Connected to {} via proxy {}", addr, proxy_host);
                // 握手的对端标识使用目标地址，而不是代理地址
                ssh::handshake(tunnel, addr, config).await
            }
        }
    }
}

/// 把 `http://host:port` 形式的代理地址规整为 `host:port`
///
/// 不是 URL 的值（例如 `proxy:3128`）原样返回。
pub fn normalize_proxy_addr(value: &str) -> String {
    let parsed = match url::Url::parse(value) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => url,
        _ => return value.to_string(),
    };

    match (parsed.host_str(), parsed.port_or_known_default()) {
        (Some(host), Some(port)) => {
            if host.contains(':') && !host.starts_with('[') {
                format!("[{}]:{}", host, port)
            } else {
                format!("{}:{}", host, port)
            }
        }
        _ => value.to_string(),
    }
}

/// 网络类型对应的地址族
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Any,
    V4,
    V6,
}

impl Family {
    fn parse(network: &str) -> Result<Self> {
        match network {
            "tcp" => Ok(Family::Any),
            "tcp4" => Ok(Family::V4),
            "tcp6" => Ok(Family::V6),
            other => Err(DialError::UnsupportedNetwork(other.to_string())),
        }
    }

    fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Family::Any => true,
            Family::V4 => addr.is_ipv4(),
            Family::V6 => addr.is_ipv6(),
        }
    }
}

async fn connect_tcp(
    family: Family,
    addr: &str,
    connect_timeout: Option<Duration>,
) -> Result<TcpStream> {
    let attempt = async {
        let candidates: Vec<SocketAddr> = lookup_host(addr)
            .await
            .map_err(|e| DialError::connection_failed(addr, e))?
            .filter(|candidate| family.accepts(candidate))
            .collect();

        let mut last_err = None;
        for candidate in candidates {
            match TcpStream::connect(candidate).await {
                Ok(stream) => return Ok::<TcpStream, DialError>(stream),
                Err(e) => {
                    debug!("Failed to connect to {} ({}): {}", addr, candidate, e);
                    last_err = Some(e);
                }
            }
        }

        let err = last_err.unwrap_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("no {:?} address found", family),
            )
        });
        Err(DialError::connection_failed(addr, err))
    };

    let stream = match connect_timeout {
        Some(duration) => timeout(duration, attempt)
            .await
            .map_err(|_| DialError::connect_timeout(addr, duration))??,
        None => attempt.await?,
    };

    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }
    Ok(stream)
}
