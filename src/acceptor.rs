/// HTTP CONNECT 接入端（用于测试和调试）
///
/// 校验 CONNECT 请求，劫持底层连接，连接请求的目标主机，
/// 回写 `200 OK` 后在两条连接之间双向转发。
use crate::error::{DialError, Result};
use crate::http_head::{self, RequestHead, MAX_HEAD_SIZE};
use crate::splice::{SpliceSession, SpliceStats};
use crate::stream::PrefixedStream;
use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// 协议解析超时时间（防止慢速攻击）
const PROTOCOL_PARSE_TIMEOUT: Duration = Duration::from_secs(30);

/// 隧道建立成功的响应
const TUNNEL_ESTABLISHED: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

/// 被劫持后的原始连接
pub type HijackedConn = PrefixedStream<TcpStream>;

/// 接入端关心的请求字段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub method: Method,
    pub host: String,
}

impl ConnectRequest {
    pub fn new(method: Method, host: impl Into<String>) -> Self {
        Self {
            method,
            host: host.into(),
        }
    }

    /// 从请求头提取目标主机
    ///
    /// CONNECT 使用 authority 形式的请求目标，其余情况依次尝试绝对 URL 和 Host 头。
    pub fn from_head(head: &RequestHead) -> Self {
        let target = head.target.as_str();
        let host = if head.method == Method::CONNECT && !target.starts_with('/') && target != "*" {
            target.to_string()
        } else if let Some(host) = url::Url::parse(target)
            .ok()
            .and_then(|url| authority_of(&url))
        {
            host
        } else {
            head.header("host").unwrap_or_default().to_string()
        };

        Self {
            method: head.method.clone(),
            host,
        }
    }
}

fn authority_of(url: &url::Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// 构造纯文本错误响应
pub fn error_response(status: StatusCode, message: &str) -> String {
    let body = format!("{}\n", message);
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         X-Content-Type-Options: nosniff\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        body.len(),
        body
    )
}

/// 接入端的响应通道
///
/// 未劫持前可以回写 HTTP 错误；劫持后交出原始连接，之后不再按 HTTP 处理。
#[async_trait]
pub trait ResponseWriter: Send {
    /// 回写 HTTP 错误响应
    async fn write_error(&mut self, status: StatusCode, message: &str) -> io::Result<()>;

    /// 取得底层连接的所有权，不支持时返回 [`DialError::HijackUnsupported`]
    fn hijack(&mut self) -> Result<HijackedConn>;
}

/// 基于 TCP 连接的响应通道，支持劫持
pub struct HttpConnection {
    stream: Option<TcpStream>,
    buffered: Bytes,
}

impl HttpConnection {
    /// `buffered` 是读取请求头时多读到的字节，劫持后会最先被读出
    pub fn new(stream: TcpStream, buffered: Bytes) -> Self {
        Self {
            stream: Some(stream),
            buffered,
        }
    }

    pub fn is_hijacked(&self) -> bool {
        self.stream.is_none()
    }
}

#[async_trait]
impl ResponseWriter for HttpConnection {
    async fn write_error(&mut self, status: StatusCode, message: &str) -> io::Result<()> {
        let stream = self.stream.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "connection has been hijacked")
        })?;
        stream
            .write_all(error_response(status, message).as_bytes())
            .await?;
        stream.flush().await
    }

    fn hijack(&mut self) -> Result<HijackedConn> {
        let stream = self.stream.take().ok_or_else(|| {
            DialError::Io(io::Error::other("connection has already been hijacked"))
        })?;
        Ok(PrefixedStream::new(
            std::mem::take(&mut self.buffered),
            stream,
        ))
    }
}

/// CONNECT 请求处理器
#[derive(Debug, Clone, Default)]
pub struct ConnectHandler {
    idle_timeout: Option<Duration>,
}

impl ConnectHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 转发阶段的空闲超时，默认不限制
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// 处理一个 CONNECT 请求，直到转发的两个方向都结束
    pub async fn handle<W>(&self, request: &ConnectRequest, writer: &mut W) -> Result<SpliceStats>
    where
        W: ResponseWriter + ?Sized,
    {
        // 校验请求参数，失败时不劫持也不拨号
        if request.method != Method::CONNECT {
            return reject(writer, DialError::invalid_request(format!(
                "{} not supported",
                request.method
            )))
            .await;
        }
        if request.host.is_empty() {
            return reject(writer, DialError::invalid_request("host not set")).await;
        }

        let mut client = match writer.hijack() {
            Ok(conn) => conn,
            Err(e) => return reject(writer, e).await,
        };

        let upstream = match TcpStream::connect(request.host.as_str()).await {
            Ok(stream) => stream,
            Err(e) => {
                let err = DialError::connection_failed(&request.host, e);
                warn!("CONNECT {}: upstream dial failed: {}", request.host, err);
                // 连接已被劫持，只能直接在原始连接上尽力回写错误
                let response = error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string());
                client.write_all(response.as_bytes()).await.ok();
                return Err(err);
            }
        };
        if let Err(e) = upstream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        client.write_all(TUNNEL_ESTABLISHED).await?;
        client.flush().await?;
        info!("CONNECT {}: tunnel established", request.host);

        let stats = SpliceSession::new(client, upstream)
            .with_idle_timeout(self.idle_timeout)
            .run()
            .await;
        Ok(stats)
    }
}

async fn reject<W>(writer: &mut W, err: DialError) -> Result<SpliceStats>
where
    W: ResponseWriter + ?Sized,
{
    warn!("Rejecting CONNECT request: {}", err);
    if let Err(e) = writer
        .write_error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        .await
    {
        debug!("Failed to write error response: {}", e);
    }
    Err(err)
}

/// 监听 TCP 端口并处理 CONNECT 请求的调试代理
pub struct ConnectProxy {
    listener: TcpListener,
    handler: ConnectHandler,
}

impl ConnectProxy {
    pub async fn bind<A: ToSocketAddrs>(addr: A, handler: ConnectHandler) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, handler })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// 接受连接直到收到 shutdown 信号，每个连接在独立任务中处理
    pub async fn serve(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let local_addr = self.local_addr()?;
        info!("CONNECT proxy listening on {}", local_addr);

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!("CONNECT proxy: accepted connection from {}", peer_addr);
                            let handler = self.handler.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, &handler).await {
                                    debug!("CONNECT proxy: connection from {} ended: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("CONNECT proxy: accept error: {}", e);
                            sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("CONNECT proxy on {} shutting down", local_addr);
                    break Ok(());
                }
            }
        }
    }
}

/// 读取一个请求头并交给处理器
pub async fn serve_connection(mut stream: TcpStream, handler: &ConnectHandler) -> Result<SpliceStats> {
    let (head, rest) = timeout(
        PROTOCOL_PARSE_TIMEOUT,
        http_head::read_head(&mut stream, MAX_HEAD_SIZE),
    )
    .await
    .map_err(|_| DialError::timeout(PROTOCOL_PARSE_TIMEOUT))??;

    let head = match http_head::parse_request_head(&head) {
        Ok(head) => head,
        Err(e) => {
            let response = error_response(StatusCode::BAD_REQUEST, &e.to_string());
            stream.write_all(response.as_bytes()).await.ok();
            return Err(e);
        }
    };

    let request = ConnectRequest::from_head(&head);
    let mut conn = HttpConnection::new(stream, rest);
    handler.handle(&request, &mut conn).await
}
