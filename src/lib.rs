/// proxy-dial 库入口
///
/// 直连或经 HTTP CONNECT 代理建立 SSH 客户端连接，
/// 另附一个用于测试和调试的 CONNECT 接入端
pub mod acceptor;
pub mod config;
pub mod dialer;
pub mod error;
pub mod http_head;
pub mod splice;
pub mod ssh;
pub mod stream;
pub mod tunnel;

// 重新导出常用类型
pub use acceptor::{ConnectHandler, ConnectProxy, ConnectRequest, HttpConnection, ResponseWriter};
pub use config::AppConfig;
pub use dialer::Dialer;
pub use error::{DialError, Result};
pub use splice::{splice, SpliceSession, SpliceStats};
pub use ssh::{AuthMethod, HostKeyPolicy, SshClient, SshClientConfig};
pub use stream::PrefixedStream;
pub use tunnel::{connect, TunnelRequest, TunnelStatus, TunnelStream};
