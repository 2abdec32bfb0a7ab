/// SSH 客户端握手
///
/// 在任意已建立的字节流（直连 TCP 或代理隧道）上完成 SSH 协商和认证。
/// 本模块不关心字节流如何建立，`peer` 只作为握手的逻辑对端标识。
use crate::error::{DialError, Result};
use async_trait::async_trait;
use russh::client;
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

/// 认证方式
#[derive(Debug, Clone)]
pub enum AuthMethod {
    /// 仅尝试 `none` 认证
    None,
    Password(String),
    PrivateKey {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

/// 服务器主机密钥策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// 接受任何主机密钥（仅用于测试）
    AcceptAny,
    /// 只接受指定 SHA256 指纹的主机密钥，`SHA256:` 前缀可选
    Fingerprint(String),
}

impl HostKeyPolicy {
    fn allows(&self, fingerprint: &str) -> bool {
        match self {
            HostKeyPolicy::AcceptAny => true,
            HostKeyPolicy::Fingerprint(expected) => {
                let expected = expected.strip_prefix("SHA256:").unwrap_or(expected);
                expected == fingerprint
            }
        }
    }
}

/// SSH 客户端配置
#[derive(Clone)]
pub struct SshClientConfig {
    pub user: String,
    pub auth: AuthMethod,
    pub host_key: HostKeyPolicy,
    /// TCP 建连超时，`None` 表示一直等待
    pub timeout: Option<Duration>,
    pub session: Arc<client::Config>,
}

impl SshClientConfig {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            auth: AuthMethod::None,
            host_key: HostKeyPolicy::AcceptAny,
            timeout: None,
            session: Arc::new(client::Config::default()),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.auth = AuthMethod::Password(password.into());
        self
    }

    pub fn with_private_key(mut self, path: impl Into<PathBuf>, passphrase: Option<String>) -> Self {
        self.auth = AuthMethod::PrivateKey {
            path: path.into(),
            passphrase,
        };
        self
    }

    pub fn with_host_key(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl std::fmt::Debug for SshClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let auth = match &self.auth {
            AuthMethod::None => "none",
            AuthMethod::Password(_) => "password",
            AuthMethod::PrivateKey { .. } => "publickey",
        };
        f.debug_struct("SshClientConfig")
            .field("user", &self.user)
            .field("auth", &auth)
            .field("host_key", &self.host_key)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// russh 回调处理器，负责校验主机密钥
pub struct ClientHandler {
    peer: String,
    policy: HostKeyPolicy,
}

impl ClientHandler {
    pub fn new(peer: impl Into<String>, policy: HostKeyPolicy) -> Self {
        Self {
            peer: peer.into(),
            policy,
        }
    }
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();

        if self.policy.allows(&fingerprint) {
            if self.policy == HostKeyPolicy::AcceptAny {
                warn!(
                    "SSH: Host key verification skipped for {} (SHA256:{})",
                    self.peer, fingerprint
                );
            } else {
                info!("SSH: Host key verified for {}", self.peer);
            }
            Ok(true)
        } else {
            error!(
                "SSH: HOST KEY MISMATCH for {}: got SHA256:{}",
                self.peer, fingerprint
            );
            Ok(false)
        }
    }
}

/// 命令执行结果
#[derive(Debug, Default, Clone)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_status: Option<u32>,
}

/// 已完成协商和认证的 SSH 客户端
pub struct SshClient {
    handle: client::Handle<ClientHandler>,
    peer: String,
    user: String,
}

impl SshClient {
    /// 握手时使用的逻辑对端地址（始终是目标地址，而非代理地址）
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn handle(&self) -> &client::Handle<ClientHandler> {
        &self.handle
    }

    pub fn into_handle(self) -> client::Handle<ClientHandler> {
        self.handle
    }

    /// 在新会话通道上执行命令，收集输出直到通道关闭
    pub async fn exec(&self, command: &str) -> Result<ExecOutput> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut output = ExecOutput::default();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => output.stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                    output.stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    debug!("SSH: '{}' exited with {}", command, exit_status);
                    output.exit_status = Some(exit_status);
                }
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        Ok(output)
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await?;
        Ok(())
    }
}

/// 在已建立的字节流上完成 SSH 握手和认证
pub async fn handshake<S>(stream: S, peer: &str, config: &SshClientConfig) -> Result<SshClient>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let handler = ClientHandler::new(peer, config.host_key.clone());
    let mut handle = client::connect_stream(config.session.clone(), stream, handler)
        .await
        .map_err(|e| match e {
            russh::Error::UnknownKey => DialError::HostKeyRejected(peer.to_string()),
            other => DialError::Handshake(other),
        })?;

    debug!("SSH: Negotiated session with {}, authenticating", peer);

    let authenticated = match &config.auth {
        AuthMethod::None => handle.authenticate_none(config.user.as_str()).await?,
        AuthMethod::Password(password) => {
            handle
                .authenticate_password(config.user.as_str(), password.as_str())
                .await?
        }
        AuthMethod::PrivateKey { path, passphrase } => {
            let key_pair = russh_keys::load_secret_key(path, passphrase.as_deref())?;
            handle
                .authenticate_publickey(config.user.as_str(), Arc::new(key_pair))
                .await?
        }
    };

    if !authenticated {
        error!("SSH: Authentication rejected for {}@{}", config.user, peer);
        return Err(DialError::auth_failed(format!(
            "server rejected credentials for {}@{}",
            config.user, peer
        )));
    }

    info!("SSH: Authenticated as {}@{}", config.user, peer);
    Ok(SshClient {
        handle,
        peer: peer.to_string(),
        user: config.user.clone(),
    })
}
