use crate::acceptor::ConnectHandler;
use crate::ssh::{HostKeyPolicy, SshClientConfig};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// SSH 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    /// 登录用户名
    pub user: String,
    /// 密码认证（与 identity_file 二选一）
    #[serde(default)]
    pub password: Option<String>,
    /// 私钥路径，支持 `~` 展开
    #[serde(default)]
    pub identity_file: Option<String>,
    /// 私钥口令
    #[serde(default)]
    pub passphrase: Option<String>,
    /// 服务器主机密钥 SHA256 指纹；缺省时接受任何主机密钥
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,
    /// TCP 建连超时（秒），缺省表示一直等待
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    /// SSH 会话空闲超时（秒）
    #[serde(default)]
    pub inactivity_timeout_secs: Option<u64>,
}

/// CONNECT 调试代理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    /// 监听地址
    #[serde(default = "default_listen_addr")]
    pub listen: String,
    /// 转发空闲超时（秒），缺省表示不限制
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
}

fn default_listen_addr() -> String {
    "127.0.0.1:3128".to_string()
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            listen: default_listen_addr(),
            idle_timeout_secs: None,
        }
    }
}

/// 配置文件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub ssh: Option<SshSettings>,
    #[serde(default)]
    pub proxy: ProxySettings,
}

impl SshSettings {
    /// 验证配置的有效性
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.user.trim().is_empty() {
            bail!("ssh.user cannot be empty");
        }
        if self.password.is_some() && self.identity_file.is_some() {
            bail!("ssh.password and ssh.identity_file are mutually exclusive");
        }
        if self.passphrase.is_some() && self.identity_file.is_none() {
            bail!("ssh.passphrase requires ssh.identity_file");
        }
        if self.connect_timeout_secs == Some(0) {
            bail!("ssh.connect_timeout_secs must be greater than 0");
        }
        Ok(())
    }

    /// 转换为拨号使用的 SSH 客户端配置
    pub fn to_client_config(&self) -> anyhow::Result<SshClientConfig> {
        self.validate()?;

        let mut config = SshClientConfig::new(self.user.clone())
            .with_timeout(self.connect_timeout_secs.map(Duration::from_secs));

        if let Some(password) = &self.password {
            config = config.with_password(password.clone());
        }
        if let Some(path) = &self.identity_file {
            let expanded = shellexpand::tilde(path);
            config = config.with_private_key(PathBuf::from(expanded.as_ref()), self.passphrase.clone());
        }
        if let Some(fingerprint) = &self.host_key_fingerprint {
            config = config.with_host_key(HostKeyPolicy::Fingerprint(fingerprint.clone()));
        }

        config.session = Arc::new(russh::client::Config {
            inactivity_timeout: self.inactivity_timeout_secs.map(Duration::from_secs),
            ..Default::default()
        });

        Ok(config)
    }
}

impl ProxySettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.listen.trim().is_empty() {
            bail!("proxy.listen cannot be empty");
        }
        if self.idle_timeout_secs == Some(0) {
            bail!("proxy.idle_timeout_secs must be greater than 0");
        }
        Ok(())
    }

    pub fn handler(&self) -> ConnectHandler {
        ConnectHandler::new().with_idle_timeout(self.idle_timeout_secs.map(Duration::from_secs))
    }
}

impl AppConfig {
    /// 从 TOML 字符串解析并验证
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: AppConfig =
            toml::from_str(content).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// 从文件加载配置
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let expanded = shellexpand::tilde(path);
        let content = std::fs::read_to_string(expanded.as_ref())
            .with_context(|| format!("Failed to read configuration file {}", path))?;
        Self::parse(&content).with_context(|| format!("Invalid configuration file {}", path))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(ssh) = &self.ssh {
            ssh.validate().context("Invalid [ssh] section")?;
        }
        self.proxy.validate().context("Invalid [proxy] section")?;
        Ok(())
    }

    /// 获取 SSH 配置，缺失时报错
    pub fn ssh(&self) -> anyhow::Result<&SshSettings> {
        self.ssh
            .as_ref()
            .context("Configuration has no [ssh] section")
    }
}
