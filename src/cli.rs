use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "proxy-dial")]
#[command(author, version, about = "Dial SSH servers directly or through an HTTP CONNECT proxy", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志级别 (trace, debug, info, warn, error)，RUST_LOG 优先
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 连接 SSH 服务器（根据 https_proxy / http_proxy 自动选择代理）
    Dial {
        /// 配置文件路径
        #[arg(short, long, default_value = "proxy-dial.toml")]
        config: String,

        /// 网络类型 (tcp, tcp4, tcp6)
        #[arg(short, long, default_value = "tcp")]
        network: String,

        /// 目标地址 host:port
        target: String,

        /// 连接成功后执行的命令
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// 运行 HTTP CONNECT 调试代理
    ConnectProxy {
        /// 配置文件路径（可选）
        #[arg(short, long)]
        config: Option<String>,

        /// 监听地址，覆盖配置文件
        #[arg(short = 'L', long)]
        listen: Option<String>,
    },
    /// 检查配置文件格式是否正确
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,
    },
}
