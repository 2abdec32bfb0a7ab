mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use proxy_dial::acceptor::ConnectProxy;
use proxy_dial::config::{AppConfig, ProxySettings};
use proxy_dial::dialer::Dialer;
use std::io::Write;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    info!("proxy-dial v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Check { config } => {
            AppConfig::load(&config)?;
            println!("Configuration file {} is valid", config);
        }
        Commands::Dial {
            config,
            network,
            target,
            command,
        } => {
            let exit_code = dial(&config, &network, &target, &command).await?;
            if exit_code != 0 {
                std::process::exit(exit_code);
            }
        }
        Commands::ConnectProxy { config, listen } => {
            let mut settings = match config {
                Some(path) => AppConfig::load(&path)?.proxy,
                None => ProxySettings::default(),
            };
            if let Some(listen) = listen {
                settings.listen = listen;
            }
            settings.validate()?;
            run_connect_proxy(settings).await?;
        }
    }

    Ok(())
}

/// 拨号并可选执行命令，返回进程退出码
async fn dial(config: &str, network: &str, target: &str, command: &[String]) -> Result<i32> {
    info!("Loading configuration from: {}", config);
    let app_config = AppConfig::load(config)?;
    let ssh_config = app_config.ssh()?.to_client_config()?;

    // 只读取一次环境变量，整个会话复用同一个拨号方式
    let dialer = Dialer::from_environment();
    match dialer.proxy_host() {
        Some(proxy) => info!("Dialing {} via HTTP CONNECT proxy {}", target, proxy),
        None => info!("Dialing {} directly", target),
    }

    let client = dialer
        .dial(network, target, &ssh_config)
        .await
        .with_context(|| format!("Failed to dial {}", target))?;

    if command.is_empty() {
        println!("Connected to {} as {}", client.peer(), client.user());
        client.disconnect().await?;
        return Ok(0);
    }

    let command_line = command.join(" ");
    let output = client
        .exec(&command_line)
        .await
        .with_context(|| format!("Failed to execute '{}'", command_line))?;
    std::io::stdout().write_all(&output.stdout)?;
    std::io::stderr().write_all(&output.stderr)?;

    if let Err(e) = client.disconnect().await {
        warn!("Failed to disconnect cleanly: {}", e);
    }

    Ok(output.exit_status.map(|status| status as i32).unwrap_or(1))
}

async fn run_connect_proxy(settings: ProxySettings) -> Result<()> {
    let proxy = ConnectProxy::bind(settings.listen.as_str(), settings.handler())
        .await
        .with_context(|| format!("Failed to bind CONNECT proxy to {}", settings.listen))?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(());
        }
    });

    proxy.serve(shutdown_rx).await?;
    Ok(())
}
