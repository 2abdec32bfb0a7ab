/// Full dials against an in-process SSH server, directly and through the CONNECT proxy
mod common;

use std::time::Duration;
use tokio::time::timeout;

use proxy_dial::{DialError, Dialer, HostKeyPolicy, SshClient, SshClientConfig};

fn client_config(fingerprint: &str) -> SshClientConfig {
    SshClientConfig::new(common::SSH_USER)
        .with_password(common::SSH_PASSWORD)
        .with_host_key(HostKeyPolicy::Fingerprint(fingerprint.to_string()))
}

async fn dial(dialer: &Dialer, target: &str, config: &SshClientConfig) -> Result<SshClient, DialError> {
    timeout(Duration::from_secs(10), dialer.dial("tcp", target, config))
        .await
        .expect("dial timed out")
}

fn proxied(proxy_addr: impl ToString) -> Dialer {
    let proxy = proxy_addr.to_string();
    Dialer::from_lookup(move |name| (name == "https_proxy").then(|| proxy.clone()))
}

#[tokio::test]
async fn test_direct_dial_and_exec() {
    let (ssh_addr, fingerprint) = common::start_ssh_server().await;
    let target = ssh_addr.to_string();

    let client = dial(&Dialer::Direct, &target, &client_config(&fingerprint))
        .await
        .ok()
        .expect("direct dial failed");
    assert_eq!(client.peer(), target);
    assert_eq!(client.user(), common::SSH_USER);

    let output = client.exec("uname -a").await.ok().expect("exec failed");
    assert_eq!(output.stdout, b"ran: uname -a\n");
    assert!(output.stderr.is_empty());
    assert_eq!(output.exit_status, Some(0));

    assert!(client.disconnect().await.is_ok());
}

#[tokio::test]
async fn test_proxied_dial_uses_target_as_peer() {
    let (ssh_addr, fingerprint) = common::start_ssh_server().await;
    let (proxy_addr, _shutdown) = common::start_connect_proxy().await;
    let target = ssh_addr.to_string();

    // 指纹带 SHA256: 前缀同样可以匹配
    let config = client_config(&format!("SHA256:{}", fingerprint));
    let client = dial(&proxied(proxy_addr), &target, &config)
        .await
        .ok()
        .expect("proxied dial failed");

    // 对端标识是目标地址，而不是代理地址
    assert_eq!(client.peer(), target);
    assert_ne!(client.peer(), proxy_addr.to_string());

    let output = client.exec("true").await.ok().expect("exec failed");
    assert_eq!(output.exit_status, Some(0));
    assert!(client.disconnect().await.is_ok());
}

#[tokio::test]
async fn test_wrong_password_is_authentication_failure() {
    let (ssh_addr, fingerprint) = common::start_ssh_server().await;
    let (proxy_addr, _shutdown) = common::start_connect_proxy().await;
    let target = ssh_addr.to_string();

    let config = SshClientConfig::new(common::SSH_USER)
        .with_password("not-the-password")
        .with_host_key(HostKeyPolicy::Fingerprint(fingerprint));

    for dialer in [Dialer::Direct, proxied(proxy_addr)] {
        let err = dial(&dialer, &target, &config).await.err().unwrap();
        assert!(err.is_auth_failed(), "{:?}: unexpected error {}", dialer, err);
        assert!(!err.is_transport());
    }
}

#[tokio::test]
async fn test_pinned_fingerprint_mismatch_rejects_host() {
    let (ssh_addr, _fingerprint) = common::start_ssh_server().await;
    let target = ssh_addr.to_string();

    let config = client_config("AAAAnot-the-server-key");
    let err = dial(&Dialer::Direct, &target, &config).await.err().unwrap();
    assert!(
        matches!(err, DialError::HostKeyRejected(ref peer) if *peer == target),
        "unexpected error: {}",
        err
    );
}
