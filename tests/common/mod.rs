//! Common utilities for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use proxy_dial::acceptor::{ConnectHandler, ConnectProxy};
use proxy_dial::stream::PrefixedStream;

/// Find an address nothing is listening on
pub async fn closed_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind to random port");
    let addr = listener.local_addr().expect("Failed to get local addr");
    drop(listener);
    addr.to_string()
}

/// Create a simple echo server for testing
pub async fn start_echo_server() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind echo server");
    let addr = listener.local_addr().expect("Failed to get local addr");

    let handle = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 8192];
                        loop {
                            match socket.read(&mut buf).await {
                                Ok(0) => break, // Connection closed
                                Ok(n) => {
                                    if socket.write_all(&buf[..n]).await.is_err() {
                                        break;
                                    }
                                }
                                Err(_) => break,
                            }
                        }
                    });
                }
                Err(_) => break,
            }
        }
    });

    (addr, handle)
}

/// Start the CONNECT debug proxy on a random port
pub async fn start_connect_proxy() -> (SocketAddr, broadcast::Sender<()>) {
    let proxy = ConnectProxy::bind("127.0.0.1:0", ConnectHandler::new())
        .await
        .expect("Failed to bind CONNECT proxy");
    let addr = proxy.local_addr().expect("Failed to get proxy addr");
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        let _ = proxy.serve(shutdown_rx).await;
    });
    (addr, shutdown_tx)
}

/// Send a raw request head and read the response head
///
/// The returned stream still yields any bytes read past the head.
pub async fn send_raw_request(
    proxy: SocketAddr,
    request: &str,
) -> (PrefixedStream<TcpStream>, String) {
    let mut stream = TcpStream::connect(proxy)
        .await
        .expect("Failed to connect to proxy");
    stream
        .write_all(request.as_bytes())
        .await
        .expect("Failed to write request");

    let (head, rest) = tokio::time::timeout(
        Duration::from_secs(5),
        proxy_dial::http_head::read_head(&mut stream, proxy_dial::http_head::MAX_HEAD_SIZE),
    )
    .await
    .expect("Timeout waiting for response")
    .expect("Failed to read response head");

    (
        PrefixedStream::new(rest, stream),
        String::from_utf8_lossy(&head).into_owned(),
    )
}

/// Credentials accepted by the in-process SSH server
pub const SSH_USER: &str = "tester";
pub const SSH_PASSWORD: &str = "correct-horse";

/// Minimal SSH server: password auth only, `exec` answers `ran: <command>` and exits 0
#[derive(Clone)]
struct TestSshServer;

#[async_trait]
impl server::Handler for TestSshServer {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if user == SSH_USER && password == SSH_PASSWORD {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut reply = b"ran: ".to_vec();
        reply.extend_from_slice(data);
        reply.push(b'\n');

        session.data(channel, CryptoVec::from_slice(&reply));
        session.exit_status_request(channel, 0);
        session.eof(channel);
        session.close(channel);
        Ok(())
    }
}

/// Start an SSH server with a fresh ed25519 host key
///
/// Returns the listen address and the host key's SHA256 fingerprint.
pub async fn start_ssh_server() -> (SocketAddr, String) {
    let key = russh_keys::key::KeyPair::generate_ed25519().expect("Failed to generate host key");
    let fingerprint = key
        .clone_public_key()
        .expect("Failed to derive public key")
        .fingerprint();

    let config = Arc::new(server::Config {
        auth_rejection_time: Duration::from_millis(10),
        auth_rejection_time_initial: Some(Duration::from_millis(0)),
        keys: vec![key],
        ..Default::default()
    });

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind SSH server");
    let addr = listener.local_addr().expect("Failed to get local addr");

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let config = config.clone();
            tokio::spawn(async move {
                if let Ok(session) = server::run_stream(config, socket, TestSshServer).await {
                    let _ = session.await;
                }
            });
        }
    });

    (addr, fingerprint)
}
