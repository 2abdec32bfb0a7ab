/// 双向数据转发
///
/// 两个方向各自在独立任务中复制数据，直到源端 EOF 或出错。
/// 会话必须等两个方向都结束后才关闭两端连接，避免任务仍在写入时连接被释放。
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// 数据复制缓冲区大小（64KB 适合高吞吐）
const COPY_BUFFER_SIZE: usize = 65536;

/// 一次转发会话的统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SpliceStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// 一次转发会话：客户端连接与上游连接
pub struct SpliceSession<C, U> {
    client: C,
    upstream: U,
    idle_timeout: Option<Duration>,
}

impl<C, U> SpliceSession<C, U>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(client: C, upstream: U) -> Self {
        Self {
            client,
            upstream,
            idle_timeout: None,
        }
    }

    /// 设置空闲超时：某个方向超过该时间没有数据即结束该方向
    ///
    /// 默认不设超时，停滞的一端会让对应方向一直阻塞。
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// 运行会话，两个方向都结束后关闭两端并返回统计
    pub async fn run(self) -> SpliceStats {
        let (client_read, client_write) = tokio::io::split(self.client);
        let (upstream_read, upstream_write) = tokio::io::split(self.upstream);
        let idle_timeout = self.idle_timeout;

        let c2u = tokio::spawn(copy_direction(
            client_read,
            upstream_write,
            idle_timeout,
            "client -> upstream",
        ));
        let u2c = tokio::spawn(copy_direction(
            upstream_read,
            client_write,
            idle_timeout,
            "upstream -> client",
        ));

        // 两个方向完成顺序不定，必须都等到
        let (c2u, u2c) = tokio::join!(c2u, u2c);

        let mut stats = SpliceStats::default();
        match c2u {
            Ok(outcome) => {
                stats.client_to_upstream = outcome.copied;
                outcome.close();
            }
            // 任务 panic 时其持有的半连接已随任务释放
            Err(e) => warn!("Splice task client -> upstream aborted: {}", e),
        }
        match u2c {
            Ok(outcome) => {
                stats.upstream_to_client = outcome.copied;
                outcome.close();
            }
            Err(e) => warn!("Splice task upstream -> client aborted: {}", e),
        }

        info!(
            "Splice finished: {} bytes client -> upstream, {} bytes upstream -> client",
            stats.client_to_upstream, stats.upstream_to_client
        );
        stats
    }
}

/// 在两个连接之间双向转发，直到两个方向都结束
pub async fn splice<C, U>(client: C, upstream: U) -> SpliceStats
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    SpliceSession::new(client, upstream).run().await
}

/// 单个方向的结果，归还两个半连接以便会话统一关闭
struct DirectionOutcome<R, W> {
    reader: ReadHalf<R>,
    writer: WriteHalf<W>,
    copied: u64,
}

impl<R, W> DirectionOutcome<R, W> {
    /// 两个方向都结束后才释放半连接，最后一个半连接释放时底层连接关闭
    fn close(self) {
        drop(self.reader);
        drop(self.writer);
    }
}

async fn copy_direction<R, W>(
    mut reader: ReadHalf<R>,
    mut writer: WriteHalf<W>,
    idle_timeout: Option<Duration>,
    direction: &'static str,
) -> DirectionOutcome<R, W>
where
    R: AsyncRead,
    W: AsyncWrite,
{
    let mut copied = 0u64;
    let result = copy_until_eof(&mut reader, &mut writer, idle_timeout, &mut copied).await;

    match result {
        Ok(()) => debug!("Splice {}: EOF after {} bytes", direction, copied),
        Err(e) => debug!("Splice {}: stopped after {} bytes: {}", direction, copied, e),
    }

    // 把 EOF 传给对端，但不关闭另一个方向
    if let Err(e) = writer.shutdown().await {
        debug!("Splice {}: shutdown failed: {}", direction, e);
    }

    DirectionOutcome {
        reader,
        writer,
        copied,
    }
}

async fn copy_until_eof<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle_timeout: Option<Duration>,
    copied: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    loop {
        let n = match idle_timeout {
            Some(duration) => timeout(duration, reader.read(&mut buf))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "Connection idle timeout"))??,
            None => reader.read(&mut buf).await?,
        };

        if n == 0 {
            return Ok(());
        }

        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *copied += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_splice_both_directions() {
        let (client, mut client_peer) = duplex(1024);
        let (upstream, mut upstream_peer) = duplex(1024);

        let session = tokio::spawn(splice(client, upstream));

        client_peer.write_all(b"hello upstream").await.unwrap();
        let mut buf = [0u8; 14];
        upstream_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello upstream");

        upstream_peer.write_all(b"hello client").await.unwrap();
        let mut buf = [0u8; 12];
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello client");

        drop(client_peer);
        // 客户端关闭后上游收到 EOF，随后上游也关闭
        let mut rest = Vec::new();
        upstream_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        drop(upstream_peer);

        let stats = session.await.unwrap();
        assert_eq!(stats.client_to_upstream, 14);
        assert_eq!(stats.upstream_to_client, 12);
    }

    #[tokio::test]
    async fn test_one_direction_finishing_keeps_other_open() {
        let (client, mut client_peer) = duplex(1024);
        let (upstream, mut upstream_peer) = duplex(1024);

        let session = tokio::spawn(splice(client, upstream));

        // 客户端半关闭写方向
        client_peer.shutdown().await.unwrap();
        let mut rest = Vec::new();
        upstream_peer.read_to_end(&mut rest).await.unwrap();

        // 上游仍可继续向客户端发送数据
        upstream_peer.write_all(b"late reply").await.unwrap();
        let mut buf = [0u8; 10];
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"late reply");
        assert!(!session.is_finished());

        drop(upstream_peer);
        let stats = session.await.unwrap();
        assert_eq!(stats.client_to_upstream, 0);
        assert_eq!(stats.upstream_to_client, 10);
    }

    #[tokio::test]
    async fn test_idle_timeout_ends_session() {
        let (client, _client_peer) = duplex(64);
        let (upstream, _upstream_peer) = duplex(64);

        let stats = SpliceSession::new(client, upstream)
            .with_idle_timeout(Some(Duration::from_millis(50)))
            .run()
            .await;
        assert_eq!(stats, SpliceStats::default());
    }
}
