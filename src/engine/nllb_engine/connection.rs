// nllb_engine/connection.rs — One framed socket to the NLLB server
//
// Newline-delimited JSON over local TCP. The first framing, I/O, or protocol
// error poisons the connection: `is_healthy` turns false and the pool will
// destroy it instead of reusing it.

use crate::atoms::constants::{CONNECTION_BUF_BYTES, CONNECTION_IO_TIMEOUT_SECS};
use crate::atoms::error::{CoreError, CoreResult};
use log::debug;
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

pub struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    /// Reused line buffer; sized for typical payloads.
    line: String,
    read_timeout: Duration,
    write_timeout: Duration,
    created_at: Instant,
    last_used: Instant,
    healthy: bool,
    /// True from the start of a send until its response is fully read. A
    /// connection abandoned mid-exchange (caller timeout, dropped future)
    /// still has a response in flight and must not be reused.
    in_flight: bool,
}

impl Connection {
    pub async fn connect(port: u16) -> CoreResult<Self> {
        let io_timeout = Duration::from_secs(CONNECTION_IO_TIMEOUT_SECS);
        let stream = tokio::time::timeout(io_timeout, TcpStream::connect(("127.0.0.1", port)))
            .await
            .map_err(|_| CoreError::timeout(io_timeout))?
            .map_err(|e| CoreError::network(format!("connect 127.0.0.1:{}: {}", port, e)))?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        debug!("[nllb] connected to 127.0.0.1:{}", port);
        Ok(Connection {
            reader: BufReader::with_capacity(CONNECTION_BUF_BYTES, read_half),
            writer: write_half,
            line: String::with_capacity(CONNECTION_BUF_BYTES),
            read_timeout: io_timeout,
            write_timeout: io_timeout,
            created_at: Instant::now(),
            last_used: Instant::now(),
            healthy: true,
            in_flight: false,
        })
    }

    /// Serialize `message` and send it as one newline-terminated frame.
    pub async fn send_line<T: Serialize>(&mut self, message: &T) -> CoreResult<()> {
        let mut payload = serde_json::to_vec(message)
            .map_err(|e| CoreError::protocol(format!("serialize request: {}", e)))?;
        payload.push(b'\n');
        self.in_flight = true;

        let write = async {
            self.writer.write_all(&payload).await?;
            self.writer.flush().await
        };
        match tokio::time::timeout(self.write_timeout, write).await {
            Err(_) => {
                self.healthy = false;
                Err(CoreError::timeout(self.write_timeout))
            }
            Ok(Err(e)) => {
                self.healthy = false;
                Err(CoreError::network(format!("socket write: {}", e)))
            }
            Ok(Ok(())) => {
                self.last_used = Instant::now();
                Ok(())
            }
        }
    }

    /// Read one frame and parse it as JSON, with the connection's default
    /// read timeout.
    pub async fn read_line(&mut self) -> CoreResult<serde_json::Value> {
        self.read_line_within(self.read_timeout).await
    }

    /// Read one frame with an explicit deadline (single translate RPCs use a
    /// longer one than the connection default).
    pub async fn read_line_within(&mut self, deadline: Duration) -> CoreResult<serde_json::Value> {
        self.line.clear();
        match tokio::time::timeout(deadline, self.reader.read_line(&mut self.line)).await {
            Err(_) => {
                // The frame may arrive later and would desynchronize the
                // stream; this connection is done.
                self.healthy = false;
                Err(CoreError::timeout(deadline))
            }
            Ok(Err(e)) => {
                self.healthy = false;
                Err(CoreError::network(format!("socket read: {}", e)))
            }
            Ok(Ok(0)) => {
                self.healthy = false;
                Err(CoreError::network("server closed the connection"))
            }
            Ok(Ok(_)) => {
                self.last_used = Instant::now();
                self.in_flight = false;
                serde_json::from_str(self.line.trim_end()).map_err(|e| {
                    self.healthy = false;
                    CoreError::protocol(format!("malformed frame: {}", e))
                })
            }
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy && !self.in_flight
    }

    /// Mark the connection unusable (a caller abandoned it mid-exchange).
    pub fn poison(&mut self) {
        self.healthy = false;
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader as TokioBufReader};
    use tokio::net::TcpListener;

    async fn echo_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (read_half, mut write_half) = stream.into_split();
                    let mut lines = TokioBufReader::new(read_half).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let frame = format!("{}\n", line);
                        if write_half.write_all(frame.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn test_round_trip_frame() {
        let port = echo_server().await;
        let mut conn = Connection::connect(port).await.unwrap();
        conn.send_line(&json!({"text": "hello", "request_id": "r1"})).await.unwrap();
        let value = conn.read_line().await.unwrap();
        assert_eq!(value["text"], "hello");
        assert!(conn.is_healthy());
    }

    #[tokio::test]
    async fn test_read_timeout_poisons_connection() {
        // A server that accepts but never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _held = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let mut conn = Connection::connect(port).await.unwrap();
        let err = conn.read_line_within(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, CoreError::Timeout(_)));
        assert!(!conn.is_healthy());
    }

    #[tokio::test]
    async fn test_malformed_frame_poisons_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"this is not json\n").await.unwrap();
        });

        let mut conn = Connection::connect(port).await.unwrap();
        let err = conn.read_line().await.unwrap_err();
        assert!(matches!(err, CoreError::Protocol(_)));
        assert!(!conn.is_healthy());
    }

    #[tokio::test]
    async fn test_abandoned_exchange_is_unhealthy() {
        // A request was sent but its response never read (caller timed out
        // and dropped the exchange). The connection must not be reused.
        let port = echo_server().await;
        let mut conn = Connection::connect(port).await.unwrap();
        conn.send_line(&json!({"text": "orphaned"})).await.unwrap();
        assert!(!conn.is_healthy());

        conn.read_line().await.unwrap();
        assert!(conn.is_healthy());
    }

    #[tokio::test]
    async fn test_connect_refused_is_network_error() {
        // Port 1 is essentially never listening.
        let err = Connection::connect(1).await.unwrap_err();
        assert!(matches!(err, CoreError::Network(_) | CoreError::Timeout(_)));
    }
}
