//! Per-connection request loop.
//!
//! Each accepted client runs one task: read bytes into an accumulation
//! buffer, parse as many complete frames as the buffer holds, dispatch
//! each one, and write the replies back in arrival order. TCP is a
//! stream, so a single read may carry half a command or a whole
//! pipeline; the incremental parser and the buffer absorb both.
//!
//! Deadlines are refreshed per request: a connection idle for five
//! minutes is closed silently, and a write that cannot complete within
//! ten seconds terminates the connection.
//!
//! Error layering follows the protocol's three levels: transport
//! problems (I/O failure, EOF mid-frame, unresyncable framing) close
//! the connection; recoverable protocol problems skip the malformed
//! frame, reply `-ERR protocol error`, and keep serving; application
//! errors are ordinary replies produced by the dispatcher.

use crate::commands::CommandHandler;
use crate::protocol::{parser::MAX_BULK_SIZE, Frame, ParseError, Parser};
use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

/// Close a connection that sends nothing for this long.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Give up on a client that cannot drain its replies within this long.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Ceiling on buffered request bytes: the largest legal bulk string
/// plus framing slack.
const MAX_REQUEST_SIZE: usize = MAX_BULK_SIZE + 16 * 1024;

const INITIAL_BUFFER_SIZE: usize = 4096;

/// Shared connection counters.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    pub connections_accepted: AtomicU64,
    pub active_connections: AtomicU64,
    pub commands_processed: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    fn add_bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    fn add_bytes_written(&self, count: usize) {
        self.bytes_written.fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Why a connection ended.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol framing error: {0}")]
    Protocol(#[from] ParseError),

    /// Orderly close with an empty buffer.
    #[error("client disconnected")]
    Disconnected,

    /// Stream ended in the middle of a frame.
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// No bytes within [`READ_TIMEOUT`].
    #[error("idle connection timed out")]
    IdleTimeout,

    /// Reply did not drain within [`WRITE_TIMEOUT`].
    #[error("write timed out")]
    WriteTimeout,

    #[error("request exceeds buffer limit")]
    BufferFull,
}

/// State for one client connection.
pub struct ConnectionHandler {
    stream: BufWriter<TcpStream>,
    addr: SocketAddr,
    buffer: BytesMut,
    commands: CommandHandler,
    parser: Parser,
    stats: Arc<ConnectionStats>,
}

impl ConnectionHandler {
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        commands: CommandHandler,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        stats.connection_opened();
        Self {
            stream: BufWriter::new(stream),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            commands,
            parser: Parser::new(),
            stats,
        }
    }

    /// Serves the connection until the client goes away or a transport
    /// error ends it.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(client = %self.addr, "client connected");

        let result = self.main_loop().await;

        match &result {
            Ok(()) | Err(ConnectionError::Disconnected) => {
                debug!(client = %self.addr, "client disconnected")
            }
            Err(ConnectionError::IdleTimeout) => {
                debug!(client = %self.addr, "closing idle connection")
            }
            Err(ConnectionError::Io(e)) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                debug!(client = %self.addr, "connection reset by client")
            }
            Err(e) => warn!(client = %self.addr, error = %e, "connection error"),
        }

        self.stats.connection_closed();
        result
    }

    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            self.drain_buffer().await?;
            self.fill_buffer().await?;
        }
    }

    /// Parses and answers every complete request currently buffered.
    /// Replies go out in arrival order, which keeps pipelining safe.
    async fn drain_buffer(&mut self) -> Result<(), ConnectionError> {
        loop {
            match self.parser.parse(&self.buffer) {
                Ok(Some((frame, consumed))) => {
                    self.buffer.advance(consumed);
                    trace!(client = %self.addr, consumed, "request parsed");
                    let reply = self.commands.execute(frame);
                    self.stats.command_processed();
                    self.write_reply(&reply).await?;
                }
                Ok(None) => return Ok(()),
                Err(e) => match e.recoverable_skip() {
                    Some(skip) => {
                        self.buffer.advance(skip);
                        if matches!(e, ParseError::EmptyInline { .. }) {
                            continue;
                        }
                        warn!(client = %self.addr, error = %e, "skipped malformed frame");
                        self.write_reply(&Frame::error("ERR protocol error")).await?;
                    }
                    None => {
                        warn!(client = %self.addr, error = %e, "unrecoverable framing error");
                        // Best effort; the connection dies either way.
                        let _ = self.write_reply(&Frame::error("ERR protocol error")).await;
                        return Err(ConnectionError::Protocol(e));
                    }
                },
            }
        }
    }

    /// Reads more bytes, bounded by the idle deadline.
    async fn fill_buffer(&mut self) -> Result<(), ConnectionError> {
        if self.buffer.len() >= MAX_REQUEST_SIZE {
            return Err(ConnectionError::BufferFull);
        }

        let read = self.stream.get_mut().read_buf(&mut self.buffer);
        let n = match timeout(READ_TIMEOUT, read).await {
            Ok(result) => result?,
            Err(_) => return Err(ConnectionError::IdleTimeout),
        };

        if n == 0 {
            if self.buffer.is_empty() {
                return Err(ConnectionError::Disconnected);
            }
            return Err(ConnectionError::UnexpectedEof);
        }

        self.stats.add_bytes_read(n);
        Ok(())
    }

    /// Serializes and writes one reply, bounded by the write deadline.
    async fn write_reply(&mut self, reply: &Frame) -> Result<(), ConnectionError> {
        let bytes = reply.serialize();
        let write = async {
            self.stream.write_all(&bytes).await?;
            self.stream.flush().await
        };
        timeout(WRITE_TIMEOUT, write)
            .await
            .map_err(|_| ConnectionError::WriteTimeout)??;
        self.stats.add_bytes_written(bytes.len());
        Ok(())
    }
}

/// Runs one client connection to completion; the entry point spawned by
/// the accept loop.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    commands: CommandHandler,
    stats: Arc<ConnectionStats>,
) {
    let handler = ConnectionHandler::new(stream, addr, commands, stats);
    // run() already logged the cause at an appropriate level.
    let _ = handler.run().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Store;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn spawn_server() -> (SocketAddr, Arc<Store>, Arc<ConnectionStats>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let store = Arc::new(Store::new());
        let stats = Arc::new(ConnectionStats::new());

        let store_handle = Arc::clone(&store);
        let stats_handle = Arc::clone(&stats);
        tokio::spawn(async move {
            while let Ok((stream, client_addr)) = listener.accept().await {
                let commands = CommandHandler::new(Arc::clone(&store_handle));
                let stats = Arc::clone(&stats_handle);
                tokio::spawn(handle_connection(stream, client_addr, commands, stats));
            }
        });

        (addr, store, stats)
    }

    /// Sends a request and asserts the exact reply bytes.
    async fn expect(client: &mut TcpStream, request: &[u8], reply: &[u8]) {
        client.write_all(request).await.unwrap();
        let mut buf = vec![0u8; reply.len()];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(
            buf,
            reply,
            "got {:?}, want {:?}",
            String::from_utf8_lossy(&buf),
            String::from_utf8_lossy(reply)
        );
    }

    const WRONGTYPE: &[u8] =
        b"-WRONGTYPE Operation against a key holding the wrong kind of value\r\n";

    #[tokio::test]
    async fn ping_pong() {
        let (addr, _, _) = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        expect(&mut client, b"*1\r\n$4\r\nPING\r\n", b"+PONG\r\n").await;
    }

    #[tokio::test]
    async fn inline_commands() {
        let (addr, _, _) = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        expect(&mut client, b"PING\r\n", b"+PONG\r\n").await;
        expect(&mut client, b"SET greeting hello\r\n", b"+OK\r\n").await;
        expect(&mut client, b"GET greeting\r\n", b"$5\r\nhello\r\n").await;
    }

    #[tokio::test]
    async fn blank_inline_line_is_ignored() {
        let (addr, _, _) = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        expect(&mut client, b"\r\nPING\r\n", b"+PONG\r\n").await;
    }

    #[tokio::test]
    async fn set_get_del_lifecycle() {
        let (addr, _, _) = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        expect(
            &mut client,
            b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n",
            b"+OK\r\n",
        )
        .await;
        expect(&mut client, b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n", b"$3\r\nbar\r\n").await;
        expect(&mut client, b"*2\r\n$3\r\nDEL\r\n$3\r\nfoo\r\n", b":1\r\n").await;
        expect(&mut client, b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n", b"$-1\r\n").await;
    }

    #[tokio::test]
    async fn counter_lifecycle() {
        let (addr, _, _) = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        expect(&mut client, b"INCR ctr\r\n", b":1\r\n").await;
        expect(&mut client, b"INCR ctr\r\n", b":2\r\n").await;
        expect(&mut client, b"INCR ctr\r\n", b":3\r\n").await;
        expect(&mut client, b"GET ctr\r\n", b"$1\r\n3\r\n").await;

        expect(&mut client, b"SET ctr abc\r\n", b"+OK\r\n").await;
        expect(
            &mut client,
            b"INCR ctr\r\n",
            b"-ERR value is not an integer or out of range\r\n",
        )
        .await;
    }

    #[tokio::test]
    async fn list_lifecycle() {
        let (addr, _, _) = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        expect(&mut client, b"LPUSH L a b c\r\n", b":3\r\n").await;
        expect(
            &mut client,
            b"LRANGE L 0 -1\r\n",
            b"*3\r\n$1\r\nc\r\n$1\r\nb\r\n$1\r\na\r\n",
        )
        .await;
        expect(&mut client, b"LPOP L 2\r\n", b"*2\r\n$1\r\nc\r\n$1\r\nb\r\n").await;
        expect(&mut client, b"LLEN L\r\n", b":1\r\n").await;
        expect(&mut client, b"LPOP L 5\r\n", b"*1\r\n$1\r\na\r\n").await;
        // Drained, so the key is gone.
        expect(&mut client, b"GET L\r\n", b"$-1\r\n").await;
    }

    #[tokio::test]
    async fn wrongtype_in_both_directions() {
        let (addr, _, _) = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        expect(&mut client, b"LPUSH L x\r\n", b":1\r\n").await;
        expect(&mut client, b"GET L\r\n", WRONGTYPE).await;

        expect(&mut client, b"SET s v\r\n", b"+OK\r\n").await;
        expect(&mut client, b"LPUSH s x\r\n", WRONGTYPE).await;
    }

    #[tokio::test]
    async fn expire_then_lazy_eviction() {
        let (addr, _, _) = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        expect(&mut client, b"SET k v\r\n", b"+OK\r\n").await;
        expect(&mut client, b"EXPIRE k 1\r\n", b":1\r\n").await;

        tokio::time::sleep(Duration::from_millis(1100)).await;

        expect(&mut client, b"GET k\r\n", b"$-1\r\n").await;
        expect(&mut client, b"TTL k\r\n", b":-2\r\n").await;
    }

    #[tokio::test]
    async fn expire_gt_option_over_the_wire() {
        let (addr, _, _) = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        expect(&mut client, b"SET k v\r\n", b"+OK\r\n").await;
        expect(&mut client, b"EXPIRE k 10\r\n", b":1\r\n").await;
        expect(&mut client, b"EXPIRE k 5 GT\r\n", b":0\r\n").await;
        expect(&mut client, b"EXPIRE k 20 GT\r\n", b":1\r\n").await;

        client.write_all(b"TTL k\r\n").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert!(
            &buf == b":20\r\n" || &buf == b":19\r\n",
            "unexpected ttl reply {:?}",
            String::from_utf8_lossy(&buf)
        );
    }

    #[tokio::test]
    async fn pipelined_requests_answered_in_order() {
        let (addr, _, _) = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        expect(
            &mut client,
            b"*3\r\n$3\r\nSET\r\n$2\r\nk1\r\n$2\r\nv1\r\n\
              *3\r\n$3\r\nSET\r\n$2\r\nk2\r\n$2\r\nv2\r\n\
              *2\r\n$3\r\nGET\r\n$2\r\nk1\r\n\
              *2\r\n$3\r\nGET\r\n$2\r\nk2\r\n",
            b"+OK\r\n+OK\r\n$2\r\nv1\r\n$2\r\nv2\r\n",
        )
        .await;
    }

    #[tokio::test]
    async fn unknown_command_reply() {
        let (addr, _, _) = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        expect(
            &mut client,
            b"TELEPORT here\r\n",
            b"-ERR unknown command 'TELEPORT'\r\n",
        )
        .await;
    }

    #[tokio::test]
    async fn recoverable_protocol_error_keeps_connection() {
        let (addr, _, _) = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        // A bulk with a bad length line resyncs at the next frame.
        expect(&mut client, b"$-5\r\n", b"-ERR protocol error\r\n").await;
        expect(&mut client, b"PING\r\n", b"+PONG\r\n").await;
    }

    #[tokio::test]
    async fn fatal_protocol_error_closes_connection() {
        let (addr, _, _) = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        // Bulk body without its CRLF terminator.
        expect(
            &mut client,
            b"$5\r\nhelloXXPING\r\n",
            b"-ERR protocol error\r\n",
        )
        .await;

        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "server should have closed the connection");
    }

    #[tokio::test]
    async fn non_string_command_name_keeps_connection() {
        let (addr, _, _) = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        expect(&mut client, b"*1\r\n:42\r\n", b"-ERR protocol error\r\n").await;
        expect(&mut client, b"PING\r\n", b"+PONG\r\n").await;
    }

    #[tokio::test]
    async fn stats_track_lifecycle() {
        let (addr, _, stats) = spawn_server().await;

        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);

        let mut client = TcpStream::connect(addr).await.unwrap();
        expect(&mut client, b"PING\r\n", b"+PONG\r\n").await;

        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 1);
        assert!(stats.commands_processed.load(Ordering::Relaxed) >= 1);
        assert!(stats.bytes_read.load(Ordering::Relaxed) > 0);
        assert!(stats.bytes_written.load(Ordering::Relaxed) > 0);

        drop(client);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
    }
}
