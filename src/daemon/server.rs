//! Daemon server — HTTP engine with one thread per connection.
//!
//! The engine thread accepts connections, applies the admission limit and
//! hands each admitted socket to its own thread. That thread parses the
//! request head with `httparse`, feeds the body to a [`RequestPipeline`]
//! and writes back whatever response the pipeline produces.

use std::io::{self, BufRead, BufReader, Read};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::handler::QueryHandler;
use super::pipeline::{RequestPipeline, ServiceContext, Signal};
use super::responses::HttpResponse;
use crate::config::{DaemonConfig, CONNECTION_LIMIT};
use crate::error::{DaemonError, Result};
use crate::format::ResponseFormatter;
use crate::types::QueryDialect;

/// Maximum number of request headers.
const MAX_HEADERS: usize = 64;

/// Largest accepted request head.
const MAX_HEAD_BYTES: usize = 16384;

/// Longest accepted chunk-size line of a chunked body.
const MAX_CHUNK_HEAD: u64 = 128;

/// Bytes handed to the pipeline per body chunk.
const CHUNK_SIZE: usize = 8192;

/// Idle limit on a single socket read or write.
const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection-level failures; they end one connection and nothing else.
#[derive(Debug, Error)]
enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("client disconnected")]
    Disconnected,

    #[error("malformed request: {0}")]
    BadRequest(String),
}

impl From<httparse::Error> for TransportError {
    fn from(e: httparse::Error) -> Self {
        TransportError::BadRequest(e.to_string())
    }
}

/// How the request body is framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    Length(usize),
    Chunked,
}

/// Owned summary of a parsed request head.
#[derive(Debug)]
struct RequestHead {
    method: String,
    path: String,
    framing: BodyFraming,
    expect_continue: bool,
    /// Size of the head in bytes, terminating blank line included
    len: usize,
}

/// A running daemon. Dropping it stops the engine.
pub struct Daemon {
    local_addr: SocketAddr,
    dialect: QueryDialect,
    shutdown: Arc<AtomicBool>,
    engine: Option<JoinHandle<()>>,
}

/// Collects what a daemon needs before it starts listening.
pub struct DaemonBuilder {
    handler: Option<Arc<dyn QueryHandler>>,
    formatter: Option<Arc<dyn ResponseFormatter>>,
    dialect: QueryDialect,
    config: DaemonConfig,
}

impl Daemon {
    pub fn builder() -> DaemonBuilder {
        DaemonBuilder {
            handler: None,
            formatter: None,
            dialect: QueryDialect::Generic,
            config: DaemonConfig::default(),
        }
    }

    /// Address the engine is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn dialect(&self) -> QueryDialect {
        self.dialect
    }

    /// Block until the engine thread exits.
    pub fn wait(mut self) -> Result<()> {
        if let Some(engine) = self.engine.take() {
            engine
                .join()
                .map_err(|_| DaemonError::Thread("engine thread panicked".to_string()))?;
        }
        Ok(())
    }

    /// Stop accepting connections and release the listener.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(engine) = self.engine.take() else {
            return;
        };
        self.shutdown.store(true, Ordering::SeqCst);
        // Unblock the accept call so the engine sees the flag.
        let _ = TcpStream::connect_timeout(&wake_addr(self.local_addr), Duration::from_secs(1));
        if engine.join().is_err() {
            error!("engine thread panicked");
        }
        info!(addr = %self.local_addr, "daemon stopped");
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.stop();
    }
}

impl DaemonBuilder {
    /// Bind the query handler.
    pub fn handler<H: QueryHandler + 'static>(self, handler: H) -> Self {
        self.shared_handler(Arc::new(handler))
    }

    /// Bind an already shared query handler.
    pub fn shared_handler(mut self, handler: Arc<dyn QueryHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Format every answer set with `formatter`, whatever the query asks for.
    pub fn formatter<F: ResponseFormatter + 'static>(mut self, formatter: F) -> Self {
        self.formatter = Some(Arc::new(formatter));
        self
    }

    pub fn dialect(mut self, dialect: QueryDialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn config(mut self, config: DaemonConfig) -> Self {
        self.config = config;
        self
    }

    /// Bind the port and start serving.
    pub fn start(self) -> Result<Daemon> {
        let handler = self.handler.ok_or(DaemonError::MissingHandler)?;

        let ip = if self.config.enable_ipv6 {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
        let addr = SocketAddr::new(ip, self.config.port);
        let listener =
            TcpListener::bind(addr).map_err(|source| DaemonError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let context = Arc::new(ServiceContext {
            handler,
            dialect: self.dialect,
            max_body_bytes: self.config.max_body_bytes,
            formatter: self.formatter,
        });
        let shutdown = Arc::new(AtomicBool::new(false));

        let engine = {
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("mathdex-engine".to_string())
                .spawn(move || accept_loop(listener, context, shutdown))
                .map_err(|e| DaemonError::Thread(e.to_string()))?
        };

        info!(
            addr = %local_addr,
            dialect = %self.dialect,
            connection_limit = CONNECTION_LIMIT,
            "daemon listening"
        );

        Ok(Daemon {
            local_addr,
            dialect: self.dialect,
            shutdown,
            engine: Some(engine),
        })
    }
}

/// Every peer is welcome.
fn accept_policy(_peer: &SocketAddr) -> bool {
    true
}

/// Address used to wake a listener bound to `local`.
fn wake_addr(local: SocketAddr) -> SocketAddr {
    let ip = match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, local.port())
}

/// Decrements the active-connection count when the connection ends.
struct ConnectionSlot {
    active: Arc<AtomicUsize>,
}

impl ConnectionSlot {
    fn acquire(active: &Arc<AtomicUsize>) -> Option<Self> {
        active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < CONNECTION_LIMIT).then_some(n + 1)
            })
            .ok()
            .map(|_| Self {
                active: Arc::clone(active),
            })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

fn accept_loop(listener: TcpListener, context: Arc<ServiceContext>, shutdown: Arc<AtomicBool>) {
    let active = Arc::new(AtomicUsize::new(0));

    for stream in listener.incoming() {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "accept error");
                continue;
            }
        };
        let peer = match stream.peer_addr() {
            Ok(peer) => peer,
            Err(e) => {
                debug!(error = %e, "peer vanished before accept");
                continue;
            }
        };
        if !accept_policy(&peer) {
            continue;
        }

        let Some(slot) = ConnectionSlot::acquire(&active) else {
            warn!(peer = %peer, limit = CONNECTION_LIMIT, "connection limit reached");
            reject(stream);
            continue;
        };

        let context = Arc::clone(&context);
        let spawned = thread::Builder::new()
            .name("mathdex-conn".to_string())
            .spawn(move || {
                let _slot = slot;
                if let Err(e) = handle_connection(stream, &context) {
                    debug!(peer = %peer, error = %e, "connection ended with error");
                }
            });
        if let Err(e) = spawned {
            error!(error = %e, "failed to spawn connection thread");
        }
    }

    debug!("accept loop finished");
}

fn reject(mut stream: TcpStream) {
    let _ = stream.set_write_timeout(Some(IO_TIMEOUT));
    if let Err(e) = HttpResponse::service_unavailable().write_to(&mut stream) {
        debug!(error = %e, "failed to send rejection");
    }
}

/// Serve one request on `stream`.
fn handle_connection(
    mut stream: TcpStream,
    context: &Arc<ServiceContext>,
) -> std::result::Result<(), TransportError> {
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;
    let mut reader = BufReader::new(stream.try_clone()?);

    let head = match read_head(&mut reader) {
        Ok(head) => head,
        Err(TransportError::BadRequest(reason)) => {
            debug!(reason = %reason, "rejecting malformed request");
            HttpResponse::bad_query().write_to(&mut stream)?;
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    debug!(method = %head.method, path = %head.path, "request received");

    let mut pipeline = RequestPipeline::new(Arc::clone(context));
    match pipeline.begin(&head.method, &head.path) {
        Signal::Continue => {}
        Signal::Reply(response) => return send(&mut stream, &response),
        Signal::Abort => return Ok(()),
    }

    if head.expect_continue {
        io::Write::write_all(&mut stream, b"HTTP/1.1 100 Continue\r\n\r\n")?;
    }

    let delivered = match head.framing {
        BodyFraming::Length(len) => deliver_fixed(&mut reader, len, &mut pipeline),
        BodyFraming::Chunked => deliver_chunked(&mut reader, &mut pipeline),
    };
    match delivered {
        Ok(true) => {}
        Ok(false) => return Ok(()),
        Err(TransportError::BadRequest(reason)) => {
            debug!(reason = %reason, "rejecting malformed body framing");
            pipeline.abort();
            return send(&mut stream, &HttpResponse::bad_query());
        }
        Err(e) => {
            pipeline.abort();
            return Err(e);
        }
    }

    match pipeline.on_end() {
        Signal::Reply(response) => send(&mut stream, &response),
        Signal::Continue | Signal::Abort => Ok(()),
    }
}

fn send(
    stream: &mut TcpStream,
    response: &HttpResponse,
) -> std::result::Result<(), TransportError> {
    response.write_to(stream)?;
    debug!(status = response.status, bytes = response.body.len(), "response sent");
    Ok(())
}

/// Read and parse the request head, leaving the body in `reader`.
fn read_head<R: BufRead>(reader: &mut R) -> std::result::Result<RequestHead, TransportError> {
    let mut buf: Vec<u8> = Vec::new();
    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            return Err(TransportError::Disconnected);
        }
        let before = buf.len();
        buf.extend_from_slice(available);
        let read = available.len();

        if let Some(head) = parse_head(&buf)? {
            reader.consume(head.len - before);
            return Ok(head);
        }
        reader.consume(read);
        if buf.len() > MAX_HEAD_BYTES {
            return Err(TransportError::BadRequest("request head too large".to_string()));
        }
    }
}

/// Parse `buf` as a request head; `None` while it is incomplete.
fn parse_head(buf: &[u8]) -> std::result::Result<Option<RequestHead>, TransportError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    let len = match request.parse(buf)? {
        httparse::Status::Partial => return Ok(None),
        httparse::Status::Complete(len) => len,
    };

    let mut content_length = None;
    let mut chunked = false;
    let mut expect_continue = false;
    for header in request.headers.iter() {
        let value = String::from_utf8_lossy(header.value);
        let value = value.trim();
        if header.name.eq_ignore_ascii_case("content-length") {
            let parsed = value.parse::<usize>().map_err(|_| {
                TransportError::BadRequest(format!("invalid content-length {:?}", value))
            })?;
            content_length = Some(parsed);
        } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = value.to_ascii_lowercase().ends_with("chunked");
        } else if header.name.eq_ignore_ascii_case("expect") {
            expect_continue = value.eq_ignore_ascii_case("100-continue");
        }
    }

    let framing = if chunked {
        BodyFraming::Chunked
    } else {
        BodyFraming::Length(content_length.unwrap_or(0))
    };

    Ok(Some(RequestHead {
        method: request.method.unwrap_or_default().to_string(),
        path: request.path.unwrap_or_default().to_string(),
        framing,
        expect_continue,
        len,
    }))
}

/// Feed exactly `remaining` bytes to the pipeline. `false` = pipeline aborted.
fn deliver_fixed<R: Read>(
    reader: &mut R,
    mut remaining: usize,
    pipeline: &mut RequestPipeline,
) -> std::result::Result<bool, TransportError> {
    let mut chunk = [0u8; CHUNK_SIZE];
    while remaining > 0 {
        let want = remaining.min(CHUNK_SIZE);
        let n = reader.read(&mut chunk[..want])?;
        if n == 0 {
            return Err(TransportError::Disconnected);
        }
        remaining -= n;
        if !matches!(pipeline.on_chunk(&chunk[..n]), Signal::Continue) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Decode a chunked body into the pipeline. `false` = pipeline aborted.
fn deliver_chunked<R: BufRead>(
    reader: &mut R,
    pipeline: &mut RequestPipeline,
) -> std::result::Result<bool, TransportError> {
    let mut line = Vec::new();
    loop {
        read_chunk_line(reader, &mut line)?;
        let size = match httparse::parse_chunk_size(&line) {
            Ok(httparse::Status::Complete((_, size))) => size,
            _ => {
                return Err(TransportError::BadRequest(format!(
                    "invalid chunk size line {:?}",
                    String::from_utf8_lossy(&line)
                )))
            }
        };

        if size == 0 {
            // Trailer section ends with an empty line.
            loop {
                read_chunk_line(reader, &mut line)?;
                if line == b"\r\n" || line == b"\n" {
                    return Ok(true);
                }
            }
        }

        let size = usize::try_from(size)
            .map_err(|_| TransportError::BadRequest(format!("chunk of {} bytes", size)))?;
        if !deliver_fixed(reader, size, pipeline)? {
            return Ok(false);
        }

        let mut terminator = [0u8; 2];
        reader.read_exact(&mut terminator).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => TransportError::Disconnected,
            _ => TransportError::Io(e),
        })?;
        if &terminator != b"\r\n" {
            return Err(TransportError::BadRequest(
                "chunk data not followed by CRLF".to_string(),
            ));
        }
    }
}

/// Read one line of chunk framing, newline included, into `line`.
fn read_chunk_line<R: BufRead>(
    reader: &mut R,
    line: &mut Vec<u8>,
) -> std::result::Result<(), TransportError> {
    line.clear();
    let n = reader.by_ref().take(MAX_CHUNK_HEAD).read_until(b'\n', line)?;
    if n == 0 {
        return Err(TransportError::Disconnected);
    }
    if line.last() != Some(&b'\n') {
        return Err(TransportError::BadRequest("chunk framing line too long".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::handler::EchoHandler;
    use crate::daemon::pipeline::PipelineState;

    fn pipeline() -> RequestPipeline {
        let mut pipeline = RequestPipeline::new(Arc::new(ServiceContext {
            handler: Arc::new(EchoHandler),
            dialect: QueryDialect::Generic,
            max_body_bytes: None,
            formatter: None,
        }));
        pipeline.begin("POST", "/");
        pipeline
    }

    #[test]
    fn test_parse_head_complete() {
        let raw = b"POST /query HTTP/1.1\r\nHost: x\r\nContent-Length: 12\r\n\r\n<mws:query/>";
        let head = parse_head(raw).unwrap().unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(head.path, "/query");
        assert_eq!(head.framing, BodyFraming::Length(12));
        assert!(!head.expect_continue);
        assert_eq!(&raw[head.len..], b"<mws:query/>");
    }

    #[test]
    fn test_parse_head_partial() {
        assert!(parse_head(b"POST / HTTP/1.1\r\nHost").unwrap().is_none());
    }

    #[test]
    fn test_parse_head_chunked_and_expect() {
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\nExpect: 100-continue\r\n\r\n";
        let head = parse_head(raw).unwrap().unwrap();
        assert_eq!(head.framing, BodyFraming::Chunked);
        assert!(head.expect_continue);
    }

    #[test]
    fn test_parse_head_rejects_bad_length() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: lots\r\n\r\n";
        assert!(matches!(parse_head(raw), Err(TransportError::BadRequest(_))));
    }

    #[test]
    fn test_read_head_leaves_body() {
        let raw: &[u8] = b"GET / HTTP/1.1\r\nContent-Length: 4\r\n\r\nbody";
        let mut reader = BufReader::with_capacity(8, raw);
        let head = read_head(&mut reader).unwrap();
        assert_eq!(head.method, "GET");
        let mut rest = String::new();
        reader.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "body");
    }

    #[test]
    fn test_read_head_disconnect() {
        let mut reader = BufReader::new(&b"POST / HT"[..]);
        assert!(matches!(read_head(&mut reader), Err(TransportError::Disconnected)));
    }

    #[test]
    fn test_deliver_fixed_short_input() {
        let mut p = pipeline();
        let mut input: &[u8] = b"abc";
        assert!(matches!(
            deliver_fixed(&mut input, 10, &mut p),
            Err(TransportError::Disconnected)
        ));
    }

    #[test]
    fn test_deliver_chunked_body() {
        let mut p = pipeline();
        let body = "<mws:query><mws:expr><m:ci>x</m:ci></mws:expr></mws:query>";
        let (a, b) = body.split_at(20);
        let encoded = format!(
            "{:x}\r\n{}\r\n{:x};ext=1\r\n{}\r\n0\r\nTrailer: v\r\n\r\n",
            a.len(),
            a,
            b.len(),
            b
        );
        let mut reader = BufReader::new(encoded.as_bytes());

        assert!(deliver_chunked(&mut reader, &mut p).unwrap());
        assert_eq!(p.state(), PipelineState::Accumulating);
        match p.on_end() {
            Signal::Reply(response) => assert_eq!(response.status, 200),
            other => panic!("unexpected signal {:?}", other),
        }
    }

    #[test]
    fn test_deliver_chunked_requires_crlf_after_data() {
        let mut p = pipeline();
        let mut reader = BufReader::new(&b"3\r\nabcGARBAGE\r\n0\r\n\r\n"[..]);
        assert!(matches!(
            deliver_chunked(&mut reader, &mut p),
            Err(TransportError::BadRequest(_))
        ));
    }

    #[test]
    fn test_deliver_chunked_truncated_terminator() {
        let mut p = pipeline();
        let mut reader = BufReader::new(&b"3\r\nabc\r"[..]);
        assert!(matches!(
            deliver_chunked(&mut reader, &mut p),
            Err(TransportError::Disconnected)
        ));
    }

    #[test]
    fn test_deliver_chunked_bad_size() {
        let mut p = pipeline();
        let mut reader = BufReader::new(&b"zz\r\nabc\r\n"[..]);
        assert!(matches!(
            deliver_chunked(&mut reader, &mut p),
            Err(TransportError::BadRequest(_))
        ));
    }

    #[test]
    fn test_wake_addr_uses_loopback() {
        let v4: SocketAddr = "0.0.0.0:9090".parse().unwrap();
        assert_eq!(wake_addr(v4), "127.0.0.1:9090".parse().unwrap());
        let v6: SocketAddr = "[::]:9090".parse().unwrap();
        assert_eq!(wake_addr(v6), "[::1]:9090".parse().unwrap());
    }

    #[test]
    fn test_connection_slots_bounded() {
        let active = Arc::new(AtomicUsize::new(0));
        let slots: Vec<_> = (0..CONNECTION_LIMIT)
            .map(|_| ConnectionSlot::acquire(&active).unwrap())
            .collect();
        assert!(ConnectionSlot::acquire(&active).is_none());
        drop(slots);
        assert_eq!(active.load(Ordering::SeqCst), 0);
        assert!(ConnectionSlot::acquire(&active).is_some());
    }
}
