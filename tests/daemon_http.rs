//! End-to-end tests: a real daemon on an ephemeral port, driven over TCP.

use mathdex::format::JsonResponseFormatter;
use mathdex::{
    AnswerSet, Daemon, DaemonConfig, DaemonError, EchoHandler, Hit, Query, QueryDialect,
    CONNECTION_LIMIT,
};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

const QUERY: &str = "<mws:query answsize=\"5\"><mws:expr><m:apply><m:eq/>\
                     <mws:qvar>x</mws:qvar><m:cn>1</m:cn></m:apply></mws:expr></mws:query>";

struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl Reply {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn ephemeral() -> DaemonConfig {
    DaemonConfig {
        port: 0,
        ..DaemonConfig::default()
    }
}

fn start(dialect: QueryDialect) -> Daemon {
    Daemon::builder()
        .handler(EchoHandler)
        .dialect(dialect)
        .config(ephemeral())
        .start()
        .unwrap()
}

fn loopback(daemon: &Daemon) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], daemon.local_addr().port()))
}

fn connect(daemon: &Daemon) -> TcpStream {
    let stream = TcpStream::connect(loopback(daemon)).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    stream
}

fn exchange(daemon: &Daemon, raw: &[u8]) -> Reply {
    let mut stream = connect(daemon);
    stream.write_all(raw).unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    parse_reply(&response)
}

fn post(daemon: &Daemon, body: &str) -> Reply {
    let raw = format!(
        "POST / HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/xml\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    exchange(daemon, raw.as_bytes())
}

fn parse_reply(raw: &[u8]) -> Reply {
    let text = String::from_utf8(raw.to_vec()).unwrap();
    let (head, body) = text.split_once("\r\n\r\n").unwrap();
    let mut lines = head.split("\r\n");
    let status = lines.next().unwrap().split(' ').nth(1).unwrap().parse().unwrap();
    let headers = lines
        .filter_map(|line| line.split_once(": "))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Reply {
        status,
        headers,
        body: body.to_string(),
    }
}

#[test]
fn test_get_root_serves_status_document() {
    let daemon = start(QueryDialect::Generic);
    let reply = exchange(&daemon, b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");

    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("Content-Type"), Some("application/xml"));
    assert!(reply.body.contains("running"));
    assert_eq!(reply.header("Connection"), Some("close"));
}

#[test]
fn test_options_preflight() {
    let daemon = start(QueryDialect::Generic);
    let reply = exchange(&daemon, b"OPTIONS / HTTP/1.1\r\nHost: localhost\r\n\r\n");

    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("Access-Control-Allow-Origin"), Some("*"));
    assert_eq!(reply.header("Content-Length"), Some("0"));
    assert!(reply.body.is_empty());
}

#[test]
fn test_unsupported_method_is_405() {
    let daemon = start(QueryDialect::Generic);
    let reply = exchange(&daemon, b"DELETE / HTTP/1.1\r\nHost: localhost\r\n\r\n");

    assert_eq!(reply.status, 405);
    assert_eq!(reply.header("Allow"), Some("GET, POST, OPTIONS"));
}

#[test]
fn test_post_query_returns_answer_set() {
    let daemon = start(QueryDialect::Generic);
    let reply = post(&daemon, QUERY);

    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("Content-Type"), Some("application/xml"));
    assert_eq!(reply.header("Access-Control-Allow-Origin"), Some("*"));
    assert_eq!(reply.header("Cache-Control"), Some("no-cache, must-revalidate"));
    assert!(reply.body.contains("<mws:qvar name=\"x\" xpath=\"/*[2]\"/>"));
    assert_eq!(
        reply.header("Content-Length"),
        Some(reply.body.len().to_string().as_str())
    );
}

#[test]
fn test_query_without_expressions_is_400() {
    let daemon = start(QueryDialect::Generic);
    let reply = post(&daemon, "<mws:query/>");

    assert_eq!(reply.status, 400);
    assert_eq!(reply.header("Content-Type"), Some("application/xml"));
}

#[test]
fn test_malformed_body_is_400() {
    let daemon = start(QueryDialect::Generic);
    let reply = post(&daemon, "<mws:query><mws:expr><m:ci>x</mws:query>");
    assert_eq!(reply.status, 400);
}

#[test]
fn test_handler_failure_is_500() {
    let daemon = Daemon::builder()
        .handler(|_: &Query| -> Option<AnswerSet> { None })
        .config(ephemeral())
        .start()
        .unwrap();
    let reply = post(&daemon, QUERY);

    assert_eq!(reply.status, 500);
    assert_eq!(reply.header("Content-Type"), Some("application/xml"));
}

#[test]
fn test_chunked_body() {
    let daemon = start(QueryDialect::Generic);
    let (a, b) = QUERY.split_at(30);
    let raw = format!(
        "POST / HTTP/1.1\r\nHost: localhost\r\nTransfer-Encoding: chunked\r\n\r\n{:x}\r\n{}\r\n{:x}\r\n{}\r\n0\r\n\r\n",
        a.len(),
        a,
        b.len(),
        b
    );
    let reply = exchange(&daemon, raw.as_bytes());

    assert_eq!(reply.status, 200);
    assert!(reply.body.contains("name=\"x\""));
}

#[test]
fn test_chunk_without_crlf_is_400() {
    let daemon = start(QueryDialect::Generic);
    let raw = "POST / HTTP/1.1\r\nHost: localhost\r\nTransfer-Encoding: chunked\r\n\r\n\
               3\r\nabcGARBAGE\r\n0\r\n\r\n";
    let reply = exchange(&daemon, raw.as_bytes());

    assert_eq!(reply.status, 400);
    assert_eq!(reply.header("Content-Type"), Some("application/xml"));
}

#[test]
fn test_expect_continue() {
    let daemon = start(QueryDialect::Generic);
    let mut stream = connect(&daemon);
    let head = format!(
        "POST / HTTP/1.1\r\nHost: localhost\r\nExpect: 100-continue\r\nContent-Length: {}\r\n\r\n",
        QUERY.len()
    );
    stream.write_all(head.as_bytes()).unwrap();

    let interim = b"HTTP/1.1 100 Continue\r\n\r\n";
    let mut buf = vec![0u8; interim.len()];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(buf, interim);

    stream.write_all(QUERY.as_bytes()).unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    assert_eq!(parse_reply(&response).status, 200);
}

#[test]
fn test_schema_dialect_answers_json() {
    let daemon = Daemon::builder()
        .handler(|_: &Query| {
            let mut answers = AnswerSet::new();
            answers.total = 1;
            answers.push_hit(Hit {
                uri: "doc/7".to_string(),
                xpath: "/*[1]".to_string(),
                data: None,
            });
            Some(answers)
        })
        .dialect(QueryDialect::Schema)
        .config(ephemeral())
        .start()
        .unwrap();
    assert_eq!(daemon.dialect(), QueryDialect::Schema);

    let reply = post(&daemon, QUERY);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("Content-Type"), Some("application/json"));

    let value: serde_json::Value = serde_json::from_str(&reply.body).unwrap();
    assert_eq!(value["total"], 1);
    assert_eq!(value["hits"][0]["uri"], "doc/7");
}

#[test]
fn test_formatter_override() {
    let daemon = Daemon::builder()
        .handler(EchoHandler)
        .formatter(JsonResponseFormatter)
        .config(ephemeral())
        .start()
        .unwrap();

    let reply = post(&daemon, QUERY);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("Content-Type"), Some("application/json"));
    let value: serde_json::Value = serde_json::from_str(&reply.body).unwrap();
    assert_eq!(value["qvar_names"][0], "x");
}

#[test]
fn test_oversized_body_drops_connection() {
    let daemon = Daemon::builder()
        .handler(EchoHandler)
        .config(DaemonConfig {
            max_body_bytes: Some(8),
            ..ephemeral()
        })
        .start()
        .unwrap();

    let mut stream = connect(&daemon);
    let raw = format!(
        "POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n{}",
        QUERY.len(),
        QUERY
    );
    let _ = stream.write_all(raw.as_bytes());
    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response);
    assert!(response.is_empty());
}

#[test]
fn test_connection_limit_rejects_with_503() {
    let daemon = start(QueryDialect::Generic);
    let idle: Vec<TcpStream> = (0..CONNECTION_LIMIT).map(|_| connect(&daemon)).collect();

    let mut extra = connect(&daemon);
    let mut response = Vec::new();
    extra.read_to_end(&mut response).unwrap();
    assert_eq!(parse_reply(&response).status, 503);

    drop(idle);
}

#[test]
fn test_missing_handler_fails_to_start() {
    let result = Daemon::builder().config(ephemeral()).start();
    assert!(matches!(result, Err(DaemonError::MissingHandler)));
}

#[test]
fn test_port_in_use_fails_to_start() {
    let first = start(QueryDialect::Generic);
    let result = Daemon::builder()
        .handler(EchoHandler)
        .config(DaemonConfig {
            port: first.local_addr().port(),
            ..DaemonConfig::default()
        })
        .start();

    match result {
        Err(DaemonError::Bind { addr, .. }) => assert_eq!(addr.port(), first.local_addr().port()),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("second daemon bound an occupied port"),
    }
}

#[test]
fn test_shutdown_releases_port() {
    let daemon = start(QueryDialect::Generic);
    let port = daemon.local_addr().port();
    daemon.shutdown();

    let again = Daemon::builder()
        .handler(EchoHandler)
        .config(DaemonConfig {
            port,
            ..DaemonConfig::default()
        })
        .start()
        .unwrap();
    assert_eq!(again.local_addr().port(), port);
}
