//! HTTP responses — the fixed documents and the success response.

use std::io::{self, Write};

use crate::buffer::ReleasedBlock;

/// Media type of every fixed response.
pub const XML_CONTENT_TYPE: &str = "application/xml";

/// The only resource answering `GET`.
pub const ROOT_PATH: &str = "/";

pub const ROOT_DOCUMENT: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
<mws:status xmlns:mws=\"http://www.mathweb.org/mws/ns\">\
formula search daemon is running; POST queries to this address\
</mws:status>\n";

pub const METHOD_NOT_ALLOWED_DOCUMENT: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
<mws:error xmlns:mws=\"http://www.mathweb.org/mws/ns\">method not allowed</mws:error>\n";

pub const BAD_QUERY_DOCUMENT: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
<mws:error xmlns:mws=\"http://www.mathweb.org/mws/ns\">bad query</mws:error>\n";

pub const SERVER_ERROR_DOCUMENT: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
<mws:error xmlns:mws=\"http://www.mathweb.org/mws/ns\">server error</mws:error>\n";

pub const UNAVAILABLE_DOCUMENT: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
<mws:error xmlns:mws=\"http://www.mathweb.org/mws/ns\">too many connections</mws:error>\n";

/// Response body: a fixed document or memory released from a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Static(&'static str),
    Released(ReleasedBlock),
}

impl Body {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Body::Static(text) => text.as_bytes(),
            Body::Released(block) => block.as_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A complete HTTP response ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

impl HttpResponse {
    fn fixed(status: u16, document: &'static str) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), XML_CONTENT_TYPE.to_string())],
            body: Body::Static(document),
        }
    }

    /// Pre-flight (`OPTIONS`) answer.
    pub fn options(is_root: bool) -> Self {
        let mut response = Self::fixed(200, "");
        response
            .with_header("Access-Control-Allow-Origin", "*")
            .with_header("Access-Control-Allow-Methods", allowed_methods(is_root))
            .with_header("Access-Control-Allow-Headers", "Content-Type")
            .with_header("Access-Control-Max-Age", "1728000");
        response
    }

    /// Informational document served on `GET /`.
    pub fn root_info() -> Self {
        Self::fixed(200, ROOT_DOCUMENT)
    }

    pub fn method_not_allowed(is_root: bool) -> Self {
        let mut response = Self::fixed(405, METHOD_NOT_ALLOWED_DOCUMENT);
        response.with_header("Allow", allowed_methods(is_root));
        response
    }

    pub fn bad_query() -> Self {
        Self::fixed(400, BAD_QUERY_DOCUMENT)
    }

    pub fn server_error() -> Self {
        Self::fixed(500, SERVER_ERROR_DOCUMENT)
    }

    /// Sent by the transport when the connection limit is reached.
    pub fn service_unavailable() -> Self {
        Self::fixed(503, UNAVAILABLE_DOCUMENT)
    }

    /// Successful answer owning the formatter's output.
    pub fn answer(content_type: &str, body: ReleasedBlock) -> Self {
        let mut response = Self {
            status: 200,
            headers: Vec::new(),
            body: Body::Released(body),
        };
        response
            .with_header("Content-Type", content_type)
            .with_header("Access-Control-Allow-Origin", "*")
            .with_header("Cache-Control", "no-cache, must-revalidate");
        response
    }

    pub fn with_header(&mut self, name: &str, value: &str) -> &mut Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// First value of header `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Serialize as an HTTP/1.1 message; the connection is closed afterwards.
    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        write!(out, "HTTP/1.1 {} {}\r\n", self.status, reason_phrase(self.status))?;
        for (name, value) in &self.headers {
            write!(out, "{}: {}\r\n", name, value)?;
        }
        write!(out, "Content-Length: {}\r\n", self.body.len())?;
        out.write_all(b"Connection: close\r\n\r\n")?;
        out.write_all(self.body.as_bytes())?;
        out.flush()
    }
}

fn allowed_methods(is_root: bool) -> &'static str {
    if is_root {
        "GET, POST, OPTIONS"
    } else {
        "POST, OPTIONS"
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
