//! Sans-IO HTTP/1.1 codec for the HAP request router
//!
//! HAP speaks HTTP-shaped messages on both the plaintext (pairing) and
//! encrypted (attribute) sides of a connection. This codec performs no
//! I/O: `feed()` buffers bytes, `decode()` yields complete requests.

use bytes::BytesMut;
use std::str::{self, FromStr};
use thiserror::Error;

/// Request methods the accessory accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Attribute reads
    Get,
    /// Attribute writes and timed-write preparation
    Put,
    /// Pairing endpoints and identify
    Post,
}

impl Method {
    /// Wire name of the method.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
        }
    }
}

impl FromStr for Method {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(Method::Get),
            "PUT" => Ok(Method::Put),
            "POST" => Ok(Method::Post),
            _ => Err(()),
        }
    }
}

/// Response status codes the accessory emits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCode(pub u16);

impl StatusCode {
    /// 200 OK
    pub const OK: StatusCode = StatusCode(200);
    /// 204 No Content
    pub const NO_CONTENT: StatusCode = StatusCode(204);
    /// 207 Multi-Status
    pub const MULTI_STATUS: StatusCode = StatusCode(207);
    /// 400 Bad Request
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    /// 404 Not Found
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    /// 405 Method Not Allowed
    pub const METHOD_NOT_ALLOWED: StatusCode = StatusCode(405);
    /// 422 Unprocessable Entity
    pub const UNPROCESSABLE: StatusCode = StatusCode(422);
    /// 500 Internal Server Error
    pub const INTERNAL_ERROR: StatusCode = StatusCode(500);

    /// Reason phrase for the status line.
    #[must_use]
    pub fn reason(self) -> &'static str {
        match self.0 {
            200 => "OK",
            204 => "No Content",
            207 => "Multi-Status",
            400 => "Bad Request",
            404 => "Not Found",
            405 => "Method Not Allowed",
            422 => "Unprocessable Entity",
            470 => "Connection Authorization Required",
            500 => "Internal Server Error",
            _ => "Unknown",
        }
    }
}

/// Ordered header collection with case-insensitive lookup.
#[derive(Debug, Default, Clone)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Create an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Look up a header, ignoring name case.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Iterate headers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// A parsed HTTP request.
#[derive(Debug)]
pub struct HttpRequest {
    /// Request method
    pub method: Method,
    /// Request target as received (path plus optional query)
    pub uri: String,
    /// Request headers
    pub headers: Headers,
    /// Request body
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Path component of the target.
    #[must_use]
    pub fn path(&self) -> &str {
        self.uri.split('?').next().unwrap_or(&self.uri)
    }

    /// Query parameters as key/value pairs.
    #[must_use]
    pub fn query(&self) -> Vec<(&str, &str)> {
        let Some((_, query)) = self.uri.split_once('?') else {
            return Vec::new();
        };
        query
            .split('&')
            .filter(|kv| !kv.is_empty())
            .map(|kv| kv.split_once('=').unwrap_or((kv, "")))
            .collect()
    }
}

/// HTTP parsing errors
#[derive(Debug, Error)]
pub enum ParseError {
    /// Malformed request line
    #[error("invalid request line: {0}")]
    InvalidRequestLine(String),

    /// Unsupported method
    #[error("invalid method: {0}")]
    InvalidMethod(String),

    /// Header line without a colon
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// Content-Length was not a number
    #[error("invalid content length")]
    InvalidContentLength,

    /// Declared body exceeds the cap
    #[error("body too large: {0} bytes")]
    BodyTooLarge(usize),

    /// Header bytes were not UTF-8
    #[error("invalid UTF-8 in headers")]
    InvalidUtf8,

    /// Header section exceeded the cap without terminating
    #[error("header section too large")]
    HeadersTooLarge,
}

/// Bodies larger than this are rejected outright; HAP bodies are small.
const MAX_BODY_SIZE: usize = 64 * 1024;

/// Header section cap.
const MAX_HEADER_SIZE: usize = 8 * 1024;

/// Incremental request parser.
pub struct HttpServerCodec {
    buffer: BytesMut,
}

impl HttpServerCodec {
    /// Create an empty codec.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(1024),
        }
    }

    /// Buffer incoming plaintext bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode one complete request.
    ///
    /// Returns `Ok(None)` until a full head and body have been buffered.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] for malformed requests; the connection should
    /// then be answered with 400 (plaintext) or closed (encrypted).
    pub fn decode(&mut self) -> Result<Option<HttpRequest>, ParseError> {
        let Some(header_end) = self
            .buffer
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
        else {
            if self.buffer.len() > MAX_HEADER_SIZE {
                return Err(ParseError::HeadersTooLarge);
            }
            return Ok(None);
        };

        let header_str =
            str::from_utf8(&self.buffer[..header_end]).map_err(|_| ParseError::InvalidUtf8)?;
        let (method, uri, headers) = Self::parse_head(header_str)?;

        let content_length = headers
            .get("Content-Length")
            .map(str::parse::<usize>)
            .transpose()
            .map_err(|_| ParseError::InvalidContentLength)?
            .unwrap_or(0);

        if content_length > MAX_BODY_SIZE {
            return Err(ParseError::BodyTooLarge(content_length));
        }

        if self.buffer.len() < header_end + 4 + content_length {
            return Ok(None);
        }

        let _ = self.buffer.split_to(header_end + 4);
        let body = self.buffer.split_to(content_length).to_vec();

        Ok(Some(HttpRequest {
            method,
            uri,
            headers,
            body,
        }))
    }

    fn parse_head(header_str: &str) -> Result<(Method, String, Headers), ParseError> {
        let mut lines = header_str.lines();

        let request_line = lines
            .next()
            .ok_or_else(|| ParseError::InvalidRequestLine("empty".into()))?;
        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(ParseError::InvalidRequestLine(request_line.to_string()));
        }

        let method = Method::from_str(parts[0])
            .map_err(|()| ParseError::InvalidMethod(parts[0].to_string()))?;
        let uri = parts[1].to_string();

        if !parts[2].starts_with("HTTP/") {
            return Err(ParseError::InvalidRequestLine(request_line.to_string()));
        }

        let mut headers = Headers::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let Some(pos) = line.find(':') else {
                return Err(ParseError::InvalidHeader(line.to_string()));
            };
            headers.insert(line[..pos].trim(), line[pos + 1..].trim());
        }

        Ok((method, uri, headers))
    }
}

impl Default for HttpServerCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialized HTTP response.
#[derive(Debug)]
pub struct HttpResponse {
    /// Status code
    pub status: StatusCode,
    /// Response headers
    pub headers: Headers,
    /// Response body
    pub body: Vec<u8>,
}

/// Fluent response construction.
pub struct ResponseBuilder {
    status: StatusCode,
    headers: Headers,
    body: Vec<u8>,
}

impl ResponseBuilder {
    /// Start a response with the given status.
    #[must_use]
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Attach a body and its content type.
    #[must_use]
    pub fn body(mut self, body: Vec<u8>, content_type: &str) -> Self {
        self.headers.insert("Content-Type", content_type);
        self.body = body;
        self
    }

    /// Attach a `application/hap+json` body.
    #[must_use]
    pub fn hap_json(self, value: &serde_json::Value) -> Self {
        self.body(value.to_string().into_bytes(), "application/hap+json")
    }

    /// Attach a `application/pairing+tlv8` body.
    #[must_use]
    pub fn pairing_tlv8(self, tlv: Vec<u8>) -> Self {
        self.body(tlv, "application/pairing+tlv8")
    }

    /// Build the response.
    #[must_use]
    pub fn build(mut self) -> HttpResponse {
        if !self.body.is_empty() {
            self.headers
                .insert("Content-Length", self.body.len().to_string());
        }
        HttpResponse {
            status: self.status,
            headers: self.headers,
            body: self.body,
        }
    }

    /// Build and serialize in one step.
    #[must_use]
    pub fn encode(self) -> Vec<u8> {
        encode_response(&self.build())
    }
}

/// Serialize a response to wire bytes.
#[must_use]
pub fn encode_response(response: &HttpResponse) -> Vec<u8> {
    let mut output = Vec::with_capacity(128 + response.body.len());
    output.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            response.status.0,
            response.status.reason()
        )
        .as_bytes(),
    );
    for (name, value) in response.headers.iter() {
        output.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    output.extend_from_slice(b"\r\n");
    output.extend_from_slice(&response.body);
    output
}
