//! HTTP/1.1 messages
//!
//! Just enough HTTP for the reactor: an incremental request-head parser with
//! a `Content-Length` body, and a response that serializes to bytes. Every
//! response closes the connection.

use std::fmt::Write as _;

/// Parsed request line and headers
#[derive(Debug, Clone, Default)]
struct Head {
    method: String,
    uri: String,
    version: String,
    headers: Vec<(String, String)>,
    body_start: usize,
    content_length: usize,
}

/// An incoming request, filled in as bytes arrive
#[derive(Debug, Default)]
pub struct Request {
    raw: Vec<u8>,
    head: Option<Head>,
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive buffer; the reactor reads straight into it
    pub fn buffer_mut(&mut self) -> &mut Vec<u8> {
        &mut self.raw
    }

    /// Append received bytes
    pub fn append(&mut self, bytes: &[u8]) {
        self.raw.extend_from_slice(bytes);
    }

    /// Bytes received so far
    pub fn received(&self) -> usize {
        self.raw.len()
    }

    /// Parse as far as the received bytes allow.
    ///
    /// `Ok(true)` once head and body are complete, `Ok(false)` while more
    /// bytes are needed, `Err(status)` for a request that must be refused.
    pub fn poll_complete(&mut self, max_size: usize) -> Result<bool, u16> {
        if self.head.is_none() {
            let Some(end) = find_head_end(&self.raw) else {
                return if self.raw.len() > max_size { Err(431) } else { Ok(false) };
            };
            self.head = Some(parse_head(&self.raw[..end], end)?);
        }

        let Some(head) = &self.head else {
            return Ok(false);
        };
        let total = head.body_start.saturating_add(head.content_length);
        if total > max_size {
            return Err(413);
        }
        Ok(self.raw.len() >= total)
    }

    pub fn method(&self) -> &str {
        self.head.as_ref().map_or("", |h| h.method.as_str())
    }

    /// Request target as sent, query included
    pub fn uri(&self) -> &str {
        self.head.as_ref().map_or("", |h| h.uri.as_str())
    }

    /// Request target without the query string
    pub fn path(&self) -> &str {
        let uri = self.uri();
        uri.split_once('?').map_or(uri, |(path, _)| path)
    }

    /// Query string, without the `?`
    pub fn query(&self) -> &str {
        self.uri().split_once('?').map_or("", |(_, q)| q)
    }

    pub fn version(&self) -> &str {
        self.head.as_ref().map_or("", |h| h.version.as_str())
    }

    /// First header named `name` (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.as_ref().and_then(|h| {
            h.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        })
    }

    /// All headers, in arrival order
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.head
            .iter()
            .flat_map(|h| h.headers.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    /// Value of cookie `name` from the `Cookie` header
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.header("cookie")?.split(';').find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            (k.trim() == name).then(|| v.trim())
        })
    }

    pub fn content_length(&self) -> usize {
        self.head.as_ref().map_or(0, |h| h.content_length)
    }

    /// Body bytes (complete only once `poll_complete` returned true)
    pub fn body(&self) -> &[u8] {
        match &self.head {
            Some(h) => {
                let end = (h.body_start + h.content_length).min(self.raw.len());
                &self.raw[h.body_start.min(end)..end]
            }
            None => &[],
        }
    }
}

fn parse_head(bytes: &[u8], body_start: usize) -> Result<Head, u16> {
    let text = std::str::from_utf8(bytes).map_err(|_| 400u16)?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().ok_or(400u16)?;
    let mut parts = request_line.split(' ');
    let (Some(method), Some(uri), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(400);
    };
    if method.is_empty() || !uri.starts_with('/') {
        return Err(400);
    }
    if !version.starts_with("HTTP/1.") {
        return Err(505);
    }

    let mut headers = Vec::new();
    let mut content_length = 0;
    for line in lines.filter(|l| !l.is_empty()) {
        let (name, value) = line.split_once(':').ok_or(400u16)?;
        let (name, value) = (name.trim(), value.trim());
        if name.is_empty() {
            return Err(400);
        }
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse().map_err(|_| 400u16)?;
        }
        if name.eq_ignore_ascii_case("transfer-encoding") {
            return Err(501);
        }
        headers.push((name.to_string(), value.to_string()));
    }

    Ok(Head {
        method: method.to_string(),
        uri: uri.to_string(),
        version: version.to_string(),
        headers,
        body_start,
        content_length,
    })
}

/// Reason phrase for a status code
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Content Too Large",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

/// An outgoing response
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Default for Response {
    fn default() -> Self {
        Self::new(200)
    }
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self { status, headers: Vec::new(), body: Vec::new() }
    }

    /// 200 with a body
    pub fn ok(content_type: &str, body: Vec<u8>) -> Self {
        let mut resp = Self::new(200);
        resp.set_header("Content-Type", content_type);
        resp.body = body;
        resp
    }

    /// Error page for `status`
    pub fn error(status: u16) -> Self {
        let mut resp = Self::new(status);
        resp.set_header("Content-Type", "text/html");
        resp.body = format!(
            "<html><head><title>{0} {1}</title></head>\
             <body><h1>{0} {1}</h1><hr><p>pollserv</p></body></html>\n",
            status,
            reason_phrase(status)
        )
        .into_bytes();
        resp
    }

    /// Build from CGI output: header lines, a blank line, then the body.
    ///
    /// A `Status:` header sets the status; a `Location:` without one makes
    /// it a 302. Output without a header block is a 502.
    pub fn from_cgi(output: &[u8]) -> Self {
        let crlf = output.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, p + 4));
        let lf = output.windows(2).position(|w| w == b"\n\n").map(|p| (p, p + 2));
        // Whichever blank line comes first ends the head.
        let split = match (crlf, lf) {
            (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
            (a, b) => a.or(b),
        };
        let Some((head_end, body_start)) = split else {
            return Self::error(502);
        };
        let Ok(head) = std::str::from_utf8(&output[..head_end]) else {
            return Self::error(502);
        };

        let mut resp = Self::new(200);
        let mut explicit_status = false;
        for line in head.lines().map(|l| l.trim_end_matches('\r')) {
            let Some((name, value)) = line.split_once(':') else {
                return Self::error(502);
            };
            let (name, value) = (name.trim(), value.trim());
            if name.eq_ignore_ascii_case("status") {
                match value.split(' ').next().and_then(|code| code.parse::<u16>().ok()) {
                    Some(code) if (100..600).contains(&code) => {
                        resp.status = code;
                        explicit_status = true;
                    }
                    _ => return Self::error(502),
                }
            } else {
                if name.eq_ignore_ascii_case("location") && !explicit_status {
                    resp.status = 302;
                }
                resp.add_header(name, value);
            }
        }
        resp.body = output[body_start..].to_vec();
        resp
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    /// First header named `name` (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace any header named `name`
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.to_string()));
    }

    /// Add a header, keeping existing ones with the same name
    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn set_cookie(&mut self, name: &str, value: &str) {
        self.add_header("Set-Cookie", &format!("{}={}; Path=/; HttpOnly", name, value));
    }

    /// Wire form. `Content-Length`, `Connection` and `Server` are set here.
    pub fn serialize(&self) -> Vec<u8> {
        let mut head = String::with_capacity(256);
        let _ = write!(head, "HTTP/1.1 {} {}\r\n", self.status, reason_phrase(self.status));
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("connection") {
                continue;
            }
            let _ = write!(head, "{}: {}\r\n", name, value);
        }
        if self.header("server").is_none() {
            head.push_str("Server: pollserv\r\n");
        }
        let _ = write!(head, "Content-Length: {}\r\nConnection: close\r\n\r\n", self.body.len());

        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}
