//! Incremental HTTP/1.1 request-head parser.
//!
//! Callers hand the filter a request the way it would go out on an HTTP/1.1
//! connection. [`RequestParser`] collects the request line and header
//! fields, possibly over several calls, and stops at the blank line; any
//! bytes after it are body and stay with the caller.
//! [`Request::to_h3_headers`] turns the result into an HTTP/3 field list.

use quicfilter_h3::HeaderField;

/// Request-head parse failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("header line longer than {0} bytes")]
    LineTooLong(usize),

    #[error("request head larger than {0} bytes")]
    BlockTooLarge(usize),

    #[error("malformed request line")]
    BadRequestLine,

    #[error("malformed header line")]
    BadHeader,

    #[error("request names no authority")]
    MissingAuthority,
}

/// Connection-specific fields HTTP/3 forbids (RFC 9114 Section 4.2).
const CONNECTION_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

/// A parsed request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    /// From an absolute-form target.
    pub scheme: Option<String>,
    /// From an absolute-form or authority-form target.
    pub authority: Option<String>,
    /// `None` for authority-form (CONNECT) targets.
    pub path: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl Request {
    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Pseudo-header fields first, then every field HTTP/3 allows, with
    /// lowercase names.
    pub fn to_h3_headers(&self, default_scheme: &str) -> Result<Vec<HeaderField>, RequestError> {
        let authority = match (&self.authority, self.header("host")) {
            (Some(authority), _) => authority.as_str(),
            (None, Some(host)) => host,
            (None, None) => return Err(RequestError::MissingAuthority),
        };

        let mut fields = Vec::with_capacity(self.headers.len() + 4);
        fields.push(HeaderField::new(":method", self.method.as_str()));
        if let Some(path) = &self.path {
            let scheme = self.scheme.as_deref().unwrap_or(default_scheme);
            fields.push(HeaderField::new(":path", path.as_str()));
            fields.push(HeaderField::new(":scheme", scheme));
        }
        fields.push(HeaderField::new(":authority", authority));

        for (name, value) in &self.headers {
            let lower = name.to_ascii_lowercase();
            if lower == "host" || CONNECTION_HEADERS.contains(&lower.as_str()) {
                continue;
            }
            if lower == "te" && !value.eq_ignore_ascii_case("trailers") {
                continue;
            }
            fields.push(HeaderField::new(lower, value.as_str()));
        }
        Ok(fields)
    }
}

/// Collects a request head from a byte stream fed in arbitrary pieces.
#[derive(Debug)]
pub struct RequestParser {
    max_line: usize,
    max_block: usize,
    line: Vec<u8>,
    block_len: usize,
    request: Option<Request>,
    done: bool,
}

impl RequestParser {
    pub fn new(max_line: usize, max_block: usize) -> Self {
        Self {
            max_line,
            max_block,
            line: Vec::new(),
            block_len: 0,
            request: None,
            done: false,
        }
    }

    /// Feed bytes. Returns how many belong to the request head; once the
    /// head is complete the rest of `data` is left unconsumed and further
    /// calls consume nothing.
    pub fn feed(&mut self, data: &[u8]) -> Result<usize, RequestError> {
        let mut consumed = 0;
        while !self.done && consumed < data.len() {
            let rest = &data[consumed..];
            match rest.iter().position(|&b| b == b'\n') {
                Some(i) => {
                    self.take(&rest[..=i])?;
                    consumed += i + 1;
                    self.end_line()?;
                }
                None => {
                    self.take(rest)?;
                    consumed += rest.len();
                }
            }
        }
        Ok(consumed)
    }

    /// The blank line ending the head was seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Some request bytes were taken.
    pub fn is_started(&self) -> bool {
        self.block_len > 0
    }

    /// The complete request head.
    pub fn request(&self) -> Option<&Request> {
        if self.done { self.request.as_ref() } else { None }
    }

    fn take(&mut self, bytes: &[u8]) -> Result<(), RequestError> {
        if self.line.len() + bytes.len() > self.max_line + 2 {
            return Err(RequestError::LineTooLong(self.max_line));
        }
        self.block_len += bytes.len();
        if self.block_len > self.max_block {
            return Err(RequestError::BlockTooLarge(self.max_block));
        }
        self.line.extend_from_slice(bytes);
        Ok(())
    }

    fn end_line(&mut self) -> Result<(), RequestError> {
        let mut line = std::mem::take(&mut self.line);
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        let Some(request) = self.request.as_mut() else {
            // Empty lines before the request line are tolerated.
            if !line.is_empty() {
                self.request = Some(parse_request_line(&line)?);
            }
            return Ok(());
        };
        if line.is_empty() {
            self.done = true;
        } else {
            request.headers.push(parse_header(&line)?);
        }
        Ok(())
    }
}

fn parse_request_line(line: &[u8]) -> Result<Request, RequestError> {
    let text = std::str::from_utf8(line).map_err(|_| RequestError::BadRequestLine)?;
    let mut parts = text.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(RequestError::BadRequestLine);
    };
    if method.is_empty() || target.is_empty() || !version.starts_with("HTTP/1.") {
        return Err(RequestError::BadRequestLine);
    }

    let mut request = Request {
        method: method.to_string(),
        scheme: None,
        authority: None,
        path: None,
        headers: Vec::new(),
    };
    if target.starts_with('/') || target == "*" {
        request.path = Some(target.to_string());
    } else if let Some((scheme, rest)) = target.split_once("://") {
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        if scheme.is_empty() || authority.is_empty() {
            return Err(RequestError::BadRequestLine);
        }
        request.scheme = Some(scheme.to_ascii_lowercase());
        request.authority = Some(authority.to_string());
        request.path = Some(path.to_string());
    } else if method == "CONNECT" {
        request.authority = Some(target.to_string());
    } else {
        return Err(RequestError::BadRequestLine);
    }
    Ok(request)
}

fn parse_header(line: &[u8]) -> Result<(String, String), RequestError> {
    // Obsolete line folding is not accepted.
    if matches!(line.first(), Some(b' ' | b'\t')) {
        return Err(RequestError::BadHeader);
    }
    let text = std::str::from_utf8(line).map_err(|_| RequestError::BadHeader)?;
    let (name, value) = text.split_once(':').ok_or(RequestError::BadHeader)?;
    if name.is_empty() || name.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
        return Err(RequestError::BadHeader);
    }
    Ok((name.to_string(), value.trim().to_string()))
}
