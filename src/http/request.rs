//! Request-line parsing (C4, request side): `METHOD SP TARGET SP VERSION
//! CRLF`, delegating the header section to `HttpMessageParser`.

use crate::charclass::{self, ALPHA, DIGIT};
use crate::error::HttpStatus;
use crate::http::message::{HttpMessage, HttpMessageParser};
use crate::http::ParseOutcome;

pub const MAX_TARGET_LEN: usize = 8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Connect,
    Head,
    Options,
    Trace,
    Other,
}

impl Method {
    fn from_str(s: &str) -> Method {
        match s {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "CONNECT" => Method::Connect,
            "HEAD" => Method::Head,
            "OPTIONS" => Method::Options,
            "TRACE" => Method::Trace,
            _ => Method::Other,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub method: Option<Method>,
    /// Lowercased during accumulation, per spec.md §4.4.
    pub target: String,
    pub version: String,
    pub message: HttpMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReqState {
    Method,
    Target,
    Version,
    Cr,
    Headers,
}

#[derive(Debug)]
pub struct HttpRequestParser {
    state: ReqState,
    method_buf: String,
    headers: HttpMessageParser,
}

impl HttpRequestParser {
    pub fn new() -> Self {
        HttpRequestParser {
            state: ReqState::Method,
            method_buf: String::new(),
            headers: HttpMessageParser::new(),
        }
    }

    pub fn reset(&mut self) {
        self.state = ReqState::Method;
        self.method_buf.clear();
        self.headers.reset();
    }

    pub fn feed(
        &mut self,
        input: &[u8],
        req: &mut HttpRequest,
    ) -> (usize, ParseOutcome<HttpStatus>) {
        let mut i = 0usize;
        while i < input.len() {
            if self.state == ReqState::Headers {
                let (consumed, outcome) = self.headers.feed(&input[i..], &mut req.message);
                return (i + consumed, outcome);
            }
            let b = input[i];
            i += 1;
            match self.state {
                ReqState::Method => {
                    if b == b' ' {
                        req.method = Some(Method::from_str(&self.method_buf));
                        self.state = ReqState::Target;
                    } else if charclass::is(b, ALPHA) {
                        self.method_buf.push((b as char).to_ascii_uppercase());
                    } else {
                        return (i, ParseOutcome::Failed { consumed: i, error: HttpStatus::BadRequest });
                    }
                }
                ReqState::Target => {
                    if b == b' ' {
                        self.state = ReqState::Version;
                    } else if charclass::is(b, charclass::VCHAR) {
                        if req.target.len() >= MAX_TARGET_LEN {
                            return (i, ParseOutcome::Failed { consumed: i, error: HttpStatus::UriTooLong });
                        }
                        req.target.push((b as char).to_ascii_lowercase());
                    } else {
                        return (i, ParseOutcome::Failed { consumed: i, error: HttpStatus::BadRequest });
                    }
                }
                ReqState::Version => {
                    if b == b'\r' {
                        self.state = ReqState::Cr;
                    } else if charclass::is(b, ALPHA) || charclass::is(b, DIGIT) || b == b'/' || b == b'.' {
                        req.version.push(b as char);
                    } else {
                        return (i, ParseOutcome::Failed { consumed: i, error: HttpStatus::BadRequest });
                    }
                }
                ReqState::Cr => {
                    if b == b'\n' {
                        self.state = ReqState::Headers;
                    } else {
                        return (i, ParseOutcome::Failed { consumed: i, error: HttpStatus::BadRequest });
                    }
                }
                ReqState::Headers => unreachable!(),
            }
        }
        (i, ParseOutcome::Pending)
    }
}

impl Default for HttpRequestParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_get() {
        let mut p = HttpRequestParser::new();
        let mut req = HttpRequest::default();
        let input = b"GET http://Example.com/Path HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let (_, outcome) = p.feed(input, &mut req);
        assert!(matches!(outcome, ParseOutcome::Success { .. }));
        assert_eq!(req.method, Some(Method::Get));
        assert_eq!(req.target, "http://example.com/path");
        assert_eq!(req.version, "HTTP/1.1");
        assert_eq!(req.message.header("Host"), Some("example.com"));
    }

    #[test]
    fn unknown_method_is_other() {
        let mut p = HttpRequestParser::new();
        let mut req = HttpRequest::default();
        p.feed(b"PATCH / HTTP/1.1\r\n\r\n", &mut req);
        assert_eq!(req.method, Some(Method::Other));
    }

    #[test]
    fn connect_method_parsed() {
        let mut p = HttpRequestParser::new();
        let mut req = HttpRequest::default();
        p.feed(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n", &mut req);
        assert_eq!(req.method, Some(Method::Connect));
        assert_eq!(req.target, "example.com:443");
    }

    #[test]
    fn target_too_long_fails() {
        let mut p = HttpRequestParser::new();
        let mut req = HttpRequest::default();
        let mut input = b"GET /".to_vec();
        input.extend(std::iter::repeat(b'a').take(MAX_TARGET_LEN + 1));
        input.extend_from_slice(b" HTTP/1.1\r\n\r\n");
        let (_, outcome) = p.feed(&input, &mut req);
        assert!(matches!(
            outcome,
            ParseOutcome::Failed { error: HttpStatus::UriTooLong, .. }
        ));
    }

    #[test]
    fn resumes_across_split_feeds() {
        let mut p = HttpRequestParser::new();
        let mut req = HttpRequest::default();
        let (n1, o1) = p.feed(b"GE", &mut req);
        assert_eq!(o1, ParseOutcome::Pending);
        assert_eq!(n1, 2);
        let (_, outcome) = p.feed(b"T / HTTP/1.1\r\n\r\n", &mut req);
        assert!(matches!(outcome, ParseOutcome::Success { .. }));
        assert_eq!(req.method, Some(Method::Get));
    }
}
