//! HTTP status codes the proxy itself can produce, and the error type glueing
//! the core components together.

use std::fmt;
use std::io;

/// Status codes the proxy core can synthesize on its own behalf (parse
/// failures, policy rejections, upstream failures). Not an exhaustive list of
/// every HTTP status — only the ones named in spec.md §7/§8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpStatus {
    BadRequest,
    Forbidden,
    MethodNotAllowed,
    PayloadTooLarge,
    UriTooLong,
    InternalServerError,
    NotImplemented,
    BadGateway,
    GatewayTimeout,
    Ok200,
}

impl HttpStatus {
    pub fn code(self) -> u16 {
        match self {
            HttpStatus::Ok200 => 200,
            HttpStatus::BadRequest => 400,
            HttpStatus::Forbidden => 403,
            HttpStatus::MethodNotAllowed => 405,
            HttpStatus::PayloadTooLarge => 413,
            HttpStatus::UriTooLong => 414,
            HttpStatus::InternalServerError => 500,
            HttpStatus::NotImplemented => 501,
            HttpStatus::BadGateway => 502,
            HttpStatus::GatewayTimeout => 504,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            HttpStatus::Ok200 => "OK",
            HttpStatus::BadRequest => "Bad Request",
            HttpStatus::Forbidden => "Forbidden",
            HttpStatus::MethodNotAllowed => "Method Not Allowed",
            HttpStatus::PayloadTooLarge => "Payload Too Large",
            HttpStatus::UriTooLong => "URI Too Long",
            HttpStatus::InternalServerError => "Internal Server Error",
            HttpStatus::NotImplemented => "Not Implemented",
            HttpStatus::BadGateway => "Bad Gateway",
            HttpStatus::GatewayTimeout => "Gateway Timeout",
        }
    }

    /// A status-line-only response, e.g. `HTTP/1.1 501 Not Implemented\r\n\r\n`.
    pub fn status_line_response(self) -> Vec<u8> {
        format!("HTTP/1.1 {} {}\r\n\r\n", self.code(), self.reason()).into_bytes()
    }
}

impl fmt::Display for HttpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("proxy status {0}")]
    Status(HttpStatus),

    #[error("address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("{0}")]
    Other(String),
}

impl From<HttpStatus> for ProxyError {
    fn from(s: HttpStatus) -> Self {
        ProxyError::Status(s)
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
