//! Status-line parsing (C4, response side): `VERSION SP STATUS SP REASON
//! CRLF`, delegating the header section to `HttpMessageParser`.

use crate::charclass::{self, ALPHA, DIGIT, HTAB, VCHAR};
use crate::error::HttpStatus;
use crate::http::message::{HttpMessage, HttpMessageParser};
use crate::http::ParseOutcome;

#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub message: HttpMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResState {
    Version,
    Status,
    Reason,
    Cr,
    Headers,
}

#[derive(Debug)]
pub struct HttpResponseParser {
    state: ResState,
    status_buf: String,
    headers: HttpMessageParser,
}

impl HttpResponseParser {
    pub fn new() -> Self {
        HttpResponseParser {
            state: ResState::Version,
            status_buf: String::new(),
            headers: HttpMessageParser::new(),
        }
    }

    pub fn reset(&mut self) {
        self.state = ResState::Version;
        self.status_buf.clear();
        self.headers.reset();
    }

    pub fn set_ignore_content_length(&mut self, ignore: bool) {
        self.headers.set_ignore_content_length(ignore);
    }

    pub fn feed(
        &mut self,
        input: &[u8],
        res: &mut HttpResponse,
    ) -> (usize, ParseOutcome<HttpStatus>) {
        let mut i = 0usize;
        while i < input.len() {
            if self.state == ResState::Headers {
                let (consumed, outcome) = self.headers.feed(&input[i..], &mut res.message);
                return (i + consumed, outcome);
            }
            let b = input[i];
            i += 1;
            match self.state {
                ResState::Version => {
                    if b == b' ' {
                        self.state = ResState::Status;
                    } else if charclass::is(b, ALPHA) || charclass::is(b, DIGIT) || b == b'/' || b == b'.' {
                        res.version.push(b as char);
                    } else {
                        return (i, ParseOutcome::Failed { consumed: i, error: HttpStatus::BadRequest });
                    }
                }
                ResState::Status => {
                    if b == b' ' {
                        match self.status_buf.parse::<u16>() {
                            Ok(code) => res.status = code,
                            Err(_) => {
                                return (i, ParseOutcome::Failed { consumed: i, error: HttpStatus::BadRequest })
                            }
                        }
                        self.state = ResState::Reason;
                    } else if charclass::is(b, DIGIT) {
                        self.status_buf.push(b as char);
                    } else {
                        return (i, ParseOutcome::Failed { consumed: i, error: HttpStatus::BadRequest });
                    }
                }
                ResState::Reason => {
                    if b == b'\r' {
                        self.state = ResState::Cr;
                    } else if charclass::is(b, VCHAR) || b == b' ' || charclass::is(b, HTAB) {
                        res.reason.push(b as char);
                    } else {
                        return (i, ParseOutcome::Failed { consumed: i, error: HttpStatus::BadRequest });
                    }
                }
                ResState::Cr => {
                    if b == b'\n' {
                        self.state = ResState::Headers;
                    } else {
                        return (i, ParseOutcome::Failed { consumed: i, error: HttpStatus::BadRequest });
                    }
                }
                ResState::Headers => unreachable!(),
            }
        }
        (i, ParseOutcome::Pending)
    }
}

impl Default for HttpResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_200() {
        let mut p = HttpResponseParser::new();
        let mut res = HttpResponse::default();
        let input = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let (_, outcome) = p.feed(input, &mut res);
        assert!(matches!(outcome, ParseOutcome::Success { .. }));
        assert_eq!(res.version, "HTTP/1.1");
        assert_eq!(res.status, 200);
        assert_eq!(res.reason, "OK");
        assert_eq!(res.message.body_length, 5);
    }

    #[test]
    fn parses_multi_word_reason_phrase() {
        let mut p = HttpResponseParser::new();
        let mut res = HttpResponse::default();
        p.feed(b"HTTP/1.1 404 Not Found\r\n\r\n", &mut res);
        assert_eq!(res.reason, "Not Found");
    }

    #[test]
    fn bad_gateway_status() {
        let mut p = HttpResponseParser::new();
        let mut res = HttpResponse::default();
        p.feed(b"HTTP/1.1 502 Bad Gateway\r\n\r\n", &mut res);
        assert_eq!(res.status, 502);
    }
}
