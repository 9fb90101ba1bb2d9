pub mod message;
pub mod request;
pub mod response;

pub use message::{HttpMessage, HttpMessageParser, MAX_HEADERS};
pub use request::{HttpRequest, HttpRequestParser, Method};
pub use response::{HttpResponse, HttpResponseParser};

/// Outcome of feeding bytes into any of the wire parsers (C3/C4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome<E> {
    /// Needs more bytes; all of the input slice was consumed.
    Pending,
    /// Message complete. `consumed` is the number of input bytes that belong
    /// to this message (headers, and for the request/response line).
    Success { consumed: usize },
    Failed { consumed: usize, error: E },
}
