//! `htdoh-proxy`: a single-threaded, non-blocking HTTP/1.1 forward proxy
//! with DNS-over-HTTPS resolution and a UDP management channel.
//!
//! Module layout mirrors spec.md's component list (§3/§4): each `C*`
//! component gets its own module; `reactor` is the event loop that wires
//! them together (C8), `stm` is the per-connection protocol engine (C7).

pub mod access_log;
pub mod address;
pub mod args;
pub mod auth;
pub mod charclass;
pub mod config;
pub mod doh;
pub mod error;
pub mod headers;
pub mod http;
pub mod mng;
pub mod pop3;
pub mod reactor;
pub mod ring_buffer;
pub mod stats;
pub mod stm;
