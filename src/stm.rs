//! Connection state machine (C7): the per-connection protocol engine that
//! drives a client connection from the first request byte through to close.
//!
//! States are named exactly as spec.md §4.7 lists them. Not every edge it
//! describes gets its own Rust function — `REQ_BODY_READ`/`REQ_BODY_FORWARD`
//! and `RES_BODY_READ`/`RES_BODY_FORWARD` are a read/forward pair cycling
//! against each other exactly like the original, just expressed as two
//! `match` arms calling each other via `Progress::Continue` instead of a
//! manual re-entry through the reactor's dispatch table.
//!
//! Every handler returns `io::Result<Progress>`: `Continue` means "call the
//! state machine again immediately, no event needed" (a free transition —
//! e.g. a resolved literal IP needs no DoH round trip), `Yield` means "wait
//! for the next readiness event on whichever FD this state cares about".
//! `step()` loops on `Continue` and only returns to the reactor on `Yield` or
//! `State::End`.

use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

use crate::address::{self, TargetUrl};
use crate::auth;
use crate::config::Config;
use crate::doh::{self, Family};
use crate::error::HttpStatus;
use crate::headers;
use crate::http::{
    HttpMessage, HttpRequest, HttpRequestParser, HttpResponse, HttpResponseParser, Method,
    ParseOutcome,
};
use crate::pop3::{Pop3Event, Pop3Sniffer};
use crate::ring_buffer::RingBuffer;
use crate::stats::Stats;
use crate::access_log::AccessLog;

/// spec.md §3: "`read_buffer`, `write_buffer` (5 MiB each)".
pub const CLIENT_BUF_CAP: usize = 5 * 1024 * 1024;
pub const TARGET_BUF_CAP: usize = 5 * 1024 * 1024;
pub const HEAD_BUF_CAP: usize = 5 * 1024 * 1024;
pub const DOH_RECV_CAP: usize = 4 * 1024;

const TOKEN_BASE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Target,
    Doh,
}

pub fn client_token(slot: usize) -> Token {
    Token(TOKEN_BASE + slot * 3)
}
pub fn target_token(slot: usize) -> Token {
    Token(TOKEN_BASE + slot * 3 + 1)
}
pub fn doh_token(slot: usize) -> Token {
    Token(TOKEN_BASE + slot * 3 + 2)
}

pub fn slot_of(token: Token) -> Option<(usize, Role)> {
    if token.0 < TOKEN_BASE {
        return None;
    }
    let t = token.0 - TOKEN_BASE;
    let role = match t % 3 {
        0 => Role::Client,
        1 => Role::Target,
        _ => Role::Doh,
    };
    Some((t / 3, role))
}

/// Spec.md §4.7's 17 named states, plus `End` for a slot ready to be
/// reclaimed by the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    RequestRead,
    DohConnect,
    ResponseDoh,
    TryIps,
    RequestConnect,
    RequestForward,
    ReqBodyRead,
    ReqBodyForward,
    ResponseRead,
    ResponseForward,
    ResBodyRead,
    ResBodyForward,
    ConnectResponse,
    TcpTunnel,
    ClientCloseConnection,
    TargetCloseConnection,
    ErrorState,
    End,
}

pub enum Progress {
    Continue,
    Yield,
}

pub enum StepOutcome {
    /// The connection needs another readiness event before it can progress.
    Yielded,
    /// Reached `State::End`; the reactor should tear the slot down.
    Done,
}

struct DohState {
    socket: TcpStream,
    request: Vec<u8>,
    request_sent: usize,
    recv: Vec<u8>,
    headers_done: bool,
    consumed: usize,
    response: HttpResponse,
    response_parser: HttpResponseParser,
}

pub struct ConnectionSlot {
    pub id: usize,
    pub state: State,

    pub client: TcpStream,
    pub client_addr: SocketAddr,
    pub target: Option<TcpStream>,

    /// client -> target direction (request bytes in REQUEST_READ/REQ_BODY_*,
    /// client -> target tunnel bytes in TCP_TUNNEL).
    c2t: RingBuffer,
    /// target -> client direction (response bytes, tunnel bytes back).
    t2c: RingBuffer,
    /// Scratch buffer for a freshly-serialized request/response head or a
    /// proxy-generated status line; never holds body bytes.
    head_buf: RingBuffer,

    req_parser: HttpRequestParser,
    request: HttpRequest,
    res_parser: HttpResponseParser,
    response: HttpResponse,
    body_forwarded: usize,

    target_url: Option<TargetUrl>,
    doh: Option<DohState>,
    resolved: Vec<IpAddr>,
    family: Family,
    try_index: usize,

    pop3: Pop3Sniffer,

    pub last_activity: Instant,
    /// Mirrors the original's slot refcount: bumped while a DoH sub-socket
    /// or an in-flight target connect attempt still holds a borrow on this
    /// slot's id, so the reactor won't recycle the slot number underneath it.
    pub references: u32,

    error_status: Option<HttpStatus>,

    /// What's currently registered with the reactor's `Poll` for each
    /// socket, so `sync_interests` only calls `register`/`reregister`/
    /// `deregister` on an actual change instead of unconditionally.
    registered_client: Option<Interest>,
    registered_target: Option<Interest>,
    registered_doh: Option<Interest>,
}

impl ConnectionSlot {
    pub fn new(id: usize, client: TcpStream, client_addr: SocketAddr) -> Self {
        ConnectionSlot {
            id,
            state: State::RequestRead,
            client,
            client_addr,
            target: None,
            c2t: RingBuffer::with_capacity(CLIENT_BUF_CAP),
            t2c: RingBuffer::with_capacity(TARGET_BUF_CAP),
            head_buf: RingBuffer::with_capacity(HEAD_BUF_CAP),
            req_parser: HttpRequestParser::new(),
            request: HttpRequest::default(),
            res_parser: HttpResponseParser::new(),
            response: HttpResponse::default(),
            body_forwarded: 0,
            target_url: None,
            doh: None,
            resolved: Vec::new(),
            family: Family::V4,
            try_index: 0,
            pop3: Pop3Sniffer::new(),
            last_activity: Instant::now(),
            references: 0,
            error_status: None,
            registered_client: None,
            registered_target: None,
            registered_doh: None,
        }
    }

    fn prepare_error(&mut self, status: HttpStatus) {
        self.error_status = Some(status);
        let bytes = status.status_line_response();
        self.head_buf.reset();
        self.head_buf.write_ptr()[..bytes.len()].copy_from_slice(&bytes);
        self.head_buf.write_adv(bytes.len());
        self.state = State::ErrorState;
    }

    /// Interests the reactor should register for this slot's sockets given
    /// the current state. `None` means "not registered right now".
    pub fn wanted_interests(&self) -> (Option<Interest>, Option<Interest>, Option<Interest>) {
        match self.state {
            State::RequestRead | State::ReqBodyRead => (Some(Interest::READABLE), None, None),
            State::DohConnect => (None, None, Some(Interest::WRITABLE)),
            State::ResponseDoh => (None, None, Some(Interest::READABLE)),
            State::TryIps | State::RequestConnect => (None, Some(Interest::WRITABLE), None),
            State::RequestForward | State::ReqBodyForward => (None, Some(Interest::WRITABLE), None),
            State::ResponseRead | State::ResBodyRead => (None, Some(Interest::READABLE), None),
            State::ResponseForward | State::ResBodyForward | State::ConnectResponse => {
                (Some(Interest::WRITABLE), None, None)
            }
            State::TcpTunnel => {
                let client_read = self.c2t.can_write();
                let client_write = self.t2c.can_read();
                let target_read = self.t2c.can_write();
                let target_write = self.c2t.can_read();
                (
                    interest_of(client_read, client_write),
                    interest_of(target_read, target_write),
                    None,
                )
            }
            State::ClientCloseConnection
            | State::TargetCloseConnection
            | State::ErrorState
            | State::End => (None, None, None),
        }
    }

    /// Reconcile the reactor's `Poll` registrations with `wanted_interests`.
    /// Called by the reactor after every `step()` call, and once right after
    /// `accept` — the only places the state (and so the wanted interests)
    /// can have changed.
    pub fn sync_interests(&mut self, registry: &Registry) -> io::Result<()> {
        let (client_i, target_i, doh_i) = self.wanted_interests();

        apply_interest(registry, &mut self.client, client_token(self.id), self.registered_client, client_i)?;
        self.registered_client = client_i;

        match self.target.as_mut() {
            Some(target) => {
                apply_interest(registry, target, target_token(self.id), self.registered_target, target_i)?;
                self.registered_target = target_i;
            }
            None => self.registered_target = None,
        }

        match self.doh.as_mut() {
            Some(doh) => {
                apply_interest(registry, &mut doh.socket, doh_token(self.id), self.registered_doh, doh_i)?;
                self.registered_doh = doh_i;
            }
            None => self.registered_doh = None,
        }

        Ok(())
    }
}

fn interest_of(readable: bool, writable: bool) -> Option<Interest> {
    match (readable, writable) {
        (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

/// Move one socket's registration from `old` to `new`, issuing the one mio
/// call the transition actually needs (or none, if nothing changed). This is
/// the reactor's "rebuild the fdsets from the per-slot interests" step
/// (spec.md §4.8 step 1), expressed against mio's registration API instead of
/// `select`'s fd_set rebuild.
fn apply_interest<S: mio::event::Source + ?Sized>(
    registry: &Registry,
    source: &mut S,
    token: Token,
    old: Option<Interest>,
    new: Option<Interest>,
) -> io::Result<()> {
    match (old, new) {
        (None, None) => Ok(()),
        (None, Some(i)) => registry.register(source, token, i),
        (Some(_), None) => registry.deregister(source),
        (Some(o), Some(n)) if o == n => Ok(()),
        (Some(_), Some(n)) => registry.reregister(source, token, n),
    }
}

/// Shared, read-only handles the state handlers need. Borrowed fresh from
/// the reactor for each `step()` call.
pub struct HandlerCtx<'a> {
    pub registry: &'a Registry,
    pub config: &'a Config,
    pub stats: &'a Stats,
    pub access_log: &'a AccessLog,
    pub via_host: &'a str,
    pub local_addrs: &'a [IpAddr],
}

enum IoOutcome {
    WouldBlock,
    Eof,
    BufferFull,
}

/// mio's epoll backend is edge-triggered: a handler that reads once and
/// stops would miss data already sitting in the kernel socket buffer, since
/// no further edge fires until *new* bytes arrive. Every read/write here
/// loops until the kernel says "no more right now".
fn drain_read(buf: &mut RingBuffer, stream: &mut TcpStream) -> io::Result<(usize, IoOutcome)> {
    let mut total = 0;
    loop {
        if !buf.can_write() {
            return Ok((total, IoOutcome::BufferFull));
        }
        match stream.read(buf.write_ptr()) {
            Ok(0) => return Ok((total, IoOutcome::Eof)),
            Ok(n) => {
                buf.write_adv(n);
                total += n;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok((total, IoOutcome::WouldBlock)),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

fn drain_write(buf: &mut RingBuffer, stream: &mut TcpStream) -> io::Result<usize> {
    let mut total = 0;
    loop {
        if !buf.can_read() {
            return Ok(total);
        }
        match stream.write(buf.read_ptr()) {
            Ok(0) => return Ok(total),
            Ok(n) => {
                buf.read_adv(n);
                total += n;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Drive `slot` through as many synchronous transitions as it has available,
/// stopping either at `State::End` or at a state that needs a new readiness
/// event to proceed.
pub fn step(slot: &mut ConnectionSlot, ctx: &HandlerCtx) -> StepOutcome {
    loop {
        let result = dispatch(slot, ctx);
        match result {
            Ok(Progress::Continue) => {
                if slot.state == State::End {
                    return StepOutcome::Done;
                }
            }
            Ok(Progress::Yield) => {
                if slot.state == State::End {
                    return StepOutcome::Done;
                }
                return StepOutcome::Yielded;
            }
            Err(_) => {
                slot.state = State::End;
                return StepOutcome::Done;
            }
        }
    }
}

fn dispatch(slot: &mut ConnectionSlot, ctx: &HandlerCtx) -> io::Result<Progress> {
    match slot.state {
        State::RequestRead => handle_request_read(slot, ctx),
        State::DohConnect => handle_doh_connect(slot, ctx),
        State::ResponseDoh => handle_response_doh(slot, ctx),
        State::TryIps => handle_try_ips(slot, ctx),
        State::RequestConnect => handle_request_connect(slot, ctx),
        State::RequestForward => handle_request_forward(slot),
        State::ReqBodyRead => handle_req_body_read(slot),
        State::ReqBodyForward => handle_req_body_forward(slot),
        State::ResponseRead => handle_response_read(slot, ctx),
        State::ResponseForward => handle_response_forward(slot, ctx),
        State::ResBodyRead => handle_res_body_read(slot),
        State::ResBodyForward => handle_res_body_forward(slot, ctx),
        State::ConnectResponse => handle_connect_response(slot),
        State::TcpTunnel => handle_tcp_tunnel(slot, ctx),
        State::ClientCloseConnection => handle_client_close(slot, ctx),
        State::TargetCloseConnection => handle_target_close(slot, ctx),
        State::ErrorState => handle_error_state(slot),
        State::End => Ok(Progress::Yield),
    }
}

fn handle_request_read(slot: &mut ConnectionSlot, ctx: &HandlerCtx) -> io::Result<Progress> {
    let (n, outcome) = drain_read(&mut slot.c2t, &mut slot.client)?;
    if n > 0 {
        ctx.stats.add_bytes_recieved(n as u64);
        slot.last_activity = Instant::now();
    }
    if matches!(outcome, IoOutcome::Eof) && slot.c2t.is_empty() {
        slot.state = State::ClientCloseConnection;
        return Ok(Progress::Continue);
    }
    if matches!(outcome, IoOutcome::BufferFull) {
        slot.prepare_error(HttpStatus::PayloadTooLarge);
        return Ok(Progress::Continue);
    }

    let (consumed, parse_outcome) = slot.req_parser.feed(slot.c2t.read_ptr(), &mut slot.request);
    slot.c2t.read_adv(consumed);
    match parse_outcome {
        ParseOutcome::Pending => {
            if matches!(outcome, IoOutcome::Eof) {
                slot.state = State::ClientCloseConnection;
                return Ok(Progress::Continue);
            }
            Ok(Progress::Yield)
        }
        ParseOutcome::Failed { error, .. } => {
            slot.prepare_error(error);
            Ok(Progress::Continue)
        }
        ParseOutcome::Success { .. } => {
            begin_resolution(slot, ctx);
            Ok(Progress::Continue)
        }
    }
}

/// Policy rejection: the target hostname is on `Config::target_blacklist`
/// (spec.md §4.7 "check method/blacklists", §7 "Policy rejections (FORBIDDEN
/// 403) — target-blacklist match or self-loop detection").
fn begin_resolution(slot: &mut ConnectionSlot, ctx: &HandlerCtx) {
    if ctx.config.disectors_enabled {
        sniff_basic_auth(slot, ctx);
    }

    let method = slot.request.method.unwrap_or(Method::Other);
    if method == Method::Trace {
        slot.prepare_error(HttpStatus::MethodNotAllowed);
        return;
    }
    let target = match address::parse_target(method, &slot.request.target) {
        Ok(t) => t,
        Err(status) => {
            slot.prepare_error(status);
            return;
        }
    };
    if ctx.config.is_target_blacklisted(&target.hostname) {
        slot.prepare_error(HttpStatus::Forbidden);
        return;
    }
    slot.target_url = Some(target);
    let hostname = slot.target_url.as_ref().unwrap().hostname.clone();

    slot.resolved.clear();
    slot.try_index = 0;
    slot.family = Family::V4;

    if let Some(ip) = address::try_parse_literal(&hostname) {
        slot.resolved = vec![ip];
        slot.state = State::TryIps;
    } else {
        slot.state = State::DohConnect;
    }
}

fn close_doh(slot: &mut ConnectionSlot, ctx: &HandlerCtx) {
    if let Some(mut doh_state) = slot.doh.take() {
        let _ = ctx.registry.deregister(&mut doh_state.socket);
    }
    slot.registered_doh = None;
}

/// Step 3 of spec.md §4.6's DoH resolution: the current family's query (or
/// its connect attempt) is dead. Either retry with the other family, or fail
/// the whole lookup.
fn advance_family_or_fail(slot: &mut ConnectionSlot, ctx: &HandlerCtx) {
    close_doh(slot, ctx);
    match slot.family.next() {
        Some(next) => {
            slot.family = next;
            slot.state = State::DohConnect;
        }
        None => slot.prepare_error(HttpStatus::BadGateway),
    }
}

fn handle_doh_connect(slot: &mut ConnectionSlot, ctx: &HandlerCtx) -> io::Result<Progress> {
    if slot.doh.is_none() {
        let hostname = slot.target_url.as_ref().expect("target resolved before DOH_CONNECT").hostname.clone();
        let dns_msg = doh::build_query(&hostname, slot.family.qtype());
        let http_req = doh::wrap_in_http_post(&dns_msg, &ctx.config.doh);
        let addr = SocketAddr::new(ctx.config.doh.ip, ctx.config.doh.port);
        let mut socket = TcpStream::connect(addr)?;
        ctx.registry.register(&mut socket, doh_token(slot.id), Interest::WRITABLE)?;
        slot.registered_doh = Some(Interest::WRITABLE);
        slot.doh = Some(DohState {
            socket,
            request: http_req,
            request_sent: 0,
            recv: Vec::new(),
            headers_done: false,
            consumed: 0,
            response: HttpResponse::default(),
            response_parser: HttpResponseParser::new(),
        });
        return Ok(Progress::Yield);
    }

    let failed = slot.doh.as_ref().unwrap().socket.take_error()?.is_some();
    if failed {
        advance_family_or_fail(slot, ctx);
        return Ok(Progress::Continue);
    }

    let doh_state = slot.doh.as_mut().unwrap();
    loop {
        if doh_state.request_sent >= doh_state.request.len() {
            slot.state = State::ResponseDoh;
            return Ok(Progress::Continue);
        }
        match doh_state.socket.write(&doh_state.request[doh_state.request_sent..]) {
            Ok(0) => return Ok(Progress::Yield),
            Ok(n) => doh_state.request_sent += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Progress::Yield),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

fn handle_response_doh(slot: &mut ConnectionSlot, ctx: &HandlerCtx) -> io::Result<Progress> {
    let doh_state = slot.doh.as_mut().expect("DOH_CONNECT populates doh before RESPONSE_DOH");

    let mut scratch = [0u8; 2048];
    let mut eof = false;
    loop {
        match doh_state.socket.read(&mut scratch) {
            Ok(0) => {
                eof = true;
                break;
            }
            Ok(n) => doh_state.recv.extend_from_slice(&scratch[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    if !doh_state.headers_done {
        let (consumed, outcome) = doh_state
            .response_parser
            .feed(&doh_state.recv[doh_state.consumed..], &mut doh_state.response);
        doh_state.consumed += consumed;
        match outcome {
            ParseOutcome::Pending => {
                if eof {
                    advance_family_or_fail(slot, ctx);
                    return Ok(Progress::Continue);
                }
                return Ok(Progress::Yield);
            }
            ParseOutcome::Failed { .. } => {
                advance_family_or_fail(slot, ctx);
                return Ok(Progress::Continue);
            }
            ParseOutcome::Success { .. } => {
                doh_state.headers_done = true;
            }
        }
    }

    let body_len = doh_state.response.message.body_length;
    let body_have = doh_state.recv.len() - doh_state.consumed;
    if body_have < body_len {
        if eof {
            advance_family_or_fail(slot, ctx);
            return Ok(Progress::Continue);
        }
        return Ok(Progress::Yield);
    }

    let body = doh_state.recv[doh_state.consumed..doh_state.consumed + body_len].to_vec();
    match doh::parse_dns_answers(&body, slot.family.qtype()) {
        Ok(addrs) if !addrs.is_empty() => {
            slot.resolved = addrs;
            slot.try_index = 0;
            close_doh(slot, ctx);
            slot.state = State::TryIps;
        }
        _ => advance_family_or_fail(slot, ctx),
    }
    Ok(Progress::Continue)
}

fn close_target(slot: &mut ConnectionSlot, ctx: &HandlerCtx) {
    if let Some(mut target) = slot.target.take() {
        let _ = ctx.registry.deregister(&mut target);
    }
    slot.registered_target = None;
}

fn handle_try_ips(slot: &mut ConnectionSlot, ctx: &HandlerCtx) -> io::Result<Progress> {
    if slot.try_index >= slot.resolved.len() {
        advance_family_or_fail(slot, ctx);
        return Ok(Progress::Continue);
    }
    let ip = slot.resolved[slot.try_index];
    let port = slot.target_url.as_ref().map(|t| t.port).unwrap_or(80);

    if address::is_self_address(ip, port, ctx.config.proxy_port, ctx.local_addrs) {
        slot.try_index += 1;
        slot.prepare_error(HttpStatus::Forbidden);
        return Ok(Progress::Continue);
    }

    let addr = SocketAddr::new(ip, port);
    let mut socket = match TcpStream::connect(addr) {
        Ok(s) => s,
        Err(_) => {
            slot.try_index += 1;
            return Ok(Progress::Continue);
        }
    };
    ctx.registry.register(&mut socket, target_token(slot.id), Interest::WRITABLE)?;
    slot.registered_target = Some(Interest::WRITABLE);
    slot.target = Some(socket);
    slot.state = State::RequestConnect;
    Ok(Progress::Yield)
}

fn handle_request_connect(slot: &mut ConnectionSlot, ctx: &HandlerCtx) -> io::Result<Progress> {
    let connect_failed = slot.target.as_ref().unwrap().take_error()?.is_some();
    if connect_failed {
        close_target(slot, ctx);
        slot.try_index += 1;
        slot.state = State::TryIps;
        return Ok(Progress::Continue);
    }

    if slot.request.method == Some(Method::Connect) {
        let bytes = b"HTTP/1.1 200 Connection Established\r\n\r\n".to_vec();
        slot.head_buf.reset();
        slot.head_buf.write_ptr()[..bytes.len()].copy_from_slice(&bytes);
        slot.head_buf.write_adv(bytes.len());
        if let Some(url) = &slot.target_url {
            let _ = ctx.access_log.log_request(slot.client_addr.ip(), &format!("{}:{}", url.hostname, url.port));
        }
        slot.state = State::ConnectResponse;
    } else {
        enter_request_forward(slot, ctx);
    }
    Ok(Progress::Continue)
}

fn method_str(m: Method) -> &'static str {
    match m {
        Method::Get => "GET",
        Method::Post => "POST",
        Method::Put => "PUT",
        Method::Delete => "DELETE",
        Method::Connect => "CONNECT",
        Method::Head => "HEAD",
        Method::Options => "OPTIONS",
        Method::Trace => "TRACE",
        Method::Other => "OTHER",
    }
}

fn serialize_head(first_line: &str, msg: &HttpMessage) -> Vec<u8> {
    let mut out = Vec::with_capacity(first_line.len() + 2 + msg.headers.len() * 32);
    out.extend_from_slice(first_line.as_bytes());
    out.extend_from_slice(b"\r\n");
    for (name, value) in &msg.headers {
        out.extend_from_slice(name.as_bytes());
        out.push(b':');
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Build and load the rewritten request head into `head_buf`, per spec.md
/// §4.9: `Host` replaced with the resolved target, a `Via` hop appended,
/// `Connection`-listed headers stripped.
fn enter_request_forward(slot: &mut ConnectionSlot, ctx: &HandlerCtx) {
    let target_host = slot.target_url.as_ref().map(|t| t.hostname.clone());
    headers::rewrite_request(&mut slot.request.message, target_host.as_deref(), ctx.via_host);

    let method = slot.request.method.unwrap_or(Method::Other);
    let path = match &slot.target_url {
        Some(t) if !t.path.is_empty() => t.path.clone(),
        _ => slot.request.target.clone(),
    };
    let first_line = format!("{} {} {}", method_str(method), path, slot.request.version);
    let bytes = serialize_head(&first_line, &slot.request.message);

    slot.head_buf.reset();
    slot.head_buf.write_ptr()[..bytes.len()].copy_from_slice(&bytes);
    slot.head_buf.write_adv(bytes.len());
    slot.body_forwarded = 0;
    slot.state = State::RequestForward;
}

fn handle_request_forward(slot: &mut ConnectionSlot) -> io::Result<Progress> {
    let target = slot.target.as_mut().expect("target connected before REQUEST_FORWARD");
    drain_write(&mut slot.head_buf, target)?;
    if slot.head_buf.can_read() {
        return Ok(Progress::Yield);
    }

    // Expect: 100-continue escalates straight to the raw tunnel (spec.md
    // §4.7): the proxy doesn't arbitrate the 100/417 handshake itself.
    if slot.request.message.has_expect {
        enter_tunnel(slot);
        return Ok(Progress::Continue);
    }
    if slot.request.message.body_length == 0 {
        enter_response_read(slot);
        return Ok(Progress::Continue);
    }
    slot.body_forwarded = slot.c2t.len().min(slot.request.message.body_length);
    if slot.body_forwarded >= slot.request.message.body_length {
        enter_response_read(slot);
    } else {
        slot.state = State::ReqBodyForward;
    }
    Ok(Progress::Continue)
}

fn handle_req_body_forward(slot: &mut ConnectionSlot) -> io::Result<Progress> {
    let target = slot.target.as_mut().unwrap();
    let n = drain_write(&mut slot.c2t, target)?;
    slot.body_forwarded += n;
    if slot.body_forwarded >= slot.request.message.body_length {
        enter_response_read(slot);
        return Ok(Progress::Continue);
    }
    if slot.c2t.can_read() {
        return Ok(Progress::Yield);
    }
    slot.c2t.reset();
    slot.state = State::ReqBodyRead;
    Ok(Progress::Continue)
}

fn handle_req_body_read(slot: &mut ConnectionSlot) -> io::Result<Progress> {
    let (_, outcome) = drain_read(&mut slot.c2t, &mut slot.client)?;
    match outcome {
        IoOutcome::Eof => {
            slot.state = State::ClientCloseConnection;
            Ok(Progress::Continue)
        }
        IoOutcome::BufferFull | IoOutcome::WouldBlock => {
            if slot.c2t.can_read() {
                slot.state = State::ReqBodyForward;
                Ok(Progress::Continue)
            } else {
                Ok(Progress::Yield)
            }
        }
    }
}

fn enter_response_read(slot: &mut ConnectionSlot) {
    slot.t2c.reset();
    slot.res_parser.reset();
    slot.res_parser.set_ignore_content_length(slot.request.method == Some(Method::Head));
    slot.response = HttpResponse::default();
    slot.body_forwarded = 0;
    slot.state = State::ResponseRead;
}

fn handle_response_read(slot: &mut ConnectionSlot, ctx: &HandlerCtx) -> io::Result<Progress> {
    let target = slot.target.as_mut().expect("target connected before RESPONSE_READ");
    let (n, outcome) = drain_read(&mut slot.t2c, target)?;
    if n > 0 {
        ctx.stats.add_bytes_recieved(n as u64);
    }
    if matches!(outcome, IoOutcome::Eof) && slot.t2c.is_empty() {
        slot.state = State::TargetCloseConnection;
        return Ok(Progress::Continue);
    }

    let (consumed, parse_outcome) = slot.res_parser.feed(slot.t2c.read_ptr(), &mut slot.response);
    slot.t2c.read_adv(consumed);
    match parse_outcome {
        ParseOutcome::Pending => {
            if matches!(outcome, IoOutcome::Eof) {
                slot.prepare_error(HttpStatus::BadGateway);
                return Ok(Progress::Continue);
            }
            Ok(Progress::Yield)
        }
        ParseOutcome::Failed { .. } => {
            slot.prepare_error(HttpStatus::BadGateway);
            Ok(Progress::Continue)
        }
        ParseOutcome::Success { .. } => {
            headers::rewrite_response(&mut slot.response.message, ctx.via_host);
            let first_line = format!(
                "{} {} {}",
                slot.response.version, slot.response.status, slot.response.reason
            );
            let bytes = serialize_head(&first_line, &slot.response.message);
            slot.head_buf.reset();
            slot.head_buf.write_ptr()[..bytes.len()].copy_from_slice(&bytes);
            slot.head_buf.write_adv(bytes.len());

            if let Some(url) = &slot.target_url {
                let line = format!("{}://{}{}", url.protocol, url.hostname, url.path);
                let _ = ctx.access_log.log_request(slot.client_addr.ip(), &line);
            }
            slot.body_forwarded = 0;
            slot.state = State::ResponseForward;
            Ok(Progress::Continue)
        }
    }
}

fn handle_response_forward(slot: &mut ConnectionSlot, ctx: &HandlerCtx) -> io::Result<Progress> {
    let n = drain_write(&mut slot.head_buf, &mut slot.client)?;
    let _ = n;
    if slot.head_buf.can_read() {
        return Ok(Progress::Yield);
    }
    if slot.request.method == Some(Method::Head) || slot.response.message.body_length == 0 {
        finish_exchange(slot, ctx);
        return Ok(Progress::Continue);
    }
    slot.body_forwarded = slot.t2c.len().min(slot.response.message.body_length);
    if slot.body_forwarded >= slot.response.message.body_length {
        finish_exchange(slot, ctx);
    } else {
        slot.state = State::ResBodyForward;
    }
    Ok(Progress::Continue)
}

fn handle_res_body_forward(slot: &mut ConnectionSlot, ctx: &HandlerCtx) -> io::Result<Progress> {
    let n = drain_write(&mut slot.t2c, &mut slot.client)?;
    slot.body_forwarded += n;
    if slot.body_forwarded >= slot.response.message.body_length {
        finish_exchange(slot, ctx);
        return Ok(Progress::Continue);
    }
    if slot.t2c.can_read() {
        return Ok(Progress::Yield);
    }
    slot.t2c.reset();
    slot.state = State::ResBodyRead;
    Ok(Progress::Continue)
}

fn handle_res_body_read(slot: &mut ConnectionSlot) -> io::Result<Progress> {
    let target = slot.target.as_mut().unwrap();
    let (_, outcome) = drain_read(&mut slot.t2c, target)?;
    match outcome {
        IoOutcome::Eof if slot.t2c.is_empty() => {
            slot.state = State::TargetCloseConnection;
            Ok(Progress::Continue)
        }
        _ => {
            if slot.t2c.can_read() {
                slot.state = State::ResBodyForward;
                Ok(Progress::Continue)
            } else {
                Ok(Progress::Yield)
            }
        }
    }
}

/// A successful `CONNECT` never goes through `REQUEST_FORWARD`/response
/// rewriting again — once the 200 is flushed the connection becomes an
/// opaque byte pipe.
fn handle_connect_response(slot: &mut ConnectionSlot) -> io::Result<Progress> {
    drain_write(&mut slot.head_buf, &mut slot.client)?;
    if slot.head_buf.can_read() {
        return Ok(Progress::Yield);
    }
    enter_tunnel(slot);
    Ok(Progress::Continue)
}

fn enter_tunnel(slot: &mut ConnectionSlot) {
    slot.c2t.compact();
    slot.t2c.compact();
    slot.pop3 = Pop3Sniffer::new();
    slot.state = State::TcpTunnel;
}

/// Pure byte-shuffling in both directions, with backpressure: a direction's
/// read side stalls once its ring buffer is full until the write side drains
/// it (spec.md §4.1, §4.7). The POP3 disector (C5) is fed a read-only copy of
/// the client -> target stream when enabled and the original request wasn't
/// a `CONNECT` to a non-POP3 port — spec.md leaves the port check to the
/// caller, so this crate just always feeds it; `Pop3Sniffer` is cheap and
/// produces no events on non-POP3 traffic.
fn handle_tcp_tunnel(slot: &mut ConnectionSlot, ctx: &HandlerCtx) -> io::Result<Progress> {
    let mut progressed = false;

    if slot.c2t.can_write() {
        let (n, outcome) = drain_read(&mut slot.c2t, &mut slot.client)?;
        if n > 0 {
            progressed = true;
            ctx.stats.add_bytes_recieved(n as u64);
            if ctx.config.disectors_enabled {
                sniff_pop3(slot, ctx, n);
            }
        }
        if matches!(outcome, IoOutcome::Eof) {
            slot.state = State::ClientCloseConnection;
            return Ok(Progress::Continue);
        }
    }
    if let Some(target) = slot.target.as_mut() {
        if slot.t2c.can_write() {
            let (n, outcome) = drain_read(&mut slot.t2c, target)?;
            if n > 0 {
                progressed = true;
            }
            if matches!(outcome, IoOutcome::Eof) {
                slot.state = State::TargetCloseConnection;
                return Ok(Progress::Continue);
            }
        }
        if slot.c2t.can_read() {
            let n = drain_write(&mut slot.c2t, target)?;
            if n > 0 {
                progressed = true;
                ctx.stats.add_sent_bytes(n as u64);
            }
        }
        // A ring buffer that filled to capacity never reports `can_write`
        // again on its own (§4.1: no wraparound, `w` only advances) — once
        // the write side has fully caught up, reclaim the whole capacity
        // instead of leaving the read side permanently stalled.
        if slot.c2t.is_empty() {
            slot.c2t.reset();
        }
    }
    if slot.t2c.can_read() {
        let n = drain_write(&mut slot.t2c, &mut slot.client)?;
        if n > 0 {
            progressed = true;
            ctx.stats.add_sent_bytes(n as u64);
        }
    }
    if slot.t2c.is_empty() {
        slot.t2c.reset();
    }

    if progressed {
        Ok(Progress::Continue)
    } else {
        Ok(Progress::Yield)
    }
}

/// Only the first `Authorization` header on the request is inspected;
/// `Proxy-Authorization` is left alone (spec.md §9 Open Questions).
fn sniff_basic_auth(slot: &mut ConnectionSlot, ctx: &HandlerCtx) {
    let Some(value) = slot.request.message.header("Authorization") else { return };
    if let Some((user, pass)) = auth::extract_basic_credentials(value) {
        let _ = ctx.access_log.log_basic_credentials(slot.client_addr.ip(), &user, &pass);
    }
}

fn sniff_pop3(slot: &mut ConnectionSlot, ctx: &HandlerCtx, newly_read: usize) {
    let start = slot.c2t.len().saturating_sub(newly_read);
    let window = &slot.c2t.read_ptr()[start..];
    for event in slot.pop3.feed(window) {
        if let Pop3Event::Credentials { user, pass } = event {
            let _ = ctx.access_log.log_pop3_credentials(slot.client_addr.ip(), &user, &pass);
        }
    }
}

fn finish_exchange(slot: &mut ConnectionSlot, ctx: &HandlerCtx) {
    close_target(slot, ctx);
    slot.req_parser.reset();
    slot.request = HttpRequest::default();
    slot.res_parser.reset();
    slot.response = HttpResponse::default();
    slot.target_url = None;
    slot.c2t.reset();
    slot.t2c.reset();
    slot.head_buf.reset();
    slot.last_activity = Instant::now();
    slot.state = State::RequestRead;
}

fn handle_client_close(slot: &mut ConnectionSlot, ctx: &HandlerCtx) -> io::Result<Progress> {
    close_target(slot, ctx);
    close_doh(slot, ctx);
    slot.state = State::End;
    Ok(Progress::Continue)
}

fn handle_target_close(slot: &mut ConnectionSlot, ctx: &HandlerCtx) -> io::Result<Progress> {
    // In TCP_TUNNEL a target hangup just means no more bytes come back; any
    // buffered client->target data already written can still be drained, but
    // with the upstream gone there is nothing left to wait for.
    close_target(slot, ctx);
    slot.state = State::ClientCloseConnection;
    Ok(Progress::Continue)
}

fn handle_error_state(slot: &mut ConnectionSlot) -> io::Result<Progress> {
    drain_write(&mut slot.head_buf, &mut slot.client)?;
    if slot.head_buf.can_read() {
        return Ok(Progress::Yield);
    }
    slot.state = State::End;
    Ok(Progress::Continue)
}

/// Finalize a slot the reactor is about to recycle: make sure both sockets
/// are deregistered regardless of which state it died in.
pub fn teardown(slot: &mut ConnectionSlot, ctx: &HandlerCtx) {
    close_target(slot, ctx);
    close_doh(slot, ctx);
    let _ = ctx.registry.deregister(&mut slot.client);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_roundtrips_through_slot_of() {
        assert_eq!(slot_of(client_token(3)), Some((3, Role::Client)));
        assert_eq!(slot_of(target_token(3)), Some((3, Role::Target)));
        assert_eq!(slot_of(doh_token(3)), Some((3, Role::Doh)));
    }

    #[test]
    fn tokens_for_different_slots_never_collide() {
        for a in 0..8 {
            for b in 0..8 {
                if a == b {
                    continue;
                }
                assert_ne!(client_token(a), client_token(b));
                assert_ne!(client_token(a), target_token(b));
                assert_ne!(client_token(a), doh_token(b));
            }
        }
    }

    #[test]
    fn serialize_head_joins_name_colon_value_with_no_inserted_space() {
        let mut msg = HttpMessage::default();
        msg.headers.push(("Host".to_string(), " example.com".to_string()));
        msg.headers.push(("Accept".to_string(), "*/*".to_string()));
        let bytes = serialize_head("GET / HTTP/1.1", &msg);
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, "GET / HTTP/1.1\r\nHost: example.com\r\nAccept:*/*\r\n\r\n");
    }

    #[test]
    fn interest_of_combines_read_and_write() {
        assert_eq!(interest_of(true, true), Some(Interest::READABLE.add(Interest::WRITABLE)));
        assert_eq!(interest_of(false, false), None);
    }
}
