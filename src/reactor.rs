//! Reactor (C8): the single-threaded `select`-shaped event loop, realized
//! against `mio::Poll` instead of a literal `pselect(2)` call. Registers the
//! two proxy listeners and the two management sockets, accepts connections
//! into a fixed-size slot table, and drives each connection's STM from
//! readiness events.
//!
//! Token layout: `0..4` are reserved for the four master sockets (proxy v4,
//! proxy v6, management v4, management v6); every connection slot's client,
//! target, and DoH sockets live at `stm::TOKEN_BASE + slot*3 + {0,1,2}`
//! (`stm::client_token`/`target_token`/`doh_token`).

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, UdpSocket};
use mio::{Events, Interest, Poll, Token};

use crate::access_log::AccessLog;
use crate::address;
use crate::config::Config;
use crate::mng;
use crate::stats::Stats;
use crate::stm::{self, ConnectionSlot, HandlerCtx, StepOutcome};

const CLIENT_V4: Token = Token(0);
const CLIENT_V6: Token = Token(1);
const MNG_V4: Token = Token(2);
const MNG_V6: Token = Token(3);

/// How often `./logs/statistics.txt` is rewritten (spec.md §6).
const STATS_TICK: Duration = Duration::from_secs(5);
/// Upper bound on how long a single `poll` call blocks — short enough that
/// idle-timeout enforcement and the statistics tick stay responsive even
/// when the proxy is otherwise quiet (spec.md §4.8 step 3/step 4).
const POLL_TIMEOUT: Duration = Duration::from_secs(1);
const MNG_DATAGRAM_CAP: usize = 512;

pub struct Reactor {
    poll: Poll,
    events: Events,

    client_v4: Option<TcpListener>,
    client_v6: Option<TcpListener>,
    mng_v4: Option<UdpSocket>,
    mng_v6: Option<UdpSocket>,

    /// Fixed-size slot table, `None` where a slot is free. Index doubles as
    /// the STM's `id` and therefore its token base (spec.md §3 "Connection
    /// slot" / §4.8 "max clients").
    slots: Vec<Option<ConnectionSlot>>,

    /// Treated as an immutable snapshot for the duration of one reactor
    /// iteration; only `apply_config_update` (driven by the management
    /// channel) ever replaces it wholesale, between iterations (spec.md §5
    /// "Shared mutable config").
    config: Config,
    stats: Arc<Stats>,
    access_log: Arc<AccessLog>,
    via_host: String,
    local_addrs: Vec<IpAddr>,

    stats_path: PathBuf,
    last_stats_tick: Instant,
}

impl Reactor {
    pub fn new(config: Config) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry();

        let mut client_v4 = TcpListener::bind(SocketAddr::new(config.proxy_addr_v4, config.proxy_port))?;
        registry.register(&mut client_v4, CLIENT_V4, Interest::READABLE)?;

        let client_v6 = match TcpListener::bind(SocketAddr::new(config.proxy_addr_v6, config.proxy_port)) {
            Ok(mut l) => {
                registry.register(&mut l, CLIENT_V6, Interest::READABLE)?;
                Some(l)
            }
            Err(e) => {
                log::warn!("IPv6 proxy listener unavailable, continuing v4-only: {}", e);
                None
            }
        };

        let mut mng_v4 = UdpSocket::bind(SocketAddr::new(config.mng_addr_v4, config.mng_port))?;
        registry.register(&mut mng_v4, MNG_V4, Interest::READABLE)?;

        let mng_v6 = match UdpSocket::bind(SocketAddr::new(config.mng_addr_v6, config.mng_port)) {
            Ok(mut s) => {
                registry.register(&mut s, MNG_V6, Interest::READABLE)?;
                Some(s)
            }
            Err(e) => {
                log::warn!("IPv6 management listener unavailable: {}", e);
                None
            }
        };

        let access_log = Arc::new(AccessLog::open(Path::new("./logs"))?);
        let stats = Arc::new(Stats::default());
        let via_host = config.via_host();
        let local_addrs = address::local_interface_addrs();
        let max_clients = config.max_clients;

        log::info!(
            "listening on {}:{} (proxy), {}:{} (management)",
            config.proxy_addr_v4, config.proxy_port, config.mng_addr_v4, config.mng_port
        );

        // One event per slot socket (client, target, DoH) can fire in the
        // same poll wake (SPEC_FULL.md: "a `mio::Events` buffer sized to
        // `max_clients * 3`").
        let events_capacity = max_clients * 3;

        Ok(Reactor {
            poll,
            events: Events::with_capacity(events_capacity),
            client_v4: Some(client_v4),
            client_v6,
            mng_v4: Some(mng_v4),
            mng_v6,
            slots: (0..max_clients).map(|_| None).collect(),
            config,
            stats,
            access_log,
            via_host,
            local_addrs,
            stats_path: Path::new("./logs/statistics.txt").to_path_buf(),
            last_stats_tick: Instant::now(),
        })
    }

    /// Run the event loop. Only returns on a fatal `poll` error — the proxy
    /// is meant to run until killed.
    pub fn run(mut self) -> io::Result<()> {
        loop {
            // Step 3: enforce the per-connection idle timeout before blocking
            // in poll, same as the original enforces it before `select`.
            self.enforce_idle_timeouts();
            self.maybe_write_stats();

            match self.poll.poll(&mut self.events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            let mut accept_v4 = false;
            let mut accept_v6 = false;
            let mut mng_v4_ready = false;
            let mut mng_v6_ready = false;
            let mut touched_slots: Vec<usize> = Vec::new();

            for event in self.events.iter() {
                match event.token() {
                    CLIENT_V4 => accept_v4 = true,
                    CLIENT_V6 => accept_v6 = true,
                    MNG_V4 => mng_v4_ready = true,
                    MNG_V6 => mng_v6_ready = true,
                    t => {
                        if let Some((idx, _role)) = stm::slot_of(t) {
                            // A slot's client, target, and DoH sockets can
                            // all fire in the same poll wake; step() already
                            // drains whichever ones the current state cares
                            // about, so each slot is only dispatched once.
                            if !touched_slots.contains(&idx) {
                                touched_slots.push(idx);
                            }
                        }
                    }
                }
            }

            // Step 5: accept connections.
            if accept_v4 {
                self.accept_all(true);
            }
            if accept_v6 {
                self.accept_all(false);
            }

            if mng_v4_ready {
                self.handle_mng(true);
            }
            if mng_v6_ready {
                self.handle_mng(false);
            }

            // Step 6: dispatch the STM for every slot with a pending event.
            for idx in touched_slots {
                self.dispatch_slot(idx);
            }
        }
    }

    fn find_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_none())
    }

    /// Accept every connection currently pending on one listener. mio's epoll
    /// backend is edge-triggered, so unlike the original's "accept one and
    /// stop" (spec.md §4.8 step 5), this drains the listener fully on each
    /// readiness edge — accepting just one per wake and relying on the next
    /// `select` call to re-signal would starve the listener under mio, which
    /// only re-fires on *new* connections arriving, not on backlog already
    /// present.
    fn accept_all(&mut self, v4: bool) {
        loop {
            let listener = if v4 { self.client_v4.as_mut() } else { self.client_v6.as_mut() };
            let Some(listener) = listener else { return };
            let (stream, addr) = match listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("accept failed: {}", e);
                    return;
                }
            };

            if self.config.is_client_blacklisted(addr.ip()) {
                log::info!("rejected blacklisted client {}", addr.ip());
                drop(stream);
                continue;
            }

            let idx = match self.find_free_slot() {
                Some(idx) => idx,
                None => {
                    log::warn!("max_clients ({}) reached, dropping connection from {}", self.config.max_clients, addr);
                    drop(stream);
                    continue;
                }
            };

            let mut slot = ConnectionSlot::new(idx, stream, addr);
            if let Err(e) = slot.sync_interests(self.poll.registry()) {
                log::warn!("failed to register client socket: {}", e);
                continue;
            }
            self.stats.add_connection();
            self.slots[idx] = Some(slot);
        }
    }

    fn dispatch_slot(&mut self, idx: usize) {
        let registry = self.poll.registry();
        let ctx = HandlerCtx {
            registry,
            config: &self.config,
            stats: &self.stats,
            access_log: &self.access_log,
            via_host: &self.via_host,
            local_addrs: &self.local_addrs,
        };

        let Some(slot) = self.slots[idx].as_mut() else { return };
        match stm::step(slot, &ctx) {
            StepOutcome::Yielded => {
                if let Err(e) = slot.sync_interests(registry) {
                    log::warn!("slot {} failed to sync interests: {}", idx, e);
                    stm::teardown(slot, &ctx);
                    self.slots[idx] = None;
                    self.stats.remove_connection();
                }
            }
            StepOutcome::Done => {
                stm::teardown(slot, &ctx);
                self.slots[idx] = None;
                self.stats.remove_connection();
            }
        }
    }

    /// Step 3's kick: close any slot idle longer than `connection_timeout`
    /// (scenario 7). `None` disables the timeout entirely (CLI `-1`).
    fn enforce_idle_timeouts(&mut self) {
        let Some(timeout_secs) = self.config.connection_timeout else { return };
        let timeout = Duration::from_secs(timeout_secs);
        let now = Instant::now();
        let registry = self.poll.registry();

        for idx in 0..self.slots.len() {
            let expired = self.slots[idx]
                .as_ref()
                .is_some_and(|slot| now.duration_since(slot.last_activity) > timeout);
            if !expired {
                continue;
            }
            if let Some(mut slot) = self.slots[idx].take() {
                log::debug!("slot {} idle timeout, closing", idx);
                let ctx = HandlerCtx {
                    registry,
                    config: &self.config,
                    stats: &self.stats,
                    access_log: &self.access_log,
                    via_host: &self.via_host,
                    local_addrs: &self.local_addrs,
                };
                stm::teardown(&mut slot, &ctx);
                self.stats.remove_connection();
            }
        }
    }

    fn maybe_write_stats(&mut self) {
        if self.last_stats_tick.elapsed() < STATS_TICK {
            return;
        }
        if let Err(e) = self.stats.write_to(&self.stats_path) {
            log::warn!("failed to write {}: {}", self.stats_path.display(), e);
        }
        self.last_stats_tick = Instant::now();
    }

    /// Drain and answer every datagram currently pending on one management
    /// socket (spec.md §9's version-1 bitpacked protocol, `mng.rs`).
    fn handle_mng(&mut self, v4: bool) {
        // Take the socket out of `self` for the duration of the exchange so
        // `build_mng_reply` is free to borrow `self` mutably (it may install
        // a new `Config` snapshot) without an aliasing conflict.
        let mut socket = if v4 { self.mng_v4.take() } else { self.mng_v6.take() };

        if let Some(sock) = socket.as_mut() {
            let mut buf = [0u8; MNG_DATAGRAM_CAP];
            loop {
                match sock.recv_from(&mut buf) {
                    Ok((n, from)) => {
                        if let Some((header, payload)) = mng::parse_packet(&buf[..n], &self.config.mng_shared_secret) {
                            if let Some(reply) = self.build_mng_reply(header, payload) {
                                let _ = sock.send_to(&reply, from);
                            }
                        }
                        // A bad secret is silently dropped rather than
                        // answered — matches the protocol's role as a
                        // trusted-network sidecar, not a public endpoint.
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::warn!("management socket recv failed: {}", e);
                        break;
                    }
                }
            }
        }

        if v4 {
            self.mng_v4 = socket;
        } else {
            self.mng_v6 = socket;
        }
    }

    fn build_mng_reply(&mut self, header: mng::Header, payload: &[u8]) -> Option<Vec<u8>> {
        use mng::{Method, PacketType, Status};

        if header.packet_type != PacketType::Request {
            return None;
        }

        match header.method {
            Method::GetMetrics => {
                let snap = self.stats.snapshot();
                let resp = mng::Header { packet_type: PacketType::Response, method: Method::GetMetrics, status: Status::Ok };
                Some(mng::build_packet(&self.config.mng_shared_secret, resp, &mng::encode_metrics(&snap)))
            }
            Method::SetConfig => {
                self.apply_config_update(payload);
                let resp = mng::Header { packet_type: PacketType::Response, method: Method::SetConfig, status: Status::Ok };
                Some(mng::build_packet(&self.config.mng_shared_secret, resp, &[]))
            }
            Method::Other(_) => {
                let resp = mng::Header { packet_type: PacketType::Response, method: header.method, status: Status::Error };
                Some(mng::build_packet(&self.config.mng_shared_secret, resp, &[]))
            }
        }
    }

    /// `SET_CONFIG` payload format (documented choice, DESIGN.md): a UTF-8
    /// body whose optional first line is `timeout=<seconds>` (negative
    /// disables it), and every remaining non-empty line is one hostname for
    /// the new target blacklist, wholesale-replacing the previous one. The
    /// whole `Config` is rebuilt and swapped in one assignment, never
    /// mutated field-by-field in place (spec.md §5, §9's "Shared mutable
    /// config" note).
    fn apply_config_update(&mut self, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload);
        let mut lines = text.lines();
        let mut new_config = self.config.clone();

        if let Some(first) = lines.clone().next() {
            if let Some(val) = first.strip_prefix("timeout=") {
                if let Ok(secs) = val.parse::<i64>() {
                    new_config.connection_timeout = if secs < 0 { None } else { Some(secs as u64) };
                    lines.next();
                }
            }
        }
        new_config.target_blacklist = lines.filter(|l| !l.is_empty()).map(|s| s.to_string()).collect();

        self.config = new_config;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_tokens_never_collide_with_slot_tokens() {
        for slot in 0..4 {
            assert_ne!(stm::client_token(slot), CLIENT_V4);
            assert_ne!(stm::client_token(slot), CLIENT_V6);
            assert_ne!(stm::client_token(slot), MNG_V4);
            assert_ne!(stm::client_token(slot), MNG_V6);
        }
    }
}
