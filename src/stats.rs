//! Connection/byte counters and the periodic `./logs/statistics.txt` writer.
//!
//! Spec.md §5 treats these as plain integer arithmetic updated from a
//! single thread (the reactor, plus the management handler running on the
//! same thread off a UDP FD) — `Ordering::Relaxed` is enough; there is no
//! cross-thread contention to order against.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Stats {
    pub total_connections: AtomicU64,
    pub concurrent_connections: AtomicU64,
    pub total_bytes_sent: AtomicU64,
    pub total_bytes_received: AtomicU64,
}

impl Stats {
    pub fn add_connection(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.concurrent_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove_connection(&self) {
        self.concurrent_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_sent_bytes(&self, n: u64) {
        self.total_bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_recieved(&self, n: u64) {
        self.total_bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            concurrent_connections: self.concurrent_connections.load(Ordering::Relaxed),
            total_bytes_sent: self.total_bytes_sent.load(Ordering::Relaxed),
            total_bytes_received: self.total_bytes_received.load(Ordering::Relaxed),
        }
    }

    /// Rewrite `./logs/statistics.txt` with the current snapshot. Called
    /// from the reactor's `poll` loop at a fixed interval (see
    /// `reactor::STATS_TICK`), never on its own timer thread — this stays a
    /// single-threaded proxy.
    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        let snap = self.snapshot();
        let mut f = fs::File::create(path)?;
        writeln!(f, "total_connections: {}", snap.total_connections)?;
        writeln!(f, "concurrent_connections: {}", snap.concurrent_connections)?;
        writeln!(f, "total_bytes_sent: {}", snap.total_bytes_sent)?;
        writeln!(f, "total_bytes_received: {}", snap.total_bytes_received)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total_connections: u64,
    pub concurrent_connections: u64,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_counters_track_concurrent_and_total() {
        let s = Stats::default();
        s.add_connection();
        s.add_connection();
        s.remove_connection();
        let snap = s.snapshot();
        assert_eq!(snap.total_connections, 2);
        assert_eq!(snap.concurrent_connections, 1);
    }

    #[test]
    fn byte_counters_accumulate() {
        let s = Stats::default();
        s.add_sent_bytes(100);
        s.add_bytes_recieved(50);
        s.add_sent_bytes(1);
        let snap = s.snapshot();
        assert_eq!(snap.total_bytes_sent, 101);
        assert_eq!(snap.total_bytes_received, 50);
    }

    #[test]
    fn write_to_produces_a_readable_file() {
        let dir = std::env::temp_dir().join(format!("htdoh-proxy-stats-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("statistics.txt");
        let s = Stats::default();
        s.add_connection();
        s.write_to(&path).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("total_connections: 1"));
        let _ = fs::remove_dir_all(&dir);
    }
}
