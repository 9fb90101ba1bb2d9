//! Command-line interface (spec.md §6). External collaborator in the
//! original design, built out here so the crate is runnable end to end.

use std::net::IpAddr;

use clap::Parser;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "htdoh-proxy")]
#[command(version, about = "concurrent HTTP/1.1 forward proxy with DoH resolution", long_about = None)]
pub struct Cli {
    /// Listen address for the proxy (IPv4)
    #[arg(short = 'l', long, default_value_t = [0,0,0,0].into(), value_parser = str_to_ip)]
    pub addr: IpAddr,

    /// Listen address for the management channel
    #[arg(short = 'L', long, default_value_t = [127,0,0,1].into(), value_parser = str_to_ip)]
    pub mng_addr: IpAddr,

    /// Proxy TCP port
    #[arg(short = 'p', long, default_value_t = 8080)]
    pub port: u16,

    /// Management UDP port
    #[arg(short = 'o', long, default_value_t = 9090)]
    pub mng_port: u16,

    /// Disable the HTTP Basic / POP3 disectors
    #[arg(short = 'N', long, default_value_t = false)]
    pub no_disectors: bool,

    /// DoH server IP
    #[arg(long = "doh-ip", default_value = "1.1.1.1")]
    pub doh_ip: String,

    /// DoH server port
    #[arg(long = "doh-port", default_value_t = 80)]
    pub doh_port: u16,

    /// DoH server Host header value
    #[arg(long = "doh-host", default_value = "cloudflare-dns.com")]
    pub doh_host: String,

    /// DoH POST path
    #[arg(long = "doh-path", default_value = "/dns-query")]
    pub doh_path: String,

    /// Maximum concurrent client connections
    #[arg(long, default_value_t = 512)]
    pub max_clients: usize,

    /// Idle connection timeout in seconds; -1 disables it
    #[arg(long, default_value_t = 60)]
    pub timeout: i64,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Via header hostname; empty uses the machine FQDN
    #[arg(long, default_value = "")]
    pub via_host: String,

    /// Newline-separated file of client IPs to reject at accept time
    #[arg(long = "client-blacklist-file")]
    pub client_blacklist_file: Option<std::path::PathBuf>,

    /// Newline-separated file of target hostnames to refuse to proxy to
    #[arg(long = "target-blacklist-file")]
    pub target_blacklist_file: Option<std::path::PathBuf>,
}

fn read_lines(path: &std::path::Path) -> Vec<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => text.lines().map(|l| l.trim()).filter(|l| !l.is_empty()).map(|l| l.to_string()).collect(),
        Err(e) => {
            log::warn!("could not read {}: {}", path.display(), e);
            Vec::new()
        }
    }
}

fn str_to_ip(s: &str) -> Result<IpAddr, std::net::AddrParseError> {
    s.parse()
}

/// Exit codes per spec.md §6.
pub const EXIT_OK: i32 = 0;
pub const EXIT_ARG_ERROR: i32 = 1;
pub const EXIT_IO_ERROR: i32 = 2;

impl Cli {
    pub fn into_config(self) -> Config {
        let mut cfg = Config::default();
        cfg.proxy_addr_v4 = self.addr;
        cfg.proxy_port = self.port;
        cfg.mng_addr_v4 = self.mng_addr;
        cfg.mng_port = self.mng_port;
        cfg.disectors_enabled = !self.no_disectors;
        cfg.max_clients = self.max_clients;
        cfg.connection_timeout = if self.timeout < 0 {
            None
        } else {
            Some(self.timeout as u64)
        };
        cfg.log_level = self.log_level;
        cfg.via_hostname = self.via_host;
        cfg.doh.host = self.doh_host;
        cfg.doh.port = self.doh_port;
        cfg.doh.path = self.doh_path;
        if let Ok(ip) = self.doh_ip.parse() {
            cfg.doh.ip = ip;
        }
        if let Some(path) = &self.client_blacklist_file {
            cfg.client_blacklist = read_lines(path)
                .iter()
                .filter_map(|line| line.parse().ok())
                .collect();
        }
        if let Some(path) = &self.target_blacklist_file {
            cfg.target_blacklist = read_lines(path);
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_with_no_args() {
        Cli::command().debug_assert();
    }

    #[test]
    fn negative_timeout_disables_idle_kick() {
        let cli = Cli::parse_from(["htdoh-proxy", "--timeout", "-1"]);
        let cfg = cli.into_config();
        assert_eq!(cfg.connection_timeout, None);
    }

    #[test]
    fn no_disectors_flag_disables_disectors() {
        let cli = Cli::parse_from(["htdoh-proxy", "-N"]);
        let cfg = cli.into_config();
        assert!(!cfg.disectors_enabled);
    }

    #[test]
    fn client_blacklist_file_parses_one_ip_per_line() {
        let dir = std::env::temp_dir().join(format!("htdoh-proxy-args-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("clients.txt");
        std::fs::write(&path, "127.0.0.1\n\n10.0.0.5\nnot-an-ip\n").unwrap();

        let cli = Cli::parse_from(["htdoh-proxy", "--client-blacklist-file", path.to_str().unwrap()]);
        let cfg = cli.into_config();
        assert_eq!(cfg.client_blacklist, vec!["127.0.0.1".parse().unwrap(), "10.0.0.5".parse().unwrap()]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn target_blacklist_file_parses_one_hostname_per_line() {
        let dir = std::env::temp_dir().join(format!("htdoh-proxy-args-test2-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("targets.txt");
        std::fs::write(&path, "blocked.example\n\nalso-blocked.example\n").unwrap();

        let cli = Cli::parse_from(["htdoh-proxy", "--target-blacklist-file", path.to_str().unwrap()]);
        let cfg = cli.into_config();
        assert_eq!(cfg.target_blacklist, vec!["blocked.example".to_string(), "also-blocked.example".to_string()]);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
