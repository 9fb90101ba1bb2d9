//! Address utilities (C9): target URL parsing, FQDN discovery, and the
//! self-address check used for proxy-loop prevention.

use std::net::IpAddr;

use crate::error::HttpStatus;
use crate::http::Method;

pub const MAX_HOSTNAME_LEN: usize = 100;
pub const MAX_PATH_LEN: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUrl {
    pub hostname: String,
    pub port: u16,
    pub path: String,
    pub protocol: String,
}

/// Parse the per-connection target out of the request line's raw target,
/// per spec.md §3 ("a separately-parsed `{hostname[100], port, path[100],
/// protocol[6]}` is held on the connection slot").
pub fn parse_target(method: Method, raw_target: &str) -> Result<TargetUrl, HttpStatus> {
    if method == Method::Connect {
        let (host, port) = split_host_port(raw_target, 443)?;
        return Ok(TargetUrl {
            hostname: truncate(host, MAX_HOSTNAME_LEN),
            port,
            path: String::new(),
            protocol: String::new(),
        });
    }

    if let Some(rest) = raw_target.strip_prefix("http://") {
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        let (host, port) = split_host_port(authority, 80)?;
        return Ok(TargetUrl {
            hostname: truncate(&host, MAX_HOSTNAME_LEN),
            port,
            path: truncate(path, MAX_PATH_LEN),
            protocol: "http".to_string(),
        });
    }

    // Origin-form target (relative path only) — the caller is expected to
    // have already resolved the target from a prior absolute-form request on
    // the same connection; without a scheme+authority we cannot resolve one
    // here, so surface it as malformed.
    Err(HttpStatus::BadRequest)
}

fn split_host_port(authority: &str, default_port: u16) -> Result<(String, u16), HttpStatus> {
    if authority.is_empty() {
        return Err(HttpStatus::BadRequest);
    }
    if let Some(rest) = authority.strip_prefix('[') {
        // IPv6 literal in bracketed form: [::1]:8080
        let end = rest.find(']').ok_or(HttpStatus::BadRequest)?;
        let host = format!("[{}]", &rest[..end]);
        let tail = &rest[end + 1..];
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse::<u16>().map_err(|_| HttpStatus::BadRequest)?,
            None => default_port,
        };
        return Ok((host, port));
    }
    match authority.rsplit_once(':') {
        Some((host, port_str)) if !host.is_empty() => {
            match port_str.parse::<u16>() {
                Ok(port) => Ok((host.to_string(), port)),
                Err(_) => Err(HttpStatus::BadRequest),
            }
        }
        _ => Ok((authority.to_string(), default_port)),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        s[..max].to_string()
    }
}

/// Step 1 of DoH resolution (spec.md §4.6): literal IPv4/IPv6 addresses skip
/// DoH entirely.
pub fn try_parse_literal(host: &str) -> Option<IpAddr> {
    let trimmed = host.strip_prefix('[').and_then(|s| s.strip_suffix(']')).unwrap_or(host);
    trimmed.parse::<IpAddr>().ok()
}

/// Best-effort FQDN discovery for the `Via` header when `viaProxyName` is
/// unconfigured — `gethostname(2)` without a canonicalizing `getaddrinfo`
/// round trip (AI_CANONNAME is best-effort in the original too; a failure
/// there just falls back to the short hostname).
pub fn local_fqdn() -> String {
    let mut buf = vec![0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return String::new();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Enumerate this host's own IPv4/IPv6 addresses via `getifaddrs(3)`, used by
/// `is_self_address` for proxy-loop prevention (spec.md §4.6 step 5,
/// scenario 5).
pub fn local_interface_addrs() -> Vec<IpAddr> {
    let mut out = Vec::new();
    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
    unsafe {
        if libc::getifaddrs(&mut head) != 0 {
            return out;
        }
        let mut cur = head;
        while !cur.is_null() {
            let ifa = &*cur;
            if !ifa.ifa_addr.is_null() {
                let family = (*ifa.ifa_addr).sa_family as i32;
                if family == libc::AF_INET {
                    let sin = ifa.ifa_addr as *const libc::sockaddr_in;
                    let ip = u32::from_be((*sin).sin_addr.s_addr);
                    out.push(IpAddr::V4(std::net::Ipv4Addr::from(ip)));
                } else if family == libc::AF_INET6 {
                    let sin6 = ifa.ifa_addr as *const libc::sockaddr_in6;
                    out.push(IpAddr::V6(std::net::Ipv6Addr::from((*sin6).sin6_addr.s6_addr)));
                }
            }
            cur = ifa.ifa_next;
        }
        libc::freeifaddrs(head);
    }
    out
}

/// Loop prevention: does `candidate` point back at this proxy process,
/// specifically on the port the proxy itself listens on? Spec.md §4.6 step 5
/// and scenario 5.
pub fn is_self_address(candidate: IpAddr, candidate_port: u16, proxy_port: u16, local_addrs: &[IpAddr]) -> bool {
    if candidate_port != proxy_port {
        return false;
    }
    candidate.is_loopback() || local_addrs.iter().any(|a| *a == candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_target_splits_host_and_port() {
        let t = parse_target(Method::Connect, "example.com:443").unwrap();
        assert_eq!(t.hostname, "example.com");
        assert_eq!(t.port, 443);
    }

    #[test]
    fn connect_target_defaults_port_443() {
        let t = parse_target(Method::Connect, "example.com").unwrap();
        assert_eq!(t.port, 443);
    }

    #[test]
    fn absolute_form_get_parses_host_path_protocol() {
        let t = parse_target(Method::Get, "http://example.com/a/b").unwrap();
        assert_eq!(t.hostname, "example.com");
        assert_eq!(t.port, 80);
        assert_eq!(t.path, "/a/b");
        assert_eq!(t.protocol, "http");
    }

    #[test]
    fn absolute_form_get_with_explicit_port() {
        let t = parse_target(Method::Get, "http://example.com:8080/").unwrap();
        assert_eq!(t.port, 8080);
    }

    #[test]
    fn absolute_form_defaults_to_root_path() {
        let t = parse_target(Method::Get, "http://example.com").unwrap();
        assert_eq!(t.path, "/");
    }

    #[test]
    fn literal_ipv4_detected() {
        assert!(try_parse_literal("127.0.0.1").is_some());
        assert!(try_parse_literal("example.com").is_none());
    }

    #[test]
    fn literal_ipv6_bracketed_detected() {
        assert!(try_parse_literal("[::1]").is_some());
    }

    #[test]
    fn self_address_requires_matching_port() {
        let local = vec!["10.0.0.5".parse().unwrap()];
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        assert!(is_self_address(ip, 8080, 8080, &local));
        assert!(!is_self_address(ip, 9999, 8080, &local));
    }

    #[test]
    fn loopback_is_always_self_on_proxy_port() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(is_self_address(ip, 8080, 8080, &[]));
    }
}
