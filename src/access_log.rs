//! Append-only access log (`./logs/access.txt`), spec.md §6.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub struct AccessLog {
    path: PathBuf,
}

impl AccessLog {
    pub fn open(dir: &Path) -> io::Result<Self> {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
            }
        }
        Ok(AccessLog {
            path: dir.join("access.txt"),
        })
    }

    fn append_line(&self, line: &str) -> io::Result<()> {
        let mut f = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(f, "{}", line)
    }

    pub fn log_request(&self, client_ip: IpAddr, url: &str) -> io::Result<()> {
        self.append_line(&format!("{} {} {}", timestamp(), client_ip, url))
    }

    /// Scenario 3: `POP3 alice s3cret` recorded alongside ordinary request
    /// lines, through the same append-only sink.
    pub fn log_pop3_credentials(&self, client_ip: IpAddr, user: &str, pass: &str) -> io::Result<()> {
        self.append_line(&format!("{} {} POP3 {} {}", timestamp(), client_ip, user, pass))
    }

    /// Plain HTTP `Authorization: Basic` credentials (spec.md §1), logged the
    /// same way as the POP3 disector's finds.
    pub fn log_basic_credentials(&self, client_ip: IpAddr, user: &str, pass: &str) -> io::Result<()> {
        self.append_line(&format!("{} {} BASIC {} {}", timestamp(), client_ip, user, pass))
    }
}

fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_request_and_pop3_lines() {
        let dir = std::env::temp_dir().join(format!("htdoh-proxy-access-test-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        let log = AccessLog::open(&dir).unwrap();
        log.log_request("127.0.0.1".parse().unwrap(), "http://example.com/").unwrap();
        log.log_pop3_credentials("127.0.0.1".parse().unwrap(), "alice", "s3cret").unwrap();
        log.log_basic_credentials("127.0.0.1".parse().unwrap(), "bob", "hunter2").unwrap();

        let contents = fs::read_to_string(dir.join("access.txt")).unwrap();
        assert!(contents.contains("http://example.com/"));
        assert!(contents.contains("POP3 alice s3cret"));
        assert!(contents.contains("BASIC bob hunter2"));
        let _ = fs::remove_dir_all(&dir);
    }
}
