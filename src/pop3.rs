//! Passive POP3 `USER`/`PASS` sniffer (C5).
//!
//! Unlike the HTTP parsers, this one never owns the bytes it looks at — the
//! tunnel forwards everything verbatim regardless of what the sniffer finds.
//! Callers feed it a read-only copy of whatever passed through the tunnel in
//! the client→target direction; the sniffer's own cursor never advances a
//! ring buffer.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pop3State {
    Command,
    CommandVal,
    CommandCr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pop3Event {
    Credentials { user: String, pass: String },
    FailedPassNoUser,
}

#[derive(Debug)]
pub struct Pop3Sniffer {
    state: Pop3State,
    cmd: String,
    val: String,
    user: Option<String>,
}

impl Pop3Sniffer {
    pub fn new() -> Self {
        Pop3Sniffer {
            state: Pop3State::Command,
            cmd: String::new(),
            val: String::new(),
            user: None,
        }
    }

    /// Reset the line-local state machine. Per spec.md §3, the instance is
    /// reset (not destroyed) after each successful credential match.
    pub fn reset_line(&mut self) {
        self.state = Pop3State::Command;
        self.cmd.clear();
        self.val.clear();
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Pop3Event> {
        let mut events = Vec::new();
        for &b in bytes {
            match self.state {
                Pop3State::Command => {
                    if b == b' ' {
                        self.state = Pop3State::CommandVal;
                    } else if b == b'\r' {
                        self.state = Pop3State::CommandCr;
                    } else {
                        self.cmd.push((b as char).to_ascii_uppercase());
                    }
                }
                Pop3State::CommandVal => {
                    if b == b'\r' {
                        self.state = Pop3State::CommandCr;
                    } else {
                        self.val.push(b as char);
                    }
                }
                Pop3State::CommandCr => {
                    if b == b'\n' {
                        if let Some(event) = self.commit_line() {
                            events.push(event);
                        }
                        self.reset_line();
                    } else {
                        // Lone CR not followed by LF: treat as part of the value
                        // and keep scanning rather than desyncing the sniffer —
                        // the tunnel still forwards the bytes untouched.
                        self.val.push('\r');
                        self.val.push(b as char);
                        self.state = Pop3State::CommandVal;
                    }
                }
            }
        }
        events
    }

    fn commit_line(&mut self) -> Option<Pop3Event> {
        match self.cmd.as_str() {
            "USER" => {
                self.user = Some(self.val.trim().to_string());
                None
            }
            "PASS" => {
                if let Some(user) = self.user.take() {
                    Some(Pop3Event::Credentials {
                        user,
                        pass: self.val.trim().to_string(),
                    })
                } else {
                    Some(Pop3Event::FailedPassNoUser)
                }
            }
            _ => None,
        }
    }
}

impl Default for Pop3Sniffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_user_and_pass_across_two_lines() {
        let mut s = Pop3Sniffer::new();
        assert!(s.feed(b"USER alice\r\n").is_empty());
        let events = s.feed(b"PASS s3cret\r\n");
        assert_eq!(
            events,
            vec![Pop3Event::Credentials {
                user: "alice".to_string(),
                pass: "s3cret".to_string(),
            }]
        );
    }

    #[test]
    fn extracts_credentials_fed_in_one_chunk() {
        let mut s = Pop3Sniffer::new();
        let events = s.feed(b"USER bob\r\nPASS hunter2\r\n");
        assert_eq!(
            events,
            vec![Pop3Event::Credentials {
                user: "bob".to_string(),
                pass: "hunter2".to_string(),
            }]
        );
    }

    #[test]
    fn pass_without_user_fails() {
        let mut s = Pop3Sniffer::new();
        let events = s.feed(b"PASS orphan\r\n");
        assert_eq!(events, vec![Pop3Event::FailedPassNoUser]);
    }

    #[test]
    fn other_commands_are_ignored() {
        let mut s = Pop3Sniffer::new();
        let events = s.feed(b"+OK\r\nSTAT\r\n");
        assert!(events.is_empty());
    }

    #[test]
    fn clears_user_after_successful_pair() {
        let mut s = Pop3Sniffer::new();
        s.feed(b"USER alice\r\nPASS first\r\n");
        let events = s.feed(b"PASS second\r\n");
        assert_eq!(events, vec![Pop3Event::FailedPassNoUser]);
    }
}
