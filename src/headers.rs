//! Header rewriter (C10): RFC 7230 hop-by-hop handling applied to both
//! requests and responses.

use crate::http::HttpMessage;

fn rtrim_names(msg: &mut HttpMessage) {
    for (name, _) in msg.headers.iter_mut() {
        while name.ends_with(|c: char| c.is_whitespace()) {
            name.pop();
        }
    }
}

fn append_via(msg: &mut HttpMessage, proxy_host: &str) {
    if let Some(existing) = msg.headers.iter_mut().find(|(n, _)| n == "Via") {
        existing.1.push_str(&format!(", 1.1 {}", proxy_host));
    } else {
        msg.headers.push(("Via".to_string(), format!(" 1.1 {}", proxy_host)));
    }
}

fn set_or_append_host(msg: &mut HttpMessage, target_host: &str) {
    let value = format!(" {}", target_host);
    if let Some(existing) = msg.headers.iter_mut().find(|(n, _)| n == "Host") {
        existing.1 = value;
    } else {
        msg.headers.push(("Host".to_string(), value));
    }
}

/// Remove every header listed as a comma-separated token inside
/// `Connection:`. The `close` token is only *noted*, never acted on — the
/// connection is kept open regardless (spec.md §4.9, §9 Open Questions).
fn strip_connection_listed(msg: &mut HttpMessage) -> Vec<String> {
    let tokens: Vec<String> = msg
        .header("Connection")
        .map(|v| v.split(',').map(|t| t.trim().to_string()).collect())
        .unwrap_or_default();
    for token in &tokens {
        if !token.is_empty() {
            msg.remove_header(token);
        }
    }
    tokens
}

/// Applies to an outgoing request: Host replacement, `Via` append,
/// `Connection`-listed header removal (spec.md §4.9).
pub fn rewrite_request(msg: &mut HttpMessage, target_host: Option<&str>, proxy_host: &str) {
    rtrim_names(msg);
    if let Some(host) = target_host {
        if !host.is_empty() {
            set_or_append_host(msg, host);
        }
    }
    append_via(msg, proxy_host);
    strip_connection_listed(msg);
}

/// Applies to an incoming response: only `Via` and `Connection`-listed
/// removal apply (spec.md §4.9 — "For responses, only the `Via` and
/// `Connection`-list rules apply.").
pub fn rewrite_response(msg: &mut HttpMessage, proxy_host: &str) {
    rtrim_names(msg);
    append_via(msg, proxy_host);
    strip_connection_listed(msg);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg_with(headers: &[(&str, &str)]) -> HttpMessage {
        HttpMessage {
            headers: headers.iter().map(|(n, v)| (n.to_string(), v.to_string())).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn replaces_host_with_leading_space_value() {
        let mut msg = msg_with(&[("Host", "old.example")]);
        rewrite_request(&mut msg, Some("new.example"), "proxy.local");
        assert_eq!(msg.header("Host"), Some(" new.example"));
    }

    #[test]
    fn appends_host_when_absent() {
        let mut msg = msg_with(&[]);
        rewrite_request(&mut msg, Some("new.example"), "proxy.local");
        assert_eq!(msg.header("Host"), Some(" new.example"));
    }

    #[test]
    fn via_appended_with_comma_on_existing_chain() {
        let mut msg = msg_with(&[("Via", " 1.0 upstream")]);
        rewrite_request(&mut msg, None, "proxy.local");
        assert_eq!(msg.header("Via"), Some(" 1.0 upstream, 1.1 proxy.local"));
    }

    #[test]
    fn via_created_when_absent() {
        let mut msg = msg_with(&[]);
        rewrite_response(&mut msg, "proxy.local");
        assert_eq!(msg.header("Via"), Some(" 1.1 proxy.local"));
    }

    #[test]
    fn connection_listed_headers_removed_but_connection_kept() {
        let mut msg = msg_with(&[
            ("Connection", "X-Foo, X-Bar"),
            ("X-Foo", "1"),
            ("X-Bar", "2"),
            ("X-Baz", "3"),
        ]);
        rewrite_request(&mut msg, None, "proxy.local");
        assert!(msg.header("X-Foo").is_none());
        assert!(msg.header("X-Bar").is_none());
        assert_eq!(msg.header("X-Baz"), Some("3"));
        assert!(msg.header("Connection").is_some());
    }

    #[test]
    fn rewrite_is_idempotent_except_for_via_growth() {
        let mut msg = msg_with(&[("Host", "a.example")]);
        rewrite_request(&mut msg, Some("a.example"), "proxy.local");
        let after_first = msg.clone();
        rewrite_request(&mut msg, Some("a.example"), "proxy.local");
        assert_eq!(msg.header("Host"), after_first.header("Host"));
        assert_eq!(
            msg.header("Via"),
            Some(" 1.1 proxy.local, 1.1 proxy.local")
        );
    }
}
