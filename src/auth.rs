//! HTTP Basic credential extraction — the other half of the disector (C5)
//! besides the POP3 sniffer: spec.md §1 ("Plain HTTP `Authorization: Basic`
//! credentials are also extracted") and the glossary's "Disector" entry.
//!
//! Grounded on `cccs-rtmorti-libhtp2`'s `htp_parse_authorization_basic`:
//! skip leading whitespace after the scheme token, base64-decode the rest,
//! split on the first `:`. That parser dealt in raw C buffers and `bstr`;
//! here it's a string split, but the shape — trim, decode, split once — is
//! the same.

/// Only the first `Authorization` header is inspected; `Proxy-Authorization`
/// is ignored — a documented gap, not an oversight (spec.md §9 Open
/// Questions).
pub fn extract_basic_credentials(header_value: &str) -> Option<(String, String)> {
    let rest = header_value.trim_start();
    let rest = rest.strip_prefix("Basic").or_else(|| rest.strip_prefix("basic"))?;
    let rest = rest.trim_start();
    if rest.is_empty() {
        return None;
    }
    let decoded = base64::decode(rest).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(s: &str) -> String {
        base64::encode(s.as_bytes())
    }

    #[test]
    fn extracts_user_and_pass_from_basic_header() {
        let value = format!("Basic {}", b64("alice:s3cret"));
        let (user, pass) = extract_basic_credentials(&value).unwrap();
        assert_eq!(user, "alice");
        assert_eq!(pass, "s3cret");
    }

    #[test]
    fn rejects_non_basic_scheme() {
        assert!(extract_basic_credentials("Bearer abc123").is_none());
    }

    #[test]
    fn rejects_malformed_base64() {
        assert!(extract_basic_credentials("Basic not-valid-base64!!").is_none());
    }

    #[test]
    fn rejects_decoded_value_with_no_colon() {
        let value = format!("Basic {}", b64("nocolonhere"));
        assert!(extract_basic_credentials(&value).is_none());
    }
}
