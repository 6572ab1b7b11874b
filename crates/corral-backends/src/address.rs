//! Container address discovery from runtime `inspect` output.
//!
//! The inspect template ranges over every attached network, so the raw text
//! can be quoted, carry the template engine's `<no value>` marker, or hold
//! two addresses written back to back (`172.17.0.3172.18.0.4`).

use std::net::Ipv4Addr;

const NO_VALUE: &str = "<no value>";
/// Shortest and longest dotted-quad renderings.
const MIN_LEN: usize = 7;
const MAX_LEN: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    #[error("inspect output was empty")]
    Empty,
    #[error("container has no network address")]
    NoValue,
    #[error("no IPv4 address in {0:?}")]
    Invalid(String),
}

/// Extract the first container IPv4 address from raw inspect output.
pub fn parse_container_address(raw: &str) -> Result<Ipv4Addr, AddressParseError> {
    let trimmed = raw.trim().trim_matches(|c| c == '"' || c == '\'').trim();
    if trimmed.is_empty() {
        return Err(AddressParseError::Empty);
    }
    let cleaned = trimmed.replace(NO_VALUE, "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return Err(AddressParseError::NoValue);
    }

    if !cleaned.contains(char::is_whitespace) {
        if let Some(addr) = dotted_quad(cleaned) {
            return Ok(addr);
        }
    }

    let first = cleaned.split_whitespace().next().unwrap_or(cleaned);
    let limit = first.len().min(MAX_LEN);
    (MIN_LEN..=limit)
        .filter(|&len| first.is_char_boundary(len))
        .find_map(|len| dotted_quad(&first[..len]))
        .ok_or_else(|| AddressParseError::Invalid(trimmed.to_string()))
}

/// Strict dotted-quad: four decimal octets of one to three digits, each
/// at most 255.
fn dotted_quad(s: &str) -> Option<Ipv4Addr> {
    let mut octets = [0u8; 4];
    let mut parts = s.split('.');
    for octet in &mut octets {
        let part = parts.next()?;
        if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        *octet = part.parse().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(Ipv4Addr::from(octets))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn plain_address() {
        assert_eq!(parse_container_address("172.17.0.5"), Ok(ip("172.17.0.5")));
        assert_eq!(parse_container_address("172.17.0.5\n"), Ok(ip("172.17.0.5")));
    }

    #[test]
    fn quoted_address() {
        assert_eq!(parse_container_address("\"172.17.0.5\""), Ok(ip("172.17.0.5")));
        assert_eq!(parse_container_address("'10.0.0.1'"), Ok(ip("10.0.0.1")));
    }

    #[test]
    fn concatenated_addresses_take_first_valid_prefix() {
        assert_eq!(parse_container_address("172.17.0.3172.18.0.4"), Ok(ip("172.17.0.3")));
    }

    #[test]
    fn no_value_marker() {
        assert_eq!(parse_container_address("<no value>"), Err(AddressParseError::NoValue));
        assert_eq!(parse_container_address("\"<no value>\""), Err(AddressParseError::NoValue));
        assert_eq!(parse_container_address("<no value>172.18.0.9"), Ok(ip("172.18.0.9")));
    }

    #[test]
    fn empty_input() {
        assert_eq!(parse_container_address(""), Err(AddressParseError::Empty));
        assert_eq!(parse_container_address("  \"\" "), Err(AddressParseError::Empty));
    }

    #[test]
    fn garbage_is_invalid() {
        assert!(matches!(parse_container_address("not-an-ip"), Err(AddressParseError::Invalid(_))));
        assert!(matches!(parse_container_address("300.1.1.1"), Err(AddressParseError::Invalid(_))));
        assert!(matches!(parse_container_address("1.2.3"), Err(AddressParseError::Invalid(_))));
    }

    #[test]
    fn dotted_quad_is_strict() {
        assert!(dotted_quad("1.2.3.4.5").is_none());
        assert!(dotted_quad("1..3.4").is_none());
        assert!(dotted_quad("1.2.3.-4").is_none());
        assert!(dotted_quad("1.2.3.1234").is_none());
        assert_eq!(dotted_quad("255.255.255.255"), Some(Ipv4Addr::BROADCAST));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn clean_and_quoted_tokens_roundtrip(octets in any::<[u8; 4]>()) {
                let addr = Ipv4Addr::from(octets);
                prop_assert_eq!(parse_container_address(&addr.to_string()), Ok(addr));
                prop_assert_eq!(parse_container_address(&format!("\"{addr}\"")), Ok(addr));
            }

            #[test]
            fn concatenation_yields_a_prefix_address(a in any::<[u8; 4]>(), b in any::<[u8; 4]>()) {
                let raw = format!("{}{}", Ipv4Addr::from(a), Ipv4Addr::from(b));
                let parsed = parse_container_address(&raw).unwrap();
                prop_assert!(raw.starts_with(&parsed.to_string()));
            }
        }
    }
}
