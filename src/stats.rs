//! Parser for listener lines of a `STATS P` capability report.
//!
//! A server answers `STATS P` with one notice per listening socket:
//!
//! ```text
//! *** Listener on irc.example:6697 (IPv4): has 12 client(s), options: tls
//! ```
//!
//! Only the port and the option tokens matter to discovery.

use thiserror::Error;

/// Option token marking a TLS listener.
const TLS_OPTION: &str = "tls";
/// Option token marking a listener reserved for server links.
const SERVERS_ONLY_OPTION: &str = "serversonly";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerLine {
    pub port: u16,
    pub is_tls: bool,
    pub is_peer_only: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatsLineError {
    #[error("not a listener line")]
    NotListener,
    #[error("malformed listener line: {0}")]
    Malformed(&'static str),
    #[error("invalid port {0:?}")]
    BadPort(String),
}

/// Parse one listener line.
pub fn parse_listener_line(line: &str) -> Result<ListenerLine, StatsLineError> {
    let line = line.trim_end_matches(&['\r', '\n'][..]);
    let rest = line.strip_prefix("*** ").unwrap_or(line);
    let rest = rest
        .strip_prefix("Listener on ")
        .ok_or(StatsLineError::NotListener)?;

    let (endpoint, rest) = rest
        .split_once(" (IPv")
        .ok_or(StatsLineError::Malformed("missing address family"))?;
    // IPv6 hosts contain colons, the port is always after the last one.
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or(StatsLineError::Malformed("missing port"))?;
    if host.is_empty() {
        return Err(StatsLineError::Malformed("empty host"));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| StatsLineError::BadPort(port.to_string()))?;

    let (family, rest) = rest
        .split_once("): has ")
        .ok_or(StatsLineError::Malformed("missing client count"))?;
    if family != "4" && family != "6" {
        return Err(StatsLineError::Malformed("unknown address family"));
    }
    let (clients, options) = rest
        .split_once(" client(s), options: ")
        .ok_or(StatsLineError::Malformed("missing options"))?;
    if clients.is_empty() || !clients.bytes().all(|b| b.is_ascii_digit()) {
        return Err(StatsLineError::Malformed("bad client count"));
    }

    let mut parsed = ListenerLine {
        port,
        is_tls: false,
        is_peer_only: false,
    };
    for token in options.split_whitespace() {
        match token {
            TLS_OPTION => parsed.is_tls = true,
            SERVERS_ONLY_OPTION => parsed.is_peer_only = true,
            _ => {}
        }
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_client_tls_listener() {
        let line = "*** Listener on a.example:6697 (IPv4): has 3 client(s), options: tls ";
        assert_eq!(
            parse_listener_line(line),
            Ok(ListenerLine {
                port: 6697,
                is_tls: true,
                is_peer_only: false
            })
        );
    }

    #[test]
    fn parses_server_only_ipv6_listener() {
        let line = "Listener on 2001:db8::1:7000 (IPv6): has 0 client(s), options: serversonly tls";
        let parsed = parse_listener_line(line).unwrap();
        assert_eq!(parsed.port, 7000);
        assert!(parsed.is_tls);
        assert!(parsed.is_peer_only);
    }

    #[test]
    fn plaintext_listener_is_not_tls() {
        let line = "*** Listener on *:6667 (IPv4): has 40 client(s), options: clientsonly";
        let parsed = parse_listener_line(line).unwrap();
        assert!(!parsed.is_tls);
    }

    #[test]
    fn option_match_is_whole_token() {
        let line = "*** Listener on *:6697 (IPv4): has 1 client(s), options: notls";
        assert!(!parse_listener_line(line).unwrap().is_tls);
    }

    #[test]
    fn rejects_other_lines() {
        assert_eq!(
            parse_listener_line("*** Notice -- something else"),
            Err(StatsLineError::NotListener)
        );
        assert_eq!(
            parse_listener_line("*** Listener on host:99999 (IPv4): has 1 client(s), options: tls"),
            Err(StatsLineError::BadPort("99999".into()))
        );
        assert!(matches!(
            parse_listener_line("*** Listener on host:6697 (IPv5): has 1 client(s), options: tls"),
            Err(StatsLineError::Malformed(_))
        ));
        assert!(matches!(
            parse_listener_line("*** Listener on host:6697 (IPv4): has many client(s), options: tls"),
            Err(StatsLineError::Malformed(_))
        ));
    }
}
