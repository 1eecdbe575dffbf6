//! Forwarded-header synthesis for tunneled HTTP requests.
//!
//! When the proxy sits behind a PROXY-protocol load balancer, downstream
//! services still want to see the originating client. The HTTP adapter calls
//! [`add_forwarded_headers`] on the header map it tunnels, filling in the
//! `X-Forwarded-*` family without overwriting values an upstream hop already
//! set.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

const FORWARDED_FOR: &str = "x-forwarded-for";
const FORWARDED_PORT: &str = "x-forwarded-port";
const FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Synthesizes `X-Forwarded-For`, `X-Forwarded-Port` and `X-Forwarded-Proto`
/// into `headers`.
///
/// `peer` is the TCP peer of the client connection; `originating_port` is the
/// port the connection was accepted on, when known. The proto is `https` iff
/// that port is in the configured `https_ports` set.
pub(crate) fn add_forwarded_headers(
    headers: &mut HashMap<String, Vec<String>>,
    peer: Option<SocketAddr>,
    originating_port: Option<u16>,
    https_ports: &HashSet<u16>,
) {
    if let Some(peer) = peer {
        let client_ip = peer.ip().to_string();
        match headers.get_mut(FORWARDED_FOR) {
            Some(values) if !values.is_empty() => {
                let joined = format!("{}, {client_ip}", values.join(", "));
                *values = vec![joined];
            }
            _ => {
                headers.insert(FORWARDED_FOR.to_owned(), vec![client_ip]);
            }
        }
    }

    let Some(port) = originating_port else {
        return;
    };
    if !headers.contains_key(FORWARDED_PORT) {
        headers.insert(FORWARDED_PORT.to_owned(), vec![port.to_string()]);
    }
    if !headers.contains_key(FORWARDED_PROTO) {
        let proto = if https_ports.contains(&port) { "https" } else { "http" };
        headers.insert(FORWARDED_PROTO.to_owned(), vec![proto.to_owned()]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Option<SocketAddr> {
        Some("203.0.113.9:54321".parse().unwrap())
    }

    #[test]
    fn appends_to_existing_forwarded_for() {
        let mut headers = HashMap::from([(
            FORWARDED_FOR.to_owned(),
            vec!["198.51.100.1".to_owned()],
        )]);
        add_forwarded_headers(&mut headers, peer(), None, &HashSet::new());
        assert_eq!(
            headers[FORWARDED_FOR],
            vec!["198.51.100.1, 203.0.113.9".to_owned()]
        );
    }

    #[test]
    fn proto_follows_the_https_ports_set() {
        let https_ports = HashSet::from([443, 8443]);

        let mut headers = HashMap::new();
        add_forwarded_headers(&mut headers, peer(), Some(443), &https_ports);
        assert_eq!(headers[FORWARDED_PROTO], vec!["https".to_owned()]);
        assert_eq!(headers[FORWARDED_PORT], vec!["443".to_owned()]);

        let mut headers = HashMap::new();
        add_forwarded_headers(&mut headers, peer(), Some(80), &https_ports);
        assert_eq!(headers[FORWARDED_PROTO], vec!["http".to_owned()]);
    }

    #[test]
    fn existing_proto_is_not_overwritten() {
        let mut headers = HashMap::from([(
            FORWARDED_PROTO.to_owned(),
            vec!["https".to_owned()],
        )]);
        add_forwarded_headers(&mut headers, None, Some(80), &HashSet::new());
        assert_eq!(headers[FORWARDED_PROTO], vec!["https".to_owned()]);
        assert!(!headers.contains_key(FORWARDED_FOR));
    }
}
