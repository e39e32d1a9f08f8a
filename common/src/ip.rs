use std::{
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

use actix_web::http::header::HeaderMap;
use sqlx::types::ipnetwork::IpNetwork;

use crate::error::{AppError, Res};

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Which `X-Forwarded-For` entry identifies the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpExtractor {
    #[default]
    FirstForwardFor,
    LastForwardFor,
}

impl FromStr for IpExtractor {
    type Err = AppError;

    fn from_str(s: &str) -> Res<Self> {
        match s.trim() {
            "" | "firstForwardFor" => Ok(IpExtractor::FirstForwardFor),
            "lastForwardFor" => Ok(IpExtractor::LastForwardFor),
            other => Err(AppError::Validation(format!(
                "Unknown ip extractor type '{}'",
                other
            ))),
        }
    }
}

impl IpExtractor {
    /// Client IP from the forwarding header, falling back to the peer address.
    pub fn extract(&self, headers: &HeaderMap, peer: Option<&str>) -> String {
        let forwarded = headers
            .get(FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        let raw = match forwarded {
            Some(list) => match self {
                IpExtractor::FirstForwardFor => list.split(',').next().unwrap_or(list),
                IpExtractor::LastForwardFor => list.rsplit(',').next().unwrap_or(list),
            },
            None => peer.unwrap_or(""),
        };
        trim_port(raw.trim())
    }
}

fn trim_port(s: &str) -> String {
    if let Ok(ip) = IpAddr::from_str(s) {
        return ip.to_string();
    }
    if let Ok(addr) = SocketAddr::from_str(s) {
        return addr.ip().to_string();
    }
    match s.split_once(':') {
        Some((host, _)) => host.to_string(),
        None => s.to_string(),
    }
}

/// Parses a comma separated CIDR list. Empty input is an empty list.
pub fn parse_white_list(list: &str) -> Res<Vec<IpNetwork>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            IpNetwork::from_str(s)
                .map_err(|e| AppError::Validation(format!("wrong IP CIDR '{}': {}", s, e)))
        })
        .collect()
}

/// Checks `ip` against a CIDR allow-list. An empty list allows everything;
/// an address that does not parse matches no network.
pub fn ip_allowed(white_list: &str, ip: &str) -> Res<bool> {
    let networks = parse_white_list(white_list)?;
    if networks.is_empty() {
        return Ok(true);
    }
    Ok(IpAddr::from_str(ip)
        .map(|addr| networks.iter().any(|n| n.contains(addr)))
        .unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::header::{HeaderName, HeaderValue};

    fn headers(forwarded: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(
            HeaderName::from_static(FORWARDED_FOR),
            HeaderValue::from_str(forwarded).unwrap(),
        );
        map
    }

    #[test]
    fn picks_forwarded_entry() {
        let h = headers("10.0.0.1:3000, 10.0.0.2, 10.0.0.3");
        assert_eq!(IpExtractor::FirstForwardFor.extract(&h, Some("1.1.1.1")), "10.0.0.1");
        assert_eq!(IpExtractor::LastForwardFor.extract(&h, Some("1.1.1.1")), "10.0.0.3");
    }

    #[test]
    fn falls_back_to_peer() {
        let h = HeaderMap::new();
        assert_eq!(IpExtractor::FirstForwardFor.extract(&h, Some("192.168.1.5:5555")), "192.168.1.5");
        assert_eq!(IpExtractor::FirstForwardFor.extract(&h, Some("[::1]:8080")), "::1");
        assert_eq!(IpExtractor::FirstForwardFor.extract(&h, None), "");
    }

    #[test]
    fn parses_extractor_type() {
        assert_eq!("lastForwardFor".parse::<IpExtractor>().unwrap(), IpExtractor::LastForwardFor);
        assert_eq!("".parse::<IpExtractor>().unwrap(), IpExtractor::FirstForwardFor);
        assert!("middle".parse::<IpExtractor>().is_err());
    }

    #[test]
    fn white_list() {
        assert!(ip_allowed("", "1.2.3.4").unwrap());
        assert!(ip_allowed("10.0.0.0/8, 192.168.0.0/16", "10.20.30.40").unwrap());
        assert!(!ip_allowed("10.0.0.0/8", "11.0.0.1").unwrap());
        assert!(ip_allowed("2001:db8::/32", "2001:db8::1").unwrap());
        assert!(ip_allowed("10.0.0.0/33", "10.0.0.1").is_err());
        assert!(!ip_allowed("10.0.0.0/8", "unknown").unwrap());
        assert!(ip_allowed("", "unknown").unwrap());
    }
}
