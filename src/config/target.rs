//! Relay targets and the port -> target mapping

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use anyhow::{anyhow, bail, Context};

use super::RouteConfig;
use crate::Result;

/// Host part of a relay target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl TargetAddr {
    /// Returns the literal IP when no name resolution is needed
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            TargetAddr::Ipv4(ip) => Some(IpAddr::V4(*ip)),
            TargetAddr::Ipv6(ip) => Some(IpAddr::V6(*ip)),
            TargetAddr::Domain(_) => None,
        }
    }

    pub fn is_domain(&self) -> bool {
        matches!(self, TargetAddr::Domain(_))
    }
}

impl FromStr for TargetAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            bail!("target host is empty");
        }

        let unbracketed = s
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'));
        if let Some(inner) = unbracketed {
            let ip = inner
                .parse::<Ipv6Addr>()
                .with_context(|| format!("Invalid bracketed IPv6 address: {}", s))?;
            return Ok(TargetAddr::Ipv6(ip));
        }

        if let Ok(ip) = s.parse::<Ipv4Addr>() {
            return Ok(TargetAddr::Ipv4(ip));
        }
        if let Ok(ip) = s.parse::<Ipv6Addr>() {
            return Ok(TargetAddr::Ipv6(ip));
        }

        if s.len() > 253 {
            bail!("target host exceeds 253 characters");
        }
        if s.chars().any(|c| c.is_whitespace() || c == ':' || c == '/') {
            bail!("Invalid target host: {}", s);
        }

        Ok(TargetAddr::Domain(s.to_string()))
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ipv4(ip) => write!(f, "{}", ip),
            TargetAddr::Ipv6(ip) => write!(f, "[{}]", ip),
            TargetAddr::Domain(domain) => f.write_str(domain),
        }
    }
}

/// Where a listen port relays to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: TargetAddr,
    pub port: u16,
}

impl Target {
    pub fn new(host: TargetAddr, port: u16) -> Self {
        Self { host, port }
    }

    /// Socket address for targets given as a literal IP
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.host.ip().map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One listen port and the target it is wired to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub listen_port: u16,
    pub target: Target,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.listen_port, self.target)
    }
}

/// Immutable listen port -> target table.
///
/// Built once from validated configuration and shared read-only by every
/// listener. There is no way to mutate an entry after construction.
#[derive(Debug, Clone, Default)]
pub struct TargetMapping {
    routes: BTreeMap<u16, Target>,
}

impl TargetMapping {
    /// Build the mapping, rejecting any listen port that appears twice
    pub fn from_routes(routes: &[RouteConfig]) -> Result<Self> {
        let mut mapping = BTreeMap::new();

        for (i, route) in routes.iter().enumerate() {
            let target = route
                .target()
                .with_context(|| format!("Route {} ({}) is invalid", i, route))?;

            if mapping.insert(route.listen_port, target).is_some() {
                bail!("duplicate listen port {} in route {}", route.listen_port, i);
            }
        }

        Ok(Self { routes: mapping })
    }

    pub fn get(&self, listen_port: u16) -> Option<&Target> {
        self.routes.get(&listen_port)
    }

    /// Routes in ascending listen port order
    pub fn routes(&self) -> impl Iterator<Item = Route> + '_ {
        self.routes.iter().map(|(port, target)| Route {
            listen_port: *port,
            target: target.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Parse a `<here_port>:<dest_host>[:<dest_port>]` route spec.
///
/// `dest_port` defaults to `here_port`. IPv6 hosts must be bracketed.
pub fn parse_route_spec(spec: &str) -> Result<RouteConfig> {
    let spec = spec.trim();
    let (here, rest) = spec
        .split_once(':')
        .ok_or_else(|| anyhow!("route spec '{}' must look like <port>:<host>[:<port>]", spec))?;

    let listen_port = parse_port(here)
        .with_context(|| format!("Invalid listen port in route spec '{}'", spec))?;

    let (host, dest_port) = if rest.starts_with('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| anyhow!("unterminated IPv6 host in route spec '{}'", spec))?;
        let host = &rest[..=end];
        match &rest[end + 1..] {
            "" => (host, None),
            tail => match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => bail!("unexpected '{}' after IPv6 host in route spec '{}'", tail, spec),
            },
        }
    } else {
        match rest.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (rest, None),
        }
    };

    let target_port = match dest_port {
        Some(port) => parse_port(port)
            .with_context(|| format!("Invalid target port in route spec '{}'", spec))?,
        None => listen_port,
    };

    // Validate the host now so bad specs fail at parse time
    host.parse::<TargetAddr>()
        .with_context(|| format!("Invalid target host in route spec '{}'", spec))?;

    Ok(RouteConfig {
        listen_port,
        target_host: host.to_string(),
        target_port,
    })
}

fn parse_port(s: &str) -> Result<u16> {
    let port = s
        .trim()
        .parse::<u16>()
        .with_context(|| format!("'{}' is not a port number", s))?;
    if port == 0 {
        bail!("port must be between 1 and 65535");
    }
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(listen_port: u16, host: &str, target_port: u16) -> RouteConfig {
        RouteConfig {
            listen_port,
            target_host: host.to_string(),
            target_port,
        }
    }

    #[test]
    fn test_parse_target_addr() {
        assert_eq!(
            "10.0.0.1".parse::<TargetAddr>().unwrap(),
            TargetAddr::Ipv4(Ipv4Addr::new(10, 0, 0, 1))
        );
        assert_eq!(
            "[::1]".parse::<TargetAddr>().unwrap(),
            TargetAddr::Ipv6(Ipv6Addr::LOCALHOST)
        );
        assert_eq!(
            "::1".parse::<TargetAddr>().unwrap(),
            TargetAddr::Ipv6(Ipv6Addr::LOCALHOST)
        );
        assert_eq!(
            "example.net".parse::<TargetAddr>().unwrap(),
            TargetAddr::Domain("example.net".to_string())
        );
        assert!("".parse::<TargetAddr>().is_err());
        assert!("bad host".parse::<TargetAddr>().is_err());
    }

    #[test]
    fn test_parse_route_spec_with_port() {
        let parsed = parse_route_spec("8443:example.com:443").unwrap();
        assert_eq!(parsed, route(8443, "example.com", 443));
    }

    #[test]
    fn test_parse_route_spec_defaults_target_port() {
        let parsed = parse_route_spec("22:example.net").unwrap();
        assert_eq!(parsed, route(22, "example.net", 22));
    }

    #[test]
    fn test_parse_route_spec_ipv6() {
        assert_eq!(
            parse_route_spec("9000:[::1]:9001").unwrap(),
            route(9000, "[::1]", 9001)
        );
        assert_eq!(parse_route_spec("9000:[::1]").unwrap(), route(9000, "[::1]", 9000));
        assert!(parse_route_spec("9000:[::1").is_err());
    }

    #[test]
    fn test_parse_route_spec_rejects_garbage() {
        assert!(parse_route_spec("9000").is_err());
        assert!(parse_route_spec("0:example.net").is_err());
        assert!(parse_route_spec("70000:example.net").is_err());
        assert!(parse_route_spec("9000:example.net:http").is_err());
        assert!(parse_route_spec("9000::9001").is_err());
    }

    #[test]
    fn test_mapping_rejects_duplicate_ports() {
        let routes = vec![route(9000, "example.net", 9001), route(9000, "example.org", 80)];
        let err = TargetMapping::from_routes(&routes).unwrap_err();
        assert!(err.to_string().contains("duplicate listen port 9000"));
    }

    #[test]
    fn test_mapping_lookup() {
        let routes = vec![route(9000, "example.net", 9001), route(8080, "127.0.0.1", 80)];
        let mapping = TargetMapping::from_routes(&routes).unwrap();

        assert_eq!(mapping.len(), 2);
        assert_eq!(mapping.get(9000).unwrap().to_string(), "example.net:9001");
        assert_eq!(
            mapping.get(8080).unwrap().socket_addr(),
            Some("127.0.0.1:80".parse().unwrap())
        );
        assert!(mapping.get(1).is_none());

        let ports: Vec<u16> = mapping.routes().map(|r| r.listen_port).collect();
        assert_eq!(ports, vec![8080, 9000]);
    }
}
