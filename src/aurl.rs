//! # AURL
//!
//! Abyss URLs name a node and, optionally, where to reach it and what to ask
//! for:
//!
//! ```text
//! aurl     := scheme ":" id [ ":" addrlist ] [ path ]
//! scheme   := "abyss" | "abyst"
//! addrlist := addr ( "|" addr )*
//! addr     := ipv4 ":" port | "[" ipv6 "]" ":" port
//! path     := "/" ...
//! ```
//!
//! `abyss:` addresses the world protocol, `abyst:` the content layer.
//! The path always starts with `/` and defaults to `/`, so
//! `parse(emit(x)) == x` for every value this module produces.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::identity::is_valid_peer_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Abyss,
    Abyst,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Abyss => "abyss",
            Scheme::Abyst => "abyst",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AurlError {
    UnknownScheme(String),
    InvalidId(String),
    InvalidAddress(String),
}

impl fmt::Display for AurlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AurlError::UnknownScheme(s) => write!(f, "unknown AURL scheme: {:?}", s),
            AurlError::InvalidId(s) => write!(f, "invalid peer id in AURL: {:?}", s),
            AurlError::InvalidAddress(s) => write!(f, "invalid address candidate in AURL: {:?}", s),
        }
    }
}

impl std::error::Error for AurlError {}

/// Parsed Abyss URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aurl {
    pub scheme: Scheme,
    pub id: String,
    pub addresses: Vec<SocketAddr>,
    pub path: String,
}

impl Aurl {
    pub fn new(scheme: Scheme, id: impl Into<String>, addresses: Vec<SocketAddr>, path: &str) -> Self {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        Self { scheme, id: id.into(), addresses, path }
    }
}

impl FromStr for Aurl {
    type Err = AurlError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = input
            .split_once(':')
            .ok_or_else(|| AurlError::UnknownScheme(input.to_string()))?;
        let scheme = match scheme {
            "abyss" => Scheme::Abyss,
            "abyst" => Scheme::Abyst,
            other => return Err(AurlError::UnknownScheme(other.to_string())),
        };

        // addresses never contain '/', so the first slash starts the path
        let (head, path) = match rest.find('/') {
            Some(i) => (&rest[..i], rest[i..].to_string()),
            None => (rest, "/".to_string()),
        };
        let (id, addrlist) = match head.split_once(':') {
            Some((id, addrs)) => (id, Some(addrs)),
            None => (head, None),
        };
        if !is_valid_peer_id(id) {
            return Err(AurlError::InvalidId(id.to_string()));
        }

        let mut addresses = Vec::new();
        if let Some(addrlist) = addrlist {
            for candidate in addrlist.split('|') {
                let addr = candidate
                    .parse::<SocketAddr>()
                    .map_err(|_| AurlError::InvalidAddress(candidate.to_string()))?;
                if addr.port() == 0 {
                    return Err(AurlError::InvalidAddress(candidate.to_string()));
                }
                addresses.push(addr);
            }
        }

        Ok(Aurl { scheme, id: id.to_string(), addresses, path })
    }
}

impl fmt::Display for Aurl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme.as_str(), self.id)?;
        for (i, addr) in self.addresses.iter().enumerate() {
            f.write_str(if i == 0 { ":" } else { "|" })?;
            write!(f, "{}", addr)?;
        }
        f.write_str(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> String {
        format!("H{}", "2".repeat(43))
    }

    #[test]
    fn parses_full_form() {
        let input = format!("abyss:{}:192.168.0.2:1605|[::1]:1605/home/world", id());
        let aurl: Aurl = input.parse().expect("valid aurl");
        assert_eq!(aurl.scheme, Scheme::Abyss);
        assert_eq!(aurl.id, id());
        assert_eq!(
            aurl.addresses,
            vec!["192.168.0.2:1605".parse().unwrap(), "[::1]:1605".parse().unwrap()]
        );
        assert_eq!(aurl.path, "/home/world");
        assert_eq!(aurl.to_string(), input);
    }

    #[test]
    fn path_defaults_to_root() {
        let aurl: Aurl = format!("abyst:{}", id()).parse().unwrap();
        assert_eq!(aurl.scheme, Scheme::Abyst);
        assert!(aurl.addresses.is_empty());
        assert_eq!(aurl.path, "/");
        assert_eq!(aurl.to_string().parse::<Aurl>().unwrap(), aurl);
    }

    #[test]
    fn emit_then_parse_is_identity() {
        let aurl = Aurl::new(
            Scheme::Abyss,
            id(),
            vec!["10.0.0.1:9000".parse().unwrap(), "127.0.0.1:9001".parse().unwrap()],
            "home",
        );
        assert_eq!(aurl.path, "/home");
        assert_eq!(aurl.to_string().parse::<Aurl>().unwrap(), aurl);
    }

    #[test]
    fn rejects_malformed() {
        assert!(matches!("http://x".parse::<Aurl>(), Err(AurlError::UnknownScheme(_))));
        assert!(matches!("abyss".parse::<Aurl>(), Err(AurlError::UnknownScheme(_))));
        assert!(matches!("abyss:hshort/".parse::<Aurl>(), Err(AurlError::InvalidId(_))));
        assert!(matches!(
            format!("abyss:{}:notanaddr/", id()).parse::<Aurl>(),
            Err(AurlError::InvalidAddress(_))
        ));
        assert!(matches!(
            format!("abyss:{}:1.2.3.4:0", id()).parse::<Aurl>(),
            Err(AurlError::InvalidAddress(_))
        ));
    }
}
