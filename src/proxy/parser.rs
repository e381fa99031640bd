//! Link parser module for turning connection links into descriptors
//!
//! Parsing is pure: no network or filesystem access happens here.

use crate::error::ParseError;
use crate::proxy::models::{ConnectionDescriptor, HttpMasquerade, Scheme, TransportOptions};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;

/// Default network type when the link has no `type`
pub const DEFAULT_NETWORK: &str = "tcp";

/// Default for `headerType`, `security` and `encryption`
pub const NONE: &str = "none";

/// Header type that turns on the HTTP disguise for tcp
pub const HTTP_HEADER_TYPE: &str = "http";

/// Request path of the HTTP disguise when the link has no `path`
pub const DEFAULT_MASQUERADE_PATH: &str = "/";

const MASQUERADE_VERSION: &str = "1.1";
const MASQUERADE_METHOD: &str = "GET";

/// Matches any supported link embedded in text
static LINK_REGEX: Lazy<Regex> = Lazy::new(|| {
    let schemes = Scheme::ALL
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r#"(?i)\b(?:{})://[^\s"'<>]+"#, schemes)).expect("Invalid link regex")
});

/// Query parameters recognized in a link, resolved against their defaults
///
/// | param        | default |
/// |--------------|---------|
/// | `type`       | `tcp`   |
/// | `headerType` | `none`  |
/// | `security`   | `none`  |
/// | `encryption` | `none`  |
/// | `host`       | absent  |
/// | `path`       | absent  |
///
/// Unrecognized parameters and empty values are ignored; the first
/// occurrence of a repeated parameter wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkParams {
    pub network: String,
    pub header_type: String,
    pub security: String,
    pub encryption: String,
    pub host: Option<String>,
    pub path: Option<String>,
}

impl Default for LinkParams {
    fn default() -> Self {
        Self {
            network: DEFAULT_NETWORK.to_string(),
            header_type: NONE.to_string(),
            security: NONE.to_string(),
            encryption: NONE.to_string(),
            host: None,
            path: None,
        }
    }
}

impl LinkParams {
    /// Resolve the parameters of a parsed link
    pub fn from_url(url: &Url) -> Self {
        let mut network = None;
        let mut header_type = None;
        let mut security = None;
        let mut encryption = None;
        let mut host = None;
        let mut path = None;

        for (key, value) in url.query_pairs() {
            if value.is_empty() {
                continue;
            }
            let slot = match key.as_ref() {
                "type" => &mut network,
                "headerType" => &mut header_type,
                "security" => &mut security,
                "encryption" => &mut encryption,
                "host" => &mut host,
                "path" => &mut path,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.into_owned());
            }
        }

        let defaults = Self::default();
        Self {
            network: network.unwrap_or(defaults.network),
            header_type: header_type.unwrap_or(defaults.header_type),
            security: security.unwrap_or(defaults.security),
            encryption: encryption.unwrap_or(defaults.encryption),
            host,
            path,
        }
    }

    /// Build the stream transport options these parameters describe
    pub fn transport(&self) -> TransportOptions {
        let http = (self.network == DEFAULT_NETWORK && self.header_type == HTTP_HEADER_TYPE).then(|| {
            HttpMasquerade {
                version: MASQUERADE_VERSION.to_string(),
                method: MASQUERADE_METHOD.to_string(),
                path: self
                    .path
                    .clone()
                    .unwrap_or_else(|| DEFAULT_MASQUERADE_PATH.to_string()),
                host: self.host.clone(),
            }
        });

        TransportOptions {
            network: self.network.clone(),
            header_type: self.header_type.clone(),
            security: self.security.clone(),
            http,
        }
    }
}

/// The `credential@host:port#name` part every scheme shares
struct Authority {
    credential: String,
    host: String,
    port: u16,
    name: Option<String>,
}

impl Authority {
    fn from_url(url: &Url) -> Result<Self, ParseError> {
        let credential = urlencoding::decode(url.username())
            .map_err(|e| ParseError::Malformed(e.to_string()))?
            .into_owned();

        let host = url
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
            .unwrap_or_default()
            .to_string();

        let port = url.port().unwrap_or(0);

        if credential.is_empty() || host.is_empty() || port == 0 {
            return Err(ParseError::InvalidLink);
        }

        let name = url
            .fragment()
            .filter(|f| !f.is_empty())
            .map(|f| {
                urlencoding::decode(f)
                    .map(|n| n.into_owned())
                    .unwrap_or_else(|_| f.to_string())
            });

        Ok(Self {
            credential,
            host,
            port,
            name,
        })
    }
}

/// Link parser for turning connection links into descriptors
pub struct LinkParser;

impl LinkParser {
    /// Parse a single connection link
    ///
    /// Supports `vless://credential@host:port?params#name`.
    pub fn parse(link: &str) -> Result<ConnectionDescriptor, ParseError> {
        let url = Url::parse(link.trim()).map_err(|e| ParseError::Malformed(e.to_string()))?;
        let scheme: Scheme = url.scheme().parse()?;

        match scheme {
            Scheme::Vless => Self::parse_vless(&url),
        }
    }

    fn parse_vless(url: &Url) -> Result<ConnectionDescriptor, ParseError> {
        let authority = Authority::from_url(url)?;
        let params = LinkParams::from_url(url);

        Ok(ConnectionDescriptor {
            scheme: Scheme::Vless,
            name: authority.name,
            credential_id: authority.credential,
            address: authority.host,
            port: authority.port,
            transport: params.transport(),
            encryption: params.encryption,
        })
    }

    /// Find every supported link in free text
    ///
    /// Blank lines and lines starting with `#` are skipped.
    pub fn extract_links(content: &str) -> Vec<String> {
        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .flat_map(|line| LINK_REGEX.find_iter(line).map(|m| m.as_str().to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: &str = "12345678-1234-1234-1234-123456789abc";

    #[test]
    fn test_parse_basic_link() {
        let d = LinkParser::parse("vless://abc-123@example.com:443?encryption=none&security=none&type=tcp")
            .unwrap();
        assert_eq!(d.scheme, Scheme::Vless);
        assert_eq!(d.address, "example.com");
        assert_eq!(d.port, 443);
        assert_eq!(d.credential_id, "abc-123");
        assert_eq!(d.encryption, "none");
        assert_eq!(d.transport.network, "tcp");
        assert_eq!(d.transport.security, "none");
        assert!(d.transport.http.is_none());
        assert!(d.name.is_none());
    }

    #[test]
    fn test_parse_applies_defaults() {
        let d = LinkParser::parse(&format!("vless://{}@10.0.0.1:8443", UUID)).unwrap();
        assert_eq!(d.credential_id, UUID);
        assert_eq!(d.address, "10.0.0.1");
        assert_eq!(d.port, 8443);
        assert_eq!(d.encryption, NONE);
        assert_eq!(d.transport.network, DEFAULT_NETWORK);
        assert_eq!(d.transport.header_type, NONE);
        assert_eq!(d.transport.security, NONE);
    }

    #[test]
    fn test_parse_http_masquerade() {
        let d = LinkParser::parse(&format!(
            "vless://{}@example.com:80?type=tcp&headerType=http&host=cdn.example.com&path=%2Fapi",
            UUID
        ))
        .unwrap();
        let http = d.transport.http.unwrap();
        assert_eq!(http.method, "GET");
        assert_eq!(http.version, "1.1");
        assert_eq!(http.path, "/api");
        assert_eq!(http.host.as_deref(), Some("cdn.example.com"));
    }

    #[test]
    fn test_parse_http_masquerade_defaults() {
        let d = LinkParser::parse(&format!("vless://{}@example.com:80?headerType=http", UUID)).unwrap();
        let http = d.transport.http.unwrap();
        assert_eq!(http.path, "/");
        assert!(http.host.is_none());
    }

    #[test]
    fn test_http_header_ignored_for_other_networks() {
        let d = LinkParser::parse(&format!("vless://{}@example.com:443?type=ws&headerType=http", UUID)).unwrap();
        assert_eq!(d.transport.network, "ws");
        assert!(d.transport.http.is_none());
    }

    #[test]
    fn test_parse_invalid_links() {
        let links = [
            "vless://invalid",
            "vless://@example.com:443",
            "vless://uuid@example.com",
            "vless://uuid@example.com:0",
        ];
        for link in links {
            assert_eq!(LinkParser::parse(link), Err(ParseError::InvalidLink), "{}", link);
        }
    }

    #[test]
    fn test_parse_malformed_links() {
        assert!(matches!(LinkParser::parse("not a link"), Err(ParseError::Malformed(_))));
        assert!(LinkParser::parse("vless://uuid@example.com:70000").is_err());
        assert!(LinkParser::parse("vless://uuid@:443").is_err());
        assert!(LinkParser::parse("").is_err());
    }

    #[test]
    fn test_parse_unsupported_scheme() {
        assert_eq!(
            LinkParser::parse("trojan://secret@example.com:443"),
            Err(ParseError::UnsupportedScheme("trojan".to_string()))
        );
    }

    #[test]
    fn test_parse_ipv6_host() {
        let d = LinkParser::parse(&format!("vless://{}@[2001:db8::1]:443", UUID)).unwrap();
        assert_eq!(d.address, "2001:db8::1");
        assert_eq!(d.endpoint(), "[2001:db8::1]:443");
    }

    #[test]
    fn test_parse_fragment_name() {
        let d = LinkParser::parse(&format!("vless://{}@example.com:443?type=tcp#My%20Node", UUID)).unwrap();
        assert_eq!(d.name.as_deref(), Some("My Node"));
    }

    #[test]
    fn test_params_first_occurrence_wins_and_unknown_ignored() {
        let d = LinkParser::parse(&format!(
            "vless://{}@example.com:443?security=tls&security=reality&sni=x.com&flow=xtls&type=",
            UUID
        ))
        .unwrap();
        assert_eq!(d.transport.security, "tls");
        assert_eq!(d.transport.network, DEFAULT_NETWORK);
    }

    #[test]
    fn test_extract_links() {
        let content = format!(
            r#"
vless://{uuid}@a.example.com:443?type=tcp#A
# vless://{uuid}@commented.example.com:443
some text vless://{uuid}@b.example.com:8443 trailing
trojan://pw@c.example.com:443
"#,
            uuid = UUID
        );
        let links = LinkParser::extract_links(&content);
        assert_eq!(links.len(), 2);
        assert!(links[0].ends_with("#A"));
        assert!(links[1].contains("b.example.com:8443"));
    }
}
