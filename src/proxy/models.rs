//! Link and probe data models

use crate::error::{ParseError, ProbeError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Latency reported whenever a probe failed or was not measured
pub const NO_LATENCY: i64 = -1;

/// Link scheme enumeration
///
/// Every scheme knows how to parse its own links and how to render its own
/// outbound; the probe engine only ever sees a [`ConnectionDescriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Vless,
}

impl Scheme {
    /// All schemes the parser accepts
    pub const ALL: &'static [Scheme] = &[Scheme::Vless];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Vless => "vless",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scheme::ALL
            .iter()
            .copied()
            .find(|scheme| scheme.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseError::UnsupportedScheme(s.to_string()))
    }
}

/// HTTP request disguise applied to a raw TCP stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpMasquerade {
    pub version: String,
    pub method: String,
    pub path: String,
    /// `Host` header override, sent empty when absent
    pub host: Option<String>,
}

/// Stream transport options of an outbound
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportOptions {
    /// Network type (tcp, ws, grpc, ...)
    pub network: String,
    /// Obfuscation header mode
    pub header_type: String,
    /// Security mode (none, tls, reality, ...)
    pub security: String,
    /// Present only for tcp with an http header
    pub http: Option<HttpMasquerade>,
}

/// Parsed representation of a connection link
///
/// Only [`LinkParser`](crate::proxy::LinkParser) builds these, and it never
/// returns a partially populated one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub scheme: Scheme,
    /// Display name taken from the link fragment
    pub name: Option<String>,
    /// Opaque identity, e.g. a UUID
    pub credential_id: String,
    pub address: String,
    pub port: u16,
    pub encryption: String,
    pub transport: TransportOptions,
}

impl ConnectionDescriptor {
    /// Get the server endpoint in HOST:PORT format
    pub fn endpoint(&self) -> String {
        if self.address.contains(':') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    /// Name from the link, or the endpoint when the link had none
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.endpoint())
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.endpoint())
    }
}

/// Outcome of one probe: `(success, message, latency_ms)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub success: bool,
    pub message: String,
    /// Elapsed milliseconds of the probe request, [`NO_LATENCY`] on failure
    pub latency_ms: i64,
}

impl ProbeResult {
    /// Successful probe answered with `status` after `elapsed`
    pub fn working(status: u16, elapsed: Duration) -> Self {
        let latency_ms = (elapsed.as_secs_f64() * 1000.0).round().max(1.0) as i64;
        Self {
            success: true,
            message: format!("Success ({})", status),
            latency_ms,
        }
    }

    /// Failed result carrying only a message
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            latency_ms: NO_LATENCY,
        }
    }

    pub fn is_working(&self) -> bool {
        self.success
    }

    /// Latency as an option, `None` when not measured
    pub fn latency(&self) -> Option<u64> {
        u64::try_from(self.latency_ms).ok()
    }
}

impl From<ProbeError> for ProbeResult {
    fn from(err: ProbeError) -> Self {
        Self::failed(err.to_string())
    }
}

impl From<ParseError> for ProbeResult {
    fn from(err: ParseError) -> Self {
        Self::failed(format!("parse error: {}", err))
    }
}

impl fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, \"{}\", {})", self.success, self.message, self.latency_ms)
    }
}

/// Result of checking one link in a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkCheckReport {
    /// The link as it was given
    pub link: String,
    /// Display name, present when the link parsed
    pub name: Option<String>,
    /// Server endpoint, present when the link parsed
    pub endpoint: Option<String>,
    pub result: ProbeResult,
    pub checked_at: DateTime<Utc>,
}

impl LinkCheckReport {
    pub fn new(link: String, descriptor: Option<&ConnectionDescriptor>, result: ProbeResult) -> Self {
        Self {
            link,
            name: descriptor.map(|d| d.display_name()),
            endpoint: descriptor.map(|d| d.endpoint()),
            result,
            checked_at: Utc::now(),
        }
    }

    pub fn is_working(&self) -> bool {
        self.result.is_working()
    }

    /// Short label for listings
    pub fn label(&self) -> String {
        match (&self.name, &self.endpoint) {
            (Some(name), _) => name.clone(),
            (None, Some(endpoint)) => endpoint.clone(),
            (None, None) => self.link.clone(),
        }
    }
}
