//! Error types for link parsing, probing and geographic pings

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while turning a connection link into a descriptor.
///
/// Parsing never touches the network or the filesystem, so these are
/// always reported before any process or file exists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Credential, host or port is missing or empty
    #[error("invalid link")]
    InvalidLink,

    /// The link scheme has no parser
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// The link is not a URI at all
    #[error("malformed link: {0}")]
    Malformed(String),
}

/// Failures of a single probe, each reported to the caller as a
/// `(false, message, -1)` result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("executable not found")]
    ExecutableNotFound,

    /// Launched, but the local listener never became reachable
    #[error("failed to start")]
    StartupFailure,

    #[error("timeout")]
    Timeout,

    /// The probe target answered outside 200-299
    #[error("HTTP {0}")]
    HttpStatus(u16),

    /// Connection reset, DNS failure, TLS failure and the like
    #[error("error: {0}")]
    Transport(String),
}

/// Infrastructure failures that prevent a probe from being attempted.
///
/// Unlike [`ProbeError`] these are not folded into a probe result.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to allocate a local port: {0}")]
    PortAllocation(#[source] std::io::Error),

    #[error("failed to serialize runtime config: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write runtime config {path}: {source}")]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Out of processes, file descriptors or memory while spawning
    #[error("failed to launch {path}: {source}")]
    Launch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the geographic ping service.
#[derive(Debug, Error)]
pub enum GeoError {
    #[error("API error: {0}")]
    Api(u16),

    #[error("no {0} nodes")]
    NoNodes(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_error_messages() {
        assert_eq!(ProbeError::ExecutableNotFound.to_string(), "executable not found");
        assert_eq!(ProbeError::StartupFailure.to_string(), "failed to start");
        assert_eq!(ProbeError::Timeout.to_string(), "timeout");
        assert_eq!(ProbeError::HttpStatus(503).to_string(), "HTTP 503");
        assert_eq!(
            ProbeError::Transport("connection reset".to_string()).to_string(),
            "error: connection reset"
        );
    }

    #[test]
    fn test_parse_error_messages() {
        assert_eq!(ParseError::InvalidLink.to_string(), "invalid link");
        assert_eq!(
            ParseError::UnsupportedScheme("vmess".to_string()).to_string(),
            "unsupported scheme: vmess"
        );
    }
}
