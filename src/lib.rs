//! Link Probe - Connection Link Parser and Proxy Prober
//!
//! Parses shareable proxy connection links, runs a local proxy process built
//! from them and measures whether traffic actually flows through it.

pub mod error;
pub mod proxy;
pub mod tui;

pub use error::{EngineError, GeoError, ParseError, ProbeError};
pub use proxy::*;

/// Application result type
pub type Result<T> = anyhow::Result<T>;
