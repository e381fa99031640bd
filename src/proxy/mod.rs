//! Proxy module for parsing and probing connection links
//!
//! This module provides functionality for:
//! - Parsing connection links into outbound descriptors
//! - Materializing the runtime config of a local proxy process
//! - Probing a descriptor through a supervised proxy process
//! - Checking many links concurrently and loading them from sources
//! - Pinging hosts from geographically distributed nodes

pub mod checker;
pub mod config;
pub mod engine;
pub mod geo;
pub mod models;
pub mod parser;
pub mod source;

pub use checker::LinkChecker;
pub use config::{RuntimeConfig, TransientConfig};
pub use engine::{ProbeConfig, ProbeEngine, ProbeStage};
pub use geo::{GeoConfig, GeoPinger, NodePing};
pub use models::{
    ConnectionDescriptor, HttpMasquerade, LinkCheckReport, ProbeResult, Scheme, TransportOptions,
};
pub use parser::{LinkParams, LinkParser};
pub use source::{SourceConfig, SourceLoader, SourceResult};
