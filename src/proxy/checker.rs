//! Link checker module for probing many links concurrently

use crate::proxy::engine::{ProbeConfig, ProbeEngine};
use crate::proxy::models::{LinkCheckReport, ProbeResult};
use crate::proxy::parser::LinkParser;
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tracing::warn;

/// Link checker for validating many connection links
///
/// Every probe gets its own process, config file and (unless the config
/// pins one) its own local port, so probes run side by side safely.
#[derive(Debug, Clone, Default)]
pub struct LinkChecker {
    engine: ProbeEngine,
}

impl LinkChecker {
    /// Create a new link checker with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new link checker with custom configuration
    pub fn with_config(config: ProbeConfig) -> Self {
        if config.local_port.is_some() && config.concurrency > 1 {
            warn!("Local port is pinned, probes will run one at a time");
        }
        Self {
            engine: ProbeEngine::with_config(config),
        }
    }

    pub fn config(&self) -> &ProbeConfig {
        self.engine.config()
    }

    /// Check a single link
    pub async fn check_link(&self, link: &str) -> LinkCheckReport {
        let descriptor = match LinkParser::parse(link) {
            Ok(descriptor) => descriptor,
            Err(e) => return LinkCheckReport::new(link.to_string(), None, e.into()),
        };

        let result = match self.engine.probe(&descriptor).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Could not probe {}: {}", descriptor, e);
                ProbeResult::failed(format!("infrastructure error: {}", e))
            }
        };

        LinkCheckReport::new(link.to_string(), Some(&descriptor), result)
    }

    /// Check multiple links concurrently
    pub async fn check_links(&self, links: Vec<String>) -> Vec<LinkCheckReport> {
        stream::iter(links)
            .map(|link| async move { self.check_link(&link).await })
            .buffer_unordered(self.config().effective_concurrency())
            .collect::<Vec<_>>()
            .await
    }

    /// Check links in the background, sending each report as it completes
    ///
    /// The channel closes once every link has been checked.
    pub fn check_links_stream(&self, links: Vec<String>) -> mpsc::Receiver<LinkCheckReport> {
        let concurrency = self.config().effective_concurrency();
        let (tx, rx) = mpsc::channel(concurrency * 2);
        let checker = self.clone();

        tokio::spawn(async move {
            let mut reports = stream::iter(links)
                .map(|link| {
                    let checker = checker.clone();
                    async move { checker.check_link(&link).await }
                })
                .buffer_unordered(concurrency);

            while let Some(report) = reports.next().await {
                if tx.send(report).await.is_err() {
                    // Receiver gone; dropping the stream cleans up in-flight probes
                    break;
                }
            }
        });

        rx
    }

    /// Check links and separate into working and failed reports
    pub async fn check_and_separate(
        &self,
        links: Vec<String>,
    ) -> (Vec<LinkCheckReport>, Vec<LinkCheckReport>) {
        let reports = self.check_links(links).await;

        reports.into_iter().partition(|r| r.is_working())
    }
}
