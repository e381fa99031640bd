//! Geographic ping module using the check-host.net node network
//!
//! A ping check is started for a host, restricted to nodes of one country,
//! and its results are collected after a fixed delay.

use crate::error::GeoError;
use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_API_BASE: &str = "https://check-host.net";
const DEFAULT_COUNTRY: &str = "ir";
const DEFAULT_MAX_NODES: u32 = 40;
const DEFAULT_RESULT_DELAY_SECS: u64 = 40;
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Ping summary for one node that reached the host at least once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePing {
    pub city: String,
    pub country: String,
    /// Replies that came back OK
    pub ok: usize,
    /// Pings sent
    pub total: usize,
    /// Address the node resolved the host to
    pub target_ip: Option<String>,
    pub avg_latency_ms: f64,
}

/// Location of a check-host node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub country_code: String,
    pub country: String,
    pub city: String,
}

impl NodeInfo {
    /// Parse the `[code, country, city, ...]` array the API returns
    fn from_values(values: &[Value]) -> Option<Self> {
        let field = |i: usize| values.get(i).and_then(Value::as_str).map(String::from);
        Some(Self {
            country_code: field(0)?,
            country: field(1).unwrap_or_default(),
            city: field(2).unwrap_or_default(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    request_id: String,
    #[serde(default)]
    nodes: HashMap<String, Vec<Value>>,
}

/// Configuration for geographic pings
#[derive(Debug, Clone)]
pub struct GeoConfig {
    pub api_base: String,
    /// ISO country code of the nodes to use
    pub country: String,
    pub max_nodes: u32,
    /// Wait between starting the check and reading its results
    pub result_delay: Duration,
    pub timeout: Duration,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            country: DEFAULT_COUNTRY.to_string(),
            max_nodes: DEFAULT_MAX_NODES,
            result_delay: Duration::from_secs(DEFAULT_RESULT_DELAY_SECS),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl GeoConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_api_base(mut self, api_base: String) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    pub fn with_country(mut self, country: String) -> Self {
        self.country = country.to_lowercase();
        self
    }

    pub fn with_result_delay(mut self, delay: Duration) -> Self {
        self.result_delay = delay;
        self
    }
}

/// Client for geographic ping checks
#[derive(Clone)]
pub struct GeoPinger {
    config: GeoConfig,
    client: Client,
}

impl GeoPinger {
    pub fn new() -> Result<Self, GeoError> {
        Self::with_config(GeoConfig::default())
    }

    pub fn with_config(config: GeoConfig) -> Result<Self, GeoError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &GeoConfig {
        &self.config
    }

    /// Ping `host` from every node in the configured country
    pub async fn ping(&self, host: &str) -> Result<Vec<NodePing>, GeoError> {
        let max_nodes = self.config.max_nodes.to_string();
        let response = self
            .client
            .get(format!("{}/check-ping", self.config.api_base))
            .header(ACCEPT, "application/json")
            .query(&[
                ("host", host),
                ("max_nodes", max_nodes.as_str()),
                ("nodes", self.config.country.as_str()),
            ])
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(GeoError::Api(response.status().as_u16()));
        }

        let check: CheckResponse = response.json().await?;
        let nodes = select_nodes(&check.nodes, &self.config.country);
        if nodes.is_empty() {
            return Err(GeoError::NoNodes(self.config.country.clone()));
        }
        debug!(
            "Ping check {} started on {} node(s), waiting {:?}",
            check.request_id,
            nodes.len(),
            self.config.result_delay
        );

        tokio::time::sleep(self.config.result_delay).await;

        let results: HashMap<String, Value> = self
            .client
            .get(format!("{}/check-result/{}", self.config.api_base, check.request_id))
            .header(ACCEPT, "application/json")
            .send()
            .await?
            .json()
            .await?;

        Ok(aggregate(&nodes, &results))
    }
}

/// Keep the nodes located in `country`
pub fn select_nodes(nodes: &HashMap<String, Vec<Value>>, country: &str) -> BTreeMap<String, NodeInfo> {
    nodes
        .iter()
        .filter_map(|(id, values)| NodeInfo::from_values(values).map(|info| (id.clone(), info)))
        .filter(|(_, info)| info.country_code.eq_ignore_ascii_case(country))
        .collect()
}

/// Summarize raw check results per node
///
/// Nodes without results, or without a single OK reply, are left out.
pub fn aggregate(nodes: &BTreeMap<String, NodeInfo>, results: &HashMap<String, Value>) -> Vec<NodePing> {
    nodes
        .iter()
        .filter_map(|(id, info)| {
            let replies = results.get(id)?.get(0)?.as_array()?;

            let latencies: Vec<f64> = replies
                .iter()
                .filter(|reply| reply.get(0).and_then(Value::as_str) == Some("OK"))
                .filter_map(|reply| reply.get(1).and_then(Value::as_f64))
                .map(|secs| secs * 1000.0)
                .collect();

            if latencies.is_empty() {
                return None;
            }

            Some(NodePing {
                city: info.city.clone(),
                country: info.country.clone(),
                ok: latencies.len(),
                total: replies.len(),
                target_ip: replies
                    .first()
                    .and_then(|reply| reply.get(2))
                    .and_then(Value::as_str)
                    .map(String::from),
                avg_latency_ms: latencies.iter().sum::<f64>() / latencies.len() as f64,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn nodes() -> HashMap<String, Vec<Value>> {
        serde_json::from_value(json!({
            "ir1.node.check-host.net": ["ir", "Iran", "Tehran", "185.1.1.1", "AS1"],
            "ir3.node.check-host.net": ["ir", "Iran", "Shiraz", "185.1.1.3", "AS3"],
            "ir4.node.check-host.net": ["ir", "Iran", "Tabriz", "185.1.1.4", "AS4"],
            "de1.node.check-host.net": ["de", "Germany", "Frankfurt", "1.2.3.4", "AS2"],
        }))
        .unwrap()
    }

    #[test]
    fn test_geo_config_builder() {
        let config = GeoConfig::new()
            .with_api_base("http://localhost:8080/".to_string())
            .with_country("DE".to_string())
            .with_result_delay(Duration::from_secs(1));
        assert_eq!(config.api_base, "http://localhost:8080");
        assert_eq!(config.country, "de");
        assert_eq!(config.result_delay, Duration::from_secs(1));
        assert_eq!(GeoConfig::default().max_nodes, 40);
    }

    #[test]
    fn test_select_nodes_by_country() {
        let selected = select_nodes(&nodes(), "ir");
        assert_eq!(selected.len(), 3);
        assert!(selected.values().all(|info| info.country == "Iran"));
        assert!(select_nodes(&nodes(), "us").is_empty());
    }

    #[test]
    fn test_aggregate_results() {
        let selected = select_nodes(&nodes(), "ir");
        let results: HashMap<String, Value> = serde_json::from_value(json!({
            "ir1.node.check-host.net": [[
                ["OK", 0.040, "142.250.1.1"],
                ["OK", 0.060],
                ["TIMEOUT", 3.0],
                ["OK", 0.050],
            ]],
            "ir3.node.check-host.net": [[null]],
            "ir4.node.check-host.net": null,
        }))
        .unwrap();

        let pings = aggregate(&selected, &results);
        assert_eq!(pings.len(), 1);

        let tehran = &pings[0];
        assert_eq!(tehran.city, "Tehran");
        assert_eq!(tehran.country, "Iran");
        assert_eq!(tehran.ok, 3);
        assert_eq!(tehran.total, 4);
        assert_eq!(tehran.target_ip.as_deref(), Some("142.250.1.1"));
        assert!((tehran.avg_latency_ms - 50.0).abs() < 1e-6);
    }

    #[test]
    fn test_aggregate_skips_all_failed_nodes() {
        let selected = select_nodes(&nodes(), "ir");
        let results: HashMap<String, Value> = serde_json::from_value(json!({
            "ir1.node.check-host.net": [[["TIMEOUT", 3.0], ["MALFORMED", 0.0]]],
        }))
        .unwrap();
        assert!(aggregate(&selected, &results).is_empty());
    }

    #[test]
    fn test_check_response_parsing() {
        let check: CheckResponse = serde_json::from_value(json!({
            "ok": 1,
            "request_id": "abc123",
            "permanent_link": "https://check-host.net/check-report/abc123",
            "nodes": {"ir1.node.check-host.net": ["ir", "Iran", "Tehran", "185.1.1.1", "AS1"]},
        }))
        .unwrap();
        assert_eq!(check.request_id, "abc123");
        assert_eq!(select_nodes(&check.nodes, "ir").len(), 1);
    }
}
