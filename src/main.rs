use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use link_probe::{
    proxy::{
        engine::{DEFAULT_CONCURRENCY, DEFAULT_TEST_URL, DEFAULT_TIMEOUT_SECS},
        geo::DEFAULT_API_BASE,
        GeoConfig, GeoPinger, LinkChecker, LinkCheckReport, LinkParser, ProbeConfig, ProbeEngine,
        SourceConfig, SourceLoader,
    },
    tui::LinkCheckerApp,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Parse connection links and probe them through a local proxy process
#[derive(Parser)]
#[command(name = "link-probe")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every command that runs the proxy
#[derive(Args)]
struct ProbeArgs {
    /// Proxy executable [default: v2ray/v2ray next to this binary]
    #[arg(long, env = "LINK_PROBE_BIN")]
    bin: Option<PathBuf>,
    /// Probe timeout in seconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout: u64,
    /// URL to request through the proxy
    #[arg(long, default_value = DEFAULT_TEST_URL)]
    url: String,
    /// Pin the local SOCKS port instead of picking a free one
    #[arg(long)]
    port: Option<u16>,
}

impl ProbeArgs {
    fn into_config(self) -> ProbeConfig {
        let mut config = ProbeConfig::new()
            .with_timeout(Duration::from_secs(self.timeout))
            .with_test_url(self.url);
        if let Some(bin) = self.bin {
            config = config.with_executable(bin);
        }
        if let Some(port) = self.port {
            config = config.with_local_port(port);
        }
        config
    }
}

/// Options of the geographic ping service
#[derive(Args)]
struct GeoArgs {
    /// Country code of the ping nodes
    #[arg(long, default_value = "ir")]
    country: String,
    /// Base URL of the check-host API
    #[arg(long, default_value = DEFAULT_API_BASE)]
    geo_api: String,
}

impl GeoArgs {
    fn into_config(self) -> GeoConfig {
        GeoConfig::new()
            .with_country(self.country)
            .with_api_base(self.geo_api)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a link and print the connection descriptor
    Parse {
        link: String,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// Probe a single link
    Probe {
        link: String,
        #[command(flatten)]
        probe: ProbeArgs,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// Probe every link from a file and/or subscriptions
    Check {
        /// File containing links
        input: Option<PathBuf>,
        /// Subscription URLs to fetch links from (can specify multiple)
        #[arg(short, long)]
        subscription: Vec<String>,
        /// User agent sent when fetching subscriptions
        #[arg(long)]
        user_agent: Option<String>,
        /// Output file for working links
        #[arg(short, long)]
        good: Option<PathBuf>,
        /// Output file for failed links
        #[arg(short, long)]
        bad: Option<PathBuf>,
        /// Number of concurrent probes
        #[arg(short = 'n', long, default_value_t = DEFAULT_CONCURRENCY)]
        threads: usize,
        /// Show live progress in an interactive TUI
        #[arg(long)]
        tui: bool,
        #[command(flatten)]
        probe: ProbeArgs,
    },
    /// Ping a host from nodes in one country
    Ping {
        host: String,
        #[command(flatten)]
        geo: GeoArgs,
    },
    /// Probe a link and ping its server in one go
    TestAll {
        link: String,
        /// Host to ping [default: the link's server address]
        #[arg(long)]
        host: Option<String>,
        #[command(flatten)]
        geo: GeoArgs,
        #[command(flatten)]
        probe: ProbeArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Log lines would tear the TUI apart
    let interactive = matches!(cli.command, Commands::Check { tui: true, .. });
    init_logging(log_filter(&cli.log_level, interactive));

    match cli.command {
        Commands::Parse { link, json } => {
            let descriptor = LinkParser::parse(&link)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&descriptor)?);
            } else {
                println!("Scheme:     {}", descriptor.scheme);
                println!("Name:       {}", descriptor.display_name());
                println!("Credential: {}", descriptor.credential_id);
                println!("Address:    {}", descriptor.address);
                println!("Port:       {}", descriptor.port);
                println!("Encryption: {}", descriptor.encryption);
                println!("Network:    {}", descriptor.transport.network);
                println!("Header:     {}", descriptor.transport.header_type);
                println!("Security:   {}", descriptor.transport.security);
                if let Some(http) = &descriptor.transport.http {
                    println!(
                        "HTTP:       {} {} (Host: {})",
                        http.method,
                        http.path,
                        http.host.as_deref().unwrap_or("-")
                    );
                }
            }
        }
        Commands::Probe { link, probe, json } => {
            let engine = ProbeEngine::with_config(probe.into_config());
            let result = engine.check_link(&link).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Success: {}", result.success);
                println!("Message: {}", result.message);
                println!("Latency: {} ms", result.latency_ms);
            }
        }
        Commands::Check {
            input,
            subscription,
            user_agent,
            good,
            bad,
            threads,
            tui,
            probe,
        } => {
            let links = collect_links(input, &subscription, user_agent).await?;
            if links.is_empty() {
                return Err(anyhow!("No links to check"));
            }

            let config = probe.into_config().with_concurrency(threads);

            if tui {
                let mut app = LinkCheckerApp::new(links, config, good, bad);
                app.run().await?;
                return Ok(());
            }

            println!("Loaded {} links", links.len());
            println!(
                "Checking with {} concurrent probes, timeout: {}s",
                config.effective_concurrency(),
                config.timeout.as_secs()
            );
            println!("Test URL: {}", config.test_url);
            println!();

            let checker = LinkChecker::with_config(config);
            let (good_reports, bad_reports) = checker.check_and_separate(links).await;

            println!(
                "Results: {} working, {} failed",
                good_reports.len(),
                bad_reports.len()
            );

            if let Some(good_path) = good {
                save_links(&good_reports, &good_path)?;
                println!("Saved {} working links to {:?}", good_reports.len(), good_path);
            }

            if let Some(bad_path) = bad {
                save_links(&bad_reports, &bad_path)?;
                println!("Saved {} failed links to {:?}", bad_reports.len(), bad_path);
            }

            if !good_reports.is_empty() {
                println!("\nWorking links:");
                for report in &good_reports {
                    println!("  {} ({}ms)", report.label(), report.result.latency_ms);
                }
            }
        }
        Commands::Ping { host, geo } => {
            let pinger = GeoPinger::with_config(geo.into_config())?;
            println!("Pinging {} (results take about {:?})...", host, pinger.config().result_delay);
            let nodes = pinger.ping(&host).await?;
            if nodes.is_empty() {
                println!("No node reached {}", host);
            }
            for node in nodes {
                println!(
                    "  {}, {}: {}/{} OK, avg {:.1}ms{}",
                    node.city,
                    node.country,
                    node.ok,
                    node.total,
                    node.avg_latency_ms,
                    node.target_ip
                        .map(|ip| format!(" ({})", ip))
                        .unwrap_or_default()
                );
            }
        }
        Commands::TestAll {
            link,
            host,
            geo,
            probe,
        } => {
            let host = match host {
                Some(host) => host,
                None => LinkParser::parse(&link)
                    .map(|d| d.address)
                    .map_err(|_| anyhow!("Cannot extract host from link"))?,
            };

            let engine = ProbeEngine::with_config(probe.into_config());
            let pinger = GeoPinger::with_config(geo.into_config())?;
            let (probe_result, ping_result) = tokio::join!(engine.check_link(&link), pinger.ping(&host));
            let probe_result = probe_result?;

            let ping = match ping_result {
                Ok(nodes) => json!({"success": true, "host": host, "nodes": nodes, "error": null}),
                Err(e) => json!({"success": false, "host": host, "nodes": [], "error": e.to_string()}),
            };
            let output = json!({
                "v2ray": probe_result,
                "ping": ping,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// `RUST_LOG` wins over `level`, except in the TUI where logging is off
fn log_filter(level: &str, interactive: bool) -> EnvFilter {
    if interactive {
        return EnvFilter::new("off");
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn init_logging(filter: EnvFilter) {
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Gather links from a file and subscription URLs, dropping duplicates
async fn collect_links(
    input: Option<PathBuf>,
    subscriptions: &[String],
    user_agent: Option<String>,
) -> Result<Vec<String>> {
    let mut links = Vec::new();

    if let Some(path) = input {
        let found = SourceLoader::from_file(&path)?;
        println!("Found {} links in {:?}", found.len(), path);
        links.extend(found);
    }

    if !subscriptions.is_empty() {
        let mut config = SourceConfig::new();
        if let Some(user_agent) = user_agent {
            config = config.with_user_agent(user_agent);
        }
        let loader = SourceLoader::with_config(config)?;
        for result in loader.fetch_with_results(subscriptions).await {
            if result.is_success() {
                println!("Found {} links from {}", result.links.len(), result.source);
                links.extend(result.links);
            } else if let Some(error) = result.error {
                eprintln!("Error fetching {}: {}", result.source, error);
            }
        }
    }

    let mut seen = std::collections::HashSet::new();
    links.retain(|link| seen.insert(link.clone()));
    Ok(links)
}

fn save_links(reports: &[LinkCheckReport], path: &Path) -> Result<()> {
    let content = reports
        .iter()
        .map(|r| r.link.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    std::fs::write(path, content).with_context(|| format!("Failed to write {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn test_tui_logging_ignores_rust_log() {
        std::env::set_var("RUST_LOG", "debug");
        assert_eq!(log_filter("warn", true).max_level_hint(), Some(LevelFilter::OFF));
        assert_eq!(log_filter("warn", false).max_level_hint(), Some(LevelFilter::DEBUG));
        std::env::remove_var("RUST_LOG");
        assert_eq!(log_filter("warn", false).max_level_hint(), Some(LevelFilter::WARN));
    }

    #[test]
    fn test_geo_args() {
        let cli = Cli::parse_from([
            "link-probe",
            "ping",
            "example.com",
            "--country",
            "DE",
            "--geo-api",
            "http://localhost:8080/",
        ]);
        let Commands::Ping { host, geo } = cli.command else {
            panic!("expected ping");
        };
        assert_eq!(host, "example.com");
        let config = geo.into_config();
        assert_eq!(config.country, "de");
        assert_eq!(config.api_base, "http://localhost:8080");
    }

    #[test]
    fn test_check_user_agent() {
        let cli = Cli::parse_from(["link-probe", "check", "links.txt", "--user-agent", "clash"]);
        let Commands::Check { user_agent, input, .. } = cli.command else {
            panic!("expected check");
        };
        assert_eq!(user_agent.as_deref(), Some("clash"));
        assert_eq!(input, Some(PathBuf::from("links.txt")));
    }
}
