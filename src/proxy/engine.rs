//! Proxy probe engine
//!
//! A probe launches the proxy executable with a [`RuntimeConfig`], waits for
//! its local SOCKS listener, sends one timed HTTP request through it and then
//! tears everything down. Each call walks the stages of [`ProbeStage`] and
//! always ends in [`ProbeStage::CleanedUp`]: the child process is killed and
//! reaped and the transient config file is removed on every exit path,
//! including when the caller drops the future mid-probe.

use crate::error::{EngineError, ProbeError};
use crate::proxy::config::{RuntimeConfig, TransientConfig, LOOPBACK};
use crate::proxy::models::{ConnectionDescriptor, ProbeResult};
use crate::proxy::parser::LinkParser;
use reqwest::{Client, Proxy as ReqwestProxy};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Default timeout for the probe request in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default URL to probe through the proxy
pub const DEFAULT_TEST_URL: &str = "http://www.google.com/generate_204";

/// Connection attempts before the listener is declared dead
pub const DEFAULT_READINESS_ATTEMPTS: u32 = 20;

/// Delay between connection attempts in milliseconds
pub const DEFAULT_READINESS_INTERVAL_MS: u64 = 100;

/// Default number of concurrent probes in a batch
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Directory next to the binary that holds the proxy executable
const INSTALL_DIR: &str = "v2ray";

#[cfg(windows)]
const EXECUTABLE_NAME: &str = "v2ray.exe";
#[cfg(not(windows))]
const EXECUTABLE_NAME: &str = "v2ray";

/// Upper bound on waiting for a killed child to be reaped
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on collecting the child's remaining output after exit
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Bytes of stdout/stderr kept per stream for diagnostics
const OUTPUT_TAIL_BYTES: usize = 4096;

/// Expected location of the proxy executable: `<dir of this binary>/v2ray/v2ray`
pub fn default_executable() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_default()
        .join(INSTALL_DIR)
        .join(EXECUTABLE_NAME)
}

/// Configuration for the probe engine
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Proxy executable to launch
    pub executable: PathBuf,
    /// URL requested through the proxy
    pub test_url: String,
    /// Timeout of the probe request
    pub timeout: Duration,
    /// Pinned local SOCKS port; `None` picks a free port per probe
    pub local_port: Option<u16>,
    /// Connection attempts while waiting for the local listener
    pub readiness_attempts: u32,
    /// Delay between connection attempts, also the per-attempt timeout
    pub readiness_interval: Duration,
    /// Directory for transient config files
    pub work_dir: PathBuf,
    /// Number of concurrent probes in a batch
    pub concurrency: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            test_url: DEFAULT_TEST_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            local_port: None,
            readiness_attempts: DEFAULT_READINESS_ATTEMPTS,
            readiness_interval: Duration::from_millis(DEFAULT_READINESS_INTERVAL_MS),
            work_dir: std::env::temp_dir(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl ProbeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_executable(mut self, executable: PathBuf) -> Self {
        self.executable = executable;
        self
    }

    /// Look for the executable inside `dir` instead of next to this binary
    pub fn with_install_dir(mut self, dir: &Path) -> Self {
        self.executable = dir.join(EXECUTABLE_NAME);
        self
    }

    pub fn with_test_url(mut self, url: String) -> Self {
        self.test_url = url;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Pin the local SOCKS port. Probes sharing a pinned port must not overlap.
    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    pub fn with_readiness(mut self, attempts: u32, interval: Duration) -> Self {
        self.readiness_attempts = attempts;
        self.readiness_interval = interval;
        self
    }

    pub fn with_work_dir(mut self, dir: PathBuf) -> Self {
        self.work_dir = dir;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Concurrency a batch may actually use
    pub fn effective_concurrency(&self) -> usize {
        if self.local_port.is_some() {
            1
        } else {
            self.concurrency.max(1)
        }
    }
}

/// Lifecycle stage of a single probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStage {
    NotStarted,
    ExecutableResolved,
    ConfigWritten,
    ProcessLaunched,
    Ready,
    Probed,
    CleanedUp,
}

impl fmt::Display for ProbeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProbeStage::NotStarted => "not-started",
            ProbeStage::ExecutableResolved => "executable-resolved",
            ProbeStage::ConfigWritten => "config-written",
            ProbeStage::ProcessLaunched => "process-launched",
            ProbeStage::Ready => "ready",
            ProbeStage::Probed => "probed",
            ProbeStage::CleanedUp => "cleaned-up",
        };
        f.write_str(name)
    }
}

/// Why a probe stopped before producing a result
enum Abort {
    Probe(ProbeError),
    Engine(EngineError),
}

impl From<ProbeError> for Abort {
    fn from(err: ProbeError) -> Self {
        Abort::Probe(err)
    }
}

impl From<EngineError> for Abort {
    fn from(err: EngineError) -> Self {
        Abort::Engine(err)
    }
}

/// Running proxy process with its output being collected in the background
struct ProxyProcess {
    child: Child,
    stdout: Option<JoinHandle<String>>,
    stderr: Option<JoinHandle<String>>,
}

impl ProxyProcess {
    fn launch(executable: &Path, config: &Path) -> io::Result<Self> {
        let mut child = Command::new(executable)
            .arg("run")
            .arg("-c")
            .arg(config)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        debug!("Launched {:?} (pid {:?})", executable, child.id());

        let stdout = child.stdout.take().map(|out| tokio::spawn(collect_tail(out)));
        let stderr = child.stderr.take().map(|err| tokio::spawn(collect_tail(err)));

        Ok(Self {
            child,
            stdout,
            stderr,
        })
    }

    fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Kill the process, reap it and log what it printed
    async fn shutdown(mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!("Kill failed: {}", e);
        }

        match tokio::time::timeout(REAP_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => debug!("Proxy process exited with {}", status),
            Ok(Err(e)) => warn!("Failed to wait for proxy process: {}", e),
            Err(_) => warn!("Proxy process not reaped after {:?}", REAP_TIMEOUT),
        }

        for (stream, handle) in [("stdout", self.stdout.take()), ("stderr", self.stderr.take())] {
            let Some(handle) = handle else { continue };
            let abort = handle.abort_handle();
            match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, handle).await {
                Ok(Ok(tail)) if !tail.is_empty() => debug!("Proxy {}: {}", stream, tail.trim_end()),
                Ok(_) => {}
                Err(_) => abort.abort(),
            }
        }
    }
}

/// Read a stream to its end, keeping only the last bytes
async fn collect_tail<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut tail = VecDeque::with_capacity(OUTPUT_TAIL_BYTES);
    let mut buf = [0u8; 1024];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend(&buf[..n]);
                let excess = tail.len().saturating_sub(OUTPUT_TAIL_BYTES);
                tail.drain(..excess);
            }
        }
    }

    String::from_utf8_lossy(tail.make_contiguous()).into_owned()
}

/// Resources owned by one probe call
///
/// Dropping a session that was not cleaned up still kills the child
/// (`kill_on_drop`) and removes the config file (`TransientConfig`'s drop).
struct ProbeSession {
    stage: ProbeStage,
    config_file: Option<TransientConfig>,
    process: Option<ProxyProcess>,
}

impl ProbeSession {
    fn new() -> Self {
        Self {
            stage: ProbeStage::NotStarted,
            config_file: None,
            process: None,
        }
    }

    fn advance(&mut self, stage: ProbeStage) {
        trace!("Probe stage {} -> {}", self.stage, stage);
        self.stage = stage;
    }

    async fn cleanup(&mut self) {
        let from = self.stage;
        if let Some(process) = self.process.take() {
            process.shutdown().await;
        }
        self.config_file = None;
        self.advance(ProbeStage::CleanedUp);
        debug!("Probe cleaned up from stage {}", from);
    }
}

impl Drop for ProbeSession {
    fn drop(&mut self) {
        if self.stage != ProbeStage::CleanedUp {
            warn!("Probe abandoned in stage {}, releasing resources", self.stage);
        }
    }
}

/// Engine that validates connection descriptors through a real proxy process
#[derive(Debug, Clone, Default)]
pub struct ProbeEngine {
    config: ProbeConfig,
}

impl ProbeEngine {
    /// Create a new engine with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new engine with custom configuration
    pub fn with_config(config: ProbeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Probe `descriptor` against the configured URL and timeout
    pub async fn probe(&self, descriptor: &ConnectionDescriptor) -> Result<ProbeResult, EngineError> {
        self.probe_url(descriptor, &self.config.test_url, self.config.timeout)
            .await
    }

    /// Probe `descriptor` by requesting `probe_url`, bounded by `timeout`
    ///
    /// Probe failures come back as a failed [`ProbeResult`]; `Err` is kept
    /// for local infrastructure failures such as being unable to write the
    /// config or spawn a process.
    pub async fn probe_url(
        &self,
        descriptor: &ConnectionDescriptor,
        probe_url: &str,
        timeout: Duration,
    ) -> Result<ProbeResult, EngineError> {
        let mut session = ProbeSession::new();
        let outcome = self.run(&mut session, descriptor, probe_url, timeout).await;
        session.cleanup().await;

        let result = match outcome {
            Ok(result) => result,
            Err(Abort::Probe(err)) => err.into(),
            Err(Abort::Engine(err)) => {
                warn!("Probe of {} aborted: {}", descriptor, err);
                return Err(err);
            }
        };

        info!("Probe of {}: {}", descriptor, result);
        Ok(result)
    }

    /// Parse `link` and probe it; parse failures become a failed result
    pub async fn check_link(&self, link: &str) -> Result<ProbeResult, EngineError> {
        match LinkParser::parse(link) {
            Ok(descriptor) => self.probe(&descriptor).await,
            Err(err) => Ok(err.into()),
        }
    }

    async fn run(
        &self,
        session: &mut ProbeSession,
        descriptor: &ConnectionDescriptor,
        probe_url: &str,
        timeout: Duration,
    ) -> Result<ProbeResult, Abort> {
        let executable = self.locate_executable().ok_or(ProbeError::ExecutableNotFound)?;
        session.advance(ProbeStage::ExecutableResolved);

        let local_port = self.local_port()?;
        let runtime = RuntimeConfig::new(local_port, descriptor);
        let config_path = session
            .config_file
            .insert(TransientConfig::write(&self.config.work_dir, &runtime)?)
            .path()
            .to_path_buf();
        session.advance(ProbeStage::ConfigWritten);

        let process = match ProxyProcess::launch(&executable, &config_path) {
            Ok(process) => process,
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied) => {
                debug!("Cannot execute {:?}: {}", executable, e);
                return Err(ProbeError::ExecutableNotFound.into());
            }
            Err(source) if is_resource_exhaustion(&source) => {
                return Err(EngineError::Launch {
                    path: executable,
                    source,
                }
                .into())
            }
            Err(e) => {
                debug!("Failed to launch {:?}: {}", executable, e);
                return Err(ProbeError::StartupFailure.into());
            }
        };
        session.advance(ProbeStage::ProcessLaunched);
        let process = session.process.insert(process);

        self.wait_ready(process, local_port).await?;
        session.advance(ProbeStage::Ready);

        let result = send_probe(local_port, probe_url, timeout).await;
        session.advance(ProbeStage::Probed);

        Ok(result?)
    }

    fn locate_executable(&self) -> Option<PathBuf> {
        let path = &self.config.executable;
        if path.is_file() {
            Some(path.clone())
        } else {
            debug!("Proxy executable not found at {:?}", path);
            None
        }
    }

    fn local_port(&self) -> Result<u16, EngineError> {
        match self.config.local_port {
            Some(port) => Ok(port),
            None => allocate_local_port().map_err(EngineError::PortAllocation),
        }
    }

    /// Poll the local listener until it accepts a connection
    async fn wait_ready(&self, process: &mut ProxyProcess, port: u16) -> Result<(), ProbeError> {
        let interval = self.config.readiness_interval;

        for attempt in 1..=self.config.readiness_attempts {
            if process.has_exited() {
                debug!("Proxy process exited before listening on {}", port);
                return Err(ProbeError::StartupFailure);
            }

            match tokio::time::timeout(interval, TcpStream::connect((LOOPBACK, port))).await {
                Ok(Ok(_)) => {
                    debug!("Local listener {} ready after {} attempt(s)", port, attempt);
                    return Ok(());
                }
                Ok(Err(e)) => trace!("Readiness attempt {} on {}: {}", attempt, port, e),
                Err(_) => trace!("Readiness attempt {} on {} timed out", attempt, port),
            }

            tokio::time::sleep(interval).await;
        }

        debug!(
            "Local listener {} not ready after {} attempts",
            port, self.config.readiness_attempts
        );
        Err(ProbeError::StartupFailure)
    }
}

/// Ask the OS for a free loopback port
fn allocate_local_port() -> io::Result<u16> {
    let listener = std::net::TcpListener::bind((LOOPBACK, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Whether a spawn failed because the system ran out of processes, file
/// descriptors or memory
fn is_resource_exhaustion(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::OutOfMemory {
        return true;
    }

    #[cfg(unix)]
    {
        matches!(
            err.raw_os_error(),
            Some(libc::EMFILE | libc::ENFILE | libc::EAGAIN | libc::ENOMEM)
        )
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Send one GET through the local SOCKS listener, resolving DNS remotely
async fn send_probe(port: u16, url: &str, timeout: Duration) -> Result<ProbeResult, ProbeError> {
    let proxy = ReqwestProxy::all(format!("socks5h://{}:{}", LOOPBACK, port))
        .map_err(|e| ProbeError::Transport(error_detail(&e)))?;
    let client = Client::builder()
        .proxy(proxy)
        .timeout(timeout)
        .build()
        .map_err(|e| ProbeError::Transport(error_detail(&e)))?;

    let start = Instant::now();
    let response = tokio::time::timeout(timeout, client.get(url).send()).await;
    let elapsed = start.elapsed();

    match response {
        Ok(Ok(response)) => {
            let status = response.status();
            if status.is_success() {
                Ok(ProbeResult::working(status.as_u16(), elapsed))
            } else {
                Err(ProbeError::HttpStatus(status.as_u16()))
            }
        }
        Ok(Err(e)) if e.is_timeout() => Err(ProbeError::Timeout),
        Ok(Err(e)) => Err(ProbeError::Transport(error_detail(&e))),
        Err(_) => Err(ProbeError::Timeout),
    }
}

/// Flatten an error and its sources into one line
fn error_detail(err: &(dyn std::error::Error + 'static)) -> String {
    let mut detail = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !detail.contains(&text) {
            detail.push_str(": ");
            detail.push_str(&text);
        }
        source = cause.source();
    }
    detail
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_config_default() {
        let config = ProbeConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert_eq!(config.test_url, DEFAULT_TEST_URL);
        assert_eq!(config.readiness_attempts, 20);
        assert_eq!(config.readiness_interval, Duration::from_millis(100));
        assert!(config.local_port.is_none());
        assert!(config.executable.ends_with(Path::new(INSTALL_DIR).join(EXECUTABLE_NAME)));
    }

    #[test]
    fn test_probe_config_builder() {
        let config = ProbeConfig::new()
            .with_timeout(Duration::from_secs(3))
            .with_test_url("http://example.com/204".to_string())
            .with_install_dir(Path::new("/opt/proxy"))
            .with_concurrency(8);

        assert_eq!(config.timeout, Duration::from_secs(3));
        assert_eq!(config.test_url, "http://example.com/204");
        assert_eq!(config.executable, Path::new("/opt/proxy").join(EXECUTABLE_NAME));
        assert_eq!(config.effective_concurrency(), 8);
    }

    #[test]
    fn test_pinned_port_serializes_batches() {
        let config = ProbeConfig::new().with_concurrency(8).with_local_port(10809);
        assert_eq!(config.effective_concurrency(), 1);
        assert_eq!(ProbeConfig::new().with_concurrency(0).effective_concurrency(), 1);
    }

    #[test]
    fn test_allocate_local_port() {
        let port = allocate_local_port().unwrap();
        assert_ne!(port, 0);
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(ProbeStage::NotStarted.to_string(), "not-started");
        assert_eq!(ProbeStage::CleanedUp.to_string(), "cleaned-up");
    }

    #[test]
    fn test_error_detail_includes_sources() {
        let inner = io::Error::new(io::ErrorKind::ConnectionReset, "connection reset");
        let outer = EngineError::PortAllocation(inner);
        let detail = error_detail(&outer);
        assert!(detail.starts_with("failed to allocate a local port"));
        assert!(detail.contains("connection reset"));
    }

    #[test]
    fn test_resource_exhaustion_classification() {
        assert!(is_resource_exhaustion(&io::Error::from(io::ErrorKind::OutOfMemory)));
        assert!(!is_resource_exhaustion(&io::Error::from(io::ErrorKind::InvalidInput)));
    }

    #[cfg(unix)]
    #[test]
    fn test_resource_exhaustion_errno() {
        for errno in [libc::EMFILE, libc::ENFILE, libc::EAGAIN, libc::ENOMEM] {
            assert!(is_resource_exhaustion(&io::Error::from_raw_os_error(errno)));
        }
        assert!(!is_resource_exhaustion(&io::Error::from_raw_os_error(libc::ENOEXEC)));
        assert!(!is_resource_exhaustion(&io::Error::from_raw_os_error(libc::ETXTBSY)));
    }

    #[tokio::test]
    async fn test_missing_executable_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProbeConfig::new()
            .with_executable(dir.path().join("missing"))
            .with_work_dir(dir.path().to_path_buf());
        let engine = ProbeEngine::with_config(config);

        let result = engine
            .check_link("vless://abc-123@example.com:443?type=tcp")
            .await
            .unwrap();
        assert_eq!(result, ProbeResult::failed("executable not found"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_check_link_reports_parse_errors() {
        let engine = ProbeEngine::new();
        let result = engine.check_link("vless://@example.com:443").await.unwrap();
        assert!(!result.success);
        assert_eq!(result.message, "parse error: invalid link");
        assert_eq!(result.latency_ms, -1);
    }
}
