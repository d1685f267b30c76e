//! Liveness probes and the consecutive-success tracker used after promotion.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use cutover_core::Liveness;
use cutover_exec::{CommandRunner, CommandSpec};
use tracing::{debug, warn};

/// Result of a single liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The liveness signal reported healthy (2xx, exit 0).
    Healthy,
    /// The signal answered but reported unhealthy, or timed out.
    Unhealthy,
    /// The probe could not be executed (connection error).
    Failed,
}

/// Health as seen by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Counts consecutive probe results until enough successes are seen.
#[derive(Debug)]
pub struct ProbeTracker {
    status: HealthStatus,
    consecutive_successes: u32,
    consecutive_failures: u32,
    required_successes: u32,
    probes: u32,
}

impl ProbeTracker {
    pub fn new(required_successes: u32) -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_successes: 0,
            consecutive_failures: 0,
            required_successes: required_successes.max(1),
            probes: 0,
        }
    }

    /// Record a probe result and return the new health status.
    ///
    /// A single failure resets the success streak.
    pub fn record(&mut self, result: ProbeResult) -> HealthStatus {
        self.probes += 1;
        match result {
            ProbeResult::Healthy => {
                self.consecutive_failures = 0;
                self.consecutive_successes += 1;
                if self.consecutive_successes >= self.required_successes {
                    if self.status != HealthStatus::Healthy {
                        debug!(successes = self.consecutive_successes, "liveness confirmed");
                    }
                    self.status = HealthStatus::Healthy;
                }
            }
            ProbeResult::Unhealthy | ProbeResult::Failed => {
                self.consecutive_successes = 0;
                self.consecutive_failures += 1;
                if self.status != HealthStatus::Unhealthy {
                    warn!(failures = self.consecutive_failures, "liveness probe failed");
                }
                self.status = HealthStatus::Unhealthy;
            }
        }
        self.status
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn passed(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }

    pub fn probes(&self) -> u32 {
        self.probes
    }
}

/// Boxed future alias for probe results.
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = ProbeResult> + Send + 'a>>;

/// A liveness signal of the running application. Injected so tests can substitute it.
pub trait LivenessProbe: Send + Sync {
    /// Probe once. Implementations must resolve within `timeout`.
    fn probe(&self, timeout: Duration) -> ProbeFuture<'_>;

    fn describe(&self) -> String;
}

/// HTTP GET against `address` + `path`; 2xx is healthy.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    pub address: String,
    pub path: String,
}

impl LivenessProbe for HttpProbe {
    fn probe(&self, timeout: Duration) -> ProbeFuture<'_> {
        Box::pin(http_probe(&self.address, &self.path, timeout))
    }

    fn describe(&self) -> String {
        format!("http://{}{}", self.address, self.path)
    }
}

/// Shell command run through the command runner; exit 0 is healthy.
pub struct CommandProbe {
    runner: Arc<dyn CommandRunner>,
    script: String,
    cwd: PathBuf,
}

impl CommandProbe {
    pub fn new(runner: Arc<dyn CommandRunner>, script: &str, cwd: &Path) -> Self {
        Self {
            runner,
            script: script.to_string(),
            cwd: cwd.to_path_buf(),
        }
    }
}

impl LivenessProbe for CommandProbe {
    fn probe(&self, timeout: Duration) -> ProbeFuture<'_> {
        Box::pin(async move {
            let spec = CommandSpec {
                script: self.script.clone(),
                cwd: self.cwd.clone(),
                env: Vec::new(),
                timeout,
            };
            match self.runner.run(&spec).await {
                Ok(output) if output.success() => ProbeResult::Healthy,
                Ok(output) => {
                    debug!(script = %self.script, result = %output.summary(), "liveness command unhealthy");
                    ProbeResult::Unhealthy
                }
                Err(e) => {
                    debug!(script = %self.script, error = %e, "liveness command failed");
                    if e.is_transport() {
                        ProbeResult::Failed
                    } else {
                        ProbeResult::Unhealthy
                    }
                }
            }
        })
    }

    fn describe(&self) -> String {
        format!("command:{}", self.script)
    }
}

/// Used when no liveness signal is configured.
#[derive(Debug, Clone, Copy)]
pub struct AlwaysHealthy;

impl LivenessProbe for AlwaysHealthy {
    fn probe(&self, _timeout: Duration) -> ProbeFuture<'_> {
        Box::pin(async { ProbeResult::Healthy })
    }

    fn describe(&self) -> String {
        "none".to_string()
    }
}

/// Build the probe for a configured liveness signal.
pub fn probe_for(
    liveness: &Liveness,
    runner: Arc<dyn CommandRunner>,
    cwd: &Path,
) -> Arc<dyn LivenessProbe> {
    match liveness {
        Liveness::None => Arc::new(AlwaysHealthy),
        Liveness::Http { address, path } => Arc::new(HttpProbe {
            address: address.clone(),
            path: path.clone(),
        }),
        Liveness::Command(script) => Arc::new(CommandProbe::new(runner, script, cwd)),
    }
}

/// Perform an HTTP health probe against an endpoint.
///
/// Returns `Healthy` if the response is 2xx, `Unhealthy` for non-2xx,
/// or `Failed` if the connection fails or times out.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "liveness probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "liveness probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(path)
            .header("host", address)
            .header("user-agent", "cutover/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "liveness probe request invalid");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) => {
                if resp.status().is_success() {
                    ProbeResult::Healthy
                } else {
                    debug!(status = %resp.status(), %uri, "liveness probe non-2xx");
                    ProbeResult::Unhealthy
                }
            }
            Err(e) => {
                debug!(error = %e, %uri, "liveness probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%uri, "liveness probe timed out");
            ProbeResult::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cutover_exec::ShellRunner;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Serve one canned HTTP response per connection.
    async fn serve(status_line: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { return };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let response = format!("{status_line}\r\ncontent-length: 0\r\n\r\n");
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });
        addr
    }

    #[test]
    fn tracker_starts_unknown() {
        let tracker = ProbeTracker::new(3);
        assert_eq!(tracker.status(), HealthStatus::Unknown);
        assert!(!tracker.passed());
    }

    #[test]
    fn tracker_needs_consecutive_successes() {
        let mut tracker = ProbeTracker::new(3);
        tracker.record(ProbeResult::Healthy);
        tracker.record(ProbeResult::Healthy);
        assert!(!tracker.passed());

        // A failure resets the streak.
        assert_eq!(tracker.record(ProbeResult::Failed), HealthStatus::Unhealthy);
        assert_eq!(tracker.consecutive_successes(), 0);

        tracker.record(ProbeResult::Healthy);
        tracker.record(ProbeResult::Healthy);
        assert!(!tracker.passed());
        assert_eq!(tracker.record(ProbeResult::Healthy), HealthStatus::Healthy);
        assert!(tracker.passed());
        assert_eq!(tracker.probes(), 6);
    }

    #[test]
    fn tracker_zero_threshold_means_one() {
        let mut tracker = ProbeTracker::new(0);
        tracker.record(ProbeResult::Healthy);
        assert!(tracker.passed());
    }

    #[tokio::test]
    async fn http_probe_healthy_on_2xx() {
        let addr = serve("HTTP/1.1 200 OK").await;
        let result = http_probe(&addr, "/healthz", Duration::from_secs(2)).await;
        assert_eq!(result, ProbeResult::Healthy);
    }

    #[tokio::test]
    async fn http_probe_unhealthy_on_503() {
        let addr = serve("HTTP/1.1 503 Service Unavailable").await;
        let result = http_probe(&addr, "/healthz", Duration::from_secs(2)).await;
        assert_eq!(result, ProbeResult::Unhealthy);
    }

    #[tokio::test]
    async fn http_probe_failed_when_nothing_listens() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = http_probe(&addr, "/", Duration::from_secs(2)).await;
        assert_eq!(result, ProbeResult::Failed);
    }

    #[tokio::test]
    async fn command_probe_maps_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let runner: Arc<dyn CommandRunner> = Arc::new(ShellRunner::new());

        let ok = CommandProbe::new(runner.clone(), "true", dir.path());
        assert_eq!(ok.probe(Duration::from_secs(2)).await, ProbeResult::Healthy);

        let bad = CommandProbe::new(runner.clone(), "exit 1", dir.path());
        assert_eq!(bad.probe(Duration::from_secs(2)).await, ProbeResult::Unhealthy);

        let slow = CommandProbe::new(runner, "sleep 5", dir.path());
        assert_eq!(slow.probe(Duration::from_millis(100)).await, ProbeResult::Unhealthy);
    }

    #[test]
    fn probe_for_selects_implementation() {
        let runner: Arc<dyn CommandRunner> = Arc::new(ShellRunner::new());
        let cwd = Path::new("/");

        assert_eq!(probe_for(&Liveness::None, runner.clone(), cwd).describe(), "none");
        let http = Liveness::Http {
            address: "127.0.0.1:8080".to_string(),
            path: "/healthz".to_string(),
        };
        assert_eq!(
            probe_for(&http, runner.clone(), cwd).describe(),
            "http://127.0.0.1:8080/healthz"
        );
        assert_eq!(
            probe_for(&Liveness::Command("true".to_string()), runner, cwd).describe(),
            "command:true"
        );
    }
}
