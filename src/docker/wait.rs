//! Polling readiness strategies.
//!
//! A strategy is the sum type [`WaitStrategy`] with one operation,
//! [`WaitStrategy::wait_until_ready`]. Each wait is a cancellable polling
//! loop with a sleep step, bounded by the strategy's own deadline. TCP and
//! HTTP probes check the exit predicate before each poll so a dead container
//! fails fast instead of burning the whole timeout.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::sleep;

use crate::docker::container::ContainerHandle;
use crate::error::{Error, Result};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub enum WaitStrategy {
    Exit(ExitWait),
    Tcp(TcpWait),
    Http(HttpWait),
    All(Vec<WaitStrategy>),
}

impl WaitStrategy {
    pub fn for_exit() -> ExitWait {
        ExitWait::default()
    }

    pub fn for_listening_port(port: u16) -> TcpWait {
        TcpWait::new(port)
    }

    pub fn for_http(path: impl Into<String>, port: u16) -> HttpWait {
        HttpWait::new(path, port)
    }

    pub fn all(children: Vec<WaitStrategy>) -> WaitStrategy {
        WaitStrategy::All(children)
    }

    pub async fn wait_until_ready(&self, target: &ContainerHandle) -> Result<()> {
        match self {
            WaitStrategy::Exit(wait) => wait.wait_until_ready(target).await,
            WaitStrategy::Tcp(wait) => wait.wait_until_ready(target).await,
            WaitStrategy::Http(wait) => wait.wait_until_ready(target).await,
            WaitStrategy::All(children) => {
                for child in children {
                    Box::pin(child.wait_until_ready(target)).await?;
                }
                Ok(())
            }
        }
    }
}

/// Waits until the container stops running, optionally checking its exit
/// code. A vanished container counts as success: auto-removed containers
/// race their own inspect.
#[derive(Debug, Clone)]
pub struct ExitWait {
    pub exit_code: Option<i64>,
    pub poll_interval: Duration,
    pub exit_timeout: Option<Duration>,
}

impl Default for ExitWait {
    fn default() -> Self {
        ExitWait {
            exit_code: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            exit_timeout: None,
        }
    }
}

impl ExitWait {
    pub fn with_exit_code(mut self, code: i64) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_exit_timeout(mut self, timeout: Duration) -> Self {
        self.exit_timeout = Some(timeout);
        self
    }

    async fn wait_until_ready(&self, target: &ContainerHandle) -> Result<()> {
        let poll = async {
            loop {
                let state = match target.state().await {
                    Err(e) if is_not_found(&e) => return Ok(()),
                    Err(e) => return Err(e),
                    Ok(state) => state,
                };
                if state.running == Some(true) {
                    sleep(self.poll_interval).await;
                    continue;
                }
                if let Some(expected) = self.exit_code {
                    let actual = state.exit_code.unwrap_or(0);
                    if actual != expected {
                        return Err(Error::WrongExitCode { expected, actual });
                    }
                }
                return Ok(());
            }
        };
        match self.exit_timeout {
            Some(timeout) => bounded(timeout, target, poll).await,
            None => poll.await,
        }
    }
}

/// Waits for a TCP listener. With a network alias set the probe dials
/// `alias:port` over the shared network (how pod probes run from the agent);
/// otherwise it resolves the container's mapped host port first.
#[derive(Debug, Clone)]
pub struct TcpWait {
    pub port: u16,
    pub network_alias: Option<String>,
    pub poll_interval: Duration,
    pub startup_timeout: Duration,
}

impl TcpWait {
    pub fn new(port: u16) -> Self {
        TcpWait {
            port,
            network_alias: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }

    pub fn with_network_alias(mut self, alias: impl Into<String>) -> Self {
        self.network_alias = Some(alias.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    async fn wait_until_ready(&self, target: &ContainerHandle) -> Result<()> {
        let probe = async {
            let (host, port) = probe_endpoint(
                target,
                self.network_alias.as_deref(),
                self.port,
                self.poll_interval,
            )
            .await?;
            loop {
                ensure_not_exited(target).await?;
                match TcpStream::connect((host.as_str(), port)).await {
                    Ok(_) => return Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                        sleep(self.poll_interval).await;
                    }
                    Err(e) => return Err(Error::Io(e)),
                }
            }
        };
        bounded(self.startup_timeout, target, probe).await
    }
}

/// Waits for an HTTP probe, addressed the same way as [`TcpWait`].
#[derive(Debug, Clone)]
pub struct HttpWait {
    pub port: u16,
    pub path: String,
    pub method: String,
    pub network_alias: Option<String>,
    /// Expected status code; any 2xx matches when unset.
    pub status_code: Option<u16>,
    pub body_contains: Option<String>,
    pub use_tls: bool,
    pub allow_insecure: bool,
    pub poll_interval: Duration,
    pub startup_timeout: Duration,
}

impl HttpWait {
    pub fn new(path: impl Into<String>, port: u16) -> Self {
        HttpWait {
            port,
            path: path.into(),
            method: "GET".to_string(),
            network_alias: None,
            status_code: None,
            body_contains: None,
            use_tls: false,
            allow_insecure: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_network_alias(mut self, alias: impl Into<String>) -> Self {
        self.network_alias = Some(alias.into());
        self
    }

    pub fn with_status_code(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    pub fn with_body_contains(mut self, needle: impl Into<String>) -> Self {
        self.body_contains = Some(needle.into());
        self
    }

    pub fn with_tls(mut self, allow_insecure: bool) -> Self {
        self.use_tls = true;
        self.allow_insecure = allow_insecure;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    async fn wait_until_ready(&self, target: &ContainerHandle) -> Result<()> {
        let method = reqwest::Method::from_bytes(self.method.as_bytes())
            .map_err(|_| Error::Validation(format!("invalid http method {:?}", self.method)))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(1))
            .danger_accept_invalid_certs(self.allow_insecure)
            .build()
            .map_err(|e| Error::Other(e.into()))?;

        let probe = async {
            let (host, port) = probe_endpoint(
                target,
                self.network_alias.as_deref(),
                self.port,
                self.poll_interval,
            )
            .await?;
            let proto = if self.use_tls { "https" } else { "http" };
            let endpoint = format!("{proto}://{host}:{port}{}", self.path);
            loop {
                ensure_not_exited(target).await?;
                if let Ok(resp) = client.request(method.clone(), endpoint.as_str()).send().await {
                    let status_ok = match self.status_code {
                        Some(code) => resp.status().as_u16() == code,
                        None => resp.status().is_success(),
                    };
                    if status_ok {
                        match &self.body_contains {
                            None => return Ok(()),
                            Some(needle) => {
                                if let Ok(body) = resp.text().await {
                                    if body.contains(needle.as_str()) {
                                        return Ok(());
                                    }
                                }
                            }
                        }
                    }
                }
                sleep(self.poll_interval).await;
            }
        };
        bounded(self.startup_timeout, target, probe).await
    }
}

impl From<ExitWait> for WaitStrategy {
    fn from(wait: ExitWait) -> Self {
        WaitStrategy::Exit(wait)
    }
}

impl From<TcpWait> for WaitStrategy {
    fn from(wait: TcpWait) -> Self {
        WaitStrategy::Tcp(wait)
    }
}

impl From<HttpWait> for WaitStrategy {
    fn from(wait: HttpWait) -> Self {
        WaitStrategy::Http(wait)
    }
}

async fn bounded<F>(timeout: Duration, target: &ContainerHandle, fut: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::WaitTimeout {
            target: target.name.clone(),
            seconds: timeout.as_secs(),
        }),
    }
}

/// Address a probe should dial: the network alias with the container port
/// when one is set, otherwise the daemon host once the engine reports a
/// mapped host binding for `port`.
async fn probe_endpoint(
    target: &ContainerHandle,
    network_alias: Option<&str>,
    port: u16,
    poll_interval: Duration,
) -> Result<(String, u16)> {
    if let Some(alias) = network_alias {
        return Ok((alias.to_string(), port));
    }
    let host = target.host().await?;
    loop {
        ensure_not_exited(target).await?;
        if let Some(mapped) = target.mapped_port(port).await? {
            return Ok((host, mapped));
        }
        sleep(poll_interval).await;
    }
}

/// Fails when the container already exited; a vanished container is treated
/// as exited-cleanly to avoid racing auto-remove.
async fn ensure_not_exited(target: &ContainerHandle) -> Result<()> {
    let state = match target.state().await {
        Err(e) if is_not_found(&e) => return Ok(()),
        Err(e) => return Err(e),
        Ok(state) => state,
    };
    if state.running == Some(true) {
        return Ok(());
    }
    Err(Error::Other(anyhow::anyhow!(
        "container id :{} is exited",
        &target.id[..12.min(target.id.len())]
    )))
}

pub(crate) fn is_not_found(err: &Error) -> bool {
    matches!(
        err,
        Error::Docker(bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        })
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_builder_carries_code_and_timeout() {
        let wait = WaitStrategy::for_exit()
            .with_exit_code(0)
            .with_exit_timeout(Duration::from_secs(60));
        assert_eq!(wait.exit_code, Some(0));
        assert_eq!(wait.exit_timeout, Some(Duration::from_secs(60)));
        assert_eq!(wait.poll_interval, DEFAULT_POLL_INTERVAL);
    }

    #[test]
    fn http_builder_defaults() {
        let wait = WaitStrategy::for_http("/heath", 8080).with_method("GET");
        assert_eq!(wait.port, 8080);
        assert_eq!(wait.method, "GET");
        assert!(!wait.use_tls);
        assert_eq!(wait.startup_timeout, DEFAULT_STARTUP_TIMEOUT);
    }

    #[test]
    fn strategies_compose_into_the_sum_type() {
        let all = WaitStrategy::all(vec![
            WaitStrategy::for_listening_port(5432).into(),
            WaitStrategy::for_http("/health", 8080).into(),
        ]);
        match all {
            WaitStrategy::All(children) => assert_eq!(children.len(), 2),
            _ => panic!("expected All variant"),
        }
    }
}
