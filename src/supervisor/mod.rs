//! Sidecar service supervision
//!
//! Owns the lifecycle of external STT/TTS processes: spawn, health-poll until
//! ready, continuous health checks, graceful-then-forced stop, and a circuit
//! breaker that disables a flapping service for a cooldown window before
//! restarting it.

mod breaker;
mod process;

pub use breaker::{BreakerState, CircuitBreaker, DEFAULT_COOLDOWN, DEFAULT_FAILURE_THRESHOLD};
pub use process::{SidecarProcess, SidecarSpec, parse_health_body};

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::{Error, Result};

/// Capability of a process the supervisor can manage
///
/// Real sidecars spawn OS processes; tests substitute scripted fakes.
#[async_trait]
pub trait ManagedProcess: Send + Sync {
    /// Service name for logs
    fn name(&self) -> &str;

    /// Host the service listens on
    fn host(&self) -> &str;

    /// Port the service listens on
    fn port(&self) -> u16;

    /// Launch the process, returning its PID when known
    async fn spawn(&mut self) -> Result<Option<u32>>;

    /// Query readiness; `Ok(false)` means reachable but not ready
    async fn probe(&self) -> Result<bool>;

    /// Ask the process to shut down gracefully
    async fn terminate(&mut self) -> Result<()>;

    /// Force the process down
    async fn kill(&mut self) -> Result<()>;

    /// Whether the process is still alive
    fn is_running(&mut self) -> bool;
}

/// Health of a supervised service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Never checked
    Unknown,
    /// Spawned, waiting for first healthy probe
    Starting,
    /// Last probe succeeded
    Healthy,
    /// Last probe failed, breaker not yet tripped
    Unhealthy,
    /// Breaker open; calls short-circuit until the cooldown passes
    Disabled,
    /// Not running
    Stopped,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Starting => write!(f, "starting"),
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Disabled => write!(f, "disabled"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Snapshot of one supervised sidecar
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    /// Service name
    pub name: String,
    /// OS process id while running
    pub process_id: Option<u32>,
    /// Listen host
    pub host: String,
    /// Listen port
    pub port: u16,
    /// Current health
    pub health_status: HealthStatus,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// End of the current cooldown, if disabled
    pub disabled_until: Option<Instant>,
}

/// Supervisor timing and breaker settings
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// How long `start` waits for the first healthy probe
    pub startup_timeout: Duration,
    /// Interval between health probes
    pub health_interval: Duration,
    /// Wait between graceful and forced stop
    pub grace_period: Duration,
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,
    /// Breaker cooldown
    pub cooldown: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(30),
            health_interval: Duration::from_millis(500),
            grace_period: Duration::from_secs(3),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

/// Lifecycle manager for one sidecar
pub struct ServiceSupervisor {
    process: Box<dyn ManagedProcess>,
    settings: SupervisorSettings,
    status: HealthStatus,
    pid: Option<u32>,
    breaker: CircuitBreaker,
}

impl ServiceSupervisor {
    /// Supervise `process` with the given settings
    #[must_use]
    pub fn new(process: Box<dyn ManagedProcess>, settings: SupervisorSettings) -> Self {
        let breaker = CircuitBreaker::new(
            process.name(),
            settings.failure_threshold,
            settings.cooldown,
        );
        Self {
            process,
            settings,
            status: HealthStatus::Unknown,
            pid: None,
            breaker,
        }
    }

    /// Breaker shared with clients of this service
    ///
    /// Request failures recorded by clients count toward disabling the
    /// service, and vice versa.
    #[must_use]
    pub fn breaker(&self) -> CircuitBreaker {
        self.breaker.clone()
    }

    /// Current health
    #[must_use]
    pub const fn status(&self) -> HealthStatus {
        self.status
    }

    /// Snapshot for status reporting
    #[must_use]
    pub fn handle(&self) -> ServiceHandle {
        ServiceHandle {
            name: self.process.name().to_string(),
            process_id: self.pid,
            host: self.process.host().to_string(),
            port: self.process.port(),
            health_status: self.status,
            consecutive_failures: self.breaker.consecutive_failures(),
            disabled_until: self.breaker.disabled_until(),
        }
    }

    /// Spawn the process and wait until it reports healthy
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` if the service does not become healthy within
    /// the startup timeout (the process is stopped again), or the spawn error
    pub async fn start(&mut self) -> Result<()> {
        if self.status == HealthStatus::Healthy && self.process.is_running() {
            return Ok(());
        }

        let name = self.process.name().to_string();
        self.status = HealthStatus::Starting;
        tracing::info!(service = %name, "starting sidecar");

        self.pid = match self.process.spawn().await {
            Ok(pid) => pid,
            Err(e) => {
                self.status = HealthStatus::Stopped;
                return Err(e);
            }
        };

        let started = Instant::now();
        loop {
            match self.process.probe().await {
                Ok(true) => {
                    self.status = HealthStatus::Healthy;
                    self.breaker.record_success();
                    tracing::info!(
                        service = %name,
                        pid = ?self.pid,
                        elapsed = ?started.elapsed(),
                        "sidecar healthy"
                    );
                    return Ok(());
                }
                Ok(false) => tracing::trace!(service = %name, "sidecar not ready yet"),
                Err(e) => tracing::trace!(service = %name, error = %e, "health probe failed"),
            }

            if !self.process.is_running() {
                self.status = HealthStatus::Stopped;
                self.pid = None;
                return Err(Error::Supervisor(format!("{name} exited during startup")));
            }

            if started.elapsed() >= self.settings.startup_timeout {
                tracing::error!(service = %name, timeout = ?self.settings.startup_timeout, "sidecar failed to become healthy");
                self.stop().await?;
                self.status = HealthStatus::Unhealthy;
                return Err(Error::Timeout(format!(
                    "{name} not healthy after {:?}",
                    self.settings.startup_timeout
                )));
            }

            tokio::time::sleep(self.settings.health_interval).await;
        }
    }

    /// Probe health once and advance the state machine
    ///
    /// A disabled service whose cooldown has elapsed is restarted.
    pub async fn check_health(&mut self) -> HealthStatus {
        let name = self.process.name().to_string();

        match self.status {
            HealthStatus::Stopped | HealthStatus::Unknown => return self.status,
            HealthStatus::Disabled => {
                if !self.breaker.allow() {
                    return self.status;
                }
                tracing::info!(service = %name, "cooldown elapsed, restarting sidecar");
                if let Err(e) = self.stop().await {
                    tracing::warn!(service = %name, error = %e, "stop before restart failed");
                }
                if let Err(e) = self.start().await {
                    tracing::warn!(service = %name, error = %e, "restart failed");
                    self.mark_failure();
                }
                return self.status;
            }
            _ => {}
        }

        if self.breaker.is_open() {
            self.status = HealthStatus::Disabled;
            return self.status;
        }

        let healthy = self.process.is_running() && matches!(self.process.probe().await, Ok(true));
        if healthy {
            if self.status != HealthStatus::Healthy {
                tracing::info!(service = %name, "sidecar recovered");
            }
            self.breaker.record_success();
            self.status = HealthStatus::Healthy;
        } else {
            self.mark_failure();
        }

        self.status
    }

    fn mark_failure(&mut self) {
        let tripped = self.breaker.record_failure();
        self.status = if tripped || self.breaker.is_open() {
            HealthStatus::Disabled
        } else {
            HealthStatus::Unhealthy
        };
        tracing::warn!(
            service = %self.process.name(),
            failures = self.breaker.consecutive_failures(),
            status = %self.status,
            "sidecar health check failed"
        );
    }

    /// Stop the process: graceful signal, grace period, then force
    ///
    /// Idempotent when already stopped.
    ///
    /// # Errors
    ///
    /// Returns error if the forced kill fails
    pub async fn stop(&mut self) -> Result<()> {
        let name = self.process.name().to_string();

        if !self.process.is_running() {
            self.status = HealthStatus::Stopped;
            self.pid = None;
            return Ok(());
        }

        if let Err(e) = self.process.terminate().await {
            tracing::debug!(service = %name, error = %e, "graceful stop signal failed");
        }

        let deadline = Instant::now() + self.settings.grace_period;
        while self.process.is_running() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if self.process.is_running() {
            tracing::warn!(service = %name, "sidecar ignored graceful stop, killing");
            self.process.kill().await?;
        }

        self.status = HealthStatus::Stopped;
        self.pid = None;
        tracing::info!(service = %name, "sidecar stopped");
        Ok(())
    }
}

/// Poll `supervisor` at its health interval until `shutdown` flips to true
pub fn spawn_monitor(
    supervisor: std::sync::Arc<tokio::sync::Mutex<ServiceSupervisor>>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = supervisor.lock().await.settings.health_interval;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                () = tokio::time::sleep(interval) => {
                    supervisor.lock().await.check_health().await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use super::*;

    /// Scripted process: healthy after `ready_after` probes, optional stubborn stop
    struct FakeProcess {
        running: bool,
        probes: Arc<AtomicU32>,
        ready_after: u32,
        healthy: Arc<AtomicBool>,
        ignore_terminate: bool,
        killed: Arc<AtomicBool>,
        spawns: Arc<AtomicU32>,
    }

    impl FakeProcess {
        fn new(ready_after: u32) -> Self {
            Self {
                running: false,
                probes: Arc::new(AtomicU32::new(0)),
                ready_after,
                healthy: Arc::new(AtomicBool::new(true)),
                ignore_terminate: false,
                killed: Arc::new(AtomicBool::new(false)),
                spawns: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    #[async_trait]
    impl ManagedProcess for FakeProcess {
        fn name(&self) -> &str {
            "fake"
        }

        fn host(&self) -> &str {
            "127.0.0.1"
        }

        fn port(&self) -> u16 {
            9000
        }

        async fn spawn(&mut self) -> Result<Option<u32>> {
            self.running = true;
            self.spawns.fetch_add(1, Ordering::SeqCst);
            Ok(Some(4242))
        }

        async fn probe(&self) -> Result<bool> {
            let n = self.probes.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(n > self.ready_after && self.healthy.load(Ordering::SeqCst))
        }

        async fn terminate(&mut self) -> Result<()> {
            if !self.ignore_terminate {
                self.running = false;
            }
            Ok(())
        }

        async fn kill(&mut self) -> Result<()> {
            self.killed.store(true, Ordering::SeqCst);
            self.running = false;
            Ok(())
        }

        fn is_running(&mut self) -> bool {
            self.running
        }
    }

    fn fast_settings() -> SupervisorSettings {
        SupervisorSettings {
            startup_timeout: Duration::from_millis(200),
            health_interval: Duration::from_millis(5),
            grace_period: Duration::from_millis(20),
            failure_threshold: 2,
            cooldown: Duration::from_millis(40),
        }
    }

    #[tokio::test]
    async fn start_polls_until_healthy() {
        let process = FakeProcess::new(3);
        let probes = Arc::clone(&process.probes);
        let mut supervisor = ServiceSupervisor::new(Box::new(process), fast_settings());

        supervisor.start().await.unwrap();

        assert_eq!(supervisor.status(), HealthStatus::Healthy);
        assert_eq!(probes.load(Ordering::SeqCst), 4);
        let handle = supervisor.handle();
        assert_eq!(handle.process_id, Some(4242));
        assert_eq!(handle.port, 9000);
    }

    #[tokio::test]
    async fn start_times_out_and_stops() {
        let process = FakeProcess::new(u32::MAX);
        let mut supervisor = ServiceSupervisor::new(Box::new(process), fast_settings());

        let err = supervisor.start().await.unwrap_err();

        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(supervisor.status(), HealthStatus::Unhealthy);
        assert_eq!(supervisor.handle().process_id, None);
    }

    #[tokio::test]
    async fn repeated_failures_disable_then_restart_after_cooldown() {
        let process = FakeProcess::new(0);
        let healthy = Arc::clone(&process.healthy);
        let spawns = Arc::clone(&process.spawns);
        let mut supervisor = ServiceSupervisor::new(Box::new(process), fast_settings());
        supervisor.start().await.unwrap();

        healthy.store(false, Ordering::SeqCst);
        assert_eq!(supervisor.check_health().await, HealthStatus::Unhealthy);
        assert_eq!(supervisor.check_health().await, HealthStatus::Disabled);
        assert!(supervisor.handle().disabled_until.is_some());

        // still cooling down
        assert_eq!(supervisor.check_health().await, HealthStatus::Disabled);

        healthy.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(supervisor.check_health().await, HealthStatus::Healthy);
        assert_eq!(spawns.load(Ordering::SeqCst), 2);
        assert_eq!(supervisor.handle().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn stop_is_graceful_then_forced() {
        let mut process = FakeProcess::new(0);
        process.ignore_terminate = true;
        let killed = Arc::clone(&process.killed);
        let mut supervisor = ServiceSupervisor::new(Box::new(process), fast_settings());
        supervisor.start().await.unwrap();

        supervisor.stop().await.unwrap();

        assert!(killed.load(Ordering::SeqCst));
        assert_eq!(supervisor.status(), HealthStatus::Stopped);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let process = FakeProcess::new(0);
        let killed = Arc::clone(&process.killed);
        let mut supervisor = ServiceSupervisor::new(Box::new(process), fast_settings());

        supervisor.stop().await.unwrap();
        supervisor.start().await.unwrap();
        supervisor.stop().await.unwrap();
        supervisor.stop().await.unwrap();

        assert!(!killed.load(Ordering::SeqCst));
        assert_eq!(supervisor.status(), HealthStatus::Stopped);
    }

    #[tokio::test]
    async fn client_failures_feed_the_shared_breaker() {
        let process = FakeProcess::new(0);
        let mut supervisor = ServiceSupervisor::new(Box::new(process), fast_settings());
        supervisor.start().await.unwrap();

        let breaker = supervisor.breaker();
        breaker.record_failure();
        breaker.record_failure();

        assert_eq!(supervisor.check_health().await, HealthStatus::Disabled);
    }

    #[test]
    fn health_status_display() {
        assert_eq!(HealthStatus::Healthy.to_string(), "healthy");
        assert_eq!(HealthStatus::Disabled.to_string(), "disabled");
        assert_eq!(HealthStatus::Stopped.to_string(), "stopped");
    }
}
