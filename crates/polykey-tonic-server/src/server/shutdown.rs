//! Termination handling and graceful shutdown.
//!
//! The [`ShutdownCoordinator`] owns the serve task of a [`BoundHost`] and
//! moves the process through three phases:
//!
//! ```text
//! Running ──termination──▶ Draining ──accept loop done──▶ Stopped
//! ```
//!
//! On termination it first marks every health entry NOT_SERVING, waits the
//! configured grace period so load balancers can observe the change, then
//! stops accepting connections and lets in-flight calls complete. Calls still
//! running after the drain timeout are abandoned along with their
//! connections.
//!
//! Termination is abstracted behind [`TerminationSource`] so the same
//! sequence runs for OS signals in production and for a [`ManualTrigger`] in
//! tests.

use crate::server::{
    error::{HostError, Result},
    health::HealthReporter,
    host::BoundHost,
    interceptor::InFlightCalls,
};
use core::fmt;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

/// Why a shutdown started.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    /// SIGINT or Ctrl+C.
    Interrupt,
    /// SIGTERM.
    Terminate,
    /// Requested in-process through a [`ManualTrigger`].
    Requested,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
            Self::Requested => "requested",
        })
    }
}

/// Something that resolves once the process should shut down.
pub trait TerminationSource: Send + 'static {
    fn wait(self) -> impl Future<Output = Termination> + Send;
}

/// SIGINT and SIGTERM on unix; Ctrl+C elsewhere.
///
/// Handlers are installed eagerly so a signal delivered while the host is
/// still starting is not lost.
pub struct OsSignals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl OsSignals {
    pub fn install() -> io::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            Ok(Self {
                interrupt: signal(SignalKind::interrupt())?,
                terminate: signal(SignalKind::terminate())?,
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }
}

impl TerminationSource for OsSignals {
    #[cfg(unix)]
    async fn wait(mut self) -> Termination {
        tokio::select! {
            _ = self.interrupt.recv() => Termination::Interrupt,
            _ = self.terminate.recv() => Termination::Terminate,
        }
    }

    #[cfg(not(unix))]
    async fn wait(self) -> Termination {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        Termination::Interrupt
    }
}

/// In-process termination source. Clones share one trigger.
#[derive(Clone, Debug, Default)]
pub struct ManualTrigger {
    token: CancellationToken,
}

impl ManualTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the shutdown. Triggering more than once has no further effect.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl TerminationSource for ManualTrigger {
    async fn wait(self) -> Termination {
        self.token.cancelled().await;
        Termination::Requested
    }
}

/// Process lifecycle as seen by the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecyclePhase {
    Running,
    Draining,
    Stopped,
}

/// Runs a bound host until termination and drains it.
pub struct ShutdownCoordinator {
    health: HealthReporter,
    in_flight: InFlightCalls,
    grace: Duration,
    drain_timeout: Duration,
    phase: watch::Sender<LifecyclePhase>,
}

impl ShutdownCoordinator {
    /// Coordinator using the host's health reporter, in-flight counter and
    /// shutdown timings.
    pub fn for_host(host: &BoundHost) -> Self {
        let (phase, _) = watch::channel(LifecyclePhase::Running);
        Self {
            health: host.health(),
            in_flight: host.in_flight(),
            grace: host.config().shutdown_grace,
            drain_timeout: host.config().drain_timeout,
            phase,
        }
    }

    /// Subscribes to phase changes.
    pub fn phase(&self) -> watch::Receiver<LifecyclePhase> {
        self.phase.subscribe()
    }

    /// Serves `host` until `source` resolves, then drains it.
    ///
    /// Returns `Ok(())` after a requested shutdown, even when the drain
    /// timeout forced connections closed. An accept loop that ends on its own
    /// is an error.
    pub async fn run<T: TerminationSource>(self, host: BoundHost, source: T) -> Result<()> {
        let token = CancellationToken::new();
        let mut serve = tokio::spawn(host.serve(token.clone().cancelled_owned()));

        let reason = tokio::select! {
            reason = source.wait() => reason,
            joined = &mut serve => {
                self.health.shutdown().await;
                self.phase.send_replace(LifecyclePhase::Stopped);
                return match joined {
                    Ok(Ok(())) => Err(HostError::UnexpectedExit),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(e.into()),
                };
            }
        };

        tracing::info!(%reason, "server shutting down");
        self.health.shutdown().await;
        self.phase.send_replace(LifecyclePhase::Draining);

        if !self.grace.is_zero() {
            tracing::debug!(grace = ?self.grace, "waiting before closing the listener");
            sleep(self.grace).await;
        }

        tracing::info!(in_flight = self.in_flight.get(), "draining in-flight calls");
        token.cancel();

        let result = match timeout(self.drain_timeout, &mut serve).await {
            Ok(Ok(served)) => served,
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                tracing::warn!(
                    in_flight = self.in_flight.get(),
                    drain_timeout = ?self.drain_timeout,
                    "drain timed out, closing remaining connections"
                );
                serve.abort();
                Ok(())
            }
        };

        self.phase.send_replace(LifecyclePhase::Stopped);
        if result.is_ok() {
            tracing::info!("server stopped");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::config::ServerConfig;
    use crate::server::health::ServingStatus;
    use crate::server::host::polykey_host;
    use polykey_tonic_core::SERVICE_NAME;

    async fn bound(grace: Duration) -> BoundHost {
        let mut config = ServerConfig::with_listen_addr("127.0.0.1:0");
        config.shutdown_grace = grace;
        config.drain_timeout = Duration::from_secs(5);
        polykey_host(config).bind().await.unwrap()
    }

    #[test]
    fn manual_trigger_is_shared_between_clones() {
        let trigger = ManualTrigger::new();
        let other = trigger.clone();
        assert!(!other.is_triggered());
        trigger.trigger();
        trigger.trigger();
        assert!(other.is_triggered());
    }

    #[tokio::test]
    async fn trigger_before_run_still_stops() {
        let host = bound(Duration::ZERO).await;
        let health = host.health();
        let coordinator = ShutdownCoordinator::for_host(&host);
        let phase = coordinator.phase();

        let trigger = ManualTrigger::new();
        trigger.trigger();
        coordinator.run(host, trigger).await.unwrap();

        assert_eq!(*phase.borrow(), LifecyclePhase::Stopped);
        assert_eq!(health.query(""), ServingStatus::NotServing);
        assert_eq!(health.query(SERVICE_NAME), ServingStatus::NotServing);
    }

    #[tokio::test]
    async fn health_flips_before_the_listener_closes() {
        let host = bound(Duration::from_millis(300)).await;
        let addr = host.local_addr();
        let health = host.health();
        let coordinator = ShutdownCoordinator::for_host(&host);
        let mut phase = coordinator.phase();
        let trigger = ManualTrigger::new();

        let run = tokio::spawn(coordinator.run(host, trigger.clone()));
        assert_eq!(*phase.borrow(), LifecyclePhase::Running);
        assert_eq!(health.query(""), ServingStatus::Serving);

        trigger.trigger();
        phase
            .wait_for(|p| *p == LifecyclePhase::Draining)
            .await
            .unwrap();
        assert_eq!(health.query(""), ServingStatus::NotServing);
        // Still accepting during the grace period.
        tokio::net::TcpStream::connect(addr).await.unwrap();

        run.await.unwrap().unwrap();
        assert_eq!(*phase.borrow(), LifecyclePhase::Stopped);
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn draining_is_only_observed_after_health_is_published() {
        use tonic_health::pb::HealthCheckRequest;
        use tonic_health::pb::health_check_response::ServingStatus as ProtoServingStatus;
        use tonic_health::pb::health_server::Health;

        let host = bound(Duration::from_millis(200)).await;
        let health = host.health();
        let checks = health.service();
        let coordinator = ShutdownCoordinator::for_host(&host);
        let mut phase = coordinator.phase();
        let trigger = ManualTrigger::new();
        let run = tokio::spawn(coordinator.run(host, trigger.clone()));

        trigger.trigger();
        phase.changed().await.unwrap();
        assert_eq!(*phase.borrow_and_update(), LifecyclePhase::Draining);

        assert!(health.is_shut_down());
        for name in ["", SERVICE_NAME] {
            assert_eq!(health.query(name), ServingStatus::NotServing, "{name}");
            let resp = checks
                .check(tonic::Request::new(HealthCheckRequest {
                    service: name.to_string(),
                }))
                .await
                .unwrap();
            assert_eq!(resp.get_ref().status(), ProtoServingStatus::NotServing);
        }

        run.await.unwrap().unwrap();
    }

    #[test]
    fn termination_reason_display() {
        assert_eq!(Termination::Interrupt.to_string(), "SIGINT");
        assert_eq!(Termination::Terminate.to_string(), "SIGTERM");
        assert_eq!(Termination::Requested.to_string(), "requested");
    }
}
