//! Sequences the license check and refresh.
//!
//! One cycle is: read diagnostics, parse the status, evaluate it and, when
//! the GPU is not licensed, acquire a token and restart the driver service.
//!
//! [`LicenseMonitor::run_once`] runs a single cycle for interactive use.
//! [`LicenseMonitor::run_service`] repeats cycles on a fixed interval until a
//! stop request or the shutdown token arrives. Cycles never overlap: the
//! service loop starts at most one at a time and the cycle body is also
//! guarded by a mutex.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::LicmonConfig;
use crate::diagnostics::{DiagnosticSource, NvidiaSmi};
use crate::errors::LicenseResult;
use crate::service::{RestartReport, ServiceController, SystemServiceController};
use crate::status::{self, LicenseStatus};
use crate::token::{TokenAcquirer, TokenArtifact, TokenSource};
use crate::validity;

/// What a completed cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The GPU reported a valid license; nothing was changed.
    Licensed { status: LicenseStatus },
    /// A new token was installed and the driver service was restarted.
    Refreshed {
        status: LicenseStatus,
        token: TokenArtifact,
        restart: RestartReport,
    },
}

impl CycleOutcome {
    pub fn refreshed(&self) -> bool {
        matches!(self, CycleOutcome::Refreshed { .. })
    }
}

/// Lifecycle state reported to the service manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    StartPending,
    Running,
    StopPending,
    Stopped,
}

/// Requests delivered over the control channel while running as a service.
#[derive(Debug)]
pub enum ControlRequest {
    /// Report the current state without affecting the schedule.
    Interrogate(oneshot::Sender<ServiceState>),
    Stop,
    Shutdown,
    /// A request this monitor does not accept.
    Other(String),
}

/// Counters returned when the service loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceSummary {
    pub cycles: u64,
    pub refreshes: u64,
    pub failures: u64,
}

type CycleFuture<'a> = Pin<Box<dyn Future<Output = LicenseResult<CycleOutcome>> + Send + 'a>>;

/// The cycle orchestrator.
pub struct LicenseMonitor<D, T, S> {
    diagnostics: D,
    tokens: T,
    services: S,
    driver_service: String,
    interval: Duration,
    cycle_lock: Mutex<()>,
}

/// Monitor wired to `nvidia-smi`, the HTTP token server and the OS service
/// manager.
pub type SystemMonitor = LicenseMonitor<NvidiaSmi, TokenAcquirer, SystemServiceController>;

impl SystemMonitor {
    pub fn from_config(config: &LicmonConfig) -> Self {
        LicenseMonitor::new(
            NvidiaSmi::new(&config.nvidia.smi_path),
            TokenAcquirer::from_config(&config.server, &config.nvidia),
            SystemServiceController,
            &config.nvidia.driver_service,
            config.monitor.interval(),
        )
    }
}

impl<D, T, S> LicenseMonitor<D, T, S>
where
    D: DiagnosticSource,
    T: TokenSource,
    S: ServiceController,
{
    pub fn new(
        diagnostics: D,
        tokens: T,
        services: S,
        driver_service: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            diagnostics,
            tokens,
            services,
            driver_service: driver_service.into(),
            interval,
            cycle_lock: Mutex::new(()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run exactly one cycle.
    ///
    /// Only the token download and write can fail; diagnostic problems read
    /// as "unlicensed" and restart problems are carried in the outcome.
    pub async fn run_cycle(&self) -> LicenseResult<CycleOutcome> {
        let _guard = self.cycle_lock.lock().await;

        info!("Running diagnostic tool");
        let status = {
            let output = self.diagnostics.read().await;
            status::parse(&output)
        };

        info!(
            status = %status.status_text,
            product = %status.product_name,
            "Checking license"
        );
        if validity::evaluate(&status) {
            info!("GPU is licensed");
            return Ok(CycleOutcome::Licensed { status });
        }

        info!("GPU is not licensed, downloading license token");
        let token = self.tokens.acquire().await?;

        info!(service = %self.driver_service, "Restarting driver service");
        let restart = self.services.restart(&self.driver_service).await;
        if !restart.succeeded() {
            warn!(service = %self.driver_service, "Driver service restart did not succeed");
        }

        Ok(CycleOutcome::Refreshed {
            status,
            token,
            restart,
        })
    }

    /// Interactive mode: one cycle, errors returned to the caller.
    pub async fn run_once(&self) -> LicenseResult<CycleOutcome> {
        let outcome = self.run_cycle().await;
        match &outcome {
            Ok(CycleOutcome::Licensed { .. }) => info!("No refresh needed"),
            Ok(CycleOutcome::Refreshed { token, .. }) => {
                info!(path = %token.path.display(), "License token refreshed")
            }
            Err(e) => error!(error = %e, "License check failed"),
        }
        outcome
    }

    /// Service mode: run cycles every `interval` until told to stop.
    ///
    /// The first cycle runs one full interval after start. Cycle errors are
    /// logged and counted; they never end the loop. A stop request or a
    /// cancelled `shutdown` token lets an in-flight cycle finish and then
    /// returns without starting another.
    pub async fn run_service(
        &self,
        mut control: mpsc::Receiver<ControlRequest>,
        shutdown: CancellationToken,
    ) -> ServiceSummary {
        debug!(state = ?ServiceState::StartPending, "Starting license monitor");
        let mut summary = ServiceSummary::default();

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut in_flight: Option<CycleFuture<'_>> = None;
        let mut control_open = true;

        let mut state = ServiceState::Running;
        info!(interval_secs = self.interval.as_secs(), "License monitor running");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled(), if state == ServiceState::Running => {
                    info!("Shutdown signal received");
                    state = ServiceState::StopPending;
                }

                request = control.recv(), if control_open => match request {
                    Some(ControlRequest::Interrogate(reply)) => {
                        let _ = reply.send(state);
                    }
                    Some(ControlRequest::Stop) | Some(ControlRequest::Shutdown) => {
                        info!("Stop requested");
                        state = ServiceState::StopPending;
                    }
                    Some(ControlRequest::Other(request)) => {
                        error!(request = %request, "Unexpected control request");
                    }
                    None => {
                        debug!("Control channel closed");
                        control_open = false;
                    }
                },

                result = poll_in_flight(&mut in_flight), if in_flight.is_some() => {
                    in_flight = None;
                    summary.cycles += 1;
                    match result {
                        Ok(outcome) if outcome.refreshed() => summary.refreshes += 1,
                        Ok(_) => {}
                        Err(e) => {
                            summary.failures += 1;
                            error!(error = %e, "License cycle failed; retrying next interval");
                        }
                    }
                }

                _ = ticker.tick(), if in_flight.is_none() && state == ServiceState::Running => {
                    in_flight = Some(Box::pin(self.run_cycle()));
                }
            }

            if state == ServiceState::StopPending && in_flight.is_none() {
                break;
            }
        }

        drop(ticker);
        info!(
            state = ?ServiceState::Stopped,
            cycles = summary.cycles,
            refreshes = summary.refreshes,
            failures = summary.failures,
            "License monitor stopped"
        );
        summary
    }
}

async fn poll_in_flight(slot: &mut Option<CycleFuture<'_>>) -> LicenseResult<CycleOutcome> {
    match slot {
        Some(cycle) => cycle.await,
        None => std::future::pending().await,
    }
}
