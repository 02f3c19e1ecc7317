use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use licmon::diagnostics::{DiagnosticOutput, DiagnosticSource};
use licmon::errors::{LicenseError, LicenseResult};
use licmon::monitor::{ControlRequest, CycleOutcome, LicenseMonitor, ServiceState};
use licmon::service::{CommandOutcome, RestartReport, ServiceController};
use licmon::token::{TokenArtifact, TokenSource};

const INTERVAL: Duration = Duration::from_secs(300);
const DRIVER_SERVICE: &str = "NVDisplay.ContainerLocalSystem";

fn smi_report(license_status: &str) -> String {
    format!(
        r#"<?xml version="1.0" ?>
<!DOCTYPE nvidia_smi_log SYSTEM "nvsmi_device_v12.dtd">
<nvidia_smi_log>
    <driver_version>535.54.03</driver_version>
    <gpu id="00000000:02:00.0">
        <vgpu_software_licensed_product>
            <licensed_product_name>NVIDIA Virtual Applications</licensed_product_name>
            <license_status>{license_status}</license_status>
        </vgpu_software_licensed_product>
    </gpu>
</nvidia_smi_log>"#
    )
}

/// Diagnostic source returning a fixed report.
struct FakeSmi {
    report: String,
    reads: Arc<AtomicUsize>,
}

#[async_trait]
impl DiagnosticSource for FakeSmi {
    async fn read(&self) -> DiagnosticOutput {
        self.reads.fetch_add(1, Ordering::SeqCst);
        DiagnosticOutput::new(self.report.clone())
    }
}

#[derive(Clone, Copy)]
enum Download {
    Succeed,
    MissingHeader,
    SlowSucceed(Duration),
}

struct FakeTokens {
    behavior: Download,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl TokenSource for FakeTokens {
    async fn acquire(&self) -> LicenseResult<TokenArtifact> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Download::MissingHeader => return Err(LicenseError::MissingContentDisposition),
            Download::SlowSucceed(delay) => tokio::time::sleep(delay).await,
            Download::Succeed => {}
        }
        Ok(TokenArtifact {
            path: PathBuf::from("/tokens/client_configuration_token_2024-01-01T10_00_00.tok"),
            bytes_written: 42,
            superseded: vec![],
        })
    }
}

struct FakeServices {
    restarted: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ServiceController for FakeServices {
    async fn restart(&self, service: &str) -> RestartReport {
        self.restarted.lock().unwrap().push(service.to_string());
        RestartReport {
            service: service.to_string(),
            stop: CommandOutcome::Succeeded,
            start: CommandOutcome::Succeeded,
        }
    }
}

struct Harness {
    reads: Arc<AtomicUsize>,
    downloads: Arc<AtomicUsize>,
    restarted: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    fn monitor(
        report: String,
        behavior: Download,
    ) -> (LicenseMonitor<FakeSmi, FakeTokens, FakeServices>, Harness) {
        let harness = Harness {
            reads: Arc::new(AtomicUsize::new(0)),
            downloads: Arc::new(AtomicUsize::new(0)),
            restarted: Arc::new(Mutex::new(Vec::new())),
        };
        let monitor = LicenseMonitor::new(
            FakeSmi {
                report,
                reads: harness.reads.clone(),
            },
            FakeTokens {
                behavior,
                calls: harness.downloads.clone(),
            },
            FakeServices {
                restarted: harness.restarted.clone(),
            },
            DRIVER_SERVICE,
            INTERVAL,
        );
        (monitor, harness)
    }

    fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    fn restarts(&self) -> Vec<String> {
        self.restarted.lock().unwrap().clone()
    }
}

#[tokio::test]
async fn licensed_gpu_is_left_alone() {
    let (monitor, harness) = Harness::monitor(
        smi_report("Licensed (Expiry: 2023-06-01 12:00:00 GMT)"),
        Download::Succeed,
    );

    let first = monitor.run_once().await.unwrap();
    let second = monitor.run_once().await.unwrap();

    assert!(matches!(first, CycleOutcome::Licensed { .. }));
    assert!(!second.refreshed());
    assert_eq!(harness.reads(), 2);
    assert_eq!(harness.downloads(), 0);
    assert!(harness.restarts().is_empty());
}

#[tokio::test]
async fn unlicensed_gpu_gets_a_new_token_and_restart() {
    let (monitor, harness) = Harness::monitor(smi_report("Unlicensed"), Download::Succeed);

    let outcome = monitor.run_once().await.unwrap();

    match outcome {
        CycleOutcome::Refreshed {
            status,
            token,
            restart,
        } => {
            assert_eq!(status.status_text, "Unlicensed");
            assert_eq!(status.product_name, "NVIDIA Virtual Applications");
            assert!(token.path.ends_with("client_configuration_token_2024-01-01T10_00_00.tok"));
            assert!(restart.succeeded());
        }
        other => panic!("expected a refresh, got {other:?}"),
    }
    assert_eq!(harness.downloads(), 1);
    assert_eq!(harness.restarts(), vec![DRIVER_SERVICE.to_string()]);
}

#[tokio::test]
async fn unreadable_diagnostics_trigger_a_refresh() {
    let (monitor, harness) = Harness::monitor(String::new(), Download::Succeed);

    let outcome = monitor.run_once().await.unwrap();

    assert!(outcome.refreshed());
    assert_eq!(harness.downloads(), 1);
}

#[tokio::test]
async fn failed_download_skips_the_restart() {
    let (monitor, harness) = Harness::monitor(smi_report("Unlicensed"), Download::MissingHeader);

    let result = monitor.run_once().await;

    assert!(matches!(result, Err(LicenseError::MissingContentDisposition)));
    assert_eq!(harness.downloads(), 1);
    assert!(harness.restarts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn service_runs_on_the_interval_and_answers_interrogate() {
    let (monitor, harness) = Harness::monitor(smi_report("Unlicensed"), Download::Succeed);
    let monitor = Arc::new(monitor);
    let (control, control_rx) = mpsc::channel(4);
    let shutdown = CancellationToken::new();

    let handle = {
        let monitor = monitor.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { monitor.run_service(control_rx, shutdown).await })
    };

    let (reply, answer) = oneshot::channel();
    control.send(ControlRequest::Interrogate(reply)).await.unwrap();
    assert_eq!(answer.await.unwrap(), ServiceState::Running);

    // Nothing runs before the first interval elapses.
    tokio::time::sleep(Duration::from_secs(299)).await;
    assert_eq!(harness.reads(), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(harness.reads(), 1);

    tokio::time::sleep(INTERVAL).await;
    assert_eq!(harness.reads(), 2);

    control
        .send(ControlRequest::Other("pause".to_string()))
        .await
        .unwrap();
    control.send(ControlRequest::Stop).await.unwrap();
    let summary = handle.await.unwrap();

    assert_eq!(summary.cycles, 2);
    assert_eq!(summary.refreshes, 2);
    assert_eq!(summary.failures, 0);
    assert_eq!(harness.restarts().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn cycle_errors_do_not_stop_the_service() {
    let (monitor, harness) = Harness::monitor(smi_report("Unlicensed"), Download::MissingHeader);
    let (_control, control_rx) = mpsc::channel(4);
    let shutdown = CancellationToken::new();

    let handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { monitor.run_service(control_rx, shutdown).await })
    };

    tokio::time::sleep(INTERVAL * 3 + Duration::from_secs(1)).await;
    shutdown.cancel();
    let summary = handle.await.unwrap();

    assert_eq!(summary.cycles, 3);
    assert_eq!(summary.failures, 3);
    assert_eq!(harness.downloads(), 3);
    assert!(harness.restarts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_lets_the_running_cycle_finish() {
    let (monitor, harness) = Harness::monitor(
        smi_report("Unlicensed"),
        Download::SlowSucceed(Duration::from_secs(30)),
    );
    let (control, control_rx) = mpsc::channel(4);

    let handle = tokio::spawn(async move {
        monitor
            .run_service(control_rx, CancellationToken::new())
            .await
    });

    // The first cycle is now downloading.
    tokio::time::sleep(INTERVAL + Duration::from_secs(1)).await;
    assert_eq!(harness.downloads(), 1);
    assert!(harness.restarts().is_empty());

    // Interrogate is answered while the download is still in flight.
    let (reply, answer) = oneshot::channel();
    control.send(ControlRequest::Interrogate(reply)).await.unwrap();
    assert_eq!(answer.await.unwrap(), ServiceState::Running);

    control.send(ControlRequest::Shutdown).await.unwrap();
    let summary = handle.await.unwrap();

    assert_eq!(summary.cycles, 1);
    assert_eq!(summary.refreshes, 1);
    assert_eq!(harness.downloads(), 1);
    assert_eq!(harness.restarts(), vec![DRIVER_SERVICE.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn shutdown_before_first_tick_runs_no_cycle() {
    let (monitor, harness) = Harness::monitor(smi_report("Unlicensed"), Download::Succeed);
    let (control, control_rx) = mpsc::channel(4);
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    let summary = monitor.run_service(control_rx, shutdown).await;
    drop(control);

    assert_eq!(summary.cycles, 0);
    assert_eq!(harness.reads(), 0);
}
