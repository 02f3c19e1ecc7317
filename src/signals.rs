//! Turns process signals into requests for the service loop.
//!
//! An interrupt (Ctrl-C / SIGINT) cancels the shutdown token. SIGTERM is
//! sent as [`ControlRequest::Shutdown`]. Either way the running cycle is
//! allowed to finish.

use std::future::{pending, Future};
use std::io;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::monitor::ControlRequest;

/// Listen for stop signals until one arrives.
#[cfg(unix)]
pub async fn forward_signals(control: mpsc::Sender<ControlRequest>, shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler; listening for Ctrl-C only");
            None
        }
    };
    let terminate = sigterm.as_mut().map(|s| s.recv());

    relay(tokio::signal::ctrl_c(), terminate, control, shutdown).await;
}

/// Listen for Ctrl-C until it arrives.
#[cfg(not(unix))]
pub async fn forward_signals(control: mpsc::Sender<ControlRequest>, shutdown: CancellationToken) {
    relay(
        tokio::signal::ctrl_c(),
        None::<std::future::Pending<Option<()>>>,
        control,
        shutdown,
    )
    .await;
}

/// Wait for whichever signal fires first.
///
/// A missing terminate listener or a failed interrupt listener leaves the
/// other one in charge.
async fn relay<I, T>(
    interrupt: I,
    terminate: Option<T>,
    control: mpsc::Sender<ControlRequest>,
    shutdown: CancellationToken,
) where
    I: Future<Output = io::Result<()>>,
    T: Future<Output = Option<()>>,
{
    let interrupt = async move {
        if let Err(e) = interrupt.await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            pending::<()>().await;
        }
    };
    let terminate = async move {
        match terminate {
            Some(signal) => signal.await,
            None => pending::<Option<()>>().await,
        }
    };

    tokio::select! {
        _ = interrupt => {
            info!("Received interrupt");
            shutdown.cancel();
        }
        _ = terminate => {
            info!("Received SIGTERM");
            let _ = control.send(ControlRequest::Shutdown).await;
        }
    }
}
