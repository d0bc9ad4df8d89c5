//! Combined progress accounting across pull phases.

use crate::state::JobSlot;
use std::env;
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Phase a progress value is reported for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressPhase {
    SimpleDiscovery,
    MetaDiscovery,
    Download,
    Copying,
}

impl ProgressPhase {
    /// Start of this phase on the combined scale.
    pub fn base(self) -> u32 {
        match self {
            ProgressPhase::SimpleDiscovery => 0,
            ProgressPhase::MetaDiscovery => 50,
            ProgressPhase::Download => 55,
            ProgressPhase::Copying => 95,
        }
    }

    /// Width of this phase on the combined scale.
    pub fn share(self) -> u32 {
        match self {
            ProgressPhase::SimpleDiscovery => 50,
            ProgressPhase::MetaDiscovery => 5,
            ProgressPhase::Download => 40,
            ProgressPhase::Copying => 0,
        }
    }
}

impl From<JobSlot> for ProgressPhase {
    fn from(slot: JobSlot) -> Self {
        match slot {
            JobSlot::SimpleDiscovery => ProgressPhase::SimpleDiscovery,
            JobSlot::MetaDiscovery => ProgressPhase::MetaDiscovery,
            JobSlot::Download => ProgressPhase::Download,
        }
    }
}

/// Map a phase and its own 0-100 job progress onto the combined 0-100 scale.
pub fn combined_percent(phase: ProgressPhase, job_percent: u32) -> u32 {
    let job_percent = job_percent.min(100);
    phase.base() + phase.share() * job_percent / 100
}

/// Receiver of combined progress values.
pub trait ProgressSink: Send {
    fn report(&mut self, percent: u32);
}

impl<F> ProgressSink for F
where
    F: FnMut(u32) + Send,
{
    fn report(&mut self, percent: u32) {
        self(percent)
    }
}

impl ProgressSink for watch::Sender<u32> {
    fn report(&mut self, percent: u32) {
        self.send_replace(percent);
    }
}

/// Logs progress values only.
#[derive(Debug, Default)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn report(&mut self, percent: u32) {
        debug!(percent, "Pull progress");
    }
}

/// Sends `X_IMPORT_PROGRESS=<n>` to the service manager notification socket.
///
/// Does nothing when `NOTIFY_SOCKET` is unset. Sends are fire-and-forget on a
/// non-blocking socket outside the reactor, so no report waits for readiness.
pub struct NotifyProgress {
    socket: Option<(UnixDatagram, PathBuf)>,
}

impl NotifyProgress {
    /// Connect to `$NOTIFY_SOCKET` if the process runs under a service manager.
    ///
    /// Abstract socket addresses (`@...`) are not supported and disable notification.
    pub fn from_env() -> Self {
        let socket = env::var_os("NOTIFY_SOCKET")
            .map(PathBuf::from)
            .filter(|path| path.is_absolute())
            .and_then(|path| match notify_socket() {
                Ok(socket) => Some((socket, path)),
                Err(e) => {
                    warn!(error = %e, "Failed to create notification socket");
                    None
                }
            });
        Self { socket }
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }
}

fn notify_socket() -> std::io::Result<UnixDatagram> {
    let socket = UnixDatagram::unbound()?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

impl ProgressSink for NotifyProgress {
    fn report(&mut self, percent: u32) {
        debug!(percent, "Pull progress");
        if let Some((socket, path)) = &self.socket {
            let message = format!("X_IMPORT_PROGRESS={percent}");
            if let Err(e) = socket.send_to(message.as_bytes(), path) {
                debug!(error = %e, "Failed to send progress notification");
            }
        }
    }
}

/// Turns per-job progress into a monotonic combined value for one sink.
pub struct ProgressAggregator {
    sink: Box<dyn ProgressSink>,
    last: Option<u32>,
}

impl ProgressAggregator {
    pub fn new(sink: Box<dyn ProgressSink>) -> Self {
        Self { sink, last: None }
    }

    /// Report `job_percent` of `phase`. Values below the last emitted one are
    /// clamped to it.
    pub fn update(&mut self, phase: ProgressPhase, job_percent: u32) {
        let percent = combined_percent(phase, job_percent);
        let percent = self.last.map_or(percent, |last| percent.max(last));
        self.last = Some(percent);
        self.sink.report(percent);
    }

    pub fn last(&self) -> Option<u32> {
        self.last
    }
}

impl Default for ProgressAggregator {
    fn default() -> Self {
        Self::new(Box::new(LogProgress))
    }
}
