//! Extractor child process supervision.
//!
//! The extractor reads the image byte stream on stdin and unpacks it into the
//! staging directory. The supervisor owns the child: it is either reaped after
//! end of stream or killed and reaped on abort or drop.

use crate::error::{PullError, Result};
use crate::transfer::DiskSink;
use std::ffi::OsString;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info, warn};

/// Placeholder in extractor arguments replaced by the staging directory.
pub const DIR_PLACEHOLDER: &str = "{dir}";

/// How long teardown waits for a killed extractor to exit.
const KILL_TIMEOUT: Duration = Duration::from_secs(5);
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Extractor command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractorConfig {
    pub program: String,
    /// Arguments; `{dir}` is replaced by the staging directory.
    pub args: Vec<String>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            program: "tar".to_string(),
            args: ["--numeric-owner", "-C", DIR_PLACEHOLDER, "-px"]
                .map(String::from)
                .to_vec(),
        }
    }
}

impl ExtractorConfig {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    fn command_args(&self, dir: &Path) -> Vec<OsString> {
        self.args
            .iter()
            .map(|arg| {
                if arg == DIR_PLACEHOLDER {
                    dir.as_os_str().to_owned()
                } else {
                    OsString::from(arg.replace(DIR_PLACEHOLDER, &dir.to_string_lossy()))
                }
            })
            .collect()
    }
}

/// A running extractor.
pub struct Extractor {
    child: Option<Child>,
    sink: Option<ChildStdin>,
    pid: u32,
    program: String,
}

impl Extractor {
    /// Start the extractor for `dir`. The staging directory must exist.
    pub fn spawn(config: &ExtractorConfig, dir: &Path) -> Result<Self> {
        let mut child = Command::new(&config.program)
            .args(config.command_args(dir))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PullError::io(format!("Failed to spawn {}", config.program), e))?;

        let pid = child.id().ok_or_else(|| {
            PullError::ChildProcessFailure(format!("{} exited immediately", config.program))
        })?;
        let sink = child.stdin.take();

        info!(pid, program = %config.program, dir = %dir.display(), "Started extractor");

        Ok(Self {
            child: Some(child),
            sink,
            pid,
            program: config.program.clone(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Hand out the extractor's stdin. Returns `None` after the first call.
    pub fn take_sink(&mut self) -> Option<DiskSink> {
        self.sink.take().map(|stdin| Box::new(stdin) as DiskSink)
    }

    /// Close the input and wait for the extractor to exit.
    ///
    /// The child stays owned until it has been reaped, so a cancelled wait
    /// can be resumed.
    pub async fn reap(&mut self) -> Result<ExitStatus> {
        self.sink = None;
        let Some(child) = self.child.as_mut() else {
            return Err(PullError::ChildProcessFailure(format!(
                "{} already reaped",
                self.program
            )));
        };

        let status = child
            .wait()
            .await
            .map_err(|e| PullError::io(format!("Failed to wait for {}", self.program), e))?;
        self.child = None;

        if !status.success() {
            return Err(PullError::ChildProcessFailure(format!(
                "{} {status}",
                self.program
            )));
        }

        debug!(pid = self.pid, "Extractor exited");
        Ok(status)
    }

    /// Kill and reap the extractor.
    pub fn abort(mut self) {
        self.terminate();
    }

    fn terminate(&mut self) {
        self.sink = None;
        let Some(mut child) = self.child.take() else {
            return;
        };

        if let Ok(Some(_)) = child.try_wait() {
            return;
        }

        if let Err(e) = child.start_kill() {
            warn!(pid = self.pid, error = %e, "Failed to kill extractor");
        }

        let deadline = Instant::now() + KILL_TIMEOUT;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => {
                    debug!(pid = self.pid, "Extractor killed");
                    return;
                }
                Ok(None) if Instant::now() < deadline => std::thread::sleep(KILL_POLL_INTERVAL),
                Ok(None) => {
                    warn!(pid = self.pid, "Extractor did not exit after kill");
                    return;
                }
                Err(e) => {
                    warn!(pid = self.pid, error = %e, "Failed to reap extractor");
                    return;
                }
            }
        }
    }
}

impl Drop for Extractor {
    fn drop(&mut self) {
        self.terminate();
    }
}
