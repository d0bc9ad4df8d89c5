//! Pull context: drives one image pull from discovery to install.
//!
//! The context owns the transfer jobs, the extractor and the staging area of
//! one pull. Phase sequencing lives in [`crate::state`]; this module executes
//! the actions the state machine asks for and feeds job events back into it.

use crate::discovery::{DEFAULT_EXTENSION, DiscoveryTarget, Labels, Platform};
use crate::error::{PullError, Result};
use crate::event_loop::EventLoop;
use crate::extractor::{Extractor, ExtractorConfig};
use crate::progress::{ProgressAggregator, ProgressPhase, ProgressSink};
use crate::staging::{self, DEFAULT_IMAGE_ROOT, StagingArea};
use crate::state::{self, Action, Event, JobSlot, Phase};
use crate::transfer::{
    DiskSink, HttpTransport, JobEvent, JobId, JobOutput, JobRequest, TransferJob, Transport,
};
use crate::validation::{aci_name_is_valid, machine_name_is_valid};
use reqwest::Url;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Completion callback, invoked exactly once with the final result.
pub type OnFinished = Box<dyn FnOnce(&AciPull, Result<()>) + Send>;

/// Default size limit for buffered discovery documents.
pub const DEFAULT_MAX_DOCUMENT_SIZE: usize = 1024 * 1024;

/// Pull configuration.
#[derive(Debug, Clone)]
pub struct PullConfig {
    /// URL scheme used for simple and meta discovery.
    pub discovery_scheme: String,
    /// Asset file extension used by simple discovery.
    pub extension: String,
    pub extractor: ExtractorConfig,
    /// Size limit for buffered discovery documents.
    pub max_document_size: usize,
    /// Overrides the detected OS and architecture.
    pub platform: Option<Platform>,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            discovery_scheme: "https".to_string(),
            extension: DEFAULT_EXTENSION.to_string(),
            extractor: ExtractorConfig::default(),
            max_document_size: DEFAULT_MAX_DOCUMENT_SIZE,
            platform: None,
        }
    }
}

/// One image pull.
pub struct AciPull {
    event_loop: EventLoop,
    transport: Arc<dyn Transport>,
    config: PullConfig,
    progress: ProgressAggregator,
    staging: StagingArea,
    grow_machine_directory: bool,

    target: Option<DiscoveryTarget>,
    local: Option<String>,
    force: bool,
    id: Option<String>,
    pending_digest: Option<String>,

    phase: Phase,
    simple_job: Option<TransferJob>,
    meta_job: Option<TransferJob>,
    download_job: Option<TransferJob>,
    next_job_id: JobId,
    events_tx: mpsc::UnboundedSender<JobEvent>,
    events_rx: mpsc::UnboundedReceiver<JobEvent>,
    install_requested: bool,

    extractor: Option<Extractor>,
    on_finished: Option<OnFinished>,
}

impl AciPull {
    /// Create a pull context.
    ///
    /// Binds to `event_loop`, or to the runtime of the calling task when none is
    /// given. `image_root` defaults to `/var/lib/machines`.
    pub fn new(
        event_loop: Option<EventLoop>,
        image_root: Option<&Path>,
        on_finished: Option<OnFinished>,
    ) -> Result<Self> {
        let event_loop = match event_loop {
            Some(event_loop) => event_loop,
            None => EventLoop::current()?,
        };

        let image_root = std::path::absolute(image_root.unwrap_or(Path::new(DEFAULT_IMAGE_ROOT)))
            .map_err(|e| PullError::io("Failed to resolve image root", e))?;
        let grow_machine_directory = image_root.starts_with(DEFAULT_IMAGE_ROOT);

        let transport =
            HttpTransport::new().map_err(|e| PullError::EventLoopInit(e.to_string()))?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            event_loop,
            transport: Arc::new(transport),
            config: PullConfig::default(),
            progress: ProgressAggregator::default(),
            staging: StagingArea::new(image_root),
            grow_machine_directory,
            target: None,
            local: None,
            force: false,
            id: None,
            pending_digest: None,
            phase: Phase::Idle,
            simple_job: None,
            meta_job: None,
            download_job: None,
            next_job_id: 0,
            events_tx,
            events_rx,
            install_requested: false,
            extractor: None,
            on_finished,
        })
    }

    pub fn with_config(mut self, config: PullConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_progress_sink(mut self, sink: Box<dyn ProgressSink>) -> Self {
        self.progress = ProgressAggregator::new(sink);
        self
    }

    /// Start pulling `name` at `label`, optionally installing a local copy
    /// named `local`.
    ///
    /// Returns once the simple discovery job is registered; drive the pull with
    /// [`AciPull::run`].
    pub fn start(&mut self, name: &str, label: &str, local: Option<&str>, force: bool) -> Result<()> {
        if self.phase != Phase::Idle {
            return Err(PullError::Busy);
        }

        if !aci_name_is_valid(name) {
            return Err(PullError::InvalidArgument(format!("Invalid image name: {name}")));
        }
        if let Some(local) = local
            && !machine_name_is_valid(local)
        {
            return Err(PullError::InvalidArgument(format!(
                "Invalid local image name: {local}"
            )));
        }

        let labels = Labels::parse(label)?;
        let platform = self.config.platform.clone().unwrap_or_else(Platform::detect);
        let target = DiscoveryTarget::new(name, labels, platform, &self.config.extension);
        let simple_url = target.simple_url(&self.config.discovery_scheme)?;
        let meta_url = target.meta_url(&self.config.discovery_scheme)?;

        info!(
            name = %target.name,
            version = %target.version,
            os = %target.os,
            arch = %target.arch,
            local = local.unwrap_or("-"),
            "Starting pull"
        );

        self.target = Some(target);
        self.local = local.map(str::to_string);
        self.force = force;

        self.dispatch(Event::Start {
            simple_url,
            meta_url,
        });
        Ok(())
    }

    /// Drive the pull until it finishes. Returns immediately if it was never
    /// started or already finished.
    pub async fn run(&mut self) {
        while self.phase.is_active() {
            if self.install_requested {
                let result = self.install().await;
                self.install_requested = false;
                self.dispatch(Event::InstallFinished(result));
                continue;
            }

            match self.events_rx.recv().await {
                Some(event) => self.handle_job_event(event).await,
                None => break,
            }
        }
    }

    fn dispatch(&mut self, event: Event) {
        let (phase, actions) = state::transition(&self.phase, event);
        if phase != self.phase {
            debug!(from = ?self.phase, to = ?phase, "Phase change");
        }
        self.phase = phase;

        for action in actions {
            match action {
                Action::StartJob { slot, url } => self.start_job(slot, url),
                Action::DiscardPartial => self.discard_partial(),
                Action::Install => self.install_requested = true,
                Action::Finish(result) => self.finish(result),
            }
        }
    }

    fn start_job(&mut self, slot: JobSlot, url: Url) {
        match slot {
            JobSlot::SimpleDiscovery => info!(url = %url, "Trying simple discovery"),
            JobSlot::MetaDiscovery => info!(url = %url, "Simple discovery failed, trying meta discovery"),
            JobSlot::Download => info!(url = %url, "Downloading image"),
        }

        let request = self.job_request(slot, url);
        let job = TransferJob::begin(
            &self.event_loop,
            Arc::clone(&self.transport),
            request,
            self.events_tx.clone(),
        );
        *self.job_slot_mut(slot) = Some(job);
    }

    /// The job itself only grows the machine directory once it opens a disk
    /// sink.
    fn job_request(&mut self, slot: JobSlot, url: Url) -> JobRequest {
        let id = self.next_job_id;
        self.next_job_id += 1;

        JobRequest {
            id,
            url,
            open_disk: slot.opens_disk(),
            grow_machine_directory: self.grow_machine_directory,
            max_document_size: self.config.max_document_size,
        }
    }

    async fn handle_job_event(&mut self, event: JobEvent) {
        let job_id = event.job();
        let Some(slot) = self.active_slot() else {
            debug!(job = job_id, "Ignoring job event outside an active phase");
            return;
        };
        let current = self
            .job_slot_mut(slot)
            .as_ref()
            .is_some_and(|job| job.id() == job_id && !job.is_finished());
        if !current {
            debug!(job = job_id, "Ignoring event from a stale job");
            return;
        }

        match event {
            JobEvent::OpenDisk { responder, .. } => {
                let result = self.open_disk().await;
                if let Err(e) = &result {
                    error!(error = %e, "Failed to prepare extraction");
                }
                if responder.send(result).is_err() {
                    debug!(job = job_id, "Job went away before its disk was ready");
                }
            }
            JobEvent::Progress { percent, .. } => {
                if let Some(job) = self.job_slot_mut(slot) {
                    job.set_progress(percent);
                }
                self.progress.update(ProgressPhase::from(slot), percent);
            }
            JobEvent::Finished { result, .. } => {
                if let Some(job) = self.job_slot_mut(slot) {
                    job.mark_finished();
                }
                let event = match slot {
                    JobSlot::SimpleDiscovery => {
                        Event::SimpleDiscoveryFinished(self.accept_payload(result))
                    }
                    JobSlot::MetaDiscovery => {
                        Event::MetaDiscoveryFinished(result.and_then(|output| self.resolve(output)))
                    }
                    JobSlot::Download => Event::DownloadFinished(self.accept_payload(result)),
                };
                self.dispatch(event);
            }
        }
    }

    fn accept_payload(&mut self, result: Result<JobOutput>) -> Result<()> {
        let output = result?;
        self.pending_digest = Some(output.digest);
        Ok(())
    }

    fn resolve(&self, output: JobOutput) -> Result<Url> {
        let target = self
            .target
            .as_ref()
            .ok_or_else(|| PullError::Discovery("pull has no target".to_string()))?;
        let document = String::from_utf8_lossy(&output.document);
        let url = target.resolve(&document)?;
        info!(url = %url, "Meta discovery resolved image");
        Ok(url)
    }

    /// Create the staging directory and start the extractor on it.
    async fn open_disk(&mut self) -> Result<DiskSink> {
        if self.extractor.is_some() {
            return Err(PullError::Busy);
        }

        let temp_path = self.staging.temp_path().to_path_buf();
        staging::create_staging(&temp_path).await?;

        let mut extractor = Extractor::spawn(&self.config.extractor, &temp_path)?;
        let sink = extractor.take_sink().ok_or_else(|| {
            PullError::ChildProcessFailure("extractor has no input pipe".to_string())
        })?;
        self.extractor = Some(extractor);
        Ok(sink)
    }

    /// Copy step: wait for the extractor, adopt the content id and promote.
    ///
    /// Each step keeps its state until it completes, so a cancelled `run`
    /// resumes the install where it stopped.
    async fn install(&mut self) -> Result<()> {
        self.progress.update(ProgressPhase::Copying, 0);

        match self.extractor.as_mut() {
            Some(extractor) => {
                extractor.reap().await?;
                self.extractor = None;
            }
            None if self.id.is_some() => {}
            None => {
                return Err(PullError::ChildProcessFailure(
                    "extractor is not running".to_string(),
                ));
            }
        }

        let digest = self.pending_digest.clone().ok_or_else(|| {
            PullError::ChildProcessFailure("no payload was extracted".to_string())
        })?;
        let final_path = self.staging.set_final_path(&digest).to_path_buf();
        self.id = Some(digest);

        let temp_path = self
            .staging
            .existing_temp_path()
            .map(Path::to_path_buf)
            .ok_or_else(|| PullError::ChildProcessFailure("no staging directory".to_string()))?;

        staging::promote(
            &temp_path,
            &final_path,
            self.staging.image_root(),
            self.local.as_deref(),
            self.force,
        )
        .await
    }

    /// Kill the extractor and remove the staging directory.
    fn discard_partial(&mut self) {
        if let Some(extractor) = self.extractor.take() {
            extractor.abort();
        }
        self.staging.discard();
        self.pending_digest = None;
    }

    fn finish(&mut self, result: Result<()>) {
        let code = match &result {
            Ok(()) => {
                let path = self
                    .final_path()
                    .map(|path| path.display().to_string())
                    .unwrap_or_default();
                info!(path = %path, id = self.id().unwrap_or("-"), "Pull complete");
                0
            }
            Err(e) => {
                error!(error = %e, "Pull failed");
                e.exit_code()
            }
        };

        match self.on_finished.take() {
            Some(on_finished) => on_finished(&*self, result),
            None => self.event_loop.exit(code),
        }
    }

    fn active_slot(&self) -> Option<JobSlot> {
        match self.phase {
            Phase::SimpleDiscovery { .. } => Some(JobSlot::SimpleDiscovery),
            Phase::MetaDiscovery => Some(JobSlot::MetaDiscovery),
            Phase::Download => Some(JobSlot::Download),
            _ => None,
        }
    }

    fn job_slot_mut(&mut self, slot: JobSlot) -> &mut Option<TransferJob> {
        match slot {
            JobSlot::SimpleDiscovery => &mut self.simple_job,
            JobSlot::MetaDiscovery => &mut self.meta_job,
            JobSlot::Download => &mut self.download_job,
        }
    }

    pub fn job(&self, slot: JobSlot) -> Option<&TransferJob> {
        match slot {
            JobSlot::SimpleDiscovery => self.simple_job.as_ref(),
            JobSlot::MetaDiscovery => self.meta_job.as_ref(),
            JobSlot::Download => self.download_job.as_ref(),
        }
    }

    /// Number of transfer jobs started so far.
    pub fn jobs_started(&self) -> u64 {
        self.next_job_id
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn image_root(&self) -> &Path {
        self.staging.image_root()
    }

    pub fn final_path(&self) -> Option<&Path> {
        self.staging.final_path()
    }

    pub fn temp_path(&self) -> Option<&Path> {
        self.staging.existing_temp_path()
    }

    /// Content id: SHA-256 of the downloaded image, known after install.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn extractor_pid(&self) -> Option<u32> {
        self.extractor.as_ref().map(Extractor::pid)
    }

    /// Path of the local copy, if one was requested.
    pub fn local_path(&self) -> Option<PathBuf> {
        self.local
            .as_deref()
            .map(|local| self.staging.image_root().join(local))
    }

    /// Last combined progress value reported.
    pub fn progress(&self) -> Option<u32> {
        self.progress.last()
    }
}

impl Drop for AciPull {
    fn drop(&mut self) {
        if self.phase.is_active() {
            warn!(phase = ?self.phase, "Pull dropped while in progress");
        }

        self.simple_job = None;
        self.meta_job = None;
        self.download_job = None;

        if let Some(extractor) = self.extractor.take() {
            extractor.abort();
        }
        self.staging.discard();
    }
}
