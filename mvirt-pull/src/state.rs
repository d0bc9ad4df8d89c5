//! Pull phase state machine.
//!
//! `transition` is pure: it maps the current phase and one event to the next
//! phase plus the actions the orchestrator has to execute. No I/O happens here.

use crate::error::{PullError, Result};
use reqwest::Url;
use tracing::debug;

/// Transfer job slot of a pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobSlot {
    SimpleDiscovery,
    MetaDiscovery,
    Download,
}

impl JobSlot {
    /// Jobs in this slot stream their payload into the extractor.
    pub fn opens_disk(self) -> bool {
        !matches!(self, JobSlot::MetaDiscovery)
    }
}

/// Phase of a pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Idle,
    SimpleDiscovery { meta_url: Url },
    MetaDiscovery,
    Download,
    Copying,
    Finished { success: bool },
}

impl Phase {
    /// A pull is in flight: jobs may run and events are expected.
    pub fn is_active(&self) -> bool {
        !matches!(self, Phase::Idle | Phase::Finished { .. })
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Phase::Finished { .. })
    }
}

/// Inputs to the state machine.
#[derive(Debug)]
pub enum Event {
    Start { simple_url: Url, meta_url: Url },
    SimpleDiscoveryFinished(Result<()>),
    /// Carries the resolved asset URL on success.
    MetaDiscoveryFinished(Result<Url>),
    DownloadFinished(Result<()>),
    InstallFinished(Result<()>),
}

/// Work the orchestrator performs after a transition.
#[derive(Debug)]
pub enum Action {
    StartJob { slot: JobSlot, url: Url },
    /// Kill the extractor and drop the staging directory.
    DiscardPartial,
    Install,
    Finish(Result<()>),
}

/// Compute the next phase and the actions to run.
///
/// Events that do not fit the current phase leave it unchanged and produce no
/// actions; in particular nothing happens once a pull is finished.
pub fn transition(phase: &Phase, event: Event) -> (Phase, Vec<Action>) {
    match (phase, event) {
        (
            Phase::Idle,
            Event::Start {
                simple_url,
                meta_url,
            },
        ) => (
            Phase::SimpleDiscovery { meta_url },
            vec![Action::StartJob {
                slot: JobSlot::SimpleDiscovery,
                url: simple_url,
            }],
        ),

        (Phase::SimpleDiscovery { .. }, Event::SimpleDiscoveryFinished(Ok(()))) => {
            (Phase::Copying, vec![Action::Install])
        }
        (Phase::SimpleDiscovery { meta_url }, Event::SimpleDiscoveryFinished(Err(e))) => {
            debug!(error = %e, "Simple discovery failed");
            (
                Phase::MetaDiscovery,
                vec![
                    Action::DiscardPartial,
                    Action::StartJob {
                        slot: JobSlot::MetaDiscovery,
                        url: meta_url.clone(),
                    },
                ],
            )
        }

        (Phase::MetaDiscovery, Event::MetaDiscoveryFinished(Ok(url))) => (
            Phase::Download,
            vec![Action::StartJob {
                slot: JobSlot::Download,
                url,
            }],
        ),
        (Phase::MetaDiscovery, Event::MetaDiscoveryFinished(Err(e))) => fail(e),

        (Phase::Download, Event::DownloadFinished(Ok(()))) => {
            (Phase::Copying, vec![Action::Install])
        }
        (Phase::Download, Event::DownloadFinished(Err(e))) => fail(e),

        (Phase::Copying, Event::InstallFinished(Ok(()))) => (
            Phase::Finished { success: true },
            vec![Action::Finish(Ok(()))],
        ),
        (Phase::Copying, Event::InstallFinished(Err(e))) => fail(e),

        (phase, _) => (phase.clone(), Vec::new()),
    }
}

fn fail(error: PullError) -> (Phase, Vec<Action>) {
    (
        Phase::Finished { success: false },
        vec![Action::DiscardPartial, Action::Finish(Err(error))],
    )
}
