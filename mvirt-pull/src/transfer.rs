//! Transfer jobs.
//!
//! A transfer job fetches one URL on the event loop and talks to its pull
//! context only through [`JobEvent`]s: it asks for a disk sink once the
//! response headers are in, reports progress while streaming, and reports a
//! terminal result exactly once. Without a sink the body is buffered in memory
//! up to a size limit (discovery documents).

use crate::error::{PullError, Result, TransferError};
use crate::event_loop::EventLoop;
use crate::staging;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::Url;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub type JobId = u64;

/// Writable sink a job streams its payload into.
pub type DiskSink = Box<dyn AsyncWrite + Send + Unpin>;

pub type ByteStream = BoxStream<'static, std::result::Result<Bytes, TransferError>>;

/// Response body handed out by a [`Transport`].
pub struct TransferBody {
    pub content_length: Option<u64>,
    pub stream: ByteStream,
}

impl TransferBody {
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            content_length: Some(data.len() as u64),
            stream: futures_util::stream::once(async move { Ok(data) }).boxed(),
        }
    }
}

/// Opens a URL for reading.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start the request. Returns once the headers are in; status codes of
    /// 400 and above are errors.
    async fn open(&self, url: &Url) -> std::result::Result<TransferBody, TransferError>;
}

/// HTTP(S) transport backed by reqwest.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> std::result::Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("mvirt-pull/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, url: &Url) -> std::result::Result<TransferBody, TransferError> {
        let response = self.client.get(url.clone()).send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                TransferError::Connection(e.to_string())
            } else {
                TransferError::Request(e)
            }
        })?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(TransferError::Status(status.as_u16()));
        }

        Ok(TransferBody {
            content_length: response.content_length(),
            stream: response.bytes_stream().map_err(TransferError::from).boxed(),
        })
    }
}

/// Parameters of one transfer job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub id: JobId,
    pub url: Url,
    /// Ask the context for a disk sink once headers are known.
    pub open_disk: bool,
    /// Grow the machine image filesystem before writing to disk.
    pub grow_machine_directory: bool,
    /// Buffer limit for bodies that are not written to disk.
    pub max_document_size: usize,
}

/// Result of a successful transfer.
#[derive(Debug, Default)]
pub struct JobOutput {
    /// Buffered body; empty when the payload went to a disk sink.
    pub document: Vec<u8>,
    /// SHA-256 of the payload, lower-case hex.
    pub digest: String,
    pub bytes: u64,
}

/// Messages from a job to its pull context.
pub enum JobEvent {
    OpenDisk {
        job: JobId,
        responder: oneshot::Sender<Result<DiskSink>>,
    },
    Progress {
        job: JobId,
        percent: u32,
    },
    Finished {
        job: JobId,
        result: Result<JobOutput>,
    },
}

impl JobEvent {
    pub fn job(&self) -> JobId {
        match self {
            JobEvent::OpenDisk { job, .. }
            | JobEvent::Progress { job, .. }
            | JobEvent::Finished { job, .. } => *job,
        }
    }
}

/// Handle to a running transfer. Dropping it aborts the transfer.
pub struct TransferJob {
    id: JobId,
    url: Url,
    task: JoinHandle<()>,
    progress_percent: u32,
    finished: bool,
}

impl TransferJob {
    pub fn begin(
        event_loop: &EventLoop,
        transport: Arc<dyn Transport>,
        request: JobRequest,
        events: mpsc::UnboundedSender<JobEvent>,
    ) -> Self {
        let id = request.id;
        let url = request.url.clone();

        info!(job = id, url = %url, "Starting transfer");

        let task = event_loop.spawn(async move {
            let result = run_job(transport.as_ref(), &request, &events).await;
            let _ = events.send(JobEvent::Finished { job: id, result });
        });

        Self {
            id,
            url,
            task,
            progress_percent: 0,
            finished: false,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn progress_percent(&self) -> u32 {
        self.progress_percent
    }

    pub(crate) fn set_progress(&mut self, percent: u32) {
        self.progress_percent = percent.min(100);
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn mark_finished(&mut self) {
        self.finished = true;
    }
}

impl Drop for TransferJob {
    fn drop(&mut self) {
        if !self.task.is_finished() {
            debug!(job = self.id, "Aborting transfer");
        }
        self.task.abort();
    }
}

async fn run_job(
    transport: &dyn Transport,
    request: &JobRequest,
    events: &mpsc::UnboundedSender<JobEvent>,
) -> Result<JobOutput> {
    let body = transport.open(&request.url).await?;

    let mut sink = if request.open_disk {
        let sink = open_disk(request.id, events).await?;
        if request.grow_machine_directory {
            staging::grow_machine_directory().await;
        }
        Some(sink)
    } else {
        None
    };

    let content_length = body.content_length.filter(|&len| len > 0);
    let mut stream = body.stream;
    let mut hasher = Sha256::new();
    let mut document = Vec::new();
    let mut bytes: u64 = 0;
    let mut last_percent = None;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        hasher.update(&chunk);

        match sink.as_mut() {
            Some(sink) => sink
                .write_all(&chunk)
                .await
                .map_err(TransferError::Write)?,
            None => {
                if document.len() + chunk.len() > request.max_document_size {
                    return Err(TransferError::BodyTooLarge(request.max_document_size).into());
                }
                document.try_reserve(chunk.len())?;
                document.extend_from_slice(&chunk);
            }
        }
        bytes += chunk.len() as u64;

        if let Some(total) = content_length {
            let percent = (bytes.min(total) * 100 / total) as u32;
            if last_percent != Some(percent) {
                last_percent = Some(percent);
                send_progress(events, request.id, percent)?;
            }
        }
    }

    // Closing the sink signals end of stream to the reader.
    if let Some(mut sink) = sink.take() {
        sink.shutdown().await.map_err(TransferError::Write)?;
    }

    if last_percent != Some(100) {
        send_progress(events, request.id, 100)?;
    }

    let digest = hex::encode(hasher.finalize());
    info!(job = request.id, bytes, digest = %digest, "Transfer complete");

    Ok(JobOutput {
        document,
        digest,
        bytes,
    })
}

async fn open_disk(job: JobId, events: &mpsc::UnboundedSender<JobEvent>) -> Result<DiskSink> {
    let (responder, response) = oneshot::channel();
    events
        .send(JobEvent::OpenDisk { job, responder })
        .map_err(|_| TransferError::Cancelled)?;

    match response.await {
        Ok(sink) => sink,
        Err(_) => Err(TransferError::Cancelled.into()),
    }
}

fn send_progress(
    events: &mpsc::UnboundedSender<JobEvent>,
    job: JobId,
    percent: u32,
) -> std::result::Result<(), PullError> {
    events
        .send(JobEvent::Progress { job, percent })
        .map_err(|_| TransferError::Cancelled.into())
}
