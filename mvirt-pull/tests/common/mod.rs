//! Shared test utilities for mvirt-pull integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use mvirt_pull::discovery::Platform;
use mvirt_pull::extractor::{DIR_PLACEHOLDER, ExtractorConfig};
use mvirt_pull::transfer::{TransferBody, Transport};
use mvirt_pull::{AciPull, OnFinished, PullConfig, PullError, TransferError};
use reqwest::Url;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const NAME: &str = "example.com/app";
pub const VERSION: &str = "v1.0.0";
pub const SIMPLE_URL: &str = "https://example.com/app-v1.0.0-linux-amd64.aci";
pub const META_URL: &str = "https://example.com/app?ac-discovery=1";
pub const ASSET_URL: &str = "https://cdn.example.com/example.com/app/v1.0.0/linux-amd64.aci";

pub const MANIFEST: &str = r#"{"acKind":"ImageManifest","name":"example.com/app"}"#;

/// Canned response for one URL.
#[derive(Clone)]
pub enum Response {
    Body(Vec<u8>),
    Status(u16),
    /// Send `prefix`, then never finish.
    Stall {
        content_length: u64,
        prefix: Vec<u8>,
    },
    /// Send `prefix`, then drop the connection after `delay`.
    FailAfter { prefix: Vec<u8>, delay: Duration },
}

/// Transport serving canned responses and recording every request.
///
/// URLs without a response get a 404.
#[derive(Default)]
pub struct FakeTransport {
    responses: Mutex<HashMap<String, Response>>,
    requests: Mutex<Vec<String>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, url: &str, response: Response) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), response);
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&self, url: &Url) -> Result<TransferBody, TransferError> {
        self.requests.lock().unwrap().push(url.to_string());

        let response = self.responses.lock().unwrap().get(url.as_str()).cloned();
        match response {
            None => Err(TransferError::Status(404)),
            Some(Response::Status(status)) => Err(TransferError::Status(status)),
            Some(Response::Body(data)) => Ok(TransferBody::from_bytes(data)),
            Some(Response::Stall {
                content_length,
                prefix,
            }) => {
                let head = futures_util::stream::once(async move { Ok(Bytes::from(prefix)) });
                Ok(TransferBody {
                    content_length: Some(content_length),
                    stream: head.chain(futures_util::stream::pending()).boxed(),
                })
            }
            Some(Response::FailAfter { prefix, delay }) => {
                let head = futures_util::stream::once(async move { Ok(Bytes::from(prefix)) });
                let reset = futures_util::stream::once(async move {
                    tokio::time::sleep(delay).await;
                    Err(TransferError::Connection("connection reset".to_string()))
                });
                Ok(TransferBody {
                    content_length: None,
                    stream: head.chain(reset).boxed(),
                })
            }
        }
    }
}

/// Build an uncompressed ACI: a manifest plus a small rootfs.
pub fn aci_archive() -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    append_file(&mut builder, "manifest", MANIFEST.as_bytes());
    append_file(&mut builder, "rootfs/etc/os-release", b"ID=test\n");
    builder.into_inner().unwrap()
}

fn append_file(builder: &mut tar::Builder<Vec<u8>>, path: &str, data: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, path, data).unwrap();
}

/// `ac-discovery` document pointing `example.com` at the CDN.
pub fn discovery_document() -> Vec<u8> {
    r#"<html><head>
<meta name="ac-discovery" content="example.com https://cdn.example.com/{name}/{version}/{os}-{arch}.{ext}">
<meta name="ac-discovery-pubkeys" content="example.com https://example.com/pubkeys.gpg">
</head></html>"#
        .as_bytes()
        .to_vec()
}

pub fn config() -> PullConfig {
    PullConfig {
        platform: Some(Platform::new("linux", "amd64")),
        ..PullConfig::default()
    }
}

/// tar wrapped in a shell that runs `after` once extraction succeeded.
pub fn tar_then(after: &str) -> ExtractorConfig {
    ExtractorConfig::new(
        "sh",
        [
            "-c".to_string(),
            format!("tar --numeric-owner -C \"$0\" -px && {after}"),
            DIR_PLACEHOLDER.to_string(),
        ],
    )
}

/// What the completion callback saw.
pub struct Completion {
    pub result: Result<(), PullError>,
    pub final_path: Option<PathBuf>,
}

pub type Completions = Arc<Mutex<Vec<Completion>>>;

pub fn completion_recorder() -> (OnFinished, Completions) {
    let completions: Completions = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&completions);
    let on_finished: OnFinished = Box::new(move |pull: &AciPull, result| {
        recorded.lock().unwrap().push(Completion {
            result,
            final_path: pull.final_path().map(Path::to_path_buf),
        });
    });
    (on_finished, completions)
}

/// Pull context on `root` with a completion recorder and the fake transport.
pub fn new_pull(root: &Path, transport: &Arc<FakeTransport>) -> (AciPull, Completions) {
    let (on_finished, completions) = completion_recorder();
    let pull = AciPull::new(None, Some(root), Some(on_finished))
        .unwrap()
        .with_config(config())
        .with_transport(Arc::clone(transport) as Arc<dyn Transport>);
    (pull, completions)
}

/// Drive `pull` until its extractor is running. Panics after five seconds.
pub async fn run_until_extracting(pull: &mut AciPull) -> u32 {
    for _ in 0..50 {
        if let Some(pid) = pull.extractor_pid() {
            return pid;
        }
        let _ = tokio::time::timeout(Duration::from_millis(100), pull.run()).await;
    }
    panic!("extractor never started");
}

/// Entries of `root` whose name starts with `prefix`.
pub fn entries_with_prefix(root: &Path, prefix: &str) -> Vec<PathBuf> {
    std::fs::read_dir(root)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| {
            path.file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with(prefix))
        })
        .collect()
}
