//! End-to-end pull tests against a fake transport and a real tar extractor.

mod common;

use common::*;
use mvirt_pull::state::{JobSlot, Phase};
use mvirt_pull::{AciPull, EventLoop, PullConfig, PullError, TransferError};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::timeout;

#[tokio::test]
async fn simple_discovery_installs_image() {
    let root = TempDir::new().unwrap();
    let transport = FakeTransport::new();
    let archive = aci_archive();
    transport.respond(SIMPLE_URL, Response::Body(archive.clone()));

    let (mut pull, completions) = new_pull(root.path(), &transport);
    pull.start(NAME, VERSION, None, false).unwrap();
    pull.run().await;

    let completions = completions.lock().unwrap();
    assert_eq!(completions.len(), 1);
    assert!(completions[0].result.is_ok());

    let digest = hex::encode(Sha256::digest(&archive));
    let final_path = completions[0].final_path.clone().unwrap();
    assert_eq!(final_path, root.path().join(format!(".aci-{digest}")));
    assert_eq!(pull.id(), Some(digest.as_str()));
    assert_eq!(
        std::fs::read_to_string(final_path.join("manifest")).unwrap(),
        MANIFEST
    );
    assert!(final_path.join("rootfs/etc/os-release").exists());

    assert_eq!(pull.jobs_started(), 1);
    assert_eq!(transport.requests(), vec![SIMPLE_URL]);
    assert_eq!(*pull.phase(), Phase::Finished { success: true });
    assert!(pull.extractor_pid().is_none());
    assert!(entries_with_prefix(root.path(), ".#aci-").is_empty());
}

#[tokio::test]
async fn failed_meta_discovery_reports_its_error() {
    let root = TempDir::new().unwrap();
    let transport = FakeTransport::new();
    transport.respond(META_URL, Response::Status(503));

    let (mut pull, completions) = new_pull(root.path(), &transport);
    pull.start(NAME, VERSION, Some("web"), false).unwrap();
    pull.run().await;

    assert_eq!(transport.requests(), vec![SIMPLE_URL, META_URL]);

    let completions = completions.lock().unwrap();
    assert_eq!(completions.len(), 1);
    assert!(matches!(
        completions[0].result,
        Err(PullError::Network(TransferError::Status(503)))
    ));
    assert!(completions[0].final_path.is_none());

    assert!(!root.path().join("web").exists());
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn meta_discovery_downloads_resolved_asset() {
    let root = TempDir::new().unwrap();
    let transport = FakeTransport::new();
    transport.respond(META_URL, Response::Body(discovery_document()));
    transport.respond(ASSET_URL, Response::Body(aci_archive()));

    let (mut pull, completions) = new_pull(root.path(), &transport);
    pull.start(NAME, VERSION, Some("web"), false).unwrap();
    pull.run().await;

    assert_eq!(transport.requests(), vec![SIMPLE_URL, META_URL, ASSET_URL]);
    assert_eq!(pull.jobs_started(), 3);
    assert_eq!(
        pull.job(JobSlot::Download).map(|job| job.url().as_str()),
        Some(ASSET_URL)
    );

    let completions = completions.lock().unwrap();
    assert!(completions[0].result.is_ok());
    assert_eq!(
        std::fs::read_to_string(root.path().join("web/manifest")).unwrap(),
        MANIFEST
    );
    assert_eq!(entries_with_prefix(root.path(), ".aci-").len(), 1);
    assert!(entries_with_prefix(root.path(), ".#aci-").is_empty());
}

#[tokio::test]
async fn unmatched_discovery_document_fails() {
    let root = TempDir::new().unwrap();
    let transport = FakeTransport::new();
    transport.respond(META_URL, Response::Body(b"<html></html>".to_vec()));

    let (mut pull, completions) = new_pull(root.path(), &transport);
    pull.start(NAME, VERSION, None, false).unwrap();
    pull.run().await;

    let completions = completions.lock().unwrap();
    assert!(matches!(completions[0].result, Err(PullError::Discovery(_))));
    assert_eq!(transport.requests(), vec![SIMPLE_URL, META_URL]);
}

#[tokio::test]
async fn existing_local_image_requires_force() {
    let root = TempDir::new().unwrap();
    let transport = FakeTransport::new();
    transport.respond(SIMPLE_URL, Response::Body(aci_archive()));

    let local = root.path().join("web");
    std::fs::create_dir(&local).unwrap();
    std::fs::write(local.join("marker"), "old").unwrap();

    let (mut pull, completions) = new_pull(root.path(), &transport);
    pull.start(NAME, VERSION, Some("web"), false).unwrap();
    pull.run().await;

    {
        let completions = completions.lock().unwrap();
        assert!(matches!(
            completions[0].result,
            Err(PullError::AlreadyExists(ref path)) if path == &local
        ));
    }
    assert!(local.join("marker").exists());
    drop(pull);

    let (mut pull, completions) = new_pull(root.path(), &transport);
    pull.start(NAME, VERSION, Some("web"), true).unwrap();
    pull.run().await;

    assert!(completions.lock().unwrap()[0].result.is_ok());
    assert!(!local.join("marker").exists());
    assert_eq!(
        std::fs::read_to_string(local.join("manifest")).unwrap(),
        MANIFEST
    );
    assert_eq!(entries_with_prefix(root.path(), ".aci-").len(), 1);
}

#[tokio::test]
async fn second_start_is_busy() {
    let root = TempDir::new().unwrap();
    let transport = FakeTransport::new();
    transport.respond(SIMPLE_URL, Response::Body(aci_archive()));

    let (mut pull, completions) = new_pull(root.path(), &transport);
    pull.start(NAME, VERSION, None, false).unwrap();
    assert!(matches!(
        pull.start(NAME, VERSION, None, false),
        Err(PullError::Busy)
    ));

    pull.run().await;
    assert!(matches!(
        pull.start(NAME, VERSION, None, false),
        Err(PullError::Busy)
    ));
    assert_eq!(completions.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn invalid_arguments_are_rejected() {
    let root = TempDir::new().unwrap();
    let transport = FakeTransport::new();
    let (mut pull, completions) = new_pull(root.path(), &transport);

    for (name, label, local) in [
        ("Example.com/App", VERSION, None),
        (NAME, VERSION, Some("../escape")),
        (NAME, "os=linux", None),
        (NAME, "", None),
    ] {
        assert!(matches!(
            pull.start(name, label, local, false),
            Err(PullError::InvalidArgument(_))
        ));
    }

    assert_eq!(*pull.phase(), Phase::Idle);
    assert!(transport.requests().is_empty());

    // Never started: run returns right away and nothing completes.
    pull.run().await;
    assert!(completions.lock().unwrap().is_empty());
}

#[tokio::test]
async fn dropping_during_simple_discovery_cleans_up() {
    let root = TempDir::new().unwrap();
    let transport = FakeTransport::new();
    let archive = aci_archive();
    transport.respond(
        SIMPLE_URL,
        Response::Stall {
            content_length: 1024 * 1024,
            prefix: archive[..512].to_vec(),
        },
    );

    let (mut pull, completions) = new_pull(root.path(), &transport);
    pull.start(NAME, VERSION, None, false).unwrap();

    let pid = run_until_extracting(&mut pull).await;
    let temp_path = pull.temp_path().unwrap().to_path_buf();
    assert!(temp_path.is_dir());
    assert!(pull.phase().is_active());

    drop(pull);

    assert_eq!(
        kill(Pid::from_raw(pid as i32), None),
        Err(Errno::ESRCH)
    );
    assert!(!temp_path.exists());
    assert!(completions.lock().unwrap().is_empty());
}

#[tokio::test]
async fn dropping_during_download_cleans_up() {
    let root = TempDir::new().unwrap();
    let transport = FakeTransport::new();
    let archive = aci_archive();
    transport.respond(META_URL, Response::Body(discovery_document()));
    transport.respond(
        ASSET_URL,
        Response::Stall {
            content_length: 1024 * 1024,
            prefix: archive[..512].to_vec(),
        },
    );

    let (mut pull, completions) = new_pull(root.path(), &transport);
    pull.start(NAME, VERSION, None, false).unwrap();

    let pid = run_until_extracting(&mut pull).await;
    assert_eq!(*pull.phase(), Phase::Download);
    assert!(pull.job(JobSlot::Download).is_some());
    let temp_path = pull.temp_path().unwrap().to_path_buf();
    assert!(temp_path.is_dir());

    drop(pull);

    assert_eq!(
        kill(Pid::from_raw(pid as i32), None),
        Err(Errno::ESRCH)
    );
    assert!(!temp_path.exists());
    assert!(completions.lock().unwrap().is_empty());
    assert_eq!(transport.requests(), vec![SIMPLE_URL, META_URL, ASSET_URL]);
}

#[tokio::test]
async fn broken_simple_stream_restarts_extraction_for_download() {
    let root = TempDir::new().unwrap();
    let transport = FakeTransport::new();
    let archive = aci_archive();
    transport.respond(
        SIMPLE_URL,
        Response::FailAfter {
            prefix: archive[..512].to_vec(),
            delay: Duration::from_millis(500),
        },
    );
    transport.respond(META_URL, Response::Body(discovery_document()));
    transport.respond(ASSET_URL, Response::Body(archive.clone()));

    let (mut pull, completions) = new_pull(root.path(), &transport);
    pull.start(NAME, VERSION, None, false).unwrap();

    let first = run_until_extracting(&mut pull).await;
    assert!(matches!(pull.phase(), Phase::SimpleDiscovery { .. }));
    pull.run().await;

    assert_eq!(
        kill(Pid::from_raw(first as i32), None),
        Err(Errno::ESRCH)
    );
    let completions = completions.lock().unwrap();
    assert!(completions[0].result.is_ok());
    assert_eq!(transport.requests(), vec![SIMPLE_URL, META_URL, ASSET_URL]);

    let digest = hex::encode(Sha256::digest(&archive));
    assert_eq!(pull.id(), Some(digest.as_str()));
    assert_eq!(
        std::fs::read_to_string(root.path().join(format!(".aci-{digest}/manifest"))).unwrap(),
        MANIFEST
    );
    assert!(entries_with_prefix(root.path(), ".#aci-").is_empty());
}

#[tokio::test]
async fn cancelled_install_resumes_on_next_run() {
    let root = TempDir::new().unwrap();
    let transport = FakeTransport::new();
    transport.respond(SIMPLE_URL, Response::Body(aci_archive()));

    let (pull, completions) = new_pull(root.path(), &transport);
    let mut pull = pull.with_config(PullConfig {
        extractor: tar_then("sleep 1"),
        ..config()
    });
    pull.start(NAME, VERSION, None, false).unwrap();

    for _ in 0..50 {
        if *pull.phase() == Phase::Copying {
            break;
        }
        let _ = timeout(Duration::from_millis(100), pull.run()).await;
    }
    assert_eq!(*pull.phase(), Phase::Copying);
    assert!(pull.extractor_pid().is_some());
    assert!(completions.lock().unwrap().is_empty());

    timeout(Duration::from_secs(5), pull.run())
        .await
        .expect("install did not resume");

    assert_eq!(*pull.phase(), Phase::Finished { success: true });
    assert!(pull.extractor_pid().is_none());
    let completions = completions.lock().unwrap();
    assert_eq!(completions.len(), 1);
    assert!(completions[0].result.is_ok());
    assert!(completions[0].final_path.as_ref().unwrap().join("manifest").exists());
}

#[tokio::test]
async fn progress_is_monotonic_across_fallback() {
    let root = TempDir::new().unwrap();
    let transport = FakeTransport::new();
    transport.respond(META_URL, Response::Body(discovery_document()));
    transport.respond(ASSET_URL, Response::Body(aci_archive()));

    let values = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let values = Arc::clone(&values);
        move |percent: u32| values.lock().unwrap().push(percent)
    };

    let (pull, _completions) = new_pull(root.path(), &transport);
    let mut pull = pull.with_progress_sink(Box::new(sink));
    pull.start(NAME, VERSION, None, false).unwrap();
    pull.run().await;

    let values = values.lock().unwrap();
    assert!(values.windows(2).all(|w| w[0] <= w[1]), "{values:?}");
    assert!(values.contains(&55));
    assert_eq!(values.last(), Some(&95));
    assert_eq!(pull.progress(), Some(95));
}

#[tokio::test]
async fn corrupt_download_is_terminal() {
    let root = TempDir::new().unwrap();
    let transport = FakeTransport::new();
    transport.respond(META_URL, Response::Body(discovery_document()));
    transport.respond(ASSET_URL, Response::Body(b"not an archive".repeat(64)));

    let (mut pull, completions) = new_pull(root.path(), &transport);
    pull.start(NAME, VERSION, None, false).unwrap();
    pull.run().await;

    // tar either rejects the stream after reading it or exits while it is
    // still being written.
    let completions = completions.lock().unwrap();
    assert!(matches!(
        completions[0].result,
        Err(PullError::ChildProcessFailure(_))
            | Err(PullError::Network(TransferError::Write(_)))
    ));
    assert_eq!(transport.requests(), vec![SIMPLE_URL, META_URL, ASSET_URL]);
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn staging_failure_falls_back_to_meta_discovery() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, "x").unwrap();
    let root = blocker.join("machines");

    let transport = FakeTransport::new();
    transport.respond(SIMPLE_URL, Response::Body(aci_archive()));

    let (mut pull, completions) = new_pull(&root, &transport);
    pull.start(NAME, VERSION, None, false).unwrap();
    pull.run().await;

    // The local failure only ends simple discovery; the reported error is
    // the one meta discovery ran into.
    let completions = completions.lock().unwrap();
    assert_eq!(completions.len(), 1);
    assert!(matches!(
        completions[0].result,
        Err(PullError::Network(TransferError::Status(404)))
    ));
    assert_eq!(transport.requests(), vec![SIMPLE_URL, META_URL]);
}

#[tokio::test]
async fn without_callback_the_loop_exits_with_the_result() {
    let root = TempDir::new().unwrap();
    let transport = FakeTransport::new();
    let event_loop = EventLoop::current().unwrap();

    let mut pull = AciPull::new(Some(event_loop.clone()), Some(root.path()), None)
        .unwrap()
        .with_config(config())
        .with_transport(transport.clone());
    pull.start(NAME, VERSION, None, false).unwrap();
    pull.run().await;

    assert_eq!(event_loop.wait().await, Errno::ENOMEDIUM as i32);

    let event_loop = EventLoop::current().unwrap();
    transport.respond(SIMPLE_URL, Response::Body(aci_archive()));
    let mut pull = AciPull::new(Some(event_loop.clone()), Some(root.path()), None)
        .unwrap()
        .with_config(config())
        .with_transport(transport);
    pull.start(NAME, VERSION, None, false).unwrap();
    pull.run().await;

    assert_eq!(event_loop.exit_code(), Some(0));
}
