//! Staging area management.
//!
//! A pull extracts into a hidden temporary directory next to the image store
//! and either promotes it to its content-addressed final path or discards it.
//! On btrfs the staging directory is a subvolume so local copies can be
//! snapshots.

use crate::error::{PullError, Result};
use crate::local;
use nix::sys::statfs::{BTRFS_SUPER_MAGIC, statfs};
use nix::sys::statvfs::statvfs;
use std::ffi::OsStr;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tokio::fs::DirBuilder;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default machine image store.
pub const DEFAULT_IMAGE_ROOT: &str = "/var/lib/machines";

/// Inode number of the root directory of every btrfs subvolume.
const BTRFS_SUBVOLUME_INODE: u64 = 256;

/// Free space below which the machine directory is grown.
const GROW_THRESHOLD_BYTES: u64 = 1024 * 1024 * 1024;

const TEMP_PREFIX: &str = ".#aci-";
const FINAL_PREFIX: &str = ".aci-";

/// Temporary and final paths of one pull.
///
/// Both paths are computed at most once and never change afterwards.
#[derive(Debug)]
pub struct StagingArea {
    image_root: PathBuf,
    temp_path: Option<PathBuf>,
    final_path: Option<PathBuf>,
}

impl StagingArea {
    pub fn new(image_root: impl Into<PathBuf>) -> Self {
        Self {
            image_root: image_root.into(),
            temp_path: None,
            final_path: None,
        }
    }

    pub fn image_root(&self) -> &Path {
        &self.image_root
    }

    /// Staging path, computed on first use.
    pub fn temp_path(&mut self) -> &Path {
        let image_root = &self.image_root;
        self.temp_path.get_or_insert_with(|| {
            image_root.join(format!("{TEMP_PREFIX}{}", Uuid::new_v4().simple()))
        })
    }

    pub fn existing_temp_path(&self) -> Option<&Path> {
        self.temp_path.as_deref()
    }

    /// Fix the final path from the content id. Later calls keep the first path.
    pub fn set_final_path(&mut self, id: &str) -> &Path {
        let image_root = &self.image_root;
        self.final_path
            .get_or_insert_with(|| image_root.join(format!("{FINAL_PREFIX}{id}")))
    }

    pub fn final_path(&self) -> Option<&Path> {
        self.final_path.as_deref()
    }

    /// Remove the staging directory, if one was ever computed.
    pub fn discard(&self) {
        if let Some(path) = &self.temp_path {
            discard(path);
        }
    }
}

/// Whether `path` lives on a btrfs filesystem.
pub fn is_btrfs(path: &Path) -> bool {
    statfs(path)
        .map(|stat| stat.filesystem_type() == BTRFS_SUPER_MAGIC)
        .unwrap_or(false)
}

/// Whether `path` is the root of a btrfs subvolume.
pub fn is_subvolume(path: &Path) -> bool {
    match std::fs::symlink_metadata(path) {
        Ok(meta) => meta.is_dir() && meta.ino() == BTRFS_SUBVOLUME_INODE && is_btrfs(path),
        Err(_) => false,
    }
}

/// Create the staging directory, with parents created mode 0700.
///
/// Creates a btrfs subvolume when the parent is on btrfs and falls back to a
/// plain directory otherwise.
pub async fn create_staging(path: &Path) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| PullError::InvalidArgument(format!("{} has no parent", path.display())))?;

    DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(parent)
        .await
        .map_err(|e| PullError::io(format!("Failed to create {}", parent.display()), e))?;

    if is_btrfs(parent) {
        let args = [OsStr::new("subvolume"), OsStr::new("create"), path.as_os_str()];
        match run_command("btrfs", args).await {
            Ok(()) => {
                debug!(path = %path.display(), "Created staging subvolume");
                return Ok(());
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to create subvolume, using a plain directory");
            }
        }
    }

    tokio::fs::create_dir(path)
        .await
        .map_err(|e| PullError::io(format!("Failed to create {}", path.display()), e))?;

    debug!(path = %path.display(), "Created staging directory");
    Ok(())
}

/// Remove a staging tree. Best-effort: errors are logged, a missing path is a
/// no-op.
///
/// Synchronous so it can run from `Drop`.
pub fn discard(path: &Path) {
    if is_subvolume(path) {
        match std::process::Command::new("btrfs")
            .args([OsStr::new("subvolume"), OsStr::new("delete"), path.as_os_str()])
            .output()
        {
            Ok(output) if output.status.success() => {
                debug!(path = %path.display(), "Deleted staging subvolume");
                return;
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!(path = %path.display(), stderr = %stderr.trim(), "btrfs subvolume delete failed");
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to run btrfs");
            }
        }
    }

    match std::fs::remove_dir_all(path) {
        Ok(()) => debug!(path = %path.display(), "Removed staging directory"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove staging directory"),
    }
}

/// Move a staged image to its final path and create the local copy, if any.
///
/// An image already present at `final_path` is kept and the staged copy dropped.
pub async fn promote(
    staged: &Path,
    final_path: &Path,
    image_root: &Path,
    local_name: Option<&str>,
    force: bool,
) -> Result<()> {
    let exists = tokio::fs::try_exists(final_path)
        .await
        .map_err(|e| PullError::io(format!("Failed to stat {}", final_path.display()), e))?;

    if exists {
        info!(path = %final_path.display(), "Image already present, keeping existing copy");
        discard(staged);
    } else {
        tokio::fs::rename(staged, final_path).await.map_err(|e| {
            PullError::io(
                format!(
                    "Failed to move {} to {}",
                    staged.display(),
                    final_path.display()
                ),
                e,
            )
        })?;
        info!(path = %final_path.display(), "Image installed");
    }

    if let Some(local_name) = local_name {
        local::materialize(final_path, image_root, local_name, force).await?;
    }

    Ok(())
}

/// Grow the filesystem behind the default machine directory when it runs low
/// on space. Best-effort.
pub async fn grow_machine_directory() {
    let root = Path::new(DEFAULT_IMAGE_ROOT);

    let available = match statvfs(root) {
        Ok(stat) => stat.blocks_available() as u64 * stat.fragment_size() as u64,
        Err(e) => {
            debug!(path = %root.display(), error = %e, "Cannot stat machine directory");
            return;
        }
    };

    if available >= GROW_THRESHOLD_BYTES || !is_btrfs(root) {
        return;
    }

    info!(available, "Growing machine directory");
    let args = [
        OsStr::new("filesystem"),
        OsStr::new("resize"),
        OsStr::new("max"),
        root.as_os_str(),
    ];
    if let Err(e) = run_command("btrfs", args).await {
        warn!(error = %e, "Failed to grow machine directory");
    }
}

/// Run a helper program to completion, failing on a non-zero exit.
pub(crate) async fn run_command<I, S>(program: &str, args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| PullError::io(format!("Failed to run {program}"), e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PullError::ChildProcessFailure(format!(
            "{program} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    Ok(())
}
