//! Local copies of installed images.

use crate::error::{PullError, Result};
use crate::staging::{self, run_command};
use crate::validation::machine_name_is_valid;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::info;

/// Create `<image_root>/<local_name>` as a copy of the installed image at
/// `source`.
///
/// Snapshots btrfs subvolumes and falls back to `cp -a --reflink=auto`. An
/// existing local image is replaced only with `force`.
pub async fn materialize(
    source: &Path,
    image_root: &Path,
    local_name: &str,
    force: bool,
) -> Result<PathBuf> {
    if !machine_name_is_valid(local_name) {
        return Err(PullError::InvalidArgument(format!(
            "Invalid local image name: {local_name}"
        )));
    }

    let target = image_root.join(local_name);

    if tokio::fs::symlink_metadata(&target).await.is_ok() {
        if !force {
            return Err(PullError::AlreadyExists(target));
        }
        info!(path = %target.display(), "Replacing existing local image");
        staging::discard(&target);
    }

    if staging::is_subvolume(source) {
        run_command(
            "btrfs",
            [
                OsStr::new("subvolume"),
                OsStr::new("snapshot"),
                source.as_os_str(),
                target.as_os_str(),
            ],
        )
        .await?;
    } else {
        run_command(
            "cp",
            [
                OsStr::new("-a"),
                OsStr::new("--reflink=auto"),
                source.as_os_str(),
                target.as_os_str(),
            ],
        )
        .await?;
    }

    info!(source = %source.display(), path = %target.display(), "Created local image");
    Ok(target)
}
