//! mvirt-pull - ACI image puller.
//!
//! Fetches an App Container Image by name and version label, streams it
//! through an extractor child process into a staging directory and installs
//! it into the local machine image store.
//!
//! ## Architecture
//!
//! - **Pull Context** ([`AciPull`]): drives discovery, download and install
//! - **State Machine** ([`state`]): pure phase transitions
//! - **Transfer Jobs** ([`transfer`]): single-URL fetches on the event loop
//! - **Extractor** ([`extractor`]): supervised unpacking child process
//! - **Staging** ([`staging`]): temporary and final image directories
//!
//! ## Discovery
//!
//! Simple discovery tries `https://{name}-{version}-{os}-{arch}.aci` first.
//! If that fails remotely, meta discovery fetches `https://{name}?ac-discovery=1`
//! and downloads the asset its `ac-discovery` template points to.

pub mod discovery;
pub mod error;
pub mod event_loop;
pub mod extractor;
pub mod local;
pub mod progress;
pub mod pull;
pub mod staging;
pub mod state;
pub mod transfer;
pub mod validation;

pub use error::{PullError, Result, TransferError};
pub use event_loop::EventLoop;
pub use pull::{AciPull, OnFinished, PullConfig};
