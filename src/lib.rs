//! This crate presents a single object/file API over heterogeneous storage
//! backends: S3-compatible services, Azure Blob, Google Cloud Storage,
//! Oracle Cloud, NVIDIA AIStore, and POSIX file systems. Callers address
//! data by a profile-scoped URL of the form `msc://{profile}/{key}`; the
//! library resolves the profile to a concrete backend, translates paths,
//! authenticates requests, optionally accelerates listings with
//! pre-generated manifests, and optionally caches object bodies on local
//! disk or a fast secondary store.
//!
//! Profiles are declared in a YAML or JSON configuration discovered from
//! `$MSC_CONFIG`, `/etc/msc_config.yaml`, `~/.config/msc/config.yaml`, or
//! `~/.msc_config.yaml`; rclone INI remotes are picked up as profiles too.
//! Without any configuration the crate still serves POSIX paths through the
//! predefined `default` profile rooted at `/`.
//!
//! # Quickstart
//! Add the following line to your `Cargo.toml`
//! ```toml
//! [dependencies]
//! multi-storage-client = "1.0"
//! ```
//! The two most important concepts are profiles, which bind one set of
//! providers, and the [`StorageClient`], which exposes the unified
//! operation surface over one profile.
//!
//! ## Examples:
//! Reading and writing by URL through the global client registry:
//! ```no_run
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! multi_storage_client::write("msc://data/models/weights.bin", "tensor bytes").await?;
//! let body = multi_storage_client::read("msc://data/models/weights.bin").await?;
//! # Ok(())
//! # }
//! ```
//! Listing through a profile's client:
//! ```no_run
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = multi_storage_client::storage_client("data")?;
//! for entry in client.list("models/", true, false).await? {
//!     println!("{} ({} bytes)", entry.key, entry.content_length);
//! }
//! # Ok(())
//! # }
//! ```
//! Mirroring a prefix between profiles:
//! ```no_run
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let source = multi_storage_client::storage_client("lab")?;
//! let target = multi_storage_client::storage_client("archive")?;
//! target.sync_from(&source, "runs/", "runs/", true).await?;
//! # Ok(())
//! # }
//! ```
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod client;
pub mod config;
pub mod manifest;
pub mod models;
pub mod providers;
pub mod telemetry;

#[cfg(feature = "blocking")]
pub mod blocking;

// export time, so implementing libraries can use it
pub extern crate time;

mod error;
mod url;

#[cfg(feature = "global-client")]
mod global_client;

pub use crate::{
    client::{ObjectFile, OpenMode, StorageClient, StorageClientBuilder, SyncReport},
    config::Config,
    error::{Error, ErrorContext, Result},
    models::{ByteRange, ObjectMetadata, ObjectType},
    url::{MscUrl, PathMapping},
};

#[cfg(feature = "global-client")]
pub use crate::global_client::{
    delete, glob, info, list, open, read, resolve, storage_client, write,
};

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

const ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'*')
    .remove(b'-')
    .remove(b'.')
    .remove(b'_');
const NOSLASH_ENCODE_SET: &AsciiSet = &ENCODE_SET.remove(b'/').remove(b'~');

// We need to be able to percent encode object keys in request paths, but
// without touching the slashes in them. To this end we keep one set that
// leaves slashes alone.
pub(crate) fn percent_encode_noslash(input: &str) -> String {
    utf8_percent_encode(input, NOSLASH_ENCODE_SET).to_string()
}

pub(crate) fn percent_encode(input: &str) -> String {
    utf8_percent_encode(input, ENCODE_SET).to_string()
}

#[cfg(feature = "blocking")]
fn runtime() -> Result<tokio::runtime::Runtime, Error> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .thread_name("multi-storage-client-worker")
        .enable_time()
        .enable_io()
        .build()?)
}
