//! fm-core - File manager core for a content-management host
//!
//! This crate provides upload orchestration and content delivery with:
//! - Swappable object storage backends (local filesystem, S3-compatible)
//!   negotiated through capability flags
//! - Content sniffing and per-purpose upload policies
//! - A host connector port for file, variant and link metadata, with a redb
//!   reference implementation (ACID, MVCC, crash-safe)
//! - Redirect caching, link tracking and image variant generation
//! - REST API with multipart upload support

pub mod api;
pub mod cache;
pub mod config;
pub mod links;
pub mod object_store;
pub mod policy;
pub mod service;
pub mod sniff;
pub mod storage;
pub mod variants;
#[cfg(test)]
pub mod testutil;

use std::sync::Arc;

use config::Config;
use links::LinkTracker;
use object_store::LocalStore;
use service::FileService;

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub service: Arc<FileService>,
    pub links: LinkTracker,
    /// Set for the local backend; serves the signed `/_storage` endpoint.
    pub local_store: Option<Arc<LocalStore>>,
}
