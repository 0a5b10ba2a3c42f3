//! Persistent, bounded-concurrency music download queue.
//!
//! Producers hand song mids to the [`downloader::manager::DownloadManager`],
//! a fixed pool of [`downloader::worker`] tasks resolves each one to a
//! download URL (trying quality tiers in priority order) and streams it to
//! disk, and every state transition is persisted so a crash never loses a
//! task. When the upstream account is rate limited, tasks park in
//! `waiting_for_retry` until the [`downloader::scheduler::CooldownScheduler`]
//! re-enqueues them.

pub mod config;
pub mod credentials;
pub mod downloader;
pub mod errors;
pub mod notify;
pub mod provider;
pub mod utils;
