//! Feed ingestion daemon library.
//!
//! Polls RSS/Atom sources on a per-source schedule, parses them into item
//! drafts, reconciles those against what is stored, and keeps one article per
//! item in SQLite without ever overwriting caller-owned labels.
//!
//! - [`config`] - TOML configuration
//! - [`feed`] - HTTP fetcher and RSS/Atom parser
//! - [`reconcile`] - identity keys and the insert/update plan for a poll
//! - [`scheduler`] - coordinator task, backoff, poll pipeline
//! - [`storage`] - SQLite store for sources, categories, articles and labels
//! - [`util`] - text and URL normalization

pub mod config;
pub mod feed;
pub mod reconcile;
pub mod scheduler;
pub mod storage;
pub mod util;
