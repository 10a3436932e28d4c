//! Feed retrieval and parsing.
//!
//! - [`fetcher`] - HTTP retrieval with conditional requests, retry with
//!   exponential delay, and response size limits
//! - [`parser`] - RSS/Atom documents to normalized [`ItemDraft`]s via `feed-rs`
//!
//! Neither half touches the store; the scheduler pipeline wires them to it.
//!
//! # Example
//!
//! ```no_run
//! use forager::config::FetcherConfig;
//! use forager::feed::{parse_feed, FetchOutcome, Fetcher};
//! use forager::storage::CacheHints;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let fetcher = Fetcher::new(&FetcherConfig::default())?;
//! let url = "https://example.com/feed.xml";
//! if let FetchOutcome::Fetched(payload) = fetcher.fetch(url, &CacheHints::default()).await? {
//!     let parsed = parse_feed(&payload.bytes, payload.content_type.as_deref(), Some(url))?;
//!     for draft in parsed.drafts() {
//!         println!("{}", draft.title);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod fetcher;
pub mod parser;

pub use fetcher::{FetchError, FetchOutcome, Fetcher, RawPayload};
pub use parser::{parse_feed, FeedFormat, ItemDraft, ParseError, ParsedFeed};
