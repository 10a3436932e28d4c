//! Text and URL helpers shared by the parser, reconciler and storage layers.
//!
//! - **Text**: control-character stripping and whitespace normalization for
//!   titles and category names
//! - **URLs**: source URL validation plus the link cleaning/normalization used
//!   to derive stable identity keys
//!
//! # Examples
//!
//! ```
//! use forager::util::{normalize_link, normalize_title};
//!
//! assert_eq!(
//!     normalize_link("HTTPS://Example.com/post/?utm_source=rss#top"),
//!     "https://example.com/post"
//! );
//! assert_eq!(normalize_title("  Hello\n  World "), "hello world");
//! ```

mod text;
mod links;

pub use self::text::{collapse_whitespace, non_empty, normalize_title, strip_control_chars};
pub use self::links::{clean_link, normalize_link, validate_source_url, UrlValidationError};
