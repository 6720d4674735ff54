//! Identifier resolution.
//!
//! The source's URL scheme is unstable, so each (entity, period) pair is
//! mapped to the source's instrument identifier by trying a prioritized list
//! of candidate pages and reading the identifier out of the page's embedded
//! state. The URL that worked last time is remembered in a side file and
//! tried first.

mod candidates;
mod payload;
mod resolver;
mod url_cache;

pub use candidates::{candidate_urls, promote_cached, source_name};
pub use payload::{extract_instrument_id, PayloadError};
pub use resolver::{IdentifierResolver, Resolution, ResolveError};
pub use url_cache::{CachedUrl, UrlCache, UrlCacheError};
