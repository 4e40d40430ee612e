//! Rate-limited access to the iNaturalist and Overpass APIs

mod fetcher;
mod rate_limiter;
mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use fetcher::{FetchOutcome, Fetched, Fetcher};
pub use rate_limiter::RateLimiter;
pub use transport::{ApiRequest, HttpTransport, Transport};
