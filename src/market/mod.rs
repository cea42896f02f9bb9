//! Market data interface.
//!
//! - `types`: bars, quotes, option contracts and raw Greeks
//! - `traits`: the `MarketDataProvider` seam
//! - `mock`: in-memory provider for paper mode and tests
//! - `paper`: simulated price walk feeding the mock provider

pub mod mock;
mod paper;
mod traits;
mod types;

pub use mock::MockMarketData;
pub use paper::PaperFeed;
pub use traits::MarketDataProvider;
pub use types::*;
