pub mod candles;
pub mod clock;
pub mod config;
pub mod deriver;
pub mod error;
pub mod metrics;
pub mod models;
pub mod registry;
pub mod resolution;
pub mod source;
pub mod store;
pub mod sync;

pub use error::{IndexerError, IndexerResult};
