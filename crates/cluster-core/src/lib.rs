//! Shared data model for the write-path routing and ingestion core.
//!
//! This crate has no async dependency and no opinion on transport or
//! storage; it only defines the vocabulary (`SeriesName`, `Value`, pool/
//! server identity, the decode error taxonomy, and the process-scoped
//! `ErrorBus`) that the decoder, router, repacker, dispatcher, and local
//! apply stages all share.

pub mod error;
pub mod error_bus;
pub mod flags;
pub mod ids;
pub mod series_name;
pub mod time;
pub mod value;

pub use error::{Critical, DecodeError};
pub use error_bus::ErrorBus;
pub use flags::JobFlags;
pub use ids::{PoolId, ServerId};
pub use series_name::{SeriesName, SERIES_NAME_MAX};
pub use time::{TimePrecision, TimeUnit};
pub use value::{Value, ValueType};
