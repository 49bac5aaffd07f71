//! Prelude module - Commonly used types for quick imports
//!
//! This module re-exports the most commonly used types from Bucketron,
//! allowing users to import them with a single `use bucketron::prelude::*;`
//! statement instead of importing each type individually.

// Core types - always available
pub use crate::bucket::{BucketParams, BucketSpec};
pub use crate::client::Bucketron;
pub use crate::config::{BreakerOptions, LimiterOptions, PingOptions, RetryOptions};
pub use crate::engine::{
    GetParams, GetResult, PutCount, PutParams, PutResult, TakeCount, TakeParams, TakeResult,
};
pub use crate::error::{BucketronError, ValidationCode};
pub use crate::store::{BucketStore, LimiterEvent, PingReport, PingStatus};
