//! Shared helpers
//!
//! - **[`serde`]**: millisecond (de)serialisation for configuration durations

pub mod serde;

pub use self::serde::{duration_millis, option_duration_millis};
