//! Duration fields in configuration documents are written as whole
//! milliseconds.
//!
//! ```rust
//! use std::time::Duration;
//!
//! use bulwark_resilience::utils::{duration_millis, option_duration_millis};
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Section {
//!     #[serde(with = "duration_millis")]
//!     timeout: Duration,
//!     #[serde(default, with = "option_duration_millis")]
//!     max_delay: Option<Duration>,
//! }
//!
//! let section: Section = toml::from_str("timeout = 250").expect("valid toml");
//! assert_eq!(section.timeout, Duration::from_millis(250));
//! assert!(section.max_delay.is_none());
//! ```

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

/// Serde serialization result type
type SerializeResult<S> = Result<<S as Serializer>::Ok, <S as Serializer>::Error>;

fn millis(duration: &Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// `Duration` as a millisecond count
pub mod duration_millis {
    use super::*;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> SerializeResult<S>
    where
        S: Serializer,
    {
        serializer.serialize_u64(millis(duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// `Option<Duration>` as an optional millisecond count
///
/// Pair with `#[serde(default)]` so an absent key reads as `None`.
pub mod option_duration_millis {
    use super::*;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> SerializeResult<S>
    where
        S: Serializer,
    {
        match duration {
            Some(duration) => serializer.serialize_some(&millis(duration)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
