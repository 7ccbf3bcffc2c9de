//! Routing keys and priorities.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::params::ValidationError;

/// Highest allowed job priority.
pub const MAX_PRIORITY: u8 = 10;
/// Priority assigned when the submitter does not specify one.
pub const DEFAULT_PRIORITY: u8 = 5;

/// Queue a job is visible to.
///
/// `High`/`Low` jobs are visible only to worker pools subscribed to that
/// key. `All` jobs are visible to every pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoutingKey {
    High,
    Low,
    #[default]
    All,
}

impl RoutingKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingKey::High => "high",
            RoutingKey::Low => "low",
            RoutingKey::All => "all",
        }
    }

    /// All routing keys, in a stable order.
    pub fn all_keys() -> [RoutingKey; 3] {
        [RoutingKey::High, RoutingKey::Low, RoutingKey::All]
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RoutingKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Accept both the bare form and the dotted queue-name form.
        match s.trim_start_matches("video.") {
            "high" => Ok(RoutingKey::High),
            "low" => Ok(RoutingKey::Low),
            "all" => Ok(RoutingKey::All),
            other => Err(ValidationError::InvalidRoutingKey(other.to_string())),
        }
    }
}

/// Validate a submitted priority.
pub fn validate_priority(priority: u8) -> Result<(), ValidationError> {
    if priority > MAX_PRIORITY {
        return Err(ValidationError::InvalidPriority(priority));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_key_parses_both_forms() {
        assert_eq!("high".parse::<RoutingKey>().unwrap(), RoutingKey::High);
        assert_eq!("video.low".parse::<RoutingKey>().unwrap(), RoutingKey::Low);
        assert_eq!("video.all".parse::<RoutingKey>().unwrap(), RoutingKey::All);
        assert!("medium".parse::<RoutingKey>().is_err());
    }

    #[test]
    fn priority_bounds() {
        assert!(validate_priority(0).is_ok());
        assert!(validate_priority(MAX_PRIORITY).is_ok());
        assert!(validate_priority(11).is_err());
    }
}
