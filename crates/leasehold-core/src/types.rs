use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Longest task or mutex name accepted as a primary key.
pub const MAX_NAME_LEN: usize = 255;

/// Opaque lease token identifying one holder's claim on a mutex or task run.
///
/// Compared by value only. A fresh ticket is minted for every acquisition
/// attempt; keeping the same ticket is how a holder renews.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ticket(pub String);

impl Ticket {
    /// Random 32-character hex token.
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Ticket {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Ticket {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Ticket {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifies one scheduler process in logs (UUIDv7, time-sortable).
///
/// Never persisted as a lock owner; ownership is carried by tickets alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Check that `name` is usable as a task or mutex primary key.
pub fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(CoreError::InvalidId("name must not be empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(CoreError::InvalidId(format!(
            "name longer than {MAX_NAME_LEN} bytes: {name}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_tickets_differ() {
        let a = Ticket::new();
        let b = Ticket::new();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn tickets_compare_by_value() {
        let a = Ticket::from("abc");
        let b = Ticket::from("abc".to_string());
        assert_eq!(a, b);
    }

    #[test]
    fn empty_and_oversized_names_rejected() {
        assert!(validate_name("").is_err());
        assert!(validate_name("   ").is_err());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
        assert!(validate_name("catalog-refresh").is_ok());
    }
}
