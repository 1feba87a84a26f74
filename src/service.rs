use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const MAX_LEN: usize = 15;

/// Identifier shared by devices that should find each other.
///
/// Only devices advertising and browsing the same service id can see each
/// other. The format is the most restrictive one supported by the peer
/// transports:
/// - 1 to 15 characters
/// - ASCII lowercase letters, digits and hyphens only
/// - at least one letter
/// - no leading, trailing or adjacent hyphens
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceId(String);

impl ServiceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_valid(value: &str) -> bool {
        if value.is_empty() || value.len() > MAX_LEN {
            return false;
        }
        if value.starts_with('-')
            || value.ends_with('-')
            || value.contains("--")
        {
            return false;
        }
        let allowed = value
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
        allowed && value.bytes().any(|b| b.is_ascii_lowercase())
    }
}

impl FromStr for ServiceId {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        if Self::is_valid(value) {
            Ok(Self(value.to_string()))
        } else {
            Err(Error::InvalidServiceId(value.to_string()))
        }
    }
}

impl TryFrom<String> for ServiceId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl TryFrom<&str> for ServiceId {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        value.parse()
    }
}

impl From<ServiceId> for String {
    fn from(value: ServiceId) -> Self {
        value.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
