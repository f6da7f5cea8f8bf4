//! Identifier types used throughout the keyserver.
//!
//! User IDs follow the federated `@localpart:server.name` form, so the
//! owning server of any user can be derived from the ID itself.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Name of a homeserver taking part in federation (e.g. `example.org:8448`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerName(String);

impl ServerName {
    /// Parses and validates a server name.
    pub fn parse(s: &str) -> Result<Self, Error> {
        if s.is_empty()
            || s.len() > 255
            || s.chars().any(|c| c.is_whitespace() || c == '/' || c == '@')
        {
            return Err(Error::InvalidServerName(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// Returns the server name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ServerName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ServerName {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<ServerName> for String {
    fn from(name: ServerName) -> Self {
        name.0
    }
}

/// Fully-qualified user identifier, `@localpart:server.name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId {
    full: String,
    colon: usize,
}

impl UserId {
    /// Parses and validates a user ID.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let rest = s
            .strip_prefix('@')
            .ok_or_else(|| Error::InvalidUserId(s.to_string()))?;
        let colon = rest
            .find(':')
            .ok_or_else(|| Error::InvalidUserId(s.to_string()))?;
        let (localpart, server) = (&rest[..colon], &rest[colon + 1..]);
        if localpart.is_empty() || localpart.chars().any(char::is_whitespace) {
            return Err(Error::InvalidUserId(s.to_string()));
        }
        ServerName::parse(server).map_err(|_| Error::InvalidUserId(s.to_string()))?;
        Ok(Self {
            full: s.to_string(),
            colon: colon + 1,
        })
    }

    /// Returns the localpart (between `@` and the first `:`).
    pub fn localpart(&self) -> &str {
        &self.full[1..self.colon]
    }

    /// Returns the server the user belongs to.
    pub fn server_name(&self) -> ServerName {
        ServerName(self.full[self.colon + 1..].to_string())
    }

    /// Returns the full user ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.full
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

impl FromStr for UserId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for UserId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.full
    }
}

/// Identifier of a single device belonging to a user.
///
/// Ordered lexicographically; change records for one user are emitted in
/// this order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    /// Creates a device ID, rejecting empty strings.
    pub fn new(s: impl Into<String>) -> Result<Self, Error> {
        let s = s.into();
        if s.is_empty() || s.chars().any(char::is_control) {
            return Err(Error::InvalidDeviceId(s));
        }
        Ok(Self(s))
    }

    /// Returns the device ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for DeviceId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}
