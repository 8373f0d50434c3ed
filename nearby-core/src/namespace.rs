//! Service type: the shared namespace under which peers advertise and browse.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Longest accepted service type.
pub const MAX_SERVICE_TYPE_LEN: usize = 15;

/// Namespace used when none is configured.
pub const DEFAULT_SERVICE_TYPE: &str = "my-app";

/// Validated service type. 1-15 chars of `[a-z0-9-]`, at least one letter,
/// no hyphen at either end and no two hyphens in a row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceType(String);

impl ServiceType {
    pub fn new(name: &str) -> Result<Self, NamespaceError> {
        if name.is_empty() {
            return Err(NamespaceError::Empty);
        }
        if name.len() > MAX_SERVICE_TYPE_LEN {
            return Err(NamespaceError::TooLong(name.len()));
        }
        if let Some(c) = name
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
        {
            return Err(NamespaceError::InvalidChar(c));
        }
        if !name.chars().any(|c| c.is_ascii_lowercase()) {
            return Err(NamespaceError::NoLetter);
        }
        if name.starts_with('-') || name.ends_with('-') || name.contains("--") {
            return Err(NamespaceError::BadHyphen);
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ServiceType {
    fn default() -> Self {
        Self(DEFAULT_SERVICE_TYPE.to_string())
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ServiceType {
    type Error = NamespaceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<ServiceType> for String {
    fn from(value: ServiceType) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NamespaceError {
    #[error("service type is empty")]
    Empty,
    #[error("service type is {0} chars, max {MAX_SERVICE_TYPE_LEN}")]
    TooLong(usize),
    #[error("service type contains invalid character {0:?}")]
    InvalidChar(char),
    #[error("service type must contain at least one letter")]
    NoLetter,
    #[error("service type hyphens must be inner and not adjacent")]
    BadHyphen,
}
