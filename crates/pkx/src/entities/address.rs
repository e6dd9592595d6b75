//! 📮 Addresses: `"<kind>:<author>:<dTag>"`.
//!
//! The identity of an addressable entity, a map key, and the reference value other
//! records embed in their `a` tags. Three jobs, one string.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("💀 address '{0}' needs three ':'-separated parts")]
    MissingParts(String),
    #[error("💀 address '{0}' has a kind that isn't a number")]
    BadKind(String),
    #[error("💀 address '{0}' has an empty author")]
    EmptyAuthor(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    pub kind: u32,
    pub author: String,
    pub d_tag: String,
}

impl Address {
    pub fn new(kind: u32, author: impl Into<String>, d_tag: impl Into<String>) -> Self {
        Self {
            kind,
            author: author.into(),
            d_tag: d_tag.into(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.author, self.d_tag)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    /// The d-tag is everything after the second ':', colons and all.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut parts = raw.splitn(3, ':');
        let (Some(kind), Some(author), Some(d_tag)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(AddressError::MissingParts(raw.to_string()));
        };
        let kind = kind
            .parse()
            .map_err(|_| AddressError::BadKind(raw.to_string()))?;
        if author.is_empty() {
            return Err(AddressError::EmptyAuthor(raw.to_string()));
        }
        Ok(Address::new(kind, author, d_tag))
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}
