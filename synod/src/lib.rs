#![deny(unused_must_use)]

//! Glue that keeps one consensus ensemble's live membership consistent with
//! one shared registry held in a watched key-value store.

mod error;
pub use error::Error;

/// Server records and their textual encodings.
pub mod server;

/// Watched key-value store abstraction and the in-memory implementation.
pub mod store;

/// Registry of ensemble members backed by the store.
pub mod registry;

/// Change-watcher turning the store's long-poll into add/remove callbacks.
pub mod watcher;

/// Atomic unique-id allocation from the store.
pub mod idgen;

/// Reconciliation of live ensemble membership against the registry.
pub mod reconcile;

/// Node-side identity acquisition, registration and the startup barrier.
pub mod node;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Identifier of an ensemble member. Positive and unique across the registry.
pub type ServerId = u32;

/// Sequence number of a change in the store.
pub type ChangeIndex = u64;

/// A validated bare host: an IPv4 literal or a DNS hostname.
///
/// Ports, schemes and paths are rejected. IPv6 literals are not accepted
/// because the colon-delimited server line (see [`server::ServerRecord`])
/// cannot represent them unambiguously.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize, derive_more::Display)]
#[serde(try_from = "String", into = "String")]
pub struct HostAddress(String);

impl HostAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for HostAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.parse::<std::net::Ipv4Addr>().is_ok() {
            return Ok(Self(s.to_owned()));
        }
        if valid_hostname(s) {
            return Ok(Self(s.to_owned()));
        }
        Err(Error::Malformed {
            what: "host address".to_owned(),
            reason: format!("'{s}' is not a bare hostname or IPv4 literal"),
        })
    }
}

impl TryFrom<String> for HostAddress {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Error> {
        s.parse()
    }
}

impl From<HostAddress> for String {
    fn from(addr: HostAddress) -> String {
        addr.0
    }
}

fn valid_hostname(s: &str) -> bool {
    if s.is_empty() || s.len() > 253 {
        return false;
    }
    s.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// Layout of the key namespaces this crate uses inside the store.
///
/// Everything lives under a single root so that several unrelated ensembles
/// can share one store without stepping on each other.
#[derive(Clone, Debug)]
pub struct StoreLayout {
    root: String,
}

impl StoreLayout {
    pub fn new(root: impl Into<String>) -> Self {
        let root = root.into();
        let root = root.trim_matches('/').to_owned();
        Self { root }
    }

    /// Directory of registered servers, one entry per member id.
    pub fn servers_dir(&self) -> String {
        format!("{}/servers", self.root)
    }

    pub fn server_key(&self, id: ServerId) -> String {
        format!("{}/servers/{id}", self.root)
    }

    /// Identity index mapping a node's address to its allocated id.
    pub fn ids_dir(&self) -> String {
        format!("{}/ids", self.root)
    }

    pub fn id_key(&self, address: &HostAddress) -> String {
        format!("{}/ids/{}", self.root, address)
    }

    /// Scratch directory for atomically minted id names.
    pub fn idgen_dir(&self) -> String {
        format!("{}/idgen", self.root)
    }

    /// One-shot startup state key.
    pub fn state_key(&self) -> String {
        format!("{}/state", self.root)
    }
}

impl Default for StoreLayout {
    fn default() -> Self {
        Self::new("synod/ensemble")
    }
}

/// Extract the last path segment of a store key.
pub(crate) fn key_suffix(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Parse an id from the last path segment of a store key.
pub(crate) fn id_from_key(key: &str) -> Result<ServerId, Error> {
    key_suffix(key).parse().map_err(|_| Error::Malformed {
        what: "store key".to_owned(),
        reason: format!("'{key}' does not end in a numeric id"),
    })
}
