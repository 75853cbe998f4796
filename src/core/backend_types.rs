//! Backend type definitions
//!
//! This module names the backend families the bridge adapts and the capabilities each one
//! can honestly guarantee.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Supported backend families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BackendKind {
    /// Raw SQL over an embedded relational engine
    RelationalRaw = 1,
    /// Typed tables with live queries over a relational engine
    RelationalReactive = 2,
    /// Typed object store with integer ids
    EmbeddedObject = 3,
    /// Schemaless key-value boxes
    EmbeddedKeyValue = 4,
    /// Platform secret vault
    SecureKeyValue = 5,
}

impl BackendKind {
    /// Convert backend kind to string representation
    pub fn to_str(&self) -> &'static str {
        match self {
            BackendKind::RelationalRaw => "relational-raw",
            BackendKind::RelationalReactive => "relational-reactive",
            BackendKind::EmbeddedObject => "embedded-object",
            BackendKind::EmbeddedKeyValue => "embedded-keyvalue",
            BackendKind::SecureKeyValue => "secure-keyvalue",
        }
    }

    /// Check if this backend speaks SQL
    pub fn is_relational(&self) -> bool {
        matches!(
            self,
            BackendKind::RelationalRaw | BackendKind::RelationalReactive
        )
    }

    /// Check if this backend is a key-value store
    pub fn is_key_value(&self) -> bool {
        matches!(
            self,
            BackendKind::EmbeddedKeyValue | BackendKind::SecureKeyValue
        )
    }

    /// Capabilities every adapter of this family provides
    pub fn capabilities(&self) -> Capabilities {
        match self {
            BackendKind::RelationalRaw => Capabilities {
                transactions: true,
                change_notification: false,
                aggregation: true,
                atomic_batches: true,
            },
            BackendKind::RelationalReactive | BackendKind::EmbeddedObject => Capabilities {
                transactions: true,
                change_notification: true,
                aggregation: true,
                atomic_batches: true,
            },
            BackendKind::EmbeddedKeyValue => Capabilities {
                transactions: false,
                change_notification: true,
                aggregation: false,
                atomic_batches: true,
            },
            BackendKind::SecureKeyValue => Capabilities {
                transactions: false,
                change_notification: false,
                aggregation: false,
                atomic_batches: false,
            },
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "relational-raw" | "sqlite" | "sql" => Ok(BackendKind::RelationalRaw),
            "relational-reactive" | "reactive-sql" => Ok(BackendKind::RelationalReactive),
            "embedded-object" | "object" => Ok(BackendKind::EmbeddedObject),
            "embedded-keyvalue" | "keyvalue" | "kv" => Ok(BackendKind::EmbeddedKeyValue),
            "secure-keyvalue" | "secure" | "vault" => Ok(BackendKind::SecureKeyValue),
            _ => Err(format!("Invalid backend kind: '{}'", s)),
        }
    }
}

/// What an adapter can guarantee
///
/// Mirrors the capability traits: an adapter with `transactions` implements
/// `SupportsTransactions`, one with `change_notification` implements
/// `SupportsChangeNotification`, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    /// Native all-or-nothing multi-operation scopes
    pub transactions: bool,
    /// Mutation notifications for live queries
    pub change_notification: bool,
    /// Native or engine-backed grouped aggregation
    pub aggregation: bool,
    /// `write_many`/`delete_many` are all-or-nothing
    pub atomic_batches: bool,
}
