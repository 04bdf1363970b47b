//! Data structures used throughout the broker.
//!
//! These types are serialised using [`serde`](https://serde.rs/) and
//! carried over the peer protocol.  They represent registered services
//! and the queued operations each peer connection still has to deliver.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A registered service: a logical name and the location where it can be
/// reached.  Two entries are equal only if both fields match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    pub location: String,
}

impl ServiceEntry {
    pub fn new(name: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: location.into(),
        }
    }
}

impl fmt::Display for ServiceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.name, self.location)
    }
}

/// A directive queued on one peer connection.
///
/// Each peer keeps these in FIFO order; an `Add` followed by a `Remove`
/// for the same name must reach the peer in that order, since the peer has
/// no other way to notice the add went stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingOp {
    Add(ServiceEntry),
    Remove(ServiceEntry),
}

/// Identity of a configured peer broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSpec {
    pub name: String,
    pub location: String,
}

impl PeerSpec {
    pub fn new(name: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: location.into(),
        }
    }
}

/// A change requested through the local registration surface.
#[derive(Debug, Clone)]
pub enum Update {
    /// Register `entry` as owned by this node.
    Add(ServiceEntry),
    /// Drop the owned registration of `entry`, if its location still matches.
    Remove(ServiceEntry),
}
