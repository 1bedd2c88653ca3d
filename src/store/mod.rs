//! Durable-store plumbing shared by the Job Store and the Mailbox Store.
//!
//! Both collaborators expose the same minimal contract: get/put by primary
//! key, a version-checked conditional put, secondary lookups, and a change
//! feed that delivers `(old, new)` images ordered per key. [`MemoryTable`]
//! provides that contract in process.

pub mod memory;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use memory::{MemoryTable, WriteConflict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert,
    Modify,
    Remove,
}

/// One row change as seen by a change-feed consumer.
#[derive(Debug, Clone)]
pub struct Change<T> {
    pub kind: ChangeKind,
    pub old: Option<T>,
    pub new: Option<T>,
}

impl<T> Change<T> {
    pub fn insert(new: T) -> Self {
        Self {
            kind: ChangeKind::Insert,
            old: None,
            new: Some(new),
        }
    }

    pub fn modify(old: T, new: T) -> Self {
        Self {
            kind: ChangeKind::Modify,
            old: Some(old),
            new: Some(new),
        }
    }

    pub fn remove(old: T) -> Self {
        Self {
            kind: ChangeKind::Remove,
            old: Some(old),
            new: None,
        }
    }
}

/// Unbounded so a slow consumer never drops changes; batching happens on the
/// consumer side.
pub type ChangeFeed<T> = mpsc::UnboundedReceiver<Change<T>>;

/// Rows carrying a store-managed optimistic-concurrency counter.
pub trait Versioned {
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
}

#[derive(Debug, Clone)]
pub struct PageRequest {
    pub limit: usize,
    /// Exclusive start key returned by the previous page.
    pub start_after: Option<String>,
}

impl PageRequest {
    pub fn first(limit: usize) -> Self {
        Self {
            limit,
            start_after: None,
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::first(100)
    }
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Key to resume from, `None` on the last page.
    pub next: Option<String>,
}
