//! Storage substrate: embedded relational store with a full-text index, a
//! parallel dense-vector index, numbered migrations, and the engine-wide
//! error taxonomy.
//!
//! The store is the single owner of all rows; references between rows are by
//! id. One writer at a time, enforced by the connection mutex; readers share
//! the same path.

pub mod db;
pub mod error;
pub mod migrations;
pub mod rows;
pub mod types;
pub mod vector;

pub use db::Database;
pub use error::{EngramError, Result};
pub use vector::VectorIndex;

use sha2::{Digest, Sha256};

/// Content hash used for message-body de-duplication diagnostics.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
