//! Core domain types and shared logic for the vault blob store.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Content hashes and incremental hashing
//! - Media type sniffing from a bounded content prefix
//! - Shared configuration for storage, metadata and the engine

pub mod config;
pub mod error;
pub mod hash;
pub mod media_type;

pub use error::{Error, Result};
pub use hash::{ContentHash, ContentHasher};
pub use media_type::{MediaType, sniff};

/// Number of leading bytes inspected when sniffing a media type.
pub const DEFAULT_SNIFF_LEN: usize = 512;

/// Default buffer size for streaming payloads: 64 KiB
pub const DEFAULT_STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Smallest accepted streaming buffer: 4 KiB
pub const MIN_STREAM_BUFFER_SIZE: usize = 4 * 1024;

/// Largest accepted streaming buffer: 8 MiB
pub const MAX_STREAM_BUFFER_SIZE: usize = 8 * 1024 * 1024;
