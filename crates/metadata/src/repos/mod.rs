//! Repository traits for metadata operations.

pub mod payloads;
pub mod references;

pub use payloads::PayloadRepo;
pub use references::ReferenceRepo;
