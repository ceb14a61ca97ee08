//! Common test utilities for engine integration tests.

pub mod engine;
pub mod faulty;
pub mod racing;

#[allow(unused_imports)]
pub use engine::*;
#[allow(unused_imports)]
pub use faulty::*;
#[allow(unused_imports)]
pub use racing::*;
