//! # Jobforge Testing Utils
//!
//! Shared testing utilities for the jobforge workspace: job builders,
//! scripted executors and fixed resource samplers.
//!
//! ## Usage
//!
//! Add this crate as a dev-dependency:
//!
//! ```toml
//! [dev-dependencies]
//! jobforge-testing-utils = { path = "../testing-utils" }
//! ```
//!
//! ```rust
//! use jobforge_testing_utils::{JobBuilder, ScriptedExecutor};
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

// Re-export commonly used items
pub use builders::*;
pub use helpers::*;
pub use mocks::*;
