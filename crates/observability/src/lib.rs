//! Shared logging setup for binaries and tests.

pub mod logging;

pub use logging::{init, init_with_default};
