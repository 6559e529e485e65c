// Library interface for promptd
// The `prompt` and `promptd` binaries, the benchmarks and the integration
// tests all go through these modules.

pub mod config;
pub mod daemon;
pub mod environment;
pub mod error;
pub mod logging;
pub mod render;
pub mod segments;
pub mod template;

pub use error::{Error, Result};
