//! CLI command implementations

pub mod clear;
pub mod config;
pub mod refresh;
pub mod stats;

pub use clear::execute as clear;
pub use config::execute as config;
pub use refresh::execute as refresh;
pub use stats::execute as stats;
