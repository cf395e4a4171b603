//! CLI command implementations

pub mod cache;
pub mod config;
pub mod files;

pub use cache::execute as cache;
pub use config::execute as config;
pub use files::{cat, cp, fetch, ls, mkdir, mv, rm, stat};
