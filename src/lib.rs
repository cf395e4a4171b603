//! gfs - Generic filesystem access with a local block cache
//!
//! One set of file operations over local paths, HTTP(S), FTP, S3 and
//! Google Cloud Storage. Remote reads go through a block-addressable
//! on-disk cache shared safely between processes.

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod facade;
pub mod fs;

pub use error::{GfsError, GfsResult};
pub use facade::{global, init, Gfs};
pub use fs::{DirEntry, FileStat, FileSystem, OpenMode};
