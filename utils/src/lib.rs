#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

pub mod fs;

pub use fs::normalize_path;
