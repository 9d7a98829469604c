//! Discovery of library files on disk.

pub mod scanner;

pub use scanner::{fingerprint_file, scan_directory, ScanOptions, ScanReport};
