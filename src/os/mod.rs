//! OS-level file access.

pub mod file;

pub use file::FileIo;
