//! Host plumbing: mount table, external process control, thermal zones.

pub mod mounts;
pub mod process;
pub mod thermal;
