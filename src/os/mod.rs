//! The little bits of the operating system we need that must not allocate.

pub mod process;
pub mod thread;
