//! The allocation trap and the pieces it is made of.

pub mod lock;
pub mod nest;
pub mod passthrough;
pub mod policy;
pub mod real;
pub mod registry;
pub mod resolve;
pub mod sanitize;
pub mod trap;
