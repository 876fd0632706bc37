//! The heap policy: generations on top of the page spaces, and the context that binds them.

pub mod generation;
pub mod space;
