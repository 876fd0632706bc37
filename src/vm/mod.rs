//! The interface to the runtime hosting the heap.

mod object_model;
pub use self::object_model::ObjectModel;
