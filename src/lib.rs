//! A pauseless, concurrent, generational, region-based garbage collector heap.
//!
//! The crate manages a reserved virtual address range split into three page spaces (small, mid and
//! large objects), three generations on top of them (new, old and perm), and the relocation engine that
//! compacts sparse pages while mutators keep running. Mutators see relocated objects through a read
//! barrier that consults a double-buffered trap array; the collectors flip that array, and the
//! not-marked-through bits, only at short safepoints.
//!
//! The entry point is [`HeapContext`], which owns every component. The object model and the marking
//! machinery are external collaborators, plugged in through [`vm::ObjectModel`] and
//! [`collector::CollectionHooks`].

#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate static_assertions;

pub mod collector;
pub mod policy;
pub mod relocation;
pub mod util;
pub mod vm;

pub use crate::policy::space::{HeapContext, HeapError};
pub use crate::util::heap::layout::PageNum;
pub use crate::util::heap::page_info::{Gen, PageState};
pub use crate::util::options::Options;
pub use crate::util::worker::WorkerContext;
pub use crate::util::Address;
