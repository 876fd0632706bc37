/// An abstract address type and address arithmetic.
pub mod address;
/// Constants used throughout the crate.
pub mod constants;
/// Alignment and size conversion helpers.
pub mod conversions;
/// Page spaces and per-page bookkeeping.
pub mod heap;
/// The built-in logger.
pub mod logger;
/// Virtual memory primitives and the batched memory interface.
pub mod memory;
/// Side tables for marks and cards.
pub mod metadata;
/// Heap options, settable from environment variables.
pub mod options;
/// Per-thread contexts handed to allocation and relocation entry points.
pub mod worker;

/// Helpers for unit and integration tests.
#[doc(hidden)]
pub mod test_util;

pub use self::address::Address;
