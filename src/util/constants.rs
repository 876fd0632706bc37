/**
 * Primitive sizes
 */

pub const LOG_BYTES_IN_BYTE: u8 = 0;
pub const BYTES_IN_BYTE: usize = 1;
pub const LOG_BITS_IN_BYTE: u8 = 3;
pub const BITS_IN_BYTE: usize = 1 << LOG_BITS_IN_BYTE;

pub const LOG_BYTES_IN_KBYTE: u8 = 10;
pub const BYTES_IN_KBYTE: usize = 1 << LOG_BYTES_IN_KBYTE;

pub const LOG_BYTES_IN_MBYTE: u8 = 20;
pub const BYTES_IN_MBYTE: usize = 1 << LOG_BYTES_IN_MBYTE;

#[cfg(target_pointer_width = "64")]
pub const LOG_BYTES_IN_ADDRESS: u8 = 3;
pub const BYTES_IN_ADDRESS: usize = 1 << LOG_BYTES_IN_ADDRESS;

pub const LOG_BYTES_IN_WORD: u8 = LOG_BYTES_IN_ADDRESS;
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;
pub const LOG_BITS_IN_WORD: u8 = LOG_BITS_IN_BYTE + LOG_BYTES_IN_WORD;
pub const BITS_IN_WORD: usize = 1 << LOG_BITS_IN_WORD;

/// The granule the OS relocates and protects memory in. Mid-space objects are aligned to it so they
/// can be moved by remapping rather than copying.
pub const LOG_BYTES_IN_OS_PAGE: u8 = 12;
pub const BYTES_IN_OS_PAGE: usize = 1 << LOG_BYTES_IN_OS_PAGE;

/**
 * Heap geometry that does not depend on options
 */

/// Default page size: 2 MiB, the large-page size of the host.
pub const DEFAULT_LOG_BYTES_IN_PAGE: u8 = 21;
/// Mid-space blocks are 16 pages.
pub const LOG_PAGES_IN_MID_BLOCK: u8 = 4;
pub const PAGES_IN_MID_BLOCK: usize = 1 << LOG_PAGES_IN_MID_BLOCK;
/// Objects of at least this many pages are allocated in large space.
pub const LOG_LARGE_MIN_PAGES: u8 = 3;
pub const LARGE_MIN_PAGES: usize = 1 << LOG_LARGE_MIN_PAGES;
/// Objects of at least page/8 are allocated in mid space.
pub const LOG_MID_MIN_OBJECT_FRACTION: u8 = 3;

/// Card granule for old-to-new pointer tracking.
pub const LOG_BYTES_IN_CARD: u8 = 9;
pub const BYTES_IN_CARD: usize = 1 << LOG_BYTES_IN_CARD;

/// Max number of striped relocation slots per generation.
pub const MAX_RELOCATION_SLOTS: usize = 256;
/// CAS spin count above which the relocation slots expand.
pub const RELOCATION_SLOT_SPIN_LIMIT: usize = 5;

/// Entries kept per page in the page audit trail.
pub const PAGE_AUDIT_ENTRIES: usize = 64;
