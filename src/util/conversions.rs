use crate::util::constants::*;

/* Alignment */

pub const fn raw_align_up(val: usize, align: usize) -> usize {
    // See https://github.com/rust-lang/rust/blob/e620d0f337d0643c757bab791fc7d88d63217704/src/libcore/alloc.rs#L192
    val.wrapping_add(align).wrapping_sub(1) & !align.wrapping_sub(1)
}

pub const fn raw_align_down(val: usize, align: usize) -> usize {
    val & !align.wrapping_sub(1)
}

pub const fn raw_is_aligned(val: usize, align: usize) -> bool {
    val & align.wrapping_sub(1) == 0
}

/* Conversion */

pub const fn bytes_to_words_up(bytes: usize) -> usize {
    raw_align_up(bytes, BYTES_IN_WORD) >> LOG_BYTES_IN_WORD
}

pub const fn words_to_bytes(words: usize) -> usize {
    words << LOG_BYTES_IN_WORD
}

/// Round `words` up to a whole number of OS pages, expressed in words.
pub const fn words_align_up_to_os_page(words: usize) -> usize {
    raw_align_up(words_to_bytes(words), BYTES_IN_OS_PAGE) >> LOG_BYTES_IN_WORD
}

/// Number of bits needed to represent `n` (0 for 0).
pub const fn bits_needed(n: u64) -> u32 {
    u64::BITS - n.leading_zeros()
}

#[cfg(test)]
mod tests {
    use crate::util::conversions::*;

    #[test]
    fn test_align_up() {
        assert_eq!(raw_align_up(0, 8), 0);
        assert_eq!(raw_align_up(1, 8), 8);
        assert_eq!(raw_align_up(8, 8), 8);
        assert_eq!(raw_align_up(4097, 4096), 8192);
    }

    #[test]
    fn test_align_down() {
        assert_eq!(raw_align_down(7, 8), 0);
        assert_eq!(raw_align_down(9, 8), 8);
        assert!(raw_is_aligned(4096, 4096));
        assert!(!raw_is_aligned(4095, 4096));
    }

    #[test]
    fn test_word_conversions() {
        assert_eq!(bytes_to_words_up(1), 1);
        assert_eq!(bytes_to_words_up(16), 2);
        assert_eq!(words_to_bytes(3), 24);
        assert_eq!(words_align_up_to_os_page(1), 512);
        assert_eq!(words_align_up_to_os_page(512), 512);
        assert_eq!(words_align_up_to_os_page(513), 1024);
    }

    #[test]
    fn test_bits_needed() {
        assert_eq!(bits_needed(0), 0);
        assert_eq!(bits_needed(1), 1);
        assert_eq!(bits_needed(255), 8);
        assert_eq!(bits_needed(256), 9);
    }
}
