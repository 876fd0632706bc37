use crate::util::constants::{DEFAULT_LOG_BYTES_IN_PAGE, LARGE_MIN_PAGES};
use std::default::Default;

fn always_valid<T>(_: &T) -> bool {
    true
}

fn percentage(v: &usize) -> bool {
    *v <= 100
}

/// A committed-page budget derived from the physical memory of the host: half of it, in heap pages.
fn default_max_heap_pages() -> usize {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    let pages = (sys.total_memory() as usize / 2) >> DEFAULT_LOG_BYTES_IN_PAGE;
    pages.max(LARGE_MIN_PAGES * 4)
}

macro_rules! options {
    ($($name:ident: $type:ty[$validator:expr] = $default:expr),*,) => [
        options!($($name: $type[$validator] = $default),*);
    ];
    ($($name:ident: $type:ty[$validator:expr] = $default:expr),*) => [
        #[derive(Clone, Debug)]
        pub struct Options {
            $(pub $name: $type),*
        }
        impl Options {
            pub fn set_from_str(&mut self, s: &str, val: &str)->bool {
                match s {
                    // Parse the given value from str (by env vars or by calling process()) to the right type
                    $(stringify!($name) => if let Ok(ref val) = val.parse::<$type>() {
                        // Validate
                        let validate_fn = $validator;
                        let is_valid = validate_fn(val);
                        if is_valid {
                            // Only set value if valid.
                            self.$name = val.clone();
                        } else {
                            eprintln!("Warn: unable to set {}={:?}. Invalid value. Default value will be used.", s, val);
                        }
                        is_valid
                    } else {
                        eprintln!("Warn: unable to set {}={:?}. Cant parse value. Default value will be used.", s, val);
                        false
                    })*
                    _ => panic!("Invalid Options key")
                }
            }
        }
        impl Default for Options {
            fn default() -> Self {
                let mut options = Options {
                    $($name: $default),*
                };

                // If we have env vars that start with GPGC_ and match any option (such as GPGC_GC_THREADS),
                // we set the option to its value (if it is a valid value). Otherwise, use the default value.
                const PREFIX: &str = "GPGC_";
                for (key, val) in std::env::vars() {
                    // strip the prefix, and get the lower case string
                    if let Some(rest_of_key) = key.strip_prefix(PREFIX) {
                        let lowercase: &str = &rest_of_key.to_lowercase();
                        match lowercase {
                            $(stringify!($name) => { options.set_from_str(lowercase, &val); },)*
                            _ => {}
                        }
                    }
                }
                options
            }
        }
    ]
}

options! {
    // Log2 of the heap page size. Pages are the unit of allocation, relocation and accounting.
    log_bytes_in_page:          u8    [|v: &u8| (16..=23).contains(v)] = DEFAULT_LOG_BYTES_IN_PAGE,
    // Number of pages reserved for small-object space.
    small_space_pages:          usize [|v: &usize| *v > 0] = 1 << 14,
    // Number of 16-page blocks reserved for mid-object space.
    mid_space_blocks:           usize [|v: &usize| *v > 0] = 1 << 10,
    // Number of pages reserved for large-object space.
    large_space_pages:          usize [|v: &usize| *v >= LARGE_MIN_PAGES] = 1 << 14,
    // The committed-page budget: physical pages the heap may hold at once.
    max_heap_pages:             usize [|v: &usize| *v > 0] = default_max_heap_pages(),
    // Extra pages usable when the budget is exhausted, to avoid a pause. 0 disables the account.
    pause_prevention_pages:     usize [always_valid] = 0,
    // Number of GC worker threads for each collector.
    gc_threads:                 usize [|v: &usize| *v > 0] = num_cpus::get(),
    // Upper bound on mutator threads. Each mutator and worker gets one preallocated-page slot.
    max_mutator_threads:        usize [|v: &usize| *v > 0] = 64,
    // Size of the sideband forwarding arena, as a percentage of the heap words.
    sideband_percent:           usize [|v: &usize| (1..=100).contains(v)] = 10,
    // The share of the arena one collector may take. Clamped to [50, 100].
    sideband_max_percent:       usize [percentage] = 75,
    // Padding added to each forwarding table, as a percentage of its live objects.
    sideband_padding_percent:   usize [percentage] = 25,
    // Objects surviving longer than this many milliseconds are promoted by the new collector.
    promotion_threshold_ms:     u64   [always_valid] = 1000,
    // Pages are candidates for relocation while their live words are below this percentage of a page.
    relocation_occupancy_percent: usize [percentage] = 100,
    // Old pages are candidates for relocation while their live words are below this percentage of a page.
    old_gc_occupancy_percent:   usize [percentage] = 60,
    // Return freed pages to the free lists. When false, freed address space is never reused.
    reuse_freed_pages:          bool  [always_valid] = true,
    // Relocate sparse mid-space pages.
    collect_mid_space:          bool  [always_valid] = true,
    // Promote or relocate large-space blocks.
    collect_large_space:        bool  [always_valid] = true,
    // Never relocate perm-gen pages.
    no_perm_relocation:         bool  [always_valid] = false,
    // Skip the relocation phases of the new collector.
    new_gc_no_relocation:       bool  [always_valid] = false,
    // Skip the relocation phases of the old collector.
    old_gc_no_relocation:       bool  [always_valid] = false,
    // How many times a mutator asks for a collection before an allocation fails.
    allocation_retries:         usize [always_valid] = 2,
    // Keep a per-page trail of lifecycle operations.
    page_audit:                 bool  [always_valid] = false,
    // Check generation capacity counters against a space scan at every initial-mark safepoint.
    verify_capacity:            bool  [always_valid] = cfg!(debug_assertions),
}

impl Options {
    pub fn set_from_camelcase_str(&mut self, s: &str, val: &str) -> bool {
        trace!("Trying to process option pair: ({}, {})", s, val);

        let mut sr = String::with_capacity(s.len());
        for c in s.chars() {
            if c.is_uppercase() {
                sr.push('_');
                for c in c.to_lowercase() {
                    sr.push(c);
                }
            } else {
                sr.push(c)
            }
        }

        let result = self.set_from_str(sr.as_str(), val);

        trace!("Trying to process option pair: ({})", sr);

        if result {
            trace!("Validation passed");
        } else {
            trace!("Validation failed")
        }
        result
    }

    /// The share of the sideband arena one collector may use, clamped to [50, 100].
    pub fn clamped_sideband_max_percent(&self) -> usize {
        self.sideband_max_percent.clamp(50, 100)
    }
}
