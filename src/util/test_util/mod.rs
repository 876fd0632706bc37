use crate::util::options::Options;
use std::panic;
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

pub mod fixtures;

/// Options for a small heap: 64 KiB pages, a few hundred pages per space. Every field is set, so
/// GPGC_ variables set by other tests do not leak in.
pub fn test_options() -> Options {
    let mut options = Options::default();
    options.log_bytes_in_page = 16;
    options.small_space_pages = 256;
    options.mid_space_blocks = 16;
    options.large_space_pages = 256;
    options.max_heap_pages = 512;
    options.pause_prevention_pages = 0;
    options.gc_threads = 2;
    options.max_mutator_threads = 8;
    options.sideband_percent = 10;
    options.sideband_max_percent = 75;
    options.sideband_padding_percent = 25;
    options.promotion_threshold_ms = 0;
    options.relocation_occupancy_percent = 100;
    options.old_gc_occupancy_percent = 60;
    options.reuse_freed_pages = true;
    options.collect_mid_space = true;
    options.collect_large_space = true;
    options.no_perm_relocation = false;
    options.new_gc_no_relocation = false;
    options.old_gc_no_relocation = false;
    options.allocation_retries = 2;
    options.page_audit = true;
    options.verify_capacity = true;
    options
}

// https://github.com/rust-lang/rfcs/issues/2798#issuecomment-552949300
pub fn panic_after<T, F>(millis: u64, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T,
    F: Send + 'static,
{
    let (done_tx, done_rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let val = f();
        done_tx.send(()).expect("Unable to send completion signal");
        val
    });

    match done_rx.recv_timeout(Duration::from_millis(millis)) {
        Ok(_) => handle.join().expect("Thread panicked"),
        Err(e) => panic!("Thread took too long: {}", e),
    }
}

lazy_static! {
    // A global lock to make tests serial.
    // Tests that read or set GPGC_ environment variables take it.
    static ref SERIAL_TEST_LOCK: Mutex<()> = Mutex::default();
}

// force some tests to be executed serially
pub fn serial_test<F>(f: F)
where
    F: FnOnce(),
{
    // If one test fails, the lock will become poisoned. We would want to continue for other tests anyway.
    let _guard = SERIAL_TEST_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    f();
}

// Always execute a cleanup closure no matter the test panics or not.
pub fn with_cleanup<T, C>(test: T, cleanup: C)
where
    T: FnOnce() + panic::UnwindSafe,
    C: FnOnce(),
{
    let res = panic::catch_unwind(test);
    cleanup();
    if let Err(e) = res {
        panic::resume_unwind(e);
    }
}
