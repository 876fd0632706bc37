pub mod heap_meta;
pub mod layout;
pub mod multi_page_space;
pub mod one_page_space;
pub mod page_audit;
pub mod page_budget;
pub mod page_info;

use std::sync::atomic::Ordering;

/// Apply `f` to an atomic counter with a CAS loop. `f` returns `None` to leave the counter unchanged,
/// in which case the current value is returned as the error.
pub(crate) fn atomic_checked_update<A, F>(counter: &A, f: F) -> Result<A::Type, A::Type>
where
    A: atomic_traits::Atomic,
    A::Type: Copy,
    F: Fn(A::Type) -> Option<A::Type>,
{
    let mut old = counter.load(Ordering::Acquire);
    loop {
        let new = match f(old) {
            Some(new) => new,
            None => return Err(old),
        };
        match counter.compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return Ok(new),
            Err(actual) => old = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn checked_update_refuses() {
        let counter = AtomicUsize::new(1);
        assert_eq!(atomic_checked_update(&counter, |v| v.checked_sub(1)), Ok(0));
        assert_eq!(atomic_checked_update(&counter, |v| v.checked_sub(1)), Err(0));
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }
}
