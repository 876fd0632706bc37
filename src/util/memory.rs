use crate::util::address::ByteSize;
use crate::util::conversions::raw_align_up;
use crate::util::Address;
use downcast_rs::{impl_downcast, Downcast};
use libc::{PROT_NONE, PROT_READ, PROT_WRITE};
use std::io::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Demand-zero mmap:
/// This function guarantees to zero all mapped memory.
pub fn dzmmap(start: Address, size: usize) -> Result<()> {
    let prot = PROT_READ | PROT_WRITE;
    let flags = libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_FIXED;
    mmap_fixed(start, size, prot, flags)
}

/// Replace the range with an inaccessible mapping that holds no physical memory. Any contents are
/// discarded, the address range stays reserved.
pub fn mmap_reserve_fixed(start: Address, size: usize) -> Result<()> {
    let flags = libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_FIXED | libc::MAP_NORESERVE;
    mmap_fixed(start, size, PROT_NONE, flags)
}

fn mmap_fixed(start: Address, size: usize, prot: libc::c_int, flags: libc::c_int) -> Result<()> {
    let ptr = start.to_mut_ptr();
    wrap_libc_call(
        &|| unsafe { libc::mmap(start.to_mut_ptr(), size, prot, flags, -1, 0) },
        ptr,
    )
}

/// Reserve `size` bytes of inaccessible address space aligned to `align`, anywhere the kernel chooses.
pub fn mmap_noreserve_anywhere(size: usize, align: usize) -> Result<Address> {
    let request = size + align;
    let flags = libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_NORESERVE;
    let ptr = unsafe { libc::mmap(std::ptr::null_mut(), request, PROT_NONE, flags, -1, 0) };
    if ptr == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }
    let raw = Address::from_mut_ptr(ptr);
    let start = raw.align_up(align);
    let head = start - raw;
    if head > 0 {
        try_munmap(raw, head)?;
    }
    let tail = request - head - size;
    if tail > 0 {
        try_munmap(start + size, tail)?;
    }
    Ok(start)
}

/// Map `size` bytes of zeroed, readable and writable memory anywhere, without reserving swap. Physical
/// pages materialize on first touch, so large sparse tables cost only what is used.
pub fn mmap_zeroed_noreserve(size: usize) -> Result<Address> {
    let flags = libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_NORESERVE;
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            PROT_READ | PROT_WRITE,
            flags,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }
    Ok(Address::from_mut_ptr(ptr))
}

pub fn munprotect(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(
        &|| unsafe { libc::mprotect(start.to_mut_ptr(), size, PROT_READ | PROT_WRITE) },
        0,
    )
}

pub fn mprotect(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(
        &|| unsafe { libc::mprotect(start.to_mut_ptr(), size, PROT_NONE) },
        0,
    )
}

/// Move the physical backing of `[src, src + size)` to `dst` without copying. The source range is
/// left reserved but unbacked.
pub fn mremap_fixed(src: Address, dst: Address, size: usize) -> Result<()> {
    let flags = libc::MREMAP_MAYMOVE | libc::MREMAP_FIXED;
    let ret = unsafe {
        libc::mremap(
            src.to_mut_ptr(),
            size,
            size,
            flags,
            dst.to_mut_ptr::<libc::c_void>(),
        )
    };
    if ret == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }
    mmap_reserve_fixed(src, size)
}

fn wrap_libc_call<T: PartialEq>(f: &dyn Fn() -> T, expect: T) -> Result<()> {
    let ret = f();
    if ret == expect {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

pub fn try_munmap(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(&|| unsafe { libc::munmap(start.to_mut_ptr(), size) }, 0)
}

/// One staged operation of a memory batch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BatchedOp {
    Relocate {
        src: Address,
        dst: Address,
        size: ByteSize,
    },
    Protect {
        start: Address,
        size: ByteSize,
    },
}

/// The virtual memory operations the heap needs from the host.
///
/// `relocate` moves physical backing between address ranges without copying bytes. The batched
/// variants stage operations that become visible together when the batch is committed, which the
/// collectors do at a safepoint.
pub trait VirtualMemory: Downcast + Send + Sync {
    /// Reserve an inaccessible, unbacked address range.
    fn reserve(&self, size: ByteSize, align: ByteSize) -> Result<Address>;
    /// Give a reserved range back to the host.
    fn release(&self, start: Address, size: ByteSize);
    /// Back a reserved range with zeroed physical memory. Returns false when the host is out of memory.
    fn commit(&self, start: Address, size: ByteSize) -> bool;
    /// Drop the physical backing of a range. The range stays reserved.
    fn uncommit(&self, start: Address, size: ByteSize);
    fn protect(&self, start: Address, size: ByteSize);
    fn relocate(&self, src: Address, dst: Address, size: ByteSize);

    fn start_batch(&self);
    fn batched_relocate(&self, src: Address, dst: Address, size: ByteSize);
    fn batched_protect(&self, start: Address, size: ByteSize);
    /// Apply every staged operation, in staging order.
    fn commit_batch(&self);
    fn batch_in_progress(&self) -> bool;

    /// Make a shattered range fully accessible again, keeping the granules relocated into it.
    /// May fail for lack of a backing page; callers retry.
    fn partial_unshatter(&self, start: Address, size: ByteSize, force_addr: Address) -> bool;
    fn unshatter_all(&self, start: Address, size: ByteSize);

    fn invalidate_tlb(&self);
}
impl_downcast!(VirtualMemory);

/// [`VirtualMemory`] backed by Linux mmap, mremap and mprotect.
#[derive(Default)]
pub struct MmapMemory {
    batch: Mutex<Option<Vec<BatchedOp>>>,
    tlb_invalidations: AtomicUsize,
}

impl MmapMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tlb_invalidations(&self) -> usize {
        self.tlb_invalidations.load(Ordering::Relaxed)
    }

    fn apply(&self, op: BatchedOp) {
        match op {
            BatchedOp::Relocate { src, dst, size } => self.relocate(src, dst, size),
            BatchedOp::Protect { start, size } => self.protect(start, size),
        }
    }

    fn stage(&self, op: BatchedOp) {
        let mut batch = self.batch.lock().unwrap();
        match batch.as_mut() {
            Some(ops) => ops.push(op),
            None => panic!("Batched memory op {:?} outside of a batch", op),
        }
    }
}

impl VirtualMemory for MmapMemory {
    fn reserve(&self, size: ByteSize, align: ByteSize) -> Result<Address> {
        mmap_noreserve_anywhere(raw_align_up(size, align), align)
    }

    fn release(&self, start: Address, size: ByteSize) {
        if let Err(e) = try_munmap(start, size) {
            warn!("Unable to release {} bytes at {}: {}", size, start, e);
        }
    }

    fn commit(&self, start: Address, size: ByteSize) -> bool {
        match dzmmap(start, size) {
            Ok(()) => true,
            Err(e) => {
                warn!("Unable to commit {} bytes at {}: {}", size, start, e);
                false
            }
        }
    }

    fn uncommit(&self, start: Address, size: ByteSize) {
        if let Err(e) = mmap_reserve_fixed(start, size) {
            panic!("Unable to uncommit {} bytes at {}: {}", size, start, e);
        }
    }

    fn protect(&self, start: Address, size: ByteSize) {
        if let Err(e) = mprotect(start, size) {
            panic!("Unable to protect {} bytes at {}: {}", size, start, e);
        }
    }

    fn relocate(&self, src: Address, dst: Address, size: ByteSize) {
        if mremap_fixed(src, dst, size).is_ok() {
            return;
        }
        // The source spans several mappings. Move it one OS page at a time.
        let os_page = crate::util::constants::BYTES_IN_OS_PAGE;
        let mut offset = 0;
        while offset < size {
            if let Err(e) = mremap_fixed(src + offset, dst + offset, os_page) {
                panic!(
                    "Unable to relocate {} bytes from {} to {}: {}",
                    size, src, dst, e
                );
            }
            offset += os_page;
        }
    }

    fn start_batch(&self) {
        let mut batch = self.batch.lock().unwrap();
        assert!(batch.is_none(), "Memory batch already started");
        *batch = Some(vec![]);
    }

    fn batched_relocate(&self, src: Address, dst: Address, size: ByteSize) {
        self.stage(BatchedOp::Relocate { src, dst, size });
    }

    fn batched_protect(&self, start: Address, size: ByteSize) {
        self.stage(BatchedOp::Protect { start, size });
    }

    fn commit_batch(&self) {
        let ops = self
            .batch
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| panic!("No memory batch to commit"));
        trace!("Committing {} batched memory ops", ops.len());
        for op in ops {
            self.apply(op);
        }
    }

    fn batch_in_progress(&self) -> bool {
        self.batch.lock().unwrap().is_some()
    }

    fn partial_unshatter(&self, start: Address, size: ByteSize, _force_addr: Address) -> bool {
        munprotect(start, size).is_ok()
    }

    fn unshatter_all(&self, start: Address, size: ByteSize) {
        if let Err(e) = munprotect(start, size) {
            panic!("Unable to unshatter {} bytes at {}: {}", size, start, e);
        }
    }

    fn invalidate_tlb(&self) {
        // The kernel shoots down stale translations as part of mremap and munmap. Record the request.
        self.tlb_invalidations.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_OS_PAGE;

    const RANGE: usize = 16 * BYTES_IN_OS_PAGE;

    #[test]
    fn reserve_commit_uncommit() {
        let memory = MmapMemory::new();
        let start = memory.reserve(RANGE, RANGE).unwrap();
        assert!(start.is_aligned_to(RANGE));
        assert!(memory.commit(start, BYTES_IN_OS_PAGE));
        unsafe {
            start.store(42usize);
            assert_eq!(start.load::<usize>(), 42);
        }
        memory.uncommit(start, BYTES_IN_OS_PAGE);
        assert!(memory.commit(start, BYTES_IN_OS_PAGE));
        unsafe {
            assert_eq!(start.load::<usize>(), 0);
        }
        try_munmap(start, RANGE).unwrap();
    }

    #[test]
    fn relocate_moves_contents() {
        let memory = MmapMemory::new();
        let start = memory.reserve(RANGE, RANGE).unwrap();
        let dst = start + 8 * BYTES_IN_OS_PAGE;
        assert!(memory.commit(start, 2 * BYTES_IN_OS_PAGE));
        unsafe {
            start.store(7usize);
            (start + BYTES_IN_OS_PAGE).store(9usize);
        }
        memory.relocate(start, dst, 2 * BYTES_IN_OS_PAGE);
        unsafe {
            assert_eq!(dst.load::<usize>(), 7);
            assert_eq!((dst + BYTES_IN_OS_PAGE).load::<usize>(), 9);
        }
        try_munmap(start, RANGE).unwrap();
    }

    #[test]
    fn batch_applies_on_commit() {
        let memory = MmapMemory::new();
        let start = memory.reserve(RANGE, RANGE).unwrap();
        let dst = start + 4 * BYTES_IN_OS_PAGE;
        assert!(memory.commit(start, BYTES_IN_OS_PAGE));
        unsafe { start.store(11usize) };

        memory.start_batch();
        assert!(memory.batch_in_progress());
        memory.batched_relocate(start, dst, BYTES_IN_OS_PAGE);
        // Nothing moved yet.
        unsafe { assert_eq!(start.load::<usize>(), 11) };
        memory.commit_batch();
        assert!(!memory.batch_in_progress());
        unsafe { assert_eq!(dst.load::<usize>(), 11) };
        try_munmap(start, RANGE).unwrap();
    }

    #[test]
    fn unshatter_fills_holes() {
        let memory = MmapMemory::new();
        let start = memory.reserve(RANGE, RANGE).unwrap();
        let target = start + 8 * BYTES_IN_OS_PAGE;
        assert!(memory.commit(start, BYTES_IN_OS_PAGE));
        unsafe { start.store(5usize) };
        // Move one granule into the middle of an unbacked target.
        memory.relocate(start, target + BYTES_IN_OS_PAGE, BYTES_IN_OS_PAGE);
        assert!(memory.partial_unshatter(target, 4 * BYTES_IN_OS_PAGE, target));
        unsafe {
            assert_eq!(target.load::<usize>(), 0);
            assert_eq!((target + BYTES_IN_OS_PAGE).load::<usize>(), 5);
        }
        try_munmap(start, RANGE).unwrap();
    }
}
