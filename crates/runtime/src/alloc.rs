//! Host allocator layer
//!
//! The host supplies three raw primitives (alloc/realloc/free) plus a fatal
//! handler; the engine wraps them with checked variants that run a
//! mark-and-sweep cycle and retry on failure. Retries escalate: the first
//! ones run a normal cycle, later ones set the emergency flag that enables
//! object compaction. When the last retry fails the fatal handler is
//! invoked and never returns.
//!
//! Raw byte blocks (string data, buffer data, object property tables) go
//! through this layer so the retry loop governs them. Slab and stack
//! bookkeeping uses the Rust global allocator.

use std::ffi::c_void;

use tracing::debug;

use crate::error::ErrCode;
use crate::heap::Heap;
use crate::markandsweep::{self, MS_FLAG_EMERGENCY};

/// `alloc_fn(udata, size) -> ptr | null`
pub type AllocFn = unsafe fn(udata: *mut c_void, size: usize) -> *mut c_void;
/// `realloc_fn(udata, ptr, newsize) -> ptr | null`
pub type ReallocFn = unsafe fn(udata: *mut c_void, ptr: *mut c_void, newsize: usize) -> *mut c_void;
/// `free_fn(udata, ptr)`
pub type FreeFn = unsafe fn(udata: *mut c_void, ptr: *mut c_void);
/// `fatal_fn(code, msg) -> !`; must not return.
pub type FatalFn = fn(code: ErrCode, msg: &str) -> !;

/// GC-and-retry attempts before the fatal handler is invoked.
pub const ALLOC_FAIL_GC_LIMIT: u32 = 3;
/// Attempt index from which retries run an emergency (compacting) cycle.
const ALLOC_FAIL_EMERGENCY_START: u32 = 2;

unsafe fn libc_alloc(_udata: *mut c_void, size: usize) -> *mut c_void {
    unsafe { libc::malloc(size) }
}

unsafe fn libc_realloc(_udata: *mut c_void, ptr: *mut c_void, newsize: usize) -> *mut c_void {
    unsafe { libc::realloc(ptr, newsize) }
}

unsafe fn libc_free(_udata: *mut c_void, ptr: *mut c_void) {
    unsafe { libc::free(ptr) }
}

/// Default fatal handler: report and abort the process.
pub fn default_fatal(code: ErrCode, msg: &str) -> ! {
    eprintln!("eider fatal: {code}: {msg}");
    std::process::abort();
}

/// Host allocation callback triple.
pub struct Allocator {
    pub alloc_fn: AllocFn,
    pub realloc_fn: ReallocFn,
    pub free_fn: FreeFn,
    pub udata: *mut c_void,
}

impl Allocator {
    /// The default triple backed by `libc` malloc/realloc/free.
    pub fn libc() -> Self {
        Allocator {
            alloc_fn: libc_alloc,
            realloc_fn: libc_realloc,
            free_fn: libc_free,
            udata: std::ptr::null_mut(),
        }
    }

    /// Raw allocation; may return null. Zero-size requests return null
    /// without touching the host.
    pub(crate) fn raw_alloc(&self, size: usize) -> *mut u8 {
        if size == 0 {
            return std::ptr::null_mut();
        }
        unsafe { (self.alloc_fn)(self.udata, size) as *mut u8 }
    }

    pub(crate) fn raw_realloc(&self, ptr: *mut u8, newsize: usize) -> *mut u8 {
        unsafe { (self.realloc_fn)(self.udata, ptr as *mut c_void, newsize) as *mut u8 }
    }

    pub(crate) fn raw_free(&self, ptr: *mut u8) {
        if !ptr.is_null() {
            unsafe { (self.free_fn)(self.udata, ptr as *mut c_void) }
        }
    }
}

/// Allocate `size` bytes, running GC cycles on failure. Diverges through
/// the fatal handler when every retry fails. A zero-size request yields a
/// null pointer, which is a valid "empty" block for this layer.
pub fn alloc_checked(heap: &mut Heap, size: usize) -> *mut u8 {
    if size == 0 {
        return std::ptr::null_mut();
    }
    let p = heap.alloc.raw_alloc(size);
    if !p.is_null() {
        return p;
    }
    for attempt in 0..ALLOC_FAIL_GC_LIMIT {
        debug!(size, attempt, "allocation failed, running gc and retrying");
        let flags = if attempt >= ALLOC_FAIL_EMERGENCY_START {
            MS_FLAG_EMERGENCY
        } else {
            0
        };
        markandsweep::run(heap, flags);
        let p = heap.alloc.raw_alloc(size);
        if !p.is_null() {
            return p;
        }
    }
    (heap.fatal)(ErrCode::Alloc, "out of memory (alloc)")
}

/// Reallocate a block, running GC cycles on failure, same escalation as
/// [`alloc_checked`].
pub fn realloc_checked(heap: &mut Heap, ptr: *mut u8, newsize: usize) -> *mut u8 {
    let p = heap.alloc.raw_realloc(ptr, newsize);
    if !p.is_null() || newsize == 0 {
        return p;
    }
    for attempt in 0..ALLOC_FAIL_GC_LIMIT {
        debug!(newsize, attempt, "reallocation failed, running gc and retrying");
        let flags = if attempt >= ALLOC_FAIL_EMERGENCY_START {
            MS_FLAG_EMERGENCY
        } else {
            0
        };
        markandsweep::run(heap, flags);
        let p = heap.alloc.raw_realloc(ptr, newsize);
        if !p.is_null() {
            return p;
        }
    }
    (heap.fatal)(ErrCode::Alloc, "out of memory (realloc)")
}

/// Indirect variant: the caller hands in a reader for the *current*
/// address of the block, re-consulted after every GC cycle because a cycle
/// may relocate the owning structure.
pub fn realloc_indirect(
    heap: &mut Heap,
    read_ptr: fn(&Heap, u64) -> *mut u8,
    arg: u64,
    newsize: usize,
) -> *mut u8 {
    let p = heap.alloc.raw_realloc(read_ptr(heap, arg), newsize);
    if !p.is_null() || newsize == 0 {
        return p;
    }
    for attempt in 0..ALLOC_FAIL_GC_LIMIT {
        debug!(newsize, attempt, "indirect reallocation failed, running gc");
        let flags = if attempt >= ALLOC_FAIL_EMERGENCY_START {
            MS_FLAG_EMERGENCY
        } else {
            0
        };
        markandsweep::run(heap, flags);
        let p = heap.alloc.raw_realloc(read_ptr(heap, arg), newsize);
        if !p.is_null() {
            return p;
        }
    }
    (heap.fatal)(ErrCode::Alloc, "out of memory (realloc_indirect)")
}

/// Free a block obtained from this layer. Null is a no-op.
pub(crate) fn free(heap: &Heap, ptr: *mut u8) {
    heap.alloc.raw_free(ptr);
}
