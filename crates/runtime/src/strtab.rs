//! String intern table
//!
//! Open-addressed hash table keyed by byte-sequence hash with a
//! deterministic probe step drawn from the shared step table. Slots are
//! empty, live, or a deleted sentinel. The table holds weak references:
//! interning does not bump the refcount, and the sweep phase removes
//! entries for strings that die.
//!
//! Resize triggers when load (live + deleted) exceeds 75% or drops below
//! 25%, to the next table prime ≥ 2× the live count. Resizing is
//! suppressed while a mark-and-sweep cycle runs.

use eider_core::StrId;
use tracing::trace;

use crate::alloc;
use crate::heap::Heap;
use crate::heaphdr::HDR_REACHABLE;
use crate::hstring::{HString, INTERNAL_PREFIX, STRF_INTERNAL};
use crate::markandsweep::MS_FLAG_NO_STRINGTABLE_RESIZE;
use crate::util::{hash_bytes, next_hash_prime, probe_step};

/// Initial table size; must be a table prime.
const INITIAL_SIZE: u32 = 251;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Unused,
    Deleted,
    Used(StrId),
}

pub struct StrTab {
    slots: Vec<Slot>,
    used: u32,
    deleted: u32,
}

impl StrTab {
    pub fn new() -> Self {
        StrTab {
            slots: vec![Slot::Unused; INITIAL_SIZE as usize],
            used: 0,
            deleted: 0,
        }
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.slots.len() as u32
    }

    #[inline]
    pub fn used(&self) -> u32 {
        self.used
    }

    fn load_exceeds_upper(&self) -> bool {
        (self.used + self.deleted) as u64 * 4 > self.size() as u64 * 3
    }

    fn load_below_lower(&self) -> bool {
        (self.used + self.deleted) as u64 * 4 < self.size() as u64
    }
}

impl Default for StrTab {
    fn default() -> Self {
        Self::new()
    }
}

/// Intern a byte sequence: return the existing cell or allocate and
/// insert a new one. Never fails softly; allocation exhaustion diverges
/// through the fatal handler.
pub(crate) fn intern(heap: &mut Heap, bytes: &[u8]) -> StrId {
    let hash = hash_bytes(bytes, heap.hash_seed);
    if let Some(id) = lookup(heap, bytes, hash) {
        return id;
    }

    // Copy the bytes through the host allocator first; the allocation may
    // run a collection, which can delete table entries but never moves
    // them, so the insert probe below runs fresh afterwards.
    let data = alloc::alloc_checked(heap, bytes.len());
    if !bytes.is_empty() {
        // Safety: fresh block of bytes.len() bytes.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), data, bytes.len()) };
    }
    let mut cell = HString::new(data, bytes.len() as u32, hash);
    if bytes.first() == Some(&INTERNAL_PREFIX) {
        cell.hdr.set(STRF_INTERNAL);
    }
    let id = StrId::new(heap.strings.insert(cell));

    insert_slot(heap, id, hash);
    maybe_resize(heap);
    id
}

fn lookup(heap: &Heap, bytes: &[u8], hash: u32) -> Option<StrId> {
    let size = heap.strtab.size();
    let step = probe_step(hash);
    let mut i = hash % size;
    for _ in 0..size {
        match heap.strtab.slots[i as usize] {
            Slot::Unused => return None,
            Slot::Deleted => {}
            Slot::Used(id) => {
                let s = heap.hstr(id);
                if s.hash == hash && s.as_bytes() == bytes {
                    return Some(id);
                }
            }
        }
        i = (i + step) % size;
    }
    None
}

fn insert_slot(heap: &mut Heap, id: StrId, hash: u32) {
    let size = heap.strtab.size();
    let step = probe_step(hash);
    let mut i = hash % size;
    for _ in 0..size {
        match heap.strtab.slots[i as usize] {
            Slot::Unused => {
                heap.strtab.slots[i as usize] = Slot::Used(id);
                heap.strtab.used += 1;
                return;
            }
            Slot::Deleted => {
                heap.strtab.slots[i as usize] = Slot::Used(id);
                heap.strtab.used += 1;
                heap.strtab.deleted -= 1;
                return;
            }
            Slot::Used(_) => {}
        }
        i = (i + step) % size;
    }
    unreachable!("string table full");
}

/// Remove a dying string's entry (refzero or sweep path).
pub(crate) fn remove(heap: &mut Heap, id: StrId) {
    let hash = heap.hstr(id).hash;
    let size = heap.strtab.size();
    let step = probe_step(hash);
    let mut i = hash % size;
    for _ in 0..size {
        match heap.strtab.slots[i as usize] {
            Slot::Unused => break,
            Slot::Used(found) if found == id => {
                heap.strtab.slots[i as usize] = Slot::Deleted;
                heap.strtab.used -= 1;
                heap.strtab.deleted += 1;
                maybe_resize(heap);
                return;
            }
            _ => {}
        }
        i = (i + step) % size;
    }
    unreachable!("interned string missing from table");
}

/// Resize when the load factor leaves the [25%, 75%] band. Suppressed
/// during mark-and-sweep and by the sensitive-section base mask.
pub(crate) fn maybe_resize(heap: &mut Heap) {
    if heap.flags & crate::heap::HEAP_MARKANDSWEEP_RUNNING != 0
        || heap.ms_base_flags & MS_FLAG_NO_STRINGTABLE_RESIZE != 0
    {
        return;
    }
    let t = &heap.strtab;
    if !t.load_exceeds_upper() && !(t.load_below_lower() && t.size() > INITIAL_SIZE) {
        return;
    }
    let new_size = next_hash_prime(heap.strtab.used.saturating_mul(2).max(INITIAL_SIZE));
    resize(heap, new_size);
}

fn resize(heap: &mut Heap, new_size: u32) {
    trace!(
        old_size = heap.strtab.size(),
        new_size,
        used = heap.strtab.used,
        "string table resize"
    );
    let old = std::mem::replace(&mut heap.strtab.slots, vec![Slot::Unused; new_size as usize]);
    heap.strtab.used = 0;
    heap.strtab.deleted = 0;
    for slot in old {
        if let Slot::Used(id) = slot {
            let hash = heap.hstr(id).hash;
            insert_slot(heap, id, hash);
        }
    }
}

/// Sweep phase hook: free every interned string not marked reachable,
/// clearing marks on survivors. Returns the number of freed cells.
pub(crate) fn sweep(heap: &mut Heap) -> usize {
    let mut freed = 0;
    let size = heap.strtab.size();
    for i in 0..size {
        let Slot::Used(id) = heap.strtab.slots[i as usize] else {
            continue;
        };
        let hdr = &mut heap.hstr_mut(id).hdr;
        if hdr.has(HDR_REACHABLE) {
            hdr.clear(HDR_REACHABLE);
        } else {
            heap.strtab.slots[i as usize] = Slot::Deleted;
            heap.strtab.used -= 1;
            heap.strtab.deleted += 1;
            heap.strcache_invalidate(id);
            heap.free_string_cell(id);
            freed += 1;
        }
    }
    freed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_same_pointer() {
        let mut heap = Heap::new();
        let a = intern(&mut heap, b"hello");
        let b = intern(&mut heap, b"hello");
        assert_eq!(a, b);
        let c = intern(&mut heap, b"hellp");
        assert_ne!(a, c);
    }

    #[test]
    fn test_intern_empty_and_binary() {
        let mut heap = Heap::new();
        let e = intern(&mut heap, b"");
        assert_eq!(heap.hstr(e).as_bytes(), b"");
        // NUL bytes survive interning
        let n = intern(&mut heap, b"a\0b");
        assert_eq!(heap.hstr(n).as_bytes(), b"a\0b");
    }

    #[test]
    fn test_internal_prefix_flag() {
        let mut heap = Heap::new();
        let id = intern(&mut heap, b"\xFFhidden");
        assert!(heap.hstr(id).is_internal());
    }

    #[test]
    fn test_grow_keeps_entries() {
        let mut heap = Heap::new();
        let mut ids = Vec::new();
        for i in 0..500 {
            let s = format!("key-{i}");
            let id = intern(&mut heap, s.as_bytes());
            heap.incref_str(id);
            ids.push((s, id));
        }
        assert!(heap.strtab.size() > INITIAL_SIZE);
        for (s, id) in &ids {
            assert_eq!(intern(&mut heap, s.as_bytes()), *id);
        }
    }

    #[test]
    fn test_remove_and_reinsert() {
        let mut heap = Heap::new();
        let id = intern(&mut heap, b"transient");
        remove(&mut heap, id);
        heap.free_string_cell(id);
        let id2 = intern(&mut heap, b"transient");
        assert_eq!(heap.hstr(id2).as_bytes(), b"transient");
    }
}
