//! Object property storage
//!
//! One flat allocation per object holding three parts:
//!
//! - entries part: `e_size` slots of (key id, value-or-accessor, flag byte);
//!   `e_used` slots are occupied, possibly with deleted holes (key `None`)
//! - array part: `a_size` plain value slots with implicit
//!   writable|enumerable|configurable attributes
//! - hash part: `h_size` indices into the entries part; absent below the
//!   build threshold, a power-of-two-class prime above it
//!
//! Resizing always reallocates the whole block and may change all three
//! parts at once; the old block stays valid until the swap, so a GC cycle
//! triggered by the new block's allocation sees a consistent table.
//!
//! Keys are interned string ids, so key equality is id equality and probe
//! comparisons never touch the string heap.

use eider_core::{ObjId, StrId, TVal};

use crate::util::probe_step;

/// Per-entry attribute flag bits.
pub const PROPF_WRITABLE: u8 = 0x01;
pub const PROPF_ENUMERABLE: u8 = 0x02;
pub const PROPF_CONFIGURABLE: u8 = 0x04;
/// Value slot holds a {get, set} pair instead of a plain value.
pub const PROPF_ACCESSOR: u8 = 0x08;

/// Attributes of a fresh plain assignment and of array part slots.
pub const PROPF_DEFAULT_DATA: u8 = PROPF_WRITABLE | PROPF_ENUMERABLE | PROPF_CONFIGURABLE;
/// Attributes of a plain `var`/function declaration binding.
pub const PROPF_DECL: u8 = PROPF_WRITABLE | PROPF_ENUMERABLE;

/// Hash slot sentinels.
pub const HASH_UNUSED: u32 = 0xFFFF_FFFF;
pub const HASH_DELETED: u32 = 0xFFFF_FFFE;

/// Entry capacity at which the hash part is built and maintained.
pub const HASH_BUILD_LIMIT: u32 = 32;

/// Accessor pair stored in a value slot when `PROPF_ACCESSOR` is set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccessorSlot {
    pub get: Option<ObjId>,
    pub set: Option<ObjId>,
}

/// Value slot: a plain value or an accessor pair, discriminated by the
/// entry's flag byte.
#[derive(Clone, Copy)]
pub union PropSlot {
    pub v: TVal,
    pub a: AccessorSlot,
}

/// Result of an entries-part lookup.
#[derive(Debug, Clone, Copy)]
pub struct Find {
    pub e_idx: Option<u32>,
    pub h_idx: Option<u32>,
}

const NO_FIND: Find = Find {
    e_idx: None,
    h_idx: None,
};

#[derive(Clone, Copy, Default)]
struct Offsets {
    k: usize,
    pv: usize,
    f: usize,
    a: usize,
    h: usize,
    total: usize,
}

#[inline]
fn align_up(v: usize, a: usize) -> usize {
    (v + a - 1) & !(a - 1)
}

fn compute_offsets(e_size: u32, a_size: u32, h_size: u32) -> Offsets {
    let e = e_size as usize;
    let a = a_size as usize;
    let h = h_size as usize;

    // Parts ordered by descending alignment inside the single block.
    let mut cur = 0usize;
    let pv = cur;
    cur += e * size_of::<PropSlot>();

    cur = align_up(cur, align_of::<TVal>());
    let arr = cur;
    cur += a * size_of::<TVal>();

    cur = align_up(cur, align_of::<Option<StrId>>());
    let k = cur;
    cur += e * size_of::<Option<StrId>>();

    cur = align_up(cur, align_of::<u32>());
    let hh = cur;
    cur += h * size_of::<u32>();

    let f = cur;
    cur += e;

    Offsets {
        k,
        pv,
        f,
        a: arr,
        h: hh,
        total: cur,
    }
}

/// The three-part property table of one object.
pub struct PropTable {
    p: *mut u8,
    e_size: u32,
    e_used: u32,
    a_size: u32,
    h_size: u32,
    off: Offsets,
}

impl PropTable {
    /// Empty table; no allocation.
    pub fn new() -> Self {
        PropTable {
            p: std::ptr::null_mut(),
            e_size: 0,
            e_used: 0,
            a_size: 0,
            h_size: 0,
            off: Offsets::default(),
        }
    }

    /// Byte size of a block with the given part sizes.
    pub fn block_size(e_size: u32, a_size: u32, h_size: u32) -> usize {
        compute_offsets(e_size, a_size, h_size).total
    }

    /// Adopt a freshly allocated block of [`Self::block_size`] bytes and
    /// initialize every slot (keys `None`, values undefined, flags zero,
    /// array undefined, hash unused).
    ///
    /// # Safety
    /// `p` must point to a live block of at least `block_size(e, a, h)`
    /// bytes with malloc alignment, owned by this table from now on.
    pub(crate) unsafe fn from_block(p: *mut u8, e_size: u32, a_size: u32, h_size: u32) -> Self {
        let mut t = PropTable {
            p,
            e_size,
            e_used: 0,
            a_size,
            h_size,
            off: compute_offsets(e_size, a_size, h_size),
        };
        for i in 0..e_size {
            t.set_key(i, None);
            t.set_value(i, TVal::undefined());
            t.set_flags(i, 0);
        }
        for i in 0..a_size {
            t.arr_set(i, TVal::undefined());
        }
        for i in 0..h_size {
            t.hash_set(i, HASH_UNUSED);
        }
        t
    }

    #[inline]
    pub fn e_size(&self) -> u32 {
        self.e_size
    }

    #[inline]
    pub fn e_used(&self) -> u32 {
        self.e_used
    }

    #[inline]
    pub fn a_size(&self) -> u32 {
        self.a_size
    }

    #[inline]
    pub fn h_size(&self) -> u32 {
        self.h_size
    }

    #[inline]
    fn k_ptr(&self, i: u32) -> *mut Option<StrId> {
        debug_assert!(i < self.e_size);
        // Safety: offsets computed for this block; i bounds-checked above.
        unsafe { self.p.add(self.off.k).cast::<Option<StrId>>().add(i as usize) }
    }

    #[inline]
    fn pv_ptr(&self, i: u32) -> *mut PropSlot {
        debug_assert!(i < self.e_size);
        unsafe { self.p.add(self.off.pv).cast::<PropSlot>().add(i as usize) }
    }

    #[inline]
    fn f_ptr(&self, i: u32) -> *mut u8 {
        debug_assert!(i < self.e_size);
        unsafe { self.p.add(self.off.f).add(i as usize) }
    }

    #[inline]
    fn a_ptr(&self, i: u32) -> *mut TVal {
        debug_assert!(i < self.a_size);
        unsafe { self.p.add(self.off.a).cast::<TVal>().add(i as usize) }
    }

    #[inline]
    fn h_ptr(&self, i: u32) -> *mut u32 {
        debug_assert!(i < self.h_size);
        unsafe { self.p.add(self.off.h).cast::<u32>().add(i as usize) }
    }

    #[inline]
    pub fn key(&self, i: u32) -> Option<StrId> {
        unsafe { self.k_ptr(i).read() }
    }

    #[inline]
    pub fn set_key(&mut self, i: u32, k: Option<StrId>) {
        unsafe { self.k_ptr(i).write(k) }
    }

    /// Plain value of entry `i`; the entry must not be an accessor.
    #[inline]
    pub fn value(&self, i: u32) -> TVal {
        debug_assert!(self.flags(i) & PROPF_ACCESSOR == 0);
        unsafe { self.pv_ptr(i).read().v }
    }

    #[inline]
    pub fn set_value(&mut self, i: u32, v: TVal) {
        unsafe { self.pv_ptr(i).write(PropSlot { v }) }
    }

    /// Accessor pair of entry `i`; the entry must be an accessor.
    #[inline]
    pub fn accessor(&self, i: u32) -> AccessorSlot {
        debug_assert!(self.flags(i) & PROPF_ACCESSOR != 0);
        unsafe { self.pv_ptr(i).read().a }
    }

    #[inline]
    pub fn set_accessor(&mut self, i: u32, a: AccessorSlot) {
        unsafe { self.pv_ptr(i).write(PropSlot { a }) }
    }

    #[inline]
    pub fn flags(&self, i: u32) -> u8 {
        unsafe { self.f_ptr(i).read() }
    }

    #[inline]
    pub fn set_flags(&mut self, i: u32, f: u8) {
        unsafe { self.f_ptr(i).write(f) }
    }

    #[inline]
    pub fn arr_get(&self, i: u32) -> TVal {
        unsafe { self.a_ptr(i).read() }
    }

    #[inline]
    pub fn arr_set(&mut self, i: u32, v: TVal) {
        unsafe { self.a_ptr(i).write(v) }
    }

    #[inline]
    pub fn hash_get(&self, i: u32) -> u32 {
        unsafe { self.h_ptr(i).read() }
    }

    #[inline]
    pub fn hash_set(&mut self, i: u32, v: u32) {
        unsafe { self.h_ptr(i).write(v) }
    }

    /// Find an entry by interned key. Consults the hash part when present,
    /// linear scan otherwise.
    pub fn find(&self, key: StrId, key_hash: u32) -> Find {
        if self.h_size == 0 {
            for i in 0..self.e_used {
                if self.key(i) == Some(key) {
                    return Find {
                        e_idx: Some(i),
                        h_idx: None,
                    };
                }
            }
            return NO_FIND;
        }
        let size = self.h_size;
        let step = probe_step(key_hash);
        let mut i = key_hash % size;
        for _ in 0..size {
            match self.hash_get(i) {
                HASH_UNUSED => return NO_FIND,
                HASH_DELETED => {}
                e_idx => {
                    if self.key(e_idx) == Some(key) {
                        return Find {
                            e_idx: Some(e_idx),
                            h_idx: Some(i),
                        };
                    }
                }
            }
            i = (i + step) % size;
        }
        NO_FIND
    }

    /// Insert an entries index into the hash part at the first
    /// unused-or-deleted probe slot. The key must not already be present.
    pub fn hash_insert(&mut self, key_hash: u32, e_idx: u32) {
        debug_assert!(self.h_size > 0);
        let size = self.h_size;
        let step = probe_step(key_hash);
        let mut i = key_hash % size;
        for _ in 0..size {
            let s = self.hash_get(i);
            if s == HASH_UNUSED || s == HASH_DELETED {
                self.hash_set(i, e_idx);
                return;
            }
            i = (i + step) % size;
        }
        unreachable!("object hash part full");
    }

    /// Append a fresh entry; capacity must have been ensured. The caller
    /// owns the key reference. Returns the new entry index.
    pub fn append_entry(&mut self, key: StrId, key_hash: u32, flags: u8) -> u32 {
        debug_assert!(self.e_used < self.e_size);
        let i = self.e_used;
        self.set_key(i, Some(key));
        self.set_value(i, TVal::undefined());
        self.set_flags(i, flags);
        if self.h_size > 0 {
            self.hash_insert(key_hash, i);
        }
        self.e_used += 1;
        i
    }

    /// Delete entry `i`, leaving a hole below `e_used`. The caller has
    /// already dropped the key/value references.
    pub fn delete_entry(&mut self, i: u32, h_idx: Option<u32>) {
        self.set_key(i, None);
        self.set_value(i, TVal::undefined());
        self.set_flags(i, 0);
        if let Some(h) = h_idx {
            self.hash_set(h, HASH_DELETED);
        }
    }

    /// Occupied entries in insertion order.
    pub fn entry_keys(&self) -> Vec<(u32, StrId)> {
        (0..self.e_used)
            .filter_map(|i| self.key(i).map(|k| (i, k)))
            .collect()
    }

    /// Give up the raw block for freeing; the table becomes empty.
    pub(crate) fn take_block(&mut self) -> *mut u8 {
        self.e_size = 0;
        self.e_used = 0;
        self.a_size = 0;
        self.h_size = 0;
        self.off = Offsets::default();
        std::mem::replace(&mut self.p, std::ptr::null_mut())
    }

    /// Move used state from a rebuilt table into self, returning the old
    /// block for freeing.
    pub(crate) fn replace_with(&mut self, new: PropTable) -> *mut u8 {
        let old = self.p;
        *self = new;
        old
    }
}

impl Default for PropTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_table(e: u32, a: u32, h: u32) -> PropTable {
        let size = PropTable::block_size(e, a, h).max(1);
        let block = unsafe { libc::malloc(size) as *mut u8 };
        assert!(!block.is_null());
        unsafe { PropTable::from_block(block, e, a, h) }
    }

    fn free_table(mut t: PropTable) {
        let p = t.take_block();
        unsafe { libc::free(p as *mut libc::c_void) };
    }

    #[test]
    fn test_append_and_find_linear() {
        let mut t = make_table(8, 0, 0);
        let k1 = StrId::new(1);
        let k2 = StrId::new(2);
        let i1 = t.append_entry(k1, 100, PROPF_DEFAULT_DATA);
        let i2 = t.append_entry(k2, 200, PROPF_DEFAULT_DATA);
        t.set_value(i1, TVal::number(1.0));
        t.set_value(i2, TVal::number(2.0));

        assert_eq!(t.find(k1, 100).e_idx, Some(i1));
        assert_eq!(t.find(k2, 200).e_idx, Some(i2));
        assert_eq!(t.find(StrId::new(3), 300).e_idx, None);
        assert_eq!(t.value(i2), TVal::number(2.0));
        free_table(t);
    }

    #[test]
    fn test_hash_part_probing() {
        let h = crate::util::next_hash_prime(40);
        let mut t = make_table(40, 0, h);
        // Same low hash bits force collisions through the probe sequence.
        for i in 0..40u32 {
            let key = StrId::new(i);
            t.append_entry(key, 0x40, PROPF_DEFAULT_DATA);
        }
        for i in 0..40u32 {
            let f = t.find(StrId::new(i), 0x40);
            assert_eq!(f.e_idx, Some(i));
            assert!(f.h_idx.is_some());
        }
        free_table(t);
    }

    #[test]
    fn test_delete_leaves_probe_chain_intact() {
        let h = crate::util::next_hash_prime(40);
        let mut t = make_table(8, 0, h);
        t.append_entry(StrId::new(1), 7, PROPF_DEFAULT_DATA);
        t.append_entry(StrId::new(2), 7, PROPF_DEFAULT_DATA);
        let f1 = t.find(StrId::new(1), 7);
        t.delete_entry(f1.e_idx.unwrap(), f1.h_idx);
        // key 2 collided with key 1; must still be reachable past the
        // deleted slot
        assert_eq!(t.find(StrId::new(2), 7).e_idx, Some(1));
        assert_eq!(t.find(StrId::new(1), 7).e_idx, None);
        free_table(t);
    }

    #[test]
    fn test_accessor_slots() {
        let mut t = make_table(4, 0, 0);
        let i = t.append_entry(StrId::new(9), 1, PROPF_ACCESSOR | PROPF_CONFIGURABLE);
        t.set_accessor(
            i,
            AccessorSlot {
                get: Some(ObjId::new(5)),
                set: None,
            },
        );
        let a = t.accessor(i);
        assert_eq!(a.get, Some(ObjId::new(5)));
        assert_eq!(a.set, None);
        free_table(t);
    }

    #[test]
    fn test_array_part() {
        let mut t = make_table(0, 16, 0);
        for i in 0..16 {
            assert!(t.arr_get(i).is_undefined());
        }
        t.arr_set(3, TVal::boolean(true));
        assert_eq!(t.arr_get(3), TVal::boolean(true));
        free_table(t);
    }
}
