//! Property operations
//!
//! ES5.1 property semantics over the three-part storage: get/put/delete/
//! has with prototype walks and accessor dispatch, full
//! `[[DefineOwnProperty]]` descriptor handling, array-part maintenance
//! (growth, density-based abandonment), and the special behaviors of
//! Array `length`, Arguments parameter maps, and String objects.
//!
//! Array-part slots have implicit writable|enumerable|configurable
//! attributes. A hole is represented as `undefined`; storing an explicit
//! `undefined` element abandons the array part so presence is preserved
//! in the entries part.

use eider_core::{ObjId, StrId, TVal, Tag};
use tracing::trace;

use crate::alloc;
use crate::error::{Unwind, type_error, range_error};
use crate::heap::{Bstr, Heap};
use crate::hobject::{
    OBJF_ARRAY_PART, OBJF_EXTENSIBLE, OBJF_SPECIAL_ARGUMENTS, OBJF_SPECIAL_ARRAY,
    OBJF_SPECIAL_STRINGOBJ, ObjClass,
};
use crate::markandsweep::MS_FLAG_NO_OBJECT_COMPACTION;
use crate::proptable::{
    AccessorSlot, Find, HASH_BUILD_LIMIT, PROPF_ACCESSOR, PROPF_CONFIGURABLE, PROPF_DEFAULT_DATA,
    PROPF_ENUMERABLE, PROPF_WRITABLE, PropTable,
};
use crate::util::next_hash_prime;

/// Prototype chain walk bound.
pub const PROTO_SANITY_LIMIT: u32 = 10_000;

/// Property descriptor for `define_property`. `None` fields are absent
/// from the descriptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct PropDesc {
    pub value: Option<TVal>,
    pub get: Option<Option<ObjId>>,
    pub set: Option<Option<ObjId>>,
    pub writable: Option<bool>,
    pub enumerable: Option<bool>,
    pub configurable: Option<bool>,
}

impl PropDesc {
    pub fn is_accessor(&self) -> bool {
        self.get.is_some() || self.set.is_some()
    }

    pub fn is_data(&self) -> bool {
        self.value.is_some() || self.writable.is_some()
    }

    pub fn is_generic(&self) -> bool {
        !self.is_accessor() && !self.is_data()
    }
}

// ----------------------------------------------------------------------
// Raw own-property helpers
// ----------------------------------------------------------------------

pub(crate) fn find_own(heap: &Heap, obj: ObjId, key: StrId) -> Find {
    let hash = heap.hstr(key).hash;
    heap.hobj(obj).props.find(key, hash)
}

/// Own entries-part plain value; `None` for absent keys and accessors.
pub(crate) fn get_own_plain(heap: &Heap, obj: ObjId, key: StrId) -> Option<TVal> {
    let f = find_own(heap, obj, key);
    let i = f.e_idx?;
    let t = &heap.hobj(obj).props;
    if t.flags(i) & PROPF_ACCESSOR != 0 {
        return None;
    }
    Some(t.value(i))
}

/// Raw own-property write with explicit flags: no special behaviors, no
/// extensibility or writability checks. Used for internal keys and
/// object bootstrap.
pub(crate) fn put_own_flags(heap: &mut Heap, obj: ObjId, key: StrId, value: TVal, flags: u8) {
    let i = ensure_entry(heap, obj, key);
    heap.incref(value);
    // Rewrite the slot before dropping old references; a drop can run a
    // finalizer that re-enters this object.
    let (old, old_acc) = {
        let t = &heap.hobj(obj).props;
        let fl = t.flags(i);
        if fl & PROPF_ACCESSOR != 0 {
            (None, Some(t.accessor(i)))
        } else {
            (Some(t.value(i)), None)
        }
    };
    {
        let t = &mut heap.hobj_mut(obj).props;
        t.set_value(i, value);
        t.set_flags(i, flags & !PROPF_ACCESSOR);
    }
    if let Some(a) = old_acc {
        drop_accessor_refs(heap, a);
    }
    if let Some(old) = old {
        heap.decref(old);
    }
}

/// Internal-keyed bookkeeping property: writable, hidden, non-configurable.
pub(crate) fn put_own_internal(heap: &mut Heap, obj: ObjId, key: StrId, value: TVal) {
    put_own_flags(heap, obj, key, value, PROPF_WRITABLE);
}

/// Remove an own internal property if present.
pub(crate) fn delete_own_raw(heap: &mut Heap, obj: ObjId, key: StrId) {
    let f = find_own(heap, obj, key);
    let Some(i) = f.e_idx else { return };
    remove_entry(heap, obj, i, f.h_idx);
}

fn drop_accessor_refs(heap: &mut Heap, a: AccessorSlot) {
    if let Some(g) = a.get {
        heap.decref_obj(g);
    }
    if let Some(s) = a.set {
        heap.decref_obj(s);
    }
}

fn remove_entry(heap: &mut Heap, obj: ObjId, i: u32, h_idx: Option<u32>) {
    // Clear the table first: the dropped references may run finalizers
    // that re-enter this object.
    let (key, plain, acc) = {
        let t = &heap.hobj(obj).props;
        let fl = t.flags(i);
        if fl & PROPF_ACCESSOR != 0 {
            (t.key(i), None, Some(t.accessor(i)))
        } else {
            (t.key(i), Some(t.value(i)), None)
        }
    };
    heap.hobj_mut(obj).props.delete_entry(i, h_idx);
    if let Some(a) = acc {
        drop_accessor_refs(heap, a);
    }
    if let Some(v) = plain {
        heap.decref(v);
    }
    if let Some(k) = key {
        heap.decref_str(k);
    }
}

/// Find the entry for `key`, appending a fresh one (growing the table as
/// needed) when absent. Returns the entry index.
pub(crate) fn ensure_entry(heap: &mut Heap, obj: ObjId, key: StrId) -> u32 {
    let f = find_own(heap, obj, key);
    if let Some(i) = f.e_idx {
        return i;
    }
    {
        let t = &heap.hobj(obj).props;
        if t.e_used() >= t.e_size() {
            grow_entries(heap, obj);
        }
    }
    heap.incref_str(key);
    let hash = heap.hstr(key).hash;
    heap.hobj_mut(obj).props.append_entry(key, hash, 0)
}

fn live_entry_count(t: &PropTable) -> u32 {
    (0..t.e_used()).filter(|&i| t.key(i).is_some()).count() as u32
}

fn grow_entries(heap: &mut Heap, obj: ObjId) {
    let (live, a_size) = {
        let t = &heap.hobj(obj).props;
        (live_entry_count(t), t.a_size())
    };
    let new_e = live + (live >> 2) + 4;
    let new_h = hash_size_for(new_e);
    realloc_props(heap, obj, new_e, a_size, new_h, false);
}

fn hash_size_for(e_size: u32) -> u32 {
    if e_size >= HASH_BUILD_LIMIT {
        next_hash_prime(e_size + (e_size >> 2))
    } else {
        0
    }
}

// ----------------------------------------------------------------------
// Table reallocation, array abandonment, compaction
// ----------------------------------------------------------------------

/// Rebuild the object's property block with new part sizes, compacting
/// entry holes. With `abandon_array` the array part is dissolved into
/// index-keyed entries carrying full default attributes.
pub(crate) fn realloc_props(
    heap: &mut Heap,
    obj: ObjId,
    new_e: u32,
    new_a: u32,
    new_h: u32,
    abandon_array: bool,
) {
    // An emergency cycle triggered by these allocations must not rebuild
    // property tables underneath us.
    let saved_base = heap.ms_base_flags;
    heap.ms_base_flags |= MS_FLAG_NO_OBJECT_COMPACTION;

    // Abandoned array elements become entries; intern their keys first
    // (each intern can allocate). Keys hold a temporary ref.
    let mut abandoned: Vec<(StrId, TVal)> = Vec::new();
    if abandon_array {
        let a_size = heap.hobj(obj).props.a_size();
        for i in 0..a_size {
            let v = heap.hobj(obj).props.arr_get(i);
            if v.is_undefined() {
                continue;
            }
            let key = intern_u32(heap, i);
            heap.temp_root(TVal::string(key));
            abandoned.push((key, v));
        }
    }

    let need_e = {
        let t = &heap.hobj(obj).props;
        live_entry_count(t) + abandoned.len() as u32
    };
    let new_e = new_e.max(need_e);
    let new_h = if new_h > 0 { new_h } else { hash_size_for(new_e) };

    let block_size = PropTable::block_size(new_e, new_a, new_h);
    let block = alloc::alloc_checked(heap, block_size.max(1));
    // Safety: fresh block of block_size bytes.
    let mut new_t = unsafe { PropTable::from_block(block, new_e, new_a, new_h) };

    {
        let old_t = &heap.hobj(obj).props;

        // Entries, holes squeezed out, insertion order kept.
        for i in 0..old_t.e_used() {
            let Some(key) = old_t.key(i) else { continue };
            let hash = heap.hstr(key).hash;
            let ni = new_t.append_entry(key, hash, old_t.flags(i));
            if old_t.flags(i) & PROPF_ACCESSOR != 0 {
                new_t.set_accessor(ni, old_t.accessor(i));
                new_t.set_flags(ni, old_t.flags(i));
            } else {
                new_t.set_value(ni, old_t.value(i));
            }
        }

        // Array part carry-over.
        if !abandon_array {
            for i in 0..old_t.a_size().min(new_a) {
                new_t.arr_set(i, old_t.arr_get(i));
            }
        }
    }

    // Dropped array tail (shrink without abandon) loses its refs; in the
    // abandon case every element ref moves into an entry instead.
    let mut dropped: Vec<TVal> = Vec::new();
    if !abandon_array {
        let old_t = &heap.hobj(obj).props;
        for i in new_a..old_t.a_size() {
            let v = old_t.arr_get(i);
            if !v.is_undefined() {
                dropped.push(v);
            }
        }
    }

    for (key, v) in &abandoned {
        let hash = heap.hstr(*key).hash;
        let ni = new_t.append_entry(*key, hash, PROPF_DEFAULT_DATA);
        new_t.set_value(ni, *v);
        heap.incref_str(*key); // entry's own key ref
        // The entry inherits the value ref previously held by the array
        // slot.
    }

    let old_block = heap.hobj_mut(obj).props.replace_with(new_t);
    alloc::free(heap, old_block);
    for _ in &abandoned {
        heap.untemp_root();
    }

    if abandon_array {
        heap.hobj_mut(obj).hdr.clear(OBJF_ARRAY_PART);
    }
    for v in dropped {
        heap.decref(v);
    }

    heap.ms_base_flags = saved_base;
    trace!(
        obj = obj.raw(),
        new_e,
        new_a,
        new_h,
        abandon_array,
        "property table rebuilt"
    );
}

/// Dissolve the array part into entries.
pub(crate) fn abandon_array_part(heap: &mut Heap, obj: ObjId) {
    debug_assert!(heap.hobj(obj).has_array_part());
    let e_size = heap.hobj(obj).props.e_size();
    realloc_props(heap, obj, e_size, 0, 0, true);
}

/// Rebuild the table at minimum viable sizes: drop the hash part when
/// entries fall below the build threshold, shrink the array part to the
/// highest used index + 1.
pub(crate) fn compact_props(heap: &mut Heap, obj: ObjId) {
    let (live, tight_a, has_array) = {
        let o = heap.hobj(obj);
        let t = &o.props;
        let mut tight_a = 0;
        for i in (0..t.a_size()).rev() {
            if !t.arr_get(i).is_undefined() {
                tight_a = i + 1;
                break;
            }
        }
        (live_entry_count(t), tight_a, o.has_array_part())
    };
    let new_a = if has_array { tight_a } else { 0 };
    realloc_props(heap, obj, live, new_a, hash_size_for(live), false);
}

// ----------------------------------------------------------------------
// Key coercion helpers
// ----------------------------------------------------------------------

/// Intern the canonical decimal form of a u32.
pub(crate) fn intern_u32(heap: &mut Heap, v: u32) -> StrId {
    let mut buf = [0u8; 10];
    let mut n = v;
    let mut i = buf.len();
    loop {
        i -= 1;
        buf[i] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    crate::strtab::intern(heap, &buf[i..])
}

/// Array-index view of a key cell: a whole number in [0, 2^32-2] or a
/// canonical numeric string.
fn key_array_index(heap: &Heap, key: TVal) -> Option<u32> {
    match key.tag() {
        Tag::Number => {
            let n = key.as_number()?;
            if n.fract() == 0.0 && n >= 0.0 && n < 4294967295.0 {
                Some(n as u32)
            } else {
                None
            }
        }
        Tag::String => heap.hstr(key.as_string()?).array_index(),
        _ => None,
    }
}

/// Coerce an arbitrary key cell to an interned string. Object keys go
/// through ToPrimitive/ToString, which may call script.
pub(crate) fn coerce_key(heap: &mut Heap, key: TVal) -> Result<StrId, Unwind> {
    crate::coerce::to_string_intern(heap, key)
}

// ----------------------------------------------------------------------
// [[Get]]
// ----------------------------------------------------------------------

/// `get(receiver, key)`: full ES5.1 [[Get]] with primitive bases and
/// special behaviors. Pushes the result onto the value stack.
pub(crate) fn get_prop(heap: &mut Heap, obj_tv: TVal, key_tv: TVal) -> Result<(), Unwind> {
    match obj_tv.tag() {
        Tag::Undefined | Tag::Null => {
            Err(type_error(heap, "invalid base reference for property read"))
        }
        Tag::String => {
            let sid = obj_tv.as_string().expect("tag/string mismatch");
            if let Some(idx) = key_array_index(heap, key_tv) {
                if let Some(ch) = string_char_at(heap, sid, idx) {
                    let id = crate::strtab::intern(heap, &ch);
                    return heap.push(TVal::string(id));
                }
                return heap.push(TVal::undefined());
            }
            let key = coerce_key(heap, key_tv)?;
            if key == heap.bstr(Bstr::Length) {
                let clen = heap.hstr(sid).clen;
                return heap.push(TVal::number(clen as f64));
            }
            heap.push(TVal::undefined())
        }
        Tag::Buffer => {
            let bid = obj_tv.as_buffer().expect("tag/buffer mismatch");
            if let Some(idx) = key_array_index(heap, key_tv) {
                let b = heap.hbuf(bid);
                if (idx as usize) < b.size() {
                    let v = b.as_slice()[idx as usize];
                    return heap.push(TVal::number(v as f64));
                }
                return heap.push(TVal::undefined());
            }
            let key = coerce_key(heap, key_tv)?;
            if key == heap.bstr(Bstr::Length) {
                let size = heap.hbuf(bid).size();
                return heap.push(TVal::number(size as f64));
            }
            heap.push(TVal::undefined())
        }
        Tag::Boolean | Tag::Number | Tag::Pointer => heap.push(TVal::undefined()),
        Tag::Object => {
            let obj = obj_tv.as_object().expect("tag/object mismatch");
            get_prop_obj(heap, obj, obj_tv, key_tv)
        }
    }
}

fn get_prop_obj(heap: &mut Heap, obj: ObjId, receiver: TVal, key_tv: TVal) -> Result<(), Unwind> {
    // Dense array fast path.
    if let Some(idx) = key_array_index(heap, key_tv) {
        if heap.hobj(obj).has_array_part() {
            let t = &heap.hobj(obj).props;
            if idx < t.a_size() {
                let v = t.arr_get(idx);
                if !v.is_undefined() {
                    return heap.push(v);
                }
            }
        }
    }

    let key = coerce_key(heap, key_tv)?;
    heap.temp_root(TVal::string(key));
    let r = get_prop_obj_keyed(heap, obj, receiver, key);
    heap.untemp_root();
    r
}

fn get_prop_obj_keyed(
    heap: &mut Heap,
    obj: ObjId,
    receiver: TVal,
    key: StrId,
) -> Result<(), Unwind> {
    // Arguments parameter map reflects the bound register/binding.
    if heap.hobj(obj).hdr.has(OBJF_SPECIAL_ARGUMENTS) {
        if let Some((env, name)) = args_map_lookup(heap, obj, key) {
            if crate::env::getvar_binding(heap, env, name)? {
                return Ok(());
            }
        }
    }

    let mut cur = Some(obj);
    for _ in 0..PROTO_SANITY_LIMIT {
        let Some(c) = cur else { break };
        // String object index/length behavior surfaces the boxed string.
        if heap.hobj(c).hdr.has(OBJF_SPECIAL_STRINGOBJ) {
            if let Some(v) = stringobj_index_get(heap, c, key)? {
                return heap.push(v);
            }
        }
        if heap.hobj(c).has_array_part() {
            if let Some(idx) = heap.hstr(key).array_index() {
                let t = &heap.hobj(c).props;
                if idx < t.a_size() {
                    let v = t.arr_get(idx);
                    if !v.is_undefined() {
                        return heap.push(v);
                    }
                }
            }
        }
        let f = find_own(heap, c, key);
        if let Some(i) = f.e_idx {
            let fl = heap.hobj(c).props.flags(i);
            if fl & PROPF_ACCESSOR != 0 {
                let a = heap.hobj(c).props.accessor(i);
                return match a.get {
                    Some(getter) => crate::call::call_accessor(heap, getter, receiver, None),
                    None => heap.push(TVal::undefined()),
                };
            }
            let v = heap.hobj(c).props.value(i);
            return heap.push(v);
        }
        cur = heap.hobj(c).prototype;
    }
    heap.push(TVal::undefined())
}

fn string_char_at(heap: &Heap, sid: StrId, char_idx: u32) -> Option<Vec<u8>> {
    let s = heap.hstr(sid);
    if char_idx >= s.clen {
        return None;
    }
    let bytes = s.as_bytes();
    let mut count = 0u32;
    let mut start = None;
    for (i, &b) in bytes.iter().enumerate() {
        if b & 0xC0 != 0x80 {
            if count == char_idx {
                start = Some(i);
            } else if start.is_some() {
                return Some(bytes[start.expect("start set")..i].to_vec());
            }
            count += 1;
        }
    }
    start.map(|s0| bytes[s0..].to_vec())
}

fn stringobj_index_get(heap: &mut Heap, obj: ObjId, key: StrId) -> Result<Option<TVal>, Unwind> {
    let val_key = heap.bstr(Bstr::IntValue);
    let Some(boxed) = get_own_plain(heap, obj, val_key).and_then(|v| v.as_string()) else {
        return Ok(None);
    };
    if key == heap.bstr(Bstr::Length) {
        let clen = heap.hstr(boxed).clen;
        return Ok(Some(TVal::number(clen as f64)));
    }
    if let Some(idx) = heap.hstr(key).array_index() {
        if let Some(ch) = string_char_at(heap, boxed, idx) {
            let id = crate::strtab::intern(heap, &ch);
            return Ok(Some(TVal::string(id)));
        }
    }
    Ok(None)
}

// ----------------------------------------------------------------------
// [[Put]]
// ----------------------------------------------------------------------

/// `put(receiver, key, value, strict)`: ES5.1 [[Put]] with setter
/// discovery along the prototype chain and the Array/Arguments special
/// cases. Strict violations throw `TypeError`; non-strict ones no-op.
pub(crate) fn put_prop(
    heap: &mut Heap,
    obj_tv: TVal,
    key_tv: TVal,
    val: TVal,
    strict: bool,
) -> Result<(), Unwind> {
    let obj = match obj_tv.tag() {
        Tag::Undefined | Tag::Null => {
            return Err(type_error(heap, "invalid base reference for property write"));
        }
        Tag::Object => obj_tv.as_object().expect("tag/object mismatch"),
        _ => {
            if strict {
                return Err(type_error(heap, "non-object base reference"));
            }
            return Ok(());
        }
    };

    // Array index / length special behavior.
    if heap.hobj(obj).hdr.has(OBJF_SPECIAL_ARRAY) {
        let key_is_length = match key_tv.as_string() {
            Some(s) => s == heap.bstr(Bstr::Length),
            None => false,
        };
        if key_is_length {
            return set_array_length(heap, obj, val, strict);
        }
        if let Some(idx) = key_array_index(heap, key_tv) {
            return array_index_put(heap, obj, idx, val, strict);
        }
    }

    let key = coerce_key(heap, key_tv)?;
    heap.temp_root(TVal::string(key));
    let r = put_prop_keyed(heap, obj, key, val, strict);
    heap.untemp_root();
    r
}

fn put_prop_keyed(
    heap: &mut Heap,
    obj: ObjId,
    key: StrId,
    val: TVal,
    strict: bool,
) -> Result<(), Unwind> {
    // Arguments map write-through.
    if heap.hobj(obj).hdr.has(OBJF_SPECIAL_ARGUMENTS) {
        if let Some((env, name)) = args_map_lookup(heap, obj, key) {
            crate::env::putvar_binding(heap, env, name, val)?;
            // fall through: the own data property is kept in sync too
        }
    }

    // Non-special array-part fast path for dense writes.
    if heap.hobj(obj).has_array_part() && !heap.hobj(obj).hdr.has(OBJF_SPECIAL_ARRAY) {
        if let Some(idx) = heap.hstr(key).array_index() {
            if try_array_put(heap, obj, idx, val) {
                return Ok(());
            }
        }
    }

    put_prop_walk(heap, obj, key, val, strict)
}

fn put_prop_walk(
    heap: &mut Heap,
    obj: ObjId,
    key: StrId,
    val: TVal,
    strict: bool,
) -> Result<(), Unwind> {
    // Own property shadows everything.
    let f = find_own(heap, obj, key);
    if let Some(i) = f.e_idx {
        let fl = heap.hobj(obj).props.flags(i);
        if fl & PROPF_ACCESSOR != 0 {
            let a = heap.hobj(obj).props.accessor(i);
            return match a.set {
                Some(setter) => {
                    crate::call::call_accessor(heap, setter, TVal::object(obj), Some(val))
                }
                None => {
                    if strict {
                        Err(type_error(heap, "setter undefined"))
                    } else {
                        Ok(())
                    }
                }
            };
        }
        if fl & PROPF_WRITABLE == 0 {
            if strict {
                return Err(type_error(heap, "property not writable"));
            }
            return Ok(());
        }
        heap.incref(val);
        let old = heap.hobj(obj).props.value(i);
        heap.hobj_mut(obj).props.set_value(i, val);
        heap.decref(old);
        return Ok(());
    }

    // Setter / writability discovery along the prototype chain.
    let mut cur = heap.hobj(obj).prototype;
    for _ in 0..PROTO_SANITY_LIMIT {
        let Some(c) = cur else { break };
        let f = find_own(heap, c, key);
        if let Some(i) = f.e_idx {
            let fl = heap.hobj(c).props.flags(i);
            if fl & PROPF_ACCESSOR != 0 {
                let a = heap.hobj(c).props.accessor(i);
                return match a.set {
                    Some(setter) => {
                        crate::call::call_accessor(heap, setter, TVal::object(obj), Some(val))
                    }
                    None => {
                        if strict {
                            Err(type_error(heap, "setter undefined"))
                        } else {
                            Ok(())
                        }
                    }
                };
            }
            if fl & PROPF_WRITABLE == 0 {
                if strict {
                    return Err(type_error(heap, "property not writable"));
                }
                return Ok(());
            }
            break;
        }
        cur = heap.hobj(c).prototype;
    }

    // Create an own property on the receiver.
    if !heap.hobj(obj).is_extensible() {
        if strict {
            return Err(type_error(heap, "object not extensible"));
        }
        return Ok(());
    }
    put_own_flags(heap, obj, key, val, PROPF_DEFAULT_DATA);
    Ok(())
}

/// Attempt a dense array-part write; false means the caller should take
/// the entries path (sparse write, explicit undefined, or abandoned).
fn try_array_put(heap: &mut Heap, obj: ObjId, idx: u32, val: TVal) -> bool {
    if val.is_undefined() {
        // Presence of an explicit undefined element cannot be represented
        // in the dense part.
        abandon_array_part(heap, obj);
        return false;
    }
    let a_size = heap.hobj(obj).props.a_size();
    if idx < a_size {
        heap.incref(val);
        let old = heap.hobj(obj).props.arr_get(idx);
        heap.hobj_mut(obj).props.arr_set(idx, val);
        heap.decref(old);
        return true;
    }
    // Growth with a density check: abandon when the part would fall
    // below 25% occupancy.
    let required = idx as u64 + 1;
    let used = {
        let t = &heap.hobj(obj).props;
        (0..t.a_size()).filter(|&i| !t.arr_get(i).is_undefined()).count() as u64 + 1
    };
    if used * 4 < required {
        abandon_array_part(heap, obj);
        return false;
    }
    let new_a = (idx + 1) + ((idx + 1) >> 2) + 4;
    let (e_size, h_size) = {
        let t = &heap.hobj(obj).props;
        (t.e_size(), t.h_size())
    };
    realloc_props(heap, obj, e_size, new_a, h_size, false);
    heap.incref(val);
    heap.hobj_mut(obj).props.arr_set(idx, val);
    true
}

// ----------------------------------------------------------------------
// Array length contract
// ----------------------------------------------------------------------

fn array_length(heap: &Heap, obj: ObjId) -> u32 {
    let key = heap.builtin_strs[Bstr::Length as usize];
    let f = heap.hobj(obj).props.find(key, heap.hstr(key).hash);
    match f.e_idx {
        Some(i) => heap
            .hobj(obj)
            .props
            .value(i)
            .as_number()
            .map(|n| n as u32)
            .unwrap_or(0),
        None => 0,
    }
}

fn store_array_length(heap: &mut Heap, obj: ObjId, len: u32) {
    let key = heap.bstr(Bstr::Length);
    let i = ensure_entry(heap, obj, key);
    let t = &mut heap.hobj_mut(obj).props;
    t.set_value(i, TVal::number(len as f64));
    t.set_flags(i, PROPF_WRITABLE);
}

/// `length` assignment: validate as a uint32, truncate on shrink.
fn set_array_length(heap: &mut Heap, obj: ObjId, val: TVal, strict: bool) -> Result<(), Unwind> {
    let n = crate::coerce::to_number_value(heap, val)?;
    let len32 = n as u32;
    if (len32 as f64) != n {
        return Err(range_error(heap, "invalid array length"));
    }
    let writable = {
        let key = heap.bstr(Bstr::Length);
        match find_own(heap, obj, key).e_idx {
            Some(i) => heap.hobj(obj).props.flags(i) & PROPF_WRITABLE != 0,
            None => true,
        }
    };
    if !writable {
        if strict {
            return Err(type_error(heap, "property not writable"));
        }
        return Ok(());
    }
    let old_len = array_length(heap, obj);
    if len32 < old_len {
        truncate_array(heap, obj, len32);
    }
    store_array_length(heap, obj, len32);
    Ok(())
}

fn truncate_array(heap: &mut Heap, obj: ObjId, new_len: u32) {
    // Dense part: clear slots at or above the new length.
    let a_size = heap.hobj(obj).props.a_size();
    for i in new_len..a_size {
        let old = heap.hobj(obj).props.arr_get(i);
        if !old.is_undefined() {
            heap.hobj_mut(obj).props.arr_set(i, TVal::undefined());
            heap.decref(old);
        }
    }
    // Entries part: delete configurable index keys at or above the new
    // length (scan; index keys only exist after abandonment).
    let keys: Vec<(u32, StrId)> = heap.hobj(obj).props.entry_keys();
    for (_, key) in keys {
        let Some(idx) = heap.hstr(key).array_index() else {
            continue;
        };
        if idx >= new_len {
            let f = find_own(heap, obj, key);
            if let Some(i) = f.e_idx {
                remove_entry(heap, obj, i, f.h_idx);
            }
        }
    }
}

/// Index assignment on a special array: store, then auto-grow `length`.
fn array_index_put(
    heap: &mut Heap,
    obj: ObjId,
    idx: u32,
    val: TVal,
    strict: bool,
) -> Result<(), Unwind> {
    if !heap.hobj(obj).has_array_part() || !try_array_put(heap, obj, idx, val) {
        let key = intern_u32(heap, idx);
        heap.temp_root(TVal::string(key));
        let r = put_prop_walk(heap, obj, key, val, strict);
        heap.untemp_root();
        r?;
    }
    let len = array_length(heap, obj);
    if idx >= len {
        store_array_length(heap, obj, idx + 1);
    }
    Ok(())
}

// ----------------------------------------------------------------------
// [[Delete]] / [[HasProperty]]
// ----------------------------------------------------------------------

/// `delete(key, strict)`: true when the property is absent or removed;
/// strict delete of a non-configurable own property throws.
pub(crate) fn del_prop(
    heap: &mut Heap,
    obj_tv: TVal,
    key_tv: TVal,
    strict: bool,
) -> Result<bool, Unwind> {
    let obj = match obj_tv.tag() {
        Tag::Undefined | Tag::Null => {
            return Err(type_error(heap, "invalid base reference for delete"));
        }
        Tag::Object => obj_tv.as_object().expect("tag/object mismatch"),
        _ => return Ok(true),
    };

    // Dense array element: implicitly configurable.
    if let Some(idx) = key_array_index(heap, key_tv) {
        if heap.hobj(obj).has_array_part() {
            let a_size = heap.hobj(obj).props.a_size();
            if idx < a_size {
                let old = heap.hobj(obj).props.arr_get(idx);
                if !old.is_undefined() {
                    heap.hobj_mut(obj).props.arr_set(idx, TVal::undefined());
                    heap.decref(old);
                }
                return Ok(true);
            }
        }
    }

    let key = coerce_key(heap, key_tv)?;
    heap.temp_root(TVal::string(key));
    let r = (|| {
        if heap.hobj(obj).hdr.has(OBJF_SPECIAL_ARGUMENTS) {
            args_sever_map_entry(heap, obj, key);
        }

        let f = find_own(heap, obj, key);
        let Some(i) = f.e_idx else { return Ok(true) };
        if heap.hobj(obj).props.flags(i) & PROPF_CONFIGURABLE == 0 {
            if strict {
                return Err(type_error(heap, "property not configurable"));
            }
            return Ok(false);
        }
        remove_entry(heap, obj, i, f.h_idx);
        Ok(true)
    })();
    heap.untemp_root();
    r
}

/// `has(key)`: own or inherited presence.
pub(crate) fn has_prop(heap: &mut Heap, obj_tv: TVal, key_tv: TVal) -> Result<bool, Unwind> {
    let obj = match obj_tv.tag() {
        Tag::Object => obj_tv.as_object().expect("tag/object mismatch"),
        Tag::Undefined | Tag::Null => {
            return Err(type_error(heap, "invalid base reference for property test"));
        }
        Tag::String => {
            let sid = obj_tv.as_string().expect("tag/string mismatch");
            if let Some(idx) = key_array_index(heap, key_tv) {
                return Ok(idx < heap.hstr(sid).clen);
            }
            let key = coerce_key(heap, key_tv)?;
            return Ok(key == heap.bstr(Bstr::Length));
        }
        _ => return Ok(false),
    };

    let idx = key_array_index(heap, key_tv);
    let key = coerce_key(heap, key_tv)?;
    let mut cur = Some(obj);
    for _ in 0..PROTO_SANITY_LIMIT {
        let Some(c) = cur else { break };
        if let Some(idx) = idx {
            if heap.hobj(c).has_array_part() {
                let t = &heap.hobj(c).props;
                if idx < t.a_size() && !t.arr_get(idx).is_undefined() {
                    return Ok(true);
                }
            }
            if heap.hobj(c).hdr.has(OBJF_SPECIAL_STRINGOBJ) {
                let val_key = heap.bstr(Bstr::IntValue);
                if let Some(b) = get_own_plain(heap, c, val_key).and_then(|v| v.as_string()) {
                    if idx < heap.hstr(b).clen {
                        return Ok(true);
                    }
                }
            }
        }
        if find_own(heap, c, key).e_idx.is_some() {
            return Ok(true);
        }
        cur = heap.hobj(c).prototype;
    }
    Ok(false)
}

// ----------------------------------------------------------------------
// [[DefineOwnProperty]]
// ----------------------------------------------------------------------

fn reject(heap: &mut Heap, throw: bool, msg: &str) -> Result<bool, Unwind> {
    if throw {
        Err(type_error(heap, msg))
    } else {
        Ok(false)
    }
}

/// Full ES5.1 §8.12.9 semantics: descriptor validation, merging, and
/// data↔accessor transitions. May abandon the array part when an index
/// property needs non-default attributes.
pub(crate) fn define_property(
    heap: &mut Heap,
    obj: ObjId,
    key: StrId,
    desc: PropDesc,
    throw: bool,
) -> Result<bool, Unwind> {
    // Index define on a dense object: keep the fast path only for plain
    // fully-default data descriptors.
    if heap.hobj(obj).has_array_part() {
        if let Some(idx) = heap.hstr(key).array_index() {
            let plain_default = !desc.is_accessor()
                && desc.value.is_some()
                && desc.writable != Some(false)
                && desc.enumerable != Some(false)
                && desc.configurable != Some(false);
            if plain_default {
                if try_array_put(heap, obj, idx, desc.value.expect("value present")) {
                    if heap.hobj(obj).hdr.has(OBJF_SPECIAL_ARRAY) {
                        let len = array_length(heap, obj);
                        if idx >= len {
                            store_array_length(heap, obj, idx + 1);
                        }
                    }
                    return Ok(true);
                }
            } else {
                abandon_array_part(heap, obj);
            }
        }
    }

    if heap.hobj(obj).hdr.has(OBJF_SPECIAL_ARGUMENTS) {
        // Redefinition severs the parameter map for this key.
        if desc.is_accessor() || desc.value.is_some() || desc.writable == Some(false) {
            args_sever_map_entry(heap, obj, key);
        }
    }

    let f = find_own(heap, obj, key);
    let Some(i) = f.e_idx else {
        // New property on a (hopefully) extensible object.
        if !heap.hobj(obj).is_extensible() {
            return reject(heap, throw, "object not extensible");
        }
        let mut flags = 0u8;
        if desc.writable == Some(true) {
            flags |= PROPF_WRITABLE;
        }
        if desc.enumerable == Some(true) {
            flags |= PROPF_ENUMERABLE;
        }
        if desc.configurable == Some(true) {
            flags |= PROPF_CONFIGURABLE;
        }
        let i = ensure_entry(heap, obj, key);
        if desc.is_accessor() {
            let a = AccessorSlot {
                get: desc.get.flatten(),
                set: desc.set.flatten(),
            };
            if let Some(g) = a.get {
                heap.incref_obj(g);
            }
            if let Some(s) = a.set {
                heap.incref_obj(s);
            }
            let t = &mut heap.hobj_mut(obj).props;
            t.set_accessor(i, a);
            t.set_flags(i, (flags & !PROPF_WRITABLE) | PROPF_ACCESSOR);
        } else {
            let v = desc.value.unwrap_or(TVal::undefined());
            heap.incref(v);
            let t = &mut heap.hobj_mut(obj).props;
            t.set_value(i, v);
            t.set_flags(i, flags);
        }
        return Ok(true);
    };

    let cur_flags = heap.hobj(obj).props.flags(i);
    let cur_is_accessor = cur_flags & PROPF_ACCESSOR != 0;
    let cur_configurable = cur_flags & PROPF_CONFIGURABLE != 0;

    // §8.12.9 step 5: absent-everything descriptor succeeds trivially.
    if desc.is_generic() && desc.enumerable.is_none() && desc.configurable.is_none() {
        return Ok(true);
    }

    if !cur_configurable {
        if desc.configurable == Some(true) {
            return reject(heap, throw, "property not configurable");
        }
        if let Some(e) = desc.enumerable {
            if e != (cur_flags & PROPF_ENUMERABLE != 0) {
                return reject(heap, throw, "property not configurable");
            }
        }
        if desc.is_accessor() != cur_is_accessor && (desc.is_accessor() || desc.is_data()) {
            return reject(heap, throw, "property not configurable");
        }
        if !cur_is_accessor && desc.is_data() {
            let cur_writable = cur_flags & PROPF_WRITABLE != 0;
            if !cur_writable {
                if desc.writable == Some(true) {
                    return reject(heap, throw, "property not configurable");
                }
                if let Some(v) = desc.value {
                    let cur_v = heap.hobj(obj).props.value(i);
                    if !crate::coerce::same_value(heap, v, cur_v) {
                        return reject(heap, throw, "property not configurable");
                    }
                }
            }
        }
        if cur_is_accessor && desc.is_accessor() {
            let a = heap.hobj(obj).props.accessor(i);
            if let Some(g) = desc.get {
                if g != a.get {
                    return reject(heap, throw, "property not configurable");
                }
            }
            if let Some(s) = desc.set {
                if s != a.set {
                    return reject(heap, throw, "property not configurable");
                }
            }
        }
    }

    // Apply: possibly transitioning representation.
    let mut new_flags = cur_flags;
    if let Some(w) = desc.writable {
        new_flags = if w {
            new_flags | PROPF_WRITABLE
        } else {
            new_flags & !PROPF_WRITABLE
        };
    }
    if let Some(e) = desc.enumerable {
        new_flags = if e {
            new_flags | PROPF_ENUMERABLE
        } else {
            new_flags & !PROPF_ENUMERABLE
        };
    }
    if let Some(c) = desc.configurable {
        new_flags = if c {
            new_flags | PROPF_CONFIGURABLE
        } else {
            new_flags & !PROPF_CONFIGURABLE
        };
    }

    if desc.is_accessor() {
        // Representation transition: rewrite the slot fully before any
        // reference is dropped (dropped refs can run finalizers).
        let (old_accessor, old_value) = if cur_is_accessor {
            (Some(heap.hobj(obj).props.accessor(i)), None)
        } else {
            (None, Some(heap.hobj(obj).props.value(i)))
        };
        let merged = AccessorSlot {
            get: desc
                .get
                .unwrap_or_else(|| old_accessor.map(|a| a.get).unwrap_or(None)),
            set: desc
                .set
                .unwrap_or_else(|| old_accessor.map(|a| a.set).unwrap_or(None)),
        };
        if let Some(g) = merged.get {
            heap.incref_obj(g);
        }
        if let Some(s) = merged.set {
            heap.incref_obj(s);
        }
        {
            let t = &mut heap.hobj_mut(obj).props;
            t.set_accessor(i, merged);
            t.set_flags(i, (new_flags & !PROPF_WRITABLE) | PROPF_ACCESSOR);
        }
        if let Some(a) = old_accessor {
            // Only refs replaced in the merged slot are dropped.
            if desc.get.is_some() {
                if let Some(g) = a.get {
                    heap.decref_obj(g);
                }
            }
            if desc.set.is_some() {
                if let Some(s) = a.set {
                    heap.decref_obj(s);
                }
            }
        }
        if let Some(v) = old_value {
            heap.decref(v);
        }
    } else if desc.is_data() {
        let old_accessor = if cur_is_accessor {
            let a = heap.hobj(obj).props.accessor(i);
            let t = &mut heap.hobj_mut(obj).props;
            t.set_value(i, TVal::undefined());
            t.set_flags(i, new_flags & !PROPF_ACCESSOR);
            Some(a)
        } else {
            None
        };
        if let Some(v) = desc.value {
            heap.incref(v);
            let old = if old_accessor.is_some() {
                TVal::undefined()
            } else {
                heap.hobj(obj).props.value(i)
            };
            heap.hobj_mut(obj).props.set_value(i, v);
            heap.decref(old);
        }
        {
            let t = &mut heap.hobj_mut(obj).props;
            t.set_flags(i, new_flags & !PROPF_ACCESSOR);
        }
        if let Some(a) = old_accessor {
            drop_accessor_refs(heap, a);
        }
    } else {
        // Generic: only attribute changes.
        let t = &mut heap.hobj_mut(obj).props;
        let keep = t.flags(i) & PROPF_ACCESSOR;
        t.set_flags(i, (new_flags & !PROPF_ACCESSOR) | keep);
    }

    // Special array: defining an index may auto-grow length.
    if heap.hobj(obj).hdr.has(OBJF_SPECIAL_ARRAY) {
        if let Some(idx) = heap.hstr(key).array_index() {
            let len = array_length(heap, obj);
            if idx >= len {
                store_array_length(heap, obj, idx + 1);
            }
        }
    }
    Ok(true)
}

// ----------------------------------------------------------------------
// Arguments parameter map
// ----------------------------------------------------------------------

fn args_map_lookup(heap: &mut Heap, obj: ObjId, key: StrId) -> Option<(ObjId, StrId)> {
    let map_key = heap.bstr(Bstr::IntMap);
    let map = get_own_plain(heap, obj, map_key)?.as_object()?;
    let entry = get_own_plain(heap, map, key)?.as_object()?;
    let env_key = heap.bstr(Bstr::IntLexenv);
    let name_key = heap.bstr(Bstr::IntName);
    let env = get_own_plain(heap, entry, env_key)?.as_object()?;
    let name = get_own_plain(heap, entry, name_key)?.as_string()?;
    Some((env, name))
}

/// Remove the index↔register bridge for one key (redefinition/delete).
fn args_sever_map_entry(heap: &mut Heap, obj: ObjId, key: StrId) {
    let map_key = heap.bstr(Bstr::IntMap);
    let Some(map) = get_own_plain(heap, obj, map_key).and_then(|v| v.as_object()) else {
        return;
    };
    delete_own_raw(heap, map, key);
}

// ----------------------------------------------------------------------
// Misc queries
// ----------------------------------------------------------------------

/// Finalizer presence (own or inherited), without side effects.
pub(crate) fn has_finalizer(heap: &Heap, obj: ObjId) -> bool {
    let key = heap.builtin_strs[Bstr::IntFinalizer as usize];
    let mut cur = Some(obj);
    for _ in 0..PROTO_SANITY_LIMIT {
        let Some(c) = cur else { return false };
        if find_own(heap, c, key).e_idx.is_some() {
            return true;
        }
        cur = heap.hobj(c).prototype;
    }
    false
}

/// Allocate a plain object with an array part of `len` undefined slots.
pub(crate) fn alloc_array_object(heap: &mut Heap, len: usize) -> ObjId {
    let obj = heap.alloc_object(OBJF_EXTENSIBLE | OBJF_ARRAY_PART, ObjClass::Array);
    heap.temp_root(TVal::object(obj));
    realloc_props(heap, obj, 0, len as u32, 0, false);
    heap.untemp_root();
    obj
}

/// Initialize one array slot of a freshly built array object.
pub(crate) fn array_init_slot(heap: &mut Heap, obj: ObjId, idx: u32, v: TVal) {
    heap.incref(v);
    let old = heap.hobj(obj).props.arr_get(idx);
    heap.hobj_mut(obj).props.arr_set(idx, v);
    heap.decref(old);
}

/// Set an object's prototype link with refcount maintenance.
pub(crate) fn set_prototype(heap: &mut Heap, obj: ObjId, proto: Option<ObjId>) {
    if let Some(p) = proto {
        heap.incref_obj(p);
    }
    let old = heap.hobj(obj).prototype;
    heap.hobj_mut(obj).prototype = proto;
    if let Some(p) = old {
        heap.decref_obj(p);
    }
}
