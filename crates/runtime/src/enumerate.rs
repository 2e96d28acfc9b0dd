//! Property enumeration
//!
//! `enumerate` materializes an enumerator object holding a key snapshot
//! chosen by flags. The snapshot is taken up front; `next` re-checks
//! presence so keys deleted mid-walk are skipped. Entries keep insertion
//! order; array indices come first in numeric order per level.

use std::collections::HashSet;

use eider_core::{ObjId, StrId, TVal, Tag};

use crate::error::{Unwind, type_error};
use crate::heap::{Bstr, Heap};
use crate::hobject::{OBJF_EXTENSIBLE, OBJF_SPECIAL_STRINGOBJ, ObjClass};
use crate::proptable::PROPF_ENUMERABLE;
use crate::props::{self, PROTO_SANITY_LIMIT};

/// Enumerate only the target's own properties.
pub const ENUM_OWN_PROPERTIES_ONLY: u32 = 1 << 0;
/// Include non-enumerable properties.
pub const ENUM_INCLUDE_NONENUMERABLE: u32 = 1 << 1;
/// Include internal-prefixed keys.
pub const ENUM_INCLUDE_INTERNAL: u32 = 1 << 2;
/// Yield only keys that parse as array indices.
pub const ENUM_ARRAY_INDICES_ONLY: u32 = 1 << 3;
/// Sort array-index keys numerically within each level.
pub const ENUM_SORT_ARRAY_INDICES: u32 = 1 << 4;

/// Build an enumerator for the value on top of the stack logic-wise:
/// takes the target as a cell, pushes the enumerator object.
pub(crate) fn create_enumerator(heap: &mut Heap, target: TVal, flags: u32) -> Result<(), Unwind> {
    let obj = match target.tag() {
        Tag::Object => target.as_object().expect("tag/object mismatch"),
        _ => return Err(type_error(heap, "cannot enumerate non-object")),
    };

    // snapshot_keys leaves one temp root per key.
    let keys = snapshot_keys(heap, obj, flags);

    let enum_obj = heap.alloc_object(OBJF_EXTENSIBLE, ObjClass::Object);
    heap.temp_root(TVal::object(enum_obj));

    let keys_arr = props::alloc_array_object(heap, keys.len());
    heap.temp_root(TVal::object(keys_arr));
    for (i, k) in keys.iter().enumerate() {
        props::array_init_slot(heap, keys_arr, i as u32, TVal::string(*k));
    }

    let k_target = heap.bstr(Bstr::IntTarget);
    props::put_own_internal(heap, enum_obj, k_target, target);
    let k_keys = heap.bstr(Bstr::IntEnumKeys);
    props::put_own_internal(heap, enum_obj, k_keys, TVal::object(keys_arr));
    let k_next = heap.bstr(Bstr::IntNext);
    props::put_own_internal(heap, enum_obj, k_next, TVal::number(0.0));

    let r = heap.push(TVal::object(enum_obj));
    heap.untemp_root(); // keys_arr
    heap.untemp_root(); // enum_obj
    for _ in &keys {
        heap.untemp_root();
    }
    r
}

/// Advance the enumerator: push the next key (and optionally the value)
/// and return true, or push nothing and return false at the end.
pub(crate) fn next(heap: &mut Heap, enum_obj: ObjId, get_value: bool) -> Result<bool, Unwind> {
    let k_target = heap.bstr(Bstr::IntTarget);
    let k_keys = heap.bstr(Bstr::IntEnumKeys);
    let k_next = heap.bstr(Bstr::IntNext);

    let Some(target) = props::get_own_plain(heap, enum_obj, k_target) else {
        return Err(type_error(heap, "not an enumerator"));
    };
    let Some(keys_arr) = props::get_own_plain(heap, enum_obj, k_keys).and_then(|v| v.as_object())
    else {
        return Err(type_error(heap, "not an enumerator"));
    };

    loop {
        let idx = props::get_own_plain(heap, enum_obj, k_next)
            .and_then(|v| v.as_number())
            .unwrap_or(0.0) as u32;
        let len = heap.hobj(keys_arr).props.a_size();
        if idx >= len {
            return Ok(false);
        }
        props::put_own_internal(heap, enum_obj, k_next, TVal::number((idx + 1) as f64));

        let key_tv = heap.hobj(keys_arr).props.arr_get(idx);
        // Deleted since the snapshot? Skip.
        if !props::has_prop(heap, target, key_tv)? {
            continue;
        }
        heap.push(key_tv)?;
        if get_value {
            props::get_prop(heap, target, key_tv)?;
        }
        return Ok(true);
    }
}

/// Collect the key snapshot; every returned key is left temp-rooted (one
/// root per key, popped by the caller once the keys are attached).
fn snapshot_keys(heap: &mut Heap, obj: ObjId, flags: u32) -> Vec<StrId> {
    let mut out: Vec<StrId> = Vec::new();
    let mut seen: HashSet<StrId> = HashSet::new();

    let mut cur = Some(obj);
    for _ in 0..PROTO_SANITY_LIMIT {
        let Some(c) = cur else { break };
        let mut level: Vec<(Option<u32>, StrId)> = Vec::new();

        // Boxed string indices (and virtual length).
        if heap.hobj(c).hdr.has(OBJF_SPECIAL_STRINGOBJ) {
            let k_value = heap.bstr(Bstr::IntValue);
            if let Some(b) = props::get_own_plain(heap, c, k_value).and_then(|v| v.as_string()) {
                let clen = heap.hstr(b).clen;
                for i in 0..clen {
                    let k = props::intern_u32(heap, i);
                    level.push((Some(i), k));
                }
                if flags & ENUM_INCLUDE_NONENUMERABLE != 0 && flags & ENUM_ARRAY_INDICES_ONLY == 0
                {
                    level.push((None, heap.bstr(Bstr::Length)));
                }
            }
        }

        // Dense array part, numeric order.
        let a_size = heap.hobj(c).props.a_size();
        for i in 0..a_size {
            if !heap.hobj(c).props.arr_get(i).is_undefined() {
                let k = props::intern_u32(heap, i);
                level.push((Some(i), k));
            }
        }

        // Entries part, insertion order.
        for (i, key) in heap.hobj(c).props.entry_keys() {
            let fl = heap.hobj(c).props.flags(i);
            if fl & PROPF_ENUMERABLE == 0 && flags & ENUM_INCLUDE_NONENUMERABLE == 0 {
                continue;
            }
            if heap.hstr(key).is_internal() && flags & ENUM_INCLUDE_INTERNAL == 0 {
                continue;
            }
            let idx = heap.hstr(key).array_index();
            level.push((idx, key));
        }

        if flags & ENUM_ARRAY_INDICES_ONLY != 0 {
            level.retain(|(idx, _)| idx.is_some());
        }
        if flags & ENUM_SORT_ARRAY_INDICES != 0 {
            level.sort_by_key(|(idx, _)| idx.unwrap_or(u32::MAX));
        }

        for (_, k) in level {
            if seen.insert(k) {
                heap.temp_root(TVal::string(k));
                out.push(k);
            }
        }

        if flags & ENUM_OWN_PROPERTIES_ONLY != 0 {
            break;
        }
        cur = heap.hobj(c).prototype;
    }
    out
}
