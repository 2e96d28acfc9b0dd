//! Diagnostic snapshots
//!
//! Plain-data views of heap and value state for logging and host
//! debugging: a serde-serializable heap summary, a recursive JSON value
//! snapshot (depth-bounded, buffers hex-encoded), and a compact one-line
//! rendering of an object's three-part property table.
//!
//! Never on a hot path; nothing here mutates the heap.

use eider_core::{ObjId, Tag};
use serde::Serialize;

use crate::heap::Heap;
use crate::proptable::PROPF_ACCESSOR;

/// Value snapshot recursion bound.
const SNAPSHOT_DEPTH: usize = 8;

/// Heap-wide counters.
#[derive(Debug, Clone, Serialize)]
pub struct HeapSnapshot {
    pub objects: usize,
    pub strings: usize,
    pub buffers: usize,
    pub strtab_size: u32,
    pub strtab_used: u32,
    pub valstack_top: usize,
    pub callstack_depth: usize,
    pub catchstack_depth: usize,
}

/// Capture the heap-wide counters.
pub fn heap_snapshot(heap: &Heap) -> HeapSnapshot {
    let thr = heap.thr();
    HeapSnapshot {
        objects: heap.object_count(),
        strings: heap.string_count(),
        buffers: heap.buffer_count(),
        strtab_size: heap.strtab.size(),
        strtab_used: heap.strtab.used(),
        valstack_top: thr.valstack_top,
        callstack_depth: thr.callstack.len(),
        catchstack_depth: thr.catchstack.len(),
    }
}

/// JSON view of the cell at a stack index; `null` for a bad index.
pub fn value_snapshot(heap: &Heap, index: i32) -> serde_json::Value {
    match heap.get_tval(index) {
        Some(tv) => tval_snapshot(heap, tv, 0),
        None => serde_json::Value::Null,
    }
}

fn tval_snapshot(heap: &Heap, tv: eider_core::TVal, depth: usize) -> serde_json::Value {
    use serde_json::{Value, json};
    match tv.tag() {
        Tag::Undefined => json!({"type": "undefined"}),
        Tag::Null => Value::Null,
        Tag::Boolean => json!(tv.as_boolean().expect("tag/boolean mismatch")),
        Tag::Number => {
            let n = tv.as_number().expect("tag/number mismatch");
            if n.is_finite() {
                json!(n)
            } else {
                json!({"type": "number", "repr": crate::numconv::stringify(n, 10, 0, 0)})
            }
        }
        Tag::String => {
            let s = heap.hstr(tv.as_string().expect("tag/string mismatch"));
            match s.as_str() {
                Some(utf8) => json!(utf8),
                None => json!({"type": "string", "hex": hex::encode(s.as_bytes())}),
            }
        }
        Tag::Buffer => {
            let b = heap.hbuf(tv.as_buffer().expect("tag/buffer mismatch"));
            json!({
                "type": "buffer",
                "dynamic": b.is_dynamic(),
                "size": b.size(),
                "hex": hex::encode(b.as_slice()),
            })
        }
        Tag::Pointer => {
            json!({"type": "pointer", "value": tv.as_pointer().expect("tag/pointer mismatch")})
        }
        Tag::Object => {
            let id = tv.as_object().expect("tag/object mismatch");
            if depth >= SNAPSHOT_DEPTH {
                return json!({"type": "object", "truncated": true});
            }
            object_snapshot(heap, id, depth)
        }
    }
}

fn object_snapshot(heap: &Heap, id: ObjId, depth: usize) -> serde_json::Value {
    use serde_json::json;
    let obj = heap.hobj(id);
    let mut props = serde_json::Map::new();
    let t = &obj.props;
    for (i, key) in t.entry_keys() {
        let k = heap.hstr(key);
        if k.is_internal() {
            continue;
        }
        let name = String::from_utf8_lossy(k.as_bytes()).into_owned();
        if t.flags(i) & PROPF_ACCESSOR != 0 {
            props.insert(name, json!({"type": "accessor"}));
        } else {
            props.insert(name, tval_snapshot(heap, t.value(i), depth + 1));
        }
    }
    let mut array = Vec::new();
    for i in 0..t.a_size() {
        let v = t.arr_get(i);
        if v.is_undefined() {
            array.push(serde_json::Value::Null);
        } else {
            array.push(tval_snapshot(heap, v, depth + 1));
        }
    }
    json!({
        "type": "object",
        "class": obj.class.name(),
        "props": props,
        "array": array,
    })
}

/// Compact single-line rendering of an object's property table, for
/// trace logging: entries (key/flags), array fill, hash size.
pub fn dump_object_table(heap: &Heap, id: ObjId) -> String {
    use std::fmt::Write;
    let obj = heap.hobj(id);
    let t = &obj.props;
    let mut out = String::new();
    let _ = write!(
        out,
        "{} e={}/{} a={} h={} [",
        obj.class.name(),
        t.e_used(),
        t.e_size(),
        t.a_size(),
        t.h_size()
    );
    for (i, key) in t.entry_keys() {
        let fl = t.flags(i);
        let _ = write!(
            out,
            "{}{}{}{}{} ",
            String::from_utf8_lossy(heap.hstr(key).as_bytes()),
            if fl & crate::proptable::PROPF_WRITABLE != 0 { ":w" } else { "" },
            if fl & crate::proptable::PROPF_ENUMERABLE != 0 { "e" } else { "" },
            if fl & crate::proptable::PROPF_CONFIGURABLE != 0 { "c" } else { "" },
            if fl & PROPF_ACCESSOR != 0 { "A" } else { "" },
        );
    }
    out.push(']');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_snapshot_counts() {
        let mut ctx = Heap::new();
        let snap0 = heap_snapshot(&ctx);
        ctx.push_object().unwrap();
        let snap1 = heap_snapshot(&ctx);
        assert_eq!(snap1.objects, snap0.objects + 1);
        assert_eq!(snap1.valstack_top, snap0.valstack_top + 1);
        let s = serde_json::to_string(&snap1).unwrap();
        assert!(s.contains("\"objects\""));
    }

    #[test]
    fn test_value_snapshot_shapes() {
        let mut ctx = Heap::new();
        ctx.push_number(1.5).unwrap();
        assert_eq!(value_snapshot(&ctx, -1), serde_json::json!(1.5));
        ctx.pop().unwrap();

        ctx.push_string("hi").unwrap();
        assert_eq!(value_snapshot(&ctx, -1), serde_json::json!("hi"));
        ctx.pop().unwrap();

        let obj = ctx.push_object().unwrap();
        ctx.push_int(3).unwrap();
        ctx.put_prop_string(obj, "x").unwrap();
        let v = value_snapshot(&ctx, obj);
        assert_eq!(v["class"], "Object");
        assert_eq!(v["props"]["x"], 3.0);
    }

    #[test]
    fn test_buffer_snapshot_hex() {
        let mut ctx = Heap::new();
        ctx.push_fixed_buffer(2).unwrap();
        ctx.get_buffer_mut(-1).unwrap().copy_from_slice(&[0xAB, 0xCD]);
        let v = value_snapshot(&ctx, -1);
        assert_eq!(v["hex"], "abcd");
    }

    #[test]
    fn test_dump_object_table_line() {
        let mut ctx = Heap::new();
        let obj = ctx.push_object().unwrap();
        ctx.push_int(1).unwrap();
        ctx.put_prop_string(obj, "k").unwrap();
        let id = ctx.require_object(obj).unwrap();
        let line = dump_object_table(&ctx, id);
        assert!(line.starts_with("Object e="));
        assert!(line.contains("k:wec"));
    }
}
