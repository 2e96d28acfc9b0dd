//! Reference counting and the refzero work list
//!
//! Every store of a tagged cell into an engine-owned slot goes through
//! incref/decref on the heap. Strings and buffers have no outbound
//! references, so they are reclaimed immediately on refzero; objects are
//! queued on the refzero list and drained by a single non-reentrant
//! driver that runs finalizers, rescues resurrected objects, and
//! recursively drops outbound references of the rest.
//!
//! While a mark-and-sweep cycle runs, refzero transitions are left for the
//! sweep to reclaim. While the driver itself runs, nested decrefs only
//! enqueue (tail insert; the head stays stable under finalizer reentry).

use eider_core::{BufId, ObjId, StrId, TVal};
use tracing::trace;

use crate::heap::{
    HEAP_MARKANDSWEEP_RUNNING, HEAP_REFZERO_FREE_RUNNING, Heap, MS_TRIGGER_LIMIT,
};
use crate::heaphdr::{HDR_FINALIZED, HeapRef};
use crate::hobject::ObjExtra;
use crate::proptable::PROPF_ACCESSOR;

pub(crate) fn decref_str(heap: &mut Heap, id: StrId) {
    let rc = {
        let hdr = &mut heap.hstr_mut(id).hdr;
        debug_assert!(hdr.refcount > 0, "string refcount underflow");
        hdr.refcount -= 1;
        hdr.refcount
    };
    if rc != 0 || heap.flags & HEAP_MARKANDSWEEP_RUNNING != 0 {
        return;
    }
    crate::strtab::remove(heap, id);
    heap.strcache_invalidate(id);
    heap.free_string_cell(id);
}

pub(crate) fn decref_buf(heap: &mut Heap, id: BufId) {
    let rc = {
        let hdr = &mut heap.hbuf_mut(id).hdr;
        debug_assert!(hdr.refcount > 0, "buffer refcount underflow");
        hdr.refcount -= 1;
        hdr.refcount
    };
    if rc != 0 || heap.flags & HEAP_MARKANDSWEEP_RUNNING != 0 {
        return;
    }
    heap.unlink_allocated(HeapRef::Buf(id));
    heap.free_buffer_cell(id);
}

pub(crate) fn decref_obj(heap: &mut Heap, id: ObjId) {
    let rc = {
        let hdr = &mut heap.hobj_mut(id).hdr;
        debug_assert!(hdr.refcount > 0, "object refcount underflow");
        hdr.refcount -= 1;
        hdr.refcount
    };
    if rc != 0 || heap.flags & HEAP_MARKANDSWEEP_RUNNING != 0 {
        return;
    }
    // Move from the allocated list to the refzero list tail.
    heap.unlink_allocated(HeapRef::Obj(id));
    refzero_enqueue(heap, id);

    // Debit the voluntary-GC budget.
    heap.ms_trigger_counter -= 1;

    if heap.flags & HEAP_REFZERO_FREE_RUNNING == 0 {
        refzero_free_pending(heap);
    }
}

fn refzero_enqueue(heap: &mut Heap, id: ObjId) {
    {
        let hdr = &mut heap.hobj_mut(id).hdr;
        hdr.next = None;
        hdr.prev = None;
    }
    match heap.refzero_tail {
        Some(tail) => {
            heap.hobj_mut(tail).hdr.next = Some(HeapRef::Obj(id));
            heap.refzero_tail = Some(id);
        }
        None => {
            heap.refzero_head = Some(id);
            heap.refzero_tail = Some(id);
        }
    }
}

/// Pop the refzero head (the driver owns the head slot).
fn refzero_pop_head(heap: &mut Heap) -> Option<ObjId> {
    let head = heap.refzero_head?;
    let next = heap.hobj(head).hdr.next;
    heap.refzero_head = match next {
        Some(HeapRef::Obj(n)) => Some(n),
        None => {
            heap.refzero_tail = None;
            None
        }
        _ => unreachable!("non-object on refzero list"),
    };
    heap.hobj_mut(head).hdr.next = None;
    Some(head)
}

/// The non-reentrant refzero driver loop.
pub(crate) fn refzero_free_pending(heap: &mut Heap) {
    debug_assert!(heap.flags & HEAP_REFZERO_FREE_RUNNING == 0);
    heap.flags |= HEAP_REFZERO_FREE_RUNNING;

    while let Some(id) = heap.refzero_head {
        // Run-once policy: a FINALIZED object skips straight to the
        // rescue-or-free decision.
        let finalized = heap.hobj(id).hdr.has(HDR_FINALIZED);
        if !finalized && crate::props::has_finalizer(heap, id) {
            trace!(obj = id.raw(), "refzero: running finalizer");
            // Keep the object alive across the finalizer call.
            heap.incref_obj(id);
            crate::call::run_finalizer(heap, id);
            heap.hobj_mut(id).hdr.set(HDR_FINALIZED);
            let hdr = &mut heap.hobj_mut(id).hdr;
            hdr.refcount -= 1;
        }

        // The finalizer may have resurrected the object.
        let rescued = heap.hobj(id).hdr.refcount > 0;
        let popped = refzero_pop_head(heap).expect("refzero head vanished");
        debug_assert_eq!(popped, id);
        if rescued {
            trace!(obj = id.raw(), "refzero: rescued by finalizer");
            heap.link_allocated(HeapRef::Obj(id));
            continue;
        }

        // Drop outbound references (may enqueue more work), then free.
        let refs = object_refs(heap, id);
        for tv in refs {
            heap.decref(tv);
        }
        heap.free_object_cell(id);
    }

    heap.flags &= !HEAP_REFZERO_FREE_RUNNING;

    if heap.ms_trigger_counter <= 0 && heap.flags & HEAP_MARKANDSWEEP_RUNNING == 0 {
        heap.ms_trigger_counter = MS_TRIGGER_LIMIT;
        trace!("refzero budget exhausted, voluntary mark-and-sweep");
        crate::markandsweep::run(heap, 0);
    }
}

/// Collect every outbound owning reference of an object: prototype, entry
/// keys and values (or accessor pairs), array part cells, and the subtype
/// payload. The thread resumer link is weak and excluded.
pub(crate) fn object_refs(heap: &Heap, id: ObjId) -> Vec<TVal> {
    let obj = heap.hobj(id);
    let mut out = Vec::new();

    if let Some(p) = obj.prototype {
        out.push(TVal::object(p));
    }

    let t = &obj.props;
    for i in 0..t.e_used() {
        let Some(key) = t.key(i) else { continue };
        out.push(TVal::string(key));
        if t.flags(i) & PROPF_ACCESSOR != 0 {
            let a = t.accessor(i);
            if let Some(g) = a.get {
                out.push(TVal::object(g));
            }
            if let Some(s) = a.set {
                out.push(TVal::object(s));
            }
        } else {
            out.push(t.value(i));
        }
    }
    for i in 0..t.a_size() {
        let v = t.arr_get(i);
        if !v.is_undefined() {
            out.push(v);
        }
    }

    match &obj.extra {
        ObjExtra::None => {}
        ObjExtra::CompFunc(d) => {
            if let Some(b) = d.data {
                out.push(TVal::buffer(b));
            }
            if let Some(b) = d.pc2line {
                out.push(TVal::buffer(b));
            }
            out.extend(d.consts.iter().copied());
            out.extend(d.funcs.iter().map(|&f| TVal::object(f)));
        }
        ObjExtra::NatFunc(_) => {}
        ObjExtra::Thread(t) => {
            out.extend(t.valstack[..t.valstack_top].iter().copied());
            for act in &t.callstack {
                if let Some(f) = act.func {
                    out.push(TVal::object(f));
                }
                if let Some(e) = act.lex_env {
                    out.push(TVal::object(e));
                }
                if let Some(e) = act.var_env {
                    out.push(TVal::object(e));
                }
            }
            for cat in &t.catchstack {
                if let Some(v) = cat.varname {
                    out.push(TVal::string(v));
                }
                if let Some(e) = cat.env {
                    out.push(TVal::object(e));
                }
            }
            out.extend(t.builtins.iter().map(|&b| TVal::object(b)));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hobject::{OBJF_EXTENSIBLE, ObjClass};

    #[test]
    fn test_buffer_freed_on_refzero() {
        let mut heap = Heap::new();
        let n0 = heap.buffer_count();
        let b = heap.alloc_buffer(16, false);
        heap.incref_buf(b);
        assert_eq!(heap.buffer_count(), n0 + 1);
        heap.decref_buf(b);
        assert_eq!(heap.buffer_count(), n0);
    }

    #[test]
    fn test_object_freed_on_refzero() {
        let mut heap = Heap::new();
        let n0 = heap.object_count();
        let o = heap.alloc_object(OBJF_EXTENSIBLE, ObjClass::Object);
        heap.incref_obj(o);
        assert_eq!(heap.object_count(), n0 + 1);
        heap.decref_obj(o);
        assert_eq!(heap.object_count(), n0);
    }

    #[test]
    fn test_chain_free_cascades() {
        let mut heap = Heap::new();
        let n0 = heap.object_count();
        let child = heap.alloc_object(OBJF_EXTENSIBLE, ObjClass::Object);
        heap.incref_obj(child);
        let parent = heap.alloc_object(OBJF_EXTENSIBLE, ObjClass::Object);
        heap.incref_obj(parent);
        // parent.prototype = child (owning ref)
        heap.incref_obj(child);
        heap.hobj_mut(parent).prototype = Some(child);
        heap.decref_obj(child); // only parent owns child now
        assert_eq!(heap.object_count(), n0 + 2);
        heap.decref_obj(parent);
        assert_eq!(heap.object_count(), n0);
    }

    #[test]
    fn test_string_freed_on_refzero() {
        let mut heap = Heap::new();
        let s = crate::strtab::intern(&mut heap, b"ephemeral-string");
        let n0 = heap.string_count();
        heap.incref_str(s);
        heap.decref_str(s);
        assert_eq!(heap.string_count(), n0 - 1);
        // Re-interning after the free produces a fresh cell.
        let s2 = crate::strtab::intern(&mut heap, b"ephemeral-string");
        assert_eq!(heap.hstr(s2).as_bytes(), b"ephemeral-string");
    }
}
