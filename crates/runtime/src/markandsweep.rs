//! Stop-the-world mark-and-sweep collector
//!
//! Five phases: mark roots, mark finalizable objects (and their transitive
//! closures), temproot rescan for recursion-limited marking, refcount
//! finalization of garbage, and the sweep that splits cells into
//! survivors, a finalize queue, and freed memory. Optional post-phases:
//! emergency object compaction and a string-table resize check.
//!
//! The cycle holds `MARKANDSWEEP_RUNNING`; refzero processing is deferred
//! to the sweep while it is set. Finalizers run after the flag drops, on
//! survivors moved to the finalize list.

use eider_core::{ObjId, TVal, Tag};
use tracing::{debug, trace};

use crate::heap::{HEAP_MARKANDSWEEP_RUNNING, Heap, MS_TRIGGER_LIMIT};
use crate::heaphdr::{
    HDR_FINALIZABLE, HDR_FINALIZED, HDR_REACHABLE, HDR_TEMPROOT, HeapRef,
};
use crate::refcount::object_refs;

/// Emergency cycle: allocation retries exhausted, compaction enabled.
pub const MS_FLAG_EMERGENCY: u32 = 1 << 0;
/// Do not run finalizers at the end of this cycle (sensitive section).
pub const MS_FLAG_NO_FINALIZERS: u32 = 1 << 1;
/// Do not resize the string table at the end of this cycle.
pub const MS_FLAG_NO_STRINGTABLE_RESIZE: u32 = 1 << 2;
/// Do not compact object property tables even in an emergency cycle.
pub const MS_FLAG_NO_OBJECT_COMPACTION: u32 = 1 << 3;

/// Marking recursion depth limit; deeper cells become temproots and are
/// finished by the rescan phase.
const MARK_RECURSION_LIMIT: u32 = 64;

/// Run one full collection cycle. Re-entrant calls (allocations inside
/// the collector) return immediately.
pub(crate) fn run(heap: &mut Heap, flags: u32) {
    if heap.flags & HEAP_MARKANDSWEEP_RUNNING != 0 {
        return;
    }
    let flags = flags | heap.ms_base_flags;
    heap.flags |= HEAP_MARKANDSWEEP_RUNNING;
    heap.ms_running_flags = flags;
    debug!(
        objects = heap.object_count(),
        strings = heap.string_count(),
        buffers = heap.buffer_count(),
        emergency = flags & MS_FLAG_EMERGENCY != 0,
        "mark-and-sweep start"
    );

    mark_roots(heap);
    mark_finalizable(heap);
    mark_temproots(heap);
    finalize_refcounts(heap);
    let (kept, queued, freed) = sweep(heap);

    if flags & MS_FLAG_EMERGENCY != 0 && flags & MS_FLAG_NO_OBJECT_COMPACTION == 0 {
        compact_objects(heap);
    }

    heap.flags &= !HEAP_MARKANDSWEEP_RUNNING;
    heap.ms_running_flags = 0;
    heap.ms_trigger_counter = MS_TRIGGER_LIMIT;

    if flags & MS_FLAG_NO_STRINGTABLE_RESIZE == 0 {
        crate::strtab::maybe_resize(heap);
    }

    debug!(kept, queued, freed, "mark-and-sweep done");

    if flags & MS_FLAG_NO_FINALIZERS == 0 {
        run_pending_finalizers(heap);
    }
}

fn mark_tval(heap: &mut Heap, tv: TVal, depth: u32) {
    match tv.tag() {
        Tag::String => {
            if let Some(id) = tv.as_string() {
                heap.hstr_mut(id).hdr.set(HDR_REACHABLE);
            }
        }
        Tag::Buffer => {
            if let Some(id) = tv.as_buffer() {
                heap.hbuf_mut(id).hdr.set(HDR_REACHABLE);
            }
        }
        Tag::Object => {
            if let Some(id) = tv.as_object() {
                mark_obj(heap, id, depth);
            }
        }
        _ => {}
    }
}

fn mark_obj(heap: &mut Heap, id: ObjId, depth: u32) {
    {
        let hdr = &mut heap.hobj_mut(id).hdr;
        if hdr.has(HDR_REACHABLE) {
            return;
        }
        hdr.set(HDR_REACHABLE);
        if depth >= MARK_RECURSION_LIMIT {
            hdr.set(HDR_TEMPROOT);
            return;
        }
    }
    for r in object_refs(heap, id) {
        mark_tval(heap, r, depth + 1);
    }
}

/// Phase 1: roots are the heap thread, the current thread, the stash,
/// every builtin string, the longjmp state values, the pre-allocated
/// double-error object, and both work lists (their members are garbage to
/// refcounting but must survive this cycle).
fn mark_roots(heap: &mut Heap) {
    if let Some(t) = heap.heap_thread {
        mark_obj(heap, t, 0);
    }
    if let Some(t) = heap.curr_thread {
        mark_obj(heap, t, 0);
    }
    if let Some(s) = heap.stash {
        mark_obj(heap, s, 0);
    }
    for i in 0..heap.builtin_strs.len() {
        let id = heap.builtin_strs[i];
        heap.hstr_mut(id).hdr.set(HDR_REACHABLE);
    }
    let (v1, v2) = (heap.lj.value1, heap.lj.value2);
    mark_tval(heap, v1, 0);
    mark_tval(heap, v2, 0);
    let temps = heap.temp_roots.clone();
    for tv in temps {
        mark_tval(heap, tv, 0);
    }
    if let Some(d) = heap.double_error {
        mark_obj(heap, d, 0);
    }

    let mut cursor = heap.refzero_head.map(HeapRef::Obj);
    while let Some(HeapRef::Obj(id)) = cursor {
        mark_obj(heap, id, 0);
        cursor = heap.hobj(id).hdr.next;
    }
    let mut cursor = heap.finalize_head.map(HeapRef::Obj);
    while let Some(HeapRef::Obj(id)) = cursor {
        mark_obj(heap, id, 0);
        cursor = heap.hobj(id).hdr.next;
    }
}

/// Phase 2: still-unreachable objects with a finalizer that has not run
/// yet are flagged and then marked as roots so their transitive closure
/// survives until the finalizer has had its chance.
fn mark_finalizable(heap: &mut Heap) {
    let mut finalizable = Vec::new();
    let mut cursor = heap.heap_allocated;
    while let Some(r) = cursor {
        if let HeapRef::Obj(id) = r {
            let hdr = &heap.hobj(id).hdr;
            if !hdr.has(HDR_REACHABLE)
                && !hdr.has(HDR_FINALIZED)
                && crate::props::has_finalizer(heap, id)
            {
                finalizable.push(id);
            }
        }
        cursor = heap.hdr(r).next;
    }
    for id in &finalizable {
        heap.hobj_mut(*id).hdr.set(HDR_FINALIZABLE);
    }
    for id in finalizable {
        trace!(obj = id.raw(), "marking finalizable object as root");
        mark_obj(heap, id, 0);
    }
}

/// Phase 3: reprocess every temproot until none remain; this bounds the
/// native marking stack while keeping marking complete.
fn mark_temproots(heap: &mut Heap) {
    loop {
        let pending: Vec<ObjId> = heap
            .objects
            .iter()
            .filter(|(_, o)| o.hdr.has(HDR_TEMPROOT))
            .map(|(i, _)| ObjId::new(i))
            .collect();
        if pending.is_empty() {
            return;
        }
        trace!(count = pending.len(), "temproot rescan pass");
        for id in pending {
            heap.hobj_mut(id).hdr.clear(HDR_TEMPROOT);
            for r in object_refs(heap, id) {
                mark_tval(heap, r, 0);
            }
        }
    }
}

fn raw_decref(heap: &mut Heap, tv: TVal) {
    match tv.tag() {
        Tag::String => {
            if let Some(id) = tv.as_string() {
                let hdr = &mut heap.hstr_mut(id).hdr;
                debug_assert!(hdr.refcount > 0);
                hdr.refcount = hdr.refcount.saturating_sub(1);
            }
        }
        Tag::Object => {
            if let Some(id) = tv.as_object() {
                let hdr = &mut heap.hobj_mut(id).hdr;
                debug_assert!(hdr.refcount > 0);
                hdr.refcount = hdr.refcount.saturating_sub(1);
            }
        }
        Tag::Buffer => {
            if let Some(id) = tv.as_buffer() {
                let hdr = &mut heap.hbuf_mut(id).hdr;
                debug_assert!(hdr.refcount > 0);
                hdr.refcount = hdr.refcount.saturating_sub(1);
            }
        }
        _ => {}
    }
}

/// Phase 4: drop the outbound reference counts held by garbage so freed
/// objects leave no dangling counts on survivors. Counts are adjusted
/// without triggering refzero processing.
fn finalize_refcounts(heap: &mut Heap) {
    let mut cursor = heap.heap_allocated;
    while let Some(r) = cursor {
        let next = heap.hdr(r).next;
        if let HeapRef::Obj(id) = r {
            if !heap.hobj(id).hdr.has(HDR_REACHABLE) {
                for tv in object_refs(heap, id) {
                    raw_decref(heap, tv);
                }
            }
        }
        cursor = next;
    }
}

/// Phase 5: split the allocated list into survivors, the finalize queue,
/// and freed cells; clear mark flags; sweep the string table.
fn sweep(heap: &mut Heap) -> (usize, usize, usize) {
    let mut kept = 0usize;
    let mut queued = 0usize;
    let mut freed = 0usize;

    let mut all = Vec::new();
    let mut cursor = heap.heap_allocated;
    while let Some(r) = cursor {
        cursor = heap.hdr(r).next;
        all.push(r);
    }

    heap.heap_allocated = None;
    // Relink in reverse so the list keeps its previous order.
    for &r in all.iter().rev() {
        let hdr = heap.hdr_mut(r);
        hdr.next = None;
        hdr.prev = None;
        if hdr.has(HDR_REACHABLE) {
            hdr.clear(HDR_REACHABLE | HDR_TEMPROOT);
            if hdr.has(HDR_FINALIZABLE) {
                hdr.clear(HDR_FINALIZABLE);
                let HeapRef::Obj(id) = r else {
                    unreachable!("finalizable non-object");
                };
                // Push onto the finalize queue; processed after the cycle.
                let old_head = heap.finalize_head;
                let hdr = &mut heap.hobj_mut(id).hdr;
                hdr.next = old_head.map(HeapRef::Obj);
                heap.finalize_head = Some(id);
                queued += 1;
            } else {
                heap.link_allocated(r);
                kept += 1;
            }
        } else {
            match r {
                HeapRef::Obj(id) => heap.free_object_cell(id),
                HeapRef::Buf(id) => heap.free_buffer_cell(id),
                HeapRef::Str(_) => unreachable!("string on allocated list"),
            }
            freed += 1;
        }
    }

    let freed_strings = crate::strtab::sweep(heap);
    trace!(freed_strings, "string table swept");

    (kept, queued, freed)
}

/// Emergency-only: rebuild every live object's property table at tight
/// sizes.
fn compact_objects(heap: &mut Heap) {
    let mut cursor = heap.heap_allocated;
    let mut ids = Vec::new();
    while let Some(r) = cursor {
        if let HeapRef::Obj(id) = r {
            ids.push(id);
        }
        cursor = heap.hdr(r).next;
    }
    debug!(count = ids.len(), "emergency object compaction");
    for id in ids {
        crate::props::compact_props(heap, id);
    }
}

/// Run finalizers queued by the sweep. Each object is relinked into the
/// allocated list first; rescue simply means the finalizer (or anything
/// else) retains a reference before the next collection.
fn run_pending_finalizers(heap: &mut Heap) {
    while let Some(id) = heap.finalize_head {
        let next = heap.hobj(id).hdr.next;
        heap.finalize_head = match next {
            Some(HeapRef::Obj(n)) => Some(n),
            None => None,
            _ => unreachable!("non-object on finalize list"),
        };
        {
            let hdr = &mut heap.hobj_mut(id).hdr;
            hdr.next = None;
        }
        heap.link_allocated(HeapRef::Obj(id));
        if heap.hobj(id).hdr.has(HDR_FINALIZED) {
            continue;
        }
        trace!(obj = id.raw(), "post-sweep finalizer");
        heap.incref_obj(id);
        crate::call::run_finalizer(heap, id);
        heap.hobj_mut(id).hdr.set(HDR_FINALIZED);
        heap.decref_obj(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heaphdr::HDR_FINALIZABLE;

    #[test]
    fn test_no_gc_flags_survive_a_cycle() {
        let mut heap = Heap::new();
        // Populate a bit of everything, including garbage.
        let obj = heap.push_object().unwrap();
        heap.push_int(3).unwrap();
        heap.put_prop_string(obj, "x").unwrap();
        let a = heap.push_object().unwrap();
        let b = heap.push_object().unwrap();
        heap.dup(b).unwrap();
        heap.put_prop_string(a, "peer").unwrap();
        heap.dup(a).unwrap();
        heap.put_prop_string(b, "peer").unwrap();
        heap.pop_2().unwrap(); // cycle becomes garbage

        run(&mut heap, 0);

        for (_, o) in heap.objects.iter() {
            assert!(!o.hdr.has(HDR_REACHABLE));
            assert!(!o.hdr.has(HDR_TEMPROOT));
            assert!(!o.hdr.has(HDR_FINALIZABLE));
        }
        for (_, s) in heap.strings.iter() {
            assert!(!s.hdr.has(HDR_REACHABLE));
        }
        for (_, b) in heap.buffers.iter() {
            assert!(!b.hdr.has(HDR_REACHABLE));
        }
    }

    #[test]
    fn test_temp_roots_survive_cycles() {
        let mut heap = Heap::new();
        let n0 = heap.object_count();
        let obj = heap.alloc_object(crate::hobject::OBJF_EXTENSIBLE, crate::hobject::ObjClass::Object);
        heap.temp_root(eider_core::TVal::object(obj));
        run(&mut heap, 0);
        assert_eq!(heap.object_count(), n0 + 1);
        heap.untemp_root();
        run(&mut heap, 0);
        assert_eq!(heap.object_count(), n0);
    }
}
