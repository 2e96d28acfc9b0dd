//! Collector behavior through the public API: cycles, finalizers,
//! rescue, and deep-structure marking.

use eider_runtime::Heap;

#[test]
fn test_refcount_reclaims_acyclic_garbage() {
    let mut ctx = Heap::new();
    let n0 = ctx.object_count();
    let obj = ctx.push_object().unwrap();
    ctx.push_object().unwrap();
    ctx.put_prop_string(obj, "child").unwrap();
    assert_eq!(ctx.object_count(), n0 + 2);
    ctx.pop().unwrap();
    // Both objects die immediately through refcounting; no cycle needed.
    assert_eq!(ctx.object_count(), n0);
}

#[test]
fn test_cycle_needs_mark_and_sweep() {
    let mut ctx = Heap::new();
    let n0 = ctx.object_count();

    let a = ctx.push_object().unwrap();
    let b = ctx.push_object().unwrap();
    ctx.dup(b).unwrap();
    ctx.put_prop_string(a, "peer").unwrap();
    ctx.dup(a).unwrap();
    ctx.put_prop_string(b, "peer").unwrap();
    assert_eq!(ctx.object_count(), n0 + 2);

    ctx.pop_2().unwrap();
    // Reference counts never reach zero (a <-> b), so the pair survives
    // until a collection cycle runs.
    assert_eq!(ctx.object_count(), n0 + 2);
    ctx.gc();
    assert_eq!(ctx.object_count(), n0);
}

#[test]
fn test_prototype_cycle_collected() {
    let mut ctx = Heap::new();
    let n0 = ctx.object_count();
    let a = ctx.push_object().unwrap();
    let b = ctx.push_object().unwrap();
    ctx.set_prototype(b, a).unwrap();
    ctx.set_prototype(a, b).unwrap();
    ctx.pop_2().unwrap();
    ctx.gc();
    assert_eq!(ctx.object_count(), n0);
}

#[test]
fn test_reachable_objects_survive_gc() {
    let mut ctx = Heap::new();
    let obj = ctx.push_object().unwrap();
    ctx.push_int(31).unwrap();
    ctx.put_prop_string(obj, "keep").unwrap();
    ctx.gc();
    ctx.gc();
    ctx.get_prop_string(obj, "keep").unwrap();
    assert_eq!(ctx.get_number(-1), 31.0);
}

#[test]
fn test_deep_chain_marking() {
    // Deeper than the mark recursion limit: exercises the temproot
    // rescan phase.
    let mut ctx = Heap::new();
    let head = ctx.push_object().unwrap();
    ctx.dup(head).unwrap(); // walking cursor
    for _ in 0..500 {
        ctx.push_object().unwrap(); // [head cursor new]
        ctx.dup(-1).unwrap(); // [head cursor new new]
        ctx.put_prop_string(-3, "next").unwrap(); // cursor.next = new
        ctx.remove(-2).unwrap(); // [head new]
    }
    ctx.pop().unwrap(); // drop the cursor; only head roots the chain
    ctx.gc();
    // The whole chain is reachable from the stack-held tail... walk from
    // the head to prove the links survived.
    let mut steps = 0;
    ctx.dup(head).unwrap();
    loop {
        ctx.get_prop_string(-1, "next").unwrap();
        ctx.remove(-2).unwrap();
        if ctx.is_undefined(-1) {
            break;
        }
        steps += 1;
    }
    assert_eq!(steps, 500);
}

#[test]
fn test_finalizer_runs_after_sweep_for_cycles() {
    let mut ctx = Heap::new();

    let a = ctx.push_object().unwrap();
    let b = ctx.push_object().unwrap();
    ctx.dup(b).unwrap();
    ctx.put_prop_string(a, "peer").unwrap();
    ctx.dup(a).unwrap();
    ctx.put_prop_string(b, "peer").unwrap();

    ctx.push_native_function(
        |heap| {
            heap.push_heap_stash()?;
            heap.push_true()?;
            heap.put_prop_string(-2, "cycle_finalized")?;
            heap.pop()?;
            Ok(0)
        },
        1,
    )
    .unwrap();
    ctx.set_finalizer(a).unwrap();

    ctx.pop_2().unwrap();
    ctx.gc();

    ctx.push_heap_stash().unwrap();
    ctx.get_prop_string(-1, "cycle_finalized").unwrap();
    assert!(ctx.get_boolean(-1));
}

#[test]
fn test_finalizer_rescue_then_release() {
    let mut ctx = Heap::new();

    let obj = ctx.push_object().unwrap();
    // Finalizer rescues the object by stashing a reference.
    ctx.push_native_function(
        |heap| {
            heap.push_heap_stash()?;
            heap.dup(0)?; // finalizer argument: the dying object
            heap.put_prop_string(-2, "rescued")?;
            heap.pop()?;
            Ok(0)
        },
        1,
    )
    .unwrap();
    ctx.set_finalizer(obj).unwrap();
    let n_live = ctx.object_count();
    ctx.pop().unwrap();
    // Rescued: still alive, reachable through the stash.
    assert_eq!(ctx.object_count(), n_live);

    // Release the stash reference: finalizer already ran once, so the
    // object is freed without re-finalization.
    ctx.push_heap_stash().unwrap();
    ctx.del_prop_string(-1, "rescued").unwrap();
    ctx.pop().unwrap();
    assert!(ctx.object_count() < n_live);
}

#[test]
fn test_string_interning_identity_and_sweep() {
    let mut ctx = Heap::new();
    ctx.push_string("gc-probe-string").unwrap();
    ctx.push_string("gc-probe-string").unwrap();
    // Interning twice yields the same cell.
    assert!(ctx.strict_equals(-1, -2));
    ctx.pop_2().unwrap();

    let n = ctx.string_count();
    ctx.gc();
    // The unreferenced probe string was swept.
    assert!(ctx.string_count() < n);
}

#[test]
fn test_gc_idempotent_on_idle_heap() {
    let mut ctx = Heap::new();
    ctx.gc();
    let n1 = ctx.object_count();
    let s1 = ctx.string_count();
    ctx.gc();
    ctx.gc();
    assert_eq!(ctx.object_count(), n1);
    assert_eq!(ctx.string_count(), s1);
}
