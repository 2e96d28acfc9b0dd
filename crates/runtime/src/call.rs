//! Call handling
//!
//! Builds, unwinds, and fails activations for native↔script calls:
//! bound-function chain collapse, `this` coercion, register frame setup
//! with lazy environment records, the Arguments object, constant-space
//! tail calls, and the resume/yield coroutine transfer.
//!
//! Input convention on the value stack: `[... func this arg1 .. argN]`;
//! on return the single return value sits where `func` was and everything
//! above it is gone. Errors unwind the value, call, and catch stacks to
//! the entry snapshot before propagating.

use eider_core::{ObjId, TVal, Tag};
use tracing::trace;

use crate::error::{self, Unwind, type_error};
use crate::heap::{Bstr, Heap, LjKind};
use crate::hobject::{
    CompFuncData, NatFuncData, NativeFn, OBJF_COMPFUNC, OBJF_CONSTRUCTABLE,
    OBJF_CREATEARGS, OBJF_EXTENSIBLE, OBJF_NATFUNC, OBJF_NEWENV, OBJF_SPECIAL_ARGUMENTS,
    OBJF_STRICT, ObjClass, ObjExtra,
};
use crate::hthread::{
    ACT_CONSTRUCT, ACT_DIRECT_EVAL, ACT_PREVENT_YIELD, ACT_STRICT, ACT_TAILCALLED, Activation,
    TB_GLOBAL, TB_GLOBAL_ENV, TB_TYPE_ERROR_THROWER, ThreadState, VALSTACK_INTERNAL_EXTRA,
};
use crate::markandsweep::{MS_FLAG_NO_FINALIZERS, MS_FLAG_NO_STRINGTABLE_RESIZE};
use crate::proptable::{PROPF_CONFIGURABLE, PROPF_WRITABLE};
use crate::props;

/// Call flags.
pub const CALL_FLAG_CONSTRUCT: u32 = 1 << 0;
/// Skip the native recursion limit (error-handler invocations).
pub const CALL_FLAG_IGNORE_RECLIMIT: u32 = 1 << 1;
pub const CALL_FLAG_DIRECT_EVAL: u32 = 1 << 2;

/// Bound-function chain sanity bound.
const BOUND_CHAIN_SANITY_LIMIT: u32 = 10_000;

/// Entry snapshot taken before a call; used to restore invariants on any
/// unwind that this frame consumes.
pub(crate) struct CallSnapshot {
    pub thread: ObjId,
    pub state: ThreadState,
    pub valstack_bottom: usize,
    pub valstack_top: usize,
    pub callstack_len: usize,
    pub catchstack_len: usize,
    pub recursion_depth: usize,
}

pub(crate) fn snapshot(heap: &Heap) -> CallSnapshot {
    let thread = heap.curr();
    let thr = heap.thr_of(thread);
    CallSnapshot {
        thread,
        state: thr.state,
        valstack_bottom: thr.valstack_bottom,
        valstack_top: thr.valstack_top,
        callstack_len: thr.callstack.len(),
        catchstack_len: thr.catchstack.len(),
        recursion_depth: heap.call_recursion_depth,
    }
}

/// Restore value/call/catch stacks and thread bookkeeping to an entry
/// snapshot. Used by protected frames after catching an unwind.
pub(crate) fn unwind_to_snapshot(heap: &mut Heap, snap: &CallSnapshot) {
    heap.curr_thread = Some(snap.thread);
    heap.call_recursion_depth = snap.recursion_depth;
    {
        let thr = heap.thr_of_mut(snap.thread);
        thr.state = snap.state;
    }
    while heap.thr_of(snap.thread).catchstack.len() > snap.catchstack_len {
        let cat = heap.thr_of_mut(snap.thread).catchstack.pop().expect("len checked");
        if let Some(env) = cat.env {
            heap.decref_obj(env);
        }
        if let Some(v) = cat.varname {
            heap.decref_str(v);
        }
    }
    while heap.thr_of(snap.thread).callstack.len() > snap.callstack_len {
        pop_activation(heap, snap.thread);
    }
    {
        let thr = heap.thr_of_mut(snap.thread);
        thr.valstack_bottom = snap.valstack_bottom;
    }
    // Truncate on the snapshot thread, which is current again.
    heap.truncate_to(snap.valstack_top);
}

// ----------------------------------------------------------------------
// Activation maintenance
// ----------------------------------------------------------------------

fn push_activation(heap: &mut Heap, thread: ObjId, act: Activation) {
    if let Some(f) = act.func {
        heap.incref_obj(f);
    }
    if let Some(e) = act.lex_env {
        heap.incref_obj(e);
    }
    if let Some(e) = act.var_env {
        heap.incref_obj(e);
    }
    let prevent = act.flags & ACT_PREVENT_YIELD != 0;
    let thr = heap.thr_of_mut(thread);
    thr.callstack.push(act);
    if prevent {
        thr.callstack_preventcount += 1;
    }
}

pub(crate) fn pop_activation(heap: &mut Heap, thread: ObjId) {
    let act = heap
        .thr_of_mut(thread)
        .callstack
        .pop()
        .expect("call stack underflow");
    if act.flags & ACT_PREVENT_YIELD != 0 {
        heap.thr_of_mut(thread).callstack_preventcount -= 1;
    }
    if let Some(f) = act.func {
        heap.decref_obj(f);
    }
    if let Some(e) = act.lex_env {
        heap.decref_obj(e);
    }
    if let Some(e) = act.var_env {
        heap.decref_obj(e);
    }
}

// ----------------------------------------------------------------------
// Callable construction helpers
// ----------------------------------------------------------------------

/// Allocate a native function object.
pub(crate) fn alloc_native_function(heap: &mut Heap, func: NativeFn, nargs: i16) -> ObjId {
    let obj = heap.alloc_object(
        OBJF_EXTENSIBLE | OBJF_NATFUNC | OBJF_CONSTRUCTABLE | OBJF_STRICT,
        ObjClass::Function,
    );
    heap.hobj_mut(obj).extra = ObjExtra::NatFunc(NatFuncData { func, nargs });
    obj
}

/// Allocate a compiled function object shell; the executor/compiler fills
/// in bytecode, constants, and inner functions.
pub(crate) fn alloc_compiled_function(heap: &mut Heap, nregs: u16, nargs: u16) -> ObjId {
    let obj = heap.alloc_object(
        OBJF_EXTENSIBLE | OBJF_COMPFUNC | OBJF_CONSTRUCTABLE | OBJF_NEWENV,
        ObjClass::Function,
    );
    heap.hobj_mut(obj).extra = ObjExtra::CompFunc(CompFuncData {
        data: None,
        pc2line: None,
        nregs,
        nargs,
        consts: Vec::new(),
        funcs: Vec::new(),
    });
    obj
}

/// Shared strict-mode `callee`/`caller` thrower.
pub(crate) fn native_type_error_thrower(heap: &mut Heap) -> Result<i32, Unwind> {
    Err(type_error(heap, "property access restricted"))
}

// ----------------------------------------------------------------------
// The call handler
// ----------------------------------------------------------------------

/// Perform a function call with the stack convention
/// `[... func this arg1 .. argN]`. On success the single return value
/// replaces the `func` slot. On `Throw` the stacks are restored to the
/// entry state before the error propagates; yield/resume escapes pass
/// through untouched for the executor to reroute.
pub(crate) fn ecma_call(heap: &mut Heap, nargs: usize, flags: u32) -> Result<(), Unwind> {
    let snap = snapshot(heap);
    match do_call(heap, nargs, flags, &snap) {
        Ok(()) => Ok(()),
        Err(Unwind::Throw) => {
            unwind_to_snapshot(heap, &snap);
            // Truncated back to entry: the caller's frame (including the
            // func/this/args it pushed) is intact, error is in lj.
            Err(Unwind::Throw)
        }
        Err(other) => Err(other),
    }
}

fn do_call(heap: &mut Heap, nargs: usize, flags: u32, snap: &CallSnapshot) -> Result<(), Unwind> {
    let thread = snap.thread;
    let top = snap.valstack_top;
    if top < snap.valstack_bottom + nargs + 2 {
        return Err(error::api_error(heap, "call stack shape invalid"));
    }
    let idx_func = top - nargs - 2;

    // Recursion depth covers native frames only; compiled frames grow the
    // call stack, not the native stack.
    if flags & CALL_FLAG_IGNORE_RECLIMIT == 0
        && heap.call_recursion_depth >= heap.call_recursion_limit
    {
        return Err(error::range_error(heap, "C call stack depth limit"));
    }

    // Collapse the bound-function chain, then validate the final target.
    let mut nargs = nargs;
    collapse_bound_chain(heap, idx_func, &mut nargs, flags)?;
    let func_tv = heap.thr().valstack[idx_func];
    let func = match func_tv.as_object() {
        Some(f) if heap.hobj(f).is_compfunc() || heap.hobj(f).is_natfunc() => f,
        _ => return Err(type_error(heap, "call target not callable")),
    };

    // Coerce `this` (step 6).
    coerce_this(heap, idx_func + 1, func, flags)?;

    let idx_args = idx_func + 2;
    let strict = heap.hobj(func).is_strict();
    let is_native = heap.hobj(func).is_natfunc();
    let (nregs, decl_nargs): (i32, i32) = if is_native {
        let d = heap.hobj(func).natfunc().nargs;
        (-1, d as i32)
    } else {
        let d = heap.hobj(func).compfunc();
        (d.nregs as i32, d.nargs as i32)
    };

    // Value-stack headroom for the callee frame (step 7).
    let want = nregs.max(decl_nargs).max(nargs as i32) as usize;
    let need = (idx_args + want + VALSTACK_INTERNAL_EXTRA).saturating_sub(top);
    if !heap.valstack_reserve(need) {
        return Err(error::range_error(heap, "valstack limit reached"));
    }

    // The caller's activation learns where the return value lands
    // (step 8).
    if let Some(act) = heap.thr_of_mut(thread).callstack.last_mut() {
        act.idx_retval = idx_func;
    }

    let mut act_flags = 0u32;
    if strict {
        act_flags |= ACT_STRICT;
    }
    if flags & CALL_FLAG_CONSTRUCT != 0 {
        act_flags |= ACT_CONSTRUCT | ACT_PREVENT_YIELD;
    }
    if flags & CALL_FLAG_DIRECT_EVAL != 0 {
        act_flags |= ACT_DIRECT_EVAL;
    }
    if is_native {
        act_flags |= ACT_PREVENT_YIELD;
    }

    push_activation(
        heap,
        thread,
        Activation {
            func: Some(func),
            lex_env: None,
            var_env: None,
            pc: 0,
            idx_bottom: idx_args,
            idx_retval: 0,
            flags: act_flags,
        },
    );
    heap.call_recursion_depth += 1;

    let result = invoke_target(heap, thread, func, idx_args, nargs, is_native, nregs, decl_nargs);
    match result {
        Ok(()) => {
            // Move the return value into the func slot and drop the frame
            // (step 13).
            let rv = heap.top_value();
            heap.set_slot(idx_func, rv);
            pop_activation(heap, thread);
            heap.call_recursion_depth -= 1;
            {
                let thr = heap.thr_of_mut(thread);
                thr.valstack_bottom = snap.valstack_bottom;
            }
            heap.truncate_to(idx_func + 1);
            heap.valstack_reserve(VALSTACK_INTERNAL_EXTRA);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn pad_undefined(heap: &mut Heap, thread: ObjId, want_top: usize) {
    let thr = heap.thr_of_mut(thread);
    while thr.valstack_top < want_top {
        let t = thr.valstack_top;
        thr.valstack[t] = TVal::undefined();
        thr.valstack_top = t + 1;
    }
}

#[allow(clippy::too_many_arguments)]
fn invoke_target(
    heap: &mut Heap,
    thread: ObjId,
    func: ObjId,
    idx_args: usize,
    nargs: usize,
    is_native: bool,
    nregs: i32,
    decl_nargs: i32,
) -> Result<(), Unwind> {
    // Environment setup (step 10) before the frame is clamped, so the
    // Arguments object sees the actual argument list.
    if !is_native {
        setup_environments(heap, thread, func, idx_args, nargs)?;
    }

    // Clamp and pad the register frame (step 11). Compiled frames clamp
    // to declared args then pad to nregs; natives with a declared count
    // get exactly that many; vararg natives see the stack as-is.
    if nregs >= 0 {
        let decl = decl_nargs.max(0) as usize;
        heap.truncate_to(idx_args + decl.min(nargs));
        pad_undefined(heap, thread, idx_args + nregs as usize);
    } else if decl_nargs >= 0 {
        let decl = decl_nargs as usize;
        heap.truncate_to(idx_args + decl.min(nargs));
        pad_undefined(heap, thread, idx_args + decl);
    }

    // Shift the frame bottom (step 12) and invoke.
    {
        let thr = heap.thr_of_mut(thread);
        thr.valstack_bottom = idx_args;
    }

    if is_native {
        let f = heap.hobj(func).natfunc().func;
        trace!(func = func.raw(), nargs, "native call");
        let rc = f(heap)?;
        match rc {
            0 => heap.push(TVal::undefined()),
            1 => {
                if heap.thr().frame_len() == 0 {
                    return Err(error::api_error(heap, "native return with empty frame"));
                }
                Ok(())
            }
            rc if rc < 0 => Err(error::throw_from_magic(heap, rc)),
            _ => Err(error::api_error(heap, "invalid native function return code")),
        }
    } else {
        trace!(func = func.raw(), nargs, "compiled call");
        let Some(ex) = heap.executor.clone() else {
            return Err(error::unimplemented_error(heap, "no executor installed"));
        };
        ex.execute(heap)?;
        if heap.thr().frame_len() == 0 {
            heap.push(TVal::undefined())?;
        }
        Ok(())
    }
}

/// Follow `[[Target]]` links, prepending stored bound arguments and
/// overriding `this` (step 5).
fn collapse_bound_chain(
    heap: &mut Heap,
    idx_func: usize,
    nargs: &mut usize,
    flags: u32,
) -> Result<(), Unwind> {
    for _ in 0..BOUND_CHAIN_SANITY_LIMIT {
        let func_tv = heap.thr().valstack[idx_func];
        let Some(func) = func_tv.as_object() else {
            return Err(type_error(heap, "call target not callable"));
        };
        if !heap.hobj(func).is_bound() {
            return Ok(());
        }

        let k_target = heap.bstr(Bstr::IntTarget);
        let Some(target) = props::get_own_plain(heap, func, k_target) else {
            return Err(type_error(heap, "bound function target missing"));
        };
        let k_this = heap.bstr(Bstr::IntThis);
        let bound_this = props::get_own_plain(heap, func, k_this).unwrap_or(TVal::undefined());
        let k_args = heap.bstr(Bstr::IntArgs);
        let bound_args: Vec<TVal> = match props::get_own_plain(heap, func, k_args)
            .and_then(|v| v.as_object())
        {
            Some(arr) => {
                let t = &heap.hobj(arr).props;
                (0..t.a_size()).map(|i| t.arr_get(i)).collect()
            }
            None => Vec::new(),
        };

        // Rebuild [target this' b1..bM a1..aN] in place. Everything is
        // temporarily rooted before the old slots are dropped.
        let idx_args = idx_func + 2;
        let old_args: Vec<TVal> = {
            let thr = heap.thr();
            (0..*nargs).map(|i| thr.valstack[idx_args + i]).collect()
        };
        let keep_this = flags & CALL_FLAG_CONSTRUCT != 0;
        let old_this = heap.thr().valstack[idx_func + 1];
        let new_this = if keep_this { old_this } else { bound_this };

        let mut frame: Vec<TVal> = Vec::with_capacity(2 + bound_args.len() + old_args.len());
        frame.push(target);
        frame.push(new_this);
        frame.extend_from_slice(&bound_args);
        frame.extend_from_slice(&old_args);
        for &v in &frame {
            heap.incref(v);
        }
        heap.truncate_to(idx_func);
        for &v in &frame {
            heap.push(v)?;
        }
        for &v in &frame {
            heap.decref(v);
        }
        *nargs += bound_args.len();
    }
    Err(error::range_error(heap, "bound function chain limit"))
}

/// Strict targets keep `this` as given; non-strict targets receive the
/// global object for undefined/null and a boxed object for other
/// primitives (step 6).
fn coerce_this(heap: &mut Heap, idx_this: usize, func: ObjId, flags: u32) -> Result<(), Unwind> {
    if flags & CALL_FLAG_CONSTRUCT != 0 || heap.hobj(func).is_strict() {
        return Ok(());
    }
    let this_tv = heap.thr().valstack[idx_this];
    let new_this = match this_tv.tag() {
        Tag::Undefined | Tag::Null => {
            let global = heap.thr().builtins[TB_GLOBAL];
            TVal::object(global)
        }
        Tag::Object => return Ok(()),
        _ => {
            let obj = crate::coerce::to_object(heap, this_tv)?;
            TVal::object(obj)
        }
    };
    heap.set_slot(idx_this, new_this);
    Ok(())
}

/// Step 10: lazy environments by default; eager creation (plus the
/// Arguments object) when the function needs them; stored environments
/// for closures without `new-env`.
fn setup_environments(
    heap: &mut Heap,
    thread: ObjId,
    func: ObjId,
    idx_args: usize,
    nargs: usize,
) -> Result<(), Unwind> {
    let o = heap.hobj(func);
    let newenv = o.hdr.has(OBJF_NEWENV);
    let createargs = o.hdr.has(OBJF_CREATEARGS);

    if newenv && !createargs {
        // Lazy: left null; materialized on first slow-path identifier
        // access.
        return Ok(());
    }

    if !newenv {
        // Reuse the environments stored on the function (closure chain).
        let k_lex = heap.bstr(Bstr::IntLexenv);
        let k_var = heap.bstr(Bstr::IntVarenv);
        let lex = props::get_own_plain(heap, func, k_lex).and_then(|v| v.as_object());
        let var = props::get_own_plain(heap, func, k_var)
            .and_then(|v| v.as_object())
            .or(lex);
        let fallback = heap.thr_of(thread).builtins[TB_GLOBAL_ENV];
        let lex = lex.unwrap_or(fallback);
        let var = var.unwrap_or(fallback);
        heap.incref_obj(lex);
        heap.incref_obj(var);
        let act = heap
            .thr_of_mut(thread)
            .callstack
            .last_mut()
            .expect("activation just pushed");
        act.lex_env = Some(lex);
        act.var_env = Some(var);
        return Ok(());
    }

    // new-env with arguments: materialize the record now.
    let env = materialize_env(heap, thread, func, idx_args)?;
    let args_obj = create_arguments_object(heap, func, env, idx_args, nargs)?;

    // Bind 'arguments' in the new environment record.
    heap.temp_root(TVal::object(args_obj));
    let k_arguments = heap.bstr(Bstr::Arguments);
    props::put_own_flags(heap, env, k_arguments, TVal::object(args_obj), PROPF_WRITABLE);
    heap.untemp_root();
    Ok(())
}

/// Create the activation's declarative record (register-backed, open) and
/// install it on the topmost activation. Used both eagerly and from the
/// lazy slow path.
pub(crate) fn materialize_env(
    heap: &mut Heap,
    thread: ObjId,
    func: ObjId,
    idx_args: usize,
) -> Result<ObjId, Unwind> {
    // Parent scope comes from the function's stored lexical environment.
    let k_lex = heap.bstr(Bstr::IntLexenv);
    let parent = props::get_own_plain(heap, func, k_lex)
        .and_then(|v| v.as_object())
        .or_else(|| Some(heap.thr_of(thread).builtins[TB_GLOBAL_ENV]));
    let env = crate::env::alloc_dec_env(heap, parent);
    heap.temp_root(TVal::object(env));
    crate::env::bind_open_record(heap, env, thread, func, idx_args);

    // One ref per activation slot, then drop the temporary root.
    heap.incref_obj(env);
    heap.incref_obj(env);
    {
        let act = heap
            .thr_of_mut(thread)
            .callstack
            .last_mut()
            .expect("no activation to attach environment to");
        debug_assert!(act.lex_env.is_none() && act.var_env.is_none());
        act.lex_env = Some(env);
        act.var_env = Some(env);
    }
    heap.untemp_root();
    Ok(env)
}

/// Build the Arguments object (section 4.6.3): array-like indexed
/// properties, `length`, `callee`, and for non-strict callees a live
/// parameter map bridging indices to the activation's registers.
fn create_arguments_object(
    heap: &mut Heap,
    func: ObjId,
    env: ObjId,
    idx_args: usize,
    nargs: usize,
) -> Result<ObjId, Unwind> {
    let strict = heap.hobj(func).is_strict();
    let actual: Vec<TVal> = {
        let thr = heap.thr();
        (0..nargs).map(|i| thr.valstack[idx_args + i]).collect()
    };

    let flags = if strict {
        OBJF_EXTENSIBLE
    } else {
        OBJF_EXTENSIBLE | OBJF_SPECIAL_ARGUMENTS
    };
    let obj = heap.alloc_object(flags | crate::hobject::OBJF_ARRAY_PART, ObjClass::Arguments);
    heap.temp_root(TVal::object(obj));
    props::realloc_props(heap, obj, 0, nargs as u32, 0, false);
    for (i, v) in actual.iter().enumerate() {
        props::array_init_slot(heap, obj, i as u32, *v);
    }

    let k_length = heap.bstr(Bstr::Length);
    props::put_own_flags(
        heap,
        obj,
        k_length,
        TVal::number(nargs as f64),
        PROPF_WRITABLE | PROPF_CONFIGURABLE,
    );

    if strict {
        // Strict arguments: callee/caller are a shared thrower accessor,
        // and there is no parameter map.
        let thrower = heap.thr().builtins[TB_TYPE_ERROR_THROWER];
        for key in [Bstr::Callee, Bstr::Caller] {
            let k = heap.bstr(key);
            props::define_property(
                heap,
                obj,
                k,
                props::PropDesc {
                    get: Some(Some(thrower)),
                    set: Some(Some(thrower)),
                    enumerable: Some(false),
                    configurable: Some(false),
                    ..Default::default()
                },
                false,
            )?;
        }
    } else {
        let k_callee = heap.bstr(Bstr::Callee);
        props::put_own_flags(
            heap,
            obj,
            k_callee,
            TVal::object(func),
            PROPF_WRITABLE | PROPF_CONFIGURABLE,
        );

        // Parameter map: formal parameter i (bound to a register) maps
        // index i to the environment binding of the formal's name.
        let k_formals = heap.bstr(Bstr::IntFormals);
        if let Some(formals) = props::get_own_plain(heap, func, k_formals).and_then(|v| v.as_object())
        {
            let nformals = heap.hobj(formals).props.a_size() as usize;
            if nformals > 0 {
                let map = heap.alloc_object(OBJF_EXTENSIBLE, ObjClass::Object);
                heap.temp_root(TVal::object(map));
                for i in 0..nformals.min(nargs) {
                    let name_tv = heap.hobj(formals).props.arr_get(i as u32);
                    let Some(name) = name_tv.as_string() else { continue };
                    let entry = heap.alloc_object(OBJF_EXTENSIBLE, ObjClass::Object);
                    heap.temp_root(TVal::object(entry));
                    let k_env = heap.bstr(Bstr::IntLexenv);
                    props::put_own_internal(heap, entry, k_env, TVal::object(env));
                    let k_name = heap.bstr(Bstr::IntName);
                    props::put_own_internal(heap, entry, k_name, TVal::string(name));
                    let idx_key = props::intern_u32(heap, i as u32);
                    props::put_own_internal(heap, map, idx_key, TVal::object(entry));
                    heap.untemp_root();
                }
                let k_map = heap.bstr(Bstr::IntMap);
                props::put_own_internal(heap, obj, k_map, TVal::object(map));
                heap.untemp_root();
            }
        }
    }

    heap.untemp_root();
    Ok(obj)
}

// ----------------------------------------------------------------------
// Accessor and finalizer invocation
// ----------------------------------------------------------------------

/// Invoke a getter (`arg` None; result pushed) or setter (`arg` Some;
/// nothing left on the stack) with the original receiver as `this`.
pub(crate) fn call_accessor(
    heap: &mut Heap,
    func: ObjId,
    receiver: TVal,
    arg: Option<TVal>,
) -> Result<(), Unwind> {
    heap.push(TVal::object(func))?;
    heap.push(receiver)?;
    match arg {
        None => {
            ecma_call(heap, 0, 0)?;
            Ok(())
        }
        Some(v) => {
            heap.push(v)?;
            ecma_call(heap, 1, 0)?;
            heap.pop_unsafe();
            Ok(())
        }
    }
}

/// Run an object's finalizer (protected; errors are swallowed). The
/// sensitive-section mask suppresses nested finalizer runs and string
/// table resizes while it executes.
pub(crate) fn run_finalizer(heap: &mut Heap, obj: ObjId) {
    let saved_base = heap.ms_base_flags;
    heap.ms_base_flags |= MS_FLAG_NO_FINALIZERS | MS_FLAG_NO_STRINGTABLE_RESIZE;

    let snap = snapshot(heap);
    heap.temp_root(TVal::object(obj));
    let r = (|| -> Result<(), Unwind> {
        let key = heap.bstr(Bstr::IntFinalizer);
        props::get_prop(heap, TVal::object(obj), TVal::string(key))?;
        let f = heap.top_value();
        let callable = f
            .as_object()
            .map(|id| heap.hobj(id).is_callable())
            .unwrap_or(false);
        if !callable {
            heap.pop_unsafe();
            return Ok(());
        }
        heap.push(TVal::undefined())?;
        heap.push(TVal::object(obj))?;
        ecma_call(heap, 1, CALL_FLAG_IGNORE_RECLIMIT)?;
        heap.pop_unsafe();
        Ok(())
    })();
    if r.is_err() {
        trace!(obj = obj.raw(), "finalizer failed, error ignored");
        unwind_to_snapshot(heap, &snap);
        heap.lj_clear();
    }
    heap.untemp_root();

    heap.ms_base_flags = saved_base;
}

// ----------------------------------------------------------------------
// Tail calls
// ----------------------------------------------------------------------

/// Reuse the current activation for a call (section 4.6.4). Stack shape
/// on entry: `[.. func this a1 .. aN]` inside the current frame. The
/// defining property is that `idx_bottom` stays put, making the call
/// constant-space.
pub fn handle_tailcall(heap: &mut Heap, nargs: usize) -> Result<(), Unwind> {
    let thread = heap.curr();
    let (act_flags, idx_bottom, act_index) = {
        let thr = heap.thr_of(thread);
        let act = thr.callstack.last().expect("tail call without activation");
        (act.flags, act.idx_bottom, thr.callstack.len() - 1)
    };
    let _ = act_flags;

    // Preconditions: compiled current function, no catchers owned by this
    // activation.
    let curr_func = heap
        .thr_of(thread)
        .callstack
        .last()
        .and_then(|a| a.func)
        .expect("tail call without function");
    if !heap.hobj(curr_func).is_compfunc() {
        return Err(error::api_error(heap, "tail call from non-compiled frame"));
    }
    if heap
        .thr_of(thread)
        .catchstack
        .iter()
        .any(|c| c.callstack_index == act_index)
    {
        return Err(error::api_error(heap, "tail call with active catchers"));
    }

    let top = heap.thr().valstack_top;
    let idx_func = top - nargs - 2;

    let mut nargs = nargs;
    collapse_bound_chain(heap, idx_func, &mut nargs, 0)?;
    let func_tv = heap.thr().valstack[idx_func];
    let target = match func_tv.as_object() {
        Some(f) if heap.hobj(f).is_compfunc() => f,
        _ => return Err(error::api_error(heap, "tail call target not compiled")),
    };
    coerce_this(heap, idx_func + 1, target, 0)?;

    // Reset environments (step 1) and retarget the activation (step 2).
    {
        let (old_lex, old_var) = {
            let act = heap
                .thr_of_mut(thread)
                .callstack
                .last_mut()
                .expect("activation checked");
            let pair = (act.lex_env.take(), act.var_env.take());
            act.pc = 0;
            act.flags |= ACT_TAILCALLED;
            pair
        };
        if let Some(e) = old_lex {
            heap.decref_obj(e);
        }
        if let Some(e) = old_var {
            heap.decref_obj(e);
        }
    }
    {
        heap.incref_obj(target);
        let act = heap
            .thr_of_mut(thread)
            .callstack
            .last_mut()
            .expect("activation checked");
        let old = act.func.replace(target);
        if let Some(o) = old {
            heap.decref_obj(o);
        }
    }

    // Shift this and args down into the reused frame (step 3).
    let new_this = heap.thr().valstack[idx_func + 1];
    heap.set_slot(idx_bottom - 1, new_this);
    for i in 0..nargs {
        let v = heap.thr().valstack[idx_func + 2 + i];
        heap.set_slot(idx_bottom + i, v);
    }
    heap.truncate_to(idx_bottom + nargs);

    // Clamp/pad registers for the new target.
    let (nregs, decl) = {
        let d = heap.hobj(target).compfunc();
        (d.nregs as usize, d.nargs as usize)
    };
    heap.truncate_to(idx_bottom + decl.min(nargs));
    if !heap.valstack_reserve(nregs + VALSTACK_INTERNAL_EXTRA) {
        return Err(error::range_error(heap, "valstack limit reached"));
    }
    {
        let thr = heap.thr_of_mut(thread);
        let want_top = idx_bottom + nregs;
        while thr.valstack_top < want_top {
            let t = thr.valstack_top;
            thr.valstack[t] = TVal::undefined();
            thr.valstack_top = t + 1;
        }
        thr.valstack_bottom = idx_bottom;
    }
    trace!(target = target.raw(), nargs, "tail call reused activation");
    Ok(())
}

// ----------------------------------------------------------------------
// Resume / yield
// ----------------------------------------------------------------------

/// `yield` native: stash value/error into the longjmp state and unwind;
/// the executor (through [`resume_thread`]) reroutes control.
pub fn native_thread_yield(heap: &mut Heap) -> Result<i32, Unwind> {
    let thread = heap.curr();
    {
        let thr = heap.thr_of(thread);
        if thr.resumer.is_none() {
            return Err(type_error(heap, "yield from unresumed thread"));
        }
        // Only the yield built-in's own activation may prevent yield.
        if thr.callstack_preventcount != 1 {
            return Err(type_error(heap, "attempt to yield across a native frame"));
        }
        if thr.callstack.len() < 2 {
            return Err(type_error(heap, "yield from thread entry level"));
        }
    }
    let caller_compiled = {
        let thr = heap.thr_of(thread);
        let caller = &thr.callstack[thr.callstack.len() - 2];
        caller
            .func
            .map(|f| heap.hobj(f).is_compfunc())
            .unwrap_or(false)
    };
    if !caller_compiled {
        return Err(type_error(heap, "yield caller not compiled code"));
    }

    let value = if heap.thr().frame_len() >= 1 {
        heap.thr().valstack[heap.thr().valstack_bottom]
    } else {
        TVal::undefined()
    };
    let iserror = if heap.thr().frame_len() >= 2 {
        let f = heap.thr().valstack[heap.thr().valstack_bottom + 1];
        crate::coerce::to_boolean_value(heap, f)
    } else {
        false
    };
    heap.lj_set(LjKind::Yield, value, TVal::undefined(), iserror);
    Err(Unwind::Yield)
}

/// `resume` native: stash target/value into the longjmp state and unwind.
pub fn native_thread_resume(heap: &mut Heap) -> Result<i32, Unwind> {
    let thread = heap.curr();
    {
        let thr = heap.thr_of(thread);
        if thr.callstack.len() < 2 {
            return Err(type_error(heap, "resume from thread entry level"));
        }
    }
    let caller_compiled = {
        let thr = heap.thr_of(thread);
        let caller = &thr.callstack[thr.callstack.len() - 2];
        caller
            .func
            .map(|f| heap.hobj(f).is_compfunc())
            .unwrap_or(false)
    };
    if !caller_compiled {
        return Err(type_error(heap, "resume caller not compiled code"));
    }

    let bottom = heap.thr().valstack_bottom;
    let target_tv = heap.thr().valstack[bottom];
    let Some(target) = target_tv.as_object().filter(|&t| heap.hobj(t).is_thread()) else {
        return Err(type_error(heap, "resume target not a thread"));
    };
    match heap.thr_of(target).state {
        ThreadState::Inactive | ThreadState::Yielded => {}
        _ => return Err(type_error(heap, "thread not resumable")),
    }
    let value = heap.thr().valstack[bottom + 1];
    let iserror = {
        let f = heap.thr().valstack[bottom + 2];
        crate::coerce::to_boolean_value(heap, f)
    };
    heap.lj_set(LjKind::Resume, value, target_tv, iserror);
    let _ = iserror;
    Err(Unwind::Resume)
}

/// Pop the topmost (native) activation after a yield/resume escape and
/// restore the caller frame. Returns the absolute slot where the result
/// of the escaped call must be written.
pub fn unwind_native_escape(heap: &mut Heap) -> usize {
    let thread = heap.curr();
    heap.call_recursion_depth = heap.call_recursion_depth.saturating_sub(1);
    pop_activation(heap, thread);
    let (retbase, bottom) = {
        let thr = heap.thr_of(thread);
        let act = thr.callstack.last().expect("escape without caller");
        (act.idx_retval, act.idx_bottom)
    };
    {
        let thr = heap.thr_of_mut(thread);
        thr.valstack_bottom = bottom;
    }
    heap.truncate_to(retbase);
    retbase
}

/// Perform the resume state machine. The resumer's stacks must already be
/// unwound to the resume call site ([`unwind_native_escape`]). Pushes the
/// outcome (yielded value or final return value) onto the resumer's
/// stack; a value yielded or returned as an error rethrows in the
/// resumer's context.
pub fn resume_thread(
    heap: &mut Heap,
    target: ObjId,
    value: TVal,
    iserror: bool,
) -> Result<(), Unwind> {
    let resumer = heap.curr();
    let prev_state = heap.thr_of(target).state;
    let saved_depth = heap.call_recursion_depth;

    heap.thr_of_mut(resumer).state = ThreadState::Resumed;
    heap.thr_of_mut(target).resumer = Some(resumer);
    heap.thr_of_mut(target).state = ThreadState::Running;
    heap.curr_thread = Some(target);
    trace!(target = target.raw(), "resume: switching threads");

    let run: Result<(), Unwind> = match prev_state {
        ThreadState::Inactive => {
            // Initial start: target stack holds the entry callable.
            if heap.thr_of(target).frame_len() != 1 {
                heap.curr_thread = Some(resumer);
                heap.thr_of_mut(resumer).state = ThreadState::Running;
                heap.thr_of_mut(target).state = ThreadState::Inactive;
                return Err(error::api_error(heap, "thread stack not prepared for start"));
            }
            (|| {
                heap.push(TVal::undefined())?; // this
                heap.push(value)?;
                if iserror {
                    return Err(error::throw_value(heap, value));
                }
                ecma_call(heap, 1, 0)
            })()
        }
        ThreadState::Yielded => {
            if iserror {
                Err(error::throw_value(heap, value))
            } else {
                // Deliver the resume value at the yield call site (the
                // suspended frame was truncated to its retval slot), then
                // let the executor continue the suspended activation.
                (|| {
                    heap.push(value)?;
                    let ex = heap.executor.clone();
                    match ex {
                        Some(ex) => ex.execute(heap),
                        None => Err(error::unimplemented_error(heap, "no executor installed")),
                    }
                })()
            }
        }
        _ => unreachable!("state checked by caller"),
    };

    settle_after_resume(heap, resumer, target, saved_depth, run)
}

/// Interpret the outcome of running the resumed thread: normal return
/// terminates it, a yield suspends it; either way control returns to the
/// resumer with one result value (or a rethrown error).
fn settle_after_resume(
    heap: &mut Heap,
    resumer: ObjId,
    target: ObjId,
    saved_depth: usize,
    run: Result<(), Unwind>,
) -> Result<(), Unwind> {
    match run {
        Ok(()) => {
            // Ran to completion; return value on target's stack top.
            let rv = heap.top_value();
            heap.incref(rv);
            terminate_thread(heap, target);
            switch_back(heap, resumer, saved_depth);
            let r = heap.push(rv);
            heap.decref(rv);
            r
        }
        Err(Unwind::Yield) => {
            let value = heap.lj.value1;
            let iserror = heap.lj.iserror;
            // Unwind the yield native's activation so the thread rests at
            // its compiled frame.
            unwind_native_escape(heap);
            heap.thr_of_mut(target).state = ThreadState::Yielded;
            switch_back(heap, resumer, saved_depth);
            if iserror {
                return Err(error::throw_value(heap, value));
            }
            heap.push(value)
        }
        Err(Unwind::Throw) => {
            // Error escaped the thread entry: thread dies, error
            // propagates in the resumer.
            terminate_thread(heap, target);
            switch_back(heap, resumer, saved_depth);
            Err(Unwind::Throw)
        }
        Err(other) => Err(other),
    }
}

/// Tear a finished thread down: drop its remaining activations and
/// catchers, reset its stack window, and clear the resumer link.
fn terminate_thread(heap: &mut Heap, target: ObjId) {
    while !heap.thr_of(target).callstack.is_empty() {
        pop_activation(heap, target);
    }
    while let Some(cat) = heap.thr_of_mut(target).catchstack.pop() {
        if let Some(env) = cat.env {
            heap.decref_obj(env);
        }
        if let Some(v) = cat.varname {
            heap.decref_str(v);
        }
    }
    {
        let thr = heap.thr_of_mut(target);
        thr.valstack_bottom = 0;
        thr.callstack_preventcount = 0;
    }
    heap.truncate_to(0);
    heap.thr_of_mut(target).state = ThreadState::Terminated;
    heap.thr_of_mut(target).resumer = None;
}

fn switch_back(heap: &mut Heap, resumer: ObjId, saved_depth: usize) {
    heap.curr_thread = Some(resumer);
    heap.call_recursion_depth = saved_depth;
    heap.thr_of_mut(resumer).state = ThreadState::Running;
}
