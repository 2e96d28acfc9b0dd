//! Lexical environment records
//!
//! Two record kinds share the object layout under distinct class tags.
//! Declarative records hold bindings as own properties, with an optional
//! open register fast path: until the record is closed, identifier
//! operations resolve through the owning function's name→register map
//! against the activation's register window. Object records delegate to a
//! target object (prototype chain included), optionally providing a
//! `this` binding for `with`.
//!
//! The record chain is the object prototype chain; parents are reached by
//! following `[[Prototype]]`, bounded by the same sanity limit as
//! property walks.

use eider_core::{ObjId, StrId, TVal};
use tracing::trace;

use crate::error::{Unwind, reference_error, type_error};
use crate::heap::{Bstr, Heap};
use crate::hobject::{OBJF_ENVRECCLOSED, OBJF_EXTENSIBLE, ObjClass};
use crate::proptable::{PROPF_CONFIGURABLE, PROPF_ENUMERABLE, PROPF_WRITABLE};
use crate::props::{self, PROTO_SANITY_LIMIT};

/// Binding site found by a single-record lookup.
enum Binding {
    /// Open declarative record: absolute value-stack slot.
    Register(usize),
    /// Property binding on the record itself (declarative) with entry idx.
    RecordProp(u32),
    /// Object record delegating to its target object.
    Target(ObjId),
}

/// Allocate a declarative environment record chained to `parent`.
pub(crate) fn alloc_dec_env(heap: &mut Heap, parent: Option<ObjId>) -> ObjId {
    let env = heap.alloc_object(OBJF_EXTENSIBLE, ObjClass::DecEnv);
    props::set_prototype(heap, env, parent);
    env
}

/// Allocate an object environment record over `target`, chained to
/// `parent`. `this_binding` is kept for `with` scopes.
pub(crate) fn alloc_obj_env(
    heap: &mut Heap,
    target: ObjId,
    this_binding: Option<TVal>,
    parent: Option<ObjId>,
) -> ObjId {
    let env = heap.alloc_object(OBJF_EXTENSIBLE, ObjClass::ObjEnv);
    heap.temp_root(TVal::object(env));
    props::set_prototype(heap, env, parent);
    let k = heap.bstr(Bstr::IntTarget);
    props::put_own_internal(heap, env, k, TVal::object(target));
    if let Some(tb) = this_binding {
        let k = heap.bstr(Bstr::IntThis);
        props::put_own_internal(heap, env, k, tb);
    }
    heap.untemp_root();
    env
}

/// Attach the open-record bookkeeping that enables the register fast
/// path: owning thread, callee, and absolute register base.
pub(crate) fn bind_open_record(
    heap: &mut Heap,
    env: ObjId,
    thread: ObjId,
    callee: ObjId,
    regbase: usize,
) {
    let k = heap.bstr(Bstr::IntThread);
    props::put_own_internal(heap, env, k, TVal::object(thread));
    let k = heap.bstr(Bstr::IntCallee);
    props::put_own_internal(heap, env, k, TVal::object(callee));
    let k = heap.bstr(Bstr::IntRegbase);
    props::put_own_internal(heap, env, k, TVal::number(regbase as f64));
}

/// Open-record register resolution: name → absolute value-stack slot.
fn open_record_register(heap: &mut Heap, env: ObjId, name: StrId) -> Option<usize> {
    if heap.hobj(env).hdr.has(OBJF_ENVRECCLOSED) {
        return None;
    }
    let k_callee = heap.bstr(Bstr::IntCallee);
    let callee = props::get_own_plain(heap, env, k_callee)?.as_object()?;
    let k_regbase = heap.bstr(Bstr::IntRegbase);
    let regbase = props::get_own_plain(heap, env, k_regbase)?.as_number()? as usize;
    let k_varmap = heap.bstr(Bstr::IntVarmap);
    let varmap = props::get_own_plain(heap, callee, k_varmap)?.as_object()?;
    let reg = props::get_own_plain(heap, varmap, name)?.as_number()? as usize;
    Some(regbase + reg)
}

/// Resolve `name` against a single record.
fn record_lookup(heap: &mut Heap, env: ObjId, name: StrId) -> Option<Binding> {
    match heap.hobj(env).class {
        ObjClass::DecEnv => {
            if let Some(slot) = open_record_register(heap, env, name) {
                return Some(Binding::Register(slot));
            }
            let f = props::find_own(heap, env, name);
            f.e_idx.map(Binding::RecordProp)
        }
        ObjClass::ObjEnv => {
            let k = heap.bstr(Bstr::IntTarget);
            let target = props::get_own_plain(heap, env, k)?.as_object()?;
            Some(Binding::Target(target))
        }
        _ => None,
    }
}

/// `hasvar`: single-record presence test.
pub(crate) fn hasvar(heap: &mut Heap, env: ObjId, name: StrId) -> Result<bool, Unwind> {
    match record_lookup(heap, env, name) {
        Some(Binding::Register(_)) | Some(Binding::RecordProp(_)) => Ok(true),
        Some(Binding::Target(target)) => {
            props::has_prop(heap, TVal::object(target), TVal::string(name))
        }
        None => Ok(false),
    }
}

/// `getvar`: walk the record chain; on success pushes the bound value
/// followed by the `this` binding and returns true. When `throw` is set a
/// missing identifier is a `ReferenceError` (typeof uses `throw` false).
pub(crate) fn getvar(
    heap: &mut Heap,
    env: Option<ObjId>,
    name: StrId,
    throw: bool,
) -> Result<bool, Unwind> {
    let mut cur = env;
    for _ in 0..PROTO_SANITY_LIMIT {
        let Some(e) = cur else { break };
        match record_lookup(heap, e, name) {
            Some(Binding::Register(slot)) => {
                let v = heap.thr().valstack[slot];
                heap.push(v)?;
                heap.push(TVal::undefined())?;
                return Ok(true);
            }
            Some(Binding::RecordProp(i)) => {
                let v = record_prop_value(heap, e, i);
                heap.push(v)?;
                heap.push(TVal::undefined())?;
                return Ok(true);
            }
            Some(Binding::Target(target)) => {
                let present =
                    props::has_prop(heap, TVal::object(target), TVal::string(name))?;
                if present {
                    props::get_prop(heap, TVal::object(target), TVal::string(name))?;
                    let k_this = heap.bstr(Bstr::IntThis);
                    let this_b =
                        props::get_own_plain(heap, e, k_this).unwrap_or(TVal::undefined());
                    heap.push(this_b)?;
                    return Ok(true);
                }
            }
            None => {}
        }
        cur = heap.hobj(e).prototype;
    }
    if throw {
        let name_str = heap
            .hstr(name)
            .as_str()
            .unwrap_or("<binary>")
            .to_string();
        return Err(reference_error(heap, &format!("identifier '{name_str}' undefined")));
    }
    Ok(false)
}

fn record_prop_value(heap: &Heap, env: ObjId, i: u32) -> TVal {
    let t = &heap.hobj(env).props;
    if t.flags(i) & crate::proptable::PROPF_ACCESSOR != 0 {
        TVal::undefined()
    } else {
        t.value(i)
    }
}

/// `putvar`: walk the chain; strict not-found is a `ReferenceError`,
/// non-strict creates the binding on the global object.
pub(crate) fn putvar(
    heap: &mut Heap,
    env: Option<ObjId>,
    name: StrId,
    val: TVal,
    strict: bool,
) -> Result<(), Unwind> {
    let mut cur = env;
    for _ in 0..PROTO_SANITY_LIMIT {
        let Some(e) = cur else { break };
        match record_lookup(heap, e, name) {
            Some(Binding::Register(slot)) => {
                heap.set_slot(slot, val);
                return Ok(());
            }
            Some(Binding::RecordProp(i)) => {
                if heap.hobj(e).props.flags(i) & PROPF_WRITABLE == 0 {
                    if strict {
                        return Err(type_error(heap, "binding not writable"));
                    }
                    return Ok(());
                }
                heap.incref(val);
                let old = heap.hobj(e).props.value(i);
                heap.hobj_mut(e).props.set_value(i, val);
                heap.decref(old);
                return Ok(());
            }
            Some(Binding::Target(target)) => {
                let present =
                    props::has_prop(heap, TVal::object(target), TVal::string(name))?;
                if present {
                    return props::put_prop(
                        heap,
                        TVal::object(target),
                        TVal::string(name),
                        val,
                        strict,
                    );
                }
            }
            None => {}
        }
        cur = heap.hobj(e).prototype;
    }
    if strict {
        let name_str = heap.hstr(name).as_str().unwrap_or("<binary>").to_string();
        return Err(reference_error(heap, &format!("identifier '{name_str}' undefined")));
    }
    let global = heap.thr().builtins[crate::hthread::TB_GLOBAL];
    props::put_prop(heap, TVal::object(global), TVal::string(name), val, false)
}

/// `delvar`: walk the chain; silently true when absent, false for
/// register-bound or non-configurable bindings.
pub(crate) fn delvar(heap: &mut Heap, env: Option<ObjId>, name: StrId) -> Result<bool, Unwind> {
    let mut cur = env;
    for _ in 0..PROTO_SANITY_LIMIT {
        let Some(e) = cur else { break };
        match record_lookup(heap, e, name) {
            Some(Binding::Register(_)) => return Ok(false),
            Some(Binding::RecordProp(i)) => {
                if heap.hobj(e).props.flags(i) & PROPF_CONFIGURABLE == 0 {
                    return Ok(false);
                }
                props::delete_own_raw(heap, e, name);
                return Ok(true);
            }
            Some(Binding::Target(target)) => {
                let present =
                    props::has_prop(heap, TVal::object(target), TVal::string(name))?;
                if present {
                    return props::del_prop(
                        heap,
                        TVal::object(target),
                        TVal::string(name),
                        false,
                    );
                }
            }
            None => {}
        }
        cur = heap.hobj(e).prototype;
    }
    Ok(true)
}

/// `declvar`: top-level declaration in the given variable environment.
/// Global object function redeclaration follows ES5.1 §10.5 step 5.e.
pub(crate) fn declvar(
    heap: &mut Heap,
    env: ObjId,
    name: StrId,
    val: TVal,
    flags: u8,
) -> Result<(), Unwind> {
    match heap.hobj(env).class {
        ObjClass::DecEnv => {
            if let Some(slot) = open_record_register(heap, env, name) {
                // Register-backed binding already exists; redeclaration
                // just assigns.
                heap.set_slot(slot, val);
                return Ok(());
            }
            let f = props::find_own(heap, env, name);
            if f.e_idx.is_some() {
                return putvar(heap, Some(env), name, val, false);
            }
            props::put_own_flags(heap, env, name, val, flags);
            Ok(())
        }
        ObjClass::ObjEnv => {
            let k = heap.bstr(Bstr::IntTarget);
            let Some(target) = props::get_own_plain(heap, env, k).and_then(|v| v.as_object())
            else {
                return Err(type_error(heap, "corrupt object environment"));
            };
            let f = props::find_own(heap, target, name);
            if let Some(i) = f.e_idx {
                let cur = heap.hobj(target).props.flags(i);
                if cur & PROPF_CONFIGURABLE == 0 {
                    let is_plain_data = cur & crate::proptable::PROPF_ACCESSOR == 0;
                    let writable_enumerable =
                        cur & PROPF_WRITABLE != 0 && cur & PROPF_ENUMERABLE != 0;
                    if !(is_plain_data && writable_enumerable) {
                        return Err(type_error(heap, "cannot redeclare binding"));
                    }
                }
                // Redeclare: assign in place, keep existing attributes.
                heap.incref(val);
                let old = heap.hobj(target).props.value(i);
                heap.hobj_mut(target).props.set_value(i, val);
                heap.decref(old);
                return Ok(());
            }
            props::put_own_flags(heap, target, name, val, flags);
            Ok(())
        }
        _ => Err(type_error(heap, "not an environment record")),
    }
}

/// Close an open declarative record: copy every still-mapped register
/// into an own property, then sever the register fast path by deleting
/// the bookkeeping back-pointers. Atomic with respect to lookups: after
/// the flag is set, register resolution returns nothing.
pub(crate) fn close_environment(heap: &mut Heap, env: ObjId) {
    if heap.hobj(env).class != ObjClass::DecEnv || heap.hobj(env).hdr.has(OBJF_ENVRECCLOSED) {
        return;
    }
    let k_callee = heap.bstr(Bstr::IntCallee);
    let k_regbase = heap.bstr(Bstr::IntRegbase);
    let k_thread = heap.bstr(Bstr::IntThread);
    let k_varmap = heap.bstr(Bstr::IntVarmap);

    let callee = props::get_own_plain(heap, env, k_callee).and_then(|v| v.as_object());
    let regbase = props::get_own_plain(heap, env, k_regbase)
        .and_then(|v| v.as_number())
        .map(|n| n as usize);

    if let (Some(callee), Some(regbase)) = (callee, regbase) {
        if let Some(varmap) = props::get_own_plain(heap, callee, k_varmap).and_then(|v| v.as_object())
        {
            let names: Vec<(StrId, usize)> = heap
                .hobj(varmap)
                .props
                .entry_keys()
                .into_iter()
                .filter_map(|(i, key)| {
                    let reg = heap.hobj(varmap).props.value(i).as_number()? as usize;
                    Some((key, reg))
                })
                .collect();
            trace!(env = env.raw(), bindings = names.len(), "closing environment record");
            for (name, reg) in names {
                let v = heap.thr().valstack[regbase + reg];
                props::put_own_flags(heap, env, name, v, PROPF_WRITABLE | PROPF_ENUMERABLE);
            }
        }
    }

    props::delete_own_raw(heap, env, k_callee);
    props::delete_own_raw(heap, env, k_regbase);
    props::delete_own_raw(heap, env, k_thread);
    heap.hobj_mut(env).hdr.set(OBJF_ENVRECCLOSED);
}

/// Single-record read used by the Arguments parameter map. On success the
/// value is pushed and true is returned.
pub(crate) fn getvar_binding(heap: &mut Heap, env: ObjId, name: StrId) -> Result<bool, Unwind> {
    match record_lookup(heap, env, name) {
        Some(Binding::Register(slot)) => {
            let v = heap.thr().valstack[slot];
            heap.push(v)?;
            Ok(true)
        }
        Some(Binding::RecordProp(i)) => {
            let v = record_prop_value(heap, env, i);
            heap.push(v)?;
            Ok(true)
        }
        Some(Binding::Target(target)) => {
            if props::has_prop(heap, TVal::object(target), TVal::string(name))? {
                props::get_prop(heap, TVal::object(target), TVal::string(name))?;
                Ok(true)
            } else {
                Ok(false)
            }
        }
        None => Ok(false),
    }
}

/// Single-record write used by the Arguments parameter map.
pub(crate) fn putvar_binding(
    heap: &mut Heap,
    env: ObjId,
    name: StrId,
    val: TVal,
) -> Result<(), Unwind> {
    match record_lookup(heap, env, name) {
        Some(Binding::Register(slot)) => {
            heap.set_slot(slot, val);
            Ok(())
        }
        Some(Binding::RecordProp(i)) => {
            heap.incref(val);
            let old = heap.hobj(env).props.value(i);
            heap.hobj_mut(env).props.set_value(i, val);
            heap.decref(old);
            Ok(())
        }
        Some(Binding::Target(target)) => {
            props::put_prop(heap, TVal::object(target), TVal::string(name), val, false)
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proptable::PROPF_WRITABLE;

    /// Build an open declarative record backed by two "registers" on the
    /// current thread's stack (x -> reg 0, y -> reg 1).
    fn open_record_fixture(heap: &mut Heap) -> (ObjId, StrId, StrId) {
        let thread = heap.curr();
        let regbase = heap.thr().valstack_top;
        heap.push(TVal::number(11.0)).unwrap();
        heap.push(TVal::number(22.0)).unwrap();

        let func = crate::call::alloc_compiled_function(heap, 2, 2);
        heap.incref_obj(func);
        let vm = heap.alloc_object(crate::hobject::OBJF_EXTENSIBLE, ObjClass::Object);
        heap.incref_obj(vm);
        let x = crate::strtab::intern(heap, b"x");
        let y = crate::strtab::intern(heap, b"y");
        props::put_own_internal(heap, vm, x, TVal::number(0.0));
        props::put_own_internal(heap, vm, y, TVal::number(1.0));
        let k_vm = heap.bstr(Bstr::IntVarmap);
        props::put_own_internal(heap, func, k_vm, TVal::object(vm));
        heap.decref_obj(vm);

        let env = alloc_dec_env(heap, None);
        heap.incref_obj(env);
        bind_open_record(heap, env, thread, func, regbase);
        heap.decref_obj(func); // owned through the record's IntCallee
        (env, x, y)
    }

    #[test]
    fn test_register_fast_path_reads_and_writes() {
        let mut heap = Heap::new();
        let (env, x, _y) = open_record_fixture(&mut heap);

        assert!(getvar(&mut heap, Some(env), x, true).unwrap());
        // getvar pushes value then this binding.
        assert_eq!(heap.top_value(), TVal::undefined());
        heap.pop_unsafe();
        assert_eq!(heap.top_value(), TVal::number(11.0));
        heap.pop_unsafe();

        putvar(&mut heap, Some(env), x, TVal::number(99.0), true).unwrap();
        assert!(getvar_binding(&mut heap, env, x).unwrap());
        assert_eq!(heap.top_value(), TVal::number(99.0));
        heap.pop_unsafe();
        heap.decref_obj(env);
    }

    #[test]
    fn test_delvar_register_bound_returns_false() {
        let mut heap = Heap::new();
        let (env, x, _y) = open_record_fixture(&mut heap);
        assert!(!delvar(&mut heap, Some(env), x).unwrap());
        // absent name deletes silently-true
        let z = crate::strtab::intern(&mut heap, b"z");
        assert!(delvar(&mut heap, Some(env), z).unwrap());
        heap.decref_obj(env);
    }

    #[test]
    fn test_close_severs_registers() {
        let mut heap = Heap::new();
        let (env, x, y) = open_record_fixture(&mut heap);
        close_environment(&mut heap, env);

        // Closed record serves copied values from own properties.
        assert!(getvar(&mut heap, Some(env), x, true).unwrap());
        heap.pop_unsafe();
        assert_eq!(heap.top_value(), TVal::number(11.0));
        heap.pop_unsafe();

        // Register writes no longer flow through: mutate the record then
        // check the stack slot is untouched.
        putvar(&mut heap, Some(env), y, TVal::number(0.5), true).unwrap();
        let reg1 = {
            let thr = heap.thr();
            thr.valstack[thr.valstack_top - 1]
        };
        assert_eq!(reg1, TVal::number(22.0));
        heap.decref_obj(env);
    }

    #[test]
    fn test_hasvar_single_level() {
        let mut heap = Heap::new();
        let parent = alloc_dec_env(&mut heap, None);
        heap.incref_obj(parent);
        let name = crate::strtab::intern(&mut heap, b"only_in_parent");
        props::put_own_flags(&mut heap, parent, name, TVal::boolean(true), PROPF_WRITABLE);

        let child = alloc_dec_env(&mut heap, Some(parent));
        heap.incref_obj(child);
        // hasvar is single level: the child does not see the parent.
        assert!(!hasvar(&mut heap, child, name).unwrap());
        assert!(hasvar(&mut heap, parent, name).unwrap());
        // getvar walks the chain and finds it.
        assert!(getvar(&mut heap, Some(child), name, true).unwrap());
        heap.pop_unsafe();
        heap.pop_unsafe();
        heap.decref_obj(child);
        heap.decref_obj(parent);
    }
}
