//! Value-stack API: calls, protected calls, construction, compilation
//!
//! `call` consumes `[... func arg1 .. argN]`, `call_method` consumes
//! `[... func this arg1 .. argN]`; both leave the single return value.
//! Protected variants translate any unwind into a stack-normalized
//! result instead of propagating. `compile`/`eval` delegate to the
//! installed executor seam.

use eider_core::{TVal, Tag};

use crate::bytecode::{Instr, encode_instrs, pc2line_encode};
use crate::call::{self, CALL_FLAG_CONSTRUCT};
use crate::error::{Unwind, type_error};
use crate::executor::COMPILE_EVAL;
use crate::heap::{Bstr, Heap};
use crate::hobject::{
    OBJF_BOUND, OBJF_CREATEARGS, OBJF_EXTENSIBLE, OBJF_NAMEBINDING, OBJF_NEWENV, OBJF_STRICT,
    ObjClass,
};
use crate::props;

/// Outcome of a protected call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Success,
    Error,
}

impl Heap {
    /// `[... func arg1 .. argN] -> [... retval]` with an undefined `this`
    /// binding.
    pub fn call(&mut self, nargs: usize) -> Result<(), Unwind> {
        let top = self.get_top();
        if top < nargs + 1 {
            return Err(crate::error::api_error(self, "call stack shape invalid"));
        }
        // Splice the implicit this below the arguments.
        self.push_undefined()?;
        self.insert((top - nargs) as i32)?;
        match call::ecma_call(self, nargs, 0) {
            Err(Unwind::Throw) => {
                // The unwound frame still holds the spliced-in this; the
                // caller only pushed func and args.
                let _ = self.remove(-(nargs as i32) - 1);
                Err(Unwind::Throw)
            }
            other => other,
        }
    }

    /// `[... func this arg1 .. argN] -> [... retval]`.
    pub fn call_method(&mut self, nargs: usize) -> Result<(), Unwind> {
        call::ecma_call(self, nargs, 0)
    }

    /// Protected `call`: on success `[... retval]`, on error
    /// `[... errval]`; never propagates a throw.
    pub fn pcall(&mut self, nargs: usize) -> ExecStatus {
        let snap = call::snapshot(self);
        let idx_func = self.abs_top().saturating_sub(nargs + 1);
        match self.call(nargs) {
            Ok(()) => ExecStatus::Success,
            Err(Unwind::Throw) => self.settle_protected_error(idx_func),
            Err(_) => {
                // A coroutine escape cannot cross a protected boundary.
                call::unwind_to_snapshot(self, &snap);
                let _ = type_error(self, "attempt to yield across protected call");
                self.settle_protected_error(idx_func)
            }
        }
    }

    /// Protected `call_method`.
    pub fn pcall_method(&mut self, nargs: usize) -> ExecStatus {
        let snap = call::snapshot(self);
        let idx_func = self.abs_top().saturating_sub(nargs + 2);
        match self.call_method(nargs) {
            Ok(()) => ExecStatus::Success,
            Err(Unwind::Throw) => self.settle_protected_error(idx_func),
            Err(_) => {
                call::unwind_to_snapshot(self, &snap);
                let _ = type_error(self, "attempt to yield across protected call");
                self.settle_protected_error(idx_func)
            }
        }
    }

    fn settle_protected_error(&mut self, retbase: usize) -> ExecStatus {
        let err = self.lj.value1;
        // The error value is rooted in the longjmp slot while we rebuild
        // the frame.
        self.truncate_to(retbase);
        if self.valstack_reserve(1) {
            let _ = self.push(err);
        }
        self.lj_clear();
        ExecStatus::Error
    }

    /// Protected native call inside the current activation (section
    /// 4.6.2): `[... arg1 .. argN]` becomes exactly `nrets` values — the
    /// function's results on success, or the error value followed by
    /// undefined padding on failure. The call stack never grows.
    pub fn safe_call(
        &mut self,
        func: fn(&mut Heap) -> Result<i32, Unwind>,
        nargs: usize,
        nrets: usize,
    ) -> ExecStatus {
        let snap = call::snapshot(self);
        let entry_base = snap.valstack_top.saturating_sub(nargs);

        let outcome = func(self);
        match outcome {
            Ok(n) if n >= 0 => {
                // Keep the last n values the function produced, rebased
                // onto entry_base, normalized to nrets.
                let n = n as usize;
                let top = self.abs_top();
                let have = n.min(top.saturating_sub(entry_base));
                let src = top - have;
                for i in 0..have {
                    let tv = self.thr().valstack[src + i];
                    self.set_slot(entry_base + i, tv);
                }
                self.truncate_to(entry_base + have);
                for _ in have..nrets {
                    if self.push(TVal::undefined()).is_err() {
                        break;
                    }
                }
                self.truncate_to(entry_base + nrets);
                ExecStatus::Success
            }
            Ok(rc) => {
                let _ = crate::error::throw_from_magic(self, rc);
                self.safe_call_error(&snap, entry_base, nrets)
            }
            Err(Unwind::Throw) => self.safe_call_error(&snap, entry_base, nrets),
            Err(_) => {
                let _ = type_error(self, "attempt to yield across protected call");
                self.safe_call_error(&snap, entry_base, nrets)
            }
        }
    }

    fn safe_call_error(
        &mut self,
        snap: &call::CallSnapshot,
        entry_base: usize,
        nrets: usize,
    ) -> ExecStatus {
        let err = self.lj.value1;
        call::unwind_to_snapshot(self, snap);
        self.truncate_to(entry_base);
        if nrets > 0 && self.valstack_reserve(nrets) {
            let _ = self.push(err);
            for _ in 1..nrets {
                let _ = self.push(TVal::undefined());
            }
        }
        self.lj_clear();
        ExecStatus::Error
    }

    /// Constructor call: `[... func arg1 .. argN] -> [... result]`. A
    /// non-object return value is replaced by the freshly constructed
    /// instance.
    pub fn construct(&mut self, nargs: usize) -> Result<(), Unwind> {
        let top = self.get_top();
        if top < nargs + 1 {
            return Err(crate::error::api_error(self, "call stack shape invalid"));
        }
        let rel_func = (top - nargs - 1) as i32;
        let func_tv = self.require_tval(rel_func)?;
        let Some(func) = func_tv.as_object().filter(|&f| self.hobj(f).is_callable()) else {
            return Err(type_error(self, "constructor not callable"));
        };
        if !self.hobj(func).hdr.has(crate::hobject::OBJF_CONSTRUCTABLE) {
            return Err(type_error(self, "not constructable"));
        }

        // Fresh instance with [[Prototype]] from func.prototype when it
        // is an object.
        let instance = self.alloc_object(OBJF_EXTENSIBLE, ObjClass::Object);
        self.push(TVal::object(instance))?;
        let key = self.bstr(Bstr::Prototype);
        props::get_prop(self, func_tv, TVal::string(key))?;
        let proto = self.top_value().as_object();
        self.pop_unsafe();
        props::set_prototype(self, instance, proto);

        // [... func a1..aN inst] -> [... inst func inst a1..aN]
        self.insert(rel_func)?; // keep a rooted fallback below func
        self.dup(rel_func)?; // [... inst func a1..aN inst]
        self.insert(rel_func + 2)?; // [... inst func inst a1..aN]

        match call::ecma_call(self, nargs, CALL_FLAG_CONSTRUCT) {
            Ok(()) => {}
            Err(Unwind::Throw) => {
                // Unwind the two instance cells spliced around the frame.
                let _ = self.remove(-(nargs as i32) - 1);
                let _ = self.remove(-(nargs as i32) - 2);
                return Err(Unwind::Throw);
            }
            Err(other) => return Err(other),
        }
        // [... inst retval]
        if self.get_type(-1) == Some(Tag::Object) {
            self.remove(-2)?;
        } else {
            self.pop()?;
        }
        Ok(())
    }

    /// Compile `[... source filename]` into `[... function]` through the
    /// executor seam.
    pub fn compile(&mut self, flags: u32) -> Result<(), Unwind> {
        let Some(ex) = self.executor.clone() else {
            return Err(crate::error::unimplemented_error(self, "no executor installed"));
        };
        ex.compile(self, flags)
    }

    /// Compile-and-run an eval program: `[... source filename]` becomes
    /// `[... result]`.
    pub fn eval(&mut self) -> Result<(), Unwind> {
        self.compile(COMPILE_EVAL)?;
        self.call(0)
    }

    // ------------------------------------------------------------------
    // Function construction (executor/compiler support surface)
    // ------------------------------------------------------------------

    /// `[... func this arg1 .. argN] -> [... bound]`: build a bound
    /// function wrapping the target with a pre-bound this and argument
    /// prefix.
    pub fn bind(&mut self, nargs: usize) -> Result<i32, Unwind> {
        let top = self.get_top();
        if top < nargs + 2 {
            return Err(crate::error::api_error(self, "call stack shape invalid"));
        }
        let rel_func = (top - nargs - 2) as i32;
        let target = self.require_callable(rel_func)?;
        let this_tv = self.require_tval(rel_func + 1)?;

        let bound = self.alloc_object(
            OBJF_EXTENSIBLE | OBJF_BOUND | crate::hobject::OBJF_CONSTRUCTABLE,
            ObjClass::Function,
        );
        self.push(TVal::object(bound))?;

        let k = self.bstr(Bstr::IntTarget);
        props::put_own_internal(self, bound, k, TVal::object(target));
        let k = self.bstr(Bstr::IntThis);
        props::put_own_internal(self, bound, k, this_tv);

        let args_arr = props::alloc_array_object(self, nargs);
        self.push(TVal::object(args_arr))?;
        for i in 0..nargs {
            let v = self.require_tval(rel_func + 2 + i as i32)?;
            props::array_init_slot(self, args_arr, i as u32, v);
        }
        let k = self.bstr(Bstr::IntArgs);
        props::put_own_internal(self, bound, k, TVal::object(args_arr));
        self.pop()?; // args_arr

        // Replace [func this a1..aN] with the bound function.
        let bound_tv = self.require_tval(-1)?;
        let abs_func = self.require_normalize_index(rel_func)?;
        self.set_slot(abs_func, bound_tv);
        self.truncate_to(abs_func + 1);
        Ok(self.get_top_index())
    }

    /// Push a compiled-function shell; bytecode and tables are attached
    /// with the `compfunc_*` methods.
    pub fn push_compiled_function(&mut self, nregs: u16, nargs: u16) -> Result<i32, Unwind> {
        let f = call::alloc_compiled_function(self, nregs, nargs);
        self.push(TVal::object(f))?;
        Ok(self.get_top_index())
    }

    fn require_compfunc(&mut self, index: i32) -> Result<eider_core::ObjId, Unwind> {
        let f = self.require_object(index)?;
        if !self.hobj(f).is_compfunc() {
            return Err(type_error(self, "compiled function required"));
        }
        Ok(f)
    }

    /// Attach instruction words and the per-function pc→line table.
    pub fn compfunc_set_bytecode(
        &mut self,
        func_index: i32,
        instrs: &[Instr],
        lines: &[u32],
    ) -> Result<(), Unwind> {
        let f = self.require_compfunc(func_index)?;
        let code = encode_instrs(instrs);
        let b = self.alloc_buffer(code.len(), false);
        self.incref_buf(b);
        self.hbuf_mut(b).as_mut_slice().copy_from_slice(&code);
        let old = self.hobj_mut(f).compfunc_mut().data.replace(b);
        if let Some(o) = old {
            self.decref_buf(o);
        }

        if !lines.is_empty() {
            let table = pc2line_encode(lines);
            let pb = self.alloc_buffer(table.len(), false);
            self.incref_buf(pb);
            self.hbuf_mut(pb).as_mut_slice().copy_from_slice(&table);
            let old = self.hobj_mut(f).compfunc_mut().pc2line.replace(pb);
            if let Some(o) = old {
                self.decref_buf(o);
            }
        }
        Ok(())
    }

    /// Pop the stack top into the function's constants table; returns the
    /// constant's index.
    pub fn compfunc_add_constant(&mut self, func_index: i32) -> Result<usize, Unwind> {
        let f = self.require_compfunc(func_index)?;
        let v = self.require_tval(-1)?;
        self.incref(v);
        let d = self.hobj_mut(f).compfunc_mut();
        d.consts.push(v);
        let idx = d.consts.len() - 1;
        self.pop()?;
        Ok(idx)
    }

    /// Record an inner function; returns its table index.
    pub fn compfunc_add_inner(&mut self, func_index: i32, inner_index: i32) -> Result<usize, Unwind> {
        let f = self.require_compfunc(func_index)?;
        let inner = self.require_callable(inner_index)?;
        self.incref_obj(inner);
        let d = self.hobj_mut(f).compfunc_mut();
        d.funcs.push(inner);
        Ok(d.funcs.len() - 1)
    }

    /// Set function behavior flags the compiler derives from source.
    pub fn compfunc_configure(
        &mut self,
        func_index: i32,
        strict: bool,
        newenv: bool,
        createargs: bool,
        namebinding: bool,
    ) -> Result<(), Unwind> {
        let f = self.require_object(func_index)?;
        let hdr = &mut self.hobj_mut(f).hdr;
        for (on, bit) in [
            (strict, OBJF_STRICT),
            (newenv, OBJF_NEWENV),
            (createargs, OBJF_CREATEARGS),
            (namebinding, OBJF_NAMEBINDING),
        ] {
            if on {
                hdr.set(bit);
            } else {
                hdr.clear(bit);
            }
        }
        Ok(())
    }

    /// Set the function's name and source file (used in tracebacks).
    pub fn compfunc_set_name(
        &mut self,
        func_index: i32,
        name: &str,
        filename: &str,
    ) -> Result<(), Unwind> {
        let f = self.require_object(func_index)?;
        let n = crate::strtab::intern(self, name.as_bytes());
        let k = self.bstr(Bstr::IntName);
        props::put_own_internal(self, f, k, TVal::string(n));
        let src = crate::strtab::intern(self, filename.as_bytes());
        let k = self.bstr(Bstr::IntSource);
        props::put_own_internal(self, f, k, TVal::string(src));
        Ok(())
    }

    /// Set the name→register map that backs the open-record fast path.
    pub fn compfunc_set_varmap(
        &mut self,
        func_index: i32,
        map: &[(&str, u32)],
    ) -> Result<(), Unwind> {
        let f = self.require_object(func_index)?;
        let vm = self.alloc_object(OBJF_EXTENSIBLE, ObjClass::Object);
        self.push(TVal::object(vm))?;
        for (name, reg) in map {
            let n = crate::strtab::intern(self, name.as_bytes());
            props::put_own_internal(self, vm, n, TVal::number(*reg as f64));
        }
        let k = self.bstr(Bstr::IntVarmap);
        props::put_own_internal(self, f, k, TVal::object(vm));
        self.pop()
    }

    /// Set the formal parameter name list (Arguments parameter map).
    pub fn compfunc_set_formals(&mut self, func_index: i32, formals: &[&str]) -> Result<(), Unwind> {
        let f = self.require_object(func_index)?;
        let arr = props::alloc_array_object(self, formals.len());
        self.push(TVal::object(arr))?;
        for (i, name) in formals.iter().enumerate() {
            let n = crate::strtab::intern(self, name.as_bytes());
            props::array_init_slot(self, arr, i as u32, TVal::string(n));
        }
        let k = self.bstr(Bstr::IntFormals);
        props::put_own_internal(self, f, k, TVal::object(arr));
        self.pop()
    }

    /// Store the function's lexical environment (closure capture).
    pub fn compfunc_set_lexenv(&mut self, func_index: i32, env_index: i32) -> Result<(), Unwind> {
        let f = self.require_object(func_index)?;
        let env = self.require_object(env_index)?;
        let k = self.bstr(Bstr::IntLexenv);
        props::put_own_internal(self, f, k, TVal::object(env));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Activation access (executor support surface)
    // ------------------------------------------------------------------

    /// Depth of the current thread's call stack.
    pub fn callstack_depth(&self) -> usize {
        self.thr().callstack.len()
    }

    /// Program counter of the topmost activation.
    pub fn act_pc(&self) -> u32 {
        self.thr().callstack.last().map(|a| a.pc).unwrap_or(0)
    }

    pub fn act_set_pc(&mut self, pc: u32) {
        let thread = self.curr();
        if let Some(act) = self.thr_of_mut(thread).callstack.last_mut() {
            act.pc = pc;
        }
    }

    /// Register count of the executing compiled function (0 otherwise).
    pub fn act_nregs(&self) -> u32 {
        let Some(f) = self.thr().callstack.last().and_then(|a| a.func) else {
            return 0;
        };
        match &self.hobj(f).extra {
            crate::hobject::ObjExtra::CompFunc(d) => d.nregs as u32,
            _ => 0,
        }
    }

    /// Instruction word at `pc` of the executing compiled function.
    pub fn act_fetch_instr(&self, pc: u32) -> Option<Instr> {
        let f = self.thr().callstack.last().and_then(|a| a.func)?;
        let data = match &self.hobj(f).extra {
            crate::hobject::ObjExtra::CompFunc(d) => d.data?,
            _ => return None,
        };
        let bytes = self.hbuf(data).as_slice();
        let off = pc as usize * 4;
        let w = bytes.get(off..off + 4)?;
        Some(Instr(u32::from_le_bytes([w[0], w[1], w[2], w[3]])))
    }

    /// Constant `idx` of the executing compiled function.
    pub fn act_const(&self, idx: u32) -> TVal {
        let Some(f) = self.thr().callstack.last().and_then(|a| a.func) else {
            return TVal::undefined();
        };
        match &self.hobj(f).extra {
            crate::hobject::ObjExtra::CompFunc(d) => {
                d.consts.get(idx as usize).copied().unwrap_or(TVal::undefined())
            }
            _ => TVal::undefined(),
        }
    }

    /// Read register `reg` of the current activation frame.
    pub fn reg_get(&self, reg: u32) -> TVal {
        let thr = self.thr();
        thr.valstack[thr.valstack_bottom + reg as usize]
    }

    /// Write register `reg` of the current activation frame.
    pub fn reg_set(&mut self, reg: u32, v: TVal) {
        let bottom = self.thr().valstack_bottom;
        self.set_slot(bottom + reg as usize, v);
    }

    /// Read the cell at an API index (lenient).
    pub fn peek_tval(&self, index: i32) -> Option<TVal> {
        self.get_tval(index)
    }

    /// Push an arbitrary rooted cell.
    pub fn push_tval(&mut self, tv: TVal) -> Result<(), Unwind> {
        self.push(tv)
    }

    /// Longjmp-state inspection for executor longjmp handlers.
    pub fn lj_kind(&self) -> crate::heap::LjKind {
        self.lj.kind
    }

    pub fn lj_value1(&self) -> TVal {
        self.lj.value1
    }

    pub fn lj_value2(&self) -> TVal {
        self.lj.value2
    }

    pub fn lj_is_error(&self) -> bool {
        self.lj.iserror
    }

    /// Install a catcher for the current activation (executor try/catch
    /// and label scopes). `varname` is interned for catch-binding scopes.
    pub fn push_catcher(
        &mut self,
        flags: u32,
        pc_base: u32,
        idx_base: usize,
        varname: Option<&str>,
    ) -> Result<(), Unwind> {
        let thread = self.curr();
        let callstack_index = self.thr().callstack.len().saturating_sub(1);
        let varname = match varname {
            Some(n) => {
                let id = crate::strtab::intern(self, n.as_bytes());
                self.incref_str(id);
                Some(id)
            }
            None => None,
        };
        self.thr_of_mut(thread).catchstack.push(crate::hthread::Catcher {
            flags,
            callstack_index,
            pc_base,
            idx_base,
            varname,
            env: None,
        });
        Ok(())
    }

    /// Remove the innermost catcher.
    pub fn pop_catcher(&mut self) {
        let thread = self.curr();
        if let Some(cat) = self.thr_of_mut(thread).catchstack.pop() {
            if let Some(env) = cat.env {
                self.decref_obj(env);
            }
            if let Some(v) = cat.varname {
                self.decref_str(v);
            }
        }
    }

    /// Number of active catchers on the current thread.
    pub fn catcher_count(&self) -> usize {
        self.thr().catchstack.len()
    }

    /// Innermost catcher belonging to the current activation, as
    /// `(flags, pc_base, idx_base)`.
    pub fn top_catcher(&self) -> Option<(u32, u32, usize)> {
        let thr = self.thr();
        let act_index = thr.callstack.len().saturating_sub(1);
        thr.catchstack
            .iter()
            .rev()
            .find(|c| c.callstack_index == act_index)
            .map(|c| (c.flags, c.pc_base, c.idx_base))
    }

    /// Coroutine state of the thread object at `index`.
    pub fn thread_state(&mut self, index: i32) -> Result<crate::hthread::ThreadState, Unwind> {
        let t = self.require_thread(index)?;
        Ok(self.thr_of(t).state)
    }

    /// Seed an inactive thread's stack with its entry callable so that a
    /// first resume can start it.
    pub fn thread_prepare(&mut self, thread_index: i32, func_index: i32) -> Result<(), Unwind> {
        let thread = self.require_thread(thread_index)?;
        let func = self.require_callable(func_index)?;
        {
            let td = self.thr_of(thread);
            if td.state != crate::hthread::ThreadState::Inactive || td.valstack_top != 0 {
                return Err(crate::error::api_error(self, "thread not preparable"));
            }
        }
        self.incref_obj(func);
        let td = self.thr_of_mut(thread);
        td.valstack[0] = TVal::object(func);
        td.valstack_top = 1;
        Ok(())
    }
}
