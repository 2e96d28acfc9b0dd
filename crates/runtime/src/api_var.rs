//! Value-stack API: identifier (variable) access
//!
//! Executor- and host-facing entry points into the environment-record
//! chain: get/put/delete/declare by name against the current activation's
//! lexical environment, materializing it on demand (the lazy new-env
//! scheme keeps most calls register-only until a slow-path operation
//! lands here).

use eider_core::{ObjId, TVal};

use crate::error::Unwind;
use crate::heap::{Bstr, Heap};
use crate::hthread::TB_GLOBAL_ENV;
use crate::props;

impl Heap {
    /// Current lexical environment, materializing the activation's record
    /// on first use. Entry-level (no activation) resolves to the global
    /// environment.
    pub fn current_lex_env(&mut self) -> Result<ObjId, Unwind> {
        let thread = self.curr();
        let (act_env, act_func, act_bottom, have_act) = match self.thr().callstack.last() {
            Some(act) => (act.lex_env, act.func, act.idx_bottom, true),
            None => (None, None, 0, false),
        };
        if let Some(env) = act_env {
            return Ok(env);
        }
        if !have_act {
            return Ok(self.thr().builtins[TB_GLOBAL_ENV]);
        }
        let Some(func) = act_func else {
            return Ok(self.thr().builtins[TB_GLOBAL_ENV]);
        };
        crate::call::materialize_env(self, thread, func, act_bottom)
    }

    /// Current variable environment (same materialization rules).
    pub fn current_var_env(&mut self) -> Result<ObjId, Unwind> {
        let env = self.current_lex_env()?;
        match self.thr().callstack.last().and_then(|a| a.var_env) {
            Some(v) => Ok(v),
            None => Ok(env),
        }
    }

    /// `getvar`: push the value bound to `name` and return true; missing
    /// identifiers throw `ReferenceError` when `throw` is set (the
    /// `typeof` discipline passes false) and push nothing otherwise.
    pub fn get_var(&mut self, name: &str, throw: bool) -> Result<bool, Unwind> {
        let env = self.current_lex_env()?;
        let id = crate::strtab::intern(self, name.as_bytes());
        self.temp_root(eider_core::TVal::string(id));
        let r = crate::env::getvar(self, Some(env), id, throw);
        self.untemp_root();
        let found = r?;
        if found {
            // getvar pushes [value this]; the API surface keeps the value
            // only.
            self.pop()?;
        }
        Ok(found)
    }

    /// `putvar`: bind the stack top to `name` (popped). Strict not-found
    /// is a `ReferenceError`; non-strict creates a global binding.
    pub fn put_var(&mut self, name: &str) -> Result<(), Unwind> {
        let env = self.current_lex_env()?;
        let id = crate::strtab::intern(self, name.as_bytes());
        self.temp_root(eider_core::TVal::string(id));
        let val = self.require_tval(-1)?;
        let strict = self.current_strictness();
        let r = crate::env::putvar(self, Some(env), id, val, strict);
        self.untemp_root();
        r?;
        self.pop()
    }

    /// `delvar`: delete the binding; silently true when absent, false for
    /// register-bound or non-configurable bindings.
    pub fn del_var(&mut self, name: &str) -> Result<bool, Unwind> {
        let env = self.current_lex_env()?;
        let id = crate::strtab::intern(self, name.as_bytes());
        self.temp_root(eider_core::TVal::string(id));
        let r = crate::env::delvar(self, Some(env), id);
        self.untemp_root();
        r
    }

    /// `declvar`: top-level declaration in the variable environment with
    /// the given attribute flags; the initial value is popped from the
    /// stack.
    pub fn decl_var(&mut self, name: &str, prop_flags: u8) -> Result<(), Unwind> {
        let env = self.current_var_env()?;
        let id = crate::strtab::intern(self, name.as_bytes());
        self.temp_root(eider_core::TVal::string(id));
        let val = self.require_tval(-1)?;
        let r = crate::env::declvar(self, env, id, val, prop_flags);
        self.untemp_root();
        r?;
        self.pop()
    }

    /// Close the current activation's environment record for capture:
    /// still-mapped registers are copied into the record and the register
    /// fast path is severed.
    pub fn close_current_env(&mut self) -> Result<(), Unwind> {
        let env = self.current_lex_env()?;
        crate::env::close_environment(self, env);
        Ok(())
    }

    /// Build a `with`-style object environment over the object at
    /// `target_index`, chained in front of the current environment, and
    /// make it the activation's lexical environment. Returns the record.
    pub fn push_with_env(&mut self, target_index: i32) -> Result<ObjId, Unwind> {
        let target = self.require_object(target_index)?;
        let target_tv = self.require_tval(target_index)?;
        let parent = self.current_lex_env()?;
        let env = crate::env::alloc_obj_env(self, target, Some(target_tv), Some(parent));
        self.incref_obj(env);
        let thread = self.curr();
        let Some(act) = self.thr_of_mut(thread).callstack.last_mut() else {
            self.decref_obj(env);
            return Err(crate::error::api_error(self, "with-scope requires an activation"));
        };
        let old = act.lex_env.replace(env);
        if let Some(o) = old {
            self.decref_obj(o);
        }
        Ok(env)
    }
    /// Store the function-name binding used by named function
    /// expressions: a one-binding declarative record holding `name` →
    /// the function itself, placed between the function's scope and its
    /// parent.
    pub fn push_name_binding_env(&mut self, func_index: i32, name: &str) -> Result<ObjId, Unwind> {
        let func = self.require_callable(func_index)?;
        let k_lex = self.bstr(Bstr::IntLexenv);
        let parent = props::get_own_plain(self, func, k_lex).and_then(|v| v.as_object());
        let env = crate::env::alloc_dec_env(self, parent);
        self.temp_root(TVal::object(env));
        let id = crate::strtab::intern(self, name.as_bytes());
        props::put_own_flags(self, env, id, TVal::object(func), 0); // non-writable binding
        props::put_own_internal(self, func, k_lex, TVal::object(env));
        self.untemp_root();
        Ok(env)
    }
}
