//! Value-stack API: object and property operations
//!
//! Property reads/writes follow the duk-style stack conventions: keys
//! (and values for writes) are consumed from the stack top, results are
//! pushed. `*_string` / `*_index` shorthands skip the explicit key push.

use eider_core::{ObjId, TVal};

use crate::coerce;
use crate::enumerate;
use crate::error::Unwind;
use crate::heap::{Bstr, Heap};
use crate::props::{self, PropDesc};

impl Heap {
    /// `[... key] -> [... value]`: property read on the object at
    /// `obj_index` with the key at the top.
    pub fn get_prop(&mut self, obj_index: i32) -> Result<(), Unwind> {
        let obj = self.require_tval(obj_index)?;
        let key = self.require_tval(-1)?;
        props::get_prop(self, obj, key)?;
        // Stack: [... key value]; drop the key beneath the result.
        self.remove(-2)
    }

    pub fn get_prop_string(&mut self, obj_index: i32, key: &str) -> Result<(), Unwind> {
        let obj = self.require_tval(obj_index)?;
        let id = crate::strtab::intern(self, key.as_bytes());
        props::get_prop(self, obj, TVal::string(id))
    }

    pub fn get_prop_index(&mut self, obj_index: i32, idx: u32) -> Result<(), Unwind> {
        let obj = self.require_tval(obj_index)?;
        props::get_prop(self, obj, TVal::number(idx as f64))
    }

    /// `[... key value] -> [...]`: property write on the object at
    /// `obj_index`. Strictness follows the current activation.
    pub fn put_prop(&mut self, obj_index: i32) -> Result<(), Unwind> {
        let obj = self.require_tval(obj_index)?;
        let key = self.require_tval(-2)?;
        let val = self.require_tval(-1)?;
        let strict = self.current_strictness();
        props::put_prop(self, obj, key, val, strict)?;
        self.pop_2()
    }

    pub fn put_prop_string(&mut self, obj_index: i32, key: &str) -> Result<(), Unwind> {
        let obj = self.require_tval(obj_index)?;
        let val = self.require_tval(-1)?;
        let id = crate::strtab::intern(self, key.as_bytes());
        let strict = self.current_strictness();
        props::put_prop(self, obj, TVal::string(id), val, strict)?;
        self.pop()
    }

    pub fn put_prop_index(&mut self, obj_index: i32, idx: u32) -> Result<(), Unwind> {
        let obj = self.require_tval(obj_index)?;
        let val = self.require_tval(-1)?;
        let strict = self.current_strictness();
        props::put_prop(self, obj, TVal::number(idx as f64), val, strict)?;
        self.pop()
    }

    /// `[... key] -> [...]`: deletion; returns the ES delete result.
    pub fn del_prop(&mut self, obj_index: i32) -> Result<bool, Unwind> {
        let obj = self.require_tval(obj_index)?;
        let key = self.require_tval(-1)?;
        let strict = self.current_strictness();
        let r = props::del_prop(self, obj, key, strict)?;
        self.pop()?;
        Ok(r)
    }

    pub fn del_prop_string(&mut self, obj_index: i32, key: &str) -> Result<bool, Unwind> {
        let obj = self.require_tval(obj_index)?;
        let id = crate::strtab::intern(self, key.as_bytes());
        let strict = self.current_strictness();
        props::del_prop(self, obj, TVal::string(id), strict)
    }

    pub fn del_prop_index(&mut self, obj_index: i32, idx: u32) -> Result<bool, Unwind> {
        let obj = self.require_tval(obj_index)?;
        let strict = self.current_strictness();
        props::del_prop(self, obj, TVal::number(idx as f64), strict)
    }

    /// `[... key] -> [...]`: presence test (own or inherited).
    pub fn has_prop(&mut self, obj_index: i32) -> Result<bool, Unwind> {
        let obj = self.require_tval(obj_index)?;
        let key = self.require_tval(-1)?;
        let r = props::has_prop(self, obj, key)?;
        self.pop()?;
        Ok(r)
    }

    pub fn has_prop_string(&mut self, obj_index: i32, key: &str) -> Result<bool, Unwind> {
        let obj = self.require_tval(obj_index)?;
        let id = crate::strtab::intern(self, key.as_bytes());
        props::has_prop(self, obj, TVal::string(id))
    }

    pub fn has_prop_index(&mut self, obj_index: i32, idx: u32) -> Result<bool, Unwind> {
        let obj = self.require_tval(obj_index)?;
        props::has_prop(self, obj, TVal::number(idx as f64))
    }

    /// Full `[[DefineOwnProperty]]` with a descriptor. Descriptor value
    /// cells must be rooted (typically they sit on the stack).
    pub fn def_prop(
        &mut self,
        obj_index: i32,
        key: &str,
        desc: PropDesc,
    ) -> Result<bool, Unwind> {
        let obj = self.require_object(obj_index)?;
        let id = crate::strtab::intern(self, key.as_bytes());
        self.temp_root(TVal::string(id));
        let strict = self.current_strictness();
        let r = props::define_property(self, obj, id, desc, strict);
        self.untemp_root();
        r
    }

    /// Define with an index key.
    pub fn def_prop_index(
        &mut self,
        obj_index: i32,
        idx: u32,
        desc: PropDesc,
    ) -> Result<bool, Unwind> {
        let obj = self.require_object(obj_index)?;
        let id = props::intern_u32(self, idx);
        self.temp_root(TVal::string(id));
        let strict = self.current_strictness();
        let r = props::define_property(self, obj, id, desc, strict);
        self.untemp_root();
        r
    }

    /// Push an enumerator for the object at `obj_index` (`ENUM_*` flags).
    pub fn enumerate(&mut self, obj_index: i32, flags: u32) -> Result<(), Unwind> {
        let target = self.require_tval(obj_index)?;
        enumerate::create_enumerator(self, target, flags)
    }

    /// Step the enumerator at `enum_index`: pushes the key (and the value
    /// when `get_value`) and returns true, or pushes nothing at the end.
    pub fn next(&mut self, enum_index: i32, get_value: bool) -> Result<bool, Unwind> {
        let obj = self.require_object(enum_index)?;
        enumerate::next(self, obj, get_value)
    }

    /// ES `instanceof` of the cells at the two indices.
    pub fn instance_of(&mut self, lhs_index: i32, rhs_index: i32) -> Result<bool, Unwind> {
        let lhs = self.require_tval(lhs_index)?;
        let rhs = self.require_tval(rhs_index)?;
        coerce::instance_of(self, lhs, rhs)
    }

    /// Loose equality (`==`) of the cells at the two indices.
    pub fn equals(&mut self, a_index: i32, b_index: i32) -> Result<bool, Unwind> {
        let a = self.require_tval(a_index)?;
        let b = self.require_tval(b_index)?;
        coerce::loose_equals(self, a, b)
    }

    /// Strict equality (`===`) of the cells at the two indices.
    pub fn strict_equals(&mut self, a_index: i32, b_index: i32) -> bool {
        let (Some(a), Some(b)) = (self.get_tval(a_index), self.get_tval(b_index)) else {
            return false;
        };
        coerce::strict_equals(self, a, b)
    }

    /// `typeof` name of the cell.
    pub fn type_of(&self, index: i32) -> &'static str {
        match self.get_tval(index) {
            Some(tv) => coerce::type_of(self, tv),
            None => "undefined",
        }
    }

    /// Rebuild the object's property table at tight sizes.
    pub fn compact(&mut self, obj_index: i32) -> Result<(), Unwind> {
        let obj = self.require_object(obj_index)?;
        props::compact_props(self, obj);
        Ok(())
    }

    /// Set the prototype of the object at `obj_index` to the object (or
    /// null) at `proto_index`.
    pub fn set_prototype(&mut self, obj_index: i32, proto_index: i32) -> Result<(), Unwind> {
        let obj = self.require_object(obj_index)?;
        let proto_tv = self.require_tval(proto_index)?;
        let proto = match proto_tv.as_object() {
            Some(p) => Some(p),
            None if proto_tv.is_null() => None,
            None => return Err(crate::error::type_error(self, "prototype must be object or null")),
        };
        props::set_prototype(self, obj, proto);
        Ok(())
    }

    /// Push the prototype of the object at `obj_index` (or null).
    pub fn get_prototype(&mut self, obj_index: i32) -> Result<(), Unwind> {
        let obj = self.require_object(obj_index)?;
        match self.hobj(obj).prototype {
            Some(p) => self.push(TVal::object(p)),
            None => self.push_null(),
        }
    }

    /// Push a freshly built error object of the given kind.
    pub fn push_error_object(&mut self, code: crate::error::ErrCode, msg: &str) -> Result<(), Unwind> {
        let obj = crate::error::create_error_object(self, code, msg);
        self.push(TVal::object(obj))
    }

    /// Register a finalizer: the callable at the stack top becomes the
    /// finalizer of the object at `obj_index` (popped).
    pub fn set_finalizer(&mut self, obj_index: i32) -> Result<(), Unwind> {
        let obj = self.require_object(obj_index)?;
        let f = self.require_tval(-1)?;
        let key = self.bstr(Bstr::IntFinalizer);
        props::put_own_internal(self, obj, key, f);
        self.pop()
    }

    /// Message string of the error value in the longjmp slot, if any.
    /// Used by hosts inspecting a failed protected call.
    pub fn error_message(&self) -> Option<String> {
        let v = self.lj.value1;
        let obj = v.as_object()?;
        let key = self.builtin_strs[Bstr::Message as usize];
        let msg = props::get_own_plain(self, obj, key)?.as_string()?;
        Some(String::from_utf8_lossy(self.hstr(msg).as_bytes()).into_owned())
    }

    /// Name (kind) string of the error value in the longjmp slot.
    pub fn error_name(&self) -> Option<String> {
        let v = self.lj.value1;
        let obj = v.as_object()?;
        let key = self.builtin_strs[Bstr::Name as usize];
        let name = props::get_own_plain(self, obj, key)?.as_string()?;
        Some(String::from_utf8_lossy(self.hstr(name).as_bytes()).into_owned())
    }

    pub(crate) fn current_strictness(&self) -> bool {
        match self.curr_activation() {
            Some(act) => act.flags & crate::hthread::ACT_STRICT != 0,
            None => self.thr().strict,
        }
    }

    pub(crate) fn require_thread(&mut self, index: i32) -> Result<ObjId, Unwind> {
        let id = self.require_object(index)?;
        if self.hobj(id).is_thread() {
            Ok(id)
        } else {
            Err(crate::error::type_error(self, "thread required"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enumerate::{ENUM_INCLUDE_NONENUMERABLE, ENUM_OWN_PROPERTIES_ONLY};

    #[test]
    fn test_put_get_roundtrip() {
        let mut ctx = Heap::new();
        let obj = ctx.push_object().unwrap();
        ctx.push_int(123).unwrap();
        ctx.put_prop_string(obj, "answer").unwrap();
        ctx.get_prop_string(obj, "answer").unwrap();
        assert_eq!(ctx.get_number(-1), 123.0);
        ctx.pop().unwrap();

        // Stack-keyed variant
        ctx.push_string("answer").unwrap();
        ctx.get_prop(obj).unwrap();
        assert_eq!(ctx.get_number(-1), 123.0);
    }

    #[test]
    fn test_get_missing_prop_is_undefined() {
        let mut ctx = Heap::new();
        let obj = ctx.push_object().unwrap();
        ctx.get_prop_string(obj, "nothing").unwrap();
        assert!(ctx.is_undefined(-1));
    }

    #[test]
    fn test_prototype_inheritance() {
        let mut ctx = Heap::new();
        let proto = ctx.push_object().unwrap();
        ctx.push_string("inherited").unwrap();
        ctx.put_prop_string(proto, "kind").unwrap();

        let obj = ctx.push_object().unwrap();
        ctx.set_prototype(obj, proto).unwrap();
        ctx.get_prop_string(obj, "kind").unwrap();
        assert_eq!(ctx.get_string(-1), Some("inherited"));

        // has sees inherited props; own shadowing overrides
        assert!(ctx.has_prop_string(obj, "kind").unwrap());
        ctx.push_string("own").unwrap();
        ctx.put_prop_string(obj, "kind").unwrap();
        ctx.get_prop_string(obj, "kind").unwrap();
        assert_eq!(ctx.get_string(-1), Some("own"));
    }

    #[test]
    fn test_delete_and_has() {
        let mut ctx = Heap::new();
        let obj = ctx.push_object().unwrap();
        ctx.push_int(1).unwrap();
        ctx.put_prop_string(obj, "x").unwrap();
        assert!(ctx.has_prop_string(obj, "x").unwrap());
        assert!(ctx.del_prop_string(obj, "x").unwrap());
        assert!(!ctx.has_prop_string(obj, "x").unwrap());
        // deleting an absent key reports true
        assert!(ctx.del_prop_string(obj, "x").unwrap());
    }

    #[test]
    fn test_array_basics() {
        let mut ctx = Heap::new();
        let arr = ctx.push_array().unwrap();
        for i in 0..5u32 {
            ctx.push_uint(i * 10).unwrap();
            ctx.put_prop_index(arr, i).unwrap();
        }
        assert_eq!(ctx.get_length(arr).unwrap(), 5);
        ctx.get_prop_index(arr, 3).unwrap();
        assert_eq!(ctx.get_number(-1), 30.0);
        ctx.pop().unwrap();

        // length truncation drops elements
        ctx.push_int(2).unwrap();
        ctx.put_prop_string(arr, "length").unwrap();
        assert_eq!(ctx.get_length(arr).unwrap(), 2);
        ctx.get_prop_index(arr, 3).unwrap();
        assert!(ctx.is_undefined(-1));
    }

    #[test]
    fn test_array_invalid_length_throws() {
        let mut ctx = Heap::new();
        let arr = ctx.push_array().unwrap();
        ctx.push_number(1.5).unwrap();
        assert!(ctx.put_prop_string(arr, "length").is_err());
        assert_eq!(ctx.error_name().as_deref(), Some("RangeError"));
    }

    #[test]
    fn test_define_non_writable() {
        let mut ctx = Heap::new();
        let obj = ctx.push_object().unwrap();
        ctx.def_prop(
            obj,
            "ro",
            PropDesc {
                value: Some(eider_core::TVal::number(7.0)),
                writable: Some(false),
                enumerable: Some(true),
                configurable: Some(false),
                ..Default::default()
            },
        )
        .unwrap();
        ctx.get_prop_string(obj, "ro").unwrap();
        assert_eq!(ctx.get_number(-1), 7.0);
        ctx.pop().unwrap();

        // non-strict write silently no-ops
        ctx.push_int(9).unwrap();
        ctx.put_prop_string(obj, "ro").unwrap();
        ctx.get_prop_string(obj, "ro").unwrap();
        assert_eq!(ctx.get_number(-1), 7.0);
        ctx.pop().unwrap();

        // redefining a non-configurable property fails
        let r = ctx.def_prop(
            obj,
            "ro",
            PropDesc {
                configurable: Some(true),
                ..Default::default()
            },
        );
        assert_eq!(r.unwrap(), false);
    }

    #[test]
    fn test_accessor_property() {
        let mut ctx = Heap::new();
        let obj = ctx.push_object().unwrap();
        let getter_idx = ctx
            .push_native_function(
                |heap| {
                    heap.push_int(42)?;
                    Ok(1)
                },
                0,
            )
            .unwrap();
        let getter = ctx.require_object(getter_idx).unwrap();
        ctx.def_prop(
            obj,
            "computed",
            PropDesc {
                get: Some(Some(getter)),
                enumerable: Some(true),
                configurable: Some(true),
                ..Default::default()
            },
        )
        .unwrap();
        ctx.get_prop_string(obj, "computed").unwrap();
        assert_eq!(ctx.get_number(-1), 42.0);
    }

    #[test]
    fn test_enumerate_scenario() {
        let mut ctx = Heap::new();
        let obj = ctx.push_object().unwrap();
        ctx.push_int(123).unwrap();
        ctx.put_prop_string(obj, "enumerable_prop").unwrap();
        ctx.def_prop(
            obj,
            "nonenumerable_prop",
            PropDesc {
                value: Some(eider_core::TVal::number(234.0)),
                writable: Some(true),
                enumerable: Some(false),
                configurable: Some(true),
                ..Default::default()
            },
        )
        .unwrap();
        // Inherited key on a parent; own-only must skip it.
        let parent = ctx.push_object().unwrap();
        ctx.push_int(1).unwrap();
        ctx.put_prop_string(parent, "parent_prop").unwrap();
        ctx.set_prototype(obj, parent).unwrap();

        ctx.enumerate(obj, ENUM_OWN_PROPERTIES_ONLY).unwrap();
        let e = ctx.get_top_index();
        let mut keys = Vec::new();
        while ctx.next(e, false).unwrap() {
            keys.push(ctx.get_string(-1).unwrap().to_string());
            ctx.pop().unwrap();
        }
        assert_eq!(keys, vec!["enumerable_prop"]);
        ctx.pop().unwrap();

        ctx.enumerate(obj, ENUM_OWN_PROPERTIES_ONLY | ENUM_INCLUDE_NONENUMERABLE)
            .unwrap();
        let e = ctx.get_top_index();
        let mut keys = Vec::new();
        while ctx.next(e, false).unwrap() {
            keys.push(ctx.get_string(-1).unwrap().to_string());
            ctx.pop().unwrap();
        }
        assert_eq!(keys, vec!["enumerable_prop", "nonenumerable_prop"]);
    }

    #[test]
    fn test_enumerate_with_values() {
        let mut ctx = Heap::new();
        let obj = ctx.push_object().unwrap();
        ctx.push_int(10).unwrap();
        ctx.put_prop_string(obj, "a").unwrap();
        ctx.push_int(20).unwrap();
        ctx.put_prop_string(obj, "b").unwrap();

        ctx.enumerate(obj, ENUM_OWN_PROPERTIES_ONLY).unwrap();
        let e = ctx.get_top_index();
        let mut pairs = Vec::new();
        while ctx.next(e, true).unwrap() {
            let v = ctx.get_number(-1);
            let k = ctx.get_string(-2).unwrap().to_string();
            pairs.push((k, v));
            ctx.pop_2().unwrap();
        }
        assert_eq!(pairs, vec![("a".to_string(), 10.0), ("b".to_string(), 20.0)]);
    }

    #[test]
    fn test_equals_and_strict_equals() {
        let mut ctx = Heap::new();
        ctx.push_int(5).unwrap();
        ctx.push_string("5").unwrap();
        assert!(ctx.equals(-2, -1).unwrap());
        assert!(!ctx.strict_equals(-2, -1));
        ctx.pop_2().unwrap();

        let a = ctx.push_object().unwrap();
        ctx.dup(a).unwrap();
        assert!(ctx.strict_equals(-2, -1));
    }

    #[test]
    fn test_strict_put_on_primitive_base() {
        let mut ctx = Heap::new();
        ctx.thr_mut().strict = true;
        ctx.push_int(0).unwrap();
        ctx.push_string("k").unwrap();
        ctx.push_int(1).unwrap();
        let base = ctx.require_tval(-3).unwrap();
        let key = ctx.require_tval(-2).unwrap();
        let val = ctx.require_tval(-1).unwrap();
        let r = props::put_prop(&mut ctx, base, key, val, true);
        assert!(r.is_err());
        assert_eq!(ctx.error_message().as_deref(), Some("non-object base reference"));

        // non-strict: silent no-op
        let r = props::put_prop(&mut ctx, base, key, val, false);
        assert!(r.is_ok());
    }

    #[test]
    fn test_compact_after_deletes() {
        let mut ctx = Heap::new();
        let obj = ctx.push_object().unwrap();
        for i in 0..40 {
            ctx.push_int(i).unwrap();
            ctx.put_prop_string(obj, &format!("k{i}")).unwrap();
        }
        for i in 0..35 {
            ctx.del_prop_string(obj, &format!("k{i}")).unwrap();
        }
        ctx.compact(obj).unwrap();
        for i in 35..40 {
            ctx.get_prop_string(obj, &format!("k{i}")).unwrap();
            assert_eq!(ctx.get_number(-1), i as f64);
            ctx.pop().unwrap();
        }
        let id = ctx.require_object(obj).unwrap();
        assert!(ctx.hobj(id).props.e_size() < 10);
    }

    #[test]
    fn test_finalizer_runs_on_refzero() {
        let mut ctx = Heap::new();
        // Finalizer records a mark on the stash.
        let obj = ctx.push_object().unwrap();
        ctx.push_native_function(
            |heap| {
                heap.push_heap_stash()?;
                heap.push_true()?;
                heap.put_prop_string(-2, "finalized")?;
                heap.pop()?;
                Ok(0)
            },
            1,
        )
        .unwrap();
        ctx.set_finalizer(obj).unwrap();
        ctx.pop().unwrap(); // drop the object; refzero runs the finalizer

        ctx.push_heap_stash().unwrap();
        ctx.get_prop_string(-1, "finalized").unwrap();
        assert!(ctx.get_boolean(-1));
    }
}
