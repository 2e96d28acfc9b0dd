//! Value-stack API: indices, pushers, poppers, repositioning
//!
//! Host-facing operations on the current thread's value stack. Indices
//! are frame-relative: non-negative from the bottom, negative from the
//! top (`-1` is the top). Lenient accessors return a default on a bad
//! index or type; `require_*` variants throw.

use eider_core::{ObjId, TVal, Tag};

use crate::error::{Unwind, api_error, range_error};
use crate::heap::Heap;
use crate::hobject::{NativeFn, OBJF_ARRAY_PART, OBJF_EXTENSIBLE, OBJF_SPECIAL_ARRAY, OBJF_THREAD, ObjClass, ObjExtra};
use crate::hthread::{ThreadData, ThreadState};
use crate::props;

/// Sentinel for "no such index" in `get_top_index`-style queries.
pub const INVALID_INDEX: i32 = i32::MIN;

impl Heap {
    // ------------------------------------------------------------------
    // Index handling
    // ------------------------------------------------------------------

    /// Normalize an API index into an absolute slot; `None` when out of
    /// range.
    pub fn normalize_index(&self, index: i32) -> Option<usize> {
        self.thr().normalize_index(index)
    }

    /// Normalizing variant that throws on a bad index.
    pub fn require_normalize_index(&mut self, index: i32) -> Result<usize, Unwind> {
        match self.thr().normalize_index(index) {
            Some(abs) => Ok(abs),
            None => Err(api_error(self, "invalid index")),
        }
    }

    /// Number of cells in the current frame.
    pub fn get_top(&self) -> usize {
        self.thr().frame_len()
    }

    /// Frame-relative index of the top cell, or [`INVALID_INDEX`] when
    /// the frame is empty.
    pub fn get_top_index(&self) -> i32 {
        let len = self.get_top();
        if len == 0 {
            INVALID_INDEX
        } else {
            len as i32 - 1
        }
    }

    /// Throwing variant of [`Self::get_top_index`].
    pub fn require_top_index(&mut self) -> Result<i32, Unwind> {
        let len = self.get_top();
        if len == 0 {
            Err(api_error(self, "invalid index"))
        } else {
            Ok(len as i32 - 1)
        }
    }

    // ------------------------------------------------------------------
    // Capacity
    // ------------------------------------------------------------------

    /// Configure the current thread's value-stack slot limit.
    pub fn set_valstack_limit(&mut self, limit: usize) {
        self.thr_mut().valstack_limit = limit;
    }

    /// Ensure room for `extra` more cells; false on failure.
    pub fn check_stack(&mut self, extra: usize) -> bool {
        self.valstack_reserve(extra)
    }

    /// Throwing variant of [`Self::check_stack`].
    pub fn require_stack(&mut self, extra: usize) -> Result<(), Unwind> {
        if self.valstack_reserve(extra) {
            Ok(())
        } else {
            Err(range_error(self, "valstack limit reached"))
        }
    }

    /// Ensure the frame can hold at least `top` cells; false on failure.
    /// The current top is unchanged.
    pub fn check_stack_top(&mut self, top: usize) -> bool {
        let cur = self.get_top();
        if top <= cur {
            return true;
        }
        self.valstack_reserve(top - cur)
    }

    /// Throwing variant of [`Self::check_stack_top`].
    pub fn require_stack_top(&mut self, top: usize) -> Result<(), Unwind> {
        if self.check_stack_top(top) {
            Ok(())
        } else {
            Err(range_error(self, "valstack limit reached"))
        }
    }

    // ------------------------------------------------------------------
    // Pushers
    // ------------------------------------------------------------------

    pub fn push_undefined(&mut self) -> Result<(), Unwind> {
        self.push(TVal::undefined())
    }

    pub fn push_null(&mut self) -> Result<(), Unwind> {
        self.push(TVal::null())
    }

    pub fn push_true(&mut self) -> Result<(), Unwind> {
        self.push(TVal::boolean(true))
    }

    pub fn push_false(&mut self) -> Result<(), Unwind> {
        self.push(TVal::boolean(false))
    }

    pub fn push_boolean(&mut self, v: bool) -> Result<(), Unwind> {
        self.push(TVal::boolean(v))
    }

    pub fn push_int(&mut self, v: i32) -> Result<(), Unwind> {
        self.push(TVal::number(v as f64))
    }

    pub fn push_uint(&mut self, v: u32) -> Result<(), Unwind> {
        self.push(TVal::number(v as f64))
    }

    pub fn push_number(&mut self, v: f64) -> Result<(), Unwind> {
        self.push(TVal::number(v))
    }

    pub fn push_nan(&mut self) -> Result<(), Unwind> {
        self.push(TVal::number(f64::NAN))
    }

    pub fn push_string(&mut self, s: &str) -> Result<(), Unwind> {
        self.push_lstring(s.as_bytes())
    }

    /// Byte-exact string push; NUL bytes survive.
    pub fn push_lstring(&mut self, bytes: &[u8]) -> Result<(), Unwind> {
        let id = crate::strtab::intern(self, bytes);
        self.push(TVal::string(id))
    }

    /// `format_args!`-style formatted push.
    pub fn push_sprintf(&mut self, args: std::fmt::Arguments<'_>) -> Result<(), Unwind> {
        let s = std::fmt::format(args);
        self.push_lstring(s.as_bytes())
    }

    pub fn push_pointer(&mut self, p: usize) -> Result<(), Unwind> {
        self.push(TVal::pointer(p))
    }

    /// Push a fresh plain object; returns its frame index.
    pub fn push_object(&mut self) -> Result<i32, Unwind> {
        let obj = self.alloc_object(OBJF_EXTENSIBLE, ObjClass::Object);
        self.push(TVal::object(obj))?;
        Ok(self.get_top_index())
    }

    /// Push a fresh array (array part active, `length` maintained).
    pub fn push_array(&mut self) -> Result<i32, Unwind> {
        let obj = self.alloc_object(
            OBJF_EXTENSIBLE | OBJF_ARRAY_PART | OBJF_SPECIAL_ARRAY,
            ObjClass::Array,
        );
        self.push(TVal::object(obj))?;
        let key = self.bstr(crate::heap::Bstr::Length);
        props::put_own_flags(
            self,
            obj,
            key,
            TVal::number(0.0),
            crate::proptable::PROPF_WRITABLE,
        );
        Ok(self.get_top_index())
    }

    /// Push a fresh native function object.
    pub fn push_native_function(&mut self, func: NativeFn, nargs: i16) -> Result<i32, Unwind> {
        let obj = crate::call::alloc_native_function(self, func, nargs);
        self.push(TVal::object(obj))?;
        Ok(self.get_top_index())
    }

    /// Push a fixed-size buffer (zeroed).
    pub fn push_fixed_buffer(&mut self, size: usize) -> Result<i32, Unwind> {
        let b = self.alloc_buffer(size, false);
        self.push(TVal::buffer(b))?;
        Ok(self.get_top_index())
    }

    /// Push a dynamic (resizable) buffer (zeroed).
    pub fn push_dynamic_buffer(&mut self, size: usize) -> Result<i32, Unwind> {
        let b = self.alloc_buffer(size, true);
        self.push(TVal::buffer(b))?;
        Ok(self.get_top_index())
    }

    /// Resize a dynamic buffer in place, zero-filling any grown region.
    /// The reallocation goes through the indirect GC-retry path, which
    /// re-reads the block address after every collection cycle.
    pub fn resize_buffer(&mut self, index: i32, new_size: usize) -> Result<(), Unwind> {
        let tv = self.require_tval(index)?;
        let Some(id) = tv.as_buffer() else {
            return Err(crate::error::type_error(self, "buffer required"));
        };
        if !self.hbuf(id).is_dynamic() {
            return Err(crate::error::type_error(self, "dynamic buffer required"));
        }
        let old_size = self.hbuf(id).size();
        fn read_ptr(heap: &Heap, arg: u64) -> *mut u8 {
            heap.hbuf(eider_core::BufId::new(arg as u32)).data_ptr()
        }
        let p = crate::alloc::realloc_indirect(self, read_ptr, id.raw() as u64, new_size);
        self.hbuf_mut(id).set_data(p, new_size);
        if new_size > old_size {
            // Safety: p holds new_size bytes; the grown tail is ours.
            unsafe { std::ptr::write_bytes(p.add(old_size), 0, new_size - old_size) };
        }
        Ok(())
    }

    /// Push the current activation's effective `this` binding.
    pub fn push_this(&mut self) -> Result<(), Unwind> {
        let thr = self.thr();
        let tv = if thr.valstack_bottom == 0 {
            TVal::undefined()
        } else {
            thr.valstack[thr.valstack_bottom - 1]
        };
        self.push(tv)
    }

    /// Push the currently running thread object.
    pub fn push_current_thread(&mut self) -> Result<(), Unwind> {
        let t = self.curr();
        self.push(TVal::object(t))
    }

    /// Push the global object.
    pub fn push_global_object(&mut self) -> Result<(), Unwind> {
        let g = self.thr().builtins[crate::hthread::TB_GLOBAL];
        self.push(TVal::object(g))
    }

    /// Push the heap stash (host-only object, never script-visible).
    pub fn push_heap_stash(&mut self) -> Result<(), Unwind> {
        let s = self.stash.expect("heap stash missing");
        self.push(TVal::object(s))
    }

    /// Push a fresh inactive thread sharing this heap and the current
    /// thread's builtins; returns its frame index.
    pub fn push_thread(&mut self) -> Result<i32, Unwind> {
        let builtins = self.thr().builtins.clone();
        let mut td = ThreadData::new(false);
        td.state = ThreadState::Inactive;
        td.builtins = builtins.clone();
        let obj = self.alloc_object(OBJF_THREAD | OBJF_EXTENSIBLE, ObjClass::Thread);
        self.hobj_mut(obj).extra = ObjExtra::Thread(Box::new(td));
        for b in builtins {
            self.incref_obj(b);
        }
        self.push(TVal::object(obj))?;
        Ok(self.get_top_index())
    }

    // ------------------------------------------------------------------
    // Poppers
    // ------------------------------------------------------------------

    pub fn pop(&mut self) -> Result<(), Unwind> {
        self.pop_n(1)
    }

    pub fn pop_2(&mut self) -> Result<(), Unwind> {
        self.pop_n(2)
    }

    pub fn pop_3(&mut self) -> Result<(), Unwind> {
        self.pop_n(3)
    }

    /// Pop `count` cells, dropping references in order.
    pub fn pop_n(&mut self, count: usize) -> Result<(), Unwind> {
        if count > self.get_top() {
            return Err(range_error(self, "attempt to pop too many entries"));
        }
        for _ in 0..count {
            self.pop_unsafe();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Repositioning
    // ------------------------------------------------------------------

    /// Push a copy of the cell at `index`.
    pub fn dup(&mut self, index: i32) -> Result<(), Unwind> {
        let abs = self.require_normalize_index(index)?;
        let tv = self.thr().valstack[abs];
        self.push(tv)
    }

    /// Move the top cell into position `index`, shifting the cells above
    /// it up by one.
    pub fn insert(&mut self, index: i32) -> Result<(), Unwind> {
        let abs = self.require_normalize_index(index)?;
        let top = self.abs_top();
        let tv = self.thr().valstack[top - 1];
        {
            let thr = self.thr_mut();
            thr.valstack.copy_within(abs..top - 1, abs + 1);
            thr.valstack[abs] = tv;
        }
        Ok(())
    }

    /// Pop the top cell into position `index`, replacing what was there.
    pub fn replace(&mut self, index: i32) -> Result<(), Unwind> {
        let abs = self.require_normalize_index(index)?;
        let top = self.abs_top();
        if abs == top - 1 {
            return Ok(());
        }
        let tv = self.thr().valstack[top - 1];
        // The top's reference transfers to the target slot.
        let old = self.thr().valstack[abs];
        {
            let thr = self.thr_mut();
            thr.valstack[abs] = tv;
            thr.valstack[top - 1] = TVal::undefined();
            thr.valstack_top = top - 1;
        }
        self.decref(old);
        Ok(())
    }

    /// Remove the cell at `index`, shifting the cells above it down.
    pub fn remove(&mut self, index: i32) -> Result<(), Unwind> {
        let abs = self.require_normalize_index(index)?;
        let top = self.abs_top();
        let old = self.thr().valstack[abs];
        {
            let thr = self.thr_mut();
            thr.valstack.copy_within(abs + 1..top, abs);
            thr.valstack[top - 1] = TVal::undefined();
            thr.valstack_top = top - 1;
        }
        self.decref(old);
        Ok(())
    }

    /// Set the frame size: truncate down or pad with undefined up.
    pub fn set_top(&mut self, top: usize) -> Result<(), Unwind> {
        let cur = self.get_top();
        if top <= cur {
            let bottom = self.thr().valstack_bottom;
            self.truncate_to(bottom + top);
            return Ok(());
        }
        self.require_stack(top - cur)?;
        for _ in 0..top - cur {
            self.push(TVal::undefined())?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// Kind of the cell at `index`; `None` for a bad index.
    pub fn get_type(&self, index: i32) -> Option<Tag> {
        self.normalize_index(index).map(|abs| self.thr().at(abs).tag())
    }

    pub(crate) fn get_tval(&self, index: i32) -> Option<TVal> {
        self.normalize_index(index).map(|abs| self.thr().at(abs))
    }

    pub(crate) fn require_tval(&mut self, index: i32) -> Result<TVal, Unwind> {
        let abs = self.require_normalize_index(index)?;
        Ok(self.thr().at(abs))
    }

    pub fn is_undefined(&self, index: i32) -> bool {
        self.get_type(index) == Some(Tag::Undefined)
    }

    pub fn is_null(&self, index: i32) -> bool {
        self.get_type(index) == Some(Tag::Null)
    }

    pub fn is_null_or_undefined(&self, index: i32) -> bool {
        matches!(self.get_type(index), Some(Tag::Null) | Some(Tag::Undefined))
    }

    pub fn is_boolean(&self, index: i32) -> bool {
        self.get_type(index) == Some(Tag::Boolean)
    }

    pub fn is_number(&self, index: i32) -> bool {
        self.get_type(index) == Some(Tag::Number)
    }

    pub fn is_nan(&self, index: i32) -> bool {
        self.get_number(index).is_nan()
    }

    pub fn is_string(&self, index: i32) -> bool {
        self.get_type(index) == Some(Tag::String)
    }

    pub fn is_object(&self, index: i32) -> bool {
        self.get_type(index) == Some(Tag::Object)
    }

    pub fn is_buffer(&self, index: i32) -> bool {
        self.get_type(index) == Some(Tag::Buffer)
    }

    pub fn is_pointer(&self, index: i32) -> bool {
        self.get_type(index) == Some(Tag::Pointer)
    }

    pub fn is_callable(&self, index: i32) -> bool {
        match self.get_tval(index).and_then(|tv| tv.as_object()) {
            Some(id) => self.hobj(id).is_callable(),
            None => false,
        }
    }

    pub fn is_array(&self, index: i32) -> bool {
        match self.get_tval(index).and_then(|tv| tv.as_object()) {
            Some(id) => self.hobj(id).class == ObjClass::Array,
            None => false,
        }
    }

    pub fn is_thread(&self, index: i32) -> bool {
        match self.get_tval(index).and_then(|tv| tv.as_object()) {
            Some(id) => self.hobj(id).is_thread(),
            None => false,
        }
    }

    /// Lenient boolean read (false on mismatch).
    pub fn get_boolean(&self, index: i32) -> bool {
        self.get_tval(index).and_then(|tv| tv.as_boolean()).unwrap_or(false)
    }

    /// Lenient number read (NaN on mismatch).
    pub fn get_number(&self, index: i32) -> f64 {
        self.get_tval(index).and_then(|tv| tv.as_number()).unwrap_or(f64::NAN)
    }

    /// Lenient integer read (0 on mismatch), ToInteger-clamped.
    pub fn get_int(&self, index: i32) -> i32 {
        match self.get_tval(index).and_then(|tv| tv.as_number()) {
            Some(n) => crate::coerce::to_int32_f(crate::coerce::to_integer_f(n)),
            None => 0,
        }
    }

    pub fn get_uint(&self, index: i32) -> u32 {
        match self.get_tval(index).and_then(|tv| tv.as_number()) {
            Some(n) => crate::coerce::to_uint32_f(n),
            None => 0,
        }
    }

    /// Lenient UTF-8 string read; `None` on type mismatch or non-UTF-8
    /// content.
    pub fn get_string(&self, index: i32) -> Option<&str> {
        let id = self.get_tval(index)?.as_string()?;
        self.hstr(id).as_str()
    }

    /// Lenient byte string read.
    pub fn get_lstring(&self, index: i32) -> Option<&[u8]> {
        let id = self.get_tval(index)?.as_string()?;
        Some(self.hstr(id).as_bytes())
    }

    /// Lenient buffer read.
    pub fn get_buffer(&self, index: i32) -> Option<&[u8]> {
        let id = self.get_tval(index)?.as_buffer()?;
        Some(self.hbuf(id).as_slice())
    }

    /// Mutable buffer view.
    pub fn get_buffer_mut(&mut self, index: i32) -> Option<&mut [u8]> {
        let id = self.get_tval(index)?.as_buffer()?;
        Some(self.hbuf_mut(id).as_mut_slice())
    }

    pub fn get_pointer(&self, index: i32) -> Option<usize> {
        self.get_tval(index)?.as_pointer()
    }

    /// `length` of the cell: codepoints of a string, bytes of a buffer,
    /// the `length` property of an object, 0 otherwise.
    pub fn get_length(&mut self, index: i32) -> Result<usize, Unwind> {
        let Some(tv) = self.get_tval(index) else {
            return Ok(0);
        };
        match tv.tag() {
            Tag::String => Ok(self.hstr(tv.as_string().expect("tag/string mismatch")).clen as usize),
            Tag::Buffer => Ok(self.hbuf(tv.as_buffer().expect("tag/buffer mismatch")).size()),
            Tag::Object => {
                let key = self.bstr(crate::heap::Bstr::Length);
                props::get_prop(self, tv, TVal::string(key))?;
                let n = self.top_value().as_number().unwrap_or(0.0);
                self.pop_unsafe();
                Ok(crate::coerce::to_uint32_f(n) as usize)
            }
            _ => Ok(0),
        }
    }

    pub fn require_boolean(&mut self, index: i32) -> Result<bool, Unwind> {
        match self.require_tval(index)?.as_boolean() {
            Some(b) => Ok(b),
            None => Err(crate::error::type_error(self, "boolean required")),
        }
    }

    pub fn require_number(&mut self, index: i32) -> Result<f64, Unwind> {
        match self.require_tval(index)?.as_number() {
            Some(n) => Ok(n),
            None => Err(crate::error::type_error(self, "number required")),
        }
    }

    pub fn require_int(&mut self, index: i32) -> Result<i32, Unwind> {
        let n = self.require_number(index)?;
        Ok(crate::coerce::to_int32_f(n))
    }

    pub fn require_string(&mut self, index: i32) -> Result<String, Unwind> {
        let tv = self.require_tval(index)?;
        match tv.as_string() {
            Some(id) => Ok(String::from_utf8_lossy(self.hstr(id).as_bytes()).into_owned()),
            None => Err(crate::error::type_error(self, "string required")),
        }
    }

    pub fn require_object(&mut self, index: i32) -> Result<ObjId, Unwind> {
        let tv = self.require_tval(index)?;
        match tv.as_object() {
            Some(id) => Ok(id),
            None => Err(crate::error::type_error(self, "object required")),
        }
    }

    pub fn require_callable(&mut self, index: i32) -> Result<ObjId, Unwind> {
        let id = self.require_object(index)?;
        if self.hobj(id).is_callable() {
            Ok(id)
        } else {
            Err(crate::error::type_error(self, "callable required"))
        }
    }
}
