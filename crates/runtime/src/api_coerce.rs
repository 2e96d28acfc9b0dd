//! Value-stack API: in-place coercions
//!
//! Each `to_*` operation coerces the cell at an index following ES5.1 §9
//! and writes the result back into the same slot. Coercions of objects
//! may call script (`valueOf`/`toString`), so no raw references survive
//! across them; everything moves through stack slots.

use eider_core::{TVal, Tag};

use crate::coerce::{self, Hint};
use crate::error::Unwind;
use crate::heap::Heap;

impl Heap {
    /// ToString at `index`; the result replaces the slot. Idempotent on
    /// string cells.
    pub fn to_string(&mut self, index: i32) -> Result<(), Unwind> {
        let abs = self.require_normalize_index(index)?;
        let tv = self.thr().at(abs);
        if tv.tag() == Tag::String {
            return Ok(());
        }
        let id = coerce::to_string_intern(self, tv)?;
        self.set_slot(abs, TVal::string(id));
        Ok(())
    }

    /// Byte-length-preserving ToString; returns the byte length.
    pub fn to_lstring(&mut self, index: i32) -> Result<usize, Unwind> {
        self.to_string(index)?;
        Ok(self.get_lstring(index).map(<[u8]>::len).unwrap_or(0))
    }

    /// ToNumber at `index`; returns the coerced value.
    pub fn to_number(&mut self, index: i32) -> Result<f64, Unwind> {
        let abs = self.require_normalize_index(index)?;
        let tv = self.thr().at(abs);
        let n = coerce::to_number_value(self, tv)?;
        self.set_slot(abs, TVal::number(n));
        Ok(n)
    }

    /// ToInteger at `index` (stored back as a number).
    pub fn to_int(&mut self, index: i32) -> Result<f64, Unwind> {
        let n = self.to_number(index)?;
        let i = coerce::to_integer_f(n);
        let abs = self.require_normalize_index(index)?;
        self.set_slot(abs, TVal::number(i));
        Ok(i)
    }

    /// ToInt32 at `index`.
    pub fn to_int32(&mut self, index: i32) -> Result<i32, Unwind> {
        let n = self.to_number(index)?;
        let i = coerce::to_int32_f(n);
        let abs = self.require_normalize_index(index)?;
        self.set_slot(abs, TVal::number(i as f64));
        Ok(i)
    }

    /// ToUint32 at `index`.
    pub fn to_uint32(&mut self, index: i32) -> Result<u32, Unwind> {
        let n = self.to_number(index)?;
        let u = coerce::to_uint32_f(n);
        let abs = self.require_normalize_index(index)?;
        self.set_slot(abs, TVal::number(u as f64));
        Ok(u)
    }

    /// ToBoolean at `index` (never fails on a valid index).
    pub fn to_boolean(&mut self, index: i32) -> Result<bool, Unwind> {
        let abs = self.require_normalize_index(index)?;
        let tv = self.thr().at(abs);
        let b = coerce::to_boolean_value(self, tv);
        self.set_slot(abs, TVal::boolean(b));
        Ok(b)
    }

    /// ToPrimitive at `index` with a hint.
    pub fn to_primitive(&mut self, index: i32, hint: Hint) -> Result<(), Unwind> {
        let abs = self.require_normalize_index(index)?;
        let tv = self.thr().at(abs);
        if tv.tag() != Tag::Object {
            return Ok(());
        }
        coerce::to_primitive(self, tv, hint)?;
        let prim = self.top_value();
        self.set_slot(abs, prim);
        self.pop_unsafe();
        Ok(())
    }

    /// ToObject at `index` (boxes primitives; undefined/null throw).
    pub fn to_object(&mut self, index: i32) -> Result<(), Unwind> {
        let abs = self.require_normalize_index(index)?;
        let tv = self.thr().at(abs);
        let obj = coerce::to_object(self, tv)?;
        self.set_slot(abs, TVal::object(obj));
        Ok(())
    }

    /// Buffer coercion at `index`: strings copy their bytes, numbers
    /// stringify then copy, buffers re-copy into a fixed buffer, objects
    /// go through `toString`.
    pub fn to_buffer(&mut self, index: i32) -> Result<(), Unwind> {
        let abs = self.require_normalize_index(index)?;
        let tv = self.thr().at(abs);
        let bytes: Vec<u8> = match tv.tag() {
            Tag::Buffer => {
                let id = tv.as_buffer().expect("tag/buffer mismatch");
                self.hbuf(id).as_slice().to_vec()
            }
            Tag::String => {
                let id = tv.as_string().expect("tag/string mismatch");
                self.hstr(id).as_bytes().to_vec()
            }
            _ => {
                let id = coerce::to_string_intern(self, tv)?;
                self.incref_str(id);
                let bytes = self.hstr(id).as_bytes().to_vec();
                self.decref_str(id);
                bytes
            }
        };
        let b = self.alloc_buffer(bytes.len(), false);
        self.hbuf_mut(b).as_mut_slice().copy_from_slice(&bytes);
        self.set_slot(abs, TVal::buffer(b));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_string_idempotent() {
        let mut ctx = Heap::new();
        ctx.push_int(123).unwrap();
        ctx.to_string(-1).unwrap();
        assert_eq!(ctx.get_string(-1), Some("123"));
        let bits = ctx.get_tval(-1).unwrap().raw_bits();
        ctx.to_string(-1).unwrap();
        assert_eq!(ctx.get_tval(-1).unwrap().raw_bits(), bits);
    }

    #[test]
    fn test_to_string_kinds() {
        let mut ctx = Heap::new();
        ctx.push_undefined().unwrap();
        ctx.to_string(-1).unwrap();
        assert_eq!(ctx.get_string(-1), Some("undefined"));
        ctx.pop().unwrap();

        ctx.push_null().unwrap();
        ctx.to_string(-1).unwrap();
        assert_eq!(ctx.get_string(-1), Some("null"));
        ctx.pop().unwrap();

        ctx.push_nan().unwrap();
        ctx.to_string(-1).unwrap();
        assert_eq!(ctx.get_string(-1), Some("NaN"));
        ctx.pop().unwrap();

        ctx.push_object().unwrap();
        ctx.to_string(-1).unwrap();
        assert_eq!(ctx.get_string(-1), Some("[object Object]"));
    }

    #[test]
    fn test_to_number_then_to_string_roundtrip() {
        let mut ctx = Heap::new();
        ctx.push_string("123.25").unwrap();
        let n = ctx.to_number(-1).unwrap();
        assert_eq!(n, 123.25);
        ctx.to_string(-1).unwrap();
        assert_eq!(ctx.get_string(-1), Some("123.25"));
    }

    #[test]
    fn test_to_number_lenient_inputs() {
        let mut ctx = Heap::new();
        ctx.push_true().unwrap();
        assert_eq!(ctx.to_number(-1).unwrap(), 1.0);
        ctx.pop().unwrap();
        ctx.push_string("").unwrap();
        assert_eq!(ctx.to_number(-1).unwrap(), 0.0);
        ctx.pop().unwrap();
        ctx.push_string("garbage").unwrap();
        assert!(ctx.to_number(-1).unwrap().is_nan());
    }

    #[test]
    fn test_to_int_variants() {
        let mut ctx = Heap::new();
        ctx.push_number(-1.0).unwrap();
        assert_eq!(ctx.to_uint32(-1).unwrap(), 4294967295);
        ctx.pop().unwrap();
        ctx.push_number(3.7).unwrap();
        assert_eq!(ctx.to_int(-1).unwrap(), 3.0);
    }

    #[test]
    fn test_to_buffer_fixed_patterns() {
        let mut ctx = Heap::new();
        ctx.push_undefined().unwrap();
        ctx.to_buffer(-1).unwrap();
        assert_eq!(ctx.get_buffer(-1).unwrap(), b"undefined");
        ctx.pop().unwrap();

        ctx.push_int(123).unwrap();
        ctx.to_buffer(-1).unwrap();
        assert_eq!(ctx.get_buffer(-1).unwrap(), b"123");
        ctx.pop().unwrap();

        ctx.push_nan().unwrap();
        ctx.to_buffer(-1).unwrap();
        assert_eq!(ctx.get_buffer(-1).unwrap(), b"NaN");
        ctx.pop().unwrap();

        // Dynamic buffer coerces to a fixed buffer with identical bytes.
        ctx.push_dynamic_buffer(16).unwrap();
        for (i, b) in ctx.get_buffer_mut(-1).unwrap().iter_mut().enumerate() {
            *b = i as u8;
        }
        ctx.to_buffer(-1).unwrap();
        let id = ctx.get_tval(-1).unwrap().as_buffer().unwrap();
        assert!(!ctx.hbuf(id).is_dynamic());
        let expect: Vec<u8> = (0..16).collect();
        assert_eq!(ctx.get_buffer(-1).unwrap(), expect.as_slice());
    }

    #[test]
    fn test_to_boolean() {
        let mut ctx = Heap::new();
        ctx.push_string("").unwrap();
        assert!(!ctx.to_boolean(-1).unwrap());
        ctx.pop().unwrap();
        ctx.push_object().unwrap();
        assert!(ctx.to_boolean(-1).unwrap());
    }

    #[test]
    fn test_to_object_and_back() {
        let mut ctx = Heap::new();
        ctx.push_string("abc").unwrap();
        ctx.to_object(-1).unwrap();
        assert!(ctx.is_object(-1));
        ctx.to_string(-1).unwrap();
        // Boxed string surfaces no toString hook; class form results.
        assert_eq!(ctx.get_string(-1), Some("[object String]"));
    }

    #[test]
    fn test_to_object_undefined_throws() {
        let mut ctx = Heap::new();
        ctx.push_undefined().unwrap();
        assert!(ctx.to_object(-1).is_err());
    }

    #[test]
    fn test_to_lstring_preserves_nul() {
        let mut ctx = Heap::new();
        ctx.push_lstring(b"a\0b").unwrap();
        let len = ctx.to_lstring(-1).unwrap();
        assert_eq!(len, 3);
        assert_eq!(ctx.get_lstring(-1).unwrap(), b"a\0b");
    }
}
