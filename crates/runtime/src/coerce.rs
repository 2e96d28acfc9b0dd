//! ES5.1 type conversions, equality, instanceof
//!
//! The §9 conversion operators over tagged cells. Conversions that can
//! call script (ToPrimitive on objects with callable `valueOf`/`toString`)
//! keep intermediate values on the value stack so collections see them.
//! Objects without a callable hook fall back to the `[object Class]`
//! form, so string coercion is total even with no built-in library
//! installed.

use eider_core::{ObjId, StrId, TVal, Tag};

use crate::error::{Unwind, type_error};
use crate::heap::{Bstr, Heap};
use crate::hobject::{OBJF_EXTENSIBLE, OBJF_SPECIAL_STRINGOBJ, ObjClass};
use crate::numconv;
use crate::props;

/// ToPrimitive hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hint {
    Default,
    String,
    Number,
}

// ----------------------------------------------------------------------
// Pure numeric helpers (§9.4-9.6)
// ----------------------------------------------------------------------

/// ToInteger of a double.
pub fn to_integer_f(x: f64) -> f64 {
    if x.is_nan() {
        0.0
    } else if x == 0.0 || x.is_infinite() {
        x
    } else {
        x.trunc()
    }
}

/// ToInt32 of a double (modulo 2^32, signed window).
pub fn to_int32_f(x: f64) -> i32 {
    if !x.is_finite() || x == 0.0 {
        return 0;
    }
    let m = x.trunc() % 4294967296.0;
    let m = if m < 0.0 { m + 4294967296.0 } else { m };
    if m >= 2147483648.0 {
        (m - 4294967296.0) as i32
    } else {
        m as i32
    }
}

/// ToUint32 of a double.
pub fn to_uint32_f(x: f64) -> u32 {
    if !x.is_finite() || x == 0.0 {
        return 0;
    }
    let m = x.trunc() % 4294967296.0;
    let m = if m < 0.0 { m + 4294967296.0 } else { m };
    m as u32
}

/// ToBoolean (§9.2); pure, total.
pub fn to_boolean_value(heap: &Heap, tv: TVal) -> bool {
    match tv.tag() {
        Tag::Undefined | Tag::Null => false,
        Tag::Boolean => tv.as_boolean().expect("tag/boolean mismatch"),
        Tag::Number => {
            let n = tv.as_number().expect("tag/number mismatch");
            n != 0.0 && !n.is_nan()
        }
        Tag::String => heap.hstr(tv.as_string().expect("tag/string mismatch")).blen > 0,
        Tag::Object => true,
        // Buffers and pointers are truthy when non-empty / non-null.
        Tag::Buffer => heap.hbuf(tv.as_buffer().expect("tag/buffer mismatch")).size() > 0,
        Tag::Pointer => tv.as_pointer().expect("tag/pointer mismatch") != 0,
    }
}

// ----------------------------------------------------------------------
// ToPrimitive / DefaultValue (§8.12.8, §9.1)
// ----------------------------------------------------------------------

/// ToPrimitive; the result is pushed on the value stack (rooted for any
/// follow-up allocation).
pub(crate) fn to_primitive(heap: &mut Heap, tv: TVal, hint: Hint) -> Result<(), Unwind> {
    if tv.tag() != Tag::Object {
        return heap.push(tv);
    }
    let obj = tv.as_object().expect("tag/object mismatch");

    let string_first = match hint {
        Hint::String => true,
        // Default hint behaves as Number for everything but Date, which
        // is outside the runtime core.
        Hint::Number | Hint::Default => false,
    };
    let first = if string_first {
        Bstr::ToString
    } else {
        Bstr::ValueOf
    };
    let second = if string_first {
        Bstr::ValueOf
    } else {
        Bstr::ToString
    };

    for method in [first, second] {
        let key = heap.bstr(method);
        if try_method_call(heap, obj, tv, key)? {
            if heap.top_value().tag() != Tag::Object {
                // Result stays on the stack.
                return Ok(());
            }
            // Object result does not qualify; discard and try the next
            // hook.
            heap.pop_unsafe();
        }
    }

    // No usable hook: synthesize the class-form string.
    let s = format!("[object {}]", heap.hobj(obj).class.name());
    let id = crate::strtab::intern(heap, s.as_bytes());
    heap.push(TVal::string(id))
}

/// Call `obj[key]()` when it resolves to a callable; true means the call
/// happened and its result is on the stack top.
fn try_method_call(
    heap: &mut Heap,
    obj: ObjId,
    this_tv: TVal,
    key: StrId,
) -> Result<bool, Unwind> {
    props::get_prop(heap, TVal::object(obj), TVal::string(key))?;
    let func = heap.top_value();
    let callable = func
        .as_object()
        .map(|f| heap.hobj(f).is_callable())
        .unwrap_or(false);
    if !callable {
        heap.pop_unsafe();
        return Ok(false);
    }
    // Stack: [... func]; add this and call.
    heap.push(this_tv)?;
    crate::call::ecma_call(heap, 0, 0)?;
    Ok(true)
}

// ----------------------------------------------------------------------
// ToString / ToNumber
// ----------------------------------------------------------------------

/// ToString to an interned string id.
pub(crate) fn to_string_intern(heap: &mut Heap, tv: TVal) -> Result<StrId, Unwind> {
    match tv.tag() {
        Tag::Undefined => Ok(heap.bstr(Bstr::Undefined)),
        Tag::Null => Ok(heap.bstr(Bstr::Null)),
        Tag::Boolean => Ok(if tv.as_boolean().expect("tag/boolean mismatch") {
            heap.bstr(Bstr::True)
        } else {
            heap.bstr(Bstr::False)
        }),
        Tag::Number => {
            let s = numconv::stringify(tv.as_number().expect("tag/number mismatch"), 10, 0, 0);
            Ok(crate::strtab::intern(heap, s.as_bytes()))
        }
        Tag::String => Ok(tv.as_string().expect("tag/string mismatch")),
        Tag::Buffer => {
            let bytes = heap
                .hbuf(tv.as_buffer().expect("tag/buffer mismatch"))
                .as_slice()
                .to_vec();
            Ok(crate::strtab::intern(heap, &bytes))
        }
        Tag::Pointer => {
            let s = format!("pointer:0x{:x}", tv.as_pointer().expect("tag/pointer mismatch"));
            Ok(crate::strtab::intern(heap, s.as_bytes()))
        }
        Tag::Object => {
            to_primitive(heap, tv, Hint::String)?;
            let prim = heap.top_value();
            debug_assert!(prim.tag() != Tag::Object);
            let id = to_string_intern(heap, prim)?;
            // Hand the caller a borrowed ref that survives popping the
            // primitive (the caller roots it before the next collection
            // point).
            heap.incref_str(id);
            heap.pop_unsafe();
            heap.hstr_mut(id).hdr.refcount -= 1;
            Ok(id)
        }
    }
}

/// ToNumber to a double.
pub(crate) fn to_number_value(heap: &mut Heap, tv: TVal) -> Result<f64, Unwind> {
    match tv.tag() {
        Tag::Undefined => Ok(f64::NAN),
        Tag::Null => Ok(0.0),
        Tag::Boolean => Ok(if tv.as_boolean().expect("tag/boolean mismatch") {
            1.0
        } else {
            0.0
        }),
        Tag::Number => Ok(tv.as_number().expect("tag/number mismatch")),
        Tag::String => {
            let bytes = heap
                .hstr(tv.as_string().expect("tag/string mismatch"))
                .as_bytes()
                .to_vec();
            Ok(numconv::parse(&bytes, 10, numconv::S2N_TONUMBER_FLAGS).unwrap_or(f64::NAN))
        }
        Tag::Buffer => {
            let bytes = heap
                .hbuf(tv.as_buffer().expect("tag/buffer mismatch"))
                .as_slice()
                .to_vec();
            Ok(numconv::parse(&bytes, 10, numconv::S2N_TONUMBER_FLAGS).unwrap_or(f64::NAN))
        }
        Tag::Pointer => Ok(f64::NAN),
        Tag::Object => {
            to_primitive(heap, tv, Hint::Number)?;
            let prim = heap.top_value();
            let n = to_number_value(heap, prim)?;
            heap.pop_unsafe();
            Ok(n)
        }
    }
}

// ----------------------------------------------------------------------
// ToObject (§9.9)
// ----------------------------------------------------------------------

/// Box a value into an object; undefined/null throw.
pub(crate) fn to_object(heap: &mut Heap, tv: TVal) -> Result<ObjId, Unwind> {
    match tv.tag() {
        Tag::Object => Ok(tv.as_object().expect("tag/object mismatch")),
        Tag::Undefined | Tag::Null => {
            Err(type_error(heap, "cannot convert undefined or null to object"))
        }
        Tag::Boolean => Ok(box_primitive(heap, ObjClass::Boolean, tv, 0)),
        Tag::Number => Ok(box_primitive(heap, ObjClass::Number, tv, 0)),
        Tag::String => Ok(box_primitive(
            heap,
            ObjClass::String,
            tv,
            OBJF_SPECIAL_STRINGOBJ,
        )),
        Tag::Buffer => Ok(box_primitive(heap, ObjClass::Buffer, tv, 0)),
        Tag::Pointer => Ok(box_primitive(heap, ObjClass::Pointer, tv, 0)),
    }
}

fn box_primitive(heap: &mut Heap, class: ObjClass, tv: TVal, extra_flags: u32) -> ObjId {
    let obj = heap.alloc_object(OBJF_EXTENSIBLE | extra_flags, class);
    heap.temp_root(TVal::object(obj));
    let key = heap.bstr(Bstr::IntValue);
    props::put_own_internal(heap, obj, key, tv);
    heap.untemp_root();
    obj
}

// ----------------------------------------------------------------------
// Equality and identity (§11.9.3, §11.9.6, SameValue)
// ----------------------------------------------------------------------

/// Strict equality (`===`). Strings compare by id (interned); buffers,
/// objects and pointers by identity.
pub fn strict_equals(_heap: &Heap, a: TVal, b: TVal) -> bool {
    if a.tag() != b.tag() {
        return false;
    }
    match a.tag() {
        Tag::Number => {
            let x = a.as_number().expect("tag/number mismatch");
            let y = b.as_number().expect("tag/number mismatch");
            x == y
        }
        _ => a == b,
    }
}

/// SameValue: NaN equals NaN, +0 and -0 differ.
pub fn same_value(_heap: &Heap, a: TVal, b: TVal) -> bool {
    if a.tag() != b.tag() {
        return false;
    }
    match a.tag() {
        Tag::Number => {
            let x = a.as_number().expect("tag/number mismatch");
            let y = b.as_number().expect("tag/number mismatch");
            x.to_bits() == y.to_bits()
        }
        _ => a == b,
    }
}

/// Loose equality (`==`) with the §11.9.3 coercion ladder; object
/// operands go through ToPrimitive and may call script.
pub(crate) fn loose_equals(heap: &mut Heap, a: TVal, b: TVal) -> Result<bool, Unwind> {
    if a.tag() == b.tag() {
        return Ok(strict_equals(heap, a, b));
    }
    match (a.tag(), b.tag()) {
        (Tag::Undefined, Tag::Null) | (Tag::Null, Tag::Undefined) => Ok(true),
        (Tag::Number, Tag::String) => {
            let n = to_number_value(heap, b)?;
            Ok(a.as_number().expect("tag/number mismatch") == n)
        }
        (Tag::String, Tag::Number) => {
            let n = to_number_value(heap, a)?;
            Ok(n == b.as_number().expect("tag/number mismatch"))
        }
        (Tag::Boolean, _) => {
            let n = to_number_value(heap, a)?;
            loose_equals(heap, TVal::number(n), b)
        }
        (_, Tag::Boolean) => {
            let n = to_number_value(heap, b)?;
            loose_equals(heap, a, TVal::number(n))
        }
        (Tag::Number | Tag::String, Tag::Object) => {
            to_primitive(heap, b, Hint::Default)?;
            let p = heap.top_value();
            let r = loose_equals(heap, a, p);
            heap.pop_unsafe();
            r
        }
        (Tag::Object, Tag::Number | Tag::String) => {
            to_primitive(heap, a, Hint::Default)?;
            let p = heap.top_value();
            let r = loose_equals(heap, p, b);
            heap.pop_unsafe();
            r
        }
        _ => Ok(false),
    }
}

/// `instanceof` (§15.3.5.3 via §11.8.6): the right side must be a
/// callable; bound functions delegate to their target.
pub(crate) fn instance_of(heap: &mut Heap, lhs: TVal, rhs: TVal) -> Result<bool, Unwind> {
    let Some(mut func) = rhs.as_object() else {
        return Err(type_error(heap, "instanceof target not callable"));
    };
    // Collapse the bound-function chain.
    for _ in 0..props::PROTO_SANITY_LIMIT {
        if !heap.hobj(func).is_bound() {
            break;
        }
        let key = heap.bstr(Bstr::IntTarget);
        match props::get_own_plain(heap, func, key).and_then(|v| v.as_object()) {
            Some(t) => func = t,
            None => return Err(type_error(heap, "bound function target missing")),
        }
    }
    if !heap.hobj(func).is_callable() {
        return Err(type_error(heap, "instanceof target not callable"));
    }

    let key = heap.bstr(Bstr::Prototype);
    props::get_prop(heap, TVal::object(func), TVal::string(key))?;
    let proto_tv = heap.top_value();
    heap.pop_unsafe();
    let Some(proto) = proto_tv.as_object() else {
        return Err(type_error(heap, "prototype of instanceof target not an object"));
    };

    let Some(obj) = lhs.as_object() else {
        return Ok(false);
    };
    let mut cur = heap.hobj(obj).prototype;
    for _ in 0..props::PROTO_SANITY_LIMIT {
        match cur {
            Some(c) if c == proto => return Ok(true),
            Some(c) => cur = heap.hobj(c).prototype,
            None => return Ok(false),
        }
    }
    Ok(false)
}

/// `typeof` classification.
pub fn type_of(heap: &Heap, tv: TVal) -> &'static str {
    match tv.tag() {
        Tag::Undefined => "undefined",
        Tag::Null => "object",
        Tag::Boolean => "boolean",
        Tag::Number => "number",
        Tag::String => "string",
        Tag::Buffer => "buffer",
        Tag::Pointer => "pointer",
        Tag::Object => {
            let id = tv.as_object().expect("tag/object mismatch");
            if heap.hobj(id).is_callable() {
                "function"
            } else {
                "object"
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_conversions() {
        assert_eq!(to_int32_f(0.0), 0);
        assert_eq!(to_int32_f(f64::NAN), 0);
        assert_eq!(to_int32_f(4294967296.0), 0);
        assert_eq!(to_int32_f(2147483648.0), -2147483648);
        assert_eq!(to_int32_f(-1.5), -1);
        assert_eq!(to_uint32_f(-1.0), 4294967295);
        assert_eq!(to_uint32_f(4294967296.0 + 5.0), 5);
        assert_eq!(to_integer_f(3.99), 3.0);
        assert_eq!(to_integer_f(-3.99), -3.0);
    }

    #[test]
    fn test_to_boolean() {
        let mut heap = Heap::new();
        assert!(!to_boolean_value(&heap, TVal::undefined()));
        assert!(!to_boolean_value(&heap, TVal::null()));
        assert!(!to_boolean_value(&heap, TVal::number(0.0)));
        assert!(!to_boolean_value(&heap, TVal::number(f64::NAN)));
        assert!(to_boolean_value(&heap, TVal::number(-1.0)));
        let empty = crate::strtab::intern(&mut heap, b"");
        let full = crate::strtab::intern(&mut heap, b"x");
        assert!(!to_boolean_value(&heap, TVal::string(empty)));
        assert!(to_boolean_value(&heap, TVal::string(full)));
    }

    #[test]
    fn test_to_string_primitives() {
        let mut heap = Heap::new();
        let id = to_string_intern(&mut heap, TVal::number(123.0)).unwrap();
        assert_eq!(heap.hstr(id).as_bytes(), b"123");
        let id = to_string_intern(&mut heap, TVal::undefined()).unwrap();
        assert_eq!(heap.hstr(id).as_bytes(), b"undefined");
        let id = to_string_intern(&mut heap, TVal::boolean(true)).unwrap();
        assert_eq!(heap.hstr(id).as_bytes(), b"true");
        let id = to_string_intern(&mut heap, TVal::number(f64::NAN)).unwrap();
        assert_eq!(heap.hstr(id).as_bytes(), b"NaN");
    }

    #[test]
    fn test_to_string_plain_object_fallback() {
        let mut heap = Heap::new();
        let obj = heap.alloc_object(OBJF_EXTENSIBLE, ObjClass::Object);
        heap.incref_obj(obj);
        let id = to_string_intern(&mut heap, TVal::object(obj)).unwrap();
        assert_eq!(heap.hstr(id).as_bytes(), b"[object Object]");
        heap.decref_obj(obj);
    }

    #[test]
    fn test_to_number_strings() {
        let mut heap = Heap::new();
        let s = crate::strtab::intern(&mut heap, b"  12.5 ");
        assert_eq!(to_number_value(&mut heap, TVal::string(s)).unwrap(), 12.5);
        let s = crate::strtab::intern(&mut heap, b"0x20");
        assert_eq!(to_number_value(&mut heap, TVal::string(s)).unwrap(), 32.0);
        let s = crate::strtab::intern(&mut heap, b"junk");
        assert!(to_number_value(&mut heap, TVal::string(s)).unwrap().is_nan());
        let s = crate::strtab::intern(&mut heap, b"");
        assert_eq!(to_number_value(&mut heap, TVal::string(s)).unwrap(), 0.0);
    }

    #[test]
    fn test_strict_and_same_value() {
        let heap = Heap::new();
        assert!(strict_equals(&heap, TVal::number(0.0), TVal::number(-0.0)));
        assert!(!strict_equals(
            &heap,
            TVal::number(f64::NAN),
            TVal::number(f64::NAN)
        ));
        assert!(!same_value(&heap, TVal::number(0.0), TVal::number(-0.0)));
        assert!(same_value(&heap, TVal::number(f64::NAN), TVal::number(f64::NAN)));
        assert!(!strict_equals(&heap, TVal::number(1.0), TVal::boolean(true)));
    }

    #[test]
    fn test_loose_equals() {
        let mut heap = Heap::new();
        assert!(loose_equals(&mut heap, TVal::undefined(), TVal::null()).unwrap());
        let s = crate::strtab::intern(&mut heap, b"5");
        assert!(loose_equals(&mut heap, TVal::number(5.0), TVal::string(s)).unwrap());
        assert!(loose_equals(&mut heap, TVal::boolean(true), TVal::number(1.0)).unwrap());
        assert!(!loose_equals(&mut heap, TVal::number(5.0), TVal::undefined()).unwrap());
    }

    #[test]
    fn test_typeof() {
        let mut heap = Heap::new();
        assert_eq!(type_of(&heap, TVal::null()), "object");
        assert_eq!(type_of(&heap, TVal::undefined()), "undefined");
        assert_eq!(type_of(&heap, TVal::number(1.0)), "number");
        let obj = heap.alloc_object(OBJF_EXTENSIBLE, ObjClass::Object);
        heap.incref_obj(obj);
        assert_eq!(type_of(&heap, TVal::object(obj)), "object");
        heap.decref_obj(obj);
    }
}
