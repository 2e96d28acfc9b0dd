//! Object cells
//!
//! One object layout shared by plain objects, functions, environment
//! records, and threads: a heap header with behavior flags, a class
//! number, a prototype id, the three-part property table, and a subtype
//! payload for compiled functions, native functions, and threads.

use eider_core::{BufId, ObjId, TVal};

use crate::error::Unwind;
use crate::heap::Heap;
use crate::heaphdr::{HTYPE_OBJECT, HDR_USER_SHIFT, HeapHdr};
use crate::hthread::ThreadData;
use crate::proptable::PropTable;

/// Object behavior flags (header user-flag space).
pub const OBJF_EXTENSIBLE: u32 = 1 << HDR_USER_SHIFT;
pub const OBJF_CONSTRUCTABLE: u32 = 1 << (HDR_USER_SHIFT + 1);
pub const OBJF_BOUND: u32 = 1 << (HDR_USER_SHIFT + 2);
pub const OBJF_COMPFUNC: u32 = 1 << (HDR_USER_SHIFT + 3);
pub const OBJF_NATFUNC: u32 = 1 << (HDR_USER_SHIFT + 4);
pub const OBJF_THREAD: u32 = 1 << (HDR_USER_SHIFT + 5);
/// Object has an array part (its size may still be zero).
pub const OBJF_ARRAY_PART: u32 = 1 << (HDR_USER_SHIFT + 6);
pub const OBJF_STRICT: u32 = 1 << (HDR_USER_SHIFT + 7);
/// Function: create a fresh environment record when called.
pub const OBJF_NEWENV: u32 = 1 << (HDR_USER_SHIFT + 8);
/// Function: create a binding for the function name (named expressions).
pub const OBJF_NAMEBINDING: u32 = 1 << (HDR_USER_SHIFT + 9);
/// Function: build an arguments object on call.
pub const OBJF_CREATEARGS: u32 = 1 << (HDR_USER_SHIFT + 10);
/// Declarative env record: closed, register fast path severed.
pub const OBJF_ENVRECCLOSED: u32 = 1 << (HDR_USER_SHIFT + 11);
/// Array length/index special behavior.
pub const OBJF_SPECIAL_ARRAY: u32 = 1 << (HDR_USER_SHIFT + 12);
/// String object indexed-character special behavior.
pub const OBJF_SPECIAL_STRINGOBJ: u32 = 1 << (HDR_USER_SHIFT + 13);
/// Arguments object parameter-map special behavior.
pub const OBJF_SPECIAL_ARGUMENTS: u32 = 1 << (HDR_USER_SHIFT + 14);

/// Object class numbers.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjClass {
    Unused = 0,
    Arguments,
    Array,
    Boolean,
    Date,
    Error,
    Function,
    Number,
    Object,
    RegExp,
    String,
    Global,
    // synthetic classes
    ObjEnv,
    DecEnv,
    Buffer,
    Pointer,
    Thread,
}

impl ObjClass {
    /// Class name as surfaced by `Object.prototype.toString`-style output.
    pub fn name(self) -> &'static str {
        match self {
            ObjClass::Unused => "Unused",
            ObjClass::Arguments => "Arguments",
            ObjClass::Array => "Array",
            ObjClass::Boolean => "Boolean",
            ObjClass::Date => "Date",
            ObjClass::Error => "Error",
            ObjClass::Function => "Function",
            ObjClass::Number => "Number",
            ObjClass::Object => "Object",
            ObjClass::RegExp => "RegExp",
            ObjClass::String => "String",
            ObjClass::Global => "Global",
            ObjClass::ObjEnv => "ObjEnv",
            ObjClass::DecEnv => "DecEnv",
            ObjClass::Buffer => "Buffer",
            ObjClass::Pointer => "Pointer",
            ObjClass::Thread => "Thread",
        }
    }
}

/// Native function callback. Enters with the argument frame on the value
/// stack. `Ok(0)` means return undefined, `Ok(1)` means return the value
/// at stack top, negative values are magic error codes; an `Err` unwind
/// propagates as-is.
pub type NativeFn = fn(&mut Heap) -> Result<i32, Unwind>;

/// Compiled-function payload: bytecode container plus the derived
/// constants and inner-function tables.
pub struct CompFuncData {
    /// Bytecode buffer (32-bit instruction words).
    pub data: Option<BufId>,
    /// Packed pc→line side table.
    pub pc2line: Option<BufId>,
    pub nregs: u16,
    pub nargs: u16,
    pub consts: Vec<TVal>,
    pub funcs: Vec<ObjId>,
}

/// Native-function payload.
pub struct NatFuncData {
    pub func: NativeFn,
    /// Declared argument count; negative means vararg (stack is left
    /// as-is on entry).
    pub nargs: i16,
}

/// Subtype payload extending the shared object layout.
pub enum ObjExtra {
    None,
    CompFunc(CompFuncData),
    NatFunc(NatFuncData),
    Thread(Box<ThreadData>),
}

pub struct HObject {
    pub hdr: HeapHdr,
    pub class: ObjClass,
    pub prototype: Option<ObjId>,
    pub props: PropTable,
    pub extra: ObjExtra,
}

impl HObject {
    pub fn new(flags: u32, class: ObjClass) -> Self {
        let mut hdr = HeapHdr::new(HTYPE_OBJECT);
        hdr.set(flags);
        HObject {
            hdr,
            class,
            prototype: None,
            props: PropTable::new(),
            extra: ObjExtra::None,
        }
    }

    #[inline]
    pub fn is_callable(&self) -> bool {
        self.hdr.has(OBJF_COMPFUNC | OBJF_NATFUNC | OBJF_BOUND)
    }

    #[inline]
    pub fn is_compfunc(&self) -> bool {
        self.hdr.has(OBJF_COMPFUNC)
    }

    #[inline]
    pub fn is_natfunc(&self) -> bool {
        self.hdr.has(OBJF_NATFUNC)
    }

    #[inline]
    pub fn is_bound(&self) -> bool {
        self.hdr.has(OBJF_BOUND)
    }

    #[inline]
    pub fn is_thread(&self) -> bool {
        self.hdr.has(OBJF_THREAD)
    }

    #[inline]
    pub fn is_extensible(&self) -> bool {
        self.hdr.has(OBJF_EXTENSIBLE)
    }

    #[inline]
    pub fn is_strict(&self) -> bool {
        self.hdr.has(OBJF_STRICT)
    }

    #[inline]
    pub fn has_array_part(&self) -> bool {
        self.hdr.has(OBJF_ARRAY_PART)
    }

    #[inline]
    pub fn is_env(&self) -> bool {
        matches!(self.class, ObjClass::DecEnv | ObjClass::ObjEnv)
    }

    pub fn compfunc(&self) -> &CompFuncData {
        match &self.extra {
            ObjExtra::CompFunc(d) => d,
            _ => panic!("object is not a compiled function"),
        }
    }

    pub fn compfunc_mut(&mut self) -> &mut CompFuncData {
        match &mut self.extra {
            ObjExtra::CompFunc(d) => d,
            _ => panic!("object is not a compiled function"),
        }
    }

    pub fn natfunc(&self) -> &NatFuncData {
        match &self.extra {
            ObjExtra::NatFunc(d) => d,
            _ => panic!("object is not a native function"),
        }
    }

    pub fn thread(&self) -> &ThreadData {
        match &self.extra {
            ObjExtra::Thread(t) => t,
            _ => panic!("object is not a thread"),
        }
    }

    pub fn thread_mut(&mut self) -> &mut ThreadData {
        match &mut self.extra {
            ObjExtra::Thread(t) => t,
            _ => panic!("object is not a thread"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_and_class() {
        let o = HObject::new(OBJF_EXTENSIBLE | OBJF_SPECIAL_ARRAY | OBJF_ARRAY_PART, ObjClass::Array);
        assert!(o.is_extensible());
        assert!(o.has_array_part());
        assert!(!o.is_callable());
        assert_eq!(o.class, ObjClass::Array);
        assert_eq!(o.class.name(), "Array");
    }

    #[test]
    fn test_callable_kinds() {
        let mut o = HObject::new(OBJF_NATFUNC, ObjClass::Function);
        assert!(o.is_callable());
        o.hdr.clear(OBJF_NATFUNC);
        o.hdr.set(OBJF_BOUND);
        assert!(o.is_callable());
        assert!(!o.is_natfunc());
    }
}
