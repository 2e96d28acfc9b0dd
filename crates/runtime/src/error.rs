//! Error taxonomy, throwing, and augmentation
//!
//! Script-visible errors are ordinary objects of class `Error`; the Rust
//! edge sees the fourteen-kind [`ErrCode`] taxonomy, which also doubles as
//! the magic negative return-code space of native functions.
//!
//! Throwing parks the error value in the heap's longjmp state and returns
//! [`Unwind::Throw`], which propagates through `Result` until a protected
//! call frame consumes it. Augmentation installs `fileName`, `lineNumber`
//! and a traceback immediately after creation, once per error; it is
//! skipped for allocation errors and double faults. While an error value
//! is being built the `HANDLING_ERROR` flag is set; a second fault inside
//! that window yields the pre-allocated double-error singleton instead of
//! recursing.

use eider_core::{ObjId, TVal};
use tracing::trace;

use crate::heap::{Bstr, HEAP_HANDLING_ERROR, Heap, LjKind};
use crate::hobject::{OBJF_EXTENSIBLE, ObjClass, ObjExtra};
use crate::proptable::{PROPF_CONFIGURABLE, PROPF_WRITABLE};

/// Call sites recorded in a traceback.
const TRACEBACK_DEPTH: usize = 10;

/// Control-flow escape kinds. Payload values travel in the heap's
/// longjmp-state slots, which are GC roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unwind {
    Throw,
    Yield,
    Resume,
    Return,
    Break,
    Continue,
}

/// Host-edge error kinds; the discriminant doubles as the magic code
/// space (`-code` from a native function throws that kind).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[repr(i32)]
pub enum ErrCode {
    #[error("UnimplementedError")]
    Unimplemented = 1,
    #[error("UnsupportedError")]
    Unsupported = 2,
    #[error("InternalError")]
    Internal = 3,
    #[error("AllocError")]
    Alloc = 4,
    #[error("AssertionError")]
    Assertion = 5,
    #[error("ApiError")]
    Api = 6,
    #[error("UncaughtError")]
    Uncaught = 7,
    #[error("Error")]
    Error = 8,
    #[error("EvalError")]
    Eval = 9,
    #[error("RangeError")]
    Range = 10,
    #[error("ReferenceError")]
    Reference = 11,
    #[error("SyntaxError")]
    Syntax = 12,
    #[error("TypeError")]
    Type = 13,
    #[error("URIError")]
    Uri = 14,
}

impl ErrCode {
    pub fn from_magic(rc: i32) -> Option<ErrCode> {
        match -rc {
            1 => Some(ErrCode::Unimplemented),
            2 => Some(ErrCode::Unsupported),
            3 => Some(ErrCode::Internal),
            4 => Some(ErrCode::Alloc),
            5 => Some(ErrCode::Assertion),
            6 => Some(ErrCode::Api),
            7 => Some(ErrCode::Uncaught),
            8 => Some(ErrCode::Error),
            9 => Some(ErrCode::Eval),
            10 => Some(ErrCode::Range),
            11 => Some(ErrCode::Reference),
            12 => Some(ErrCode::Syntax),
            13 => Some(ErrCode::Type),
            14 => Some(ErrCode::Uri),
            _ => None,
        }
    }

    pub(crate) fn name_bstr(self) -> Bstr {
        match self {
            ErrCode::Unimplemented => Bstr::UnimplementedError,
            ErrCode::Unsupported => Bstr::UnsupportedError,
            ErrCode::Internal => Bstr::InternalError,
            ErrCode::Alloc => Bstr::AllocError,
            ErrCode::Assertion => Bstr::AssertionError,
            ErrCode::Api => Bstr::ApiError,
            ErrCode::Uncaught => Bstr::UncaughtError,
            ErrCode::Error => Bstr::Error,
            ErrCode::Eval => Bstr::EvalError,
            ErrCode::Range => Bstr::RangeError,
            ErrCode::Reference => Bstr::ReferenceError,
            ErrCode::Syntax => Bstr::SyntaxError,
            ErrCode::Type => Bstr::TypeError,
            ErrCode::Uri => Bstr::UriError,
        }
    }
}

/// Build an error object and arm the longjmp state with it. Returns the
/// `Throw` unwind for direct propagation.
pub fn throw(heap: &mut Heap, code: ErrCode, msg: &str) -> Unwind {
    if heap.flags & HEAP_HANDLING_ERROR != 0 {
        // Second fault while constructing an error value.
        let d = heap.double_error.expect("double-error singleton missing");
        trace!("double fault, substituting double-error singleton");
        heap.lj_set(LjKind::Throw, TVal::object(d), TVal::undefined(), true);
        return Unwind::Throw;
    }
    heap.flags |= HEAP_HANDLING_ERROR;

    let obj = create_error_object(heap, code, msg);
    heap.temp_root(TVal::object(obj));
    if code != ErrCode::Alloc {
        augment(heap, obj);
    }
    heap.lj_set(LjKind::Throw, TVal::object(obj), TVal::undefined(), true);
    heap.untemp_root();

    heap.flags &= !HEAP_HANDLING_ERROR;
    trace!(code = %code, msg, "error thrown");
    Unwind::Throw
}

/// Arm the longjmp state with an already-built error value.
pub fn throw_value(heap: &mut Heap, v: TVal) -> Unwind {
    heap.lj_set(LjKind::Throw, v, TVal::undefined(), true);
    Unwind::Throw
}

/// Translate a native function's magic negative return code.
pub(crate) fn throw_from_magic(heap: &mut Heap, rc: i32) -> Unwind {
    match ErrCode::from_magic(rc) {
        Some(code) => {
            let msg = format!("{code}");
            throw(heap, code, &msg)
        }
        None => throw(heap, ErrCode::Api, "invalid native function return code"),
    }
}

pub(crate) fn create_error_object(heap: &mut Heap, code: ErrCode, msg: &str) -> ObjId {
    let obj = heap.alloc_object(OBJF_EXTENSIBLE, ObjClass::Error);
    heap.temp_root(TVal::object(obj));

    let name = heap.bstr(code.name_bstr());
    let name_key = heap.bstr(Bstr::Name);
    crate::props::put_own_flags(
        heap,
        obj,
        name_key,
        TVal::string(name),
        PROPF_WRITABLE | PROPF_CONFIGURABLE,
    );

    let msg_id = crate::strtab::intern(heap, msg.as_bytes());
    let msg_key = heap.bstr(Bstr::Message);
    crate::props::put_own_flags(
        heap,
        obj,
        msg_key,
        TVal::string(msg_id),
        PROPF_WRITABLE | PROPF_CONFIGURABLE,
    );

    // The caller roots the object before the next collection point.
    heap.untemp_root();
    obj
}

/// Pre-allocate the double-error singleton (called once at heap init).
pub(crate) fn init_double_error(heap: &mut Heap) {
    let obj = create_error_object(heap, ErrCode::Error, "error in error handling");
    heap.incref_obj(obj);
    let name_key = heap.bstr(Bstr::Name);
    let dname = heap.bstr(Bstr::DoubleError);
    crate::props::put_own_flags(
        heap,
        obj,
        name_key,
        TVal::string(dname),
        PROPF_WRITABLE | PROPF_CONFIGURABLE,
    );
    heap.double_error = Some(obj);
}

/// Install `fileName`, `lineNumber`, and the traceback from the current
/// call stack. Runs once, right after creation, before propagation.
fn augment(heap: &mut Heap, obj: ObjId) {
    let Some(thr_id) = heap.curr_thread else {
        return;
    };

    let acts: Vec<(Option<ObjId>, u32)> = {
        let thr = heap.thr_of(thr_id);
        thr.callstack
            .iter()
            .rev()
            .take(TRACEBACK_DEPTH)
            .map(|a| (a.func, a.pc))
            .collect()
    };

    let mut sites: Vec<(TVal, u32)> = Vec::new();
    let mut file_name: Option<TVal> = None;
    let mut line_number: Option<u32> = None;
    for (func, pc) in acts {
        let Some(func) = func else { continue };
        let name_key = heap.bstr(Bstr::IntName);
        let name = crate::props::get_own_plain(heap, func, name_key).unwrap_or(TVal::undefined());
        let line = func_pc_to_line(heap, func, pc);
        if file_name.is_none() {
            let src_key = heap.bstr(Bstr::IntSource);
            if let Some(src) = crate::props::get_own_plain(heap, func, src_key) {
                file_name = Some(src);
                line_number = Some(line);
            }
        }
        sites.push((name, line));
    }

    if let Some(fname) = file_name {
        let key = heap.bstr(Bstr::FileName);
        crate::props::put_own_flags(heap, obj, key, fname, PROPF_WRITABLE | PROPF_CONFIGURABLE);
        let key = heap.bstr(Bstr::LineNumber);
        let line = TVal::number(line_number.unwrap_or(0) as f64);
        crate::props::put_own_flags(heap, obj, key, line, PROPF_WRITABLE | PROPF_CONFIGURABLE);
    }

    if !sites.is_empty() {
        // Flat (name, line) pairs in an array-part object.
        let trace_obj = crate::props::alloc_array_object(heap, sites.len() * 2);
        heap.temp_root(TVal::object(trace_obj));
        for (i, (name, line)) in sites.into_iter().enumerate() {
            crate::props::array_init_slot(heap, trace_obj, (i * 2) as u32, name);
            crate::props::array_init_slot(
                heap,
                trace_obj,
                (i * 2 + 1) as u32,
                TVal::number(line as f64),
            );
        }
        let key = heap.bstr(Bstr::IntTracedata);
        crate::props::put_own_internal(heap, obj, key, TVal::object(trace_obj));
        heap.untemp_root();
    }
}

fn func_pc_to_line(heap: &Heap, func: ObjId, pc: u32) -> u32 {
    let o = heap.hobj(func);
    if let ObjExtra::CompFunc(d) = &o.extra {
        if let Some(buf) = d.pc2line {
            return crate::bytecode::pc2line_lookup(heap.hbuf(buf).as_slice(), pc);
        }
    }
    0
}

// Convenience constructors used across the runtime.

pub(crate) fn range_error(heap: &mut Heap, msg: &str) -> Unwind {
    throw(heap, ErrCode::Range, msg)
}

pub(crate) fn type_error(heap: &mut Heap, msg: &str) -> Unwind {
    throw(heap, ErrCode::Type, msg)
}

pub(crate) fn reference_error(heap: &mut Heap, msg: &str) -> Unwind {
    throw(heap, ErrCode::Reference, msg)
}

pub(crate) fn api_error(heap: &mut Heap, msg: &str) -> Unwind {
    throw(heap, ErrCode::Api, msg)
}

pub(crate) fn unimplemented_error(heap: &mut Heap, msg: &str) -> Unwind {
    throw(heap, ErrCode::Unimplemented, msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_code_roundtrip() {
        assert_eq!(ErrCode::from_magic(-13), Some(ErrCode::Type));
        assert_eq!(ErrCode::from_magic(-1), Some(ErrCode::Unimplemented));
        assert_eq!(ErrCode::from_magic(-14), Some(ErrCode::Uri));
        assert_eq!(ErrCode::from_magic(-15), None);
        assert_eq!(ErrCode::from_magic(0), None);
        assert_eq!(ErrCode::from_magic(1), None);
    }

    #[test]
    fn test_display_names() {
        assert_eq!(format!("{}", ErrCode::Type), "TypeError");
        assert_eq!(format!("{}", ErrCode::Uri), "URIError");
        assert_eq!(format!("{}", ErrCode::Alloc), "AllocError");
    }
}
