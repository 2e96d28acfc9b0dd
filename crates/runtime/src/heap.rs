//! The heap: cell storage, roots, interlocks, longjmp state
//!
//! One `Heap` serves any number of cooperative threads. It owns the cell
//! slabs, the string table, the allocated/refzero/finalize work lists, the
//! builtin string set, the stash, and the longjmp state that carries
//! unwind payloads. The public embedder handle (`Context`) is this type.
//!
//! ## Interlocks
//!
//! A small set of explicit flags stands in for a lock discipline: the
//! collector holds `MARKANDSWEEP_RUNNING` (no refzero processing while
//! marking), the refzero driver holds `REFZERO_FREE_RUNNING` (finalizer
//! decrefs only enqueue), and sensitive sections set `NO_FINALIZERS` /
//! `NO_STRINGTABLE_RESIZE` in the base flag mask merged into every cycle.

use std::rc::Rc;

use eider_core::{BufId, ObjId, StrId, TVal, Tag};

use crate::alloc::{self, Allocator, FatalFn, default_fatal};
use crate::error::Unwind;
use crate::executor::Executor;
use crate::hbuffer::HBuffer;
use crate::heaphdr::{HeapHdr, HeapRef};
use crate::hobject::{HObject, ObjClass, ObjExtra, OBJF_EXTENSIBLE, OBJF_THREAD};
use crate::hstring::HString;
use crate::hthread::{
    Activation, ThreadData, ThreadState, TB_COUNT, TB_GLOBAL, TB_GLOBAL_ENV,
    VALSTACK_INTERNAL_EXTRA, CALL_RECURSION_DEFAULT_LIMIT,
};
use crate::slab::Slab;
use crate::strtab::StrTab;

/// Heap dynamic flags.
pub const HEAP_MARKANDSWEEP_RUNNING: u32 = 1 << 0;
pub const HEAP_REFZERO_FREE_RUNNING: u32 = 1 << 1;
/// Error machinery is building an error value (double-fault guard).
pub const HEAP_HANDLING_ERROR: u32 = 1 << 2;

/// Refzero debits before a voluntary mark-and-sweep is scheduled.
pub const MS_TRIGGER_LIMIT: i64 = 10_000;

/// String cache entries (char offset → byte offset sliding windows).
pub const STRCACHE_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct StrCacheEntry {
    pub h: Option<StrId>,
    pub bidx: u32,
    pub cidx: u32,
}

/// Longjmp-state kinds: every control-flow escape travels as one of
/// these, with payload values parked in the state's rooted slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LjKind {
    Unknown,
    Throw,
    Yield,
    Resume,
    Return,
    Break,
    Continue,
}

/// Unified control-transfer state. `value1`/`value2` are GC roots and are
/// reference-counted through the setters on `Heap`.
pub struct LjState {
    pub kind: LjKind,
    pub value1: TVal,
    pub value2: TVal,
    pub iserror: bool,
}

impl LjState {
    fn new() -> Self {
        LjState {
            kind: LjKind::Unknown,
            value1: TVal::undefined(),
            value2: TVal::undefined(),
            iserror: false,
        }
    }
}

/// Built-in interned strings, indexed by `Bstr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Bstr {
    Empty = 0,
    Length,
    Prototype,
    Constructor,
    Message,
    Name,
    FileName,
    LineNumber,
    Callee,
    Caller,
    Arguments,
    Eval,
    Undefined,
    Null,
    True,
    False,
    Function,
    Nan,
    Infinity,
    ObjObject,
    // error kind names
    Error,
    EvalError,
    RangeError,
    ReferenceError,
    SyntaxError,
    TypeError,
    UriError,
    UnimplementedError,
    UnsupportedError,
    InternalError,
    AllocError,
    AssertionError,
    ApiError,
    UncaughtError,
    DoubleError,
    // internal keys (0xFF-prefixed, hidden from scripts)
    IntValue,
    IntMap,
    IntVarenv,
    IntLexenv,
    IntRegbase,
    IntThread,
    IntFinalizer,
    IntCallee,
    IntTarget,
    IntThis,
    IntArgs,
    IntFormals,
    IntName,
    IntSource,
    IntPc2line,
    IntTracedata,
    IntNext,
    IntEnumKeys,
    IntVarmap,
    ValueOf,
    ToString,
}

const BSTR_COUNT: usize = Bstr::ToString as usize + 1;

fn bstr_bytes(b: Bstr) -> &'static [u8] {
    match b {
        Bstr::Empty => b"",
        Bstr::Length => b"length",
        Bstr::Prototype => b"prototype",
        Bstr::Constructor => b"constructor",
        Bstr::Message => b"message",
        Bstr::Name => b"name",
        Bstr::FileName => b"fileName",
        Bstr::LineNumber => b"lineNumber",
        Bstr::Callee => b"callee",
        Bstr::Caller => b"caller",
        Bstr::Arguments => b"arguments",
        Bstr::Eval => b"eval",
        Bstr::Undefined => b"undefined",
        Bstr::Null => b"null",
        Bstr::True => b"true",
        Bstr::False => b"false",
        Bstr::Function => b"function",
        Bstr::Nan => b"NaN",
        Bstr::Infinity => b"Infinity",
        Bstr::ObjObject => b"[object Object]",
        Bstr::Error => b"Error",
        Bstr::EvalError => b"EvalError",
        Bstr::RangeError => b"RangeError",
        Bstr::ReferenceError => b"ReferenceError",
        Bstr::SyntaxError => b"SyntaxError",
        Bstr::TypeError => b"TypeError",
        Bstr::UriError => b"URIError",
        Bstr::UnimplementedError => b"UnimplementedError",
        Bstr::UnsupportedError => b"UnsupportedError",
        Bstr::InternalError => b"InternalError",
        Bstr::AllocError => b"AllocError",
        Bstr::AssertionError => b"AssertionError",
        Bstr::ApiError => b"ApiError",
        Bstr::UncaughtError => b"UncaughtError",
        Bstr::DoubleError => b"DoubleError",
        Bstr::IntValue => b"\xFFvalue",
        Bstr::IntMap => b"\xFFmap",
        Bstr::IntVarenv => b"\xFFvarenv",
        Bstr::IntLexenv => b"\xFFlexenv",
        Bstr::IntRegbase => b"\xFFregbase",
        Bstr::IntThread => b"\xFFthread",
        Bstr::IntFinalizer => b"\xFFfinalizer",
        Bstr::IntCallee => b"\xFFcallee",
        Bstr::IntTarget => b"\xFFtarget",
        Bstr::IntThis => b"\xFFthis",
        Bstr::IntArgs => b"\xFFargs",
        Bstr::IntFormals => b"\xFFformals",
        Bstr::IntName => b"\xFFname",
        Bstr::IntSource => b"\xFFsource",
        Bstr::IntPc2line => b"\xFFpc2line",
        Bstr::IntTracedata => b"\xFFtracedata",
        Bstr::IntNext => b"\xFFnext",
        Bstr::IntEnumKeys => b"\xFFenumkeys",
        Bstr::IntVarmap => b"\xFFvarmap",
        Bstr::ValueOf => b"valueOf",
        Bstr::ToString => b"toString",
    }
}

/// ES5.1 reserved words, always-reserved set.
const RESERVED_WORDS: &[&[u8]] = &[
    b"break", b"case", b"catch", b"continue", b"debugger", b"default", b"delete", b"do", b"else",
    b"finally", b"for", b"function", b"if", b"in", b"instanceof", b"new", b"return", b"switch",
    b"this", b"throw", b"try", b"typeof", b"var", b"void", b"while", b"with", b"class", b"const",
    b"enum", b"export", b"extends", b"import", b"super",
];

/// Additional strict-mode reserved words.
const STRICT_RESERVED_WORDS: &[&[u8]] = &[
    b"implements", b"interface", b"let", b"package", b"private", b"protected", b"public",
    b"static", b"yield",
];

/// The engine instance: heap state plus the host-facing value-stack API
/// (implemented across the `api_*` modules). All operations act on the
/// heap's current thread.
pub struct Heap {
    pub(crate) alloc: Allocator,
    pub(crate) fatal: FatalFn,

    pub(crate) strings: Slab<HString>,
    pub(crate) objects: Slab<HObject>,
    pub(crate) buffers: Slab<HBuffer>,

    pub(crate) strtab: StrTab,
    pub(crate) hash_seed: u32,
    pub(crate) strcache: [StrCacheEntry; STRCACHE_SIZE],

    /// Doubly-linked list of all allocated objects and buffers.
    pub(crate) heap_allocated: Option<HeapRef>,
    /// Refzero work list (objects only); tail insert keeps the head
    /// stable during finalizer reentry.
    pub(crate) refzero_head: Option<ObjId>,
    pub(crate) refzero_tail: Option<ObjId>,
    /// Objects queued for finalization after a sweep.
    pub(crate) finalize_head: Option<ObjId>,

    pub(crate) flags: u32,
    /// Flag mask merged into every mark-and-sweep run; sensitive sections
    /// park `NO_FINALIZERS` / `NO_STRINGTABLE_RESIZE` here.
    pub(crate) ms_base_flags: u32,
    pub(crate) ms_trigger_counter: i64,
    pub(crate) ms_running_flags: u32,

    pub(crate) call_recursion_depth: usize,
    pub(crate) call_recursion_limit: usize,

    pub(crate) heap_thread: Option<ObjId>,
    pub(crate) curr_thread: Option<ObjId>,
    pub(crate) stash: Option<ObjId>,

    pub(crate) builtin_strs: Vec<StrId>,
    /// Temporaries rooted against collection while under construction.
    pub(crate) temp_roots: Vec<TVal>,
    pub(crate) lj: LjState,
    pub(crate) double_error: Option<ObjId>,

    pub(crate) executor: Option<Rc<dyn Executor>>,
}

impl Heap {
    /// Create a heap with the libc allocator and the default fatal
    /// handler, and initialize the heap thread, global object, global
    /// environment, and stash.
    pub fn new() -> Self {
        Self::with_allocator(Allocator::libc(), default_fatal)
    }

    pub fn with_allocator(alloc: Allocator, fatal: FatalFn) -> Self {
        let mut heap = Heap {
            alloc,
            fatal,
            strings: Slab::new(),
            objects: Slab::new(),
            buffers: Slab::new(),
            strtab: StrTab::new(),
            hash_seed: 0xABCD_0001,
            strcache: [StrCacheEntry::default(); STRCACHE_SIZE],
            heap_allocated: None,
            refzero_head: None,
            refzero_tail: None,
            finalize_head: None,
            flags: 0,
            ms_base_flags: 0,
            ms_trigger_counter: MS_TRIGGER_LIMIT,
            ms_running_flags: 0,
            call_recursion_depth: 0,
            call_recursion_limit: CALL_RECURSION_DEFAULT_LIMIT,
            heap_thread: None,
            curr_thread: None,
            stash: None,
            builtin_strs: Vec::new(),
            temp_roots: Vec::new(),
            lj: LjState::new(),
            double_error: None,
            executor: None,
        };
        heap.init_builtin_strings();
        heap.init_heap_objects();
        heap
    }

    /// Install (or clear) the bytecode executor seam.
    pub fn set_executor(&mut self, ex: Option<Rc<dyn Executor>>) {
        self.executor = ex;
    }

    fn init_builtin_strings(&mut self) {
        use crate::hstring::{
            STRF_EVAL_OR_ARGUMENTS, STRF_RESERVED_WORD, STRF_STRICT_RESERVED_WORD,
        };
        for b in BSTR_TABLE {
            let id = crate::strtab::intern(self, bstr_bytes(b));
            self.incref_str(id);
            self.builtin_strs.push(id);
        }
        // Keyword strings are flagged once and kept alive for the heap's
        // lifetime so the flags survive collections.
        for w in RESERVED_WORDS {
            let id = crate::strtab::intern(self, w);
            self.incref_str(id);
            self.hstr_mut(id).hdr.set(STRF_RESERVED_WORD);
        }
        for w in STRICT_RESERVED_WORDS {
            let id = crate::strtab::intern(self, w);
            self.incref_str(id);
            self.hstr_mut(id).hdr.set(STRF_RESERVED_WORD | STRF_STRICT_RESERVED_WORD);
        }
        for w in [&b"eval"[..], &b"arguments"[..]] {
            let id = crate::strtab::intern(self, w);
            self.hstr_mut(id).hdr.set(STRF_EVAL_OR_ARGUMENTS);
        }
    }

    fn init_heap_objects(&mut self) {
        // Heap thread; becomes the current thread so the API is usable
        // right after construction.
        let mut td = ThreadData::new(false);
        td.state = ThreadState::Running;
        let thr_obj = self.alloc_object(OBJF_THREAD | OBJF_EXTENSIBLE, ObjClass::Thread);
        self.hobj_mut(thr_obj).extra = ObjExtra::Thread(Box::new(td));
        self.incref_obj(thr_obj);
        self.heap_thread = Some(thr_obj);
        self.curr_thread = Some(thr_obj);

        // Global object and its object environment record.
        let global = self.alloc_object(OBJF_EXTENSIBLE, ObjClass::Global);
        self.incref_obj(global);
        let genv = self.alloc_object(OBJF_EXTENSIBLE, ObjClass::ObjEnv);
        self.incref_obj(genv);
        // Bind the env's target through the internal key.
        let key = self.bstr(Bstr::IntTarget);
        crate::props::put_own_internal(self, genv, key, TVal::object(global));

        let mut builtins = vec![ObjId::new(0); TB_COUNT];
        builtins[TB_GLOBAL] = global;
        builtins[TB_GLOBAL_ENV] = genv;
        // Shared strict-mode thrower: a native that always throws.
        let thrower = crate::call::alloc_native_function(self, crate::call::native_type_error_thrower, 0);
        self.incref_obj(thrower);
        builtins[crate::hthread::TB_TYPE_ERROR_THROWER] = thrower;
        for &b in &builtins {
            self.incref_obj(b);
        }
        self.thr_of_mut(thr_obj).builtins = builtins;
        // Drop the local owning refs now held by the builtins table.
        self.decref_obj(global);
        self.decref_obj(genv);
        self.decref_obj(thrower);

        // Heap stash, reachable only through the API.
        let stash = self.alloc_object(OBJF_EXTENSIBLE, ObjClass::Object);
        self.incref_obj(stash);
        self.stash = Some(stash);

        crate::error::init_double_error(self);
    }

    // ----------------------------------------------------------------
    // Cell accessors
    // ----------------------------------------------------------------

    #[inline]
    pub(crate) fn hstr(&self, id: StrId) -> &HString {
        self.strings.get(id.raw()).expect("stale string id")
    }

    #[inline]
    pub(crate) fn hstr_mut(&mut self, id: StrId) -> &mut HString {
        self.strings.get_mut(id.raw()).expect("stale string id")
    }

    #[inline]
    pub(crate) fn hobj(&self, id: ObjId) -> &HObject {
        self.objects.get(id.raw()).expect("stale object id")
    }

    #[inline]
    pub(crate) fn hobj_mut(&mut self, id: ObjId) -> &mut HObject {
        self.objects.get_mut(id.raw()).expect("stale object id")
    }

    #[inline]
    pub(crate) fn hbuf(&self, id: BufId) -> &HBuffer {
        self.buffers.get(id.raw()).expect("stale buffer id")
    }

    #[inline]
    pub(crate) fn hbuf_mut(&mut self, id: BufId) -> &mut HBuffer {
        self.buffers.get_mut(id.raw()).expect("stale buffer id")
    }

    pub(crate) fn hdr(&self, r: HeapRef) -> &HeapHdr {
        match r {
            HeapRef::Str(id) => &self.hstr(id).hdr,
            HeapRef::Obj(id) => &self.hobj(id).hdr,
            HeapRef::Buf(id) => &self.hbuf(id).hdr,
        }
    }

    pub(crate) fn hdr_mut(&mut self, r: HeapRef) -> &mut HeapHdr {
        match r {
            HeapRef::Str(id) => &mut self.hstr_mut(id).hdr,
            HeapRef::Obj(id) => &mut self.hobj_mut(id).hdr,
            HeapRef::Buf(id) => &mut self.hbuf_mut(id).hdr,
        }
    }

    /// Builtin interned string id.
    #[inline]
    pub(crate) fn bstr(&self, b: Bstr) -> StrId {
        self.builtin_strs[b as usize]
    }

    // ----------------------------------------------------------------
    // Allocated-list maintenance
    // ----------------------------------------------------------------

    pub(crate) fn link_allocated(&mut self, r: HeapRef) {
        let old_head = self.heap_allocated;
        {
            let hdr = self.hdr_mut(r);
            hdr.next = old_head;
            hdr.prev = None;
        }
        if let Some(h) = old_head {
            self.hdr_mut(h).prev = Some(r);
        }
        self.heap_allocated = Some(r);
    }

    pub(crate) fn unlink_allocated(&mut self, r: HeapRef) {
        let (prev, next) = {
            let hdr = self.hdr(r);
            (hdr.prev, hdr.next)
        };
        match prev {
            Some(p) => self.hdr_mut(p).next = next,
            None => self.heap_allocated = next,
        }
        if let Some(n) = next {
            self.hdr_mut(n).prev = prev;
        }
        let hdr = self.hdr_mut(r);
        hdr.next = None;
        hdr.prev = None;
    }

    // ----------------------------------------------------------------
    // Cell construction
    // ----------------------------------------------------------------

    /// Allocate a bare object cell (refcount zero) and link it into the
    /// allocated list. The caller must root it before the next operation
    /// that can run a collection.
    pub(crate) fn alloc_object(&mut self, flags: u32, class: ObjClass) -> ObjId {
        let obj = HObject::new(flags, class);
        let id = ObjId::new(self.objects.insert(obj));
        self.link_allocated(HeapRef::Obj(id));
        id
    }

    /// Allocate a buffer cell with zeroed contents.
    pub(crate) fn alloc_buffer(&mut self, size: usize, dynamic: bool) -> BufId {
        let data = alloc::alloc_checked(self, size);
        if size > 0 {
            // Safety: alloc_checked returned a live block of `size` bytes.
            unsafe { std::ptr::write_bytes(data, 0, size) };
        }
        let id = BufId::new(self.buffers.insert(HBuffer::new(data, size, dynamic)));
        self.link_allocated(HeapRef::Buf(id));
        id
    }

    // ----------------------------------------------------------------
    // Thread access
    // ----------------------------------------------------------------

    /// Root a temporary against mark-and-sweep while it is not yet
    /// reachable from the heap (LIFO discipline).
    pub(crate) fn temp_root(&mut self, tv: TVal) {
        self.incref(tv);
        self.temp_roots.push(tv);
    }

    /// Drop the most recent temporary root. The count is dropped without
    /// refzero processing: when this was the last reference the cell is
    /// being handed off borrowed (the caller roots it before the next
    /// collection point), and a stray leftover is reclaimed by the next
    /// mark-and-sweep cycle.
    pub(crate) fn untemp_root(&mut self) {
        let tv = self.temp_roots.pop().expect("temp root stack underflow");
        match tv.tag() {
            Tag::String => {
                let hdr = &mut self.hstr_mut(tv.as_string().expect("tag/string mismatch")).hdr;
                hdr.refcount = hdr.refcount.saturating_sub(1);
            }
            Tag::Object => {
                let hdr = &mut self.hobj_mut(tv.as_object().expect("tag/object mismatch")).hdr;
                hdr.refcount = hdr.refcount.saturating_sub(1);
            }
            Tag::Buffer => {
                let hdr = &mut self.hbuf_mut(tv.as_buffer().expect("tag/buffer mismatch")).hdr;
                hdr.refcount = hdr.refcount.saturating_sub(1);
            }
            _ => {}
        }
    }

    pub(crate) fn curr(&self) -> ObjId {
        self.curr_thread.expect("heap has no current thread")
    }

    pub(crate) fn thr(&self) -> &ThreadData {
        self.thr_of(self.curr())
    }

    pub(crate) fn thr_mut(&mut self) -> &mut ThreadData {
        let id = self.curr();
        self.thr_of_mut(id)
    }

    pub(crate) fn thr_of(&self, id: ObjId) -> &ThreadData {
        self.hobj(id).thread()
    }

    pub(crate) fn thr_of_mut(&mut self, id: ObjId) -> &mut ThreadData {
        self.hobj_mut(id).thread_mut()
    }

    // ----------------------------------------------------------------
    // Value-stack primitives (refcount-maintaining)
    // ----------------------------------------------------------------

    /// Ensure capacity for `extra` more cells above the current top,
    /// growing the allocation within the thread limit. Returns false when
    /// the limit would be exceeded.
    pub(crate) fn valstack_reserve(&mut self, extra: usize) -> bool {
        let thr = self.thr_mut();
        let need = thr.valstack_top.saturating_add(extra);
        if need <= thr.valstack.len() {
            return true;
        }
        if need > thr.valstack_limit {
            return false;
        }
        let new_len = (need + VALSTACK_INTERNAL_EXTRA).min(thr.valstack_limit);
        thr.valstack.resize(new_len, TVal::undefined());
        true
    }

    /// Push one cell; throws `RangeError` once the configured limit is
    /// reached.
    pub(crate) fn push(&mut self, tv: TVal) -> Result<(), Unwind> {
        if !self.valstack_reserve(1) {
            return Err(crate::error::range_error(self, "valstack limit reached"));
        }
        self.incref(tv);
        let thr = self.thr_mut();
        let top = thr.valstack_top;
        thr.valstack[top] = tv;
        thr.valstack_top = top + 1;
        Ok(())
    }

    /// Current top cell; panics if the frame is empty (internal use).
    pub(crate) fn top_value(&self) -> TVal {
        let thr = self.thr();
        debug_assert!(thr.valstack_top > thr.valstack_bottom);
        thr.valstack[thr.valstack_top - 1]
    }

    /// Pop one cell, dropping its reference. The popped value must not be
    /// used afterwards; read it before popping.
    pub(crate) fn pop_unsafe(&mut self) -> TVal {
        let thr = self.thr_mut();
        debug_assert!(thr.valstack_top > thr.valstack_bottom);
        let top = thr.valstack_top - 1;
        let tv = thr.valstack[top];
        thr.valstack[top] = TVal::undefined();
        thr.valstack_top = top;
        self.decref(tv);
        tv
    }

    /// Write a cell into an absolute slot, adjusting refcounts.
    pub(crate) fn set_slot(&mut self, abs: usize, tv: TVal) {
        self.incref(tv);
        let thr = self.thr_mut();
        let old = thr.valstack[abs];
        thr.valstack[abs] = tv;
        self.decref(old);
    }

    /// Truncate the frame to absolute index `new_top`, dropping refs of
    /// everything above it.
    pub(crate) fn truncate_to(&mut self, new_top: usize) {
        loop {
            let thr = self.thr_mut();
            if thr.valstack_top <= new_top {
                break;
            }
            let top = thr.valstack_top - 1;
            let tv = thr.valstack[top];
            thr.valstack[top] = TVal::undefined();
            thr.valstack_top = top;
            self.decref(tv);
        }
    }

    /// Absolute index of the current top.
    #[inline]
    pub(crate) fn abs_top(&self) -> usize {
        self.thr().valstack_top
    }

    // ----------------------------------------------------------------
    // Longjmp state
    // ----------------------------------------------------------------

    pub(crate) fn lj_set(&mut self, kind: LjKind, v1: TVal, v2: TVal, iserror: bool) {
        self.incref(v1);
        self.incref(v2);
        let old1 = self.lj.value1;
        let old2 = self.lj.value2;
        self.lj.kind = kind;
        self.lj.value1 = v1;
        self.lj.value2 = v2;
        self.lj.iserror = iserror;
        self.decref(old1);
        self.decref(old2);
    }

    pub(crate) fn lj_clear(&mut self) {
        self.lj_set(LjKind::Unknown, TVal::undefined(), TVal::undefined(), false);
    }

    // ----------------------------------------------------------------
    // Refcount dispatch (implementation in refcount.rs)
    // ----------------------------------------------------------------

    pub(crate) fn incref(&mut self, tv: TVal) {
        match tv.tag() {
            Tag::String => {
                let id = tv.as_string().expect("tag/string mismatch");
                self.hstr_mut(id).hdr.refcount += 1;
            }
            Tag::Object => {
                let id = tv.as_object().expect("tag/object mismatch");
                self.hobj_mut(id).hdr.refcount += 1;
            }
            Tag::Buffer => {
                let id = tv.as_buffer().expect("tag/buffer mismatch");
                self.hbuf_mut(id).hdr.refcount += 1;
            }
            _ => {}
        }
    }

    pub(crate) fn decref(&mut self, tv: TVal) {
        match tv.tag() {
            Tag::String => self.decref_str(tv.as_string().expect("tag/string mismatch")),
            Tag::Object => self.decref_obj(tv.as_object().expect("tag/object mismatch")),
            Tag::Buffer => self.decref_buf(tv.as_buffer().expect("tag/buffer mismatch")),
            _ => {}
        }
    }

    pub(crate) fn incref_obj(&mut self, id: ObjId) {
        self.hobj_mut(id).hdr.refcount += 1;
    }

    pub(crate) fn incref_str(&mut self, id: StrId) {
        self.hstr_mut(id).hdr.refcount += 1;
    }

    pub(crate) fn incref_buf(&mut self, id: BufId) {
        self.hbuf_mut(id).hdr.refcount += 1;
    }

    pub(crate) fn decref_obj(&mut self, id: ObjId) {
        crate::refcount::decref_obj(self, id);
    }

    pub(crate) fn decref_str(&mut self, id: StrId) {
        crate::refcount::decref_str(self, id);
    }

    pub(crate) fn decref_buf(&mut self, id: BufId) {
        crate::refcount::decref_buf(self, id);
    }

    // ----------------------------------------------------------------
    // Cell teardown (list/table bookkeeping done by callers)
    // ----------------------------------------------------------------

    /// Free a string cell's data block and slab slot. The caller has
    /// already removed it from the string table and cache.
    pub(crate) fn free_string_cell(&mut self, id: StrId) {
        let data = self.hstr_mut(id).take_data();
        alloc::free(self, data);
        self.strings.remove(id.raw());
    }

    /// Free a buffer cell's data block and slab slot. The caller has
    /// already unlinked it from the allocated list.
    pub(crate) fn free_buffer_cell(&mut self, id: BufId) {
        let data = self.hbuf_mut(id).take_data();
        alloc::free(self, data);
        self.buffers.remove(id.raw());
    }

    /// Free an object cell's property block and slab slot. The caller has
    /// already unlinked it and dropped outbound references.
    pub(crate) fn free_object_cell(&mut self, id: ObjId) {
        let block = self.hobj_mut(id).props.take_block();
        alloc::free(self, block);
        self.objects.remove(id.raw());
    }

    /// Clear string-cache entries referencing `id` (string going away).
    pub(crate) fn strcache_invalidate(&mut self, id: StrId) {
        for e in self.strcache.iter_mut() {
            if e.h == Some(id) {
                *e = StrCacheEntry::default();
            }
        }
    }

    // ----------------------------------------------------------------
    // Introspection used by tests and the dump module
    // ----------------------------------------------------------------

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn string_count(&self) -> usize {
        self.strings.len()
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Current activation of the current thread, if any.
    pub(crate) fn curr_activation(&self) -> Option<&Activation> {
        self.thr().callstack.last()
    }

    /// Run a voluntary mark-and-sweep cycle now.
    pub fn gc(&mut self) {
        crate::markandsweep::run(self, 0);
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        // Free every raw block still owned through the host allocator.
        for id in self.strings.ids() {
            let data = self.hstr_mut(StrId::new(id)).take_data();
            self.alloc.raw_free(data);
        }
        for id in self.buffers.ids() {
            let data = self.hbuf_mut(BufId::new(id)).take_data();
            self.alloc.raw_free(data);
        }
        for id in self.objects.ids() {
            let block = self.hobj_mut(ObjId::new(id)).props.take_block();
            self.alloc.raw_free(block);
        }
    }
}

/// Index-ordered table of all builtin strings; must stay in sync with
/// `Bstr`'s discriminants.
const BSTR_TABLE: [Bstr; BSTR_COUNT] = [
    Bstr::Empty,
    Bstr::Length,
    Bstr::Prototype,
    Bstr::Constructor,
    Bstr::Message,
    Bstr::Name,
    Bstr::FileName,
    Bstr::LineNumber,
    Bstr::Callee,
    Bstr::Caller,
    Bstr::Arguments,
    Bstr::Eval,
    Bstr::Undefined,
    Bstr::Null,
    Bstr::True,
    Bstr::False,
    Bstr::Function,
    Bstr::Nan,
    Bstr::Infinity,
    Bstr::ObjObject,
    Bstr::Error,
    Bstr::EvalError,
    Bstr::RangeError,
    Bstr::ReferenceError,
    Bstr::SyntaxError,
    Bstr::TypeError,
    Bstr::UriError,
    Bstr::UnimplementedError,
    Bstr::UnsupportedError,
    Bstr::InternalError,
    Bstr::AllocError,
    Bstr::AssertionError,
    Bstr::ApiError,
    Bstr::UncaughtError,
    Bstr::DoubleError,
    Bstr::IntValue,
    Bstr::IntMap,
    Bstr::IntVarenv,
    Bstr::IntLexenv,
    Bstr::IntRegbase,
    Bstr::IntThread,
    Bstr::IntFinalizer,
    Bstr::IntCallee,
    Bstr::IntTarget,
    Bstr::IntThis,
    Bstr::IntArgs,
    Bstr::IntFormals,
    Bstr::IntName,
    Bstr::IntSource,
    Bstr::IntPc2line,
    Bstr::IntTracedata,
    Bstr::IntNext,
    Bstr::IntEnumKeys,
    Bstr::IntVarmap,
    Bstr::ValueOf,
    Bstr::ToString,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_init_roots() {
        let heap = Heap::new();
        assert!(heap.heap_thread.is_some());
        assert_eq!(heap.curr_thread, heap.heap_thread);
        assert!(heap.stash.is_some());
        // heap thread, global, global env, thrower, stash at minimum
        assert!(heap.object_count() >= 5);
        assert_eq!(heap.builtin_strs.len(), BSTR_COUNT);
    }

    #[test]
    fn test_bstr_lookup() {
        let heap = Heap::new();
        let len = heap.bstr(Bstr::Length);
        assert_eq!(heap.hstr(len).as_bytes(), b"length");
        let internal = heap.bstr(Bstr::IntValue);
        assert!(heap.hstr(internal).is_internal());
    }

    #[test]
    fn test_reserved_word_flags() {
        let mut heap = Heap::new();
        let id = crate::strtab::intern(&mut heap, b"while");
        assert!(heap.hstr(id).is_reserved_word());
        let id2 = crate::strtab::intern(&mut heap, b"arguments");
        assert!(heap.hstr(id2).is_eval_or_arguments());
        let id3 = crate::strtab::intern(&mut heap, b"banana");
        assert!(!heap.hstr(id3).is_reserved_word());
    }

    #[test]
    fn test_push_and_truncate_refcounts() {
        let mut heap = Heap::new();
        let s = crate::strtab::intern(&mut heap, b"xyzzy");
        let rc0 = heap.hstr(s).hdr.refcount;
        heap.push(TVal::string(s)).unwrap();
        heap.push(TVal::string(s)).unwrap();
        assert_eq!(heap.hstr(s).hdr.refcount, rc0 + 2);
        let bottom = heap.thr().valstack_bottom;
        heap.truncate_to(bottom);
        assert_eq!(heap.hstr(s).hdr.refcount, rc0);
    }
}
