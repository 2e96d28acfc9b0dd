//! Eider Runtime: the engine core of an embeddable ECMAScript (E5.1) engine
//!
//! Key design principles:
//! - `TVal`: one tagged cell for any script value (from `eider-core`)
//! - `Heap`: one instance owns cells, threads, and interlocks; the same
//!   type is the host-facing `Context` with the value-stack API
//! - reference counting backed by a mark-and-sweep collector for cycles
//! - all control-flow escapes (throw, yield, resume, return) travel as
//!   one `Unwind` sum through `Result`, payloads parked in rooted slots
//!
//! # Modules
//!
//! - `heap`: heap state, cell slabs, longjmp state, builtin strings
//! - `alloc`: host allocator triple with GC-retry wrappers
//! - `refcount` / `markandsweep`: the two collectors and their work lists
//! - `strtab`: string interning (open addressing, weak entries)
//! - `hobject` / `proptable` / `props` / `enumerate`: the object model
//! - `env`: declarative/object environment records
//! - `call`: activations, tail calls, resume/yield
//! - `api_*`: the host-facing value-stack API (implemented on `Heap`)
//! - `numconv`: Dragon4 number↔string conversion
//! - `bytecode` / `executor`: persisted bytecode shapes and the
//!   compiler/executor seam
//! - `error`: taxonomy, throwing, augmentation
//! - `dump`: serde snapshots (feature `dump-json`)

pub mod alloc;
pub mod api_call;
pub mod api_coerce;
pub mod api_obj;
pub mod api_stack;
pub mod api_string;
pub mod api_var;
pub mod bytecode;
pub mod call;
pub mod coerce;
#[cfg(feature = "dump-json")]
pub mod dump;
pub mod enumerate;
pub mod env;
pub mod error;
pub mod executor;
pub mod hbuffer;
pub mod heap;
pub mod heaphdr;
pub mod hobject;
pub mod hstring;
pub mod hthread;
pub mod markandsweep;
pub mod numconv;
pub mod proptable;
pub mod props;
pub mod refcount;
pub mod slab;
pub mod strtab;
pub mod util;

// Re-export key types and functions
pub use eider_core::{BufId, ObjId, StrId, TVal, Tag};

pub use heap::{Bstr, Heap, LjKind};

/// The embedder-facing handle is the heap itself.
pub type Context = Heap;

pub use api_call::ExecStatus;
pub use api_stack::INVALID_INDEX;
pub use error::{ErrCode, Unwind};
pub use executor::{COMPILE_EVAL, COMPILE_FUNCEXPR, COMPILE_STRICT, Executor};
pub use hobject::{NativeFn, ObjClass};
pub use hthread::{
    CAT_FLAG_CATCH_BINDING_ENABLED, CAT_FLAG_CATCH_ENABLED, CAT_FLAG_FINALLY_ENABLED,
    CAT_FLAG_WITH_BINDING, CAT_TYPE_LABEL, CAT_TYPE_MASK, CAT_TYPE_TCF, ThreadState,
};
pub use props::PropDesc;

pub use alloc::{Allocator, FatalFn, default_fatal};
pub use coerce::Hint;

// Enumeration flags
pub use enumerate::{
    ENUM_ARRAY_INDICES_ONLY, ENUM_INCLUDE_INTERNAL, ENUM_INCLUDE_NONENUMERABLE,
    ENUM_OWN_PROPERTIES_ONLY, ENUM_SORT_ARRAY_INDICES,
};

// Bytecode container types (executor seam)
pub use bytecode::{BitDecoder, BitEncoder, Instr, PC2LINE_SKIP, pc2line_lookup};

// Coroutine and tail-call plumbing for executor implementations
pub use call::{
    handle_tailcall, native_thread_resume, native_thread_yield, resume_thread,
    unwind_native_escape,
};
