//! Executor seam
//!
//! The parser, compiler, and bytecode executor are collaborators of the
//! runtime core, not part of it. They plug in through this trait; the
//! call handler and the `compile`/`eval` API delegate to the installed
//! instance. With no executor installed those operations throw
//! `UnimplementedError`.

use crate::error::Unwind;
use crate::heap::Heap;

/// Compile flags for [`Executor::compile`].
pub const COMPILE_EVAL: u32 = 1 << 0;
pub const COMPILE_STRICT: u32 = 1 << 1;
/// Compile a function expression instead of a program.
pub const COMPILE_FUNCEXPR: u32 = 1 << 2;

pub trait Executor {
    /// Compile source to a callable. On entry the value stack holds
    /// `[... source filename]`; on success both are replaced by one
    /// compiled function object.
    fn compile(&self, heap: &mut Heap, flags: u32) -> Result<(), Unwind>;

    /// Execute the current thread's topmost activation (a compiled
    /// function) until execution would exit the entry-level activation.
    /// Longjmp-style escapes that cross the entry activation propagate as
    /// `Err`; the call handler restores invariants.
    fn execute(&self, heap: &mut Heap) -> Result<(), Unwind>;
}
