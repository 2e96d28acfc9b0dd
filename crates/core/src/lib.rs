//! Eider Core: value-representation primitives for an embeddable ECMAScript engine
//!
//! This crate holds the pieces every embedder-facing crate must agree on:
//!
//! - `TVal`: the polymorphic tagged value cell, in one of two build-time
//!   encodings sharing one accessor surface:
//!   - `packed` (default feature): 8-byte NaN-boxed cell
//!   - unpacked: explicit tag + payload cell for hosts where the packed
//!     payload width cannot hold a heap reference
//! - `Tag`: the closed kind set a cell can classify as
//! - `StrId` / `ObjId` / `BufId`: typed 32-bit heap references; the heap
//!   proper lives in `eider-runtime`, which resolves these ids
//!
//! No engine state lives here. Cells are plain `Copy` data; reference-count
//! maintenance for heap-referencing cells is the caller's responsibility.

pub mod ids;
pub mod tag;

#[cfg(feature = "packed")]
pub mod packed;
#[cfg(not(feature = "packed"))]
pub mod unpacked;

pub use ids::{BufId, ObjId, StrId};
pub use tag::Tag;

#[cfg(feature = "packed")]
pub use packed::{CANONICAL_NAN, TVal};
#[cfg(not(feature = "packed"))]
pub use unpacked::{CANONICAL_NAN, TVal};
