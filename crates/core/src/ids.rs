//! Typed heap references
//!
//! Heap cells are addressed by 32-bit slab indices instead of raw pointers.
//! The ids fit the packed cell's payload on every platform and keep the
//! collector's intrusive-list bookkeeping free of owning pointers.
//!
//! Ids carry no generation counter: like a raw pointer in a C engine, a
//! stale id is a bug in reference-count maintenance, not a recoverable
//! condition.

use std::fmt;

macro_rules! heap_id {
    ($(#[$doc:meta])* $name:ident, $short:literal) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u32);

        impl $name {
            #[inline]
            pub const fn new(raw: u32) -> Self {
                Self(raw)
            }

            #[inline]
            pub const fn raw(self) -> u32 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($short, "#{}"), self.0)
            }
        }
    };
}

heap_id!(
    /// Reference to an interned string cell.
    StrId,
    "str"
);
heap_id!(
    /// Reference to an object cell (plain object, function, env record, thread).
    ObjId,
    "obj"
);
heap_id!(
    /// Reference to a buffer cell (fixed or dynamic).
    BufId,
    "buf"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_roundtrip() {
        let s = StrId::new(7);
        assert_eq!(s.raw(), 7);
        assert_eq!(s, StrId::new(7));
        assert_ne!(s, StrId::new(8));
    }

    #[test]
    fn test_debug_format() {
        assert_eq!(format!("{:?}", ObjId::new(3)), "obj#3");
        assert_eq!(format!("{:?}", BufId::new(0)), "buf#0");
    }
}
