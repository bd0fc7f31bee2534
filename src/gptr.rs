//! Global and tagged pointers.
//!
//! A [`Gptr`] names a location in the shared heap; it is meaningful to every
//! process attached to the same heap and is only turned into a local address
//! at the moment of access. A [`TagGptr`] pairs a pointer with a generation
//! counter so external caches can detect that a value slot has moved through
//! one or more transitions since it was last read.

/// Opaque 64-bit handle for a location in global memory. `0` is null.
///
/// Equality is bitwise. The handle stays valid for the lifetime of the heap
/// it was allocated from; it must never be interpreted as a local address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Gptr(u64);

impl Gptr {
    /// The null pointer.
    pub const NULL: Gptr = Gptr(0);

    /// Build a pointer from its raw 64-bit representation.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Gptr(raw)
    }

    /// Raw 64-bit representation.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// True for the null pointer.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// True for any non-null pointer.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Debug for Gptr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Gptr({:#x})", self.0)
    }
}

/// A (pointer, version) pair: the unit of the cache-consistency protocol.
///
/// The version is a per-slot generation counter. Every transition that
/// changes the slot's pointer increments it by exactly one, so two tagged
/// pointers are interchangeable as cache keys only when both fields match.
///
/// A tagged pointer with a null `gptr` and a non-zero `version` is a
/// *tombstone*: the slot has existed but currently holds no value.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[repr(C)]
pub struct TagGptr {
    /// The value pointer; null if the slot is empty or tombstoned.
    pub gptr: Gptr,
    /// Generation counter; 0 only if the slot has never held a value.
    pub version: u64,
}

impl TagGptr {
    /// Null pointer with version 0: "the key node did not exist".
    #[inline]
    pub const fn null() -> Self {
        TagGptr {
            gptr: Gptr::NULL,
            version: 0,
        }
    }

    /// True iff the slot currently holds a value.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.gptr.is_valid()
    }

    /// True iff the slot has held a value before but holds none now.
    #[inline]
    pub const fn is_tombstone(self) -> bool {
        self.gptr.is_null() && self.version != 0
    }
}
