//! Error taxonomy for store and tree operations.
//!
//! "Not found" is deliberately absent: a missing key is a result value
//! (a null or tombstoned tagged pointer), not an error.

use thiserror::Error;

use crate::tree::{ALLOC_RETRY_CNT, MAX_KEY_LEN};
use crate::VALUE_LEN;

/// Errors surfaced by [`FamKv`](crate::FamKv) and [`RadixTree`](crate::RadixTree).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Key length exceeds [`MAX_KEY_LEN`].
    #[error("key length {0} exceeds maximum of {max}", max = MAX_KEY_LEN)]
    KeyTooLong(usize),

    /// Value is not exactly [`VALUE_LEN`] bytes.
    #[error("value length {0} is not exactly {len} bytes", len = VALUE_LEN)]
    ValueSize(usize),

    /// The global heap kept reporting allocation failure for the whole
    /// retry budget. The failing operation has been rolled back.
    #[error("global heap allocation failed after {retries} attempts", retries = ALLOC_RETRY_CNT)]
    OutOfSpace,

    /// Scan handle does not refer to an open iterator.
    #[error("scan handle {0} is not open")]
    BadHandle(usize),
}
