#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results,
    variant_size_differences
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Binary record builder and dotted-path accessor engine.
//!
//! `record` has two halves:
//! - [`mp`] builds msgpack maps/arrays of a priori unknown size with a
//!   single pass, by emitting the widest header form up front and
//!   patching the entry count in place on close.
//! - [`accessor`] compiles dotted-path patterns and removes the innermost
//!   matched key/value pair from a decoded record, leaving every other
//!   key untouched, re-encoding with [`mp`].

pub mod accessor;
pub mod mp;

pub use accessor::{AccessorMatcher, Outcome, Pattern};

use thiserror::Error as ThisError;

/// Errors raised while building or rewriting a record.
#[derive(ThisError, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// A container registered more entries than fit in a 32-bit count.
    #[error("container entry count overflowed 32 bits")]
    Overflow,
    /// The input was not a well-formed msgpack map at the top level.
    #[error("record is not a well-formed msgpack map")]
    BadRecord,
    /// An accessor pattern string was malformed.
    #[error("malformed accessor pattern")]
    BadPattern,
}
