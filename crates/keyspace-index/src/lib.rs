//! Scalar and unique secondary index maintenance.
//!
//! See [`maintainer`] for the index maintainer itself; [`IndexState`]
//! models the `Disabled` → `WriteOnly` → `Readable` build lifecycle a
//! newly declared index goes through before the query executor may rely
//! on it.

#![warn(missing_docs)]

pub mod maintainer;

pub use maintainer::{IndexMaintainer, IndexState};
