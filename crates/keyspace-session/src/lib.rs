//! The unit-of-work session, query executor, and polymorphic directory
//! layer:
//!
//! - [`session`]: stages inserts/deletes across any number of registered
//!   record types and applies them as a single grouped commit (§4.I).
//! - [`query`]: range-scan or index-assisted reads, with a residual
//!   predicate, sort/limit/offset, count, and cursor pagination (§4.J).
//! - [`polymorphic`]: the shared-directory dual-write mirror for types
//!   conforming to a [`keyspace_core::PolymorphicProtocol`] (§4.K).

#![warn(missing_docs)]

pub mod polymorphic;
pub mod query;
pub mod session;

pub use polymorphic::ProtocolSubspace;
pub use query::{IndexHint, Query, QuerySubspaces};
pub use session::{Session, SessionSubspaces};
