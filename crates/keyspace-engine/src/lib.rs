//! The container (§4.L): wires the directory layer, read-version cache,
//! and per-container configuration together into the entry point an
//! application constructs its sessions and queries from.
//!
//! - [`container`]: [`Container`], the shared-services handle.
//! - [`config`]: [`ContainerConfig`], the resolved retry/limits values a
//!   container is built with.

#![warn(missing_docs)]

pub mod config;
pub mod container;

pub use config::ContainerConfig;
pub use container::Container;
