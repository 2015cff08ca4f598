//! Cloud-render node pool manager library.
//!
//! This crate primarily ships a `node-pool` binary, but exposes its modules
//! to enable integration testing and reuse.

pub mod admission;
pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod model;
pub mod notifier;
pub mod persistence;
pub mod pool;
pub mod reconciler;
pub mod registry;
pub mod session;
pub mod state;
pub mod sweeper;
