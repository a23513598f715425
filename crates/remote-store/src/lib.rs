//! reqwest-backed implementation of the core [`RemoteStore`] trait for a
//! PostgREST-style REST backend.
//!
//! [`RemoteStore`]: ledgerpouch_core::sync::RemoteStore

mod client;
mod error;

pub use client::RestStore;
pub use error::{ApiRetryClass, RemoteStoreError, Result};
