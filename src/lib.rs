//! pkiadm - local PKI administration daemon
//!
//! A long-running daemon that manages a small in-house PKI as a typed
//! resource graph. Operators register private keys, public keys, subjects,
//! serial generators, CSRs, certificates, CAs and file export locations by
//! name; the daemon derives the cryptographic artefacts on demand, tracks
//! the dependencies between them and re-derives everything downstream
//! whenever an upstream resource changes.
//!
//! # Architecture
//!
//! ```text
//! client ──unix socket──▶ server ──mutex──▶ storage (graph + persistence)
//!                                              │
//!                          scheduler ──timer──▶ refresh due resources
//! ```
//!
//! - [`resources`] holds the eight variants and their refresh semantics.
//! - [`storage`] owns the variant tables, the reverse dependency index,
//!   the transitive update engine and the single-document persistence.
//! - [`server`] serialises every request under one mutex and folds all
//!   errors into the reply payload.
//! - [`scheduler`] drives time-based re-derivation with one re-armable
//!   timer.
//! - [`crypto`] is the only module that touches key material (openssl).
//!
//! The daemon binary lives in `src/main.rs` and is built as `pkiadmd`.

pub mod api;
pub mod config;
pub mod crypto;
pub mod error;
pub mod resources;
pub mod scheduler;
pub mod server;
pub mod storage;

pub use error::{Error, Result};
