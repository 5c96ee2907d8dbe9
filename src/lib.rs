//! Artifact Shield - keeps classified files out of version control in
//! plaintext, and keeps version history short.

#![forbid(unsafe_code)]

pub mod audit;
pub mod batch;
pub mod cipher;
pub mod classify;
pub mod codec;
pub mod config;
pub mod container;
pub mod error;
pub mod history;
pub mod keys;
pub mod passphrase;
pub mod purge;
pub mod selftest;
