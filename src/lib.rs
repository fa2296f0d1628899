//! Upload Server Library
//!
//! Resumable uploads (tus 1.0.0) over S3-compatible or local storage.
//! The server binary is in main.rs.
//!
//! # Modules
//!
//! - `upload`: Protocol engine, session stores, storage adapters and hooks
//! - `routes`: HTTP surface for each mount
//! - `storage`: S3 client

pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod state;
pub mod storage;
pub mod upload;
