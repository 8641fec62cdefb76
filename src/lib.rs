//! calibre-web-rs: a small web backend for a personal Calibre library.
//!
//! The Calibre `metadata.db` lives in Dropbox (or a local folder standing
//! in for it). The server keeps a local copy current and answers
//! paginated listings, searches and book details from it, and proxies
//! covers, book files and download links from the store.
//!
//! # Features
//!
//! - Single shared-secret authentication
//! - Library path validation with suggestions
//! - Conditional, atomic database sync (store or public shared link)
//! - Book listing, search, detail and facet queries
//! - Batched cover thumbnails
//! - Fixture generator for a Calibre-shaped test library

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Shared-secret authentication.
pub mod auth;
/// Queries against the synced Calibre database.
pub mod catalog;
/// Configuration and CLI.
pub mod config;
/// Error types.
pub mod error;
/// Sample library generator.
pub mod fixtures;
/// Book file formats.
pub mod formats;
/// Library path validation.
pub mod library;
/// HTTP server.
pub mod server;
/// Remote store clients.
pub mod storage;
/// Database sync engine.
pub mod sync;

#[cfg(test)]
mod tests;

pub use config::{Cli, Command, Config};
pub use error::{AppError, Result};
pub use server::AppState;
