//! Chronos Rust Client
//!
//! A Rust client library for the Chronos time-tracking API, with persistent
//! token storage, photo check-in/check-out uploads, and single-flight token
//! refresh when the access token expires.

pub mod client;
pub mod config;
pub mod endpoints;
pub mod error;
mod refresh;
pub mod session;
pub mod token_store;
pub mod types;

pub use client::{ApiClient, RequestOptions, REFRESH_ENDPOINT};
pub use config::ClientConfig;
pub use endpoints::Photo;
pub use error::{ApiError, AuthFailure, Result, StorageError};
pub use session::Session;
pub use token_store::{FileTokenStorage, MemoryTokenStorage, TokenStorage};
pub use types::*;
