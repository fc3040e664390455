//! Whisper session - server-side session tokens
//!
//! This library issues opaque bearer tokens, stores only their SHA-256
//! digests, and validates them with a sliding 30-day expiry.

pub mod config;
pub mod db;
pub mod models;
pub mod services;
