//! Core data models for the blob gallery.
//!
//! These are the shapes that cross the HTTP boundary. They serialize as
//! camelCase JSON via `serde` so the frontend can consume them directly.

pub mod object;
