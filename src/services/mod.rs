//! Operations composed from several storage calls.

pub mod rename;
