//! Common utilities for the decoder pipeline.
//!
//! Currently just the buffered forward-only byte source; the demultiplexers
//! share it for files and pipes alike.

/// Forward-only buffered byte source with position tracking.
pub mod source;

pub use source::TivoSource;
