//! Memory management substrate for a managed-language runtime.
//!
//! Owns the raw memory behind the runtime's heap nursery, execution
//! stack and code objects, together with the page-level metadata a
//! tracing collector needs: per-page segment tags, per-page dirty
//! flags and a single-page recycling cache.
pub mod error;
pub mod memory;
