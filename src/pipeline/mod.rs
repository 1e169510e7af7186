//! Request-side stages that run before and around an engine session.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ gate ──▶ filters (import) ──▶ engine load ──▶ filters (export) ──▶ store
//! (body/url)          (content type)                      (document service)
//! ```
//!
//! 1. [`input`]   — capture the body or resolve the `url=` reference; runs on
//!    the async runtime
//! 2. [`filters`] — pure lookups used inside the blocking session: import
//!    filter by content type, export filter by document service and format

pub mod filters;
pub mod input;
