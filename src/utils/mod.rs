//! Shared utility functions.
//!
//! - `domain`: domain keys for per-domain state (queue, caches, playbooks)
//! - `mime`: deciding whether a response is an HTML page
//! - `atomic`: crash-safe replacement of small state files

mod atomic;
mod domain;
mod mime;

pub use atomic::write_atomic;
pub use domain::{domain_key, extract_domain};
pub use mime::{is_html_content_type, sniff_binary, PageKind};
