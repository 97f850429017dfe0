//! crawl-access - adaptive access control for crawling bot-defended sites.
//!
//! Classifies every fetch attempt, climbs a fixed strategy ladder only when a
//! page was not really served, and routes URLs that defeat automation to a
//! durable manual-review queue.

pub mod access;
pub mod cli;
pub mod config;
pub mod content;
pub mod escalation;
pub mod playbook;
pub mod recon;
pub mod record;
pub mod report;
pub mod transport;
pub mod utils;
