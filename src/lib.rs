//! Adaptive, polite and failure-tolerant web crawling engine.
//!
//! Requests flow from a deduplicating [`storage::PersistentRequestQueue`]
//! through an autoscaled worker pool into a [`crawler::CrawlerEngine`],
//! which decides per host whether a plain HTTP fetch is enough or the page
//! has to be rendered in a browser.

pub mod autoscale;
pub mod browser;
pub mod cli;
pub mod config;
pub mod crawler;
pub mod diagnostics;
pub mod error;
pub mod jobs;
pub mod proxy;
pub mod session;
pub mod storage;
pub mod utils;

pub use config::EngineConfig;
pub use error::CrawlError;
