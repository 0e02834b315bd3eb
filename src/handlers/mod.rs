//! HTTP request handlers
//!
//! - `api` - Health check endpoint
//! - `speak` - Text-to-speech REST API
//! - `stats` - Utilization statistics and manual recycle

pub mod api;
pub mod speak;
pub mod stats;
