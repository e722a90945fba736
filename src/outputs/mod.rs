//! Output generation.
//!
//! - [`json`]: writes finished articles to dated JSON files for API
//!   consumption

pub mod json;
