//! Passive HTTP traffic visibility
//!
//! Reconstructs ordered TCP byte streams from captured frames and reports a
//! summary of every HTTP message framed on them, without terminating,
//! proxying, or modifying any connection.

pub mod capture;
pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod packet;
pub mod reassembly;
pub mod report;
pub mod stream;

pub use config::Config;
pub use engine::Engine;
pub use error::{Result, TapError};
