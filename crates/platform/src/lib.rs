//! # Kestrel Platform
//!
//! Shared platform types for the Kestrel SSH engine.
//!
//! This crate provides the unified error type (`KestrelError`, `KestrelResult`)
//! used by every protocol layer, including the `WouldBlock` signal that the
//! non-blocking engine uses for resumable I/O.
//!
//! # Examples
//!
//! ```
//! use kestrel_platform::{KestrelError, KestrelResult};
//!
//! fn example_function() -> KestrelResult<String> {
//!     Ok("Hello, Kestrel!".to_string())
//! }
//!
//! # fn main() -> KestrelResult<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, Kestrel!");
//! assert!(KestrelError::WouldBlock.is_would_block());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{KestrelError, KestrelResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
