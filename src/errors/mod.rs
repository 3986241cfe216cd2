//! Centralized error handling for the stream scheduler
//!
//! Every layer reports failures through [`AppError`]. The variants follow the
//! lifecycle taxonomy: input problems are `Validation`, a busy stream key is
//! `Conflict`, the encoder failing to start is `Spawn`, the encoder dying on
//! its own is `Runtime`, unknown keys are `NotFound` and durable store
//! failures are `Persistence`.
//!
//! # Usage
//!
//! ```rust
//! use stream_scheduler::errors::{AppError, AppResult};
//!
//! fn require_title(title: &str) -> AppResult<()> {
//!     if title.trim().is_empty() {
//!         return Err(AppError::validation("title is required"));
//!     }
//!     Ok(())
//! }
//! ```

pub mod types;

pub use types::*;

/// Convenience type alias for Results using AppError
pub type AppResult<T> = Result<T, AppError>;
