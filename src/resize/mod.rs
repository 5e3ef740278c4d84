//! Resize orchestration layer.
//!
//! [`ResizeService`] turns a [`ResizeRequest`] into a committed variant on
//! disk, rendering it at most once per cache key.

mod service;

pub use service::{
    ResizeOutcome, ResizePlan, ResizeRequest, ResizeService, ResizeSettings, SourceFile,
    DEFAULT_LOCK_TIMEOUT, DEFAULT_QUALITY,
};
