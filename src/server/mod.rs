//! HTTP server layer for the image resizer.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         HTTP Layer                              │
//! │      GET /{prefix}/{path}.{ext}?width=&height=&quality=         │
//! │                                                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐  │
//! │  │  handlers   │  │  protocol   │  │        routes           │  │
//! │  │ (middleware)│  │ (matching,  │  │  (router config)        │  │
//! │  │             │  │ validators) │  │                         │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod handlers;
pub mod protocol;
pub mod routes;

pub use handlers::{
    health_handler, not_found_handler, resize_middleware, AppState, ErrorResponse, HandlerError,
    HealthResponse, X_RESIZE_CACHE,
};
pub use protocol::{Bounds, ResizeQuery};
pub use routes::{create_router, RouterConfig, DEFAULT_CACHE_MAX_AGE, DEFAULT_MAX_DIMENSION};
