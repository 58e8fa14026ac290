//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, middleware stack)
//!     → request.rs (assign x-request-id)
//!     → interceptor.rs (root span, request metrics)
//!     → handlers.rs (endpoint logic, simulated user store)
//!     → error.rs (failures as {"detail": ...})
//!     → Send to client
//! ```

pub mod error;
pub mod handlers;
pub mod interceptor;
pub mod request;
pub mod server;

pub use error::ApiError;
pub use interceptor::{
    InboundRequest, InFlightRequest, Outcome, RequestContext, RequestInterceptor, StatusClass,
};
pub use request::X_REQUEST_ID;
pub use server::{AppState, HttpServer};
