//! Request and response model.
//!
//! # Data Flow
//! ```text
//! Caller builds Request (method, url, headers, body, cancel signal)
//!     → request.rs (validate, split into head + body + signal)
//!     → codec encodes the head, conn layer streams the body
//!     → body.rs (body closed on the request's own task)
//!     → response.rs (buffered response handed back)
//! ```

pub mod body;
pub mod request;
pub mod response;

pub use body::{BodyCloser, BoxBody, Empty, Full, RequestBody};
pub use request::{Headers, Request, RequestHead};
pub use response::{Response, ResponseHead};
