//! services/api/src/web/middleware.rs
//!
//! Request identity extraction.

use axum::{extract::Request, http::HeaderMap, middleware::Next, response::Response};
use story_engine_core::RequestContext;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const DEVICE_ID_HEADER: &str = "x-device-id";

/// The device a request was made from, empty when the header is absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceId(pub String);

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

pub fn request_context(headers: &HeaderMap) -> RequestContext {
    RequestContext {
        auth_user: header_value(headers, USER_ID_HEADER),
    }
}

/// Middleware that reads the caller's identity headers.
///
/// Anonymous requests are allowed; handlers receive a `RequestContext` without a
/// user and an empty `DeviceId`.
pub async fn identify(mut req: Request, next: Next) -> Response {
    let ctx = request_context(req.headers());
    let device = DeviceId(header_value(req.headers(), DEVICE_ID_HEADER).unwrap_or_default());
    req.extensions_mut().insert(ctx);
    req.extensions_mut().insert(device);
    next.run(req).await
}
