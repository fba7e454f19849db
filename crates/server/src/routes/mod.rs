mod clusters;
pub mod events;
mod health;
mod tasks;

pub use clusters::*;
pub use health::*;
pub use tasks::*;

use axum::http::HeaderMap;
use orchestrator::RequestContext;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const ORG_HEADER: &str = "x-org";
pub const USER_HEADER: &str = "x-user";

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Caller identity from request headers; a missing or malformed request id gets a fresh one.
pub fn request_context(headers: &HeaderMap) -> RequestContext {
    let mut ctx = RequestContext::new();
    if let Some(id) = header(headers, REQUEST_ID_HEADER).and_then(|v| v.parse::<Uuid>().ok()) {
        ctx = ctx.with_request_id(id);
    }
    if let Some(agent) = header(headers, "user-agent") {
        ctx = ctx.with_user_agent(agent);
    }
    if let Some(org) = header(headers, ORG_HEADER) {
        ctx = ctx.with_org(org);
    }
    if let Some(user) = header(headers, USER_HEADER) {
        ctx = ctx.with_user(user);
    }
    ctx
}
