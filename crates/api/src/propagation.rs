//! Transaction id propagation over HTTP.
//!
//! Inbound requests carry the xid in the `transaction-id` header; the
//! middleware turns it into a [`TxContext`] request extension. Outbound
//! participant calls copy it back into the header.

use axum::extract::Request;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use common::Xid;
use saga::TxContext;
use tracing::Instrument;

use crate::error::ApiError;

/// Header carrying the global transaction id.
pub const XID_HEADER: &str = "transaction-id";

/// Reads the transaction context from request headers.
///
/// A missing or empty header means local work.
pub fn extract(headers: &HeaderMap) -> Result<TxContext, ApiError> {
    let Some(value) = headers.get(XID_HEADER) else {
        return Ok(TxContext::local());
    };

    let raw = value
        .to_str()
        .map_err(|_| ApiError::BadRequest(format!("{XID_HEADER} header is not valid UTF-8")))?;
    if raw.trim().is_empty() {
        return Ok(TxContext::local());
    }

    let xid = Xid::parse(raw)
        .map_err(|e| ApiError::BadRequest(format!("invalid {XID_HEADER} header: {e}")))?;
    Ok(TxContext::with_xid(xid))
}

/// Adds the transaction id of `ctx` to an outbound request.
pub fn inject(request: reqwest::RequestBuilder, ctx: &TxContext) -> reqwest::RequestBuilder {
    match ctx.current() {
        Some(xid) => request.header(XID_HEADER, xid.as_str()),
        None => request,
    }
}

/// Middleware binding the inbound xid for the duration of the request.
///
/// Handlers read it with `Extension<TxContext>`; the binding ends with the
/// request, whatever the outcome.
pub async fn bind_context(mut request: Request, next: Next) -> Result<Response, ApiError> {
    let ctx = extract(request.headers())?;

    let span = match ctx.current() {
        Some(xid) => tracing::info_span!("global_tx", xid = %xid),
        None => tracing::Span::none(),
    };
    request.extensions_mut().insert(ctx);

    Ok(next.run(request).instrument(span).await)
}
