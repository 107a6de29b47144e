//! Response header rewriting: what a proxy must strip, what it must stamp.

use http::{StatusCode, Uri};

/// Headers scoped to a single connection; forwarding them would be lying.
const HOP_BY_HOP: [&[u8]; 4] = [
    b"transfer-encoding",
    b"keep-alive",
    b"connection",
    b"proxy-connection",
];

pub(crate) fn is_hop_by_hop(name: &[u8]) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// `200 OK`-style status string, as SPDY's `:status` carries it.
pub(crate) fn status_string(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("{} {}", status.as_u16(), reason),
        None => status.as_u16().to_string(),
    }
}

/// A via token for this hop: `<major>.<minor> <server-name>`.
fn via_token(version: (u8, u8), server_name: &str) -> String {
    format!("{}.{} {}", version.0, version.1, server_name)
}

/// The outgoing `via` value: whatever came in, plus our token.
pub(crate) fn append_via_token(existing: &[u8], version: (u8, u8), server_name: &str) -> String {
    let token = via_token(version, server_name);
    if existing.is_empty() {
        token
    } else {
        format!("{}, {}", String::from_utf8_lossy(existing), token)
    }
}

/// Rewrites a `location` value whose authority is the origin-internal one
/// to the externally visible authority. Other hosts, relative references
/// and unparsable values pass through (`None`).
pub(crate) fn rewrite_location(
    value: &[u8],
    downstream_authority: &str,
    rewrite_authority: &str,
) -> Option<String> {
    let s = std::str::from_utf8(value).ok()?;
    let uri: Uri = s.parse().ok()?;
    let authority = uri.authority()?;
    if !authority.as_str().eq_ignore_ascii_case(downstream_authority) {
        return None;
    }
    let scheme = uri.scheme_str().unwrap_or("http");
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    Some(format!("{scheme}://{rewrite_authority}{path_and_query}"))
}

/// Minimal HTML body for synthesized error responses.
pub(crate) fn error_html(status: StatusCode) -> String {
    let line = status_string(status);
    format!("<html><head><title>{line}</title></head><body><h1>{line}</h1></body></html>")
}
