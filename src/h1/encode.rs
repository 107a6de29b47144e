use bytes::{BufMut, BytesMut};

use crate::types::Headers;

/// Serializes a request head: start line, headers in order, terminator.
pub fn encode_request(
    method: &[u8],
    path: &[u8],
    version: (u8, u8),
    headers: &Headers,
    out: &mut BytesMut,
) {
    out.put_slice(method);
    out.put_u8(b' ');
    out.put_slice(path);
    match version {
        (1, 0) => out.put_slice(b" HTTP/1.0\r\n"),
        _ => out.put_slice(b" HTTP/1.1\r\n"),
    }
    for (name, value) in headers {
        out.put_slice(name);
        out.put_slice(b": ");
        out.put_slice(value);
        out.put_slice(b"\r\n");
    }
    out.put_slice(b"\r\n");
}
