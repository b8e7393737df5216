//! EVENT/1.0 notification frames

use serde_json::json;

/// Serialize one coalesced notification frame.
///
/// Events are HTTP-shaped but use the `EVENT/1.0` protocol tag so
/// controllers can tell them apart from responses on the same session.
pub(crate) fn encode_event(objects: &[serde_json::Value]) -> Vec<u8> {
    let body = json!({ "characteristics": objects }).to_string();
    let mut output = Vec::with_capacity(96 + body.len());
    output.extend_from_slice(b"EVENT/1.0 200 OK\r\n");
    output.extend_from_slice(b"Content-Type: application/hap+json\r\n");
    output.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    output.extend_from_slice(body.as_bytes());
    output
}
