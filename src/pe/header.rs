//! PE header construction/parsing and mutual-encoding selection (§4.4,
//! §6.3). Kept separate from [`super::engine`] since it's pure data
//! transformation with no reactor state.
use serde_json::{json, Map, Value};

use crate::codec::{compress, decompress};
use crate::error::PEError;

use super::request::PeRequest;

/// Build the JSON request header for a PE request. `mutual_encoding` is
/// `Some` only for Set/Subscribe bodies that needed it; a `Get` passes
/// `None` since it carries no body of its own.
pub fn request_header(request: &PeRequest, mutual_encoding: Option<&str>) -> Vec<u8> {
    let mut obj = Map::new();
    obj.insert("resource".to_string(), json!(request.resource));
    if let Some(res_id) = &request.res_id {
        obj.insert("resId".to_string(), json!(res_id));
    }
    if let Some(channel) = request.channel {
        obj.insert("channel".to_string(), json!(channel));
    }
    if let Some(offset) = request.offset {
        obj.insert("offset".to_string(), json!(offset));
    }
    if let Some(limit) = request.limit {
        obj.insert("limit".to_string(), json!(limit));
    }
    if let Some(encoding) = mutual_encoding {
        if encoding != "ASCII" {
            obj.insert("mutualEncoding".to_string(), json!(encoding));
        }
    }
    serde_json::to_vec(&Value::Object(obj)).unwrap_or_default()
}

/// Pick the cheapest mutual encoding that can carry `data` and encode it.
/// Bodies that are already 7-bit clean go out raw ("ASCII" in PE's naming);
/// anything else is Mcoded7-packed, additionally zlib-compressed once it
/// crosses `compression_threshold` bytes.
pub fn encode_body(data: &[u8], compression_threshold: usize) -> (Vec<u8>, &'static str) {
    if data.is_empty() {
        return (Vec::new(), "ASCII");
    }
    if data.iter().all(|byte| byte & 0x80 == 0) {
        return (data.to_vec(), "ASCII");
    }
    let (encoded, was_compressed) = compress(data, compression_threshold);
    if was_compressed {
        (encoded, "zlib+Mcoded7")
    } else {
        (encoded, "Mcoded7")
    }
}

/// Reverse [`encode_body`] given the `mutualEncoding` the reply header
/// declared.
pub fn decode_body(data: &[u8], mutual_encoding: &str) -> Result<Vec<u8>, PEError> {
    match mutual_encoding {
        "" | "ASCII" => Ok(data.to_vec()),
        "Mcoded7" => decompress(data, false).map_err(|e| PEError::InvalidResponse {
            reason: e.to_string(),
        }),
        "zlib+Mcoded7" => decompress(data, true).map_err(|e| PEError::InvalidResponse {
            reason: e.to_string(),
        }),
        other => Err(PEError::InvalidResponse {
            reason: format!("unrecognized mutualEncoding {other:?}"),
        }),
    }
}

/// Parse a reply/notify header. An empty header (common on non-first
/// chunks, and on a bare 2xx reply with nothing to say) is treated as
/// `{"status": 200}` rather than a parse failure.
pub fn parse_header(header: &[u8]) -> Result<Value, PEError> {
    if header.is_empty() {
        return Ok(json!({"status": 200}));
    }
    serde_json::from_slice(header).map_err(|e| PEError::InvalidResponse {
        reason: format!("header is not valid JSON: {e}"),
    })
}

/// Split a request header + encoded property body into `(header, property)`
/// chunk pairs that each fit within `max_sysex_size` (or a generous default
/// if the device's limit isn't known). The whole header always goes in the
/// first chunk; only the property body is split across the rest (§9 Open
/// Question 3).
pub fn split_for_chunking(
    max_sysex_size: Option<u32>,
    header: &[u8],
    property: &[u8],
) -> Vec<(Vec<u8>, Vec<u8>)> {
    const FRAME_OVERHEAD: usize = 32;
    const DEFAULT_MAX: usize = 4096;
    let budget = max_sysex_size
        .map(|n| n as usize)
        .unwrap_or(DEFAULT_MAX)
        .saturating_sub(FRAME_OVERHEAD)
        .max(64);

    if header.len() + property.len() <= budget {
        return vec![(header.to_vec(), property.to_vec())];
    }

    let mut chunks = Vec::new();
    let first_budget = budget.saturating_sub(header.len());
    let mut offset = first_budget.min(property.len());
    chunks.push((header.to_vec(), property[..offset].to_vec()));
    while offset < property.len() {
        let end = (offset + budget).min(property.len());
        chunks.push((Vec::new(), property[offset..end].to_vec()));
        offset = end;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_body_passes_through_unencoded() {
        let (encoded, label) = encode_body(b"hello", 128);
        assert_eq!(encoded, b"hello");
        assert_eq!(label, "ASCII");
    }

    #[test]
    fn high_bit_body_round_trips_through_mcoded7() {
        let data = vec![0xFFu8; 4];
        let (encoded, label) = encode_body(&data, 1024);
        assert_eq!(label, "Mcoded7");
        assert_eq!(decode_body(&encoded, label).unwrap(), data);
    }

    #[test]
    fn large_high_bit_body_gets_compressed() {
        let data = vec![0x80u8; 512];
        let (encoded, label) = encode_body(&data, 128);
        assert_eq!(label, "zlib+Mcoded7");
        assert_eq!(decode_body(&encoded, label).unwrap(), data);
    }

    #[test]
    fn empty_header_parses_as_status_200() {
        let value = parse_header(b"").unwrap();
        assert_eq!(value["status"], 200);
    }

    #[test]
    fn small_request_is_not_chunked() {
        let chunks = split_for_chunking(Some(256), b"{}", b"data");
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn oversized_request_splits_property_across_chunks() {
        let header = b"{\"resource\":\"X\"}".to_vec();
        let property = vec![b'A'; 500];
        let chunks = split_for_chunking(Some(128), &header, &property);
        assert!(chunks.len() > 1);
        assert_eq!(chunks[0].0, header);
        assert!(chunks[1..].iter().all(|(h, _)| h.is_empty()));
        let reassembled: Vec<u8> = chunks.iter().flat_map(|(_, p)| p.clone()).collect();
        assert_eq!(reassembled, property);
    }
}
