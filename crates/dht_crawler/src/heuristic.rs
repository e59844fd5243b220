use krpc_encoding::U160;

/// Best-effort scan for the fields the `find_node`-compatibility fallback
/// needs (spec.md §4.2), without requiring the datagram to parse as a
/// well-formed KRPC message: a dict key in bencode is always a
/// length-prefixed string (`"<namelen>:<name>"`) immediately followed by
/// its value, so scanning for the key's literal bytes and then parsing
/// one bencode string after it is reliable for the handful of keys this
/// heuristic cares about.
///
/// Returns `(transaction_id, target_or_info_hash)` when both a `t` key
/// and either an `info_hash` or `target` key (each a 20-byte string) are
/// present anywhere in the datagram.
pub fn guess_unknown_query(bytes: &[u8]) -> Option<(Vec<u8>, U160)> {
    let transaction_id = find_key_string_value(bytes, "t")?;
    let target_bytes = find_key_string_value(bytes, "info_hash")
        .or_else(|| find_key_string_value(bytes, "target"))?;
    let target = U160::from_raw_bytes(&target_bytes).ok()?;
    Some((transaction_id, target))
}

fn find_key_string_value(bytes: &[u8], key: &str) -> Option<Vec<u8>> {
    let marker = format!("{}:{}", key.len(), key);
    let pos = find(bytes, marker.as_bytes())?;
    parse_bencode_string(&bytes[pos + marker.len()..])
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_bencode_string(bytes: &[u8]) -> Option<Vec<u8>> {
    let colon = bytes.iter().position(|&b| b == b':')?;
    let len: usize = std::str::from_utf8(&bytes[..colon]).ok()?.parse().ok()?;
    let start = colon + 1;
    let end = start.checked_add(len)?;
    if bytes.len() < end {
        return None;
    }
    Some(bytes[start..end].to_vec())
}
