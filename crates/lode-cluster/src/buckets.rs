//! Key to bucket mapping.
//!
//! Every region splits its keyspace into a fixed number of buckets chosen
//! at creation. A key's bucket is the CRC32 of its routing portion modulo
//! the bucket count, identical on every member.

/// Extracts the part of a key that decides its bucket.
///
/// A non-empty `{tag}` colocates related keys: only the tag is hashed.
/// The tag is the content between the first `{` and the first `}` after it.
///
/// - `order:{42}:lines` → hashes `42`
/// - `{cust}:7` → hashes `cust`
/// - `a{}b` → hashes `a{}b` (empty tag)
/// - `a{b` → hashes `a{b` (unterminated)
pub fn routing_key(key: &[u8]) -> &[u8] {
    let Some(open) = key.iter().position(|&b| b == b'{') else {
        return key;
    };
    let after_open = &key[open + 1..];
    let Some(close) = after_open.iter().position(|&b| b == b'}') else {
        return key;
    };
    if close == 0 {
        return key;
    }
    &after_open[..close]
}

/// Maps a key to its bucket in `[0, bucket_count)`.
///
/// Returns 0 when `bucket_count` is zero; region configs reject that value
/// before any key is routed.
pub fn bucket_for_key(key: &[u8], bucket_count: u32) -> u32 {
    if bucket_count == 0 {
        return 0;
    }
    crc32fast::hash(routing_key(key)) % bucket_count
}
