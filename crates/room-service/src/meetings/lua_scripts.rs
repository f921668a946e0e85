//! Lua scripts for atomic meeting document writes.
//!
//! Meetings are stored as one JSON document per meeting. Mutations read the
//! document, apply the change in Rust, and write it back with
//! [`COMPARE_AND_SWAP`]. A concurrent writer makes the swap fail and the
//! caller retries against the fresh document.

/// Lua script for inserting a new meeting.
///
/// Arguments:
/// - KEYS[1]: Document key (e.g., `meeting:{id}`)
/// - KEYS[2]: Room index key (e.g., `meeting:room:{room_id}`)
/// - ARGV[1]: Meeting document (JSON string)
/// - ARGV[2]: Meeting id
///
/// Returns:
/// - 1: Success
/// - 0: Meeting id already exists
/// - -1: Room id already bound to another meeting
pub const INSERT_MEETING: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end

if redis.call('EXISTS', KEYS[2]) == 1 then
    return -1
end

redis.call('SET', KEYS[1], ARGV[1])
redis.call('SET', KEYS[2], ARGV[2])
return 1
"#;

/// Lua script for compare-and-swap of a meeting document.
///
/// Arguments:
/// - KEYS[1]: Document key (e.g., `meeting:{id}`)
/// - ARGV[1]: Document the caller read (JSON string)
/// - ARGV[2]: Replacement document (JSON string)
///
/// Returns:
/// - 1: Success (document replaced)
/// - 0: Document changed since it was read
/// - -1: Document does not exist
pub const COMPARE_AND_SWAP: &str = r#"
local current = redis.call('GET', KEYS[1])

if current == nil or current == false then
    return -1
end

if current ~= ARGV[1] then
    return 0
end

redis.call('SET', KEYS[1], ARGV[2])
return 1
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripts_reference_expected_keys() {
        assert!(INSERT_MEETING.contains("KEYS[2]"));
        assert!(COMPARE_AND_SWAP.contains("ARGV[2]"));
        assert!(!COMPARE_AND_SWAP.contains("KEYS[2]"));
    }
}
