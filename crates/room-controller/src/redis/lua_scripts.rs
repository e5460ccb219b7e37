//! Lua scripts for generation-fenced presence writes.
//!
//! Every room incarnation carries a generation. A write from an older
//! generation than the one stored is rejected, so a room still tearing down
//! cannot overwrite or delete what its successor published.
//!
//! Return values: `1` applied, `0` stale generation, `-1` bad arguments.

/// Publish a presence document.
///
/// KEYS[1] = generation key, KEYS[2] = presence key,
/// KEYS[3] = instance rooms set.
/// ARGV[1] = generation, ARGV[2] = document, ARGV[3] = TTL seconds,
/// ARGV[4] = session id.
pub const FENCED_PUBLISH: &str = r#"
local current_gen = redis.call('GET', KEYS[1])
local expected_gen = tonumber(ARGV[1])
local ttl = tonumber(ARGV[3])

if expected_gen == nil or ttl == nil then
    return -1
end

if current_gen ~= nil and current_gen ~= false then
    local current = tonumber(current_gen)
    if current == nil then
        return -1
    end
    if expected_gen < current then
        return 0
    end
end

redis.call('SET', KEYS[1], expected_gen, 'EX', ttl)
redis.call('SET', KEYS[2], ARGV[2], 'EX', ttl)
redis.call('SADD', KEYS[3], ARGV[4])
return 1
"#;

/// Remove a presence document. The generation key stays (until its TTL) so
/// later stale publishes are still rejected.
///
/// KEYS[1] = generation key, KEYS[2] = presence key,
/// KEYS[3] = instance rooms set.
/// ARGV[1] = generation, ARGV[2] = session id.
pub const FENCED_CLEAR: &str = r#"
local current_gen = redis.call('GET', KEYS[1])
local expected_gen = tonumber(ARGV[1])

if expected_gen == nil then
    return -1
end

if current_gen ~= nil and current_gen ~= false then
    local current = tonumber(current_gen)
    if current == nil then
        return -1
    end
    if expected_gen < current then
        return 0
    end
end

redis.call('DEL', KEYS[2])
redis.call('SREM', KEYS[3], ARGV[2])
return 1
"#;
