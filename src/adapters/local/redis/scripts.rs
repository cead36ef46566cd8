//! Lua scripts behind the reliable queue. Each runs atomically on the server.
//!
//! Layout under the namespace:
//! - `tasks:pending`   list of ready task ids (LPUSH in, RPOP out)
//! - `tasks:leases`    zset of leased ids scored by lease deadline (ms)
//! - `tasks:scheduled` zset of released ids scored by ready time (ms)
//! - `task:<id>`       hash with `envelope`, `attempts`, `timeout_ms`, `token`
//!
//! The task hashes are addressed through a prefix argument, so these
//! scripts assume a single Redis node rather than a cluster.

use deadpool_redis::redis::Script;

/// KEYS: pending, leases, scheduled. ARGV: now_ms, token, task prefix.
/// Returns `{id, envelope, attempts}` or nil.
const CLAIM: &str = r#"
local now = tonumber(ARGV[1])

local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
for _, id in ipairs(expired) do
    redis.call('ZREM', KEYS[2], id)
    redis.call('HDEL', ARGV[3] .. id, 'token')
    redis.call('LPUSH', KEYS[1], id)
end

local due = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', now)
for _, id in ipairs(due) do
    redis.call('ZREM', KEYS[3], id)
    redis.call('LPUSH', KEYS[1], id)
end

while true do
    local id = redis.call('RPOP', KEYS[1])
    if not id then
        return false
    end
    local key = ARGV[3] .. id
    local envelope = redis.call('HGET', key, 'envelope')
    if envelope then
        local attempts = redis.call('HINCRBY', key, 'attempts', 1)
        local timeout_ms = tonumber(redis.call('HGET', key, 'timeout_ms') or '0')
        redis.call('HSET', key, 'token', ARGV[2])
        redis.call('ZADD', KEYS[2], now + timeout_ms, id)
        return {id, envelope, attempts}
    end
end
"#;

/// KEYS: leases. ARGV: task key, id, token, now_ms. Returns 1 or 0.
const COMPLETE: &str = r#"
if redis.call('HGET', ARGV[1], 'token') ~= ARGV[3] then
    return 0
end
local deadline = redis.call('ZSCORE', KEYS[1], ARGV[2])
if not deadline or tonumber(deadline) <= tonumber(ARGV[4]) then
    return 0
end
redis.call('ZREM', KEYS[1], ARGV[2])
redis.call('DEL', ARGV[1])
return 1
"#;

/// KEYS: leases, scheduled, pending. ARGV: task key, id, token, now_ms,
/// ready_at_ms. Returns 1 or 0.
const FAIL: &str = r#"
if redis.call('HGET', ARGV[1], 'token') ~= ARGV[3] then
    return 0
end
local deadline = redis.call('ZSCORE', KEYS[1], ARGV[2])
if not deadline or tonumber(deadline) <= tonumber(ARGV[4]) then
    return 0
end
redis.call('ZREM', KEYS[1], ARGV[2])
redis.call('HDEL', ARGV[1], 'token')
if tonumber(ARGV[5]) > tonumber(ARGV[4]) then
    redis.call('ZADD', KEYS[2], ARGV[5], ARGV[2])
else
    redis.call('LPUSH', KEYS[3], ARGV[2])
end
return 1
"#;

pub(super) struct QueueScripts {
    pub claim: Script,
    pub complete: Script,
    pub fail: Script,
}

impl QueueScripts {
    pub fn new() -> Self {
        Self {
            claim: Script::new(CLAIM),
            complete: Script::new(COMPLETE),
            fail: Script::new(FAIL),
        }
    }
}
