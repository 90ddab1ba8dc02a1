//! Lua scripts for atomic room and mailbox operations.
//!
//! The room version plays the role of a fencing token: every mutation of the
//! counter or the member hash bumps it, and a commit only applies when the
//! caller's snapshot version is still current. Each script publishes its change
//! event from inside the same atomic execution, so subscribers never observe a
//! write without its notification.

/// Optimistic room commit.
///
/// Arguments:
/// - KEYS[1]: Version key (e.g., `mesh:{room}:version`)
/// - KEYS[2]: Counter key (e.g., `mesh:{room}:count`)
/// - KEYS[3]: Member hash (e.g., `mesh:{room}:members`)
/// - ARGV[1]: Expected version
/// - ARGV[2]: New counter value
/// - ARGV[3]: Member operation (`put` or `delete`)
/// - ARGV[4]: Member id
/// - ARGV[5]: Member record JSON (`put` only)
/// - ARGV[6]: Member event channel
///
/// Returns:
/// - 1: Committed
/// - 0: Conflict (version moved)
/// - -1: Error (invalid arguments)
pub const COMMIT_ROOM: &str = r#"
local expected = tonumber(ARGV[1])
local count = tonumber(ARGV[2])
if expected == nil or count == nil then
    return -1
end

local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current ~= expected then
    return 0
end

redis.call('SET', KEYS[2], count)
redis.call('INCR', KEYS[1])

local event = nil
if ARGV[3] == 'put' then
    local existed = redis.call('HEXISTS', KEYS[3], ARGV[4])
    redis.call('HSET', KEYS[3], ARGV[4], ARGV[5])
    local kind = 'added'
    if existed == 1 then
        kind = 'modified'
    end
    event = '{"type":"' .. kind .. '","member":' .. ARGV[5] .. '}'
elseif ARGV[3] == 'delete' then
    if redis.call('HDEL', KEYS[3], ARGV[4]) == 1 then
        event = cjson.encode({type = 'removed', id = ARGV[4]})
    end
else
    return -1
end

if event then
    redis.call('PUBLISH', ARGV[6], event)
end
return 1
"#;

/// Heartbeat refresh of one member record.
///
/// Arguments:
/// - KEYS[1]: Version key
/// - KEYS[2]: Member hash
/// - ARGV[1]: Member id
/// - ARGV[2]: New `lastActive` (RFC 3339)
/// - ARGV[3]: Member event channel
///
/// Returns:
/// - 1: Refreshed
/// - 0: Member record missing
pub const TOUCH_MEMBER: &str = r#"
local raw = redis.call('HGET', KEYS[2], ARGV[1])
if not raw then
    return 0
end

local record = cjson.decode(raw)
record.online = true
record.lastActive = ARGV[2]
local encoded = cjson.encode(record)

redis.call('HSET', KEYS[2], ARGV[1], encoded)
-- Touches move the version so a concurrent ghost eviction re-reads
redis.call('INCR', KEYS[1])
redis.call('PUBLISH', ARGV[3], '{"type":"modified","member":' .. encoded .. '}')
return 1
"#;

/// Append one envelope to a mailbox.
///
/// Arguments:
/// - KEYS[1]: Sequence key (e.g., `mesh:{room}:signal_seq`)
/// - KEYS[2]: Mailbox hash (e.g., `mesh:{room}:mailbox:{recipient}:{kind}`)
/// - ARGV[1]: Envelope id
/// - ARGV[2]: Envelope JSON
/// - ARGV[3]: Mailbox event channel
/// - ARGV[4]: Mailbox TTL in seconds
///
/// Returns: the assigned sequence number
pub const SEND_SIGNAL: &str = r#"
local seq = redis.call('INCR', KEYS[1])
local envelope = cjson.decode(ARGV[2])
envelope.seq = seq
local encoded = cjson.encode(envelope)

redis.call('HSET', KEYS[2], ARGV[1], encoded)
redis.call('EXPIRE', KEYS[2], tonumber(ARGV[4]))
redis.call('PUBLISH', ARGV[3], encoded)
return seq
"#;
