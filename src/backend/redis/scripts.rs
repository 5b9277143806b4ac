//! Lua scripts, one per lifecycle transition.
//!
//! Redis runs a script without interleaving other commands, so each script
//! is one atomic step of the message state machine. Keys are passed in
//! declared order; per-route pending lists and per-message error tracking
//! hashes are derived inside the script from prefixes, and share the queue's
//! hash tag.

use redis::Script;

/// Status codes kept in the status hash.
pub(super) const PENDING: &str = "0";
pub(super) const WORKING: &str = "1";
pub(super) const ERROR: &str = "2";
pub(super) const DELAYED: &str = "3";

/// Fields per message in the send script's ARGV.
pub(super) const SEND_STRIDE: usize = 8;

// KEYS: pending list, values, headers, meta, delayed, expiration, status, id,
//       jobnames, jobidnames, jobeventtimes, route
// ARGV: count, route ('' = none), channel, then SEND_STRIDE fields per message:
//       id ('' = allocate), body, headers, meta, due ms (0 = now),
//       expire ms (0 = never), job name (''), job scheduled ms
// Returns {'ok', id...} or {'job', name} when a job check fails; nothing is
// written in the second case.
const SEND: &str = r#"
local n = tonumber(ARGV[1])
local route = ARGV[2]
local stride = 8

local seen = {}
for i = 0, n - 1 do
    local base = 4 + i * stride
    local job = ARGV[base + 6]
    if job ~= '' then
        if seen[job]
            or redis.call('HEXISTS', KEYS[9], job) == 1
            or redis.call('HGET', KEYS[11], job) == ARGV[base + 7] then
            return {'job', job}
        end
        seen[job] = true
    end
end

local result = {'ok'}
local wake = false
for i = 0, n - 1 do
    local base = 4 + i * stride
    local id = ARGV[base]
    if id == '' then
        id = tostring(redis.call('INCR', KEYS[8]))
    end
    redis.call('HSET', KEYS[2], id, ARGV[base + 1])
    redis.call('HSET', KEYS[3], id, ARGV[base + 2])
    redis.call('HSET', KEYS[4], id, ARGV[base + 3])
    if route ~= '' then
        redis.call('HSET', KEYS[12], id, route)
    end

    local job = ARGV[base + 6]
    if job ~= '' then
        redis.call('HSET', KEYS[9], job, id)
        redis.call('HSET', KEYS[10], id, job)
        redis.call('HSET', KEYS[11], job, ARGV[base + 7])
    end

    local expire = tonumber(ARGV[base + 5])
    if expire > 0 then
        redis.call('ZADD', KEYS[6], expire, id)
    end

    local due = tonumber(ARGV[base + 4])
    if due > 0 then
        redis.call('ZADD', KEYS[5], due, id)
        redis.call('HSET', KEYS[7], id, '3')
    else
        redis.call('LPUSH', KEYS[1], id)
        redis.call('HSET', KEYS[7], id, '0')
        wake = true
    end
    table.insert(result, id)
end

if wake then
    redis.call('PUBLISH', ARGV[3], route)
end
return result
"#;

// KEYS: pending list, working, values, headers, meta, expiration, status, route,
//       leases
// ARGV: now ms, id ('' = pop next), route prefix, lease token
// Returns nil when nothing was taken, else {id, 'ok' | 'expired', body, headers, meta}.
// An expired id leaves the expiration index here; the caller removes it.
const DEQUEUE: &str = r#"
local now = tonumber(ARGV[1])
local id = ARGV[2]

if id ~= '' then
    local list = KEYS[1]
    local route = redis.call('HGET', KEYS[8], id)
    if route then
        list = ARGV[3] .. route
    end
    if redis.call('LREM', list, 1, id) == 0 then
        return false
    end
else
    id = redis.call('RPOP', KEYS[1])
    if not id then
        return false
    end
end

redis.call('ZADD', KEYS[2], now, id)
redis.call('HSET', KEYS[7], id, '1')
redis.call('HSET', KEYS[9], id, ARGV[4])

local expire = redis.call('ZSCORE', KEYS[6], id)
if expire and tonumber(expire) <= now then
    redis.call('ZREM', KEYS[6], id)
    return {id, 'expired', false, false, false}
end

return {
    id,
    'ok',
    redis.call('HGET', KEYS[3], id),
    redis.call('HGET', KEYS[4], id),
    redis.call('HGET', KEYS[5], id)
}
"#;

// KEYS: working, leases
// ARGV: now ms, id, lease token
const HEARTBEAT: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[2]) == ARGV[3] and redis.call('ZSCORE', KEYS[1], ARGV[2]) then
    redis.call('ZADD', KEYS[1], 'XX', ARGV[1], ARGV[2])
    return 1
end
return 0
"#;

// KEYS: working, pending list, route, status, leases
// ARGV: threshold ms (exclusive), limit, route prefix, channel
const RESET_HEARTBEATS: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
local moved = 0
for _, id in ipairs(ids) do
    if redis.call('ZREM', KEYS[1], id) == 1 then
        local list = KEYS[2]
        local route = redis.call('HGET', KEYS[3], id)
        if route then
            list = ARGV[3] .. route
        end
        redis.call('RPUSH', list, id)
        redis.call('HSET', KEYS[4], id, '0')
        redis.call('HDEL', KEYS[5], id)
        moved = moved + 1
    end
end
if moved > 0 then
    redis.call('PUBLISH', ARGV[4], '')
end
return moved
"#;

// KEYS: working, delayed, pending list, route, status, leases
// ARGV: id, due ms (0 = immediate), route prefix, channel, lease token
const ROLLBACK: &str = r#"
local id = ARGV[1]
if redis.call('HGET', KEYS[6], id) ~= ARGV[5] or redis.call('ZREM', KEYS[1], id) == 0 then
    return 0
end
redis.call('HDEL', KEYS[6], id)
local due = tonumber(ARGV[2])
if due > 0 then
    redis.call('ZADD', KEYS[2], due, id)
    redis.call('HSET', KEYS[5], id, '3')
    return 1
end
local list = KEYS[3]
local route = redis.call('HGET', KEYS[4], id)
if route then
    list = ARGV[3] .. route
end
redis.call('RPUSH', list, id)
redis.call('HSET', KEYS[5], id, '0')
redis.call('PUBLISH', ARGV[4], route or '')
return 1
"#;

// KEYS: status
// ARGV: id, exception type, error tracking prefix
// Messages in the error store no longer count as existing.
const RECORD_FAILURE: &str = r#"
local status = redis.call('HGET', KEYS[1], ARGV[1])
if not status or status == '2' then
    return false
end
return redis.call('HINCRBY', ARGV[3] .. ARGV[1], ARGV[2], 1)
"#;

// KEYS: working, error, errortime, status, expiration, jobnames, jobidnames,
//       leases
// ARGV: id, failure json, now ms, error tracking prefix, lease token
// Compare-and-set on the lease: a sweep that already moved the id wins.
const MOVE_TO_ERROR: &str = r#"
local id = ARGV[1]
if redis.call('HGET', KEYS[8], id) ~= ARGV[5] or redis.call('ZREM', KEYS[1], id) == 0 then
    return 0
end
redis.call('HDEL', KEYS[8], id)
redis.call('HSET', KEYS[2], id, ARGV[2])
redis.call('ZADD', KEYS[3], ARGV[3], id)
redis.call('HSET', KEYS[4], id, '2')
redis.call('ZREM', KEYS[5], id)
local job = redis.call('HGET', KEYS[7], id)
if job then
    if redis.call('HGET', KEYS[6], job) == id then
        redis.call('HDEL', KEYS[6], job)
    end
    redis.call('HDEL', KEYS[7], id)
end
redis.call('DEL', ARGV[4] .. id)
return 1
"#;

// KEYS: pending list, working, values, headers, meta, delayed, expiration,
//       status, route, jobnames, jobidnames, leases
// ARGV: id, route prefix, error tracking prefix, lease token ('' = any state)
// Commit passes its token; errored messages are left to the error purge.
const REMOVE: &str = r#"
local id = ARGV[1]
local status = redis.call('HGET', KEYS[8], id)
if not status or status == '2' then
    return 0
end
if ARGV[4] ~= '' and redis.call('HGET', KEYS[12], id) ~= ARGV[4] then
    return 0
end
local list = KEYS[1]
local route = redis.call('HGET', KEYS[9], id)
if route then
    list = ARGV[2] .. route
end
redis.call('LREM', list, 1, id)
redis.call('ZREM', KEYS[2], id)
redis.call('ZREM', KEYS[6], id)
redis.call('ZREM', KEYS[7], id)
redis.call('HDEL', KEYS[3], id)
redis.call('HDEL', KEYS[4], id)
redis.call('HDEL', KEYS[5], id)
redis.call('HDEL', KEYS[8], id)
redis.call('HDEL', KEYS[9], id)
redis.call('HDEL', KEYS[12], id)
local job = redis.call('HGET', KEYS[11], id)
if job then
    if redis.call('HGET', KEYS[10], job) == id then
        redis.call('HDEL', KEYS[10], job)
    end
    redis.call('HDEL', KEYS[11], id)
end
redis.call('DEL', ARGV[3] .. id)
return 1
"#;

// KEYS: delayed, pending list, route, status
// ARGV: now ms, limit, route prefix, channel
const PROMOTE_DELAYED: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
local moved = 0
for _, id in ipairs(ids) do
    if redis.call('ZREM', KEYS[1], id) == 1 then
        local list = KEYS[2]
        local route = redis.call('HGET', KEYS[3], id)
        if route then
            list = ARGV[3] .. route
        end
        redis.call('LPUSH', list, id)
        redis.call('HSET', KEYS[4], id, '0')
        moved = moved + 1
    end
end
if moved > 0 then
    redis.call('PUBLISH', ARGV[4], '')
end
return moved
"#;

// KEYS: expiration, delayed, pending list, route, status, values, headers,
//       meta, jobnames, jobidnames
// ARGV: now ms, limit, route prefix, error tracking prefix
// Working messages are left alone; dequeue reports them as expired instead.
// They stay in the index, so each page starts past the ones already skipped.
const PURGE_EXPIRED: &str = r#"
local limit = tonumber(ARGV[2])
local purged = 0
local skipped = 0
while purged < limit do
    local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', skipped, limit - purged)
    if #ids == 0 then
        break
    end
    for _, id in ipairs(ids) do
        local status = redis.call('HGET', KEYS[5], id)
        local route = redis.call('HGET', KEYS[4], id)
        local taken = false
        if status == '3' then
            taken = redis.call('ZREM', KEYS[2], id) == 1
        elseif status == '0' then
            local list = KEYS[3]
            if route then
                list = ARGV[3] .. route
            end
            taken = redis.call('LREM', list, 1, id) == 1
        end
        if taken then
            redis.call('ZREM', KEYS[1], id)
            for k = 4, 8 do
                redis.call('HDEL', KEYS[k], id)
            end
            local job = redis.call('HGET', KEYS[10], id)
            if job then
                if redis.call('HGET', KEYS[9], job) == id then
                    redis.call('HDEL', KEYS[9], job)
                end
                redis.call('HDEL', KEYS[10], id)
            end
            redis.call('DEL', ARGV[4] .. id)
            purged = purged + 1
        elseif status == '1' then
            skipped = skipped + 1
        else
            redis.call('ZREM', KEYS[1], id)
        end
    end
end
return purged
"#;

// KEYS: errortime, error, values, headers, meta, status, route
// ARGV: threshold ms (exclusive), limit
const PURGE_ERRORS: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, id in ipairs(ids) do
    redis.call('ZREM', KEYS[1], id)
    for k = 2, 7 do
        redis.call('HDEL', KEYS[k], id)
    end
end
return #ids
"#;

// KEYS: status
// Returns {pending, working, error, delayed}.
const COUNTS: &str = r#"
local counts = {0, 0, 0, 0}
for _, code in ipairs(redis.call('HVALS', KEYS[1])) do
    local i = tonumber(code) + 1
    if counts[i] then
        counts[i] = counts[i] + 1
    end
end
return counts
"#;

/// Every script, compiled once per transport.
pub(super) struct Scripts {
    pub send: Script,
    pub dequeue: Script,
    pub heartbeat: Script,
    pub reset_heartbeats: Script,
    pub rollback: Script,
    pub record_failure: Script,
    pub move_to_error: Script,
    pub remove: Script,
    pub promote_delayed: Script,
    pub purge_expired: Script,
    pub purge_errors: Script,
    pub counts: Script,
}

impl Scripts {
    pub fn new() -> Self {
        Self {
            send: Script::new(SEND),
            dequeue: Script::new(DEQUEUE),
            heartbeat: Script::new(HEARTBEAT),
            reset_heartbeats: Script::new(RESET_HEARTBEATS),
            rollback: Script::new(ROLLBACK),
            record_failure: Script::new(RECORD_FAILURE),
            move_to_error: Script::new(MOVE_TO_ERROR),
            remove: Script::new(REMOVE),
            promote_delayed: Script::new(PROMOTE_DELAYED),
            purge_expired: Script::new(PURGE_EXPIRED),
            purge_errors: Script::new(PURGE_ERRORS),
            counts: Script::new(COUNTS),
        }
    }

    pub fn all(&self) -> [(&'static str, &Script); 12] {
        [
            ("send", &self.send),
            ("dequeue", &self.dequeue),
            ("heartbeat", &self.heartbeat),
            ("reset_heartbeats", &self.reset_heartbeats),
            ("rollback", &self.rollback),
            ("record_failure", &self.record_failure),
            ("move_to_error", &self.move_to_error),
            ("remove", &self.remove),
            ("promote_delayed", &self.promote_delayed),
            ("purge_expired", &self.purge_expired),
            ("purge_errors", &self.purge_errors),
            ("counts", &self.counts),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_the_relational_encoding() {
        use crate::model::MessageState;
        for (code, state) in [
            (PENDING, MessageState::Pending),
            (WORKING, MessageState::Working),
            (ERROR, MessageState::Error),
            (DELAYED, MessageState::Delayed),
        ] {
            assert_eq!(code.parse::<i16>().unwrap(), state.as_status_code());
        }
    }

    #[test]
    fn send_stride_matches_the_script() {
        assert!(SEND.contains(&format!("local stride = {SEND_STRIDE}")));
    }

    #[test]
    fn scripts_have_distinct_hashes() {
        let scripts = Scripts::new();
        let mut hashes: Vec<&str> = scripts.all().iter().map(|(_, s)| s.get_hash()).collect();
        hashes.sort();
        hashes.dedup();
        assert_eq!(hashes.len(), 12);
    }
}
