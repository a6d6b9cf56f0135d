//! Server-side Lua for every multi-key atomic operation.
//!
//! Each script touches only keys that share one campaign's hash tag. Scripts
//! return flat arrays of strings/integers; richer payloads (job bodies,
//! events) are JSON built either in Rust or with cjson inside the script.

/// KEYS: leases, reserved, wait_high, wait_normal, gate, ledger
/// ARGV: limit, batch, now_ms
/// Returns: [count, seq, "H:<jobId>"...]
pub(super) const POP_RESERVE_PROMOTE: &str = r#"
local limit = tonumber(ARGV[1])
local batch = tonumber(ARGV[2])
local inflight = redis.call('SCARD', KEYS[1])
local reserved = tonumber(redis.call('GET', KEYS[2]) or '0')
local available = limit - inflight - reserved
if available <= 0 then
  return {0, 0}
end
local take = math.min(batch, available)
local popped = {}
for i = 1, take do
  local id = redis.call('LPOP', KEYS[3])
  if not id then break end
  table.insert(popped, 'H:' .. id)
end
while #popped < take do
  local id = redis.call('LPOP', KEYS[4])
  if not id then break end
  table.insert(popped, 'N:' .. id)
end
if #popped == 0 then
  return {0, 0}
end
redis.call('INCRBY', KEYS[2], #popped)
local seq = redis.call('INCR', KEYS[5])
local out = {#popped, seq}
for _, member in ipairs(popped) do
  redis.call('ZADD', KEYS[6], ARGV[3], member)
  table.insert(out, member)
end
return out
"#;

/// KEYS: leases, reserved, limit, lease_key
/// ARGV: member, token, fallback_limit, ttl_secs, now_ms
/// Returns 1 on acquisition, nil when the ceiling is reached.
pub(super) const ACQUIRE_PRE_DIAL: &str = r#"
local limit = tonumber(redis.call('GET', KEYS[3]) or ARGV[3])
local inflight = redis.call('SCARD', KEYS[1])
local reserved = tonumber(redis.call('GET', KEYS[2]) or '0')
if inflight + reserved >= limit + 1 then
  return false
end
redis.call('SADD', KEYS[1], ARGV[1])
redis.call('SET', KEYS[4], ARGV[2] .. '|' .. ARGV[5], 'EX', ARGV[4])
return 1
"#;

/// KEYS: lease_key
/// ARGV: token, extend_secs, cap_ms, now_ms
/// Extends the TTL, never past `cap_ms` from first acquisition.
pub(super) const RENEW_PRE_DIAL: &str = r#"
local val = redis.call('GET', KEYS[1])
if not val then
  return 0
end
local sep = string.find(val, '|', 1, true)
if not sep then
  return 0
end
if string.sub(val, 1, sep - 1) ~= ARGV[1] then
  return 0
end
local acquired = tonumber(string.sub(val, sep + 1))
local remaining = tonumber(ARGV[3]) - (tonumber(ARGV[4]) - acquired)
if remaining <= 0 then
  return 0
end
local extend = math.min(tonumber(ARGV[2]) * 1000, remaining)
redis.call('PEXPIRE', KEYS[1], math.floor(extend))
return 1
"#;

/// KEYS: leases, pre_lease_key, active_lease_key
/// ARGV: pre_member, active_member, pre_token, active_token, active_ttl_secs, now_ms
/// The member swap keeps set cardinality constant, so no ceiling re-check.
pub(super) const UPGRADE_TO_ACTIVE: &str = r#"
local val = redis.call('GET', KEYS[2])
if not val then
  return false
end
local sep = string.find(val, '|', 1, true)
local token = sep and string.sub(val, 1, sep - 1) or val
if token ~= ARGV[3] then
  return false
end
redis.call('SREM', KEYS[1], ARGV[1])
redis.call('DEL', KEYS[2])
redis.call('SADD', KEYS[1], ARGV[2])
redis.call('SET', KEYS[3], ARGV[4] .. '|' .. ARGV[6], 'EX', ARGV[5])
return 1
"#;

/// KEYS: leases, lease_key
/// ARGV: member, token, channel, campaign_id, publish_flag
/// Returns "released" | "already" | "mismatch".
pub(super) const RELEASE_SLOT: &str = r#"
local val = redis.call('GET', KEYS[2])
if not val then
  redis.call('SREM', KEYS[1], ARGV[1])
  return 'already'
end
local sep = string.find(val, '|', 1, true)
local token = sep and string.sub(val, 1, sep - 1) or val
if token ~= ARGV[2] then
  return 'mismatch'
end
redis.call('DEL', KEYS[2])
redis.call('SREM', KEYS[1], ARGV[1])
if ARGV[5] == '1' then
  redis.call('PUBLISH', ARGV[3], ARGV[4])
end
return 'released'
"#;

/// KEYS: ledger, reserved
/// ARGV: high_member, normal_member
pub(super) const CLAIM_RESERVATION: &str = r#"
local removed = redis.call('ZREM', KEYS[1], ARGV[1])
if removed == 0 then
  removed = redis.call('ZREM', KEYS[1], ARGV[2])
end
if removed == 0 then
  return 0
end
if redis.call('DECR', KEYS[2]) < 0 then
  redis.call('SET', KEYS[2], '0')
end
return 1
"#;

/// KEYS: marker, waitlist, seen
/// ARGV: job_id, contact_id, marker_ttl_secs, dedup_ttl_secs
/// Returns [pushed, duplicate_contact].
pub(super) const WAITLIST_PUSH: &str = r#"
local dup = 0
if redis.call('SADD', KEYS[3], ARGV[2]) == 0 then
  dup = 1
end
redis.call('EXPIRE', KEYS[3], ARGV[4])
if not redis.call('SET', KEYS[1], '1', 'NX', 'EX', ARGV[3]) then
  return {0, dup}
end
redis.call('RPUSH', KEYS[2], ARGV[1])
return {1, dup}
"#;

/// KEYS: job, delayed, job_index
/// ARGV: job_json, job_id, deliver_at_ms, channel, event_json
pub(super) const QUEUE_ADD: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('SET', KEYS[1], ARGV[1])
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[2])
redis.call('SADD', KEYS[3], ARGV[2])
redis.call('PUBLISH', ARGV[4], ARGV[5])
return 1
"#;

/// KEYS: job, delayed, waiting
/// ARGV: job_id, seq, now_ms, channel
pub(super) const QUEUE_PROMOTE: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then
  return 0
end
local job = cjson.decode(raw)
if job.state ~= 'delayed' then
  return 0
end
job.state = 'waiting'
job.promote_seq = tonumber(ARGV[2])
job.promoted_at_ms = tonumber(ARGV[3])
redis.call('SET', KEYS[1], cjson.encode(job))
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('RPUSH', KEYS[3], ARGV[1])
redis.call('PUBLISH', ARGV[4], cjson.encode({
  campaign_id = job.campaign_id,
  job_id = job.id,
  contact_id = job.contact_id,
  lane = job.lane,
  kind = 'waiting',
}))
return 1
"#;

/// KEYS: waiting
/// ARGV: job_prefix, channel
/// Pops until a live job is found; returns its JSON or nil.
pub(super) const QUEUE_CLAIM: &str = r#"
while true do
  local id = redis.call('LPOP', KEYS[1])
  if not id then
    return false
  end
  local key = ARGV[1] .. id
  local raw = redis.call('GET', key)
  if raw then
    local job = cjson.decode(raw)
    job.state = 'active'
    raw = cjson.encode(job)
    redis.call('SET', key, raw)
    redis.call('PUBLISH', ARGV[2], cjson.encode({
      campaign_id = job.campaign_id,
      job_id = job.id,
      contact_id = job.contact_id,
      lane = job.lane,
      kind = 'active',
    }))
    return raw
  end
end
"#;

/// KEYS: job, delayed, waiting
/// ARGV: job_id, deliver_at_ms, bump_attempt, channel
pub(super) const QUEUE_MOVE_TO_DELAYED: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then
  return 0
end
local job = cjson.decode(raw)
if job.state == 'delayed' then
  return 0
end
redis.call('LREM', KEYS[3], 0, ARGV[1])
job.state = 'delayed'
job.deliver_at_ms = tonumber(ARGV[2])
job.promote_seq = cjson.null
job.promoted_at_ms = cjson.null
if ARGV[3] == '1' then
  job.attempts_made = job.attempts_made + 1
end
redis.call('SET', KEYS[1], cjson.encode(job))
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
redis.call('PUBLISH', ARGV[4], cjson.encode({
  campaign_id = job.campaign_id,
  job_id = job.id,
  contact_id = job.contact_id,
  lane = job.lane,
  kind = 'delayed',
}))
return 1
"#;

/// KEYS: job, delayed, waiting
/// ARGV: job_id, state, channel
pub(super) const QUEUE_FINISH: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then
  return 0
end
local job = cjson.decode(raw)
job.state = ARGV[2]
redis.call('SET', KEYS[1], cjson.encode(job))
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('LREM', KEYS[3], 0, ARGV[1])
redis.call('PUBLISH', ARGV[3], cjson.encode({
  campaign_id = job.campaign_id,
  job_id = job.id,
  contact_id = job.contact_id,
  lane = job.lane,
  kind = ARGV[2],
}))
return 1
"#;

/// KEYS: job, delayed, waiting, job_index
/// ARGV: job_id
pub(super) const QUEUE_REMOVE: &str = r#"
local existed = redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('LREM', KEYS[3], 0, ARGV[1])
redis.call('SREM', KEYS[4], ARGV[1])
return existed
"#;

/// KEYS: leases
/// ARGV: lease_prefix
pub(super) const SWEEP_DEAD_MEMBERS: &str = r#"
local removed = 0
for _, member in ipairs(redis.call('SMEMBERS', KEYS[1])) do
  if redis.call('EXISTS', ARGV[1] .. member) == 0 then
    redis.call('SREM', KEYS[1], member)
    removed = removed + 1
  end
end
return removed
"#;

/// KEYS: leases
/// ARGV: lease_prefix
pub(super) const ORPHAN_MEMBER_COUNT: &str = r#"
local orphans = 0
for _, member in ipairs(redis.call('SMEMBERS', KEYS[1])) do
  if redis.call('EXISTS', ARGV[1] .. member) == 0 then
    orphans = orphans + 1
  end
end
return orphans
"#;

/// KEYS: ledger, reserved, wait_high, wait_normal
/// ARGV: cutoff_ms
/// Returns the recovered ledger members.
pub(super) const RECOVER_ORPHAN_RESERVATIONS: &str = r#"
local out = {}
for _, member in ipairs(redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])) do
  local sep = string.find(member, ':', 1, true)
  local origin = string.sub(member, 1, sep - 1)
  local id = string.sub(member, sep + 1)
  redis.call('ZREM', KEYS[1], member)
  if redis.call('DECR', KEYS[2]) < 0 then
    redis.call('SET', KEYS[2], '0')
  end
  if origin == 'H' then
    redis.call('RPUSH', KEYS[3], id)
  else
    redis.call('RPUSH', KEYS[4], id)
  end
  table.insert(out, member)
end
return out
"#;

/// KEYS: reserved, ledger
/// Returns [previous_reserved, ledger_len].
pub(super) const RECONCILE_RESERVED: &str = r#"
local prev = tonumber(redis.call('GET', KEYS[1]) or '0')
local len = redis.call('ZCARD', KEYS[2])
redis.call('SET', KEYS[1], len)
return {prev, len}
"#;

/// KEYS: limit, leases, reserved, ledger
/// Returns [limit, inflight, reserved, ledger_len].
pub(super) const SLOT_SNAPSHOT: &str = r#"
return {
  redis.call('GET', KEYS[1]) or '0',
  redis.call('SCARD', KEYS[2]),
  redis.call('GET', KEYS[3]) or '0',
  redis.call('ZCARD', KEYS[4]),
}
"#;

/// KEYS: mutex
/// ARGV: holder, ttl_secs
pub(super) const MUTEX_RENEW: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('EXPIRE', KEYS[1], ARGV[2])
  return 1
end
return 0
"#;

/// KEYS: mutex
/// ARGV: holder
pub(super) const MUTEX_RELEASE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('DEL', KEYS[1])
  return 1
end
return 0
"#;

/// KEYS: cold, cold_ok, limit
/// ARGV: ramp_after, done_after, step_multiplier, configured_limit
/// Returns the phase after noting one successful upgrade, or nil when no
/// ramp is in progress.
pub(super) const COLD_START_NOTE_SUCCESS: &str = r#"
local phase = redis.call('GET', KEYS[1])
if not phase then
  return false
end
if phase == 'done' then
  return 'done'
end
local ok = redis.call('INCR', KEYS[2])
local configured = tonumber(ARGV[4])
local limit = tonumber(redis.call('GET', KEYS[3]) or '1')
if ok >= tonumber(ARGV[2]) then
  redis.call('SET', KEYS[1], 'done')
  redis.call('SET', KEYS[3], configured)
  return 'done'
end
if ok >= tonumber(ARGV[1]) then
  redis.call('SET', KEYS[1], 'ramping')
  local raised = math.min(configured, limit * tonumber(ARGV[3]))
  if raised > limit then
    redis.call('SET', KEYS[3], raised)
  end
  return 'ramping'
end
return phase
"#;

/// KEYS: cold, cold_ok, limit
/// ARGV: initial_limit, configured_limit, ramp_after, warming_ttl_secs
pub(super) const COLD_START_REWIND: &str = r#"
local phase = redis.call('GET', KEYS[1])
if not phase then
  return false
end
if phase == 'done' then
  redis.call('SET', KEYS[1], 'ramping')
  redis.call('SET', KEYS[2], ARGV[3])
  local half = math.max(1, math.floor(tonumber(ARGV[2]) / 2))
  redis.call('SET', KEYS[3], half)
  return 'ramping'
end
redis.call('SET', KEYS[1], 'warming', 'EX', ARGV[4])
redis.call('SET', KEYS[2], '0')
redis.call('SET', KEYS[3], ARGV[1])
return 'warming'
"#;

/// KEYS: limit, paused, leases, reserved, ledger, wait_high, wait_normal,
///       seen, gate, mutex, breaker, cold, cold_ok, delayed, waiting,
///       job_index
/// ARGV: job_prefix, marker_prefix
pub(super) const CLEAR_CAMPAIGN: &str = r#"
for _, id in ipairs(redis.call('SMEMBERS', KEYS[16])) do
  redis.call('DEL', ARGV[1] .. id)
  redis.call('DEL', ARGV[2] .. id)
end
for i = 1, 16 do
  redis.call('DEL', KEYS[i])
end
return 1
"#;
