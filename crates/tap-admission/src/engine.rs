//! Production wrapper around [`crate::pure::tap`] that executes the same
//! arithmetic atomically inside Redis via `EVAL` (spec §4.2 "Determinism and
//! isolation" — the script is the single writer to the cached energy/day/
//! system row set, and must not split its steps across round trips).

use crate::metrics;
use crate::pure::{AdmissionConfig, AdmissionResult, Reason};
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::Script;
use serde::Deserialize;
use tap_common::{Day, TapError, TapResult, UserId};

/// `KEYS = [user:{id}, daily:{id}:{day}, system, stream:taps]`
/// `ARGV = [requested, now, base_regen, daily_limit, energy_max_default,
///          coin_per_tap, stream_max_len, daily_ttl, day_string, uid,
///          max_requested]`
///
/// Mirrors [`crate::pure::tap`] field-for-field; any change there must be
/// ported here too.
const TAP_SCRIPT_SRC: &str = r#"
local user_key = KEYS[1]
local daily_key = KEYS[2]
local system_key = KEYS[3]
local stream_key = KEYS[4]

local requested = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local base_regen = tonumber(ARGV[3])
local daily_limit = tonumber(ARGV[4])
local energy_max_default = tonumber(ARGV[5])
local coin_per_tap = tonumber(ARGV[6])
local stream_max_len = ARGV[7]
local daily_ttl = tonumber(ARGV[8])
local day_string = ARGV[9]
local uid = ARGV[10]
local max_requested = tonumber(ARGV[11])

local UNLIMITED = 1000000000000

if requested < 0 then requested = 0 end
if requested > max_requested then requested = max_requested end

local energy = tonumber(redis.call('HGET', user_key, 'energy') or '0')
local energy_max = tonumber(redis.call('HGET', user_key, 'energy_max') or tostring(energy_max_default))
local energy_updated_at = tonumber(redis.call('HGET', user_key, 'energy_updated_at') or tostring(now))
local boost_until = tonumber(redis.call('HGET', user_key, 'boost_until') or '0')
local boost_regen_mul = tonumber(redis.call('HGET', user_key, 'boost_regen_mul') or '1')
local boost_max_mul = tonumber(redis.call('HGET', user_key, 'boost_max_mul') or '1')

local tapped = tonumber(redis.call('HGET', daily_key, 'tapped') or '0')
local extra_quota = tonumber(redis.call('HGET', daily_key, 'extra_quota') or '0')

local reserve_supply = tonumber(redis.call('HGET', system_key, 'reserve_supply') or '0')
local reserved_supply = tonumber(redis.call('HGET', system_key, 'reserved_supply') or '0')

local boosted = now < boost_until
local regen = base_regen
local energy_max_effective = energy_max
if boosted then
  regen = base_regen * boost_regen_mul
  energy_max_effective = energy_max * boost_max_mul
end
if regen < 0 then regen = 0 end
if energy_max_effective < 0 then energy_max_effective = 0 end

local elapsed = now - energy_updated_at
if elapsed < 0 then elapsed = 0 end
local regenerated = energy + elapsed * regen
if regenerated > energy_max_effective then regenerated = energy_max_effective end

local from_energy = math.floor(regenerated)
if from_energy < 0 then from_energy = 0 end

local from_daily = UNLIMITED
if daily_limit > 0 then
  from_daily = (daily_limit + extra_quota) - tapped
  if from_daily < 0 then from_daily = 0 end
end

local headroom = reserve_supply - reserved_supply
if headroom < 0 then headroom = 0 end
local from_reserve = 0
if coin_per_tap > 0 then
  from_reserve = math.floor(headroom / coin_per_tap)
end

local gained = math.min(requested, from_energy, from_daily, from_reserve)
if gained < 0 then gained = 0 end

local reason = 'zero'
if requested == 0 then
  reason = 'zero'
elseif from_energy == 0 then
  reason = 'no_energy'
elseif daily_limit > 0 and from_daily == 0 then
  reason = 'daily_limit'
elseif from_reserve == 0 then
  reason = 'reserve_empty'
elseif gained > 0 then
  reason = 'ok'
end

local energy_after = regenerated - gained
local tapped_after = tapped
if daily_limit > 0 then
  tapped_after = tapped + gained
end
local coins = gained * coin_per_tap
local reserve_supply_after = reserve_supply
if coins > 0 then
  reserve_supply_after = reserve_supply - coins
end

local daily_remaining = UNLIMITED
if daily_limit > 0 then
  daily_remaining = (daily_limit + extra_quota) - tapped_after
  if daily_remaining < 0 then daily_remaining = 0 end
end

redis.call('HSET', user_key, 'energy', tostring(energy_after), 'energy_updated_at', tostring(now))
if daily_limit > 0 then
  redis.call('HSET', daily_key, 'tapped', tostring(tapped_after))
  redis.call('EXPIRE', daily_key, daily_ttl)
end
if coins > 0 then
  redis.call('HSET', system_key, 'reserve_supply', tostring(reserve_supply_after))
  redis.call('XADD', stream_key, 'MAXLEN', '~', stream_max_len, '*',
    'kind', 'tap', 'uid', uid, 'coins', tostring(coins), 'taps', tostring(gained),
    'day', day_string, 'req', tostring(requested), 'ts', tostring(now))
end

return cjson.encode({
  gained = gained,
  reason = reason,
  energy_after = energy_after,
  energy_max_effective = energy_max_effective,
  tapped_after = tapped_after,
  extra_quota = extra_quota,
  daily_remaining = daily_remaining,
})
"#;

static TAP_SCRIPT: Lazy<Script> = Lazy::new(|| Script::new(TAP_SCRIPT_SRC));

#[derive(Debug, Deserialize)]
struct ScriptResult {
    gained: i64,
    reason: String,
    energy_after: f64,
    energy_max_effective: f64,
    tapped_after: i64,
    extra_quota: i64,
    daily_remaining: i64,
}

const UNLIMITED_SENTINEL: i64 = 1_000_000_000_000;

impl From<ScriptResult> for AdmissionResult {
    fn from(r: ScriptResult) -> Self {
        let daily_remaining = if r.daily_remaining >= UNLIMITED_SENTINEL { i64::MAX } else { r.daily_remaining };
        AdmissionResult {
            gained: r.gained,
            reason: Reason::from_str(&r.reason),
            energy_after: r.energy_after,
            energy_max_effective: r.energy_max_effective,
            tapped_after: r.tapped_after,
            extra_quota: r.extra_quota,
            daily_remaining,
        }
    }
}

/// Redis-backed atomic admission engine (spec §4.2).
#[derive(Clone)]
pub struct AdmissionEngine {
    conn: ConnectionManager,
}

impl AdmissionEngine {
    pub async fn new(redis_url: &str) -> TapResult<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| TapError::Transient(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| TapError::Transient(e.to_string()))?;
        Ok(Self { conn })
    }

    /// Executes the admission script for one tap request (spec §4.2).
    pub async fn tap(
        &self,
        user_id: UserId,
        requested: i64,
        now: u64,
        day: &Day,
        cfg: &AdmissionConfig,
    ) -> TapResult<AdmissionResult> {
        metrics::TAP_REQUESTS.inc();
        let mut conn = self.conn.clone();
        let user_key = format!("user:{}", user_id.0);
        let daily_key = format!("daily:{}:{}", user_id.0, day.0);
        let raw: String = TAP_SCRIPT
            .key(user_key)
            .key(daily_key)
            .key("system")
            .key(tap_stream::TAP_STREAM_KEY)
            .arg(requested)
            .arg(now)
            .arg(cfg.base_regen)
            .arg(cfg.daily_limit)
            .arg(cfg.energy_max_default)
            .arg(cfg.coin_per_tap)
            .arg(cfg.stream_max_len)
            .arg(cfg.daily_ttl)
            .arg(&day.0)
            .arg(user_id.0)
            .arg(cfg.max_requested)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| TapError::Transient(format!("admission script: {e}")))?;
        let parsed: ScriptResult = serde_json::from_str(&raw)?;
        let result: AdmissionResult = parsed.into();
        if result.gained > 0 {
            metrics::TAP_GRANTS.inc();
        } else {
            metrics::TAP_REJECTIONS.inc();
        }
        Ok(result)
    }
}
