use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub port: u16,
    /// System-wide concurrency default when no campaign is involved.
    pub max_concurrent_outbound_calls: u32,
    /// Only the primary instance registers a call worker.
    pub primary: bool,
    pub exotel: ExotelConfig,
    pub sweeps: SweepConfig,
    pub cold_start: ColdStartConfig,
    pub off_peak: OffPeakHours,
    /// Base URL Exotel posts status callbacks to.
    pub webhook_base_url: Option<String>,
}

/// Default carrier credentials; per-phone credentials from the store
/// override these when configured.
#[derive(Debug, Clone)]
pub struct ExotelConfig {
    pub account_sid: String,
    pub api_key: String,
    pub api_token: String,
    pub subdomain: String,
}

/// Sweep cadences and TTLs for the background reconcilers.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub janitor_interval: Duration,
    pub compactor_interval: Duration,
    pub queue_reconciler_interval: Duration,
    pub counter_reconciler_interval: Duration,
    pub invariant_interval: Duration,
    /// Ledger entries older than this are treated as orphaned reservations.
    pub reservation_orphan_age: Duration,
    /// TTL on waitlist push markers.
    pub marker_ttl: Duration,
    /// TTL on the contact dedup set.
    pub dedup_ttl: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            janitor_interval: Duration::from_secs(30),
            compactor_interval: Duration::from_secs(120),
            queue_reconciler_interval: Duration::from_secs(300),
            counter_reconciler_interval: Duration::from_secs(900),
            invariant_interval: Duration::from_secs(30),
            reservation_orphan_age: Duration::from_secs(300),
            marker_ttl: Duration::from_secs(30),
            dedup_ttl: Duration::from_secs(86_400),
        }
    }
}

/// Shape of the cold-start ramp applied right after a campaign activates.
#[derive(Debug, Clone)]
pub struct ColdStartConfig {
    /// Effective limit while warming.
    pub initial_limit: u32,
    /// Successful upgrades needed to start ramping.
    pub ramp_after_successes: u32,
    /// Successful upgrades needed to finish the ramp.
    pub done_after_successes: u32,
    /// Limit multiplier applied at each ramp step.
    pub step_multiplier: u32,
}

impl Default for ColdStartConfig {
    fn default() -> Self {
        Self {
            initial_limit: 1,
            ramp_after_successes: 2,
            done_after_successes: 5,
            step_multiplier: 2,
        }
    }
}

/// Preference window for the retry scheduler.
#[derive(Debug, Clone)]
pub struct OffPeakHours {
    /// Hour of day the window opens (inclusive).
    pub start_hour: u32,
    /// Hour of day the window closes (exclusive).
    pub end_hour: u32,
    pub timezone: chrono_tz::Tz,
    /// Days of week the window applies to (chrono weekday numbers, Mon=0).
    pub days_of_week: Vec<u32>,
}

impl Default for OffPeakHours {
    fn default() -> Self {
        Self {
            start_hour: 10,
            end_hour: 19,
            timezone: chrono_tz::Asia::Kolkata,
            days_of_week: vec![0, 1, 2, 3, 4, 5],
        }
    }
}

impl OffPeakHours {
    /// Whether `now` falls inside the retry window. An end hour at or before
    /// the start hour wraps past midnight.
    pub fn contains(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        use chrono::{Datelike, Timelike};
        let local = now.with_timezone(&self.timezone);
        let day = local.weekday().num_days_from_monday();
        if !self.days_of_week.contains(&day) {
            return false;
        }
        let hour = local.hour();
        if self.start_hour < self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let off_peak = OffPeakHours {
            start_hour: env_parse("OFF_PEAK_START_HOUR", 10)?,
            end_hour: env_parse("OFF_PEAK_END_HOUR", 19)?,
            timezone: env::var("OFF_PEAK_TIMEZONE")
                .unwrap_or_else(|_| "Asia/Kolkata".to_string())
                .parse()
                .map_err(|e| anyhow::anyhow!("OFF_PEAK_TIMEZONE is invalid: {e}"))?,
            days_of_week: env::var("OFF_PEAK_DAYS")
                .unwrap_or_else(|_| "0,1,2,3,4,5".to_string())
                .split(',')
                .filter(|s| !s.is_empty())
                .map(|s| s.trim().parse().context("OFF_PEAK_DAYS must be numbers"))
                .collect::<Result<_>>()?,
        };

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            port: env_parse("PORT", 8080)?,
            max_concurrent_outbound_calls: env_parse("MAX_CONCURRENT_OUTBOUND_CALLS", 10)?,
            primary: env::var("DIALER_PRIMARY")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            exotel: ExotelConfig {
                account_sid: env::var("EXOTEL_ACCOUNT_SID")
                    .context("EXOTEL_ACCOUNT_SID must be set")?,
                api_key: env::var("EXOTEL_API_KEY").context("EXOTEL_API_KEY must be set")?,
                api_token: env::var("EXOTEL_API_TOKEN").context("EXOTEL_API_TOKEN must be set")?,
                subdomain: env::var("EXOTEL_SUBDOMAIN")
                    .unwrap_or_else(|_| "api.exotel.com".to_string()),
            },
            sweeps: SweepConfig {
                janitor_interval: env_secs("SWEEP_JANITOR_SECS", 30)?,
                compactor_interval: env_secs("SWEEP_COMPACTOR_SECS", 120)?,
                queue_reconciler_interval: env_secs("SWEEP_QUEUE_RECONCILER_SECS", 300)?,
                counter_reconciler_interval: env_secs("SWEEP_COUNTER_RECONCILER_SECS", 900)?,
                invariant_interval: env_secs("SWEEP_INVARIANT_SECS", 30)?,
                reservation_orphan_age: env_secs("RESERVATION_ORPHAN_AGE_SECS", 300)?,
                marker_ttl: env_secs("WAITLIST_MARKER_TTL_SECS", 30)?,
                dedup_ttl: env_secs("WAITLIST_DEDUP_TTL_SECS", 86_400)?,
            },
            cold_start: ColdStartConfig {
                initial_limit: env_parse("COLD_START_INITIAL_LIMIT", 1)?,
                ramp_after_successes: env_parse("COLD_START_RAMP_SUCCESSES", 2)?,
                done_after_successes: env_parse("COLD_START_DONE_SUCCESSES", 5)?,
                step_multiplier: env_parse("COLD_START_STEP_MULTIPLIER", 2)?,
            },
            off_peak,
            webhook_base_url: env::var("WEBHOOK_BASE_URL").ok(),
        })
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{name} is invalid: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_secs(name: &str, default: u64) -> Result<Duration> {
    Ok(Duration::from_secs(env_parse(name, default)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_defaults_match_documented_cadences() {
        let sweeps = SweepConfig::default();
        assert_eq!(sweeps.janitor_interval, Duration::from_secs(30));
        assert_eq!(sweeps.counter_reconciler_interval, Duration::from_secs(900));
        assert_eq!(sweeps.reservation_orphan_age, Duration::from_secs(300));
    }

    #[test]
    fn cold_start_defaults() {
        let cold = ColdStartConfig::default();
        assert_eq!(cold.initial_limit, 1);
        assert_eq!(cold.ramp_after_successes, 2);
        assert_eq!(cold.done_after_successes, 5);
    }
}
