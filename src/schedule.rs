use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;

/// When a scheduled callback should fire. Absolute times and relative delays
/// are one-shot; cron expressions recur until cancelled.
#[derive(Debug, Clone)]
pub enum ScheduleWhen {
    /// Fire once at an absolute instant
    At(DateTime<Utc>),
    /// Fire once this many seconds from now
    In(u64),
    /// Fire on a 5-field cron expression (minute hour day-of-month month day-of-week), UTC
    Cron(String),
}

impl From<DateTime<Utc>> for ScheduleWhen {
    fn from(when: DateTime<Utc>) -> Self {
        ScheduleWhen::At(when)
    }
}

impl From<std::time::Duration> for ScheduleWhen {
    fn from(delay: std::time::Duration) -> Self {
        ScheduleWhen::In(delay.as_secs())
    }
}

impl From<u64> for ScheduleWhen {
    fn from(seconds: u64) -> Self {
        ScheduleWhen::In(seconds)
    }
}

impl From<&str> for ScheduleWhen {
    fn from(expr: &str) -> Self {
        ScheduleWhen::Cron(expr.to_owned())
    }
}

/// The persisted flavor of a schedule row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    Scheduled,
    Delayed,
    Cron,
}

impl ScheduleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ScheduleKind::Scheduled => "scheduled",
            ScheduleKind::Delayed => "delayed",
            ScheduleKind::Cron => "cron",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "scheduled" => Ok(ScheduleKind::Scheduled),
            "delayed" => Ok(ScheduleKind::Delayed),
            "cron" => Ok(ScheduleKind::Cron),
            other => Err(anyhow!("unknown schedule type {other:?}").into()),
        }
    }
}

/// A live schedule row, as returned by `schedule()` and `get_schedules()`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: String,
    pub callback: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(rename = "type")]
    pub kind: ScheduleKind,
    /// Epoch seconds of the next fire
    pub time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    /// Epoch milliseconds of row creation
    pub created_at: i64,
}

/// Filter for `get_schedules()`; all fields are optional and combine with AND
#[derive(Debug, Clone, Default)]
pub struct ScheduleQuery {
    pub id: Option<String>,
    pub kind: Option<ScheduleKind>,
    /// Only schedules firing at or after this epoch second
    pub after: Option<i64>,
    /// Only schedules firing at or before this epoch second
    pub before: Option<i64>,
}

impl ScheduleWhen {
    /// Resolve into the persisted columns `(type, time, delay_seconds, cron)`.
    /// Cron expressions are validated here so a bad expression fails at
    /// `schedule()` time rather than at the first alarm.
    pub fn resolve(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(ScheduleKind, i64, Option<i64>, Option<String>), AppError> {
        match self {
            ScheduleWhen::At(when) => Ok((ScheduleKind::Scheduled, when.timestamp(), None, None)),
            ScheduleWhen::In(seconds) => Ok((
                ScheduleKind::Delayed,
                now.timestamp() + *seconds as i64,
                Some(*seconds as i64),
                None,
            )),
            ScheduleWhen::Cron(expr) => {
                let next = next_cron_fire(expr, now)?;
                Ok((ScheduleKind::Cron, next, None, Some(expr.clone())))
            }
        }
    }
}

/// Parse a 5-field cron expression. The `cron` crate wants a seconds field,
/// so one is prepended; callers only ever see the classic 5-field grammar.
pub fn parse_cron(expr: &str) -> Result<cron::Schedule, AppError> {
    if expr.split_whitespace().count() != 5 {
        return Err(anyhow!("invalid cron expression {expr:?}: expected 5 fields").into());
    }
    cron::Schedule::from_str(&format!("0 {expr}"))
        .map_err(|e| anyhow!("invalid cron expression {expr:?}: {e}").into())
}

/// Epoch seconds of the first fire of `expr` strictly after `after`
pub fn next_cron_fire(expr: &str, after: DateTime<Utc>) -> Result<i64, AppError> {
    let schedule = parse_cron(expr)?;
    let next = schedule
        .after(&after)
        .next()
        .ok_or_else(|| anyhow!("cron expression {expr:?} never fires again"))?;
    Ok(next.timestamp())
}

/// Epoch seconds, truncated
pub fn now_seconds() -> i64 {
    Utc::now().timestamp()
}

/// Epoch milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn resolves_absolute_and_relative_times() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();

        let (kind, time, delay, cron) = ScheduleWhen::At(at).resolve(now).unwrap();
        assert_eq!(kind, ScheduleKind::Scheduled);
        assert_eq!(time, at.timestamp());
        assert_eq!((delay, cron), (None, None));

        let (kind, time, delay, _) = ScheduleWhen::In(90).resolve(now).unwrap();
        assert_eq!(kind, ScheduleKind::Delayed);
        assert_eq!(time, now.timestamp() + 90);
        assert_eq!(delay, Some(90));
    }

    #[test]
    fn cron_fires_strictly_after_the_reference_time() {
        // Top of every hour
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let next = next_cron_fire("0 * * * *", now).unwrap();
        assert!(next > now.timestamp());
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap().timestamp());

        // Advancing from the fire time lands on the following hour
        let fire = Utc.timestamp_opt(next, 0).unwrap();
        let after = next_cron_fire("0 * * * *", fire).unwrap();
        assert!(after > next);
    }

    #[test]
    fn cron_handles_leap_years() {
        let now = Utc.with_ymd_and_hms(2023, 3, 1, 0, 0, 0).unwrap();
        // Feb 29 only exists in leap years; next one after 2023-03-01 is 2024
        let next = next_cron_fire("0 0 29 2 *", now).unwrap();
        assert_eq!(
            next,
            Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap().timestamp()
        );
    }

    #[test]
    fn rejects_malformed_cron() {
        assert!(parse_cron("* * * *").is_err());
        assert!(parse_cron("* * * * * *").is_err());
        assert!(parse_cron("not a cron at all").is_err());
    }

    #[test]
    fn schedule_serializes_with_type_tag() {
        let schedule = Schedule {
            id: "abc".into(),
            callback: "tick".into(),
            payload: None,
            kind: ScheduleKind::Cron,
            time: 1_700_000_000,
            delay_seconds: None,
            cron: Some("*/5 * * * *".into()),
            created_at: 1_699_999_999_000,
        };
        let json = serde_json::to_value(&schedule).unwrap();
        assert_eq!(json["type"], "cron");
        assert_eq!(json["cron"], "*/5 * * * *");
        assert!(json.get("delaySeconds").is_none());
    }
}
