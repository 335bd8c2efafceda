use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of past runs kept in each rolling statistics window.
pub const STATS_WINDOW: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMode {
    /// Continue from the saved cursor.
    #[default]
    Incremental,
    /// Discard totals and cursor, then fold every event again.
    Full,
}

impl AggregationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incremental => "incremental",
            Self::Full => "full",
        }
    }
}

impl fmt::Display for AggregationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incremental" => Ok(Self::Incremental),
            "full" => Ok(Self::Full),
            _ => Err(format!("Invalid aggregation mode: {}", s)),
        }
    }
}

/// Position of the last folded event, ordered by `(updated_at, event_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventCursor {
    pub updated_at: DateTime<Utc>,
    pub event_id: i64,
}

/// Rolling window of run durations and processed record counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub runtimes_in_seconds: Vec<f64>,
    pub processed_records: Vec<i64>,
}

impl RunStats {
    pub fn record(&mut self, runtime: Duration, processed: i64) {
        self.runtimes_in_seconds.push(runtime.as_secs_f64());
        self.processed_records.push(processed);
        trim_front(&mut self.runtimes_in_seconds);
        trim_front(&mut self.processed_records);
    }

    pub fn average_runtime(&self) -> Option<f64> {
        if self.runtimes_in_seconds.is_empty() {
            return None;
        }
        let sum: f64 = self.runtimes_in_seconds.iter().sum();
        Some(sum / self.runtimes_in_seconds.len() as f64)
    }

    pub fn total_processed(&self) -> i64 {
        self.processed_records.iter().sum()
    }
}

fn trim_front<T>(values: &mut Vec<T>) {
    if values.len() > STATS_WINDOW {
        let excess = values.len() - STATS_WINDOW;
        values.drain(..excess);
    }
}

/// Persisted aggregation cursor for one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    pub id: i64,
    pub target_id: i64,
    pub enabled: bool,
    pub last_incremental_run_at: Option<DateTime<Utc>>,
    pub last_full_run_at: Option<DateTime<Utc>>,
    pub cursor: Option<EventCursor>,
    pub total_value: i64,
    pub processed_records: i64,
    pub incremental_stats: RunStats,
    pub full_stats: RunStats,
}

impl Aggregation {
    pub fn last_run_at(&self, mode: AggregationMode) -> Option<DateTime<Utc>> {
        match mode {
            AggregationMode::Incremental => self.last_incremental_run_at,
            AggregationMode::Full => self.last_full_run_at,
        }
    }

    pub fn mark_run(&mut self, mode: AggregationMode, at: DateTime<Utc>) {
        match mode {
            AggregationMode::Incremental => self.last_incremental_run_at = Some(at),
            AggregationMode::Full => self.last_full_run_at = Some(at),
        }
    }

    pub fn stats_mut(&mut self, mode: AggregationMode) -> &mut RunStats {
        match mode {
            AggregationMode::Incremental => &mut self.incremental_stats,
            AggregationMode::Full => &mut self.full_stats,
        }
    }

    pub fn reset_totals(&mut self) {
        self.cursor = None;
        self.total_value = 0;
        self.processed_records = 0;
    }
}

/// One source record folded into an aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub target_id: i64,
    pub updated_at: DateTime<Utc>,
    pub value: i64,
}

impl Event {
    pub fn cursor(&self) -> EventCursor {
        EventCursor {
            updated_at: self.updated_at,
            event_id: self.id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_and_prints() {
        assert_eq!("full".parse::<AggregationMode>(), Ok(AggregationMode::Full));
        assert_eq!(AggregationMode::Incremental.to_string(), "incremental");
        assert!("partial".parse::<AggregationMode>().is_err());
    }

    #[test]
    fn run_stats_keep_only_last_ten() {
        let mut stats = RunStats::default();
        for i in 0..15 {
            stats.record(Duration::from_secs(i), i as i64);
        }
        assert_eq!(stats.runtimes_in_seconds.len(), STATS_WINDOW);
        assert_eq!(stats.processed_records.first(), Some(&5));
        assert_eq!(stats.processed_records.last(), Some(&14));
    }

    #[test]
    fn run_stats_average_runtime() {
        let mut stats = RunStats::default();
        assert_eq!(stats.average_runtime(), None);
        stats.record(Duration::from_secs(2), 1);
        stats.record(Duration::from_secs(4), 1);
        assert_eq!(stats.average_runtime(), Some(3.0));
        assert_eq!(stats.total_processed(), 2);
    }

    #[test]
    fn cursors_order_by_time_then_id() {
        let t = Utc::now();
        let a = EventCursor {
            updated_at: t,
            event_id: 5,
        };
        let b = EventCursor {
            updated_at: t,
            event_id: 6,
        };
        let c = EventCursor {
            updated_at: t + chrono::Duration::milliseconds(1),
            event_id: 1,
        };
        assert!(a < b);
        assert!(b < c);
    }
}
