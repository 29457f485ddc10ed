// Power consumption domain models
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Raw per-minute reading. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub id: u64,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub power_watts: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourSummary {
    pub id: u64,
    pub device_id: String,
    pub window_start: DateTime<Utc>,
    pub average_power_watts: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaySummary {
    pub id: u64,
    pub device_id: String,
    pub date: NaiveDate,
    pub average_power_watts: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeekSummary {
    pub id: u64,
    pub device_id: String,
    pub week_start: NaiveDate,
    pub average_power_watts: f64,
}

/// A record at any resolution, as returned to reporting collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resolution", rename_all = "lowercase")]
pub enum Summary {
    Minute(Sample),
    Hour(HourSummary),
    Day(DaySummary),
    Week(WeekSummary),
}

impl Summary {
    pub fn resolution(&self) -> Resolution {
        match self {
            Summary::Minute(_) => Resolution::Minute,
            Summary::Hour(_) => Resolution::Hour,
            Summary::Day(_) => Resolution::Day,
            Summary::Week(_) => Resolution::Week,
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            Summary::Minute(s) => s.id,
            Summary::Hour(h) => h.id,
            Summary::Day(d) => d.id,
            Summary::Week(w) => w.id,
        }
    }

    pub fn average_power_watts(&self) -> f64 {
        match self {
            Summary::Minute(s) => s.power_watts,
            Summary::Hour(h) => h.average_power_watts,
            Summary::Day(d) => d.average_power_watts,
            Summary::Week(w) => w.average_power_watts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Minute,
    Hour,
    Day,
    Week,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resolution::Minute => "minute",
            Resolution::Hour => "hour",
            Resolution::Day => "day",
            Resolution::Week => "week",
        };
        f.write_str(name)
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "minute" | "minutely" => Ok(Resolution::Minute),
            "hour" | "hourly" => Ok(Resolution::Hour),
            "day" | "daily" => Ok(Resolution::Day),
            "week" | "weekly" => Ok(Resolution::Week),
            other => Err(format!("unknown resolution: {}", other)),
        }
    }
}

/// One roll-up step: N records at `input()` resolution become one record at `output()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RollupLevel {
    MinuteToHour,
    HourToDay,
    DayToWeek,
}

impl RollupLevel {
    pub const ALL: [RollupLevel; 3] = [
        RollupLevel::MinuteToHour,
        RollupLevel::HourToDay,
        RollupLevel::DayToWeek,
    ];

    pub const fn batch_size(self) -> usize {
        match self {
            RollupLevel::MinuteToHour => 60,
            RollupLevel::HourToDay => 24,
            RollupLevel::DayToWeek => 7,
        }
    }

    pub const fn input(self) -> Resolution {
        match self {
            RollupLevel::MinuteToHour => Resolution::Minute,
            RollupLevel::HourToDay => Resolution::Hour,
            RollupLevel::DayToWeek => Resolution::Day,
        }
    }

    pub const fn output(self) -> Resolution {
        match self {
            RollupLevel::MinuteToHour => Resolution::Hour,
            RollupLevel::HourToDay => Resolution::Day,
            RollupLevel::DayToWeek => Resolution::Week,
        }
    }

    pub const fn next(self) -> Option<RollupLevel> {
        match self {
            RollupLevel::MinuteToHour => Some(RollupLevel::HourToDay),
            RollupLevel::HourToDay => Some(RollupLevel::DayToWeek),
            RollupLevel::DayToWeek => None,
        }
    }

    /// Only raw samples carry OFF-state noise that has to be filtered and purged.
    pub const fn filters_zero_power(self) -> bool {
        matches!(self, RollupLevel::MinuteToHour)
    }

    /// Builds the next-level record stamped with the oldest input's bucket.
    pub fn record(self, first_bucket: DateTime<Utc>, average_power_watts: f64) -> RollupRecord {
        match self {
            RollupLevel::MinuteToHour => RollupRecord::Hour {
                window_start: first_bucket,
                average_power_watts,
            },
            RollupLevel::HourToDay => RollupRecord::Day {
                date: first_bucket.date_naive(),
                average_power_watts,
            },
            RollupLevel::DayToWeek => RollupRecord::Week {
                week_start: first_bucket.date_naive(),
                average_power_watts,
            },
        }
    }
}

impl fmt::Display for RollupLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.input(), self.output())
    }
}

/// A not-yet-aggregated unit at some level, reduced to what the mean needs.
#[derive(Debug, Clone, PartialEq)]
pub struct RollupInput {
    pub id: u64,
    pub bucket: DateTime<Utc>,
    pub value: f64,
}

impl RollupInput {
    pub fn new(id: u64, bucket: DateTime<Utc>, value: f64) -> Self {
        Self { id, bucket, value }
    }
}

impl From<&Sample> for RollupInput {
    fn from(sample: &Sample) -> Self {
        Self::new(sample.id, sample.timestamp, sample.power_watts)
    }
}

impl From<&HourSummary> for RollupInput {
    fn from(hour: &HourSummary) -> Self {
        Self::new(hour.id, hour.window_start, hour.average_power_watts)
    }
}

impl From<&DaySummary> for RollupInput {
    fn from(day: &DaySummary) -> Self {
        Self::new(day.id, start_of_day(day.date), day.average_power_watts)
    }
}

/// A summary waiting to be persisted; the store assigns its id.
#[derive(Debug, Clone, PartialEq)]
pub enum RollupRecord {
    Hour {
        window_start: DateTime<Utc>,
        average_power_watts: f64,
    },
    Day {
        date: NaiveDate,
        average_power_watts: f64,
    },
    Week {
        week_start: NaiveDate,
        average_power_watts: f64,
    },
}

impl RollupRecord {
    pub fn into_summary(self, id: u64, device_id: &str) -> Summary {
        let device_id = device_id.to_string();
        match self {
            RollupRecord::Hour {
                window_start,
                average_power_watts,
            } => Summary::Hour(HourSummary {
                id,
                device_id,
                window_start,
                average_power_watts,
            }),
            RollupRecord::Day {
                date,
                average_power_watts,
            } => Summary::Day(DaySummary {
                id,
                device_id,
                date,
                average_power_watts,
            }),
            RollupRecord::Week {
                week_start,
                average_power_watts,
            } => Summary::Week(WeekSummary {
                id,
                device_id,
                week_start,
                average_power_watts,
            }),
        }
    }
}

pub fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_batch_sizes() {
        assert_eq!(RollupLevel::MinuteToHour.batch_size(), 60);
        assert_eq!(RollupLevel::HourToDay.batch_size(), 24);
        assert_eq!(RollupLevel::DayToWeek.batch_size(), 7);
        assert_eq!(RollupLevel::DayToWeek.next(), None);
    }

    #[test]
    fn test_resolution_parsing() {
        assert_eq!("hour".parse::<Resolution>(), Ok(Resolution::Hour));
        assert_eq!("Weekly".parse::<Resolution>(), Ok(Resolution::Week));
        assert!("fortnight".parse::<Resolution>().is_err());
    }

    #[test]
    fn test_record_is_stamped_with_first_bucket() {
        let first = Utc.with_ymd_and_hms(2024, 3, 4, 22, 0, 0).unwrap();

        let day = RollupLevel::HourToDay.record(first, 12.5);
        assert_eq!(
            day,
            RollupRecord::Day {
                date: NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
                average_power_watts: 12.5,
            }
        );

        let summary = day.into_summary(9, "plug-1");
        assert_eq!(summary.resolution(), Resolution::Day);
        assert_eq!(summary.average_power_watts(), 12.5);
    }

    #[test]
    fn test_day_input_bucket_is_midnight() {
        let day = DaySummary {
            id: 3,
            device_id: "plug-1".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            average_power_watts: 4.0,
        };
        let input = RollupInput::from(&day);
        assert_eq!(input.bucket, Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap());
    }
}
