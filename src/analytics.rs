// analytics.rs: usage statistics and time-slot recommendations
//
// Pure functions over a read-copy of closed sessions. Nothing here touches
// the store lock, and every function takes `now` explicitly so identical
// input always produces identical output.

use chrono::{DateTime, Duration, DurationRound, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ForecastMode;
use crate::types::{hour_range, MachineId, Session};

const HOURS: usize = 24;
const TOP_HOURS: usize = 5;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourCount {
    pub hour: u32,
    pub count: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageStatistics {
    pub days: u32,
    pub total_sessions: usize,
    pub average_duration_secs: f64,
    pub total_usage_time_secs: f64,
    pub busiest_hours: Vec<HourCount>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub hour: u32,
    pub time_range: String,
    pub usage_count: u64,
}

/// Least-busy hours, or an explicit marker when the window holds no sessions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BestTimes {
    Recommended {
        days: u32,
        recommended_times: Vec<TimeSlot>,
        message: String,
    },
    InsufficientData {
        days: u32,
        message: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HourAvailability {
    pub hour: u32,
    pub time_range: String,
    pub avg_in_use: f64,
    pub avg_available: f64,
}

/// Start of a `days`-long window ending at `now`. A window reaching past the
/// representable range starts at the earliest instant and covers everything.
pub fn window_start(now: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    Duration::try_days(i64::from(days))
        .and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn in_window(sessions: &[Session], since: DateTime<Utc>) -> impl Iterator<Item = &Session> {
    sessions.iter().filter(move |s| s.start_time >= since)
}

/// Session count per start hour-of-day.
fn start_hour_counts<'a>(sessions: impl Iterator<Item = &'a Session>) -> [u64; HOURS] {
    let mut counts = [0u64; HOURS];
    for session in sessions {
        counts[session.start_time.hour() as usize] += 1;
    }
    counts
}

pub fn usage_statistics(sessions: &[Session], now: DateTime<Utc>, days: u32) -> UsageStatistics {
    let since = window_start(now, days);
    let window: Vec<&Session> = in_window(sessions, since).collect();

    let total_sessions = window.len();
    let total_usage_time_secs: f64 = window.iter().map(|s| s.duration_secs).sum();
    let average_duration_secs = if total_sessions > 0 {
        total_usage_time_secs / total_sessions as f64
    } else {
        0.0
    };

    let counts = start_hour_counts(window.iter().copied());
    let mut ranked: Vec<HourCount> = counts
        .iter()
        .enumerate()
        .filter(|(_, count)| **count > 0)
        .map(|(hour, count)| HourCount {
            hour: hour as u32,
            count: *count,
        })
        .collect();
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then(a.hour.cmp(&b.hour)));
    ranked.truncate(TOP_HOURS);

    UsageStatistics {
        days,
        total_sessions,
        average_duration_secs,
        total_usage_time_secs,
        busiest_hours: ranked,
    }
}

pub fn best_times(sessions: &[Session], now: DateTime<Utc>, days: u32) -> BestTimes {
    let since = window_start(now, days);
    let mut window = in_window(sessions, since).peekable();

    if window.peek().is_none() {
        return BestTimes::InsufficientData {
            days,
            message: format!("No sessions recorded in the last {days} days."),
        };
    }

    let counts = start_hour_counts(window);
    let mut hours: Vec<(u32, u64)> = counts
        .iter()
        .enumerate()
        .map(|(hour, count)| (hour as u32, *count))
        .collect();
    hours.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));

    let recommended_times = hours
        .into_iter()
        .take(TOP_HOURS)
        .map(|(hour, usage_count)| TimeSlot {
            hour,
            time_range: hour_range(hour),
            usage_count,
        })
        .collect();

    BestTimes::Recommended {
        days,
        recommended_times,
        message: format!("These are the least busy times based on the last {days} days of data."),
    }
}

/// Machine-hours of use per hour-of-day, spreading each session over every
/// hour it overlaps inside `[since, now]`.
fn overlap_hours(sessions: &[Session], since: DateTime<Utc>, now: DateTime<Utc>) -> [f64; HOURS] {
    let mut buckets = [0.0f64; HOURS];
    let one_hour = Duration::hours(1);

    for session in sessions {
        let start = session.start_time.max(since);
        let end = session.end_time.min(now);
        let mut cursor = start;
        while cursor < end {
            let hour_start = cursor.duration_trunc(one_hour).unwrap_or(cursor);
            let segment_end = (hour_start + one_hour).min(end);
            let secs = (segment_end - cursor).num_milliseconds() as f64 / 1000.0;
            buckets[cursor.hour() as usize] += secs / 3600.0;
            cursor = segment_end;
        }
    }
    buckets
}

pub fn availability_forecast(
    sessions: &[Session],
    now: DateTime<Utc>,
    days: u32,
    total_machines: usize,
    mode: ForecastMode,
) -> Vec<HourAvailability> {
    let since = window_start(now, days);
    let usage: [f64; HOURS] = match mode {
        ForecastMode::Overlap => overlap_hours(sessions, since, now),
        ForecastMode::StartHour => start_hour_counts(in_window(sessions, since)).map(|c| c as f64),
    };

    let total = total_machines as f64;
    (0..HOURS as u32)
        .map(|hour| {
            let avg_in_use = if days > 0 {
                (usage[hour as usize] / f64::from(days)).clamp(0.0, total)
            } else {
                0.0
            };
            HourAvailability {
                hour,
                time_range: hour_range(hour),
                avg_in_use,
                avg_available: (total - avg_in_use).clamp(0.0, total),
            }
        })
        .collect()
}

/// One machine's sessions inside the window, newest first.
pub fn machine_history(
    sessions: &[Session],
    machine_id: MachineId,
    now: DateTime<Utc>,
    days: u32,
) -> Vec<Session> {
    let since = window_start(now, days);
    let mut history: Vec<Session> = in_window(sessions, since)
        .filter(|s| s.machine_id == machine_id)
        .cloned()
        .collect();
    history.sort_by(|a, b| b.start_time.cmp(&a.start_time));
    history
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 8, 0, 0, 0).unwrap()
    }

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, hour, minute, 0).unwrap()
    }

    fn session(machine_id: MachineId, start: DateTime<Utc>, minutes: i64) -> Session {
        Session::closed(machine_id, start, start + Duration::minutes(minutes))
    }

    /// 100 sessions spread deterministically over the week before `now`.
    fn fixture() -> Vec<Session> {
        (0..100u32)
            .map(|i| {
                let day = 1 + i % 7;
                let hour = (i * 7 + i / 3) % 24;
                session(1 + i % 4, at(day, hour, (i * 13) % 60), 30 + i64::from(i % 50))
            })
            .collect()
    }

    #[test]
    fn test_usage_statistics_empty_window() {
        let stats = usage_statistics(&[], now(), 7);
        assert_eq!(stats.total_sessions, 0);
        assert_eq!(stats.average_duration_secs, 0.0);
        assert_eq!(stats.total_usage_time_secs, 0.0);
        assert!(stats.busiest_hours.is_empty());
    }

    #[test]
    fn test_usage_statistics_filters_window_and_ranks_hours() {
        let sessions = vec![
            session(1, at(7, 9, 0), 60),
            session(2, at(7, 9, 30), 30),
            session(1, at(6, 18, 0), 45),
            session(3, at(5, 7, 0), 45),
            // Outside a 7-day window.
            session(1, Utc.with_ymd_and_hms(2025, 2, 20, 9, 0, 0).unwrap(), 60),
        ];
        let stats = usage_statistics(&sessions, now(), 7);

        assert_eq!(stats.total_sessions, 4);
        assert_relative_eq!(stats.total_usage_time_secs, 180.0 * 60.0);
        assert_relative_eq!(stats.average_duration_secs, 45.0 * 60.0);
        assert_eq!(
            stats.busiest_hours,
            vec![
                HourCount { hour: 9, count: 2 },
                HourCount { hour: 7, count: 1 },
                HourCount { hour: 18, count: 1 },
            ]
        );
    }

    #[test]
    fn test_best_times_insufficient_data() {
        let old = vec![session(1, Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap(), 60)];
        assert!(matches!(best_times(&old, now(), 7), BestTimes::InsufficientData { days: 7, .. }));
        assert!(matches!(best_times(&[], now(), 7), BestTimes::InsufficientData { .. }));
    }

    #[test]
    fn test_best_times_ascending_with_hour_tiebreak() {
        let mut sessions = Vec::new();
        for hour in 0..24 {
            if hour != 4 && hour != 2 {
                sessions.push(session(1, at(7, hour, 0), 10));
            }
        }
        sessions.push(session(2, at(7, 0, 30), 10));

        let BestTimes::Recommended { recommended_times, .. } = best_times(&sessions, now(), 7) else {
            panic!("expected recommendations");
        };
        let hours: Vec<u32> = recommended_times.iter().map(|s| s.hour).collect();
        assert_eq!(hours, vec![2, 4, 1, 3, 5]);
        assert_eq!(recommended_times[0].usage_count, 0);
        assert_eq!(recommended_times[0].time_range, "02:00 - 03:00");
    }

    #[test]
    fn test_rankings_are_deterministic() {
        let sessions = fixture();
        let first = serde_json::to_string(&(
            best_times(&sessions, now(), 7),
            usage_statistics(&sessions, now(), 7),
        ))
        .unwrap();

        let mut shuffled = sessions.clone();
        shuffled.reverse();
        let second = serde_json::to_string(&(
            best_times(&shuffled, now(), 7),
            usage_statistics(&shuffled, now(), 7),
        ))
        .unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_forecast_overlap_spreads_long_sessions() {
        // 09:30 → 11:15 on one day: 0.5h in 9, 1h in 10, 0.25h in 11.
        let sessions = vec![Session::closed(1, at(7, 9, 30), at(7, 11, 15))];
        let forecast = availability_forecast(&sessions, now(), 1, 2, ForecastMode::Overlap);

        assert_eq!(forecast.len(), 24);
        assert_relative_eq!(forecast[9].avg_in_use, 0.5);
        assert_relative_eq!(forecast[10].avg_in_use, 1.0);
        assert_relative_eq!(forecast[11].avg_in_use, 0.25);
        assert_relative_eq!(forecast[10].avg_available, 1.0);
        assert_relative_eq!(forecast[12].avg_available, 2.0);
    }

    #[test]
    fn test_forecast_start_hour_mode() {
        let sessions = vec![Session::closed(1, at(7, 9, 30), at(7, 11, 15))];
        let forecast = availability_forecast(&sessions, now(), 1, 2, ForecastMode::StartHour);
        assert_relative_eq!(forecast[9].avg_in_use, 1.0);
        assert_relative_eq!(forecast[10].avg_in_use, 0.0);
    }

    #[test]
    fn test_forecast_averages_over_days_and_clamps() {
        let sessions: Vec<Session> = (1..=7)
            .flat_map(|day| (1..=3).map(move |m| Session::closed(m, at(day, 8, 0), at(day, 9, 0))))
            .collect();
        let forecast = availability_forecast(&sessions, now(), 7, 2, ForecastMode::Overlap);
        assert_relative_eq!(forecast[8].avg_in_use, 2.0);
        assert_eq!(forecast[8].avg_available, 0.0);
    }

    #[test]
    fn test_forecast_clips_to_window() {
        // Starts before the 1-day window, ends inside it.
        let sessions = vec![Session::closed(1, at(6, 23, 0), at(7, 1, 0))];
        let forecast = availability_forecast(&sessions, now(), 1, 1, ForecastMode::Overlap);
        assert_relative_eq!(forecast[23].avg_in_use, 0.0);
        assert_relative_eq!(forecast[0].avg_in_use, 1.0);
    }

    #[test]
    fn test_huge_window_covers_all_sessions() {
        assert_eq!(window_start(now(), u32::MAX), DateTime::<Utc>::MIN_UTC);
        assert_eq!(window_start(now(), 7), at(1, 0, 0));

        let sessions = vec![session(1, at(1, 8, 0), 30), session(2, at(7, 23, 30), 60)];
        let usage = usage_statistics(&sessions, now(), u32::MAX);
        assert_eq!(usage.total_sessions, 2);
        assert!(matches!(best_times(&sessions, now(), u32::MAX), BestTimes::Recommended { .. }));

        let forecast = availability_forecast(&sessions, now(), u32::MAX, 4, ForecastMode::Overlap);
        assert!(forecast.iter().all(|h| h.avg_in_use >= 0.0 && h.avg_available <= 4.0));
        assert_eq!(machine_history(&sessions, 2, now(), u32::MAX).len(), 1);
    }

    #[test]
    fn test_machine_history_filters_and_orders() {
        let sessions = vec![
            session(1, at(5, 9, 0), 10),
            session(2, at(6, 9, 0), 10),
            session(1, at(7, 9, 0), 10),
        ];
        let history = machine_history(&sessions, 1, now(), 7);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].start_time, at(7, 9, 0));
    }
}
