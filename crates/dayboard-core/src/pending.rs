//! Pending-item aggregation.
//!
//! A report is rebuilt from scratch for every snapshot. The work is pure: it
//! reads records and an explicit `now`, and never touches storage or the
//! wall clock.

use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, TimeZone, Timelike};
use serde::Serialize;
use thiserror::Error;

use crate::keys::{DayKey, MonthKey, WeekKey, day_key, month_key, week_key};
use crate::record::{DayMap, GoalRecord, MonthMap, Snapshot, WeekMap};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PendingItem {
    Daily {
        day: DayKey,
        hour: u8,
        text: String,
    },
    Weekly {
        week: WeekKey,
        index: usize,
        text: String,
    },
    Monthly {
        month: MonthKey,
        index: usize,
        text: String,
    },
}

impl PendingItem {
    pub fn text(&self) -> &str {
        match self {
            Self::Daily { text, .. } | Self::Weekly { text, .. } | Self::Monthly { text, .. } => {
                text
            }
        }
    }

    pub fn period(&self) -> &str {
        match self {
            Self::Daily { day, .. } => day.as_str(),
            Self::Weekly { week, .. } => week.as_str(),
            Self::Monthly { month, .. } => month.as_str(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PendingReport {
    pub daily_backlog: Vec<PendingItem>,
    pub weekly_backlog: Vec<PendingItem>,
    pub monthly_backlog: Vec<PendingItem>,
    pub daily_current: Vec<PendingItem>,
    pub weekly_current: Vec<PendingItem>,
    pub monthly_current: Vec<PendingItem>,
}

impl PendingReport {
    pub fn total_count(&self) -> usize {
        self.daily_backlog.len()
            + self.weekly_backlog.len()
            + self.monthly_backlog.len()
            + self.daily_current.len()
            + self.weekly_current.len()
            + self.monthly_current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_count() == 0
    }

    #[must_use]
    pub fn filtered(mut self, filter: PendingFilter) -> Self {
        let (daily, weekly, monthly) = match filter {
            PendingFilter::All => (true, true, true),
            PendingFilter::Daily => (true, false, false),
            PendingFilter::Weekly => (false, true, false),
            PendingFilter::Monthly => (false, false, true),
        };
        if !daily {
            self.daily_backlog.clear();
            self.daily_current.clear();
        }
        if !weekly {
            self.weekly_backlog.clear();
            self.weekly_current.clear();
        }
        if !monthly {
            self.monthly_backlog.clear();
            self.monthly_current.clear();
        }
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PendingFilter {
    #[default]
    All,
    Daily,
    Weekly,
    Monthly,
}

impl FromStr for PendingFilter {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "daily" | "day" => Ok(Self::Daily),
            "weekly" | "week" => Ok(Self::Weekly),
            "monthly" | "month" => Ok(Self::Monthly),
            other => Err(anyhow!("unknown pending filter: {other}")),
        }
    }
}

impl fmt::Display for PendingFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::All => "all",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        };
        f.write_str(label)
    }
}

/// Aggregates unfinished work relative to `now`.
///
/// Backlog lists hold periods strictly before the current one. Current lists
/// hold today (up to and including the current hour), this week and this
/// month. Missing records count as empty.
pub fn compute_pending<Z: TimeZone>(
    days: &DayMap,
    weeks: &WeekMap,
    months: &MonthMap,
    now: &DateTime<Z>,
) -> PendingReport {
    let today = day_key(now);
    let this_week = week_key(now);
    let this_month = month_key(now);
    let current_hour = u8::try_from(now.hour()).unwrap_or(u8::MAX);

    // BTreeMap iteration already yields (day, hour) ascending.
    let daily_backlog = days
        .range(..today.clone())
        .flat_map(|(day, record)| {
            record
                .tasks
                .iter()
                .filter(|(_, entry)| entry.is_pending())
                .map(|(hour, entry)| PendingItem::Daily {
                    day: day.clone(),
                    hour: *hour,
                    text: entry.text.clone(),
                })
        })
        .collect();

    let weekly_backlog = weeks
        .range(..this_week.clone())
        .flat_map(|(week, record)| {
            pending_goals(record).map(|(index, text)| PendingItem::Weekly {
                week: week.clone(),
                index,
                text,
            })
        })
        .collect();

    let monthly_backlog = months
        .range(..this_month.clone())
        .flat_map(|(month, record)| {
            pending_goals(record).map(|(index, text)| PendingItem::Monthly {
                month: month.clone(),
                index,
                text,
            })
        })
        .collect();

    let daily_current = days
        .get(&today)
        .map(|record| {
            record
                .tasks
                .range(..=current_hour)
                .filter(|(_, entry)| entry.is_pending())
                .map(|(hour, entry)| PendingItem::Daily {
                    day: today.clone(),
                    hour: *hour,
                    text: entry.text.clone(),
                })
                .collect()
        })
        .unwrap_or_default();

    let weekly_current = weeks
        .get(&this_week)
        .map(|record| {
            pending_goals(record)
                .map(|(index, text)| PendingItem::Weekly {
                    week: this_week.clone(),
                    index,
                    text,
                })
                .collect()
        })
        .unwrap_or_default();

    let monthly_current = months
        .get(&this_month)
        .map(|record| {
            pending_goals(record)
                .map(|(index, text)| PendingItem::Monthly {
                    month: this_month.clone(),
                    index,
                    text,
                })
                .collect()
        })
        .unwrap_or_default();

    PendingReport {
        daily_backlog,
        weekly_backlog,
        monthly_backlog,
        daily_current,
        weekly_current,
        monthly_current,
    }
}

fn pending_goals(record: &GoalRecord) -> impl Iterator<Item = (usize, String)> + '_ {
    record
        .goals
        .iter()
        .enumerate()
        .filter(|(_, goal)| goal.is_pending())
        .map(|(index, goal)| (index, goal.text.clone()))
}

impl Snapshot {
    pub fn pending<Z: TimeZone>(&self, now: &DateTime<Z>) -> PendingReport {
        compute_pending(&self.days, &self.weeks, &self.months, now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompletionError {
    #[error("{target} is not in the current period ({current}); only current items can be completed")]
    NotCurrentPeriod { target: String, current: String },
    #[error("nothing to complete at {0}")]
    MissingEntry(String),
}

pub fn mark_daily_done<Z: TimeZone>(
    snapshot: &mut Snapshot,
    now: &DateTime<Z>,
    day: &DayKey,
    hour: u8,
) -> Result<(), CompletionError> {
    let today = day_key(now);
    if *day != today {
        return Err(CompletionError::NotCurrentPeriod {
            target: day.to_string(),
            current: today.to_string(),
        });
    }
    let entry = snapshot
        .days
        .get_mut(day)
        .and_then(|record| record.tasks.get_mut(&hour))
        .ok_or_else(|| CompletionError::MissingEntry(format!("{day} {hour:02}:00")))?;
    entry.done = true;
    Ok(())
}

pub fn mark_weekly_done<Z: TimeZone>(
    snapshot: &mut Snapshot,
    now: &DateTime<Z>,
    week: &WeekKey,
    index: usize,
) -> Result<(), CompletionError> {
    let this_week = week_key(now);
    if *week != this_week {
        return Err(CompletionError::NotCurrentPeriod {
            target: format!("week {week}"),
            current: format!("week {this_week}"),
        });
    }
    let goal = snapshot
        .weeks
        .get_mut(week)
        .and_then(|record| record.goals.get_mut(index))
        .ok_or_else(|| CompletionError::MissingEntry(format!("week {week} goal {}", index + 1)))?;
    goal.done = true;
    Ok(())
}

pub fn mark_monthly_done<Z: TimeZone>(
    snapshot: &mut Snapshot,
    now: &DateTime<Z>,
    month: &MonthKey,
    index: usize,
) -> Result<(), CompletionError> {
    let this_month = month_key(now);
    if *month != this_month {
        return Err(CompletionError::NotCurrentPeriod {
            target: format!("month {month}"),
            current: format!("month {this_month}"),
        });
    }
    let goal = snapshot
        .months
        .get_mut(month)
        .and_then(|record| record.goals.get_mut(index))
        .ok_or_else(|| {
            CompletionError::MissingEntry(format!("month {month} goal {}", index + 1))
        })?;
    goal.done = true;
    Ok(())
}

/// Full-collection snapshot delivered by a live subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionUpdate {
    Days(DayMap),
    Weeks(WeekMap),
    Months(MonthMap),
}

/// Holds the latest snapshot of each collection as updates arrive in any
/// order, and aggregates whatever has been seen so far.
#[derive(Debug, Clone, Default)]
pub struct LiveAggregator {
    days: Option<DayMap>,
    weeks: Option<WeekMap>,
    months: Option<MonthMap>,
}

impl LiveAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, update: CollectionUpdate) {
        match update {
            CollectionUpdate::Days(days) => self.days = Some(days),
            CollectionUpdate::Weeks(weeks) => self.weeks = Some(weeks),
            CollectionUpdate::Months(months) => self.months = Some(months),
        }
    }

    /// True once every collection has reported at least once.
    pub fn is_complete(&self) -> bool {
        self.days.is_some() && self.weeks.is_some() && self.months.is_some()
    }

    pub fn report<Z: TimeZone>(&self, now: &DateTime<Z>) -> PendingReport {
        let no_days = DayMap::new();
        let no_weeks = WeekMap::new();
        let no_months = MonthMap::new();
        compute_pending(
            self.days.as_ref().unwrap_or(&no_days),
            self.weeks.as_ref().unwrap_or(&no_weeks),
            self.months.as_ref().unwrap_or(&no_months),
            now,
        )
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, FixedOffset, TimeZone};

    use super::{
        CollectionUpdate, CompletionError, LiveAggregator, PendingFilter, PendingItem,
        compute_pending, mark_daily_done, mark_monthly_done, mark_weekly_done,
    };
    use crate::keys::{DayKey, MonthKey, WeekKey};
    use crate::record::{DayMap, DayRecord, Entry, GoalRecord, Snapshot};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .expect("offset")
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .single()
            .expect("valid instant")
    }

    fn day(raw: &str) -> DayKey {
        raw.parse().expect("day key")
    }

    fn week(raw: &str) -> WeekKey {
        raw.parse().expect("week key")
    }

    fn month(raw: &str) -> MonthKey {
        raw.parse().expect("month key")
    }

    fn day_with(tasks: &[(u8, &str, bool)]) -> DayRecord {
        let mut record = DayRecord::default();
        for (hour, text, done) in tasks {
            record.tasks.insert(
                *hour,
                Entry {
                    text: (*text).to_string(),
                    done: *done,
                },
            );
        }
        record
    }

    fn goals(items: &[(&str, bool)]) -> GoalRecord {
        GoalRecord {
            goals: items
                .iter()
                .map(|(text, done)| Entry {
                    text: (*text).to_string(),
                    done: *done,
                })
                .collect(),
        }
    }

    #[test]
    fn past_day_task_lands_in_backlog() {
        let mut snapshot = Snapshot::default();
        snapshot
            .days
            .insert(day("2024-01-01"), day_with(&[(9, "call bank", false)]));

        let report = snapshot.pending(&at(2024, 1, 3, 10, 0));
        assert_eq!(
            report.daily_backlog,
            vec![PendingItem::Daily {
                day: day("2024-01-01"),
                hour: 9,
                text: "call bank".to_string(),
            }]
        );
        assert!(report.daily_current.is_empty());
        assert_eq!(report.total_count(), 1);
    }

    #[test]
    fn previous_week_goal_is_backlog_not_current() {
        let mut snapshot = Snapshot::default();
        snapshot
            .weeks
            .insert(week("2024-01-08"), goals(&[("ship report", false)]));

        let report = snapshot.pending(&at(2024, 1, 17, 9, 0));
        assert_eq!(report.weekly_backlog.len(), 1);
        assert_eq!(report.weekly_backlog[0].text(), "ship report");
        assert!(report.weekly_current.is_empty());
    }

    #[test]
    fn current_day_respects_hour_cutoff() {
        let mut snapshot = Snapshot::default();
        snapshot.days.insert(
            day("2024-01-03"),
            day_with(&[(15, "later", false), (14, "now", false), (8, "earlier", false)]),
        );

        let report = snapshot.pending(&at(2024, 1, 3, 14, 30));
        let hours: Vec<u8> = report
            .daily_current
            .iter()
            .map(|item| match item {
                PendingItem::Daily { hour, .. } => *hour,
                other => panic!("unexpected item {other:?}"),
            })
            .collect();
        assert_eq!(hours, vec![8, 14]);
        assert!(report.daily_backlog.is_empty());
    }

    #[test]
    fn done_and_blank_items_never_appear() {
        let mut snapshot = Snapshot::default();
        snapshot.days.insert(
            day("2024-01-01"),
            day_with(&[(1, "done", true), (2, "   ", false), (3, "", false)]),
        );
        snapshot
            .weeks
            .insert(week("2024-01-01"), goals(&[("", false), ("finished", true)]));
        snapshot
            .months
            .insert(month("2023-12"), goals(&[(" \t", false)]));

        let report = snapshot.pending(&at(2024, 2, 1, 12, 0));
        assert!(report.is_empty());
    }

    #[test]
    fn backlog_is_sorted_and_excludes_current_and_future() {
        let mut snapshot = Snapshot::default();
        snapshot
            .days
            .insert(day("2024-01-02"), day_with(&[(7, "b7", false), (3, "b3", false)]));
        snapshot
            .days
            .insert(day("2024-01-01"), day_with(&[(20, "a20", false)]));
        snapshot
            .days
            .insert(day("2024-01-05"), day_with(&[(1, "future", false)]));
        snapshot
            .weeks
            .insert(week("2024-01-01"), goals(&[("w1", false), ("w2", false)]));
        snapshot
            .weeks
            .insert(week("2023-12-25"), goals(&[("w0", false)]));
        snapshot
            .months
            .insert(month("2024-01"), goals(&[("current month", false)]));
        snapshot
            .months
            .insert(month("2023-11"), goals(&[("old month", false)]));

        let report = snapshot.pending(&at(2024, 1, 3, 23, 0));
        let daily: Vec<&str> = report.daily_backlog.iter().map(PendingItem::text).collect();
        assert_eq!(daily, vec!["a20", "b3", "b7"]);

        let weekly: Vec<&str> = report.weekly_backlog.iter().map(PendingItem::text).collect();
        assert_eq!(weekly, vec!["w0"]);
        let weekly_current: Vec<&str> =
            report.weekly_current.iter().map(PendingItem::text).collect();
        assert_eq!(weekly_current, vec!["w1", "w2"]);

        assert_eq!(report.monthly_backlog.len(), 1);
        assert_eq!(report.monthly_backlog[0].period(), "2023-11");
        assert_eq!(report.monthly_current.len(), 1);
        assert_eq!(report.total_count(), 7);
    }

    #[test]
    fn aggregation_is_idempotent() {
        let mut snapshot = Snapshot::default();
        snapshot
            .days
            .insert(day("2024-01-01"), day_with(&[(9, "call bank", false)]));
        snapshot
            .months
            .insert(month("2024-01"), goals(&[("read", false)]));
        let now = at(2024, 1, 3, 10, 0);
        assert_eq!(snapshot.pending(&now), snapshot.pending(&now));
    }

    #[test]
    fn marking_current_items_done_removes_them() {
        let now = at(2024, 1, 3, 10, 0);
        let mut snapshot = Snapshot::default();
        snapshot
            .days
            .insert(day("2024-01-03"), day_with(&[(9, "stretch", false)]));
        snapshot
            .weeks
            .insert(week("2024-01-01"), goals(&[("plan", false)]));
        snapshot
            .months
            .insert(month("2024-01"), goals(&[("budget", false)]));
        assert_eq!(snapshot.pending(&now).total_count(), 3);

        mark_daily_done(&mut snapshot, &now, &day("2024-01-03"), 9).expect("daily done");
        mark_weekly_done(&mut snapshot, &now, &week("2024-01-01"), 0).expect("weekly done");
        mark_monthly_done(&mut snapshot, &now, &month("2024-01"), 0).expect("monthly done");

        assert!(snapshot.pending(&now).is_empty());
        let entry = snapshot.days[&day("2024-01-03")].task(9).expect("task kept");
        assert_eq!(entry.text, "stretch");
        assert!(entry.done);
    }

    #[test]
    fn backlog_items_cannot_be_marked_done() {
        let now = at(2024, 1, 3, 10, 0);
        let mut snapshot = Snapshot::default();
        snapshot
            .days
            .insert(day("2024-01-01"), day_with(&[(9, "call bank", false)]));

        let err = mark_daily_done(&mut snapshot, &now, &day("2024-01-01"), 9)
            .expect_err("backlog must be read-only");
        assert!(matches!(err, CompletionError::NotCurrentPeriod { .. }));
        assert_eq!(snapshot.pending(&now).daily_backlog.len(), 1);

        let missing = mark_weekly_done(&mut snapshot, &now, &week("2024-01-01"), 4)
            .expect_err("no such goal");
        assert!(matches!(missing, CompletionError::MissingEntry(_)));
    }

    #[test]
    fn filter_keeps_one_family() {
        let mut snapshot = Snapshot::default();
        snapshot
            .days
            .insert(day("2024-01-01"), day_with(&[(9, "call bank", false)]));
        snapshot
            .weeks
            .insert(week("2024-01-01"), goals(&[("plan", false)]));
        let report = snapshot
            .pending(&at(2024, 1, 3, 10, 0))
            .filtered("weekly".parse::<PendingFilter>().expect("filter"));
        assert_eq!(report.total_count(), 1);
        assert!(report.daily_backlog.is_empty());
        assert!("hourly".parse::<PendingFilter>().is_err());
    }

    #[test]
    fn live_aggregator_tolerates_partial_snapshots() {
        let now = at(2024, 1, 17, 9, 0);
        let mut live = LiveAggregator::new();
        assert!(live.report(&now).is_empty());

        let mut weeks = crate::record::WeekMap::new();
        weeks.insert(week("2024-01-08"), goals(&[("ship report", false)]));
        live.apply(CollectionUpdate::Weeks(weeks));
        assert!(!live.is_complete());
        assert_eq!(live.report(&now).weekly_backlog.len(), 1);

        let mut days = DayMap::new();
        days.insert(day("2024-01-16"), day_with(&[(9, "call bank", false)]));
        live.apply(CollectionUpdate::Days(days));
        assert_eq!(live.report(&now).total_count(), 2);

        live.apply(CollectionUpdate::Days(DayMap::new()));
        live.apply(CollectionUpdate::Months(crate::record::MonthMap::new()));
        assert!(live.is_complete());
        assert_eq!(live.report(&now).total_count(), 1);
    }

    #[test]
    fn report_matches_direct_computation() {
        let mut snapshot = Snapshot::default();
        snapshot
            .days
            .insert(day("2024-01-02"), day_with(&[(9, "x", false)]));
        let now = at(2024, 1, 3, 10, 0);
        assert_eq!(
            compute_pending(&snapshot.days, &snapshot.weeks, &snapshot.months, &now),
            snapshot.pending(&now)
        );
    }
}
