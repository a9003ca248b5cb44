//! The working set behind every command: the signed-in identity, its cached
//! records, and the remote store they sync with.
//!
//! Edits land in the local cache first and are marked unsynced. When
//! autosave is on and someone is signed in, the touched record is also
//! pushed and the mark dropped once the remote store accepts it. Push
//! failures are logged and never undo the local edit, and a pull never
//! overwrites a record that is still marked.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use chrono::{DateTime, TimeZone};
use tracing::{debug, info, warn};

use crate::auth::User;
use crate::datastore::{CacheDocument, LocalCache, Namespace, UnsyncedKeys};
use crate::keys::{DayKey, MonthKey, WeekKey};
use crate::pending::{
    CollectionUpdate, LiveAggregator, PendingReport, mark_daily_done, mark_monthly_done,
    mark_weekly_done,
};
use crate::record::{DayRecord, Entry, GoalRecord, HOURS_PER_DAY, Snapshot};
use crate::remote::RecordStore;
use crate::subscription::Subscription;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GoalPeriod {
    Week(WeekKey),
    Month(MonthKey),
}

impl fmt::Display for GoalPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Week(week) => write!(f, "week {week}"),
            Self::Month(month) => write!(f, "month {month}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Offline,
    Guest,
    Merged {
        days: usize,
        weeks: usize,
        months: usize,
    },
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Offline,
    Guest,
    Pushed,
    Failed(Vec<String>),
}

#[derive(Debug)]
pub struct Tracker {
    cache: LocalCache,
    remote: RecordStore,
    identity: Option<User>,
    namespace: Namespace,
    doc: CacheDocument,
    autosave: bool,
}

impl Tracker {
    #[tracing::instrument(skip(cache, remote, identity))]
    pub fn open(cache: LocalCache, remote: RecordStore, identity: Option<User>) -> Self {
        let namespace = Namespace::for_uid(identity.as_ref().map(|user| user.uid.as_str()));
        let doc = cache.load(&namespace);
        debug!(namespace = %namespace, online = remote.is_online(), "opened tracker");
        Self {
            cache,
            remote,
            identity,
            namespace,
            doc,
            autosave: true,
        }
    }

    #[must_use]
    pub fn with_autosave(mut self, autosave: bool) -> Self {
        self.autosave = autosave;
        self
    }

    pub fn identity(&self) -> Option<&User> {
        self.identity.as_ref()
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn remote(&self) -> &RecordStore {
        &self.remote
    }

    /// Moves to another identity. The previous user's cache is evicted so
    /// nothing of theirs survives on this machine after they sign out.
    #[tracing::instrument(skip(self, user), fields(from = %self.namespace))]
    pub fn switch_identity(&mut self, user: Option<User>) -> anyhow::Result<()> {
        let next = Namespace::for_uid(user.as_ref().map(|user| user.uid.as_str()));
        if next == self.namespace {
            self.identity = user;
            return Ok(());
        }

        if matches!(self.namespace, Namespace::User(_)) {
            self.cache.evict(&self.namespace)?;
        }
        self.doc = self.cache.load(&next);
        info!(to = %next, "switched identity");
        self.namespace = next;
        self.identity = user;
        Ok(())
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.doc.records
    }

    /// Keys edited on this machine that the remote store has not taken yet.
    pub fn unsynced(&self) -> &UnsyncedKeys {
        &self.doc.unsynced
    }

    pub fn day(&self, day: &DayKey) -> DayRecord {
        self.doc.records.days.get(day).cloned().unwrap_or_default()
    }

    pub fn week(&self, week: &WeekKey) -> GoalRecord {
        self.doc.records.weeks.get(week).cloned().unwrap_or_default()
    }

    pub fn month(&self, month: &MonthKey) -> GoalRecord {
        self.doc.records.months.get(month).cloned().unwrap_or_default()
    }

    pub fn goals(&self, period: &GoalPeriod) -> GoalRecord {
        match period {
            GoalPeriod::Week(week) => self.week(week),
            GoalPeriod::Month(month) => self.month(month),
        }
    }

    /// Days with a non-blank note, newest first.
    pub fn notes(&self) -> Vec<(DayKey, String)> {
        self.doc
            .records
            .days
            .iter()
            .rev()
            .filter(|(_, record)| !record.note.trim().is_empty())
            .map(|(day, record)| (day.clone(), record.note.clone()))
            .collect()
    }

    #[tracing::instrument(skip(self, text), fields(day = %day))]
    pub fn set_task(&mut self, day: &DayKey, hour: u8, text: &str) -> anyhow::Result<()> {
        check_hour(hour)?;
        let record = self.doc.records.days.entry(day.clone()).or_default();
        let entry = record.tasks.entry(hour).or_default();
        entry.text = text.to_string();
        self.commit_day(day)
    }

    #[tracing::instrument(skip(self), fields(day = %day))]
    pub fn set_task_done(&mut self, day: &DayKey, hour: u8, done: bool) -> anyhow::Result<()> {
        check_hour(hour)?;
        let entry = self
            .doc
            .records
            .days
            .get_mut(day)
            .and_then(|record| record.tasks.get_mut(&hour))
            .ok_or_else(|| anyhow!("no task at {day} {hour:02}:00"))?;
        entry.done = done;
        self.commit_day(day)
    }

    #[tracing::instrument(skip(self, note), fields(day = %day))]
    pub fn set_note(&mut self, day: &DayKey, note: &str) -> anyhow::Result<()> {
        self.doc.records.days.entry(day.clone()).or_default().note = note.to_string();
        self.commit_day(day)
    }

    /// Copies a task into every listed day at the same hour. Returns how
    /// many distinct days were written.
    #[tracing::instrument(skip(self, text, days))]
    pub fn repeat_task(&mut self, hour: u8, text: &str, days: &[DayKey]) -> anyhow::Result<usize> {
        check_hour(hour)?;
        let targets: BTreeSet<DayKey> = days.iter().cloned().collect();
        for day in &targets {
            let record = self.doc.records.days.entry(day.clone()).or_default();
            record.tasks.insert(hour, Entry::new(text));
            self.doc.unsynced.days.insert(day.clone());
        }
        self.persist()?;

        let mut pushed = 0;
        for day in &targets {
            if self.push_day(day) {
                self.doc.unsynced.days.remove(day);
                pushed += 1;
            }
        }
        if pushed > 0 {
            self.persist()?;
        }
        info!(count = targets.len(), pushed, "repeated task");
        Ok(targets.len())
    }

    /// Empties the note and tasks of `day` in the local copy only. The day
    /// stays unsynced until `save` pushes it.
    #[tracing::instrument(skip(self), fields(day = %day))]
    pub fn clear_day(&mut self, day: &DayKey) -> anyhow::Result<()> {
        let record = self.doc.records.days.entry(day.clone()).or_default();
        record.note.clear();
        record.tasks.clear();
        self.doc.unsynced.days.insert(day.clone());
        self.persist()
    }

    #[tracing::instrument(skip(self, text), fields(period = %period))]
    pub fn set_goal(&mut self, period: &GoalPeriod, index: usize, text: &str) -> anyhow::Result<()> {
        let goal = self
            .goals_mut(period)
            .goals
            .get_mut(index)
            .ok_or_else(|| anyhow!("{period} has no goal {}", index + 1))?;
        goal.text = text.to_string();
        self.commit_goals(period)
    }

    #[tracing::instrument(skip(self), fields(period = %period))]
    pub fn set_goal_done(&mut self, period: &GoalPeriod, index: usize, done: bool) -> anyhow::Result<()> {
        let goal = self
            .goals_mut(period)
            .goals
            .get_mut(index)
            .ok_or_else(|| anyhow!("{period} has no goal {}", index + 1))?;
        goal.done = done;
        self.commit_goals(period)
    }

    /// Appends a goal and returns its index.
    #[tracing::instrument(skip(self, text), fields(period = %period))]
    pub fn add_goal(&mut self, period: &GoalPeriod, text: &str) -> anyhow::Result<usize> {
        let goals = &mut self.goals_mut(period).goals;
        goals.push(Entry::new(text));
        let index = goals.len() - 1;
        self.commit_goals(period)?;
        Ok(index)
    }

    #[tracing::instrument(skip(self), fields(period = %period))]
    pub fn remove_last_goal(&mut self, period: &GoalPeriod) -> anyhow::Result<Option<Entry>> {
        let removed = self.goals_mut(period).goals.pop();
        if removed.is_some() {
            self.commit_goals(period)?;
        }
        Ok(removed)
    }

    pub fn pending<Z: TimeZone>(&self, now: &DateTime<Z>) -> PendingReport {
        self.doc.records.pending(now)
    }

    pub fn mark_daily_done<Z: TimeZone>(
        &mut self,
        now: &DateTime<Z>,
        day: &DayKey,
        hour: u8,
    ) -> anyhow::Result<()> {
        mark_daily_done(&mut self.doc.records, now, day, hour)?;
        self.commit_day(day)
    }

    pub fn mark_weekly_done<Z: TimeZone>(
        &mut self,
        now: &DateTime<Z>,
        week: &WeekKey,
        index: usize,
    ) -> anyhow::Result<()> {
        mark_weekly_done(&mut self.doc.records, now, week, index)?;
        self.commit_goals(&GoalPeriod::Week(week.clone()))
    }

    pub fn mark_monthly_done<Z: TimeZone>(
        &mut self,
        now: &DateTime<Z>,
        month: &MonthKey,
        index: usize,
    ) -> anyhow::Result<()> {
        mark_monthly_done(&mut self.doc.records, now, month, index)?;
        self.commit_goals(&GoalPeriod::Month(month.clone()))
    }

    /// Pushes the given day, week and month records. Each write is
    /// attempted even if an earlier one failed; the ones that land are no
    /// longer unsynced.
    #[tracing::instrument(skip(self), fields(day = %day, week = %week, month = %month))]
    pub fn save(&mut self, day: &DayKey, week: &WeekKey, month: &MonthKey) -> PushOutcome {
        if !self.remote.is_online() {
            return PushOutcome::Offline;
        }
        let Some(user) = &self.identity else {
            return PushOutcome::Guest;
        };

        let mut failures = Vec::new();
        match self.remote.write_day(&user.uid, day, &self.day(day)) {
            Ok(()) => {
                self.doc.unsynced.days.remove(day);
            }
            Err(err) => failures.push(format!("day {day}: {err:#}")),
        }
        match self.remote.write_week(&user.uid, week, &self.week(week)) {
            Ok(()) => {
                self.doc.unsynced.weeks.remove(week);
            }
            Err(err) => failures.push(format!("week {week}: {err:#}")),
        }
        match self.remote.write_month(&user.uid, month, &self.month(month)) {
            Ok(()) => {
                self.doc.unsynced.months.remove(month);
            }
            Err(err) => failures.push(format!("month {month}: {err:#}")),
        }

        if let Err(err) = self.persist() {
            warn!(error = %format!("{err:#}"), "could not record saved keys in the cache");
        }

        if failures.is_empty() {
            info!("saved records");
            PushOutcome::Pushed
        } else {
            for failure in &failures {
                warn!(failure = %failure, "save failed");
            }
            PushOutcome::Failed(failures)
        }
    }

    /// Pulls every remote record into the cache. Remote values replace
    /// cached ones key by key, except for records still unsynced here;
    /// records only present locally are kept.
    #[tracing::instrument(skip(self))]
    pub fn sync(&mut self) -> anyhow::Result<SyncOutcome> {
        if !self.remote.is_online() {
            return Ok(SyncOutcome::Offline);
        }
        let Some(user) = &self.identity else {
            return Ok(SyncOutcome::Guest);
        };

        let fetched = self
            .remote
            .read_days(&user.uid)
            .and_then(|days| Ok((days, self.remote.read_weeks(&user.uid)?)))
            .and_then(|(days, weeks)| Ok((days, weeks, self.remote.read_months(&user.uid)?)));
        let (days, weeks, months) = match fetched {
            Ok(collections) => collections,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "sync failed; keeping cached records");
                return Ok(SyncOutcome::Failed(format!("{err:#}")));
            }
        };

        let outcome = SyncOutcome::Merged {
            days: days.len(),
            weeks: weeks.len(),
            months: months.len(),
        };
        let unsynced = &self.doc.unsynced;
        let records = &mut self.doc.records;
        records
            .days
            .extend(days.into_iter().filter(|(key, _)| !unsynced.days.contains(key)));
        records
            .weeks
            .extend(weeks.into_iter().filter(|(key, _)| !unsynced.weeks.contains(key)));
        records
            .months
            .extend(months.into_iter().filter(|(key, _)| !unsynced.months.contains(key)));
        self.persist()?;
        info!(?outcome, kept_local = self.doc.unsynced.len(), "synced");
        Ok(outcome)
    }

    /// Live pending reports for the signed-in user. Guests and offline
    /// sessions get a single report built from the cache.
    #[tracing::instrument(skip(self))]
    pub fn watch_pending(&self) -> anyhow::Result<PendingWatch> {
        let updates = match (&self.identity, self.remote.is_online()) {
            (Some(user), true) => self
                .remote
                .subscribe_all(&user.uid)
                .context("failed to subscribe to records")?,
            _ => Subscription::from_values([
                CollectionUpdate::Days(self.doc.records.days.clone()),
                CollectionUpdate::Weeks(self.doc.records.weeks.clone()),
                CollectionUpdate::Months(self.doc.records.months.clone()),
            ]),
        };
        Ok(PendingWatch {
            updates,
            live: LiveAggregator::new(),
        })
    }

    fn goals_mut(&mut self, period: &GoalPeriod) -> &mut GoalRecord {
        match period {
            GoalPeriod::Week(week) => self.doc.records.weeks.entry(week.clone()).or_default(),
            GoalPeriod::Month(month) => self.doc.records.months.entry(month.clone()).or_default(),
        }
    }

    fn persist(&self) -> anyhow::Result<()> {
        self.cache.save(&self.namespace, &self.doc)
    }

    fn commit_day(&mut self, day: &DayKey) -> anyhow::Result<()> {
        self.doc.unsynced.days.insert(day.clone());
        self.persist()?;
        if self.push_day(day) {
            self.doc.unsynced.days.remove(day);
            self.persist()?;
        }
        Ok(())
    }

    fn commit_goals(&mut self, period: &GoalPeriod) -> anyhow::Result<()> {
        match period {
            GoalPeriod::Week(week) => self.doc.unsynced.weeks.insert(week.clone()),
            GoalPeriod::Month(month) => self.doc.unsynced.months.insert(month.clone()),
        };
        self.persist()?;
        let Some(uid) = self.push_target() else {
            return Ok(());
        };
        let pushed = match period {
            GoalPeriod::Week(week) => self.remote.write_week(uid, week, &self.week(week)),
            GoalPeriod::Month(month) => self.remote.write_month(uid, month, &self.month(month)),
        };
        if let Err(err) = pushed {
            warn!(period = %period, error = %format!("{err:#}"), "push failed; kept locally");
            return Ok(());
        }
        match period {
            GoalPeriod::Week(week) => self.doc.unsynced.weeks.remove(week),
            GoalPeriod::Month(month) => self.doc.unsynced.months.remove(month),
        };
        self.persist()
    }

    /// Whether the remote store took the day.
    fn push_day(&self, day: &DayKey) -> bool {
        let Some(uid) = self.push_target() else {
            return false;
        };
        match self.remote.write_day(uid, day, &self.day(day)) {
            Ok(()) => true,
            Err(err) => {
                warn!(day = %day, error = %format!("{err:#}"), "push failed; kept locally");
                false
            }
        }
    }

    fn push_target(&self) -> Option<&str> {
        if !self.autosave || !self.remote.is_online() {
            return None;
        }
        self.identity.as_ref().map(|user| user.uid.as_str())
    }
}

fn check_hour(hour: u8) -> anyhow::Result<()> {
    if hour >= HOURS_PER_DAY {
        bail!("hour must be between 0 and 23, got {hour}");
    }
    Ok(())
}

/// Pending reports recomputed from each incoming collection snapshot.
#[derive(Debug)]
pub struct PendingWatch {
    updates: Subscription<CollectionUpdate>,
    live: LiveAggregator,
}

impl PendingWatch {
    /// Blocks for the next snapshot and returns the refreshed report.
    pub fn next_report<Z: TimeZone>(&mut self, now: &DateTime<Z>) -> Option<PendingReport> {
        let update = self.updates.recv()?;
        self.live.apply(update);
        Some(self.live.report(now))
    }

    pub fn next_report_timeout<Z: TimeZone>(
        &mut self,
        now: &DateTime<Z>,
        timeout: Duration,
    ) -> Option<PendingReport> {
        let update = self.updates.recv_timeout(timeout)?;
        self.live.apply(update);
        Some(self.live.report(now))
    }

    /// Applies everything already queued without blocking.
    pub fn drain(&mut self) -> usize {
        let mut applied = 0;
        while let Some(update) = self.updates.try_recv() {
            self.live.apply(update);
            applied += 1;
        }
        applied
    }

    /// Waits up to `timeout` for changes, then reports against the clock
    /// read afterwards, so hour and day rollovers show up without any
    /// write. `None` until every collection has arrived, and once the
    /// stream has ended with nothing new.
    pub fn refresh<Z, F>(&mut self, clock: F, timeout: Duration) -> Option<PendingReport>
    where
        Z: TimeZone,
        F: Fn() -> DateTime<Z>,
    {
        let changed = match self.updates.recv_timeout(timeout) {
            Some(update) => {
                self.live.apply(update);
                self.drain();
                true
            }
            None => false,
        };
        if !self.is_complete() || (!changed && self.updates.is_ended()) {
            return None;
        }
        Some(self.live.report(&clock()))
    }

    pub fn report<Z: TimeZone>(&self, now: &DateTime<Z>) -> PendingReport {
        self.live.report(now)
    }

    pub fn is_complete(&self) -> bool {
        self.live.is_complete()
    }

    /// Nothing more will arrive.
    pub fn is_ended(&self) -> bool {
        self.updates.is_ended()
    }

    pub fn cancel(&mut self) {
        self.updates.cancel();
    }
}
