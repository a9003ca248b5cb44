//! Typed access to the per-user record collections in the document store.
//!
//! Without a backend the store runs offline: reads come back empty, writes
//! are dropped, and subscriptions deliver one default snapshot and end.

use std::fmt;
use std::sync::Arc;
use std::sync::mpsc;

use serde_json::Value;
use tracing::{debug, info};

use crate::backend::{DocPath, DocumentBackend};
use crate::keys::{DayKey, MonthKey, WeekKey};
use crate::pending::CollectionUpdate;
use crate::record::{
    DayMap, DayRecord, GoalRecord, MonthMap, MonthRecord, WeekMap, WeekRecord, decode_days,
    decode_months, decode_weeks,
};
use crate::subscription::{Subscription, Unsubscribe};

const DAYS: &str = "days";
const WEEKS: &str = "weeks";
const MONTHS: &str = "months";

#[derive(Clone, Default)]
pub struct RecordStore {
    backend: Option<Arc<dyn DocumentBackend>>,
}

impl fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let backend = self.backend.as_ref().map(|backend| backend.describe());
        f.debug_struct("RecordStore")
            .field("backend", &backend)
            .finish()
    }
}

impl RecordStore {
    pub fn new(backend: Arc<dyn DocumentBackend>) -> Self {
        info!(backend = %backend.describe(), "record store online");
        Self {
            backend: Some(backend),
        }
    }

    pub fn offline() -> Self {
        Self { backend: None }
    }

    pub fn is_online(&self) -> bool {
        self.backend.is_some()
    }

    pub fn backend(&self) -> Option<&Arc<dyn DocumentBackend>> {
        self.backend.as_ref()
    }

    #[tracing::instrument(skip(self), fields(day = %day))]
    pub fn read_day(&self, uid: &str, day: &DayKey) -> anyhow::Result<DayRecord> {
        let value = self.read(&record_path(uid, DAYS, day.as_str())?)?;
        Ok(DayRecord::from_value(value.as_ref()))
    }

    #[tracing::instrument(skip(self, record), fields(day = %day))]
    pub fn write_day(&self, uid: &str, day: &DayKey, record: &DayRecord) -> anyhow::Result<()> {
        self.write(&record_path(uid, DAYS, day.as_str())?, record.to_value())
    }

    #[tracing::instrument(skip(self), fields(week = %week))]
    pub fn read_week(&self, uid: &str, week: &WeekKey) -> anyhow::Result<WeekRecord> {
        let value = self.read(&record_path(uid, WEEKS, week.as_str())?)?;
        Ok(GoalRecord::from_value(value.as_ref()))
    }

    #[tracing::instrument(skip(self, record), fields(week = %week))]
    pub fn write_week(&self, uid: &str, week: &WeekKey, record: &WeekRecord) -> anyhow::Result<()> {
        self.write(&record_path(uid, WEEKS, week.as_str())?, record.to_value())
    }

    #[tracing::instrument(skip(self), fields(month = %month))]
    pub fn read_month(&self, uid: &str, month: &MonthKey) -> anyhow::Result<MonthRecord> {
        let value = self.read(&record_path(uid, MONTHS, month.as_str())?)?;
        Ok(GoalRecord::from_value(value.as_ref()))
    }

    #[tracing::instrument(skip(self, record), fields(month = %month))]
    pub fn write_month(
        &self,
        uid: &str,
        month: &MonthKey,
        record: &MonthRecord,
    ) -> anyhow::Result<()> {
        self.write(&record_path(uid, MONTHS, month.as_str())?, record.to_value())
    }

    #[tracing::instrument(skip(self))]
    pub fn read_days(&self, uid: &str) -> anyhow::Result<DayMap> {
        let value = self.read(&collection_path(uid, DAYS)?)?;
        Ok(decode_days(value.as_ref()))
    }

    #[tracing::instrument(skip(self))]
    pub fn read_weeks(&self, uid: &str) -> anyhow::Result<WeekMap> {
        let value = self.read(&collection_path(uid, WEEKS)?)?;
        Ok(decode_weeks(value.as_ref()))
    }

    #[tracing::instrument(skip(self))]
    pub fn read_months(&self, uid: &str) -> anyhow::Result<MonthMap> {
        let value = self.read(&collection_path(uid, MONTHS)?)?;
        Ok(decode_months(value.as_ref()))
    }

    pub fn subscribe_day(&self, uid: &str, day: &DayKey) -> anyhow::Result<Subscription<DayRecord>> {
        self.subscribe(record_path(uid, DAYS, day.as_str())?, |value| {
            DayRecord::from_value(value)
        })
    }

    pub fn subscribe_week(
        &self,
        uid: &str,
        week: &WeekKey,
    ) -> anyhow::Result<Subscription<WeekRecord>> {
        self.subscribe(record_path(uid, WEEKS, week.as_str())?, |value| {
            GoalRecord::from_value(value)
        })
    }

    pub fn subscribe_month(
        &self,
        uid: &str,
        month: &MonthKey,
    ) -> anyhow::Result<Subscription<MonthRecord>> {
        self.subscribe(record_path(uid, MONTHS, month.as_str())?, |value| {
            GoalRecord::from_value(value)
        })
    }

    pub fn subscribe_days(&self, uid: &str) -> anyhow::Result<Subscription<DayMap>> {
        self.subscribe(collection_path(uid, DAYS)?, decode_days)
    }

    pub fn subscribe_weeks(&self, uid: &str) -> anyhow::Result<Subscription<WeekMap>> {
        self.subscribe(collection_path(uid, WEEKS)?, decode_weeks)
    }

    pub fn subscribe_months(&self, uid: &str) -> anyhow::Result<Subscription<MonthMap>> {
        self.subscribe(collection_path(uid, MONTHS)?, decode_months)
    }

    /// One stream carrying snapshots of all three collections, in whatever
    /// order they arrive. Cancelling it releases every underlying watch.
    #[tracing::instrument(skip(self))]
    pub fn subscribe_all(&self, uid: &str) -> anyhow::Result<Subscription<CollectionUpdate>> {
        let Some(backend) = &self.backend else {
            return Ok(Subscription::from_values([
                CollectionUpdate::Days(DayMap::new()),
                CollectionUpdate::Weeks(WeekMap::new()),
                CollectionUpdate::Months(MonthMap::new()),
            ]));
        };

        let (tx, rx) = mpsc::channel();
        let mut handles = Vec::with_capacity(3);

        let days_tx = tx.clone();
        handles.push(backend.watch(
            &collection_path(uid, DAYS)?,
            Box::new(move |value| {
                let _ = days_tx.send(CollectionUpdate::Days(decode_days(value.as_ref())));
            }),
        )?);

        let weeks_tx = tx.clone();
        handles.push(backend.watch(
            &collection_path(uid, WEEKS)?,
            Box::new(move |value| {
                let _ = weeks_tx.send(CollectionUpdate::Weeks(decode_weeks(value.as_ref())));
            }),
        )?);

        handles.push(backend.watch(
            &collection_path(uid, MONTHS)?,
            Box::new(move |value| {
                let _ = tx.send(CollectionUpdate::Months(decode_months(value.as_ref())));
            }),
        )?);

        debug!("subscribed to all collections");
        Ok(Subscription::new(rx, Unsubscribe::join(handles)))
    }

    fn subscribe<T, F>(&self, path: DocPath, decode: F) -> anyhow::Result<Subscription<T>>
    where
        T: Send + 'static,
        F: Fn(Option<&Value>) -> T + Send + 'static,
    {
        let Some(backend) = &self.backend else {
            return Ok(Subscription::once(decode(None)));
        };

        let (tx, rx) = mpsc::channel();
        let handle = backend.watch(
            &path,
            Box::new(move |value| {
                let _ = tx.send(decode(value.as_ref()));
            }),
        )?;
        debug!(path = %path, "subscribed");
        Ok(Subscription::new(rx, handle))
    }

    fn read(&self, path: &DocPath) -> anyhow::Result<Option<Value>> {
        match &self.backend {
            Some(backend) => backend.get(path),
            None => Ok(None),
        }
    }

    fn write(&self, path: &DocPath, value: Value) -> anyhow::Result<()> {
        match &self.backend {
            Some(backend) => backend.set(path, value),
            None => {
                debug!(path = %path, "offline; write skipped");
                Ok(())
            }
        }
    }
}

fn collection_path(uid: &str, collection: &str) -> anyhow::Result<DocPath> {
    DocPath::new(["users", uid, collection])
}

fn record_path(uid: &str, collection: &str, key: &str) -> anyhow::Result<DocPath> {
    collection_path(uid, collection)?.child(key)
}
