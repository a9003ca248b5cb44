use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::keys::{DayKey, MonthKey, WeekKey};

pub const HOURS_PER_DAY: u8 = 24;

/// One hourly task or one goal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub done: bool,
}

impl Entry {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            done: false,
        }
    }

    pub fn is_pending(&self) -> bool {
        !self.done && !self.text.trim().is_empty()
    }

    /// Bare strings become open entries, objects keep what they can, and
    /// anything else collapses to an empty entry.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(text) => Self::new(text.clone()),
            Value::Object(fields) => Self {
                text: fields
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                done: fields.get("done").is_some_and(truthy),
            },
            _ => Self::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayRecord {
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub tasks: BTreeMap<u8, Entry>,
}

impl DayRecord {
    pub fn from_value(value: Option<&Value>) -> Self {
        let Some(Value::Object(fields)) = value else {
            return Self::default();
        };

        let note = fields
            .get("note")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut tasks = BTreeMap::new();
        match fields.get("tasks") {
            Some(Value::Object(raw)) => {
                for (hour, entry) in raw {
                    match parse_hour(hour) {
                        Some(hour) => {
                            tasks.insert(hour, Entry::from_value(entry));
                        }
                        None => warn!(hour = %hour, "dropping task with invalid hour"),
                    }
                }
            }
            // Sequential hour keys can come back as a JSON array.
            Some(Value::Array(raw)) => {
                for (hour, entry) in raw.iter().enumerate() {
                    if entry.is_null() {
                        continue;
                    }
                    match u8::try_from(hour) {
                        Ok(hour) if hour < HOURS_PER_DAY => {
                            tasks.insert(hour, Entry::from_value(entry));
                        }
                        _ => warn!(hour, "dropping task with invalid hour"),
                    }
                }
            }
            _ => {}
        }

        Self { note, tasks }
    }

    pub fn to_value(&self) -> Value {
        let tasks: Map<String, Value> = self
            .tasks
            .iter()
            .map(|(hour, entry)| (hour.to_string(), entry_value(entry)))
            .collect();
        let mut fields = Map::new();
        fields.insert("tasks".to_string(), Value::Object(tasks));
        fields.insert("note".to_string(), Value::String(self.note.clone()));
        Value::Object(fields)
    }

    pub fn task(&self, hour: u8) -> Option<&Entry> {
        self.tasks.get(&hour)
    }

    pub fn is_empty(&self) -> bool {
        self.note.is_empty() && self.tasks.is_empty()
    }
}

/// Ordered goal list shared by weeks and months. The position of a goal is
/// its identity within the period.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalRecord {
    #[serde(default)]
    pub goals: Vec<Entry>,
}

pub type WeekRecord = GoalRecord;
pub type MonthRecord = GoalRecord;

impl GoalRecord {
    pub fn from_value(value: Option<&Value>) -> Self {
        let goals = match value {
            Some(Value::Object(fields)) => match fields.get("goals") {
                Some(Value::Array(raw)) => raw.iter().map(Entry::from_value).collect(),
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        Self { goals }
    }

    pub fn to_value(&self) -> Value {
        let goals = self.goals.iter().map(entry_value).collect();
        let mut fields = Map::new();
        fields.insert("goals".to_string(), Value::Array(goals));
        Value::Object(fields)
    }

    pub fn goal(&self, index: usize) -> Option<&Entry> {
        self.goals.get(index)
    }
}

pub type DayMap = BTreeMap<DayKey, DayRecord>;
pub type WeekMap = BTreeMap<WeekKey, WeekRecord>;
pub type MonthMap = BTreeMap<MonthKey, MonthRecord>;

/// Everything known about one user at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub days: DayMap,
    #[serde(default)]
    pub weeks: WeekMap,
    #[serde(default)]
    pub months: MonthMap,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.days.is_empty() && self.weeks.is_empty() && self.months.is_empty()
    }
}

pub fn decode_days(value: Option<&Value>) -> DayMap {
    decode_collection(value, "day", |raw| DayRecord::from_value(Some(raw)))
}

pub fn decode_weeks(value: Option<&Value>) -> WeekMap {
    decode_collection(value, "week", |raw| GoalRecord::from_value(Some(raw)))
}

pub fn decode_months(value: Option<&Value>) -> MonthMap {
    decode_collection(value, "month", |raw| GoalRecord::from_value(Some(raw)))
}

fn decode_collection<K, R>(
    value: Option<&Value>,
    kind: &str,
    decode: impl Fn(&Value) -> R,
) -> BTreeMap<K, R>
where
    K: FromStr + Ord,
{
    let Some(Value::Object(children)) = value else {
        return BTreeMap::new();
    };

    let mut out = BTreeMap::new();
    for (raw_key, raw) in children {
        match raw_key.parse::<K>() {
            Ok(key) => {
                out.insert(key, decode(raw));
            }
            Err(_) => warn!(kind, key = %raw_key, "skipping record with malformed key"),
        }
    }
    out
}

fn parse_hour(raw: &str) -> Option<u8> {
    raw.trim()
        .parse::<u8>()
        .ok()
        .filter(|hour| *hour < HOURS_PER_DAY)
}

fn entry_value(entry: &Entry) -> Value {
    let mut fields = Map::new();
    fields.insert("text".to_string(), Value::String(entry.text.clone()));
    fields.insert("done".to_string(), Value::Bool(entry.done));
    Value::Object(fields)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
