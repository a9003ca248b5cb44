//! Canonical partition keys for day, week and month records.
//!
//! Every key is a zero-padded ISO string, so ordering keys as strings
//! is the same as ordering them chronologically. That only holds for
//! four-digit years, so parsed keys outside 0000..=9999 are rejected.

use std::fmt;
use std::str::FromStr;

use chrono::{
  DateTime,
  Datelike,
  Days,
  Months,
  NaiveDate,
  TimeZone,
  Weekday
};
use serde::{
  Deserialize,
  Serialize
};
use thiserror::Error;

const DAY_FORMAT: &str = "%Y-%m-%d";
const MONTH_FORMAT: &str = "%Y-%m";

pub const MIN_KEY_YEAR: i32 = 0;
pub const MAX_KEY_YEAR: i32 = 9999;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyParseError {
  #[error("invalid day key: {0}")]
  Day(String),
  #[error("invalid week key: {0}")]
  Week(String),
  #[error(
    "week key {0} does not fall on a \
     monday"
  )]
  NotMonday(String),
  #[error("invalid month key: {0}")]
  Month(String),
  #[error(
    "{0} is outside years 0000..=9999"
  )]
  OutOfRange(String)
}

/// Whether `date` renders as a key
/// that still sorts chronologically.
pub fn in_key_range(
  date: NaiveDate
) -> bool {
  (MIN_KEY_YEAR..=MAX_KEY_YEAR)
    .contains(&date.year())
}

/// `YYYY-MM-DD` of a local calendar day.
#[derive(
  Debug,
  Clone,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  Serialize,
  Deserialize
)]
#[serde(
  try_from = "String",
  into = "String"
)]
pub struct DayKey {
  text: String,
  date: NaiveDate
}

/// `YYYY-MM-DD` of the Monday that
/// starts the week.
#[derive(
  Debug,
  Clone,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  Serialize,
  Deserialize
)]
#[serde(
  try_from = "String",
  into = "String"
)]
pub struct WeekKey {
  text:   String,
  monday: NaiveDate
}

/// `YYYY-MM` of a calendar month.
#[derive(
  Debug,
  Clone,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  Serialize,
  Deserialize
)]
#[serde(
  try_from = "String",
  into = "String"
)]
pub struct MonthKey {
  text:  String,
  first: NaiveDate
}

#[must_use]
pub fn day_key<Z: TimeZone>(
  t: &DateTime<Z>
) -> DayKey {
  DayKey::from_date(t.date_naive())
}

#[must_use]
pub fn week_key<Z: TimeZone>(
  t: &DateTime<Z>
) -> WeekKey {
  WeekKey::containing(t.date_naive())
}

#[must_use]
pub fn month_key<Z: TimeZone>(
  t: &DateTime<Z>
) -> MonthKey {
  MonthKey::containing(t.date_naive())
}

/// Days to step back from `date` to
/// reach the Monday on or before it.
fn days_since_monday(
  date: NaiveDate
) -> u64 {
  let sunday_indexed = date
    .weekday()
    .num_days_from_sunday();
  u64::from((sunday_indexed + 6) % 7)
}

impl DayKey {
  #[must_use]
  pub fn from_date(
    date: NaiveDate
  ) -> Self {
    Self {
      text: date
        .format(DAY_FORMAT)
        .to_string(),
      date
    }
  }

  pub fn as_str(&self) -> &str {
    &self.text
  }

  pub fn date(&self) -> NaiveDate {
    self.date
  }

  #[must_use]
  pub fn week(&self) -> WeekKey {
    WeekKey::containing(self.date)
  }

  #[must_use]
  pub fn month(&self) -> MonthKey {
    MonthKey::containing(self.date)
  }

  #[must_use]
  pub fn prev(&self) -> Self {
    self
      .date
      .checked_sub_days(Days::new(1))
      .map(Self::from_date)
      .unwrap_or_else(|| self.clone())
  }

  #[must_use]
  pub fn next(&self) -> Self {
    self
      .date
      .checked_add_days(Days::new(1))
      .map(Self::from_date)
      .unwrap_or_else(|| self.clone())
  }
}

impl WeekKey {
  #[must_use]
  pub fn containing(
    date: NaiveDate
  ) -> Self {
    let monday = date
      .checked_sub_days(Days::new(
        days_since_monday(date)
      ))
      .unwrap_or(date);
    Self {
      text: monday
        .format(DAY_FORMAT)
        .to_string(),
      monday
    }
  }

  pub fn as_str(&self) -> &str {
    &self.text
  }

  pub fn monday(&self) -> NaiveDate {
    self.monday
  }

  pub fn contains(
    &self,
    day: &DayKey
  ) -> bool {
    day.week().monday == self.monday
  }

  #[must_use]
  pub fn prev(&self) -> Self {
    self
      .monday
      .checked_sub_days(Days::new(7))
      .map(Self::containing)
      .unwrap_or_else(|| self.clone())
  }

  #[must_use]
  pub fn next(&self) -> Self {
    self
      .monday
      .checked_add_days(Days::new(7))
      .map(Self::containing)
      .unwrap_or_else(|| self.clone())
  }
}

impl MonthKey {
  #[must_use]
  pub fn containing(
    date: NaiveDate
  ) -> Self {
    let first = date
      .with_day(1)
      .unwrap_or(date);
    Self {
      text: first
        .format(MONTH_FORMAT)
        .to_string(),
      first
    }
  }

  pub fn as_str(&self) -> &str {
    &self.text
  }

  pub fn first_day(&self) -> NaiveDate {
    self.first
  }

  #[must_use]
  pub fn prev(&self) -> Self {
    self
      .first
      .checked_sub_months(Months::new(
        1
      ))
      .map(Self::containing)
      .unwrap_or_else(|| self.clone())
  }

  #[must_use]
  pub fn next(&self) -> Self {
    self
      .first
      .checked_add_months(Months::new(
        1
      ))
      .map(Self::containing)
      .unwrap_or_else(|| self.clone())
  }
}

impl FromStr for DayKey {
  type Err = KeyParseError;

  fn from_str(
    s: &str
  ) -> Result<Self, Self::Err> {
    let trimmed = s.trim();
    let date =
      NaiveDate::parse_from_str(
        trimmed, DAY_FORMAT
      )
      .map_err(|_| {
        KeyParseError::Day(
          s.to_string()
        )
      })?;
    if !in_key_range(date) {
      return Err(
        KeyParseError::OutOfRange(
          s.to_string()
        )
      );
    }
    let key = Self::from_date(date);
    // Reject non-padded spellings
    // such as 2024-1-5.
    if key.text != trimmed {
      return Err(KeyParseError::Day(
        s.to_string()
      ));
    }
    Ok(key)
  }
}

impl FromStr for WeekKey {
  type Err = KeyParseError;

  fn from_str(
    s: &str
  ) -> Result<Self, Self::Err> {
    let day: DayKey =
      s.parse().map_err(|err| {
        match err {
          | KeyParseError::OutOfRange(
            _
          ) => err,
          | _ => KeyParseError::Week(
            s.to_string()
          )
        }
      })?;
    if day.date.weekday()
      != Weekday::Mon
    {
      return Err(
        KeyParseError::NotMonday(
          s.to_string()
        )
      );
    }
    Ok(Self::containing(day.date))
  }
}

impl FromStr for MonthKey {
  type Err = KeyParseError;

  fn from_str(
    s: &str
  ) -> Result<Self, Self::Err> {
    let trimmed = s.trim();
    let first =
      NaiveDate::parse_from_str(
        &format!("{trimmed}-01"),
        DAY_FORMAT
      )
      .map_err(|_| {
        KeyParseError::Month(
          s.to_string()
        )
      })?;
    if !in_key_range(first) {
      return Err(
        KeyParseError::OutOfRange(
          s.to_string()
        )
      );
    }
    let key = Self::containing(first);
    if key.text != trimmed {
      return Err(
        KeyParseError::Month(
          s.to_string()
        )
      );
    }
    Ok(key)
  }
}

macro_rules! string_conversions {
  ($($key:ty),+) => {
    $(
      impl fmt::Display for $key {
        fn fmt(
          &self,
          f: &mut fmt::Formatter<'_>
        ) -> fmt::Result {
          f.write_str(&self.text)
        }
      }

      impl TryFrom<String> for $key {
        type Error = KeyParseError;

        fn try_from(
          value: String
        ) -> Result<Self, Self::Error> {
          value.parse()
        }
      }

      impl From<$key> for String {
        fn from(key: $key) -> Self {
          key.text
        }
      }
    )+
  };
}

string_conversions!(
  DayKey, WeekKey, MonthKey
);
