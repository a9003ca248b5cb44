use std::fs;
use std::path::{
  Path,
  PathBuf
};
use std::sync::OnceLock;

use anyhow::{
  Context,
  anyhow,
  bail
};
use chrono::{
  DateTime,
  Datelike,
  Days,
  FixedOffset,
  Local,
  NaiveDate,
  Utc,
  Weekday
};
use chrono_tz::Tz;
use regex::Regex;
use serde::Deserialize;

use crate::keys::in_key_range;

const TIMEZONE_CONFIG_FILE: &str =
  "dayboard-time.toml";
const TIMEZONE_ENV_VAR: &str =
  "DAYBOARD_TIMEZONE";
const TIMEZONE_CONFIG_ENV_VAR: &str =
  "DAYBOARD_TIME_CONFIG";

#[derive(Debug, Deserialize)]
struct TimezoneConfig {
  timezone: Option<String>,
  time:     Option<TimezoneSection>
}

#[derive(Debug, Deserialize)]
struct TimezoneSection {
  timezone: Option<String>
}

/// Calendar used to turn instants into
/// local days, weeks and hours.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalendarZone {
  /// Offset reported by the operating
  /// system.
  System,
  Named(Tz)
}

impl CalendarZone {
  #[must_use]
  pub fn localize(
    &self,
    instant: DateTime<Utc>
  ) -> DateTime<FixedOffset> {
    match self {
      | Self::System => {
        instant
          .with_timezone(&Local)
          .fixed_offset()
      }
      | Self::Named(tz) => {
        instant
          .with_timezone(tz)
          .fixed_offset()
      }
    }
  }

  pub fn label(&self) -> String {
    match self {
      | Self::System => {
        "system".to_string()
      }
      | Self::Named(tz) => {
        tz.name().to_string()
      }
    }
  }
}

pub fn project_zone()
-> &'static CalendarZone {
  static PROJECT_ZONE: OnceLock<
    CalendarZone
  > = OnceLock::new();
  PROJECT_ZONE
    .get_or_init(resolve_project_zone)
}

/// The current instant on the project
/// calendar. This is the only place the
/// wall clock is read; everything
/// downstream takes `now` explicitly.
#[must_use]
pub fn local_now()
-> DateTime<FixedOffset> {
  project_zone().localize(Utc::now())
}

fn resolve_project_zone() -> CalendarZone
{
  if let Ok(raw) =
    std::env::var(TIMEZONE_ENV_VAR)
    && let Some(tz) = parse_timezone(
      &raw,
      TIMEZONE_ENV_VAR
    )
  {
    return CalendarZone::Named(tz);
  }

  if let Some(path) =
    timezone_config_path()
    && let Some(tz) =
      load_timezone_from_file(&path)
  {
    return CalendarZone::Named(tz);
  }

  tracing::debug!(
    "no timezone configured; using \
     system local offset"
  );
  CalendarZone::System
}

fn timezone_config_path()
-> Option<PathBuf> {
  if let Ok(raw) = std::env::var(
    TIMEZONE_CONFIG_ENV_VAR
  ) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
      return Some(PathBuf::from(
        trimmed
      ));
    }
  }

  std::env::current_dir().ok().map(
    |dir| {
      dir.join(TIMEZONE_CONFIG_FILE)
    }
  )
}

fn load_timezone_from_file(
  path: &Path
) -> Option<Tz> {
  if !path.exists() {
    tracing::debug!(
      file = %path.display(),
      "timezone config file not found"
    );
    return None;
  }

  let raw = match fs::read_to_string(
    path
  ) {
    | Ok(raw) => raw,
    | Err(err) => {
      tracing::error!(
        file = %path.display(),
        error = %err,
        "failed reading timezone config file"
      );
      return None;
    }
  };

  let parsed = match toml::from_str::<
    TimezoneConfig
  >(&raw)
  {
    | Ok(parsed) => parsed,
    | Err(err) => {
      tracing::error!(
        file = %path.display(),
        error = %err,
        "failed parsing timezone config file"
      );
      return None;
    }
  };

  let timezone =
    parsed.timezone.or_else(|| {
      parsed.time.and_then(|section| {
        section.timezone
      })
    });
  let Some(timezone) = timezone else {
    tracing::warn!(
      file = %path.display(),
      "timezone config had no timezone field"
    );
    return None;
  };

  parse_timezone(
    timezone.as_str(),
    &format!("file:{}", path.display())
  )
}

fn parse_timezone(
  raw: &str,
  source: &str
) -> Option<Tz> {
  let trimmed = raw.trim();
  if trimmed.is_empty() {
    tracing::warn!(
      source,
      "timezone source was empty"
    );
    return None;
  }

  match trimmed.parse::<Tz>() {
    | Ok(tz) => {
      tracing::info!(
        source,
        timezone = %trimmed,
        "configured project timezone"
      );
      Some(tz)
    }
    | Err(err) => {
      tracing::error!(
        source,
        timezone = %trimmed,
        error = %err,
        "failed to parse timezone id"
      );
      None
    }
  }
}

/// Resolves a day expression against the
/// local date of `now`. Dates outside the
/// four-digit years keys can hold are
/// refused.
#[tracing::instrument(skip(now))]
pub fn parse_date_expr(
  input: &str,
  now: &DateTime<FixedOffset>
) -> anyhow::Result<NaiveDate> {
  let date =
    resolve_date_expr(input, now)?;
  if !in_key_range(date) {
    bail!(
      "date out of range: {input} \
       (years 0000 through 9999)"
    );
  }
  Ok(date)
}

fn resolve_date_expr(
  input: &str,
  now: &DateTime<FixedOffset>
) -> anyhow::Result<NaiveDate> {
  let token = input.trim();
  let lower =
    token.to_ascii_lowercase();
  let today = now.date_naive();

  match lower.as_str() {
    | "today" | "now" => {
      return Ok(today)
    }
    | "tomorrow" => {
      return today
        .checked_add_days(Days::new(1))
        .ok_or_else(|| {
          anyhow!(
            "date out of range: \
             tomorrow"
          )
        });
    }
    | "yesterday" => {
      return today
        .checked_sub_days(Days::new(1))
        .ok_or_else(|| {
          anyhow!(
            "date out of range: \
             yesterday"
          )
        });
    }
    | _ => {}
  }

  if let Some(target_weekday) =
    parse_weekday_name(&lower)
  {
    return Ok(next_weekday_date(
      today,
      target_weekday
    ));
  }

  let rel_re = Regex::new(
    r"^(?P<sign>[+-])(?P<num>\d+)(?P<unit>[dw])$"
  )
  .map_err(|e| {
    anyhow!(
      "internal regex compile \
       failure: {e}"
    )
  })?;

  if let Some(caps) =
    rel_re.captures(&lower)
  {
    let sign = caps
      .name("sign")
      .map(|m| m.as_str())
      .ok_or_else(|| {
        anyhow!("missing relative sign")
      })?;
    let num: u64 = caps
      .name("num")
      .map(|m| m.as_str())
      .ok_or_else(|| {
        anyhow!(
          "missing relative amount"
        )
      })?
      .parse()
      .context(
        "invalid relative number"
      )?;
    let unit = caps
      .name("unit")
      .map(|m| m.as_str())
      .ok_or_else(|| {
        anyhow!("missing relative unit")
      })?;

    let days = match unit {
      | "d" => Days::new(num),
      | "w" => {
        Days::new(num.saturating_mul(7))
      }
      | _ => {
        return Err(anyhow!(
          "unknown relative unit: \
           {unit}"
        ));
      }
    };

    let shifted = if sign == "-" {
      today.checked_sub_days(days)
    } else {
      today.checked_add_days(days)
    };
    return shifted.ok_or_else(|| {
      anyhow!(
        "date out of range: {input}"
      )
    });
  }

  if let Ok(date) =
    NaiveDate::parse_from_str(
      token, "%Y-%m-%d"
    )
  {
    return Ok(date);
  }

  Err(anyhow!(
    "unrecognized date expression: \
     {input}"
  ))
  .with_context(|| {
    "supported formats: \
     today/tomorrow/yesterday, weekday \
     names (e.g. monday), +Nd/-Nd, \
     +Nw/-Nw, YYYY-MM-DD"
  })
}

/// Longest span `dates_in_range` will
/// expand.
pub const MAX_RANGE_DAYS: i64 = 366;

/// Every date from `start` to `end`,
/// both inclusive. A reversed range is
/// walked from the earlier date.
pub fn dates_in_range(
  start: NaiveDate,
  end: NaiveDate
) -> anyhow::Result<Vec<NaiveDate>> {
  let (from, to) = if start <= end {
    (start, end)
  } else {
    (end, start)
  };
  let span = (to - from).num_days() + 1;
  if span > MAX_RANGE_DAYS {
    bail!(
      "range {from}..{to} covers {span} \
       days; at most {MAX_RANGE_DAYS} \
       are allowed"
    );
  }
  Ok(
    from
      .iter_days()
      .take_while(|d| *d <= to)
      .collect()
  )
}

fn parse_weekday_name(
  token: &str
) -> Option<Weekday> {
  match token.trim() {
    | "monday" | "mon" => {
      Some(Weekday::Mon)
    }
    | "tuesday" | "tue" | "tues" => {
      Some(Weekday::Tue)
    }
    | "wednesday" | "wed" => {
      Some(Weekday::Wed)
    }
    | "thursday" | "thu" | "thur"
    | "thurs" => Some(Weekday::Thu),
    | "friday" | "fri" => {
      Some(Weekday::Fri)
    }
    | "saturday" | "sat" => {
      Some(Weekday::Sat)
    }
    | "sunday" | "sun" => {
      Some(Weekday::Sun)
    }
    | _ => None
  }
}

fn next_weekday_date(
  from: NaiveDate,
  target: Weekday
) -> NaiveDate {
  let from_idx = from
    .weekday()
    .num_days_from_monday()
    as u64;
  let target_idx = target
    .num_days_from_monday()
    as u64;
  let mut delta =
    (7 + target_idx - from_idx) % 7;
  if delta == 0 {
    delta = 7;
  }
  from
    .checked_add_days(Days::new(delta))
    .unwrap_or(from)
}
