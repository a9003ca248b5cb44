use anyhow::{
  anyhow,
  bail
};
use chrono::{
  DateTime,
  FixedOffset
};
use tracing::{
  debug,
  instrument
};

use super::parse_hour;
use crate::datetime::{
  dates_in_range,
  parse_date_expr
};
use crate::keys::DayKey;

#[derive(Debug, Clone)]
enum Mod {
  Dates(Vec<DayKey>),
  Range(DayKey, DayKey)
}

/// Parsed `repeat HOUR TEXT...`
/// arguments. `days` may hold
/// duplicates; the tracker collapses
/// them.
#[derive(Debug, Clone)]
pub(super) struct RepeatPlan {
  pub hour: u8,
  pub text: String,
  pub days: Vec<DayKey>
}

#[instrument(skip(args, now))]
pub(super) fn parse_repeat(
  args: &[String],
  now: &DateTime<FixedOffset>
) -> anyhow::Result<RepeatPlan> {
  let (hour_arg, rest) =
    args.split_first().ok_or_else(
      || {
        anyhow!(
          "usage: dayboard repeat \
           HOUR TEXT... \
           dates:D1,D2 range:D1..D2"
        )
      }
    )?;
  let hour = parse_hour(hour_arg)?;

  let mut text_parts = Vec::new();
  let mut mods = Vec::new();
  let mut literal = false;
  for arg in rest {
    if arg == "--" {
      literal = true;
      continue;
    }

    if !literal
      && let Some(one_mod) =
        parse_one_mod(arg, now)?
    {
      mods.push(one_mod);
      continue;
    }

    text_parts.push(arg.clone());
  }

  let text = text_parts.join(" ");
  if text.trim().is_empty() {
    bail!(
      "repeat: task text is required"
    );
  }

  let mut days = Vec::new();
  for one_mod in mods {
    match one_mod {
      | Mod::Dates(list) => {
        days.extend(list)
      }
      | Mod::Range(start, end) => {
        days.extend(
          dates_in_range(
            start.date(),
            end.date()
          )?
          .into_iter()
          .map(DayKey::from_date)
        )
      }
    }
  }

  if days.is_empty() {
    bail!(
      "repeat: pick days with \
       dates:D1,D2 and/or \
       range:D1..D2"
    );
  }

  debug!(
    hour,
    count = days.len(),
    "parsed repeat plan"
  );
  Ok(RepeatPlan {
    hour,
    text,
    days
  })
}

fn parse_one_mod(
  tok: &str,
  now: &DateTime<FixedOffset>
) -> anyhow::Result<Option<Mod>> {
  let Some((key, value)) =
    tok.split_once(':')
  else {
    return Ok(None);
  };

  match key.to_ascii_lowercase().as_str()
  {
    | "dates" | "date" | "on" => {
      let mut list = Vec::new();
      for part in value
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
      {
        list.push(DayKey::from_date(
          parse_date_expr(part, now)?
        ));
      }
      if list.is_empty() {
        bail!(
          "{key}: expected at least \
           one date"
        );
      }
      Ok(Some(Mod::Dates(list)))
    }
    | "range" => {
      let (start, end) = value
        .split_once("..")
        .ok_or_else(|| {
          anyhow!(
            "range: expected \
             START..END, got {value}"
          )
        })?;
      Ok(Some(Mod::Range(
        DayKey::from_date(
          parse_date_expr(start, now)?
        ),
        DayKey::from_date(
          parse_date_expr(end, now)?
        )
      )))
    }
    | _ => Ok(None)
  }
}

#[cfg(test)]
mod tests {
  use chrono::{
    DateTime,
    FixedOffset,
    TimeZone
  };

  use super::parse_repeat;

  fn now() -> DateTime<FixedOffset> {
    FixedOffset::east_opt(0)
      .expect("offset")
      .with_ymd_and_hms(
        2024, 1, 3, 10, 0, 0
      )
      .single()
      .expect("instant")
  }

  fn args(raw: &[&str]) -> Vec<String> {
    raw
      .iter()
      .map(|s| s.to_string())
      .collect()
  }

  #[test]
  fn dates_and_range_combine() {
    let plan = parse_repeat(
      &args(&[
        "7",
        "morning",
        "run",
        "dates:2024-01-10,tomorrow",
        "range:2024-01-05..2024-01-07"
      ]),
      &now()
    )
    .expect("plan");

    assert_eq!(plan.hour, 7);
    assert_eq!(plan.text, "morning run");
    let days: Vec<&str> = plan
      .days
      .iter()
      .map(|d| d.as_str())
      .collect();
    assert_eq!(
      days,
      vec![
        "2024-01-10",
        "2024-01-04",
        "2024-01-05",
        "2024-01-06",
        "2024-01-07"
      ]
    );
  }

  #[test]
  fn literal_marker_keeps_colons_in_text() {
    let plan = parse_repeat(
      &args(&[
        "9",
        "range:2024-01-03..2024-01-03",
        "--",
        "read:",
        "chapter"
      ]),
      &now()
    )
    .expect("plan");
    assert_eq!(plan.text, "read: chapter");
    assert_eq!(plan.days.len(), 1);
  }

  #[test]
  fn requires_days_and_text() {
    assert!(
      parse_repeat(
        &args(&["9", "run"]),
        &now()
      )
      .is_err()
    );
    assert!(
      parse_repeat(
        &args(&["9", "dates:today"]),
        &now()
      )
      .is_err()
    );
    assert!(
      parse_repeat(
        &args(&[
          "9",
          "run",
          "range:2024-01-01"
        ]),
        &now()
      )
      .is_err()
    );
  }

  #[test]
  fn oversized_range_is_refused() {
    let err = parse_repeat(
      &args(&[
        "9",
        "x",
        "range:0001-01-01..9999-12-31"
      ]),
      &now()
    )
    .expect_err("range too long");
    assert!(
      format!("{err:#}")
        .contains("at most 366")
    );
  }
}
