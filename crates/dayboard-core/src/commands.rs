mod account;
mod modifiers;

use std::io::{self, Write};
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use chrono::{DateTime, FixedOffset, Timelike};
use tracing::{debug, info, instrument, warn};

use crate::auth::AuthService;
use crate::cli::Invocation;
use crate::config::Config;
use crate::datastore::DataStore;
use crate::datetime::{local_now, parse_date_expr, project_zone};
use crate::keys::{DayKey, day_key, month_key, week_key};
use crate::pending::{PendingFilter, PendingReport};
use crate::record::HOURS_PER_DAY;
use crate::render::Renderer;
use crate::tracker::{GoalPeriod, PushOutcome, SyncOutcome, Tracker};

/// Everything a command needs, assembled once per invocation.
#[derive(Debug)]
pub struct App {
    pub cfg: Config,
    pub store: DataStore,
    pub auth: AuthService,
    pub tracker: Tracker,
    pub renderer: Renderer,
    pub now: DateTime<FixedOffset>,
    /// The day `--date` points at; today by default.
    pub selected: DayKey,
}

pub fn known_command_names() -> Vec<&'static str> {
    vec![
        "dashboard",
        "day",
        "task",
        "check",
        "uncheck",
        "note",
        "clear",
        "repeat",
        "goal",
        "pending",
        "done",
        "notes",
        "save",
        "sync",
        "watch",
        "keys",
        "signup",
        "login",
        "logout",
        "whoami",
        "access",
        "help",
        "version",
    ]
}

pub fn expand_command_abbrev<'a>(token: &str, known: &[&'a str]) -> Option<&'a str> {
    if let Some(exact) = known.iter().copied().find(|name| *name == token) {
        return Some(exact);
    }

    let mut matches = known.iter().copied().filter(|name| name.starts_with(token));
    let first = matches.next()?;
    if matches.next().is_some() {
        None
    } else {
        Some(first)
    }
}

/// Commands that work on records and therefore want fresh remote data.
fn wants_sync(command: &str) -> bool {
    !matches!(
        command,
        "signup" | "login" | "logout" | "whoami" | "access" | "help" | "version" | "keys" | "sync"
            | "clear"
    )
}

#[instrument(skip(app, inv), fields(command = %inv.command))]
pub fn dispatch(app: &mut App, inv: Invocation) -> anyhow::Result<()> {
    let command = inv.command.as_str();
    let args = inv.command_args.as_slice();

    debug!(command, args = ?args, selected = %app.selected, "dispatching command");

    if wants_sync(command) && app.cfg.flag("sync.on_start") {
        match app.tracker.sync()? {
            SyncOutcome::Failed(reason) => {
                warn!(reason = %reason, "could not refresh from remote; using cached records");
            }
            outcome => debug!(?outcome, "refreshed before command"),
        }
    }

    match command {
        "dashboard" => cmd_dashboard(app),
        "day" => cmd_day(app, args),
        "task" => cmd_task(app, args),
        "check" => cmd_check(app, args, true),
        "uncheck" => cmd_check(app, args, false),
        "note" => cmd_note(app, args),
        "clear" => cmd_clear(app),
        "repeat" => cmd_repeat(app, args),
        "goal" => cmd_goal(app, args),
        "pending" => cmd_pending(app, args),
        "done" => cmd_done(app, args),
        "notes" => cmd_notes(app),
        "save" => cmd_save(app),
        "sync" => cmd_sync(app),
        "watch" => cmd_watch(app, args),
        "keys" => cmd_keys(app, args),
        "signup" => account::cmd_signup(app, args),
        "login" => account::cmd_login(app, args),
        "logout" => account::cmd_logout(app),
        "whoami" => account::cmd_whoami(app),
        "access" => account::cmd_access(app, args),
        "help" => cmd_help(),
        "version" => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        other => Err(anyhow!("unknown command: {other}")),
    }
}

fn current_hour_on(app: &App, day: &DayKey) -> Option<u8> {
    if *day == day_key(&app.now) {
        u8::try_from(app.now.hour()).ok()
    } else {
        None
    }
}

#[instrument(skip(app))]
fn cmd_dashboard(app: &mut App) -> anyhow::Result<()> {
    let mut out = io::stdout().lock();
    let day = app.selected.clone();
    let week = day.week();
    let month = day.month();

    match app.tracker.identity() {
        Some(user) => writeln!(out, "Signed in as {}", user.email)?,
        None => writeln!(out, "Guest (records stay on this machine)")?,
    }
    writeln!(out)?;

    app.renderer.print_day(
        &mut out,
        &day,
        &app.tracker.day(&day),
        false,
        current_hour_on(app, &day),
    )?;
    writeln!(out)?;
    app.renderer
        .print_goals(&mut out, &format!("Week of {week}"), &app.tracker.week(&week))?;
    writeln!(out)?;
    app.renderer
        .print_goals(&mut out, &format!("Month {month}"), &app.tracker.month(&month))?;

    let report = app.tracker.pending(&app.now);
    let backlog =
        report.daily_backlog.len() + report.weekly_backlog.len() + report.monthly_backlog.len();
    writeln!(out)?;
    writeln!(
        out,
        "{} pending ({} in backlog). Run `dayboard pending` for details.",
        report.total_count(),
        backlog
    )?;
    Ok(())
}

#[instrument(skip(app, args))]
fn cmd_day(app: &mut App, args: &[String]) -> anyhow::Result<()> {
    let day = match args.first() {
        Some(expr) => DayKey::from_date(parse_date_expr(expr, &app.now)?),
        None => app.selected.clone(),
    };
    let mut out = io::stdout().lock();
    app.renderer
        .print_day(&mut out, &day, &app.tracker.day(&day), true, current_hour_on(app, &day))
}

#[instrument(skip(app, args))]
fn cmd_task(app: &mut App, args: &[String]) -> anyhow::Result<()> {
    let (hour_arg, words) = args
        .split_first()
        .ok_or_else(|| anyhow!("usage: dayboard task HOUR TEXT..."))?;
    let hour = parse_hour(hour_arg)?;
    let text = words.join(" ");
    let day = app.selected.clone();

    app.tracker.set_task(&day, hour, &text)?;
    info!(day = %day, hour, "task set");
    if text.trim().is_empty() {
        println!("Cleared text at {hour:02}:00 on {day}.");
    } else {
        println!("{day} {hour:02}:00  {text}");
    }
    Ok(())
}

#[instrument(skip(app, args))]
fn cmd_check(app: &mut App, args: &[String], done: bool) -> anyhow::Result<()> {
    let hour_arg = args
        .first()
        .ok_or_else(|| anyhow!("usage: dayboard check|uncheck HOUR"))?;
    let hour = parse_hour(hour_arg)?;
    let day = app.selected.clone();
    app.tracker.set_task_done(&day, hour, done)?;
    let mark = if done { "done" } else { "open" };
    println!("{day} {hour:02}:00 marked {mark}.");
    Ok(())
}

#[instrument(skip(app, args))]
fn cmd_note(app: &mut App, args: &[String]) -> anyhow::Result<()> {
    let day = app.selected.clone();
    if args.is_empty() {
        let note = app.tracker.day(&day).note;
        if note.trim().is_empty() {
            println!("No note for {day}.");
        } else {
            println!("{note}");
        }
        return Ok(());
    }

    let note = args.join(" ");
    app.tracker.set_note(&day, &note)?;
    println!("Note saved for {day}.");
    Ok(())
}

#[instrument(skip(app))]
fn cmd_clear(app: &mut App) -> anyhow::Result<()> {
    let day = app.selected.clone();
    app.tracker.clear_day(&day)?;
    println!("Cleared {day} on this machine. Run `dayboard save` to push the empty day.");
    Ok(())
}

#[instrument(skip(app, args))]
fn cmd_repeat(app: &mut App, args: &[String]) -> anyhow::Result<()> {
    let plan = modifiers::parse_repeat(args, &app.now)?;
    let count = app.tracker.repeat_task(plan.hour, &plan.text, &plan.days)?;
    println!(
        "Copied \"{}\" at {:02}:00 to {count} day{}.",
        plan.text,
        plan.hour,
        if count == 1 { "" } else { "s" }
    );
    Ok(())
}

#[instrument(skip(app, args))]
fn cmd_goal(app: &mut App, args: &[String]) -> anyhow::Result<()> {
    let (scope, rest) = args
        .split_first()
        .ok_or_else(|| anyhow!("usage: dayboard goal week|month [add|set|check|uncheck|pop] ..."))?;
    let period = match scope.to_ascii_lowercase().as_str() {
        "week" | "weekly" | "w" => GoalPeriod::Week(app.selected.week()),
        "month" | "monthly" | "m" => GoalPeriod::Month(app.selected.month()),
        other => bail!("expected `week` or `month`, got {other}"),
    };

    let (action, rest) = match rest.split_first() {
        Some((action, rest)) => (action.to_ascii_lowercase(), rest),
        None => ("list".to_string(), rest),
    };

    match action.as_str() {
        "list" | "ls" => {}
        "add" => {
            let text = rest.join(" ");
            if text.trim().is_empty() {
                bail!("goal text cannot be empty");
            }
            let index = app.tracker.add_goal(&period, &text)?;
            println!("Added goal {} to {period}.", index + 1);
        }
        "set" | "edit" => {
            let (number, words) = rest
                .split_first()
                .ok_or_else(|| anyhow!("usage: dayboard goal {scope} set N TEXT..."))?;
            let index = parse_goal_number(number)?;
            app.tracker.set_goal(&period, index, &words.join(" "))?;
            println!("Updated goal {} of {period}.", index + 1);
        }
        "check" | "uncheck" => {
            let number = rest
                .first()
                .ok_or_else(|| anyhow!("usage: dayboard goal {scope} {action} N"))?;
            let index = parse_goal_number(number)?;
            app.tracker.set_goal_done(&period, index, action == "check")?;
            println!("Goal {} of {period} marked {}.", index + 1, if action == "check" { "done" } else { "open" });
        }
        "pop" | "remove" => match app.tracker.remove_last_goal(&period)? {
            Some(goal) => println!("Removed \"{}\" from {period}.", goal.text),
            None => println!("{period} has no goals."),
        },
        other => bail!("unknown goal action: {other}"),
    }

    let title = match &period {
        GoalPeriod::Week(week) => format!("Week of {week}"),
        GoalPeriod::Month(month) => format!("Month {month}"),
    };
    let mut out = io::stdout().lock();
    app.renderer
        .print_goals(&mut out, &title, &app.tracker.goals(&period))
}

#[instrument(skip(app, args))]
fn cmd_pending(app: &mut App, args: &[String]) -> anyhow::Result<()> {
    let filter = match args.first() {
        Some(raw) => raw.parse::<PendingFilter>()?,
        None => PendingFilter::All,
    };
    let report = app.tracker.pending(&app.now).filtered(filter);
    debug!(filter = %filter, total = report.total_count(), "computed pending");
    let mut out = io::stdout().lock();
    app.renderer.print_pending(&mut out, &report)
}

/// Completes a current-period item. Backlog items stay read-only.
#[instrument(skip(app, args))]
fn cmd_done(app: &mut App, args: &[String]) -> anyhow::Result<()> {
    let usage = || anyhow!("usage: dayboard done daily HOUR | weekly N | monthly N");
    let (kind, rest) = args.split_first().ok_or_else(usage)?;
    let slot = rest.first().ok_or_else(usage)?;
    let now = app.now;

    match kind.to_ascii_lowercase().as_str() {
        "daily" | "day" => {
            let hour = parse_hour(slot)?;
            let today = day_key(&now);
            app.tracker.mark_daily_done(&now, &today, hour)?;
            println!("Done: {today} {hour:02}:00.");
        }
        "weekly" | "week" => {
            let index = parse_goal_number(slot)?;
            let week = week_key(&now);
            app.tracker.mark_weekly_done(&now, &week, index)?;
            println!("Done: week {week} goal {}.", index + 1);
        }
        "monthly" | "month" => {
            let index = parse_goal_number(slot)?;
            let month = month_key(&now);
            app.tracker.mark_monthly_done(&now, &month, index)?;
            println!("Done: month {month} goal {}.", index + 1);
        }
        other => bail!("unknown pending kind: {other}"),
    }
    Ok(())
}

#[instrument(skip(app))]
fn cmd_notes(app: &mut App) -> anyhow::Result<()> {
    let notes = app.tracker.notes();
    let mut out = io::stdout().lock();
    app.renderer.print_notes(&mut out, &notes)
}

#[instrument(skip(app))]
fn cmd_save(app: &mut App) -> anyhow::Result<()> {
    let day = app.selected.clone();
    match app.tracker.save(&day, &day.week(), &day.month()) {
        PushOutcome::Pushed => println!("Saved {day}, week {} and month {}.", day.week(), day.month()),
        PushOutcome::Guest => println!("Not signed in; records are kept on this machine only."),
        PushOutcome::Offline => println!("Remote store is off; records are kept on this machine only."),
        PushOutcome::Failed(failures) => {
            println!("Some records could not be saved (they are kept locally):");
            for failure in failures {
                println!("  {failure}");
            }
        }
    }
    Ok(())
}

#[instrument(skip(app))]
fn cmd_sync(app: &mut App) -> anyhow::Result<()> {
    match app.tracker.sync()? {
        SyncOutcome::Merged {
            days,
            weeks,
            months,
        } => {
            println!("Synced {days} days, {weeks} weeks, {months} months.");
            let kept = app.tracker.unsynced().len();
            if kept > 0 {
                println!("Kept {kept} unsaved local record(s); `dayboard save` pushes them.");
            }
        }
        SyncOutcome::Guest => println!("Not signed in; nothing to sync."),
        SyncOutcome::Offline => println!("Remote store is off; nothing to sync."),
        SyncOutcome::Failed(reason) => println!("Sync failed, cached records kept: {reason}"),
    }
    Ok(())
}

/// How often `watch` re-reads the clock when no records change.
const WATCH_TICK: Duration = Duration::from_secs(60);

/// Prints a fresh pending report whenever the records change or the clock
/// moves an item between current and backlog. `watch N` stops after N
/// reports.
#[instrument(skip(app, args))]
fn cmd_watch(app: &mut App, args: &[String]) -> anyhow::Result<()> {
    let limit = match args.first() {
        Some(raw) => Some(
            raw.parse::<usize>()
                .with_context(|| format!("expected a report count, got {raw}"))?,
        ),
        None => None,
    };

    let mut watch = app.tracker.watch_pending()?;
    let mut printed = 0usize;
    let mut last: Option<PendingReport> = None;
    let mut out = io::stdout().lock();

    while !limit.is_some_and(|limit| printed >= limit) {
        let Some(report) = watch.refresh(local_now, WATCH_TICK) else {
            if watch.is_ended() {
                break;
            }
            continue;
        };
        if last.as_ref() == Some(&report) {
            continue;
        }

        let stamp = local_now().format("%H:%M:%S");
        writeln!(out, "[{stamp}] {} pending", report.total_count())?;
        app.renderer.print_pending(&mut out, &report)?;
        writeln!(out)?;
        out.flush()?;
        printed += 1;
        last = Some(report);
    }

    watch.cancel();
    debug!(printed, "watch finished");
    Ok(())
}

#[instrument(skip(app, args))]
fn cmd_keys(app: &mut App, args: &[String]) -> anyhow::Result<()> {
    let day = match args.first() {
        Some(expr) => DayKey::from_date(parse_date_expr(expr, &app.now)?),
        None => app.selected.clone(),
    };
    println!("day    {day}");
    println!("week   {}", day.week());
    println!("month  {}", day.month());
    println!("zone   {}", project_zone().label());
    Ok(())
}

fn cmd_help() -> anyhow::Result<()> {
    println!(
        "\
dayboard [options] [command] [args]

Options:
  -v / -q            more / less logging (RUST_LOG overrides)
  --rc FILE          alternate .dayboardrc
  --rc-set KEY=VAL   override a setting (or positional rc.KEY=VAL)
  --data DIR         data directory
  --date EXPR        day to work on: today, tomorrow, friday, +2d, -1w, 2024-01-31

Records:
  dashboard                       day, week and month at a glance (default)
  day [DATE]                      all 24 hours of a day
  task HOUR TEXT...               set the task at HOUR
  check HOUR | uncheck HOUR       mark a task done or open
  note [TEXT...]                  show or set the day's note
  clear                           empty the day's note and tasks locally
  repeat HOUR TEXT... dates:D1,D2 range:D1..D2
  goal week|month [add TEXT | set N TEXT | check N | uncheck N | pop]
  notes                           every note, newest first

Pending:
  pending [all|daily|weekly|monthly]
  done daily HOUR | done weekly N | done monthly N
  watch [N]                       live pending report

Sync and account:
  save | sync | keys [DATE]
  signup EMAIL [PASSWORD]         prints the one-time access key
  login EMAIL [PASSWORD] [KEY]    DAYBOARD_PASSWORD / DAYBOARD_ACCESS_KEY also work
  logout | whoami | access EMAIL [issue]"
    );
    Ok(())
}

/// Accepts `9`, `09`, `9:00` and `09:00`.
fn parse_hour(raw: &str) -> anyhow::Result<u8> {
    let trimmed = raw.trim();
    let hour_part = match trimmed.split_once(':') {
        Some((hour, "00")) => hour,
        Some(_) => bail!("tasks are hourly; use HH or HH:00, got {raw}"),
        None => trimmed,
    };
    let hour: u8 = hour_part
        .parse()
        .with_context(|| format!("invalid hour: {raw}"))?;
    if hour >= HOURS_PER_DAY {
        bail!("hour must be between 0 and 23, got {hour}");
    }
    Ok(hour)
}

/// Goals are numbered from 1 on screen.
fn parse_goal_number(raw: &str) -> anyhow::Result<usize> {
    let number: usize = raw
        .trim()
        .parse()
        .with_context(|| format!("invalid goal number: {raw}"))?;
    number
        .checked_sub(1)
        .ok_or_else(|| anyhow!("goal numbers start at 1"))
}

#[cfg(test)]
mod tests {
    use super::{expand_command_abbrev, known_command_names, parse_goal_number, parse_hour};

    #[test]
    fn hours_parse_in_common_forms() {
        assert_eq!(parse_hour("9").expect("hour"), 9);
        assert_eq!(parse_hour("09:00").expect("hour"), 9);
        assert_eq!(parse_hour("23").expect("hour"), 23);
        assert!(parse_hour("24").is_err());
        assert!(parse_hour("9:30").is_err());
        assert!(parse_hour("nine").is_err());
    }

    #[test]
    fn goal_numbers_are_one_based() {
        assert_eq!(parse_goal_number("1").expect("number"), 0);
        assert!(parse_goal_number("0").is_err());
    }

    #[test]
    fn abbreviations_resolve_when_unique() {
        let known = known_command_names();
        assert_eq!(expand_command_abbrev("dash", &known), Some("dashboard"));
        assert_eq!(expand_command_abbrev("day", &known), Some("day"));
        assert_eq!(expand_command_abbrev("no", &known), None);
        assert_eq!(expand_command_abbrev("notes", &known), Some("notes"));
        assert_eq!(expand_command_abbrev("wh", &known), Some("whoami"));
    }
}
