use std::io::{self, IsTerminal, Write};

use anyhow::anyhow;
use unicode_width::UnicodeWidthStr;

use crate::config::Config;
use crate::keys::DayKey;
use crate::pending::{PendingItem, PendingReport};
use crate::record::{DayRecord, Entry, GoalRecord, HOURS_PER_DAY};

#[derive(Debug, Clone)]
pub struct Renderer {
    color: bool,
}

impl Renderer {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let color_cfg = cfg.get("color").unwrap_or_else(|| "on".to_string());
        let color = match color_cfg.to_ascii_lowercase().as_str() {
            "on" | "yes" | "true" | "1" => true,
            "off" | "no" | "false" | "0" => false,
            other => return Err(anyhow!("invalid color setting: {other}")),
        };

        Ok(Self { color })
    }

    pub fn plain() -> Self {
        Self { color: false }
    }

    /// Hour-by-hour view. `all_hours` includes empty slots; `current_hour`
    /// is highlighted when the day is today.
    #[tracing::instrument(skip(self, out, record))]
    pub fn print_day<W: Write>(
        &self,
        out: &mut W,
        day: &DayKey,
        record: &DayRecord,
        all_hours: bool,
        current_hour: Option<u8>,
    ) -> anyhow::Result<()> {
        writeln!(out, "{}", self.paint(&format!("Day {day}"), "1"))?;

        let headers = vec!["Hour".to_string(), "Done".to_string(), "Task".to_string()];
        let mut rows = Vec::new();
        for hour in 0..HOURS_PER_DAY {
            let entry = record.task(hour);
            if entry.is_none() && !all_hours {
                continue;
            }
            let mut label = format!("{hour:02}:00");
            if current_hour == Some(hour) {
                label = self.paint(&label, "33");
            }
            let (done, text) = match entry {
                Some(entry) => (check_box(entry), self.entry_text(entry)),
                None => (String::new(), String::new()),
            };
            rows.push(vec![label, done, text]);
        }

        if rows.is_empty() {
            writeln!(out, "  no tasks")?;
        } else {
            write_table(&mut *out, headers, rows)?;
        }

        if !record.note.trim().is_empty() {
            writeln!(out)?;
            writeln!(out, "Note: {}", record.note)?;
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, out, record))]
    pub fn print_goals<W: Write>(
        &self,
        out: &mut W,
        title: &str,
        record: &GoalRecord,
    ) -> anyhow::Result<()> {
        writeln!(out, "{}", self.paint(title, "1"))?;
        if record.goals.is_empty() {
            writeln!(out, "  no goals")?;
            return Ok(());
        }

        let headers = vec!["#".to_string(), "Done".to_string(), "Goal".to_string()];
        let rows = record
            .goals
            .iter()
            .enumerate()
            .map(|(index, goal)| {
                vec![
                    self.paint(&(index + 1).to_string(), "33"),
                    check_box(goal),
                    self.entry_text(goal),
                ]
            })
            .collect();
        write_table(&mut *out, headers, rows)?;
        Ok(())
    }

    #[tracing::instrument(skip(self, out, report))]
    pub fn print_pending<W: Write>(&self, out: &mut W, report: &PendingReport) -> anyhow::Result<()> {
        if report.is_empty() {
            writeln!(out, "Nothing pending.")?;
            return Ok(());
        }

        let sections = [
            ("Today", &report.daily_current, "32"),
            ("This week", &report.weekly_current, "32"),
            ("This month", &report.monthly_current, "32"),
            ("Backlog: days", &report.daily_backlog, "31"),
            ("Backlog: weeks", &report.weekly_backlog, "31"),
            ("Backlog: months", &report.monthly_backlog, "31"),
        ];

        let mut first = true;
        for (title, items, code) in sections {
            if items.is_empty() {
                continue;
            }
            if !first {
                writeln!(out)?;
            }
            first = false;

            writeln!(out, "{} ({})", self.paint(title, code), items.len())?;
            let headers = vec!["Period".to_string(), "Slot".to_string(), "Item".to_string()];
            let rows = items
                .iter()
                .map(|item| vec![item.period().to_string(), slot_label(item), item.text().to_string()])
                .collect();
            write_table(&mut *out, headers, rows)?;
        }

        writeln!(out)?;
        writeln!(out, "{} pending", report.total_count())?;
        Ok(())
    }

    #[tracing::instrument(skip(self, out, notes))]
    pub fn print_notes<W: Write>(&self, out: &mut W, notes: &[(DayKey, String)]) -> anyhow::Result<()> {
        if notes.is_empty() {
            writeln!(out, "No notes yet.")?;
            return Ok(());
        }
        for (day, note) in notes {
            writeln!(out, "{}", self.paint(day.as_str(), "36"))?;
            for line in note.lines() {
                writeln!(out, "  {line}")?;
            }
        }
        Ok(())
    }

    pub fn paint(&self, text: &str, code: &str) -> String {
        if !self.color || !io::stdout().is_terminal() {
            return text.to_string();
        }
        format!("\x1b[{code}m{text}\x1b[0m")
    }

    fn entry_text(&self, entry: &Entry) -> String {
        if entry.done {
            self.paint(&entry.text, "2")
        } else {
            entry.text.clone()
        }
    }
}

fn check_box(entry: &Entry) -> String {
    let mark = if entry.done { "[x]" } else { "[ ]" };
    mark.to_string()
}

fn slot_label(item: &PendingItem) -> String {
    match item {
        PendingItem::Daily { hour, .. } => format!("{hour:02}:00"),
        PendingItem::Weekly { index, .. } | PendingItem::Monthly { index, .. } => {
            format!("#{}", index + 1)
        }
    }
}

pub fn write_table<W: Write>(
    mut writer: W,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
) -> anyhow::Result<()> {
    let column_count = headers.len();
    let mut widths = vec![0usize; column_count];

    for (idx, header) in headers.iter().enumerate() {
        widths[idx] = widths[idx].max(UnicodeWidthStr::width(header.as_str()));
    }

    for row in &rows {
        for (idx, cell) in row.iter().enumerate().take(column_count) {
            widths[idx] = widths[idx].max(UnicodeWidthStr::width(strip_ansi(cell).as_str()));
        }
    }

    let mut line = String::new();
    for (header, width) in headers.iter().zip(widths.iter().copied()) {
        line.push_str(&format!("{header:width$} "));
    }
    writeln!(writer, "{}", line.trim_end())?;

    let rule: Vec<String> = widths.iter().map(|width| "-".repeat(*width)).collect();
    writeln!(writer, "{}", rule.join(" "))?;

    for row in rows {
        let mut line = String::new();
        for (idx, width) in widths.iter().enumerate() {
            let cell = row.get(idx).map(String::as_str).unwrap_or_default();
            let visible_width = UnicodeWidthStr::width(strip_ansi(cell).as_str());
            let padding = width.saturating_sub(visible_width);
            line.push_str(cell);
            line.push_str(&" ".repeat(padding));
            line.push(' ');
        }
        writeln!(writer, "{}", line.trim_end())?;
    }

    Ok(())
}

pub fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;

    for ch in s.chars() {
        if escaped {
            if ch == 'm' {
                escaped = false;
            }
            continue;
        }

        if ch == '\x1b' {
            escaped = true;
            continue;
        }

        out.push(ch);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::{Renderer, strip_ansi, write_table};
    use crate::keys::DayKey;
    use crate::pending::{PendingItem, PendingReport};
    use crate::record::{DayRecord, Entry};

    fn render(f: impl FnOnce(&mut Vec<u8>) -> anyhow::Result<()>) -> String {
        let mut buf = Vec::new();
        f(&mut buf).expect("render");
        String::from_utf8(buf).expect("utf8")
    }

    #[test]
    fn table_pads_by_visible_width() {
        let text = render(|out| {
            write_table(
                out,
                vec!["A".to_string(), "B".to_string()],
                vec![
                    vec!["\x1b[31mred\x1b[0m".to_string(), "x".to_string()],
                    vec!["日本".to_string(), "y".to_string()],
                ],
            )
        });
        let plain: Vec<String> = text.lines().map(strip_ansi).collect();
        assert_eq!(plain.len(), 4);
        assert_eq!(plain[0], "A    B");
        assert_eq!(plain[1], "---- -");
        assert_eq!(plain[2], "red  x");
    }

    #[test]
    fn strip_ansi_removes_escapes() {
        assert_eq!(strip_ansi("\x1b[1;33mhi\x1b[0m there"), "hi there");
    }

    #[test]
    fn day_view_lists_filled_hours_and_note() {
        let day: DayKey = "2024-01-03".parse().expect("day");
        let mut record = DayRecord::default();
        record.tasks.insert(9, Entry::new("stretch"));
        record.note = "good".to_string();

        let text = render(|out| Renderer::plain().print_day(out, &day, &record, false, None));
        assert!(text.contains("Day 2024-01-03"));
        assert!(text.contains("09:00 [ ]  stretch"));
        assert!(!text.contains("10:00"));
        assert!(text.contains("Note: good"));

        let full = render(|out| Renderer::plain().print_day(out, &day, &record, true, Some(9)));
        assert!(full.contains("23:00"));
    }

    #[test]
    fn pending_view_counts_items() {
        let report = PendingReport {
            daily_backlog: vec![PendingItem::Daily {
                day: "2024-01-01".parse().expect("day"),
                hour: 9,
                text: "call bank".to_string(),
            }],
            ..PendingReport::default()
        };
        let text = render(|out| Renderer::plain().print_pending(out, &report));
        assert!(text.contains("Backlog: days (1)"));
        assert!(text.contains("2024-01-01 09:00 call bank"));
        assert!(text.contains("1 pending"));

        let empty = render(|out| Renderer::plain().print_pending(out, &PendingReport::default()));
        assert_eq!(empty.trim(), "Nothing pending.");
    }
}
