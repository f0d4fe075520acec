use std::io::{self, IsTerminal, Write};

use chrono::{Datelike, NaiveDate};
use unicode_width::UnicodeWidthStr;

use crate::config::Config;
use crate::filter::UserFilterSet;
use crate::grid::DAYS_PER_WEEK;
use crate::i18n::{Label, label, month_name, weekday_short};
use crate::session::Dashboard;
use crate::settings::{AppSettings, Language, Theme};
use crate::stats::{Stats, user_colour};
use crate::user::{Roster, User};

const CELL_WIDTH: usize = 6;

#[derive(Debug, Clone)]
pub struct Renderer {
    color: bool,
    settings: AppSettings,
}

impl Renderer {
    pub fn new(cfg: &Config, settings: AppSettings) -> anyhow::Result<Self> {
        let color = cfg.color()? && io::stdout().is_terminal();
        Ok(Self { color, settings })
    }

    pub fn set_settings(&mut self, settings: AppSettings) {
        self.settings = settings;
    }

    fn lang(&self) -> Language {
        self.settings.language
    }

    fn t(&self, key: Label) -> &'static str {
        label(key, self.lang())
    }

    fn accent(&self) -> &'static str {
        match self.settings.theme {
            Theme::BlueNight => "1;36",
            Theme::Anthracite => "1;37",
        }
    }

    fn paint(&self, text: &str, code: &str) -> String {
        if !self.color {
            return text.to_string();
        }
        format!("\x1b[{code}m{text}\x1b[0m")
    }

    fn paint_user(&self, user: &User) -> String {
        if !self.color {
            return user.username.clone();
        }
        let (r, g, b) = user_colour(&user.id).rgb();
        format!("\x1b[38;2;{r};{g};{b}m{}\x1b[0m", user.username)
    }

    /// Only when stdout is a terminal.
    pub fn clear_screen(&self) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        if out.is_terminal() {
            write!(out, "\x1b[2J\x1b[H")?;
        }
        Ok(())
    }

    pub fn print_message(&self, text: &str) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "{text}")?;
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    pub fn print_dashboard(&self, dash: &Dashboard, roster: &Roster) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        self.write_calendar(&mut out, dash, roster)?;
        writeln!(out)?;
        self.write_stats(&mut out, &dash.stats)?;
        Ok(())
    }

    fn write_calendar<W: Write>(&self, mut out: W, dash: &Dashboard, roster: &Roster) -> anyhow::Result<()> {
        let title = format!("{} {}", month_name(dash.month, self.lang()), dash.year);
        writeln!(out, "{}", self.paint(&title, self.accent()))?;

        let mut header = String::new();
        for slot in dash.slots.iter().take(DAYS_PER_WEEK) {
            header.push_str(&pad(&weekday_short(slot.weekday, self.lang()), CELL_WIDTH));
        }
        writeln!(out, "{}", header.trim_end())?;

        let popular = dash.most_popular.as_ref().map(|p| p.date.as_str());
        for week in dash.slots.chunks(DAYS_PER_WEEK) {
            let mut line = String::new();
            for slot in week {
                let mine = dash.selections.contains(&slot.id);
                let mut cell = format!("{:>2}{}", slot.day, if mine { "*" } else { " " });
                if slot.in_month && !slot.occupants.is_empty() {
                    cell.push_str(&slot.occupants.len().to_string());
                }
                let cell = pad(&cell, CELL_WIDTH);

                let painted = if !slot.in_month {
                    self.paint(&cell, "2")
                } else if popular == Some(slot.id.as_str()) {
                    self.paint(&cell, "1;33")
                } else if mine {
                    self.paint(&cell, "32")
                } else if slot.date() == Some(dash.today) {
                    self.paint(&cell, "4")
                } else {
                    cell
                };
                line.push_str(&painted);
            }
            writeln!(out, "{}", line.trim_end())?;
        }

        writeln!(out)?;
        match &dash.most_popular {
            Some(best) => writeln!(
                out,
                "{}: {} ({})",
                self.t(Label::MostPopular),
                self.paint(&best.date, "1;33"),
                best.count
            )?,
            None => writeln!(out, "{}: -", self.t(Label::MostPopular))?,
        }
        writeln!(
            out,
            "{}: {}/{} {}",
            self.t(Label::Filter),
            dash.visible_users,
            roster.len(),
            self.t(Label::UsersVisible)
        )?;

        let occupied: Vec<_> = dash
            .slots
            .iter()
            .filter(|slot| slot.in_month && !slot.occupants.is_empty())
            .collect();
        if !occupied.is_empty() {
            writeln!(out, "{}:", self.t(Label::SelectedBy))?;
            for slot in occupied {
                let names: Vec<String> = slot
                    .occupants
                    .iter()
                    .filter_map(|id| roster.get(id))
                    .map(|user| self.paint_user(user))
                    .collect();
                writeln!(out, "  {:>2}  {}", slot.day, names.join(", "))?;
            }
        }
        Ok(())
    }

    pub fn print_stats(&self, stats: &Stats) -> anyhow::Result<()> {
        self.write_stats(io::stdout().lock(), stats)
    }

    fn write_stats<W: Write>(&self, mut out: W, stats: &Stats) -> anyhow::Result<()> {
        writeln!(out, "{}", self.paint(self.t(Label::Statistics), self.accent()))?;
        let rows = vec![
            vec![self.t(Label::TotalActiveUsers).to_string(), stats.total_active_users.to_string()],
            vec![self.t(Label::SelectedSlots).to_string(), stats.total_selections.to_string()],
            vec![self.t(Label::YourSelections).to_string(), stats.your_selections.to_string()],
        ];
        write_rows(&mut out, rows)?;

        if !stats.recent.is_empty() {
            writeln!(out)?;
            writeln!(out, "{}", self.t(Label::RecentActivity))?;
            let rows = stats
                .recent
                .iter()
                .map(|r| vec![r.username.clone(), r.selections.to_string()])
                .collect();
            write_rows(&mut out, rows)?;
        }
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    pub fn print_users(&self, roster: &Roster, filter: &UserFilterSet, current_id: &str) -> anyhow::Result<()> {
        self.write_users(io::stdout().lock(), roster, filter, current_id)
    }

    fn write_users<W: Write>(
        &self,
        out: W,
        roster: &Roster,
        filter: &UserFilterSet,
        current_id: &str,
    ) -> anyhow::Result<()> {
        let headers = vec![
            "ID".to_string(),
            "Username".to_string(),
            "Email".to_string(),
            "Days".to_string(),
            "Shown".to_string(),
        ];

        let rows = roster
            .iter()
            .map(|user| {
                let name = if user.id == current_id {
                    format!("{} *", self.paint_user(user))
                } else {
                    self.paint_user(user)
                };
                vec![
                    self.paint(&user.id, "33"),
                    name,
                    user.email.clone(),
                    user.selections.len().to_string(),
                    if filter.contains(&user.id) { "yes" } else { "no" }.to_string(),
                ]
            })
            .collect();

        write_table(out, headers, rows)
    }

    pub fn print_selections(&self, selections: &[NaiveDate]) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "{}", self.paint(self.t(Label::YourSelections), self.accent()))?;
        if selections.is_empty() {
            writeln!(out, "  {}", self.t(Label::NoSelections))?;
        }
        for date in selections {
            writeln!(
                out,
                "  {}  {} {} {}",
                date.format("%Y-%m-%d"),
                date.day(),
                month_name(date.month(), self.lang()),
                date.year()
            )?;
        }
        Ok(())
    }

    pub fn print_settings(&self) -> anyhow::Result<()> {
        let theme = match self.settings.theme {
            Theme::BlueNight => self.t(Label::BlueNight),
            Theme::Anthracite => self.t(Label::Anthracite),
        };
        let rows = vec![
            vec![self.t(Label::Language).to_string(), self.settings.language.to_string()],
            vec![self.t(Label::Theme).to_string(), format!("{} ({theme})", self.settings.theme)],
        ];
        write_rows(io::stdout().lock(), rows)
    }

    pub fn print_user(&self, user: &User) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "id        {}", user.id)?;
        writeln!(out, "username  {}", self.paint_user(user))?;
        writeln!(out, "email     {}", user.email)?;
        writeln!(out, "days      {}", user.selections.len())?;
        writeln!(out, "created   {}", user.created_at.format("%Y-%m-%d %H:%M"))?;
        Ok(())
    }
}

fn pad(text: &str, width: usize) -> String {
    let visible = UnicodeWidthStr::width(text);
    format!("{text}{}", " ".repeat(width.saturating_sub(visible)))
}

/// Two-column key/value listing without a header.
fn write_rows<W: Write>(mut writer: W, rows: Vec<Vec<String>>) -> anyhow::Result<()> {
    let width = rows
        .iter()
        .filter_map(|row| row.first())
        .map(|cell| UnicodeWidthStr::width(strip_ansi(cell).as_str()))
        .max()
        .unwrap_or(0);
    for row in rows {
        let key = row.first().map(String::as_str).unwrap_or_default();
        let value = row.get(1).map(String::as_str).unwrap_or_default();
        writeln!(writer, "  {}  {value}", pad(key, width))?;
    }
    Ok(())
}

fn write_table<W: Write>(
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

    for (header, &width) in headers.iter().zip(&widths) {
        write!(writer, "{header:width$} ")?;
    }
    writeln!(writer)?;

    for &width in &widths {
        write!(writer, "{:-<width$} ", "")?;
    }
    writeln!(writer)?;

    for row in rows {
        for (cell, &width) in row.iter().zip(&widths) {
            let visible_width = UnicodeWidthStr::width(strip_ansi(cell).as_str());
            let padding = width.saturating_sub(visible_width);
            write!(writer, "{}{} ", cell, " ".repeat(padding))?;
        }
        writeln!(writer)?;
    }

    Ok(())
}

fn strip_ansi(s: &str) -> String {
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
    use std::collections::BTreeSet;

    use chrono::Utc;

    use super::*;
    use crate::aggregate::{aggregate, most_popular_in_roster};
    use crate::grid::generate;

    fn user(id: &str, name: &str, dates: &[&str]) -> User {
        let mut user = User::new(name.to_string(), format!("{name}@example.org"), String::new(), Utc::now());
        user.id = id.to_string();
        user.selections = dates.iter().map(|d| d.to_string()).collect();
        user
    }

    fn plain(settings: AppSettings) -> Renderer {
        Renderer {
            color: false,
            settings,
        }
    }

    fn dashboard(roster: &Roster) -> Dashboard {
        let filter = UserFilterSet::all(roster);
        let slots = aggregate(&generate(3, 2024).expect("grid"), roster, &filter);
        Dashboard {
            month: 3,
            year: 2024,
            today: NaiveDate::from_ymd_opt(2024, 3, 20).expect("date"),
            slots,
            selections: BTreeSet::from(["2024-03-15".to_string()]),
            most_popular: most_popular_in_roster(roster, &filter),
            stats: Stats::compute(roster, "u1"),
            visible_users: roster.len(),
        }
    }

    #[test]
    fn calendar_marks_selections_and_lists_occupants() {
        let roster = Roster::new(vec![
            user("u1", "ada", &["2024-03-15"]),
            user("u2", "bob", &["2024-03-15"]),
            user("u3", "cy", &["2024-03-15", "2024-04-01"]),
        ]);
        let mut out = Vec::new();
        plain(AppSettings::default())
            .write_calendar(&mut out, &dashboard(&roster), &roster)
            .expect("render");
        let text = String::from_utf8(out).expect("utf8");

        assert!(text.starts_with("Mars 2024\nLun"), "{text}");
        assert!(text.contains("15*3"), "{text}");
        assert!(text.contains("Plus populaire: 2024-03-15 (3)"), "{text}");
        assert!(text.contains("  15  ada, bob, cy"), "{text}");
        // Lead-out days show no counts.
        assert!(!text.contains(" 1 1"), "{text}");
    }

    #[test]
    fn stats_use_the_selected_language() {
        let roster = Roster::new(vec![user("u1", "ada", &["2024-03-15"])]);
        let mut out = Vec::new();
        plain(AppSettings {
            language: Language::En,
            theme: Theme::Anthracite,
        })
        .write_stats(&mut out, &Stats::compute(&roster, "u1"))
        .expect("render");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.contains("Active Users"), "{text}");
        assert!(text.contains("Recent Activity"), "{text}");
    }

    #[test]
    fn users_table_aligns_columns() {
        let roster = Roster::new(vec![user("u1", "ada", &[]), user("u2", "bérénice", &["2024-03-01"])]);
        let filter = UserFilterSet::from_ids(["u1"]);
        let mut out = Vec::new();
        plain(AppSettings::default())
            .write_users(&mut out, &roster, &filter, "u1")
            .expect("render");
        let text = String::from_utf8(out).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 4);
        assert!(lines[2].contains("ada *"));
        assert!(lines[3].contains("no"));
        let email_col = lines[0].find("Email").expect("header");
        let tail: String = lines[3].chars().skip(email_col).collect();
        assert!(tail.starts_with("bérénice@example.org"), "{text}");
    }
}
