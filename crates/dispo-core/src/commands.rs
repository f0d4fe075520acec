use std::future::Future;
use std::io::{self, BufRead, IsTerminal, Write};
use std::time::Duration;

use anyhow::{Context, anyhow};
use chrono::{Datelike, NaiveDate};
use tracing::{debug, info, instrument, warn};

use crate::accounts::{PasswordChange, RegisterForm};
use crate::cli::{Command, FilterCommand, ProfileCommand, SettingsCommand};
use crate::config::Config;
use crate::grid;
use crate::i18n::{Label, label};
use crate::remote::{ProfileUpdate, RemoteStore};
use crate::render::Renderer;
use crate::session::Session;
use crate::stats::Stats;

/// Runs one CLI command against an open session.
#[instrument(skip_all)]
pub async fn dispatch<R, F>(
    session: &mut Session<R>,
    cfg: &Config,
    renderer: &mut Renderer,
    command: Option<Command>,
    shutdown: F,
) -> anyhow::Result<()>
where
    R: RemoteStore + Clone,
    F: Future<Output = ()>,
{
    let command = command.unwrap_or(Command::Calendar {
        month: None,
        year: None,
        shift: 0,
    });
    debug!(?command, "dispatching command");
    let lang = session.settings().language;

    match command {
        Command::Register {
            username,
            email,
            password,
            confirm,
        } => {
            let password = secret_or_stdin(password, "password")?;
            let confirm_password = confirm.unwrap_or_else(|| password.clone());
            let user = session
                .register(RegisterForm {
                    username,
                    email,
                    password,
                    confirm_password,
                })
                .await?;
            renderer.print_message(label(Label::RegisterSuccess, lang))?;
            renderer.print_user(&user)?;
        }

        Command::Login { email, password } => {
            let password = secret_or_stdin(password, "password")?;
            let user = session.login(&email, &password).await?;
            renderer.print_message(label(Label::LoginSuccess, lang))?;
            renderer.print_message(&format!("{}, {}", label(Label::Welcome, lang), user.username))?;
        }

        Command::Logout => {
            if session.logout()? {
                renderer.print_message(label(Label::Logout, lang))?;
            } else {
                renderer.print_message("not logged in")?;
            }
        }

        Command::Whoami => match session.current_user().cloned() {
            Some(user) => {
                renderer.print_user(&user)?;
                let dates: Vec<NaiveDate> = user
                    .selections
                    .iter()
                    .filter_map(|d| session.normalizer().parse(d.as_str()).ok())
                    .collect();
                renderer.print_selections(&dates)?;
            }
            None => renderer.print_message("not logged in")?,
        },

        Command::Calendar { month, year, shift } => {
            let (month, year) = resolve_month(session.today(), month, year, shift)?;
            refresh_or_warn(session).await?;
            let dash = session.dashboard(month, year)?;
            renderer.print_dashboard(&dash, &session.roster()?)?;
        }

        Command::Toggle { date } => {
            refresh_or_warn(session).await?;
            let outcome = session.toggle(&date).await?;
            let verb = if outcome.selected {
                "selected"
            } else {
                "deselected"
            };
            renderer.print_message(&format!("{} {verb}", outcome.date))?;
            if !outcome.reconciled {
                warn!("saved, but the roster could not be refetched; other users' changes may be missing");
            }
        }

        Command::Stats => {
            refresh_or_warn(session).await?;
            let store = session.store()?;
            renderer.print_stats(&Stats::compute(&store.roster(), store.user_id()))?;
        }

        Command::Users => {
            refresh_or_warn(session).await?;
            let store = session.store()?;
            renderer.print_users(&store.roster(), &session.filter()?, store.user_id())?;
        }

        Command::Filter { action } => {
            refresh_or_warn(session).await?;
            run_filter(session, renderer, action.unwrap_or(FilterCommand::Show))?;
        }

        Command::Settings { action } => match action.unwrap_or(SettingsCommand::Show) {
            SettingsCommand::Show => renderer.print_settings()?,
            SettingsCommand::Language { value } => {
                session.set_language(value)?;
                renderer.set_settings(session.settings());
                renderer.print_message(label(Label::SettingsUpdated, value))?;
            }
            SettingsCommand::Theme { value } => {
                session.set_theme(value)?;
                renderer.set_settings(session.settings());
                renderer.print_message(label(Label::SettingsUpdated, lang))?;
            }
        },

        Command::Profile { action } => run_profile(session, renderer, action).await?,

        Command::Watch {
            interval,
            month,
            year,
        } => {
            let every = match interval {
                Some(secs) => Duration::from_secs(secs.max(1)),
                None => cfg.poll_interval()?,
            };
            let (month, year) = resolve_month(session.today(), month, year, 0)?;
            session.store()?;

            session
                .watch(every, shutdown, |session| {
                    renderer.set_settings(session.settings());
                    renderer.clear_screen()?;
                    let dash = session.dashboard(month, year)?;
                    renderer.print_dashboard(&dash, &session.roster()?)
                })
                .await?;
        }
    }

    Ok(())
}

fn run_filter<R: RemoteStore + Clone>(
    session: &mut Session<R>,
    renderer: &Renderer,
    action: FilterCommand,
) -> anyhow::Result<()> {
    let lang = session.settings().language;
    let filter = match action {
        FilterCommand::Show => {
            let store = session.store()?;
            return renderer.print_users(&store.roster(), &session.filter()?, store.user_id());
        }
        FilterCommand::Toggle { user } => {
            let (user, visible) = session.filter_toggle(&user)?;
            info!(id = %user.id, visible, "filter toggled");
            renderer.print_message(&format!(
                "{} {}",
                user.username,
                if visible { "shown" } else { "hidden" }
            ))?;
            session.filter()?
        }
        FilterCommand::All => {
            renderer.print_message(label(Label::SelectAll, lang))?;
            session.filter_all()?
        }
        FilterCommand::None => {
            renderer.print_message(label(Label::DeselectAll, lang))?;
            session.filter_none()?
        }
        FilterCommand::Reset => session.filter_reset()?,
    };

    renderer.print_message(&format!(
        "{}/{} {}",
        filter.len(),
        session.roster()?.len(),
        label(Label::UsersVisible, lang)
    ))
}

async fn run_profile<R: RemoteStore + Clone>(
    session: &mut Session<R>,
    renderer: &Renderer,
    action: ProfileCommand,
) -> anyhow::Result<()> {
    let lang = session.settings().language;
    match action {
        ProfileCommand::Update { username, email } => {
            let update = ProfileUpdate { username, email };
            if update.is_empty() {
                return Err(anyhow!("nothing to update; pass --username and/or --email"));
            }
            let user = session.update_profile(update).await?;
            renderer.print_message(label(Label::ProfileUpdated, lang))?;
            renderer.print_user(&user)?;
        }
        ProfileCommand::Password {
            current,
            new,
            confirm,
        } => {
            let current = secret_or_stdin(current, "current password")?;
            let new = secret_or_stdin(new, "new password")?;
            let confirm = confirm.unwrap_or_else(|| new.clone());
            session
                .change_password(PasswordChange {
                    current,
                    new,
                    confirm,
                })
                .await?;
            renderer.print_message(label(Label::PasswordUpdated, lang))?;
        }
        ProfileCommand::Delete { yes } => {
            if !yes {
                return Err(anyhow!("account deletion is irreversible; pass --yes to confirm"));
            }
            session.delete_account().await?;
            renderer.print_message(label(Label::AccountDeleted, lang))?;
        }
    }
    Ok(())
}

/// A failed refetch is not fatal: the cached roster is shown instead.
async fn refresh_or_warn<R: RemoteStore + Clone>(session: &mut Session<R>) -> anyhow::Result<()> {
    session.store()?;
    if let Err(err) = session.refresh().await {
        warn!(error = %format!("{err:#}"), "could not refetch users; showing cached data");
    }
    Ok(())
}

fn resolve_month(
    today: NaiveDate,
    month: Option<u32>,
    year: Option<i32>,
    shift: i32,
) -> anyhow::Result<(u32, i32)> {
    let month = month.unwrap_or_else(|| today.month());
    let year = year.unwrap_or_else(|| today.year());
    grid::shift_month(month, year, shift).with_context(|| format!("invalid month {month}/{year}"))
}

/// Secrets come from the flag, else from one line of stdin.
fn secret_or_stdin(value: Option<String>, what: &str) -> anyhow::Result<String> {
    if let Some(value) = value {
        return Ok(value);
    }

    let stdin = io::stdin();
    if stdin.is_terminal() {
        let mut err = io::stderr().lock();
        write!(err, "{what}: ")?;
        err.flush()?;
    }

    let mut line = String::new();
    stdin
        .lock()
        .read_line(&mut line)
        .with_context(|| format!("failed to read {what} from stdin"))?;
    let line = line.trim_end_matches(['\r', '\n']).to_string();
    if line.is_empty() {
        return Err(anyhow!("no {what} given; pass it as a flag or on stdin"));
    }
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_defaults_to_today() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 20).expect("date");
        assert_eq!(resolve_month(today, None, None, 0).expect("month"), (3, 2024));
        assert_eq!(resolve_month(today, Some(12), Some(2023), 0).expect("month"), (12, 2023));
        assert_eq!(resolve_month(today, Some(12), Some(2023), 1).expect("month"), (1, 2024));
        assert_eq!(resolve_month(today, None, None, -3).expect("month"), (12, 2023));
        assert!(resolve_month(today, Some(13), None, 0).is_err());
    }

    #[test]
    fn flag_secret_wins_over_stdin() {
        assert_eq!(
            secret_or_stdin(Some("secret".to_string()), "password").expect("secret"),
            "secret"
        );
    }
}
