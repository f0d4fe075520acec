use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::anyhow;
use clap::{ArgAction, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::settings::{Language, Theme};

#[derive(Debug, Clone)]
pub struct PreprocessedArgs {
    pub cleaned_args: Vec<OsString>,
    pub rc_overrides: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct KeyVal {
    pub key: String,
    pub value: String,
}

impl std::str::FromStr for KeyVal {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (k, v) = s
            .split_once('=')
            .ok_or_else(|| anyhow!("expected KEY=VALUE, got: {s}"))?;
        Ok(Self {
            key: k.trim().to_string(),
            value: v.trim().to_string(),
        })
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "dispo",
    version,
    about = "Dispo: shared availability calendar",
    disable_help_subcommand = true
)]
pub struct GlobalCli {
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[arg(short = 'q', long = "quiet", action = ArgAction::Count, global = true)]
    pub quiet: u8,

    #[arg(
        long = "rc",
        value_parser = clap::builder::ValueParser::new(|s: &str| s.parse::<KeyVal>()),
        action = ArgAction::Append
    )]
    pub rc_overrides: Vec<KeyVal>,

    #[arg(long = "disporc")]
    pub disporc: Option<PathBuf>,

    #[arg(long = "data")]
    pub data: Option<PathBuf>,

    /// Defaults to `calendar` for the current month.
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Create an account and log in.
    Register {
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
        /// Read from stdin when omitted.
        #[arg(long)]
        password: Option<String>,
        /// Defaults to the password.
        #[arg(long)]
        confirm: Option<String>,
    },
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: Option<String>,
    },
    Logout,
    Whoami,
    /// Month grid with everyone's availability.
    Calendar {
        #[arg(long)]
        month: Option<u32>,
        #[arg(long)]
        year: Option<i32>,
        /// Months to move from the chosen one, e.g. `--shift -1`.
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        shift: i32,
    },
    /// Select or deselect one day for the current user.
    Toggle { date: String },
    Stats,
    Users,
    Filter {
        #[command(subcommand)]
        action: Option<FilterCommand>,
    },
    Settings {
        #[command(subcommand)]
        action: Option<SettingsCommand>,
    },
    Profile {
        #[command(subcommand)]
        action: ProfileCommand,
    },
    /// Redraw the calendar whenever the roster or local state changes.
    Watch {
        /// Seconds between roster refetches; overrides `poll.interval.secs`.
        #[arg(long)]
        interval: Option<u64>,
        #[arg(long)]
        month: Option<u32>,
        #[arg(long)]
        year: Option<i32>,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum FilterCommand {
    Show,
    Toggle { user: String },
    All,
    None,
    Reset,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum SettingsCommand {
    Show,
    Language { value: Language },
    Theme { value: Theme },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ProfileCommand {
    Update {
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        email: Option<String>,
    },
    Password {
        #[arg(long)]
        current: Option<String>,
        #[arg(long)]
        new: Option<String>,
        #[arg(long)]
        confirm: Option<String>,
    },
    Delete {
        /// Required; deletion cannot be undone.
        #[arg(long)]
        yes: bool,
    },
}

pub fn init_tracing(verbose: u8, quiet: u8) -> anyhow::Result<()> {
    let default_level = if quiet >= 2 {
        "error"
    } else if quiet == 1 {
        "warn"
    } else if verbose >= 3 {
        "trace"
    } else if verbose == 2 {
        "debug"
    } else if verbose == 1 {
        "info"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| anyhow!("invalid RUST_LOG / log filter: {e}"))?;

    let init_result = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();

    if let Err(err) = init_result {
        debug!(error = %err, "tracing subscriber already set, continuing");
    }

    Ok(())
}

/// Pulls positional `rc.key=value` (or `rc.key:value`) overrides out of the
/// argument list before clap sees it.
#[tracing::instrument(skip_all)]
pub fn preprocess_args(raw: &[OsString]) -> anyhow::Result<PreprocessedArgs> {
    let mut cleaned = Vec::with_capacity(raw.len());
    let mut overrides: Vec<(String, String)> = Vec::new();

    let mut iter = raw.iter().cloned();
    if let Some(bin) = iter.next() {
        cleaned.push(bin);
    }

    for arg in iter {
        let s = arg.to_string_lossy();
        if let Some(rest) = s.strip_prefix("rc.") {
            let parsed = rest
                .split_once('=')
                .or_else(|| rest.split_once(':'))
                .map(|(k, v)| (format!("rc.{k}"), v.to_string()));

            if let Some((k, v)) = parsed {
                debug!(key = %k, "captured positional rc override");
                overrides.push((k, v));
                continue;
            }
        }

        cleaned.push(arg);
    }

    Ok(PreprocessedArgs {
        cleaned_args: cleaned,
        rc_overrides: overrides,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<OsString> {
        items.iter().map(OsString::from).collect()
    }

    #[test]
    fn positional_rc_overrides_are_extracted() {
        let pre = preprocess_args(&args(&["dispo", "rc.color=off", "toggle", "rc.remote:file", "2024-03-10"]))
            .expect("preprocess");
        assert_eq!(pre.cleaned_args, args(&["dispo", "toggle", "2024-03-10"]));
        assert_eq!(
            pre.rc_overrides,
            vec![
                ("rc.color".to_string(), "off".to_string()),
                ("rc.remote".to_string(), "file".to_string())
            ]
        );
    }

    #[test]
    fn parses_subcommands() {
        let cli = GlobalCli::parse_from(["dispo", "-vv", "--rc", "color=off", "filter", "toggle", "u1"]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.rc_overrides[0].key, "color");
        assert_eq!(
            cli.command,
            Some(Command::Filter {
                action: Some(FilterCommand::Toggle {
                    user: "u1".to_string()
                })
            })
        );

        let cli = GlobalCli::parse_from(["dispo", "settings", "theme", "anthracite"]);
        assert_eq!(
            cli.command,
            Some(Command::Settings {
                action: Some(SettingsCommand::Theme {
                    value: Theme::Anthracite
                })
            })
        );

        let cli = GlobalCli::parse_from(["dispo"]);
        assert_eq!(cli.command, None);
    }
}
