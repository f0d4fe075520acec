use std::collections::BTreeMap;
use std::fs;
use std::path::{
  Path,
  PathBuf
};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{
  Context,
  anyhow,
  bail
};
use tracing::{
  debug,
  info,
  trace,
  warn
};

pub const DEFAULT_POLL_SECS: u64 = 30;
pub const DEFAULT_TIMEOUT_MS: u64 =
  10_000;

const DEFAULT_DATA_DIR: &str =
  "~/.dispo";
const RC_FILE_NAME: &str = ".disporc";
const MAX_INCLUDE_DEPTH: usize = 8;

const SECRET_KEYS: [&str; 1] =
  ["remote.key"];

/// Which user store the client talks
/// to.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq,
)]
pub enum RemoteKind {
  File,
  Postgrest
}

impl FromStr for RemoteKind {
  type Err = anyhow::Error;

  fn from_str(
    s: &str
  ) -> Result<Self, Self::Err> {
    match s
      .trim()
      .to_ascii_lowercase()
      .as_str()
    {
      | "file" => Ok(Self::File),
      | "postgrest" | "supabase" => {
        Ok(Self::Postgrest)
      }
      | other => {
        Err(anyhow!(
          "unknown remote backend: \
           {other}"
        ))
      }
    }
  }
}

/// Settings from the disporc chain
/// plus command-line overrides.
/// Unset keys fall back to built-in
/// defaults in the typed getters.
#[derive(Debug, Clone, Default)]
pub struct Config {
  values:  BTreeMap<String, String>,
  sources: Vec<PathBuf>
}

enum RcLine {
  Include(String),
  Set(String, String)
}

impl Config {
  #[tracing::instrument(skip(
    rc_override
  ))]
  pub fn load(
    rc_override: Option<&Path>
  ) -> anyhow::Result<Self> {
    let mut cfg = Config::default();
    match locate_rc(rc_override)? {
      | Some(path) => {
        info!(disporc = %path.display(), "reading disporc");
        cfg.read_rc(&path, 0)?;
      }
      | None => {
        debug!(
          "no disporc; built-in \
           defaults apply"
        )
      }
    }
    Ok(cfg)
  }

  /// Files read so far, includes
  /// after the file naming them.
  pub fn sources(&self) -> &[PathBuf] {
    &self.sources
  }

  /// `rc.` prefixes are accepted and
  /// dropped.
  pub fn apply_overrides<I>(
    &mut self,
    overrides: I
  ) where
    I: IntoIterator<
      Item = (String, String)
    >
  {
    for (key, value) in overrides {
      let key = key
        .strip_prefix("rc.")
        .map(str::to_string)
        .unwrap_or(key);
      self.set(key, value, "override");
    }
  }

  pub fn get(
    &self,
    key: &str
  ) -> Option<&str> {
    self
      .values
      .get(key)
      .map(String::as_str)
  }

  pub fn get_bool(
    &self,
    key: &str
  ) -> anyhow::Result<Option<bool>> {
    self
      .get(key)
      .map(|raw| {
        parse_switch(raw).ok_or_else(
          || {
            anyhow!(
              "{key} must be on or \
               off, got: {raw}"
            )
          }
        )
      })
      .transpose()
  }

  fn get_parsed<T>(
    &self,
    key: &str
  ) -> anyhow::Result<Option<T>>
  where
    T: FromStr,
    T::Err: std::fmt::Display
  {
    self
      .get(key)
      .map(|raw| {
        raw.parse::<T>().map_err(
          |err| {
            anyhow!(
              "invalid {key}: {raw} \
               ({err})"
            )
          }
        )
      })
      .transpose()
  }

  fn require(
    &self,
    key: &str
  ) -> anyhow::Result<&str> {
    self
      .get(key)
      .filter(|v| !v.is_empty())
      .ok_or_else(|| {
        anyhow!(
          "{key} is required for the \
           postgrest backend"
        )
      })
  }

  /// `color`, on unless switched off.
  pub fn color(
    &self
  ) -> anyhow::Result<bool> {
    Ok(
      self
        .get_bool("color")?
        .unwrap_or(true)
    )
  }

  pub fn data_location(
    &self
  ) -> PathBuf {
    expand_home(
      self
        .get("data.location")
        .unwrap_or(DEFAULT_DATA_DIR)
    )
  }

  pub fn remote_kind(
    &self
  ) -> anyhow::Result<RemoteKind> {
    Ok(
      self
        .get_parsed("remote")?
        .unwrap_or(RemoteKind::File)
    )
  }

  pub fn remote_url(
    &self
  ) -> anyhow::Result<&str> {
    self.require("remote.url")
  }

  pub fn remote_key(
    &self
  ) -> anyhow::Result<&str> {
    self.require("remote.key")
  }

  /// Bound on every remote call.
  pub fn remote_timeout(
    &self
  ) -> anyhow::Result<Duration> {
    let ms = self
      .get_parsed::<u64>(
        "remote.timeout.ms"
      )?
      .unwrap_or(DEFAULT_TIMEOUT_MS);
    Ok(Duration::from_millis(
      ms.max(1)
    ))
  }

  /// Roster refetch period for
  /// `watch`.
  pub fn poll_interval(
    &self
  ) -> anyhow::Result<Duration> {
    let secs = self
      .get_parsed::<u64>(
        "poll.interval.secs"
      )?
      .unwrap_or(DEFAULT_POLL_SECS);
    Ok(Duration::from_secs(
      secs.max(1)
    ))
  }

  fn set(
    &mut self,
    key: String,
    value: String,
    origin: &str
  ) {
    if SECRET_KEYS
      .contains(&key.as_str())
    {
      trace!(key = %key, origin, "set config key");
    } else {
      trace!(key = %key, value = %value, origin, "set config key");
    }
    self.values.insert(key, value);
  }

  fn read_rc(
    &mut self,
    path: &Path,
    depth: usize
  ) -> anyhow::Result<()> {
    if depth > MAX_INCLUDE_DEPTH {
      bail!(
        "includes nested deeper than \
         {MAX_INCLUDE_DEPTH} at {}",
        path.display()
      );
    }
    if self
      .sources
      .iter()
      .any(|seen| seen == path)
    {
      warn!(file = %path.display(), "disporc already read; skipping repeated include");
      return Ok(());
    }

    let text = fs::read_to_string(path)
      .with_context(|| {
        format!(
          "failed to read {}",
          path.display()
        )
      })?;
    self.sources.push(path.to_path_buf());

    let origin =
      path.display().to_string();
    for line in parse_rc(&text, path)? {
      match line {
        | RcLine::Set(key, value) => {
          self.set(key, value, &origin)
        }
        | RcLine::Include(target) => {
          let target =
            include_target(path, &target);
          if target.is_file() {
            self
              .read_rc(&target, depth + 1)?;
          } else {
            warn!(include = %target.display(), "included disporc missing; skipping");
          }
        }
      }
    }
    Ok(())
  }
}

fn parse_rc(
  text: &str,
  path: &Path
) -> anyhow::Result<Vec<RcLine>> {
  let mut lines = Vec::new();
  for (idx, raw) in
    text.lines().enumerate()
  {
    let line = match raw.find('#') {
      | Some(at) => &raw[..at],
      | None => raw
    }
    .trim();
    if line.is_empty() {
      continue;
    }

    if let Some(target) =
      line.strip_prefix("include ")
    {
      let target = target.trim();
      if target.is_empty() {
        bail!(
          "{}:{}: include needs a path",
          path.display(),
          idx + 1
        );
      }
      lines.push(RcLine::Include(
        target.to_string()
      ));
      continue;
    }

    let Some((key, value)) =
      line.split_once('=')
    else {
      bail!(
        "{}:{}: expected key = value, \
         got: {raw}",
        path.display(),
        idx + 1
      );
    };
    lines.push(RcLine::Set(
      key.trim().to_string(),
      value.trim().to_string()
    ));
  }
  Ok(lines)
}

fn include_target(
  from: &Path,
  target: &str
) -> PathBuf {
  let target = expand_home(target);
  if target.is_absolute() {
    return target;
  }
  from
    .parent()
    .unwrap_or_else(|| Path::new("."))
    .join(target)
}

/// `--disporc`, then `DISPORC`
/// (`/dev/null` means none), then
/// `~/.disporc` when it exists.
fn locate_rc(
  rc_override: Option<&Path>
) -> anyhow::Result<Option<PathBuf>> {
  if let Some(path) = rc_override {
    return Ok(Some(expand_home(
      &path.to_string_lossy()
    )));
  }

  if let Ok(env) =
    std::env::var("DISPORC")
  {
    return Ok(
      (env != "/dev/null")
        .then(|| expand_home(&env))
    );
  }

  let home = dirs::home_dir()
    .context(
      "cannot determine home directory"
    )?;
  let candidate =
    home.join(RC_FILE_NAME);
  Ok(
    candidate
      .is_file()
      .then_some(candidate)
  )
}

/// Creates the directory when missing.
#[tracing::instrument(skip(
  cfg,
  override_dir
))]
pub fn resolve_data_dir(
  cfg: &Config,
  override_dir: Option<&Path>
) -> anyhow::Result<PathBuf> {
  let dir = override_dir
    .map(Path::to_path_buf)
    .unwrap_or_else(|| {
      cfg.data_location()
    });

  if !dir.is_dir() {
    info!(dir = %dir.display(), "creating data directory");
    fs::create_dir_all(&dir)
      .with_context(|| {
        format!(
          "failed to create {}",
          dir.display()
        )
      })?;
  }
  Ok(dir)
}

fn expand_home(raw: &str) -> PathBuf {
  match (
    raw.strip_prefix("~/"),
    dirs::home_dir()
  ) {
    | (Some(rest), Some(home)) => {
      home.join(rest)
    }
    | _ => PathBuf::from(raw)
  }
}

fn parse_switch(
  raw: &str
) -> Option<bool> {
  match raw
    .trim()
    .to_ascii_lowercase()
    .as_str()
  {
    | "on" | "yes" | "y" | "true"
    | "1" => Some(true),
    | "off" | "no" | "n" | "false"
    | "0" => Some(false),
    | _ => None
  }
}

#[cfg(test)]
mod tests {
  use tempfile::tempdir;

  use super::*;

  #[test]
  fn rc_chain_with_includes_and_overrides()
  {
    let temp =
      tempdir().expect("tempdir");
    fs::write(
      temp.path().join("remote.rc"),
      "remote = postgrest\n\
       remote.url = https://db.example.org # hosted\n\
       remote.key = anon\n\
       include disporc\n"
    )
    .expect("write include");
    let rc = temp.path().join("disporc");
    fs::write(
      &rc,
      "# dispo settings\n\
       include remote.rc\n\
       include missing.rc\n\
       color = off\n\
       poll.interval.secs = 5\n"
    )
    .expect("write rc");

    let mut cfg =
      Config::load(Some(rc.as_path()))
        .expect("load");
    assert_eq!(cfg.sources().len(), 2);
    assert_eq!(
      cfg.remote_kind().expect("kind"),
      RemoteKind::Postgrest
    );
    assert_eq!(
      cfg.remote_url().expect("url"),
      "https://db.example.org"
    );
    assert_eq!(
      cfg.remote_key().expect("key"),
      "anon"
    );
    assert!(
      !cfg.color().expect("color")
    );
    assert_eq!(
      cfg.poll_interval().expect("poll"),
      Duration::from_secs(5)
    );

    cfg.apply_overrides([(
      "rc.color".to_string(),
      "yes".to_string()
    )]);
    assert!(cfg.color().expect("color"));
  }

  #[test]
  fn defaults_and_bad_values() {
    let mut cfg = Config::default();
    assert!(cfg.color().expect("color"));
    assert_eq!(
      cfg.remote_kind().expect("kind"),
      RemoteKind::File
    );
    assert_eq!(
      cfg.remote_timeout().expect("t"),
      Duration::from_millis(
        DEFAULT_TIMEOUT_MS
      )
    );
    assert_eq!(
      cfg.poll_interval().expect("poll"),
      Duration::from_secs(
        DEFAULT_POLL_SECS
      )
    );
    assert!(cfg.remote_url().is_err());

    cfg.apply_overrides([
      (
        "poll.interval.secs".to_string(),
        "soon".to_string()
      ),
      (
        "color".to_string(),
        "sometimes".to_string()
      ),
      (
        "remote".to_string(),
        "ftp".to_string()
      )
    ]);
    assert!(cfg.poll_interval().is_err());
    assert!(cfg.color().is_err());
    assert!(cfg.remote_kind().is_err());
  }

  #[test]
  fn malformed_lines_are_errors() {
    let temp =
      tempdir().expect("tempdir");
    let rc = temp.path().join("disporc");
    fs::write(&rc, "color on\n")
      .expect("write");
    assert!(
      Config::load(Some(rc.as_path()))
        .is_err()
    );

    fs::write(&rc, "include   \n")
      .expect("write");
    assert!(
      Config::load(Some(rc.as_path()))
        .is_err()
    );
  }

  #[test]
  fn data_dir_override_is_created() {
    let temp =
      tempdir().expect("tempdir");
    let wanted =
      temp.path().join("nested/data");
    let dir = resolve_data_dir(
      &Config::default(),
      Some(wanted.as_path())
    )
    .expect("resolve");
    assert_eq!(dir, wanted);
    assert!(dir.is_dir());
  }
}
