use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

use chrono::{
  DateTime,
  Local,
  NaiveDate,
  NaiveDateTime,
  TimeZone,
  Utc
};
use chrono_tz::Tz;
use regex::Regex;
use serde::Deserialize;

use crate::error::DateError;

const TIMEZONE_CONFIG_FILE: &str =
  "dispo-time.toml";
const TIMEZONE_ENV_VAR: &str =
  "DISPO_TIMEZONE";
const TIMEZONE_CONFIG_ENV_VAR: &str =
  "DISPO_TIME_CONFIG";

pub const CANONICAL_FORMAT: &str =
  "%Y-%m-%d";

#[derive(Debug, Deserialize)]
struct TimezoneConfig {
  timezone: Option<String>,
  time:     Option<TimezoneSection>
}

#[derive(Debug, Deserialize)]
struct TimezoneSection {
  timezone: Option<String>
}

/// Zone whose calendar decides which
/// day an instant belongs to.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq,
)]
pub enum Zone {
  System,
  Named(Tz)
}

impl Zone {
  fn date_of<T: TimeZone>(
    &self,
    dt: &DateTime<T>
  ) -> NaiveDate {
    match self {
      | Zone::System => {
        dt.with_timezone(&Local)
          .date_naive()
      }
      | Zone::Named(tz) => {
        dt.with_timezone(tz)
          .date_naive()
      }
    }
  }

  #[must_use]
  pub fn today(&self) -> NaiveDate {
    self.date_of(&Utc::now())
  }
}

pub fn local_zone() -> Zone {
  static LOCAL_ZONE: OnceLock<Zone> =
    OnceLock::new();
  *LOCAL_ZONE
    .get_or_init(resolve_local_zone)
}

/// Anything that can be pinned to a
/// calendar day in a given zone.
pub trait DateLike {
  fn local_date(
    &self,
    zone: Zone
  ) -> Result<NaiveDate, DateError>;
}

impl DateLike for str {
  fn local_date(
    &self,
    zone: Zone
  ) -> Result<NaiveDate, DateError> {
    parse_text(self, zone)
  }
}

impl DateLike for String {
  fn local_date(
    &self,
    zone: Zone
  ) -> Result<NaiveDate, DateError> {
    parse_text(self, zone)
  }
}

impl DateLike for NaiveDate {
  fn local_date(
    &self,
    _zone: Zone
  ) -> Result<NaiveDate, DateError> {
    Ok(*self)
  }
}

// Naive timestamps are wall-clock time
// in the local zone already.
impl DateLike for NaiveDateTime {
  fn local_date(
    &self,
    _zone: Zone
  ) -> Result<NaiveDate, DateError> {
    Ok(self.date())
  }
}

impl<T: TimeZone> DateLike
  for DateTime<T>
{
  fn local_date(
    &self,
    zone: Zone
  ) -> Result<NaiveDate, DateError> {
    Ok(zone.date_of(self))
  }
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq,
)]
pub struct DateNormalizer {
  zone: Zone
}

impl Default for DateNormalizer {
  fn default() -> Self {
    Self {
      zone: local_zone()
    }
  }
}

impl DateNormalizer {
  #[must_use]
  pub fn new(zone: Zone) -> Self {
    Self {
      zone
    }
  }

  /// Canonical `YYYY-MM-DD` form of
  /// the local calendar day of `value`.
  pub fn normalize<D>(
    &self,
    value: &D
  ) -> Result<String, DateError>
  where
    D: DateLike + ?Sized
  {
    let date =
      value.local_date(self.zone)?;
    Ok(format_date(date))
  }

  pub fn parse<D>(
    &self,
    value: &D
  ) -> Result<NaiveDate, DateError>
  where
    D: DateLike + ?Sized
  {
    value.local_date(self.zone)
  }

  #[must_use]
  pub fn today(&self) -> NaiveDate {
    self.zone.today()
  }
}

#[must_use]
pub fn format_date(
  date: NaiveDate
) -> String {
  date
    .format(CANONICAL_FORMAT)
    .to_string()
}

fn date_only_re() -> &'static Regex {
  static RE: OnceLock<Regex> =
    OnceLock::new();
  RE.get_or_init(|| {
    Regex::new(
      r"^(\d{4})[-/](\d{1,2})[-/](\d{1,2})$"
    )
    .expect("valid date regex")
  })
}

fn naive_datetime_re() -> &'static Regex
{
  static RE: OnceLock<Regex> =
    OnceLock::new();
  RE.get_or_init(|| {
    Regex::new(
      r"^(\d{4})[-/](\d{1,2})[-/](\d{1,2})[T ](\d{1,2}):(\d{2})(?::(\d{2})(?:\.\d+)?)?$"
    )
    .expect("valid datetime regex")
  })
}

#[tracing::instrument(level = "trace", skip(zone))]
fn parse_text(
  raw: &str,
  zone: Zone
) -> Result<NaiveDate, DateError> {
  let token = raw.trim();
  if token.is_empty() {
    return Err(DateError::invalid(raw));
  }

  if let Some(caps) =
    date_only_re().captures(token)
  {
    return ymd_from_captures(
      &caps, raw
    );
  }

  if let Ok(dt) =
    DateTime::parse_from_rfc3339(token)
  {
    return Ok(zone.date_of(&dt));
  }

  if let Some(caps) =
    naive_datetime_re().captures(token)
  {
    let date =
      ymd_from_captures(&caps, raw)?;
    let hour = capture_u32(&caps, 4);
    let minute = capture_u32(&caps, 5);
    let second = caps
      .get(6)
      .and_then(|m| {
        m.as_str().parse::<u32>().ok()
      })
      .unwrap_or(0);
    return date
      .and_hms_opt(
        hour, minute, second
      )
      .map(|dt| dt.date())
      .ok_or_else(|| {
        DateError::invalid(raw)
      });
  }

  if let Ok(dt) =
    DateTime::parse_from_rfc2822(token)
  {
    return Ok(zone.date_of(&dt));
  }

  Err(DateError::invalid(raw))
}

fn ymd_from_captures(
  caps: &regex::Captures<'_>,
  raw: &str
) -> Result<NaiveDate, DateError> {
  let year = caps[1]
    .parse::<i32>()
    .map_err(|_| {
      DateError::invalid(raw)
    })?;
  let month = capture_u32(caps, 2);
  let day = capture_u32(caps, 3);
  NaiveDate::from_ymd_opt(
    year, month, day
  )
  .ok_or_else(|| DateError::invalid(raw))
}

fn capture_u32(
  caps: &regex::Captures<'_>,
  idx: usize
) -> u32 {
  caps
    .get(idx)
    .and_then(|m| {
      m.as_str().parse::<u32>().ok()
    })
    .unwrap_or(u32::MAX)
}

fn resolve_local_zone() -> Zone {
  if let Ok(raw) =
    std::env::var(TIMEZONE_ENV_VAR)
    && let Some(tz) = parse_timezone(
      &raw,
      TIMEZONE_ENV_VAR
    )
  {
    return Zone::Named(tz);
  }

  if let Some(path) =
    timezone_config_path()
    && let Some(tz) =
      load_timezone_from_file(&path)
  {
    return Zone::Named(tz);
  }

  tracing::debug!(
    "no timezone configured; using \
     system local zone"
  );
  Zone::System
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
  path: &PathBuf
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
        "configured local timezone"
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
