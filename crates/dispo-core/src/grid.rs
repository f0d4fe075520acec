use chrono::{Datelike, Days, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use crate::date::format_date;
use crate::error::DateError;

pub const WEEKS: usize = 6;
pub const DAYS_PER_WEEK: usize = 7;
pub const GRID_LEN: usize = WEEKS * DAYS_PER_WEEK;

/// One cell of the month grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarSlot {
    pub id: String,
    pub day: u32,
    pub month: u32,
    pub year: i32,
    pub weekday: Weekday,
    /// False for lead-in/lead-out days; those render but are not selectable.
    pub in_month: bool,
    pub occupants: Vec<String>,
}

impl CalendarSlot {
    fn new(date: NaiveDate, displayed_month: u32) -> Self {
        Self {
            id: format_date(date),
            day: date.day(),
            month: date.month(),
            year: date.year(),
            weekday: date.weekday(),
            in_month: date.month() == displayed_month,
            occupants: Vec::new(),
        }
    }

    pub fn date(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, self.day)
    }
}

/// Builds the 6x7 Monday-first grid covering `month`/`year`.
#[tracing::instrument]
pub fn generate(month: u32, year: i32) -> Result<Vec<CalendarSlot>, DateError> {
    if !(1..=12).contains(&month) {
        return Err(DateError::MonthOutOfRange(month));
    }

    let first = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or(DateError::OutOfRange { month, year })?;
    let lead_in = u64::from(first.weekday().num_days_from_monday());
    let start = first
        .checked_sub_days(Days::new(lead_in))
        .ok_or(DateError::OutOfRange { month, year })?;

    let mut slots = Vec::with_capacity(GRID_LEN);
    for offset in 0..GRID_LEN as u64 {
        let date = start
            .checked_add_days(Days::new(offset))
            .ok_or(DateError::OutOfRange { month, year })?;
        slots.push(CalendarSlot::new(date, month));
    }

    tracing::trace!(
        first = %slots[0].id,
        last = %slots[GRID_LEN - 1].id,
        "generated calendar grid"
    );
    Ok(slots)
}

/// Moves a month/year pair by `delta` months, wrapping across years.
pub fn shift_month(month: u32, year: i32, delta: i32) -> Result<(u32, i32), DateError> {
    if !(1..=12).contains(&month) {
        return Err(DateError::MonthOutOfRange(month));
    }
    let index = i64::from(year) * 12 + i64::from(month) - 1 + i64::from(delta);
    let new_year =
        i32::try_from(index.div_euclid(12)).map_err(|_| DateError::OutOfRange { month, year })?;
    let new_month = index.rem_euclid(12) as u32 + 1;
    Ok((new_month, new_year))
}
