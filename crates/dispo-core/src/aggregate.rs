use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, instrument};

use crate::filter::UserFilterSet;
use crate::grid::CalendarSlot;
use crate::user::{Roster, User};

/// Minimum number of occupants before a date counts as popular.
pub const POPULAR_THRESHOLD: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PopularDate {
    pub date: String,
    pub count: usize,
}

fn visible<'a>(roster: &'a Roster, filter: &'a UserFilterSet) -> impl Iterator<Item = &'a User> {
    roster.iter().filter(move |user| filter.contains(&user.id))
}

/// Fills each slot with the filtered users who selected it, in roster order.
/// Occupants already present on the input slots are discarded.
#[instrument(skip_all, fields(slots = grid.len(), users = roster.len(), visible = filter.len()))]
pub fn aggregate(grid: &[CalendarSlot], roster: &Roster, filter: &UserFilterSet) -> Vec<CalendarSlot> {
    let slots: Vec<CalendarSlot> = grid
        .iter()
        .map(|slot| CalendarSlot {
            occupants: visible(roster, filter)
                .filter(|user| user.selections.contains(&slot.id))
                .map(|user| user.id.clone())
                .collect(),
            ..slot.clone()
        })
        .collect();

    debug!(
        occupied = slots.iter().filter(|s| !s.occupants.is_empty()).count(),
        "aggregated availability"
    );
    slots
}

/// Most occupied slot, first one wins on ties, none below the threshold.
pub fn most_popular(slots: &[CalendarSlot]) -> Option<PopularDate> {
    plurality(slots.iter().map(|slot| (slot.id.as_str(), slot.occupants.len())))
}

/// Same rule applied to every selection of every visible user, whatever
/// month is displayed. Dates are visited chronologically.
#[instrument(skip_all)]
pub fn most_popular_in_roster(roster: &Roster, filter: &UserFilterSet) -> Option<PopularDate> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for user in visible(roster, filter) {
        for date in &user.selections {
            *counts.entry(date.as_str()).or_default() += 1;
        }
    }
    plurality(counts.into_iter())
}

fn plurality<'a>(counts: impl Iterator<Item = (&'a str, usize)>) -> Option<PopularDate> {
    let mut best: Option<(&str, usize)> = None;
    for (date, count) in counts {
        match best {
            Some((_, top)) if count <= top => {}
            _ => best = Some((date, count)),
        }
    }

    best.filter(|(_, count)| *count >= POPULAR_THRESHOLD)
        .map(|(date, count)| PopularDate {
            date: date.to_string(),
            count,
        })
}
