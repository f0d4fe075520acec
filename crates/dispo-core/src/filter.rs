use std::collections::BTreeSet;

use serde::{
  Deserialize,
  Serialize
};
use tracing::debug;

use crate::user::Roster;

/// Subset of user ids whose selections
/// are visible in aggregation.
#[derive(
  Debug,
  Clone,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
)]
#[serde(transparent)]
pub struct UserFilterSet {
  ids: BTreeSet<String>
}

impl UserFilterSet {
  #[must_use]
  pub fn all(roster: &Roster) -> Self {
    Self {
      ids: roster
        .ids()
        .map(str::to_string)
        .collect()
    }
  }

  #[must_use]
  pub fn from_ids<I, S>(
    ids: I
  ) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>
  {
    Self {
      ids: ids
        .into_iter()
        .map(Into::into)
        .collect()
    }
  }

  /// Restores a persisted filter, or
  /// shows everyone when nothing was
  /// ever saved. A saved empty set
  /// stays empty.
  #[tracing::instrument(skip_all)]
  pub fn load(
    persisted: Option<Vec<String>>,
    roster: &Roster
  ) -> Self {
    match persisted {
      | Some(ids) => {
        debug!(
          count = ids.len(),
          "restored persisted user filter"
        );
        Self::from_ids(ids)
      }
      | None => {
        debug!(
          count = roster.len(),
          "no persisted filter; showing all users"
        );
        Self::all(roster)
      }
    }
  }

  pub fn toggle_user(
    &mut self,
    id: &str
  ) -> bool {
    if self.ids.remove(id) {
      false
    } else {
      self.ids.insert(id.to_string());
      true
    }
  }

  pub fn select_all(
    &mut self,
    roster: &Roster
  ) {
    *self = Self::all(roster);
  }

  pub fn deselect_all(&mut self) {
    self.ids.clear();
  }

  /// Same membership as
  /// [`select_all`](Self::select_all);
  /// callers also forget the persisted
  /// copy.
  pub fn reset(
    &mut self,
    roster: &Roster
  ) {
    self.select_all(roster);
  }

  #[must_use]
  pub fn contains(
    &self,
    id: &str
  ) -> bool {
    self.ids.contains(id)
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.ids.is_empty()
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.ids.len()
  }

  pub fn ids(
    &self
  ) -> impl Iterator<Item = &str> {
    self.ids.iter().map(String::as_str)
  }

  #[must_use]
  pub fn to_vec(&self) -> Vec<String> {
    self.ids.iter().cloned().collect()
  }
}

#[cfg(test)]
mod tests {
  use chrono::Utc;

  use super::UserFilterSet;
  use crate::user::{
    Roster,
    User
  };

  fn roster() -> Roster {
    let now = Utc::now();
    Roster::new(
      ["alice", "bob", "carol"]
        .into_iter()
        .map(|name| {
          let mut user = User::new(
            name.to_string(),
            format!("{name}@example.org"),
            String::new(),
            now
          );
          user.id = name.to_string();
          user
        })
        .collect()
    )
  }

  #[test]
  fn defaults_to_everyone_without_persisted_state()
   {
    let filter =
      UserFilterSet::load(None, &roster());
    assert_eq!(filter.len(), 3);
    assert!(filter.contains("bob"));
  }

  #[test]
  fn persisted_empty_set_stays_empty() {
    let filter = UserFilterSet::load(
      Some(vec![]),
      &roster()
    );
    assert!(filter.is_empty());
  }

  #[test]
  fn toggle_select_and_deselect() {
    let roster = roster();
    let mut filter =
      UserFilterSet::all(&roster);

    assert!(!filter.toggle_user("bob"));
    assert!(!filter.contains("bob"));
    assert!(filter.toggle_user("bob"));
    assert!(filter.contains("bob"));

    filter.deselect_all();
    assert!(filter.is_empty());

    filter.reset(&roster);
    assert_eq!(
      filter.to_vec(),
      vec!["alice", "bob", "carol"]
    );
  }
}
