use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{MissedTickBehavior, timeout};
use tracing::{debug, info, instrument, warn};

use crate::date::DateNormalizer;
use crate::error::{RemoteError, SelectionError};
use crate::remote::RemoteStore;
use crate::user::{Roster, User};

/// What a toggle restores if the remote rejects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    selections: BTreeSet<String>,
    roster_entry: Option<BTreeSet<String>>,
}

/// Lifecycle of one optimistic mutation. Only `Pending` blocks a new toggle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum MutationState {
    #[default]
    Idle,
    Pending { date: String, previous: Snapshot },
    Committed { date: String },
    RolledBack { date: String },
}

impl MutationState {
    pub fn is_pending(&self) -> bool {
        matches!(self, MutationState::Pending { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToggleOutcome {
    pub date: String,
    /// Membership after the toggle.
    pub selected: bool,
    /// False when the follow-up refetch failed; the cached roster is then
    /// the optimistic one.
    pub reconciled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Applied { users: usize },
    /// Another refetch was running; it will fetch again before finishing.
    Coalesced,
    /// A toggle is in flight and will refetch once it settles.
    Deferred,
}

#[derive(Debug, Default)]
struct RefreshState {
    running: bool,
    stale: bool,
}

#[derive(Debug, Default)]
struct Inner {
    selections: BTreeSet<String>,
    roster: Roster,
    /// Set once a fetched roster has been applied.
    fetched: bool,
    mutation: MutationState,
    refresh: RefreshState,
}

fn set_membership(set: &mut BTreeSet<String>, date: &str, member: bool) {
    if member {
        set.insert(date.to_string());
    } else {
        set.remove(date);
    }
}

impl Inner {
    fn begin(&mut self, user_id: &str, date: &str) -> Result<bool, SelectionError> {
        if self.mutation.is_pending() {
            return Err(SelectionError::Busy);
        }

        let previous = Snapshot {
            selections: self.selections.clone(),
            roster_entry: self.roster.get(user_id).map(|u| u.selections.clone()),
        };
        let select = !self.selections.contains(date);

        set_membership(&mut self.selections, date, select);
        if let Some(user) = self.roster.get_mut(user_id) {
            set_membership(&mut user.selections, date, select);
        }
        self.mutation = MutationState::Pending {
            date: date.to_string(),
            previous,
        };
        Ok(select)
    }

    fn commit(&mut self, user_id: &str, confirmed: BTreeSet<String>) {
        if let MutationState::Pending { date, .. } = std::mem::take(&mut self.mutation) {
            if let Some(user) = self.roster.get_mut(user_id) {
                user.selections = confirmed.clone();
            }
            self.selections = confirmed;
            self.mutation = MutationState::Committed { date };
        }
    }

    fn rollback(&mut self, user_id: &str) {
        if let MutationState::Pending { date, previous } = std::mem::take(&mut self.mutation) {
            self.selections = previous.selections;
            if let (Some(user), Some(entry)) = (self.roster.get_mut(user_id), previous.roster_entry) {
                user.selections = entry;
            }
            self.mutation = MutationState::RolledBack { date };
        }
    }

    fn apply_roster(&mut self, roster: Roster, user_id: &str) {
        self.selections = roster
            .get(user_id)
            .map(|u| u.selections.clone())
            .unwrap_or_default();
        self.roster = roster;
        self.fetched = true;
    }
}

/// Optimistic cache of the current user's selections and of the roster.
///
/// All state sits behind one lock that is never held across a remote call,
/// so overlapping calls on the same store observe each other's effects.
#[derive(Debug)]
pub struct SelectionStore<R> {
    remote: R,
    user_id: String,
    normalizer: DateNormalizer,
    timeout: Duration,
    inner: Mutex<Inner>,
}

impl<R: RemoteStore> SelectionStore<R> {
    pub fn new(remote: R, user_id: impl Into<String>, normalizer: DateNormalizer, timeout: Duration) -> Self {
        Self {
            remote,
            user_id: user_id.into(),
            normalizer,
            timeout,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Seeds the cache from a previously saved user snapshot so the
    /// calendar has something to show before the first fetch.
    pub fn with_cached_user(self, user: User) -> Self {
        {
            let user = user.normalized(&self.normalizer);
            let mut inner = self.inner.lock();
            inner.selections = user.selections.clone();
            inner.roster.upsert(user);
        }
        self
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn normalizer(&self) -> &DateNormalizer {
        &self.normalizer
    }

    pub fn selections(&self) -> BTreeSet<String> {
        self.inner.lock().selections.clone()
    }

    pub fn roster(&self) -> Roster {
        self.inner.lock().roster.clone()
    }

    /// False while the roster is only the cached bootstrap snapshot.
    pub fn roster_fetched(&self) -> bool {
        self.inner.lock().fetched
    }

    pub fn mutation_state(&self) -> MutationState {
        self.inner.lock().mutation.clone()
    }

    pub fn is_selected(&self, date: &str) -> bool {
        self.inner.lock().selections.contains(date)
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T, RemoteError>>) -> Result<T, RemoteError> {
        match timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(self.timeout)),
        }
    }

    /// Flips the membership of `date` for the current user.
    ///
    /// The change is visible immediately; a remote failure or timeout restores
    /// the exact previous state and is returned to the caller.
    #[instrument(skip(self), fields(user = %self.user_id))]
    pub async fn toggle(&self, date: &str) -> Result<ToggleOutcome, SelectionError> {
        let date = self.normalizer.normalize(date)?;
        let select = self.inner.lock().begin(&self.user_id, &date)?;
        debug!(%date, select, "applied optimistic toggle");

        let call = async {
            if select {
                self.remote.add_available_date(&self.user_id, &date).await
            } else {
                self.remote.remove_available_date(&self.user_id, &date).await
            }
        };

        match self.bounded(call).await {
            Ok(stored) => {
                let confirmed: BTreeSet<String> = stored
                    .iter()
                    .filter_map(|raw| self.normalizer.normalize(raw.as_str()).ok())
                    .collect();
                self.inner.lock().commit(&self.user_id, confirmed);
                info!(%date, select, "availability committed");

                let reconciled = match self.refresh().await {
                    Ok(_) => true,
                    Err(err) => {
                        warn!(error = %err, "refetch after toggle failed; keeping local roster");
                        false
                    }
                };
                Ok(ToggleOutcome {
                    date,
                    selected: select,
                    reconciled,
                })
            }
            Err(err) => {
                self.inner.lock().rollback(&self.user_id);
                warn!(%date, error = %err, "availability update failed; rolled back");
                Err(SelectionError::Remote(err))
            }
        }
    }

    /// Invalidates the roster and refetches it. Concurrent callers share a
    /// single refetch; a failed fetch keeps the last-known roster.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<RefreshOutcome, RemoteError> {
        {
            let mut inner = self.inner.lock();
            if inner.refresh.running {
                inner.refresh.stale = true;
                debug!("refetch already running; coalescing");
                return Ok(RefreshOutcome::Coalesced);
            }
            inner.refresh.running = true;
            inner.refresh.stale = false;
        }

        let result = self.refetch_until_fresh().await;
        self.inner.lock().refresh.running = false;
        result
    }

    async fn refetch_until_fresh(&self) -> Result<RefreshOutcome, RemoteError> {
        loop {
            let users = match self.bounded(self.remote.fetch_all_users()).await {
                Ok(users) => users,
                Err(err) => {
                    warn!(error = %err, "roster fetch failed; keeping cached roster");
                    return Err(err);
                }
            };
            let roster = Roster::from_remote(users, &self.normalizer);

            let mut inner = self.inner.lock();
            if inner.mutation.is_pending() {
                inner.refresh.stale = false;
                debug!("toggle in flight; deferring roster update");
                return Ok(RefreshOutcome::Deferred);
            }

            let count = roster.len();
            inner.apply_roster(roster, &self.user_id);
            if inner.refresh.stale {
                inner.refresh.stale = false;
                continue;
            }
            debug!(users = count, "roster refreshed");
            return Ok(RefreshOutcome::Applied { users: count });
        }
    }

    /// Refetches every `every` until `shutdown` resolves, handing each
    /// result to `on_refresh`. The first refetch happens immediately. An
    /// error from `on_refresh` ends polling and is returned.
    pub async fn poll<F, E>(
        &self,
        every: Duration,
        shutdown: F,
        mut on_refresh: impl FnMut(&Self, Result<RefreshOutcome, RemoteError>) -> Result<(), E>,
    ) -> Result<(), E>
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("roster polling stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    let result = self.refresh().await;
                    on_refresh(self, result)?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::date::Zone;
    use crate::remote::MemoryRemote;

    fn user(id: &str, dates: &[&str]) -> User {
        let mut user = User::new(id.to_string(), format!("{id}@example.org"), String::new(), Utc::now());
        user.id = id.to_string();
        user.selections = dates.iter().map(|d| d.to_string()).collect();
        user
    }

    fn store_for(remote: &MemoryRemote, id: &str) -> SelectionStore<MemoryRemote> {
        SelectionStore::new(
            remote.clone(),
            id,
            DateNormalizer::new(Zone::Named(chrono_tz::UTC)),
            Duration::from_millis(200),
        )
    }

    fn dates(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|d| d.to_string()).collect()
    }

    #[tokio::test]
    async fn toggle_twice_restores_membership() {
        let remote = MemoryRemote::new(vec![user("me", &["2024-03-01"])]);
        let store = store_for(&remote, "me");
        store.refresh().await.expect("initial fetch");

        let on = store.toggle("2024-3-10").await.expect("select");
        assert!(on.selected);
        assert!(on.reconciled);
        assert_eq!(store.selections(), dates(&["2024-03-01", "2024-03-10"]));

        let off = store.toggle("2024-03-10").await.expect("deselect");
        assert!(!off.selected);
        assert_eq!(store.selections(), dates(&["2024-03-01"]));
        assert_eq!(remote.snapshot()[0].selections, dates(&["2024-03-01"]));
        assert_eq!(
            store.mutation_state(),
            MutationState::Committed {
                date: "2024-03-10".to_string()
            }
        );
    }

    #[tokio::test]
    async fn remote_failure_rolls_back_everything() {
        let remote = MemoryRemote::new(vec![user("me", &[])]);
        let store = store_for(&remote, "me");
        store.refresh().await.expect("initial fetch");
        let roster_before = store.roster();

        remote.fail_next_writes(1);
        let err = store.toggle("2024-03-10").await.expect_err("remote down");

        assert!(matches!(err, SelectionError::Remote(RemoteError::Unavailable(_))));
        assert!(err.is_retryable());
        assert!(store.selections().is_empty());
        assert_eq!(store.roster(), roster_before);
        assert_eq!(
            store.mutation_state(),
            MutationState::RolledBack {
                date: "2024-03-10".to_string()
            }
        );

        // A retry after the failure goes through.
        store.toggle("2024-03-10").await.expect("retry");
        assert!(store.is_selected("2024-03-10"));
    }

    #[tokio::test]
    async fn slow_remote_times_out_and_rolls_back() {
        let remote = MemoryRemote::new(vec![user("me", &["2024-03-02"])]);
        let store = store_for(&remote, "me");
        store.refresh().await.expect("initial fetch");

        remote.set_latency(Some(Duration::from_secs(2)));
        let err = store.toggle("2024-03-02").await.expect_err("timeout");
        assert!(matches!(err, SelectionError::Remote(RemoteError::Timeout(_))));
        assert_eq!(store.selections(), dates(&["2024-03-02"]));
    }

    #[tokio::test]
    async fn optimistic_state_is_visible_while_pending_and_blocks_new_toggles() {
        let remote = MemoryRemote::new(vec![user("me", &[])]);
        let store = store_for(&remote, "me");
        store.refresh().await.expect("initial fetch");
        remote.set_latency(Some(Duration::from_millis(50)));

        let (first, second, seen) = tokio::join!(store.toggle("2024-03-10"), store.toggle("2024-03-11"), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            (store.selections(), store.roster().get("me").map(|u| u.selections.clone()))
        });

        assert!(first.expect("first toggle").selected);
        assert_eq!(second, Err(SelectionError::Busy));
        assert_eq!(seen.0, dates(&["2024-03-10"]));
        assert_eq!(seen.1, Some(dates(&["2024-03-10"])));
        assert_eq!(store.selections(), dates(&["2024-03-10"]));
    }

    #[tokio::test]
    async fn fetch_landing_mid_toggle_is_deferred() {
        let remote = MemoryRemote::new(vec![user("me", &[])]);
        let store = store_for(&remote, "me");
        store.refresh().await.expect("initial fetch");
        remote.set_write_latency(Some(Duration::from_millis(50)));

        let (toggled, during) = tokio::join!(store.toggle("2024-03-10"), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let outcome = store.refresh().await;
            (
                outcome,
                store.mutation_state().is_pending(),
                store.is_selected("2024-03-10"),
                store.roster().get("me").map(|u| u.selections.clone()),
            )
        });

        let (outcome, pending, selected, entry) = during;
        assert_eq!(outcome, Ok(RefreshOutcome::Deferred));
        assert!(pending);
        assert!(selected);
        assert_eq!(entry, Some(dates(&["2024-03-10"])));

        let toggled = toggled.expect("toggle");
        assert!(toggled.selected && toggled.reconciled);
        assert_eq!(store.selections(), dates(&["2024-03-10"]));
        assert_eq!(remote.fetch_count(), 3);
    }

    #[tokio::test]
    async fn failing_callback_stops_polling() {
        let remote = MemoryRemote::new(vec![user("me", &[])]);
        let store = store_for(&remote, "me");

        let result = store
            .poll(Duration::from_millis(5), std::future::pending::<()>(), |polled, result| {
                assert_eq!(result, Ok(RefreshOutcome::Applied { users: 1 }));
                if polled.roster_fetched() {
                    Err("render failed")
                } else {
                    Ok(())
                }
            })
            .await;
        assert_eq!(result, Err("render failed"));
        assert_eq!(remote.fetch_count(), 1);
    }

    #[tokio::test]
    async fn invalid_date_changes_nothing() {
        let remote = MemoryRemote::new(vec![user("me", &["2024-03-01"])]);
        let store = store_for(&remote, "me");
        store.refresh().await.expect("initial fetch");

        let err = store.toggle("2024-02-31").await.expect_err("invalid");
        assert!(matches!(err, SelectionError::InvalidDate(_)));
        assert!(!err.is_retryable());
        assert_eq!(store.mutation_state(), MutationState::Idle);
        assert_eq!(store.selections(), dates(&["2024-03-01"]));
    }

    #[tokio::test]
    async fn refresh_picks_up_other_users_and_survives_failures() {
        let remote = MemoryRemote::new(vec![user("me", &[]), user("them", &["2024-3-5", "2024-03-05", "garbage"])]);
        let store = store_for(&remote, "me");
        assert_eq!(store.refresh().await, Ok(RefreshOutcome::Applied { users: 2 }));
        assert_eq!(
            store.roster().get("them").map(|u| u.selections.clone()),
            Some(dates(&["2024-03-05"]))
        );

        remote.edit_user("them", |u| {
            u.selections.insert("2024-03-06".to_string());
        });
        remote.fail_next_fetches(1);
        let cached = store.roster();
        assert!(store.refresh().await.is_err());
        assert_eq!(store.roster(), cached);

        store.refresh().await.expect("recovered");
        assert_eq!(
            store.roster().get("them").map(|u| u.selections.len()),
            Some(2)
        );
    }

    #[tokio::test]
    async fn concurrent_refreshes_share_one_refetch_cycle() {
        let remote = MemoryRemote::new(vec![user("me", &[])]);
        let store = store_for(&remote, "me");
        remote.set_latency(Some(Duration::from_millis(20)));

        let (a, b, c) = tokio::join!(store.refresh(), store.refresh(), store.refresh());
        assert_eq!(a, Ok(RefreshOutcome::Applied { users: 1 }));
        assert_eq!(b, Ok(RefreshOutcome::Coalesced));
        assert_eq!(c, Ok(RefreshOutcome::Coalesced));
        assert_eq!(remote.fetch_count(), 2);
    }

    #[tokio::test]
    async fn cached_user_bootstraps_before_first_fetch() {
        let remote = MemoryRemote::new(vec![]);
        let store = store_for(&remote, "me").with_cached_user(user("me", &["2024-3-9"]));
        assert_eq!(store.selections(), dates(&["2024-03-09"]));
        assert_eq!(store.roster().len(), 1);
    }

    #[tokio::test]
    async fn polling_stops_on_shutdown() {
        let remote = MemoryRemote::new(vec![user("me", &[])]);
        let store = store_for(&remote, "me");
        let mut ticks = 0;

        store
            .poll(
                Duration::from_millis(10),
                tokio::time::sleep(Duration::from_millis(35)),
                |_, result| {
                    assert!(result.is_ok());
                    ticks += 1;
                    Ok::<_, RemoteError>(())
                },
            )
            .await
            .expect("poll");

        assert!(ticks >= 2, "ticks = {ticks}");
        assert_eq!(remote.fetch_count(), ticks);
    }
}
