use std::cell::Cell;
use std::collections::BTreeSet;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, anyhow};
use chrono::{NaiveDate, Utc};
use tracing::{debug, info, instrument, warn};

use crate::accounts::{self, PasswordChange, RegisterForm};
use crate::aggregate::{self, PopularDate};
use crate::config::Config;
use crate::date::DateNormalizer;
use crate::filter::UserFilterSet;
use crate::grid::{self, CalendarSlot};
use crate::remote::{ProfileUpdate, Remote, RemoteStore};
use crate::selection::{RefreshOutcome, SelectionStore, ToggleOutcome};
use crate::settings::{AppSettings, Language, Theme};
use crate::stats::Stats;
use crate::storage::{APP_SETTINGS_KEY, CURRENT_USER_KEY, LocalStorage, USER_FILTERS_KEY};
use crate::user::{Roster, User};

const STORAGE_POLL: Duration = Duration::from_secs(1);

/// Everything the calendar screen shows for one month.
#[derive(Debug, Clone)]
pub struct Dashboard {
    pub month: u32,
    pub year: i32,
    pub today: NaiveDate,
    pub slots: Vec<CalendarSlot>,
    pub selections: BTreeSet<String>,
    pub most_popular: Option<PopularDate>,
    pub stats: Stats,
    pub visible_users: usize,
}

/// What [`Session::on_storage_changed`] picked up from another process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageChange {
    pub settings: bool,
    pub user: bool,
    pub filter: bool,
}

impl StorageChange {
    pub fn any(self) -> bool {
        self.settings || self.user || self.filter
    }
}

/// One client: local state plus, once logged in, a selection store.
pub struct Session<R> {
    remote: R,
    storage: LocalStorage,
    normalizer: DateNormalizer,
    timeout: Duration,
    settings: AppSettings,
    user: Option<User>,
    store: Option<SelectionStore<R>>,
}

impl Session<Remote> {
    #[instrument(skip(cfg, data_dir))]
    pub fn open(cfg: &Config, data_dir: &Path) -> anyhow::Result<Self> {
        let normalizer = DateNormalizer::default();
        let remote = Remote::from_config(cfg, data_dir, normalizer)?;
        let storage = LocalStorage::open(data_dir)
            .with_context(|| format!("failed to open local storage in {}", data_dir.display()))?;
        Ok(Session::new(remote, storage, normalizer, cfg.remote_timeout()?))
    }
}

impl<R: RemoteStore + Clone> Session<R> {
    pub fn new(remote: R, storage: LocalStorage, normalizer: DateNormalizer, timeout: Duration) -> Self {
        let settings = storage.get(APP_SETTINGS_KEY).unwrap_or_default();
        let mut session = Self {
            remote,
            storage,
            normalizer,
            timeout,
            settings,
            user: None,
            store: None,
        };
        if let Some(user) = session.storage.get::<User>(CURRENT_USER_KEY) {
            debug!(id = %user.id, "restoring current user");
            session.attach(user);
        }
        session
    }

    fn attach(&mut self, user: User) {
        let store = SelectionStore::new(self.remote.clone(), user.id.clone(), self.normalizer, self.timeout)
            .with_cached_user(user.clone());
        self.user = Some(user);
        self.store = Some(store);
    }

    fn detach(&mut self) {
        self.user = None;
        self.store = None;
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn today(&self) -> NaiveDate {
        self.normalizer.today()
    }

    pub fn normalizer(&self) -> &DateNormalizer {
        &self.normalizer
    }

    pub fn settings(&self) -> AppSettings {
        self.settings
    }

    pub fn current_user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn store(&self) -> anyhow::Result<&SelectionStore<R>> {
        self.store
            .as_ref()
            .ok_or_else(|| anyhow!("not logged in; run `dispo login` first"))
    }

    pub fn roster(&self) -> anyhow::Result<Roster> {
        Ok(self.store()?.roster())
    }

    fn persist_settings(&mut self) -> anyhow::Result<()> {
        self.storage.set(APP_SETTINGS_KEY, &self.settings)
    }

    pub fn set_language(&mut self, language: Language) -> anyhow::Result<()> {
        self.settings.language = language;
        self.persist_settings()
    }

    pub fn set_theme(&mut self, theme: Theme) -> anyhow::Result<()> {
        self.settings.theme = theme;
        self.persist_settings()
    }

    fn sign_in(&mut self, user: User) -> anyhow::Result<User> {
        let user = user.without_secret();
        self.storage.set(CURRENT_USER_KEY, &user)?;
        self.attach(user.clone());
        Ok(user)
    }

    #[instrument(skip(self, form))]
    pub async fn register(&mut self, form: RegisterForm) -> anyhow::Result<User> {
        let user = accounts::register(&self.remote, form, Utc::now()).await?;
        self.sign_in(user)
    }

    #[instrument(skip(self, password))]
    pub async fn login(&mut self, email: &str, password: &str) -> anyhow::Result<User> {
        let user = accounts::login(&self.remote, email, password).await?;
        self.sign_in(user)
    }

    /// Forgets the current user. Returns false when nobody was logged in.
    pub fn logout(&mut self) -> anyhow::Result<bool> {
        let was_logged_in = self.user.is_some();
        self.storage.remove(CURRENT_USER_KEY)?;
        self.detach();
        info!(was_logged_in, "logged out");
        Ok(was_logged_in)
    }

    /// Refetches the roster and keeps the cached current user in step.
    #[instrument(skip(self))]
    pub async fn refresh(&mut self) -> anyhow::Result<RefreshOutcome> {
        let outcome = self.store()?.refresh().await?;
        self.sync_current_user()?;
        Ok(outcome)
    }

    fn sync_current_user(&mut self) -> anyhow::Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let fresh = match store.roster().get(store.user_id()) {
            Some(user) => user.without_secret(),
            None => match &self.user {
                Some(cached) => User {
                    selections: store.selections(),
                    ..cached.clone()
                },
                None => return Ok(()),
            },
        };
        if self.user.as_ref() != Some(&fresh) {
            self.storage.set(CURRENT_USER_KEY, &fresh)?;
            self.user = Some(fresh);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn toggle(&mut self, date: &str) -> anyhow::Result<ToggleOutcome> {
        let outcome = self.store()?.toggle(date).await?;
        self.sync_current_user()?;
        Ok(outcome)
    }

    pub fn filter(&self) -> anyhow::Result<UserFilterSet> {
        let roster = self.roster()?;
        Ok(self.filter_for(&roster))
    }

    fn filter_for(&self, roster: &Roster) -> UserFilterSet {
        UserFilterSet::load(self.storage.get(USER_FILTERS_KEY), roster)
    }

    /// Refuses to save while the roster is still the cached snapshot.
    fn update_filter(&mut self, change: impl FnOnce(&mut UserFilterSet, &Roster)) -> anyhow::Result<UserFilterSet> {
        let store = self.store()?;
        if !store.roster_fetched() {
            return Err(anyhow!("the user list could not be fetched; filter left unchanged"));
        }
        let roster = store.roster();
        let mut filter = self.filter_for(&roster);
        change(&mut filter, &roster);
        self.storage.set(USER_FILTERS_KEY, &filter.to_vec())?;
        Ok(filter)
    }

    /// Resolves a user by id or, case-insensitively, by username.
    pub fn find_user(&self, needle: &str) -> anyhow::Result<User> {
        let roster = self.roster()?;
        roster
            .iter()
            .find(|u| u.id == needle)
            .or_else(|| roster.iter().find(|u| u.username.eq_ignore_ascii_case(needle)))
            .cloned()
            .ok_or_else(|| anyhow!("no such user: {needle}"))
    }

    /// Returns the user and whether they are now visible.
    pub fn filter_toggle(&mut self, needle: &str) -> anyhow::Result<(User, bool)> {
        let user = self.find_user(needle)?;
        let mut visible = false;
        self.update_filter(|filter, _| visible = filter.toggle_user(&user.id))?;
        Ok((user, visible))
    }

    /// Drops the saved filter; with nothing saved everyone is shown.
    pub fn filter_all(&mut self) -> anyhow::Result<UserFilterSet> {
        self.store()?;
        self.storage.remove(USER_FILTERS_KEY)?;
        self.filter()
    }

    /// An explicit empty filter, saved as `[]`.
    pub fn filter_none(&mut self) -> anyhow::Result<UserFilterSet> {
        self.store()?;
        let filter = UserFilterSet::default();
        self.storage.set(USER_FILTERS_KEY, &filter.to_vec())?;
        Ok(filter)
    }

    /// Shows everyone again and forgets the saved filter, so users who join
    /// later are visible too.
    pub fn filter_reset(&mut self) -> anyhow::Result<UserFilterSet> {
        let roster = self.roster()?;
        let mut filter = self.filter_for(&roster);
        filter.reset(&roster);
        self.storage.remove(USER_FILTERS_KEY)?;
        Ok(filter)
    }

    #[instrument(skip(self))]
    pub fn dashboard(&self, month: u32, year: i32) -> anyhow::Result<Dashboard> {
        let store = self.store()?;
        let roster = store.roster();
        let filter = self.filter_for(&roster);

        let grid = grid::generate(month, year)?;
        let slots = aggregate::aggregate(&grid, &roster, &filter);

        Ok(Dashboard {
            month,
            year,
            today: self.normalizer.today(),
            slots,
            selections: store.selections(),
            most_popular: aggregate::most_popular_in_roster(&roster, &filter),
            stats: Stats::compute(&roster, store.user_id()),
            visible_users: roster.ids().filter(|id| filter.contains(id)).count(),
        })
    }

    fn require_user_id(&self) -> anyhow::Result<String> {
        Ok(self.store()?.user_id().to_string())
    }

    #[instrument(skip(self, update))]
    pub async fn update_profile(&mut self, update: ProfileUpdate) -> anyhow::Result<User> {
        let id = self.require_user_id()?;
        let updated = accounts::update_profile(&self.remote, &id, update).await?;
        let updated = updated.without_secret();
        self.storage.set(CURRENT_USER_KEY, &updated)?;
        self.user = Some(updated.clone());
        if let Err(err) = self.refresh().await {
            warn!(error = %err, "roster refetch after profile update failed");
        }
        Ok(updated)
    }

    #[instrument(skip(self, change))]
    pub async fn change_password(&mut self, change: PasswordChange) -> anyhow::Result<()> {
        let id = self.require_user_id()?;
        accounts::change_password(&self.remote, &id, change).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_account(&mut self) -> anyhow::Result<()> {
        let id = self.require_user_id()?;
        accounts::delete_account(&self.remote, &id).await?;
        self.storage.remove(USER_FILTERS_KEY)?;
        self.logout()?;
        Ok(())
    }

    /// Reloads whatever another process changed in local storage. Any change
    /// also triggers a roster refetch.
    #[instrument(skip(self))]
    pub async fn on_storage_changed(&mut self) -> anyhow::Result<StorageChange> {
        let mut change = StorageChange::default();
        for key in self.storage.poll_changes() {
            match key.as_str() {
                APP_SETTINGS_KEY => {
                    self.settings = self.storage.get(APP_SETTINGS_KEY).unwrap_or_default();
                    change.settings = true;
                }
                CURRENT_USER_KEY => {
                    match self.storage.get::<User>(CURRENT_USER_KEY) {
                        Some(user) if self.user.as_ref().map(|u| &u.id) == Some(&user.id) => {
                            self.user = Some(user);
                        }
                        Some(user) => self.attach(user),
                        None => self.detach(),
                    }
                    change.user = true;
                }
                USER_FILTERS_KEY => change.filter = true,
                other => debug!(key = other, "ignoring unknown storage key"),
            }
        }

        if change.any() && self.store.is_some() {
            info!(?change, "local state changed externally; refetching roster");
            if let Err(err) = self.refresh().await {
                warn!(error = %err, "refetch after storage change failed");
            }
        }
        Ok(change)
    }

    /// Calls `render` after every roster poll (the first one right away)
    /// and again after any external storage change, until `shutdown`
    /// resolves.
    pub async fn watch<F>(
        &mut self,
        every: Duration,
        shutdown: F,
        mut render: impl FnMut(&Self) -> anyhow::Result<()>,
    ) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(every = ?every, "watching calendar");

        loop {
            let shutting_down = Cell::new(false);
            let interrupted = async {
                tokio::select! {
                    _ = &mut shutdown => shutting_down.set(true),
                    _ = self.storage.wait_for_change(STORAGE_POLL) => {}
                }
            };

            self.store()?
                .poll(every, interrupted, |_, result| {
                    if let Err(err) = result {
                        warn!(error = %err, "roster poll failed; showing cached data");
                    }
                    render(&*self)
                })
                .await?;

            if shutting_down.get() {
                info!("watch stopped");
                return Ok(());
            }
            self.on_storage_changed().await?;
        }
    }

    /// Writes the current user snapshot back; the other keys are written
    /// as they change.
    pub fn close(mut self) -> anyhow::Result<()> {
        self.sync_current_user()?;
        debug!("session closed");
        Ok(())
    }
}
