use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use super::{ProfileUpdate, RemoteStore, same_day};
use crate::date::DateNormalizer;
use crate::error::RemoteError;
use crate::user::User;

/// In-memory user store. Clones share the same users.
///
/// With the `test-util` feature it also offers failure injection and
/// artificial latency.
#[derive(Debug, Clone, Default)]
pub struct MemoryRemote {
    users: Arc<Mutex<Vec<User>>>,
    normalizer: DateNormalizer,
    failing_writes: Arc<AtomicUsize>,
    failing_fetches: Arc<AtomicUsize>,
    fetches: Arc<AtomicUsize>,
    latency: Arc<Mutex<Latency>>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Latency {
    every_call: Option<Duration>,
    writes: Option<Duration>,
}

impl MemoryRemote {
    pub fn new(users: Vec<User>) -> Self {
        Self {
            users: Arc::new(Mutex::new(users)),
            ..Self::default()
        }
    }

    /// Zone used to match loosely stored dates against canonical ones.
    pub fn with_normalizer(mut self, normalizer: DateNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn snapshot(&self) -> Vec<User> {
        self.users.lock().clone()
    }
}

#[cfg(any(test, feature = "test-util"))]
impl MemoryRemote {
    /// The next `n` date mutations fail with [`RemoteError::Unavailable`].
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_fetches(&self, n: usize) {
        self.failing_fetches.store(n, Ordering::SeqCst);
    }

    /// Delay applied to every date mutation and roster fetch.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.latency.lock().every_call = latency;
    }

    /// Delay for date mutations only; takes precedence over
    /// [`MemoryRemote::set_latency`].
    pub fn set_write_latency(&self, latency: Option<Duration>) {
        self.latency.lock().writes = latency;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Edits a stored user directly, as another client would.
    pub fn edit_user(&self, id: &str, change: impl FnOnce(&mut User)) {
        if let Some(user) = self.users.lock().iter_mut().find(|u| u.id == id) {
            change(user);
        }
    }
}

impl MemoryRemote {
    async fn delay(&self, write: bool) {
        let latency = *self.latency.lock();
        let wait = if write {
            latency.writes.or(latency.every_call)
        } else {
            latency.every_call
        };
        if let Some(wait) = wait {
            tokio::time::sleep(wait).await;
        }
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn mutate_dates(
        &self,
        user_id: &str,
        change: impl FnOnce(&mut User),
    ) -> Result<Vec<String>, RemoteError> {
        if Self::take_failure(&self.failing_writes) {
            return Err(RemoteError::Unavailable("injected write failure".to_string()));
        }
        let mut users = self.users.lock();
        let user = users
            .iter_mut()
            .find(|u| u.id == user_id)
            .ok_or_else(|| RemoteError::NotFound(user_id.to_string()))?;
        change(user);
        Ok(user.selections.iter().cloned().collect())
    }
}

impl RemoteStore for MemoryRemote {
    async fn fetch_all_users(&self) -> Result<Vec<User>, RemoteError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.delay(false).await;
        if Self::take_failure(&self.failing_fetches) {
            return Err(RemoteError::Unavailable("injected fetch failure".to_string()));
        }
        Ok(self.snapshot())
    }

    async fn add_available_date(&self, user_id: &str, date: &str) -> Result<Vec<String>, RemoteError> {
        self.delay(true).await;
        let normalizer = self.normalizer;
        self.mutate_dates(user_id, |user| {
            if !user.selections.iter().any(|d| same_day(&normalizer, d, date)) {
                user.selections.insert(date.to_string());
            }
        })
    }

    async fn remove_available_date(&self, user_id: &str, date: &str) -> Result<Vec<String>, RemoteError> {
        self.delay(true).await;
        let normalizer = self.normalizer;
        self.mutate_dates(user_id, |user| {
            user.selections.retain(|d| !same_day(&normalizer, d, date));
        })
    }

    async fn get_user_by_id(&self, id: &str) -> Result<Option<User>, RemoteError> {
        Ok(self.users.lock().iter().find(|u| u.id == id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, RemoteError> {
        Ok(self
            .users
            .lock()
            .iter()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn create_user(&self, user: User) -> Result<User, RemoteError> {
        self.users.lock().push(user.clone());
        Ok(user)
    }

    async fn update_user_profile(&self, id: &str, update: ProfileUpdate) -> Result<User, RemoteError> {
        let mut users = self.users.lock();
        let user = users
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        update.apply(user);
        Ok(user.clone())
    }

    async fn update_password(&self, id: &str, password_hash: String) -> Result<(), RemoteError> {
        let mut users = self.users.lock();
        let user = users
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        user.password_hash = password_hash;
        Ok(())
    }

    async fn delete_user(&self, id: &str) -> Result<(), RemoteError> {
        let mut users = self.users.lock();
        let before = users.len();
        users.retain(|u| u.id != id);
        if users.len() == before {
            return Err(RemoteError::NotFound(id.to_string()));
        }
        Ok(())
    }
}
