use std::future::Future;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{Config, RemoteKind};
use crate::date::DateNormalizer;
use crate::error::RemoteError;
use crate::user::User;

pub mod file;
pub mod memory;
pub mod postgrest;

pub use file::FileRemote;
pub use memory::MemoryRemote;
pub use postgrest::PostgrestRemote;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.username.is_none() && self.email.is_none()
    }

    pub fn apply(&self, user: &mut User) {
        if let Some(username) = &self.username {
            user.username = username.clone();
        }
        if let Some(email) = &self.email {
            user.email = email.clone();
        }
    }
}

/// Contract of the hosted user store. Date strings passed in are already
/// canonical; date lists coming back may not be.
pub trait RemoteStore {
    fn fetch_all_users(&self) -> impl Future<Output = Result<Vec<User>, RemoteError>>;

    /// Appends `date` unless already present; returns the stored list.
    fn add_available_date(
        &self,
        user_id: &str,
        date: &str,
    ) -> impl Future<Output = Result<Vec<String>, RemoteError>>;

    /// Removes `date` if present; returns the stored list.
    fn remove_available_date(
        &self,
        user_id: &str,
        date: &str,
    ) -> impl Future<Output = Result<Vec<String>, RemoteError>>;

    fn get_user_by_id(&self, id: &str) -> impl Future<Output = Result<Option<User>, RemoteError>>;

    fn find_user_by_email(
        &self,
        email: &str,
    ) -> impl Future<Output = Result<Option<User>, RemoteError>>;

    fn check_email_exists(&self, email: &str) -> impl Future<Output = Result<bool, RemoteError>> {
        async move { Ok(self.find_user_by_email(email).await?.is_some()) }
    }

    fn create_user(&self, user: User) -> impl Future<Output = Result<User, RemoteError>>;

    fn update_user_profile(
        &self,
        id: &str,
        update: ProfileUpdate,
    ) -> impl Future<Output = Result<User, RemoteError>>;

    fn update_password(
        &self,
        id: &str,
        password_hash: String,
    ) -> impl Future<Output = Result<(), RemoteError>>;

    fn delete_user(&self, id: &str) -> impl Future<Output = Result<(), RemoteError>>;
}

/// Whether a stored entry, possibly written by an older client in a loose
/// format, denotes the canonical `date` in the normalizer's zone.
pub(crate) fn same_day(normalizer: &DateNormalizer, stored: &str, date: &str) -> bool {
    stored == date
        || normalizer
            .normalize(stored)
            .is_ok_and(|canonical| canonical == date)
}

/// Backend picked from the `remote` config key.
#[derive(Debug, Clone)]
pub enum Remote {
    File(FileRemote),
    Postgrest(PostgrestRemote),
}

impl Remote {
    #[tracing::instrument(skip(cfg, data_dir, normalizer))]
    pub fn from_config(cfg: &Config, data_dir: &Path, normalizer: DateNormalizer) -> anyhow::Result<Self> {
        match cfg.remote_kind()? {
            RemoteKind::File => {
                let remote = FileRemote::open(data_dir)
                    .with_context(|| format!("failed to open user store in {}", data_dir.display()))?
                    .with_normalizer(normalizer);
                Ok(Remote::File(remote))
            }
            RemoteKind::Postgrest => {
                let url = cfg.remote_url()?;
                let remote = PostgrestRemote::new(url, cfg.remote_key()?, cfg.remote_timeout()?)?
                    .with_normalizer(normalizer);
                info!(url = %url, "using hosted user store");
                Ok(Remote::Postgrest(remote))
            }
        }
    }
}

impl RemoteStore for Remote {
    async fn fetch_all_users(&self) -> Result<Vec<User>, RemoteError> {
        match self {
            Remote::File(r) => r.fetch_all_users().await,
            Remote::Postgrest(r) => r.fetch_all_users().await,
        }
    }

    async fn add_available_date(&self, user_id: &str, date: &str) -> Result<Vec<String>, RemoteError> {
        match self {
            Remote::File(r) => r.add_available_date(user_id, date).await,
            Remote::Postgrest(r) => r.add_available_date(user_id, date).await,
        }
    }

    async fn remove_available_date(&self, user_id: &str, date: &str) -> Result<Vec<String>, RemoteError> {
        match self {
            Remote::File(r) => r.remove_available_date(user_id, date).await,
            Remote::Postgrest(r) => r.remove_available_date(user_id, date).await,
        }
    }

    async fn get_user_by_id(&self, id: &str) -> Result<Option<User>, RemoteError> {
        match self {
            Remote::File(r) => r.get_user_by_id(id).await,
            Remote::Postgrest(r) => r.get_user_by_id(id).await,
        }
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, RemoteError> {
        match self {
            Remote::File(r) => r.find_user_by_email(email).await,
            Remote::Postgrest(r) => r.find_user_by_email(email).await,
        }
    }

    async fn create_user(&self, user: User) -> Result<User, RemoteError> {
        match self {
            Remote::File(r) => r.create_user(user).await,
            Remote::Postgrest(r) => r.create_user(user).await,
        }
    }

    async fn update_user_profile(&self, id: &str, update: ProfileUpdate) -> Result<User, RemoteError> {
        match self {
            Remote::File(r) => r.update_user_profile(id, update).await,
            Remote::Postgrest(r) => r.update_user_profile(id, update).await,
        }
    }

    async fn update_password(&self, id: &str, password_hash: String) -> Result<(), RemoteError> {
        match self {
            Remote::File(r) => r.update_password(id, password_hash).await,
            Remote::Postgrest(r) => r.update_password(id, password_hash).await,
        }
    }

    async fn delete_user(&self, id: &str) -> Result<(), RemoteError> {
        match self {
            Remote::File(r) => r.delete_user(id).await,
            Remote::Postgrest(r) => r.delete_user(id).await,
        }
    }
}
