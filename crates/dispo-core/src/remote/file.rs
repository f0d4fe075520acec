use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::{ProfileUpdate, RemoteStore, same_day};
use crate::date::DateNormalizer;
use crate::error::RemoteError;
use crate::user::User;

/// User store kept as JSON lines in the data directory.
///
/// Several processes may share one directory: every rewrite happens while
/// holding an exclusive lock on `users.lock`, and readers only ever see a
/// complete file because rewrites land through a rename.
#[derive(Debug, Clone)]
pub struct FileRemote {
    pub data_dir: PathBuf,
    pub users_path: PathBuf,
    lock_path: PathBuf,
    normalizer: DateNormalizer,
}

impl FileRemote {
    #[tracing::instrument(skip(data_dir))]
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        let data_dir = data_dir.to_path_buf();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;

        let users_path = data_dir.join("users.data");
        if !users_path.exists() {
            fs::write(&users_path, "")?;
        }

        info!(
            data_dir = %data_dir.display(),
            users = %users_path.display(),
            "opened file user store"
        );

        Ok(Self {
            lock_path: data_dir.join("users.lock"),
            data_dir,
            users_path,
            normalizer: DateNormalizer::default(),
        })
    }

    pub fn with_normalizer(mut self, normalizer: DateNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    #[tracing::instrument(skip(self))]
    fn load_users(&self) -> Result<Vec<User>, RemoteError> {
        load_jsonl(&self.users_path)
    }

    #[tracing::instrument(skip(self, users))]
    fn save_users(&self, users: &[User]) -> Result<(), RemoteError> {
        save_jsonl_atomic(&self.users_path, users)
    }

    /// Load, change and save under the store lock. Nothing is written when
    /// `change` fails.
    fn rewrite<T>(
        &self,
        change: impl FnOnce(&mut Vec<User>) -> Result<T, RemoteError>,
    ) -> Result<T, RemoteError> {
        let lock = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)?;
        lock.lock()?;
        debug!(lock = %self.lock_path.display(), "holding user store lock");

        let mut users = self.load_users()?;
        let out = change(&mut users)?;
        self.save_users(&users)?;
        Ok(out)
    }

    fn modify_user<T>(
        &self,
        id: &str,
        change: impl FnOnce(&mut User) -> T,
    ) -> Result<T, RemoteError> {
        self.rewrite(|users| {
            let user = users
                .iter_mut()
                .find(|u| u.id == id)
                .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
            Ok(change(user))
        })
    }
}

impl RemoteStore for FileRemote {
    async fn fetch_all_users(&self) -> Result<Vec<User>, RemoteError> {
        self.load_users()
    }

    #[tracing::instrument(skip(self))]
    async fn add_available_date(&self, user_id: &str, date: &str) -> Result<Vec<String>, RemoteError> {
        self.modify_user(user_id, |user| {
            if !user.selections.iter().any(|d| same_day(&self.normalizer, d, date)) {
                user.selections.insert(date.to_string());
            }
            user.selections.iter().cloned().collect()
        })
    }

    #[tracing::instrument(skip(self))]
    async fn remove_available_date(&self, user_id: &str, date: &str) -> Result<Vec<String>, RemoteError> {
        self.modify_user(user_id, |user| {
            user.selections.retain(|d| !same_day(&self.normalizer, d, date));
            user.selections.iter().cloned().collect()
        })
    }

    async fn get_user_by_id(&self, id: &str) -> Result<Option<User>, RemoteError> {
        Ok(self.load_users()?.into_iter().find(|u| u.id == id))
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, RemoteError> {
        Ok(self
            .load_users()?
            .into_iter()
            .find(|u| u.email.eq_ignore_ascii_case(email)))
    }

    #[tracing::instrument(skip(self, user), fields(id = %user.id))]
    async fn create_user(&self, user: User) -> Result<User, RemoteError> {
        self.rewrite(|users| {
            if users.iter().any(|u| u.id == user.id) {
                return Err(RemoteError::Storage(format!("duplicate user id {}", user.id)));
            }
            users.push(user.clone());
            Ok(user)
        })
    }

    #[tracing::instrument(skip(self))]
    async fn update_user_profile(&self, id: &str, update: ProfileUpdate) -> Result<User, RemoteError> {
        self.modify_user(id, |user| {
            update.apply(user);
            user.clone()
        })
    }

    #[tracing::instrument(skip(self, password_hash))]
    async fn update_password(&self, id: &str, password_hash: String) -> Result<(), RemoteError> {
        self.modify_user(id, |user| user.password_hash = password_hash)
    }

    #[tracing::instrument(skip(self))]
    async fn delete_user(&self, id: &str) -> Result<(), RemoteError> {
        self.rewrite(|users| {
            let before = users.len();
            users.retain(|u| u.id != id);
            if users.len() == before {
                return Err(RemoteError::NotFound(id.to_string()));
            }
            info!(before, after = users.len(), "deleted user");
            Ok(())
        })
    }
}

#[tracing::instrument(skip(path))]
fn load_jsonl(path: &Path) -> Result<Vec<User>, RemoteError> {
    debug!(file = %path.display(), "loading jsonl");
    let file = fs::File::open(path)?;
    let reader = BufReader::new(file);

    let mut out = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let user: User = serde_json::from_str(trimmed).map_err(|err| {
            RemoteError::Decode(format!("{} line {}: {err}", path.display(), idx + 1))
        })?;
        out.push(user);
    }

    debug!(count = out.len(), "loaded users from jsonl");
    Ok(out)
}

#[tracing::instrument(skip(path, users))]
fn save_jsonl_atomic(path: &Path, users: &[User]) -> Result<(), RemoteError> {
    debug!(file = %path.display(), count = users.len(), "saving jsonl atomically");

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(dir)?;
    for user in users {
        let serialized = serde_json::to_string(user)?;
        writeln!(temp, "{serialized}")?;
    }
    temp.flush()?;

    temp.persist(path)
        .map_err(|err| RemoteError::Storage(format!("failed to persist {}: {}", path.display(), err)))?;

    Ok(())
}
