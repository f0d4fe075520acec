use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::date::DateNormalizer;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: String,

    pub username: String,

    pub email: String,

    #[serde(default)]
    pub password_hash: String,

    /// Canonical `YYYY-MM-DD` strings once the user went through [`User::normalized`].
    #[serde(default, alias = "available_date")]
    pub selections: BTreeSet<String>,

    #[serde(default = "Utc::now", alias = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(username: String, email: String, password_hash: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            username,
            email,
            password_hash,
            selections: BTreeSet::new(),
            created_at: now,
        }
    }

    /// Rewrites every selection to canonical form. Entries that cannot be
    /// parsed are dropped rather than failing the whole user.
    pub fn normalized(mut self, normalizer: &DateNormalizer) -> Self {
        let raw = std::mem::take(&mut self.selections);
        self.selections = raw
            .into_iter()
            .filter_map(|value| match normalizer.normalize(value.as_str()) {
                Ok(canonical) => Some(canonical),
                Err(err) => {
                    warn!(user = %self.id, %err, "dropping unparseable selection");
                    None
                }
            })
            .collect();
        self
    }

    /// Copy safe to keep in local storage or print.
    pub fn without_secret(&self) -> Self {
        Self {
            password_hash: String::new(),
            ..self.clone()
        }
    }
}

/// Cached snapshot of every known user, in remote order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roster {
    users: Vec<User>,
}

impl Roster {
    pub fn new(users: Vec<User>) -> Self {
        Self { users }
    }

    pub fn from_remote(users: Vec<User>, normalizer: &DateNormalizer) -> Self {
        Self {
            users: users
                .into_iter()
                .map(|user| user.normalized(normalizer))
                .collect(),
        }
    }

    pub fn users(&self) -> &[User] {
        &self.users
    }

    pub fn iter(&self) -> impl Iterator<Item = &User> {
        self.users.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.users.iter().map(|user| user.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&User> {
        self.users.iter().find(|user| user.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut User> {
        self.users.iter_mut().find(|user| user.id == id)
    }

    pub fn upsert(&mut self, user: User) {
        match self.get_mut(&user.id) {
            Some(existing) => *existing = user,
            None => self.users.push(user),
        }
    }
}
