use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument};

use super::{ProfileUpdate, RemoteStore, same_day};
use crate::date::DateNormalizer;
use crate::error::RemoteError;
use crate::user::User;

const USERS_TABLE: &str = "users";

/// Row layout of the hosted `users` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserRow {
    id: String,
    username: String,
    email: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    available_date: Option<Vec<String>>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            username: row.username,
            email: row.email,
            password_hash: row.password,
            selections: row.available_date.unwrap_or_default().into_iter().collect::<BTreeSet<_>>(),
            created_at: row.created_at.unwrap_or_else(Utc::now),
        }
    }
}

impl From<&User> for UserRow {
    fn from(user: &User) -> Self {
        UserRow {
            id: user.id.clone(),
            username: user.username.clone(),
            email: user.email.clone(),
            password: user.password_hash.clone(),
            available_date: Some(user.selections.iter().cloned().collect()),
            created_at: Some(user.created_at),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DatesRow {
    #[serde(default)]
    available_date: Option<Vec<String>>,
}

/// Hosted user store spoken to over the PostgREST HTTP interface.
#[derive(Debug, Clone)]
pub struct PostgrestRemote {
    client: Client,
    table_url: Url,
    api_key: String,
    normalizer: DateNormalizer,
}

impl PostgrestRemote {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> anyhow::Result<Self> {
        let base = Url::parse(base_url.trim_end_matches('/'))
            .with_context(|| format!("invalid remote.url: {base_url}"))?;
        let table_url = base
            .join(&format!("/rest/v1/{USERS_TABLE}"))
            .context("failed to build table url")?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            client,
            table_url,
            api_key: api_key.to_string(),
            normalizer: DateNormalizer::default(),
        })
    }

    pub fn with_normalizer(mut self, normalizer: DateNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    fn url(&self, params: &[(&str, String)]) -> Url {
        let mut url = self.table_url.clone();
        if !params.is_empty() {
            let mut query = url.query_pairs_mut();
            for (key, value) in params {
                query.append_pair(key, value);
            }
        }
        url
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn send(builder: RequestBuilder) -> Result<Response, RemoteError> {
        let response = builder.send().await.map_err(map_transport)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::Http {
            status: status.as_u16(),
            body,
        })
    }

    async fn rows<T: DeserializeOwned>(builder: RequestBuilder) -> Result<Vec<T>, RemoteError> {
        Self::send(builder)
            .await?
            .json::<Vec<T>>()
            .await
            .map_err(|err| RemoteError::Decode(err.to_string()))
    }

    async fn select_one(&self, column: &str, filter: String) -> Result<Option<User>, RemoteError> {
        let url = self.url(&[
            ("select", "*".to_string()),
            (column, filter),
            ("limit", "1".to_string()),
        ]);
        let rows: Vec<UserRow> = Self::rows(self.request(Method::GET, url)).await?;
        Ok(rows.into_iter().next().map(User::from))
    }

    async fn current_dates(&self, user_id: &str) -> Result<Vec<String>, RemoteError> {
        let url = self.url(&[
            ("select", "available_date".to_string()),
            ("id", format!("eq.{user_id}")),
        ]);
        let rows: Vec<DatesRow> = Self::rows(self.request(Method::GET, url)).await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::NotFound(user_id.to_string()))?;
        Ok(row.available_date.unwrap_or_default())
    }

    async fn write_dates(&self, user_id: &str, dates: &[String]) -> Result<(), RemoteError> {
        let url = self.url(&[("id", format!("eq.{user_id}"))]);
        Self::send(
            self.request(Method::PATCH, url)
                .json(&json!({ "available_date": dates })),
        )
        .await?;
        Ok(())
    }

    async fn patch_returning(&self, id: &str, body: serde_json::Value) -> Result<User, RemoteError> {
        let url = self.url(&[("id", format!("eq.{id}"))]);
        let rows: Vec<UserRow> = Self::rows(
            self.request(Method::PATCH, url)
                .header("Prefer", "return=representation")
                .json(&body),
        )
        .await?;
        rows.into_iter()
            .next()
            .map(User::from)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))
    }
}

/// Case-insensitive exact match: LIKE wildcards in the value are escaped.
fn ilike_exact(value: &str) -> String {
    let mut pattern = String::with_capacity(value.len() + 6);
    pattern.push_str("ilike.");
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '*' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern
}

fn map_transport(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Unavailable(format!("request timed out: {err}"))
    } else {
        RemoteError::Unavailable(err.to_string())
    }
}

// The table stores dates as a plain array column, so every change is a
// read-modify-write of that column.
impl RemoteStore for PostgrestRemote {
    #[instrument(skip(self))]
    async fn fetch_all_users(&self) -> Result<Vec<User>, RemoteError> {
        let url = self.url(&[("select", "*".to_string())]);
        let rows: Vec<UserRow> = Self::rows(self.request(Method::GET, url)).await?;
        debug!(count = rows.len(), "fetched users");
        Ok(rows.into_iter().map(User::from).collect())
    }

    #[instrument(skip(self))]
    async fn add_available_date(&self, user_id: &str, date: &str) -> Result<Vec<String>, RemoteError> {
        let mut dates = self.current_dates(user_id).await?;
        if dates.iter().any(|d| same_day(&self.normalizer, d, date)) {
            return Ok(dates);
        }
        dates.push(date.to_string());
        self.write_dates(user_id, &dates).await?;
        Ok(dates)
    }

    #[instrument(skip(self))]
    async fn remove_available_date(&self, user_id: &str, date: &str) -> Result<Vec<String>, RemoteError> {
        let mut dates = self.current_dates(user_id).await?;
        let before = dates.len();
        dates.retain(|d| !same_day(&self.normalizer, d, date));
        if dates.len() != before {
            self.write_dates(user_id, &dates).await?;
        }
        Ok(dates)
    }

    async fn get_user_by_id(&self, id: &str) -> Result<Option<User>, RemoteError> {
        self.select_one("id", format!("eq.{id}")).await
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, RemoteError> {
        self.select_one("email", ilike_exact(email.trim())).await
    }

    #[instrument(skip(self, user), fields(id = %user.id))]
    async fn create_user(&self, user: User) -> Result<User, RemoteError> {
        let url = self.url(&[]);
        let rows: Vec<UserRow> = Self::rows(
            self.request(Method::POST, url)
                .header("Prefer", "return=representation")
                .json(&[UserRow::from(&user)]),
        )
        .await?;
        Ok(rows.into_iter().next().map(User::from).unwrap_or(user))
    }

    #[instrument(skip(self))]
    async fn update_user_profile(&self, id: &str, update: ProfileUpdate) -> Result<User, RemoteError> {
        let body = serde_json::to_value(&update)?;
        self.patch_returning(id, body).await
    }

    #[instrument(skip(self, password_hash))]
    async fn update_password(&self, id: &str, password_hash: String) -> Result<(), RemoteError> {
        self.patch_returning(id, json!({ "password": password_hash }))
            .await
            .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn delete_user(&self, id: &str) -> Result<(), RemoteError> {
        let url = self.url(&[("id", format!("eq.{id}"))]);
        let deleted: Vec<UserRow> = Self::rows(
            self.request(Method::DELETE, url)
                .header("Prefer", "return=representation"),
        )
        .await?;
        if deleted.is_empty() {
            return Err(RemoteError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_filtered_table_urls() {
        let remote = PostgrestRemote::new("https://example.supabase.co/", "anon", Duration::from_secs(5))
            .expect("remote");
        let url = remote.url(&[
            ("select", "*".to_string()),
            ("email", "eq.a+b@example.org".to_string()),
        ]);
        assert_eq!(url.path(), "/rest/v1/users");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("select".to_string(), "*".to_string()),
                ("email".to_string(), "eq.a+b@example.org".to_string()),
            ]
        );
    }

    #[test]
    fn email_lookup_escapes_wildcards() {
        assert_eq!(ilike_exact("Ada@Example.org"), "ilike.Ada@Example.org");
        assert_eq!(ilike_exact("a_b%c@x.org"), r"ilike.a\_b\%c@x.org");
    }

    #[test]
    fn rows_map_to_users() {
        let row: UserRow = serde_json::from_str(
            r#"{"id":"u1","username":"ada","email":"ada@example.org","password":"h",
                "available_date":["2024-3-5","2024-03-05"],"created_at":"2024-01-01T00:00:00Z"}"#,
        )
        .expect("row");
        let user = User::from(row);
        assert_eq!(user.password_hash, "h");
        assert_eq!(user.selections.len(), 2);
    }
}
