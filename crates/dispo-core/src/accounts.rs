use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::error::{AccountError, RemoteError, ValidationError};
use crate::remote::{ProfileUpdate, RemoteStore};
use crate::user::User;

pub const MIN_USERNAME_LEN: usize = 3;
pub const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Clone, Default)]
pub struct RegisterForm {
    pub username: String,
    pub email: String,
    pub password: String,
    pub confirm_password: String,
}

#[derive(Debug, Clone, Default)]
pub struct PasswordChange {
    pub current: String,
    pub new: String,
    pub confirm: String,
}

fn check_username(username: &str, errors: &mut Vec<ValidationError>) {
    if username.trim().chars().count() < MIN_USERNAME_LEN {
        errors.push(ValidationError::new(
            "username",
            format!("must be at least {MIN_USERNAME_LEN} characters"),
        ));
    }
}

fn check_email(email: &str, errors: &mut Vec<ValidationError>) {
    if !email.contains('@') {
        errors.push(ValidationError::new("email", "must contain '@'"));
    }
}

fn check_new_password(password: &str, confirm: &str, errors: &mut Vec<ValidationError>) {
    if password.chars().count() < MIN_PASSWORD_LEN {
        errors.push(ValidationError::new(
            "password",
            format!("must be at least {MIN_PASSWORD_LEN} characters"),
        ));
    }
    if password != confirm {
        errors.push(ValidationError::new("confirm_password", "passwords do not match"));
    }
}

fn into_result(errors: Vec<ValidationError>) -> Result<(), AccountError> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(AccountError::Validation(errors))
    }
}

/// Every field problem at once, so a form can show them together.
pub fn validate_registration(form: &RegisterForm) -> Result<(), AccountError> {
    let mut errors = Vec::new();
    check_username(&form.username, &mut errors);
    check_email(&form.email, &mut errors);
    check_new_password(&form.password, &form.confirm_password, &mut errors);
    into_result(errors)
}

pub fn hash_password(password: &str) -> Result<String, AccountError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| AccountError::Hashing(err.to_string()))
}

/// False for a wrong password and for a stored value that is not an Argon2
/// hash.
pub fn verify_password(password: &str, stored: &str) -> bool {
    match PasswordHash::new(stored) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(err) => {
            warn!(error = %err, "stored password is not a valid hash");
            false
        }
    }
}

#[instrument(skip(remote, form), fields(email = %form.email))]
pub async fn register<R: RemoteStore>(
    remote: &R,
    form: RegisterForm,
    now: DateTime<Utc>,
) -> Result<User, AccountError> {
    validate_registration(&form)?;

    let email = form.email.trim().to_string();
    if remote.check_email_exists(&email).await? {
        return Err(AccountError::EmailTaken);
    }

    let hash = hash_password(&form.password)?;
    let user = User::new(form.username.trim().to_string(), email, hash, now);
    let created = remote.create_user(user).await?;
    info!(id = %created.id, "registered user");
    Ok(created)
}

#[instrument(skip(remote, password))]
pub async fn login<R: RemoteStore>(remote: &R, email: &str, password: &str) -> Result<User, AccountError> {
    let user = remote
        .find_user_by_email(email.trim())
        .await?
        .ok_or(AccountError::InvalidCredentials)?;

    if !verify_password(password, &user.password_hash) {
        warn!("login rejected");
        return Err(AccountError::InvalidCredentials);
    }
    info!(id = %user.id, "logged in");
    Ok(user)
}

/// Changes username and/or email. A new email must not belong to another user.
#[instrument(skip(remote, update))]
pub async fn update_profile<R: RemoteStore>(
    remote: &R,
    user_id: &str,
    update: ProfileUpdate,
) -> Result<User, AccountError> {
    let mut errors = Vec::new();
    if let Some(username) = &update.username {
        check_username(username, &mut errors);
    }
    if let Some(email) = &update.email {
        check_email(email, &mut errors);
    }
    into_result(errors)?;

    if update.is_empty() {
        return remote
            .get_user_by_id(user_id)
            .await?
            .ok_or_else(|| RemoteError::NotFound(user_id.to_string()).into());
    }

    if let Some(email) = &update.email
        && let Some(owner) = remote.find_user_by_email(email).await?
        && owner.id != user_id
    {
        return Err(AccountError::EmailTaken);
    }

    let updated = remote.update_user_profile(user_id, update).await?;
    info!(id = %updated.id, "profile updated");
    Ok(updated)
}

#[instrument(skip(remote, change))]
pub async fn change_password<R: RemoteStore>(
    remote: &R,
    user_id: &str,
    change: PasswordChange,
) -> Result<(), AccountError> {
    let mut errors = Vec::new();
    check_new_password(&change.new, &change.confirm, &mut errors);
    into_result(errors)?;

    let user = remote
        .get_user_by_id(user_id)
        .await?
        .ok_or_else(|| RemoteError::NotFound(user_id.to_string()))?;
    if !verify_password(&change.current, &user.password_hash) {
        return Err(ValidationError::new("current_password", "current password is incorrect").into());
    }

    remote.update_password(user_id, hash_password(&change.new)?).await?;
    info!(id = %user_id, "password updated");
    Ok(())
}

#[instrument(skip(remote))]
pub async fn delete_account<R: RemoteStore>(remote: &R, user_id: &str) -> Result<(), AccountError> {
    remote.delete_user(user_id).await?;
    info!(id = %user_id, "account deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;

    fn form(username: &str, email: &str, password: &str, confirm: &str) -> RegisterForm {
        RegisterForm {
            username: username.to_string(),
            email: email.to_string(),
            password: password.to_string(),
            confirm_password: confirm.to_string(),
        }
    }

    fn fields(err: AccountError) -> Vec<&'static str> {
        match err {
            AccountError::Validation(errors) => errors.into_iter().map(|e| e.field).collect(),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn registration_reports_every_bad_field() {
        let err = validate_registration(&form("ab", "nope", "123", "1234")).expect_err("invalid");
        assert_eq!(fields(err), vec!["username", "email", "password", "confirm_password"]);
        assert!(validate_registration(&form("ada", "ada@example.org", "secret", "secret")).is_ok());
    }

    #[test]
    fn hashes_verify_and_are_salted() {
        let a = hash_password("secret").expect("hash");
        let b = hash_password("secret").expect("hash");
        assert_ne!(a, b);
        assert!(a.starts_with("$argon2"));
        assert!(verify_password("secret", &a));
        assert!(!verify_password("Secret", &a));
        assert!(!verify_password("secret", "secret"));
    }

    #[tokio::test]
    async fn register_then_login() {
        let remote = MemoryRemote::default();
        let user = register(&remote, form("ada", "ada@example.org", "secret", "secret"), Utc::now())
            .await
            .expect("register");
        assert_ne!(user.password_hash, "secret");

        let dup = register(&remote, form("ada2", "ADA@example.org", "secret", "secret"), Utc::now()).await;
        assert!(matches!(dup, Err(AccountError::EmailTaken)));

        let logged = login(&remote, "ada@example.org", "secret").await.expect("login");
        assert_eq!(logged.id, user.id);
        assert!(matches!(
            login(&remote, "ada@example.org", "wrong").await,
            Err(AccountError::InvalidCredentials)
        ));
        assert!(matches!(
            login(&remote, "nobody@example.org", "secret").await,
            Err(AccountError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn profile_and_password_changes() {
        let remote = MemoryRemote::default();
        let ada = register(&remote, form("ada", "ada@example.org", "secret", "secret"), Utc::now())
            .await
            .expect("register");
        register(&remote, form("bob", "bob@example.org", "secret", "secret"), Utc::now())
            .await
            .expect("register");

        let taken = update_profile(
            &remote,
            &ada.id,
            ProfileUpdate {
                username: None,
                email: Some("bob@example.org".to_string()),
            },
        )
        .await;
        assert!(matches!(taken, Err(AccountError::EmailTaken)));

        let same_email = update_profile(
            &remote,
            &ada.id,
            ProfileUpdate {
                username: Some("ada.l".to_string()),
                email: Some("ada@example.org".to_string()),
            },
        )
        .await
        .expect("keeping own email");
        assert_eq!(same_email.username, "ada.l");

        let wrong = change_password(
            &remote,
            &ada.id,
            PasswordChange {
                current: "nope".to_string(),
                new: "hunter22".to_string(),
                confirm: "hunter22".to_string(),
            },
        )
        .await;
        assert_eq!(fields(wrong.expect_err("wrong current")), vec!["current_password"]);

        change_password(
            &remote,
            &ada.id,
            PasswordChange {
                current: "secret".to_string(),
                new: "hunter22".to_string(),
                confirm: "hunter22".to_string(),
            },
        )
        .await
        .expect("change");
        assert!(login(&remote, "ada@example.org", "hunter22").await.is_ok());

        delete_account(&remote, &ada.id).await.expect("delete");
        assert!(matches!(
            login(&remote, "ada@example.org", "hunter22").await,
            Err(AccountError::InvalidCredentials)
        ));
    }
}
