use std::fs;
use std::time::Duration;

use dispo_core::accounts::RegisterForm;
use dispo_core::aggregate::PopularDate;
use dispo_core::config::Config;
use dispo_core::date::{DateNormalizer, Zone};
use dispo_core::error::{RemoteError, SelectionError};
use dispo_core::remote::{FileRemote, MemoryRemote, Remote, RemoteStore};
use dispo_core::session::Session;
use dispo_core::storage::LocalStorage;
use tempfile::tempdir;

fn form(name: &str) -> RegisterForm {
    RegisterForm {
        username: name.to_string(),
        email: format!("{name}@example.org"),
        password: "secret".to_string(),
        confirm_password: "secret".to_string(),
    }
}

fn client<R: RemoteStore + Clone>(remote: &R, local: &std::path::Path) -> Session<R> {
    Session::new(
        remote.clone(),
        LocalStorage::open(local).expect("local storage"),
        DateNormalizer::new(Zone::Named(chrono_tz::Europe::Paris)),
        Duration::from_secs(2),
    )
}

#[tokio::test]
async fn three_clients_share_one_user_store() {
    let shared = tempdir().expect("shared");
    let remote = FileRemote::open(shared.path())
        .expect("file remote")
        .with_normalizer(DateNormalizer::new(Zone::Named(chrono_tz::Europe::Paris)));

    let mut clients = Vec::new();
    for name in ["ada", "bob", "cy"] {
        let local = tempdir().expect("local");
        let mut session = client(&remote, local.path());
        session.register(form(name)).await.expect("register");
        session.toggle("2024-03-15").await.expect("toggle");
        clients.push((local, session));
    }

    let (_, ada) = &mut clients[0];
    ada.toggle("2024/3/16").await.expect("loose date input");
    ada.refresh().await.expect("refresh");

    let dash = ada.dashboard(3, 2024).expect("dashboard");
    let busy = dash.slots.iter().find(|s| s.id == "2024-03-15").expect("slot");
    assert_eq!(busy.occupants.len(), 3);
    assert_eq!(
        dash.most_popular,
        Some(PopularDate {
            date: "2024-03-15".to_string(),
            count: 3
        })
    );
    assert_eq!(dash.stats.total_active_users, 3);
    assert_eq!(dash.stats.total_selections, 4);
    assert_eq!(dash.stats.your_selections, 2);

    // Hiding one user drops the date below the popularity threshold.
    ada.filter_toggle("bob").expect("hide bob");
    let dash = ada.dashboard(3, 2024).expect("dashboard");
    assert_eq!(dash.most_popular, None);
    assert_eq!(dash.visible_users, 2);

    ada.filter_reset().expect("reset");
    assert_eq!(ada.filter().expect("filter").len(), 3);
}

#[tokio::test]
async fn failed_toggle_leaves_no_trace() {
    let local = tempdir().expect("local");
    let remote = MemoryRemote::default();
    let mut me = client(&remote, local.path());
    let user = me.register(form("ada")).await.expect("register");
    me.refresh().await.expect("refresh");

    remote.fail_next_writes(1);
    let err = me.toggle("2024-03-10").await.expect_err("remote down");
    let selection = err.downcast_ref::<SelectionError>().expect("selection error");
    assert!(matches!(selection, SelectionError::Remote(RemoteError::Unavailable(_))));

    assert!(me.store().expect("store").selections().is_empty());
    assert!(me.dashboard(3, 2024).expect("dashboard").slots.iter().all(|s| s.occupants.is_empty()));
    assert_eq!(me.current_user().map(|u| u.selections.len()), Some(0));

    let stored = remote.get_user_by_id(&user.id).await.expect("fetch").expect("user");
    assert!(stored.selections.is_empty());
}

#[tokio::test]
async fn session_opens_from_rc_file() {
    let home = tempdir().expect("home");
    let data = home.path().join("data");
    let rc = home.path().join("disporc");
    fs::write(
        &rc,
        format!("data.location = {}\nremote = file\nremote.timeout.ms = 500\n", data.display()),
    )
    .expect("write rc");

    let cfg = Config::load(Some(rc.as_path())).expect("config");
    let dir = dispo_core::config::resolve_data_dir(&cfg, None).expect("data dir");
    assert_eq!(dir, data);
    assert!(matches!(Remote::from_config(&cfg, &dir, DateNormalizer::default()).expect("remote"), Remote::File(_)));

    let mut session = Session::open(&cfg, &dir).expect("open");
    assert!(session.current_user().is_none());
    session.register(form("ada")).await.expect("register");
    session.close().expect("close");

    let reopened = Session::open(&cfg, &dir).expect("reopen");
    assert_eq!(reopened.current_user().map(|u| u.username.as_str()), Some("ada"));
    assert!(dir.join("users.data").is_file());
    assert!(dir.join("local").join("currentUser.json").is_file());
}

#[test]
fn postgrest_backend_requires_credentials() {
    let temp = tempdir().expect("temp");
    let mut cfg = Config::default();
    cfg.apply_overrides([("rc.remote".to_string(), "postgrest".to_string())]);
    assert!(Remote::from_config(&cfg, temp.path(), DateNormalizer::default()).is_err());

    cfg.apply_overrides([
        ("remote.url".to_string(), "https://db.example.org".to_string()),
        ("remote.key".to_string(), "anon".to_string()),
    ]);
    assert!(matches!(
        Remote::from_config(&cfg, temp.path(), DateNormalizer::default()).expect("remote"),
        Remote::Postgrest(_)
    ));
}
