//! End-to-end tests that need a real browser (and, for the login flow, a
//! real account). Ignored by default; run manually with
//! `cargo test -- --ignored`.

use std::path::PathBuf;

use wordstat_sessions::browser::launcher::{self, LaunchSpec};
use wordstat_sessions::utils::logging;
use wordstat_sessions::{probe, secrets, AccountStore, Config, EventSink, SecretAnswerBridge, Selectors, SessionPool};

fn test_config() -> Config {
    Config::from_env()
}

#[tokio::test]
#[ignore]
async fn launch_and_attach_a_profile_browser() {
    logging::init(true);
    let config = test_config();

    let spec = LaunchSpec {
        login: "smoke".to_string(),
        profile_dir: config.profiles_dir().join("smoke"),
        port: config.base_debug_port,
        proxy: None,
        headless: true,
        binary: config.browser_binary.clone(),
        initial_url: config.stats_url.clone(),
    };

    let session = launcher::launch(&spec).await.expect("launch failed");
    let url = session.page.url().await.expect("no url");
    assert!(url.is_some());
    session.close().await;
    assert!(launcher::port_is_free(config.base_debug_port));
}

#[tokio::test]
#[ignore]
async fn probe_reports_redirect_for_a_fresh_profile() {
    logging::init(true);
    let config = test_config();
    let selectors = Selectors::load(config.selectors_file.as_deref()).unwrap();

    let spec = LaunchSpec {
        login: "fresh".to_string(),
        profile_dir: PathBuf::from(
            tempfile::tempdir().unwrap().keep(),
        ),
        port: config.base_debug_port + 1,
        proxy: None,
        headless: true,
        binary: config.browser_binary.clone(),
        initial_url: config.stats_url.clone(),
    };

    let session = launcher::launch(&spec).await.expect("launch failed");
    let outcome = probe::is_authenticated(&session.page, &config, &selectors)
        .await
        .expect("probe failed");
    // A never-logged-in profile must bounce to the identity provider.
    assert!(!outcome.authenticated, "unexpected: {}", outcome.detail);
    assert!(outcome.detail.contains("passport"), "detail: {}", outcome.detail);
    session.close().await;
}

#[tokio::test]
#[ignore]
async fn start_failure_still_releases_the_port() {
    logging::init(true);
    let mut config = test_config();
    let dir = tempfile::tempdir().unwrap();
    config.data_dir = dir.path().to_path_buf();
    let port = config.base_debug_port;

    // No search-input candidates: the auth check fails right after launch,
    // and the half-started browser must be torn down with it.
    let mut selectors = Selectors::load(config.selectors_file.as_deref()).unwrap();
    selectors.search_input.clear();

    let store = AccountStore::open(&config.db_path()).unwrap();
    let records = vec![wordstat_sessions::secrets::SecretRecord {
        login: "smoke".to_string(),
        password: "pw".to_string(),
        secret: None,
        proxy: None,
        captcha_key: None,
    }];

    let (sink, _events) = EventSink::channel();
    let mut pool = SessionPool::new(config, selectors, store, sink, SecretAnswerBridge::new());
    pool.start_all(&records).await.unwrap();

    assert!(launcher::port_is_free(port));
}

#[tokio::test]
#[ignore]
async fn full_fleet_start_with_real_accounts() {
    logging::init(true);
    let config = test_config();
    let selectors = Selectors::load(config.selectors_file.as_deref()).unwrap();
    let store = AccountStore::open(&config.db_path()).unwrap();
    let records = secrets::load(&config.accounts_file).expect("accounts file required");

    let (sink, mut events) = EventSink::channel();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("event: {:?}", event);
        }
    });

    let bridge = SecretAnswerBridge::new();
    let mut pool = SessionPool::new(config, selectors, store, sink, bridge);
    pool.start_all(&records).await.expect("start_all failed");

    let lease = pool.acquire(|_| true);
    assert!(lease.is_some(), "no session became ready");
    if let Some(lease) = lease {
        pool.release(lease, wordstat_sessions::ReleaseOutcome::Ok)
            .await
            .unwrap();
    }
    pool.stop_all().await;
}
