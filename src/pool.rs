//! Session Pool.
//!
//! The single owner of live sessions. It brings the fleet up one account
//! at a time (each launch needs its own port and a breathing gap), keeps
//! the account store consistent with what it observes, and hands ready
//! sessions to consumers through `acquire`/`release`.
//!
//! Concurrency is cooperative: one coordinator, suspension only at
//! browser/network awaits. Slot bookkeeping is plain in-memory state; the
//! store is the only cross-thread surface and is synchronized at the
//! storage layer.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chromiumoxide::Page;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use crate::browser::launcher::{self, LaunchSpec, SessionBrowser};
use crate::captcha::Solver;
use crate::config::{Config, Selectors};
use crate::error::{CoreError, Result};
use crate::events::{CoreEvent, EventSink, SecretAnswerBridge};
use crate::login::LoginDriver;
use crate::probe;
use crate::proxy::ProxyEndpoint;
use crate::secrets::SecretRecord;
use crate::store::{AccountStatus, AccountStore};

/// Lifecycle of one pooled session. Transitions happen only here, in the
/// pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    LoginRequired,
    LoggedIn,
    Parsing,
    Error,
}

/// Scheduling record for one account; the live browser handles are kept
/// separately so this stays plain data.
#[derive(Debug, Clone)]
pub struct SessionSlot {
    pub login: String,
    pub profile: PathBuf,
    pub port: u16,
    pub has_proxy: bool,
    pub state: SessionState,
    pub cooldown_until: Option<Instant>,
}

impl SessionSlot {
    pub fn cooling(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }
}

/// How a consumer hands a session back.
#[derive(Debug, Clone, Copy)]
pub enum ReleaseOutcome {
    Ok,
    Cooldown(Duration),
    Broken,
}

/// A session on loan to a consumer.
pub struct Lease {
    pub login: String,
    pub endpoint: String,
    pub page: Page,
}

/// First-fit with round-robin tie-break over ready slots.
fn pick_ready<F>(slots: &[SessionSlot], cursor: usize, now: Instant, constraint: F) -> Option<usize>
where
    F: Fn(&SessionSlot) -> bool,
{
    if slots.is_empty() {
        return None;
    }
    for offset in 0..slots.len() {
        let index = (cursor + offset) % slots.len();
        let slot = &slots[index];
        if slot.state == SessionState::LoggedIn && !slot.cooling(now) && constraint(slot) {
            return Some(index);
        }
    }
    None
}

/// Apply a release outcome to the slot. Returns true when the underlying
/// browser must be terminated.
fn apply_release(slot: &mut SessionSlot, outcome: ReleaseOutcome, now: Instant) -> bool {
    match outcome {
        ReleaseOutcome::Ok => {
            slot.state = SessionState::LoggedIn;
            false
        }
        ReleaseOutcome::Cooldown(duration) => {
            slot.state = SessionState::LoggedIn;
            slot.cooldown_until = Some(now + duration);
            false
        }
        ReleaseOutcome::Broken => {
            slot.state = SessionState::Error;
            true
        }
    }
}

/// Profile-exclusivity guard: a profile directory owned by any live
/// session cannot be claimed again, and a still-live login must be
/// released before a restart (its port is still taken).
fn ensure_profile_exclusive<F>(
    slots: &[SessionSlot],
    login: &str,
    profile: &Path,
    own_port: Option<u16>,
    is_live: F,
) -> Result<()>
where
    F: Fn(&str) -> bool,
{
    for slot in slots {
        if slot.profile.as_path() == profile && slot.login != login && is_live(&slot.login) {
            return Err(CoreError::Config(format!(
                "profile {} is already owned by live session {}",
                profile.display(),
                slot.login
            )));
        }
    }
    if let Some(port) = own_port {
        return Err(CoreError::PortBusy(port));
    }
    Ok(())
}

/// Fleet filter: accounts parked as `disabled` in the store are not
/// relaunched.
fn startable<'a>(
    records: &'a [SecretRecord],
    disabled: &HashSet<PathBuf>,
    profiles_dir: &Path,
) -> Vec<&'a SecretRecord> {
    records
        .iter()
        .filter(|record| {
            if disabled.contains(&profiles_dir.join(&record.login)) {
                info!("{}: disabled in the store, skipping", record.login);
                false
            } else {
                true
            }
        })
        .collect()
}

pub struct SessionPool {
    config: Config,
    selectors: Selectors,
    store: AccountStore,
    sink: EventSink,
    bridge: SecretAnswerBridge,
    solver: Solver,
    slots: Vec<SessionSlot>,
    live: HashMap<String, SessionBrowser>,
    cursor: usize,
}

impl SessionPool {
    pub fn new(
        config: Config,
        selectors: Selectors,
        store: AccountStore,
        sink: EventSink,
        bridge: SecretAnswerBridge,
    ) -> Self {
        let solver = Solver::new(config.solver_base_url.clone());
        Self {
            config,
            selectors,
            store,
            sink,
            bridge,
            solver,
            slots: Vec::new(),
            live: HashMap::new(),
            cursor: 0,
        }
    }

    pub fn bridge(&self) -> SecretAnswerBridge {
        self.bridge.clone()
    }

    /// Bring up every account, serialized with a launch gap. Accounts the
    /// store has parked as `disabled` are skipped. Completes only after
    /// each remaining account has reached a terminal login state.
    pub async fn start_all(&mut self, records: &[SecretRecord]) -> Result<()> {
        let disabled: HashSet<PathBuf> = self
            .store
            .list(Some(&[AccountStatus::Disabled]))?
            .into_iter()
            .map(|record| record.profile)
            .collect();
        let records = startable(records, &disabled, &self.config.profiles_dir());

        let total = records.len().min(self.config.fleet_size.max(1));
        info!("starting fleet: {} account(s)", total);

        for (index, &record) in records.iter().take(total).enumerate() {
            if index > 0 {
                sleep(self.config.launch_gap).await;
            }
            self.sink.progress(((index * 100) / total.max(1)) as u8);

            match self.start_one(index, record).await {
                Ok(()) => {
                    self.sink.emit(CoreEvent::LoginCompleted {
                        login: record.login.clone(),
                        ok: true,
                        message: "session ready".to_string(),
                    });
                }
                Err(e) => {
                    error!("{}: session start failed: {}", record.login, e);
                    let profile = self.profile_for(&record.login);
                    let status = if e.is_fatal_for_account() {
                        AccountStatus::Disabled
                    } else {
                        AccountStatus::Error
                    };
                    self.store.update_status(&profile, status, Some(&e.to_string()))?;
                    self.set_slot_state(&record.login, SessionState::Error);
                    self.sink.emit(CoreEvent::LoginCompleted {
                        login: record.login.clone(),
                        ok: false,
                        message: e.to_string(),
                    });
                }
            }
        }

        self.sink.progress(100);
        Ok(())
    }

    /// Start or revive one account's session.
    async fn start_one(&mut self, index: usize, record: &SecretRecord) -> Result<()> {
        let profile = self.profile_for(&record.login);
        let port = self.port_for(index)?;
        self.ensure_profile_free(&record.login, &profile)?;

        // Reconcile the store with what we are about to observe.
        self.store.upsert(
            &profile,
            &record.login,
            record.proxy.as_deref(),
            record.captcha_key.as_deref(),
            None,
        )?;
        self.upsert_slot(record, &profile, port);
        self.set_slot_state(&record.login, SessionState::Starting);

        let proxy = record.proxy.as_deref().and_then(ProxyEndpoint::parse);
        let mut spec = LaunchSpec {
            login: record.login.clone(),
            profile_dir: profile.clone(),
            port,
            proxy,
            headless: self.config.headless_probe,
            binary: self.config.browser_binary.clone(),
            initial_url: self.config.stats_url.clone(),
        };

        // First pass: probe in a headless context. A failed probe must not
        // strand the process; it would hold the profile lock and the port.
        let session = launcher::launch(&spec).await?;
        let outcome =
            match probe::is_authenticated(&session.page, &self.config, &self.selectors).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    session.close().await;
                    return Err(e);
                }
            };

        if outcome.authenticated && !outcome.challenged {
            info!("{}: already authenticated ({})", record.login, outcome.detail);
            self.store.mark_ok(&profile)?;
            self.live.insert(record.login.clone(), session);
            self.set_slot_state(&record.login, SessionState::LoggedIn);
            return Ok(());
        }

        // Needs a login (or a CAPTCHA): switch to a visible browser so the
        // flow matches what the provider expects to see.
        info!("{}: login required ({})", record.login, outcome.detail);
        self.set_slot_state(&record.login, SessionState::LoginRequired);
        session.close().await;
        spec.headless = false;
        let session = launcher::launch(&spec).await?;

        let driver = LoginDriver::new(
            &self.config,
            &self.selectors,
            &self.bridge,
            &self.sink,
            &self.solver,
        );
        let outcome = driver.login(&session.page, record).await;

        match outcome {
            Ok(outcome) if outcome.authenticated => {
                info!("{}: login ok ({})", record.login, outcome.detail);
                self.store.mark_ok(&profile)?;
                self.live.insert(record.login.clone(), session);
                self.set_slot_state(&record.login, SessionState::LoggedIn);
                Ok(())
            }
            Ok(outcome) => {
                session.close().await;
                Err(CoreError::Config(format!(
                    "login did not authenticate: {}",
                    outcome.detail
                )))
            }
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }

    /// Hand out a ready session matching `constraint`, or `None`.
    pub fn acquire<F>(&mut self, constraint: F) -> Option<Lease>
    where
        F: Fn(&SessionSlot) -> bool,
    {
        let now = Instant::now();
        let index = pick_ready(&self.slots, self.cursor, now, |slot| {
            self.live.contains_key(&slot.login) && constraint(slot)
        })?;
        self.cursor = (index + 1) % self.slots.len();

        let slot = &mut self.slots[index];
        slot.state = SessionState::Parsing;
        let login = slot.login.clone();
        let port = slot.port;
        let page = self.live.get(&login)?.page.clone();
        info!("leased session {} (port {})", login, port);
        Some(Lease {
            login,
            endpoint: format!("http://127.0.0.1:{}", port),
            page,
        })
    }

    /// Return a leased session.
    pub async fn release(&mut self, lease: Lease, outcome: ReleaseOutcome) -> Result<()> {
        let now = Instant::now();
        let Some(slot) = self.slots.iter_mut().find(|s| s.login == lease.login) else {
            warn!("release for unknown session {}", lease.login);
            return Ok(());
        };
        let profile = slot.profile.clone();
        let terminate = apply_release(slot, outcome, now);

        match outcome {
            ReleaseOutcome::Ok => {
                self.store.update_status(&profile, AccountStatus::Ok, None)?;
            }
            ReleaseOutcome::Cooldown(duration) => {
                let until = chrono::Utc::now()
                    + chrono::Duration::from_std(duration)
                        .unwrap_or_else(|_| chrono::Duration::seconds(0));
                self.store.set_cooldown(&profile, until)?;
                info!("{} cooling down for {:?}", lease.login, duration);
            }
            ReleaseOutcome::Broken => {
                self.store
                    .update_status(&profile, AccountStatus::Error, Some("session broken"))?;
            }
        }

        if terminate {
            if let Some(session) = self.live.remove(&lease.login) {
                warn!("terminating broken session {}", lease.login);
                session.close().await;
            }
        }
        Ok(())
    }

    /// Terminate every browser and clear all handles.
    pub async fn stop_all(&mut self) {
        info!("stopping {} live session(s)", self.live.len());
        for (login, session) in self.live.drain() {
            info!("closing session {}", login);
            session.close().await;
        }
        for slot in &mut self.slots {
            slot.state = SessionState::Idle;
            slot.cooldown_until = None;
        }
        self.cursor = 0;
    }

    /// Never two live sessions for one profile directory.
    fn ensure_profile_free(&self, login: &str, profile: &Path) -> Result<()> {
        let port = self.live.get(login).map(|s| s.port);
        ensure_profile_exclusive(&self.slots, login, profile, port, |l| {
            self.live.contains_key(l)
        })
    }

    fn profile_for(&self, login: &str) -> PathBuf {
        self.config.profiles_dir().join(login)
    }

    fn port_for(&self, index: usize) -> Result<u16> {
        let port = self.config.base_debug_port as usize + index;
        if port > self.config.max_debug_port as usize {
            return Err(CoreError::Config(format!(
                "account #{} exceeds the reserved port block {}..={}",
                index, self.config.base_debug_port, self.config.max_debug_port
            )));
        }
        Ok(port as u16)
    }

    fn upsert_slot(&mut self, record: &SecretRecord, profile: &Path, port: u16) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.login == record.login) {
            slot.port = port;
            slot.profile = profile.to_path_buf();
            slot.has_proxy = record.proxy.is_some();
            return;
        }
        self.slots.push(SessionSlot {
            login: record.login.clone(),
            profile: profile.to_path_buf(),
            port,
            has_proxy: record.proxy.is_some(),
            state: SessionState::Idle,
            cooldown_until: None,
        });
    }

    fn set_slot_state(&mut self, login: &str, state: SessionState) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.login == login) {
            slot.state = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(login: &str, state: SessionState) -> SessionSlot {
        SessionSlot {
            login: login.to_string(),
            profile: PathBuf::from(format!("profiles/{}", login)),
            port: 9222,
            has_proxy: false,
            state,
            cooldown_until: None,
        }
    }

    #[tokio::test]
    async fn three_ready_slots_yield_three_distinct_leases_then_none() {
        let mut slots = vec![
            slot("a", SessionState::LoggedIn),
            slot("b", SessionState::LoggedIn),
            slot("c", SessionState::LoggedIn),
        ];
        let now = Instant::now();
        let mut cursor = 0;
        let mut leased = Vec::new();

        for _ in 0..3 {
            let index = pick_ready(&slots, cursor, now, |_| true).unwrap();
            cursor = (index + 1) % slots.len();
            slots[index].state = SessionState::Parsing;
            leased.push(slots[index].login.clone());
        }
        leased.sort();
        assert_eq!(leased, vec!["a", "b", "c"]);

        // Fourth acquire: nothing ready.
        assert_eq!(pick_ready(&slots, cursor, now, |_| true), None);
    }

    #[tokio::test]
    async fn release_ok_makes_slot_acquirable_again_broken_does_not() {
        let now = Instant::now();

        let mut ok_slot = slot("a", SessionState::Parsing);
        assert!(!apply_release(&mut ok_slot, ReleaseOutcome::Ok, now));
        assert_eq!(pick_ready(&[ok_slot], 0, now, |_| true), Some(0));

        let mut broken = slot("b", SessionState::Parsing);
        assert!(apply_release(&mut broken, ReleaseOutcome::Broken, now));
        assert_eq!(broken.state, SessionState::Error);
        assert_eq!(pick_ready(&[broken], 0, now, |_| true), None);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_excludes_slot_until_the_clock_passes() {
        let mut cooled = slot("a", SessionState::Parsing);
        apply_release(&mut cooled, ReleaseOutcome::Cooldown(Duration::from_secs(2)), Instant::now());
        let slots = [cooled];

        assert_eq!(pick_ready(&slots, 0, Instant::now(), |_| true), None);

        tokio::time::advance(Duration::from_millis(1900)).await;
        assert_eq!(pick_ready(&slots, 0, Instant::now(), |_| true), None);

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(pick_ready(&slots, 0, Instant::now(), |_| true), Some(0));
    }

    #[tokio::test]
    async fn round_robin_tie_break_rotates_across_ready_slots() {
        let slots = vec![
            slot("a", SessionState::LoggedIn),
            slot("b", SessionState::LoggedIn),
            slot("c", SessionState::LoggedIn),
        ];
        let now = Instant::now();

        // Without mutating states, successive cursors walk the ring.
        let first = pick_ready(&slots, 0, now, |_| true).unwrap();
        let second = pick_ready(&slots, first + 1, now, |_| true).unwrap();
        let third = pick_ready(&slots, second + 1, now, |_| true).unwrap();
        assert_eq!((first, second, third), (0, 1, 2));
    }

    #[tokio::test]
    async fn constraint_predicate_filters_slots() {
        let mut with_proxy = slot("a", SessionState::LoggedIn);
        with_proxy.has_proxy = true;
        let slots = vec![slot("b", SessionState::LoggedIn), with_proxy];
        let now = Instant::now();

        let index = pick_ready(&slots, 0, now, |s| s.has_proxy).unwrap();
        assert_eq!(slots[index].login, "a");

        assert_eq!(pick_ready(&slots, 0, now, |s| s.login == "zz"), None);
    }

    fn record(login: &str) -> SecretRecord {
        SecretRecord {
            login: login.to_string(),
            password: "pw".to_string(),
            secret: None,
            proxy: None,
            captcha_key: None,
        }
    }

    #[test]
    fn disabled_accounts_are_not_relaunched() {
        let store = AccountStore::open_in_memory().unwrap();
        store.upsert(Path::new("profiles/anna"), "anna", None, None, None).unwrap();
        store.upsert(Path::new("profiles/boris"), "boris", None, None, None).unwrap();
        store
            .update_status(Path::new("profiles/boris"), AccountStatus::Disabled, Some("bad password"))
            .unwrap();

        let disabled: HashSet<PathBuf> = store
            .list(Some(&[AccountStatus::Disabled]))
            .unwrap()
            .into_iter()
            .map(|r| r.profile)
            .collect();
        let records = vec![record("anna"), record("boris")];

        let eligible = startable(&records, &disabled, Path::new("profiles"));
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].login, "anna");
    }

    #[test]
    fn duplicate_profile_with_live_session_is_rejected() {
        let profile = PathBuf::from("profiles/shared");
        let mut owner = slot("older", SessionState::LoggedIn);
        owner.profile = profile.clone();
        let slots = vec![owner];

        // Another login claiming the same profile dir while the owner is
        // live must fail.
        let err =
            ensure_profile_exclusive(&slots, "anna", &profile, None, |l| l == "older").unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));

        // The same login restarting while still live fails with PortBusy.
        let err = ensure_profile_exclusive(&slots, "older", &profile, Some(9222), |l| l == "older")
            .unwrap_err();
        assert!(matches!(err, CoreError::PortBusy(9222)));

        // Nothing live: the profile is free.
        ensure_profile_exclusive(&slots, "anna", &profile, None, |_| false).unwrap();
    }
}
