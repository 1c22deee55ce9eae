//! Login Driver.
//!
//! Drives the identity-provider flow for one account:
//! navigate-stats, navigate-login, enter-login, enter-password, an
//! optional secret-question challenge, then the auth probe. Field lookup
//! goes through the ordered selector fallback; every submission is a
//! humanised click-then-fill followed by a fixed settling delay, which
//! the provider's anti-automation heuristics expect from a person.

use std::time::Duration;

use chromiumoxide::Page;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::browser::input;
use crate::captcha::Solver;
use crate::config::{Config, Selectors};
use crate::error::{CoreError, Result};
use crate::events::{EventSink, SecretAnswerBridge};
use crate::probe::{self, ProbeOutcome};
use crate::secrets::SecretRecord;
use crate::selectors::find_visible;

/// Settling delay after each field submission.
const SETTLE: Duration = Duration::from_millis(3500);
/// Wall-clock budget for an out-of-band secret answer.
const ANSWER_TIMEOUT: Duration = Duration::from_secs(60);

pub struct LoginDriver<'a> {
    config: &'a Config,
    selectors: &'a Selectors,
    bridge: &'a SecretAnswerBridge,
    sink: &'a EventSink,
    solver: &'a Solver,
}

impl<'a> LoginDriver<'a> {
    pub fn new(
        config: &'a Config,
        selectors: &'a Selectors,
        bridge: &'a SecretAnswerBridge,
        sink: &'a EventSink,
        solver: &'a Solver,
    ) -> Self {
        Self { config, selectors, bridge, sink, solver }
    }

    /// Run one full login attempt for `record` on `page`.
    ///
    /// Returns the final probe outcome; the caller owns the store
    /// transition and the `LoginCompleted` event.
    pub async fn login(&self, page: &Page, record: &SecretRecord) -> Result<ProbeOutcome> {
        self.sink.status(format!("Logging in {}", record.login));

        // navigate-stats: an already-authenticated profile never reaches
        // the identity provider, so go straight to the probe.
        self.goto(page, &self.config.stats_url).await?;
        if !self.on_passport(page).await {
            debug!("{}: no redirect to identity provider, probing", record.login);
            return self.probe_and_settle(page, record).await;
        }

        // navigate-login
        self.goto(page, &self.config.passport_url).await?;

        // enter-login
        self.fill_and_submit(page, "login", &self.selectors.login, &record.login).await?;

        // enter-password
        self.fill_and_submit(page, "passwd", &self.selectors.password, &record.password).await?;

        // challenge?
        if self.challenge_pending(page).await {
            let question = self.challenge_question(page).await;
            info!("{}: secret question: {}", record.login, question);
            let answer = match &record.secret {
                Some(answer) => answer.clone(),
                None => {
                    self.bridge
                        .ask(self.sink, &record.login, &question, ANSWER_TIMEOUT)
                        .await?
                }
            };
            self.fill_and_submit(page, "answer", &self.selectors.answer, &answer).await?;
        }

        self.probe_and_settle(page, record).await
    }

    /// Final probe; a challenged-but-authenticated session gets one solver
    /// pass and a re-probe.
    async fn probe_and_settle(&self, page: &Page, record: &SecretRecord) -> Result<ProbeOutcome> {
        let outcome = probe::is_authenticated(page, self.config, self.selectors).await?;
        if !outcome.challenged {
            return Ok(outcome);
        }

        info!("{}: CAPTCHA in the way, delegating to solver", record.login);
        let solved = self
            .solver
            .solve(page, record.captcha_key.as_deref(), self.selectors)
            .await?;
        if !solved {
            warn!("{}: CAPTCHA present but not solved", record.login);
            return Ok(outcome);
        }
        probe::is_authenticated(page, self.config, self.selectors).await
    }

    /// Locate the field through the fallback list, click it like a person
    /// would, fill, submit, settle.
    async fn fill_and_submit(
        &self,
        page: &Page,
        field: &str,
        candidates: &[String],
        value: &str,
    ) -> Result<()> {
        let element = find_visible(page, field, candidates).await?;
        element.click().await?;
        sleep(Duration::from_millis(300)).await;
        element.type_str(value).await?;
        input::press_enter(page).await?;
        let _ = page.wait_for_navigation().await;
        sleep(SETTLE).await;
        debug!("field `{}` submitted", field);
        Ok(())
    }

    async fn goto(&self, page: &Page, url: &str) -> Result<()> {
        page.goto(url)
            .await
            .map_err(|source| CoreError::Navigation { url: url.to_string(), source })?;
        let _ = page.wait_for_navigation().await;
        probe::wait_for_network_idle(page, Duration::from_secs(10)).await;
        Ok(())
    }

    async fn on_passport(&self, page: &Page) -> bool {
        match page.url().await {
            Ok(Some(url)) => url::Url::parse(&url)
                .ok()
                .and_then(|u| u.host_str().map(|h| h.contains("passport")))
                .unwrap_or(false),
            _ => false,
        }
    }

    /// The post-password URL carries a challenge segment when the provider
    /// wants a secret answer.
    async fn challenge_pending(&self, page: &Page) -> bool {
        match page.url().await {
            Ok(Some(url)) => url.contains("challenge"),
            _ => false,
        }
    }

    /// Pull the question text off the challenge page; falls back to a
    /// generic prompt when the markup hides it.
    async fn challenge_question(&self, page: &Page) -> String {
        for selector in &self.selectors.challenge_question {
            if let Ok(element) = page.find_element(selector.as_str()).await {
                if let Ok(Some(text)) = element.inner_text().await {
                    let text = text.trim().to_string();
                    if !text.is_empty() {
                        return text;
                    }
                }
            }
        }
        "Secret question".to_string()
    }
}
