//! Auth Probe.
//!
//! Non-intrusively checks whether a profile is still authenticated: open
//! the statistics root, fire one benign query, and look at where the
//! browser ends up. The probe never mutates the account store; the caller
//! decides what a failed probe means.

use std::time::Duration;

use chromiumoxide::Page;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::browser::input;
use crate::config::{Config, Selectors};
use crate::error::{CoreError, Result};
use crate::selectors::find_visible;

/// Short literal token the probe submits; any query that yields a results
/// table proves a working session.
const PROBE_QUERY: &str = "тест";

/// Probe verdict. `authenticated` is the contract; `detail` is a
/// human-readable note surfaced to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub authenticated: bool,
    pub detail: String,
    /// Authenticated but facing a CAPTCHA; the caller should solve before
    /// parsing.
    pub challenged: bool,
}

impl ProbeOutcome {
    fn unauthenticated(detail: impl Into<String>) -> Self {
        Self { authenticated: false, detail: detail.into(), challenged: false }
    }

    fn authorized(detail: impl Into<String>) -> Self {
        Self { authenticated: true, detail: detail.into(), challenged: false }
    }
}

/// Check whether `page`'s profile is logged in to the statistics service.
pub async fn is_authenticated(
    page: &Page,
    config: &Config,
    selectors: &Selectors,
) -> Result<ProbeOutcome> {
    page.goto(&config.stats_url)
        .await
        .map_err(|source| CoreError::Navigation { url: config.stats_url.clone(), source })?;
    let _ = page.wait_for_navigation().await;
    wait_for_network_idle(page, Duration::from_secs(10)).await;
    sleep(Duration::from_secs(1)).await;

    if let Some(host) = current_host(page).await {
        if host.contains("passport") {
            info!("probe: redirected to identity provider ({})", host);
            return Ok(ProbeOutcome::unauthenticated(format!("Redirect to {}", host)));
        }
    }

    // Submit one benign query through the primary search input.
    let search = find_visible(page, "search_input", &selectors.search_input).await?;
    search.click().await?;
    search.type_str(PROBE_QUERY).await?;
    input::press_enter(page).await?;
    let _ = page.wait_for_navigation().await;
    wait_for_network_idle(page, Duration::from_secs(10)).await;

    if let Some(host) = current_host(page).await {
        if host.contains("passport") {
            info!("probe: query bounced to identity provider ({})", host);
            return Ok(ProbeOutcome::unauthenticated(format!("Redirect to {}", host)));
        }
    }

    // CAPTCHA in the way means the session itself is alive.
    for selector in &selectors.captcha_image {
        if page.find_element(selector.as_str()).await.is_ok() {
            info!("probe: authenticated, CAPTCHA pending");
            return Ok(ProbeOutcome {
                authenticated: true,
                detail: "captcha".to_string(),
                challenged: true,
            });
        }
    }

    for selector in &selectors.results_table {
        if page.find_element(selector.as_str()).await.is_ok() {
            debug!("probe: results table present");
            return Ok(ProbeOutcome::authorized("Authorized"));
        }
    }

    // Still on the statistics host with no challenge: authorized.
    Ok(ProbeOutcome::authorized("Authorized"))
}

async fn current_host(page: &Page) -> Option<String> {
    let url = page.url().await.ok()??;
    url::Url::parse(&url).ok()?.host_str().map(|h| h.to_string())
}

/// Resource-count heuristic for `networkidle`: the page is idle once the
/// resource count stays flat for one second with `readyState === complete`.
pub async fn wait_for_network_idle(page: &Page, timeout: Duration) {
    let timeout_ms = timeout.as_millis() as u64;
    let js = format!(
        r#"(async () => {{
            const timeoutMs = {timeout_ms};
            const interval = 250;
            const start = Date.now();
            let last = 0;
            let stable = 0;
            try {{ last = performance.getEntriesByType('resource').length; }} catch (_) {{}}
            while (Date.now() - start < timeoutMs) {{
                await new Promise(r => setTimeout(r, interval));
                let cur = last;
                try {{ cur = performance.getEntriesByType('resource').length; }} catch (_) {{}}
                if (document.readyState === 'complete' && cur === last) {{
                    stable += interval;
                    if (stable >= 1000) return true;
                }} else {{
                    stable = 0;
                }}
                last = cur;
            }}
            return false;
        }})()"#
    );
    match page.evaluate(js).await {
        Ok(result) => {
            let idle = result.into_value::<bool>().unwrap_or(false);
            debug!("network-idle heuristic finished (idle={})", idle);
        }
        Err(e) => debug!("network-idle heuristic failed: {}", e),
    }
}
