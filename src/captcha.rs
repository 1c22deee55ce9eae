//! Coordinate-CAPTCHA solver.
//!
//! The challenge is an image the user must click in the right spots, in
//! order. We snapshot the image, hand it to an external HTTP solver, and
//! replay the returned click coordinates translated into page space.
//!
//! Solver protocol: `POST <base>/in.php` (multipart: `key`, `method=post`,
//! `coordinatescaptcha=1`, `json=1`, `file`) returns `{status:1,
//! request:<job>}`; `GET <base>/res.php?action=get&id=<job>&json=1` is
//! polled until `{status:1, request:{coordinates:[{x,y},..]}}`.

use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::{Element, Page};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::browser::input;
use crate::config::Selectors;
use crate::error::{CoreError, Result};
use crate::selectors::{find_visible, is_visible};

const SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_TIMEOUT: Duration = Duration::from_secs(15);
const POLL_INTERVAL: Duration = Duration::from_secs(3);
const POLL_DEADLINE: Duration = Duration::from_secs(120);
const IMAGE_WAIT: Duration = Duration::from_secs(10);
const CLICK_GAP: Duration = Duration::from_millis(300);
/// Transport-level retries per solver request.
const NETWORK_RETRIES: u32 = 2;

/// Challenge-image position at snapshot time; replay is relative to it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Translate solver coordinates (image-local) into page-absolute points.
pub fn translate(bounds: &BoundingBox, coords: &[(f64, f64)]) -> Vec<(f64, f64)> {
    coords
        .iter()
        .map(|(x, y)| (bounds.x + x, bounds.y + y))
        .collect()
}

/// What one `res.php` poll told us.
#[derive(Debug, PartialEq)]
pub enum PollOutcome {
    Ready(Vec<(f64, f64)>),
    NotReady,
    Failed(String),
}

/// Parse the solver's poll payload.
pub fn parse_poll_response(payload: &Value) -> PollOutcome {
    let status = payload.get("status").and_then(Value::as_i64).unwrap_or(0);
    if status != 1 {
        let request = payload.get("request").and_then(Value::as_str).unwrap_or("");
        if request == "CAPCHA_NOT_READY" {
            return PollOutcome::NotReady;
        }
        return PollOutcome::Failed(payload.to_string());
    }

    let coords: Vec<(f64, f64)> = payload
        .pointer("/request/coordinates")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|c| {
                    Some((
                        c.get("x").and_then(Value::as_f64)?,
                        c.get("y").and_then(Value::as_f64)?,
                    ))
                })
                .collect()
        })
        .unwrap_or_default();

    if coords.is_empty() {
        PollOutcome::Failed("empty".to_string())
    } else {
        PollOutcome::Ready(coords)
    }
}

/// Client for the external coordinate solver.
pub struct Solver {
    http: reqwest::Client,
    base_url: String,
}

impl Solver {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Solve the CAPTCHA currently shown on `page`, if any.
    ///
    /// Returns `Ok(false)` when there is nothing to solve or no API key is
    /// configured; `Ok(true)` after the coordinates were replayed.
    pub async fn solve(
        &self,
        page: &Page,
        api_key: Option<&str>,
        selectors: &Selectors,
    ) -> Result<bool> {
        if !challenge_present(page, selectors).await {
            debug!("no CAPTCHA challenge on page");
            return Ok(false);
        }
        let Some(api_key) = api_key.filter(|k| !k.trim().is_empty()) else {
            warn!("CAPTCHA present but no solver key configured");
            return Ok(false);
        };

        let image = wait_for_image(page, selectors).await?;
        let bounds = bounding_box(&image).await?;
        let png = image
            .screenshot(CaptureScreenshotFormat::Png)
            .await
            .map_err(|e| CoreError::Replay(format!("image snapshot failed: {}", e)))?;
        info!(
            "captured challenge image {}x{} at ({}, {})",
            bounds.width, bounds.height, bounds.x, bounds.y
        );

        let job = self.submit(api_key, png).await?;
        let coords = self.poll_with_retry(api_key, &job).await?;
        info!("solver returned {} click point(s)", coords.len());

        // Replay, translated by the recorded box origin.
        for (x, y) in translate(&bounds, &coords) {
            input::click_at(page, x, y).await?;
            sleep(CLICK_GAP).await;
        }

        // Best-effort confirm button; a missing button is not a failure.
        if let Ok(Ok(button)) =
            tokio::time::timeout(Duration::from_secs(2), page.find_element("button")).await
        {
            let _ = button.click().await;
        }
        sleep(Duration::from_secs(2)).await;
        Ok(true)
    }

    /// Upload the image; returns the solver job id.
    async fn submit(&self, api_key: &str, png: Vec<u8>) -> Result<String> {
        let url = format!("{}/in.php", self.base_url);
        let mut backoff = Duration::from_secs(1);
        let mut last_error: Option<CoreError> = None;

        for attempt in 0..=NETWORK_RETRIES {
            let part = reqwest::multipart::Part::bytes(png.clone())
                .file_name("captcha.png")
                .mime_str("image/png")?;
            let form = reqwest::multipart::Form::new()
                .text("key", api_key.to_string())
                .text("method", "post")
                .text("coordinatescaptcha", "1")
                .text("json", "1")
                .part("file", part);

            let response = self
                .http
                .post(&url)
                .multipart(form)
                .timeout(SUBMIT_TIMEOUT)
                .send()
                .await;

            match response {
                Ok(response) => {
                    let payload: Value = response.json().await?;
                    let status = payload.get("status").and_then(Value::as_i64).unwrap_or(0);
                    if status != 1 {
                        return Err(CoreError::Solver(payload.to_string()));
                    }
                    let job = payload
                        .get("request")
                        .and_then(Value::as_str)
                        .ok_or_else(|| CoreError::Solver(payload.to_string()))?;
                    debug!("solver accepted job {}", job);
                    return Ok(job.to_string());
                }
                Err(e) => {
                    warn!("solver submit attempt {} failed: {}", attempt + 1, e);
                    last_error = Some(e.into());
                    sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
        Err(last_error.unwrap_or_else(|| CoreError::Solver("submit failed".to_string())))
    }

    /// Poll for coordinates; an expired deadline gets up to
    /// `NETWORK_RETRIES` further rounds with backoff, semantic failures
    /// are terminal.
    async fn poll_with_retry(&self, api_key: &str, job: &str) -> Result<Vec<(f64, f64)>> {
        let mut backoff = Duration::from_secs(1);
        for attempt in 0..=NETWORK_RETRIES {
            match self.poll(api_key, job).await {
                Ok(coords) => return Ok(coords),
                Err(e) if deadline_expired(&e) && attempt < NETWORK_RETRIES => {
                    warn!("solver poll round {} expired: {}", attempt + 1, e);
                    sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        Err(CoreError::SolverTimeout(POLL_DEADLINE))
    }

    /// Poll until coordinates arrive or the deadline passes.
    async fn poll(&self, api_key: &str, job: &str) -> Result<Vec<(f64, f64)>> {
        let url = format!("{}/res.php", self.base_url);
        let deadline = tokio::time::Instant::now() + POLL_DEADLINE;

        loop {
            sleep(POLL_INTERVAL).await;
            if tokio::time::Instant::now() >= deadline {
                return Err(CoreError::SolverTimeout(POLL_DEADLINE));
            }

            let response = self
                .http
                .get(&url)
                .query(&[("key", api_key), ("action", "get"), ("id", job), ("json", "1")])
                .timeout(POLL_TIMEOUT)
                .send()
                .await;

            let payload: Value = match response {
                Ok(response) => response.json().await?,
                Err(e) => {
                    // Transient transport errors just burn poll budget.
                    warn!("solver poll failed: {}", e);
                    continue;
                }
            };

            match parse_poll_response(&payload) {
                PollOutcome::Ready(coords) => return Ok(coords),
                PollOutcome::NotReady => debug!("job {} not ready yet", job),
                PollOutcome::Failed(detail) => return Err(CoreError::Solver(detail)),
            }
        }
    }
}

/// An expired poll deadline is worth another round; anything else is
/// terminal.
fn deadline_expired(error: &CoreError) -> bool {
    matches!(error, CoreError::SolverTimeout(_))
}

/// Challenge detection: a challenge image in the document, or any frame
/// whose src carries a captcha marker.
async fn challenge_present(page: &Page, selectors: &Selectors) -> bool {
    for selector in &selectors.captcha_image {
        if page.find_element(selector.as_str()).await.is_ok() {
            return true;
        }
    }
    let markers = serde_json::to_string(&selectors.captcha_frame_markers)
        .unwrap_or_else(|_| "[]".to_string());
    let js = format!(
        r#"(() => {{
            const markers = {markers};
            return Array.from(document.querySelectorAll('iframe'))
                .some(f => markers.some(m => (f.getAttribute('src') || '').includes(m)));
        }})()"#
    );
    match page.evaluate(js).await {
        Ok(result) => result.into_value::<bool>().unwrap_or(false),
        Err(_) => false,
    }
}

/// Wait for the challenge image to become visible.
async fn wait_for_image(page: &Page, selectors: &Selectors) -> Result<Element> {
    let deadline = tokio::time::Instant::now() + IMAGE_WAIT;
    loop {
        if let Ok(element) = find_visible(page, "captcha_image", &selectors.captcha_image).await {
            if is_visible(&element).await {
                return Ok(element);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(CoreError::Replay("challenge image never became visible".to_string()));
        }
        sleep(Duration::from_millis(500)).await;
    }
}

/// Read the image's client rect.
async fn bounding_box(element: &Element) -> Result<BoundingBox> {
    let result = element
        .call_js_fn(
            "function() { const r = this.getBoundingClientRect(); \
             return { x: r.x, y: r.y, width: r.width, height: r.height }; }",
            false,
        )
        .await
        .map_err(|e| CoreError::Replay(format!("bounding box unavailable: {}", e)))?;

    let value = result
        .result
        .value
        .ok_or_else(|| CoreError::Replay("bounding box unavailable".to_string()))?;
    let get = |key: &str| value.get(key).and_then(Value::as_f64);
    match (get("x"), get("y"), get("width"), get("height")) {
        (Some(x), Some(y), Some(width), Some(height)) => Ok(BoundingBox { x, y, width, height }),
        _ => Err(CoreError::Replay("bounding box unavailable".to_string())),
    }
}
