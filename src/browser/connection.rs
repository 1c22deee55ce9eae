//! CDP attachment.
//!
//! The browser advertises its websocket endpoint on
//! `http://127.0.0.1:<port>/json/version`; we discover it there, connect,
//! and drain the handler stream on a background task so browser events
//! never stall the coordinator.

use std::time::Duration;

use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};

/// Attach to a running browser's debugging endpoint.
///
/// Startup is racy, so discovery is retried; `attempts` of 5 with a 2 s
/// pause covers a cold profile on a slow disk.
pub async fn attach(port: u16, attempts: u32) -> Result<(Browser, JoinHandle<()>)> {
    let json_url = format!("http://127.0.0.1:{}/json/version", port);
    let mut last_error: Option<CoreError> = None;

    for attempt in 1..=attempts {
        match discover_ws_url(&json_url).await {
            Ok(ws_url) => {
                debug!("discovered CDP endpoint: {}", ws_url);
                match Browser::connect(&ws_url).await {
                    Ok((browser, handler)) => {
                        let handler_task = spawn_handler_task(handler, port);
                        // Brief pause for target state to sync.
                        sleep(Duration::from_millis(300)).await;
                        info!("attached to browser on port {}", port);
                        return Ok((browser, handler_task));
                    }
                    Err(e) => last_error = Some(e.into()),
                }
            }
            Err(e) => last_error = Some(e),
        }
        if attempt < attempts {
            debug!("CDP attach attempt {}/{} failed, retrying", attempt, attempts);
            sleep(Duration::from_secs(2)).await;
        }
    }

    Err(last_error.unwrap_or(CoreError::PortBusy(port)))
}

async fn discover_ws_url(json_url: &str) -> Result<String> {
    let response = reqwest::get(json_url).await?;
    let json: serde_json::Value = response.json().await?;
    json["webSocketDebuggerUrl"]
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| CoreError::Config(format!("no webSocketDebuggerUrl at {}", json_url)))
}

fn spawn_handler_task(
    mut handler: chromiumoxide::Handler,
    port: u16,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                warn!("browser handler error on port {}: {}", port, e);
                break;
            }
        }
        debug!("handler stream for port {} closed", port);
    })
}

/// Reuse an open tab whose URL starts with `url_prefix`, or open a new one
/// at `url`.
pub async fn pick_or_create_page(browser: &Browser, url: &str, url_prefix: &str) -> Result<Page> {
    let pages = browser.pages().await?;
    debug!("browser exposes {} page(s)", pages.len());

    for page in pages {
        if let Ok(Some(current)) = page.url().await {
            if current.starts_with(url_prefix) {
                debug!("reusing existing tab at {}", current);
                return Ok(page);
            }
        }
    }

    let page = browser.new_page("about:blank").await?;
    page.goto(url).await.map_err(|source| CoreError::Navigation {
        url: url.to_string(),
        source,
    })?;
    info!("opened {}", url);
    Ok(page)
}
