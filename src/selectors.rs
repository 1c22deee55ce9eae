//! Ordered selector fallback.
//!
//! Every field the automation touches has a list of candidate selectors
//! (see [`crate::config::Selectors`]). Candidates are tried in order with
//! a short per-candidate timeout; the first one that resolves wins and is
//! logged, so markup rotations show up in the logs before they break
//! anything.

use std::future::Future;
use std::time::Duration;

use chromiumoxide::{Element, Page};
use tracing::{debug, warn};

use crate::error::{CoreError, Result};

/// Per-candidate resolution budget.
pub const CANDIDATE_TIMEOUT: Duration = Duration::from_secs(2);

/// Try `candidates` in order with `probe`; return the winning index and
/// value. A probe that errors or times out just moves on to the next
/// candidate; exhausting the list is a terminal `Selector` error.
pub async fn first_match<T, F, Fut>(
    field: &str,
    candidates: &[String],
    per_candidate: Duration,
    mut probe: F,
) -> Result<(usize, T)>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for (index, candidate) in candidates.iter().enumerate() {
        match tokio::time::timeout(per_candidate, probe(candidate.clone())).await {
            Ok(Some(value)) => {
                debug!("field `{}` matched candidate #{}: {}", field, index, candidate);
                return Ok((index, value));
            }
            Ok(None) => {}
            Err(_) => debug!("field `{}` candidate {} timed out", field, candidate),
        }
    }
    warn!("field `{}`: all {} candidates exhausted", field, candidates.len());
    Err(CoreError::Selector {
        field: field.to_string(),
        tried: candidates.len(),
    })
}

/// Resolve the first visible element for `field` on `page`.
pub async fn find_visible(page: &Page, field: &str, candidates: &[String]) -> Result<Element> {
    let (_, element) = first_match(field, candidates, CANDIDATE_TIMEOUT, |selector| async move {
        let element = page.find_element(&selector).await.ok()?;
        if is_visible(&element).await {
            Some(element)
        } else {
            None
        }
    })
    .await?;
    Ok(element)
}

/// An element is visible when its client rect has area.
pub async fn is_visible(element: &Element) -> bool {
    let rect = element
        .call_js_fn(
            "function() { const r = this.getBoundingClientRect(); return r.width > 0 && r.height > 0; }",
            false,
        )
        .await;
    matches!(
        rect.map(|r| r.result.value),
        Ok(Some(serde_json::Value::Bool(true)))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn list(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("#candidate-{}", i)).collect()
    }

    #[tokio::test]
    async fn picks_exactly_the_kth_candidate_when_earlier_ones_miss() {
        // The mock page exposes only candidate k; earlier candidates must
        // be tried and rejected, never skipped.
        for k in 0..4usize {
            let candidates = list(4);
            let tried = Arc::new(AtomicUsize::new(0));
            let tried2 = tried.clone();

            let (index, value) = first_match(
                "login",
                &candidates,
                Duration::from_millis(100),
                |selector| {
                    let tried = tried2.clone();
                    async move {
                        tried.fetch_add(1, Ordering::SeqCst);
                        (selector == format!("#candidate-{}", k)).then(|| selector)
                    }
                },
            )
            .await
            .unwrap();

            assert_eq!(index, k);
            assert_eq!(value, format!("#candidate-{}", k));
            assert_eq!(tried.load(Ordering::SeqCst), k + 1);
        }
    }

    #[tokio::test]
    async fn exhausted_list_is_terminal_selector_error() {
        let candidates = list(3);
        let err = first_match("passwd", &candidates, Duration::from_millis(50), |_| async {
            None::<()>
        })
        .await
        .unwrap_err();
        match err {
            CoreError::Selector { field, tried } => {
                assert_eq!(field, "passwd");
                assert_eq!(tried, 3);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn hanging_candidate_times_out_and_next_wins() {
        let candidates = list(2);
        let (index, _) = first_match(
            "answer",
            &candidates,
            Duration::from_millis(50),
            |selector| async move {
                if selector == "#candidate-0" {
                    // Never resolves; the per-candidate budget must cut it off.
                    futures::future::pending::<()>().await;
                    unreachable!()
                }
                Some(selector)
            },
        )
        .await
        .unwrap();
        assert_eq!(index, 1);
    }
}
