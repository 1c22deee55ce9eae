//! Events to the UI collaborator and the secret-question rendezvous.
//!
//! The core never depends on how the UI surfaces these; it pushes into an
//! unbounded channel and moves on. The secret-question wait is a
//! message-passing rendezvous (one oneshot per pending login), not polling
//! of shared mutable state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{CoreError, Result};

/// Everything the core reports outward.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    StatusUpdate(String),
    /// 0..=100.
    ProgressUpdate(u8),
    /// The identity provider asked a secret question; answer via
    /// [`SecretAnswerBridge::supply`].
    SecretQuestionRequired { login: String, question: String },
    LoginCompleted { login: String, ok: bool, message: String },
}

/// Cheap clonable sender side of the event stream. Delivery is
/// fire-and-forget: a dropped receiver never stalls the pool.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<CoreEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CoreEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A sink with nobody listening; useful for tests and headless runs.
    pub fn discard() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    pub fn emit(&self, event: CoreEvent) {
        let _ = self.tx.send(event);
    }

    pub fn status(&self, message: impl Into<String>) {
        self.emit(CoreEvent::StatusUpdate(message.into()));
    }

    pub fn progress(&self, percent: u8) {
        self.emit(CoreEvent::ProgressUpdate(percent.min(100)));
    }
}

/// Rendezvous between the Login Driver and whoever can answer a secret
/// question. One pending slot per login; asking again replaces the old
/// waiter.
#[derive(Clone, Default)]
pub struct SecretAnswerBridge {
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<String>>>>,
}

impl SecretAnswerBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the question and suspend until an answer arrives or
    /// `timeout` passes.
    pub async fn ask(
        &self,
        sink: &EventSink,
        login: &str,
        question: &str,
        timeout: Duration,
    ) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(login.to_string(), tx);

        sink.emit(CoreEvent::SecretQuestionRequired {
            login: login.to_string(),
            question: question.to_string(),
        });
        debug!("waiting up to {:?} for secret answer ({})", timeout, login);

        let answer = tokio::time::timeout(timeout, rx).await;
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(login);

        match answer {
            Ok(Ok(answer)) => Ok(answer),
            // Sender dropped or clock ran out: same outcome for the caller.
            _ => Err(CoreError::ChallengeTimeout(timeout)),
        }
    }

    /// Post an answer back. Returns false when no question is pending for
    /// this login.
    pub fn supply(&self, login: &str, answer: impl Into<String>) -> bool {
        let tx = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(login);
        match tx {
            Some(tx) => tx.send(answer.into()).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn answer_supplied_in_time_is_delivered() {
        let bridge = SecretAnswerBridge::new();
        let sink = EventSink::discard();

        let b2 = bridge.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(b2.supply("anna", "Рязань"));
        });

        let answer = bridge
            .ask(&sink, "anna", "Город детства?", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(answer, "Рязань");
    }

    #[tokio::test(start_paused = true)]
    async fn missing_answer_times_out() {
        let bridge = SecretAnswerBridge::new();
        let sink = EventSink::discard();

        let err = bridge
            .ask(&sink, "anna", "Город детства?", Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ChallengeTimeout(_)));
        // The pending slot is cleaned up.
        assert!(!bridge.supply("anna", "late"));
    }

    #[tokio::test]
    async fn question_event_reaches_the_sink() {
        let bridge = SecretAnswerBridge::new();
        let (sink, mut rx) = EventSink::channel();

        let b2 = bridge.clone();
        let task = tokio::spawn(async move {
            b2.ask(&sink, "anna", "Город детства?", Duration::from_secs(5))
                .await
        });

        match rx.recv().await.unwrap() {
            CoreEvent::SecretQuestionRequired { login, question } => {
                assert_eq!(login, "anna");
                assert_eq!(question, "Город детства?");
            }
            other => panic!("unexpected event {:?}", other),
        }

        bridge.supply("anna", "ok");
        assert_eq!(task.await.unwrap().unwrap(), "ok");
    }
}
