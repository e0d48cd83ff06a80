//! ACGS-Bus: Impact Scoring
//!
//! Two interchangeable backends behind one trait: a deterministic keyword
//! scorer (weighted tokens, logistic squash) and an optional ML backend.
//! The service degrades to the keyword scorer whenever the backend errors
//! or blows its latency budget; degradation is normal operation and emits
//! no security event. A batching front merges concurrent score requests
//! (up to 64 messages or 10ms) into single backend calls.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::message::Message;

/// Scoring backend failure.
#[derive(Debug, Error, Clone)]
#[error("scorer failure: {0}")]
pub struct ScoreError(pub String);

/// Text-to-impact backend. Scores are in [0,1].
#[async_trait]
pub trait ImpactScorer: Send + Sync {
    fn name(&self) -> &str;

    /// Score a batch of texts; the result has the same length and order.
    async fn score_batch(&self, texts: &[String]) -> Result<Vec<f64>, ScoreError>;
}

/// Deterministic keyword backend: additive token weights squashed to
/// [0,1] with a shifted logistic.
pub struct KeywordScorer {
    weights: Vec<(&'static str, f64)>,
    steepness: f64,
    midpoint: f64,
}

impl Default for KeywordScorer {
    fn default() -> Self {
        Self {
            weights: vec![
                ("delete", 0.35),
                ("drop", 0.30),
                ("destroy", 0.40),
                ("shutdown", 0.40),
                ("terminate", 0.30),
                ("override", 0.30),
                ("escalate", 0.25),
                ("production", 0.25),
                ("credential", 0.40),
                ("secret", 0.35),
                ("payment", 0.30),
                ("transfer", 0.30),
                ("deploy", 0.20),
                ("admin", 0.20),
                ("grant", 0.25),
                ("revoke", 0.25),
            ],
            steepness: 4.0,
            midpoint: 0.75,
        }
    }
}

impl KeywordScorer {
    /// Raw additive weight of tokens present in the text.
    fn raw(&self, text: &str) -> f64 {
        let lowered = text.to_lowercase();
        self.weights
            .iter()
            .filter(|(token, _)| lowered.contains(token))
            .map(|(_, weight)| weight)
            .sum()
    }

    /// Shifted logistic squash: raw 0 lands near 0, heavy token sums
    /// saturate toward 1.
    pub fn score(&self, text: &str) -> f64 {
        let raw = self.raw(text);
        1.0 / (1.0 + (-self.steepness * (raw - self.midpoint)).exp())
    }
}

#[async_trait]
impl ImpactScorer for KeywordScorer {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn score_batch(&self, texts: &[String]) -> Result<Vec<f64>, ScoreError> {
        Ok(texts.iter().map(|t| self.score(t)).collect())
    }
}

/// The text representation a message is scored on.
pub fn message_text(message: &Message) -> String {
    let payload = serde_json::to_string(&message.payload).unwrap_or_default();
    format!("{} {} {}", message.action(), payload, message.source_agent)
}

/// Scoring front: primary backend with budget, keyword fallback.
pub struct ScoringService {
    backend: Option<Arc<dyn ImpactScorer>>,
    fallback: KeywordScorer,
    budget: Duration,
}

impl ScoringService {
    /// Keyword-only service.
    pub fn keyword_only(budget: Duration) -> Self {
        Self {
            backend: None,
            fallback: KeywordScorer::default(),
            budget,
        }
    }

    /// Service with a primary (typically ML) backend.
    pub fn with_backend(backend: Arc<dyn ImpactScorer>, budget: Duration) -> Self {
        Self {
            backend: Some(backend),
            fallback: KeywordScorer::default(),
            budget,
        }
    }

    /// Score a batch; infallible. Backend error or latency over budget
    /// degrades to the keyword scorer.
    pub async fn score_batch(&self, texts: &[String]) -> Vec<f64> {
        if let Some(backend) = &self.backend {
            match tokio::time::timeout(self.budget, backend.score_batch(texts)).await {
                Ok(Ok(scores)) if scores.len() == texts.len() => return scores,
                Ok(Ok(_)) => {
                    tracing::debug!(backend = backend.name(), "backend returned wrong arity");
                }
                Ok(Err(err)) => {
                    tracing::debug!(backend = backend.name(), error = %err, "backend failed");
                }
                Err(_) => {
                    tracing::debug!(backend = backend.name(), "backend over budget");
                }
            }
        }
        texts.iter().map(|t| self.fallback.score(t)).collect()
    }
}

struct ScoreRequest {
    text: String,
    reply: oneshot::Sender<f64>,
}

/// Batching front over [`ScoringService`]: concurrent requests inside one
/// tick (bounded by `max_batch` or `max_wait`) share a single backend call.
pub struct ScoreBatcher {
    tx: mpsc::Sender<ScoreRequest>,
    service: Arc<ScoringService>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ScoreBatcher {
    pub fn spawn(service: Arc<ScoringService>, max_batch: usize, max_wait: Duration) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<ScoreRequest>(max_batch.max(1) * 4);
        let worker_service = Arc::clone(&service);
        let worker = tokio::spawn(Self::run(rx, worker_service, max_batch.max(1), max_wait));
        Arc::new(Self {
            tx,
            service,
            worker: Mutex::new(Some(worker)),
        })
    }

    async fn run(
        mut rx: mpsc::Receiver<ScoreRequest>,
        service: Arc<ScoringService>,
        max_batch: usize,
        max_wait: Duration,
    ) {
        while let Some(first) = rx.recv().await {
            let mut batch = vec![first];
            let deadline = tokio::time::Instant::now() + max_wait;
            while batch.len() < max_batch {
                match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(Some(request)) => batch.push(request),
                    Ok(None) | Err(_) => break,
                }
            }

            let texts: Vec<String> = batch.iter().map(|r| r.text.clone()).collect();
            let scores = service.score_batch(&texts).await;
            for (request, score) in batch.into_iter().zip(scores) {
                let _ = request.reply.send(score);
            }
        }
    }

    /// Score one text through the batch tick.
    pub async fn score(&self, text: String) -> f64 {
        let (reply, rx) = oneshot::channel();
        let request = ScoreRequest {
            text: text.clone(),
            reply,
        };
        if self.tx.send(request).await.is_err() {
            // Worker gone; score inline.
            return self.service.score_batch(&[text]).await[0];
        }
        match rx.await {
            Ok(score) => score,
            Err(_) => self.service.score_batch(&[text]).await[0],
        }
    }

    pub async fn shutdown(&self) {
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use serde_json::json;

    #[test]
    fn keyword_scores_are_bounded_and_ordered() {
        let scorer = KeywordScorer::default();
        let low = scorer.score("what is the queue status");
        let high = scorer.score("delete production credentials and transfer payment");

        assert!((0.0..=1.0).contains(&low));
        assert!((0.0..=1.0).contains(&high));
        assert!(low < 0.2, "benign text scored {low}");
        assert!(high > 0.8, "dangerous text scored {high}");
    }

    #[test]
    fn keyword_scoring_is_deterministic() {
        let scorer = KeywordScorer::default();
        let text = "shutdown the production database";
        assert_eq!(scorer.score(text).to_bits(), scorer.score(text).to_bits());
    }

    #[tokio::test]
    async fn service_falls_back_on_backend_error() {
        struct Broken;

        #[async_trait]
        impl ImpactScorer for Broken {
            fn name(&self) -> &str {
                "broken"
            }
            async fn score_batch(&self, _texts: &[String]) -> Result<Vec<f64>, ScoreError> {
                Err(ScoreError("model not loaded".into()))
            }
        }

        let service =
            ScoringService::with_backend(Arc::new(Broken), Duration::from_millis(10));
        let scores = service.score_batch(&["delete everything".into()]).await;
        assert_eq!(scores.len(), 1);
        assert!(scores[0] > 0.0);
    }

    #[tokio::test]
    async fn service_falls_back_on_slow_backend() {
        struct Slow;

        #[async_trait]
        impl ImpactScorer for Slow {
            fn name(&self) -> &str {
                "slow"
            }
            async fn score_batch(&self, texts: &[String]) -> Result<Vec<f64>, ScoreError> {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(vec![0.99; texts.len()])
            }
        }

        let service = ScoringService::with_backend(Arc::new(Slow), Duration::from_millis(10));
        let scores = service.score_batch(&["status".into()]).await;
        // Keyword fallback, not the backend's 0.99.
        assert!(scores[0] < 0.5);
    }

    #[tokio::test]
    async fn batcher_returns_individual_scores() {
        let service = Arc::new(ScoringService::keyword_only(Duration::from_millis(10)));
        let batcher = ScoreBatcher::spawn(service, 64, Duration::from_millis(10));

        let benign = batcher.score("status check".into()).await;
        let risky = batcher
            .score("delete production secret credentials".into())
            .await;
        assert!(benign < risky);
        batcher.shutdown().await;
    }

    #[tokio::test]
    async fn batcher_merges_concurrent_requests() {
        use std::sync::atomic::{AtomicU32, Ordering};

        struct CountingBackend(AtomicU32);

        #[async_trait]
        impl ImpactScorer for CountingBackend {
            fn name(&self) -> &str {
                "counting"
            }
            async fn score_batch(&self, texts: &[String]) -> Result<Vec<f64>, ScoreError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(vec![0.5; texts.len()])
            }
        }

        let backend = Arc::new(CountingBackend(AtomicU32::new(0)));
        let service = Arc::new(ScoringService::with_backend(
            backend.clone(),
            Duration::from_millis(50),
        ));
        let batcher = ScoreBatcher::spawn(service, 64, Duration::from_millis(20));

        let mut tasks = Vec::new();
        for i in 0..16 {
            let batcher = Arc::clone(&batcher);
            tasks.push(tokio::spawn(
                async move { batcher.score(format!("text {i}")).await },
            ));
        }
        for task in tasks {
            assert!((task.await.unwrap() - 0.5).abs() < f64::EPSILON);
        }

        // 16 requests collapsed into a handful of backend calls.
        assert!(backend.0.load(Ordering::SeqCst) <= 4);
        batcher.shutdown().await;
    }

    #[test]
    fn message_text_includes_action_and_payload() {
        let message = crate::message::Message::builder("agent-a", MessageType::Command)
            .payload_entry("action", json!("delete_resource"))
            .payload_entry("target", json!("db-1"))
            .build()
            .unwrap();
        let text = message_text(&message);
        assert!(text.contains("delete_resource"));
        assert!(text.contains("db-1"));
    }
}
