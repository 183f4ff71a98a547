//! Registry matching: distance → confidence, hard threshold, best-match selection.

use crate::types::{Embedding, EmbeddingRecord, ProbeResult};
use serde::{Deserialize, Serialize};

/// Minimum confidence (inclusive) for a candidate to be accepted.
pub const DEFAULT_ACCEPT_THRESHOLD: f32 = 60.0;

/// Bounded distance metric in [0, 1] between two embeddings.
///
/// The metric belongs to the extractor that produced the embeddings; see
/// [`EmbeddingExtractor::metric`](crate::extractor::EmbeddingExtractor::metric).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// `acos(cosine) / π`. Suited to L2-normalised ArcFace embeddings.
    Angular,
    /// Plain Euclidean distance, clamped to [0, 1]. Suited to unit-scale
    /// embeddings whose same-person distances fall well below 1.
    Euclidean,
}

impl DistanceMetric {
    pub fn distance(self, a: &Embedding, b: &Embedding) -> f32 {
        match self {
            DistanceMetric::Angular => {
                let cos = a.similarity(b).clamp(-1.0, 1.0);
                cos.acos() / std::f32::consts::PI
            }
            DistanceMetric::Euclidean => a.euclidean_distance(b).clamp(0.0, 1.0),
        }
    }
}

/// Map a distance in [0, 1] to a confidence in [0, 100].
///
/// Computed as `100 - d * 100`, which equals `(1 - d) * 100` but keeps
/// round distances such as 0.4 landing exactly on round confidences.
pub fn confidence_from_distance(distance: f32) -> f32 {
    (100.0 - distance * 100.0).clamp(0.0, 100.0)
}

/// Compares probe embeddings against an owner's registry.
#[derive(Debug, Clone, Copy)]
pub struct MatchEngine {
    metric: DistanceMetric,
    threshold: f32,
}

impl MatchEngine {
    pub fn new(metric: DistanceMetric) -> Self {
        Self {
            metric,
            threshold: DEFAULT_ACCEPT_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Return one result per probe that has an accepted candidate, in probe order.
    ///
    /// Records without an embedding, or whose embedding length differs from the
    /// probe's, are skipped. Ties keep the first record in registry order.
    /// Probes resolving to the same person are not deduplicated.
    pub fn compare(
        &self,
        owner_id: &str,
        probes: &[Embedding],
        registry: &[EmbeddingRecord],
    ) -> Vec<ProbeResult> {
        let results: Vec<ProbeResult> = probes
            .iter()
            .filter_map(|probe| self.best_match(probe, registry))
            .collect();

        tracing::debug!(
            owner = owner_id,
            probes = probes.len(),
            candidates = registry.len(),
            matched = results.len(),
            "registry compared"
        );

        results
    }

    /// Best accepted candidate for a single probe.
    pub fn best_match(&self, probe: &Embedding, registry: &[EmbeddingRecord]) -> Option<ProbeResult> {
        let mut best: Option<(usize, f32)> = None;

        for (i, record) in registry.iter().enumerate() {
            let Some(enrolled) = record.embedding.as_ref() else {
                continue;
            };
            if enrolled.values.len() != probe.values.len() {
                tracing::debug!(
                    person = %record.person_name,
                    enrolled = enrolled.values.len(),
                    probe = probe.values.len(),
                    "skipping embedding of different dimension"
                );
                continue;
            }
            let confidence = confidence_from_distance(self.metric.distance(probe, enrolled));
            if confidence < self.threshold {
                continue;
            }
            // Strictly greater: equal confidence keeps the earlier record.
            if best.map_or(true, |(_, c)| confidence > c) {
                best = Some((i, confidence));
            }
        }

        best.map(|(idx, confidence)| ProbeResult {
            person_name: registry[idx].person_name.clone(),
            confidence,
        })
    }
}
