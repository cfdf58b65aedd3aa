//! Nearest-embedding matching against a class roster.

use crate::types::{Candidate, Embedding, MatchResult};

/// Default cosine similarity floor for a positive match.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.6;

/// Strategy for comparing a query embedding against the enrolled candidates.
pub trait Matcher {
    fn compare(&self, query: &Embedding, candidates: &[Candidate], threshold: f32) -> MatchResult;
}

/// Cosine similarity matcher.
///
/// Every candidate is scored. The single best score wins; on equal scores the
/// earlier candidate is kept, so the result only depends on the inputs. A best
/// score strictly below `threshold` is reported as unknown.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(&self, query: &Embedding, candidates: &[Candidate], threshold: f32) -> MatchResult {
        let mut best_sim = f32::NEG_INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, candidate) in candidates.iter().enumerate() {
            let Some(embedding) = candidate.embedding.as_ref() else {
                continue;
            };
            if embedding.values.len() != query.values.len() {
                tracing::debug!(
                    identity_id = %candidate.identity_id,
                    expected = query.values.len(),
                    actual = embedding.values.len(),
                    "skipping candidate with mismatched embedding dimension"
                );
                continue;
            }
            let sim = query.similarity(embedding);
            if sim > best_sim {
                best_sim = sim;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_sim >= threshold => MatchResult {
                identity_id: Some(candidates[idx].identity_id.clone()),
                similarity: best_sim,
            },
            Some(_) => MatchResult::unknown(best_sim),
            None => MatchResult::unknown(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, values: Vec<f32>) -> Candidate {
        Candidate {
            identity_id: id.into(),
            embedding: Some(Embedding::new(values)),
        }
    }

    #[test]
    fn test_cosine_matcher_scans_all_candidates() {
        // Best match is the last entry
        let query = Embedding::new(vec![1.0, 0.0, 0.0]);
        let candidates = vec![
            candidate("decoy1", vec![0.0, 1.0, 0.0]),
            candidate("decoy2", vec![0.0, 0.0, 1.0]),
            candidate("match", vec![1.0, 0.0, 0.0]),
        ];

        let result = CosineMatcher.compare(&query, &candidates, 0.5);
        assert!(result.is_match());
        assert_eq!(result.identity_id.as_deref(), Some("match"));
        assert!((result.similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_matcher_no_match() {
        let query = Embedding::new(vec![1.0, 0.0, 0.0]);
        let candidates = vec![candidate("other", vec![0.0, 1.0, 0.0])];

        let result = CosineMatcher.compare(&query, &candidates, 0.5);
        assert!(!result.is_match());
        assert!(result.similarity.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_matcher_empty_roster() {
        let query = Embedding::new(vec![1.0, 0.0]);
        let result = CosineMatcher.compare(&query, &[], 0.5);
        assert!(!result.is_match());
        assert_eq!(result.similarity, 0.0);
    }

    #[test]
    fn test_cosine_matcher_threshold_is_inclusive() {
        // cos(60°) = 0.5
        let query = Embedding::new(vec![1.0, 0.0]);
        let candidates = vec![candidate("a", vec![0.5, 0.75f32.sqrt()])];
        let sim = query.similarity(candidates[0].embedding.as_ref().unwrap());

        assert!(CosineMatcher.compare(&query, &candidates, sim).is_match());
        assert!(!CosineMatcher.compare(&query, &candidates, sim + 1e-4).is_match());
    }

    #[test]
    fn test_cosine_matcher_weak_best_is_unknown() {
        let query = Embedding::new(vec![1.0, 0.0]);
        let candidates = vec![
            candidate("weak", vec![1.0, 1.0]),
            candidate("weaker", vec![0.2, 1.0]),
        ];
        let result = CosineMatcher.compare(&query, &candidates, 0.9);
        assert_eq!(result.identity_id, None);
        // Best score is still reported
        assert!((result.similarity - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-5);
    }

    #[test]
    fn test_cosine_matcher_tie_keeps_first_candidate() {
        let query = Embedding::new(vec![1.0, 0.0]);
        let candidates = vec![
            candidate("first", vec![2.0, 0.0]),
            candidate("second", vec![1.0, 0.0]),
        ];
        for _ in 0..10 {
            let result = CosineMatcher.compare(&query, &candidates, 0.6);
            assert_eq!(result.identity_id.as_deref(), Some("first"));
        }
    }

    #[test]
    fn test_cosine_matcher_skips_unregistered_and_mismatched() {
        let query = Embedding::new(vec![1.0, 0.0]);
        let candidates = vec![
            Candidate { identity_id: "unregistered".into(), embedding: None },
            candidate("wrong-dim", vec![1.0, 0.0, 0.0]),
            candidate("ok", vec![0.9, 0.1]),
        ];
        let result = CosineMatcher.compare(&query, &candidates, 0.6);
        assert_eq!(result.identity_id.as_deref(), Some("ok"));
    }

    #[test]
    fn test_cosine_matcher_threshold_monotonic() {
        let queries = [
            vec![1.0, 0.0, 0.0],
            vec![0.6, 0.8, 0.0],
            vec![0.1, 0.1, 0.98],
            vec![-1.0, 0.2, 0.0],
        ];
        let candidates = vec![
            candidate("a", vec![1.0, 0.1, 0.0]),
            candidate("b", vec![0.0, 1.0, 0.3]),
        ];
        let thresholds = [0.95, 0.8, 0.6, 0.4, 0.0, -1.0];

        for query in queries {
            let query = Embedding::new(query);
            let mut matched_before = false;
            for t in thresholds {
                let result = CosineMatcher.compare(&query, &candidates, t);
                if result.is_match() {
                    assert!(result.similarity >= t);
                }
                // Lowering the threshold never turns a match back into unknown
                assert!(!matched_before || result.is_match());
                matched_before = result.is_match();
            }
        }
    }
}
