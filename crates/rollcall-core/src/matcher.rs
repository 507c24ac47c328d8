//! Gallery matching.

use crate::types::{Embedding, Identity, RecognitionResult};

/// Similarity a gallery entry must strictly exceed to count as a match.
pub const DEFAULT_THRESHOLD: f32 = 0.85;

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &[Identity], threshold: f32) -> RecognitionResult;
}

/// Cosine similarity matcher.
///
/// Walks the whole gallery and keeps the first entry holding the greatest
/// similarity that is strictly above the threshold.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[Identity], threshold: f32) -> RecognitionResult {
        let mut best: Option<(usize, f32)> = None;

        for (i, identity) in gallery.iter().enumerate() {
            let sim = probe.similarity(&identity.embedding);
            if sim <= threshold {
                continue;
            }
            // Strict comparison: an equal score never displaces an earlier entry.
            if best.map_or(true, |(_, best_sim)| sim > best_sim) {
                best = Some((i, sim));
            }
        }

        match best {
            Some((idx, similarity)) => {
                tracing::trace!(
                    name = %gallery[idx].display_name,
                    similarity,
                    "gallery match"
                );
                RecognitionResult::Matched {
                    identity: gallery[idx].clone(),
                    similarity,
                }
            }
            None => RecognitionResult::NoMatch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures::{block, embedding, identity};
    use crate::types::EMBEDDING_DIM;

    #[test]
    fn test_self_match_accepted() {
        let e = embedding(11);
        let gallery = vec![identity("Priya", "US001", 1, e.clone())];
        match CosineMatcher.compare(&e, &gallery, 0.99) {
            RecognitionResult::Matched { identity, similarity } => {
                assert_eq!(identity.display_name, "Priya");
                assert!((similarity - 1.0).abs() < 1e-6);
            }
            RecognitionResult::NoMatch => panic!("self match must be accepted"),
        }
    }

    #[test]
    fn test_equal_to_threshold_is_rejected() {
        let probe = embedding(1);
        let enrolled = embedding(2);
        let sim = probe.similarity(&enrolled);
        let gallery = vec![identity("Asha", "US002", 1, enrolled)];

        assert_eq!(CosineMatcher.compare(&probe, &gallery, sim), RecognitionResult::NoMatch);
        assert!(CosineMatcher.compare(&probe, &gallery, sim - 1e-4).is_match());
    }

    #[test]
    fn test_best_match_wins_over_earlier_entries() {
        let probe = block(2);
        let gallery = vec![
            identity("decoy1", "A", 1, block(0)),
            identity("decoy2", "B", 2, block(1)),
            identity("match", "C", 3, block(2)),
        ];

        let result = CosineMatcher.compare(&probe, &gallery, 0.5);
        assert_eq!(result.display_name(), Some("match"));
    }

    #[test]
    fn test_tie_keeps_first_entry() {
        let probe = block(1);
        let gallery = vec![
            identity("first", "A", 1, block(1)),
            identity("second", "B", 2, block(1)),
        ];

        let result = CosineMatcher.compare(&probe, &gallery, 0.5);
        assert_eq!(result.display_name(), Some("first"));
    }

    #[test]
    fn test_no_match_below_threshold() {
        let probe = block(0);
        let gallery = vec![identity("other", "A", 1, block(3))];
        assert_eq!(CosineMatcher.compare(&probe, &gallery, DEFAULT_THRESHOLD), RecognitionResult::NoMatch);
    }

    #[test]
    fn test_empty_gallery() {
        assert_eq!(CosineMatcher.compare(&embedding(0), &[], DEFAULT_THRESHOLD), RecognitionResult::NoMatch);
    }

    #[test]
    fn test_zero_probe_never_matches() {
        let zero = Embedding::from_values(vec![0.0; EMBEDDING_DIM]).unwrap();
        let gallery = vec![identity("Asha", "US002", 1, embedding(4))];
        assert_eq!(CosineMatcher.compare(&zero, &gallery, 0.0), RecognitionResult::NoMatch);
    }
}
