//! Nearest-neighbour matching of probe embeddings against enrolled galleries.

use crate::types::{Embedding, Gallery, MatchResult, Resolution};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum MatchError {
    #[error("threshold must be in (0, 1], got {0}")]
    InvalidThreshold(f32),
    #[error("probe {probe} has {actual} dimensions, gallery has {expected}")]
    InvalidVector {
        probe: usize,
        expected: usize,
        actual: usize,
    },
}

/// Strategy for resolving probe embeddings to enrolled students.
pub trait Matcher {
    fn match_probes(
        &self,
        probes: &[Embedding],
        galleries: &[Gallery],
        threshold: f32,
    ) -> Result<Vec<MatchResult>, MatchError>;
}

/// Cosine similarity matcher over every enrolled vector.
///
/// The student owning the single best-scoring vector is the candidate.
/// Ties at the maximum go to the lowest student id, so identical inputs
/// always resolve identically regardless of gallery order.
#[derive(Debug, Default, Clone, Copy)]
pub struct CosineMatcher;

impl CosineMatcher {
    fn best_for(
        &self,
        index: usize,
        probe: &Embedding,
        ordered: &[&Gallery],
        threshold: f32,
    ) -> Result<MatchResult, MatchError> {
        let mut best_sim = f32::NEG_INFINITY;
        let mut best_student: Option<&str> = None;

        for gallery in ordered {
            for enrolled in &gallery.embeddings {
                if enrolled.dim() != probe.dim() {
                    return Err(MatchError::InvalidVector {
                        probe: index,
                        expected: enrolled.dim(),
                        actual: probe.dim(),
                    });
                }
                let sim = probe.similarity(enrolled);
                // Strict: an equal score later in id order never displaces the earlier id.
                if sim > best_sim {
                    best_sim = sim;
                    best_student = Some(&gallery.student_id);
                }
            }
        }

        let score = if best_sim == f32::NEG_INFINITY {
            0.0
        } else {
            best_sim.clamp(0.0, 1.0)
        };

        let resolution = match best_student {
            Some(id) if score >= threshold => Resolution::Student(id.to_string()),
            _ => Resolution::None,
        };

        Ok(MatchResult {
            probe: index,
            resolution,
            score,
        })
    }
}

impl Matcher for CosineMatcher {
    fn match_probes(
        &self,
        probes: &[Embedding],
        galleries: &[Gallery],
        threshold: f32,
    ) -> Result<Vec<MatchResult>, MatchError> {
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(MatchError::InvalidThreshold(threshold));
        }

        let mut ordered: Vec<&Gallery> = galleries.iter().collect();
        ordered.sort_by(|a, b| a.student_id.cmp(&b.student_id));

        let results = probes
            .iter()
            .enumerate()
            .map(|(i, probe)| self.best_for(i, probe, &ordered, threshold))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(
            probes = probes.len(),
            galleries = galleries.len(),
            matched = results.iter().filter(|r| r.student_id().is_some()).count(),
            "matched probes"
        );

        Ok(results)
    }
}
