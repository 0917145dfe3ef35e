//! Classified intent.

use serde::{Deserialize, Serialize};

use super::SpecialistKind;

/// The dispatcher-level tag a classifier assigns to a query. Low-confidence
/// classifications collapse to `General`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentTag {
    Specialist(SpecialistKind),
    General,
    Comprehensive,
}

impl std::fmt::Display for IntentTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntentTag::Specialist(kind) => write!(f, "{kind}"),
            IntentTag::General => write!(f, "general"),
            IntentTag::Comprehensive => write!(f, "comprehensive"),
        }
    }
}

/// Classifier output, produced by a pluggable [`crate::dispatcher::Classifier`]
/// and consumed by the dispatcher.
#[derive(Debug, Clone)]
pub struct Intent {
    pub tag: IntentTag,
    pub confidence: f64,
    pub suggested_specialists: Vec<SpecialistKind>,
}

/// Confidence below which any intent collapses to `general`.
pub const LOW_CONFIDENCE_THRESHOLD: f64 = 0.4;
/// Confidence at or above which the full suggested set is taken as-is.
pub const HIGH_CONFIDENCE_THRESHOLD: f64 = 0.7;

impl Intent {
    pub fn new(tag: IntentTag, confidence: f64, suggested_specialists: Vec<SpecialistKind>) -> Self {
        let confidence = confidence.clamp(0.0, 1.0);
        if confidence < LOW_CONFIDENCE_THRESHOLD {
            Intent { tag: IntentTag::General, confidence, suggested_specialists: Vec::new() }
        } else {
            Intent { tag, confidence, suggested_specialists }
        }
    }

    /// The specialists that should actually be dispatched, applying the
    /// confidence-banded selection policy.
    pub fn selected_specialists(&self) -> Vec<SpecialistKind> {
        match self.tag {
            IntentTag::General => Vec::new(),
            IntentTag::Comprehensive => SpecialistKind::ALL.to_vec(),
            IntentTag::Specialist(_) => {
                if self.confidence >= HIGH_CONFIDENCE_THRESHOLD {
                    self.suggested_specialists.clone()
                } else if self.confidence >= LOW_CONFIDENCE_THRESHOLD {
                    self.suggested_specialists.first().cloned().into_iter().collect()
                } else {
                    Vec::new()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_confidence_collapses_to_general() {
        let intent = Intent::new(
            IntentTag::Specialist(SpecialistKind::ContentAnalysis),
            0.1,
            vec![SpecialistKind::ContentAnalysis],
        );
        assert_eq!(intent.tag, IntentTag::General);
        assert!(intent.selected_specialists().is_empty());
    }

    #[test]
    fn mid_confidence_takes_only_top_specialist() {
        let intent = Intent::new(
            IntentTag::Specialist(SpecialistKind::ContentAnalysis),
            0.5,
            vec![SpecialistKind::ContentAnalysis, SpecialistKind::SeoDiscoverability],
        );
        assert_eq!(intent.selected_specialists(), vec![SpecialistKind::ContentAnalysis]);
    }

    #[test]
    fn high_confidence_takes_full_suggested_set() {
        let suggested = vec![SpecialistKind::ContentAnalysis, SpecialistKind::SeoDiscoverability];
        let intent = Intent::new(
            IntentTag::Specialist(SpecialistKind::ContentAnalysis),
            0.9,
            suggested.clone(),
        );
        assert_eq!(intent.selected_specialists(), suggested);
    }

    #[test]
    fn comprehensive_maps_to_full_set() {
        let intent = Intent::new(IntentTag::Comprehensive, 0.9, Vec::new());
        assert_eq!(intent.selected_specialists().len(), SpecialistKind::ALL.len());
    }
}
