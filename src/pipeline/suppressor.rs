//! Within-image duplicate suppression.

use crate::domain::Detection;
use crate::store::SuppressionMark;
use tracing::debug;

/// Greedy, confidence-ordered non-maximum suppression.
#[derive(Debug, Clone, Copy)]
pub struct Suppressor {
    iou_threshold: f32,
}

impl Suppressor {
    /// Create a suppressor that folds boxes overlapping a keeper by more
    /// than `iou_threshold`.
    pub const fn new(iou_threshold: f32) -> Self {
        Self { iou_threshold }
    }

    /// Decide keepers and duplicates for every detection of one image.
    ///
    /// Returns one mark per input detection, in input order. A detection
    /// with a malformed box is always a keeper and never suppresses others.
    pub fn suppress(&self, detections: &[Detection]) -> Vec<SuppressionMark> {
        let mut order: Vec<usize> = (0..detections.len()).collect();
        // Stable sort: equal confidences keep input order.
        order.sort_by(|&a, &b| {
            detections[b]
                .confidence
                .total_cmp(&detections[a].confidence)
        });

        let mut keepers: Vec<usize> = Vec::with_capacity(detections.len());
        let mut duplicate_of = vec![None; detections.len()];

        for idx in order {
            let candidate = &detections[idx];
            let folded_into = if candidate.bbox.is_valid() {
                keepers.iter().copied().find(|&k| {
                    detections[k].bbox.is_valid()
                        && detections[k].bbox.iou(&candidate.bbox) > self.iou_threshold
                })
            } else {
                None
            };

            match folded_into {
                Some(keeper) => {
                    debug!(
                        "Detection {} duplicates {} (confidence {:.2} < {:.2})",
                        candidate.id,
                        detections[keeper].id,
                        candidate.confidence,
                        detections[keeper].confidence
                    );
                    duplicate_of[idx] = Some(detections[keeper].id);
                }
                None => keepers.push(idx),
            }
        }

        detections
            .iter()
            .zip(duplicate_of)
            .map(|(d, duplicate_of)| SuppressionMark {
                detection_id: d.id,
                duplicate_of,
            })
            .collect()
    }
}
