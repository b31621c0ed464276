//! Преобразование сегментов меток в покадровые цели.

use crate::error::{HnnError, HnnResult};
use crate::types::LabelSegment;

/// Развернуть сегменты в одну цель на кадр.
///
/// Сегменты должны идти подряд без разрывов и наложений и покрывать
/// ровно `frame_count` кадров.
pub fn targets_from_segments(
    utterance: &str,
    segments: &[LabelSegment],
    frame_count: usize,
) -> HnnResult<Vec<usize>> {
    let mut targets = Vec::with_capacity(frame_count);
    for (i, seg) in segments.iter().enumerate() {
        if seg.start != targets.len() || seg.end < seg.start {
            return Err(HnnError::DiscontinuousUtterance {
                utterance: utterance.to_string(),
                detail: format!(
                    "segment {i} spans [{}, {}) but frame {} was expected next",
                    seg.start,
                    seg.end,
                    targets.len()
                ),
            });
        }
        targets.extend(std::iter::repeat_n(seg.target, seg.end - seg.start));
    }
    if targets.len() != frame_count {
        return Err(HnnError::DimensionMismatch(format!(
            "labels of '{utterance}' cover {} frames, utterance has {frame_count}",
            targets.len()
        )));
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(start: usize, end: usize, target: usize) -> LabelSegment {
        LabelSegment { start, end, target }
    }

    #[test]
    fn test_contiguous_segments() {
        let targets =
            targets_from_segments("u1", &[seg(0, 2, 7), seg(2, 5, 3)], 5).expect("tiling");
        assert_eq!(targets, vec![7, 7, 3, 3, 3]);
    }

    #[test]
    fn test_gap_is_discontinuous() {
        let err = targets_from_segments("u1", &[seg(0, 2, 7), seg(3, 5, 3)], 5).unwrap_err();
        assert!(matches!(err, HnnError::DiscontinuousUtterance { .. }));
    }

    #[test]
    fn test_overlap_is_discontinuous() {
        let err = targets_from_segments("u1", &[seg(0, 3, 7), seg(2, 5, 3)], 5).unwrap_err();
        assert!(matches!(err, HnnError::DiscontinuousUtterance { .. }));
    }

    #[test]
    fn test_short_labels_rejected() {
        let err = targets_from_segments("u1", &[seg(0, 4, 1)], 5).unwrap_err();
        assert!(matches!(err, HnnError::DimensionMismatch(_)));
    }
}
