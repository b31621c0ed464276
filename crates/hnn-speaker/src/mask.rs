//! Speaker extraction with HTK-style masks.
//!
//! `*` matches any run of characters, `?` any single character and `%` any
//! single character that is also appended to the speaker id. Every other
//! character must match literally.

use hnn_core::SpeakerPatternMatcher;

#[derive(Debug, Clone, Copy, Default)]
pub struct MaskMatcher;

impl SpeakerPatternMatcher for MaskMatcher {
    fn extract(&self, pattern: &str, utterance: &str) -> Option<String> {
        let mask: Vec<char> = pattern.chars().collect();
        let name: Vec<char> = utterance.chars().collect();
        let mut speaker = String::new();
        match_mask(&mask, &name, &mut speaker).then_some(speaker)
    }
}

fn match_mask(mask: &[char], name: &[char], speaker: &mut String) -> bool {
    match mask.split_first() {
        None => name.is_empty(),
        Some(('*', rest)) => {
            let saved = speaker.len();
            for skip in 0..=name.len() {
                if match_mask(rest, &name[skip..], speaker) {
                    return true;
                }
                speaker.truncate(saved);
            }
            false
        }
        Some(('?', rest)) => !name.is_empty() && match_mask(rest, &name[1..], speaker),
        Some(('%', rest)) => {
            let Some(&c) = name.first() else {
                return false;
            };
            speaker.push(c);
            if match_mask(rest, &name[1..], speaker) {
                true
            } else {
                speaker.pop();
                false
            }
        }
        Some((c, rest)) => name.first() == Some(c) && match_mask(rest, &name[1..], speaker),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_marked_characters() {
        let m = MaskMatcher;
        assert_eq!(
            m.extract("*/%%%%_*.plp", "/data/wsj/spk1_0042.plp"),
            Some("spk1".to_string())
        );
        assert_eq!(m.extract("%%%?????", "abc12345"), Some("abc".to_string()));
    }

    #[test]
    fn test_mismatch_returns_none() {
        let m = MaskMatcher;
        assert_eq!(m.extract("*/%%%%_*.plp", "/data/wsj/spk1-0042.plp"), None);
        assert_eq!(m.extract("%%%?", "ab"), None);
    }

    #[test]
    fn test_star_backtracks_without_leaking_captures() {
        let m = MaskMatcher;
        assert_eq!(m.extract("*%_x", "a_b_x"), Some("b".to_string()));
    }
}
