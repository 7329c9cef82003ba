//! Dialogue parsing and segmentation.
//!
//! Input is line-oriented: `tag: utterance` opens a new turn when `tag` is
//! one of the configured speakers; every other line continues the previous
//! turn. Turns are then packed into segments of bounded size, each of which
//! is synthesized by exactly one provider session.

use crate::error::SynthError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One `(speaker, utterance)` pair. Order within a task is significant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: u8,
    pub text: String,
}

/// A contiguous run of turns handled by one provider session. `index` is
/// the segment's zero-based position within the task and drives output
/// reassembly order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub index: usize,
    pub turns: Vec<Turn>,
}

/// Speaker tag → provider voice identifier, with stable small-integer ids
/// assigned in tag order. The tag set is closed: only configured tags open
/// new turns, so URLs and timestamps inside utterances never masquerade as
/// speakers.
#[derive(Debug, Clone)]
pub struct VoiceMap {
    entries: Vec<(String, String)>,
}

impl VoiceMap {
    pub fn from_config(speakers: &BTreeMap<String, String>) -> Self {
        Self {
            entries: speakers
                .iter()
                .map(|(tag, voice)| (tag.clone(), voice.clone()))
                .collect(),
        }
    }

    /// Speaker id for a tag, if the tag is in the closed set.
    pub fn resolve(&self, tag: &str) -> Option<u8> {
        self.entries
            .iter()
            .position(|(t, _)| t == tag)
            .map(|i| i as u8)
    }

    /// Voice identifier for a speaker id. A configured speaker with an
    /// empty voice id cannot be synthesized.
    pub fn voice(&self, speaker: u8) -> Result<&str, SynthError> {
        let (tag, voice) = self
            .entries
            .get(speaker as usize)
            .ok_or_else(|| SynthError::InvalidSpeaker(format!("#{speaker}")))?;
        if voice.is_empty() {
            return Err(SynthError::InvalidSpeaker(tag.clone()));
        }
        Ok(voice)
    }

    pub fn tag(&self, speaker: u8) -> Option<&str> {
        self.entries.get(speaker as usize).map(|(t, _)| t.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parse dialogue text into ordered turns.
///
/// Fails with `EmptyInput` when nothing parses into a non-empty turn, and
/// with `InvalidSpeaker` when a matched tag has no voice mapping.
pub fn parse(text: &str, voices: &VoiceMap) -> Result<Vec<Turn>, SynthError> {
    let mut turns: Vec<Turn> = Vec::new();

    for line in text.lines() {
        if let Some((tag, rest)) = line.split_once(':') {
            let tag = tag.trim();
            if let Some(speaker) = voices.resolve(tag) {
                // Surface the missing mapping at parse time, before any
                // provider connection is attempted.
                voices.voice(speaker)?;
                turns.push(Turn {
                    speaker,
                    text: rest.trim().to_string(),
                });
                continue;
            }
        }
        // Continuation: attach to the previous turn. A leading continuation
        // with no turn to attach to is dropped.
        if let Some(last) = turns.last_mut() {
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                if !last.text.is_empty() {
                    last.text.push('\n');
                }
                last.text.push_str(trimmed);
            }
        }
    }

    turns.retain(|t| !t.text.is_empty());
    if turns.is_empty() {
        return Err(SynthError::EmptyInput);
    }
    Ok(turns)
}

/// Greedily pack consecutive turns into segments of at most
/// `max_per_segment` turns. A turn is never split across segments.
pub fn segment(turns: Vec<Turn>, max_per_segment: usize) -> Vec<Segment> {
    let max = max_per_segment.max(1);
    turns
        .chunks(max)
        .enumerate()
        .map(|(index, chunk)| Segment {
            index,
            turns: chunk.to_vec(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voices() -> VoiceMap {
        VoiceMap::from_config(&BTreeMap::from([
            ("A".to_string(), "voice_a".to_string()),
            ("B".to_string(), "voice_b".to_string()),
        ]))
    }

    #[test]
    fn parses_alternating_speakers() {
        let text = "A: hello there\nB: hi\nA: how are you?";
        let turns = parse(text, &voices()).unwrap();
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].speaker, 0);
        assert_eq!(turns[0].text, "hello there");
        assert_eq!(turns[1].speaker, 1);
        assert_eq!(turns[2].text, "how are you?");
    }

    #[test]
    fn continuation_lines_attach_to_previous_turn() {
        let text = "A: first line\nsecond line\nthird line\nB: reply";
        let turns = parse(text, &voices()).unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].text, "first line\nsecond line\nthird line");
        assert_eq!(turns[1].text, "reply");
    }

    #[test]
    fn unknown_tag_is_a_continuation_not_a_speaker() {
        // "https" looks identifier-shaped but is not in the closed set.
        let text = "A: check this out\nhttps://example.com/episode";
        let turns = parse(text, &voices()).unwrap();
        assert_eq!(turns.len(), 1);
        assert!(turns[0].text.contains("https://example.com/episode"));
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(matches!(
            parse("", &voices()),
            Err(SynthError::EmptyInput)
        ));
        // Lines that never open a turn also count as empty.
        assert!(matches!(
            parse("no speaker here\njust prose", &voices()),
            Err(SynthError::EmptyInput)
        ));
    }

    #[test]
    fn speaker_without_voice_mapping_fails() {
        let voices = VoiceMap::from_config(&BTreeMap::from([
            ("A".to_string(), "voice_a".to_string()),
            ("B".to_string(), String::new()),
        ]));
        let err = parse("A: fine\nB: broken", &voices).unwrap_err();
        assert!(matches!(err, SynthError::InvalidSpeaker(tag) if tag == "B"));
    }

    #[test]
    fn turn_with_only_whitespace_is_dropped() {
        let text = "A:   \nB: real content";
        let turns = parse(text, &voices()).unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].speaker, 1);
    }

    #[test]
    fn segmentation_packs_greedily() {
        let turns: Vec<Turn> = (0..25)
            .map(|i| Turn {
                speaker: (i % 2) as u8,
                text: format!("turn {i}"),
            })
            .collect();
        let segments = segment(turns, 10);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].turns.len(), 10);
        assert_eq!(segments[1].turns.len(), 10);
        assert_eq!(segments[2].turns.len(), 5);
        assert_eq!(segments[2].index, 2);
    }

    #[test]
    fn segmentation_never_splits_a_turn() {
        let turns: Vec<Turn> = (0..7)
            .map(|i| Turn {
                speaker: 0,
                text: format!("t{i}"),
            })
            .collect();
        let segments = segment(turns.clone(), 3);
        let rejoined: Vec<Turn> = segments.into_iter().flat_map(|s| s.turns).collect();
        assert_eq!(rejoined, turns);
    }

    #[test]
    fn single_segment_when_under_limit() {
        let turns: Vec<Turn> = (0..7)
            .map(|i| Turn {
                speaker: 0,
                text: format!("t{i}"),
            })
            .collect();
        let segments = segment(turns, 10);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].turns.len(), 7);
    }

    #[test]
    fn voice_map_assigns_stable_ids_in_tag_order() {
        let v = voices();
        assert_eq!(v.resolve("A"), Some(0));
        assert_eq!(v.resolve("B"), Some(1));
        assert_eq!(v.resolve("C"), None);
        assert_eq!(v.voice(0).unwrap(), "voice_a");
        assert_eq!(v.tag(1), Some("B"));
    }
}
