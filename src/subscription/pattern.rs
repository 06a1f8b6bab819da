use crate::message::is_valid_segment;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("topic pattern is empty")]
    Empty,
    #[error("invalid segment '{segment}' in topic pattern '{pattern}'")]
    InvalidSegment { pattern: String, segment: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `*`: exactly one segment
    Single,
    /// `**`: zero or more segments
    Multi,
}

/// Parsed subscription pattern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }

        let mut segments: Vec<Segment> = Vec::new();
        for part in pattern.split('.') {
            let segment = match part {
                "*" => Segment::Single,
                "**" => Segment::Multi,
                lit if is_valid_segment(lit) => Segment::Literal(lit.to_string()),
                other => {
                    return Err(PatternError::InvalidSegment {
                        pattern: pattern.to_string(),
                        segment: other.to_string(),
                    })
                }
            };

            // `**.**` matches the same topics as `**`
            if segment == Segment::Multi && segments.last() == Some(&Segment::Multi) {
                continue;
            }
            segments.push(segment);
        }

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_wildcard(&self) -> bool {
        self.segments.iter().any(|s| !matches!(s, Segment::Literal(_)))
    }

    /// Returns true if `topic` is routed to this pattern.
    pub fn matches(&self, topic: &str) -> bool {
        let parts: Vec<&str> = topic.split('.').collect();
        match_segments(&self.segments, &parts)
    }
}

fn match_segments(pattern: &[Segment], topic: &[&str]) -> bool {
    match pattern.split_first() {
        None => topic.is_empty(),
        Some((Segment::Multi, rest)) => {
            if rest.is_empty() {
                return true;
            }
            (0..=topic.len()).any(|skip| match_segments(rest, &topic[skip..]))
        }
        Some((Segment::Single, rest)) => !topic.is_empty() && match_segments(rest, &topic[1..]),
        Some((Segment::Literal(lit), rest)) => {
            topic.first().map_or(false, |part| part == lit) && match_segments(rest, &topic[1..])
        }
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
