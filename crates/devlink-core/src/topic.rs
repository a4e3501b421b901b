//! Telemetry topic parsing and matching.
//!
//! Topics are slash-separated strings like "wifi/rssi". Subscriptions name
//! a pattern that may include wildcards; the bus matches every incoming
//! event topic against the patterns of its subscribers.
//!
//! Matching is segment based and allocation free on the hot path.

/// A segment in a topic pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternSegment {
    /// Exact literal match for this segment
    Literal(String),
    /// Single wildcard (*) - matches exactly one segment when mid-topic,
    /// or any suffix when at the end
    Wildcard,
}

/// A subscription pattern that may contain wildcards.
///
/// Supported patterns:
/// - Exact: "wifi/rssi"
/// - Suffix wildcard: "wifi/*"
/// - Mid-topic wildcard: "net/*/state"
/// - Full wildcard: "*"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<PatternSegment>,
    /// True if the pattern ends with a wildcard (matches any suffix)
    trailing_wildcard: bool,
}

impl TopicPattern {
    /// Create a new topic pattern.
    ///
    /// Pattern syntax:
    /// - `*` at end matches any suffix (e.g., "wifi/*" matches "wifi/ap/clients")
    /// - `*` in middle matches exactly one segment (e.g., "net/*/state")
    /// - `*` alone matches any topic
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        let pattern = pattern.trim_matches('/');
        if pattern.is_empty() {
            return Err(PatternError::EmptyPattern);
        }

        let parts: Vec<&str> = pattern.split('/').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(PatternError::EmptySegment(pattern.to_string()));
        }

        let segments: Vec<PatternSegment> = parts
            .iter()
            .map(|&s| {
                if s == "*" {
                    PatternSegment::Wildcard
                } else {
                    PatternSegment::Literal(s.to_string())
                }
            })
            .collect();

        Ok(Self {
            raw: pattern.to_string(),
            trailing_wildcard: segments.last() == Some(&PatternSegment::Wildcard),
            segments,
        })
    }

    /// Check if a topic matches this pattern.
    pub fn matches(&self, topic: &str) -> bool {
        if self.segments.len() == 1 && self.segments[0] == PatternSegment::Wildcard {
            return true;
        }

        let mut parts = topic.trim_matches('/').split('/');
        let last = self.segments.len() - 1;

        for (i, segment) in self.segments.iter().enumerate() {
            let part = match parts.next() {
                Some(p) if !p.is_empty() => p,
                _ => return false,
            };
            match segment {
                PatternSegment::Literal(lit) => {
                    if part != lit {
                        return false;
                    }
                }
                PatternSegment::Wildcard => {
                    // Trailing wildcard swallows the rest of the topic
                    if self.trailing_wildcard && i == last {
                        return true;
                    }
                }
            }
        }

        parts.next().is_none()
    }

    /// True if the pattern names exactly one topic.
    pub fn is_exact(&self) -> bool {
        !self
            .segments
            .iter()
            .any(|s| *s == PatternSegment::Wildcard)
    }

    /// Get the raw pattern string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl std::fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl std::str::FromStr for TopicPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TopicPattern::new(s)
    }
}

/// Errors that can occur when creating a topic pattern.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("Empty pattern")]
    EmptyPattern,

    #[error("Empty segment in pattern '{0}'")]
    EmptySegment(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_pattern() {
        let pattern = TopicPattern::new("wifi/rssi").unwrap();
        assert!(pattern.matches("wifi/rssi"));
        assert!(!pattern.matches("wifi/channel"));
        assert!(!pattern.matches("wifi"));
        assert!(!pattern.matches("wifi/rssi/avg"));
        assert!(pattern.is_exact());
    }

    #[test]
    fn test_suffix_wildcard() {
        let pattern = TopicPattern::new("wifi/*").unwrap();
        assert!(pattern.matches("wifi/rssi"));
        assert!(pattern.matches("wifi/sta"));
        assert!(pattern.matches("wifi/ap/clients/count"));
        assert!(!pattern.matches("wifi"));
        assert!(!pattern.matches("mqtt/state"));
        assert!(!pattern.is_exact());
    }

    #[test]
    fn test_mid_topic_wildcard() {
        let pattern = TopicPattern::new("net/*/state").unwrap();
        assert!(pattern.matches("net/eth0/state"));
        assert!(pattern.matches("net/sta/state"));
        assert!(!pattern.matches("net/eth0/address"));
        assert!(!pattern.matches("net/state"));
    }

    #[test]
    fn test_full_wildcard() {
        let pattern = TopicPattern::new("*").unwrap();
        assert!(pattern.matches("wifi/rssi"));
        assert!(pattern.matches("anything/at/all"));
        assert!(pattern.matches("x"));
    }

    #[test]
    fn test_surrounding_slashes_ignored() {
        let pattern = TopicPattern::new("/wifi/rssi/").unwrap();
        assert_eq!(pattern.as_str(), "wifi/rssi");
        assert!(pattern.matches("wifi/rssi"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert_eq!(TopicPattern::new(""), Err(PatternError::EmptyPattern));
        assert_eq!(TopicPattern::new("/"), Err(PatternError::EmptyPattern));
        assert!(matches!(
            TopicPattern::new("wifi//rssi"),
            Err(PatternError::EmptySegment(_))
        ));
    }
}
