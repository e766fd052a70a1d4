use chrono::NaiveDateTime;
use std::fmt;
use std::sync::Arc;

/// Per-topic notification hook: `(logical name, raw message) -> bool`.
///
/// The return value is for the collaborator's own bookkeeping, dispatch never
/// looks at it.
pub type NotifyCallback = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

const PREVIEW_CHARS: usize = 32;

/// Switch state carried by a message: only the exact string `"true"` is on.
pub fn enabled_state(message: &str) -> bool {
    message == "true"
}

pub fn state_message(enabled: bool) -> &'static str {
    if enabled {
        "true"
    } else {
        "false"
    }
}

/// A message delivered to a subscribe topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    topic: String,
    path: String,
    content: String,
    timestamp: NaiveDateTime,
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.content.chars().take(PREVIEW_CHARS).collect();
        let ellipsis = if self.content.chars().count() > PREVIEW_CHARS {
            "..."
        } else {
            ""
        };
        write!(
            f,
            "{} - {} ({}): {}{}",
            self.timestamp, self.topic, self.path, preview, ellipsis
        )
    }
}

impl InboundMessage {
    /// Decodes `payload` as UTF-8; invalid sequences are replaced, never rejected.
    pub fn from_payload(topic: &str, path: &str, payload: &[u8]) -> Self {
        InboundMessage {
            topic: topic.to_string(),
            path: path.to_string(),
            content: String::from_utf8_lossy(payload).into_owned(),
            timestamp: chrono::Local::now().naive_local(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }

    pub fn enabled(&self) -> bool {
        enabled_state(&self.content)
    }

    pub fn render(&self) -> String {
        format!("{}: {}\n{}", self.timestamp, self.topic, self.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_exact_true_is_enabled() {
        assert!(enabled_state("true"));
        for other in ["TRUE", "True", "false", "1", "on", "", " true", "true\n"] {
            assert!(!enabled_state(other), "{:?} must read as off", other);
        }
    }

    #[test]
    fn malformed_utf8_reads_as_off() {
        let message = InboundMessage::from_payload("porch", "/switch/porch", &[0xff, 0xfe]);
        assert!(!message.enabled());
        assert!(message.content().contains('\u{fffd}'));
    }

    #[test]
    fn display_truncates_long_content() {
        let long = "x".repeat(100);
        let message = InboundMessage::from_payload("t", "/sensor/t", long.as_bytes());
        let shown = message.to_string();
        assert!(shown.ends_with("..."));
        assert!(!shown.contains(&long));

        let short = InboundMessage::from_payload("t", "/sensor/t", b"21.5");
        assert!(short.to_string().ends_with("21.5"));
    }

    #[test]
    fn render_keeps_full_content() {
        let long = "y".repeat(40);
        let message = InboundMessage::from_payload("porch", "/switch/porch", long.as_bytes());
        let rendered = message.render();
        assert!(rendered.starts_with(&message.timestamp().to_string()));
        assert!(rendered.ends_with(&format!("porch\n{}", long)));
        assert_eq!(message.path(), "/switch/porch");
    }

    #[test]
    fn state_message_round_trips() {
        assert!(enabled_state(state_message(true)));
        assert!(!enabled_state(state_message(false)));
    }
}
