//! Append-only conversation log.

use chrono::{DateTime, Utc};

use crate::model::Message;

/// Number of most recent messages sent with each completion request.
pub const DEFAULT_WINDOW_SIZE: usize = 20;

/// Ordered message history for one conversation.
///
/// Messages are never edited or removed. Only the tail is sent to the model,
/// but the whole log stays available through [`Conversation::history`].
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<Message>,
    appended_at: Vec<DateTime<Utc>>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
        self.appended_at.push(Utc::now());
    }

    /// The most recent `limit` messages, oldest first.
    pub fn windowed_view(&self, limit: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(limit);
        &self.messages[start..]
    }

    /// Every message with the time it was appended.
    pub fn history(&self) -> impl Iterator<Item = (DateTime<Utc>, &Message)> {
        self.appended_at.iter().copied().zip(self.messages.iter())
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ToolOutput;

    fn numbered(n: usize) -> Conversation {
        let mut conversation = Conversation::new();
        for i in 0..n {
            conversation.append(Message::user(format!("q{i}")));
        }
        conversation
    }

    #[test]
    fn short_log_is_returned_whole() {
        let conversation = numbered(3);
        let view = conversation.windowed_view(20);
        assert_eq!(view, conversation.messages());
    }

    #[test]
    fn long_log_keeps_most_recent_oldest_first() {
        let conversation = numbered(25);
        let view = conversation.windowed_view(20);
        assert_eq!(view.len(), 20);
        assert_eq!(view[0].content(), "q5");
        assert_eq!(view[19].content(), "q24");
        assert_eq!(conversation.len(), 25);
    }

    #[test]
    fn zero_window_is_empty() {
        let conversation = numbered(4);
        assert!(conversation.windowed_view(0).is_empty());
    }

    #[test]
    fn windowed_view_is_idempotent() {
        let conversation = numbered(30);
        let first = conversation.windowed_view(7).to_vec();
        let second = conversation.windowed_view(7).to_vec();
        assert_eq!(first, second);
    }

    #[test]
    fn tool_result_keeps_invocation_id() {
        let mut conversation = Conversation::new();
        conversation.append(Message::user("play something"));
        conversation.append(Message::tool_result(ToolOutput::success("X", "ok")));

        let messages = conversation.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].invocation_id(), Some("X"));
    }

    #[test]
    fn history_pairs_timestamps_in_order() {
        let conversation = numbered(3);
        let stamps: Vec<_> = conversation.history().map(|(at, _)| at).collect();
        assert_eq!(stamps.len(), 3);
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
        let contents: Vec<_> = conversation.history().map(|(_, m)| m.content()).collect();
        assert_eq!(contents, ["q0", "q1", "q2"]);
    }
}
