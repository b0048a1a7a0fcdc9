//! Per-conversation state: bounded history plus activity tracking.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parley_channels::ConversationRecord;
use parley_llm::ChatMessage;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub struct ConversationContext {
    inner: Mutex<ContextInner>,
    in_progress: AtomicBool,
    max_history: usize,
}

struct ContextInner {
    history: VecDeque<ConversationRecord>,
    last_activity: DateTime<Utc>,
}

impl ConversationContext {
    pub fn new(max_history: usize) -> Self {
        Self {
            inner: Mutex::new(ContextInner {
                history: VecDeque::with_capacity(max_history),
                last_activity: Utc::now(),
            }),
            in_progress: AtomicBool::new(false),
            max_history,
        }
    }

    /// Appending is the only mutation path; it also refreshes the activity
    /// clock the staleness sweep reads.
    pub fn append(&self, record: ConversationRecord) {
        let mut inner = self.lock_inner();
        if inner.history.len() == self.max_history {
            inner.history.pop_front();
        }
        inner.history.push_back(record);
        inner.last_activity = Utc::now();
    }

    /// History mapped for the completion payload: bot records speak as the
    /// assistant in their own voice, everything else is attributed user text.
    pub fn completion_messages(&self) -> Vec<ChatMessage> {
        self.lock_inner()
            .history
            .iter()
            .map(|record| {
                if record.is_bot {
                    ChatMessage::assistant(record.content.as_str())
                } else {
                    ChatMessage::user(format!("{}: {}", record.author, record.content))
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock_inner().history.len()
    }

    pub fn is_stale(&self, max_age: Duration) -> bool {
        is_stale_at(self.lock_inner().last_activity, Utc::now(), max_age)
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub fn set_in_progress(&self, value: bool) {
        self.in_progress.store(value, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn set_last_activity(&self, when: DateTime<Utc>) {
        self.lock_inner().last_activity = when;
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, ContextInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Strictly greater: a conversation aged exactly `max_age` is kept.
fn is_stale_at(last_activity: DateTime<Utc>, now: DateTime<Utc>, max_age: Duration) -> bool {
    let max_age = ChronoDuration::from_std(max_age).unwrap_or(ChronoDuration::MAX);
    now - last_activity > max_age
}

#[cfg(test)]
mod tests {
    use super::{ConversationContext, is_stale_at};
    use chrono::{Duration as ChronoDuration, Utc};
    use parley_channels::{ConversationId, ConversationRecord};
    use parley_llm::Role;
    use std::time::Duration;

    fn user_record(author: &str, content: &str) -> ConversationRecord {
        ConversationRecord {
            content: content.to_string(),
            author: author.to_string(),
            timestamp: Utc::now(),
            conversation_id: ConversationId::new(1),
            message_id: 42,
            is_bot: false,
        }
    }

    #[test]
    fn history_is_bounded_and_evicts_the_oldest() {
        let context = ConversationContext::new(3);
        for i in 0..5 {
            context.append(user_record("Alice", &format!("msg {i}")));
        }
        assert_eq!(context.len(), 3);
        let messages = context.completion_messages();
        assert_eq!(messages[0].content, "Alice: msg 2");
        assert_eq!(messages[2].content, "Alice: msg 4");
    }

    #[test]
    fn completion_messages_attribute_users_and_keep_bot_voice() {
        let context = ConversationContext::new(10);
        context.append(user_record("Alice", "Hi there"));
        context.append(ConversationRecord::bot(
            "Parley",
            ConversationId::new(1),
            "Hello!",
        ));

        let messages = context.completion_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "Alice: Hi there");
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "Hello!");
    }

    #[test]
    fn staleness_is_strictly_greater_than_the_threshold() {
        let now = Utc::now();
        let max_age = Duration::from_secs(1800);
        let exactly = now - ChronoDuration::seconds(1800);
        let over = now - ChronoDuration::seconds(1801);
        assert!(!is_stale_at(exactly, now, max_age));
        assert!(is_stale_at(over, now, max_age));
        assert!(!is_stale_at(now, now, max_age));
    }

    #[test]
    fn append_refreshes_the_activity_clock() {
        let context = ConversationContext::new(10);
        context.set_last_activity(Utc::now() - ChronoDuration::hours(2));
        assert!(context.is_stale(Duration::from_secs(1800)));

        context.append(user_record("Alice", "back again"));
        assert!(!context.is_stale(Duration::from_secs(1800)));
    }

    #[test]
    fn in_progress_flag_round_trips() {
        let context = ConversationContext::new(10);
        assert!(!context.in_progress());
        context.set_in_progress(true);
        assert!(context.in_progress());
        context.set_in_progress(false);
        assert!(!context.in_progress());
    }
}
