//! Per-conversation message processing.
//!
//! Each conversation owns an unbounded inbound queue, bounded history, and at
//! most one live drainer task. Submitters enqueue a record, attach to the
//! drainer's outcome, and wait with a timeout; the drainer batches queued
//! records into history and asks the completion client for one reply.

use crate::context::ConversationContext;
use dashmap::DashMap;
use parley_channels::{ConversationId, ConversationRecord};
use parley_llm::{ChatMessage, Completer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::AbortHandle;

const BATCH_COLLECT_WAIT: Duration = Duration::from_millis(100);

const TIMEOUT_REPLY: &str = "Sorry, I'm taking too long to respond. Please try again!";
const PROCESSING_ERROR_REPLY: &str =
    "I encountered an error processing your message. Please try again!";
const NO_COMPLETION_REPLY: &str =
    "Sorry, I'm having trouble generating a response right now. Please try again!";
const GENERATION_ERROR_REPLY: &str = "Oops! Something went wrong. Please try again later.";

// Always appended to the system prompt, configured or default; replies cross
// platforms with different markup dialects.
const FORMATTING_GUIDANCE: &str = "\n\nIMPORTANT: Use only basic markdown formatting that works \
    across platforms: - Use *bold* for emphasis (single asterisks work on both platforms) \
    - Use `code` for inline code or technical terms - Use bullet points with - or • for lists \
    - Use [text](url) for links - Avoid complex formatting, special characters, or \
    platform-specific syntax";

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub max_history: usize,
    pub batch_size: usize,
    pub processing_timeout: Duration,
    pub rate_limit_delay: Duration,
    pub max_response_chars: usize,
    pub max_tokens: u32,
    pub temperature: f32,
    pub system_prompt: String,
    pub bot_name: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_history: 20,
            batch_size: 5,
            processing_timeout: Duration::from_secs(25),
            rate_limit_delay: Duration::from_millis(500),
            max_response_chars: 2000,
            max_tokens: 500,
            temperature: 0.7,
            system_prompt: "You are a helpful chat bot.".to_string(),
            bot_name: "Parley".to_string(),
        }
    }
}

/// One conversation's moving parts. The queue receiver doubles as the drain
/// gate: whoever holds its lock is the only live drainer.
struct Lane {
    queue_tx: mpsc::UnboundedSender<ConversationRecord>,
    queue_rx: Arc<Mutex<mpsc::UnboundedReceiver<ConversationRecord>>>,
    context: Arc<ConversationContext>,
    drainer: Option<DrainerHandle>,
}

impl Lane {
    fn new(max_history: usize) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            queue_tx,
            queue_rx: Arc::new(Mutex::new(queue_rx)),
            context: Arc::new(ConversationContext::new(max_history)),
            drainer: None,
        }
    }
}

/// Outcome channel plus abort handle for one drainer task. The watch value
/// flips from `None` to `Some(reply)` exactly once, so submitters that
/// attach after completion still observe the reply.
#[derive(Clone)]
struct DrainerHandle {
    outcome: watch::Receiver<Option<String>>,
    abort: AbortHandle,
}

impl DrainerHandle {
    fn is_live(&self) -> bool {
        !self.abort.is_finished()
    }
}

pub struct MessageProcessor {
    completer: Arc<dyn Completer>,
    cfg: Arc<ProcessorConfig>,
    lanes: DashMap<ConversationId, Lane>,
}

impl MessageProcessor {
    pub fn new(completer: Arc<dyn Completer>, cfg: ProcessorConfig) -> Self {
        Self {
            completer,
            cfg: Arc::new(cfg),
            lanes: DashMap::new(),
        }
    }

    /// Enqueue a record and wait for the drainer that will cover it.
    ///
    /// Infallible by contract: every failure mode maps to a fixed
    /// user-facing string. A timeout does NOT cancel the drainer; it keeps
    /// running and later submitters may still attach to its outcome.
    pub async fn submit(&self, record: ConversationRecord) -> String {
        let conversation_id = record.conversation_id;
        let handle = self.enqueue(record);

        let mut outcome = handle.outcome;
        let waited =
            tokio::time::timeout(self.cfg.processing_timeout, outcome.wait_for(|v| v.is_some()))
                .await;
        match waited {
            Ok(Ok(reply)) => reply.clone().unwrap_or_default(),
            Ok(Err(_)) => {
                tracing::error!(
                    conversation_id = %conversation_id,
                    "drainer ended without an outcome"
                );
                PROCESSING_ERROR_REPLY.to_string()
            }
            Err(_) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    timeout = ?self.cfg.processing_timeout,
                    "processing timed out; drainer left running"
                );
                TIMEOUT_REPLY.to_string()
            }
        }
    }

    /// Push the record and return the handle to the drainer covering it,
    /// spawning one when the conversation has no live drainer.
    fn enqueue(&self, record: ConversationRecord) -> DrainerHandle {
        let mut lane = self
            .lanes
            .entry(record.conversation_id)
            .or_insert_with(|| Lane::new(self.cfg.max_history));

        // The receiver lives in this lane, so the send cannot fail while
        // the entry exists.
        let _ = lane.queue_tx.send(record);

        match lane.drainer.as_ref().filter(|handle| handle.is_live()) {
            Some(handle) => handle.clone(),
            None => {
                let handle = self.spawn_drainer(&lane);
                lane.drainer = Some(handle.clone());
                handle
            }
        }
    }

    fn spawn_drainer(&self, lane: &Lane) -> DrainerHandle {
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let completer = self.completer.clone();
        let cfg = self.cfg.clone();
        let queue_rx = lane.queue_rx.clone();
        let context = lane.context.clone();

        let task = tokio::spawn(async move {
            let reply = drain_conversation(completer, cfg, queue_rx, context).await;
            // Send fails only when every submitter stopped listening.
            let _ = outcome_tx.send(Some(reply));
        });

        DrainerHandle {
            outcome: outcome_rx,
            abort: task.abort_handle(),
        }
    }

    /// Evict every stale conversation, aborting in-flight drainers
    /// best-effort. Returns the eviction count.
    pub fn sweep_stale(&self, max_age: Duration) -> usize {
        let mut evicted = 0;
        self.lanes.retain(|conversation_id, lane| {
            if !lane.context.is_stale(max_age) {
                return true;
            }
            if let Some(handle) = lane.drainer.as_ref() {
                handle.abort.abort();
            }
            evicted += 1;
            tracing::info!(conversation_id = %conversation_id, "evicted stale conversation");
            false
        });
        evicted
    }

    /// Drop one conversation entirely (queue, history, drainer).
    pub fn clear_conversation(&self, conversation_id: ConversationId) -> bool {
        match self.lanes.remove(&conversation_id) {
            Some((_, lane)) => {
                if let Some(handle) = lane.drainer.as_ref() {
                    handle.abort.abort();
                }
                tracing::info!(conversation_id = %conversation_id, "cleared conversation");
                true
            }
            None => false,
        }
    }

    pub fn active_conversations(&self) -> usize {
        self.lanes.len()
    }

    pub fn context(&self, conversation_id: ConversationId) -> Option<Arc<ConversationContext>> {
        self.lanes
            .get(&conversation_id)
            .map(|lane| lane.context.clone())
    }
}

/// Drain the queue in batches until it is empty or a reply is produced.
/// Holding the receiver lock for the whole run is what makes the drainer
/// exclusive per conversation.
#[tracing::instrument(level = "debug", skip_all)]
async fn drain_conversation(
    completer: Arc<dyn Completer>,
    cfg: Arc<ProcessorConfig>,
    queue_rx: Arc<Mutex<mpsc::UnboundedReceiver<ConversationRecord>>>,
    context: Arc<ConversationContext>,
) -> String {
    let mut queue = queue_rx.lock().await;

    loop {
        let batch = collect_batch(&mut queue, cfg.batch_size).await;
        if batch.is_empty() {
            return String::new();
        }

        // Most recent human record wins; leftover queued records wait for
        // the next drainer invocation once a reply goes out.
        let trigger = batch.iter().rev().find(|record| !record.is_bot).cloned();
        for record in batch {
            context.append(record);
        }

        if let Some(trigger) = trigger {
            let reply = generate_reply(completer.as_ref(), &cfg, &context, &trigger).await;
            if !reply.is_empty() {
                return reply;
            }
        }

        tokio::time::sleep(cfg.rate_limit_delay).await;
        if queue.is_empty() {
            return String::new();
        }
    }
}

/// Pull up to `batch_size` records, waiting at most `BATCH_COLLECT_WAIT`
/// per item; an empty wait ends the batch early.
async fn collect_batch(
    queue: &mut mpsc::UnboundedReceiver<ConversationRecord>,
    batch_size: usize,
) -> Vec<ConversationRecord> {
    let mut batch = Vec::with_capacity(batch_size);
    while batch.len() < batch_size {
        match tokio::time::timeout(BATCH_COLLECT_WAIT, queue.recv()).await {
            Ok(Some(record)) => batch.push(record),
            Ok(None) | Err(_) => break,
        }
    }
    batch
}

#[tracing::instrument(level = "info", skip_all, fields(author = %trigger.author))]
async fn generate_reply(
    completer: &dyn Completer,
    cfg: &ProcessorConfig,
    context: &ConversationContext,
    trigger: &ConversationRecord,
) -> String {
    let _guard = InProgressGuard::set(context);

    let mut messages = Vec::with_capacity(context.len() + 1);
    messages.push(ChatMessage::system(format!(
        "{}{FORMATTING_GUIDANCE}",
        cfg.system_prompt
    )));
    messages.extend(context.completion_messages());

    match completer
        .generate(&messages, cfg.max_tokens, cfg.temperature)
        .await
    {
        Ok(Some(text)) => {
            let text = truncate_reply(text, cfg.max_response_chars);
            context.append(ConversationRecord::bot(
                cfg.bot_name.as_str(),
                trigger.conversation_id,
                text.as_str(),
            ));
            text
        }
        Ok(None) => NO_COMPLETION_REPLY.to_string(),
        Err(error) => {
            tracing::error!(%error, "completion call failed");
            GENERATION_ERROR_REPLY.to_string()
        }
    }
}

/// Clears `in_progress` on every exit path, including drainer aborts.
struct InProgressGuard<'a> {
    context: &'a ConversationContext,
}

impl<'a> InProgressGuard<'a> {
    fn set(context: &'a ConversationContext) -> Self {
        context.set_in_progress(true);
        Self { context }
    }
}

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.context.set_in_progress(false);
    }
}

/// Cap the reply at `max_chars` characters; an over-long reply comes back
/// exactly `max_chars` long ending in `...`.
fn truncate_reply(text: String, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text;
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{kept}...")
}

#[cfg(test)]
mod tests {
    use super::{
        GENERATION_ERROR_REPLY, MessageProcessor, NO_COMPLETION_REPLY, PROCESSING_ERROR_REPLY,
        ProcessorConfig, TIMEOUT_REPLY, truncate_reply,
    };
    use chrono::{Duration as ChronoDuration, Utc};
    use parley_channels::{ConversationId, ConversationRecord};
    use parley_llm::{ChatMessage, Completer, CompletionError, Role};
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    enum MockBehavior {
        Reply(String),
        Empty,
        Null,
        Fail,
        Slow(Duration, String),
    }

    struct MockCompleter {
        behavior: MockBehavior,
        calls: AtomicUsize,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
        last_messages: StdMutex<Vec<ChatMessage>>,
    }

    impl MockCompleter {
        fn new(behavior: MockBehavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                calls: AtomicUsize::new(0),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
                last_messages: StdMutex::new(Vec::new()),
            })
        }

        fn replying(text: &str) -> Arc<Self> {
            Self::new(MockBehavior::Reply(text.to_string()))
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Completer for MockCompleter {
        async fn generate(
            &self,
            messages: &[ChatMessage],
            _max_tokens: u32,
            _temperature: f32,
        ) -> parley_llm::Result<Option<String>> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_messages.lock().unwrap() = messages.to_vec();

            let result = match &self.behavior {
                MockBehavior::Reply(text) => Ok(Some(text.clone())),
                MockBehavior::Empty => Ok(Some(String::new())),
                MockBehavior::Null => Ok(None),
                MockBehavior::Fail => Err(CompletionError::NotConnected),
                MockBehavior::Slow(delay, text) => {
                    tokio::time::sleep(*delay).await;
                    Ok(Some(text.clone()))
                }
            };
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn fast_config() -> ProcessorConfig {
        ProcessorConfig {
            rate_limit_delay: Duration::from_millis(10),
            system_prompt: "test prompt".to_string(),
            ..ProcessorConfig::default()
        }
    }

    fn user_record(conversation: i64, author: &str, content: &str) -> ConversationRecord {
        ConversationRecord {
            content: content.to_string(),
            author: author.to_string(),
            timestamp: Utc::now(),
            conversation_id: ConversationId::new(conversation),
            message_id: 1,
            is_bot: false,
        }
    }

    #[tokio::test]
    async fn submit_returns_the_reply_and_appends_it_to_history() {
        let mock = MockCompleter::replying("Hello!");
        let processor = MessageProcessor::new(mock.clone(), fast_config());

        let reply = processor.submit(user_record(1, "Alice", "hi there")).await;
        assert_eq!(reply, "Hello!");

        let sent = mock.last_messages.lock().unwrap().clone();
        assert_eq!(sent[0].role, Role::System);
        assert!(sent[0].content.starts_with("test prompt"));
        assert_eq!(sent[1].role, Role::User);
        assert_eq!(sent[1].content, "Alice: hi there");

        let context = processor.context(ConversationId::new(1)).expect("lane");
        let history = context.completion_messages();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].content, "Hello!");
    }

    #[tokio::test]
    async fn system_message_carries_the_formatting_guidance() {
        let mock = MockCompleter::replying("ok");
        let processor = MessageProcessor::new(mock.clone(), fast_config());

        processor.submit(user_record(14, "Alice", "hi")).await;

        let sent = mock.last_messages.lock().unwrap().clone();
        assert_eq!(sent[0].role, Role::System);
        assert!(sent[0].content.starts_with("test prompt\n\nIMPORTANT:"));
        assert!(
            sent[0]
                .content
                .contains("basic markdown formatting that works across platforms")
        );
        assert!(sent[0].content.ends_with("platform-specific syntax"));
    }

    #[tokio::test]
    async fn concurrent_submits_share_one_drainer_and_one_reply() {
        let mock = MockCompleter::new(MockBehavior::Slow(
            Duration::from_millis(50),
            "shared".to_string(),
        ));
        let processor = MessageProcessor::new(mock.clone(), fast_config());

        let (first, second) = tokio::join!(
            processor.submit(user_record(2, "Alice", "one")),
            processor.submit(user_record(2, "Bob", "two")),
        );
        assert_eq!(first, "shared");
        assert_eq!(second, "shared");
        assert_eq!(mock.calls(), 1, "both records fit one batch");
        assert_eq!(mock.max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn batches_cap_at_batch_size_and_leftovers_wait_for_the_next_drainer() {
        let mock = MockCompleter::replying("ok");
        let processor = Arc::new(MessageProcessor::new(mock.clone(), fast_config()));

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..7 {
            let processor = processor.clone();
            tasks.spawn(async move {
                processor
                    .submit(user_record(3, "Alice", &format!("msg {i}")))
                    .await
            });
        }
        while let Some(reply) = tasks.join_next().await {
            assert_eq!(reply.expect("submit task"), "ok");
        }

        let context = processor.context(ConversationId::new(3)).expect("lane");
        assert_eq!(mock.calls(), 1);
        assert_eq!(context.len(), 6, "five batched records plus the reply");

        // The two leftover records ride along with the next submit.
        let reply = processor.submit(user_record(3, "Alice", "msg 7")).await;
        assert_eq!(reply, "ok");
        assert_eq!(mock.calls(), 2);
        assert_eq!(context.len(), 10);
    }

    #[tokio::test]
    async fn bot_records_never_trigger_generation() {
        let mock = MockCompleter::replying("should not appear");
        let processor = MessageProcessor::new(mock.clone(), fast_config());

        let reply = processor
            .submit(ConversationRecord::bot(
                "OtherBot",
                ConversationId::new(4),
                "automated notice",
            ))
            .await;
        assert_eq!(reply, "");
        assert_eq!(mock.calls(), 0);

        let context = processor.context(ConversationId::new(4)).expect("lane");
        assert_eq!(context.len(), 1, "the record still lands in history");
    }

    #[tokio::test]
    async fn long_replies_truncate_to_the_configured_cap() {
        let mock = MockCompleter::replying(&"x".repeat(3000));
        let cfg = ProcessorConfig {
            max_response_chars: 100,
            ..fast_config()
        };
        let processor = MessageProcessor::new(mock, cfg);

        let reply = processor.submit(user_record(5, "Alice", "write a lot")).await;
        assert_eq!(reply.chars().count(), 100);
        assert!(reply.ends_with("..."));
    }

    #[tokio::test]
    async fn null_completion_maps_to_fallback_without_history_append() {
        let mock = MockCompleter::new(MockBehavior::Null);
        let processor = MessageProcessor::new(mock, fast_config());

        let reply = processor.submit(user_record(6, "Alice", "hi")).await;
        assert_eq!(reply, NO_COMPLETION_REPLY);

        let context = processor.context(ConversationId::new(6)).expect("lane");
        assert_eq!(context.len(), 1, "fallbacks are not recorded as bot replies");
        assert!(!context.in_progress());
    }

    #[tokio::test]
    async fn completion_error_maps_to_fallback_without_history_append() {
        let mock = MockCompleter::new(MockBehavior::Fail);
        let processor = MessageProcessor::new(mock, fast_config());

        let reply = processor.submit(user_record(7, "Alice", "hi")).await;
        assert_eq!(reply, GENERATION_ERROR_REPLY);

        let context = processor.context(ConversationId::new(7)).expect("lane");
        assert_eq!(context.len(), 1);
        assert!(!context.in_progress());
    }

    #[tokio::test]
    async fn empty_completion_is_recorded_and_submit_returns_empty() {
        let mock = MockCompleter::new(MockBehavior::Empty);
        let processor = MessageProcessor::new(mock, fast_config());

        let reply = processor.submit(user_record(8, "Alice", "hi")).await;
        assert_eq!(reply, "");

        let context = processor.context(ConversationId::new(8)).expect("lane");
        assert_eq!(context.len(), 2, "an empty reply still becomes a bot record");
    }

    #[tokio::test]
    async fn submit_times_out_while_the_drainer_keeps_running() {
        let mock = MockCompleter::new(MockBehavior::Slow(
            Duration::from_millis(150),
            "late".to_string(),
        ));
        let cfg = ProcessorConfig {
            processing_timeout: Duration::from_millis(50),
            ..fast_config()
        };
        let processor = MessageProcessor::new(mock, cfg);

        let reply = processor.submit(user_record(9, "Alice", "hi")).await;
        assert_eq!(reply, TIMEOUT_REPLY);

        // Not cancelled: the drainer finishes in the background and records
        // its reply.
        tokio::time::sleep(Duration::from_millis(350)).await;
        let context = processor.context(ConversationId::new(9)).expect("lane");
        assert_eq!(context.len(), 2);
        let history = context.completion_messages();
        assert_eq!(history[1].content, "late");
    }

    #[tokio::test]
    async fn aborted_drainer_maps_to_the_processing_error_fallback() {
        let mock = MockCompleter::new(MockBehavior::Slow(
            Duration::from_millis(500),
            "never seen".to_string(),
        ));
        let processor = Arc::new(MessageProcessor::new(mock, fast_config()));

        let submit = {
            let processor = processor.clone();
            tokio::spawn(async move { processor.submit(user_record(10, "Alice", "hi")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let context = processor.context(ConversationId::new(10)).expect("lane");
        assert!(context.in_progress(), "generation is mid-flight");

        assert!(processor.clear_conversation(ConversationId::new(10)));
        let reply = submit.await.expect("submit task");
        assert_eq!(reply, PROCESSING_ERROR_REPLY);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!context.in_progress(), "the guard resets on abort");
        assert!(processor.context(ConversationId::new(10)).is_none());
    }

    #[tokio::test]
    async fn sweep_evicts_only_stale_conversations() {
        let mock = MockCompleter::replying("ok");
        let processor = MessageProcessor::new(mock, fast_config());

        processor.submit(user_record(11, "Alice", "old")).await;
        processor.submit(user_record(12, "Bob", "fresh")).await;

        processor
            .context(ConversationId::new(11))
            .expect("lane")
            .set_last_activity(Utc::now() - ChronoDuration::hours(2));

        let evicted = processor.sweep_stale(Duration::from_secs(1800));
        assert_eq!(evicted, 1);
        assert_eq!(processor.active_conversations(), 1);
        assert!(processor.context(ConversationId::new(11)).is_none());
        assert!(processor.context(ConversationId::new(12)).is_some());
    }

    #[tokio::test]
    async fn clear_conversation_reports_whether_anything_was_dropped() {
        let mock = MockCompleter::replying("ok");
        let processor = MessageProcessor::new(mock, fast_config());

        processor.submit(user_record(13, "Alice", "hi")).await;
        assert!(processor.clear_conversation(ConversationId::new(13)));
        assert!(!processor.clear_conversation(ConversationId::new(13)));
        assert_eq!(processor.active_conversations(), 0);
    }

    #[test]
    fn truncation_is_exact_at_the_cap() {
        assert_eq!(truncate_reply("short".to_string(), 100), "short");
        assert_eq!(truncate_reply("x".repeat(100), 100).len(), 100);

        let truncated = truncate_reply("x".repeat(101), 100);
        assert_eq!(truncated.chars().count(), 100);
        assert!(truncated.ends_with("..."));

        let multibyte = truncate_reply("é".repeat(50), 10);
        assert_eq!(multibyte.chars().count(), 10);
        assert!(multibyte.ends_with("..."));
    }
}
