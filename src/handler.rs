//! Orchestrator: drives one inbound group message end to end through
//! buffer → policy → model → transport, then records the bot's own reply.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::task::JoinHandle;

use crate::buffer::{BufferedMessage, MessageBuffer};
use crate::config::BotConfig;
use crate::policy::{self, CooldownGate};
use crate::protocol::ResponseEngine;
use crate::telegram::{BotIdentity, ChatTransport, Message, User};

pub const FALLBACK_SENDER_NAME: &str = "Anonymous";

/// Display name for a chat participant: "first last", else first name, else
/// handle, else a generic placeholder.
pub fn display_name(user: &User) -> String {
    let first = user.first_name.as_deref().unwrap_or("").trim();
    let last = user.last_name.as_deref().unwrap_or("").trim();

    if !first.is_empty() && !last.is_empty() {
        return format!("{} {}", first, last);
    }
    if !first.is_empty() {
        return first.to_string();
    }
    if let Some(username) = user.username.as_deref().filter(|u| !u.trim().is_empty()) {
        return username.trim().to_string();
    }
    FALLBACK_SENDER_NAME.to_string()
}

pub struct GroupChatHandler {
    config: Arc<BotConfig>,
    identity: BotIdentity,
    buffer: Arc<MessageBuffer>,
    cooldown: Arc<CooldownGate>,
    engine: Arc<ResponseEngine>,
    transport: Arc<dyn ChatTransport>,
}

impl GroupChatHandler {
    pub fn new(
        config: Arc<BotConfig>,
        identity: BotIdentity,
        buffer: Arc<MessageBuffer>,
        cooldown: Arc<CooldownGate>,
        engine: Arc<ResponseEngine>,
        transport: Arc<dyn ChatTransport>,
    ) -> Self {
        Self {
            config,
            identity,
            buffer,
            cooldown,
            engine,
            transport,
        }
    }

    /// Process one inbound message. Every failure path ends in silence; this
    /// never propagates an error into the polling loop.
    pub async fn handle(&self, message: Message) {
        let Some(text) = message.text.as_deref().filter(|t| !t.trim().is_empty()) else {
            return;
        };
        if !message.chat.kind.is_multi_party() {
            return;
        }

        let chat_id = message.chat.id;

        if !self.chat_is_allowed(&message) {
            tracing::info!("Chat {} is not on the allow-list, leaving", chat_id);
            if let Err(e) = self.transport.leave_chat(chat_id).await {
                tracing::warn!("Failed to leave chat {}: {:#}", chat_id, e);
            }
            return;
        }

        // Never converse with ourselves.
        if message
            .from
            .as_ref()
            .is_some_and(|user| user.id == self.identity.id)
        {
            return;
        }

        let sender = message
            .from
            .as_ref()
            .map(display_name)
            .unwrap_or_else(|| FALLBACK_SENDER_NAME.to_string());

        let replied_to = message
            .reply_to_message
            .as_deref()
            .and_then(|m| m.from.as_ref());
        let is_reply_to_bot = replied_to.is_some_and(|user| user.id == self.identity.id);
        let reply_to = replied_to.map(|user| {
            if user.id == self.identity.id {
                self.config.bot_display_name.clone()
            } else {
                display_name(user)
            }
        });

        let mandatory = policy::is_mandatory(
            text,
            is_reply_to_bot,
            &self.identity.username,
            &self.config.address_keywords,
        );

        self.buffer
            .append(
                chat_id,
                BufferedMessage {
                    sender,
                    text: text.to_string(),
                    timestamp: Utc::now(),
                    mandatory,
                    reply_to,
                },
            )
            .await;

        if !mandatory {
            if self.cooldown.is_active(chat_id).await {
                tracing::debug!("Staying quiet in chat {} (cooldown)", chat_id);
                return;
            }
            if !policy::passes_reply_roll(self.config.reply_probability) {
                tracing::debug!("Staying quiet in chat {} (probability roll)", chat_id);
                return;
            }
        }

        let typing = self.spawn_typing(chat_id);
        let history = self.buffer.snapshot(chat_id).await;
        let decision = self.engine.ask(&history, mandatory).await;

        let should_reply = decision.should_reply;
        let Some(reply_text) = decision.text.filter(|_| should_reply) else {
            typing.abort();
            tracing::debug!("Model chose silence in chat {}", chat_id);
            return;
        };

        self.humanizing_delay().await;

        // The model call takes seconds; a concurrent interaction in this chat
        // may have replied meanwhile. Losing that race means discarding our
        // answer, not doubling up.
        if !mandatory && self.cooldown.is_active(chat_id).await {
            typing.abort();
            tracing::debug!("Dropping model reply for chat {} (cooldown re-entered)", chat_id);
            return;
        }

        typing.abort();
        tracing::info!("Replying in chat {}: {:?}", chat_id, reply_text);
        self.cooldown.stamp(chat_id).await;

        match self
            .transport
            .send_text(chat_id, &reply_text, Some(message.message_id))
            .await
        {
            Ok(()) => {
                // Record our own reply so later prompts carry it as context.
                self.buffer
                    .append(
                        chat_id,
                        BufferedMessage {
                            sender: self.config.bot_display_name.clone(),
                            text: reply_text,
                            timestamp: Utc::now(),
                            mandatory: false,
                            reply_to: None,
                        },
                    )
                    .await;
            }
            Err(e) => {
                tracing::error!("Failed to deliver reply to chat {}: {:#}", chat_id, e);
            }
        }
    }

    fn chat_is_allowed(&self, message: &Message) -> bool {
        if self.config.allowed_chat_usernames.is_empty() {
            return true;
        }
        message
            .chat
            .username
            .as_deref()
            .is_some_and(|username| {
                self.config
                    .allowed_chat_usernames
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(username))
            })
    }

    /// Keep the "typing..." indicator alive while we think. Telegram clears
    /// it after ~5s, so it is refreshed on a shorter period until aborted.
    fn spawn_typing(&self, chat_id: i64) -> JoinHandle<()> {
        let transport = Arc::clone(&self.transport);
        let period = Duration::from_secs(self.config.typing_refresh_secs.max(1));
        tokio::spawn(async move {
            loop {
                if let Err(e) = transport.send_typing(chat_id).await {
                    tracing::debug!("Typing indicator failed for chat {}: {:#}", chat_id, e);
                }
                tokio::time::sleep(period).await;
            }
        })
    }

    /// An instant answer reads as a machine. Wait a beat before sending.
    async fn humanizing_delay(&self) {
        let min = self.config.reply_delay_min_ms;
        let max = self.config.reply_delay_max_ms;
        let ms = if max > min {
            rand::rng().random_range(min..=max)
        } else {
            min
        };
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{GenerateOutput, ModelBackend};
    use crate::telegram::{Chat, ChatKind};
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::FixedOffset;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct SentReply {
        chat_id: i64,
        text: String,
        reply_to: Option<i64>,
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<SentReply>>,
        left: Mutex<Vec<i64>>,
        fail_sends: bool,
    }

    #[async_trait]
    impl ChatTransport for RecordingTransport {
        async fn send_text(
            &self,
            chat_id: i64,
            text: &str,
            reply_to_message_id: Option<i64>,
        ) -> Result<()> {
            if self.fail_sends {
                anyhow::bail!("network down")
            }
            self.sent.lock().unwrap().push(SentReply {
                chat_id,
                text: text.to_string(),
                reply_to: reply_to_message_id,
            });
            Ok(())
        }

        async fn send_typing(&self, _chat_id: i64) -> Result<()> {
            Ok(())
        }

        async fn leave_chat(&self, chat_id: i64) -> Result<()> {
            self.left.lock().unwrap().push(chat_id);
            Ok(())
        }
    }

    struct StubBackend {
        response: String,
        delay: Duration,
        calls: AtomicU32,
    }

    impl StubBackend {
        fn replying(text: &str) -> Self {
            Self {
                response: format!(r#"{{"reply": true, "text": "{}"}}"#, text),
                delay: Duration::ZERO,
                calls: AtomicU32::new(0),
            }
        }

        fn replying_after(text: &str, delay: Duration) -> Self {
            Self {
                delay,
                ..Self::replying(text)
            }
        }
    }

    #[async_trait]
    impl ModelBackend for StubBackend {
        async fn generate(&self, _system: &str, _user: &str) -> Result<GenerateOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(GenerateOutput {
                text: self.response.clone(),
                usage: None,
            })
        }
    }

    struct Fixture {
        handler: GroupChatHandler,
        buffer: Arc<MessageBuffer>,
        cooldown: Arc<CooldownGate>,
        transport: Arc<RecordingTransport>,
        backend: Arc<StubBackend>,
    }

    fn fixture(mut config: BotConfig, backend: StubBackend, transport: RecordingTransport) -> Fixture {
        // Tests never want the humanizing pause.
        config.reply_delay_min_ms = 0;
        config.reply_delay_max_ms = 0;
        let config = Arc::new(config);

        let buffer = Arc::new(MessageBuffer::new(
            config.buffer_capacity,
            config.max_message_age(),
        ));
        let cooldown = Arc::new(CooldownGate::new(config.cooldown()));
        let backend = Arc::new(backend);
        let transport = Arc::new(transport);
        let (usage_tx, _usage_rx) = flume::unbounded();
        let engine = Arc::new(ResponseEngine::new(
            backend.clone() as Arc<dyn ModelBackend>,
            config.system_prompt.clone(),
            config.max_attempts,
            config.retry_delay(),
            FixedOffset::east_opt(3 * 3600).unwrap(),
            usage_tx,
        ));

        let handler = GroupChatHandler::new(
            Arc::clone(&config),
            BotIdentity {
                id: 555,
                username: "grandpa".to_string(),
            },
            Arc::clone(&buffer),
            Arc::clone(&cooldown),
            engine,
            transport.clone() as Arc<dyn ChatTransport>,
        );

        Fixture {
            handler,
            buffer,
            cooldown,
            transport,
            backend,
        }
    }

    fn group_chat() -> Chat {
        Chat {
            id: -100123,
            kind: ChatKind::Supergroup,
            username: Some("somechat".to_string()),
        }
    }

    fn message_from(id: i64, first_name: &str, text: &str) -> Message {
        Message {
            message_id: 42,
            from: Some(User {
                id,
                first_name: Some(first_name.to_string()),
                last_name: None,
                username: None,
            }),
            chat: group_chat(),
            text: Some(text.to_string()),
            reply_to_message: None,
        }
    }

    #[tokio::test]
    async fn mention_bypasses_cooldown_and_sends_exactly_one_reply() {
        let fx = fixture(
            BotConfig {
                reply_probability: 0.0,
                ..BotConfig::default()
            },
            StubBackend::replying("Fine, thanks."),
            RecordingTransport::default(),
        );

        // An active cooldown must not matter for a mandatory trigger.
        fx.cooldown.stamp(-100123).await;

        fx.handler
            .handle(message_from(7, "Ann", "hey @grandpa how are you"))
            .await;

        let sent = fx.transport.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![SentReply {
                chat_id: -100123,
                text: "Fine, thanks.".to_string(),
                reply_to: Some(42),
            }]
        );

        let snapshot = fx.buffer.snapshot(-100123).await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].sender, "Ann");
        assert_eq!(snapshot[0].text, "hey @grandpa how are you");
        assert!(snapshot[0].mandatory);
        assert_eq!(snapshot[1].sender, "Gaffer");
        assert_eq!(snapshot[1].text, "Fine, thanks.");
        assert!(!snapshot[1].mandatory);
        assert!(snapshot[1].reply_to.is_none());
    }

    #[tokio::test]
    async fn cooldown_suppresses_ordinary_messages_before_the_model_call() {
        let fx = fixture(
            BotConfig {
                reply_probability: 1.0,
                ..BotConfig::default()
            },
            StubBackend::replying("hm"),
            RecordingTransport::default(),
        );

        fx.cooldown.stamp(-100123).await;
        fx.handler
            .handle(message_from(7, "Ann", "nothing special"))
            .await;

        assert_eq!(fx.backend.calls.load(Ordering::SeqCst), 0);
        assert!(fx.transport.sent.lock().unwrap().is_empty());
        // The message still lands in context for later prompts.
        assert_eq!(fx.buffer.snapshot(-100123).await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reply_stamped_during_model_call_wins_the_race() {
        let fx = fixture(
            BotConfig {
                reply_probability: 1.0,
                ..BotConfig::default()
            },
            StubBackend::replying_after("late answer", Duration::from_millis(100)),
            RecordingTransport::default(),
        );

        let handler = fx.handler;
        let cooldown = Arc::clone(&fx.cooldown);
        let task = tokio::spawn(async move {
            handler
                .handle(message_from(7, "Ann", "nothing special"))
                .await;
        });

        // A concurrent interaction replies while our model call is in flight.
        tokio::time::sleep(Duration::from_millis(30)).await;
        cooldown.stamp(-100123).await;

        task.await.unwrap();
        assert_eq!(fx.backend.calls.load(Ordering::SeqCst), 1);
        assert!(fx.transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn consecutive_ordinary_replies_respect_the_cooldown() {
        let fx = fixture(
            BotConfig {
                reply_probability: 1.0,
                ..BotConfig::default()
            },
            StubBackend::replying("first"),
            RecordingTransport::default(),
        );

        fx.handler
            .handle(message_from(7, "Ann", "nothing special"))
            .await;
        assert_eq!(fx.transport.sent.lock().unwrap().len(), 1);

        // The first dispatch stamped the cooldown; the next ordinary message
        // must not even reach the model.
        fx.handler
            .handle(message_from(8, "Bob", "more chatter"))
            .await;
        assert_eq!(fx.backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.transport.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn own_messages_are_ignored() {
        let fx = fixture(
            BotConfig::default(),
            StubBackend::replying("echo"),
            RecordingTransport::default(),
        );

        fx.handler
            .handle(message_from(555, "Gaffer", "talking to myself"))
            .await;

        assert!(fx.buffer.snapshot(-100123).await.is_empty());
        assert!(fx.transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn private_chats_are_ignored() {
        let fx = fixture(
            BotConfig::default(),
            StubBackend::replying("hi"),
            RecordingTransport::default(),
        );

        let mut message = message_from(7, "Ann", "hello @grandpa");
        message.chat = Chat {
            id: 7,
            kind: ChatKind::Private,
            username: None,
        };
        fx.handler.handle(message).await;

        assert_eq!(fx.backend.calls.load(Ordering::SeqCst), 0);
        assert!(fx.buffer.snapshot(7).await.is_empty());
    }

    #[tokio::test]
    async fn unlisted_chat_is_left() {
        let fx = fixture(
            BotConfig {
                allowed_chat_usernames: vec!["goodchat".to_string()],
                ..BotConfig::default()
            },
            StubBackend::replying("hi"),
            RecordingTransport::default(),
        );

        fx.handler
            .handle(message_from(7, "Ann", "hello @grandpa"))
            .await;

        assert_eq!(*fx.transport.left.lock().unwrap(), vec![-100123]);
        assert!(fx.buffer.snapshot(-100123).await.is_empty());
        assert_eq!(fx.backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reply_to_bot_is_mandatory_and_annotated() {
        let fx = fixture(
            BotConfig {
                reply_probability: 0.0,
                ..BotConfig::default()
            },
            StubBackend::replying("again?"),
            RecordingTransport::default(),
        );

        let mut message = message_from(7, "Ann", "and what about tea?");
        message.reply_to_message = Some(Box::new(Message {
            message_id: 41,
            from: Some(User {
                id: 555,
                first_name: Some("Gaffer".to_string()),
                last_name: None,
                username: Some("grandpa".to_string()),
            }),
            chat: group_chat(),
            text: Some("coffee is fine".to_string()),
            reply_to_message: None,
        }));

        fx.handler.handle(message).await;

        let snapshot = fx.buffer.snapshot(-100123).await;
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot[0].mandatory);
        // Reply target normalized to the persona's display name.
        assert_eq!(snapshot[0].reply_to.as_deref(), Some("Gaffer"));
        assert_eq!(fx.transport.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_send_leaves_buffer_without_the_bot_reply() {
        let fx = fixture(
            BotConfig {
                reply_probability: 0.0,
                ..BotConfig::default()
            },
            StubBackend::replying("lost words"),
            RecordingTransport {
                fail_sends: true,
                ..RecordingTransport::default()
            },
        );

        fx.handler
            .handle(message_from(7, "Ann", "hey @grandpa"))
            .await;

        let snapshot = fx.buffer.snapshot(-100123).await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].sender, "Ann");
    }

    #[test]
    fn display_name_falls_back_through_the_chain() {
        let full = User {
            id: 1,
            first_name: Some("Ann".to_string()),
            last_name: Some("Kim".to_string()),
            username: Some("ann_k".to_string()),
        };
        assert_eq!(display_name(&full), "Ann Kim");

        let first_only = User {
            last_name: None,
            ..full.clone()
        };
        assert_eq!(display_name(&first_only), "Ann");

        let handle_only = User {
            first_name: None,
            last_name: None,
            ..full.clone()
        };
        assert_eq!(display_name(&handle_only), "ann_k");

        let nobody = User {
            id: 1,
            first_name: None,
            last_name: None,
            username: None,
        };
        assert_eq!(display_name(&nobody), FALLBACK_SENDER_NAME);
    }
}
