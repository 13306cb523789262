//! 单个助手的对话会话。
//!
//! 会话独占状态机；传输任务只通过收件箱把带轮次编号的信号送回来，
//! 轮次不等于当前轮的信号直接丢弃。

use crate::commands::config::find_assistant;
use crate::commands::llm::{run_turn, ChatClient, Inbound, TurnBackend, TurnRequest, TurnSignal};
use crate::error::{ChatError, Result};
use crate::models::{AppConfig, Assistant, Message};
use crate::reducer::{Conversation, Effect, WELCOME_ID};
use crate::store::ConversationStore;
use crate::{ActiveStream, StreamManager};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct ChatSession {
    assistant: Assistant,
    backend: TurnBackend,
    welcome: String,
    client: ChatClient,
    store: ConversationStore,
    streams: StreamManager,
    conversation: Conversation,
    inbox_tx: UnboundedSender<Inbound>,
    inbox: UnboundedReceiver<Inbound>,
    active_turn: Option<u64>,
}

impl ChatSession {
    /// 挂载会话：有存档就恢复，否则只显示欢迎语。
    pub fn open(
        config: &AppConfig,
        assistant_id: &str,
        client: ChatClient,
        store: ConversationStore,
        streams: StreamManager,
    ) -> Result<Self> {
        let assistant = find_assistant(config, assistant_id)?.clone();
        let welcome = config.welcome_for(&assistant);

        let conversation = match store.load(&assistant.id) {
            Some(stored) if !stored.transcript.is_empty() => Conversation::restore(stored),
            // 只存下了线程 ID（例如首轮中途退出）
            Some(stored) => Conversation::new(
                stored.thread_id,
                vec![Message::assistant(WELCOME_ID, welcome.clone())],
            ),
            None => Conversation::welcome(welcome.clone()),
        };
        info!(
            target: "aio_chat::session",
            "opened {} ({} messages, thread {:?})",
            assistant.id,
            conversation.transcript().len(),
            conversation.thread_id()
        );

        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        Ok(Self {
            backend: TurnBackend::resolve(&assistant, config),
            assistant,
            welcome,
            client,
            store,
            streams,
            conversation,
            inbox_tx,
            inbox,
            active_turn: None,
        })
    }

    pub fn assistant(&self) -> &Assistant {
        &self.assistant
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// 当前是否有一轮在进行（输入框应锁定）。
    pub fn is_busy(&self) -> bool {
        self.active_turn.is_some()
    }

    /// 发送一条消息，开始新的一轮。
    ///
    /// 进行中的一轮会被静默取消。必须在 tokio 运行时内调用。
    pub fn submit(&mut self, text: &str, attachment: Option<String>) -> Result<u64> {
        if text.trim().is_empty() && attachment.is_none() {
            return Err(ChatError::EmptyInput);
        }

        if self.interrupt() {
            debug!(target: "aio_chat::session", "previous turn superseded");
        }

        let turn = self.streams.next_turn();
        self.conversation.begin_turn(text, attachment.clone());

        let request = TurnRequest {
            assistant_id: self.assistant.id.clone(),
            message: text.to_string(),
            image_base64: attachment,
            thread_id: self.conversation.thread_id().map(str::to_owned),
        };
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_turn(
            self.client.clone(),
            self.backend.clone(),
            request,
            cancel.clone(),
            self.inbox_tx.clone(),
            turn,
        ));
        self.streams.start(
            &self.assistant.id,
            ActiveStream {
                turn,
                cancel,
                handle,
            },
        );
        self.active_turn = Some(turn);

        info!(target: "aio_chat::session", "{}: turn {} started", self.assistant.id, turn);
        Ok(turn)
    }

    /// 等待当前轮的下一批效果。没有进行中的轮次时返回 `None`。
    ///
    /// 可以放在 `tokio::select!` 里使用。
    pub async fn next_effects(&mut self) -> Option<Vec<Effect>> {
        let active = self.active_turn?;

        while let Some(Inbound { turn, signal }) = self.inbox.recv().await {
            if turn != active {
                debug!(target: "aio_chat::session", "dropping signal from stale turn {}", turn);
                continue;
            }

            let (effects, ended) = match signal {
                TurnSignal::Event(event) => {
                    let effects = self.conversation.apply(event);
                    let ended = effects.contains(&Effect::TurnFinished);
                    (effects, ended)
                }
                TurnSignal::Failed(e) if e.is_cancelled() => continue,
                TurnSignal::Failed(e) => (self.conversation.fail_turn(e.to_string()), true),
                TurnSignal::Closed => (self.conversation.close_stream(), true),
            };

            self.handle_effects(&effects);
            if ended {
                self.active_turn = None;
                self.streams.finish(&self.assistant.id, turn);
            }
            return Some(effects);
        }
        None
    }

    /// 一直驱动到本轮结束，返回期间产生的全部效果。
    pub async fn run_until_idle(&mut self) -> Vec<Effect> {
        let mut all = Vec::new();
        while let Some(effects) = self.next_effects().await {
            all.extend(effects);
        }
        all
    }

    /// 用户主动停止：丢弃占位消息，不报错。
    pub fn stop(&mut self) -> bool {
        let stopped = self.interrupt();
        if stopped {
            self.persist();
        }
        stopped
    }

    /// 清空存档并回到欢迎语。
    pub fn reset(&mut self) {
        self.interrupt();
        self.store.clear(&self.assistant.id);
        self.conversation = Conversation::welcome(self.welcome.clone());
        info!(target: "aio_chat::session", "{}: conversation reset", self.assistant.id);
    }

    fn interrupt(&mut self) -> bool {
        let Some(turn) = self.active_turn.take() else {
            return false;
        };
        self.streams.finish(&self.assistant.id, turn);
        self.conversation.cancel_turn();
        true
    }

    fn handle_effects(&self, effects: &[Effect]) {
        for effect in effects {
            if let Effect::ThreadEstablished(id) = effect {
                self.store.save_thread_id(&self.assistant.id, id);
            }
        }

        let settled = effects
            .iter()
            .any(|e| matches!(e, Effect::MessageSettled { .. } | Effect::TurnFinished));
        if settled {
            self.persist();
        }
    }

    fn persist(&self) {
        if self.conversation.is_welcome_only() {
            return;
        }
        if let Some(snapshot) = self.conversation.snapshot() {
            self.store.save(&self.assistant.id, &snapshot);
        }
    }
}

impl Drop for ChatSession {
    // 离开会话：取消传输，不产生错误
    fn drop(&mut self) {
        if let Some(turn) = self.active_turn.take() {
            self.streams.finish(&self.assistant.id, turn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BackendKind, Role, StoredConversation};
    use crate::sse::ServerEvent;
    use pretty_assertions::assert_eq;

    // 本机 9 号端口（discard）通常没有监听，连接会被立即拒绝
    const DEAD_URL: &str = "http://127.0.0.1:9/api/chat";

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.api_url = DEAD_URL.into();
        config
    }

    fn open(store: &ConversationStore, streams: &StreamManager) -> ChatSession {
        let config = config();
        let client = ChatClient::new(&config).unwrap();
        ChatSession::open(&config, "general-assistant", client, store.clone(), streams.clone()).unwrap()
    }

    fn inject(session: &ChatSession, turn: u64, event: ServerEvent) {
        session
            .inbox_tx
            .send(Inbound {
                turn,
                signal: TurnSignal::Event(event),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn fresh_session_shows_welcome_only() {
        let session = open(&ConversationStore::in_memory(), &StreamManager::new());
        let transcript = session.conversation().transcript();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].id, WELCOME_ID);
        assert_eq!(
            transcript[0].content,
            "Hello! I'm General Assistant. How can I help you today?"
        );
        assert!(!session.is_busy());
    }

    #[tokio::test]
    async fn unknown_assistant_is_rejected() {
        let config = config();
        let client = ChatClient::new(&config).unwrap();
        let r = ChatSession::open(&config, "nope", client, ConversationStore::in_memory(), StreamManager::new());
        assert!(matches!(r, Err(ChatError::UnknownAssistant(_))));
    }

    #[tokio::test]
    async fn restores_stored_conversation() {
        let store = ConversationStore::in_memory();
        store.save(
            "general-assistant",
            &StoredConversation {
                thread_id: Some("thread_old".into()),
                transcript: vec![Message::user("hi", None), Message::assistant("msg_1", "hello")],
            },
        );
        let session = open(&store, &StreamManager::new());
        assert_eq!(session.conversation().thread_id(), Some("thread_old"));
        assert_eq!(session.conversation().transcript().len(), 2);

        store.clear("general-assistant");
        store.save_thread_id("general-assistant", "thread_only");
        let session = open(&store, &StreamManager::new());
        assert_eq!(session.conversation().thread_id(), Some("thread_only"));
        assert!(session.conversation().is_welcome_only());
    }

    #[tokio::test]
    async fn empty_input_is_refused() {
        let mut session = open(&ConversationStore::in_memory(), &StreamManager::new());
        assert!(matches!(session.submit("   ", None), Err(ChatError::EmptyInput)));
        assert_eq!(session.conversation().transcript().len(), 1);
        assert!(!session.is_busy());
        // 只有图片也可以发送
        assert!(session.submit("", Some("data:image/png;base64,AA".into())).is_ok());
    }

    #[tokio::test]
    async fn unreachable_backend_surfaces_one_error() {
        let store = ConversationStore::in_memory();
        let mut session = open(&store, &StreamManager::new());
        session.submit("hello?", None).unwrap();

        let effects = session.run_until_idle().await;
        let errors = effects.iter().filter(|e| matches!(e, Effect::Error(_))).count();
        assert_eq!(errors, 1);
        assert_eq!(effects.last(), Some(&Effect::TurnFinished));
        assert!(!session.is_busy());

        // 用户消息保留并已落盘，占位消息被移除
        let transcript = session.conversation().transcript();
        assert_eq!(transcript.last().unwrap().role, Role::User);
        let saved = store.load("general-assistant").unwrap();
        assert_eq!(saved.transcript.len(), 2);
    }

    #[tokio::test]
    async fn stale_turn_signals_are_dropped() {
        let mut session = open(&ConversationStore::in_memory(), &StreamManager::new());
        let first = session.submit("first", None).unwrap();
        let second = session.submit("second", None).unwrap();

        inject(&session, first, ServerEvent::delta("ghost"));
        inject(&session, second, ServerEvent::delta("real"));

        let effects = session.next_effects().await.unwrap();
        assert!(matches!(&effects[..], [Effect::Appended { text, .. }] if text == "real"));

        let streaming: Vec<_> = session
            .conversation()
            .transcript()
            .iter()
            .filter(|m| m.streaming)
            .collect();
        assert_eq!(streaming.len(), 1);
        assert_eq!(streaming[0].content, "real");
    }

    #[tokio::test]
    async fn thread_id_is_saved_before_the_turn_ends() {
        let store = ConversationStore::in_memory();
        let mut session = open(&store, &StreamManager::new());
        let turn = session.submit("hi", None).unwrap();
        inject(&session, turn, ServerEvent::thread_info("thread_new"));

        let effects = session.next_effects().await.unwrap();
        assert!(effects.contains(&Effect::ThreadEstablished("thread_new".into())));
        assert!(session.is_busy());

        let saved = store.load("general-assistant").unwrap();
        assert_eq!(saved.thread_id.as_deref(), Some("thread_new"));
        // 记录仍在流式状态，还没有保存
        assert!(saved.transcript.is_empty());
    }

    #[tokio::test]
    async fn stop_and_reset() {
        let store = ConversationStore::in_memory();
        let streams = StreamManager::new();
        let mut session = open(&store, &streams);

        session.submit("hi", None).unwrap();
        assert!(streams.is_active("general-assistant"));
        assert!(session.stop());
        assert!(!streams.is_active("general-assistant"));
        assert!(!session.is_busy());
        assert_eq!(session.conversation().last_error(), None);
        assert!(!session.conversation().is_streaming());
        assert!(session.next_effects().await.is_none());
        assert_eq!(store.load("general-assistant").unwrap().transcript.len(), 2);

        session.reset();
        assert!(session.conversation().is_welcome_only());
        assert!(store.load("general-assistant").is_none());
        assert!(!session.stop());
    }

    #[tokio::test]
    async fn sessions_sharing_a_registry_do_not_stop_each_other() {
        let streams = StreamManager::new();
        let store = ConversationStore::in_memory();
        let mut first = open(&store, &streams);
        let mut second = open(&store, &streams);

        let a = first.submit("from first", None).unwrap();
        let b = second.submit("from second", None).unwrap();
        assert_ne!(a, b);

        // 第一个会话收尾时不能注销第二个会话的流
        first.stop();
        assert!(streams.is_active("general-assistant"));
        assert!(second.is_busy());
        second.stop();
        assert!(!streams.is_active("general-assistant"));
    }

    #[tokio::test]
    async fn dropping_the_session_cancels_its_stream() {
        let streams = StreamManager::new();
        let mut session = open(&ConversationStore::in_memory(), &streams);
        session.submit("hi", None).unwrap();
        drop(session);
        assert!(!streams.is_active("general-assistant"));
    }

    #[test]
    fn responses_assistant_resolves_to_responses_backend() {
        let config = config();
        let asst = config.find_assistant("responses").unwrap();
        assert!(matches!(asst.backend, BackendKind::Responses { .. }));
        assert!(matches!(TurnBackend::resolve(asst, &config), TurnBackend::Responses { .. }));
    }
}
