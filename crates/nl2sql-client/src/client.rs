use std::sync::Arc;

use futures::StreamExt as _;
use tokio::sync::watch;
use tracing::{Instrument as _, debug, info_span, warn};

use crate::backend::ChatBackend;
use crate::clock::{Clock, SystemClock};
use crate::errors::ClientError;
use crate::event::DomainEvent;
use crate::model::{Conversation, ConversationId};
use crate::session::{ChatSession, SessionState, TurnOutcome, TurnTicket};

const DEFAULT_PAGE_SIZE: u32 = 50;

/// Drives conversations against a [`ChatBackend`].
///
/// Owns the selected conversation's [`ChatSession`] and publishes a snapshot
/// of its state after every transition. Turns are serialized by `&mut self`.
pub struct ChatClient {
    backend: Arc<dyn ChatBackend>,
    clock: Arc<dyn Clock>,
    session: ChatSession,
    conversations: Vec<Conversation>,
    page_size: u32,
    state_tx: watch::Sender<SessionState>,
}

impl ChatClient {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self::with_clock(backend, Arc::new(SystemClock))
    }

    pub fn with_clock(backend: Arc<dyn ChatBackend>, clock: Arc<dyn Clock>) -> Self {
        let session = ChatSession::detached();
        let (state_tx, _) = watch::channel(session.state().clone());
        Self {
            backend,
            clock,
            session,
            conversations: Vec::new(),
            page_size: DEFAULT_PAGE_SIZE,
            state_tx,
        }
    }

    /// Sets how many conversations a list refresh fetches.
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Read-only snapshots of the session state, updated as events arrive.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> &SessionState {
        self.session.state()
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.session.state().clone());
    }

    fn replace_session(&mut self, session: ChatSession) {
        self.session = session;
        self.publish();
    }

    pub async fn load_conversations(&mut self) -> Result<(), ClientError> {
        let page = self.backend.list_conversations(0, self.page_size).await?;
        debug!(count = page.items.len(), total = page.total, "conversations loaded");
        self.conversations = page.items;
        Ok(())
    }

    /// Creates a conversation and selects it with an empty session.
    pub async fn create_conversation(&mut self) -> Result<ConversationId, ClientError> {
        let conversation = self.backend.create_conversation().await?;
        let id = conversation.id;
        self.conversations.insert(0, conversation);
        self.replace_session(ChatSession::for_conversation(id));
        Ok(id)
    }

    /// Discards the current session and rehydrates one from stored detail.
    pub async fn select_conversation(&mut self, id: ConversationId) -> Result<(), ClientError> {
        self.replace_session(ChatSession::for_conversation(id));
        let detail = self.backend.conversation_detail(id).await?;
        self.replace_session(ChatSession::rehydrate(detail));
        Ok(())
    }

    pub fn deselect(&mut self) {
        self.replace_session(ChatSession::detached());
    }

    pub async fn delete_conversation(&mut self, id: ConversationId) -> Result<(), ClientError> {
        self.backend.delete_conversation(id).await?;
        self.conversations.retain(|c| c.id != id);
        if self.session.state().conversation_id() == Some(id) {
            self.deselect();
        }
        Ok(())
    }

    /// Sends one message and drains its event stream to a settled outcome.
    ///
    /// Rejected without any state change when no conversation is selected or
    /// a turn is already in flight. Dropping the returned future abandons the
    /// turn. The conversation list is refreshed afterwards; a failed refresh
    /// is only logged.
    pub async fn send_message(&mut self, text: &str) -> Result<TurnOutcome, ClientError> {
        let ticket = self.session.begin_turn(text)?;
        self.publish();

        let span = info_span!(
            "turn",
            turn_id = %ticket.turn_id(),
            conversation_id = %ticket.conversation_id()
        );
        let outcome = TurnGuard {
            client: self,
            ticket: Some(ticket),
        }
        .drive(text.trim())
        .instrument(span)
        .await;

        if let Err(err) = self.load_conversations().await {
            warn!(error = %err, "conversation list refresh failed");
        }
        Ok(outcome)
    }
}

/// Releases the session's sending state if a turn future is dropped early.
struct TurnGuard<'a> {
    client: &'a mut ChatClient,
    ticket: Option<TurnTicket>,
}

impl TurnGuard<'_> {
    async fn drive(mut self, content: &str) -> TurnOutcome {
        let Some(ticket) = self.ticket.clone() else {
            return TurnOutcome::Abandoned;
        };
        let client = &mut *self.client;

        match client
            .backend
            .send_message(ticket.conversation_id(), content)
            .await
        {
            Err(err) => {
                client.session.fail_before_stream(&ticket, &err);
                client.publish();
            }
            Ok(mut events) => {
                while let Some(next) = events.next().await {
                    let now = client.clock.now_ms();
                    match next {
                        Ok(event) => {
                            let ended = matches!(event, DomainEvent::StreamEnded);
                            if !client.session.apply_event(&ticket, event, now) {
                                break;
                            }
                            client.publish();
                            if ended {
                                break;
                            }
                        }
                        Err(err) => {
                            client.session.fail_turn(&ticket, &err, now);
                            client.publish();
                            break;
                        }
                    }
                }
            }
        }

        let outcome = client.session.finish_turn(&ticket, client.clock.now_ms());
        client.publish();
        self.ticket = None;
        outcome
    }
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take()
            && self
                .client
                .session
                .abandon_turn(&ticket, self.client.clock.now_ms())
        {
            self.client.publish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    use crate::errors::StreamError;
    use crate::event::QueryResult;
    use crate::frame::ByteStream;
    use crate::model::{ConversationDetail, ConversationStatus, Page, Role};
    use crate::progress::StepStatus;
    use crate::session::{ERROR_TEXT, SessionPhase};
    use crate::stream::{EventStream, domain_events};
    use proptest::prelude::*;

    struct TickClock(AtomicU64);

    impl Clock for TickClock {
        fn now_ms(&self) -> u64 {
            self.0.fetch_add(10, Ordering::SeqCst)
        }
    }

    enum Reply {
        Wire(Vec<&'static str>),
        Events(Vec<Result<DomainEvent, StreamError>>),
        Refused(StreamError),
        Pending,
    }

    struct FakeBackend {
        replies: Mutex<Vec<Reply>>,
        list_calls: AtomicUsize,
        fail_list: bool,
        detail: Option<ConversationDetail>,
    }

    impl FakeBackend {
        fn new(replies: Vec<Reply>) -> Self {
            Self {
                replies: Mutex::new(replies),
                list_calls: AtomicUsize::new(0),
                fail_list: false,
                detail: None,
            }
        }
    }

    fn conversation(id: i64) -> Conversation {
        Conversation {
            id: ConversationId(id),
            title: format!("c{id}"),
            status: ConversationStatus::Active,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[async_trait::async_trait]
    impl ChatBackend for FakeBackend {
        async fn create_conversation(&self) -> Result<Conversation, ClientError> {
            Ok(conversation(42))
        }

        async fn list_conversations(
            &self,
            _offset: u32,
            _limit: u32,
        ) -> Result<Page<Conversation>, ClientError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_list {
                return Err(ClientError::Transport("list down".into()));
            }
            Ok(Page {
                items: vec![conversation(1)],
                total: 1,
            })
        }

        async fn conversation_detail(
            &self,
            id: ConversationId,
        ) -> Result<ConversationDetail, ClientError> {
            self.detail
                .clone()
                .filter(|d| d.id == id)
                .ok_or(ClientError::Api {
                    code: 404,
                    message: "not found".into(),
                })
        }

        async fn delete_conversation(&self, _id: ConversationId) -> Result<(), ClientError> {
            Ok(())
        }

        async fn send_message(
            &self,
            _id: ConversationId,
            _content: &str,
        ) -> Result<EventStream, StreamError> {
            let reply = self.replies.lock().expect("lock").remove(0);
            match reply {
                Reply::Wire(chunks) => {
                    let bytes: ByteStream = Box::pin(futures::stream::iter(
                        chunks
                            .into_iter()
                            .map(|c| Ok::<_, StreamError>(bytes::Bytes::from_static(c.as_bytes()))),
                    ));
                    Ok(domain_events(bytes))
                }
                Reply::Events(events) => Ok(Box::pin(futures::stream::iter(events))),
                Reply::Refused(err) => Err(err),
                Reply::Pending => Ok(Box::pin(
                    futures::stream::iter(vec![Ok::<_, StreamError>(DomainEvent::StageStarted {
                        stage_id: "executor".into(),
                    })])
                    .chain(futures::stream::pending()),
                )),
            }
        }
    }

    async fn selected_client(backend: FakeBackend) -> (ChatClient, Arc<FakeBackend>) {
        let backend = Arc::new(backend);
        let mut client = ChatClient::with_clock(backend.clone(), Arc::new(TickClock(AtomicU64::new(1_000))));
        client.create_conversation().await.expect("create");
        (client, backend)
    }

    #[tokio::test]
    async fn scenario_sql_result_over_the_wire() {
        let (mut client, backend) = selected_client(FakeBackend::new(vec![Reply::Wire(vec![
            "event: node_start\ndata: {\"node\":\"sql_generator\"}\n\nevent: node_comp",
            "lete\ndata: {\"node\":\"sql_generator\"}\n\n",
            "event: result\ndata: {\"sql\":\"SELECT 1\",\"summary\":null,\"execute_result\":[{\"x\":1}]}\n\n",
            "event: done\ndata: {}\n\n",
        ])]))
        .await;
        let mut rx = client.subscribe();

        let outcome = client.send_message("one please").await.expect("send");
        assert_eq!(outcome, TurnOutcome::Answered);

        let state = client.state();
        assert!(!state.is_sending());
        assert_eq!(state.steps().len(), 1);
        assert_eq!(state.steps()[0].status, StepStatus::Completed);
        assert_eq!(state.steps()[0].display_label, "Generating SQL");
        assert!(state.steps()[0].elapsed_ms.is_some());
        let reply = state.transcript().last().expect("reply");
        assert_eq!(reply.role, Role::Assistant);
        assert!(reply.content.contains("```sql\nSELECT 1\n```"));
        assert_eq!(
            reply.rows.as_ref().map(|rows| rows[0].get("x").cloned()),
            Some(Some(serde_json::json!(1)))
        );

        assert!(rx.has_changed().expect("sender alive"));
        assert_eq!(&*rx.borrow_and_update(), state);
        assert_eq!(backend.list_calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.conversations().len(), 1);
    }

    #[tokio::test]
    async fn send_without_selection_is_rejected() {
        let backend = Arc::new(FakeBackend::new(vec![]));
        let mut client = ChatClient::new(backend.clone());
        assert_eq!(
            client.send_message("hi").await,
            Err(ClientError::NoConversationSelected)
        );
        assert_eq!(backend.list_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn refused_request_fails_turn_without_touching_steps() {
        let (mut client, _) = selected_client(FakeBackend::new(vec![Reply::Refused(
            StreamError::transport("status 500", Some(500)),
        )]))
        .await;
        let outcome = client.send_message("q").await.expect("send");
        assert!(matches!(outcome, TurnOutcome::Failed(Some(_))));
        assert!(client.state().steps().is_empty());
        assert_eq!(
            client.state().transcript().last().map(|m| m.content.as_str()),
            Some(ERROR_TEXT)
        );
        assert!(!client.state().is_sending());
    }

    #[tokio::test]
    async fn decode_error_mid_stream_fails_running_stage() {
        let (mut client, _) = selected_client(FakeBackend::new(vec![Reply::Wire(vec![
            "event: node_start\ndata: {\"node\":\"executor\"}\n\n",
            "event: result\ndata: {broken\n\n",
        ])]))
        .await;
        let outcome = client.send_message("q").await.expect("send");
        assert!(matches!(outcome, TurnOutcome::Failed(Some(ref d)) if d.contains("malformed")));
        assert_eq!(client.state().steps()[0].status, StepStatus::Failed);
        assert_eq!(client.state().active_stage_label(), None);
    }

    #[tokio::test]
    async fn done_frame_without_outcome_is_not_a_failure() {
        let (mut client, _) = selected_client(FakeBackend::new(vec![Reply::Wire(vec![
            "event: node_start\ndata: {\"node\":\"a\"}\n\n",
            "event: node_complete\ndata: {\"node\":\"a\"}\n\nevent: done\ndata: {}\n\n",
        ])]))
        .await;
        let outcome = client.send_message("q").await.expect("send");
        assert_eq!(outcome, TurnOutcome::Ended);
        assert_eq!(client.state().steps()[0].status, StepStatus::Completed);
        assert_eq!(client.state().transcript().len(), 1);
        assert_eq!(client.state().last_error(), None);
        assert!(!client.state().is_sending());
    }

    #[tokio::test]
    async fn stream_stopping_before_done_is_a_disconnect() {
        let (mut client, _) = selected_client(FakeBackend::new(vec![Reply::Events(vec![
            Ok(DomainEvent::StageStarted {
                stage_id: "a".into(),
            }),
            Ok(DomainEvent::StageCompleted {
                stage_id: "a".into(),
            }),
            Ok(DomainEvent::StageStarted {
                stage_id: "b".into(),
            }),
        ])]))
        .await;
        let outcome = client.send_message("q").await.expect("send");
        assert!(matches!(outcome, TurnOutcome::Failed(_)));
        let steps = client.state().steps();
        assert_eq!(steps[0].status, StepStatus::Completed);
        assert_eq!(steps[1].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn clarification_round_trip_keeps_steps() {
        let (mut client, _) = selected_client(FakeBackend::new(vec![
            Reply::Wire(vec![
                "event: node_start\ndata: {\"node\":\"intent_parse\"}\n\n",
                "event: node_complete\ndata: {\"node\":\"intent_parse\"}\n\n",
                "event: follow_up\ndata: {\"question\":\"Which year?\"}\n\nevent: done\ndata: {}\n\n",
            ]),
            Reply::Wire(vec![
                "event: node_start\ndata: {\"node\":\"sql_generator\"}\n\n",
                "event: node_complete\ndata: {\"node\":\"sql_generator\"}\n\n",
                "event: result\ndata: {\"sql\":\"SELECT 2025\"}\n\nevent: done\ndata: {}\n\n",
            ]),
        ]))
        .await;
        let outcome = client.send_message("sales").await.expect("send");
        assert_eq!(outcome, TurnOutcome::Clarification("Which year?".into()));
        assert_eq!(client.state().phase(), SessionPhase::AwaitingClarification);

        let outcome = client.send_message("2025").await.expect("send");
        assert_eq!(outcome, TurnOutcome::Answered);
        let ids: Vec<_> = client
            .state()
            .steps()
            .iter()
            .map(|s| s.stage_id.as_str())
            .collect();
        assert_eq!(ids, vec!["intent_parse", "sql_generator"]);
        assert_eq!(client.state().transcript().len(), 4);
    }

    #[tokio::test]
    async fn refresh_failure_does_not_change_state() {
        let mut backend = FakeBackend::new(vec![Reply::Events(vec![
            Ok(DomainEvent::ResultProduced(QueryResult::default())),
            Ok(DomainEvent::StreamEnded),
        ])]);
        backend.fail_list = true;
        let (mut client, _) = selected_client(backend).await;
        let outcome = client.send_message("q").await.expect("send");
        assert_eq!(outcome, TurnOutcome::Answered);
        assert_eq!(client.state().last_error(), None);
        assert_eq!(client.conversations().len(), 1);
    }

    #[tokio::test]
    async fn dropping_the_turn_future_releases_sending() {
        let (mut client, _) = selected_client(FakeBackend::new(vec![Reply::Pending])).await;
        let rx = client.subscribe();
        let timed_out = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            client.send_message("slow"),
        )
        .await;
        assert!(timed_out.is_err());
        assert!(!client.state().is_sending());
        assert!(!rx.borrow().is_sending());
        assert_eq!(client.state().steps()[0].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn select_rehydrates_and_delete_deselects() {
        let mut backend = FakeBackend::new(vec![]);
        backend.detail = Some(
            serde_json::from_value(serde_json::json!({
                "id": 1,
                "title": "c1",
                "status": "completed",
                "created_at": "2026-01-01T00:00:00Z",
                "updated_at": "2026-01-01T00:00:00Z",
                "messages": [
                    {"role": "user", "content": "q"},
                    {"role": "assistant", "content": "```sql\nSELECT 1\n```"}
                ],
                "sql": "SELECT 1",
                "execute_result": [{"x": "1"}]
            }))
            .expect("detail"),
        );
        let backend = Arc::new(backend);
        let mut client = ChatClient::new(backend.clone());
        client.load_conversations().await.expect("load");

        client
            .select_conversation(ConversationId(1))
            .await
            .expect("select");
        assert_eq!(client.state().transcript().len(), 2);
        assert!(client.state().transcript()[1].rows.is_some());

        let err = client.select_conversation(ConversationId(9)).await;
        assert!(matches!(err, Err(ClientError::Api { .. })));
        assert_eq!(client.state().conversation_id(), Some(ConversationId(9)));
        assert!(client.state().transcript().is_empty());

        client
            .delete_conversation(ConversationId(9))
            .await
            .expect("delete");
        assert_eq!(client.state().conversation_id(), None);
        assert_eq!(client.conversations().len(), 1);
    }

    fn run_frames(frames: &[(String, serde_json::Value)]) -> SessionState {
        let mut session = ChatSession::for_conversation(ConversationId(1));
        let ticket = session.begin_turn("q").expect("begin");
        for (name, payload) in frames {
            let frame = crate::frame::StreamFrame {
                event_name: name.clone(),
                raw_payload: payload.clone(),
            };
            if let Some(event) = crate::event::interpret(&frame) {
                session.apply_event(&ticket, event, 0);
            }
        }
        session.finish_turn(&ticket, 0);
        session.state().clone()
    }

    fn arb_known_frame() -> impl Strategy<Value = (String, serde_json::Value)> {
        let stage = prop_oneof![Just("intent_parse"), Just("sql_generator"), Just("executor")];
        prop_oneof![
            stage
                .clone()
                .prop_map(|s| ("node_start".to_string(), serde_json::json!({ "node": s }))),
            stage.prop_map(|s| ("node_complete".to_string(), serde_json::json!({ "node": s }))),
            Just((
                "result".to_string(),
                serde_json::json!({"sql": "SELECT 1", "execute_result": [{"x": 1}]})
            )),
            Just(("error".to_string(), serde_json::json!({"error_message": "boom"}))),
            Just(("follow_up".to_string(), serde_json::json!({"question": "?"}))),
        ]
    }

    proptest! {
        #[test]
        fn prop_unknown_events_do_not_change_final_state(
            frames in proptest::collection::vec(arb_known_frame(), 0..12),
            inserts in proptest::collection::vec(any::<prop::sample::Index>(), 0..4),
        ) {
            let mut noisy = frames.clone();
            for idx in inserts {
                let at = idx.index(noisy.len() + 1);
                noisy.insert(at, ("node_retry".to_string(), serde_json::json!({"node": "x"})));
            }
            prop_assert_eq!(run_frames(&frames), run_frames(&noisy));
        }
    }
}
