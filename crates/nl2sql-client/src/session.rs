use tracing::{debug, error, warn};

use crate::errors::{ClientError, StreamError};
use crate::event::{DomainEvent, QueryResult};
use crate::model::{ConversationDetail, ConversationId, Message, Role};
use crate::progress::{ProgressTracker, StageStep};

/// Transcript text shown for any failed turn. Details go to logs and `last_error`.
pub const ERROR_TEXT: &str = "Something went wrong while running the query. Please try again.";
/// Transcript text for a result that carries neither a summary nor SQL.
pub const RESULT_FALLBACK_TEXT: &str = "Query completed.";
/// Maximum length of a message, in characters.
pub const MAX_MESSAGE_CHARS: usize = 2000;

const DISCONNECT_DETAIL: &str = "stream ended before the pipeline reported an outcome";

/// Coarse phase of a session, derived from its state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionPhase {
    Idle,
    Sending,
    AwaitingClarification,
}

/// How a turn ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TurnOutcome {
    /// A result was produced.
    Answered,
    /// The pipeline asked a question; the next send continues the same run.
    Clarification(String),
    /// Pipeline error, transport error, malformed stream or abrupt disconnect.
    Failed(Option<String>),
    /// The stream finished with `done` and reported nothing else.
    Ended,
    /// The turn was superseded before it settled.
    Abandoned,
}

/// Observable state of the selected conversation.
///
/// Only [`ChatSession`] mutates it; everyone else reads snapshots.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionState {
    conversation_id: Option<ConversationId>,
    transcript: Vec<Message>,
    progress: ProgressTracker,
    active_stage_label: Option<String>,
    pending_clarification: Option<String>,
    last_result: Option<QueryResult>,
    last_error: Option<String>,
    is_sending: bool,
}

impl SessionState {
    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.conversation_id
    }

    pub fn transcript(&self) -> &[Message] {
        &self.transcript
    }

    pub fn steps(&self) -> &[StageStep] {
        self.progress.steps()
    }

    pub fn active_stage_label(&self) -> Option<&str> {
        self.active_stage_label.as_deref()
    }

    pub fn pending_clarification(&self) -> Option<&str> {
        self.pending_clarification.as_deref()
    }

    pub fn last_result(&self) -> Option<&QueryResult> {
        self.last_result.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_sending(&self) -> bool {
        self.is_sending
    }

    pub fn phase(&self) -> SessionPhase {
        if self.is_sending {
            SessionPhase::Sending
        } else if self.pending_clarification.is_some() {
            SessionPhase::AwaitingClarification
        } else {
            SessionPhase::Idle
        }
    }
}

/// Ownership token for one in-flight turn.
///
/// Events applied with a ticket that no longer owns the session are dropped.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TurnTicket {
    turn_id: uuid::Uuid,
    conversation_id: ConversationId,
}

impl TurnTicket {
    pub fn turn_id(&self) -> uuid::Uuid {
        self.turn_id
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }
}

#[derive(Debug)]
struct ActiveTurn {
    turn_id: uuid::Uuid,
    outcome: Option<TurnOutcome>,
    saw_done: bool,
}

/// Conversation state machine: `Idle -> Sending -> {Idle, AwaitingClarification}`.
///
/// Transitions are synchronous and take the current time in milliseconds, so
/// the async driver in [`ChatClient`](crate::client::ChatClient) only has to
/// feed events in arrival order.
#[derive(Debug, Default)]
pub struct ChatSession {
    state: SessionState,
    turn: Option<ActiveTurn>,
}

impl ChatSession {
    /// A session with no conversation selected; every send is rejected.
    pub fn detached() -> Self {
        Self::default()
    }

    /// A fresh, empty session for a conversation.
    pub fn for_conversation(id: ConversationId) -> Self {
        Self {
            state: SessionState {
                conversation_id: Some(id),
                ..SessionState::default()
            },
            turn: None,
        }
    }

    /// Rebuilds a session from persisted conversation detail.
    ///
    /// Persisted result rows are attached to the latest assistant message that
    /// carries a SQL block.
    pub fn rehydrate(detail: ConversationDetail) -> Self {
        let mut transcript = detail.messages;
        if let Some(rows) = detail.execute_result.as_ref().filter(|rows| !rows.is_empty()) {
            match transcript
                .iter_mut()
                .rev()
                .find(|m| m.role == Role::Assistant && m.has_sql_block())
            {
                Some(message) => message.rows = Some(rows.clone()),
                None => debug!(conversation_id = %detail.id, "no SQL message to attach persisted rows to"),
            }
        }
        let last_result = (detail.sql.is_some() || detail.execute_result.is_some()).then(|| {
            QueryResult {
                sql_text: detail.sql,
                summary_text: None,
                rows: detail.execute_result,
            }
        });
        Self {
            state: SessionState {
                conversation_id: Some(detail.id),
                transcript,
                last_result,
                pending_clarification: detail.follow_up_question,
                last_error: detail.error_message,
                ..SessionState::default()
            },
            turn: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Starts a turn: appends the user message and enters `Sending`.
    ///
    /// Stage steps survive only when this send answers a pending clarification.
    pub fn begin_turn(&mut self, text: &str) -> Result<TurnTicket, ClientError> {
        let conversation_id = self
            .state
            .conversation_id
            .ok_or(ClientError::NoConversationSelected)?;
        if self.state.is_sending {
            return Err(ClientError::SendInFlight);
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(ClientError::Validation("message must not be empty".into()));
        }
        if text.chars().count() > MAX_MESSAGE_CHARS {
            return Err(ClientError::Validation(format!(
                "message must be at most {MAX_MESSAGE_CHARS} characters"
            )));
        }

        let state = &mut self.state;
        state.transcript.push(Message::user(text));
        if state.pending_clarification.is_none() {
            state.progress.clear();
        }
        state.is_sending = true;
        state.active_stage_label = None;
        state.pending_clarification = None;
        state.last_result = None;
        state.last_error = None;

        let turn_id = uuid::Uuid::new_v4();
        self.turn = Some(ActiveTurn {
            turn_id,
            outcome: None,
            saw_done: false,
        });
        debug!(%turn_id, %conversation_id, "turn started");
        Ok(TurnTicket {
            turn_id,
            conversation_id,
        })
    }

    fn owns(&self, ticket: &TurnTicket) -> bool {
        self.turn.as_ref().is_some_and(|t| t.turn_id == ticket.turn_id)
            && self.state.conversation_id == Some(ticket.conversation_id)
    }

    fn outcome_settled(&self) -> bool {
        self.turn.as_ref().is_some_and(|t| t.outcome.is_some())
    }

    fn settle(&mut self, outcome: TurnOutcome) {
        if let Some(turn) = self.turn.as_mut() {
            turn.outcome = Some(outcome);
        }
    }

    /// Applies one event of the ticket's turn. Returns `false` if the ticket
    /// is stale and the event was discarded.
    pub fn apply_event(&mut self, ticket: &TurnTicket, event: DomainEvent, now_ms: u64) -> bool {
        if !self.owns(ticket) {
            debug!(turn_id = %ticket.turn_id, "discarding event for superseded turn");
            return false;
        }
        if event.is_outcome() && self.outcome_settled() {
            warn!(turn_id = %ticket.turn_id, ?event, "ignoring outcome after the turn already settled");
            return true;
        }

        match event {
            DomainEvent::StageStarted { stage_id } => {
                let idx = self.state.progress.stage_started(&stage_id, now_ms);
                self.state.active_stage_label =
                    Some(self.state.progress.steps()[idx].display_label.clone());
            }
            DomainEvent::StageCompleted { stage_id } => {
                if self.state.progress.stage_completed(&stage_id, now_ms).is_some() {
                    self.state.active_stage_label = None;
                }
            }
            DomainEvent::ClarificationRequested { question } => {
                self.state.pending_clarification = Some(question.clone());
                self.state.transcript.push(Message::assistant(question.clone()));
                self.state.active_stage_label = None;
                self.settle(TurnOutcome::Clarification(question));
            }
            DomainEvent::ResultProduced(result) => {
                let mut message = Message::assistant(result_text(&result));
                message.rows = result.rows.clone();
                self.state.transcript.push(message);
                self.state.last_result = Some(result);
                self.state.active_stage_label = None;
                self.settle(TurnOutcome::Answered);
            }
            DomainEvent::Failed {
                error_code,
                error_message,
            } => {
                self.record_failure(&StreamError::pipeline(error_code, error_message), now_ms);
            }
            DomainEvent::StreamEnded => {
                debug!(turn_id = %ticket.turn_id, "end of stream marker");
                if let Some(turn) = self.turn.as_mut() {
                    turn.saw_done = true;
                }
            }
        }
        true
    }

    /// Records a failure of the stream itself (decode or transport).
    pub fn fail_turn(&mut self, ticket: &TurnTicket, err: &StreamError, now_ms: u64) -> bool {
        if !self.owns(ticket) {
            return false;
        }
        if self.outcome_settled() {
            warn!(turn_id = %ticket.turn_id, error = %err, "stream failed after the turn settled");
            return true;
        }
        self.record_failure(err, now_ms);
        true
    }

    /// Records a failure to open the stream. Stage steps are left as they were.
    pub fn fail_before_stream(&mut self, ticket: &TurnTicket, err: &StreamError) -> bool {
        if !self.owns(ticket) {
            return false;
        }
        error!(turn_id = %ticket.turn_id, error = %err, "failed to open event stream");
        self.state.last_error = failure_detail(err);
        self.state.active_stage_label = None;
        self.state.transcript.push(Message::assistant(ERROR_TEXT));
        self.settle(TurnOutcome::Failed(self.state.last_error.clone()));
        true
    }

    fn record_failure(&mut self, err: &StreamError, now_ms: u64) {
        error!(error = %err, "turn failed");
        self.state.last_error = failure_detail(err);
        self.state.progress.fail_in_flight(now_ms);
        self.state.active_stage_label = None;
        self.state.transcript.push(Message::assistant(ERROR_TEXT));
        self.settle(TurnOutcome::Failed(self.state.last_error.clone()));
    }

    /// Leaves `Sending`.
    ///
    /// A turn that ended with `done` keeps whatever the stream left behind,
    /// even with no outcome. A stream that stopped without `done` or an
    /// outcome is an abrupt disconnect.
    pub fn finish_turn(&mut self, ticket: &TurnTicket, now_ms: u64) -> TurnOutcome {
        if !self.owns(ticket) {
            return TurnOutcome::Abandoned;
        }
        let saw_done = self.turn.as_ref().is_some_and(|t| t.saw_done);
        if !self.outcome_settled() {
            if saw_done {
                debug!(turn_id = %ticket.turn_id, "stream finished without an outcome");
            } else {
                warn!(turn_id = %ticket.turn_id, "stream stopped before `done`");
                self.record_failure(&StreamError::transport(DISCONNECT_DETAIL, None), now_ms);
            }
        }
        self.state.is_sending = false;
        self.state.active_stage_label = None;
        let outcome = self
            .turn
            .take()
            .and_then(|t| t.outcome)
            .unwrap_or(TurnOutcome::Ended);
        debug!(turn_id = %ticket.turn_id, ?outcome, "turn finished");
        outcome
    }

    /// Drops the ticket's turn without applying anything further.
    ///
    /// A stage left running is marked failed; the transcript is not touched.
    pub fn abandon_turn(&mut self, ticket: &TurnTicket, now_ms: u64) -> bool {
        if !self.owns(ticket) {
            return false;
        }
        debug!(turn_id = %ticket.turn_id, "turn abandoned");
        self.state.progress.abandon_running(now_ms);
        self.turn = None;
        self.state.is_sending = false;
        self.state.active_stage_label = None;
        true
    }
}

fn result_text(result: &QueryResult) -> String {
    let non_blank = |s: &Option<String>| s.as_deref().filter(|s| !s.trim().is_empty()).map(str::to_owned);
    if let Some(summary) = non_blank(&result.summary_text) {
        return summary;
    }
    if let Some(sql) = non_blank(&result.sql_text) {
        return format!("```sql\n{sql}\n```");
    }
    RESULT_FALLBACK_TEXT.to_string()
}

fn failure_detail(err: &StreamError) -> Option<String> {
    match err {
        StreamError::Pipeline { .. } => err.message().map(str::to_owned),
        StreamError::Decode { .. } | StreamError::Transport { .. } => Some(err.to_string()),
    }
}
