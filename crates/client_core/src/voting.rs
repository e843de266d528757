use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use shared::{
    domain::{CommentId, ConversationId, VoteChoice},
    protocol::ParticipationComment,
};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    error::ClientError, notifications::NotificationQueue, ConversationApi, NextComment,
};

const VOTE_FAILED_MESSAGE: &str = "Failed to record your vote. Please try again.";
const FETCH_FAILED_MESSAGE: &str = "Failed to load the next comment. Please try again.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub id: CommentId,
    pub content: String,
    /// One-based ordinal shown to the participant, taken from the backend's
    /// vote count so it stays correct across tabs and sessions.
    pub sequence_number: u32,
}

impl Statement {
    pub fn from_remaining(comment: ParticipationComment, num_votes: u32) -> Self {
        Self {
            id: comment.id,
            content: comment.content,
            sequence_number: num_votes.saturating_add(1),
        }
    }

    pub fn label(&self) -> String {
        format!("Comment {}", self.sequence_number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VotingPhase {
    Loading,
    Ready,
    Submitting,
    Exhausted,
    Error,
}

impl fmt::Display for VotingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VotingPhase::Loading => "loading",
            VotingPhase::Ready => "ready",
            VotingPhase::Submitting => "submitting",
            VotingPhase::Exhausted => "exhausted",
            VotingPhase::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VotingState {
    Loading,
    Ready {
        statement: Statement,
    },
    Submitting {
        statement: Statement,
        pending: VoteChoice,
    },
    Exhausted,
    /// `statement` is the one that failed to record, if any; it is offered
    /// again after a retry because the backend never counted it.
    Error {
        statement: Option<Statement>,
        message: String,
    },
}

impl VotingState {
    pub fn phase(&self) -> VotingPhase {
        match self {
            VotingState::Loading => VotingPhase::Loading,
            VotingState::Ready { .. } => VotingPhase::Ready,
            VotingState::Submitting { .. } => VotingPhase::Submitting,
            VotingState::Exhausted => VotingPhase::Exhausted,
            VotingState::Error { .. } => VotingPhase::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VotingSession {
    pub conversation_id: ConversationId,
    pub state: VotingState,
    pub voted_count: u32,
}

impl VotingSession {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            state: VotingState::Loading,
            voted_count: 0,
        }
    }

    pub fn phase(&self) -> VotingPhase {
        self.state.phase()
    }

    pub fn current_statement(&self) -> Option<&Statement> {
        match &self.state {
            VotingState::Ready { statement } | VotingState::Submitting { statement, .. } => {
                Some(statement)
            }
            VotingState::Error { statement, .. } => statement.as_ref(),
            VotingState::Loading | VotingState::Exhausted => None,
        }
    }

    pub fn pending_vote(&self) -> Option<VoteChoice> {
        match &self.state {
            VotingState::Submitting { pending, .. } => Some(*pending),
            _ => None,
        }
    }

    pub fn is_input_locked(&self) -> bool {
        self.pending_vote().is_some()
    }

    pub fn can_vote(&self) -> bool {
        self.phase() == VotingPhase::Ready
    }

    pub fn is_exhausted(&self) -> bool {
        self.phase() == VotingPhase::Exhausted
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.state {
            VotingState::Error { message, .. } => Some(message),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VotingError {
    #[error("cannot {operation} while {phase}")]
    InvalidTransition {
        operation: &'static str,
        phase: VotingPhase,
    },
    #[error("vote for {received} rejected: current statement is {current}")]
    StaleStatement {
        current: CommentId,
        received: CommentId,
    },
    #[error("voting session for conversation {0} is closed")]
    Closed(ConversationId),
}

impl VotingError {
    /// A vote for a statement that is no longer on display counts as an
    /// invalid transition too; only closing is reported separately.
    pub fn is_invalid_transition(&self) -> bool {
        matches!(
            self,
            VotingError::InvalidTransition { .. } | VotingError::StaleStatement { .. }
        )
    }
}

struct ControllerState {
    session: VotingSession,
    /// Bumped whenever an operation starts or the session closes; results
    /// from an older epoch are discarded.
    epoch: u64,
    closed: bool,
}

pub struct VotingController {
    api: Arc<dyn ConversationApi>,
    notifications: Option<Arc<NotificationQueue>>,
    state: Mutex<ControllerState>,
    updates: watch::Sender<VotingSession>,
}

impl VotingController {
    pub fn new(api: Arc<dyn ConversationApi>, conversation_id: ConversationId) -> Self {
        let session = VotingSession::new(conversation_id);
        let (updates, _) = watch::channel(session.clone());
        Self {
            api,
            notifications: None,
            state: Mutex::new(ControllerState {
                session,
                epoch: 0,
                closed: false,
            }),
            updates,
        }
    }

    pub fn with_notifications(mut self, queue: Arc<NotificationQueue>) -> Self {
        self.notifications = Some(queue);
        self
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.state().session.conversation_id
    }

    pub fn snapshot(&self) -> VotingSession {
        self.state().session.clone()
    }

    pub fn watch(&self) -> watch::Receiver<VotingSession> {
        self.updates.subscribe()
    }

    pub async fn load(&self) -> Result<VotingPhase, VotingError> {
        let epoch = self.begin("load", |state| matches!(state, VotingState::Loading), None)?;
        self.fetch_next(epoch, None).await
    }

    /// Leaves `Error` for `Loading` and fetches again. A statement whose vote
    /// failed is offered again by the backend since it was never recorded.
    pub async fn retry(&self) -> Result<VotingPhase, VotingError> {
        let epoch = self.begin(
            "retry",
            |state| matches!(state, VotingState::Error { .. }),
            Some(VotingState::Loading),
        )?;
        self.fetch_next(epoch, None).await
    }

    /// A failed poll keeps the current statement.
    pub async fn refresh(&self) -> Result<VotingPhase, VotingError> {
        let epoch = self.begin("refresh", |state| matches!(state, VotingState::Ready { .. }), None)?;
        let conversation_id = self.conversation_id();
        let result = self.api.next_comment(conversation_id).await;

        let mut guard = self.state();
        if guard.epoch != epoch {
            debug!(%conversation_id, "discarding superseded refresh");
            return self.superseded(&guard);
        }
        match result {
            Ok(NextComment::Found { comment, num_votes }) => {
                guard.session.voted_count = num_votes;
                guard.session.state = VotingState::Ready {
                    statement: Statement::from_remaining(comment, num_votes),
                };
            }
            Ok(NextComment::Exhausted) => guard.session.state = VotingState::Exhausted,
            Err(err) => warn!(%conversation_id, "refresh failed: {err}"),
        }
        self.publish(&guard);
        Ok(guard.session.phase())
    }

    /// The next statement is fetched only after the vote call resolves.
    /// Backend failures move the session to `Error` rather than returning `Err`.
    pub async fn submit_vote(
        &self,
        statement_id: CommentId,
        choice: VoteChoice,
    ) -> Result<VotingPhase, VotingError> {
        let (epoch, statement, voted_before) = {
            let mut guard = self.state();
            if guard.closed {
                return Err(VotingError::Closed(guard.session.conversation_id));
            }
            let statement = match &guard.session.state {
                VotingState::Ready { statement } if statement.id == statement_id => {
                    statement.clone()
                }
                VotingState::Ready { statement } => {
                    return Err(VotingError::StaleStatement {
                        current: statement.id,
                        received: statement_id,
                    })
                }
                other => {
                    return Err(VotingError::InvalidTransition {
                        operation: "submit a vote",
                        phase: other.phase(),
                    })
                }
            };
            guard.epoch += 1;
            guard.session.state = VotingState::Submitting {
                statement: statement.clone(),
                pending: choice,
            };
            self.publish(&guard);
            (guard.epoch, statement, guard.session.voted_count)
        };

        let conversation_id = self.conversation_id();
        info!(%conversation_id, comment_id = %statement.id, vote = choice.value(), "submitting vote");

        if let Err(err) = self.api.create_vote(statement.id, choice).await {
            warn!(%conversation_id, comment_id = %statement.id, "vote failed: {err}");
            return self.fail(
                epoch,
                Some(statement),
                &err,
                VOTE_FAILED_MESSAGE,
            );
        }

        {
            let guard = self.state();
            if guard.epoch != epoch {
                return self.superseded(&guard);
            }
        }
        self.fetch_next(epoch, Some(voted_before.saturating_add(1)))
            .await
    }

    /// Abandons the session. Calls still in flight finish without effect and
    /// every later operation is rejected.
    pub fn close(&self) {
        let mut guard = self.state();
        if !guard.closed {
            guard.closed = true;
            guard.epoch += 1;
            debug!(conversation_id = %guard.session.conversation_id, "voting session closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    fn begin(
        &self,
        operation: &'static str,
        allowed: impl Fn(&VotingState) -> bool,
        next: Option<VotingState>,
    ) -> Result<u64, VotingError> {
        let mut guard = self.state();
        if guard.closed {
            return Err(VotingError::Closed(guard.session.conversation_id));
        }
        if !allowed(&guard.session.state) {
            return Err(VotingError::InvalidTransition {
                operation,
                phase: guard.session.phase(),
            });
        }
        guard.epoch += 1;
        if let Some(next) = next {
            guard.session.state = next;
            self.publish(&guard);
        }
        Ok(guard.epoch)
    }

    /// `voted_after_vote` is set when this fetch follows a recorded vote; it is
    /// the count to keep if the backend reports nothing left.
    async fn fetch_next(
        &self,
        epoch: u64,
        voted_after_vote: Option<u32>,
    ) -> Result<VotingPhase, VotingError> {
        let conversation_id = self.conversation_id();
        let result = self.api.next_comment(conversation_id).await;

        let err = {
            let mut guard = self.state();
            if guard.epoch != epoch {
                return self.superseded(&guard);
            }
            match result {
                Ok(NextComment::Found { comment, num_votes }) => {
                    let statement = Statement::from_remaining(comment, num_votes);
                    debug!(%conversation_id, comment_id = %statement.id, ordinal = statement.sequence_number, "statement ready");
                    guard.session.voted_count = num_votes;
                    guard.session.state = VotingState::Ready { statement };
                    self.publish(&guard);
                    return Ok(VotingPhase::Ready);
                }
                Ok(NextComment::Exhausted) => {
                    if let Some(count) = voted_after_vote {
                        guard.session.voted_count = count;
                    }
                    info!(%conversation_id, voted = guard.session.voted_count, "all statements voted");
                    guard.session.state = VotingState::Exhausted;
                    self.publish(&guard);
                    return Ok(VotingPhase::Exhausted);
                }
                Err(err) => {
                    if let Some(count) = voted_after_vote {
                        guard.session.voted_count = count;
                    }
                    err
                }
            }
        };

        warn!(%conversation_id, "fetching next statement failed: {err}");
        self.fail(epoch, None, &err, FETCH_FAILED_MESSAGE)
    }

    fn fail(
        &self,
        epoch: u64,
        statement: Option<Statement>,
        err: &ClientError,
        user_message: &str,
    ) -> Result<VotingPhase, VotingError> {
        {
            let mut guard = self.state();
            if guard.epoch != epoch {
                return self.superseded(&guard);
            }
            guard.session.state = VotingState::Error {
                statement,
                message: err.user_message(),
            };
            self.publish(&guard);
        }
        if let Some(queue) = &self.notifications {
            queue.error(user_message);
        }
        Ok(VotingPhase::Error)
    }

    fn superseded(&self, guard: &ControllerState) -> Result<VotingPhase, VotingError> {
        if guard.closed {
            debug!(conversation_id = %guard.session.conversation_id, "dropping result for closed session");
            Err(VotingError::Closed(guard.session.conversation_id))
        } else {
            Ok(guard.session.phase())
        }
    }

    fn publish(&self, guard: &ControllerState) {
        self.updates.send_replace(guard.session.clone());
    }

    fn state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "tests/voting_tests.rs"]
mod tests;
