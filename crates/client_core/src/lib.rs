use async_trait::async_trait;
use shared::{
    domain::{CommentId, ConversationId, VoteChoice},
    protocol::{Comment, Conversation, ParticipationComment, VoteAck},
};

pub mod conversation_filter;
pub mod error;
pub mod notifications;
pub mod progress;
pub mod settings;
pub mod transport;
pub mod voting;

pub use conversation_filter::{ConversationFilter, FilterSummary};
pub use error::{ClientError, ClientResult};
pub use notifications::{
    DismissReason, Notification, NotificationEvent, NotificationId, NotificationKind,
    NotificationQueue,
};
pub use progress::ParticipationProgress;
pub use settings::{load_settings, ClientSettings};
pub use transport::HttpApiClient;
pub use voting::{Statement, VotingController, VotingError, VotingPhase, VotingSession, VotingState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextComment {
    Found {
        comment: ParticipationComment,
        num_votes: u32,
    },
    Exhausted,
}

#[async_trait]
pub trait ConversationApi: Send + Sync {
    async fn next_comment(&self, conversation_id: ConversationId) -> ClientResult<NextComment>;
    async fn create_vote(&self, comment_id: CommentId, choice: VoteChoice) -> ClientResult<VoteAck>;
    async fn conversation(&self, conversation_id: ConversationId) -> ClientResult<Conversation>;
    async fn conversation_comments(
        &self,
        conversation_id: ConversationId,
    ) -> ClientResult<Vec<Comment>>;
}
