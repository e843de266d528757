use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{CommentId, ConversationId, UserId, VoteChoice};

/// Parses backend timestamps, which arrive either as RFC 3339 or as naive
/// UTC datetimes without an offset.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    let raw = raw.trim();
    match DateTime::parse_from_rfc3339(raw) {
        Ok(dt) => Ok(dt.with_timezone(&Utc)),
        Err(err) => raw
            .replacen(' ', "T", 1)
            .parse::<NaiveDateTime>()
            .map(|naive| naive.and_utc())
            .map_err(|_| err),
    }
}

mod timestamp {
    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{de, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(v) => s.serialize_some(&v.to_rfc3339()),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            let raw = Option::<String>::deserialize(d)?;
            raw.map(|r| super::super::parse_timestamp(&r).map_err(de::Error::custom))
                .transpose()
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Author>,
    #[serde(
        default,
        with = "timestamp::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub date_created: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_true")]
    pub allow_votes: bool,
    #[serde(default = "default_true")]
    pub allow_comments: bool,
    #[serde(default)]
    pub display_unmoderated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_friendly_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_participants: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
    #[serde(
        default,
        with = "timestamp::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub date_created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

impl Comment {
    pub fn moderation_status(&self) -> ModerationStatus {
        match self.approved {
            None => ModerationStatus::Pending,
            Some(true) => ModerationStatus::Approved,
            Some(false) => ModerationStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModerationStatus {
    Pending,
    Approved,
    Rejected,
}

impl ModerationStatus {
    pub fn label(self) -> &'static str {
        match self {
            ModerationStatus::Pending => "pending",
            ModerationStatus::Approved => "approved",
            ModerationStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipationComment {
    pub id: CommentId,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemainingCommentResponse {
    #[serde(default)]
    pub comment: Option<ParticipationComment>,
    #[serde(default)]
    pub num_votes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub value: i8,
}

impl From<VoteChoice> for VoteRequest {
    fn from(choice: VoteChoice) -> Self {
        Self {
            value: choice.value(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VoteAck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCommentRequest {
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentCreated {
    pub id: CommentId,
}

/// Body of `GET /users/me`; anonymous participants have no username.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModerationAck {
    #[serde(default)]
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoteProbabilities {
    pub agree: f64,
    pub disagree: f64,
    pub skip: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CommentRepresentativeness {
    pub group_id: i64,
    #[serde(default)]
    pub representativeness: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentAnalysis {
    pub comment_id: CommentId,
    pub content: String,
    pub total_votes: u32,
    pub consensus: f64,
    pub participation_rate: f64,
    pub vote_probabilities: VoteProbabilities,
    #[serde(default)]
    pub representativeness: Vec<CommentRepresentativeness>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupCommentRepresentativeness {
    pub group_id: i64,
    pub comment_id: CommentId,
    pub content: String,
    #[serde(default)]
    pub agree_percentage: Option<f64>,
    #[serde(default)]
    pub representativeness: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupAnalysis {
    pub group_id: i64,
    #[serde(default)]
    pub users: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub representative_comments: Option<Vec<GroupCommentRepresentativeness>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationAnalysis {
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub comment_ids: Vec<CommentId>,
    #[serde(default)]
    pub user_ids: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments_by_consensus: Option<Vec<CommentAnalysis>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<GroupAnalysis>>,
}
