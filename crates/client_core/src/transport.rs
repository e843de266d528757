use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use shared::{
    domain::{CommentId, ConversationId, VoteChoice},
    error::ApiError,
    protocol::{
        Comment, CommentCreated, Conversation, ConversationAnalysis, ModerationAck,
        NewCommentRequest, RegisterRequest, RemainingCommentResponse, TokenResponse, UserProfile,
        VoteAck, VoteRequest,
    },
};
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

use crate::{
    error::{ClientError, ClientResult},
    settings::ClientSettings,
    ConversationApi, NextComment,
};

/// Detail the backend sends when the conversation itself is missing, as
/// opposed to the participant having voted on everything.
const CONVERSATION_NOT_FOUND: &str = "Conversation not found";

pub struct HttpApiClient {
    http: Client,
    base_url: Url,
    access_token: RwLock<Option<String>>,
}

impl HttpApiClient {
    pub fn new(settings: &ClientSettings) -> ClientResult<Self> {
        let base_url = settings.base_url()?;
        let mut builder = Client::builder().cookie_store(true);
        if let Some(timeout) = settings.request_timeout() {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().map_err(ClientError::HttpClient)?;
        Ok(Self {
            http,
            base_url,
            access_token: RwLock::new(None),
        })
    }

    pub async fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write().await = token;
    }

    pub async fn has_access_token(&self) -> bool {
        self.access_token.read().await.is_some()
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn send(&self, request: RequestBuilder, endpoint: &Url) -> ClientResult<Response> {
        let request = match self.access_token.read().await.as_deref() {
            Some(token) => request.header(header::AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        };
        request.send().await.map_err(|source| ClientError::Transport {
            endpoint: endpoint.to_string(),
            source,
        })
    }

    async fn api_error(response: Response) -> ApiError {
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .ok()
            .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok());
        ApiError::from_body(status, body)
    }

    async fn check(response: Response) -> ClientResult<Response> {
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(Self::api_error(response).await.into())
        }
    }

    async fn decode<T: DeserializeOwned>(response: Response, endpoint: &Url) -> ClientResult<T> {
        let bytes = response
            .bytes()
            .await
            .map_err(|source| ClientError::Transport {
                endpoint: endpoint.to_string(),
                source,
            })?;
        serde_json::from_slice(&bytes).map_err(|e| ClientError::MalformedResponse {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, endpoint: Url) -> ClientResult<T> {
        let response = self.send(self.http.get(endpoint.clone()), &endpoint).await?;
        Self::decode(Self::check(response).await?, &endpoint).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        endpoint: Url,
        body: &B,
    ) -> ClientResult<T> {
        let response = self
            .send(self.http.post(endpoint.clone()).json(body), &endpoint)
            .await?;
        Self::decode(Self::check(response).await?, &endpoint).await
    }

    async fn put_json<T: DeserializeOwned>(&self, endpoint: Url) -> ClientResult<T> {
        let response = self.send(self.http.put(endpoint.clone()), &endpoint).await?;
        Self::decode(Self::check(response).await?, &endpoint).await
    }

    /// Maps a friendly link to its conversation id, falling back to reading
    /// the input as an id when no link matches.
    pub async fn resolve_conversation_id(&self, id_or_link: &str) -> ClientResult<ConversationId> {
        let id_or_link = id_or_link.trim();
        let endpoint = self.endpoint(&["conversations", "friendly-link", id_or_link, "id"]);
        match self.get_json::<ConversationId>(endpoint).await {
            Ok(id) => Ok(id),
            Err(ClientError::Api(err)) => id_or_link.parse().map_err(|_| ClientError::Api(err)),
            Err(err) => Err(err),
        }
    }

    pub async fn create_comment(
        &self,
        conversation_id: ConversationId,
        content: &str,
    ) -> ClientResult<CommentCreated> {
        let endpoint = self.endpoint(&["conversations", &conversation_id.to_string(), "comments"]);
        let created: CommentCreated = self
            .post_json(
                endpoint,
                &NewCommentRequest {
                    content: content.to_string(),
                },
            )
            .await?;
        info!(%conversation_id, comment_id = %created.id, "comment submitted");
        Ok(created)
    }

    pub async fn moderation_conversations(&self) -> ClientResult<Vec<Conversation>> {
        self.get_json(self.endpoint(&["moderation", "conversations"]))
            .await
    }

    pub async fn moderation_comments(
        &self,
        conversation_id: ConversationId,
    ) -> ClientResult<Vec<Comment>> {
        self.get_json(self.endpoint(&[
            "moderation",
            "conversations",
            &conversation_id.to_string(),
            "comments",
        ]))
        .await
    }

    pub async fn approve_comment(&self, comment_id: CommentId) -> ClientResult<ModerationAck> {
        let ack = self
            .put_json(self.endpoint(&["moderation", "comments", &comment_id.to_string(), "approve"]))
            .await?;
        info!(%comment_id, "comment approved");
        Ok(ack)
    }

    pub async fn reject_comment(&self, comment_id: CommentId) -> ClientResult<ModerationAck> {
        let ack = self
            .put_json(self.endpoint(&["moderation", "comments", &comment_id.to_string(), "reject"]))
            .await?;
        info!(%comment_id, "comment rejected");
        Ok(ack)
    }

    pub async fn analysis(&self, conversation_id: ConversationId) -> ClientResult<ConversationAnalysis> {
        let mut endpoint = self.endpoint(&["analysis", "conversation", &conversation_id.to_string()]);
        endpoint
            .query_pairs_mut()
            .append_pair("include_consensus_comments", "true");
        self.get_json(endpoint).await
    }

    pub async fn login(&self, username: &str, password: &str) -> ClientResult<TokenResponse> {
        let endpoint = self.endpoint(&["token"]);
        let request = self
            .http
            .post(endpoint.clone())
            .form(&[("username", username), ("password", password)]);
        let response = Self::check(self.send(request, &endpoint).await?).await?;
        let token: TokenResponse = Self::decode(response, &endpoint).await?;
        self.set_access_token(token.access_token.clone()).await;
        info!(username, "logged in");
        Ok(token)
    }

    /// Creates a named account. Does not log in.
    pub async fn register(&self, username: &str, password: &str) -> ClientResult<UserProfile> {
        let profile = self
            .post_json(
                self.endpoint(&["register"]),
                &RegisterRequest {
                    username: username.to_string(),
                    password: password.to_string(),
                },
            )
            .await?;
        info!(username, "account registered");
        Ok(profile)
    }

    pub async fn register_anonymous(&self) -> ClientResult<TokenResponse> {
        let token: TokenResponse = self
            .post_json(self.endpoint(&["register", "anonymous"]), &Value::Object(Default::default()))
            .await?;
        self.set_access_token(token.access_token.clone()).await;
        info!("registered anonymous participant");
        Ok(token)
    }

    pub async fn me(&self) -> ClientResult<UserProfile> {
        self.get_json(self.endpoint(&["users", "me"])).await
    }

    pub async fn logout(&self) -> ClientResult<()> {
        let _: Value = self
            .post_json(self.endpoint(&["logout"]), &Value::Object(Default::default()))
            .await?;
        self.set_access_token(None).await;
        Ok(())
    }
}

#[async_trait]
impl ConversationApi for HttpApiClient {
    async fn next_comment(&self, conversation_id: ConversationId) -> ClientResult<NextComment> {
        let endpoint = self.endpoint(&[
            "conversations",
            &conversation_id.to_string(),
            "comments",
            "remaining",
        ]);
        let response = self.send(self.http.get(endpoint.clone()), &endpoint).await?;

        match response.status() {
            StatusCode::NO_CONTENT => return Ok(NextComment::Exhausted),
            StatusCode::NOT_FOUND => {
                let err = Self::api_error(response).await;
                if err.message == CONVERSATION_NOT_FOUND {
                    return Err(err.into());
                }
                debug!(%conversation_id, detail = %err.message, "no remaining comments");
                return Ok(NextComment::Exhausted);
            }
            _ => {}
        }

        let body: RemainingCommentResponse =
            Self::decode(Self::check(response).await?, &endpoint).await?;
        Ok(match body.comment {
            Some(comment) => NextComment::Found {
                comment,
                num_votes: body.num_votes,
            },
            None => NextComment::Exhausted,
        })
    }

    async fn create_vote(&self, comment_id: CommentId, choice: VoteChoice) -> ClientResult<VoteAck> {
        let endpoint = self.endpoint(&["comments", &comment_id.to_string(), "vote"]);
        self.post_json(endpoint, &VoteRequest::from(choice)).await
    }

    async fn conversation(&self, conversation_id: ConversationId) -> ClientResult<Conversation> {
        self.get_json(self.endpoint(&["conversations", &conversation_id.to_string()]))
            .await
    }

    async fn conversation_comments(
        &self,
        conversation_id: ConversationId,
    ) -> ClientResult<Vec<Comment>> {
        self.get_json(self.endpoint(&[
            "conversations",
            &conversation_id.to_string(),
            "comments",
        ]))
        .await
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
