use super::*;

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{Path, State},
    http::{HeaderMap, Method, Uri},
    response::{IntoResponse, Response as AxumResponse},
    routing::{get, post, put},
    Json, Router,
};
use serde_json::json;
use shared::{error::ErrorCode, protocol::ModerationStatus};
use tokio::{
    net::TcpListener,
    sync::{oneshot, Mutex},
};

use crate::voting::{VotingController, VotingError, VotingPhase};

enum Reply {
    Json(StatusCode, Value),
    NoContent,
    Text(StatusCode, &'static str),
}

impl IntoResponse for Reply {
    fn into_response(self) -> AxumResponse {
        match self {
            Reply::Json(status, body) => (status, Json(body)).into_response(),
            Reply::NoContent => StatusCode::NO_CONTENT.into_response(),
            Reply::Text(status, body) => (status, body).into_response(),
        }
    }
}

#[derive(Clone, Default)]
struct Backend {
    remaining: Arc<Mutex<VecDeque<Reply>>>,
    fetches: Arc<AtomicUsize>,
    votes: Arc<Mutex<Vec<(String, Value)>>>,
    vote_gate: Arc<Mutex<Option<oneshot::Receiver<()>>>>,
    authorization: Arc<Mutex<Vec<Option<String>>>>,
    replies: Arc<Mutex<VecDeque<Reply>>>,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

#[derive(Debug, Clone)]
struct Recorded {
    method: Method,
    path: String,
    query: Option<String>,
    content_type: Option<String>,
    authorization: Option<String>,
    body: String,
}

impl Recorded {
    fn json(&self) -> Value {
        serde_json::from_str(&self.body).expect("json body")
    }
}

impl Backend {
    async fn push_remaining(&self, reply: Reply) {
        self.remaining.lock().await.push_back(reply);
    }

    async fn push_comment(&self, id: CommentId, content: &str, num_votes: u32) {
        self.push_remaining(Reply::Json(
            StatusCode::OK,
            json!({ "comment": { "id": id, "content": content }, "num_votes": num_votes }),
        ))
        .await;
    }

    async fn reply(&self, status: StatusCode, body: Value) {
        self.replies.lock().await.push_back(Reply::Json(status, body));
    }

    async fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().await.clone()
    }

    async fn gate_vote(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.vote_gate.lock().await = Some(rx);
        tx
    }
}

async fn remaining(
    State(backend): State<Backend>,
    Path(_conversation_id): Path<String>,
    headers: HeaderMap,
) -> Reply {
    backend.fetches.fetch_add(1, Ordering::SeqCst);
    backend.authorization.lock().await.push(
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    );
    backend.remaining.lock().await.pop_front().unwrap_or_else(|| {
        Reply::Json(
            StatusCode::NOT_FOUND,
            json!({ "detail": "No remaining comments found" }),
        )
    })
}

async fn vote(
    State(backend): State<Backend>,
    Path(comment_id): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    backend.votes.lock().await.push((comment_id, body));
    let gate = backend.vote_gate.lock().await.take();
    if let Some(gate) = gate {
        let _ = gate.await;
    }
    Json(json!({ "id": "vote-1" }))
}

fn header_text(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Records the request and answers with the next queued reply.
async fn recorded(
    State(backend): State<Backend>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Reply {
    backend.requests.lock().await.push(Recorded {
        method,
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        content_type: header_text(&headers, header::CONTENT_TYPE),
        authorization: header_text(&headers, header::AUTHORIZATION),
        body,
    });
    backend
        .replies
        .lock()
        .await
        .pop_front()
        .unwrap_or_else(|| Reply::Json(StatusCode::OK, json!({})))
}

async fn register_anonymous() -> Json<Value> {
    Json(json!({ "access_token": "anon-token", "token_type": "bearer" }))
}

async fn friendly_link(Path(link): Path<String>) -> Reply {
    if link == "town-hall" {
        Reply::Json(
            StatusCode::OK,
            json!("7d0c3f4e-8f5a-4e07-9a57-3c1a3b1f2d10"),
        )
    } else {
        Reply::Json(
            StatusCode::NOT_FOUND,
            json!({ "detail": "Conversation not found" }),
        )
    }
}

async fn conversation(Path(id): Path<String>) -> Json<Value> {
    Json(json!({
        "id": id,
        "name": "Budget priorities",
        "description": null,
        "date_created": "2024-03-10 12:30:00",
        "author": { "username": "clerk" }
    }))
}

async fn spawn_backend(backend: Backend) -> HttpApiClient {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let app = Router::new()
        .route("/conversations/:id/comments/remaining", get(remaining))
        .route("/conversations/friendly-link/:link/id", get(friendly_link))
        .route("/conversations/:id", get(conversation))
        .route("/comments/:id/vote", post(vote))
        .route("/register/anonymous", post(register_anonymous))
        .route(
            "/conversations/:id/comments",
            get(recorded).post(recorded),
        )
        .route("/moderation/conversations", get(recorded))
        .route("/moderation/conversations/:id/comments", get(recorded))
        .route("/moderation/comments/:id/approve", put(recorded))
        .route("/moderation/comments/:id/reject", put(recorded))
        .route("/analysis/conversation/:id", get(recorded))
        .route("/token", post(recorded))
        .route("/register", post(recorded))
        .route("/users/me", get(recorded))
        .route("/logout", post(recorded))
        .with_state(backend);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let settings = ClientSettings {
        api_base_url: format!("http://{addr}/"),
        ..ClientSettings::default()
    };
    HttpApiClient::new(&settings).expect("client")
}

#[tokio::test]
async fn vote_over_http_locks_input_until_next_statement_arrives() {
    let backend = Backend::default();
    let (c1, c2) = (CommentId::new_v4(), CommentId::new_v4());
    backend.push_comment(c1, "First comment", 0).await;
    backend.push_comment(c2, "Second comment", 1).await;
    let api: Arc<dyn ConversationApi> = Arc::new(spawn_backend(backend.clone()).await);
    let controller = Arc::new(VotingController::new(api, ConversationId::new_v4()));

    assert_eq!(controller.load().await, Ok(VotingPhase::Ready));
    let release = backend.gate_vote().await;

    let submit = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.submit_vote(c1, VoteChoice::Agree).await })
    };
    let mut updates = controller.watch();
    tokio::time::timeout(
        Duration::from_secs(5),
        updates.wait_for(|s| s.phase() == VotingPhase::Submitting),
    )
    .await
    .expect("submitting timeout")
    .expect("watch closed");
    assert!(controller.snapshot().is_input_locked());

    assert_eq!(
        controller.submit_vote(c1, VoteChoice::Agree).await,
        Err(VotingError::InvalidTransition {
            operation: "submit a vote",
            phase: VotingPhase::Submitting
        })
    );

    release.send(()).expect("release vote");
    assert_eq!(submit.await.expect("join"), Ok(VotingPhase::Ready));

    let session = controller.snapshot();
    assert!(!session.is_input_locked());
    assert_eq!(
        session.current_statement().map(|s| s.content.as_str()),
        Some("Second comment")
    );
    assert_eq!(backend.fetches.load(Ordering::SeqCst), 2);

    let votes = backend.votes.lock().await;
    assert_eq!(votes.len(), 1);
    assert_eq!(votes[0].0, c1.to_string());
    assert_eq!(votes[0].1, json!({ "value": 1 }));
}

#[tokio::test]
async fn no_remaining_comment_responses_mean_exhausted() {
    let backend = Backend::default();
    backend
        .push_remaining(Reply::Json(
            StatusCode::NOT_FOUND,
            json!({ "detail": "No remaining comments found" }),
        ))
        .await;
    backend.push_remaining(Reply::NoContent).await;
    backend
        .push_remaining(Reply::Json(
            StatusCode::OK,
            json!({ "comment": null, "num_votes": 7 }),
        ))
        .await;
    let client = spawn_backend(backend.clone()).await;
    let conversation_id = ConversationId::new_v4();

    for _ in 0..3 {
        assert_eq!(
            client.next_comment(conversation_id).await.expect("next"),
            NextComment::Exhausted
        );
    }
    assert_eq!(backend.fetches.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn missing_conversation_stays_an_error() {
    let backend = Backend::default();
    backend
        .push_remaining(Reply::Json(
            StatusCode::NOT_FOUND,
            json!({ "detail": "Conversation not found" }),
        ))
        .await;
    let client = spawn_backend(backend).await;

    let err = client
        .next_comment(ConversationId::new_v4())
        .await
        .expect_err("missing conversation");
    let api_err = err.api_error().expect("api error");
    assert!(api_err.is_not_found());
    assert_eq!(api_err.message, "Conversation not found");
}

#[tokio::test]
async fn error_detail_is_surfaced_to_the_user() {
    let backend = Backend::default();
    backend
        .push_remaining(Reply::Json(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "detail": "database unavailable" }),
        ))
        .await;
    let client = spawn_backend(backend).await;

    let err = client
        .next_comment(ConversationId::new_v4())
        .await
        .expect_err("server error");
    assert_eq!(err.api_error().map(|e| e.code), Some(ErrorCode::Internal));
    assert_eq!(err.user_message(), "database unavailable");
}

#[tokio::test]
async fn malformed_body_is_reported() {
    let backend = Backend::default();
    backend
        .push_remaining(Reply::Text(StatusCode::OK, "<html>oops</html>"))
        .await;
    let client = spawn_backend(backend).await;

    let err = client
        .next_comment(ConversationId::new_v4())
        .await
        .expect_err("malformed");
    assert!(matches!(err, ClientError::MalformedResponse { .. }));
}

#[tokio::test]
async fn remaining_comment_carries_backend_vote_count() {
    let backend = Backend::default();
    let id = CommentId::new_v4();
    backend.push_comment(id, "Bike lanes on Main St", 3).await;
    let client = spawn_backend(backend).await;

    match client.next_comment(ConversationId::new_v4()).await.expect("next") {
        NextComment::Found { comment, num_votes } => {
            assert_eq!(comment.id, id);
            assert_eq!(comment.content, "Bike lanes on Main St");
            assert_eq!(num_votes, 3);
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn anonymous_registration_attaches_bearer_token() {
    let backend = Backend::default();
    let client = spawn_backend(backend.clone()).await;
    let conversation_id = ConversationId::new_v4();

    client.next_comment(conversation_id).await.expect("anonymous fetch");
    assert!(!client.has_access_token().await);

    let token = client.register_anonymous().await.expect("register");
    assert_eq!(token.access_token.as_deref(), Some("anon-token"));
    assert!(client.has_access_token().await);
    client.next_comment(conversation_id).await.expect("authorized fetch");

    let seen = backend.authorization.lock().await.clone();
    assert_eq!(seen, vec![None, Some("Bearer anon-token".to_string())]);
}

#[tokio::test]
async fn friendly_link_resolves_or_falls_back_to_id() {
    let client = spawn_backend(Backend::default()).await;

    let resolved = client
        .resolve_conversation_id("town-hall")
        .await
        .expect("friendly link");
    assert_eq!(resolved.to_string(), "7d0c3f4e-8f5a-4e07-9a57-3c1a3b1f2d10");

    let raw = ConversationId::new_v4();
    assert_eq!(
        client
            .resolve_conversation_id(&raw.to_string())
            .await
            .expect("raw id"),
        raw
    );

    let err = client
        .resolve_conversation_id("no-such-link")
        .await
        .expect_err("unknown link");
    assert!(err.api_error().is_some_and(|e| e.is_not_found()));
}

#[tokio::test]
async fn conversation_accepts_naive_timestamps_and_null_description() {
    let client = spawn_backend(Backend::default()).await;
    let id = ConversationId::new_v4();

    let conversation = client.conversation(id).await.expect("conversation");
    assert_eq!(conversation.id, id);
    assert_eq!(conversation.description, None);
    assert_eq!(
        conversation.date_created.map(|d| d.to_rfc3339()),
        Some("2024-03-10T12:30:00+00:00".to_string())
    );
    assert!(conversation.allow_votes);
}

#[tokio::test]
async fn unreachable_backend_is_a_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let client = HttpApiClient::new(&ClientSettings {
        api_base_url: format!("http://{addr}"),
        ..ClientSettings::default()
    })
    .expect("client");

    let err = client
        .next_comment(ConversationId::new_v4())
        .await
        .expect_err("connection refused");
    assert!(matches!(err, ClientError::Transport { .. }));
    assert_eq!(
        err.user_message(),
        "Server unreachable; check your connection and retry."
    );
}

#[test]
fn rejects_non_http_base_url() {
    let settings = ClientSettings {
        api_base_url: "ftp://example.org".into(),
        ..ClientSettings::default()
    };
    assert!(matches!(
        HttpApiClient::new(&settings),
        Err(ClientError::InvalidBaseUrl { .. })
    ));
}

#[tokio::test]
async fn create_comment_posts_content_as_json() {
    let backend = Backend::default();
    let created_id = CommentId::new_v4();
    backend
        .reply(StatusCode::OK, json!({ "id": created_id }))
        .await;
    let client = spawn_backend(backend.clone()).await;
    let conversation_id = ConversationId::new_v4();

    let created = client
        .create_comment(conversation_id, "More bike parking downtown")
        .await
        .expect("create comment");
    assert_eq!(created.id, created_id);

    let requests = backend.requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, Method::POST);
    assert_eq!(
        requests[0].path,
        format!("/conversations/{conversation_id}/comments")
    );
    assert_eq!(requests[0].content_type.as_deref(), Some("application/json"));
    assert_eq!(
        requests[0].json(),
        json!({ "content": "More bike parking downtown" })
    );
}

#[tokio::test]
async fn comment_and_conversation_listings_decode() {
    let backend = Backend::default();
    let conversation_id = ConversationId::new_v4();
    let (pending, approved) = (CommentId::new_v4(), CommentId::new_v4());
    backend
        .reply(
            StatusCode::OK,
            json!([
                { "id": approved, "content": "Wider sidewalks", "approved": true,
                  "date_created": "2024-03-10T08:00:00" }
            ]),
        )
        .await;
    backend
        .reply(
            StatusCode::OK,
            json!([
                { "id": conversation_id, "name": "Transit plan", "description": "Bus lanes",
                  "date_created": "2024-03-01 09:00:00", "num_participants": 12 }
            ]),
        )
        .await;
    backend
        .reply(
            StatusCode::OK,
            json!([
                { "id": pending, "content": "Free buses", "user_id": "5b1f0f4e-1c1a-4d8e-8f43-6b0e4c3b9a21",
                  "approved": null },
                { "id": approved, "content": "Wider sidewalks", "user_id": "5b1f0f4e-1c1a-4d8e-8f43-6b0e4c3b9a21",
                  "approved": true }
            ]),
        )
        .await;
    let client = spawn_backend(backend.clone()).await;

    let comments = client
        .conversation_comments(conversation_id)
        .await
        .expect("comments");
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].approved, Some(true));

    let conversations = client.moderation_conversations().await.expect("conversations");
    assert_eq!(conversations[0].name, "Transit plan");
    assert_eq!(conversations[0].num_participants, Some(12));

    let moderated = client
        .moderation_comments(conversation_id)
        .await
        .expect("moderation comments");
    let statuses: Vec<_> = moderated.iter().map(|c| c.moderation_status()).collect();
    assert_eq!(
        statuses,
        vec![ModerationStatus::Pending, ModerationStatus::Approved]
    );

    let paths: Vec<_> = backend
        .requests()
        .await
        .into_iter()
        .map(|r| (r.method, r.path))
        .collect();
    assert_eq!(
        paths,
        vec![
            (Method::GET, format!("/conversations/{conversation_id}/comments")),
            (Method::GET, "/moderation/conversations".to_string()),
            (
                Method::GET,
                format!("/moderation/conversations/{conversation_id}/comments")
            ),
        ]
    );
}

#[tokio::test]
async fn approve_and_reject_use_put() {
    let backend = Backend::default();
    backend.reply(StatusCode::OK, json!({ "success": true })).await;
    backend
        .reply(StatusCode::NOT_FOUND, json!({ "detail": "Comment not found" }))
        .await;
    let client = spawn_backend(backend.clone()).await;
    let (first, second) = (CommentId::new_v4(), CommentId::new_v4());

    let ack = client.approve_comment(first).await.expect("approve");
    assert!(ack.success);
    let err = client.reject_comment(second).await.expect_err("unknown comment");
    assert_eq!(err.user_message(), "Comment not found");

    let requests = backend.requests().await;
    assert_eq!(requests[0].method, Method::PUT);
    assert_eq!(requests[0].path, format!("/moderation/comments/{first}/approve"));
    assert_eq!(requests[1].method, Method::PUT);
    assert_eq!(requests[1].path, format!("/moderation/comments/{second}/reject"));
}

#[tokio::test]
async fn analysis_requests_consensus_comments() {
    let backend = Backend::default();
    let conversation_id = ConversationId::new_v4();
    let comment_id = CommentId::new_v4();
    let user_id = "5b1f0f4e-1c1a-4d8e-8f43-6b0e4c3b9a21";
    backend
        .reply(
            StatusCode::OK,
            json!({
                "conversation_id": conversation_id,
                "comment_ids": [comment_id],
                "user_ids": [user_id],
                "comments_by_consensus": [{
                    "comment_id": comment_id,
                    "content": "Extend library hours",
                    "total_votes": 8,
                    "consensus": 0.75,
                    "participation_rate": 0.8,
                    "vote_probabilities": { "agree": 0.7, "disagree": 0.2, "skip": 0.1 },
                    "representativeness": [{ "group_id": 0, "representativeness": null }]
                }],
                "groups": [{
                    "group_id": 0,
                    "users": [user_id],
                    "representative_comments": [{
                        "group_id": 0,
                        "comment_id": comment_id,
                        "content": "Extend library hours",
                        "agree_percentage": 0.9,
                        "representativeness": 1.4
                    }]
                }]
            }),
        )
        .await;
    let client = spawn_backend(backend.clone()).await;

    let analysis = client.analysis(conversation_id).await.expect("analysis");
    assert_eq!(analysis.conversation_id, conversation_id);
    let consensus = analysis.comments_by_consensus.expect("consensus comments");
    assert_eq!(consensus[0].total_votes, 8);
    assert_eq!(consensus[0].vote_probabilities.agree, 0.7);
    assert_eq!(consensus[0].representativeness[0].representativeness, None);
    let groups = analysis.groups.expect("groups");
    let representative = groups[0]
        .representative_comments
        .as_ref()
        .expect("representative comments");
    assert_eq!(representative[0].agree_percentage, Some(0.9));

    let requests = backend.requests().await;
    assert_eq!(requests[0].method, Method::GET);
    assert_eq!(
        requests[0].path,
        format!("/analysis/conversation/{conversation_id}")
    );
    assert_eq!(
        requests[0].query.as_deref(),
        Some("include_consensus_comments=true")
    );
}

#[tokio::test]
async fn login_sends_form_and_logout_drops_token() {
    let backend = Backend::default();
    backend
        .reply(
            StatusCode::OK,
            json!({ "access_token": "named-token", "token_type": "bearer" }),
        )
        .await;
    backend
        .reply(StatusCode::OK, json!({ "username": "moderator" }))
        .await;
    backend
        .reply(StatusCode::OK, json!({ "message": "Logged out" }))
        .await;
    backend
        .reply(
            StatusCode::UNAUTHORIZED,
            json!({ "detail": "Not authenticated" }),
        )
        .await;
    let client = spawn_backend(backend.clone()).await;

    let token = client.login("moderator", "s3cret pass").await.expect("login");
    assert_eq!(token.access_token.as_deref(), Some("named-token"));
    assert!(client.has_access_token().await);

    let profile = client.me().await.expect("me");
    assert_eq!(profile.username.as_deref(), Some("moderator"));

    client.logout().await.expect("logout");
    assert!(!client.has_access_token().await);
    let err = client.me().await.expect_err("logged out");
    assert_eq!(err.api_error().map(|e| e.code), Some(ErrorCode::Unauthorized));

    let requests = backend.requests().await;
    assert_eq!((requests[0].method.clone(), requests[0].path.as_str()), (Method::POST, "/token"));
    assert_eq!(
        requests[0].content_type.as_deref(),
        Some("application/x-www-form-urlencoded")
    );
    assert_eq!(requests[0].body, "username=moderator&password=s3cret+pass");
    assert_eq!(requests[0].authorization, None);
    assert_eq!(requests[1].path, "/users/me");
    assert_eq!(requests[1].authorization.as_deref(), Some("Bearer named-token"));
    assert_eq!((requests[2].method.clone(), requests[2].path.as_str()), (Method::POST, "/logout"));
    assert_eq!(requests[3].authorization, None);
}

#[tokio::test]
async fn register_posts_credentials_and_reports_conflicts() {
    let backend = Backend::default();
    backend
        .reply(StatusCode::OK, json!({ "username": "newcomer" }))
        .await;
    backend
        .reply(
            StatusCode::CONFLICT,
            json!({ "detail": "Username already exists" }),
        )
        .await;
    let client = spawn_backend(backend.clone()).await;

    let profile = client.register("newcomer", "pw").await.expect("register");
    assert_eq!(profile.username.as_deref(), Some("newcomer"));
    assert!(!client.has_access_token().await);

    let err = client.register("newcomer", "pw").await.expect_err("taken");
    let api_err = err.api_error().expect("api error");
    assert_eq!(api_err.code, ErrorCode::Conflict);
    assert_eq!(api_err.message, "Username already exists");

    let requests = backend.requests().await;
    assert_eq!(requests[0].path, "/register");
    assert_eq!(
        requests[0].json(),
        json!({ "username": "newcomer", "password": "pw" })
    );
}
