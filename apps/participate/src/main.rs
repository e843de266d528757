use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, ConversationApi, ConversationFilter, HttpApiClient, NotificationEvent,
    NotificationKind, NotificationQueue, ParticipationProgress, VotingController, VotingPhase,
    VotingState,
};
use shared::domain::{CommentId, VoteChoice};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    task::JoinHandle,
};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const COMMENT_SUBMITTED: &str =
    "Your comment has been submitted. Other participants will start voting on it.";
const COMMENT_FAILED: &str = "Failed to submit comment. Please try again.";

#[derive(Parser, Debug)]
#[command(about = "Take part in deliberation conversations from the terminal")]
struct Cli {
    /// Backend address; overrides client.toml and the environment.
    #[arg(long, global = true)]
    api_url: Option<String>,
    /// Used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
    #[arg(long, global = true, requires = "password")]
    username: Option<String>,
    #[arg(long, global = true, requires = "username")]
    password: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Vote on the statements of a conversation, one at a time.
    Vote {
        /// Conversation id or friendly link.
        conversation: String,
    },
    /// List conversations you moderate.
    Conversations {
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
    },
    /// Print the opinion-group analysis of a conversation as JSON.
    Analysis { conversation: String },
    /// Submit a new statement to a conversation.
    Comment {
        conversation: String,
        content: String,
    },
    /// List submitted statements of a conversation you moderate, optionally
    /// approving or rejecting some of them first.
    Moderate {
        conversation: String,
        #[arg(long)]
        approve: Vec<CommentId>,
        #[arg(long)]
        reject: Vec<CommentId>,
    },
    /// Create an account from --username and --password.
    Register,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let mut settings = load_settings();
    if let Some(api_url) = cli.api_url {
        settings.api_base_url = api_url;
    }
    let client = Arc::new(HttpApiClient::new(&settings)?);
    let notifications = NotificationQueue::for_current_runtime(settings.notification_timeout())?;
    let printer = spawn_notification_printer(&notifications);

    if let (Some(username), Some(password)) = (&cli.username, &cli.password) {
        if matches!(cli.command, Command::Register) {
            let profile = client.register(username, password).await?;
            println!(
                "Registered {}",
                profile.username.as_deref().unwrap_or(username)
            );
            return Ok(());
        }
        client
            .login(username, password)
            .await
            .context("login failed")?;
        let profile = client.me().await?;
        info!(username = profile.username.as_deref().unwrap_or("-"), "session ready");
    }

    let outcome = match cli.command {
        Command::Vote { conversation } => {
            run_vote(Arc::clone(&client), Arc::clone(&notifications), &conversation).await
        }
        Command::Conversations { search, from, to } => {
            list_conversations(&client, search, from, to).await
        }
        Command::Analysis { conversation } => {
            let conversation_id = client.resolve_conversation_id(&conversation).await?;
            let analysis = client.analysis(conversation_id).await?;
            println!("{}", serde_json::to_string_pretty(&analysis)?);
            Ok(())
        }
        Command::Comment {
            conversation,
            content,
        } => submit_comment(&client, &notifications, &conversation, &content).await,
        Command::Moderate {
            conversation,
            approve,
            reject,
        } => moderate(&client, &conversation, &approve, &reject).await,
        Command::Register => Err(anyhow::anyhow!("register needs --username and --password")),
    };

    drop(notifications);
    let _ = printer.await;
    outcome
}

/// Prints notifications as they are shown; ends once the queue is dropped.
fn spawn_notification_printer(queue: &NotificationQueue) -> JoinHandle<()> {
    let mut events = BroadcastStream::new(queue.subscribe());
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                Ok(NotificationEvent::Shown(notification)) => match notification.kind {
                    NotificationKind::Success => println!("[ok] {}", notification.message),
                    NotificationKind::Error => eprintln!("[error] {}", notification.message),
                },
                Ok(NotificationEvent::Dismissed { .. }) => {}
                Err(err) => warn!("notification display lagged: {err}"),
            }
        }
    })
}

async fn ensure_participant(client: &HttpApiClient) -> Result<()> {
    if !client.has_access_token().await {
        client
            .register_anonymous()
            .await
            .context("anonymous registration failed")?;
    }
    Ok(())
}

fn parse_choice(input: &str) -> Option<VoteChoice> {
    match input.to_ascii_lowercase().as_str() {
        "a" | "agree" => Some(VoteChoice::Agree),
        "d" | "disagree" => Some(VoteChoice::Disagree),
        "s" | "skip" | "pass" => Some(VoteChoice::Skip),
        _ => None,
    }
}

async fn run_vote(
    client: Arc<HttpApiClient>,
    notifications: Arc<NotificationQueue>,
    conversation: &str,
) -> Result<()> {
    ensure_participant(&client).await?;
    let conversation_id = client.resolve_conversation_id(conversation).await?;
    let total = match client.conversation_comments(conversation_id).await {
        Ok(comments) => Some(comments.len()),
        Err(err) => {
            warn!(%conversation_id, "comment count unavailable: {err}");
            None
        }
    };

    match client.conversation(conversation_id).await {
        Ok(conversation) => {
            println!("{}", conversation.name);
            if let Some(description) = conversation.description.filter(|d| !d.is_empty()) {
                println!("{description}");
            }
        }
        Err(err) => warn!(%conversation_id, "conversation details unavailable: {err}"),
    }

    let api: Arc<dyn ConversationApi> = client;
    let controller =
        VotingController::new(api, conversation_id).with_notifications(notifications);
    controller.load().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        // Lets the printer show any notification before the next prompt.
        tokio::task::yield_now().await;
        let session = controller.snapshot();
        match &session.state {
            VotingState::Ready { statement } => {
                match total {
                    Some(total) => println!(
                        "\n{} ({})",
                        statement.label(),
                        ParticipationProgress::new(session.voted_count, total)
                    ),
                    None => println!("\n{}", statement.label()),
                }
                println!("  {}", statement.content);
                println!("[a]gree / [d]isagree / [s]kip / [q]uit");
            }
            VotingState::Exhausted => {
                println!("You've voted on every comment in this conversation. Thank you!");
                break;
            }
            VotingState::Error { message, .. } => {
                println!("{message}");
                println!("[r]etry / [q]uit");
            }
            VotingState::Loading | VotingState::Submitting { .. } => {
                let mut updates = controller.watch();
                updates
                    .wait_for(|s| {
                        !matches!(s.phase(), VotingPhase::Loading | VotingPhase::Submitting)
                    })
                    .await?;
                continue;
            }
        }

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        if input.eq_ignore_ascii_case("q") {
            break;
        }

        match session.phase() {
            VotingPhase::Ready => {
                let (Some(choice), Some(statement)) =
                    (parse_choice(input), session.current_statement())
                else {
                    println!("Unrecognized choice '{input}'");
                    continue;
                };
                let phase = controller.submit_vote(statement.id, choice).await?;
                info!(%conversation_id, %phase, "vote handled");
            }
            VotingPhase::Error if input.eq_ignore_ascii_case("r") => {
                controller.retry().await?;
            }
            _ => println!("Unrecognized choice '{input}'"),
        }
    }

    controller.close();
    Ok(())
}

async fn list_conversations(
    client: &HttpApiClient,
    search: Option<String>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Result<()> {
    let conversations = client
        .moderation_conversations()
        .await
        .context("listing conversations requires --username and --password")?;
    let filter = ConversationFilter::spanning(&conversations)
        .with_range(from, to)
        .with_query(search.unwrap_or_default());

    for conversation in filter.apply(&conversations) {
        let created = conversation
            .date_created
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "-".to_string());
        let participants = conversation
            .num_participants
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {created}  {participants:>4}  {}",
            conversation.id, conversation.name
        );
    }
    println!("{}", filter.summarize(&conversations));
    Ok(())
}

async fn submit_comment(
    client: &HttpApiClient,
    notifications: &Arc<NotificationQueue>,
    conversation: &str,
    content: &str,
) -> Result<()> {
    ensure_participant(client).await?;
    let conversation_id = client.resolve_conversation_id(conversation).await?;
    match client.create_comment(conversation_id, content).await {
        Ok(created) => {
            notifications.success(COMMENT_SUBMITTED);
            info!(comment_id = %created.id, "comment created");
            Ok(())
        }
        Err(err) => {
            notifications.error(COMMENT_FAILED);
            Err(err.into())
        }
    }
}

async fn moderate(
    client: &HttpApiClient,
    conversation: &str,
    approve: &[CommentId],
    reject: &[CommentId],
) -> Result<()> {
    for comment_id in approve {
        client.approve_comment(*comment_id).await?;
    }
    for comment_id in reject {
        client.reject_comment(*comment_id).await?;
    }

    let conversation_id = client.resolve_conversation_id(conversation).await?;
    let comments = client
        .moderation_comments(conversation_id)
        .await
        .context("moderating requires --username and --password of the author")?;
    for comment in &comments {
        println!(
            "{}  {:<8}  {}",
            comment.id,
            comment.moderation_status().label(),
            comment.content
        );
    }
    println!("{} comments", comments.len());
    Ok(())
}
