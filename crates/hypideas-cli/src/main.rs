mod session;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;
use uuid::Uuid;

use hypideas_api::Api;
use hypideas_api::auth::AuthService;
use hypideas_api::chat_view::{ChatView, ViewUpdate, fetch_page};
use hypideas_backend::auth::{AuthClient, Session};
use hypideas_backend::{BackendConfig, RestBackend};
use hypideas_realtime::RealtimeClient;
use hypideas_state::timeline::TimelineChange;
use hypideas_types::api::{NewComment, NewMessage, NewPost, ProfileSetup, parse_tags};
use hypideas_types::models::{ChatTarget, Message, ReactionType};

#[derive(Parser, Debug)]
#[command(name = "hypideas", about = "Share ideas, discuss them and chat")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a sign-in code by SMS
    Login {
        #[arg(long)]
        phone: String,
    },
    /// Finish signing in with the code from the SMS
    Verify {
        #[arg(long)]
        phone: String,
        #[arg(long)]
        code: String,
    },
    /// Print the URL to sign in with an OAuth provider
    OauthUrl {
        #[arg(long, default_value = "google")]
        provider: String,
    },
    /// Finish an OAuth sign-in from the redirect URL the browser landed on
    OauthComplete {
        #[arg(long)]
        redirect: String,
    },
    Logout,
    Whoami,
    /// Set display name and interests; a username is generated from them
    Setup {
        #[arg(long)]
        name: String,
        /// Comma separated; omit to list the available categories
        #[arg(long)]
        interests: Option<String>,
    },
    /// Show a page of the idea feed
    Feed {
        #[arg(long, default_value_t = 0)]
        page: usize,
    },
    /// Share a new idea
    Post {
        #[arg(long)]
        title: String,
        #[arg(long)]
        content: String,
        /// Comma separated
        #[arg(long, default_value = "")]
        tags: String,
        #[arg(long)]
        category: Option<String>,
    },
    /// Show a post with its comment thread
    Thread { post_id: Uuid },
    Comment {
        post_id: Uuid,
        #[arg(long)]
        text: String,
        #[arg(long)]
        reply_to: Option<Uuid>,
    },
    /// Search people (`@name`), posts (`t/topic`) or both
    Search { text: String },
    /// Toggle a reaction (like, love, idea, fire) on a post
    React { post_id: Uuid, reaction: String },
    #[command(subcommand)]
    Chat(ChatCommand),
    Notifications {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Mark everything as read afterwards
        #[arg(long)]
        read: bool,
    },
    /// Platform statistics (admins only)
    Stats {
        #[arg(long, default_value = "7d")]
        range: String,
    },
}

#[derive(Subcommand, Debug)]
enum ChatCommand {
    /// Print recent messages and follow new ones
    Tail(TargetArgs),
    Send {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long)]
        text: String,
    },
    /// Open (or create) a direct conversation with another user
    Dm { user_id: Uuid },
    /// List direct conversations
    List,
    /// List public channels
    Channels,
}

#[derive(clap::Args, Debug)]
struct TargetArgs {
    #[arg(long, conflicts_with = "conversation", required_unless_present = "conversation")]
    channel: Option<Uuid>,
    #[arg(long)]
    conversation: Option<Uuid>,
}

impl TargetArgs {
    fn target(&self) -> Result<ChatTarget> {
        match (self.channel, self.conversation) {
            (Some(id), None) => Ok(ChatTarget::Broadcast(id)),
            (None, Some(id)) => Ok(ChatTarget::Direct(id)),
            _ => bail!("pass exactly one of --channel or --conversation"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hypideas=info,hypideas_api=debug".into()),
        )
        .init();

    let args = Args::parse();
    let config = BackendConfig::from_env().context("loading backend configuration")?;

    if let Err(e) = run(args.command, config).await {
        // Backend errors carry a message meant for people.
        match e.downcast_ref::<hypideas_api::Error>() {
            Some(api_err) => eprintln!("error: {}", api_err.user_message()),
            None => eprintln!("error: {:#}", e),
        }
        std::process::exit(1);
    }
    Ok(())
}

async fn run(command: Command, config: BackendConfig) -> Result<()> {
    let auth = AuthService::new(AuthClient::new(config.clone())?);

    match command {
        Command::Login { phone } => {
            let backend = RestBackend::new(config)?;
            let known = hypideas_api::auth::user_exists_by_phone(&backend, &phone).await?;
            let phone = auth.send_otp(&phone).await?;
            println!("Code sent to {}", phone);
            if !known {
                println!("New number: run `hypideas setup` after verifying to create your profile.");
            }
            Ok(())
        }
        Command::Verify { phone, code } => {
            let phone = hypideas_types::api::normalize_phone(&phone)?;
            let session = auth.verify_otp(&phone, &code).await?;
            session::save(&config.session_path, &session)?;
            println!("Signed in as {}", session.user_id);
            Ok(())
        }
        Command::OauthUrl { provider } => {
            println!("{}", auth.oauth_url(&provider)?);
            Ok(())
        }
        Command::OauthComplete { redirect } => {
            let redirect = Url::parse(&redirect).context("invalid redirect url")?;
            let session = auth.complete_oauth(&redirect)?;
            session::save(&config.session_path, &session)?;
            println!("Signed in as {}", session.user_id);
            Ok(())
        }
        Command::Logout => {
            if let Some(session) = session::load(&config.session_path)? {
                if let Err(e) = auth.sign_out(&session).await {
                    warn!("Sign-out request failed: {}", e);
                }
            }
            session::clear(&config.session_path)?;
            println!("Signed out");
            Ok(())
        }
        command => {
            let (api, session) = signed_in(&auth, config.clone()).await?;
            run_signed_in(command, api, session, &auth, &config).await
        }
    }
}

/// Restore the saved session, refreshing it when it has expired.
async fn signed_in(auth: &AuthService, config: BackendConfig) -> Result<(Api<RestBackend>, Session)> {
    let path = config.session_path.clone();
    let Some(saved) = session::load(&path)? else {
        bail!("not signed in; run `hypideas login --phone <number>` first");
    };
    let session = auth.ensure_fresh(saved.clone()).await?;
    if session != saved {
        session::save(&path, &session)?;
    }

    let backend = RestBackend::new(config)?;
    backend.set_access_token(Some(session.access_token.clone()));
    let api = Api::for_user(Arc::new(backend), session.user_id).await?;
    Ok((api, session))
}

async fn run_signed_in(
    command: Command,
    mut api: Api<RestBackend>,
    session: Session,
    auth: &AuthService,
    config: &BackendConfig,
) -> Result<()> {
    match command {
        Command::Setup { name, interests } => {
            let Some(interests) = interests else {
                let categories = hypideas_api::auth::interest_categories(api.backend()).await?;
                println!("Available interests: {}", categories.join(", "));
                return Ok(());
            };
            let profile = api
                .complete_profile(ProfileSetup {
                    display_name: name,
                    interests: parse_tags(&interests),
                })
                .await?;
            println!("Welcome, @{}", profile.username.as_deref().unwrap_or("?"));
        }
        Command::Whoami => {
            let me = api.me();
            println!("{} ({})", me.label(), me.id);
            if let Some(username) = &me.username {
                println!("@{}", username);
            }
            if let Some(phone) = &session.phone {
                println!("{}", phone);
            }
        }
        Command::Feed { page } => {
            let posts = api.feed(page).await?;
            let ids: Vec<Uuid> = posts.iter().map(|p| p.id).collect();
            let engagement = api.engagement_for(&ids).await?;
            for post in &posts {
                let pin = if post.is_pinned { "[pinned] " } else { "" };
                let author = post.author.as_ref().map(|a| a.label()).unwrap_or("Someone");
                println!("{}{}  by {}  ({})", pin, post.title, author, post.id);
                let reactions: Vec<String> = engagement
                    .get(&post.id)
                    .map(|e| {
                        e.tally
                            .groups()
                            .iter()
                            .map(|g| format!("{} {}", g.key.emoji(), g.count))
                            .collect()
                    })
                    .unwrap_or_default();
                println!("    {}  💬 {}", reactions.join(" "), post.comments_count);
            }
            if posts.is_empty() {
                println!("No ideas on this page");
            }
        }
        Command::Post {
            title,
            content,
            tags,
            category,
        } => {
            let post = api
                .create_post(NewPost::from_form(&title, &content, &tags, category.as_deref()))
                .await?;
            println!("Posted {}", post.id);
        }
        Command::Thread { post_id } => {
            let post = api.get_post(post_id).await?;
            println!("{}\n{}\n", post.title, post.content);
            let thread = api.load_thread(post_id).await?;
            for row in thread.display() {
                let author = row.comment.author.as_ref().map(|a| a.label()).unwrap_or("Someone");
                let indent = "  ".repeat(row.level);
                println!("{}{}: {}  ({})", indent, author, row.comment.content, row.comment.id);
                let tally = thread.reactions_for(row.comment.id);
                if tally.total() > 0 {
                    let groups: Vec<String> = tally
                        .groups()
                        .iter()
                        .map(|g| format!("{} {}", g.key.emoji(), g.count))
                        .collect();
                    println!("{}  {}", indent, groups.join(" "));
                }
                if row.hidden_replies > 0 {
                    println!("{}  ... {} more replies", indent, row.hidden_replies);
                }
            }
            if thread.is_empty() {
                println!("No comments yet");
            }
        }
        Command::Comment {
            post_id,
            text,
            reply_to,
        } => {
            let comment = api
                .add_comment(NewComment {
                    post_id,
                    parent_comment_id: reply_to,
                    content: text,
                })
                .await?;
            println!("Commented {}", comment.id);
        }
        Command::Search { text } => {
            let found = api.search(&text).await?;
            for user in &found.users {
                println!("@{}  {}  ({})", user.username.as_deref().unwrap_or("?"), user.label(), user.id);
            }
            for post in &found.posts {
                println!("{}  ({})", post.title, post.id);
            }
            if found.is_empty() {
                println!("Nothing found");
            }
        }
        Command::React { post_id, reaction } => {
            let reaction: ReactionType = reaction.to_lowercase().parse()?;
            let response = api.toggle_post_reaction(post_id, reaction).await?;
            let verb = if response.added { "Added" } else { "Removed" };
            println!("{} {} ({} total)", verb, reaction.emoji(), response.count);
        }
        Command::Chat(chat) => run_chat(chat, api, session, auth, config).await?,
        Command::Notifications { limit, read } => {
            let unread = api.unread_notification_count().await?;
            println!("{} unread", unread);
            for n in api.notifications(limit).await? {
                let marker = if n.is_read { " " } else { "*" };
                println!("{} {}  {}: {}", marker, n.created_at.format("%b %d %H:%M"), n.title, n.message);
            }
            if read {
                api.mark_all_notifications_read().await?;
            }
        }
        Command::Stats { range } => {
            let console = api.admin_console().await?;
            let analytics = console.analytics(&range).await?;
            let stats = console.platform_stats(analytics.days).await?;
            println!("Users: {} ({} new)", stats.total_users, stats.new_users);
            println!("Posts: {} ({} new)", stats.total_posts, stats.new_posts);
            println!("Comments: {}", stats.total_comments);
            println!(
                "Last {} days: {} new users, {} new posts, {} reactions, peak {} posts/day, {:.1} reactions/post",
                analytics.days,
                analytics.new_users,
                analytics.new_posts,
                analytics.new_reactions,
                analytics.peak_posts,
                analytics.reactions_per_post,
            );
            let health = console.system_health().await?;
            println!("Health: {:?}", health.overall);
        }
        Command::Login { .. }
        | Command::Verify { .. }
        | Command::OauthUrl { .. }
        | Command::OauthComplete { .. }
        | Command::Logout => bail!("command does not need a session"),
    }
    Ok(())
}

async fn run_chat(
    chat: ChatCommand,
    api: Api<RestBackend>,
    session: Session,
    auth: &AuthService,
    config: &BackendConfig,
) -> Result<()> {
    match chat {
        ChatCommand::Send { target, text } => {
            let message = api
                .send_message(NewMessage {
                    target: target.target()?,
                    content: text,
                    reply_to_message_id: None,
                })
                .await?;
            println!("Sent {}", message.id);
        }
        ChatCommand::Dm { user_id } => {
            let conversation = api.get_or_create_conversation(user_id).await?;
            println!("Conversation {}", conversation.id);
        }
        ChatCommand::List => {
            let me = api.me().id;
            for c in api.conversations().await? {
                let last = c
                    .last_message_at
                    .map(|t| t.format("%b %d %H:%M").to_string())
                    .unwrap_or_else(|| "never".into());
                println!("{}  with {}  last {}", c.id, c.other(me), last);
            }
        }
        ChatCommand::Channels => {
            for channel in api.world_channels().await? {
                let about = channel.description.as_deref().unwrap_or("");
                println!("#{}  {} members  {}  ({})", channel.name, channel.member_count, about, channel.id);
            }
        }
        ChatCommand::Tail(target) => tail(api, session, auth, config, target.target()?).await?,
    }
    Ok(())
}

async fn tail(
    api: Api<RestBackend>,
    mut session: Session,
    auth: &AuthService,
    config: &BackendConfig,
    target: ChatTarget,
) -> Result<()> {
    let client = RealtimeClient::connect(&config.realtime_url()?, Some(session.access_token.clone())).await?;
    let mut view = ChatView::new(api, Arc::new(client.clone()));

    let ticket = view.open(target)?;
    let page = fetch_page(view.api(), ticket).await?;
    view.apply_page(page);
    let mut printed = HashSet::new();
    print_new(view.messages(), &mut printed);
    info!("Following {}", target.topic());

    let mut ticks = tokio::time::interval(Duration::from_secs(1));
    let mut last_typing: Option<String> = None;
    loop {
        tokio::select! {
            update = view.next_change() => {
                match update {
                    Some(ViewUpdate::Timeline(TimelineChange::Inserted)) => print_new(view.messages(), &mut printed),
                    Some(ViewUpdate::Timeline(TimelineChange::Updated)) => println!("(a message was edited)"),
                    Some(ViewUpdate::Timeline(TimelineChange::Removed)) => println!("(a message was removed)"),
                    Some(_) => {}
                    None => {
                        warn!("Realtime feed ended");
                        break;
                    }
                }
            }
            _ = ticks.tick() => {
                if session.is_expired(Utc::now()) {
                    match refresh_session(auth, &session, config).await {
                        Ok(fresh) => {
                            view.api().backend().set_access_token(Some(fresh.access_token.clone()));
                            client.set_access_token(fresh.access_token.clone())?;
                            session = fresh;
                        }
                        // Retried on the next tick.
                        Err(e) => warn!("Session refresh failed: {:#}", e),
                    }
                }
                view.tick().await;
                let typing = view.typing_summary(Utc::now());
                if typing != last_typing {
                    if let Some(summary) = &typing {
                        println!("{}", summary);
                    }
                    last_typing = typing;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    view.close();
    client.shutdown();
    Ok(())
}

/// Refresh `session` and persist the result.
async fn refresh_session(auth: &AuthService, session: &Session, config: &BackendConfig) -> Result<Session> {
    let fresh = auth.refresh(session).await?;
    session::save(&config.session_path, &fresh)?;
    info!("Session refreshed, valid until {}", fresh.expires_at);
    Ok(fresh)
}

/// Print messages not shown yet, oldest first.
fn print_new(messages: &[Message], printed: &mut HashSet<Uuid>) {
    for message in messages {
        if printed.insert(message.id) {
            print_message(message);
        }
    }
}

fn print_message(message: &Message) {
    let author = message.author.as_ref().map(|a| a.label()).unwrap_or("Someone");
    let text = match &message.attachment {
        Some(file) => format!("[file] {}", file.url),
        None if message.is_deleted => "(deleted)".to_string(),
        None => message.content.clone(),
    };
    println!("{} {}: {}", message.created_at.format("%H:%M"), author, text);
}
