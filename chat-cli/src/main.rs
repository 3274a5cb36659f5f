use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;

use feedsync::data_model::{
    CurrentUser, LocalState, Message, MessageBody, MessageId, Profile, TempId, UserId,
};
use feedsync::supabase::{SupabaseBackend, SupabaseConfig};
use feedsync::{AuthState, Backend, BlobStore, FeedConfig, FeedSession, Severity, Upload};

mod demo;

/// Chat in a single channel from the terminal
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Channel to open (defaults to the one in the config file)
    #[arg(short, long, global = true)]
    channel: Option<String>,

    /// JSON file with feed settings: channel_id, anonymous_label, self_label,
    /// attachments_bucket, attachment_cache_seconds
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Chat against an in-process store with some seeded history
    Demo {
        /// Your display name
        #[arg(short, long, default_value = "Me")]
        name: String,

        /// Seconds between messages from the other (simulated) people
        #[arg(long, default_value_t = 20)]
        chatter_every: u64,
    },
    /// Chat against a Supabase project (reads SUPABASE_URL and SUPABASE_ANON_KEY)
    Live {
        /// Your user id in the project
        #[arg(long, env = "SUPABASE_USER_ID")]
        user_id: String,

        /// Session token of the signed-in user. Without it, requests use the anon key.
        #[arg(long, env = "SUPABASE_ACCESS_TOKEN")]
        access_token: Option<String>,

        /// Name to show on your messages while they're being sent
        #[arg(long)]
        display_name: Option<String>,
    },
}

fn main() -> Result<()> {
    // Load .env file if it exists
    dotenvy::dotenv().ok();
    env_logger::init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => FeedConfig::default(),
    };
    if let Some(channel) = args.channel {
        config.channel_id = channel.into();
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;
    // sessions aren't Send, so everything runs on this thread
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, run(args.command, config))
}

fn load_config(path: &Path) -> Result<FeedConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse config file {}", path.display()))
}

async fn run(command: Command, config: FeedConfig) -> Result<()> {
    match command {
        Command::Demo {
            name,
            chatter_every,
        } => {
            let backend = demo::seeded_backend(&config.channel_id);
            let user = CurrentUser {
                id: UserId::from("demo-me"),
                display_name: Some(name),
                avatar_url: None,
            };
            backend.add_profile(Profile {
                user_id: user.id.clone(),
                display_name: user.display_name.clone(),
                avatar_url: None,
            });

            let chatter = tokio::task::spawn_local(demo::chatter(
                backend.clone(),
                config.channel_id.clone(),
                Duration::from_secs(chatter_every),
            ));
            let result = chat(backend, user, config).await;
            chatter.abort();
            result
        }
        Command::Live {
            user_id,
            access_token,
            display_name,
        } => {
            let supabase_config =
                SupabaseConfig::from_env().context("Supabase is not configured")?;
            let mut backend = SupabaseBackend::new(supabase_config);
            match access_token {
                Some(token) => backend = backend.with_access_token(token),
                None => println!("No access token given, sending requests with the anon key"),
            }
            let user = CurrentUser {
                id: UserId::from(user_id),
                display_name,
                avatar_url: None,
            };
            chat(backend, user, config).await
        }
    }
}

type Session<B> = FeedSession<B, Rc<AuthState>>;

async fn chat<B>(backend: B, user: CurrentUser, config: FeedConfig) -> Result<()>
where
    B: Backend + BlobStore + 'static,
{
    let auth = Rc::new(AuthState::signed_in(user));
    let session = Rc::new(FeedSession::new(backend, auth, config));
    println!("Joined #{}. Type /help for commands.", session.channel_id());

    let shown = RefCell::new(HashMap::new());
    let weak = Rc::downgrade(&session);
    session.register_listener(move |_| {
        if let Some(session) = weak.upgrade() {
            render(&session, &shown);
        }
    });

    if let Err(e) = session.start().await {
        log::warn!("Initial load failed: {e}");
    }
    let pushes = tokio::task::spawn_local({
        let session = Rc::clone(&session);
        async move { session.run_push_loop().await }
    });

    let mut anonymous = false;
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines
        .next_line()
        .await
        .context("Failed to read from stdin")?
    {
        let line = line.trim();
        match line.split_once(' ').unwrap_or((line, "")) {
            ("", _) => {}
            ("/quit", _) => break,
            ("/help", _) => print_help(),
            ("/anon", _) => {
                anonymous = !anonymous;
                if anonymous {
                    println!("Sending anonymously");
                } else {
                    println!("Sending as yourself");
                }
            }
            ("/refresh", _) => {
                if let Err(e) = session.refetch().await {
                    log::warn!("Refresh failed: {e}");
                }
            }
            ("/attach", path) => match read_upload(path.trim()).await {
                Ok(upload) => {
                    let sent = session
                        .send_attachment(session.backend(), upload, anonymous)
                        .await;
                    if let Err(e) = sent {
                        log::warn!("Attachment not sent: {e}");
                    }
                }
                Err(e) => eprintln!("! {e:#}"),
            },
            ("/retry", _) => match last_failed(&session) {
                Some(temp_id) => {
                    if let Err(e) = session.retry_failed(temp_id, anonymous).await {
                        log::warn!("Retry failed: {e}");
                    }
                }
                None => println!("Nothing to retry"),
            },
            (command, _) if command.starts_with('/') => {
                eprintln!("! Unknown command {command}, try /help");
            }
            _ => {
                let sent = session
                    .send_message(MessageBody::text(line), anonymous)
                    .await;
                if let Err(e) = sent {
                    log::warn!("Message not sent: {e}");
                }
            }
        }
    }

    session.teardown();
    pushes.await.ok();
    Ok(())
}

fn print_help() {
    println!("/anon           toggle sending anonymously");
    println!("/attach <path>  upload a file and send it");
    println!("/refresh        reload the channel");
    println!("/retry          resend the last message that failed");
    println!("/quit           leave");
}

/// Prints entries that are new or changed since the last call, then any queued notices.
fn render<B>(
    session: &Session<B>,
    shown: &RefCell<HashMap<MessageId, (LocalState, Option<DateTime<Utc>>)>>,
) {
    let mut shown = shown.borrow_mut();
    for message in session.messages() {
        let seen = (message.state, message.updated_at);
        if shown.get(&message.id) == Some(&seen) {
            continue;
        }
        shown.insert(message.id.clone(), seen);
        println!("{}", format_message(&message, session.config()));
    }

    for notice in session.drain_notices() {
        match notice.severity {
            Severity::Info => println!("* {}", notice.description),
            Severity::Error => eprintln!("! {}: {}", notice.title, notice.description),
        }
    }
}

fn format_message(message: &Message, config: &FeedConfig) -> String {
    let time = message.created_at.with_timezone(&Local).format("%H:%M");
    let edited = if message.updated_at.is_some() {
        " (edited)"
    } else {
        ""
    };
    let state = match message.state {
        LocalState::Confirmed => "",
        LocalState::Pending => " (sending...)",
        LocalState::Failed => " (failed, /retry to resend)",
    };
    format!(
        "[{time}] {}: {}{edited}{state}",
        message.sender_label(config),
        message.body.preview()
    )
}

fn last_failed<B>(session: &Session<B>) -> Option<TempId> {
    session
        .messages()
        .iter()
        .rev()
        .find(|message| message.state == LocalState::Failed)
        .and_then(Message::temp_id)
}

async fn read_upload(path: &str) -> Result<Upload> {
    if path.is_empty() {
        return Err(anyhow!("Usage: /attach <path>"));
    }
    let path = Path::new(path);
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("{} is not a file name", path.display()))?
        .to_string();
    Ok(Upload {
        mime: guess_mime(&name).to_string(),
        name,
        bytes,
    })
}

fn guess_mime(name: &str) -> &'static str {
    let extension = name
        .rsplit_once('.')
        .map(|(_, extension)| extension.to_ascii_lowercase());
    match extension.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("txt") => "text/plain",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guess_mime() {
        assert_eq!(guess_mime("cat.PNG"), "image/png");
        assert_eq!(guess_mime("notes.txt"), "text/plain");
        assert_eq!(guess_mime("Makefile"), "application/octet-stream");
    }

    #[test]
    fn test_format_message_marks_local_state() {
        let config = FeedConfig::default();
        let message = Message {
            id: MessageId::Temp(TempId(1)),
            body: MessageBody::text("hi"),
            created_at: Utc::now(),
            updated_at: None,
            channel_id: config.channel_id.clone(),
            author_id: UserId::from("u1"),
            sender_name: None,
            sender_avatar: None,
            state: LocalState::Pending,
        };
        let line = format_message(&message, &config);
        assert!(line.ends_with("You: hi (sending...)"), "{line}");

        let failed = Message {
            state: LocalState::Failed,
            ..message
        };
        let line = format_message(&failed, &config);
        assert!(line.contains("Anonymous: hi"), "{line}");
        assert!(line.ends_with("(failed, /retry to resend)"), "{line}");
    }
}
