// src/main.rs
use aio_chat::commands::config::{apply_overrides, default_config_path, load_app_config};
use aio_chat::db::{default_db_path, SqliteKv};
use aio_chat::utils::image_to_data_url;
use aio_chat::{
    logging, BackendKind, ChatClient, ChatError, ChatSession, Conversation, ConversationStore,
    Effect, MemoryKv, Result, Role, StreamManager,
};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

#[derive(Debug, Parser)]
#[command(name = "aio-chat", version, about = "Streaming chat client for assistant and webhook backends")]
struct Cli {
    /// 配置文件路径
    #[arg(long, env = "AIO_CHAT_CONFIG", global = true)]
    config: Option<PathBuf>,
    /// 覆盖配置里的 apiUrl
    #[arg(long, env = "AIO_CHAT_API_URL", global = true)]
    api_url: Option<String>,
    /// 会话数据库路径
    #[arg(long, env = "AIO_CHAT_DB", global = true)]
    db: Option<PathBuf>,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 列出可用助手
    Assistants,
    /// 交互式对话
    Chat { assistant: String },
    /// 发送一条消息并等待回复
    Send {
        assistant: String,
        text: String,
        #[arg(long)]
        image: Option<PathBuf>,
    },
    /// 打印保存的对话
    History { assistant: String },
    /// 清除某个助手的对话
    Reset { assistant: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let mut config = load_app_config(&config_path)?;
    apply_overrides(&mut config, cli.api_url);

    let client = ChatClient::new(&config)?;

    if let Command::Assistants = cli.command {
        for asst in &config.assistants {
            let tools = match &asst.backend {
                BackendKind::Webhook {
                    tools_url: Some(url),
                    ..
                } => match client.tool_count(url).await {
                    Ok(n) => format!("{} tools", n),
                    Err(e) => {
                        warn!("tool count for {} unavailable: {}", asst.id, e);
                        "-".to_string()
                    }
                },
                _ => String::new(),
            };
            println!("{:<26} {:<28} {:<10} {}", asst.id, asst.name, tools, asst.description);
        }
        return Ok(());
    }

    let store = open_store(cli.db);
    let streams = StreamManager::new();

    match cli.command {
        Command::Assistants => Ok(()),
        Command::History { assistant } => {
            let session = ChatSession::open(&config, &assistant, client, store, streams)?;
            print_history(session.conversation());
            Ok(())
        }
        Command::Reset { assistant } => {
            let mut session = ChatSession::open(&config, &assistant, client, store, streams)?;
            session.reset();
            println!("Conversation with {} cleared.", session.assistant().name);
            Ok(())
        }
        Command::Send {
            assistant,
            text,
            image,
        } => {
            let mut session = ChatSession::open(&config, &assistant, client, store, streams)?;
            let attachment = image.map(image_to_data_url).transpose()?;
            session.submit(&text, attachment)?;
            while let Some(effects) = session.next_effects().await {
                render(&effects);
            }
            // 错误已经打印过，只需要非零退出码
            if session.conversation().last_error().is_some() {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Chat { assistant } => {
            let session = ChatSession::open(&config, &assistant, client, store, streams)?;
            interactive(session).await
        }
    }
}

/// SQLite 打不开时退回内存存储，对话照常进行。
fn open_store(db: Option<PathBuf>) -> ConversationStore {
    let path = match db.map(Ok).unwrap_or_else(default_db_path) {
        Ok(path) => path,
        Err(e) => {
            warn!("no database path ({}), history will not be kept", e);
            return ConversationStore::new(Arc::new(MemoryKv::new()));
        }
    };
    match SqliteKv::open(&path) {
        Ok(kv) => ConversationStore::new(Arc::new(kv)),
        Err(e) => {
            warn!("cannot open {}: {}, history will not be kept", path.display(), e);
            ConversationStore::new(Arc::new(MemoryKv::new()))
        }
    }
}

async fn interactive(mut session: ChatSession) -> Result<()> {
    print_history(session.conversation());
    eprintln!("· /image <path>, /stop, /reset, /history, /quit");
    prompt();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending_image: Option<String> = None;

    loop {
        tokio::select! {
            Some(effects) = session.next_effects(), if session.is_busy() => {
                render(&effects);
                if !session.is_busy() {
                    prompt();
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let input = line.trim();

                match input {
                    "/quit" | "/exit" => break,
                    "/stop" => {
                        if session.stop() {
                            println!();
                            eprintln!("· stopped");
                        }
                        prompt();
                    }
                    "/reset" => {
                        session.reset();
                        print_history(session.conversation());
                        prompt();
                    }
                    "/history" => {
                        print_history(session.conversation());
                        prompt();
                    }
                    _ if input.starts_with("/image") => {
                        let path = input.trim_start_matches("/image").trim();
                        match image_to_data_url(path) {
                            Ok(url) => {
                                pending_image = Some(url);
                                eprintln!("· image attached: {}", path);
                            }
                            Err(e) => eprintln!("[error] {}", e),
                        }
                        prompt();
                    }
                    _ => {
                        let superseding = session.is_busy();
                        match session.submit(&line, pending_image.take()) {
                            Ok(_) => {
                                if superseding {
                                    println!();
                                    eprintln!("· previous reply cancelled");
                                }
                                print!("{}> ", session.assistant().name);
                                flush();
                            }
                            Err(ChatError::EmptyInput) => prompt(),
                            Err(e) => {
                                eprintln!("[error] {}", e);
                                prompt();
                            }
                        }
                    }
                }
            }
        }
    }

    session.stop();
    Ok(())
}

fn render(effects: &[Effect]) {
    for effect in effects {
        match effect {
            Effect::Appended { text, .. } => {
                print!("{}", text);
                flush();
            }
            Effect::MessageSettled { .. } => println!(),
            Effect::Notice(text) => eprintln!("· {}", text),
            Effect::Error(message) => eprintln!("[error] {}", message),
            Effect::ThreadEstablished(_) | Effect::Diagnostic(_) | Effect::TurnFinished => {}
        }
    }
}

fn print_history(conversation: &Conversation) {
    for msg in conversation.transcript() {
        let who = match msg.role {
            Role::User => "you",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        };
        let image = if msg.attachment.is_some() { " [image]" } else { "" };
        println!("[{}] {}{}", who, msg.content, image);
    }
    if let Some(id) = conversation.thread_id() {
        eprintln!("· thread {}", id);
    }
}

fn prompt() {
    print!("> ");
    flush();
}

fn flush() {
    let _ = std::io::stdout().flush();
}
