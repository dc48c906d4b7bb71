//! Tandem terminal client.
//!
//! Joins a room on a relay server, mirrors one document to stdout and reads
//! edit commands from stdin:
//!
//! ```text
//! insert <pos> <text>   delete <pos> <len>   cursor <pos>
//! show                  users                quit
//! ```

use std::path::PathBuf;

use clap::Parser;
use log::{error, info, warn};
use tandem_collab::{
    backoff_delay, CursorPosition, DocumentHandle, Room, RoomConfig, RoomError, RoomEvent,
    RoomInfo, User, MAX_BACKOFF,
};
use tokio::io::{AsyncBufReadExt, BufReader};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "tandem")]
#[command(about = "Edit a shared document from the terminal")]
struct Args {
    /// Relay server base URL
    #[arg(short, long, default_value = "ws://127.0.0.1:9090")]
    server: String,

    /// Room to join
    #[arg(short, long)]
    room: String,

    /// Project the room belongs to
    #[arg(short, long, default_value = "default")]
    project: String,

    /// Display name; the user id is generated
    #[arg(short, long, default_value = "anonymous")]
    name: String,

    /// Document to open
    #[arg(short, long, default_value = "main")]
    document: String,

    /// Seed content when the document is new to this client
    #[arg(long, default_value = "")]
    initial: String,

    /// JSON file with room options (camelCase keys)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

enum Command {
    Insert(u32, String),
    Delete(u32, u32),
    Cursor(u32),
    Show,
    Users,
    Quit,
}

fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
    let number = |s: &str| {
        s.trim()
            .parse::<u32>()
            .map_err(|_| format!("expected a number, got {s:?}"))
    };
    match verb {
        "insert" => {
            let (pos, text) = rest
                .split_once(' ')
                .ok_or("usage: insert <pos> <text>")?;
            Ok(Command::Insert(number(pos)?, text.to_string()))
        }
        "delete" => {
            let (pos, len) = rest
                .split_once(' ')
                .ok_or("usage: delete <pos> <len>")?;
            Ok(Command::Delete(number(pos)?, number(len)?))
        }
        "cursor" => Ok(Command::Cursor(number(rest)?)),
        "show" => Ok(Command::Show),
        "users" => Ok(Command::Users),
        "quit" | "exit" => Ok(Command::Quit),
        "" => Err("empty command".into()),
        other => Err(format!("unknown command {other:?}")),
    }
}

fn load_config(path: Option<&PathBuf>) -> RoomConfig {
    let Some(path) = path else {
        return RoomConfig::default();
    };
    match std::fs::read_to_string(path).map(|text| RoomConfig::from_json(&text)) {
        Ok(Ok(config)) => config,
        Ok(Err(e)) => {
            warn!("Ignoring invalid config {}: {e}", path.display());
            RoomConfig::default()
        }
        Err(e) => {
            warn!("Cannot read config {}: {e}", path.display());
            RoomConfig::default()
        }
    }
}

/// Dial until the relay answers, paced like the transport's own reconnect
/// schedule. Returns whether the room came online.
async fn connect_with_retry(room: Room) -> bool {
    let config = room.config().clone();
    let mut attempt = 0;
    loop {
        match room.connect().await {
            Ok(()) => return true,
            Err(RoomError::Destroyed) => return false,
            Err(e) if attempt >= config.max_reconnect_attempts => {
                warn!("Giving up after {attempt} retries: {e}");
                return false;
            }
            Err(e) => {
                attempt += 1;
                let delay = backoff_delay(config.reconnect_interval(), attempt, MAX_BACKOFF);
                info!("Connect failed ({e}), retry {attempt} in {delay:?}");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn print_document(doc: &DocumentHandle) {
    match doc.content() {
        Ok(content) => println!("[{}] {content}", doc.document_id()),
        Err(e) => println!("[{}] <{e}>", doc.document_id()),
    }
}

fn run(room: &Room, doc: &DocumentHandle, command: Command) -> bool {
    let result = match command {
        Command::Insert(pos, text) => doc.insert(pos, &text).map(|_| ()),
        Command::Delete(pos, len) => doc.delete(pos, len).map(|_| ()),
        Command::Cursor(offset) => {
            room.update_cursor(CursorPosition {
                document_id: Some(doc.document_id().to_string()),
                offset,
            });
            Ok(())
        }
        Command::Show => Ok(()),
        Command::Users => {
            for user in room.users() {
                let cursor = room
                    .presence(&user.id)
                    .and_then(|p| p.cursor)
                    .map(|c| c.offset.to_string())
                    .unwrap_or_else(|| "-".into());
                println!("  {} ({}) cursor {cursor}", user.display_name, user.id);
            }
            return true;
        }
        Command::Quit => return false,
    };
    match result {
        Ok(()) => print_document(doc),
        Err(e) => println!("error: {e}"),
    }
    true
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let config = load_config(args.config.as_ref());
    let info = RoomInfo {
        room_id: args.room.clone(),
        project_id: args.project.clone(),
        local_user: User::new(args.name.clone()),
    };
    let room = Room::with_websocket(&args.server, info, config);
    let doc = match room.open_document(&args.document, &args.initial) {
        Ok(doc) => doc,
        Err(e) => {
            error!("Cannot open document {}: {e}", args.document);
            return;
        }
    };
    let mut events = room.events();

    // Edits queue locally until the relay is reachable.
    let dialer = tokio::spawn(connect_with_retry(room.clone()));
    print_document(&doc);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(RoomEvent::DocumentChanged { document_id, .. }) if document_id == args.document => {
                    print_document(&doc);
                }
                Some(RoomEvent::UserJoined(user)) => println!("* {} joined", user.display_name),
                Some(RoomEvent::UserLeft { user_id }) => println!("* {user_id} left"),
                Some(RoomEvent::Reconnecting { attempt, delay }) => {
                    info!("Reconnect attempt {attempt} in {delay:?}");
                }
                Some(RoomEvent::SyncError(e)) => warn!("{e}"),
                Some(_) => {}
                None => break,
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => match parse_command(&line) {
                    Ok(command) => {
                        if !run(&room, &doc, command) {
                            break;
                        }
                    }
                    Err(e) => println!("{e}"),
                },
                Ok(None) => break,
                Err(e) => {
                    error!("stdin: {e}");
                    break;
                }
            },
        }
    }

    dialer.abort();
    room.destroy();
}
