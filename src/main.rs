use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use frontier::cleanup::{BatchReport, CleanupReport, SkippedEntry, run_cleanup_batch};
use frontier::config::{default_config_yaml, load_config};
use frontier::graph::{Event, GraphError};
use frontier::store::SqliteStore;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

#[derive(Debug)]
struct CliError {
    code: &'static str,
    message: String,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<GraphError> for CliError {
    fn from(value: GraphError) -> Self {
        let code = match &value {
            GraphError::NotFound(_) => "not_found",
            GraphError::Invariant(_) => "invariant_violation",
            GraphError::Storage(_) => "storage_error",
        };
        Self::new(code, value.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(value: serde_json::Error) -> Self {
        Self::new("json_error", value.to_string())
    }
}

#[derive(Parser, Debug)]
#[command(name = "frontier")]
#[command(about = "A soft-failure-aware forward extremity store for room event graphs")]
struct Cli {
    /// Directory holding the store; defaults to ./.frontier
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the store directory, database, and a default config.
    Init,
    /// Create and persist an event, updating the room frontier.
    Send(SendArgs),
    /// Print the current forward extremities of a room.
    Heads(HeadsArgs),
    /// List rooms known to the store.
    Rooms,
    /// Force an event id into a room's extremity table (administrative).
    AddHead(AddHeadArgs),
    /// Re-validate the extremity table in resumable batches.
    Cleanup(CleanupArgs),
}

#[derive(Args, Debug)]
struct SendArgs {
    room: String,
    /// Explicit prev events; defaults to the room's current extremities.
    #[arg(long)]
    prev: Vec<String>,
    /// Persist the event as soft-failed (normally decided by authorization).
    #[arg(long)]
    soft_failed: bool,
    #[arg(long, default_value = "")]
    body: String,
}

#[derive(Args, Debug)]
struct HeadsArgs {
    room: String,
}

#[derive(Args, Debug)]
struct AddHeadArgs {
    room: String,
    event_id: String,
}

#[derive(Args, Debug)]
struct CleanupArgs {
    /// Entries per batch; defaults to the configured cleanup_batch_size.
    #[arg(long)]
    batch_size: Option<usize>,
    /// Run a single batch increment and stop.
    #[arg(long)]
    one_batch: bool,
}

#[derive(Debug, Clone)]
struct StorePaths {
    root: PathBuf,
    index: PathBuf,
    config: PathBuf,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let payload = json!({
                "error": {
                    "code": err.code,
                    "message": err.message,
                }
            });
            eprintln!("{payload}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let root = cli
        .data_dir
        .unwrap_or_else(|| PathBuf::from(".frontier"));
    let paths = StorePaths {
        index: root.join("frontier.db"),
        config: root.join("config.yml"),
        root,
    };
    match cli.command {
        Command::Init => cmd_init(&paths),
        Command::Send(args) => cmd_send(&paths, args),
        Command::Heads(args) => cmd_heads(&paths, args),
        Command::Rooms => cmd_rooms(&paths),
        Command::AddHead(args) => cmd_add_head(&paths, args),
        Command::Cleanup(args) => cmd_cleanup(&paths, args),
    }
}

fn cmd_init(paths: &StorePaths) -> Result<(), CliError> {
    fs::create_dir_all(&paths.root)
        .map_err(|err| CliError::new("mkdir_error", err.to_string()))?;
    let _ = SqliteStore::open(&paths.index)?;
    if !paths.config.exists() {
        fs::write(&paths.config, default_config_yaml())
            .map_err(|err| CliError::new("config_write_error", err.to_string()))?;
    }

    print_json(&json!({
        "status": "ok",
        "frontier_dir": paths.root,
        "index": paths.index,
    }))
}

fn cmd_send(paths: &StorePaths, args: SendArgs) -> Result<(), CliError> {
    let store = open_store(paths)?;
    let prev_event_ids = if args.prev.is_empty() {
        store.current_extremities(&args.room)?
    } else {
        args.prev
    };

    let received_at = Utc::now().to_rfc3339();
    let event_id = derive_event_id(
        &args.room,
        &prev_event_ids,
        args.soft_failed,
        &args.body,
        &received_at,
    );
    let event = Event {
        event_id: event_id.clone(),
        room_id: args.room.clone(),
        prev_event_ids: prev_event_ids.clone(),
        soft_failed: args.soft_failed,
        received_at,
    };
    store.insert_event(&event)?;

    print_json(&json!({
        "event_id": event_id,
        "room_id": args.room,
        "prev_events": prev_event_ids,
        "soft_failed": args.soft_failed,
        "extremities": store.current_extremities(&args.room)?,
    }))
}

fn cmd_heads(paths: &StorePaths, args: HeadsArgs) -> Result<(), CliError> {
    let store = open_store(paths)?;
    print_json(&json!({
        "room_id": args.room,
        "extremities": store.current_extremities(&args.room)?,
    }))
}

fn cmd_rooms(paths: &StorePaths) -> Result<(), CliError> {
    let store = open_store(paths)?;
    print_json(&json!({ "rooms": store.rooms()? }))
}

fn cmd_add_head(paths: &StorePaths, args: AddHeadArgs) -> Result<(), CliError> {
    let store = open_store(paths)?;
    store.add_extremity(&args.room, &args.event_id)?;
    print_json(&json!({
        "status": "ok",
        "room_id": args.room,
        "extremities": store.current_extremities(&args.room)?,
    }))
}

fn cmd_cleanup(paths: &StorePaths, args: CleanupArgs) -> Result<(), CliError> {
    let store = open_store(paths)?;
    let config = load_config(&paths.config)
        .map_err(|err| CliError::new("config_error", err.to_string()))?;
    let budget = args.batch_size.unwrap_or(config.cleanup_batch_size);

    if args.one_batch {
        let batch = run_cleanup_batch(&store, budget)?;
        return print_json(&batch_payload(&batch));
    }

    // Stop between batches on Ctrl-C; a committed batch is never rolled back
    // and the next run resumes from the persisted cursor.
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        let _ = ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst));
    }

    let mut report = CleanupReport::default();
    let interrupted = loop {
        let batch = run_cleanup_batch(&store, budget)?;
        if batch.done {
            break false;
        }
        report.batches += 1;
        report.examined += batch.examined;
        report.removed += batch.removed.len();
        report.skipped.extend(batch.skipped);
        if stop.load(Ordering::SeqCst) {
            break true;
        }
    };

    print_json(&json!({
        "status": if interrupted { "interrupted" } else { "done" },
        "batches": report.batches,
        "examined": report.examined,
        "removed": report.removed,
        "skipped": skipped_payload(&report.skipped),
    }))
}

fn batch_payload(batch: &BatchReport) -> Value {
    json!({
        "done": batch.done,
        "examined": batch.examined,
        "removed": batch
            .removed
            .iter()
            .map(|(room_id, event_id)| json!({ "room_id": room_id, "event_id": event_id }))
            .collect::<Vec<_>>(),
        "skipped": skipped_payload(&batch.skipped),
    })
}

fn skipped_payload(skipped: &[SkippedEntry]) -> Value {
    Value::Array(
        skipped
            .iter()
            .map(|entry| {
                json!({
                    "room_id": entry.room_id,
                    "event_id": entry.event_id,
                    "reason": entry.reason,
                })
            })
            .collect(),
    )
}

fn open_store(paths: &StorePaths) -> Result<SqliteStore, CliError> {
    if !paths.root.exists() || !paths.index.exists() {
        return Err(CliError::new(
            "not_initialized",
            "store is not initialized; run `frontier init`",
        ));
    }
    Ok(SqliteStore::open(&paths.index)?)
}

fn derive_event_id(
    room_id: &str,
    prev_event_ids: &[String],
    soft_failed: bool,
    body: &str,
    received_at: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(room_id.as_bytes());
    for prev in prev_event_ids {
        hasher.update(b"\0");
        hasher.update(prev.as_bytes());
    }
    hasher.update(if soft_failed { b"\0f" } else { b"\0a" });
    hasher.update(b"\0");
    hasher.update(body.as_bytes());
    hasher.update(b"\0");
    hasher.update(received_at.as_bytes());
    let digest = hasher.finalize();

    let mut out = String::with_capacity(1 + digest.len() * 2);
    out.push('$');
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string(value)?;
    println!("{rendered}");
    Ok(())
}
