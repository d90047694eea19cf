use std::fmt::Write as _;
use std::io::{self, Read, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use crate::config::SyncConfig;
use crate::journaling::day::{self, Clock};
use crate::journaling::{
    Entry, RemoteOperation, SyncPhase, SystemClock, TodayEntryController, TodayEntryHandle,
    TodaySnapshot,
};
use crate::remote::OfflineGateway;
use crate::storage::{HistoryRecord, StorageHandle};

#[derive(Args, Debug, Clone)]
pub struct EditArgs {
    /// Mood rating from 0 to 10
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub rating: Option<u8>,
    /// Replace the entry text. If omitted, piped stdin is used.
    #[arg(long)]
    pub text: Option<String>,
    /// Mark the entry as ephemeral (never archived)
    #[arg(long)]
    pub ephemeral: bool,
}

#[derive(Args, Debug, Clone)]
pub struct HistoryArgs {
    /// Number of days to print (defaults to `history_limit` from the config)
    #[arg(long)]
    pub limit: Option<usize>,
    /// Print the records as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn show_today(storage: &StorageHandle, clock: &impl Clock) -> Result<()> {
    let now = clock.now();
    let entry = match storage.load_today().context("loading today's entry")? {
        Some(entry) if day::is_today(&entry.date, now) => entry,
        _ => Entry::blank(now.date()),
    };
    print!("{}", format_entry(&entry));
    Ok(())
}

pub fn show_history(storage: &StorageHandle, args: HistoryArgs, default_limit: usize) -> Result<()> {
    let limit = args.limit.unwrap_or(default_limit);
    let records = storage
        .fetch_history(limit)
        .context("loading entry history")?;
    if args.json {
        let json = serde_json::to_string_pretty(&records).context("serializing history")?;
        println!("{json}");
    } else {
        print!("{}", format_history(&records));
    }
    Ok(())
}

pub async fn edit_today(
    sync: SyncConfig,
    storage: StorageHandle,
    clock: SystemClock,
    args: EditArgs,
) -> Result<()> {
    let text = match args.text {
        Some(text) => Some(text),
        None => read_stdin()?,
    };
    if args.rating.is_none() && text.is_none() && !args.ephemeral {
        bail!("nothing to change: pass --rating, --text or pipe text on stdin");
    }

    let handle = spawn_offline(sync, storage, clock);
    if let Some(rating) = args.rating {
        handle.set_rating(rating)?;
    }
    if let Some(text) = text {
        handle.set_text(text.trim_end().to_owned())?;
    }
    if args.ephemeral {
        handle.set_ephemeral(true)?;
    }
    handle.settled().await?;

    let mut updates = handle.subscribe();
    handle.shutdown().await?;
    let snapshot = updates.borrow_and_update().clone();
    print!("{}", format_status(&snapshot));
    Ok(())
}

pub async fn run_session(sync: SyncConfig, storage: StorageHandle, clock: SystemClock) -> Result<()> {
    let handle = spawn_offline(sync, storage, clock);
    let stdin = BufReader::new(tokio::io::stdin());
    let result = drive_session(&handle, stdin, &mut io::stdout()).await;
    let shutdown = handle.shutdown().await;
    result.and(shutdown)
}

fn spawn_offline(sync: SyncConfig, storage: StorageHandle, clock: SystemClock) -> TodayEntryHandle {
    TodayEntryController::new(sync, storage.clone(), storage, Arc::new(OfflineGateway), clock)
        .spawn()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionCommand {
    Append(String),
    Rating(u8),
    Ephemeral(bool),
    Save,
    Fetch,
    KeepServer,
    KeepLocal,
    Status,
    Quit,
}

fn parse_session_line(line: &str) -> Result<SessionCommand> {
    let Some(command) = line.strip_prefix(':') else {
        return Ok(SessionCommand::Append(line.to_owned()));
    };
    let mut parts = command.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let arg = parts.next();
    let parsed = match (name, arg) {
        ("rating", Some(value)) => {
            let rating: u8 = value
                .parse()
                .with_context(|| format!("invalid rating '{value}'"))?;
            if rating > 10 {
                bail!("rating must be between 0 and 10");
            }
            SessionCommand::Rating(rating)
        }
        ("ephemeral", Some("on")) => SessionCommand::Ephemeral(true),
        ("ephemeral", Some("off")) => SessionCommand::Ephemeral(false),
        ("save", None) => SessionCommand::Save,
        ("fetch", None) => SessionCommand::Fetch,
        ("keep-server", None) => SessionCommand::KeepServer,
        ("keep-local", None) => SessionCommand::KeepLocal,
        ("status", None) => SessionCommand::Status,
        ("quit", None) | ("q", None) => SessionCommand::Quit,
        _ => bail!("unknown command ':{command}'"),
    };
    Ok(parsed)
}

async fn drive_session<R, W>(handle: &TodayEntryHandle, input: R, out: &mut W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    write!(out, "{}", format_status(&handle.snapshot()))?;
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await.context("reading session input")? {
        let command = match parse_session_line(&line) {
            Ok(command) => command,
            Err(err) => {
                writeln!(out, "! {err:#}")?;
                continue;
            }
        };
        match command {
            SessionCommand::Quit => break,
            SessionCommand::Append(line) => handle.edit(move |entry| {
                let mut text = entry.text().to_owned();
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(&line);
                entry.text = Some(text);
            })?,
            SessionCommand::Rating(rating) => handle.set_rating(rating)?,
            SessionCommand::Ephemeral(ephemeral) => handle.set_ephemeral(ephemeral)?,
            SessionCommand::Save => handle.force_save().await?,
            SessionCommand::Fetch => handle.begin_fetch()?,
            SessionCommand::KeepServer => handle.resolve_conflict(true).await?,
            SessionCommand::KeepLocal => handle.resolve_conflict(false).await?,
            SessionCommand::Status => {
                handle.settled().await?;
                write!(out, "{}", format_status(&handle.snapshot()))?;
            }
        }
        out.flush()?;
    }
    Ok(())
}

fn read_stdin() -> Result<Option<String>> {
    if atty::is(atty::Stream::Stdin) {
        return Ok(None);
    }
    let mut buf = String::new();
    io::stdin().read_to_string(&mut buf)?;
    Ok(Some(buf))
}

fn format_entry(entry: &Entry) -> String {
    let mut out = format!("{}  rating {}/10", entry.date, entry.emotion_scale);
    if entry.ephemeral {
        out.push_str("  [EPHEMERAL]");
    }
    if entry.saved {
        out.push_str("  [SAVED]");
    }
    out.push('\n');
    if entry.text().is_empty() {
        out.push_str("    (no text)\n");
    }
    for line in entry.text().lines() {
        let _ = writeln!(&mut out, "    {line}");
    }
    out
}

fn format_status(snapshot: &TodaySnapshot) -> String {
    let mut out = format_entry(&snapshot.entry);
    let phase = match snapshot.phase {
        SyncPhase::Uninitialized => "starting",
        SyncPhase::LocalLoaded => "local copy",
        SyncPhase::RemoteReconciled => "in sync with server",
        SyncPhase::Editing => "editing",
        SyncPhase::Saving => "saving",
        SyncPhase::ConflictPending => "conflict",
    };
    let changes = if snapshot.unsaved_changes {
        "unsaved changes"
    } else {
        "no unsaved changes"
    };
    let _ = writeln!(&mut out, "-- {phase}, {changes}");
    if let Some(failure) = &snapshot.last_error {
        let operation = match failure.operation {
            RemoteOperation::Fetch => "fetch",
            RemoteOperation::Push => "save",
        };
        let _ = writeln!(&mut out, "-- last {operation} failed: {}", failure.error);
    }
    if let Some(conflict) = &snapshot.save_conflict {
        let _ = writeln!(
            &mut out,
            "-- server has rating {}/10 \"{}\", use :keep-server or :keep-local",
            conflict.remote.emotion_scale,
            first_line(conflict.remote.text(), 40)
        );
    }
    out
}

fn format_history(records: &[HistoryRecord]) -> String {
    if records.is_empty() {
        return "No archived entries.\n".to_string();
    }
    let mut out = String::new();
    for record in records {
        let _ = writeln!(
            &mut out,
            "{}  {:>2}/10  {}",
            record.day,
            record.entry.emotion_scale,
            first_line(record.entry.text(), 60)
        );
    }
    out
}

fn first_line(text: &str, max_chars: usize) -> String {
    let line = text.lines().next().unwrap_or_default().trim();
    if line.chars().count() <= max_chars {
        return line.to_string();
    }
    let mut truncated: String = line.chars().take(max_chars).collect();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journaling::{SaveConflict, SyncFailure};
    use crate::remote::RemoteError;
    use crate::storage::testing::init_storage;
    use crate::storage::LocalEntryStore;
    use assert_matches::assert_matches;
    use time::macros::{date, datetime};
    use time::UtcOffset;

    type TestResult<T = ()> = Result<T>;

    fn entry(text: &str, rating: u8) -> Entry {
        let mut entry = Entry::blank(date!(2024 - 04 - 03));
        entry.text = Some(text.into());
        entry.emotion_scale = rating;
        entry
    }

    fn snapshot(entry: Entry) -> TodaySnapshot {
        TodaySnapshot {
            phase: SyncPhase::Editing,
            entry,
            last_saved: None,
            unsaved_changes: true,
            save_conflict: None,
            last_error: None,
            rolled_over_at: None,
        }
    }

    #[test]
    fn entry_lists_text_lines_under_the_header() {
        let mut saved = entry("slept well\nwoke early", 7);
        saved.saved = true;
        insta::assert_snapshot!(format_entry(&saved), @r###"
        2024-04-03  rating 7/10  [SAVED]
            slept well
            woke early
        "###);
    }

    #[test]
    fn blank_entry_says_so() {
        let mut blank = Entry::blank(date!(2024 - 04 - 03));
        blank.ephemeral = true;
        insta::assert_snapshot!(format_entry(&blank), @r###"
        2024-04-03  rating 5/10  [EPHEMERAL]
            (no text)
        "###);
    }

    #[test]
    fn status_reports_failures_and_conflicts() {
        let mut status = snapshot(entry("draft", 3));
        status.phase = SyncPhase::ConflictPending;
        status.last_error = Some(SyncFailure {
            operation: RemoteOperation::Push,
            error: RemoteError::Unavailable("offline".into()),
            occurred_at: datetime!(2024-04-03 12:00:00 UTC),
        });
        status.save_conflict = Some(SaveConflict {
            remote: entry("final version of the day", 8),
            local: entry("draft", 3),
        });
        insta::assert_snapshot!(format_status(&status), @r###"
        2024-04-03  rating 3/10
            draft
        -- conflict, unsaved changes
        -- last save failed: remote unavailable: offline
        -- server has rating 8/10 "final version of the day", use :keep-server or :keep-local
        "###);
    }

    #[test]
    fn history_rows_are_truncated_to_one_line() {
        let long = "a".repeat(70);
        let records = vec![
            HistoryRecord {
                day: "2024-04-02".into(),
                entry: entry("tired\nbut fine", 4),
                archived_at: 0,
            },
            HistoryRecord {
                day: "2024-04-01".into(),
                entry: entry(&long, 10),
                archived_at: 0,
            },
        ];
        let rendered = format_history(&records);
        assert!(rendered.starts_with("2024-04-02   4/10  tired\n"));
        assert!(rendered.contains(&format!("2024-04-01  10/10  {}...", "a".repeat(60))));
        assert_eq!(format_history(&[]), "No archived entries.\n");
    }

    #[test]
    fn history_serializes_to_json() -> TestResult {
        let (_temp, storage) = init_storage()?;
        storage.archive_entry(&entry("steady", 6))?;
        let records = storage.fetch_history(5)?;
        let json: serde_json::Value = serde_json::to_value(&records)?;
        assert_eq!(json[0]["day"], "2024-04-03");
        assert_eq!(json[0]["entry"]["text"], "steady");
        assert_eq!(json[0]["entry"]["emotion_scale"], 6);
        Ok(())
    }

    #[test]
    fn session_lines_parse_into_commands() -> TestResult {
        assert_eq!(
            parse_session_line("felt good")?,
            SessionCommand::Append("felt good".into())
        );
        assert_eq!(parse_session_line(":rating 9")?, SessionCommand::Rating(9));
        assert_eq!(
            parse_session_line(":ephemeral on")?,
            SessionCommand::Ephemeral(true)
        );
        assert_eq!(parse_session_line(":keep-local")?, SessionCommand::KeepLocal);
        assert_eq!(parse_session_line(":q")?, SessionCommand::Quit);
        assert_matches!(parse_session_line(":rating 11"), Err(_));
        assert_matches!(parse_session_line(":rating x"), Err(_));
        assert_matches!(parse_session_line(":dance"), Err(_));
        Ok(())
    }

    #[tokio::test]
    async fn offline_session_keeps_edits_locally() -> TestResult {
        let (_temp, storage) = init_storage()?;
        let clock = SystemClock::with_offset(UtcOffset::UTC);
        let handle = spawn_offline(SyncConfig::default(), storage.clone(), clock);

        let input: &[u8] = b"first line\n:rating 8\n:bogus\nsecond line\n:status\n:quit\nignored\n";
        let mut out = Vec::new();
        drive_session(&handle, BufReader::new(input), &mut out).await?;
        handle.shutdown().await?;

        let printed = String::from_utf8(out)?;
        assert!(printed.contains("! unknown command ':bogus'"));
        assert!(printed.contains("rating 8/10"));
        assert!(!printed.contains("ignored"));

        let cached = storage.load()?.expect("mirrored entry");
        assert_eq!(cached.text(), "first line\nsecond line");
        assert_eq!(cached.emotion_scale, 8);
        assert!(!cached.saved);
        Ok(())
    }
}
