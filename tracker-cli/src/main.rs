use clap::{Parser, Subcommand};
use std::io;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use tracker_core::{
    flag_index, BossCatalog, ExternalHandler, HybridHandler, KillJournal, MonitorConfig,
    MonitorEvent, NativeHandler, SaveArchive, SaveHandler, SaveMonitor, TrackerError,
};

#[derive(Debug, Parser)]
#[command(name = "flag-extractor", version, about = "Save-file character and event-flag extractor")]
struct Args {
    #[command(subcommand)]
    command: CommandKind,
}

#[derive(Debug, Subcommand)]
enum CommandKind {
    /// Print the occupied character slots of a save file as JSON.
    ListCharacters {
        #[arg(long)]
        save_file_path: PathBuf,
    },

    /// Print stats and event-flag states for one slot as JSON.
    GetFullStatus {
        #[arg(long)]
        save_file_path: PathBuf,

        #[arg(long)]
        slot_index: u8,

        /// Comma-separated event IDs to query.
        #[arg(long, value_delimiter = ',', required = true)]
        event_ids: Vec<u32>,
    },

    /// Watch a save file and record first-kill timestamps in the journal.
    Monitor {
        #[arg(long)]
        save_file_path: PathBuf,

        #[arg(long)]
        slot_index: u8,

        #[arg(long, default_value_t = 5)]
        interval_secs: u64,

        /// Game process name watched for liveness.
        #[arg(long)]
        process_name: Option<String>,

        /// Secondary decoder binary to fall back to when the in-process
        /// decoder rejects the file.
        #[arg(long)]
        external_cli: Option<PathBuf>,

        #[arg(long)]
        journal_path: Option<PathBuf>,
    },
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(err) = run(args) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> tracker_core::Result<()> {
    match args.command {
        CommandKind::ListCharacters { save_file_path } => {
            let characters = SaveArchive::load(&save_file_path)?.list_characters()?;
            println!("{}", serde_json::to_string(&characters)?);
        }

        CommandKind::GetFullStatus {
            save_file_path,
            slot_index,
            event_ids,
        } => {
            let block_map = flag_index::shared();
            let status = SaveArchive::load(&save_file_path)?.get_full_status(
                slot_index,
                &event_ids,
                &block_map,
            )?;
            println!("{}", serde_json::to_string(&status)?);
        }

        CommandKind::Monitor {
            save_file_path,
            slot_index,
            interval_secs,
            process_name,
            external_cli,
            journal_path,
        } => {
            monitor(
                save_file_path,
                slot_index,
                Duration::from_secs(interval_secs),
                process_name,
                external_cli,
                journal_path,
            )?;
        }
    }

    Ok(())
}

fn monitor(
    save_file_path: PathBuf,
    slot_index: u8,
    interval: Duration,
    process_name: Option<String>,
    external_cli: Option<PathBuf>,
    journal_path: Option<PathBuf>,
) -> tracker_core::Result<()> {
    let catalog = BossCatalog::builtin();
    let journal_path = journal_path.or_else(KillJournal::default_path).ok_or_else(|| {
        TrackerError::Io(io::Error::other(
            "could not determine a home directory for the kill journal",
        ))
    })?;
    let mut journal = KillJournal::open(journal_path);

    // The monitored character's name doubles as the journal key.
    let mut primary = NativeHandler::new();
    let characters = primary.list_characters(&save_file_path)?;
    let character_name = characters
        .iter()
        .find(|c| c.slot_index == slot_index)
        .map(|c| c.character_name.clone())
        .ok_or(TrackerError::NoCharactersFound)?;

    let handler: Box<dyn SaveHandler> = match external_cli {
        Some(cli_path) => Box::new(HybridHandler::new(
            Box::new(primary),
            Box::new(ExternalHandler::new(cli_path)),
        )),
        None => Box::new(primary),
    };

    let mut config = MonitorConfig {
        interval,
        ..MonitorConfig::default()
    };
    if let Some(name) = process_name {
        config.process_name = name;
    }

    let (events_tx, events_rx) = mpsc::channel();
    let monitor = SaveMonitor::spawn(handler, catalog.all_event_ids(), events_tx, config);
    monitor.start(save_file_path, slot_index, character_name.clone());

    for event in events_rx {
        match event {
            MonitorEvent::Started {
                character_name,
                interval,
            } => {
                println!("Monitoring '{character_name}' every {}s", interval.as_secs());
            }
            MonitorEvent::Stopped => {
                println!("Monitoring stopped");
                break;
            }
            MonitorEvent::ProcessStatus(running) => {
                println!("Game process running: {running}");
            }
            MonitorEvent::BossDefeated {
                event_id,
                play_seconds,
            } => {
                let name = catalog.name_by_id(event_id).unwrap_or("Unknown Boss");
                println!("{name} defeated at {play_seconds}s (event {event_id})");
                journal.add_timestamp(&character_name, event_id, play_seconds)?;
            }
            MonitorEvent::SnapshotUpdated(status) => {
                let (defeated, total) = catalog.defeated_counts(&status.boss_statuses);
                println!(
                    "{}: level {}, {}s played, {defeated}/{total} bosses down",
                    status.stats.character_name, status.stats.level, status.stats.seconds_played
                );
            }
        }
    }

    Ok(())
}
