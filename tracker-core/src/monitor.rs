use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use sysinfo::System;

use crate::handler::SaveHandler;
use crate::save_file::FullStatus;

pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_PROCESS_NAME: &str = "eldenring.exe";

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Tick interval; ticks never overlap (single worker thread).
    pub interval: Duration,
    /// Game process name watched for liveness edges.
    pub process_name: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            interval: DEFAULT_MONITOR_INTERVAL,
            process_name: DEFAULT_PROCESS_NAME.to_string(),
        }
    }
}

/// Events published by the monitor over the consumer-supplied channel.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    Started {
        character_name: String,
        interval: Duration,
    },
    Stopped,
    /// Game process liveness changed (edge, not level).
    ProcessStatus(bool),
    /// One flag flipped false -> true between consecutive snapshots.
    BossDefeated { event_id: u32, play_seconds: u32 },
    /// The snapshot changed in any way; sent after the per-flag events.
    SnapshotUpdated(FullStatus),
}

enum Control {
    Start {
        save_path: PathBuf,
        slot_index: u8,
        character_name: String,
    },
    Stop,
    Shutdown,
}

/// Event IDs whose flag is true in `new` but false or absent in `old`.
///
/// A `None` old snapshot is the session's first read: flags already set are
/// prior history, not transitions.
pub fn newly_defeated(old: Option<&FullStatus>, new: &FullStatus) -> Vec<u32> {
    let Some(old) = old else {
        return Vec::new();
    };

    new.boss_statuses
        .iter()
        .filter(|(id, &defeated)| {
            defeated && !old.boss_statuses.get(id.as_str()).copied().unwrap_or(false)
        })
        .filter_map(|(id, _)| id.parse().ok())
        .collect()
}

struct Session {
    save_path: PathBuf,
    slot_index: u8,
}

struct MonitorWorker {
    handler: Box<dyn SaveHandler>,
    event_ids: Vec<u32>,
    events: mpsc::Sender<MonitorEvent>,
    config: MonitorConfig,
    session: Option<Session>,
    last_snapshot: Option<FullStatus>,
    game_running: bool,
    system: System,
}

impl MonitorWorker {
    fn run(mut self, control: mpsc::Receiver<Control>) {
        loop {
            match control.recv_timeout(self.config.interval) {
                Ok(Control::Start {
                    save_path,
                    slot_index,
                    character_name,
                }) => {
                    self.end_session();
                    info!(
                        "monitoring slot {} of {:?} every {:?}",
                        slot_index, save_path, self.config.interval
                    );
                    self.session = Some(Session {
                        save_path,
                        slot_index,
                    });
                    self.last_snapshot = None;
                    let _ = self.events.send(MonitorEvent::Started {
                        character_name,
                        interval: self.config.interval,
                    });
                    // First check right away rather than one interval later.
                    self.tick();
                }
                Ok(Control::Stop) => self.end_session(),
                Ok(Control::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => self.tick(),
            }
        }
    }

    fn end_session(&mut self) {
        if self.session.take().is_some() {
            self.last_snapshot = None;
            info!("monitoring stopped");
            let _ = self.events.send(MonitorEvent::Stopped);
        }
    }

    fn tick(&mut self) {
        let running = self.is_game_running();
        if running != self.game_running {
            debug!("game process running: {}", running);
            self.game_running = running;
            let _ = self.events.send(MonitorEvent::ProcessStatus(running));
        }

        let Some(session) = &self.session else {
            return;
        };
        if self.event_ids.is_empty() {
            return;
        }

        let new_snapshot = match self.handler.get_full_status(
            &session.save_path,
            session.slot_index,
            &self.event_ids,
        ) {
            Ok(status) => status,
            Err(e) => {
                // Transient by policy: the game may be mid-write. Keep the
                // previous snapshot and try again next tick.
                warn!("monitoring read failed: {}", e);
                return;
            }
        };

        if self.last_snapshot.as_ref() == Some(&new_snapshot) {
            return;
        }

        let play_seconds = new_snapshot.stats.seconds_played;
        for event_id in newly_defeated(self.last_snapshot.as_ref(), &new_snapshot) {
            let _ = self.events.send(MonitorEvent::BossDefeated {
                event_id,
                play_seconds,
            });
        }

        let _ = self
            .events
            .send(MonitorEvent::SnapshotUpdated(new_snapshot.clone()));
        self.last_snapshot = Some(new_snapshot);
    }

    fn is_game_running(&mut self) -> bool {
        self.system.refresh_processes();
        let target = self.config.process_name.to_ascii_lowercase();
        self.system
            .processes()
            .values()
            .any(|process| process.name().to_ascii_lowercase() == target)
    }
}

/// Polls the save file on a fixed interval from a dedicated thread and
/// publishes `MonitorEvent`s.
///
/// Only one slot is monitored at a time; `start` during an active session
/// stops it first. `stop` clears the session but keeps the thread ticking
/// for process-liveness edges; dropping the monitor shuts the thread down.
pub struct SaveMonitor {
    control: mpsc::Sender<Control>,
    worker: Option<thread::JoinHandle<()>>,
}

impl SaveMonitor {
    pub fn spawn(
        handler: Box<dyn SaveHandler>,
        event_ids: Vec<u32>,
        events: mpsc::Sender<MonitorEvent>,
        config: MonitorConfig,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::channel();
        let worker = MonitorWorker {
            handler,
            event_ids,
            events,
            config,
            session: None,
            last_snapshot: None,
            game_running: false,
            system: System::new(),
        };
        let handle = thread::spawn(move || worker.run(control_rx));
        SaveMonitor {
            control: control_tx,
            worker: Some(handle),
        }
    }

    pub fn start(&self, save_path: PathBuf, slot_index: u8, character_name: String) {
        let _ = self.control.send(Control::Start {
            save_path,
            slot_index,
            character_name,
        });
    }

    pub fn stop(&self) {
        let _ = self.control.send(Control::Stop);
    }
}

impl Drop for SaveMonitor {
    fn drop(&mut self) {
        let _ = self.control.send(Control::Shutdown);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}
