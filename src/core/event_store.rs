//! Append-only run log.
//!
//! One directory per run, `<runs_dir>/<run-id>/events.jsonl`, one JSON
//! event per line. The executor is the only writer for a run. A process
//! killed mid-write can leave a torn last line; replay drops it with a
//! warning, while corruption anywhere else is an error.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

use super::plan::Plan;
use crate::domain::{Event, EventType};

const EVENTS_FILE: &str = "events.jsonl";

/// JSONL event log for a single run
pub struct EventStore {
    run_dir: PathBuf,
    events_path: PathBuf,
}

impl EventStore {
    /// Open the log for a run, creating its directory
    pub async fn open(runs_dir: &Path, run_id: Uuid) -> Result<Self> {
        let store = Self::at(runs_dir, run_id);

        fs::create_dir_all(&store.run_dir).await.with_context(|| {
            format!("Failed to create run directory: {}", store.run_dir.display())
        })?;

        Ok(store)
    }

    /// Open the log of a run that already exists
    pub fn open_existing(runs_dir: &Path, run_id: Uuid) -> Option<Self> {
        let store = Self::at(runs_dir, run_id);
        store.run_dir.is_dir().then_some(store)
    }

    fn at(runs_dir: &Path, run_id: Uuid) -> Self {
        let run_dir = runs_dir.join(run_id.to_string());
        let events_path = run_dir.join(EVENTS_FILE);
        Self {
            run_dir,
            events_path,
        }
    }

    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Append one event as a single line
    pub async fn append(&self, event: &Event) -> Result<()> {
        let mut line = serde_json::to_vec(event).context("Failed to serialize event")?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open run log: {}", self.events_path.display()))?;

        file.write_all(&line)
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// All events in append order
    pub async fn replay(&self) -> Result<Vec<Event>> {
        let content = match fs::read_to_string(&self.events_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read run log: {}", self.events_path.display())
                })
            }
        };

        let lines: Vec<(usize, &str)> = content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .collect();
        let last = lines.len().saturating_sub(1);

        let mut events = Vec::with_capacity(lines.len());
        for (idx, (number, line)) in lines.into_iter().enumerate() {
            match serde_json::from_str::<Event>(line) {
                Ok(event) => events.push(event),
                Err(e) if idx == last && !content.ends_with('\n') => {
                    warn!(
                        path = %self.events_path.display(),
                        line = number + 1,
                        error = %e,
                        "Dropping torn last line of run log"
                    );
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!(
                            "Corrupt event at {}:{}",
                            self.events_path.display(),
                            number + 1
                        )
                    })
                }
            }
        }

        Ok(events)
    }

    /// The plan recorded at the start of the run
    pub async fn load_plan(&self) -> Result<Option<Plan>> {
        let recorded = self
            .replay()
            .await?
            .into_iter()
            .find(|e| e.event_type == EventType::PlanRecorded)
            .and_then(|e| e.data);

        recorded
            .map(|data| serde_json::from_value(data).context("Failed to parse recorded plan"))
            .transpose()
    }

    /// Ids of every run directory under `runs_dir`
    pub async fn list_runs(runs_dir: &Path) -> Result<Vec<Uuid>> {
        let mut entries = match fs::read_dir(runs_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read runs directory: {}", runs_dir.display())
                })
            }
        };

        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let parsed = entry
                .file_name()
                .to_str()
                .and_then(|name| Uuid::parse_str(name).ok());
            if let Some(run_id) = parsed {
                runs.push(run_id);
            }
        }

        Ok(runs)
    }
}
