use super::state::AgentState;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::warn;

#[derive(Serialize)]
struct AuditEntry<'a> {
    timestamp: String,
    #[serde(flatten)]
    state: &'a AgentState,
}

/// Append-only JSON-lines record of every finished request.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
    pending: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pending: Arc::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes one line in the background and returns at once. Failures are
    /// logged, never returned.
    pub fn record(&self, state: &AgentState) {
        let entry = AuditEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            state,
        };
        let line = serde_json::to_string(&entry);
        let path = self.path.clone();

        let handle = tokio::spawn(async move {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!("Could not serialize audit entry: {}", e);
                    return;
                }
            };
            if let Err(e) = append_line(&path, &line).await {
                warn!("Could not write audit log {}: {}", path.display(), e);
            }
        });

        match self.pending.lock() {
            Ok(mut pending) => {
                pending.retain(|h| !h.is_finished());
                pending.push(handle);
            }
            Err(_) => warn!("Audit bookkeeping is poisoned; not tracking this write"),
        }
    }

    /// Waits for every write started so far. Used before the process exits.
    pub async fn flush(&self) {
        let pending = match self.pending.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(_) => return,
        };
        for handle in pending {
            if let Err(e) = handle.await {
                warn!("Audit task failed: {}", e);
            }
        }
    }
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(format!("{}\n", line).as_bytes()).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn entries_are_appended_as_json_lines() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path().join("logs").join("interactions.jsonl"));

        let mut state = AgentState::new("How many loan types are available?", Some("s1".to_string()));
        state.generated_sql = "SELECT COUNT(*) FROM loan_types;".to_string();
        log.record(&state);
        log.flush().await;
        log.record(&AgentState::new("hi", None));
        log.flush().await;

        let contents = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["session_id"], "s1");
        assert_eq!(lines[0]["generated_sql"], "SELECT COUNT(*) FROM loan_types;");
        assert!(lines[0]["timestamp"].is_string());
    }

    #[tokio::test]
    async fn unwritable_path_is_swallowed() {
        let dir = TempDir::new().unwrap();
        // A directory cannot be opened for appending.
        let log = AuditLog::new(dir.path());
        log.record(&AgentState::default());
        log.flush().await;
        assert!(dir.path().is_dir());
    }
}
