// SPDX-License-Identifier: MIT
//! Filesystem mail store — the shared-nothing directory layout under the
//! data root, plus the atomic write/read contracts every producer and
//! consumer obeys.
//!
//! Layout:
//! ```text
//! <root>/agents/<id>/{inbox, outbox, workspace, state, logs}
//! <root>/human/{inbox.json, outbox.json}
//! <root>/mailboxes/<name>/{inbox, outbox}
//! <root>/inflight/          router-owned handoff spool
//! <root>/deadletter/        terminal storage for undeliverable mail
//! <root>/files/             attachment blobs + sidecar metadata
//! ```
//!
//! Producers write a temporary sibling and rename into place; rename is
//! atomic on a single filesystem, so a listed `.json` file is always
//! complete. Consumers list, sort, then read-and-unlink. A file that cannot
//! be parsed moves into a `poison/` subdirectory and is never retried.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::error::HiveError;
use crate::mail::model::{mailbox_name, Mail, HUMAN_NODE};

/// Subdirectory quarantining unreadable queue files.
pub const POISON_DIR: &str = "poison";

const AGENT_SUBDIRS: [&str; 6] = ["inbox", "outbox", "workspace", "state", "logs", "session"];

#[derive(Debug, Clone)]
pub struct MailStore {
    root: PathBuf,
}

impl MailStore {
    pub fn new(root: impl Into<PathBuf>) -> MailStore {
        MailStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ── Layout ───────────────────────────────────────────────────────────────

    pub fn agents_dir(&self) -> PathBuf {
        self.root.join("agents")
    }

    pub fn agent_dir(&self, agent_id: &str) -> PathBuf {
        self.agents_dir().join(agent_id)
    }

    pub fn agent_inbox(&self, agent_id: &str) -> PathBuf {
        self.agent_dir(agent_id).join("inbox")
    }

    pub fn agent_outbox(&self, agent_id: &str) -> PathBuf {
        self.agent_dir(agent_id).join("outbox")
    }

    pub fn agent_state_dir(&self, agent_id: &str) -> PathBuf {
        self.agent_dir(agent_id).join("state")
    }

    pub fn agent_logs_dir(&self, agent_id: &str) -> PathBuf {
        self.agent_dir(agent_id).join("logs")
    }

    pub fn agent_workspace_dir(&self, agent_id: &str) -> PathBuf {
        self.agent_dir(agent_id).join("workspace")
    }

    pub fn agent_session_dir(&self, agent_id: &str) -> PathBuf {
        self.agent_dir(agent_id).join("session")
    }

    pub fn soul_path(&self, agent_id: &str) -> PathBuf {
        self.agent_dir(agent_id).join("soul.md")
    }

    pub fn hierarchy_path(&self, agent_id: &str) -> PathBuf {
        self.agent_state_dir(agent_id).join("hierarchy.json")
    }

    pub fn mailboxes_dir(&self) -> PathBuf {
        self.root.join("mailboxes")
    }

    pub fn mailbox_inbox(&self, name: &str) -> PathBuf {
        self.mailboxes_dir().join(name).join("inbox")
    }

    pub fn mailbox_outbox(&self, name: &str) -> PathBuf {
        self.mailboxes_dir().join(name).join("outbox")
    }

    pub fn human_dir(&self) -> PathBuf {
        self.root.join("human")
    }

    pub fn inflight_dir(&self) -> PathBuf {
        self.root.join("inflight")
    }

    pub fn deadletter_dir(&self) -> PathBuf {
        self.root.join("deadletter")
    }

    pub fn files_dir(&self) -> PathBuf {
        self.root.join("files")
    }

    pub fn canvas_path(&self) -> PathBuf {
        self.root.join("canvas-layout.json")
    }

    pub fn swarm_path(&self) -> PathBuf {
        self.root.join("swarm.json")
    }

    /// The inbox directory a mail addressed to `node` lands in. `None` for
    /// the human node, whose inbox is an array store, not a directory.
    pub fn inbox_dir(&self, node: &str) -> Option<PathBuf> {
        if node == HUMAN_NODE {
            None
        } else if let Some(name) = mailbox_name(node) {
            Some(self.mailbox_inbox(name))
        } else {
            Some(self.agent_inbox(node))
        }
    }

    // ── Provisioning ─────────────────────────────────────────────────────────

    /// Create the fixed top-level layout. Idempotent.
    pub async fn ensure_layout(&self) -> std::io::Result<()> {
        for dir in [
            self.agents_dir(),
            self.mailboxes_dir(),
            self.human_dir(),
            self.inflight_dir(),
            self.deadletter_dir(),
            self.files_dir(),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }

    /// Create one agent's directory subtree. Idempotent.
    pub async fn ensure_agent_dirs(&self, agent_id: &str) -> std::io::Result<()> {
        for sub in AGENT_SUBDIRS {
            tokio::fs::create_dir_all(self.agent_dir(agent_id).join(sub)).await?;
        }
        Ok(())
    }

    /// Create one mailbox's queue directories. Idempotent.
    pub async fn ensure_mailbox_dirs(&self, name: &str) -> std::io::Result<()> {
        tokio::fs::create_dir_all(self.mailbox_inbox(name)).await?;
        tokio::fs::create_dir_all(self.mailbox_outbox(name)).await?;
        Ok(())
    }

    // ── Write contract ───────────────────────────────────────────────────────

    /// Write `mail` into `dir` under its canonical queue file name.
    pub async fn write_mail(&self, dir: &Path, mail: &Mail) -> std::io::Result<PathBuf> {
        self.write_mail_named(dir, &mail.file_name(), mail).await
    }

    /// Write `mail` into `dir/<name>` via a temporary sibling and an atomic
    /// rename. The temporary carries a `.tmp` suffix so directory listings
    /// (which filter on `.json`) never observe it.
    pub async fn write_mail_named(
        &self,
        dir: &Path,
        name: &str,
        mail: &Mail,
    ) -> std::io::Result<PathBuf> {
        let bytes = serde_json::to_vec_pretty(mail)?;
        let tmp = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        let target = dir.join(name);

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &target).await?;
        Ok(target)
    }

    // ── Read contract ────────────────────────────────────────────────────────

    /// List the `.json` queue files in `dir`, ascending by file name. The
    /// `<epochMillis>-<uuid>` naming makes this FIFO order. A missing
    /// directory reads as empty.
    pub async fn list_mail_files(&self, dir: &Path) -> std::io::Result<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json")
                && entry.file_type().await.map(|t| t.is_file()).unwrap_or(false)
            {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Parse one mail file. Unreadable or unparseable files surface as
    /// `ErrMailCorrupt`; callers decide between poison and dead-letter.
    pub async fn read_mail(&self, path: &Path) -> Result<Mail, HiveError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| HiveError::MailCorrupt(format!("{}: {e}", path.display())))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| HiveError::MailCorrupt(format!("{}: {e}", path.display())))
    }

    /// Count the `.json` files in `dir`. Used for queue-depth snapshots.
    pub async fn count_mail_files(&self, dir: &Path) -> usize {
        match self.list_mail_files(dir).await {
            Ok(files) => files.len(),
            Err(e) => {
                warn!(dir = %dir.display(), err = %e, "queue recount failed");
                0
            }
        }
    }

    // ── Poison quarantine ────────────────────────────────────────────────────

    /// Move an unprocessable file into its directory's `poison/` subdirectory
    /// and append a line to `poison/errors.log`. The file is never retried.
    pub async fn quarantine(&self, path: &Path, error: &str) -> std::io::Result<PathBuf> {
        let dir = path.parent().unwrap_or(Path::new("."));
        let poison = dir.join(POISON_DIR);
        tokio::fs::create_dir_all(&poison).await?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        let target = poison.join(&file_name);
        tokio::fs::rename(path, &target).await?;

        let line = format!("{} {} {}\n", Utc::now().to_rfc3339(), file_name, error);
        let mut log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(poison.join("errors.log"))
            .await?;
        log.write_all(line.as_bytes()).await?;

        Ok(target)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::model::MailType;
    use chrono::{DateTime, Utc};

    fn store() -> (MailStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        (MailStore::new(dir.path()), dir)
    }

    fn mail_at(millis_offset: i64) -> Mail {
        let mut m = Mail::new("a", "b", "s", "body", MailType::Agent);
        m.timestamp = DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + chrono::Duration::milliseconds(millis_offset);
        m
    }

    #[tokio::test]
    async fn write_then_list_is_visible_and_sorted() {
        let (store, _dir) = store();
        store.ensure_agent_dirs("a").await.unwrap();
        let outbox = store.agent_outbox("a");

        // Written out of order; listing must come back FIFO.
        for offset in [2, 0, 1] {
            store.write_mail(&outbox, &mail_at(offset)).await.unwrap();
        }

        let files = store.list_mail_files(&outbox).await.unwrap();
        assert_eq!(files.len(), 3);
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[tokio::test]
    async fn tmp_siblings_are_not_listed() {
        let (store, _dir) = store();
        store.ensure_agent_dirs("a").await.unwrap();
        let outbox = store.agent_outbox("a");
        tokio::fs::write(outbox.join(".deadbeef.tmp"), b"partial").await.unwrap();

        assert!(store.list_mail_files(&outbox).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn read_round_trips_mail() {
        let (store, _dir) = store();
        store.ensure_agent_dirs("a").await.unwrap();
        let path = store
            .write_mail(&store.agent_inbox("a"), &mail_at(0))
            .await
            .unwrap();
        let mail = store.read_mail(&path).await.unwrap();
        assert_eq!(mail.from, "a");
        assert_eq!(mail.to, "b");
    }

    #[tokio::test]
    async fn corrupt_file_reads_as_mail_corrupt() {
        let (store, _dir) = store();
        store.ensure_agent_dirs("a").await.unwrap();
        let bad = store.agent_outbox("a").join("1700000000000-bad.json");
        tokio::fs::write(&bad, b"{ not json").await.unwrap();

        let err = store.read_mail(&bad).await.unwrap_err();
        assert_eq!(err.kind(), "ErrMailCorrupt");
    }

    #[tokio::test]
    async fn quarantine_moves_file_and_logs() {
        let (store, _dir) = store();
        store.ensure_agent_dirs("a").await.unwrap();
        let outbox = store.agent_outbox("a");
        let bad = outbox.join("1700000000000-bad.json");
        tokio::fs::write(&bad, b"garbage").await.unwrap();

        let moved = store.quarantine(&bad, "parse error").await.unwrap();
        assert!(!bad.exists());
        assert!(moved.starts_with(outbox.join(POISON_DIR)));

        let log = tokio::fs::read_to_string(outbox.join(POISON_DIR).join("errors.log"))
            .await
            .unwrap();
        assert!(log.contains("1700000000000-bad.json"));
        assert!(log.contains("parse error"));

        // Quarantined files no longer appear in the queue listing.
        assert!(store.list_mail_files(&outbox).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_directory_lists_empty() {
        let (store, _dir) = store();
        let files = store
            .list_mail_files(&store.agent_inbox("ghost"))
            .await
            .unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn inbox_dir_resolution() {
        let store = MailStore::new("/data");
        assert_eq!(
            store.inbox_dir("b1").unwrap(),
            PathBuf::from("/data/agents/b1/inbox")
        );
        assert_eq!(
            store.inbox_dir("mailbox:reports").unwrap(),
            PathBuf::from("/data/mailboxes/reports/inbox")
        );
        assert!(store.inbox_dir(HUMAN_NODE).is_none());
    }
}
