// SPDX-License-Identifier: MIT
//! Human endpoint store — `human/inbox.json` and `human/outbox.json`.
//!
//! Unlike agent queues, the human node's mail lives in two single-file JSON
//! arrays rewritten atomically on every append. The arrays are archives the
//! canvas reads in bulk; they are not drained by a watcher.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::error::HiveError;
use crate::mail::model::Mail;

pub struct HumanStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles on the two array files.
    write_lock: tokio::sync::Mutex<()>,
}

impl HumanStore {
    pub fn new(dir: impl Into<PathBuf>) -> HumanStore {
        HumanStore {
            dir: dir.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn inbox_path(&self) -> PathBuf {
        self.dir.join("inbox.json")
    }

    fn outbox_path(&self) -> PathBuf {
        self.dir.join("outbox.json")
    }

    pub async fn append_inbox(&self, mail: Mail) -> Result<(), HiveError> {
        self.append(&self.inbox_path(), mail).await
    }

    pub async fn append_outbox(&self, mail: Mail) -> Result<(), HiveError> {
        self.append(&self.outbox_path(), mail).await
    }

    pub async fn inbox(&self) -> Result<Vec<Mail>, HiveError> {
        load(&self.inbox_path()).await
    }

    pub async fn outbox(&self) -> Result<Vec<Mail>, HiveError> {
        load(&self.outbox_path()).await
    }

    /// Queue depths for the counter snapshot: (inbox, outbox).
    pub async fn depths(&self) -> (usize, usize) {
        let inbox = load(&self.inbox_path()).await.map(|v| v.len()).unwrap_or(0);
        let outbox = load(&self.outbox_path()).await.map(|v| v.len()).unwrap_or(0);
        (inbox, outbox)
    }

    async fn append(&self, path: &Path, mail: Mail) -> Result<(), HiveError> {
        let _guard = self.write_lock.lock().await;
        let mut mails = load(path).await?;
        mails.push(mail);

        let bytes = serde_json::to_vec_pretty(&mails)
            .map_err(|e| HiveError::Validation(format!("encode {}: {e}", path.display())))?;
        let tmp = path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

async fn load(path: &Path) -> Result<Vec<Mail>, HiveError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map_err(|e| HiveError::MailCorrupt(format!("{}: {e}", path.display())))
}
