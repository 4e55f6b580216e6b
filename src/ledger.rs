use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::{fs::OpenOptions, io::AsyncWriteExt};

use crate::Result;

/// Append-only file of finished identifiers, one per line.
///
/// Consulted only between separate runs: a restarted run skips whatever is already listed.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    done: HashSet<String>,
}

impl Ledger {
    /// Loads the ledger at `path`. A missing file is an empty ledger.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let done = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Ledger { path, done })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.done.contains(id)
    }

    pub fn len(&self) -> usize {
        self.done.len()
    }

    pub fn is_empty(&self) -> bool {
        self.done.is_empty()
    }

    /// Appends `id` to the file right away. Already recorded ids are not written twice.
    pub async fn mark(&mut self, id: &str) -> Result<()> {
        if !self.done.insert(id.to_string()) {
            return Ok(());
        }
        append_line(&self.path, id).await
    }
}

/// Opens `path` in append mode for a single line, creating the parent directory on first use.
pub(crate) async fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(format!("{line}\n").as_bytes()).await?;
    file.flush().await?;
    Ok(())
}
