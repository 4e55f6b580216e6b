use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Local;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::error;

use crate::record::Record;
use crate::{info_time, Error, Result};

/// Append-only, ordered output of accepted records.
#[async_trait]
pub trait RecordSink: Send {
    /// Appends one record. Returning `Ok` means the record left the process.
    async fn append(&mut self, record: &Record) -> Result<()>;

    /// Makes everything appended so far durable. Called once per page.
    async fn flush(&mut self) -> Result<()>;
}

#[async_trait]
impl RecordSink for Vec<Record> {
    async fn append(&mut self, record: &Record) -> Result<()> {
        self.push(record.clone());
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Newline-delimited JSON file, one record per line.
#[derive(Debug)]
pub struct NdjsonSink {
    path: PathBuf,
    file: BufWriter<File>,
}

impl NdjsonSink {
    /// Opens `path` in append mode, creating it (and its parent directory) if needed.
    pub async fn open_append(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(path.as_ref(), false).await
    }

    /// Truncates `path` and starts a fresh sink.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(path.as_ref(), true).await
    }

    async fn open(path: &Path, truncate: bool) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut options = OpenOptions::new();
        options.create(true);
        if truncate {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }
        let file = options.open(path).await?;
        Ok(NdjsonSink {
            path: path.to_path_buf(),
            file: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordSink for NdjsonSink {
    async fn append(&mut self, record: &Record) -> Result<()> {
        let line = record.to_line()?;
        self.file
            .write_all(line.as_bytes())
            .await
            .map_err(Error::SinkWrite)?;
        self.file.flush().await.map_err(Error::SinkWrite)
    }

    async fn flush(&mut self) -> Result<()> {
        self.file.flush().await.map_err(Error::SinkWrite)?;
        self.file.get_ref().sync_data().await.map_err(Error::SinkWrite)
    }
}

/// Messages understood by the single sink writer task.
#[derive(Debug)]
pub enum SinkCommand {
    Append(Record),
    /// Flush the underlying sink, then acknowledge.
    Flush(oneshot::Sender<()>),
}

/// Cloneable handle feeding the shared writer task. Every worker gets its own clone, so whole
/// records are written one at a time no matter how many walks run in parallel.
#[derive(Debug, Clone)]
pub struct SinkHandle {
    tx: mpsc::Sender<SinkCommand>,
}

#[async_trait]
impl RecordSink for SinkHandle {
    async fn append(&mut self, record: &Record) -> Result<()> {
        self.tx.send(SinkCommand::Append(record.clone())).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx.send(SinkCommand::Flush(ack_tx)).await?;
        ack_rx.await.map_err(|_| Error::SinkClosed)
    }
}

/// Moves `sink` into a writer task and returns a handle to feed it.
/// The task finishes once every handle is dropped and returns the number of records written.
pub fn spawn_writer<S>(sink: S, buffer: usize) -> (SinkHandle, JoinHandle<Result<usize>>)
where
    S: RecordSink + 'static,
{
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let handle = tokio::spawn(async move { write_records(sink, rx).await });
    (SinkHandle { tx }, handle)
}

/// Waits for a writer started by [`spawn_writer`] once the producers that fed it are done.
///
/// Producers only see [`Error::SinkClosed`] when the writer dies, so a writer failure is
/// returned in preference to `outcome`'s error.
pub async fn join_writer<T>(
    writer: JoinHandle<Result<usize>>,
    outcome: Result<T>,
) -> Result<(T, usize)> {
    let written = writer.await?;
    match (outcome, written) {
        (_, Err(err)) => Err(err),
        (Err(err), Ok(_)) => Err(err),
        (Ok(value), Ok(written)) => Ok((value, written)),
    }
}

/// Uses a `mpsc` Receiver to collect the records from every worker and writes them in the
/// order they arrive.
async fn write_records<S: RecordSink>(
    mut sink: S,
    mut rx: mpsc::Receiver<SinkCommand>,
) -> Result<usize> {
    let start_time = Local::now();
    let mut written = 0;

    match drain(&mut sink, &mut rx, &mut written).await {
        Ok(()) => {
            info_time!(start_time, "Sink writer done: {written} records");
            Ok(written)
        }
        Err(err) => {
            error!("Sink writer stopped after {written} records: {err}");
            Err(err)
        }
    }
}

async fn drain<S: RecordSink>(
    sink: &mut S,
    rx: &mut mpsc::Receiver<SinkCommand>,
    written: &mut usize,
) -> Result<()> {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            SinkCommand::Append(record) => {
                sink.append(&record).await?;
                *written += 1;
            }
            SinkCommand::Flush(ack) => {
                sink.flush().await?;
                let _ = ack.send(());
            }
        }
    }
    sink.flush().await
}
