use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{info, warn};
use ulid::Ulid;

use crate::guard::ConcurrencyGuard;
use crate::model::{Appointment, Interval};

use super::{InMemoryRepository, Repository, RepositoryError};

/// Larger length prefixes are treated as corruption.
const MAX_RECORD_BYTES: usize = 1 << 20;

/// Encode a single record to [len][bincode][crc32] format.
fn encode_record(writer: &mut impl Write, record: &Appointment) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only log of appointment versions.
///
/// Format per entry: `[u32: len][bincode: Appointment][u32: crc32]`.
/// A torn or corrupt tail is cut off when the log is opened.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Replay `path`, truncate anything after the last good record, and open for appending.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Appointment>)> {
        let (records, valid_len) = read_records(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if file.metadata()?.len() > valid_len {
            warn!(path = %path.display(), valid_len, "discarding torn WAL tail");
            file.set_len(valid_len)?;
        }
        let wal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: records.len() as u64,
        };
        Ok((wal, records))
    }

    #[cfg(test)]
    pub fn append(&mut self, record: &Appointment) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    /// Buffer a record without syncing; `flush_sync` commits the batch.
    pub fn append_buffered(&mut self, record: &Appointment) -> io::Result<()> {
        encode_record(&mut self.writer, record)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write compacted records to a temp file and fsync.
    pub fn write_compact_file(path: &Path, records: &[Appointment]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for record in records {
            encode_record(&mut writer, record)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Rename the temp file over the log and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// All valid records in `path`. Missing file means empty.
    pub fn replay(path: &Path) -> io::Result<Vec<Appointment>> {
        read_records(path).map(|(records, _)| records)
    }
}

/// Valid records plus the byte offset just past the last one.
fn read_records(path: &Path) -> io::Result<(Vec<Appointment>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    let mut valid_len: u64 = 0;

    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_RECORD_BYTES {
            break;
        }

        let mut payload = vec![0u8; len];
        match reader.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
            Err(e) => return Err(e),
        }

        let mut crc_buf = [0u8; 4];
        match reader.read_exact(&mut crc_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
            Err(e) => return Err(e),
        }
        if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
            break;
        }

        match bincode::deserialize::<Appointment>(&payload) {
            Ok(record) => records.push(record),
            Err(_) => break,
        }
        valid_len += 8 + len as u64;
    }

    Ok((records, valid_len))
}

// ── Group-commit writer ──────────────────────────────────────────

enum WalCommand {
    Append {
        record: Appointment,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<Appointment>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Appointment, oneshot::Sender<io::Result<()>>);

/// Owns the log. Blocks for the first append, drains whatever else is
/// already queued, then commits the whole batch with one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (record, response) = match cmd {
            WalCommand::Append { record, response } => (record, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(record, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { record, response }) => batch.push((record, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut result = Ok(());
    for (record, _) in &batch {
        if let Err(e) = wal.append_buffered(record) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so partial bytes don't leak into the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let result = Wal::write_compact_file(wal.path(), &records)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {}
    }
}

// ── Repository ───────────────────────────────────────────────────

/// Durable repository: an in-memory index in front of a group-committed WAL.
///
/// Writes for one provider are serialized; a write is acknowledged only after
/// its record has been fsynced.
pub struct WalRepository {
    index: Arc<InMemoryRepository>,
    wal_tx: mpsc::Sender<WalCommand>,
    write_locks: ConcurrencyGuard,
    /// Saves share it; compaction takes it exclusively so no record slips
    /// between the snapshot and the file swap.
    compaction: Arc<RwLock<()>>,
}

impl WalRepository {
    /// Recover from `path` and start the writer task. Must run inside a tokio runtime.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let (wal, records) = Wal::open(path)?;
        let index = Arc::new(InMemoryRepository::new());
        let mut stale = 0usize;
        for record in &records {
            if !index.restore(record) {
                stale += 1;
            }
        }
        info!(
            path = %path.display(),
            records = records.len(),
            appointments = index.len(),
            stale,
            "WAL replayed"
        );

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            index,
            wal_tx,
            write_locks: ConcurrencyGuard::new(),
            compaction: Arc::new(RwLock::new(())),
        })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub async fn appends_since_compact(&self) -> Result<u64, RepositoryError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .map_err(|_| writer_gone())?;
        rx.await.map_err(|_| writer_gone())
    }

    /// Rewrite the log as one record per appointment. Returns the record count.
    pub async fn compact(&self) -> Result<usize, RepositoryError> {
        let _exclusive = self.compaction.write().await;
        let mut records = self.index.snapshot();
        records.sort_by_key(|a| a.appointment_id);
        let count = records.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { records, response: tx })
            .await
            .map_err(|_| writer_gone())?;
        rx.await
            .map_err(|_| writer_gone())?
            .map_err(|e| RepositoryError::Unavailable(e.to_string()))?;
        Ok(count)
    }
}

fn writer_gone() -> RepositoryError {
    RepositoryError::Unavailable("WAL writer shut down".into())
}

async fn wal_append(tx: &mpsc::Sender<WalCommand>, record: Appointment) -> Result<(), RepositoryError> {
    let (response, rx) = oneshot::channel();
    tx.send(WalCommand::Append { record, response })
        .await
        .map_err(|_| writer_gone())?;
    rx.await
        .map_err(|_| writer_gone())?
        .map_err(|e| RepositoryError::Unavailable(e.to_string()))
}

#[async_trait]
impl Repository for WalRepository {
    async fn load_active_appointments(
        &self,
        provider_id: &str,
        interval: &Interval,
    ) -> Result<Vec<Appointment>, RepositoryError> {
        self.index.load_active_appointments(provider_id, interval).await
    }

    async fn save(&self, appointment: &Appointment) -> Result<(), RepositoryError> {
        let guard = self.write_locks.lock_owned(&appointment.provider_id).await;
        let index = self.index.clone();
        let tx = self.wal_tx.clone();
        let compaction = self.compaction.clone();
        let record = appointment.clone();

        // Check, log, apply: runs to completion even if the caller goes away.
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let _shared = compaction.read_owned().await;
            index.check_version(&record)?;
            wal_append(&tx, record.clone()).await?;
            index.put(&record)
        });
        handle
            .await
            .map_err(|e| RepositoryError::Unavailable(format!("save task failed: {e}")))?
    }

    async fn load_appointment(&self, appointment_id: Ulid) -> Result<Option<Appointment>, RepositoryError> {
        self.index.load_appointment(appointment_id).await
    }

    async fn appointments_for_patient(&self, patient_id: &str) -> Result<Vec<Appointment>, RepositoryError> {
        self.index.appointments_for_patient(patient_id).await
    }

    async fn appointments_for_provider(
        &self,
        provider_id: &str,
        window: &Interval,
    ) -> Result<Vec<Appointment>, RepositoryError> {
        self.index.appointments_for_provider(provider_id, window).await
    }
}
