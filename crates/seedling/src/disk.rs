//! Disk worker of a torrent.
//!
//! Every torrent owns one [`DiskStore`]. The store runs a dedicated thread
//! that owns the file handles, the control loop only queues work and gets
//! the results back on a channel, so a slow disk never stalls peer I/O.
//!
//! Work is queued under a mutex and the worker sleeps on a condition
//! variable while the queue is empty. One drain cycle handles the queued
//! reads first, then the writes, then the verifications. A write queued
//! after a cycle started is only visible to reads of the next cycle.
use std::{
    fs::{create_dir_all, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    mem,
    path::{Path, PathBuf},
    sync::Arc,
    thread::{self, JoinHandle},
};

use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    error::Error,
    metainfo::Info,
    torrent::InfoHash,
};

/// Channel on which every [`DiskStore`] reports back to the control loop.
pub type DiskTx = mpsc::UnboundedSender<(InfoHash, DiskEvent)>;

/// Results produced by the worker thread.
#[derive(Debug, Clone, PartialEq)]
pub enum DiskEvent {
    /// Answer to [`DiskStore::read`].
    DataRead { id: u64, piece: u32, offset: u32, data: Vec<u8> },
    /// Answer to [`DiskStore::verify_piece`].
    PieceVerified { piece: u32, ok: bool },
    /// Progress of the initial scan, in percent.
    VerificationProgress(u8),
    /// The initial scan finished, with the pieces that are on disk.
    VerificationDone { completed: Bitfield },
    /// A read or write failed, the worker keeps running.
    Error { read_id: Option<u64>, message: String },
    /// The files could not be created, the worker stopped.
    Failed(String),
}

#[derive(Debug)]
struct ReadRequest {
    id: u64,
    piece: u32,
    offset: u32,
    length: u32,
}

#[derive(Debug)]
struct WriteRequest {
    piece: u32,
    offset: u32,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct Queue {
    reads: Vec<ReadRequest>,
    writes: Vec<WriteRequest>,
    verifications: Vec<u32>,
    full_verification: bool,
    quit: bool,
}

impl Queue {
    fn is_idle(&self) -> bool {
        self.reads.is_empty()
            && self.writes.is_empty()
            && self.verifications.is_empty()
            && !self.full_verification
    }
}

#[derive(Debug, Default)]
struct Shared {
    queue: Mutex<Queue>,
    cond: Condvar,
}

/// Handle to the disk worker of one torrent.
#[derive(Debug)]
pub struct DiskStore {
    info_hash: InfoHash,
    info: Info,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    next_read_id: u64,
}

impl DiskStore {
    /// Spawn the worker thread.
    ///
    /// The thread first opens every file under `download_dir`, creating and
    /// resizing them as needed. `completed` are the pieces a previous run
    /// already verified, a non-empty set skips the initial scan.
    pub fn spawn(
        info_hash: InfoHash,
        info: Info,
        download_dir: impl Into<PathBuf>,
        completed: Bitfield,
        tx: DiskTx,
    ) -> Result<Self, Error> {
        let shared = Arc::new(Shared::default());

        let mut worker = Worker {
            info_hash,
            info: info.clone(),
            download_dir: download_dir.into(),
            files: Vec::new(),
            verified: completed,
            all_new: false,
            tx,
        };
        let worker_shared = shared.clone();

        let handle = thread::Builder::new()
            .name(format!("disk-{}", &info_hash.to_string()[..8]))
            .spawn(move || worker.run(&worker_shared))?;

        Ok(Self {
            info_hash,
            info,
            shared,
            worker: Some(handle),
            next_read_id: 0,
        })
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn piece_count(&self) -> usize {
        self.info.piece_count()
    }

    pub fn piece_length_at(&self, index: usize) -> u32 {
        self.info.piece_length_at(index)
    }

    /// Queue a read, the result arrives as [`DiskEvent::DataRead`] with the
    /// returned id.
    pub fn read(&mut self, piece: u32, offset: u32, length: u32) -> u64 {
        let id = self.next_read_id;
        self.next_read_id += 1;
        self.push(|q| q.reads.push(ReadRequest { id, piece, offset, length }));
        id
    }

    /// Queue a write of `data` at `offset` inside `piece`.
    pub fn write(&mut self, piece: u32, offset: u32, data: Vec<u8>) {
        self.push(|q| q.writes.push(WriteRequest { piece, offset, data }));
    }

    /// Queue a hash check, answered with [`DiskEvent::PieceVerified`].
    pub fn verify_piece(&mut self, piece: u32) {
        self.push(|q| q.verifications.push(piece));
    }

    /// Queue the initial scan, answered with [`DiskEvent::VerificationDone`].
    pub fn start_verification(&mut self) {
        self.push(|q| q.full_verification = true);
    }

    fn push(&self, f: impl FnOnce(&mut Queue)) {
        let mut queue = self.shared.queue.lock();
        f(&mut queue);
        self.shared.cond.notify_one();
    }

    /// Ask the worker to quit after flushing every queued write.
    ///
    /// Inside a tokio runtime the join happens on the blocking pool,
    /// otherwise this call blocks until the thread is gone.
    pub fn shutdown(&mut self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.quit = true;
            self.shared.cond.notify_one();
        }

        let Some(handle) = self.worker.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn_blocking(move || {
                    let _ = handle.join();
                });
            }
            Err(_) => {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for DiskStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    info_hash: InfoHash,
    info: Info,
    download_dir: PathBuf,
    /// Open handles with their declared length, in torrent order.
    files: Vec<(File, u64)>,
    verified: Bitfield,
    /// Every file was created by this run, so there is nothing to scan.
    all_new: bool,
    tx: DiskTx,
}

impl Worker {
    #[tracing::instrument(skip_all, name = "disk::run", fields(info_hash = %self.info_hash))]
    fn run(&mut self, shared: &Shared) {
        if let Err(e) = self.generate_files() {
            warn!("could not create the files: {e}");
            self.send(DiskEvent::Failed(e.to_string()));
            return;
        }
        debug!("{} files ready", self.files.len());

        loop {
            let mut queue = shared.queue.lock();
            while !queue.quit && queue.is_idle() {
                shared.cond.wait(&mut queue);
            }

            let quit = queue.quit;
            let work = mem::take(&mut *queue);
            queue.quit = quit;
            drop(queue);

            for r in work.reads {
                if quit {
                    break;
                }
                match self.read_block(r.piece, r.offset, r.length) {
                    Ok(data) => self.send(DiskEvent::DataRead {
                        id: r.id,
                        piece: r.piece,
                        offset: r.offset,
                        data,
                    }),
                    Err(e) => self.send(DiskEvent::Error {
                        read_id: Some(r.id),
                        message: format!("failed to read piece {}: {e}", r.piece),
                    }),
                }
            }

            for w in work.writes {
                if let Err(e) = self.write_block(w.piece, w.offset, &w.data) {
                    self.send(DiskEvent::Error {
                        read_id: None,
                        message: format!("failed to write piece {}: {e}", w.piece),
                    });
                }
            }

            if quit {
                break;
            }

            for piece in work.verifications {
                let ok = self.verify_single_piece(piece as usize);
                self.send(DiskEvent::PieceVerified { piece, ok });
            }

            if work.full_verification {
                self.verify_file_contents();
            }
        }

        // writes queued while the last cycle ran
        let writes = mem::take(&mut shared.queue.lock().writes);
        for w in writes {
            if let Err(e) = self.write_block(w.piece, w.offset, &w.data) {
                warn!("failed to flush piece {}: {e}", w.piece);
            }
        }

        for (file, _) in &mut self.files {
            let _ = file.flush();
        }
        self.files.clear();
        debug!("disk worker stopped");
    }

    fn send(&self, event: DiskEvent) {
        // the receiver is gone only while the client is shutting down
        let _ = self.tx.send((self.info_hash, event));
    }

    /// Open every file, creating directories and resizing files to their
    /// declared length.
    fn generate_files(&mut self) -> io::Result<()> {
        create_dir_all(&self.download_dir)?;

        let mut all_new = true;
        for (relative, length) in self.info.files() {
            let path = self.download_dir.join(&relative);
            if let Some(parent) = path.parent() {
                create_dir_all(parent)?;
            }

            all_new &= !path.exists();
            let file = open_file(&path)?;
            if file.metadata()?.len() != length {
                file.set_len(length)?;
            }
            self.files.push((file, length));
        }
        self.all_new = all_new;

        Ok(())
    }

    fn absolute_offset(&self, piece: u32, offset: u32, length: usize) -> io::Result<u64> {
        let start = piece as u64 * self.info.piece_length as u64 + offset as u64;
        if piece as usize >= self.info.piece_count()
            || start + length as u64 > self.info.total_size()
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("block {piece}:{offset}+{length} is out of bounds"),
            ));
        }
        Ok(start)
    }

    /// Read `length` bytes, spanning as many files as needed.
    fn read_block(&mut self, piece: u32, offset: u32, length: u32) -> io::Result<Vec<u8>> {
        let mut start = self.absolute_offset(piece, offset, length as usize)?;
        let mut block = vec![0u8; length as usize];
        let mut filled = 0;
        let mut file_start = 0u64;

        for (file, file_len) in &mut self.files {
            if filled == block.len() {
                break;
            }
            let file_end = file_start + *file_len;
            if file_end > start {
                let in_file = start - file_start;
                let n = ((file_end - start) as usize).min(block.len() - filled);

                file.seek(SeekFrom::Start(in_file))?;
                file.read_exact(&mut block[filled..filled + n])?;

                filled += n;
                start += n as u64;
            }
            file_start = file_end;
        }

        Ok(block)
    }

    /// Write `data`, spanning as many files as needed.
    fn write_block(&mut self, piece: u32, offset: u32, data: &[u8]) -> io::Result<()> {
        let mut start = self.absolute_offset(piece, offset, data.len())?;
        let mut written = 0;
        let mut file_start = 0u64;

        for (file, file_len) in &mut self.files {
            if written == data.len() {
                break;
            }
            let file_end = file_start + *file_len;
            if file_end > start {
                let in_file = start - file_start;
                let n = ((file_end - start) as usize).min(data.len() - written);

                file.seek(SeekFrom::Start(in_file))?;
                file.write_all(&data[written..written + n])?;

                written += n;
                start += n as u64;
            }
            file_start = file_end;
        }

        Ok(())
    }

    fn verify_single_piece(&mut self, index: usize) -> bool {
        let length = self.info.piece_length_at(index);
        let data = match self.read_block(index as u32, 0, length) {
            Ok(data) => data,
            Err(e) => {
                self.send(DiskEvent::Error {
                    read_id: None,
                    message: format!("failed to verify piece {index}: {e}"),
                });
                return false;
            }
        };

        let ok = sha1_smol::Sha1::from(&data).digest().bytes() == self.info.pieces[index];
        if index < self.verified.len() {
            self.verified.set(index, ok);
        }
        ok
    }

    fn verify_file_contents(&mut self) {
        let count = self.info.piece_count();
        if self.verified.len() != count {
            self.verified = Bitfield::from_piece(count);
        }

        if self.verified.not_any() && !self.all_new {
            let mut old_percent = 0;
            for index in 0..count {
                self.verify_single_piece(index);

                let percent = ((index + 1) * 100 / count) as u8;
                if percent != old_percent {
                    self.send(DiskEvent::VerificationProgress(percent));
                    old_percent = percent;
                }
            }
        }

        info!(
            "verification done, {}/{count} pieces on disk",
            self.verified.count_ones()
        );
        self.send(DiskEvent::VerificationDone { completed: self.verified.clone() });
    }
}

fn open_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}
