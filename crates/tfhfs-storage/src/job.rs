//! Single-writer job queue. One worker thread owns the [`Storage`] and
//! its backend; every mutating call is a job enum variant carrying a
//! one-shot reply channel. A submitter blocks on send and on reply,
//! same as the reference storage layer's dedicated worker goroutine.
//!
//! Reads that hit `StorageHandle`'s own mirror cache skip the queue
//! entirely; only misses and writes round-trip through the worker.

use std::collections::HashMap;
use std::sync::mpsc::{channel, sync_channel, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tfhfs_block::{BlockId, BlockStatus};

use crate::{SharedCacheMirror, Storage, StorageError};

enum Job {
    GetBlock {
        id: BlockId,
        reply: Sender<Result<Vec<u8>, StorageError>>,
    },
    SetBlock {
        id: BlockId,
        data: Vec<u8>,
        status: BlockStatus,
        reply: Sender<Result<(), StorageError>>,
    },
    DeleteBlock {
        id: BlockId,
        reply: Sender<Result<(), StorageError>>,
    },
    IncRef {
        id: BlockId,
    },
    DecRef {
        id: BlockId,
    },
    GetRoot {
        name: String,
        reply: Sender<Option<BlockId>>,
    },
    SetRoot {
        name: String,
        old: Option<BlockId>,
        new: BlockId,
        reply: Sender<Result<(), StorageError>>,
    },
    Flush {
        reply: Sender<Result<(), StorageError>>,
    },
    Stats {
        reply: Sender<(i64, i64)>,
    },
    Shutdown,
}

/// Handle to a running storage worker thread. Cloning shares the same
/// worker and mirror cache; dropping the last handle shuts the worker
/// down once its queue drains.
#[derive(Clone)]
pub struct StorageHandle {
    job_tx: SyncSender<Job>,
    mirror: SharedCacheMirror,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

const JOB_QUEUE_DEPTH: usize = 64;

impl StorageHandle {
    pub(crate) fn spawn(mut storage: Storage) -> Self {
        let (job_tx, job_rx) = sync_channel(JOB_QUEUE_DEPTH);
        let mirror: SharedCacheMirror = Arc::new(Mutex::new(HashMap::new()));
        let mirror_for_worker = mirror.clone();

        let worker = std::thread::spawn(move || {
            Self::run(&mut storage, job_rx, mirror_for_worker);
        });

        Self {
            job_tx,
            mirror,
            worker: Arc::new(Mutex::new(Some(worker))),
        }
    }

    fn run(storage: &mut Storage, job_rx: Receiver<Job>, mirror: SharedCacheMirror) {
        for job in job_rx {
            match job {
                Job::GetBlock { id, reply } => {
                    let result = storage.get_block(&id);
                    if let Ok(data) = &result {
                        mirror.lock().unwrap().insert(id.clone(), data.clone());
                    }
                    let _ = reply.send(result);
                }
                Job::SetBlock { id, data, status, reply } => {
                    storage.set_block(id.clone(), data.clone(), status);
                    mirror.lock().unwrap().insert(id, data);
                    let _ = reply.send(Ok(()));
                }
                Job::DeleteBlock { id, reply } => {
                    storage.delete_block(id.clone());
                    mirror.lock().unwrap().remove(&id);
                    let _ = reply.send(Ok(()));
                }
                Job::IncRef { id } => storage.inc_storage_ref(&id),
                Job::DecRef { id } => storage.dec_storage_ref(&id),
                Job::GetRoot { name, reply } => {
                    let _ = reply.send(storage.get_root(&name));
                }
                Job::SetRoot { name, old, new, reply } => {
                    let _ = reply.send(storage.set_root(&name, old, new));
                }
                Job::Flush { reply } => {
                    let result = storage.flush();
                    if result.is_ok() {
                        mirror.lock().unwrap().clear();
                    }
                    let _ = reply.send(result);
                }
                Job::Stats { reply } => {
                    let _ = reply.send(storage.backend_stats());
                }
                Job::Shutdown => break,
            }
        }
    }

    pub fn get_block(&self, id: &BlockId) -> Result<Vec<u8>, StorageError> {
        if let Some(data) = self.mirror.lock().unwrap().get(id) {
            return Ok(data.clone());
        }
        let (reply_tx, reply_rx) = channel();
        self.job_tx
            .send(Job::GetBlock { id: id.clone(), reply: reply_tx })
            .map_err(|_| StorageError::WorkerGone)?;
        reply_rx.recv().map_err(|_| StorageError::WorkerGone)?
    }

    pub fn set_block(&self, id: BlockId, data: Vec<u8>, status: BlockStatus) -> Result<(), StorageError> {
        let (reply_tx, reply_rx) = channel();
        self.job_tx
            .send(Job::SetBlock { id, data, status, reply: reply_tx })
            .map_err(|_| StorageError::WorkerGone)?;
        reply_rx.recv().map_err(|_| StorageError::WorkerGone)?
    }

    pub fn delete_block(&self, id: BlockId) -> Result<(), StorageError> {
        let (reply_tx, reply_rx) = channel();
        self.job_tx
            .send(Job::DeleteBlock { id, reply: reply_tx })
            .map_err(|_| StorageError::WorkerGone)?;
        reply_rx.recv().map_err(|_| StorageError::WorkerGone)?
    }

    pub fn inc_ref(&self, id: &BlockId) {
        let _ = self.job_tx.send(Job::IncRef { id: id.clone() });
    }

    pub fn dec_ref(&self, id: &BlockId) {
        let _ = self.job_tx.send(Job::DecRef { id: id.clone() });
    }

    pub fn get_root(&self, name: &str) -> Result<Option<BlockId>, StorageError> {
        let (reply_tx, reply_rx) = channel();
        self.job_tx
            .send(Job::GetRoot { name: name.to_string(), reply: reply_tx })
            .map_err(|_| StorageError::WorkerGone)?;
        reply_rx.recv().map_err(|_| StorageError::WorkerGone)
    }

    pub fn set_root(&self, name: &str, old: Option<BlockId>, new: BlockId) -> Result<(), StorageError> {
        let (reply_tx, reply_rx) = channel();
        self.job_tx
            .send(Job::SetRoot { name: name.to_string(), old, new, reply: reply_tx })
            .map_err(|_| StorageError::WorkerGone)?;
        reply_rx.recv().map_err(|_| StorageError::WorkerGone)?
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        let (reply_tx, reply_rx) = channel();
        self.job_tx
            .send(Job::Flush { reply: reply_tx })
            .map_err(|_| StorageError::WorkerGone)?;
        reply_rx.recv().map_err(|_| StorageError::WorkerGone)?
    }

    pub fn stats(&self) -> (i64, i64) {
        let (reply_tx, reply_rx) = channel();
        if self.job_tx.send(Job::Stats { reply: reply_tx }).is_err() {
            return (-1, -1);
        }
        reply_rx.recv().unwrap_or((-1, -1))
    }

    pub fn shutdown(&self) {
        let _ = self.job_tx.send(Job::Shutdown);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Storage;
    use tfhfs_block::InMemoryBlockBackend;
    use tfhfs_crypto::AesGcmEnvelope;

    fn handle() -> StorageHandle {
        let salt = AesGcmEnvelope::generate_salt();
        let envelope = Box::new(AesGcmEnvelope::new(b"pw", &salt));
        let backend = Box::new(InMemoryBlockBackend::new());
        let storage = Storage::new(backend, envelope, 1 << 20);
        StorageHandle::spawn(storage)
    }

    #[test]
    fn write_then_flush_then_read_round_trips() {
        let h = handle();
        h.set_block(b"k1".to_vec(), b"value".to_vec(), BlockStatus::Normal).unwrap();
        h.flush().unwrap();
        assert_eq!(h.get_block(&b"k1".to_vec()).unwrap(), b"value");
        h.shutdown();
    }

    #[test]
    fn root_round_trips_across_generations() {
        let h = handle();
        h.set_root("root", None, b"gen1".to_vec()).unwrap();
        assert_eq!(h.get_root("root").unwrap(), Some(b"gen1".to_vec()));
        h.set_root("root", Some(b"gen1".to_vec()), b"gen2".to_vec()).unwrap();
        assert_eq!(h.get_root("root").unwrap(), Some(b"gen2".to_vec()));
        h.shutdown();
    }
}
