use crate::config::LoaderConfig;
use crate::error::LoaderError;
use crossbeam_channel::{Receiver, Sender};
use flate2::read::ZlibDecoder;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// How the bytes of a read request are stored on disk
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReadEncoding {
    Raw,
    /// A zlib stream that must inflate to exactly this many bytes
    Zlib { uncompressed_size: usize },
}

/// Completion slot shared between a precache buffer and the worker that services its read.
/// `outstanding` is nonzero while the read is in flight.
#[derive(Default)]
pub struct ReadSlot {
    outstanding: AtomicUsize,
    result: Mutex<Option<std::io::Result<Vec<u8>>>>,
}

impl ReadSlot {
    pub fn is_finished(&self) -> bool {
        self.outstanding.load(Ordering::Acquire) == 0
    }

    /// Takes the bytes (or error) of a finished read. Returns None if the read was not finished or
    /// the result was already taken.
    pub fn take_result(&self) -> Option<std::io::Result<Vec<u8>>> {
        if !self.is_finished() {
            return None;
        }
        self.result.lock().unwrap().take()
    }

    fn complete(
        &self,
        result: std::io::Result<Vec<u8>>,
    ) {
        *self.result.lock().unwrap() = Some(result);
        self.outstanding.fetch_sub(1, Ordering::Release);
    }
}

impl std::fmt::Debug for ReadSlot {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("ReadSlot")
            .field("outstanding", &self.outstanding.load(Ordering::Relaxed))
            .finish()
    }
}

pub struct ReadRequest {
    pub path: Arc<PathBuf>,
    pub file_offset: u64,
    pub size: usize,
    pub encoding: ReadEncoding,
    pub slot: Arc<ReadSlot>,
}

impl std::fmt::Debug for ReadRequest {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("ReadRequest")
            .field("path", &self.path)
            .field("file_offset", &self.file_offset)
            .field("size", &self.size)
            .field("encoding", &self.encoding)
            .finish()
    }
}

fn execute_read(request: &ReadRequest) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(&*request.path)?;
    file.seek(SeekFrom::Start(request.file_offset))?;
    let mut data = vec![0u8; request.size];
    {
        profiling::scope!("std::fs::File::read_exact");
        file.read_exact(&mut data)?;
    }

    match request.encoding {
        ReadEncoding::Raw => Ok(data),
        ReadEncoding::Zlib { uncompressed_size } => {
            profiling::scope!("ZlibDecoder::read_to_end");
            let mut decoder = ZlibDecoder::new(&data[..]);
            let mut uncompressed = Vec::with_capacity(uncompressed_size);
            decoder.read_to_end(&mut uncompressed)?;
            if uncompressed.len() != uncompressed_size {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!(
                        "chunk at offset {} in {:?} inflated to {} bytes, expected {}",
                        request.file_offset,
                        request.path,
                        uncompressed.len(),
                        uncompressed_size
                    ),
                ));
            }
            Ok(uncompressed)
        }
    }
}

// Runs a request and signals its slot, whatever the outcome
fn service_request(request: ReadRequest) {
    log::trace!("Start read {:?}", request);
    let result = execute_read(&request);
    if let Err(e) = &result {
        log::warn!("Read of {:?} failed: {}", request.path, e);
    }
    request.slot.complete(result);
}

// Thread that tries to take jobs out of the request channel and ends when the finish channel is signalled
struct AsyncReadWorkerThread {
    finish_tx: Sender<()>,
    join_handle: JoinHandle<()>,
}

impl AsyncReadWorkerThread {
    fn new(
        request_rx: Receiver<ReadRequest>,
        active_request_count: Arc<AtomicUsize>,
        thread_index: usize,
    ) -> Result<Self, LoaderError> {
        let (finish_tx, finish_rx) = crossbeam_channel::bounded(1);
        let join_handle = std::thread::Builder::new()
            .name(format!("IO Thread {}", thread_index))
            .spawn(move || {
                profiling::register_thread!(&format!("AsyncReadWorkerThread {}", thread_index));
                loop {
                    crossbeam_channel::select! {
                        recv(request_rx) -> msg => {
                            match msg {
                                Ok(request) => {
                                    profiling::scope!("ReadRequest");
                                    service_request(request);
                                    active_request_count.fetch_sub(1, Ordering::Release);
                                }
                                // Every sender is gone, nothing more will arrive
                                Err(_) => return,
                            }
                        },
                        recv(finish_rx) -> _msg => {
                            return;
                        }
                    }
                }
            })
            .map_err(|source| LoaderError::ThreadSpawn {
                name: "IO thread",
                source,
            })?;

        Ok(AsyncReadWorkerThread {
            finish_tx,
            join_handle,
        })
    }
}

/// Services file reads for archives. With worker threads the reads run concurrently with the
/// caller, with zero workers they are queued and serviced inline whenever an archive calls
/// [`AsyncReadQueue::poll`].
pub struct AsyncReadQueue {
    worker_threads: Vec<AsyncReadWorkerThread>,
    request_tx: Sender<ReadRequest>,
    inline_requests: Mutex<VecDeque<ReadRequest>>,
    active_request_count: Arc<AtomicUsize>,
    issued_request_count: AtomicUsize,
    issued_byte_count: AtomicUsize,
}

impl AsyncReadQueue {
    pub fn new(worker_count: usize) -> Result<Self, LoaderError> {
        let (request_tx, request_rx) = crossbeam_channel::unbounded::<ReadRequest>();
        let active_request_count = Arc::new(AtomicUsize::new(0));

        let mut worker_threads = Vec::with_capacity(worker_count);
        for thread_index in 0..worker_count {
            let worker = AsyncReadWorkerThread::new(
                request_rx.clone(),
                active_request_count.clone(),
                thread_index,
            )?;
            worker_threads.push(worker);
        }

        if worker_count == 0 {
            log::info!("Async reads are serviced inline");
        } else {
            log::info!("Async reads use {} IO threads", worker_count);
        }

        Ok(AsyncReadQueue {
            worker_threads,
            request_tx,
            inline_requests: Default::default(),
            active_request_count,
            issued_request_count: AtomicUsize::new(0),
            issued_byte_count: AtomicUsize::new(0),
        })
    }

    pub fn from_config(config: &LoaderConfig) -> Result<Self, LoaderError> {
        Self::new(config.io_worker_count)
    }

    pub fn is_single_threaded(&self) -> bool {
        self.worker_threads.is_empty()
    }

    /// Queues a read. The slot's outstanding count is raised before this returns.
    pub fn add_request(
        &self,
        request: ReadRequest,
    ) {
        request.slot.outstanding.fetch_add(1, Ordering::AcqRel);
        self.issued_request_count.fetch_add(1, Ordering::Relaxed);
        self.issued_byte_count
            .fetch_add(request.size, Ordering::Relaxed);
        self.active_request_count.fetch_add(1, Ordering::Release);

        if self.is_single_threaded() {
            self.inline_requests.lock().unwrap().push_back(request);
        } else if let Err(crossbeam_channel::SendError(request)) = self.request_tx.send(request) {
            // Can't happen while we hold a worker's receiver clone, but don't leave the slot hanging
            self.active_request_count.fetch_sub(1, Ordering::Release);
            request.slot.complete(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "IO threads have shut down",
            )));
        }
    }

    /// Services queued reads when running without worker threads. A no-op otherwise.
    pub fn poll(&self) {
        if !self.is_single_threaded() {
            return;
        }

        loop {
            // Don't hold the lock while reading
            let request = self.inline_requests.lock().unwrap().pop_front();
            match request {
                Some(request) => {
                    service_request(request);
                    self.active_request_count.fetch_sub(1, Ordering::Release);
                }
                None => break,
            }
        }
    }

    /// Reads that have been queued but not yet completed
    pub fn active_request_count(&self) -> usize {
        self.active_request_count.load(Ordering::Acquire)
    }

    /// Total number of reads issued over the lifetime of the queue
    pub fn issued_request_count(&self) -> usize {
        self.issued_request_count.load(Ordering::Relaxed)
    }

    /// Total number of bytes requested from disk, compressed size for chunked reads
    pub fn issued_byte_count(&self) -> usize {
        self.issued_byte_count.load(Ordering::Relaxed)
    }
}

impl Drop for AsyncReadQueue {
    fn drop(&mut self) {
        for worker_thread in &self.worker_threads {
            let _ = worker_thread.finish_tx.send(());
        }

        for worker_thread in self.worker_threads.drain(..) {
            if worker_thread.join_handle.join().is_err() {
                log::error!("IO thread panicked");
            }
        }

        // Anything left over will never be serviced, release whoever is waiting on it
        for request in self.inline_requests.lock().unwrap().drain(..) {
            request.slot.complete(Err(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                "read queue dropped",
            )));
        }
    }
}
