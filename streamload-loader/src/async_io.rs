use crate::clock::{Clock, Poller, Sleeper, SystemClock, ThreadSleeper};
use crate::config::{CorruptionPolicy, IoConfig, PollConfig, StreamingConfig};
use crate::decompress::{Decompressor, StandardDecompressor};
use crate::error::CorruptionReport;
use crate::platform_io::{IoBackend, IoHandle};
use crate::{LoaderError, LoaderResult};
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use streamload_base::compressed_stream::{
    ChunkTable, StreamHeader, CHUNK_INFO_SIZE, STREAM_HEADER_SIZE,
};
use streamload_base::hashing::HashMap;
use streamload_base::{CompressionMethod, FormatError, PACKAGE_FILE_TAG};

/// Scratch buffers for compressed chunks are rounded up to this many bytes
pub const SCRATCH_ALIGNMENT: usize = 2048;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IoPriority {
    Min,
    Low,
    BelowNormal,
    Normal,
    High,
    Max,
}

/// Returned when queueing a request, used for cancellation. Never 0.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

/// Number of requests still outstanding against some piece of data. Queueing a request increments
/// it, the worker decrements it once the request is serviced (or canceled).
#[derive(Debug, Clone, Default)]
pub struct CompletionCounter(Arc<AtomicUsize>);

impl CompletionCounter {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::Release);
    }

    pub fn value(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.value() == 0
    }
}

#[derive(Default)]
struct IoBufferInner {
    data: Mutex<Vec<u8>>,
    error: Mutex<Option<LoaderError>>,
}

/// Destination of a read. The requester keeps a clone so the bytes stay valid for as long as
/// either side needs them.
#[derive(Clone, Default)]
pub struct IoBuffer {
    inner: Arc<IoBufferInner>,
}

impl IoBuffer {
    pub fn with_len(len: usize) -> Self {
        IoBuffer {
            inner: Arc::new(IoBufferInner {
                data: Mutex::new(vec![0u8; len]),
                error: Mutex::new(None),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    pub fn data(&self) -> MutexGuard<Vec<u8>> {
        self.inner.data.lock().unwrap()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data().clone()
    }

    /// Set when the read that filled this buffer failed
    pub fn error(&self) -> Option<LoaderError> {
        self.inner.error.lock().unwrap().clone()
    }

    fn set_error(
        &self,
        error: LoaderError,
    ) {
        *self.inner.error.lock().unwrap() = Some(error);
    }
}

pub struct ReadRequest {
    pub file_name: String,
    pub offset: i64,
    pub size: u64,
    /// 0 for a plain read, otherwise the size of the decompressed stream at `offset`
    pub uncompressed_size: u64,
    pub compression: CompressionMethod,
    pub dest: IoBuffer,
    pub priority: IoPriority,
    pub counter: Option<CompletionCounter>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoStats {
    pub requests_serviced: u64,
    pub requests_canceled: u64,
    pub bytes_read: u64,
    pub uncompressed_bytes_produced: u64,
    pub handles_opened: u64,
    pub handles_closed: u64,
    pub missing_handle_requests: u64,
    pub failed_requests: u64,
    pub throttle_sleep: Duration,
}

#[derive(Default)]
struct IoStatsCounters {
    requests_serviced: AtomicU64,
    requests_canceled: AtomicU64,
    bytes_read: AtomicU64,
    uncompressed_bytes_produced: AtomicU64,
    handles_opened: AtomicU64,
    handles_closed: AtomicU64,
    missing_handle_requests: AtomicU64,
    failed_requests: AtomicU64,
    throttle_sleep_ns: AtomicU64,
}

impl IoStatsCounters {
    fn add(
        counter: &AtomicU64,
        value: u64,
    ) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    fn snapshot(&self) -> IoStats {
        IoStats {
            requests_serviced: self.requests_serviced.load(Ordering::Relaxed),
            requests_canceled: self.requests_canceled.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            uncompressed_bytes_produced: self.uncompressed_bytes_produced.load(Ordering::Relaxed),
            handles_opened: self.handles_opened.load(Ordering::Relaxed),
            handles_closed: self.handles_closed.load(Ordering::Relaxed),
            missing_handle_requests: self.missing_handle_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            throttle_sleep: Duration::from_nanos(self.throttle_sleep_ns.load(Ordering::Relaxed)),
        }
    }
}

enum RequestKind {
    Read {
        offset: u64,
        size: u64,
        uncompressed_size: u64,
        compression: CompressionMethod,
        dest: IoBuffer,
    },
    DestroyHandle,
}

struct QueuedRequest {
    id: RequestId,
    file_name: String,
    kind: RequestKind,
    priority: IoPriority,
    counter: Option<CompletionCounter>,
    handle_requested: bool,
}

type SharedHandle = Arc<Mutex<Box<dyn IoHandle>>>;

struct IoQueueState {
    requests: Vec<QueuedRequest>,
    handles: HashMap<String, SharedHandle>,
    min_priority: IoPriority,
    next_request_id: u64,
    busy_with_request: bool,
}

#[derive(Default)]
struct ReadGateState {
    suspend_count: u32,
    reads_in_flight: u32,
}

// Brackets every platform read. Separate from the queue lock so suspending reads never blocks
// producers.
#[derive(Default)]
struct ReadGate {
    state: Mutex<ReadGateState>,
    changed: Condvar,
}

struct ReadGateGuard<'a> {
    gate: &'a ReadGate,
}

impl ReadGate {
    fn begin_read(&self) -> ReadGateGuard {
        let mut state = self.state.lock().unwrap();
        while state.suspend_count > 0 {
            state = self.changed.wait(state).unwrap();
        }
        state.reads_in_flight += 1;
        ReadGateGuard { gate: self }
    }

    fn suspend(&self) {
        let mut state = self.state.lock().unwrap();
        state.suspend_count += 1;
        while state.reads_in_flight > 0 {
            state = self.changed.wait(state).unwrap();
        }
    }

    fn resume(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(state.suspend_count > 0, "resume called without a matching suspend");
        state.suspend_count -= 1;
        self.changed.notify_all();
    }

    fn is_suspended(&self) -> bool {
        self.state.lock().unwrap().suspend_count > 0
    }
}

impl<'a> Drop for ReadGateGuard<'a> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock().unwrap();
        state.reads_in_flight -= 1;
        self.gate.changed.notify_all();
    }
}

struct AsyncIoShared {
    state: Mutex<IoQueueState>,
    read_gate: ReadGate,
    backend: Arc<dyn IoBackend>,
    decompressor: Arc<dyn Decompressor>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    config: IoConfig,
    stats: IoStatsCounters,
    wake_tx: Sender<()>,
}

impl AsyncIoShared {
    fn wake(&self) {
        // A pending token is as good as a new one
        let _ = self.wake_tx.try_send(());
    }

    // Handle creation can be slow, so names are gathered under the lock and opened outside of it
    fn cache_handles(&self) {
        let mut file_names: Vec<String> = Vec::default();
        {
            let mut state = self.state.lock().unwrap();
            let IoQueueState {
                requests, handles, ..
            } = &mut *state;
            for request in requests.iter_mut() {
                if request.handle_requested {
                    continue;
                }
                if let RequestKind::Read { .. } = request.kind {
                    request.handle_requested = true;
                    if !handles.contains_key(&request.file_name)
                        && !file_names.contains(&request.file_name)
                    {
                        file_names.push(request.file_name.clone());
                    }
                }
            }
        }

        for file_name in file_names {
            self.open_handle(&file_name);
        }
    }

    fn open_handle(
        &self,
        file_name: &str,
    ) -> Option<SharedHandle> {
        profiling::scope!("AsyncIoService open handle");
        match self.backend.open(file_name) {
            Ok(handle) => {
                log::debug!("Opened handle for {}", file_name);
                IoStatsCounters::add(&self.stats.handles_opened, 1);
                let mut state = self.state.lock().unwrap();
                let handle = state
                    .handles
                    .entry(file_name.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(handle)));
                Some(handle.clone())
            }
            Err(e) => {
                log::warn!("Could not open a handle for {}: {}", file_name, e);
                None
            }
        }
    }

    // The handle cached when the request was queued may have been destroyed since
    fn get_or_open_handle(
        &self,
        file_name: &str,
    ) -> Option<SharedHandle> {
        let cached = self.state.lock().unwrap().handles.get(file_name).cloned();
        cached.or_else(|| self.open_handle(file_name))
    }

    fn take_next_request(&self) -> Option<QueuedRequest> {
        let mut state = self.state.lock().unwrap();
        let min_priority = state.min_priority;
        let mut best: Option<(usize, IoPriority)> = None;
        for (index, request) in state.requests.iter().enumerate() {
            if request.priority < min_priority {
                continue;
            }
            // Strictly greater keeps the earliest request among equal priorities
            if best.map(|(_, priority)| request.priority > priority).unwrap_or(true) {
                best = Some((index, request.priority));
            }
        }

        let (index, _) = best?;
        state.busy_with_request = true;
        Some(state.requests.remove(index))
    }

    fn finish_request(
        &self,
        request: &QueuedRequest,
    ) {
        if let Some(counter) = &request.counter {
            counter.decrement();
        }
        IoStatsCounters::add(&self.stats.requests_serviced, 1);
        self.state.lock().unwrap().busy_with_request = false;
    }

    fn service(
        &self,
        request: QueuedRequest,
    ) {
        profiling::scope!("AsyncIoService::service");
        match &request.kind {
            RequestKind::DestroyHandle => {
                log::trace!("Servicing {:?}: destroy handle {}", request.id, request.file_name);
                let removed = self.state.lock().unwrap().handles.remove(&request.file_name);
                if removed.is_some() {
                    log::debug!("Closed handle for {}", request.file_name);
                    IoStatsCounters::add(&self.stats.handles_closed, 1);
                }
            }
            RequestKind::Read {
                offset,
                size,
                uncompressed_size,
                compression,
                dest,
            } => {
                log::trace!(
                    "Servicing {:?}: {} bytes at {} of {} (uncompressed {})",
                    request.id,
                    size,
                    offset,
                    request.file_name,
                    uncompressed_size
                );
                match self.get_or_open_handle(&request.file_name) {
                    Some(handle) => {
                        let result = {
                            let mut data = dest.data();
                            if *uncompressed_size > 0 {
                                self.fulfill_compressed_read(
                                    &handle,
                                    &request.file_name,
                                    *offset,
                                    *size,
                                    *uncompressed_size,
                                    *compression,
                                    &mut data[..],
                                )
                            } else if (data.len() as u64) < *size {
                                Err(LoaderError::StringError(format!(
                                    "read of {} bytes into a {} byte buffer",
                                    size,
                                    data.len()
                                )))
                            } else {
                                self.internal_read(&handle, *offset, &mut data[..*size as usize])
                            }
                        };

                        if let Err(e) = result {
                            self.handle_read_failure(&request, dest, e);
                        }
                    }
                    None => {
                        log::warn!(
                            "No handle for {}, request {:?} completes without data",
                            request.file_name,
                            request.id
                        );
                        IoStatsCounters::add(&self.stats.missing_handle_requests, 1);
                    }
                }
            }
        }

        self.finish_request(&request);
    }

    fn handle_read_failure(
        &self,
        request: &QueuedRequest,
        dest: &IoBuffer,
        error: LoaderError,
    ) {
        IoStatsCounters::add(&self.stats.failed_requests, 1);
        if let LoaderError::Corrupted(report) = &error {
            log::error!("{}", report);
            if self.config.corruption_policy == CorruptionPolicy::Abort {
                log::error!("Aborting, corrupted compressed data cannot be recovered from");
                std::process::abort();
            }
        } else {
            log::warn!(
                "Request {:?} for {} failed: {}",
                request.id,
                request.file_name,
                error
            );
        }
        dest.set_error(error);
    }

    fn internal_read(
        &self,
        handle: &SharedHandle,
        offset: u64,
        dest: &mut [u8],
    ) -> LoaderResult<()> {
        let _gate = self.read_gate.begin_read();
        let start_time = self.clock.now();
        handle.lock().unwrap().read_at(offset, dest)?;
        IoStatsCounters::add(&self.stats.bytes_read, dest.len() as u64);
        let read_time = self.clock.now().saturating_sub(start_time);
        self.constrain_bandwidth(dest.len() as u64, read_time);
        Ok(())
    }

    fn constrain_bandwidth(
        &self,
        bytes_read: u64,
        read_time: Duration,
    ) {
        let limit = self.config.bandwidth_limit_mb_per_sec;
        if limit <= 0.0 {
            return;
        }

        let expected =
            Duration::from_secs_f64(bytes_read as f64 / (limit as f64 * 1024.0 * 1024.0));
        if expected > read_time {
            let wait = expected - read_time;
            IoStatsCounters::add(&self.stats.throttle_sleep_ns, wait.as_nanos() as u64);
            self.sleeper.sleep(wait);
        }
    }

    fn corruption(
        file_name: &str,
        offset: u64,
        reason: &'static str,
        expected: u64,
        actual: u64,
    ) -> LoaderError {
        LoaderError::Corrupted(CorruptionReport {
            file_name: file_name.to_string(),
            offset,
            reason,
            expected,
            actual,
        })
    }

    fn fulfill_compressed_read(
        &self,
        handle: &SharedHandle,
        file_name: &str,
        offset: u64,
        size: u64,
        uncompressed_size: u64,
        compression: CompressionMethod,
        dest: &mut [u8],
    ) -> LoaderResult<()> {
        profiling::scope!("AsyncIoService::fulfill_compressed_read");
        if dest.len() as u64 != uncompressed_size {
            return Err(LoaderError::StringError(format!(
                "compressed read of {} bytes into a {} byte buffer",
                uncompressed_size,
                dest.len()
            )));
        }

        let mut header_bytes = [0u8; STREAM_HEADER_SIZE];
        self.internal_read(handle, offset, &mut header_bytes)?;
        let header = match StreamHeader::parse(&header_bytes) {
            Ok(header) => header,
            Err(FormatError::BadTag { expected, actual }) => {
                return Err(Self::corruption(
                    file_name,
                    offset,
                    "stream tag matches neither byte order",
                    expected as u64,
                    actual as u64,
                ))
            }
            Err(_) => {
                return Err(Self::corruption(
                    file_name,
                    offset,
                    "stream chunk size is zero",
                    PACKAGE_FILE_TAG as u64,
                    0,
                ))
            }
        };

        let entry_count = header.table_entry_count(uncompressed_size);
        let table_size = entry_count * CHUNK_INFO_SIZE;
        let mut table_bytes = vec![0u8; table_size];
        self.internal_read(handle, offset + STREAM_HEADER_SIZE as u64, &mut table_bytes)?;
        let table = ChunkTable::parse(&header, entry_count, &table_bytes)?;

        let calculated_size = table.computed_uncompressed_size();
        if table.summary.uncompressed_size as u64 != calculated_size {
            return Err(Self::corruption(
                file_name,
                offset,
                "chunk table total disagrees with the sum of its chunks",
                table.summary.uncompressed_size as u64,
                calculated_size,
            ));
        }

        let required_size =
            (STREAM_HEADER_SIZE + table_size) as u64 + table.summary.compressed_size as u64;
        if required_size > size {
            return Err(Self::corruption(
                file_name,
                offset,
                "header, chunk table and payload exceed the request size",
                size,
                required_size,
            ));
        }

        if uncompressed_size != calculated_size {
            return Err(Self::corruption(
                file_name,
                offset,
                "requested uncompressed size disagrees with the chunk table",
                uncompressed_size,
                calculated_size,
            ));
        }

        let compressed_size = table.computed_compressed_size();
        if table.summary.compressed_size as u64 != compressed_size {
            return Err(Self::corruption(
                file_name,
                offset,
                "chunk table payload size disagrees with the sum of its chunks",
                table.summary.compressed_size as u64,
                compressed_size,
            ));
        }

        if let Err(e) = table.validate_chunk_sizes() {
            log::error!("{}", e);
            return Err(Self::corruption(
                file_name,
                offset,
                "chunk uncompressed sizes are not uniform",
                table.chunk_size as u64,
                0,
            ));
        }

        if table.chunks.is_empty() {
            return Ok(());
        }

        let scratch_size = ((table.max_compressed_chunk_size() + SCRATCH_ALIGNMENT - 1)
            / SCRATCH_ALIGNMENT)
            * SCRATCH_ALIGNMENT;
        let mut scratch = [vec![0u8; scratch_size], vec![0u8; scratch_size]];
        let [scratch_a, scratch_b] = &mut scratch;

        let mut read_offset = offset + required_size - table.summary.compressed_size as u64;
        let first_size = table.chunks[0].compressed_size as usize;
        self.internal_read(handle, read_offset, &mut scratch_a[..first_size])?;
        read_offset += first_size as u64;

        let decompressor = &*self.decompressor;
        let mut remaining_dest: &mut [u8] = dest;
        for (index, chunk) in table.chunks.iter().enumerate() {
            let (chunk_dest, rest) =
                std::mem::take(&mut remaining_dest).split_at_mut(chunk.uncompressed_size as usize);
            remaining_dest = rest;

            let (filled, spare) = if index % 2 == 0 {
                (&*scratch_a, &mut *scratch_b)
            } else {
                (&*scratch_b, &mut *scratch_a)
            };
            let src = &filled[..chunk.compressed_size as usize];
            let next_chunk = table.chunks.get(index + 1);

            let (decompress_result, read_result) = if self.config.synchronous_decompression {
                let decompress_result = decompressor.decompress(compression, src, chunk_dest);
                let read_result = match next_chunk {
                    Some(next) => self.internal_read(
                        handle,
                        read_offset,
                        &mut spare[..next.compressed_size as usize],
                    ),
                    None => Ok(()),
                };
                (decompress_result, read_result)
            } else {
                // Decompress this chunk while the next one is read into the other buffer
                std::thread::scope(|scope| {
                    let task = scope.spawn(move || {
                        profiling::scope!("decompress chunk");
                        decompressor.decompress(compression, src, chunk_dest)
                    });
                    let read_result = match next_chunk {
                        Some(next) => self.internal_read(
                            handle,
                            read_offset,
                            &mut spare[..next.compressed_size as usize],
                        ),
                        None => Ok(()),
                    };
                    let decompress_result = task.join().unwrap_or_else(|_| {
                        Err(LoaderError::Decompression(
                            "decompression task panicked".to_string(),
                        ))
                    });
                    (decompress_result, read_result)
                })
            };

            if let Err(e) = decompress_result {
                log::error!("Chunk {} of {} failed to decompress: {}", index + 1, file_name, e);
                return Err(Self::corruption(
                    file_name,
                    offset,
                    "chunk failed to decompress",
                    chunk.uncompressed_size as u64,
                    0,
                ));
            }
            read_result?;

            if let Some(next) = next_chunk {
                read_offset += next.compressed_size as u64;
            }
        }

        IoStatsCounters::add(&self.stats.uncompressed_bytes_produced, uncompressed_size);
        Ok(())
    }
}

// Services requests until the finish channel is signalled
struct IoWorkerThread {
    finish_tx: Sender<()>,
    join_handle: JoinHandle<()>,
}

impl IoWorkerThread {
    fn new(
        shared: Arc<AsyncIoShared>,
        wake_rx: Receiver<()>,
    ) -> LoaderResult<Self> {
        let (finish_tx, finish_rx) = crossbeam_channel::bounded::<()>(1);
        let join_handle = std::thread::Builder::new()
            .name("Async IO Thread".into())
            .spawn(move || {
                profiling::register_thread!("Async IO Thread");
                log::debug!("Async IO thread started");
                let idle_sleep = Duration::from_millis(shared.config.suspended_idle_sleep_ms);
                loop {
                    if finish_rx.try_recv().is_ok() {
                        break;
                    }

                    if shared.read_gate.is_suspended() {
                        if finish_rx.recv_timeout(idle_sleep).is_ok() {
                            break;
                        }
                        continue;
                    }

                    shared.cache_handles();

                    match shared.take_next_request() {
                        Some(request) => shared.service(request),
                        None => {
                            let finished = crossbeam_channel::select! {
                                recv(wake_rx) -> _msg => false,
                                recv(finish_rx) -> _msg => true,
                            };
                            if finished {
                                break;
                            }
                        }
                    }
                }
                log::debug!("Async IO thread stopped");
            })?;

        Ok(IoWorkerThread {
            finish_tx,
            join_handle,
        })
    }

    fn finish(self) {
        let _ = self.finish_tx.send(());
        if self.join_handle.join().is_err() {
            log::error!("Async IO thread panicked");
        }
    }
}

/// Everything the IO service depends on besides the backend
#[derive(Clone)]
pub struct IoServiceOptions {
    pub config: IoConfig,
    pub poll: PollConfig,
    pub decompressor: Arc<dyn Decompressor>,
    pub clock: Arc<dyn Clock>,
    pub sleeper: Arc<dyn Sleeper>,
}

impl IoServiceOptions {
    pub fn new(config: &StreamingConfig) -> Self {
        IoServiceOptions {
            config: config.io.clone(),
            poll: config.poll.clone(),
            decompressor: Arc::new(StandardDecompressor),
            clock: Arc::new(SystemClock::default()),
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    pub fn with_decompressor(
        mut self,
        decompressor: Arc<dyn Decompressor>,
    ) -> Self {
        self.decompressor = decompressor;
        self
    }

    pub fn with_clock(
        mut self,
        clock: Arc<dyn Clock>,
    ) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sleeper(
        mut self,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        self.sleeper = sleeper;
        self
    }
}

impl Default for IoServiceOptions {
    fn default() -> Self {
        IoServiceOptions::new(&StreamingConfig::default())
    }
}

/// Accepts reads from any thread and services them on one background thread, highest priority
/// first and FIFO within a priority. Owns the cache of open file handles.
pub struct AsyncIoService {
    shared: Arc<AsyncIoShared>,
    poller: Poller,
    worker: Option<IoWorkerThread>,
}

impl AsyncIoService {
    pub fn new(
        backend: Arc<dyn IoBackend>,
        options: IoServiceOptions,
    ) -> LoaderResult<Self> {
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        let shared = Arc::new(AsyncIoShared {
            state: Mutex::new(IoQueueState {
                requests: Vec::default(),
                handles: HashMap::default(),
                min_priority: IoPriority::Min,
                // start at 1 because 0 means null
                next_request_id: 1,
                busy_with_request: false,
            }),
            read_gate: ReadGate::default(),
            backend,
            decompressor: options.decompressor,
            clock: options.clock,
            sleeper: options.sleeper.clone(),
            config: options.config,
            stats: IoStatsCounters::default(),
            wake_tx,
        });

        let worker = IoWorkerThread::new(shared.clone(), wake_rx)?;

        Ok(AsyncIoService {
            shared,
            poller: Poller::new(options.poll, options.sleeper),
            worker: Some(worker),
        })
    }

    pub fn backend(&self) -> &Arc<dyn IoBackend> {
        &self.shared.backend
    }

    pub fn poller(&self) -> &Poller {
        &self.poller
    }

    pub fn queue_read(
        &self,
        request: ReadRequest,
    ) -> LoaderResult<RequestId> {
        if request.offset < 0 {
            return Err(LoaderError::InvalidOffset(request.offset));
        }

        if let Some(counter) = &request.counter {
            counter.increment();
        }

        let id = self.enqueue(
            request.file_name,
            RequestKind::Read {
                offset: request.offset as u64,
                size: request.size,
                uncompressed_size: request.uncompressed_size,
                compression: request.compression,
                dest: request.dest,
            },
            request.priority,
            request.counter,
        );
        Ok(id)
    }

    fn enqueue(
        &self,
        file_name: String,
        kind: RequestKind,
        priority: IoPriority,
        counter: Option<CompletionCounter>,
    ) -> RequestId {
        let id = {
            let mut state = self.shared.state.lock().unwrap();
            let id = RequestId(state.next_request_id);
            state.next_request_id += 1;
            state.requests.push(QueuedRequest {
                id,
                file_name,
                kind,
                priority,
                counter,
                handle_requested: false,
            });
            id
        };
        self.shared.wake();
        id
    }

    /// Reads `size` bytes at `offset` into `dest`
    pub fn load_data(
        &self,
        file_name: &str,
        offset: i64,
        size: u64,
        dest: IoBuffer,
        counter: Option<CompletionCounter>,
        priority: IoPriority,
    ) -> LoaderResult<RequestId> {
        self.queue_read(ReadRequest {
            file_name: file_name.to_string(),
            offset,
            size,
            uncompressed_size: 0,
            compression: CompressionMethod::None,
            dest,
            priority,
            counter,
        })
    }

    /// Decompresses the `size` byte compressed stream at `offset` into `dest`, which must be
    /// `uncompressed_size` bytes long
    pub fn load_compressed_data(
        &self,
        file_name: &str,
        offset: i64,
        size: u64,
        uncompressed_size: u64,
        compression: CompressionMethod,
        dest: IoBuffer,
        counter: Option<CompletionCounter>,
        priority: IoPriority,
    ) -> LoaderResult<RequestId> {
        self.queue_read(ReadRequest {
            file_name: file_name.to_string(),
            offset,
            size,
            uncompressed_size,
            compression,
            dest,
            priority,
            counter,
        })
    }

    /// Closes and evicts the cached handle for the file once serviced
    pub fn queue_destroy_handle(
        &self,
        file_name: &str,
    ) -> RequestId {
        self.enqueue(
            file_name.to_string(),
            RequestKind::DestroyHandle,
            IoPriority::Max,
            None,
        )
    }

    /// Lets the service know nothing else will be read from the file for a while
    pub fn hint_done_with_file(
        &self,
        file_name: &str,
    ) -> RequestId {
        log::trace!("Done with {}", file_name);
        self.queue_destroy_handle(file_name)
    }

    /// Removes the given requests if they have not started yet. Returns how many were removed.
    pub fn cancel_requests(
        &self,
        ids: &[RequestId],
    ) -> usize {
        let mut state = self.shared.state.lock().unwrap();
        let mut canceled = 0;
        for index in (0..state.requests.len()).rev() {
            if ids.contains(&state.requests[index].id) {
                let request = state.requests.remove(index);
                if let Some(counter) = &request.counter {
                    counter.decrement();
                }
                canceled += 1;
            }
        }
        IoStatsCounters::add(&self.shared.stats.requests_canceled, canceled as u64);
        canceled
    }

    /// Drops every queued request. Completion counters of the dropped requests are left as they
    /// are, so anything waiting on them waits forever.
    pub fn cancel_all_outstanding(&self) -> usize {
        let dropped = {
            let mut state = self.shared.state.lock().unwrap();
            let dropped = state.requests.len();
            state.requests.clear();
            dropped
        };

        if dropped > 0 {
            log::warn!(
                "Dropped {} queued IO requests, their completion counters will not reach zero",
                dropped
            );
        }
        IoStatsCounters::add(&self.shared.stats.requests_canceled, dropped as u64);
        dropped
    }

    pub fn set_min_priority(
        &self,
        min_priority: IoPriority,
    ) {
        let lowered = {
            let mut state = self.shared.state.lock().unwrap();
            let lowered = min_priority < state.min_priority;
            state.min_priority = min_priority;
            lowered
        };

        if lowered {
            self.shared.wake();
        }
    }

    pub fn min_priority(&self) -> IoPriority {
        self.shared.state.lock().unwrap().min_priority
    }

    /// Polls until nothing is queued and nothing is being serviced
    pub fn block_until_all_requests_finished(&self) {
        profiling::scope!("AsyncIoService::block_until_all_requests_finished");
        self.poller.poll_until(|| {
            let state = self.shared.state.lock().unwrap();
            state.requests.is_empty() && !state.busy_with_request
        });
    }

    pub fn block_until_all_requests_finished_and_flush_handles(&self) {
        self.block_until_all_requests_finished();
        self.flush_handles();
    }

    /// Closes every cached handle. A read in progress keeps its handle alive until it finishes.
    pub fn flush_handles(&self) {
        let closed = {
            let mut state = self.shared.state.lock().unwrap();
            let closed = state.handles.len();
            state.handles.clear();
            closed
        };
        log::debug!("Flushed {} file handles", closed);
        IoStatsCounters::add(&self.shared.stats.handles_closed, closed as u64);
    }

    /// Blocks new platform reads until `resume`. Waits for a read already in progress to finish.
    pub fn suspend(&self) {
        log::debug!("Suspending async IO");
        self.shared.read_gate.suspend();
    }

    pub fn resume(&self) {
        log::debug!("Resuming async IO");
        self.shared.read_gate.resume();
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.read_gate.is_suspended()
    }

    pub fn pending_request_count(&self) -> usize {
        self.shared.state.lock().unwrap().requests.len()
    }

    pub fn is_busy(&self) -> bool {
        self.shared.state.lock().unwrap().busy_with_request
    }

    pub fn cached_handle_count(&self) -> usize {
        self.shared.state.lock().unwrap().handles.len()
    }

    pub fn has_cached_handle(
        &self,
        file_name: &str,
    ) -> bool {
        self.shared
            .state
            .lock()
            .unwrap()
            .handles
            .contains_key(file_name)
    }

    pub fn stats(&self) -> IoStats {
        self.shared.stats.snapshot()
    }
}

impl Drop for AsyncIoService {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.finish();
        }
    }
}
