use streamload_base::hashing::{HashMap, HashSet};
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

/// An open file. Dropping the handle closes it.
pub trait IoHandle: Send {
    /// Fills all of `dest` with the bytes starting at `offset`
    fn read_at(
        &mut self,
        offset: u64,
        dest: &mut [u8],
    ) -> std::io::Result<()>;
}

/// Opaque platform file access used by the IO worker thread
pub trait IoBackend: Send + Sync {
    fn open(
        &self,
        file_name: &str,
    ) -> std::io::Result<Box<dyn IoHandle>>;

    fn file_size(
        &self,
        file_name: &str,
    ) -> std::io::Result<u64>;
}

/// Reads files relative to a root directory
pub struct DiskIoBackend {
    root_path: PathBuf,
}

impl DiskIoBackend {
    pub fn new(root_path: PathBuf) -> Self {
        DiskIoBackend { root_path }
    }

    pub fn root_path(&self) -> &PathBuf {
        &self.root_path
    }
}

struct DiskIoHandle {
    file: std::fs::File,
}

impl IoHandle for DiskIoHandle {
    fn read_at(
        &mut self,
        offset: u64,
        dest: &mut [u8],
    ) -> std::io::Result<()> {
        profiling::scope!("DiskIoHandle::read_at");
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(dest)
    }
}

impl IoBackend for DiskIoBackend {
    fn open(
        &self,
        file_name: &str,
    ) -> std::io::Result<Box<dyn IoHandle>> {
        let file = std::fs::File::open(self.root_path.join(file_name))?;
        Ok(Box::new(DiskIoHandle { file }))
    }

    fn file_size(
        &self,
        file_name: &str,
    ) -> std::io::Result<u64> {
        Ok(std::fs::metadata(self.root_path.join(file_name))?.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRecord {
    pub file_name: String,
    pub offset: u64,
    pub length: usize,
}

#[derive(Default)]
struct ReadGateState {
    paused: bool,
    blocked_reads: usize,
}

#[derive(Default)]
struct MemoryBackendState {
    open_count: AtomicUsize,
    live_handles: AtomicUsize,
    read_log: Mutex<Vec<ReadRecord>>,
    gate: Mutex<ReadGateState>,
    gate_changed: Condvar,
    read_latency: Mutex<Duration>,
}

/// In-memory files with instrumentation: optional per-read latency, a log of every read, open
/// and live handle counts, and a gate that holds reads mid-service until released.
#[derive(Default)]
pub struct MemoryIoBackend {
    files: RwLock<HashMap<String, Arc<Vec<u8>>>>,
    unopenable: RwLock<HashSet<String>>,
    state: Arc<MemoryBackendState>,
}

impl MemoryIoBackend {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add_file(
        &self,
        file_name: &str,
        data: Vec<u8>,
    ) {
        self.files
            .write()
            .unwrap()
            .insert(file_name.to_string(), Arc::new(data));
    }

    /// The file reports a size but every attempt to open it fails
    pub fn make_unopenable(
        &self,
        file_name: &str,
    ) {
        self.unopenable
            .write()
            .unwrap()
            .insert(file_name.to_string());
    }

    pub fn set_read_latency(
        &self,
        latency: Duration,
    ) {
        *self.state.read_latency.lock().unwrap() = latency;
    }

    pub fn pause_reads(&self) {
        self.state.gate.lock().unwrap().paused = true;
    }

    pub fn resume_reads(&self) {
        self.state.gate.lock().unwrap().paused = false;
        self.state.gate_changed.notify_all();
    }

    /// Number of reads currently held by `pause_reads`
    pub fn blocked_read_count(&self) -> usize {
        self.state.gate.lock().unwrap().blocked_reads
    }

    pub fn open_count(&self) -> usize {
        self.state.open_count.load(Ordering::Acquire)
    }

    pub fn live_handle_count(&self) -> usize {
        self.state.live_handles.load(Ordering::Acquire)
    }

    pub fn read_log(&self) -> Vec<ReadRecord> {
        self.state.read_log.lock().unwrap().clone()
    }

    pub fn clear_read_log(&self) {
        self.state.read_log.lock().unwrap().clear();
    }
}

struct MemoryIoHandle {
    file_name: String,
    data: Arc<Vec<u8>>,
    state: Arc<MemoryBackendState>,
}

impl IoHandle for MemoryIoHandle {
    fn read_at(
        &mut self,
        offset: u64,
        dest: &mut [u8],
    ) -> std::io::Result<()> {
        {
            let mut gate = self.state.gate.lock().unwrap();
            if gate.paused {
                gate.blocked_reads += 1;
                while gate.paused {
                    gate = self.state.gate_changed.wait(gate).unwrap();
                }
                gate.blocked_reads -= 1;
            }
        }

        let latency = *self.state.read_latency.lock().unwrap();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        self.state.read_log.lock().unwrap().push(ReadRecord {
            file_name: self.file_name.clone(),
            offset,
            length: dest.len(),
        });

        let start = offset as usize;
        let end = start + dest.len();
        if end > self.data.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "read of {} bytes at {} past the end of {} ({} bytes)",
                    dest.len(),
                    offset,
                    self.file_name,
                    self.data.len()
                ),
            ));
        }

        dest.copy_from_slice(&self.data[start..end]);
        Ok(())
    }
}

impl Drop for MemoryIoHandle {
    fn drop(&mut self) {
        self.state.live_handles.fetch_sub(1, Ordering::AcqRel);
    }
}

impl IoBackend for MemoryIoBackend {
    fn open(
        &self,
        file_name: &str,
    ) -> std::io::Result<Box<dyn IoHandle>> {
        if self.unopenable.read().unwrap().contains(file_name) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("{} cannot be opened", file_name),
            ));
        }

        let data = self
            .files
            .read()
            .unwrap()
            .get(file_name)
            .cloned()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{} not found", file_name),
                )
            })?;

        self.state.open_count.fetch_add(1, Ordering::AcqRel);
        self.state.live_handles.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(MemoryIoHandle {
            file_name: file_name.to_string(),
            data,
            state: self.state.clone(),
        }))
    }

    fn file_size(
        &self,
        file_name: &str,
    ) -> std::io::Result<u64> {
        self.files
            .read()
            .unwrap()
            .get(file_name)
            .map(|x| x.len() as u64)
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{} not found", file_name),
                )
            })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn memory_handles_are_counted() {
        let backend = MemoryIoBackend::new();
        backend.add_file("a", vec![1, 2, 3, 4]);
        let mut handle = backend.open("a").unwrap();
        assert_eq!(backend.live_handle_count(), 1);

        let mut dest = [0u8; 2];
        handle.read_at(1, &mut dest).unwrap();
        assert_eq!(dest, [2, 3]);
        assert!(handle.read_at(3, &mut dest).is_err());

        drop(handle);
        assert_eq!(backend.live_handle_count(), 0);
        assert_eq!(backend.open_count(), 1);
        assert_eq!(backend.read_log().len(), 2);
    }

    #[test]
    fn missing_and_unopenable_files_fail() {
        let backend = MemoryIoBackend::new();
        backend.add_file("locked", vec![0; 8]);
        backend.make_unopenable("locked");
        assert!(backend.open("missing").is_err());
        assert!(backend.open("locked").is_err());
        assert_eq!(backend.file_size("locked").unwrap(), 8);
    }

    #[test]
    fn disk_backend_reads_at_offset() {
        let dir = std::env::temp_dir().join(format!("streamload-disk-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("file.bin"), [9u8, 8, 7, 6, 5]).unwrap();

        let backend = DiskIoBackend::new(dir.clone());
        assert_eq!(backend.file_size("file.bin").unwrap(), 5);
        let mut handle = backend.open("file.bin").unwrap();
        let mut dest = [0u8; 3];
        handle.read_at(2, &mut dest).unwrap();
        assert_eq!(dest, [7, 6, 5]);

        drop(handle);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
