//! Background file reader
//!
//! One reader thread drains a bounded ring of requests. Producers publish a
//! slot under a short write lock and wake the reader through a condvar; the
//! reader seeks and reads against the [`FileHandle`] and then advances
//! `read_pos_processed`. Completion is checked without taking any lock by
//! comparing wrap-tolerant distances from the published write position.
//!
//! Closing a file is itself a ring request, so it runs after every read
//! published before it.

use super::FileHandle;
use crate::error::{Error, Result};
use crate::sync::{lock, wait};
use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Completion token; the value `read_pos_processed` reaches once the request is served
pub type ReadToken = u32;

/// Back-off while the request ring is full
const RING_FULL_BACKOFF: Duration = Duration::from_micros(100);

/// File registered with the reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReaderFileHandle(u32);

/// Destination of one read; filled by the reader thread
#[derive(Debug, Default)]
pub struct ReadTarget {
    data: Mutex<Option<Arc<[u8]>>>,
}

impl ReadTarget {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bytes read, once the request is complete (empty on a failed read)
    pub fn data(&self) -> Option<Arc<[u8]>> {
        lock(&self.data).clone()
    }

    fn fill(&self, bytes: Arc<[u8]>) {
        *lock(&self.data) = Some(bytes);
    }
}

enum Request {
    Read {
        file: ReaderFileHandle,
        offset: u64,
        len: usize,
        target: Arc<ReadTarget>,
    },
    Close(ReaderFileHandle),
}

#[derive(Default)]
struct FileTable {
    entries: Vec<Option<Box<dyn FileHandle>>>,
    free: Vec<u32>,
}

struct Shared {
    slots: Box<[Mutex<Option<Request>>]>,
    mask: u32,
    write_pos: AtomicU32,
    read_pos_processed: AtomicU32,
    write_lock: Mutex<()>,
    wake: Condvar,
    files: Mutex<FileTable>,
    stop: AtomicBool,
}

/// Single-threaded asynchronous reader
pub struct AsyncFileReader {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl AsyncFileReader {
    /// Start the reader thread
    ///
    /// # Arguments
    /// - `capacity`: request ring size, a power of two
    pub fn new(capacity: usize) -> Result<Self> {
        if !capacity.is_power_of_two() || capacity > u32::MAX as usize / 2 {
            return Err(Error::Config(format!(
                "reader ring capacity must be a power of two, got {}",
                capacity
            )));
        }

        let slots = (0..capacity).map(|_| Mutex::new(None)).collect();
        let shared = Arc::new(Shared {
            slots,
            mask: capacity as u32 - 1,
            write_pos: AtomicU32::new(0),
            read_pos_processed: AtomicU32::new(0),
            write_lock: Mutex::new(()),
            wake: Condvar::new(),
            files: Mutex::new(FileTable::default()),
            stop: AtomicBool::new(false),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("cue-file-reader".to_string())
            .spawn(move || Self::reader_loop(thread_shared))
            .map_err(|e| Error::Resource(format!("failed to spawn reader thread: {}", e)))?;

        info!("Async file reader started (ring capacity {})", capacity);

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Register an open file; the reader owns it until closed
    pub fn start_async_reading(&self, file: Box<dyn FileHandle>) -> ReaderFileHandle {
        let mut table = lock(&self.shared.files);
        let index = match table.free.pop() {
            Some(index) => {
                table.entries[index as usize] = Some(file);
                index
            }
            None => {
                table.entries.push(Some(file));
                table.entries.len() as u32 - 1
            }
        };
        debug!("Reader file {} opened", index);
        ReaderFileHandle(index)
    }

    /// Queue the file for closing behind every read already published
    pub fn stop_async_reading(&self, file: ReaderFileHandle) -> ReadToken {
        self.publish(Request::Close(file))
    }

    /// Queue a read of up to `len` bytes at `offset` into `target`
    pub fn request_read(
        &self,
        file: ReaderFileHandle,
        offset: u64,
        len: usize,
        target: Arc<ReadTarget>,
    ) -> ReadToken {
        self.publish(Request::Read {
            file,
            offset,
            len,
            target,
        })
    }

    /// True while the request behind `token` has not been served
    pub fn check_request_running(&self, token: ReadToken) -> bool {
        // Load order matters: processed never runs ahead of a later write_pos load
        let processed = self.shared.read_pos_processed.load(Ordering::Acquire);
        let written = self.shared.write_pos.load(Ordering::Acquire);
        written.wrapping_sub(token) < written.wrapping_sub(processed)
    }

    /// Requests published but not yet served
    pub fn pending(&self) -> u32 {
        let processed = self.shared.read_pos_processed.load(Ordering::Acquire);
        let written = self.shared.write_pos.load(Ordering::Acquire);
        written.wrapping_sub(processed)
    }

    pub fn capacity(&self) -> usize {
        self.shared.slots.len()
    }

    fn publish(&self, request: Request) -> ReadToken {
        let capacity = self.shared.slots.len() as u32;
        loop {
            {
                let _guard = lock(&self.shared.write_lock);
                let written = self.shared.write_pos.load(Ordering::Relaxed);
                let processed = self.shared.read_pos_processed.load(Ordering::Acquire);
                if written.wrapping_sub(processed) < capacity {
                    let slot = &self.shared.slots[(written & self.shared.mask) as usize];
                    *lock(slot) = Some(request);
                    let token = written.wrapping_add(1);
                    self.shared.write_pos.store(token, Ordering::Release);
                    self.shared.wake.notify_one();
                    return token;
                }
            }
            trace!("Reader ring full, backing off");
            thread::sleep(RING_FULL_BACKOFF);
        }
    }

    fn reader_loop(shared: Arc<Shared>) {
        debug!("Reader thread started");
        let mut read_pos: u32 = 0;

        loop {
            {
                let mut guard = lock(&shared.write_lock);
                while read_pos == shared.write_pos.load(Ordering::Acquire)
                    && !shared.stop.load(Ordering::Acquire)
                {
                    guard = wait(&shared.wake, guard);
                }
                if read_pos == shared.write_pos.load(Ordering::Acquire) {
                    // stop requested and ring drained
                    break;
                }
            }

            let request = lock(&shared.slots[(read_pos & shared.mask) as usize]).take();
            if let Some(request) = request {
                Self::serve(&shared, request);
            }

            read_pos = read_pos.wrapping_add(1);
            shared.read_pos_processed.store(read_pos, Ordering::Release);
        }

        debug!("Reader thread exiting");
    }

    fn serve(shared: &Shared, request: Request) {
        match request {
            Request::Read {
                file,
                offset,
                len,
                target,
            } => {
                // Only this thread reads or closes, so the handle can leave the
                // table while the blocking read runs
                let handle = lock(&shared.files)
                    .entries
                    .get_mut(file.0 as usize)
                    .and_then(Option::take);
                let Some(mut handle) = handle else {
                    error!("Read for unknown reader file {}", file.0);
                    target.fill(Arc::from(Vec::new()));
                    return;
                };

                let bytes = match read_at(handle.as_mut(), offset, len) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(
                            "Read of {} bytes at {} (file {}) failed: {}",
                            len, offset, file.0, e
                        );
                        Vec::new()
                    }
                };
                target.fill(Arc::from(bytes));

                lock(&shared.files).entries[file.0 as usize] = Some(handle);
            }
            Request::Close(file) => {
                let mut table = lock(&shared.files);
                let closed = match table.entries.get_mut(file.0 as usize) {
                    Some(entry) if entry.is_some() => {
                        *entry = None;
                        true
                    }
                    _ => false,
                };
                if closed {
                    table.free.push(file.0);
                    debug!("Reader file {} closed", file.0);
                } else {
                    error!("Close for unknown reader file {}", file.0);
                }
            }
        }
    }
}

/// Seek and read until `len` bytes or end of file
fn read_at(handle: &mut dyn FileHandle, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
    handle.seek(SeekFrom::Start(offset))?;
    let mut bytes = Vec::with_capacity(len);
    Read::take(&mut *handle, len as u64).read_to_end(&mut bytes)?;
    Ok(bytes)
}

impl Drop for AsyncFileReader {
    fn drop(&mut self) {
        {
            let _guard = lock(&self.shared.write_lock);
            self.shared.stop.store(true, Ordering::Release);
            self.shared.wake.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Reader thread panicked");
            }
        }
        info!("Async file reader stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{FileSystem, MemoryFileSystem};
    use std::path::Path;
    use std::time::Instant;

    fn wait_done(reader: &AsyncFileReader, token: ReadToken) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while reader.check_request_running(token) {
            assert!(Instant::now() < deadline, "read never completed");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_rejects_non_power_of_two() {
        assert!(AsyncFileReader::new(12).is_err());
        assert!(AsyncFileReader::new(0).is_err());
    }

    #[test]
    fn test_read_fills_target() {
        let fs = MemoryFileSystem::new();
        fs.insert("f", (0u8..=255).collect::<Vec<_>>());
        let reader = AsyncFileReader::new(8).unwrap();
        let file = reader.start_async_reading(fs.open(Path::new("f")).unwrap());

        let target = ReadTarget::new();
        let token = reader.request_read(file, 250, 16, Arc::clone(&target));
        wait_done(&reader, token);
        assert_eq!(&target.data().unwrap()[..], &[250, 251, 252, 253, 254, 255]);
    }

    #[test]
    fn test_handle_recycled_after_close() {
        let fs = MemoryFileSystem::new();
        fs.insert("f", vec![1u8; 4]);
        let reader = AsyncFileReader::new(4).unwrap();
        let a = reader.start_async_reading(fs.open(Path::new("f")).unwrap());
        let token = reader.stop_async_reading(a);
        wait_done(&reader, token);
        let b = reader.start_async_reading(fs.open(Path::new("f")).unwrap());
        assert_eq!(a, b);
    }
}
