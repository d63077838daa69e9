//! Asynchronous capabilities consumed by the region operations, and the single-slot completion
//! mechanism used to wait for them.
//!
//! A request is issued together with a [`Completer`]. The capability signals exactly one
//! [`Event`] through it, either before returning or later from another context. The caller blocks
//! in [`PendingOp::issue`] until that happens. Buffers are lent by value with the request and
//! handed back in the completion, so only one request can hold the staging buffer at a time.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::details::FirmwareDetails;
use crate::flash::FlashDriver;
use crate::header::{self, HEADER_SIZE};
use crate::region::RegionLayout;

/// The completion signal of an asynchronous request
#[derive(Debug)]
pub enum Event {
    /// Details of the active firmware were read and decoded
    ActiveDetails(FirmwareDetails),

    /// A read finished; the buffer is returned truncated to the bytes actually read
    ReadDone(Vec<u8>),

    /// The request failed after being accepted; the buffer is returned if the source still has it
    Failed(Option<Vec<u8>>),
}

/// Reasons a capability may refuse a request outright
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("slot {0} does not exist")]
    NoSuchSlot(u32),
    #[error("source is not accepting requests")]
    Unavailable,
    #[error("{0}")]
    Io(#[from] io::Error),
}

/// Signals completion of one request. Dropping it without calling `complete` means the request
/// will never complete.
#[derive(Debug)]
pub struct Completer(SyncSender<Event>);

impl Completer {
    pub fn complete(self, event: Event) {
        // The waiter may have given up already, in which case nobody cares
        let _ = self.0.send(event);
    }
}

/// How a pending request ended
#[derive(Debug)]
pub enum Completion {
    Signalled(Event),
    Rejected(SourceError),
    /// The completer was dropped without a signal
    NoSignal,
    TimedOut,
}

/// Issues requests one at a time and waits for each to complete
#[derive(Debug, Default)]
pub struct PendingOp {
    timeout: Option<Duration>,
}

impl PendingOp {
    /// With `timeout` of `None`, a capability that holds on to its completer stalls the caller
    /// indefinitely.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    /// Issue a request and block until it completes.
    ///
    /// Each request gets a fresh single-slot channel, so no stale signal from an earlier request
    /// can be observed.
    pub fn issue<F>(&mut self, request: F) -> Completion
    where
        F: FnOnce(Completer) -> Result<(), SourceError>,
    {
        let (tx, rx): (_, Receiver<Event>) = mpsc::sync_channel(1);

        if let Err(err) = request(Completer(tx)) {
            return Completion::Rejected(err);
        }

        match self.timeout {
            None => rx.recv().map_or(Completion::NoSignal, Completion::Signalled),
            Some(timeout) => match rx.recv_timeout(timeout) {
                Ok(event) => Completion::Signalled(event),
                Err(RecvTimeoutError::Timeout) => Completion::TimedOut,
                Err(RecvTimeoutError::Disconnected) => Completion::NoSignal,
            },
        }
    }
}

/// Supplies the bytes of candidate images stored in numbered slots
pub trait UpdateSource {
    /// Read up to `buf.len()` bytes of the image in `slot`, starting at `offset`.
    ///
    /// If the request is refused, the buffer is handed back with the error and `done` is dropped.
    fn read(
        &mut self,
        slot: u32,
        offset: u64,
        buf: Vec<u8>,
        done: Completer,
    ) -> Result<(), (SourceError, Vec<u8>)>;
}

/// Retrieves the details of the firmware currently installed in a region
pub trait DetailsReader<F: FlashDriver> {
    fn get_active_details(
        &mut self,
        flash: &F,
        layout: &RegionLayout,
        done: Completer,
    ) -> Result<(), SourceError>;
}

/// Reads and decodes the internal header at the start of the region
#[derive(Debug, Default, Copy, Clone)]
pub struct InternalHeader;

impl<F: FlashDriver> DetailsReader<F> for InternalHeader {
    fn get_active_details(
        &mut self,
        flash: &F,
        layout: &RegionLayout,
        done: Completer,
    ) -> Result<(), SourceError> {
        let mut buf = [0u8; HEADER_SIZE];
        let event = match flash.read(layout.header_address, &mut buf) {
            Ok(()) => header::decode(&buf).map_or(Event::Failed(None), Event::ActiveDetails),
            Err(err) => {
                log::warn!("could not read header at {:#010x}: {err}", layout.header_address);
                Event::Failed(None)
            }
        };

        done.complete(event);
        Ok(())
    }
}

/// Images held in memory, completing every request before returning
#[derive(Debug, Default, Clone)]
pub struct MemorySource {
    slots: Vec<Vec<u8>>,
    fail_at: Option<u64>,
    max_read: Option<usize>,
    requests: usize,
}

impl MemorySource {
    pub fn new(slots: Vec<Vec<u8>>) -> Self {
        Self {
            slots,
            ..Default::default()
        }
    }

    /// Fail any read covering byte `offset`
    pub fn fail_at(mut self, offset: u64) -> Self {
        self.fail_at = Some(offset);
        self
    }

    /// Never return more than `len` bytes per read
    pub fn max_read(mut self, len: usize) -> Self {
        self.max_read = Some(len);
        self
    }

    /// How many reads have been accepted
    pub fn requests(&self) -> usize {
        self.requests
    }
}

impl UpdateSource for MemorySource {
    fn read(
        &mut self,
        slot: u32,
        offset: u64,
        mut buf: Vec<u8>,
        done: Completer,
    ) -> Result<(), (SourceError, Vec<u8>)> {
        let Some(image) = self.slots.get(slot as usize) else {
            return Err((SourceError::NoSuchSlot(slot), buf));
        };
        self.requests += 1;

        let requested = offset..offset + buf.len() as u64;
        if self.fail_at.is_some_and(|at| requested.contains(&at)) {
            done.complete(Event::Failed(Some(buf)));
            return Ok(());
        }

        let available = image.get(offset as usize..).unwrap_or_default();
        let len = [buf.len(), available.len(), self.max_read.unwrap_or(usize::MAX)]
            .into_iter()
            .min()
            .unwrap_or(0);

        buf[..len].copy_from_slice(&available[..len]);
        buf.truncate(len);
        done.complete(Event::ReadDone(buf));
        Ok(())
    }
}

/// Images stored in files, one file per slot
#[derive(Debug)]
pub struct FileSource {
    slots: Vec<File>,
}

impl FileSource {
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> anyhow::Result<Self> {
        let slots = paths
            .iter()
            .map(File::open)
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Self { slots })
    }
}

impl UpdateSource for FileSource {
    fn read(
        &mut self,
        slot: u32,
        offset: u64,
        mut buf: Vec<u8>,
        done: Completer,
    ) -> Result<(), (SourceError, Vec<u8>)> {
        let Some(file) = self.slots.get(slot as usize) else {
            return Err((SourceError::NoSuchSlot(slot), buf));
        };

        let mut len = 0;
        while len < buf.len() {
            match file.read_at(&mut buf[len..], offset + len as u64) {
                Ok(0) => break,
                Ok(n) => len += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
                Err(e) => {
                    log::warn!("slot {slot} read at {offset:#x} failed: {e}");
                    done.complete(Event::Failed(Some(buf)));
                    return Ok(());
                }
            }
        }

        buf.truncate(len);
        done.complete(Event::ReadDone(buf));
        Ok(())
    }
}

struct Request {
    slot: u32,
    offset: u64,
    buf: Vec<u8>,
    done: Completer,
}

/// Runs another source on a worker thread, so completions arrive from outside the caller's
/// context, as they would from an interrupt-driven transport.
pub struct ThreadedSource {
    tx: Option<mpsc::Sender<Request>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl ThreadedSource {
    pub fn new<S: UpdateSource + Send + 'static>(mut inner: S) -> Self {
        let (tx, rx) = mpsc::channel::<Request>();
        let worker = thread::spawn(move || {
            for req in rx {
                if let Err((err, _)) = inner.read(req.slot, req.offset, req.buf, req.done) {
                    // The completer went down with the request; the waiter sees no signal
                    log::warn!("request for slot {} refused: {err}", req.slot);
                }
            }
        });

        Self {
            tx: Some(tx),
            worker: Some(worker),
        }
    }
}

impl UpdateSource for ThreadedSource {
    fn read(
        &mut self,
        slot: u32,
        offset: u64,
        buf: Vec<u8>,
        done: Completer,
    ) -> Result<(), (SourceError, Vec<u8>)> {
        let Some(tx) = &self.tx else {
            return Err((SourceError::Unavailable, buf));
        };

        tx.send(Request {
            slot,
            offset,
            buf,
            done,
        })
        .map_err(|mpsc::SendError(req)| (SourceError::Unavailable, req.buf))
    }
}

impl Drop for ThreadedSource {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn read_via(pending: &mut PendingOp, source: &mut impl UpdateSource, offset: u64) -> Completion {
        pending.issue(|done| {
            source
                .read(0, offset, vec![0; 8], done)
                .map_err(|(err, _)| err)
        })
    }

    #[test]
    fn test_memory_source() {
        let mut pending = PendingOp::default();
        let mut source = MemorySource::new(vec![(0..20).collect()]).fail_at(18);

        match read_via(&mut pending, &mut source, 4) {
            Completion::Signalled(Event::ReadDone(buf)) => assert_eq!(buf, [4, 5, 6, 7, 8, 9, 10, 11]),
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(
            read_via(&mut pending, &mut source, 12),
            Completion::Signalled(Event::Failed(Some(_)))
        ));

        match read_via(&mut pending, &mut source, 30) {
            Completion::Signalled(Event::ReadDone(buf)) => assert!(buf.is_empty()),
            other => panic!("unexpected {other:?}"),
        }

        let rejected = pending.issue(|done| source.read(1, 0, vec![0; 8], done).map_err(|(e, _)| e));
        assert!(matches!(rejected, Completion::Rejected(SourceError::NoSuchSlot(1))));
        assert_eq!(source.requests(), 3);
    }

    #[test]
    fn test_no_signal() {
        let mut pending = PendingOp::default();
        assert!(matches!(pending.issue(|_done| Ok(())), Completion::NoSignal));
    }

    #[test]
    fn test_timeout() {
        let mut pending = PendingOp::new(Some(Duration::from_millis(20)));
        let mut parked = None;
        let completion = pending.issue(|done| {
            parked = Some(done);
            Ok(())
        });
        assert!(matches!(completion, Completion::TimedOut));

        // A late signal is harmless
        if let Some(done) = parked {
            done.complete(Event::Failed(None));
        }
    }

    #[test]
    fn test_threaded_source() {
        let mut pending = PendingOp::new(Some(Duration::from_secs(10)));
        let mut source = ThreadedSource::new(MemorySource::new(vec![vec![0xAB; 100]]));

        for offset in [0, 50, 96] {
            match read_via(&mut pending, &mut source, offset) {
                Completion::Signalled(Event::ReadDone(buf)) => {
                    assert_eq!(buf.len(), std::cmp::min(8, 100 - offset as usize));
                    assert!(buf.iter().all(|&b| b == 0xAB));
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        // Refused by the inner source on the worker: the completer is dropped
        let refused = pending.issue(|done| source.read(3, 0, vec![0; 8], done).map_err(|(e, _)| e));
        assert!(matches!(refused, Completion::NoSignal));
    }
}
