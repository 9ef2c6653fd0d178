//! Threaded receive/store pipeline.
//!
//! Storage I/O can take far longer than the protocol tolerates between two
//! polls, so the receiving thread never touches storage. It runs receiver
//! sessions back to back and queues every completed frame; a storage thread
//! waits on a [`Condvar`] and drains the queue into a [`FrameStore`].
//!
//! The storage thread wakes when a frame was queued or the transfer closed,
//! then re-checks both: a timeout closes the transfer without queueing a
//! frame. Frames queued before the close are always written.

use crate::app::{TransferConfig, TransferReport};
use crate::error::SessionError;
use crate::fmt::{debug, error, info, warn};
use crate::link::Link;
use crate::session::Receiver;
use embedded_hal::delay::DelayNs;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread;
use std::vec::Vec;
use thiserror::Error;

/// Destination of completed frames.
pub trait FrameStore {
    /// Storage failure type.
    type Error: Debug;

    /// Stores frame number `index` (0-based, in arrival order).
    fn store(&mut self, index: u32, frame: &[u8]) -> Result<(), Self::Error>;

    /// Called once after the last frame.
    fn finish(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl FrameStore for Vec<u8> {
    type Error = core::convert::Infallible;

    fn store(&mut self, _index: u32, frame: &[u8]) -> Result<(), Self::Error> {
        self.extend_from_slice(frame);
        Ok(())
    }
}

/// Collects frames in memory and writes the whole file when the transfer
/// finishes.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    contents: Vec<u8>,
}

impl FileStore {
    /// A store materializing `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileStore {
            path: path.into(),
            contents: Vec::new(),
        }
    }
}

impl FrameStore for FileStore {
    type Error = std::io::Error;

    fn store(&mut self, _index: u32, frame: &[u8]) -> Result<(), Self::Error> {
        self.contents.extend_from_slice(frame);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Self::Error> {
        std::fs::write(&self.path, &self.contents)
    }
}

/// Failures that stop the pipeline.
#[derive(Error, Debug)]
pub enum PipelineError<LE, SE> {
    /// The receiving side failed.
    #[error("receive failed: {0}")]
    Receive(SessionError<LE>),
    /// The store rejected a frame.
    #[error("storage failed: {0:?}")]
    Store(SE),
}

/// Outcome of a pipeline run.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct PipelineReport {
    /// What the receiving thread saw.
    pub transfer: TransferReport,
    /// Frames the storage thread wrote.
    pub frames_stored: u32,
}

#[derive(Default)]
struct Shared {
    pending: VecDeque<Vec<u8>>,
    timed_out: bool,
    closed: bool,
}

/// Receives sessions on the calling thread while a scoped storage thread
/// writes completed frames into `store`.
///
/// The transfer ends after a frame shorter than `config.chunk_size` (the
/// final END acknowledgement is then repeated like in
/// [`receive_buffer`](crate::app::receive_buffer)) or on a session timeout.
///
/// # Errors
/// * [`PipelineError::Receive`] if the link fails or `config` is invalid
/// * [`PipelineError::Store`] if a frame could not be stored
pub fn run_pipeline<L, D, S>(
    config: &TransferConfig,
    link: &mut L,
    delay: &mut D,
    store: &mut S,
) -> Result<PipelineReport, PipelineError<L::Error, S::Error>>
where
    L: Link,
    D: DelayNs,
    S: FrameStore + Send,
    S::Error: Send,
{
    config.validate().map_err(|e| PipelineError::Receive(e.into()))?;
    let shared = (Mutex::new(Shared::default()), Condvar::new());

    thread::scope(|scope| {
        let storage = scope.spawn(|| store_frames(&shared, store));
        let received = receive_frames(config, link, delay, &shared);

        let (lock, cvar) = &shared;
        lock.lock().unwrap_or_else(PoisonError::into_inner).closed = true;
        cvar.notify_all();

        let stored = storage
            .join()
            .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
        let transfer = received.map_err(PipelineError::Receive)?;
        let frames_stored = stored.map_err(PipelineError::Store)?;
        Ok(PipelineReport {
            transfer,
            frames_stored,
        })
    })
}

fn receive_frames<L: Link, D: DelayNs>(
    config: &TransferConfig,
    link: &mut L,
    delay: &mut D,
    shared: &(Mutex<Shared>, Condvar),
) -> Result<TransferReport, SessionError<L::Error>> {
    let (lock, cvar) = shared;
    let mut report = TransferReport::default();
    let mut buffer = std::vec![0u8; config.chunk_size];
    loop {
        let mut receiver = Receiver::new(config.session, &mut buffer[..])?;
        let result = receiver.run(link, delay);
        report.diagnostics.accumulate(receiver.diagnostics());
        match result {
            Ok(()) => {}
            Err(e) if e.is_timeout() => {
                warn!("pipeline: exit due to timeout after {} bytes", report.bytes);
                report.timed_out = true;
                let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
                state.timed_out = true;
                cvar.notify_all();
                return Ok(report);
            }
            Err(e) => return Err(e),
        }
        // a repeated END from the previous session closes an empty one
        if !receiver.peer_confirmed() {
            continue;
        }

        let frame = receiver.data().to_vec();
        let last = frame.len() < config.chunk_size;
        if last {
            receiver.repeat_end_ack(
                link,
                delay,
                config.end_ack_repeats,
                config.end_ack_spacing_us,
            )?;
        }
        report.bytes += frame.len();
        report.sessions += 1;
        debug!("pipeline: queued frame {} ({} bytes)", report.sessions, frame.len());

        lock.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .push_back(frame);
        cvar.notify_one();
        if last {
            return Ok(report);
        }
    }
}

fn store_frames<S: FrameStore>(shared: &(Mutex<Shared>, Condvar), store: &mut S) -> Result<u32, S::Error> {
    let (lock, cvar) = shared;
    let mut index = 0u32;
    loop {
        let (batch, done) = {
            let mut state = cvar
                .wait_while(
                    lock.lock().unwrap_or_else(PoisonError::into_inner),
                    |s| s.pending.is_empty() && !s.closed && !s.timed_out,
                )
                .unwrap_or_else(PoisonError::into_inner);
            let batch: Vec<_> = state.pending.drain(..).collect();
            (batch, state.closed || state.timed_out)
        };
        for frame in batch {
            if let Err(e) = store.store(index, &frame) {
                error!("pipeline: storing frame {} failed", index);
                return Err(e);
            }
            index += 1;
        }
        if done {
            break;
        }
    }
    store.finish()?;
    info!("pipeline: stored {} frames", index);
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_drains_before_exit() {
        let shared = (Mutex::new(Shared::default()), Condvar::new());
        {
            let mut state = shared.0.lock().unwrap();
            state.pending.push_back(vec![1, 2]);
            state.pending.push_back(vec![3]);
            state.timed_out = true;
        }
        let mut out = Vec::new();
        assert_eq!(store_frames(&shared, &mut out).unwrap(), 2);
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn test_storage_wakes_on_close() {
        let shared = (Mutex::new(Shared::default()), Condvar::new());
        let mut out = Vec::new();
        thread::scope(|scope| {
            let handle = scope.spawn(|| store_frames(&shared, &mut out));
            {
                let mut state = shared.0.lock().unwrap();
                state.pending.push_back(vec![9; 4]);
                state.closed = true;
            }
            shared.1.notify_all();
            assert_eq!(handle.join().unwrap().unwrap(), 1);
        });
        assert_eq!(out, [9; 4]);
    }
}
