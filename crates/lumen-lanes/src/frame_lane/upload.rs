// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crossbeam_channel::{Receiver, Sender};
use lumen_core::diagnostics::{DiagnosticEvent, DiagnosticSink};
use lumen_core::error::{DeviceError, SyncError};
use lumen_core::gpu::{FenceId, GpuDevice, QueueKind, ResourceId};
use lumen_core::sync::{completion_pair, Canceled, Completer, Completion};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Why an upload did not complete.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UploadError {
    /// Recording or submitting the copy failed. Uploads are never retried.
    #[error("upload #{ticket} failed: {reason}")]
    Failed {
        /// The upload's ticket.
        ticket: u64,
        /// What went wrong.
        reason: String,
    },
    /// The manager shut down before the upload completed.
    #[error("upload manager shut down before the upload completed")]
    Shutdown,
}

impl From<Canceled> for UploadError {
    fn from(_: Canceled) -> Self {
        UploadError::Shutdown
    }
}

/// A pending or finished upload.
///
/// The ticket is also the copy fence value the upload signals, so it can be
/// passed to [`FrameSynchronizer::wait_for_upload`](super::FrameSynchronizer::wait_for_upload).
#[derive(Debug, Clone)]
pub struct UploadHandle {
    ticket: u64,
    completion: Completion<Result<(), UploadError>>,
}

impl UploadHandle {
    /// The upload's ticket.
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// The result, if the upload finished. Never blocks.
    pub fn poll(&self) -> Option<Result<(), UploadError>> {
        self.completion.poll().map(flatten)
    }

    /// Returns `true` once the upload finished, successfully or not.
    pub fn is_complete(&self) -> bool {
        self.completion.is_complete()
    }

    /// Blocks until the upload finishes.
    pub fn wait(&self) -> Result<(), UploadError> {
        flatten(self.completion.wait())
    }

    /// Blocks until the upload finishes or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), UploadError>> {
        self.completion.wait_timeout(timeout).map(flatten)
    }
}

impl Future for UploadHandle {
    type Output = Result<(), UploadError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.completion).poll(cx).map(flatten)
    }
}

fn flatten(result: Result<Result<(), UploadError>, Canceled>) -> Result<(), UploadError> {
    result.map_err(UploadError::from).and_then(|outcome| outcome)
}

/// Upload counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadStats {
    /// Uploads handed to the copy thread.
    pub queued: u64,
    /// Uploads resolved successfully.
    pub completed: u64,
    /// Uploads resolved with an error.
    pub failed: u64,
    /// Staging bytes queued.
    pub bytes: u64,
}

struct UploadJob {
    ticket: u64,
    target: ResourceId,
    offset: u64,
    bytes: Vec<u8>,
}

enum CopyReport {
    Submitted(u64),
    Failed(u64, String),
}

struct PendingUpload {
    completer: Completer<Result<(), UploadError>>,
    submitted: bool,
    failure: Option<String>,
}

/// Streams staging data to the GPU on the copy queue without blocking the
/// render thread.
///
/// A dedicated thread records and submits one copy per upload, then signals
/// the copy fence with the upload's ticket. The render thread calls
/// [`poll_uploads`](Self::poll_uploads) once per frame to resolve finished
/// handles.
pub struct UploadManager {
    device: Arc<dyn GpuDevice>,
    diagnostics: Arc<dyn DiagnosticSink>,
    fence: FenceId,
    jobs: Option<Sender<UploadJob>>,
    reports: Receiver<CopyReport>,
    worker: Option<thread::JoinHandle<()>>,
    pending: BTreeMap<u64, PendingUpload>,
    next_ticket: u64,
    stats: UploadStats,
}

impl fmt::Debug for UploadManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadManager")
            .field("fence", &self.fence)
            .field("pending", &self.pending.len())
            .field("next_ticket", &self.next_ticket)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl UploadManager {
    /// Starts the copy thread. Uploads signal `copy_fence`.
    pub fn new(
        device: Arc<dyn GpuDevice>,
        diagnostics: Arc<dyn DiagnosticSink>,
        copy_fence: FenceId,
    ) -> Result<Self, DeviceError> {
        // Tickets continue above whatever the fence already reached.
        let next_ticket = device.fence_value(copy_fence)? + 1;
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<UploadJob>();
        let (report_tx, report_rx) = crossbeam_channel::unbounded();

        let thread_device = device.clone();
        let worker = thread::Builder::new()
            .name("lumen-upload".to_string())
            .spawn(move || run(thread_device.as_ref(), copy_fence, &job_rx, &report_tx))
            .map_err(|err| DeviceError::Backend(format!("failed to spawn copy thread: {err}")))?;
        log::debug!("UploadManager: copy thread started");

        Ok(Self {
            device,
            diagnostics,
            fence: copy_fence,
            jobs: Some(job_tx),
            reports: report_rx,
            worker: Some(worker),
            pending: BTreeMap::new(),
            next_ticket,
            stats: UploadStats::default(),
        })
    }

    /// The fence uploads signal.
    pub fn fence(&self) -> FenceId {
        self.fence
    }

    /// Queues `bytes` to be copied into `target` at `offset`. Never blocks.
    pub fn upload_resource_async(
        &mut self,
        target: ResourceId,
        offset: u64,
        bytes: impl Into<Vec<u8>>,
    ) -> UploadHandle {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        let bytes = bytes.into();
        let (completer, completion) = completion_pair();
        let handle = UploadHandle { ticket, completion };

        let Some(jobs) = &self.jobs else {
            completer.complete(Err(UploadError::Shutdown));
            return handle;
        };
        self.stats.queued += 1;
        self.stats.bytes += bytes.len() as u64;
        let job = UploadJob {
            ticket,
            target,
            offset,
            bytes,
        };
        if jobs.send(job).is_err() {
            log::error!("UploadManager: copy thread is gone, upload #{ticket} dropped");
            completer.complete(Err(UploadError::Shutdown));
            return handle;
        }
        self.pending.insert(
            ticket,
            PendingUpload {
                completer,
                submitted: false,
                failure: None,
            },
        );
        handle
    }

    /// Resolves every upload whose copy fence value has completed, and every
    /// upload whose submission failed. Returns the number resolved.
    pub fn poll_uploads(&mut self, completed_copy_fence: u64) -> usize {
        while let Ok(report) = self.reports.try_recv() {
            match report {
                CopyReport::Submitted(ticket) => {
                    if let Some(pending) = self.pending.get_mut(&ticket) {
                        pending.submitted = true;
                    }
                }
                CopyReport::Failed(ticket, reason) => {
                    if let Some(pending) = self.pending.get_mut(&ticket) {
                        pending.failure = Some(reason);
                    }
                }
            }
        }

        let ready: Vec<u64> = self
            .pending
            .iter()
            .filter(|(ticket, pending)| {
                pending.failure.is_some() || (pending.submitted && **ticket <= completed_copy_fence)
            })
            .map(|(ticket, _)| *ticket)
            .collect();

        for ticket in &ready {
            let Some(pending) = self.pending.remove(ticket) else {
                continue;
            };
            match pending.failure {
                Some(reason) => {
                    log::warn!("UploadManager: upload #{ticket} failed: {reason}");
                    self.stats.failed += 1;
                    self.diagnostics.emit(DiagnosticEvent::UploadFailed {
                        upload: *ticket,
                        reason: reason.clone(),
                    });
                    pending.completer.complete(Err(UploadError::Failed {
                        ticket: *ticket,
                        reason,
                    }));
                }
                None => {
                    self.stats.completed += 1;
                    pending.completer.complete(Ok(()));
                }
            }
        }
        ready.len()
    }

    /// Number of unresolved uploads.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// The ticket of the most recent upload, or `None` before the first.
    pub fn last_ticket(&self) -> Option<u64> {
        (self.stats.queued > 0).then(|| self.next_ticket - 1)
    }

    /// A snapshot of the counters.
    pub fn stats(&self) -> UploadStats {
        self.stats
    }

    /// Blocks until the copy fence reaches the most recent ticket, for at
    /// most `timeout`.
    pub fn wait_idle(&self, timeout: Duration) -> Result<(), SyncError> {
        let Some(last) = self.last_ticket() else {
            return Ok(());
        };
        let started = Instant::now();
        match self.device.wait_fence(self.fence, last, timeout) {
            Ok(true) => Ok(()),
            Ok(false) => Err(SyncError::FenceTimeout {
                queue: QueueKind::Copy,
                value: last,
                waited: started.elapsed(),
            }),
            Err(err) => Err(SyncError::from(err)),
        }
    }

    /// Stops the copy thread once queued uploads are submitted. Unresolved
    /// handles resolve with [`UploadError::Shutdown`] when the manager drops.
    pub fn shutdown(&mut self) {
        if self.jobs.take().is_none() {
            return;
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("UploadManager: copy thread panicked");
            }
        }
        log::debug!("UploadManager: copy thread stopped");
    }
}

impl Drop for UploadManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    device: &dyn GpuDevice,
    fence: FenceId,
    jobs: &Receiver<UploadJob>,
    reports: &Sender<CopyReport>,
) {
    while let Ok(job) = jobs.recv() {
        let report = match submit_copy(device, &job) {
            Ok(()) => CopyReport::Submitted(job.ticket),
            Err(err) => CopyReport::Failed(job.ticket, err.to_string()),
        };
        if reports.send(report).is_err() {
            break;
        }
        // Signaled even after a failure so GPU-side waits on the ticket resolve.
        if let Err(err) = device.signal(QueueKind::Copy, fence, job.ticket) {
            log::error!("UploadManager: failed to signal upload #{}: {err}", job.ticket);
        }
    }
}

fn submit_copy(device: &dyn GpuDevice, job: &UploadJob) -> Result<(), DeviceError> {
    let mut list = device.create_command_list(QueueKind::Copy, &format!("upload #{}", job.ticket))?;
    list.copy_to_resource(job.target, job.offset, &job.bytes);
    let buffer = list.finish();
    device.submit(QueueKind::Copy, &[buffer])
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::diagnostics::NullSink;
    use lumen_core::event::EventBus;
    use lumen_infra::{FenceMode, HeadlessDevice, RecordedCommand};

    fn manager(device: &HeadlessDevice, sink: Arc<dyn DiagnosticSink>) -> UploadManager {
        let fence = device.create_fence().expect("fence");
        UploadManager::new(Arc::new(device.clone()), sink, fence).expect("copy thread")
    }

    fn eventually(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..400 {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn handle_resolves_only_after_the_copy_fence() {
        let device = HeadlessDevice::with_fence_mode(FenceMode::Manual);
        let mut uploads = manager(&device, Arc::new(NullSink));
        let handle = uploads.upload_resource_async(ResourceId(7), 0, vec![1, 2, 3]);
        assert_eq!(handle.ticket(), 1);

        let fence = uploads.fence();
        assert!(eventually(|| !device.pending_signals(fence).is_empty()));
        assert_eq!(uploads.poll_uploads(0), 0);
        assert!(!handle.is_complete());

        device.complete_fence(fence, handle.ticket());
        assert_eq!(uploads.poll_uploads(handle.ticket()), 1);
        assert_eq!(handle.poll(), Some(Ok(())));
        assert_eq!(uploads.in_flight(), 0);
        assert_eq!(uploads.stats().completed, 1);
    }

    #[test]
    fn failed_submission_resolves_with_an_error() {
        let device = HeadlessDevice::new();
        device.fail_copy_submissions(true);
        let bus = Arc::new(EventBus::<DiagnosticEvent>::new());
        let sink: Arc<dyn DiagnosticSink> = bus.clone();
        let mut uploads = manager(&device, sink);

        let handle = uploads.upload_resource_async(ResourceId(7), 0, vec![0; 16]);
        assert!(eventually(|| uploads.poll_uploads(0) == 1));
        assert!(matches!(handle.wait(), Err(UploadError::Failed { ticket: 1, .. })));
        assert_eq!(bus.drain()[0].kind(), "upload_failed");
        assert_eq!(uploads.stats().failed, 1);
    }

    #[test]
    fn uploads_are_submitted_in_order() {
        let device = HeadlessDevice::new();
        let mut uploads = manager(&device, Arc::new(NullSink));
        let handles: Vec<_> = (0..3u8)
            .map(|i| uploads.upload_resource_async(ResourceId(9), u64::from(i) * 4, vec![i; 4]))
            .collect();

        uploads.wait_idle(Duration::from_secs(2)).expect("idle");
        let completed = device.fence_value(uploads.fence()).expect("fence");
        assert_eq!(uploads.poll_uploads(completed), 3);
        assert!(handles.iter().all(|h| h.poll() == Some(Ok(()))));

        let offsets: Vec<u64> = device
            .submitted_commands(QueueKind::Copy)
            .into_iter()
            .filter_map(|c| match c {
                RecordedCommand::Copy { offset, .. } => Some(offset),
                _ => None,
            })
            .collect();
        assert_eq!(offsets, vec![0, 4, 8]);
    }

    #[test]
    fn dropping_the_manager_cancels_unresolved_uploads() {
        let device = HeadlessDevice::with_fence_mode(FenceMode::Manual);
        let mut uploads = manager(&device, Arc::new(NullSink));
        let handle = uploads.upload_resource_async(ResourceId(1), 0, vec![5]);
        drop(uploads);
        assert_eq!(handle.wait(), Err(UploadError::Shutdown));
    }
}
