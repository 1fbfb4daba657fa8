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

use lumen_core::config::FrameConfig;
use lumen_core::diagnostics::{DiagnosticEvent, DiagnosticSink};
use lumen_core::error::{DeviceError, RenderError, SyncError};
use lumen_core::gpu::{CommandBufferId, FenceId, FenceObserver, GpuDevice, QueueKind};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// The lifecycle of a frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Never used.
    Idle,
    /// The CPU is recording the slot's frame.
    Recording,
    /// The frame's signal is queued; the GPU may still be working on it.
    Submitted,
    /// The GPU finished the frame.
    Retired,
}

#[derive(Debug)]
struct FrameSlot {
    fence_value: u64,
    generation: u64,
    state: SlotState,
    submitted: usize,
}

/// What [`FrameSynchronizer::begin_frame`] hands to the render thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameContext {
    /// The frame number, starting at 1.
    pub frame: u64,
    /// The slot the frame records into.
    pub slot: usize,
    /// The graphics fence value `end_frame` signals. Equal to `frame`.
    pub fence_value: u64,
    /// Whether `begin_frame` had to block on the slot's previous frame.
    pub waited: bool,
    /// The completed graphics fence value observed at the start of the frame.
    pub completed: u64,
}

fn queue_index(queue: QueueKind) -> usize {
    match queue {
        QueueKind::Graphics => 0,
        QueueKind::Copy => 1,
        QueueKind::Compute => 2,
    }
}

/// Coordinates the graphics, copy and compute queues across N frames in flight.
///
/// Every queue has one fence. Graphics fence values are frame numbers, so the
/// value a frame signals doubles as the tag deferred work is reclaimed by.
/// [`begin_frame`](Self::begin_frame) is the only call that blocks, and only
/// while the slot's previous frame is still on the GPU.
pub struct FrameSynchronizer {
    device: Arc<dyn GpuDevice>,
    diagnostics: Arc<dyn DiagnosticSink>,
    config: FrameConfig,
    fences: [FenceId; 3],
    completed: [AtomicU64; 3],
    slots: Vec<FrameSlot>,
    next_frame: u64,
    current: Option<FrameContext>,
    compute_value: u64,
    pending_copy_wait: Option<u64>,
}

impl fmt::Debug for FrameSynchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSynchronizer")
            .field("fences", &self.fences)
            .field("slots", &self.slots)
            .field("next_frame", &self.next_frame)
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

impl FrameSynchronizer {
    /// Creates the per-queue fences and `config.frames_in_flight` slots.
    pub fn new(
        device: Arc<dyn GpuDevice>,
        diagnostics: Arc<dyn DiagnosticSink>,
        config: &FrameConfig,
    ) -> Result<Self, DeviceError> {
        let fences = [
            device.create_fence()?,
            device.create_fence()?,
            device.create_fence()?,
        ];
        let slot_count = config.frames_in_flight.max(1) as usize;
        let slots = (0..slot_count)
            .map(|_| FrameSlot {
                fence_value: 0,
                generation: 0,
                state: SlotState::Idle,
                submitted: 0,
            })
            .collect();
        log::info!(
            "FrameSynchronizer: {slot_count} frames in flight, fence timeout {:?}",
            config.fence_timeout()
        );
        Ok(Self {
            device,
            diagnostics,
            config: config.clone(),
            fences,
            completed: Default::default(),
            slots,
            next_frame: 1,
            current: None,
            compute_value: 0,
            pending_copy_wait: None,
        })
    }

    /// The fence of `queue`.
    pub fn fence(&self, queue: QueueKind) -> FenceId {
        self.fences[queue_index(queue)]
    }

    /// Number of frame slots.
    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// The frame being recorded, if any.
    pub fn current_frame(&self) -> Option<FrameContext> {
        self.current
    }

    /// The number the next `begin_frame` will use.
    pub fn next_frame(&self) -> u64 {
        self.next_frame
    }

    /// The state of slot `index`.
    pub fn slot_state(&self, index: usize) -> Option<SlotState> {
        self.slots.get(index).map(|slot| slot.state)
    }

    /// How many times slot `index` has been recorded into.
    pub fn slot_generation(&self, index: usize) -> Option<u64> {
        self.slots.get(index).map(|slot| slot.generation)
    }

    /// Number of command buffers submitted by the slot's latest frame.
    pub fn slot_submissions(&self, index: usize) -> Option<usize> {
        self.slots.get(index).map(|slot| slot.submitted)
    }

    /// Starts the next frame.
    ///
    /// Blocks only if the slot's previous frame has not been signaled, and for
    /// at most the configured fence timeout.
    ///
    /// # Errors
    ///
    /// [`RenderError::Fatal`] on timeout or device loss,
    /// [`RenderError::InvalidFrameState`] if a frame is already open.
    pub fn begin_frame(&mut self) -> Result<FrameContext, RenderError> {
        if let Some(current) = self.current {
            return Err(RenderError::InvalidFrameState(format!(
                "frame {} is still recording",
                current.frame
            )));
        }

        let frame = self.next_frame;
        let slot_index = ((frame - 1) % self.slots.len() as u64) as usize;
        let previous = self.slots[slot_index].fence_value;

        let waited = self.wait(QueueKind::Graphics, previous)?;
        let completed = self.refresh(QueueKind::Graphics);
        self.retire_slots(completed);

        let slot = &mut self.slots[slot_index];
        slot.fence_value = frame;
        slot.generation += 1;
        slot.state = SlotState::Recording;
        slot.submitted = 0;

        let context = FrameContext {
            frame,
            slot: slot_index,
            fence_value: frame,
            waited,
            completed,
        };
        if waited {
            log::trace!("FrameSynchronizer: frame {frame} waited for fence {previous}");
        }
        self.current = Some(context);
        Ok(context)
    }

    fn open_frame(&self) -> Result<FrameContext, RenderError> {
        self.current
            .ok_or_else(|| RenderError::InvalidFrameState("no frame is recording".to_string()))
    }

    /// Submits command buffers of the current frame to `queue`.
    ///
    /// A GPU-side wait requested through [`wait_for_upload`](Self::wait_for_upload)
    /// is inserted before the next graphics submission.
    pub fn submit(&mut self, queue: QueueKind, buffers: &[CommandBufferId]) -> Result<(), RenderError> {
        let context = self.open_frame()?;
        if queue == QueueKind::Graphics {
            if let Some(value) = self.pending_copy_wait.take() {
                self.device
                    .queue_wait(QueueKind::Graphics, self.fence(QueueKind::Copy), value)
                    .map_err(|err| self.device_failure("upload wait", err))?;
            }
        }
        self.device
            .submit(queue, buffers)
            .map_err(|err| self.device_failure("submission", err))?;
        self.slots[context.slot].submitted += buffers.len();
        Ok(())
    }

    /// Submits compute work and signals the compute fence.
    ///
    /// When `after_graphics` is set, the compute queue first waits for that
    /// graphics fence value. Returns the compute fence value signaled.
    pub fn submit_compute(
        &mut self,
        buffers: &[CommandBufferId],
        after_graphics: Option<u64>,
    ) -> Result<u64, RenderError> {
        let context = self.open_frame()?;
        if let Some(value) = after_graphics {
            self.device
                .queue_wait(QueueKind::Compute, self.fence(QueueKind::Graphics), value)
                .map_err(|err| self.device_failure("compute wait", err))?;
        }
        self.device
            .submit(QueueKind::Compute, buffers)
            .map_err(|err| self.device_failure("compute submission", err))?;
        self.compute_value += 1;
        self.device
            .signal(QueueKind::Compute, self.fence(QueueKind::Compute), self.compute_value)
            .map_err(|err| self.device_failure("compute signal", err))?;
        self.slots[context.slot].submitted += buffers.len();
        Ok(self.compute_value)
    }

    /// Makes the next graphics submission wait on the GPU for the compute
    /// fence to reach `value`.
    pub fn wait_for_compute(&mut self, value: u64) -> Result<(), RenderError> {
        self.device
            .queue_wait(QueueKind::Graphics, self.fence(QueueKind::Compute), value)
            .map_err(|err| self.device_failure("compute wait", err))
    }

    /// Makes the next graphics submission wait on the GPU for upload `ticket`.
    /// Never blocks the CPU.
    pub fn wait_for_upload(&mut self, ticket: u64) {
        self.pending_copy_wait = Some(self.pending_copy_wait.map_or(ticket, |v| v.max(ticket)));
    }

    /// Signals the current frame's graphics fence value and returns it at once.
    pub fn end_frame(&mut self) -> Result<u64, RenderError> {
        let context = self.open_frame()?;
        self.device
            .signal(
                QueueKind::Graphics,
                self.fence(QueueKind::Graphics),
                context.fence_value,
            )
            .map_err(|err| self.device_failure("frame signal", err))?;
        self.slots[context.slot].state = SlotState::Submitted;
        self.current = None;
        self.next_frame += 1;
        Ok(context.fence_value)
    }

    /// Abandons the frame being recorded without signaling it. Used when a
    /// fatal error interrupts the frame.
    pub fn abort_frame(&mut self) {
        if let Some(context) = self.current.take() {
            log::warn!("FrameSynchronizer: frame {} aborted", context.frame);
            let slot = &mut self.slots[context.slot];
            slot.fence_value = 0;
            slot.state = SlotState::Idle;
        }
    }

    /// Refreshes the completed values of every queue and retires finished
    /// slots. Returns the completed graphics fence value.
    pub fn poll(&mut self) -> u64 {
        for queue in QueueKind::ALL {
            self.refresh(queue);
        }
        let completed = self.completed_of(QueueKind::Graphics);
        self.retire_slots(completed);
        completed
    }

    /// The last observed completed value of `queue`'s fence.
    pub fn completed_of(&self, queue: QueueKind) -> u64 {
        self.completed[queue_index(queue)].load(Ordering::Acquire)
    }

    /// Returns `true` once the frame that signaled `fence_value` has finished.
    pub fn is_frame_complete(&self, fence_value: u64) -> bool {
        self.completed_of(QueueKind::Graphics) >= fence_value
            || self.refresh(QueueKind::Graphics) >= fence_value
    }

    /// Blocks until every signaled graphics and compute value has completed.
    pub fn wait_idle(&mut self) -> Result<(), RenderError> {
        self.wait(QueueKind::Graphics, self.next_frame - 1)?;
        self.wait(QueueKind::Compute, self.compute_value)?;
        self.poll();
        log::debug!("FrameSynchronizer: idle at frame {}", self.next_frame - 1);
        Ok(())
    }

    fn retire_slots(&mut self, completed: u64) {
        for slot in &mut self.slots {
            if slot.state == SlotState::Submitted && slot.fence_value <= completed {
                slot.state = SlotState::Retired;
            }
        }
    }

    fn refresh(&self, queue: QueueKind) -> u64 {
        let index = queue_index(queue);
        match self.device.fence_value(self.fences[index]) {
            Ok(value) => self.completed[index].fetch_max(value, Ordering::AcqRel).max(value),
            Err(err) => {
                log::warn!("FrameSynchronizer: {} fence query failed: {err}", queue.name());
                self.completed[index].load(Ordering::Acquire)
            }
        }
    }

    /// Waits until `queue`'s fence reaches `value`. Returns whether it blocked.
    fn wait(&self, queue: QueueKind, value: u64) -> Result<bool, SyncError> {
        if value == 0 || self.completed_of(queue) >= value || self.refresh(queue) >= value {
            return Ok(false);
        }
        let timeout = self.config.fence_timeout();
        let started = Instant::now();
        match self.device.wait_fence(self.fence(queue), value, timeout) {
            Ok(true) => {
                self.refresh(queue);
                Ok(true)
            }
            Ok(false) => {
                let waited = started.elapsed();
                log::error!(
                    "FrameSynchronizer: {} fence value {value} not reached after {waited:?}",
                    queue.name()
                );
                self.diagnostics.emit(DiagnosticEvent::FenceTimeout {
                    queue,
                    value,
                    waited,
                });
                Err(SyncError::FenceTimeout {
                    queue,
                    value,
                    waited,
                })
            }
            Err(err) => {
                let context = format!("{} fence wait", queue.name());
                log::error!("FrameSynchronizer: {context} failed: {err}");
                self.diagnostics
                    .emit(DiagnosticEvent::DeviceLost { context });
                Err(SyncError::from(err))
            }
        }
    }

    fn device_failure(&self, context: &str, err: DeviceError) -> RenderError {
        if let DeviceError::DeviceLost(_) = err {
            log::error!("FrameSynchronizer: device lost during {context}");
            self.diagnostics.emit(DiagnosticEvent::DeviceLost {
                context: context.to_string(),
            });
        } else {
            log::warn!("FrameSynchronizer: {context} failed: {err}");
        }
        RenderError::from(err)
    }
}

impl FenceObserver for FrameSynchronizer {
    fn completed_value(&self) -> u64 {
        self.refresh(QueueKind::Graphics)
    }

    fn wait_for(&self, value: u64) -> Result<(), SyncError> {
        self.wait(QueueKind::Graphics, value).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::diagnostics::NullSink;
    use lumen_core::event::EventBus;
    use lumen_infra::{FenceMode, HeadlessDevice};
    use std::thread;
    use std::time::Duration;

    fn manual(timeout_ms: u64) -> (HeadlessDevice, FrameSynchronizer) {
        let device = HeadlessDevice::with_fence_mode(FenceMode::Manual);
        let config = FrameConfig {
            frames_in_flight: 2,
            fence_timeout_ms: timeout_ms,
        };
        let sync = FrameSynchronizer::new(Arc::new(device.clone()), Arc::new(NullSink), &config)
            .expect("fences");
        (device, sync)
    }

    #[test]
    fn slots_rotate_without_blocking_while_the_gpu_keeps_up() {
        let device = HeadlessDevice::new();
        let mut sync = FrameSynchronizer::new(
            Arc::new(device),
            Arc::new(NullSink),
            &FrameConfig::default(),
        )
        .expect("fences");

        for frame in 1..=6 {
            let ctx = sync.begin_frame().expect("begins");
            assert_eq!(ctx.frame, frame);
            assert_eq!(ctx.fence_value, frame);
            assert_eq!(ctx.slot, ((frame - 1) % 2) as usize);
            assert!(!ctx.waited);
            assert_eq!(sync.end_frame().expect("ends"), frame);
        }
        assert_eq!(sync.poll(), 6);
        assert_eq!(sync.slot_state(0), Some(SlotState::Retired));
        assert_eq!(sync.slot_generation(1), Some(3));
    }

    #[test]
    fn begin_frame_blocks_until_the_slot_fence_signals() {
        let (device, mut sync) = manual(5_000);
        let graphics = sync.fence(QueueKind::Graphics);
        for _ in 0..2 {
            sync.begin_frame().expect("begins");
            sync.end_frame().expect("ends");
        }

        let gpu = device.clone();
        let completer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            gpu.complete_fence(graphics, 1);
        });
        let ctx = sync.begin_frame().expect("frame 3 begins once frame 1 is done");
        completer.join().expect("completer panicked");
        assert!(ctx.waited);
        assert_eq!(ctx.slot, 0);
        assert!(ctx.completed >= 1);
        sync.end_frame().expect("ends");

        device.complete_fence(graphics, 2);
        let ctx = sync.begin_frame().expect("frame 4 begins");
        assert!(!ctx.waited, "frame 2 was already signaled");
    }

    #[test]
    fn unsignaled_fence_times_out_fatally() {
        let device = HeadlessDevice::with_fence_mode(FenceMode::Manual);
        let bus = Arc::new(EventBus::<DiagnosticEvent>::new());
        let sink: Arc<dyn DiagnosticSink> = bus.clone();
        let config = FrameConfig {
            frames_in_flight: 2,
            fence_timeout_ms: 20,
        };
        let mut sync =
            FrameSynchronizer::new(Arc::new(device.clone()), sink, &config).expect("fences");
        for _ in 0..2 {
            sync.begin_frame().expect("begins");
            sync.end_frame().expect("ends");
        }

        let err = sync.begin_frame().unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(
            err,
            RenderError::Fatal(SyncError::FenceTimeout { value: 1, .. })
        ));
        assert_eq!(bus.drain()[0].kind(), "fence_timeout");
        assert_eq!(sync.current_frame(), None);
        assert_eq!(sync.next_frame(), 3);
    }

    #[test]
    fn upload_wait_precedes_the_next_graphics_submission() {
        let (device, mut sync) = manual(100);
        sync.begin_frame().expect("begins");
        sync.wait_for_upload(4);
        sync.wait_for_upload(2);

        let list = device
            .create_command_list(QueueKind::Graphics, "frame")
            .expect("list");
        sync.submit(QueueKind::Graphics, &[list.finish()])
            .expect("submits");
        assert_eq!(
            device.queue_waits(),
            vec![(QueueKind::Graphics, sync.fence(QueueKind::Copy), 4)]
        );
        assert_eq!(sync.slot_submissions(0), Some(1));
    }

    #[test]
    fn compute_submission_waits_on_graphics_and_signals() {
        let (device, mut sync) = manual(100);
        let ctx = sync.begin_frame().expect("begins");
        let list = device
            .create_command_list(QueueKind::Compute, "cull")
            .expect("list");
        let value = sync
            .submit_compute(&[list.finish()], Some(ctx.fence_value - 1))
            .expect("submits");
        assert_eq!(value, 1);
        assert_eq!(device.pending_signals(sync.fence(QueueKind::Compute)), vec![1]);
    }

    #[test]
    fn frame_calls_out_of_order_are_rejected() {
        let (_device, mut sync) = manual(100);
        assert!(matches!(
            sync.end_frame(),
            Err(RenderError::InvalidFrameState(_))
        ));
        sync.begin_frame().expect("begins");
        assert!(matches!(
            sync.begin_frame(),
            Err(RenderError::InvalidFrameState(_))
        ));
        sync.abort_frame();
        assert!(sync.begin_frame().is_ok());
    }

    #[test]
    fn fence_observer_reports_completion() {
        let (device, mut sync) = manual(50);
        sync.begin_frame().expect("begins");
        let value = sync.end_frame().expect("ends");
        assert!(!sync.is_frame_complete(value));
        assert!(sync.wait_for(value).is_err());

        device.complete_all();
        assert!(sync.is_frame_complete(value));
        assert_eq!(sync.completed_value(), value);
        assert!(sync.wait_for(value).is_ok());
        assert!(sync.wait_idle().is_ok());
    }
}
