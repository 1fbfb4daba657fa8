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

use super::command::{HeadlessCommandList, RecordedCommand};
use ahash::AHashMap;
use lumen_core::error::DeviceError;
use lumen_core::gpu::{
    CommandBufferId, CommandList, DescriptorTableId, FenceId, GpuDevice, HeapDescriptor, HeapId,
    PlacedResourceDescriptor, QueueKind, ResourceId, ResourceLayout,
};
use lumen_core::resource::HeapClass;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// How fence signals reach their completed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceMode {
    /// A signal completes as soon as it is enqueued: the "GPU" is infinitely fast.
    Immediate,
    /// Signals stay pending until the test completes them with
    /// [`HeadlessDevice::complete_fence`] or [`HeadlessDevice::complete_all`].
    Manual,
}

/// A submitted command buffer, kept for inspection.
#[derive(Debug, Clone)]
pub struct Submission {
    /// The queue the buffer was submitted to.
    pub queue: QueueKind,
    /// The command list label.
    pub label: String,
    /// The recorded commands, in order.
    pub commands: Vec<RecordedCommand>,
}

/// Public view of a placed resource.
#[derive(Debug, Clone)]
pub struct ResourceInfo {
    /// The backing heap.
    pub heap: HeapId,
    /// Offset in the heap.
    pub offset: u64,
    /// Reserved size.
    pub size: u64,
    /// Memory layout.
    pub layout: ResourceLayout,
    /// Debug label.
    pub label: String,
}

#[derive(Debug)]
struct HeadlessHeapEntry {
    class: HeapClass,
    size: u64,
}

#[derive(Debug)]
struct HeadlessResourceEntry {
    info: ResourceInfo,
    contents: Vec<u8>,
}

#[derive(Debug)]
struct FinishedBuffer {
    queue: QueueKind,
    label: String,
    commands: Vec<RecordedCommand>,
}

#[derive(Debug, Default)]
struct FenceEntry {
    completed: u64,
    pending: Vec<u64>,
}

/// The internal, shared state of the headless device.
#[derive(Debug)]
struct HeadlessDeviceInternal {
    mode: FenceMode,
    heaps: Mutex<AHashMap<HeapId, HeadlessHeapEntry>>,
    resources: Mutex<AHashMap<ResourceId, HeadlessResourceEntry>>,
    tables: Mutex<AHashMap<DescriptorTableId, Vec<Option<ResourceId>>>>,
    finished: Mutex<AHashMap<CommandBufferId, FinishedBuffer>>,
    submissions: Mutex<Vec<Submission>>,
    queue_waits: Mutex<Vec<(QueueKind, FenceId, u64)>>,
    fences: Mutex<AHashMap<FenceId, FenceEntry>>,
    fence_signaled: Condvar,

    next_id: AtomicU64,
    heap_bytes: AtomicU64,
    heap_budget: AtomicU64,
    heaps_created: AtomicU64,
    descriptor_writes: AtomicU64,
    fail_copy_submissions: AtomicBool,
    lost: AtomicBool,
}

/// A clonable, thread-safe handle to an in-process device.
#[derive(Debug, Clone)]
pub struct HeadlessDevice {
    internal: Arc<HeadlessDeviceInternal>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl HeadlessDevice {
    /// Creates a device whose fences complete as soon as they are signaled.
    pub fn new() -> Self {
        Self::with_fence_mode(FenceMode::Immediate)
    }

    /// Creates a device with the given fence behavior.
    pub fn with_fence_mode(mode: FenceMode) -> Self {
        Self {
            internal: Arc::new(HeadlessDeviceInternal {
                mode,
                heaps: Mutex::new(AHashMap::new()),
                resources: Mutex::new(AHashMap::new()),
                tables: Mutex::new(AHashMap::new()),
                finished: Mutex::new(AHashMap::new()),
                submissions: Mutex::new(Vec::new()),
                queue_waits: Mutex::new(Vec::new()),
                fences: Mutex::new(AHashMap::new()),
                fence_signaled: Condvar::new(),
                next_id: AtomicU64::new(1),
                heap_bytes: AtomicU64::new(0),
                heap_budget: AtomicU64::new(u64::MAX),
                heaps_created: AtomicU64::new(0),
                descriptor_writes: AtomicU64::new(0),
                fail_copy_submissions: AtomicBool::new(false),
                lost: AtomicBool::new(false),
            }),
        }
    }

    fn next_id(&self) -> u64 {
        self.internal.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn check_alive(&self) -> Result<(), DeviceError> {
        if self.internal.lost.load(Ordering::Acquire) {
            Err(DeviceError::DeviceLost("headless device lost".to_string()))
        } else {
            Ok(())
        }
    }

    pub(crate) fn register_command_buffer(
        &self,
        queue: QueueKind,
        label: String,
        commands: Vec<RecordedCommand>,
    ) -> CommandBufferId {
        let id = CommandBufferId(self.next_id());
        lock(&self.internal.finished).insert(
            id,
            FinishedBuffer {
                queue,
                label,
                commands,
            },
        );
        id
    }

    // --- Test controls ---

    /// Caps the total bytes of live heaps. Heap creation beyond it fails with
    /// [`DeviceError::OutOfDeviceMemory`].
    pub fn set_heap_budget(&self, bytes: u64) {
        self.internal.heap_budget.store(bytes, Ordering::Relaxed);
    }

    /// Makes every copy-queue submission fail with a backend error.
    pub fn fail_copy_submissions(&self, fail: bool) {
        self.internal
            .fail_copy_submissions
            .store(fail, Ordering::Relaxed);
    }

    /// Simulates a device loss: every subsequent call fails and waiters wake up.
    pub fn lose_device(&self) {
        self.internal.lost.store(true, Ordering::Release);
        let _fences = lock(&self.internal.fences);
        self.internal.fence_signaled.notify_all();
        log::warn!("HeadlessDevice: device lost");
    }

    /// Completes `fence` up to `value` (manual mode).
    pub fn complete_fence(&self, fence: FenceId, value: u64) {
        let mut fences = lock(&self.internal.fences);
        let entry = fences.entry(fence).or_default();
        entry.completed = entry.completed.max(value);
        let completed = entry.completed;
        entry.pending.retain(|v| *v > completed);
        self.internal.fence_signaled.notify_all();
    }

    /// Completes every pending signal of every fence (manual mode).
    pub fn complete_all(&self) {
        let mut fences = lock(&self.internal.fences);
        for entry in fences.values_mut() {
            if let Some(max) = entry.pending.iter().copied().max() {
                entry.completed = entry.completed.max(max);
            }
            entry.pending.clear();
        }
        self.internal.fence_signaled.notify_all();
    }

    /// Signals enqueued on `fence` that have not completed yet.
    pub fn pending_signals(&self, fence: FenceId) -> Vec<u64> {
        lock(&self.internal.fences)
            .get(&fence)
            .map(|e| e.pending.clone())
            .unwrap_or_default()
    }

    // --- Inspection ---

    /// Number of heaps currently alive.
    pub fn live_heap_count(&self) -> usize {
        lock(&self.internal.heaps).len()
    }

    /// Number of live heaps of `class`.
    pub fn live_heap_count_of(&self, class: HeapClass) -> usize {
        lock(&self.internal.heaps)
            .values()
            .filter(|h| h.class == class)
            .count()
    }

    /// Number of heaps created over the device's lifetime.
    pub fn heaps_created(&self) -> u64 {
        self.internal.heaps_created.load(Ordering::Relaxed)
    }

    /// Number of placed resources currently alive.
    pub fn live_resource_count(&self) -> usize {
        lock(&self.internal.resources).len()
    }

    /// Describes a live placed resource.
    pub fn resource(&self, id: ResourceId) -> Option<ResourceInfo> {
        lock(&self.internal.resources)
            .get(&id)
            .map(|e| e.info.clone())
    }

    /// The bytes copied into a resource so far.
    pub fn resource_contents(&self, id: ResourceId) -> Option<Vec<u8>> {
        lock(&self.internal.resources)
            .get(&id)
            .map(|e| e.contents.clone())
    }

    /// The resource written at `index` of `table`.
    pub fn descriptor(&self, table: DescriptorTableId, index: u32) -> Option<ResourceId> {
        lock(&self.internal.tables)
            .get(&table)
            .and_then(|t| t.get(index as usize).copied().flatten())
    }

    /// Number of descriptors written over the device's lifetime.
    pub fn descriptor_writes(&self) -> u64 {
        self.internal.descriptor_writes.load(Ordering::Relaxed)
    }

    /// Every submission so far, in submission order.
    pub fn submissions(&self) -> Vec<Submission> {
        lock(&self.internal.submissions).clone()
    }

    /// Removes and returns every submission so far.
    pub fn take_submissions(&self) -> Vec<Submission> {
        std::mem::take(&mut *lock(&self.internal.submissions))
    }

    /// All commands submitted to `queue`, flattened in submission order.
    pub fn submitted_commands(&self, queue: QueueKind) -> Vec<RecordedCommand> {
        lock(&self.internal.submissions)
            .iter()
            .filter(|s| s.queue == queue)
            .flat_map(|s| s.commands.iter().cloned())
            .collect()
    }

    /// Cross-queue waits inserted so far.
    pub fn queue_waits(&self) -> Vec<(QueueKind, FenceId, u64)> {
        lock(&self.internal.queue_waits).clone()
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for HeadlessDevice {
    fn create_heap(&self, descriptor: &HeapDescriptor) -> Result<HeapId, DeviceError> {
        self.check_alive()?;
        let budget = self.internal.heap_budget.load(Ordering::Relaxed);
        let reserved = self.internal.heap_bytes.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |current| current.checked_add(descriptor.size).filter(|t| *t <= budget),
        );
        if reserved.is_err() {
            log::debug!(
                "HeadlessDevice: heap '{}' ({} bytes) exceeds the budget",
                descriptor.label,
                descriptor.size
            );
            return Err(DeviceError::OutOfDeviceMemory);
        }

        let id = HeapId(self.next_id());
        lock(&self.internal.heaps).insert(
            id,
            HeadlessHeapEntry {
                class: descriptor.class,
                size: descriptor.size,
            },
        );
        self.internal.heaps_created.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    fn destroy_heap(&self, id: HeapId) {
        let removed = lock(&self.internal.heaps).remove(&id);
        match removed {
            Some(entry) => {
                self.internal
                    .heap_bytes
                    .fetch_sub(entry.size, Ordering::AcqRel);
                let still_placed = lock(&self.internal.resources)
                    .values()
                    .filter(|r| r.info.heap == id)
                    .count();
                if still_placed > 0 {
                    log::warn!(
                        "HeadlessDevice: heap {id:?} destroyed with {still_placed} resources still placed"
                    );
                }
            }
            None => log::warn!("HeadlessDevice: destroy of unknown heap {id:?}"),
        }
    }

    fn create_placed_resource(
        &self,
        descriptor: &PlacedResourceDescriptor,
    ) -> Result<ResourceId, DeviceError> {
        self.check_alive()?;
        let heap_size = lock(&self.internal.heaps)
            .get(&descriptor.heap)
            .map(|h| h.size)
            .ok_or_else(|| DeviceError::InvalidHandle(format!("{:?}", descriptor.heap)))?;
        if descriptor.offset + descriptor.size > heap_size {
            return Err(DeviceError::Backend(format!(
                "resource '{}' [{}..{}) does not fit in heap of {} bytes",
                descriptor.label,
                descriptor.offset,
                descriptor.offset + descriptor.size,
                heap_size
            )));
        }

        let id = ResourceId(self.next_id());
        lock(&self.internal.resources).insert(
            id,
            HeadlessResourceEntry {
                info: ResourceInfo {
                    heap: descriptor.heap,
                    offset: descriptor.offset,
                    size: descriptor.size,
                    layout: descriptor.layout,
                    label: descriptor.label.clone(),
                },
                contents: Vec::new(),
            },
        );
        Ok(id)
    }

    fn destroy_resource(&self, id: ResourceId) {
        if lock(&self.internal.resources).remove(&id).is_none() {
            log::warn!("HeadlessDevice: destroy of unknown resource {id:?}");
        }
    }

    fn create_descriptor_table(&self, capacity: u32) -> Result<DescriptorTableId, DeviceError> {
        self.check_alive()?;
        let id = DescriptorTableId(self.next_id());
        lock(&self.internal.tables).insert(id, vec![None; capacity as usize]);
        Ok(id)
    }

    fn write_descriptors(
        &self,
        table: DescriptorTableId,
        start: u32,
        resources: &[ResourceId],
    ) -> Result<(), DeviceError> {
        self.check_alive()?;
        let mut tables = lock(&self.internal.tables);
        let slots = tables
            .get_mut(&table)
            .ok_or_else(|| DeviceError::InvalidHandle(format!("{table:?}")))?;
        let end = start as usize + resources.len();
        if end > slots.len() {
            return Err(DeviceError::Backend(format!(
                "descriptor write [{start}..{end}) exceeds table capacity {}",
                slots.len()
            )));
        }
        for (slot, resource) in slots[start as usize..end].iter_mut().zip(resources) {
            *slot = Some(*resource);
        }
        self.internal
            .descriptor_writes
            .fetch_add(resources.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn create_command_list(
        &self,
        queue: QueueKind,
        label: &str,
    ) -> Result<Box<dyn CommandList>, DeviceError> {
        self.check_alive()?;
        Ok(Box::new(HeadlessCommandList::new(self.clone(), queue, label)))
    }

    fn submit(&self, queue: QueueKind, buffers: &[CommandBufferId]) -> Result<(), DeviceError> {
        self.check_alive()?;
        if queue == QueueKind::Copy && self.internal.fail_copy_submissions.load(Ordering::Relaxed)
        {
            lock(&self.internal.finished).retain(|id, _| !buffers.contains(id));
            return Err(DeviceError::Backend("copy queue rejected submission".to_string()));
        }

        let mut finished = lock(&self.internal.finished);
        let mut batch = Vec::with_capacity(buffers.len());
        for id in buffers {
            let buffer = finished
                .remove(id)
                .ok_or_else(|| DeviceError::InvalidHandle(format!("{id:?}")))?;
            if buffer.queue != queue {
                return Err(DeviceError::Backend(format!(
                    "command buffer '{}' recorded for the {} queue submitted to the {} queue",
                    buffer.label,
                    buffer.queue.name(),
                    queue.name()
                )));
            }
            batch.push(buffer);
        }
        drop(finished);

        let mut resources = lock(&self.internal.resources);
        for buffer in &batch {
            for command in &buffer.commands {
                if let RecordedCommand::Copy {
                    target,
                    offset,
                    data,
                } = command
                {
                    if let Some(entry) = resources.get_mut(target) {
                        let end = *offset as usize + data.len();
                        if entry.contents.len() < end {
                            entry.contents.resize(end, 0);
                        }
                        entry.contents[*offset as usize..end].copy_from_slice(data);
                    }
                }
            }
        }
        drop(resources);

        lock(&self.internal.submissions).extend(batch.into_iter().map(|b| Submission {
            queue,
            label: b.label,
            commands: b.commands,
        }));
        Ok(())
    }

    fn queue_wait(&self, queue: QueueKind, fence: FenceId, value: u64) -> Result<(), DeviceError> {
        self.check_alive()?;
        lock(&self.internal.queue_waits).push((queue, fence, value));
        Ok(())
    }

    fn create_fence(&self) -> Result<FenceId, DeviceError> {
        self.check_alive()?;
        let id = FenceId(self.next_id());
        lock(&self.internal.fences).insert(id, FenceEntry::default());
        Ok(id)
    }

    fn signal(&self, _queue: QueueKind, fence: FenceId, value: u64) -> Result<(), DeviceError> {
        self.check_alive()?;
        let mut fences = lock(&self.internal.fences);
        let entry = fences
            .get_mut(&fence)
            .ok_or_else(|| DeviceError::InvalidHandle(format!("{fence:?}")))?;
        match self.internal.mode {
            FenceMode::Immediate => {
                entry.completed = entry.completed.max(value);
                self.internal.fence_signaled.notify_all();
            }
            FenceMode::Manual => entry.pending.push(value),
        }
        Ok(())
    }

    fn fence_value(&self, fence: FenceId) -> Result<u64, DeviceError> {
        self.check_alive()?;
        lock(&self.internal.fences)
            .get(&fence)
            .map(|e| e.completed)
            .ok_or_else(|| DeviceError::InvalidHandle(format!("{fence:?}")))
    }

    fn wait_fence(
        &self,
        fence: FenceId,
        value: u64,
        timeout: Duration,
    ) -> Result<bool, DeviceError> {
        let deadline = Instant::now() + timeout;
        let mut fences = lock(&self.internal.fences);
        loop {
            self.check_alive()?;
            let completed = fences
                .get(&fence)
                .map(|e| e.completed)
                .ok_or_else(|| DeviceError::InvalidHandle(format!("{fence:?}")))?;
            if completed >= value {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let (guard, _) = self
                .internal
                .fence_signaled
                .wait_timeout(fences, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            fences = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::gpu::{DrawArgs, DrawCall};
    use lumen_core::resource::BufferUsage;
    use std::thread;

    fn heap(device: &HeadlessDevice, size: u64) -> HeapId {
        device
            .create_heap(&HeapDescriptor {
                class: HeapClass::Default,
                size,
                label: "test".to_string(),
            })
            .expect("heap")
    }

    #[test]
    fn heap_budget_is_enforced() {
        let device = HeadlessDevice::new();
        device.set_heap_budget(1024);
        let first = heap(&device, 1024);
        let err = device
            .create_heap(&HeapDescriptor {
                class: HeapClass::Default,
                size: 1,
                label: "over".to_string(),
            })
            .unwrap_err();
        assert_eq!(err, DeviceError::OutOfDeviceMemory);

        device.destroy_heap(first);
        assert_eq!(device.live_heap_count(), 0);
        heap(&device, 512);
    }

    #[test]
    fn placed_resource_must_fit_the_heap() {
        let device = HeadlessDevice::new();
        let heap = heap(&device, 256);
        let layout = ResourceLayout::Buffer {
            size: 512,
            usage: BufferUsage::UNIFORM,
        };
        let result = device.create_placed_resource(&PlacedResourceDescriptor {
            heap,
            offset: 0,
            size: 512,
            layout,
            label: "big".to_string(),
        });
        assert!(matches!(result, Err(DeviceError::Backend(_))));
    }

    #[test]
    fn submit_applies_copies_and_records_commands() {
        let device = HeadlessDevice::new();
        let heap = heap(&device, 1024);
        let buffer = device
            .create_placed_resource(&PlacedResourceDescriptor {
                heap,
                offset: 0,
                size: 256,
                layout: ResourceLayout::Buffer {
                    size: 256,
                    usage: BufferUsage::COPY_DST,
                },
                label: "dst".to_string(),
            })
            .expect("resource");

        let mut list = device
            .create_command_list(QueueKind::Copy, "upload")
            .expect("list");
        list.copy_to_resource(buffer, 4, &[1, 2, 3]);
        let id = list.finish();
        device.submit(QueueKind::Copy, &[id]).expect("submit");

        assert_eq!(device.resource_contents(buffer), Some(vec![0, 0, 0, 0, 1, 2, 3]));

        let mut list = device
            .create_command_list(QueueKind::Graphics, "draws")
            .expect("list");
        list.draw(&DrawCall {
            args: DrawArgs::vertices(3),
            descriptor_offset: 0,
        });
        let id = list.finish();
        assert!(device.submit(QueueKind::Compute, &[id]).is_err());
    }

    #[test]
    fn manual_fences_block_until_completed() {
        let device = HeadlessDevice::with_fence_mode(FenceMode::Manual);
        let fence = device.create_fence().expect("fence");
        device.signal(QueueKind::Graphics, fence, 1).expect("signal");

        assert_eq!(device.fence_value(fence), Ok(0));
        assert_eq!(device.pending_signals(fence), vec![1]);
        assert_eq!(
            device.wait_fence(fence, 1, Duration::from_millis(10)),
            Ok(false)
        );

        let completer = device.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completer.complete_all();
        });
        assert_eq!(
            device.wait_fence(fence, 1, Duration::from_secs(5)),
            Ok(true)
        );
        handle.join().expect("completer panicked");
    }

    #[test]
    fn device_loss_wakes_waiters_with_an_error() {
        let device = HeadlessDevice::with_fence_mode(FenceMode::Manual);
        let fence = device.create_fence().expect("fence");
        let loser = device.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            loser.lose_device();
        });
        let result = device.wait_fence(fence, 1, Duration::from_secs(5));
        assert!(matches!(result, Err(DeviceError::DeviceLost(_))));
        handle.join().expect("thread panicked");
    }
}
