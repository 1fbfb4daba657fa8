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

//! Defines the RenderOrchestrator, which drives every manager through the
//! per-frame control flow.

use super::frame::{FrameDescription, FrameReport};
use super::resolver::FrameResolver;
use ahash::AHashSet;
use anyhow::Context;
use lumen_core::config::LumenConfig;
use lumen_core::diagnostics::{DiagnosticEvent, DiagnosticSink, LogSink};
use lumen_core::error::{RenderError, SyncError};
use lumen_core::event::EventBus;
use lumen_core::frame::Renderable;
use lumen_core::gpu::{GpuDevice, PipelineCompiler, QueueKind, ResourceId};
use lumen_core::pipeline::PipelineKey;
use lumen_core::resource::{
    BufferDescription, PoolHandle, RenderTargetDescription, ResidencyPolicy, ResourceKind,
    TextureDescription,
};
use lumen_core::telemetry::{FrameMetrics, MetricId};
use lumen_core::utils::timer::Stopwatch;
use lumen_data::{
    Buffer, DescriptorAllocator, DescriptorError, HeapPool, HeapPoolStats, MemoryError,
    PoolContext, PoolStats, PooledResource, RenderTarget, ResidencyInfo, ResidencyReport,
    ResourceError, ResourcePool, Texture,
};
use lumen_lanes::{
    BatchError, CommandBatcher, FrameSynchronizer, PipelineCacheStats, PipelineStateCache,
    PipelineTask, RecordContext, UploadHandle, UploadManager, UploadStats,
};
use lumen_telemetry::{
    DiagnosticsService, FrameMetricsPublisher, FrameTimeTracker, HistogramHandle,
    MetricsRegistry, ScopedMetricTimer,
};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Number of diagnostic events kept for inspection.
const DIAGNOSTIC_HISTORY: usize = 256;

/// Bucket bounds of the recording-time histogram, in milliseconds.
const RECORD_TIME_BUCKETS_MS: [f64; 7] = [0.25, 0.5, 1.0, 2.0, 4.0, 8.0, 16.0];

/// Borrows the pool-related managers of the orchestrator field by field, so
/// a pool can be mutated alongside the context.
macro_rules! pool_context {
    ($self:ident, $frame:expr) => {
        PoolContext {
            device: $self.device.as_ref(),
            heaps: &mut $self.heaps,
            descriptors: &mut $self.descriptors,
            fences: &$self.frames,
            diagnostics: $self.sink.as_ref(),
            frame: $frame,
        }
    };
}

/// Lifetime counters of an orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestratorStats {
    /// Frames submitted successfully.
    pub frames_rendered: u64,
    /// Frames that ended in an error.
    pub frames_failed: u64,
    /// Successful recoveries after a fatal error.
    pub recoveries: u64,
}

/// Owns every manager and runs the frame loop.
///
/// Each [`render_frame`](Self::render_frame) call:
///
/// 1. waits for the frame slot (the only blocking point) and reclaims memory,
///    descriptors and pipelines of retired frames,
/// 2. acquires the frame's transient render targets,
/// 3. requests the pipelines of every material used, optionally waiting a
///    bounded time for compilations,
/// 4. makes bound resources resident and pins them for the frame,
/// 5. sorts and records draws, with barriers and clears,
/// 6. submits, signals the frame fence and releases transient targets,
/// 7. enforces the residency budget and publishes metrics.
///
/// A fatal error (fence timeout, device loss) halts the orchestrator: every
/// later frame fails with [`RenderError::Halted`] until [`recover`](Self::recover)
/// rebuilds the device-dependent state.
pub struct RenderOrchestrator {
    config: LumenConfig,
    device: Arc<dyn GpuDevice>,
    bus: Arc<EventBus<DiagnosticEvent>>,
    sink: Arc<dyn DiagnosticSink>,

    heaps: HeapPool,
    descriptors: DescriptorAllocator,
    textures: ResourcePool<Texture>,
    buffers: ResourcePool<Buffer>,
    render_targets: ResourcePool<RenderTarget>,
    pipelines: PipelineStateCache,
    batcher: CommandBatcher,
    frames: FrameSynchronizer,
    uploads: UploadManager,

    registry: MetricsRegistry,
    frame_times: FrameTimeTracker,
    publisher: FrameMetricsPublisher,
    diagnostics: DiagnosticsService,
    record_time: HistogramHandle,

    transient: Vec<PoolHandle>,
    upload_wait: Option<u64>,
    compile_wait: Duration,
    halted: Option<String>,
    stats: OrchestratorStats,
    shut_down: bool,
}

impl fmt::Debug for RenderOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderOrchestrator")
            .field("frames", &self.frames)
            .field("pipelines", &self.pipelines)
            .field("halted", &self.halted)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl RenderOrchestrator {
    /// Validates `config` and builds every manager on `device`.
    ///
    /// When the configuration names a pipeline blob, the cache is warmed from
    /// it. A missing or unreadable blob only means a cold start.
    pub fn new(
        device: Arc<dyn GpuDevice>,
        compiler: Arc<dyn PipelineCompiler>,
        config: LumenConfig,
    ) -> anyhow::Result<Self> {
        config.validate().context("invalid renderer configuration")?;

        let bus = Arc::new(EventBus::new());
        let sink: Arc<dyn DiagnosticSink> = if config.telemetry.log_diagnostics {
            Arc::new(LogSink::forwarding(bus.clone()))
        } else {
            bus.clone()
        };

        let descriptors = DescriptorAllocator::new(device.as_ref(), &config.descriptors)
            .context("creating the descriptor table")?;
        let frames = FrameSynchronizer::new(device.clone(), sink.clone(), &config.frames)
            .context("creating the frame fences")?;
        let uploads = UploadManager::new(device.clone(), sink.clone(), frames.fence(QueueKind::Copy))
            .context("starting the upload thread")?;

        let pipelines = PipelineStateCache::new(compiler, sink.clone(), &config.pipelines);
        if let Some(path) = &config.pipelines.blob_path {
            if let Err(err) = pipelines.load_blob(path) {
                log::debug!("RenderOrchestrator: cold pipeline cache ({err})");
            }
        }

        let registry = MetricsRegistry::new();
        let publisher =
            FrameMetricsPublisher::new(&registry).context("registering frame metrics")?;
        let record_time = registry
            .register_histogram(
                MetricId::lumen("record_ms"),
                "CPU time spent recording a frame",
                "ms",
                RECORD_TIME_BUCKETS_MS.to_vec(),
            )
            .context("registering the recording histogram")?;
        let diagnostics = DiagnosticsService::new(bus.clone(), registry.clone(), DIAGNOSTIC_HISTORY);

        log::info!(
            "RenderOrchestrator: ready with {} frames in flight",
            config.frames.frames_in_flight
        );
        Ok(Self {
            heaps: HeapPool::new(config.memory.clone()),
            descriptors,
            textures: ResourcePool::new(config.pools.max_free_per_key),
            buffers: ResourcePool::new(config.pools.max_free_per_key),
            render_targets: ResourcePool::new(config.pools.max_free_per_key),
            pipelines,
            batcher: CommandBatcher::new(),
            frames,
            uploads,
            frame_times: FrameTimeTracker::new(config.telemetry.frame_time_window),
            publisher,
            diagnostics,
            record_time,
            registry,
            config,
            device,
            bus,
            sink,
            transient: Vec::new(),
            upload_wait: None,
            compile_wait: Duration::ZERO,
            halted: None,
            stats: OrchestratorStats::default(),
            shut_down: false,
        })
    }

    /// How long a frame may wait for pipelines it requested to finish
    /// compiling. Zero, the default, never waits: draws whose pipeline is
    /// still compiling are skipped.
    pub fn with_compile_wait(mut self, wait: Duration) -> Self {
        self.compile_wait = wait;
        self
    }

    /// Changes the compile wait. See [`with_compile_wait`](Self::with_compile_wait).
    pub fn set_compile_wait(&mut self, wait: Duration) {
        self.compile_wait = wait;
    }

    /// Renders one frame.
    ///
    /// # Errors
    ///
    /// - [`RenderError::Halted`] while halted after a fatal error.
    /// - [`RenderError::Fatal`] when this frame hit a fence timeout or a
    ///   device loss. The orchestrator is halted afterwards.
    /// - [`RenderError::Device`] / [`RenderError::InvalidFrameState`] for
    ///   non-fatal failures. The frame is abandoned; the next one may proceed.
    pub fn render_frame(&mut self, description: &FrameDescription) -> Result<FrameReport, RenderError> {
        if self.shut_down {
            return Err(RenderError::InvalidFrameState(
                "the orchestrator is shut down".to_string(),
            ));
        }
        if self.halted.is_some() {
            return Err(RenderError::Halted);
        }

        let stopwatch = Stopwatch::new();
        match self.run_frame(description, &stopwatch) {
            Ok(report) => {
                self.stats.frames_rendered += 1;
                Ok(report)
            }
            Err(err) => {
                self.stats.frames_failed += 1;
                self.abandon_frame();
                if err.is_fatal() {
                    log::error!("RenderOrchestrator: halted after fatal error: {err}");
                    self.halted = Some(err.to_string());
                } else {
                    log::warn!("RenderOrchestrator: frame abandoned: {err}");
                }
                self.pump_diagnostics();
                Err(err)
            }
        }
    }

    fn run_frame(
        &mut self,
        description: &FrameDescription,
        stopwatch: &Stopwatch,
    ) -> Result<FrameReport, RenderError> {
        let context = self.frames.begin_frame()?;
        let frame = context.fence_value;
        self.reclaim(frame);
        self.descriptors.begin_frame(frame);

        self.acquire_transient_targets(&description.render_targets, frame)?;
        let (requested, pending_pipelines) = self.request_pipelines(description);
        self.prepare_bindings(&description.renderables, frame)?;

        self.batcher.reset();
        self.batcher
            .collect(description.renderables.iter().cloned())
            .map_err(batch_failure)?;
        self.batcher.sort().map_err(batch_failure)?;

        let mut list = self
            .device
            .create_command_list(QueueKind::Graphics, &format!("frame-{frame}"))?;

        // Attachments and pending clears come before any draw.
        let attachments: Vec<(ResourceId, _)> = self
            .transient
            .iter()
            .filter_map(|&handle| self.render_targets.get(handle))
            .map(|target| (target.resource(), target.describe().attachment_state()))
            .collect();
        for (resource, state) in attachments {
            self.batcher.barriers_mut().request(resource, state);
        }
        let prelude = self.batcher.barriers_mut().flush();
        if !prelude.is_empty() {
            list.resource_barriers(&prelude);
        }
        let mut clears = self.textures.drain_clears();
        clears.extend(self.buffers.drain_clears());
        clears.extend(self.render_targets.drain_clears());
        for &resource in &clears {
            list.clear_resource(resource);
        }

        let batch = {
            let _timer = ScopedMetricTimer::new(&self.record_time);
            let mut ctx = RecordContext {
                device: self.device.as_ref(),
                descriptors: &mut self.descriptors,
                fences: &self.frames,
                diagnostics: self.sink.as_ref(),
            };
            let mut resolver = FrameResolver {
                pipelines: &self.pipelines,
                requested: &requested,
                textures: &self.textures,
                buffers: &self.buffers,
                render_targets: &self.render_targets,
                fence_value: frame,
            };
            self.batcher.record(&mut ctx, &mut resolver, list.as_mut())
        }
        .map_err(batch_failure)?;

        let buffer = list.finish();
        if let Some(ticket) = self.upload_wait.take() {
            self.frames.wait_for_upload(ticket);
        }
        self.frames.submit(QueueKind::Graphics, &[buffer])?;
        self.batcher.mark_submitted().map_err(batch_failure)?;
        self.descriptors.end_frame();
        let fence_value = self.frames.end_frame()?;

        let render_targets = std::mem::take(&mut self.transient);
        {
            let mut ctx = pool_context!(self, frame);
            for &handle in &render_targets {
                if let Err(err) = self.render_targets.release(handle, &mut ctx) {
                    log::warn!("RenderOrchestrator: releasing transient {handle} failed: {err}");
                }
            }
        }

        let residency = match self.config.pools.residency_budget_bytes {
            Some(budget) => self.enforce_budget(budget, frame),
            None => ResidencyReport::default(),
        };

        self.frame_times.record(stopwatch.elapsed());
        let heap_stats = self.heaps.stats();
        let metrics = FrameMetrics {
            frame: fence_value,
            frame_time_avg_ms: self.frame_times.mean(),
            frame_time_variance_ms2: self.frame_times.variance(),
            pso_hit_rate: self.pipelines.stats().hit_rate(),
            descriptor_bindings: self.descriptors.frame_stats().total_binds(),
            barriers: batch.barriers + prelude.len() as u64,
            draws_recorded: batch.draws_recorded,
            draws_skipped: batch.draws_skipped,
            fragmentation_percent: heap_stats.fragmentation_percent(),
            heap_count: heap_stats.heaps,
            waited_on_gpu: context.waited,
        };
        if self.config.telemetry.publish_metrics {
            if let Err(err) = self.publisher.publish(&metrics) {
                log::warn!("RenderOrchestrator: publishing metrics failed: {err}");
            }
        }
        self.pump_diagnostics();

        Ok(FrameReport {
            frame: fence_value,
            batch,
            metrics,
            render_targets,
            clears: clears.len(),
            residency,
            pending_pipelines,
        })
    }

    /// Frees everything whose last frame has retired.
    fn reclaim(&mut self, frame: u64) {
        let completed = self.frames.poll();
        self.descriptors.retire(completed);
        self.pipelines.retire(completed);
        self.uploads
            .poll_uploads(self.frames.completed_of(QueueKind::Copy));

        let mut destroyed = Vec::new();
        {
            let mut ctx = pool_context!(self, frame);
            destroyed.extend(self.textures.collect(completed, &mut ctx));
            destroyed.extend(self.buffers.collect(completed, &mut ctx));
            destroyed.extend(self.render_targets.collect(completed, &mut ctx));
        }
        if !destroyed.is_empty() {
            for resource in &destroyed {
                self.batcher.barriers_mut().forget(*resource);
            }
            self.heaps.trim(self.device.as_ref());
            log::trace!(
                "RenderOrchestrator: reclaimed {} resources up to fence {completed}",
                destroyed.len()
            );
        }

        self.textures.reset_evictable();
        self.buffers.reset_evictable();
        self.render_targets.reset_evictable();
    }

    fn acquire_transient_targets(
        &mut self,
        descriptions: &[RenderTargetDescription],
        frame: u64,
    ) -> Result<(), RenderError> {
        for description in descriptions {
            let acquired = {
                let mut ctx = pool_context!(self, frame);
                self.render_targets.acquire(*description, &mut ctx)
            };
            match acquired {
                Ok(handle) => {
                    self.render_targets.set_evictable(handle, false);
                    self.transient.push(handle);
                }
                Err(err) if err.is_fatal() => return Err(resource_failure(err)),
                Err(err) => log::warn!(
                    "RenderOrchestrator: no {}x{} render target this frame: {err}",
                    description.width,
                    description.height
                ),
            }
        }
        Ok(())
    }

    /// Requests the pipeline of every key used this frame. Returns the
    /// requested keys and how many were still compiling once the compile
    /// wait ran out.
    fn request_pipelines(&self, description: &FrameDescription) -> (AHashSet<PipelineKey>, usize) {
        let mut requested = AHashSet::new();
        let mut waiting: Vec<PipelineTask> = Vec::new();
        for renderable in &description.renderables {
            if requested.contains(&renderable.key) {
                continue;
            }
            let Some(material) = description.materials.get(&renderable.material) else {
                log::warn!(
                    "RenderOrchestrator: {} uses material {} missing from the frame",
                    renderable.id,
                    renderable.material.0
                );
                continue;
            };
            requested.insert(renderable.key);
            let task = self.pipelines.get_or_create_with_key(renderable.key, material);
            if !task.is_ready() {
                waiting.push(task);
            }
        }

        if !self.compile_wait.is_zero() && !waiting.is_empty() {
            let deadline = Instant::now() + self.compile_wait;
            for task in &waiting {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if task.wait_timeout(remaining).is_none() {
                    break;
                }
            }
        }
        let pending = waiting.iter().filter(|task| !task.is_ready()).count();
        if pending > 0 {
            log::debug!("RenderOrchestrator: {pending} pipelines still compiling");
        }
        (requested, pending)
    }

    /// Makes every bound resource resident and keeps it from being evicted
    /// while the frame is in flight.
    fn prepare_bindings(&mut self, renderables: &[Renderable], frame: u64) -> Result<(), RenderError> {
        let mut seen = AHashSet::new();
        for binding in renderables.iter().flat_map(|r| &r.bindings) {
            let handle = binding.handle;
            if !seen.insert(handle) {
                continue;
            }
            let mut ctx = pool_context!(self, frame);
            let prepared = match handle.kind {
                ResourceKind::Texture => prepare_binding(&mut self.textures, handle, &mut ctx),
                ResourceKind::Buffer => prepare_binding(&mut self.buffers, handle, &mut ctx),
                ResourceKind::RenderTarget => {
                    prepare_binding(&mut self.render_targets, handle, &mut ctx)
                }
            };
            match prepared {
                Ok(()) => {}
                Err(err) if err.is_fatal() => return Err(resource_failure(err)),
                Err(err) => log::warn!("RenderOrchestrator: {handle} is not resident: {err}"),
            }
        }
        Ok(())
    }

    fn enforce_budget(&mut self, budget: u64, frame: u64) -> ResidencyReport {
        let mut report = ResidencyReport::default();
        let mut ctx = pool_context!(self, frame);

        let others = self.buffers.stats().memory_bytes + self.render_targets.stats().memory_bytes;
        merge(
            &mut report,
            self.textures
                .optimize_residency(budget.saturating_sub(others), &mut ctx),
        );
        let others = self.textures.stats().memory_bytes + self.render_targets.stats().memory_bytes;
        merge(
            &mut report,
            self.buffers
                .optimize_residency(budget.saturating_sub(others), &mut ctx),
        );
        let others = self.textures.stats().memory_bytes + self.buffers.stats().memory_bytes;
        merge(
            &mut report,
            self.render_targets
                .optimize_residency(budget.saturating_sub(others), &mut ctx),
        );
        report
    }

    fn abandon_frame(&mut self) {
        if let Some(context) = self.frames.current_frame() {
            self.descriptors.end_frame();
            self.frames.abort_frame();
            let transient = std::mem::take(&mut self.transient);
            let mut ctx = pool_context!(self, context.frame);
            for handle in transient {
                if let Err(err) = self.render_targets.release(handle, &mut ctx) {
                    log::debug!("RenderOrchestrator: dropping transient {handle}: {err}");
                }
            }
        }
        self.transient.clear();
        self.batcher.reset();
    }

    fn pump_diagnostics(&mut self) {
        if let Err(err) = self.diagnostics.pump() {
            log::warn!("RenderOrchestrator: counting diagnostics failed: {err}");
        }
    }

    /// Acquires a texture. New textures are zero-initialized by the next frame.
    pub fn acquire_texture(
        &mut self,
        description: TextureDescription,
        policy: ResidencyPolicy,
    ) -> Result<PoolHandle, ResourceError> {
        let frame = self.frames.next_frame();
        let mut ctx = pool_context!(self, frame);
        self.textures.acquire_with_policy(description, policy, &mut ctx)
    }

    /// Acquires a buffer.
    pub fn acquire_buffer(
        &mut self,
        description: BufferDescription,
        policy: ResidencyPolicy,
    ) -> Result<PoolHandle, ResourceError> {
        let frame = self.frames.next_frame();
        let mut ctx = pool_context!(self, frame);
        self.buffers.acquire_with_policy(description, policy, &mut ctx)
    }

    /// Acquires a render target that lives across frames.
    pub fn acquire_render_target(
        &mut self,
        description: RenderTargetDescription,
    ) -> Result<PoolHandle, ResourceError> {
        let frame = self.frames.next_frame();
        let mut ctx = pool_context!(self, frame);
        self.render_targets.acquire(description, &mut ctx)
    }

    /// Returns a resource to its pool. Its memory stays valid until the frames
    /// that may still use it have retired.
    pub fn release(&mut self, handle: PoolHandle) -> Result<(), ResourceError> {
        let frame = self.frames.next_frame();
        let mut ctx = pool_context!(self, frame);
        match handle.kind {
            ResourceKind::Texture => self.textures.release(handle, &mut ctx),
            ResourceKind::Buffer => self.buffers.release(handle, &mut ctx),
            ResourceKind::RenderTarget => self.render_targets.release(handle, &mut ctx),
        }
    }

    /// The device resource behind `handle`, if acquired and resident.
    pub fn resource_id(&self, handle: PoolHandle) -> Option<ResourceId> {
        match handle.kind {
            ResourceKind::Texture => self.textures.get(handle).map(Texture::resource),
            ResourceKind::Buffer => self.buffers.get(handle).map(Buffer::resource),
            ResourceKind::RenderTarget => self.render_targets.get(handle).map(RenderTarget::resource),
        }
    }

    /// Residency state of an acquired resource.
    pub fn residency(&self, handle: PoolHandle) -> Option<ResidencyInfo> {
        match handle.kind {
            ResourceKind::Texture => self.textures.residency(handle),
            ResourceKind::Buffer => self.buffers.residency(handle),
            ResourceKind::RenderTarget => self.render_targets.residency(handle),
        }
    }

    /// Queues `bytes` for upload into `handle` at `offset`.
    ///
    /// Never blocks. The next frame's graphics work waits on the GPU for the
    /// copy, so draws of that frame see the data.
    pub fn upload(
        &mut self,
        handle: PoolHandle,
        offset: u64,
        bytes: impl Into<Vec<u8>>,
    ) -> Result<UploadHandle, ResourceError> {
        let resource = self
            .resource_id(handle)
            .ok_or(ResourceError::StaleHandle(handle))?;
        let upload = self.uploads.upload_resource_async(resource, offset, bytes);
        self.upload_wait = Some(self.upload_wait.map_or(upload.ticket(), |t| t.max(upload.ticket())));
        Ok(upload)
    }

    /// Waits for the GPU, then compacts idle pooled objects. Returns how many
    /// objects moved.
    pub fn defragment(&mut self) -> Result<usize, RenderError> {
        self.wait_idle()?;
        let frame = self.frames.next_frame();
        let moved = {
            let mut ctx = pool_context!(self, frame);
            let textures = self.textures.defragment(&mut ctx);
            let buffers = self.buffers.defragment(&mut ctx);
            let render_targets = self.render_targets.defragment(&mut ctx);
            [textures, buffers, render_targets]
                .into_iter()
                .try_fold(0, |moved, result| result.map(|count| moved + count))
        };
        let moved = moved.map_err(|err| {
            if err.is_fatal() {
                resource_failure(err)
            } else {
                RenderError::InvalidFrameState(format!("defragmentation failed: {err}"))
            }
        })?;
        self.heaps.trim(self.device.as_ref());
        Ok(moved)
    }

    /// Blocks until every submitted frame and upload has completed.
    pub fn wait_idle(&mut self) -> Result<(), RenderError> {
        self.frames.wait_idle()?;
        self.uploads.wait_idle(self.config.frames.fence_timeout())?;
        self.poll_uploads();
        Ok(())
    }

    /// Resolves the upload handles whose copies have completed. Frames do this
    /// on their own; callers only need it between frames. Returns the number
    /// resolved.
    pub fn poll_uploads(&mut self) -> usize {
        self.frames.poll();
        self.uploads
            .poll_uploads(self.frames.completed_of(QueueKind::Copy))
    }

    /// Rebuilds every device-dependent manager on the same device and clears
    /// the halt.
    ///
    /// Pooled resources are destroyed, so handles acquired before the
    /// recovery become stale. Frame numbering starts over on new fences.
    pub fn recover(&mut self) -> anyhow::Result<()> {
        let device = self.device.clone();
        self.rebuild(device)?;
        self.pipelines.clear();
        self.pipelines.restart_timeline();
        self.finish_recovery();
        Ok(())
    }

    /// Like [`recover`](Self::recover), for a replacement device and its compiler.
    pub fn recover_with(
        &mut self,
        device: Arc<dyn GpuDevice>,
        compiler: Arc<dyn PipelineCompiler>,
    ) -> anyhow::Result<()> {
        self.pipelines.clear();
        self.pipelines.shutdown();
        self.rebuild(device)?;
        self.pipelines = PipelineStateCache::new(compiler, self.sink.clone(), &self.config.pipelines);
        if let Some(path) = &self.config.pipelines.blob_path {
            if let Err(err) = self.pipelines.load_blob(path) {
                log::debug!("RenderOrchestrator: cold pipeline cache after recovery ({err})");
            }
        }
        self.finish_recovery();
        Ok(())
    }

    fn rebuild(&mut self, device: Arc<dyn GpuDevice>) -> anyhow::Result<()> {
        log::warn!(
            "RenderOrchestrator: rebuilding device state (halted: {})",
            self.halted.as_deref().unwrap_or("no")
        );
        self.abandon_frame();
        self.uploads.shutdown();

        let frame = self.frames.next_frame();
        {
            let mut ctx = pool_context!(self, frame);
            self.textures.destroy_all(&mut ctx);
            self.buffers.destroy_all(&mut ctx);
            self.render_targets.destroy_all(&mut ctx);
        }
        self.heaps.destroy_all(self.device.as_ref());
        self.batcher.barriers_mut().clear();
        self.upload_wait = None;

        self.device = device;
        self.descriptors = DescriptorAllocator::new(self.device.as_ref(), &self.config.descriptors)
            .context("re-creating the descriptor table")?;
        self.frames = FrameSynchronizer::new(self.device.clone(), self.sink.clone(), &self.config.frames)
            .context("re-creating the frame fences")?;
        self.uploads = UploadManager::new(
            self.device.clone(),
            self.sink.clone(),
            self.frames.fence(QueueKind::Copy),
        )
        .context("restarting the upload thread")?;
        Ok(())
    }

    fn finish_recovery(&mut self) {
        self.frame_times.reset();
        self.halted = None;
        self.stats.recoveries += 1;
        self.pump_diagnostics();
        log::info!("RenderOrchestrator: recovered");
    }

    /// Writes the pipeline blob to the configured path. Returns the number of
    /// pipelines written, or `None` when no path is configured.
    pub fn save_pipeline_blob(&self) -> anyhow::Result<Option<usize>> {
        match &self.config.pipelines.blob_path {
            Some(path) => self.save_pipeline_blob_to(path).map(Some),
            None => Ok(None),
        }
    }

    /// Writes the pipeline blob to `path`.
    pub fn save_pipeline_blob_to(&self, path: impl AsRef<Path>) -> anyhow::Result<usize> {
        let path = path.as_ref();
        self.pipelines
            .save_blob(path)
            .with_context(|| format!("saving the pipeline blob to {}", path.display()))
    }

    /// Waits for the GPU, persists the pipeline blob, stops the worker threads
    /// and destroys every GPU object. Idempotent.
    pub fn shutdown(&mut self) -> anyhow::Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        let idle = if self.halted.is_none() {
            self.wait_idle()
        } else {
            Ok(())
        };
        if idle.is_ok() {
            if let Err(err) = self.save_pipeline_blob() {
                log::warn!("RenderOrchestrator: {err:#}");
            }
        }

        self.pipelines.shutdown();
        self.uploads.shutdown();
        self.pipelines.clear();
        let frame = self.frames.next_frame();
        {
            let mut ctx = pool_context!(self, frame);
            self.textures.destroy_all(&mut ctx);
            self.buffers.destroy_all(&mut ctx);
            self.render_targets.destroy_all(&mut ctx);
        }
        self.heaps.destroy_all(self.device.as_ref());
        self.pump_diagnostics();
        log::info!(
            "RenderOrchestrator: shut down after {} frames",
            self.stats.frames_rendered
        );
        idle.context("waiting for the GPU before shutdown")
    }

    /// Returns `true` while halted after a fatal error.
    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// The error that halted the orchestrator.
    pub fn halt_reason(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    /// Lifetime counters.
    pub fn stats(&self) -> OrchestratorStats {
        self.stats
    }

    /// The configuration the orchestrator was built with.
    pub fn config(&self) -> &LumenConfig {
        &self.config
    }

    /// The number the next frame will carry.
    pub fn next_frame(&self) -> u64 {
        self.frames.next_frame()
    }

    /// The bus every diagnostic event goes through.
    pub fn diagnostics_bus(&self) -> &Arc<EventBus<DiagnosticEvent>> {
        &self.bus
    }

    /// Per-kind diagnostic counts and recent events.
    pub fn diagnostics(&self) -> &DiagnosticsService {
        &self.diagnostics
    }

    /// The registry frame metrics are published to.
    pub fn metrics(&self) -> &MetricsRegistry {
        &self.registry
    }

    /// The most recently published frame metrics.
    pub fn last_metrics(&self) -> Option<&FrameMetrics> {
        self.publisher.last()
    }

    /// Calls `callback` with the metrics of every published frame.
    pub fn subscribe_metrics<F>(&mut self, callback: F)
    where
        F: Fn(&FrameMetrics) + Send + Sync + 'static,
    {
        self.publisher.subscribe(callback);
    }

    /// The pipeline cache.
    pub fn pipelines(&self) -> &PipelineStateCache {
        &self.pipelines
    }

    /// Pipeline cache counters.
    pub fn pipeline_stats(&self) -> PipelineCacheStats {
        self.pipelines.stats()
    }

    /// Heap occupancy.
    pub fn heap_stats(&self) -> HeapPoolStats {
        self.heaps.stats()
    }

    /// Counters of the pool of `kind`.
    pub fn pool_stats(&self, kind: ResourceKind) -> PoolStats {
        match kind {
            ResourceKind::Texture => self.textures.stats(),
            ResourceKind::Buffer => self.buffers.stats(),
            ResourceKind::RenderTarget => self.render_targets.stats(),
        }
    }

    /// Upload counters.
    pub fn upload_stats(&self) -> UploadStats {
        self.uploads.stats()
    }
}

impl Drop for RenderOrchestrator {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!("RenderOrchestrator: {err:#}");
        }
    }
}

fn prepare_binding<R: PooledResource>(
    pool: &mut ResourcePool<R>,
    handle: PoolHandle,
    ctx: &mut PoolContext<'_>,
) -> Result<(), ResourceError> {
    // Unknown handles are reported as missing bindings while recording.
    if !pool.contains(handle) {
        return Ok(());
    }
    pool.make_resident(handle, ctx)?;
    pool.touch(handle, ctx.frame);
    pool.set_evictable(handle, false);
    Ok(())
}

fn merge(total: &mut ResidencyReport, pass: ResidencyReport) {
    total.disposed_idle += pass.disposed_idle;
    total.evicted += pass.evicted;
    total.bytes_freed += pass.bytes_freed;
}

fn batch_failure(err: BatchError) -> RenderError {
    match err {
        BatchError::Descriptor(DescriptorError::Sync(sync)) => RenderError::Fatal(sync),
        BatchError::Descriptor(DescriptorError::Device(device)) => RenderError::from(device),
        other => RenderError::InvalidFrameState(other.to_string()),
    }
}

fn resource_failure(err: ResourceError) -> RenderError {
    match err {
        ResourceError::Descriptor(DescriptorError::Sync(sync)) => RenderError::Fatal(sync),
        ResourceError::Descriptor(DescriptorError::Device(device))
        | ResourceError::Device(device)
        | ResourceError::Memory(MemoryError::Device(device)) => RenderError::from(device),
        other => RenderError::Fatal(SyncError::DeviceLost(other.to_string())),
    }
}
