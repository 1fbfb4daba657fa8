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

use super::barrier::ResourceBarrierOptimizer;
use ahash::AHashMap;
use lumen_core::diagnostics::{DiagnosticEvent, DiagnosticSink, SkipReason};
use lumen_core::frame::{PassBucket, Renderable, RenderableId};
use lumen_core::gpu::{
    CommandList, DescriptorRange, DrawCall, FenceObserver, GpuDevice, PipelineHandle, ResourceId,
};
use lumen_core::pipeline::PipelineKey;
use lumen_core::resource::{PoolHandle, ResourceState};
use lumen_data::{DescriptorAllocator, DescriptorError};
use std::fmt;
use thiserror::Error;

/// The per-frame lifecycle of a [`CommandBatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchState {
    /// Nothing collected yet.
    Empty,
    /// Accepting renderables.
    Collecting,
    /// Groups are ordered and ready to record.
    Sorted,
    /// Commands have been written to a command list.
    Recorded,
    /// The command list was handed to a queue.
    Submitted,
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatchState::Empty => "empty",
            BatchState::Collecting => "collecting",
            BatchState::Sorted => "sorted",
            BatchState::Recorded => "recorded",
            BatchState::Submitted => "submitted",
        };
        f.write_str(name)
    }
}

/// An error of the command batcher.
#[derive(Debug, Error)]
pub enum BatchError {
    /// The requested step is not valid from the current state.
    #[error("cannot go from {from} to {to}")]
    InvalidTransition {
        /// The state the batcher was in.
        from: BatchState,
        /// The state the caller asked for.
        to: BatchState,
    },
    /// Descriptor binding failed in a way that cannot be skipped.
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

impl BatchError {
    /// Returns `true` if the error must halt the frame loop.
    pub fn is_fatal(&self) -> bool {
        match self {
            BatchError::InvalidTransition { .. } => false,
            BatchError::Descriptor(err) => err.is_fatal(),
        }
    }
}

/// What one recording produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    /// Groups and runs formed by sorting.
    pub groups: u64,
    /// Draws written to the command list.
    pub draws_recorded: u64,
    /// Draws left out, each with a diagnostic.
    pub draws_skipped: u64,
    /// Pipeline binds written.
    pub pipeline_binds: u64,
    /// Descriptor range binds written.
    pub descriptor_binds: u64,
    /// Barriers written.
    pub barriers: u64,
}

/// Looks up what a renderable refers to at record time.
///
/// The orchestrator implements this over the pipeline cache and the resource
/// pools; the batcher itself never owns either.
pub trait DrawResolver {
    /// Resolves the compiled pipeline for `key`.
    ///
    /// # Returns
    ///
    /// The pipeline, or the reason every draw of the group has to be skipped
    /// ([`SkipReason::PipelinePending`] or [`SkipReason::PipelineFailed`]).
    fn pipeline(&mut self, key: &PipelineKey) -> Result<PipelineHandle, SkipReason>;

    /// Resolves the GPU resource behind a pool handle. `None` for unknown or
    /// stale handles.
    fn resource(&mut self, handle: PoolHandle) -> Option<ResourceId>;
}

/// Device-side collaborators needed while recording.
pub struct RecordContext<'a> {
    /// The device descriptors are written through.
    pub device: &'a dyn GpuDevice,
    /// The allocator handing out per-group descriptor ranges.
    pub descriptors: &'a mut DescriptorAllocator,
    /// The graphics timeline, for ring waits.
    pub fences: &'a dyn FenceObserver,
    /// Receives a `DrawSkipped` event per skipped draw.
    pub diagnostics: &'a dyn DiagnosticSink,
}

/// Renderables sharing one pipeline bind and one descriptor bind.
#[derive(Debug)]
struct DrawGroup {
    key: PipelineKey,
    bucket: PassBucket,
    members: Vec<usize>,
}

/// Groups a frame's renderables into barrier-minimal, bind-minimal command streams.
///
/// Opaque renderables are grouped by pipeline, largest group first. Transparent
/// renderables are drawn back-to-front whatever their pipeline. UI renderables
/// keep submission order. Consecutive transparent or UI renderables sharing a
/// pipeline form a run that is bound once.
#[derive(Debug)]
pub struct CommandBatcher {
    state: BatchState,
    renderables: Vec<Renderable>,
    groups: Vec<DrawGroup>,
    barriers: ResourceBarrierOptimizer,
    stats: BatchStats,
}

impl Default for CommandBatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandBatcher {
    /// Creates an empty batcher.
    pub fn new() -> Self {
        Self {
            state: BatchState::Empty,
            renderables: Vec::new(),
            groups: Vec::new(),
            barriers: ResourceBarrierOptimizer::new(),
            stats: BatchStats::default(),
        }
    }

    /// The current state.
    pub fn state(&self) -> BatchState {
        self.state
    }

    /// The barrier optimizer, whose tracked states outlive frames.
    pub fn barriers(&self) -> &ResourceBarrierOptimizer {
        &self.barriers
    }

    /// Mutable access to the barrier optimizer, to record initial states and
    /// forget disposed resources.
    pub fn barriers_mut(&mut self) -> &mut ResourceBarrierOptimizer {
        &mut self.barriers
    }

    /// Stats of the current frame.
    pub fn stats(&self) -> BatchStats {
        self.stats
    }

    /// Number of collected renderables.
    pub fn len(&self) -> usize {
        self.renderables.len()
    }

    /// Returns `true` if nothing was collected.
    pub fn is_empty(&self) -> bool {
        self.renderables.is_empty()
    }

    fn transition(&mut self, allowed: &[BatchState], to: BatchState) -> Result<(), BatchError> {
        if allowed.contains(&self.state) {
            self.state = to;
            Ok(())
        } else {
            Err(BatchError::InvalidTransition {
                from: self.state,
                to,
            })
        }
    }

    /// Adds renderables to the frame. Valid while empty or collecting.
    pub fn collect(
        &mut self,
        renderables: impl IntoIterator<Item = Renderable>,
    ) -> Result<(), BatchError> {
        self.transition(&[BatchState::Empty, BatchState::Collecting], BatchState::Collecting)?;
        self.renderables.extend(renderables);
        Ok(())
    }

    /// Orders the collected renderables into groups and runs.
    pub fn sort(&mut self) -> Result<(), BatchError> {
        self.transition(&[BatchState::Collecting], BatchState::Sorted)?;

        let mut opaque: Vec<DrawGroup> = Vec::new();
        let mut opaque_index: AHashMap<PipelineKey, usize> = AHashMap::new();
        let mut transparent = Vec::new();
        let mut ui = Vec::new();

        for (index, renderable) in self.renderables.iter().enumerate() {
            match renderable.bucket {
                PassBucket::Opaque => {
                    let slot = *opaque_index.entry(renderable.key).or_insert_with(|| {
                        opaque.push(DrawGroup {
                            key: renderable.key,
                            bucket: PassBucket::Opaque,
                            members: Vec::new(),
                        });
                        opaque.len() - 1
                    });
                    opaque[slot].members.push(index);
                }
                PassBucket::Transparent => transparent.push(index),
                PassBucket::Ui => ui.push(index),
            }
        }

        opaque.sort_by(|a, b| {
            b.members
                .len()
                .cmp(&a.members.len())
                .then_with(|| a.key.stable_hash().cmp(&b.key.stable_hash()))
        });

        // Stable: equal depths keep submission order.
        let renderables = &self.renderables;
        transparent.sort_by(|&a, &b| renderables[b].depth.total_cmp(&renderables[a].depth));

        let mut groups = opaque;
        groups.extend(runs(renderables, &transparent, PassBucket::Transparent));
        groups.extend(runs(renderables, &ui, PassBucket::Ui));

        self.stats.groups = groups.len() as u64;
        log::trace!(
            "CommandBatcher: {} renderables sorted into {} groups",
            self.renderables.len(),
            groups.len()
        );
        self.groups = groups;
        Ok(())
    }

    /// Renderable ids in the order they will be recorded. Empty until sorted.
    pub fn recording_order(&self) -> Vec<RenderableId> {
        self.groups
            .iter()
            .flat_map(|group| group.members.iter().map(|&i| self.renderables[i].id))
            .collect()
    }

    /// The bucket and size of every group, in recording order.
    pub fn group_sizes(&self) -> Vec<(PassBucket, usize)> {
        self.groups
            .iter()
            .map(|group| (group.bucket, group.members.len()))
            .collect()
    }

    /// Writes barriers, binds and draws for every group into `list`.
    ///
    /// Groups whose pipeline does not resolve, and draws with a binding that
    /// does not resolve, are skipped with a diagnostic. Only fatal descriptor
    /// errors abort recording.
    pub fn record(
        &mut self,
        ctx: &mut RecordContext<'_>,
        resolver: &mut dyn DrawResolver,
        list: &mut dyn CommandList,
    ) -> Result<BatchStats, BatchError> {
        if self.state != BatchState::Sorted {
            return Err(BatchError::InvalidTransition {
                from: self.state,
                to: BatchState::Recorded,
            });
        }

        for group in &self.groups {
            let pipeline = match resolver.pipeline(&group.key) {
                Ok(pipeline) => pipeline,
                Err(reason) => {
                    for &index in &group.members {
                        skip(&mut self.stats, ctx.diagnostics, self.renderables[index].id, reason);
                    }
                    continue;
                }
            };

            // Per draw: renderable index, descriptor offset, end of its states.
            let mut draws: Vec<(usize, u32, usize)> = Vec::with_capacity(group.members.len());
            let mut resources: Vec<ResourceId> = Vec::new();
            let mut states: Vec<(ResourceId, ResourceState)> = Vec::new();
            for &index in &group.members {
                let renderable = &self.renderables[index];
                let mut resolved = Vec::with_capacity(renderable.bindings.len());
                let mut missing = None;
                for binding in &renderable.bindings {
                    match resolver.resource(binding.handle) {
                        Some(resource) => resolved.push((resource, binding.state)),
                        None => {
                            missing = Some(binding.handle);
                            break;
                        }
                    }
                }
                if let Some(handle) = missing {
                    skip(
                        &mut self.stats,
                        ctx.diagnostics,
                        renderable.id,
                        SkipReason::MissingBinding(handle),
                    );
                    continue;
                }
                let offset = resources.len() as u32;
                resources.extend(resolved.iter().map(|(resource, _)| *resource));
                states.extend(resolved);
                draws.push((index, offset, states.len()));
            }
            if draws.is_empty() {
                continue;
            }

            let range: Option<DescriptorRange> = if resources.is_empty() {
                None
            } else {
                match ctx
                    .descriptors
                    .bind_dynamic(ctx.device, ctx.fences, &resources)
                {
                    Ok(range) => Some(range),
                    Err(err) if err.is_fatal() => return Err(err.into()),
                    Err(err) => {
                        log::warn!("CommandBatcher: skipping group of {}: {err}", draws.len());
                        for (index, _, _) in draws {
                            skip(
                                &mut self.stats,
                                ctx.diagnostics,
                                self.renderables[index].id,
                                SkipReason::DescriptorUnavailable,
                            );
                        }
                        continue;
                    }
                }
            };

            // Each draw's transitions land right before it, so a later draw of
            // the group never changes the state an earlier one sees. The first
            // draw's transitions go ahead of the binds.
            let mut start = 0;
            for (position, &(index, descriptor_offset, end)) in draws.iter().enumerate() {
                emit_barriers(
                    &mut self.barriers,
                    &mut self.stats,
                    &states[start..end],
                    list,
                );
                start = end;
                if position == 0 {
                    list.set_pipeline(pipeline);
                    self.stats.pipeline_binds += 1;
                    if let Some(range) = &range {
                        list.set_descriptor_table(range);
                        self.stats.descriptor_binds += 1;
                    }
                }
                list.draw(&DrawCall {
                    args: self.renderables[index].args,
                    descriptor_offset,
                });
                self.stats.draws_recorded += 1;
            }
        }

        self.state = BatchState::Recorded;
        log::trace!(
            "CommandBatcher: recorded {} draws ({} skipped, {} barriers)",
            self.stats.draws_recorded,
            self.stats.draws_skipped,
            self.stats.barriers
        );
        Ok(self.stats)
    }

    /// Marks the recorded command list as submitted.
    pub fn mark_submitted(&mut self) -> Result<(), BatchError> {
        self.transition(&[BatchState::Recorded], BatchState::Submitted)
    }

    /// Drops the frame's renderables and returns to [`BatchState::Empty`].
    /// Tracked resource states are kept.
    pub fn reset(&mut self) {
        self.state = BatchState::Empty;
        self.renderables.clear();
        self.groups.clear();
        self.stats = BatchStats::default();
    }
}

/// Splits `order` into runs of consecutive renderables sharing a pipeline.
fn runs(renderables: &[Renderable], order: &[usize], bucket: PassBucket) -> Vec<DrawGroup> {
    let mut groups: Vec<DrawGroup> = Vec::new();
    for &index in order {
        let key = renderables[index].key;
        match groups.last_mut() {
            Some(run) if run.key == key => run.members.push(index),
            _ => groups.push(DrawGroup {
                key,
                bucket,
                members: vec![index],
            }),
        }
    }
    groups
}

/// Requests `states` and writes the resulting transitions, if any.
fn emit_barriers(
    optimizer: &mut ResourceBarrierOptimizer,
    stats: &mut BatchStats,
    states: &[(ResourceId, ResourceState)],
    list: &mut dyn CommandList,
) {
    for &(resource, state) in states {
        optimizer.request(resource, state);
    }
    let barriers = optimizer.flush();
    if !barriers.is_empty() {
        list.resource_barriers(&barriers);
        stats.barriers += barriers.len() as u64;
    }
}

fn skip(
    stats: &mut BatchStats,
    diagnostics: &dyn DiagnosticSink,
    renderable: RenderableId,
    reason: SkipReason,
) {
    stats.draws_skipped += 1;
    log::debug!("CommandBatcher: {renderable} skipped: {reason}");
    diagnostics.emit(DiagnosticEvent::DrawSkipped { renderable, reason });
}
