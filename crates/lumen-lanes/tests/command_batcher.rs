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

use ahash::AHashMap;
use lumen_core::config::DescriptorConfig;
use lumen_core::diagnostics::{DiagnosticEvent, SkipReason};
use lumen_core::error::SyncError;
use lumen_core::event::EventBus;
use lumen_core::frame::{MaterialId, PassBucket, Renderable, RenderableId, ResourceBinding};
use lumen_core::gpu::{
    DrawArgs, FenceObserver, GpuDevice, PipelineHandle, QueueKind, ResourceBarrier, ResourceId,
};
use lumen_core::pipeline::{MaterialDescription, PipelineKey, ShaderStageSource};
use lumen_core::resource::{PoolHandle, ResourceKind, ResourceState};
use lumen_data::DescriptorAllocator;
use lumen_infra::{HeadlessDevice, RecordedCommand};
use lumen_lanes::{
    BatchError, BatchState, BatchStats, CommandBatcher, DrawResolver, RecordContext,
};

struct Retired;

impl FenceObserver for Retired {
    fn completed_value(&self) -> u64 {
        u64::MAX
    }

    fn wait_for(&self, _value: u64) -> Result<(), SyncError> {
        Ok(())
    }
}

#[derive(Default)]
struct TestResolver {
    pipelines: AHashMap<PipelineKey, Result<PipelineHandle, SkipReason>>,
    resources: AHashMap<PoolHandle, ResourceId>,
}

impl DrawResolver for TestResolver {
    fn pipeline(&mut self, key: &PipelineKey) -> Result<PipelineHandle, SkipReason> {
        self.pipelines
            .get(key)
            .copied()
            .unwrap_or(Err(SkipReason::PipelinePending))
    }

    fn resource(&mut self, handle: PoolHandle) -> Option<ResourceId> {
        self.resources.get(&handle).copied()
    }
}

struct Harness {
    device: HeadlessDevice,
    descriptors: DescriptorAllocator,
    bus: EventBus<DiagnosticEvent>,
    resolver: TestResolver,
}

impl Harness {
    fn new() -> Self {
        let device = HeadlessDevice::new();
        let config = DescriptorConfig {
            capacity: 256,
            static_capacity: 64,
            promotion_threshold: 1_000,
            promotion_window_frames: None,
        };
        let mut descriptors = DescriptorAllocator::new(&device, &config).expect("table");
        descriptors.begin_frame(1);
        Self {
            device,
            descriptors,
            bus: EventBus::new(),
            resolver: TestResolver::default(),
        }
    }

    fn key(&mut self, variant: u32) -> PipelineKey {
        let material = MaterialDescription::new(
            "batch",
            ShaderStageSource::new("vs", "vs_main"),
            ShaderStageSource::new("fs", "fs_main"),
        )
        .with_define("VARIANT", variant.to_string());
        let key = PipelineKey::from_material(&material);
        self.resolver
            .pipelines
            .insert(key, Ok(PipelineHandle(100 + u64::from(variant))));
        key
    }

    fn texture(&mut self, index: u32) -> PoolHandle {
        let handle = PoolHandle {
            kind: ResourceKind::Texture,
            index,
            generation: 0,
        };
        self.resolver
            .resources
            .insert(handle, ResourceId(1_000 + u64::from(index)));
        handle
    }

    fn record(&mut self, batcher: &mut CommandBatcher) -> (BatchStats, Vec<RecordedCommand>) {
        let mut list = self
            .device
            .create_command_list(QueueKind::Graphics, "batch")
            .expect("list");
        let stats = {
            let mut ctx = RecordContext {
                device: &self.device,
                descriptors: &mut self.descriptors,
                fences: &Retired,
                diagnostics: &self.bus,
            };
            batcher
                .record(&mut ctx, &mut self.resolver, list.as_mut())
                .expect("records")
        };
        let buffer = list.finish();
        self.device
            .submit(QueueKind::Graphics, &[buffer])
            .expect("submits");
        let commands = self
            .device
            .take_submissions()
            .pop()
            .map(|s| s.commands)
            .unwrap_or_default();
        (stats, commands)
    }
}

fn renderable(
    id: u64,
    key: PipelineKey,
    bucket: PassBucket,
    bindings: Vec<ResourceBinding>,
    depth: f32,
) -> Renderable {
    Renderable {
        id: RenderableId(id),
        material: MaterialId(0),
        key,
        bucket,
        bindings,
        depth,
        args: DrawArgs::vertices(3),
    }
}

fn draws(commands: &[RecordedCommand]) -> Vec<u32> {
    commands
        .iter()
        .filter_map(|c| match c {
            RecordedCommand::Draw(call) => Some(call.descriptor_offset),
            _ => None,
        })
        .collect()
}

#[test]
fn transparent_renderables_are_recorded_back_to_front() {
    let mut harness = Harness::new();
    let keys: Vec<_> = (0..4).map(|i| harness.key(i)).collect();
    let mut batcher = CommandBatcher::new();
    batcher
        .collect(vec![
            renderable(0, keys[0], PassBucket::Transparent, vec![], 2.0),
            renderable(1, keys[1], PassBucket::Transparent, vec![], 9.0),
            renderable(2, keys[2], PassBucket::Transparent, vec![], 5.0),
            renderable(3, keys[3], PassBucket::Transparent, vec![], 9.0),
        ])
        .expect("collects");
    batcher.sort().expect("sorts");

    let order: Vec<u64> = batcher.recording_order().iter().map(|id| id.0).collect();
    assert_eq!(order, vec![1, 3, 2, 0]);

    let (stats, commands) = harness.record(&mut batcher);
    assert_eq!(stats.draws_recorded, 4);
    let pipelines: Vec<u64> = commands
        .iter()
        .filter_map(|c| match c {
            RecordedCommand::SetPipeline(p) => Some(p.0),
            _ => None,
        })
        .collect();
    assert_eq!(pipelines, vec![101, 103, 102, 100]);
}

#[test]
fn opaque_groups_bind_once_largest_first() {
    let mut harness = Harness::new();
    let (a, b, c) = (harness.key(0), harness.key(1), harness.key(2));
    let tex = harness.texture(0);
    let read = |h| vec![ResourceBinding::shader_read(h)];

    let mut batcher = CommandBatcher::new();
    batcher
        .collect(vec![
            renderable(0, b, PassBucket::Opaque, read(tex), 1.0),
            renderable(1, a, PassBucket::Opaque, read(tex), 1.0),
            renderable(2, c, PassBucket::Opaque, read(tex), 1.0),
            renderable(3, a, PassBucket::Opaque, read(tex), 1.0),
            renderable(4, c, PassBucket::Opaque, read(tex), 1.0),
            renderable(5, a, PassBucket::Opaque, read(tex), 1.0),
        ])
        .expect("collects");
    batcher.sort().expect("sorts");
    assert_eq!(
        batcher.group_sizes(),
        vec![
            (PassBucket::Opaque, 3),
            (PassBucket::Opaque, 2),
            (PassBucket::Opaque, 1)
        ]
    );

    let (stats, commands) = harness.record(&mut batcher);
    assert_eq!(stats.pipeline_binds, 3);
    assert_eq!(stats.descriptor_binds, 3);
    assert_eq!(stats.draws_recorded, 6);
    assert_eq!(draws(&commands), vec![0, 1, 2, 0, 1, 0]);
    // One transition for the shared texture, before the first group only.
    assert_eq!(stats.barriers, 1);
    assert!(matches!(commands[0], RecordedCommand::Barriers(ref b) if b.len() == 1));
}

#[test]
fn ui_runs_keep_submission_order() {
    let mut harness = Harness::new();
    let (a, b) = (harness.key(0), harness.key(1));
    let mut batcher = CommandBatcher::new();
    batcher
        .collect(vec![
            renderable(0, a, PassBucket::Ui, vec![], 0.0),
            renderable(1, a, PassBucket::Ui, vec![], 0.0),
            renderable(2, b, PassBucket::Ui, vec![], 0.0),
            renderable(3, a, PassBucket::Ui, vec![], 0.0),
        ])
        .expect("collects");
    batcher
        .collect(vec![renderable(4, b, PassBucket::Opaque, vec![], 3.0)])
        .expect("collects");
    batcher.sort().expect("sorts");

    let order: Vec<u64> = batcher.recording_order().iter().map(|id| id.0).collect();
    assert_eq!(order, vec![4, 0, 1, 2, 3]);
    assert_eq!(
        batcher.group_sizes(),
        vec![
            (PassBucket::Opaque, 1),
            (PassBucket::Ui, 2),
            (PassBucket::Ui, 1),
            (PassBucket::Ui, 1)
        ]
    );
}

#[test]
fn missing_binding_skips_only_that_draw() {
    let mut harness = Harness::new();
    let key = harness.key(0);
    let tex = harness.texture(0);
    let stale = PoolHandle {
        kind: ResourceKind::Texture,
        index: 9,
        generation: 3,
    };

    let mut batcher = CommandBatcher::new();
    batcher
        .collect(vec![
            renderable(0, key, PassBucket::Opaque, vec![ResourceBinding::shader_read(tex)], 1.0),
            renderable(1, key, PassBucket::Opaque, vec![ResourceBinding::shader_read(stale)], 1.0),
        ])
        .expect("collects");
    batcher.sort().expect("sorts");
    let (stats, _) = harness.record(&mut batcher);

    assert_eq!(stats.draws_recorded, 1);
    assert_eq!(stats.draws_skipped, 1);
    let events = harness.bus.drain();
    assert_eq!(
        events,
        vec![DiagnosticEvent::DrawSkipped {
            renderable: RenderableId(1),
            reason: SkipReason::MissingBinding(stale),
        }]
    );
}

#[test]
fn unresolved_pipeline_skips_the_whole_group() {
    let mut harness = Harness::new();
    let ready = harness.key(0);
    let failed = harness.key(1);
    let pending = harness.key(2);
    harness
        .resolver
        .pipelines
        .insert(failed, Err(SkipReason::PipelineFailed));
    harness.resolver.pipelines.remove(&pending);

    let mut batcher = CommandBatcher::new();
    batcher
        .collect(vec![
            renderable(0, ready, PassBucket::Opaque, vec![], 1.0),
            renderable(1, failed, PassBucket::Opaque, vec![], 1.0),
            renderable(2, pending, PassBucket::Transparent, vec![], 1.0),
            renderable(3, pending, PassBucket::Transparent, vec![], 1.0),
        ])
        .expect("collects");
    batcher.sort().expect("sorts");
    let (stats, _) = harness.record(&mut batcher);

    assert_eq!(stats.draws_recorded, 1);
    assert_eq!(stats.draws_skipped, 3);
    assert_eq!(stats.pipeline_binds, 1);
    let reasons: Vec<SkipReason> = harness
        .bus
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            DiagnosticEvent::DrawSkipped { reason, .. } => Some(reason),
            _ => None,
        })
        .collect();
    assert_eq!(
        reasons,
        vec![
            SkipReason::PipelineFailed,
            SkipReason::PipelinePending,
            SkipReason::PipelinePending
        ]
    );
}

#[test]
fn barriers_track_state_across_frames() {
    let mut harness = Harness::new();
    let key = harness.key(0);
    let target = harness.texture(0);
    let mut batcher = CommandBatcher::new();

    let as_target = ResourceBinding {
        handle: target,
        state: ResourceState::RenderTarget,
    };
    batcher
        .collect(vec![renderable(0, key, PassBucket::Opaque, vec![as_target], 1.0)])
        .expect("collects");
    batcher.sort().expect("sorts");
    assert_eq!(harness.record(&mut batcher).0.barriers, 1);
    batcher.mark_submitted().expect("submitted");

    batcher.reset();
    batcher
        .collect(vec![renderable(0, key, PassBucket::Opaque, vec![as_target], 1.0)])
        .expect("collects");
    batcher.sort().expect("sorts");
    assert_eq!(harness.record(&mut batcher).0.barriers, 0);
    assert_eq!(
        batcher.barriers().state(ResourceId(1_000)),
        Some(ResourceState::RenderTarget)
    );
}

/// The state each draw sees, replaying the recorded barriers in order.
fn states_at_draws(
    commands: &[RecordedCommand],
    resource: ResourceId,
) -> Vec<Option<ResourceState>> {
    let mut current = None;
    let mut seen = Vec::new();
    for command in commands {
        match command {
            RecordedCommand::Barriers(barriers) => {
                for barrier in barriers.iter().filter(|b| b.resource == resource) {
                    assert_eq!(current.unwrap_or(ResourceState::Undefined), barrier.before);
                    current = Some(barrier.after);
                }
            }
            RecordedCommand::Draw(_) => seen.push(current),
            _ => {}
        }
    }
    seen
}

#[test]
fn draws_in_one_group_each_see_their_own_state() {
    let mut harness = Harness::new();
    let key = harness.key(0);
    let tex = harness.texture(7);
    let resource = ResourceId(1_007);
    let bind = |state| {
        vec![ResourceBinding {
            handle: tex,
            state,
        }]
    };

    let mut batcher = CommandBatcher::new();
    batcher
        .collect(vec![
            renderable(0, key, PassBucket::Opaque, bind(ResourceState::ShaderRead), 1.0),
            renderable(1, key, PassBucket::Opaque, bind(ResourceState::UnorderedAccess), 1.0),
            renderable(2, key, PassBucket::Opaque, bind(ResourceState::UnorderedAccess), 1.0),
        ])
        .expect("collects");
    batcher.sort().expect("sorts");
    assert_eq!(batcher.group_sizes(), vec![(PassBucket::Opaque, 3)]);

    let (stats, commands) = harness.record(&mut batcher);
    assert_eq!(stats.pipeline_binds, 1);
    assert_eq!(stats.draws_recorded, 3);
    assert_eq!(stats.barriers, 2);
    assert_eq!(
        states_at_draws(&commands, resource),
        vec![
            Some(ResourceState::ShaderRead),
            Some(ResourceState::UnorderedAccess),
            Some(ResourceState::UnorderedAccess)
        ]
    );

    // The second transition sits between the first and second draw.
    let positions: Vec<usize> = commands
        .iter()
        .enumerate()
        .filter(|(_, c)| matches!(c, RecordedCommand::Draw(_)))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(
        commands[positions[1] - 1],
        RecordedCommand::Barriers(vec![ResourceBarrier {
            resource,
            before: ResourceState::ShaderRead,
            after: ResourceState::UnorderedAccess,
        }])
    );
    assert_eq!(positions[2], positions[1] + 1);
    assert_eq!(
        batcher.barriers().state(resource),
        Some(ResourceState::UnorderedAccess)
    );
}

#[test]
fn invalid_transitions_are_rejected() {
    let mut batcher = CommandBatcher::new();
    assert!(matches!(
        batcher.sort(),
        Err(BatchError::InvalidTransition {
            from: BatchState::Empty,
            to: BatchState::Sorted
        })
    ));
    assert!(batcher.mark_submitted().is_err());

    batcher.collect(Vec::new()).expect("empty frame collects");
    batcher.sort().expect("sorts");
    assert!(batcher.collect(Vec::new()).is_err());
    assert_eq!(batcher.state(), BatchState::Sorted);

    batcher.reset();
    assert_eq!(batcher.state(), BatchState::Empty);
    assert!(batcher.is_empty());
}
