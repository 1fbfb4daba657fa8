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


use lumen_agents::{FrameDescription, RenderOrchestrator};
use lumen_core::config::LumenConfig;
use lumen_core::error::RenderError;
use lumen_core::frame::{MaterialId, PassBucket, Renderable, RenderableId, ResourceBinding};
use lumen_core::gpu::{DrawArgs, QueueKind};
use lumen_core::pipeline::{MaterialDescription, PipelineKey, ShaderStageSource};
use lumen_core::resource::{
    BufferDescription, BufferUsage, HeapClass, PoolHandle, RenderTargetDescription,
    ResidencyPolicy, TextureDescription, TextureFormat,
};
use lumen_infra::{FenceMode, HeadlessCompiler, HeadlessDevice};
use std::sync::Arc;
use std::time::Duration;

fn config() -> LumenConfig {
    let mut config = LumenConfig::default();
    config.frames.frames_in_flight = 2;
    config.frames.fence_timeout_ms = 100;
    config.telemetry.log_diagnostics = false;
    config
}

fn orchestrator(
    device: &HeadlessDevice,
    compiler: &Arc<HeadlessCompiler>,
    config: LumenConfig,
) -> RenderOrchestrator {
    RenderOrchestrator::new(Arc::new(device.clone()), compiler.clone(), config)
        .expect("orchestrator")
        .with_compile_wait(Duration::from_secs(2))
}

fn material(name: &str) -> MaterialDescription {
    MaterialDescription::new(
        name,
        ShaderStageSource::new(format!("// {name} vs"), "vs_main"),
        ShaderStageSource::new(format!("// {name} fs"), "fs_main"),
    )
}

fn draw(id: u64, material: MaterialId, description: &MaterialDescription) -> Renderable {
    Renderable {
        id: RenderableId(id),
        material,
        key: PipelineKey::from_material(description),
        bucket: PassBucket::Opaque,
        bindings: Vec::new(),
        depth: id as f32,
        args: DrawArgs::vertices(3),
    }
}

fn streaming_texture(orchestrator: &mut RenderOrchestrator) -> PoolHandle {
    orchestrator
        .acquire_texture(
            TextureDescription::new_2d(16, 16, TextureFormat::Rgba8Unorm),
            ResidencyPolicy::Streaming,
        )
        .expect("texture")
}

#[test]
fn steady_state_frames_hit_the_pipeline_cache() {
    let device = HeadlessDevice::new();
    let compiler = Arc::new(HeadlessCompiler::new());
    let mut orchestrator = orchestrator(&device, &compiler, config());

    let mut frame = FrameDescription::new();
    let materials: Vec<_> = (0..3).map(|i| material(&format!("m{i}"))).collect();
    for (i, description) in materials.iter().enumerate() {
        let id = MaterialId(i as u32);
        frame = frame
            .with_material(id, description.clone())
            .with_renderable(draw(2 * i as u64, id, description))
            .with_renderable(draw(2 * i as u64 + 1, id, description));
    }

    let mut last = None;
    for expected in 1..=5 {
        let report = orchestrator.render_frame(&frame).expect("frame");
        assert_eq!(report.frame, expected);
        assert_eq!(report.batch.draws_recorded, 6);
        assert_eq!(report.batch.draws_skipped, 0);
        assert_eq!(report.pending_pipelines, 0);
        last = Some(report);
    }

    assert_eq!(compiler.compilations(), 3);
    let metrics = last.expect("reports").metrics;
    assert!((metrics.pso_hit_rate - 0.8).abs() < 1e-9);
    assert_eq!(orchestrator.last_metrics().map(|m| m.frame), Some(5));
    assert_eq!(orchestrator.stats().frames_rendered, 5);
    assert!(!device.submitted_commands(QueueKind::Graphics).is_empty());
}

#[test]
fn unresolvable_draws_are_skipped_with_diagnostics() {
    let device = HeadlessDevice::new();
    let compiler = Arc::new(HeadlessCompiler::new());
    let mut orchestrator = orchestrator(&device, &compiler, config());

    let known = material("known");
    let unknown = material("unknown");
    let texture = streaming_texture(&mut orchestrator);
    orchestrator.release(texture).expect("release");

    let mut stale = draw(1, MaterialId(0), &known);
    stale.bindings.push(ResourceBinding::shader_read(texture));
    let frame = FrameDescription::new()
        .with_material(MaterialId(0), known.clone())
        .with_renderable(draw(0, MaterialId(0), &known))
        .with_renderable(stale)
        .with_renderable(draw(2, MaterialId(7), &unknown));

    let report = orchestrator.render_frame(&frame).expect("frame");
    assert_eq!(report.batch.draws_recorded, 1);
    assert_eq!(report.batch.draws_skipped, 2);
    assert_eq!(orchestrator.diagnostics().count("draw_skipped"), 2);
    assert_eq!(compiler.compilations(), 1);
}

#[test]
fn failed_compilation_skips_draws_without_recompiling() {
    let device = HeadlessDevice::new();
    let compiler = Arc::new(HeadlessCompiler::new());
    let mut orchestrator = orchestrator(&device, &compiler, config());

    let broken = MaterialDescription::new(
        "broken",
        ShaderStageSource::new("vs", "vs_main"),
        ShaderStageSource::new("#error", "fs_main"),
    );
    let frame = FrameDescription::new()
        .with_material(MaterialId(0), broken.clone())
        .with_renderable(draw(0, MaterialId(0), &broken));

    for _ in 0..3 {
        let report = orchestrator.render_frame(&frame).expect("frame");
        assert_eq!(report.batch.draws_recorded, 0);
        assert_eq!(report.batch.draws_skipped, 1);
    }
    assert_eq!(compiler.compilations(), 1);
    assert_eq!(orchestrator.diagnostics().count("compilation_failed"), 1);
    assert_eq!(orchestrator.pipeline_stats().known_bad_rejections, 2);
}

#[test]
fn transient_render_targets_are_reused_and_cleared() {
    let device = HeadlessDevice::new();
    let compiler = Arc::new(HeadlessCompiler::new());
    let mut orchestrator = orchestrator(&device, &compiler, config());

    let target = RenderTargetDescription {
        width: 64,
        height: 64,
        format: TextureFormat::Rgba8UnormSrgb,
        sample_count: 1,
    };
    let frame = FrameDescription::new().with_render_target(target);

    let first = orchestrator.render_frame(&frame).expect("frame 1");
    assert_eq!(first.render_targets.len(), 1);
    assert_eq!(first.clears, 1);

    let second = orchestrator.render_frame(&frame).expect("frame 2");
    assert_eq!(second.render_targets, first.render_targets);
    assert_eq!(second.clears, 1);
    assert!(first.metrics.barriers >= 1);
}

#[test]
fn fence_timeout_halts_until_recovered() {
    let device = HeadlessDevice::with_fence_mode(FenceMode::Manual);
    let compiler = Arc::new(HeadlessCompiler::new());
    let mut config = config();
    config.frames.fence_timeout_ms = 50;
    let mut orchestrator = orchestrator(&device, &compiler, config);
    let frame = FrameDescription::new();

    assert_eq!(orchestrator.render_frame(&frame).expect("frame 1").frame, 1);
    assert_eq!(orchestrator.render_frame(&frame).expect("frame 2").frame, 2);

    let err = orchestrator.render_frame(&frame).unwrap_err();
    assert!(matches!(err, RenderError::Fatal(_)), "{err:?}");
    assert!(orchestrator.is_halted());
    assert_eq!(orchestrator.diagnostics().count("fence_timeout"), 1);
    assert_eq!(orchestrator.render_frame(&frame).unwrap_err(), RenderError::Halted);

    device.complete_all();
    orchestrator.recover().expect("recover");
    assert!(!orchestrator.is_halted());
    assert_eq!(orchestrator.stats().recoveries, 1);

    let report = orchestrator.render_frame(&frame).expect("frame after recovery");
    assert_eq!(report.frame, 1);
    device.complete_all();
    orchestrator.shutdown().expect("shutdown");
}

#[test]
fn uploads_complete_and_gate_the_next_frame() {
    let device = HeadlessDevice::new();
    let compiler = Arc::new(HeadlessCompiler::new());
    let mut orchestrator = orchestrator(&device, &compiler, config());

    let buffer = orchestrator
        .acquire_buffer(
            BufferDescription {
                size: 256,
                usage: BufferUsage::VERTEX | BufferUsage::COPY_DST,
                heap_class: HeapClass::Default,
            },
            ResidencyPolicy::Normal,
        )
        .expect("buffer");
    let upload = orchestrator.upload(buffer, 0, vec![7u8; 16]).expect("upload");
    orchestrator.wait_idle().expect("idle");
    assert_eq!(upload.poll(), Some(Ok(())));
    assert_eq!(orchestrator.upload_stats().completed, 1);

    let resource = orchestrator.resource_id(buffer).expect("resident");
    let contents = device.resource_contents(resource).expect("contents");
    assert_eq!(&contents[..16], &[7u8; 16]);

    orchestrator.render_frame(&FrameDescription::new()).expect("frame");
    assert!(device
        .queue_waits()
        .iter()
        .any(|&(queue, _, value)| queue == QueueKind::Graphics && value == upload.ticket()));
}

#[test]
fn residency_budget_evicts_least_recently_used_textures() {
    let device = HeadlessDevice::new();
    let compiler = Arc::new(HeadlessCompiler::new());
    let mut config = config();
    config.pools.residency_budget_bytes = Some(128 * 1024);
    let mut orchestrator = orchestrator(&device, &compiler, config);

    let surface = material("surface");
    let textures: Vec<_> = (0..4).map(|_| streaming_texture(&mut orchestrator)).collect();
    let binding = |texture: PoolHandle| {
        let mut renderable = draw(0, MaterialId(0), &surface);
        renderable.bindings.push(ResourceBinding::shader_read(texture));
        FrameDescription::new()
            .with_material(MaterialId(0), surface.clone())
            .with_renderable(renderable)
    };

    let report = orchestrator.render_frame(&binding(textures[3])).expect("frame 1");
    assert_eq!(report.residency.evicted, 2);
    assert_eq!(report.batch.draws_recorded, 1);
    let first = orchestrator.residency(textures[0]).expect("acquired");
    assert!(!first.resident);
    assert!(orchestrator.residency(textures[3]).expect("acquired").resident);

    let report = orchestrator.render_frame(&binding(textures[0])).expect("frame 2");
    assert_eq!(report.residency.evicted, 1);
    assert_eq!(report.batch.draws_recorded, 1);
    assert!(orchestrator.residency(textures[0]).expect("acquired").resident);
    assert_eq!(orchestrator.diagnostics().count("residency_evicted"), 3);
}

#[test]
fn saved_pipeline_blob_warms_the_next_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let blob = dir.path().join("pipelines.bin");
    let mut config = config();
    config.pipelines.blob_path = Some(blob.to_string_lossy().into_owned());

    let materials = [material("a"), material("b")];
    let mut frame = FrameDescription::new();
    for (i, description) in materials.iter().enumerate() {
        let id = MaterialId(i as u32);
        frame = frame
            .with_material(id, description.clone())
            .with_renderable(draw(i as u64, id, description));
    }

    {
        let device = HeadlessDevice::new();
        let compiler = Arc::new(HeadlessCompiler::new());
        let mut orchestrator = orchestrator(&device, &compiler, config.clone());
        orchestrator.render_frame(&frame).expect("frame");
        orchestrator.shutdown().expect("shutdown");
    }
    assert!(blob.exists());

    let device = HeadlessDevice::new();
    let compiler = Arc::new(HeadlessCompiler::new());
    let mut orchestrator = orchestrator(&device, &compiler, config);
    let report = orchestrator.render_frame(&frame).expect("frame");
    assert_eq!(report.batch.draws_recorded, 2);
    assert_eq!(compiler.blob_hits(), 2);
}

#[test]
fn invalid_configuration_is_rejected() {
    let mut config = config();
    config.frames.frames_in_flight = 5;
    let result = RenderOrchestrator::new(
        Arc::new(HeadlessDevice::new()),
        Arc::new(HeadlessCompiler::new()),
        config,
    );
    assert!(result.is_err());
}

#[test]
fn rendering_after_shutdown_is_refused() {
    let device = HeadlessDevice::new();
    let compiler = Arc::new(HeadlessCompiler::new());
    let mut orchestrator = orchestrator(&device, &compiler, config());
    orchestrator.render_frame(&FrameDescription::new()).expect("frame");
    orchestrator.shutdown().expect("shutdown");
    orchestrator.shutdown().expect("second shutdown is a no-op");

    let err = orchestrator.render_frame(&FrameDescription::new()).unwrap_err();
    assert!(matches!(err, RenderError::InvalidFrameState(_)));
    assert_eq!(device.live_resource_count(), 0);
}
