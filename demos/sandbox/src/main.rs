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


// Lumen sandbox
// Renders a synthetic scene on the headless backend and reports frame metrics.

use anyhow::{Context, Result};
use lumen_agents::{FrameDescription, RenderOrchestrator};
use lumen_core::config::LumenConfig;
use lumen_core::frame::{MaterialId, PassBucket, Renderable, RenderableId, ResourceBinding};
use lumen_core::gpu::DrawArgs;
use lumen_core::pipeline::{MaterialDescription, PipelineKey, ShaderStageSource};
use lumen_core::resource::{
    PoolHandle, RenderTargetDescription, ResidencyPolicy, TextureDescription, TextureFormat,
};
use lumen_infra::{HeadlessCompiler, HeadlessDevice};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_CONFIG: &str = "demos/sandbox/lumen.ron";
const FRAMES: u64 = 300;
const MATERIALS: u32 = 12;
const TEXTURES: usize = 48;
const OBJECTS: u64 = 400;

fn main() -> Result<()> {
    if let Err(err) = lumen_telemetry::init_logging("info") {
        eprintln!("sandbox: logger already installed: {err}");
    }

    let config = load_config()?;
    std::fs::create_dir_all("target").context("creating the output directory")?;
    let device = HeadlessDevice::new();
    let compiler = Arc::new(HeadlessCompiler::with_delay(Duration::from_millis(2)));
    let mut orchestrator = RenderOrchestrator::new(Arc::new(device), compiler.clone(), config)?
        .with_compile_wait(Duration::from_millis(20));

    let materials: Vec<MaterialDescription> = (0..MATERIALS).map(material).collect();
    let textures = (0..TEXTURES)
        .map(|i| {
            let size = 64 << (i % 3);
            orchestrator.acquire_texture(
                TextureDescription::new_2d(size, size, TextureFormat::Rgba8UnormSrgb),
                ResidencyPolicy::Streaming,
            )
        })
        .collect::<Result<Vec<_>, _>>()
        .context("acquiring sandbox textures")?;
    for (i, &texture) in textures.iter().enumerate() {
        orchestrator.upload(texture, 0, vec![i as u8; 256])?;
    }

    log::info!("Sandbox: rendering {FRAMES} frames");
    for frame in 0..FRAMES {
        let description = scene(frame, &materials, &textures);
        let report = orchestrator.render_frame(&description)?;
        if report.frame % 60 == 0 {
            let m = report.metrics;
            log::info!(
                "Sandbox: frame {} avg {:.3} ms (var {:.4}) | drawn {} skipped {} | pso hit {:.1}% | {} heaps, {:.1}% fragmented | evicted {}",
                m.frame,
                m.frame_time_avg_ms,
                m.frame_time_variance_ms2,
                m.draws_recorded,
                m.draws_skipped,
                m.pso_hit_rate * 100.0,
                m.heap_count,
                m.fragmentation_percent,
                report.residency.evicted,
            );
        }
    }

    let moved = orchestrator.defragment()?;
    log::info!("Sandbox: defragmentation moved {moved} idle objects");

    let snapshot = Path::new("target").join("sandbox-metrics.json");
    orchestrator
        .metrics()
        .write_snapshot(&snapshot)
        .context("writing the metrics snapshot")?;
    log::info!(
        "Sandbox: {} compilations ({} from blob), {} diagnostics, metrics in {}",
        compiler.compilations(),
        compiler.blob_hits(),
        orchestrator.diagnostics().total(),
        snapshot.display()
    );

    orchestrator.shutdown()
}

fn load_config() -> Result<LumenConfig> {
    match std::env::args().nth(1) {
        Some(path) => LumenConfig::load(&path).with_context(|| format!("loading {path}")),
        None if Path::new(DEFAULT_CONFIG).exists() => {
            LumenConfig::load(DEFAULT_CONFIG).context("loading the sandbox configuration")
        }
        None => {
            log::info!("Sandbox: no configuration file, using defaults");
            Ok(LumenConfig::default())
        }
    }
}

fn material(index: u32) -> MaterialDescription {
    let fragment = format!("// fragment {index}");
    MaterialDescription::new(
        format!("material-{index}"),
        ShaderStageSource::new("// shared vertex stage", "vs_main"),
        ShaderStageSource::new(fragment, "fs_main"),
    )
    .with_define("VARIANT", index.to_string())
    .with_blend(index % 4 == 3)
}

/// A scene that slowly pans across the texture set, so streaming textures
/// fall out of use and get evicted.
fn scene(frame: u64, materials: &[MaterialDescription], textures: &[PoolHandle]) -> FrameDescription {
    let mut description = FrameDescription::new()
        .with_render_target(RenderTargetDescription {
            width: 1280,
            height: 720,
            format: TextureFormat::Rgba16Float,
            sample_count: 1,
        })
        .with_render_target(RenderTargetDescription {
            width: 1280,
            height: 720,
            format: TextureFormat::Depth32Float,
            sample_count: 1,
        });
    for (i, material) in materials.iter().enumerate() {
        description = description.with_material(MaterialId(i as u32), material.clone());
    }

    let window = (frame / 20) as usize;
    for object in 0..OBJECTS {
        let index = (object % materials.len() as u64) as usize;
        let material = &materials[index];
        let texture = textures[(window + object as usize % 8) % textures.len()];
        let bucket = if material.blend_enabled {
            PassBucket::Transparent
        } else if object % 50 == 0 {
            PassBucket::Ui
        } else {
            PassBucket::Opaque
        };
        description = description.with_renderable(Renderable {
            id: RenderableId(object),
            material: MaterialId(index as u32),
            key: PipelineKey::from_material(material),
            bucket,
            bindings: vec![ResourceBinding::shader_read(texture)],
            depth: ((object * 7919) % 1000) as f32,
            args: DrawArgs::vertices(36),
        });
    }
    description
}
