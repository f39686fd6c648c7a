use std::sync::Arc;

use anyhow::{Context, Result};
use bytemuck::{Pod, Zeroable};

use tessera_gpu::device::soft::{DeviceEvent, SoftDevice};
use tessera_gpu::device::DeviceLimits;
use tessera_gpu::logging::{init_logging, LoggingConfig};
use tessera_gpu::mirror::{BufferMirror, MirrorConfig, SysmemBuffer};
use tessera_gpu::ring::{RingAllocator, RingConfig};
use tessera_gpu::ErrorAction;

const FRAMES: u32 = 240;
const FRAMES_IN_FLIGHT: u32 = 3;
const DRAWS_PER_FRAME: u32 = 8;

/// Frames the simulated GPU runs behind the CPU.
const GPU_LAG_FRAMES: u64 = 2;

// Bind slots.
const CAMERA_SLOT: u32 = 0;
const PALETTE_SLOT: u32 = 1;
const DRAW_SLOT: u32 = 2;

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
struct DrawUniforms {
    offset: [f32; 2],
    scale: f32,
    color_index: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
struct Camera {
    view_proj: [[f32; 4]; 4],
    time: f32,
    _pad: [f32; 3],
}

const PALETTE: [[f32; 4]; 4] = [
    [0.90, 0.30, 0.25, 1.0],
    [0.25, 0.60, 0.90, 1.0],
    [0.95, 0.80, 0.20, 1.0],
    [0.30, 0.80, 0.40, 1.0],
];

/// Per-frame GPU data of a tiny scene.
struct Scene {
    device: Arc<SoftDevice>,
    draws: RingAllocator<SoftDevice>,
    camera: SysmemBuffer,
    camera_gpu: BufferMirror<SoftDevice>,
    palette: SysmemBuffer,
    palette_gpu: BufferMirror<SoftDevice>,
    fences_per_frame: u64,
}

impl Scene {
    fn new(device: Arc<SoftDevice>) -> Result<Self> {
        let config = RingConfig {
            label: Some("draw uniforms".to_owned()),
            ..RingConfig::new(
                DRAWS_PER_FRAME * FRAMES_IN_FLIGHT,
                std::mem::size_of::<DrawUniforms>() as u64,
            )
        };
        let draws = RingAllocator::with_config(device.clone(), config)
            .context("failed to create draw uniform ring")?;

        let palette_config = MirrorConfig {
            usage: wgpu::BufferUsages::STORAGE,
            ..MirrorConfig::default()
        };

        Ok(Self {
            draws,
            camera: SysmemBuffer::new(true),
            camera_gpu: BufferMirror::new(device.clone(), MirrorConfig::default()),
            palette: SysmemBuffer::with_data(false, bytemuck::cast_slice(&PALETTE)),
            palette_gpu: BufferMirror::new(device.clone(), palette_config),
            // draw ring + camera ring
            fences_per_frame: 2,
            device,
        })
    }

    fn render(&mut self, frame: u32) -> tessera_gpu::Result<()> {
        let t = frame as f32 / 60.0;

        let camera = Camera {
            view_proj: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
                [t.sin() * 0.1, 0.0, 0.0, 1.0],
            ],
            time: t,
            _pad: [0.0; 3],
        };
        self.camera.set_data(bytemuck::bytes_of(&camera));
        if frame == FRAMES / 2 {
            self.palette.update(0, bytemuck::bytes_of(&[1.0f32, 1.0, 1.0, 1.0]));
        }

        let batch = u64::from(frame);
        self.camera_gpu.sync(&self.camera, batch)?;
        self.palette_gpu.sync(&self.palette, batch)?;
        self.camera_gpu.bind_range(CAMERA_SLOT, 0, self.camera.size())?;
        self.palette_gpu.bind_range(PALETTE_SLOT, 0, self.palette.size())?;

        let mut writer = self.draws.map(DRAWS_PER_FRAME)?;
        for index in 0..DRAWS_PER_FRAME {
            let angle = t + index as f32 * std::f32::consts::TAU / DRAWS_PER_FRAME as f32;
            let draw = DrawUniforms {
                offset: [angle.cos() * 0.5, angle.sin() * 0.5],
                scale: 0.1,
                color_index: index % PALETTE.len() as u32,
            };
            writer.write_atom(index, bytemuck::bytes_of(&draw))?;
        }
        writer.unmap()?;

        for index in 0..DRAWS_PER_FRAME {
            // one draw call per atom
            self.draws.bind_range(DRAW_SLOT, index, 1)?;
        }

        // Submit.
        self.draws.on_usage_complete()?;
        self.camera_gpu.on_usage_complete()?;
        self.palette_gpu.on_usage_complete()?;

        let lag = GPU_LAG_FRAMES * self.fences_per_frame;
        self.device
            .retire_through(self.device.last_fence_seq().saturating_sub(lag));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct WaitStats {
    polls: u64,
    long_waits: u64,
}

impl WaitStats {
    fn record(&mut self, events: &[DeviceEvent]) {
        for event in events {
            if let DeviceEvent::FenceWaited { flush, .. } = event {
                if *flush {
                    self.long_waits += 1;
                } else {
                    self.polls += 1;
                }
            }
        }
    }
}

fn main() -> Result<()> {
    init_logging(LoggingConfig::default());

    let limits = DeviceLimits::from(&wgpu::Limits::default());
    log::info!(
        "device: uniform alignment {}, storage alignment {}",
        limits.min_uniform_offset_alignment,
        limits.min_storage_offset_alignment
    );
    let device = Arc::new(SoftDevice::new(limits));
    let mut scene = Scene::new(device.clone())?;

    let mut stats = WaitStats::default();
    let mut skipped = 0u32;
    for frame in 0..FRAMES {
        match scene.render(frame) {
            Ok(()) => {}
            Err(err) if err.action() == ErrorAction::SkipFrame => {
                log::warn!("frame {frame} skipped: {err}");
                skipped += 1;
            }
            Err(err) => return Err(err).with_context(|| format!("frame {frame} failed")),
        }
        stats.record(&device.take_events());
    }

    let ring = scene.draws.stats();
    log::info!(
        "{FRAMES} frames: {} allocations, {} wraps ({} atoms skipped), {skipped} frames skipped",
        ring.allocations,
        ring.wraps,
        ring.wasted_atoms
    );
    log::info!(
        "fence waits: {} polls, {} long waits",
        stats.polls,
        stats.long_waits
    );
    log::info!(
        "dynamic camera mirror at byte {}, palette synced at batch {:?}",
        scene.camera_gpu.head_offset(),
        scene.palette_gpu.synced_at_batch()
    );

    anyhow::ensure!(
        stats.long_waits == 0,
        "ring of {FRAMES_IN_FLIGHT} frames stalled behind a GPU lagging {GPU_LAG_FRAMES} frames"
    );
    Ok(())
}
