//! Integrated GPU context for the lattice simulation and its display.
//!
//! This module provides `GpuLatticeRenderer`, which owns the ping-pong
//! lattice textures, the step and display pipelines, and the per-frame
//! stepping logic, sharing one device and queue.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use bytemuck::Zeroable;
use wgpu::{
    BindGroup, BindGroupDescriptor, BindGroupEntry, BindGroupLayoutDescriptor,
    BindGroupLayoutEntry, Buffer, CommandEncoderDescriptor, Device, FragmentState, Instance,
    LoadOp, MultisampleState, Operations, PipelineLayoutDescriptor, PrimitiveState, Queue,
    RenderPassColorAttachment, RenderPassDescriptor, RenderPipeline, RenderPipelineDescriptor,
    ShaderStages, StoreOp, Surface, SurfaceConfiguration, TextureUsages, TextureViewDescriptor,
    VertexState,
    util::{BufferInitDescriptor, DeviceExt},
};
use winit::window::Window;

use crate::rendering::DisplayUniforms;
use crate::sim::{
    BASE_STEPS_PER_SECOND, SimulationParameters, StepUniforms, lattice::LatticeTextures,
};
use crate::util::now_ms;

/// Raised by the uncaptured-error callback when the device is gone; polled by
/// the frame loop to trigger full reinitialization.
static CONTEXT_LOST: AtomicBool = AtomicBool::new(false);

pub fn is_context_lost() -> bool {
    CONTEXT_LOST.load(Ordering::SeqCst)
}

/// Clear the loss flag after recreating the device.
pub fn reset_context_lost() {
    CONTEXT_LOST.store(false, Ordering::SeqCst);
}

/// Sub-steps per frame are capped to avoid a lag spiral after a long stall.
const MAX_SUBSTEPS_PER_FRAME: u32 = 100;

/// Number of sub-steps owed this frame. `speed` multiplies the base rate of
/// [`BASE_STEPS_PER_SECOND`]; fractional remainders carry in `accumulator`.
/// Anything beyond the per-frame cap is discarded rather than owed.
fn substeps_for_frame(accumulator: &mut f64, elapsed_ms: f64, speed: f32) -> u32 {
    if !(speed > 0.0) {
        *accumulator = 0.0;
        return 0;
    }
    *accumulator += elapsed_ms / 1000.0 * speed as f64 * BASE_STEPS_PER_SECOND;
    let steps = accumulator.floor();
    *accumulator -= steps;
    (steps as u32).min(MAX_SUBSTEPS_PER_FRAME)
}

/// GPU context owning simulation stepping and display.
///
/// This struct manages:
/// - the shared device and queue
/// - the ping-pong lattice textures and the step pipeline
/// - the display pipeline and surface
/// - iteration parity and the sub-step accumulator
pub struct GpuLatticeRenderer {
    #[allow(dead_code)]
    instance: Instance, // Keep instance alive for the lifetime of the renderer
    device: Arc<Device>,
    queue: Arc<Queue>,
    step: StepContext,
    display: DisplayContext,
    window: Arc<Window>,
    /// Completed sub-steps since the last (re)initialization. Parity selects
    /// the source and target lattice buffers.
    iteration: u32,
    /// Fractional sub-steps carried between frames.
    substep_accumulator: f64,
    /// Last frame timestamp in milliseconds.
    last_frame_time: f64,
    /// For debug logging: last logged parameters.
    last_logged_params: Option<SimulationParameters>,
}

struct StepContext {
    lattice: LatticeTextures,
    pipeline: RenderPipeline,
    uniform_buf: Buffer,
    uniform_bg: BindGroup,
}

struct DisplayContext {
    surface: Surface<'static>,
    surface_config: SurfaceConfiguration,
    pipeline: RenderPipeline,
    uniform_bg: BindGroup,
}

impl GpuLatticeRenderer {
    /// Create the full GPU stack for a window. Shader, pipeline, and texture
    /// creation run inside error scopes so a compile/link or allocation
    /// failure aborts this initialization attempt instead of surfacing at
    /// first use.
    pub async fn new(window: Arc<Window>) -> Result<Self, anyhow::Error> {
        let instance = Instance::new(&wgpu::InstanceDescriptor::default());

        // Create surface first to find a compatible adapter
        let surface = instance.create_surface(window.clone())?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: Some(&surface),
            })
            .await?;

        log::info!("Using adapter: {:?}", adapter.get_info());

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("ising lattice device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults(),
                experimental_features: wgpu::ExperimentalFeatures::disabled(),
                memory_hints: wgpu::MemoryHints::MemoryUsage,
                trace: wgpu::Trace::Off,
            })
            .await?;

        device.on_uncaptured_error(Box::new(|error| {
            log::error!("GPU uncaptured error: {error:?}");
            if matches!(
                error,
                wgpu::Error::OutOfMemory { .. } | wgpu::Error::Internal { .. }
            ) {
                CONTEXT_LOST.store(true, Ordering::SeqCst);
            }
        }));

        let device = Arc::new(device);
        let queue = Arc::new(queue);

        // Lattice dimensions track the backing-store size of the surface.
        let size = window.inner_size();
        let width = size.width.max(1);
        let height = size.height.max(1);

        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .find(|f| f.is_srgb())
            .copied()
            .unwrap_or(surface_caps.formats[0]);

        let surface_config = SurfaceConfiguration {
            usage: TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width,
            height,
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode: surface_caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &surface_config);

        // Validation errors here are shader compile/link failures; the outer
        // scope catches texture/buffer allocation failure.
        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let step = Self::create_step_context(&device, &queue, width, height);
        let display = Self::create_display_context(&device, surface, surface_config, &step);

        if let Some(e) = device.pop_error_scope().await {
            return Err(anyhow::anyhow!("shader compilation or linking failed: {e}"));
        }
        if let Some(e) = device.pop_error_scope().await {
            return Err(anyhow::anyhow!("GPU resource allocation failed: {e}"));
        }

        Ok(Self {
            instance,
            device,
            queue,
            step,
            display,
            window,
            iteration: 0,
            substep_accumulator: 0.0,
            last_frame_time: 0.0, // Will be set on first frame
            last_logged_params: None,
        })
    }

    /// Request a redraw of the window
    /// Call this after rendering to keep the animation loop going
    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }

    fn create_step_context(
        device: &Device,
        queue: &Queue,
        width: u32,
        height: u32,
    ) -> StepContext {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("lattice step shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("./sim/step.wgsl").into()),
        });

        // Previous-state texture, read with textureLoad in the fragment stage
        let state_bg_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("step state bind group layout"),
            entries: &[BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    multisampled: false,
                    view_dimension: wgpu::TextureViewDimension::D2,
                    sample_type: wgpu::TextureSampleType::Float { filterable: true },
                },
                count: None,
            }],
        });

        let display_bg_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("display state bind group layout"),
            entries: &[
                BindGroupLayoutEntry {
                    binding: 0,
                    visibility: ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                BindGroupLayoutEntry {
                    binding: 1,
                    visibility: ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        multisampled: false,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    },
                    count: None,
                },
            ],
        });

        let lattice = LatticeTextures::new(
            device,
            queue,
            &state_bg_layout,
            &display_bg_layout,
            width,
            height,
        );

        let uniform_buf = device.create_buffer_init(&BufferInitDescriptor {
            label: Some("step uniforms"),
            contents: bytemuck::bytes_of(&StepUniforms::zeroed()),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        let uniform_bg_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("step uniforms bind group layout"),
            entries: &[BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });

        let uniform_bg = device.create_bind_group(&BindGroupDescriptor {
            label: Some("step uniforms bind group"),
            layout: &uniform_bg_layout,
            entries: &[BindGroupEntry {
                binding: 0,
                resource: uniform_buf.as_entire_binding(),
            }],
        });

        let pipeline_layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
            label: Some("step pipeline layout"),
            bind_group_layouts: &[&state_bg_layout, &uniform_bg_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some("step pipeline"),
            layout: Some(&pipeline_layout),
            vertex: VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: wgpu::TextureFormat::Rgba8Unorm,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                unclipped_depth: false,
                polygon_mode: wgpu::PolygonMode::Fill,
                conservative: false,
            },
            depth_stencil: None,
            multisample: MultisampleState {
                count: 1,
                mask: !0,
                alpha_to_coverage_enabled: false,
            },
            multiview: None,
            cache: None,
        });

        StepContext {
            lattice,
            pipeline,
            uniform_buf,
            uniform_bg,
        }
    }

    fn create_display_context(
        device: &Device,
        surface: Surface<'static>,
        surface_config: SurfaceConfiguration,
        step: &StepContext,
    ) -> DisplayContext {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("display shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("./rendering/display.wgsl").into()),
        });

        let uniform_buf = device.create_buffer_init(&BufferInitDescriptor {
            label: Some("display uniforms"),
            contents: bytemuck::bytes_of(&DisplayUniforms::default()),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let uniform_bg_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("display uniforms bind group layout"),
            entries: &[BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });

        let uniform_bg = device.create_bind_group(&BindGroupDescriptor {
            label: Some("display uniforms bind group"),
            layout: &uniform_bg_layout,
            entries: &[BindGroupEntry {
                binding: 0,
                resource: uniform_buf.as_entire_binding(),
            }],
        });

        // The display pass reuses the lattice's display bind group layout,
        // which the texture store rebuilds on every reallocation.
        let display_bg_layout = step.lattice.display_layout();

        let pipeline_layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
            label: Some("display pipeline layout"),
            bind_group_layouts: &[display_bg_layout, &uniform_bg_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some("display pipeline"),
            layout: Some(&pipeline_layout),
            vertex: VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: surface_config.format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                unclipped_depth: false,
                polygon_mode: wgpu::PolygonMode::Fill,
                conservative: false,
            },
            depth_stencil: None,
            multisample: MultisampleState {
                count: 1,
                mask: !0,
                alpha_to_coverage_enabled: false,
            },
            multiview: None,
            cache: None,
        });

        DisplayContext {
            surface,
            surface_config,
            pipeline,
            uniform_bg,
        }
    }

    /// Run the sub-steps owed this frame and present the result.
    pub fn step_and_render(
        &mut self,
        parameters: SimulationParameters,
    ) -> Result<(), wgpu::SurfaceError> {
        self.check_resize();

        let now = now_ms();
        let elapsed_ms = if self.last_frame_time == 0.0 {
            // First frame
            0.0
        } else {
            now - self.last_frame_time
        };
        self.last_frame_time = now;

        let steps_to_run = substeps_for_frame(
            &mut self.substep_accumulator,
            elapsed_ms,
            parameters.speed,
        );

        if self.last_logged_params != Some(parameters) {
            log::info!(
                "Parameters changed: T={:.2}, J={:.2}, H={:.2}, speed={:.1}x, topology={}",
                parameters.temperature,
                parameters.coupling,
                parameters.field,
                parameters.speed,
                parameters.topology.label()
            );
            self.last_logged_params = Some(parameters);
        }

        let (width, height) = self.step.lattice.dimensions();

        // Get surface texture
        let output = self.display.surface.get_current_texture()?;
        let view = output.texture.create_view(&TextureViewDescriptor::default());

        // Each sub-step is submitted separately so its uniform write (fresh
        // seed, iteration parity) takes effect before its own pass reads it;
        // batching them would make every pass see the last written value.
        for _ in 0..steps_to_run {
            let uniforms = StepUniforms::new(
                &parameters,
                width,
                height,
                self.iteration,
                fastrand::f32(),
            );
            self.queue
                .write_buffer(&self.step.uniform_buf, 0, bytemuck::bytes_of(&uniforms));

            let mut step_encoder = self
                .device
                .create_command_encoder(&CommandEncoderDescriptor {
                    label: Some("step encoder"),
                });

            {
                let mut pass = step_encoder.begin_render_pass(&RenderPassDescriptor {
                    label: Some("lattice step pass"),
                    color_attachments: &[Some(RenderPassColorAttachment {
                        view: self.step.lattice.target_view(self.iteration),
                        resolve_target: None,
                        ops: Operations {
                            load: LoadOp::Clear(wgpu::Color::BLACK),
                            store: StoreOp::Store,
                        },
                        depth_slice: None,
                    })],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });

                pass.set_pipeline(&self.step.pipeline);
                pass.set_bind_group(0, self.step.lattice.source_bind(self.iteration), &[]);
                pass.set_bind_group(1, &self.step.uniform_bg, &[]);
                pass.draw(0..3, 0..1);
            }

            self.queue.submit(std::iter::once(step_encoder.finish()));
            self.iteration += 1;
        }

        self.draw_display_pass(&view);
        output.present();

        Ok(())
    }

    /// Present the current lattice state without advancing the simulation.
    pub fn render(&self) -> Result<(), wgpu::SurfaceError> {
        let output = self.display.surface.get_current_texture()?;
        let view = output.texture.create_view(&TextureViewDescriptor::default());
        self.draw_display_pass(&view);
        output.present();
        Ok(())
    }

    fn draw_display_pass(&self, view: &wgpu::TextureView) {
        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some("display encoder"),
            });

        {
            let mut pass = encoder.begin_render_pass(&RenderPassDescriptor {
                label: Some("display pass"),
                color_attachments: &[Some(RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: Operations {
                        load: LoadOp::Clear(wgpu::Color {
                            r: 0.1,
                            g: 0.1,
                            b: 0.1,
                            a: 1.0,
                        }),
                        store: StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            pass.set_pipeline(&self.display.pipeline);
            // iteration counts completed sub-steps, so this binds the buffer
            // the last step pass wrote
            pass.set_bind_group(0, self.step.lattice.display_bind(self.iteration), &[]);
            pass.set_bind_group(1, &self.display.uniform_bg, &[]);
            pass.draw(0..3, 0..1);
        }

        self.queue.submit(std::iter::once(encoder.finish()));
    }

    /// Cheap per-frame check: reallocate only when the backing-store size
    /// actually changed.
    pub fn check_resize(&mut self) {
        let size = self.window.inner_size();
        self.resize(size.width, size.height);
    }

    /// Resize the surface and lattice. Resizing resets the simulation: the
    /// lattice is reallocated with fresh random spins and the iteration
    /// counter restarts.
    pub fn resize(&mut self, width: u32, height: u32) {
        let width = width.max(1);
        let height = height.max(1);
        if width == self.display.surface_config.width
            && height == self.display.surface_config.height
        {
            return;
        }
        log::info!("Resizing lattice to {width}x{height}");
        self.display.surface_config.width = width;
        self.display.surface_config.height = height;
        self.display
            .surface
            .configure(&self.device, &self.display.surface_config);
        self.step
            .lattice
            .resize(&self.device, &self.queue, width, height);
        self.iteration = 0;
        self.substep_accumulator = 0.0;
    }

    /// Reconfigure the surface at its current size (after a lost/outdated
    /// surface).
    pub fn reconfigure_surface(&self) {
        self.display
            .surface
            .configure(&self.device, &self.display.surface_config);
    }
}

impl Drop for GpuLatticeRenderer {
    fn drop(&mut self) {
        // Textures are destroyed eagerly; everything else drops with its
        // handle.
        self.step.lattice.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_speed_runs_no_steps_and_drops_backlog() {
        let mut acc = 3.7;
        assert_eq!(substeps_for_frame(&mut acc, 16.0, 0.0), 0);
        assert_eq!(acc, 0.0);
    }

    #[test]
    fn unit_speed_matches_base_rate() {
        // One second at speed 1.0 owes exactly BASE_STEPS_PER_SECOND steps.
        let mut acc = 0.0;
        assert_eq!(substeps_for_frame(&mut acc, 1000.0, 1.0), 60);
        assert!(acc.abs() < 1e-9);
    }

    #[test]
    fn fractional_speed_accumulates_across_frames() {
        // 31.25 ms frames at speed 0.5 owe exactly 0.9375 sub-steps each;
        // every quantity stays dyadic, so the arithmetic is exact.
        let mut acc = 0.0;
        let mut total = 0;
        for _ in 0..16 {
            total += substeps_for_frame(&mut acc, 31.25, 0.5);
        }
        assert_eq!(total, 15);
        assert_eq!(acc, 0.0);
    }

    #[test]
    fn lag_spike_is_capped() {
        let mut acc = 0.0;
        let steps = substeps_for_frame(&mut acc, 10_000.0, 5.0);
        assert_eq!(steps, MAX_SUBSTEPS_PER_FRAME);
        // The backlog is discarded, not owed to later frames.
        assert!(acc < 1.0);
    }
}
