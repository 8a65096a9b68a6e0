use wgpu::{
    BindGroup, BindGroupDescriptor, BindGroupEntry, BindGroupLayout, Device, Extent3d, Queue,
    Sampler, Texture, TextureView,
};

use crate::sim::random_spin_texels;
use crate::util::is_power_of_two;

/// Which of the two lattice buffers is read this sub-step.
pub fn source_index(iteration: u32) -> usize {
    (iteration % 2) as usize
}

/// Which of the two lattice buffers is written this sub-step.
pub fn target_index(iteration: u32) -> usize {
    ((iteration + 1) % 2) as usize
}

/// The double-buffered lattice state: two equally-sized textures, one bound
/// as the previous state while the other is the render target, swapped by
/// iteration parity every sub-step.
pub struct LatticeTextures {
    buffers: Option<[LatticeBuffer; 2]>,
    width: u32,
    height: u32,
    step_layout: BindGroupLayout,
    display_layout: BindGroupLayout,
}

struct LatticeBuffer {
    texture: Texture,
    view: TextureView,
    step_bind: BindGroup,
    display_bind: BindGroup,
}

impl LatticeTextures {
    pub fn new(
        device: &Device,
        queue: &Queue,
        step_layout: &BindGroupLayout,
        display_layout: &BindGroupLayout,
        width: u32,
        height: u32,
    ) -> Self {
        let mut store = Self {
            buffers: None,
            width: width.max(1),
            height: height.max(1),
            step_layout: step_layout.clone(),
            display_layout: display_layout.clone(),
        };
        store.allocate(device, queue);
        store
    }

    /// Reallocate at new dimensions with a fresh random lattice. A call with
    /// the current dimensions is a no-op: no textures are touched.
    pub fn resize(&mut self, device: &Device, queue: &Queue, width: u32, height: u32) {
        let width = width.max(1);
        let height = height.max(1);
        if self.buffers.is_some() && width == self.width && height == self.height {
            return;
        }
        self.release();
        self.width = width;
        self.height = height;
        self.allocate(device, queue);
    }

    /// Destroy both textures. Safe to call more than once; later calls no-op.
    pub fn release(&mut self) {
        if let Some(buffers) = self.buffers.take() {
            for buffer in &buffers {
                buffer.texture.destroy();
            }
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Layout shared with the display pipeline.
    pub fn display_layout(&self) -> &BindGroupLayout {
        &self.display_layout
    }

    /// Previous-state bind group for the step pass at the given iteration.
    pub fn source_bind(&self, iteration: u32) -> &BindGroup {
        &self.buffers()[source_index(iteration)].step_bind
    }

    /// Render-target view for the step pass at the given iteration.
    pub fn target_view(&self, iteration: u32) -> &TextureView {
        &self.buffers()[target_index(iteration)].view
    }

    /// Bind group for the display pass; `iteration` counts completed
    /// sub-steps, so this is the texture written most recently (or the seeded
    /// buffer before the first sub-step).
    pub fn display_bind(&self, iteration: u32) -> &BindGroup {
        &self.buffers()[source_index(iteration)].display_bind
    }

    fn buffers(&self) -> &[LatticeBuffer; 2] {
        self.buffers
            .as_ref()
            .expect("lattice textures used after release")
    }

    fn allocate(&mut self, device: &Device, queue: &Queue) {
        let sampler = self.create_sampler(device);
        let a = self.create_buffer(device, &sampler, "lattice buffer A");
        let b = self.create_buffer(device, &sampler, "lattice buffer B");

        // Buffer A carries the initial random spins; B is written by the
        // first step pass before anything reads it.
        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &a.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &random_spin_texels(self.width, self.height),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4 * self.width),
                rows_per_image: Some(self.height),
            },
            Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );

        self.buffers = Some([a, b]);
    }

    fn create_sampler(&self, device: &Device) -> Sampler {
        // Discrete states: nearest filtering only. Repeat addressing needs
        // power-of-two dimensions on the lowest common denominator targets.
        let address_mode = if is_power_of_two(self.width) && is_power_of_two(self.height) {
            wgpu::AddressMode::Repeat
        } else {
            wgpu::AddressMode::ClampToEdge
        };
        device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("lattice sampler"),
            address_mode_u: address_mode,
            address_mode_v: address_mode,
            address_mode_w: address_mode,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        })
    }

    fn create_buffer(&self, device: &Device, sampler: &Sampler, label: &str) -> LatticeBuffer {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let step_bind = device.create_bind_group(&BindGroupDescriptor {
            label: Some("lattice step bind group"),
            layout: &self.step_layout,
            entries: &[BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::TextureView(&view),
            }],
        });

        let display_bind = device.create_bind_group(&BindGroupDescriptor {
            label: Some("lattice display bind group"),
            layout: &self.display_layout,
            entries: &[
                BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::Sampler(sampler),
                },
                BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&view),
                },
            ],
        });

        LatticeBuffer {
            texture,
            view,
            step_bind,
            display_bind,
        }
    }
}

impl Drop for LatticeTextures {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parity_alternates_source_and_target() {
        assert_eq!(source_index(0), 0);
        assert_eq!(target_index(0), 1);
        assert_eq!(source_index(1), 1);
        assert_eq!(target_index(1), 0);
        // Source and target never coincide.
        for i in 0..16 {
            assert_ne!(source_index(i), target_index(i));
        }
    }

    #[test]
    fn source_returns_to_initial_buffer_after_even_step_counts() {
        // After N sub-steps the next source is buffer N % 2.
        assert_eq!(source_index(1000), 0);
        assert_eq!(source_index(999), 1);
    }
}
