//! Buffer policy demo.
//!
//! One buffer per policy:
//! - static vertex and index buffers, uploaded once through staging and
//!   patched with `set_sub_data`
//! - a persistent uniform buffer rewritten through its lifetime mapping
//! - a mappable storage buffer filled with `lock`/`unlock`
//! - a resizable history buffer that grows with `resize`

use anyhow::Context as _;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use lantern_app::{AppContext, FrameContext, LanternApp};
use lantern_gpu::{
    BufferHandle, BufferKind, BufferPolicy, BufferRegistry, GpuBuffer, IndexFormat, VertexLayout,
};
use tracing::{debug, info};

const PARTICLES: usize = 256;
const HISTORY_INTERVAL: u64 = 30;
const HISTORY_LIMIT: u64 = 64 * 1024;
const VERTEX_PATCH_INTERVAL: u64 = 120;
const STATIC_LOCK_INTERVAL: u64 = 240;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
struct Vertex {
    position: [f32; 3],
    color: [f32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct FrameUniforms {
    time: f32,
    frame: u32,
    width: u32,
    height: u32,
}

const TRIANGLE: [Vertex; 3] = [
    Vertex {
        position: [0.0, -0.5, 0.0],
        color: [1.0, 0.2, 0.2],
    },
    Vertex {
        position: [0.5, 0.5, 0.0],
        color: [0.2, 1.0, 0.2],
    },
    Vertex {
        position: [-0.5, 0.5, 0.0],
        color: [0.2, 0.2, 1.0],
    },
];

type Handle = BufferHandle;

/// Demo state.
pub struct BufferDemo {
    buffers: BufferRegistry<GpuBuffer>,
    vertices: Handle,
    uniforms: Handle,
    particles: Handle,
    history: Handle,
    history_len: u64,
    time: f32,
    uploads: u64,
}

impl BufferDemo {
    fn color(&self) -> [f32; 4] {
        let pulse = 0.5 + 0.5 * (self.time * 0.7).sin();
        let vertex = TRIANGLE[(self.uploads / VERTEX_PATCH_INTERVAL) as usize % TRIANGLE.len()];
        [
            vertex.color[0] * pulse,
            vertex.color[1] * pulse,
            vertex.color[2] * pulse,
            1.0,
        ]
    }
}

impl LanternApp for BufferDemo {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        let mut buffers = BufferRegistry::new();
        let layout = VertexLayout::new(std::mem::size_of::<Vertex>() as u32)
            .attribute(0, vk::Format::R32G32B32_SFLOAT, 0)
            .attribute(1, vk::Format::R32G32B32_SFLOAT, 12);

        let vertices = buffers.create(
            BufferKind::Vertex(layout),
            BufferPolicy::Static,
            "triangle vertices",
        );
        let indices = buffers.create(
            BufferKind::Index(IndexFormat::U16),
            BufferPolicy::Static,
            "triangle indices",
        );
        let uniforms =
            buffers.create(BufferKind::Uniform, BufferPolicy::Persistent, "frame uniforms");
        let particles = buffers.create(BufferKind::Storage, BufferPolicy::Mappable, "particles");
        let history = buffers.create(BufferKind::Storage, BufferPolicy::Resizable, "frame history");

        let mut device = ctx.buffer_device();
        buffers
            .get_mut(vertices)
            .context("vertex buffer missing")?
            .set_slice(&mut device, &TRIANGLE)?;
        buffers
            .get_mut(indices)
            .context("index buffer missing")?
            .set_slice(&mut device, &[0u16, 1, 2])?;
        buffers
            .get_mut(uniforms)
            .context("uniform buffer missing")?
            .set_data(&mut device, std::mem::size_of::<FrameUniforms>() as u64, None)?;
        buffers
            .get_mut(particles)
            .context("particle buffer missing")?
            .set_data(&mut device, (PARTICLES * 16) as u64, None)?;
        buffers
            .get_mut(history)
            .context("history buffer missing")?
            .set_data(&mut device, 0, None)?;

        // The static upload went through staging; read it back to prove it.
        let uploaded = buffers
            .get_mut(vertices)
            .context("vertex buffer missing")?
            .read_back(&mut device)?;
        anyhow::ensure!(
            uploaded == bytemuck::cast_slice::<Vertex, u8>(&TRIANGLE),
            "static vertex upload did not round-trip"
        );

        buffers.for_each_live(|_, buffer| {
            info!(
                name = buffer.name(),
                policy = ?buffer.policy(),
                size = buffer.size(),
                physical = buffer.physical_size(),
                "Buffer ready"
            );
        });

        Ok(Self {
            buffers,
            vertices,
            uniforms,
            particles,
            history,
            history_len: 0,
            time: 0.0,
            uploads: 0,
        })
    }

    fn update(&mut self, _ctx: &AppContext, dt: f32) {
        self.time += dt;
    }

    fn upload(&mut self, ctx: &mut AppContext) -> anyhow::Result<()> {
        let extent = ctx.extent();
        let frame = ctx.recording_frame();
        let mut device = ctx.buffer_device();
        self.uploads += 1;

        let uniforms = FrameUniforms {
            time: self.time,
            frame: frame as u32,
            width: extent.width,
            height: extent.height,
        };
        let buffer = self.buffers.get_mut(self.uniforms).context("uniform buffer missing")?;
        let bytes = bytemuck::bytes_of(&uniforms);
        buffer.map()?[..bytes.len()].copy_from_slice(bytes);
        buffer.unmap()?;

        let particles = self.buffers.get_mut(self.particles).context("particle buffer missing")?;
        let len = particles.size();
        let slice = particles.lock(&mut device, len)?;
        for (i, chunk) in slice.chunks_exact_mut(16).enumerate() {
            let angle = self.time + i as f32 * std::f32::consts::TAU / PARTICLES as f32;
            let particle = [angle.cos(), angle.sin(), 0.0f32, 1.0];
            chunk.copy_from_slice(bytemuck::cast_slice(&particle));
        }

        // Both locks held at once: the static buffer locks its own staging
        // buffer and leaves the map slot to the particles.
        if self.uploads % STATIC_LOCK_INTERVAL == 0 {
            let vertices = self.buffers.get_mut(self.vertices).context("vertex buffer missing")?;
            let size = vertices.size();
            let slice = vertices.lock(&mut device, size)?;
            slice.copy_from_slice(bytemuck::cast_slice(&TRIANGLE));
            vertices.unlock(&mut device)?;
            debug!("Static vertex buffer rewritten through staging");
        }

        self.buffers
            .get_mut(self.particles)
            .context("particle buffer missing")?
            .unlock(&mut device)?;

        if self.uploads % VERTEX_PATCH_INTERVAL == 0 {
            let index = (self.uploads / VERTEX_PATCH_INTERVAL) as usize % TRIANGLE.len();
            let color = [1.0f32, 1.0, 0.2];
            let offset = (index * std::mem::size_of::<Vertex>() + 12) as u64;
            self.buffers
                .get_mut(self.vertices)
                .context("vertex buffer missing")?
                .set_sub_data(&mut device, offset, bytemuck::cast_slice(&color))?;
        }

        if self.uploads % HISTORY_INTERVAL == 0 && self.history_len < HISTORY_LIMIT {
            let history = self.buffers.get_mut(self.history).context("history buffer missing")?;
            let sample = self.time.to_le_bytes();
            let needed = self.history_len + sample.len() as u64;
            if needed > history.size() {
                let grown = (history.size() * 2).max(64).min(HISTORY_LIMIT);
                let epoch = history.binding_epoch();
                history.resize(&mut device, grown)?;
                debug!(
                    size = grown,
                    epoch = history.binding_epoch(),
                    previous_epoch = epoch,
                    "History buffer grown"
                );
            }
            history.set_sub_data(&mut device, self.history_len, &sample)?;
            self.history_len = needed;
        }

        Ok(())
    }

    fn render(&mut self, ctx: &AppContext, frame: &FrameContext) -> anyhow::Result<()> {
        let device = ctx.gpu.device();
        let range = vk::ImageSubresourceRange::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .level_count(1)
            .layer_count(1);

        let to_transfer = vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(frame.swapchain_image)
            .subresource_range(range);
        let to_present = vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::empty())
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(frame.swapchain_image)
            .subresource_range(range);
        let clear = vk::ClearColorValue {
            float32: self.color(),
        };

        // SAFETY: the command buffer is recording and the image was acquired
        // for this frame.
        unsafe {
            device.cmd_pipeline_barrier(
                frame.command_buffer,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );
            device.cmd_clear_color_image(
                frame.command_buffer,
                frame.swapchain_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &clear,
                &[range],
            );
            device.cmd_pipeline_barrier(
                frame.command_buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_present],
            );
        }
        Ok(())
    }

    fn on_resize(&mut self, _ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        info!(width, height, "Swapchain resized");
        Ok(())
    }

    fn cleanup(&mut self, ctx: &mut AppContext) {
        let mut device = ctx.buffer_device();
        let count = self.buffers.len();
        self.buffers.clear(&mut device);
        info!(count, uploads = self.uploads, history = self.history_len, "Buffers released");
    }
}
