// =============================================================================
// RENDERER - owns every GPU object and drives the frame loop
// =============================================================================
//
// OWNERSHIP (fields drop top to bottom):
// ┌─────────────────────────────────────────────────────────────────┐
// │  SwapchainResources  command buffers, framebuffers, pipeline,   │
// │                      render pass, depth image                   │
// │  SceneResources      vertex/index buffers, texture, uniforms,   │
// │                      descriptor set                             │
// │  FrameSync           image-available / render-finished          │
// │  CommandPool                                                    │
// │  Swapchain                                                      │
// │  VulkanDevice (Arc)  device, surface, instance                  │
// └─────────────────────────────────────────────────────────────────┘
//
// A rebuild waits for the device to go idle, drops SwapchainResources,
// creates a new swapchain from the old one, then records everything again.

use anyhow::{Context, Result};
use ash::vk;
use std::mem::size_of;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use winit::window::Window;

use crate::backend::descriptor::SceneDescriptors;
use crate::backend::image::{GpuImage, Texture};
use crate::backend::physical::DeviceRequirements;
use crate::backend::pipeline::{create_framebuffers, GraphicsPipeline, RenderPass};
use crate::backend::shader::{watch_dirs, ShaderCode, ShaderModule, ShaderWatcher};
use crate::backend::sync::FrameSync;
use crate::backend::upload::{upload_buffer, StagedBuffer, Uploader};
use crate::backend::{CommandPool, GpuBuffer, Swapchain, VulkanDevice};
use crate::config::{AssetConfig, Config};
use crate::frame::{Acquired, FrameBackend, FrameLoop, FrameStatus};
use crate::scene::{Mesh, UniformBufferObject, Vertex};

// =============================================================================
// SCENE RESOURCES (live as long as the renderer)
// =============================================================================

struct SceneResources {
    descriptors: SceneDescriptors,
    uniforms: StagedBuffer<GpuBuffer>,
    _texture: Texture,
    index_buffer: GpuBuffer,
    vertex_buffer: GpuBuffer,
    index_count: u32,
}

impl SceneResources {
    fn load(device: &Arc<VulkanDevice>, commands: &CommandPool, assets: &AssetConfig) -> Result<Self> {
        let mesh = Mesh::load_obj(&assets.model)?;
        let pixels = load_texture(&assets.texture)?;

        let mut uploader = Uploader::new(device, commands);

        let vertex_buffer = upload_buffer(
            &mut uploader,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            bytemuck::cast_slice(&mesh.vertices),
        )
        .context("Failed to upload vertex buffer")?;
        let index_buffer = upload_buffer(
            &mut uploader,
            vk::BufferUsageFlags::INDEX_BUFFER,
            bytemuck::cast_slice(&mesh.indices),
        )
        .context("Failed to upload index buffer")?;
        let texture = Texture::upload(&mut uploader, &pixels).context("Failed to upload texture")?;

        let uniform_size = size_of::<UniformBufferObject>() as vk::DeviceSize;
        let uniforms = StagedBuffer::new(&mut uploader, uniform_size, vk::BufferUsageFlags::UNIFORM_BUFFER)
            .context("Failed to create uniform buffer")?;

        let descriptors = SceneDescriptors::new(device)?;
        descriptors.write(
            uniforms.buffer.buffer,
            uniform_size,
            texture.image.view,
            texture.sampler,
        );

        Ok(Self {
            descriptors,
            uniforms,
            _texture: texture,
            index_buffer,
            vertex_buffer,
            index_count: mesh.indices.len() as u32,
        })
    }
}

fn load_texture(path: &Path) -> Result<image::RgbaImage> {
    let pixels = image::open(path)
        .with_context(|| format!("Failed to load texture {:?}", path))?
        .to_rgba8();
    log::info!("Loaded texture {:?}: {}x{}", path, pixels.width(), pixels.height());
    Ok(pixels)
}

// =============================================================================
// SWAPCHAIN RESOURCES (rebuilt with the swapchain)
// =============================================================================

struct SwapchainResources {
    command_buffers: Vec<vk::CommandBuffer>,
    framebuffers: Vec<vk::Framebuffer>,
    pipeline: GraphicsPipeline,
    render_pass: RenderPass,
    _depth: GpuImage,
    command_pool: vk::CommandPool,
    device: Arc<VulkanDevice>,
}

impl SwapchainResources {
    fn new(
        device: &Arc<VulkanDevice>,
        commands: &CommandPool,
        swapchain: &Swapchain,
        scene: &SceneResources,
        shaders: &ShaderCode,
        config: &Config,
    ) -> Result<Self> {
        let depth = GpuImage::depth(device, swapchain.extent)?;
        let render_pass = RenderPass::new(device, swapchain.format)?;

        let vert = ShaderModule::new(device, &shaders.vert)?;
        let frag = ShaderModule::new(device, &shaders.frag)?;
        let pipeline = GraphicsPipeline::new(
            device,
            render_pass.render_pass,
            swapchain.extent,
            vert.module,
            frag.module,
            &Vertex::layout(),
            scene.descriptors.layout,
        )?;

        let framebuffers = create_framebuffers(
            device,
            &swapchain.image_views,
            depth.view,
            render_pass.render_pass,
            swapchain.extent,
        )?;

        let mut this = Self {
            command_buffers: Vec::new(),
            framebuffers,
            pipeline,
            render_pass,
            _depth: depth,
            command_pool: commands.pool,
            device: device.clone(),
        };

        this.command_buffers = commands.allocate(swapchain.images.len() as u32)?;
        this.record(swapchain.extent, scene, config.graphics.clear_color)?;

        log::info!("Recorded {} command buffers", this.command_buffers.len());
        Ok(this)
    }

    /// Pre-record one command buffer per swapchain image. The scene never
    /// changes shape, so these are replayed until the next rebuild.
    fn record(&self, extent: vk::Extent2D, scene: &SceneResources, clear_color: [f32; 4]) -> Result<()> {
        let device = &self.device.device;

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue { float32: clear_color },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];

        for (&cmd, &framebuffer) in self.command_buffers.iter().zip(&self.framebuffers) {
            let begin_info = vk::CommandBufferBeginInfo::builder();
            let render_pass_info = vk::RenderPassBeginInfo::builder()
                .render_pass(self.render_pass.render_pass)
                .framebuffer(framebuffer)
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent,
                })
                .clear_values(&clear_values);

            unsafe {
                device
                    .begin_command_buffer(cmd, &begin_info)
                    .context("Failed to begin command buffer")?;

                device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline.pipeline);
                device.cmd_bind_vertex_buffers(cmd, 0, &[scene.vertex_buffer.buffer], &[0]);
                device.cmd_bind_index_buffer(cmd, scene.index_buffer.buffer, 0, vk::IndexType::UINT32);
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.pipeline.layout,
                    0,
                    &[scene.descriptors.set],
                    &[],
                );
                device.cmd_draw_indexed(cmd, scene.index_count, 1, 0, 0, 0);
                device.cmd_end_render_pass(cmd);

                device
                    .end_command_buffer(cmd)
                    .context("Failed to end command buffer")?;
            }
        }

        Ok(())
    }
}

impl Drop for SwapchainResources {
    fn drop(&mut self) {
        unsafe {
            if !self.command_buffers.is_empty() {
                self.device
                    .device
                    .free_command_buffers(self.command_pool, &self.command_buffers);
            }
            for &framebuffer in &self.framebuffers {
                self.device.device.destroy_framebuffer(framebuffer, None);
            }
        }
        // pipeline, render pass and depth image follow in field order
    }
}

// =============================================================================
// RENDER CONTEXT
// =============================================================================

pub struct RenderContext {
    resources: Option<SwapchainResources>,
    scene: SceneResources,
    shaders: ShaderCode,
    sync: FrameSync,
    commands: CommandPool,
    swapchain: Swapchain,
    shader_watcher: Option<ShaderWatcher>,
    config: Config,
    start: Instant,
    device: Arc<VulkanDevice>,
    window: Arc<Window>,
}

fn window_extent(window: &Window) -> vk::Extent2D {
    let size = window.inner_size();
    vk::Extent2D {
        width: size.width,
        height: size.height,
    }
}

impl RenderContext {
    fn new(window: Arc<Window>, config: Config) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        let requirements = DeviceRequirements {
            discrete_gpu: config.graphics.require_discrete_gpu,
            geometry_shader: config.graphics.require_geometry_shader,
        };
        let device = VulkanDevice::new(
            &config.window.title,
            &window,
            config.validation_enabled(),
            &requirements,
        )?;

        let swapchain = Swapchain::new(
            device.clone(),
            window_extent(&window),
            config.preferred_present_mode(),
            None,
        )?;
        let commands = CommandPool::new(&device)?;
        let sync = FrameSync::new(&device)?;
        let scene = SceneResources::load(&device, &commands, &config.assets)?;

        let shaders = ShaderCode::load(&config.assets.vertex_shader, &config.assets.fragment_shader)?;

        let shader_watcher = if config.debug.hot_reload_shaders {
            let dirs = watch_dirs([
                config.assets.vertex_shader.as_path(),
                config.assets.fragment_shader.as_path(),
            ]);
            match ShaderWatcher::new(&dirs) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    log::warn!("Shader hot reload disabled: {:#}", e);
                    None
                }
            }
        } else {
            None
        };

        let resources =
            SwapchainResources::new(&device, &commands, &swapchain, &scene, &shaders, &config)?;

        log::info!("Vulkan initialized successfully!");
        Ok(Self {
            resources: Some(resources),
            scene,
            shaders,
            sync,
            commands,
            swapchain,
            shader_watcher,
            config,
            start: Instant::now(),
            device,
            window,
        })
    }
}

impl FrameBackend for RenderContext {
    fn update(&mut self) -> Result<()> {
        let ubo = UniformBufferObject::spinning(
            self.start.elapsed().as_secs_f32(),
            self.swapchain.aspect_ratio(),
        );
        let mut uploader = Uploader::new(&self.device, &self.commands);
        self.scene.uniforms.update(&mut uploader, bytemuck::bytes_of(&ubo))
    }

    fn acquire(&mut self, signal: vk::Semaphore) -> Result<Acquired> {
        Ok(match self.swapchain.acquire_next_image(u64::MAX, signal)? {
            Some((index, suboptimal)) => Acquired::Image { index, suboptimal },
            None => Acquired::OutOfDate,
        })
    }

    fn submit(
        &mut self,
        image_index: u32,
        wait: vk::Semaphore,
        wait_stage: vk::PipelineStageFlags,
        signal: vk::Semaphore,
    ) -> Result<()> {
        let resources = self
            .resources
            .as_ref()
            .context("Swapchain resources not initialized")?;
        let cmd = *resources
            .command_buffers
            .get(image_index as usize)
            .context("Acquired image has no command buffer")?;

        let wait_semaphores = [wait];
        let wait_stages = [wait_stage];
        let signal_semaphores = [signal];
        let command_buffers = [cmd];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info.build()],
                vk::Fence::null(),
            )
        }
        .context("Failed to submit draw command buffer")
    }

    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> Result<bool> {
        let stale = self
            .swapchain
            .present(self.device.present_queue, image_index, &[wait])?;

        // There is one semaphore pair, so the next frame cannot start until
        // this presentation has consumed it
        unsafe { self.device.device.queue_wait_idle(self.device.present_queue) }
            .context("Failed to wait for present queue")?;

        Ok(stale)
    }

    fn stage_shaders(&mut self) -> Result<()> {
        self.shaders = ShaderCode::load(
            &self.config.assets.vertex_shader,
            &self.config.assets.fragment_shader,
        )?;
        log::info!("Shaders reloaded");
        Ok(())
    }

    fn rebuild(&mut self) -> Result<()> {
        self.device.wait_idle()?;

        let extent = window_extent(&self.window);
        log::info!("Rebuilding swapchain: {}x{}", extent.width, extent.height);

        self.resources = None;

        let swapchain = Swapchain::new(
            self.device.clone(),
            extent,
            self.config.preferred_present_mode(),
            Some(&self.swapchain),
        )?;
        // Retires the old swapchain
        self.swapchain = swapchain;

        self.resources = Some(SwapchainResources::new(
            &self.device,
            &self.commands,
            &self.swapchain,
            &self.scene,
            &self.shaders,
            &self.config,
        )?);
        Ok(())
    }
}

// =============================================================================
// RENDERER
// =============================================================================

pub struct Renderer {
    frames: FrameLoop,
    context: RenderContext,
}

impl Renderer {
    pub fn new(window: Arc<Window>, config: Config) -> Result<Self> {
        Ok(Self {
            frames: FrameLoop::new(),
            context: RenderContext::new(window, config)?,
        })
    }

    /// Window resized or switched to/from fullscreen
    pub fn request_rebuild(&mut self) {
        self.frames.request_rebuild();
    }

    /// Render one frame. Returns false when nothing was presented
    /// (minimized window or a dropped out-of-date frame).
    pub fn render(&mut self) -> Result<bool> {
        let extent = window_extent(&self.context.window);
        if extent.width == 0 || extent.height == 0 {
            return Ok(false);
        }

        if let Some(watcher) = &self.context.shader_watcher {
            if watcher.take_changed() {
                self.frames.request_shader_reload();
            }
        }

        let semaphores = self.context.sync.semaphores();
        let status = self.frames.draw_frame(&mut self.context, semaphores)?;
        Ok(status == FrameStatus::Presented)
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.context.device.wait_idle()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!(
            "Cleaning up Vulkan resources after {} frames...",
            self.frames.frames_presented()
        );
        // Nothing may be in flight while the fields below are destroyed
        if let Err(e) = self.context.device.wait_idle() {
            log::error!("Failed to wait for device idle: {:#}", e);
        }
    }
}
