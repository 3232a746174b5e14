//! Event loop and frame loop.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use ash::vk;
use lantern_gpu::command::{self, Submission};
use lantern_gpu::{FrameStatus, GpuConfig, GpuContextBuilder, Platform, SkipReason};
use lantern_platform::{WindowConfig, WindowPlatform};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
#[cfg(feature = "profiling-tracy")]
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use winit::application::ApplicationHandler;
use winit::event::{DeviceEvent, DeviceId, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::WindowId;

use crate::app::LanternApp;
use crate::context::AppContext;
use crate::frame::FrameContext;

/// Presented frames between memory reports under `--mem-stats`.
const MEMORY_STATS_INTERVAL: u64 = 600;

/// Window, pacing and renderer settings for [`run_app`].
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub window: WindowConfig,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
    pub gpu: GpuConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            window: WindowConfig::default(),
            target_fps: None,
            gpu: GpuConfig::default(),
        }
    }
}

impl AppConfig {
    /// Config with `title` used for both the window and the Vulkan app name.
    pub fn new(title: impl Into<String>) -> Self {
        let title = title.into();
        Self {
            gpu: GpuConfig::new(title.clone()),
            window: WindowConfig {
                title,
                ..WindowConfig::default()
            },
            ..Self::default()
        }
    }

    /// Set the window dimensions.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.window.width = width;
        self.window.height = height;
        self
    }

    /// Set the target FPS.
    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    /// Replace the renderer settings.
    pub fn with_gpu(mut self, gpu: GpuConfig) -> Self {
        self.gpu = gpu;
        self
    }
}

/// Install the `tracing` subscriber used by Lantern binaries.
///
/// `RUST_LOG` overrides the default `info` filter. With `profiling-tracy`
/// spans are also streamed to Tracy. Calling this twice is harmless.
pub fn init_logging() {
    #[cfg(feature = "profiling-tracy")]
    {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,lantern_app=trace,lantern_gpu=trace,lantern_viewer=trace")
        });
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .with(tracing_tracy::TracyLayer::default())
            .try_init();
    }
    #[cfg(not(feature = "profiling-tracy"))]
    {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .try_init();
    }
}

/// Run a `LanternApp` with the given configuration.
///
/// Creates the window and GPU context and runs the event loop until the
/// application exits.
pub fn run_app<A: LanternApp + 'static>(config: AppConfig) -> anyhow::Result<()> {
    init_logging();
    info!("{} starting...", config.window.title);

    let event_loop = EventLoop::new().context("failed to create event loop")?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        state: None,
        failure: None,
    };

    event_loop
        .run_app(&mut runner)
        .context("event loop terminated abnormally")?;

    match runner.failure {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

/// Internal application runner that implements winit's `ApplicationHandler`.
struct AppRunner<A: LanternApp> {
    config: AppConfig,
    state: Option<AppState<A>>,
    failure: Option<anyhow::Error>,
}

struct AppState<A: LanternApp> {
    ctx: AppContext,
    app: A,
    target_frame_time: Option<Duration>,
    skipped_frames: u64,
}

impl<A: LanternApp + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready");
            }
            Err(e) => {
                error!("Failed to initialize application: {e:#}");
                self.failure = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        if let Some(state) = &mut self.state {
            if state.app.on_event(&event) {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                if let Some(mut state) = self.state.take() {
                    state.shutdown();
                }
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                if let Some(state) = &mut self.state {
                    if let Err(e) = state.render_frame() {
                        error!("Render error: {e:#}");
                        if let Some(mut state) = self.state.take() {
                            state.shutdown();
                        }
                        self.failure = Some(e);
                        event_loop.exit();
                    }
                }
            }
            // The swapchain manager notices the new size on the next acquire.
            WindowEvent::Resized(size) => debug!(width = size.width, height = size.height, "Window resized"),
            _ => {}
        }
    }

    fn device_event(
        &mut self,
        _event_loop: &ActiveEventLoop,
        device_id: DeviceId,
        event: DeviceEvent,
    ) {
        if let Some(state) = &mut self.state {
            state.app.on_device_event(device_id, &event);
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.ctx.platform.window().request_redraw();
        }
    }
}

impl<A: LanternApp + 'static> AppRunner<A> {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        let platform = WindowPlatform::create(event_loop, &self.config.window)?;

        let gpu = GpuContextBuilder::new()
            .config(&self.config.gpu)
            .build(Some(&platform as &dyn Platform))?;

        let mut ctx = AppContext::new(platform, gpu, self.config.gpu.clone())?;
        let app = A::init(&mut ctx)?;

        let target_frame_time = self
            .config
            .target_fps
            .filter(|&fps| fps > 0)
            .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps)));

        Ok(AppState {
            ctx,
            app,
            target_frame_time,
            skipped_frames: 0,
        })
    }
}

impl<A: LanternApp> AppState<A> {
    /// One frame: begin → reap → update → acquire → upload → record →
    /// transfer submit → graphics submit → present.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn render_frame(&mut self) -> anyhow::Result<()> {
        let frame_start = Instant::now();
        let dt = frame_start
            .duration_since(self.ctx.last_frame_time)
            .as_secs_f32();
        self.ctx.last_frame_time = frame_start;

        // SAFETY: the device is valid.
        let frame_number = unsafe { self.ctx.sync.begin_frame(self.ctx.gpu.device()) }?;
        let result = self.record_and_present(frame_number, dt);
        self.ctx.sync.end_frame();
        result?;

        if let Some(target) = self.target_frame_time {
            let elapsed = frame_start.elapsed();
            if elapsed < target {
                thread::sleep(target - elapsed);
            }
        }
        Ok(())
    }

    fn record_and_present(&mut self, frame_number: u64, dt: f32) -> anyhow::Result<()> {
        #[cfg(feature = "profiling-tracy")]
        let _frame_span = tracing::trace_span!("frame.sections", frame_number).entered();

        self.ctx.reap()?;
        self.ctx.transfer.poll()?;

        self.app.update(&self.ctx, dt);

        let (width, height) = self.ctx.platform.drawable_size();
        let generation = self.ctx.swapchain.generation();
        let image_available = self.ctx.sync.current().image_available;
        let status = self.ctx.swapchain.acquire_image(
            width,
            height,
            self.ctx.config.vsync,
            self.ctx.config.hdr,
            image_available,
        )?;

        let (image_index, suboptimal) = match status {
            FrameStatus::Ready {
                image_index,
                suboptimal,
            } => (image_index, suboptimal),
            FrameStatus::Skipped(reason) => {
                self.skipped_frames += 1;
                if reason != SkipReason::ZeroExtent {
                    debug!(?reason, frame_number, "Frame skipped");
                }
                return Ok(());
            }
        };

        self.ctx.sync_render_finished()?;
        if self.ctx.swapchain.generation() != generation {
            let extent = self.ctx.extent();
            self.app
                .on_resize(&mut self.ctx, extent.width, extent.height)?;
        }

        self.app.upload(&mut self.ctx)?;

        let slot = self.ctx.sync.current_slot();
        let cmd = self.ctx.command_buffers[slot];
        let chain = self
            .ctx
            .swapchain
            .chain()
            .context("acquired an image without a swapchain")?;
        let frame = FrameContext {
            command_buffer: cmd,
            image_index,
            swapchain_image: chain.images[image_index as usize],
            swapchain_view: chain.image_views[image_index as usize],
            extent: chain.extent,
            suboptimal,
            dt,
            frame_number,
        };

        // SAFETY: the slot's fence was waited in `begin_frame`, so its command
        // buffer is no longer in use.
        unsafe {
            command::restart(self.ctx.gpu.device(), cmd)?;
            self.ctx.transfer.record_pending_acquires(cmd);
        }
        self.app.render(&self.ctx, &frame)?;
        // SAFETY: recording started above.
        unsafe { command::finish(self.ctx.gpu.device(), cmd) }?;

        let transfer_done = self.ctx.sync.current().transfer_done;
        let uploaded = self.ctx.transfer.submit(&[transfer_done])?;

        let render_finished = self.ctx.render_finished[image_index as usize];
        let mut submission = Submission::new(cmd)
            .wait(
                image_available,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::TRANSFER,
            )
            .signal(&[render_finished]);
        if uploaded {
            submission = submission.wait(transfer_done, vk::PipelineStageFlags::ALL_COMMANDS);
        }

        // SAFETY: all handles belong to this device; the fence was waited.
        unsafe {
            let fence = self.ctx.sync.take_submit_fence(self.ctx.gpu.device())?;
            submission
                .fence(fence)
                .submit(self.ctx.gpu.device(), self.ctx.gpu.graphics_queue())?;
        }

        self.ctx.swapchain.present(image_index, &[render_finished])?;
        self.ctx.frame_count += 1;
        if self.ctx.config.memory_stats && self.ctx.frame_count % MEMORY_STATS_INTERVAL == 0 {
            self.ctx.log_memory_stats();
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        info!(
            presented = self.ctx.frame_count,
            skipped = self.skipped_frames,
            "Shutting down"
        );
        if let Err(e) = self.ctx.gpu.wait_idle() {
            error!("Failed to wait idle: {e}");
        }
        if self.ctx.config.memory_stats {
            self.ctx.log_memory_stats();
        }
        self.app.cleanup(&mut self.ctx);
        self.ctx.cleanup();
        info!("Cleanup complete");
    }
}
