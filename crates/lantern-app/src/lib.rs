//! Application framework for the Lantern renderer.
//!
//! This crate handles the boilerplate around `lantern-gpu`:
//! - Window creation and the winit event loop
//! - GPU context initialization from [`lantern_gpu::GpuConfig`]
//! - The frame loop: acquire, upload, record, transfer submit, graphics
//!   submit, present and deferred destruction
//!
//! # Example
//!
//! ```no_run
//! use lantern_app::{run_app, AppConfig, AppContext, FrameContext, LanternApp};
//!
//! struct MyApp;
//!
//! impl LanternApp for MyApp {
//!     fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         Ok(MyApp)
//!     }
//!
//!     fn update(&mut self, ctx: &AppContext, dt: f32) {}
//!
//!     fn render(&mut self, ctx: &AppContext, frame: &FrameContext) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<MyApp>(AppConfig::default())
//! }
//! ```

mod app;
mod context;
mod frame;
mod runner;

pub use app::LanternApp;
pub use context::AppContext;
pub use frame::FrameContext;
pub use runner::{init_logging, run_app, AppConfig};

pub use lantern_gpu::{GpuConfig, GpuContext};
pub use winit::event::{DeviceEvent, DeviceId, WindowEvent};
