//! Lantern demo viewer
//!
//! Drives every buffer update policy through the frame loop and clears the
//! swapchain image with a color fed from those buffers.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p lantern-viewer -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--list-devices`: Print the ranked compatible GPUs and exit
//! - `--device <N>`: Use the N-th compatible GPU
//! - `--validation` / `--no-validation`: Toggle the Khronos validation layer
//! - `--vsync` / `--no-vsync`: Toggle vsync
//! - `--hdr`: Prefer an HDR swapchain format
//! - `--mem-stats`: Log GPU memory usage every 600 frames and at exit
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)
//! - `LANTERN_DEVICE`, `LANTERN_VALIDATION`, `LANTERN_VSYNC`, `LANTERN_HDR`,
//!   `LANTERN_MEM_STATS`

mod demo;

use lantern_app::{init_logging, run_app, AppConfig, GpuConfig};

use crate::demo::BufferDemo;

const TITLE: &str = "Lantern - Buffer Policy Demo";
const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;
const TARGET_FPS: u32 = 240;

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    let mut gpu = GpuConfig::new(TITLE).from_env()?;
    let rest = gpu.apply_args(args)?;

    if rest.iter().any(|arg| arg == "--list-devices") {
        init_logging();
        return list_devices();
    }
    if let Some(unknown) = rest.first() {
        anyhow::bail!("unknown argument '{unknown}' (see --help)");
    }

    run_app::<BufferDemo>(
        AppConfig::new(TITLE)
            .with_size(WIDTH, HEIGHT)
            .with_target_fps(TARGET_FPS)
            .with_gpu(gpu),
    )
}

fn list_devices() -> anyhow::Result<()> {
    let devices = lantern_gpu::list_devices()?;
    if devices.is_empty() {
        println!("No compatible Vulkan devices found.");
    }
    for device in devices {
        println!("{:>2}: {} [{}]", device.index, device.name, device.device_type);
        println!("    {}", device.summary);
    }
    Ok(())
}

fn print_help() {
    eprintln!(
        "Lantern buffer policy demo

USAGE:
    cargo run -p lantern-viewer -- [OPTIONS]

OPTIONS:
    --list-devices          Print the ranked compatible GPUs and exit
    --device <N>            Use the N-th compatible GPU (default: 0)
    --validation            Enable the Khronos validation layer
    --no-validation         Disable the Khronos validation layer
    --vsync                 Enable vsync (default)
    --no-vsync              Disable vsync
    --hdr                   Prefer an HDR swapchain format
    --mem-stats             Log GPU memory usage every 600 frames and at exit
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)
    LANTERN_DEVICE          Same as --device
    LANTERN_VALIDATION      1/0, same as --validation
    LANTERN_VSYNC           1/0, same as --vsync
    LANTERN_HDR             1/0, same as --hdr
    LANTERN_MEM_STATS       1/0, same as --mem-stats"
    );
}
