//! robocam: list attached webcams or stream a few frames from one

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use robocam::usb::SysfsBackend;
use robocam::{
    CameraManager, CameraName, CaptureCallback, Config, Deadline, Frame, SerialNumber,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "List attached webcams or stream frames from one")]
struct Args {
    /// TOML file layered over the built-in defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enumerate attached cameras
    List,
    /// Open a webcam by serial number and log frames from it
    Open {
        /// Real serial, or `VendorProduct:VVVV|PPPP[|path]`
        serial: SerialNumber,
        #[arg(default_value_t = 30)]
        frames: u64,
    },
}

/// Logs every frame and wakes the main task once enough have arrived
struct FrameLogger {
    wanted: u64,
    seen: AtomicU64,
    done: Arc<Notify>,
}

impl CaptureCallback for FrameLogger {
    fn on_new_frame(&self, frame: &dyn Frame) {
        let seen = self.seen.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            "frame {} ({} bytes, {} {})",
            frame.frame_number(),
            frame.image_size(),
            frame.size(),
            frame.format()
        );
        if seen == self.wanted {
            self.done.notify_one();
        }
    }

    fn on_session_closed(&self) {
        self.done.notify_one();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.logging.filter))
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();
    robocam::CONFIG.store(Arc::new(config.clone()));

    let backend = Arc::new(SysfsBackend::new(config.usb.sysfs_root.clone()));
    let manager = CameraManager::new(
        backend,
        config.permissions.authority(),
        tokio::runtime::Handle::current(),
    )?;

    match args.command {
        Command::List => {
            let cameras = manager.get_all_cameras();
            if cameras.is_empty() {
                println!("no cameras attached");
            }
            for camera in cameras {
                println!("{camera}");
            }
        }
        Command::Open { serial, frames } => {
            let hotplug = manager.spawn_hotplug_poller(config.usb.hotplug_poll_interval());
            let deadline = Deadline::after(config.manager.open_timeout());
            let camera = manager
                .open_camera(deadline, CameraName::webcam(serial))
                .await?;
            info!("opened {}", camera.name());

            let request = camera.create_capture_request(
                config.capture.format,
                config.capture.size(),
                config.capture.fps,
            )?;
            let session = camera.create_capture_session()?;
            let done = Arc::new(Notify::new());
            session.start_capturing(
                request,
                Arc::new(FrameLogger {
                    wanted: frames.max(1),
                    seen: AtomicU64::new(0),
                    done: Arc::clone(&done),
                }),
            )?;

            tokio::select! {
                _ = done.notified() => info!("captured {} frame(s)", frames),
                _ = tokio::signal::ctrl_c() => warn!("interrupted"),
            }

            session.close();
            camera.close();
            hotplug.abort();
        }
    }

    info!("robocam shutting down");
    Ok(())
}
