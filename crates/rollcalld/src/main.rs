use anyhow::{Context, Result};
use rollcall_store::{SealKey, Store};
use tracing_subscriber::EnvFilter;

mod attendance;
mod config;
mod dbus_interface;
mod engine;

use config::{BusKind, Config};

const BUS_NAME: &str = "org.rollcall.Attendance1";
const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let config = Config::load()?;

    let pipeline = engine::OnnxPipeline::load(&config.scrfd_model_path(), &config.arcface_model_path())
        .context("failed to load face models")?;

    let camera = match &config.camera_device {
        Some(device) => match rollcall_hw::Camera::open(device, config.capture_width, config.capture_height) {
            Ok(cam) => {
                tracing::info!(
                    device = %device,
                    width = cam.width,
                    height = cam.height,
                    format = ?cam.pixel_format(),
                    "camera opened"
                );
                Some(cam)
            }
            Err(e) => {
                tracing::warn!(device = %device, error = %e, "camera unavailable; photo uploads only");
                None
            }
        },
        None => {
            tracing::info!("no camera configured; photo uploads only");
            None
        }
    };

    let engine = engine::spawn_engine(pipeline, camera, config.warmup_frames)?;

    let key = SealKey::load_or_create(&config.key_path).context("failed to load embedding key")?;
    let store = Store::open(&config.db_path, key)
        .await
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;
    tracing::info!(db = %config.db_path.display(), photos = %config.photo_dir.display(), "store opened");

    let bus = config.bus;
    let service = dbus_interface::AttendanceService::new(attendance::Attendance::new(engine, store, config));

    let builder = match bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .with_context(|| format!("failed to register {BUS_NAME} on the {bus:?} bus"))?;

    tracing::info!(bus = ?bus, name = BUS_NAME, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
