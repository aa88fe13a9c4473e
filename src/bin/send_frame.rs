//! Diagnostic sender: pushes one image file to a relay server as a frame.
//!
//! Usage: send_frame <addr> <image-file> <camera-id>

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

use percept_relay::client::DataClient;
use percept_relay::frame::{PropValue, PropertyBag};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 4 {
        eprintln!("usage: {} <addr> <image-file> <camera-id>", args[0]);
        std::process::exit(2);
    }
    let addr = &args[1];
    let path = &args[2];
    let camera_id = &args[3];

    let img = image::open(path)
        .with_context(|| format!("failed to open {path}"))?
        .to_rgb8();
    let (width, height) = img.dimensions();

    let mut client = DataClient::new(addr.clone());
    let mut chan = client.connect()?;
    chan.send_image(i64::from(width), i64::from(height), img.as_raw(), "raw")?;

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before epoch")?
        .as_millis() as i64;
    let mut props = PropertyBag::new();
    props.insert("camera_id", PropValue::Str(camera_id.clone()));
    props.insert("timestamp", PropValue::Int(timestamp));
    chan.send_props(&props)?;

    log::info!("sent {width}x{height} frame from {path} to {addr}");
    client.close();
    Ok(())
}
