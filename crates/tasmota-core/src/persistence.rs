//! Device persistence using JSON file storage

use crate::device::Device;
use std::path::Path;
use tokio::fs;

/// Load devices from a JSON file.
///
/// Armed timers are not restored; they only live as long as the process.
pub async fn load_devices(path: &Path) -> Vec<Device> {
    match fs::read_to_string(path).await {
        Ok(contents) => match serde_json::from_str::<Vec<Device>>(&contents) {
            Ok(mut devices) => {
                for device in &mut devices {
                    if !device.timers.is_empty() {
                        tracing::info!(
                            "Dropping {} stale timer(s) for device {}",
                            device.timers.len(),
                            device.mqtt_topic
                        );
                        device.timers.clear();
                    }
                    device.online = false;
                }
                tracing::info!("Loaded {} devices from {:?}", devices.len(), path);
                devices
            }
            Err(e) => {
                tracing::warn!("Failed to parse devices file {:?}: {}", path, e);
                Vec::new()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No devices file found at {:?}, starting fresh", path);
            Vec::new()
        }
        Err(e) => {
            tracing::warn!("Failed to read devices file {:?}: {}", path, e);
            Vec::new()
        }
    }
}

/// Save devices to a JSON file atomically
#[allow(clippy::missing_errors_doc)]
pub async fn save_devices(path: &Path, devices: &[Device]) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let json = serde_json::to_string_pretty(devices)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    // Write to a temp file, then rename over the old one
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, &json).await?;
    fs::rename(&tmp_path, path).await?;

    tracing::debug!("Saved {} devices to {:?}", devices.len(), path);
    Ok(())
}
