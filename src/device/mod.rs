//! DRM device discovery
//!
//! Finds the card a compositor on this seat would render on: enumerate
//! drm/card*, keep devices assigned to the seat (ID_SEAT, defaulting to
//! seat0), and prefer the PCI boot VGA adapter over other cards.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use log::{debug, info};

pub const DEFAULT_SEAT: &str = "seat0";

pub fn find_primary_gpu(seat: &str) -> Result<PathBuf> {
    let mut enumerator = udev::Enumerator::new().context("Failed to create udev enumerator")?;
    enumerator
        .match_subsystem("drm")
        .context("Failed to match drm subsystem")?;
    enumerator
        .match_sysname("card[0-9]*")
        .context("Failed to match card sysname")?;

    let mut fallback: Option<PathBuf> = None;
    for device in enumerator
        .scan_devices()
        .context("Failed to scan drm devices")?
    {
        let device_seat = device
            .property_value("ID_SEAT")
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_SEAT.to_string());
        if device_seat != seat {
            continue;
        }
        let node = match device.devnode() {
            Some(node) => node.to_path_buf(),
            None => continue,
        };
        // The boot VGA adapter wins outright
        if let Ok(Some(pci)) = device.parent_with_subsystem("pci") {
            let boot_vga = pci
                .attribute_value("boot_vga")
                .map(|v| v == "1")
                .unwrap_or(false);
            if boot_vga {
                info!("Primary GPU: {} (boot VGA)", node.display());
                return Ok(node);
            }
        }
        debug!("GPU candidate: {}", node.display());
        fallback.get_or_insert(node);
    }

    match fallback {
        Some(node) => {
            info!("Primary GPU: {}", node.display());
            Ok(node)
        }
        None => Err(anyhow!("no DRM device found on seat {}", seat)),
    }
}
