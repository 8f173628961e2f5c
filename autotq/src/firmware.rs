//! Firmware image discovery and the flashing boundary.
//!
//! Flashing itself is delegated to the external `esptool` binary through the
//! [`FirmwareFlasher`] trait. This module only locates the image to flash
//! and invokes the tool; post-flash verification is done by the production
//! layer, which re-reads the running version over the protocol.

use {
    crate::error::{Error, Result},
    log::{debug, info, warn},
    serde::{Deserialize, Serialize},
    std::{
        fs,
        path::{Path, PathBuf},
        process::Command,
    },
};

/// Default chip argument passed to esptool.
pub const DEFAULT_CHIP: &str = "esp32s3";

/// Default flash offset for the application image.
pub const DEFAULT_FLASH_OFFSET: &str = "0x0";

/// Default baud rate for the flashing transport (distinct from the
/// protocol's 115200; esptool negotiates its own link).
pub const DEFAULT_FLASH_BAUD: u32 = 460_800;

/// A flashable firmware image on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    /// Version string, normalized (no `v` prefix).
    pub version: String,
    /// Path to the `.bin` image.
    pub path: PathBuf,
    /// Target chip, as esptool names it.
    pub chip: String,
}

/// One downloaded firmware version, as recorded in `manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Version string as published.
    pub version: String,
    /// Image filename, relative to the firmware directory.
    pub file: String,
}

/// Index of downloaded firmware versions kept next to the images.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    /// Known versions, unordered.
    pub firmware: Vec<ManifestEntry>,
}

impl Manifest {
    /// Load `manifest.json` from a firmware directory.
    pub fn load(dir: &Path) -> Result<Self> {
        let raw = fs::read_to_string(dir.join("manifest.json"))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write `manifest.json` back to the firmware directory.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(dir.join("manifest.json"), raw)?;
        Ok(())
    }

    /// Record a version, replacing any existing entry for it.
    pub fn record(&mut self, version: &str, file: &str) {
        self.firmware.retain(|e| e.version != version);
        self.firmware.push(ManifestEntry {
            version: version.to_string(),
            file: file.to_string(),
        });
    }
}

impl FirmwareImage {
    /// Find the newest firmware image in `dir`.
    ///
    /// A `manifest.json` takes precedence when present; otherwise the
    /// directory is scanned for `.bin` files with a version embedded in the
    /// filename (`autotq_firmware_v1.2.3.bin` and similar).
    pub fn discover(dir: &Path) -> Result<Self> {
        if let Ok(manifest) = Manifest::load(dir) {
            if let Some(image) = Self::from_manifest(dir, &manifest) {
                return Ok(image);
            }
            warn!(
                "{}: manifest.json lists no usable image, falling back to directory scan",
                dir.display()
            );
        }
        Self::from_scan(dir)
    }

    fn from_manifest(dir: &Path, manifest: &Manifest) -> Option<Self> {
        manifest
            .firmware
            .iter()
            .filter(|entry| dir.join(&entry.file).is_file())
            .max_by(|a, b| compare_versions(&a.version, &b.version))
            .map(|entry| Self {
                version: crate::protocol::normalize_version(&entry.version).to_string(),
                path: dir.join(&entry.file),
                chip: DEFAULT_CHIP.to_string(),
            })
    }

    fn from_scan(dir: &Path) -> Result<Self> {
        let mut candidates = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "bin") {
                if let Some(version) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(version_from_filename)
                {
                    candidates.push((version, path));
                }
            }
        }
        candidates
            .into_iter()
            .max_by(|a, b| compare_versions(&a.0, &b.0))
            .map(|(version, path)| {
                debug!("selected firmware {version} at {}", path.display());
                Self {
                    version,
                    path,
                    chip: DEFAULT_CHIP.to_string(),
                }
            })
            .ok_or_else(|| {
                Error::Config(format!(
                    "no firmware image found in {}",
                    dir.display()
                ))
            })
    }
}

/// Extract a dotted version from a filename stem, e.g.
/// `autotq_firmware_v1.2.3` -> `1.2.3`.
fn version_from_filename(stem: &str) -> Option<String> {
    for token in stem.split(['_', '-']) {
        let token = crate::protocol::normalize_version(token);
        if !token.is_empty()
            && token.contains('.')
            && token.chars().all(|c| c.is_ascii_digit() || c == '.')
        {
            return Some(token.to_string());
        }
    }
    None
}

/// Compare dotted version strings numerically, component by component.
/// Non-numeric components compare lexically, which is good enough for the
/// `1.2.3` shapes the release pipeline produces.
#[must_use]
pub fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let a = crate::protocol::normalize_version(a);
    let b = crate::protocol::normalize_version(b);
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return std::cmp::Ordering::Equal,
            (None, Some(_)) => return std::cmp::Ordering::Less,
            (Some(_), None) => return std::cmp::Ordering::Greater,
            (Some(l), Some(r)) => {
                let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(ln), Ok(rn)) => ln.cmp(&rn),
                    _ => l.cmp(r),
                };
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            },
        }
    }
}

/// Something that can put a firmware image onto the device behind a port.
///
/// The production worker only cares about success or failure; how the bytes
/// get into flash is this trait's business.
pub trait FirmwareFlasher: Send + Sync {
    /// Flash `image` to the device on `port`. Blocks until the tool exits.
    fn flash(&self, port: &str, image: &FirmwareImage) -> Result<()>;
}

/// Flasher that shells out to the `esptool` binary.
#[derive(Debug, Clone)]
pub struct EsptoolFlasher {
    /// Tool executable; a bare name resolves through `PATH`.
    pub esptool: PathBuf,
    /// Link baud rate for the flash transfer.
    pub baud: u32,
    /// Flash offset for the application image.
    pub offset: String,
}

impl Default for EsptoolFlasher {
    fn default() -> Self {
        Self {
            esptool: PathBuf::from("esptool"),
            baud: DEFAULT_FLASH_BAUD,
            offset: DEFAULT_FLASH_OFFSET.to_string(),
        }
    }
}

impl FirmwareFlasher for EsptoolFlasher {
    fn flash(&self, port: &str, image: &FirmwareImage) -> Result<()> {
        info!(
            "{port}: flashing {} ({}) via esptool",
            image.version,
            image.path.display()
        );
        let output = Command::new(&self.esptool)
            .arg("--chip")
            .arg(&image.chip)
            .arg("--port")
            .arg(port)
            .arg("--baud")
            .arg(self.baud.to_string())
            .arg("write_flash")
            .arg(&self.offset)
            .arg(&image.path)
            .output()
            .map_err(|e| Error::FlashTool(format!("failed to launch esptool: {e}")))?;

        if output.status.success() {
            info!("{port}: flash complete");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .lines()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("; ");
            Err(Error::FlashTool(format!(
                "esptool exited with {}: {tail}",
                output.status
            )))
        }
    }
}
