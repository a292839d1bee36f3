//! Hardware inventory collection
//!
//! Probes block devices, their existing partitions and network interfaces, and
//! packages the result into an immutable [`HardwareSnapshot`]. Every scan produces
//! a brand-new snapshot with a fresh `generation`; old snapshots are never mutated.
//!
//! # Design
//!
//! - **Read-only**: probing only reads sysfs and runs `lsblk`, nothing is written
//! - **No silent caching**: callers decide when to re-scan
//! - **Degrade, don't drop**: a device whose details cannot be read is kept and
//!   flagged `degraded`, and the scan reports a [`PartialProbeError`]
//! - **Testable**: all system access goes through the [`HardwareProbe`] trait

use crate::process_guard::CommandProcessGroup;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use thiserror::Error;

/// Source of snapshot generation numbers (process-wide, monotonically increasing).
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Device name prefixes that are never installation targets.
const IGNORED_DEVICE_PREFIXES: &[&str] = &["loop", "ram", "zram"];

/// Detected firmware mode of the system.
///
/// Determined by checking for the existence of `/sys/firmware/efi`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirmwareMode {
    /// UEFI firmware: ESP partition, systemd-boot
    Uefi,
    /// Legacy BIOS firmware: GRUB on a BIOS boot partition
    Bios,
}

impl FirmwareMode {
    /// Returns true if the system booted in UEFI mode.
    pub fn is_uefi(self) -> bool {
        matches!(self, Self::Uefi)
    }
}

impl fmt::Display for FirmwareMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uefi => write!(f, "UEFI"),
            Self::Bios => write!(f, "BIOS"),
        }
    }
}

/// A partition that already exists on a block device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    /// Kernel device path, e.g. `/dev/sda1`
    pub id: String,
    pub size_bytes: Option<u64>,
    pub fstype: Option<String>,
    /// Where the partition is currently mounted in the live system, if anywhere
    pub mount_point: Option<String>,
    /// Mounted devices stacked on this partition (LVM volumes, dm-crypt mappings, RAID arrays)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stacked_mounts: Vec<ActiveMount>,
}

impl PartitionInfo {
    /// True when the partition or anything stacked on it is mounted.
    pub fn is_in_use(&self) -> bool {
        self.mount_point.is_some() || !self.stacked_mounts.is_empty()
    }
}

/// A device that is mounted in the live environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveMount {
    /// The mounted device, e.g. `/dev/mapper/vg-root`
    pub device: String,
    pub mount_point: String,
}

impl fmt::Display for ActiveMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.device, self.mount_point)
    }
}

/// A whole-disk block device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDevice {
    /// Kernel device path, e.g. `/dev/nvme0n1`. Stable for the session.
    pub id: String,
    /// Capacity in bytes; `None` when the size query failed
    pub size_bytes: Option<u64>,
    pub model: Option<String>,
    pub existing_partitions: Vec<PartitionInfo>,
    pub removable: bool,
    /// Set when detail queries failed; the entry is incomplete
    pub degraded: bool,
    /// Mount point of a filesystem written to the whole disk, without a partition table
    #[serde(default)]
    pub mount_point: Option<String>,
}

impl BlockDevice {
    /// Partitions of this device that are in use in the live environment,
    /// directly or through a stacked device.
    pub fn mounted_partitions(&self) -> impl Iterator<Item = &PartitionInfo> {
        self.existing_partitions.iter().filter(|p| p.is_in_use())
    }

    /// Every mount that keeps this disk busy: the disk itself, its
    /// partitions and anything stacked on them.
    pub fn active_mounts(&self) -> Vec<ActiveMount> {
        let mut mounts = Vec::new();
        if let Some(mp) = &self.mount_point {
            mounts.push(ActiveMount {
                device: self.id.clone(),
                mount_point: mp.clone(),
            });
        }
        for part in &self.existing_partitions {
            if let Some(mp) = &part.mount_point {
                mounts.push(ActiveMount {
                    device: part.id.clone(),
                    mount_point: mp.clone(),
                });
            }
            mounts.extend(part.stacked_mounts.iter().cloned());
        }
        mounts
    }
}

/// Kind of network interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    Ethernet,
    Wireless,
    Loopback,
    Virtual,
    Other,
}

/// Operational link state of a network interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Up,
    Down,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub id: String,
    pub kind: InterfaceKind,
    pub link_state: LinkState,
}

/// Immutable result of one hardware scan.
///
/// Shared as `Arc<HardwareSnapshot>`; a re-scan produces a new value with a
/// higher `generation` instead of mutating this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareSnapshot {
    pub generation: u64,
    /// Unix timestamp (seconds) of the scan
    pub taken_at: u64,
    pub firmware: FirmwareMode,
    pub block_devices: Vec<BlockDevice>,
    pub network_interfaces: Vec<NetworkInterface>,
}

impl HardwareSnapshot {
    /// Assemble a snapshot, assigning it the next generation number.
    pub fn new(
        firmware: FirmwareMode,
        block_devices: Vec<BlockDevice>,
        network_interfaces: Vec<NetworkInterface>,
    ) -> Self {
        Self {
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            taken_at: unix_now(),
            firmware,
            block_devices,
            network_interfaces,
        }
    }

    /// Look up a block device by id.
    pub fn device(&self, id: &str) -> Option<&BlockDevice> {
        self.block_devices.iter().find(|d| d.id == id)
    }

    /// Devices with a known capacity that could be offered as targets.
    pub fn installable_devices(&self) -> impl Iterator<Item = &BlockDevice> {
        self.block_devices
            .iter()
            .filter(|d| d.size_bytes.is_some_and(|s| s > 0))
    }

    /// True if any non-loopback interface reports link up.
    pub fn has_network_link(&self) -> bool {
        self.network_interfaces
            .iter()
            .any(|i| i.kind != InterfaceKind::Loopback && i.link_state == LinkState::Up)
    }

    /// Human-readable multi-line summary.
    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "Hardware snapshot #{} (firmware: {})",
            self.generation, self.firmware
        )];
        for dev in &self.block_devices {
            let size = dev
                .size_bytes
                .map(crate::types::format_bytes)
                .unwrap_or_else(|| "unknown size".to_string());
            let mut line = format!(
                "  {} {} [{}]",
                dev.id,
                size,
                dev.model.as_deref().unwrap_or("unknown model")
            );
            if dev.removable {
                line.push_str(" removable");
            }
            if dev.degraded {
                line.push_str(" DEGRADED");
            }
            if let Some(mp) = &dev.mount_point {
                line.push_str(&format!(" mounted on {}", mp));
            }
            lines.push(line);
            for part in &dev.existing_partitions {
                lines.push(format!(
                    "    {} {} {}",
                    part.id,
                    part.fstype.as_deref().unwrap_or("-"),
                    part.mount_point.as_deref().unwrap_or("")
                ));
                for stacked in &part.stacked_mounts {
                    lines.push(format!("      {}", stacked));
                }
            }
        }
        for iface in &self.network_interfaces {
            lines.push(format!(
                "  net {} {:?} {:?}",
                iface.id, iface.kind, iface.link_state
            ));
        }
        lines.join("\n")
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Fatal probe failure: no usable device enumeration.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("block device enumeration requires privileged access: {0}")]
    AccessDenied(String),

    #[error("failed to run {tool}: {reason}")]
    ToolUnavailable { tool: &'static str, reason: String },

    #[error("device enumeration failed: {0}")]
    EnumerationFailed(String),

    #[error("malformed {tool} output: {reason}")]
    Malformed { tool: &'static str, reason: String },
}

/// Non-fatal probe failure: some devices could not be fully queried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} device(s) could not be fully probed: {}", .devices.len(), .devices.join(", "))]
pub struct PartialProbeError {
    pub devices: Vec<String>,
}

/// Outcome of a successful scan.
#[derive(Debug, Clone)]
pub struct ScanReport {
    pub snapshot: Arc<HardwareSnapshot>,
    /// Present when one or more entries are flagged `degraded`
    pub partial: Option<PartialProbeError>,
}

// ============================================================================
// Probing
// ============================================================================

/// System access used by [`scan_with`].
pub trait HardwareProbe: Send {
    /// Raw `lsblk --json` output describing disks and their partitions.
    fn block_devices_json(&self) -> Result<String, ProbeError>;

    /// Network interfaces; an unreadable interface list yields an empty vec.
    fn network_interfaces(&self) -> Vec<NetworkInterface>;

    fn firmware_mode(&self) -> FirmwareMode;
}

/// Probe backed by the running kernel (`/sys` and `lsblk`).
#[derive(Debug, Clone)]
pub struct SystemProbe {
    sys_root: PathBuf,
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self {
            sys_root: PathBuf::from("/sys"),
        }
    }
}

impl SystemProbe {
    /// Probe with an alternate sysfs root.
    pub fn with_sys_root(sys_root: impl Into<PathBuf>) -> Self {
        Self {
            sys_root: sys_root.into(),
        }
    }
}

impl HardwareProbe for SystemProbe {
    fn block_devices_json(&self) -> Result<String, ProbeError> {
        let block_dir = self.sys_root.join("block");
        if let Err(e) = fs::read_dir(&block_dir) {
            return Err(match e.kind() {
                ErrorKind::PermissionDenied => {
                    ProbeError::AccessDenied(format!("{}: {}", block_dir.display(), e))
                }
                _ => ProbeError::EnumerationFailed(format!("{}: {}", block_dir.display(), e)),
            });
        }

        let output = Command::new("lsblk")
            .args([
                "-J",
                "-b",
                "-o",
                "NAME,PATH,SIZE,MODEL,RM,TYPE,FSTYPE,MOUNTPOINT",
            ])
            .in_new_process_group()
            .output()
            .map_err(|e| ProbeError::ToolUnavailable {
                tool: "lsblk",
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("Permission denied") {
                return Err(ProbeError::AccessDenied(stderr));
            }
            return Err(ProbeError::EnumerationFailed(stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn network_interfaces(&self) -> Vec<NetworkInterface> {
        read_network_interfaces(&self.sys_root.join("class/net"))
    }

    fn firmware_mode(&self) -> FirmwareMode {
        detect_firmware_mode(&self.sys_root)
    }
}

/// Scan the running system.
pub fn scan() -> Result<ScanReport, ProbeError> {
    scan_with(&SystemProbe::default())
}

/// Scan through an explicit probe. Idempotent and safe to call repeatedly.
pub fn scan_with(probe: &dyn HardwareProbe) -> Result<ScanReport, ProbeError> {
    let json = probe.block_devices_json()?;
    let (block_devices, degraded) = parse_lsblk_json(&json)?;
    let firmware = probe.firmware_mode();
    let network_interfaces = probe.network_interfaces();

    let snapshot = HardwareSnapshot::new(firmware, block_devices, network_interfaces);
    tracing::info!(
        generation = snapshot.generation,
        devices = snapshot.block_devices.len(),
        interfaces = snapshot.network_interfaces.len(),
        firmware = %firmware,
        "hardware scan complete"
    );

    let partial = if degraded.is_empty() {
        None
    } else {
        let err = PartialProbeError { devices: degraded };
        tracing::warn!("{}", err);
        Some(err)
    };

    Ok(ScanReport {
        snapshot: Arc::new(snapshot),
        partial,
    })
}

/// Run a scan on a background thread.
///
/// The receiver yields exactly one result: the complete snapshot or the error.
pub fn spawn_scan<P>(probe: P) -> std::io::Result<mpsc::Receiver<Result<ScanReport, ProbeError>>>
where
    P: HardwareProbe + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("hardware-scan".to_string())
        .spawn(move || {
            if tx.send(scan_with(&probe)).is_err() {
                tracing::debug!("hardware scan finished after its receiver was dropped");
            }
        })?;
    Ok(rx)
}

// ============================================================================
// Parsing
// ============================================================================

/// Parse `lsblk -J -b` output into disks.
///
/// Returns the devices plus the ids of devices that had to be flagged degraded.
pub fn parse_lsblk_json(json: &str) -> Result<(Vec<BlockDevice>, Vec<String>), ProbeError> {
    let root: Value = serde_json::from_str(json).map_err(|e| ProbeError::Malformed {
        tool: "lsblk",
        reason: e.to_string(),
    })?;
    let entries = root
        .get("blockdevices")
        .and_then(Value::as_array)
        .ok_or_else(|| ProbeError::Malformed {
            tool: "lsblk",
            reason: "missing \"blockdevices\" array".to_string(),
        })?;

    let mut devices = Vec::new();
    let mut degraded = Vec::new();

    for entry in entries {
        let Some(name) = entry.get("name").and_then(Value::as_str) else {
            tracing::warn!("skipping lsblk entry without a name");
            continue;
        };
        if entry.get("type").and_then(Value::as_str) != Some("disk") {
            continue;
        }
        if IGNORED_DEVICE_PREFIXES.iter().any(|p| name.starts_with(p)) {
            continue;
        }

        let id = device_path(entry, name);
        let size_bytes = number_field(entry.get("size"));
        let model = entry
            .get("model")
            .and_then(Value::as_str)
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty());

        let existing_partitions = entry
            .get("children")
            .and_then(Value::as_array)
            .map(|children| {
                children
                    .iter()
                    .filter_map(|child| {
                        let child_name = child.get("name").and_then(Value::as_str)?;
                        let mut stacked_mounts = Vec::new();
                        collect_stacked_mounts(child, &mut stacked_mounts);
                        Some(PartitionInfo {
                            id: device_path(child, child_name),
                            size_bytes: number_field(child.get("size")),
                            fstype: string_field(child.get("fstype")),
                            mount_point: string_field(child.get("mountpoint")),
                            stacked_mounts,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let is_degraded = size_bytes.is_none();
        if is_degraded {
            tracing::warn!(device = %id, "size query failed; device flagged degraded");
            degraded.push(id.clone());
        }

        devices.push(BlockDevice {
            id,
            size_bytes,
            model,
            existing_partitions,
            removable: bool_field(entry.get("rm")),
            degraded: is_degraded,
            mount_point: string_field(entry.get("mountpoint")),
        });
    }

    Ok((devices, degraded))
}

/// Walk the devices lsblk nests under `entry` and record every mounted one.
/// A device shared by several parents (RAID) is reported under each of them.
fn collect_stacked_mounts(entry: &Value, mounts: &mut Vec<ActiveMount>) {
    let Some(children) = entry.get("children").and_then(Value::as_array) else {
        return;
    };
    for child in children {
        let Some(name) = child.get("name").and_then(Value::as_str) else {
            continue;
        };
        if let Some(mount_point) = string_field(child.get("mountpoint")) {
            mounts.push(ActiveMount {
                device: device_path(child, name),
                mount_point,
            });
        }
        collect_stacked_mounts(child, mounts);
    }
}

fn device_path(entry: &Value, name: &str) -> String {
    string_field(entry.get("path")).unwrap_or_else(|| format!("/dev/{}", name))
}

/// lsblk emits numbers or numeric strings depending on its version.
fn number_field(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn string_field(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}

fn bool_field(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_u64() == Some(1),
        Some(Value::String(s)) => s == "1" || s == "true",
        _ => false,
    }
}

/// Enumerate interfaces from a `/sys/class/net`-shaped directory.
pub fn read_network_interfaces(net_dir: &Path) -> Vec<NetworkInterface> {
    let entries = match fs::read_dir(net_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("cannot read {}: {}", net_dir.display(), e);
            return Vec::new();
        }
    };

    let mut interfaces: Vec<NetworkInterface> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| {
            let dir = entry.path();
            NetworkInterface {
                id: entry.file_name().to_string_lossy().into_owned(),
                kind: interface_kind(&dir),
                link_state: link_state(&dir),
            }
        })
        .collect();
    interfaces.sort_by(|a, b| a.id.cmp(&b.id));
    interfaces
}

fn interface_kind(dir: &Path) -> InterfaceKind {
    if dir.join("wireless").exists() || dir.join("phy80211").exists() {
        return InterfaceKind::Wireless;
    }
    let if_type = fs::read_to_string(dir.join("type")).unwrap_or_default();
    match if_type.trim() {
        // ARPHRD_LOOPBACK
        "772" => InterfaceKind::Loopback,
        "1" if dir.join("device").exists() => InterfaceKind::Ethernet,
        "1" => InterfaceKind::Virtual,
        _ => InterfaceKind::Other,
    }
}

fn link_state(dir: &Path) -> LinkState {
    match fs::read_to_string(dir.join("operstate")) {
        Ok(state) => match state.trim() {
            "up" => LinkState::Up,
            "down" | "lowerlayerdown" | "notpresent" | "dormant" => LinkState::Down,
            _ => LinkState::Unknown,
        },
        Err(_) => LinkState::Unknown,
    }
}

/// Detect firmware mode by checking for the EFI sysfs directory.
///
/// The kernel exposes `firmware/efi` only when booted in UEFI mode.
pub fn detect_firmware_mode(sys_root: &Path) -> FirmwareMode {
    if sys_root.join("firmware/efi").exists() {
        tracing::info!("UEFI firmware detected");
        FirmwareMode::Uefi
    } else {
        tracing::info!("BIOS firmware detected (no firmware/efi in sysfs)");
        FirmwareMode::Bios
    }
}

pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GIB;

    const LSBLK_SAMPLE: &str = r#"{
        "blockdevices": [
            {"name": "loop0", "path": "/dev/loop0", "size": 1048576, "model": null, "rm": false, "type": "loop", "fstype": "squashfs", "mountpoint": "/nix/.ro-store"},
            {"name": "sda", "path": "/dev/sda", "size": 21474836480, "model": "QEMU HARDDISK   ", "rm": false, "type": "disk", "fstype": null, "mountpoint": null,
             "children": [
                {"name": "sda1", "path": "/dev/sda1", "size": 536870912, "model": null, "rm": false, "type": "part", "fstype": "vfat", "mountpoint": null}
             ]},
            {"name": "sdb", "path": "/dev/sdb", "size": "16008609792", "model": "USB Stick", "rm": "1", "type": "disk", "fstype": "iso9660", "mountpoint": "/iso"},
            {"name": "sr0", "path": "/dev/sr0", "size": 1073741312, "model": "QEMU DVD-ROM", "rm": true, "type": "rom", "fstype": null, "mountpoint": null},
            {"name": "zram0", "size": 4294967296, "type": "disk"},
            {"name": "vda", "size": null, "model": null, "rm": false, "type": "disk"}
        ]
    }"#;

    #[test]
    fn test_parse_lsblk_keeps_only_disks() {
        let (devices, _) = parse_lsblk_json(LSBLK_SAMPLE).expect("sample parses"); // test: known-good input
        let ids: Vec<&str> = devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["/dev/sda", "/dev/sdb", "/dev/vda"]);
    }

    #[test]
    fn test_parse_lsblk_fields() {
        let (devices, _) = parse_lsblk_json(LSBLK_SAMPLE).expect("sample parses"); // test: known-good input

        let sda = &devices[0];
        assert_eq!(sda.size_bytes, Some(20 * GIB));
        assert_eq!(sda.model.as_deref(), Some("QEMU HARDDISK"));
        assert!(!sda.removable);
        assert_eq!(sda.existing_partitions.len(), 1);
        assert_eq!(sda.existing_partitions[0].id, "/dev/sda1");
        assert_eq!(sda.existing_partitions[0].fstype.as_deref(), Some("vfat"));

        // String sizes and "1" removable flags come from older lsblk versions
        let sdb = &devices[1];
        assert_eq!(sdb.size_bytes, Some(16_008_609_792));
        assert!(sdb.removable);
    }

    #[test]
    fn test_parse_lsblk_flags_degraded_devices() {
        let (devices, degraded) = parse_lsblk_json(LSBLK_SAMPLE).expect("sample parses"); // test: known-good input
        let vda = &devices[2];
        assert_eq!(vda.id, "/dev/vda"); // path falls back to /dev/<name>
        assert!(vda.degraded);
        assert_eq!(vda.size_bytes, None);
        assert_eq!(degraded, vec!["/dev/vda".to_string()]);
    }

    #[test]
    fn test_parse_lsblk_rejects_garbage() {
        assert!(matches!(
            parse_lsblk_json("not json"),
            Err(ProbeError::Malformed { .. })
        ));
        assert!(matches!(
            parse_lsblk_json(r#"{"devices": []}"#),
            Err(ProbeError::Malformed { .. })
        ));
    }

    #[test]
    fn test_mounted_partitions() {
        let (devices, _) = parse_lsblk_json(LSBLK_SAMPLE).expect("sample parses"); // test: known-good input
        assert_eq!(devices[0].mounted_partitions().count(), 0);
        assert!(devices[0].active_mounts().is_empty());

        // sdb carries a filesystem on the whole disk
        assert_eq!(devices[1].mount_point.as_deref(), Some("/iso"));
        assert_eq!(devices[1].mounted_partitions().count(), 0);
        assert_eq!(
            devices[1].active_mounts(),
            vec![ActiveMount {
                device: "/dev/sdb".to_string(),
                mount_point: "/iso".to_string(),
            }]
        );
    }

    #[test]
    fn test_mounts_on_stacked_devices_mark_partition_in_use() {
        let json = r#"{
            "blockdevices": [
                {"name": "nvme0n1", "path": "/dev/nvme0n1", "size": 512110190592, "type": "disk", "mountpoint": null,
                 "children": [
                    {"name": "nvme0n1p1", "path": "/dev/nvme0n1p1", "size": 536870912, "type": "part", "fstype": "vfat", "mountpoint": null},
                    {"name": "nvme0n1p2", "path": "/dev/nvme0n1p2", "size": 511572574208, "type": "part", "fstype": "crypto_LUKS", "mountpoint": null,
                     "children": [
                        {"name": "cryptroot", "path": "/dev/mapper/cryptroot", "size": 511555797504, "type": "crypt", "fstype": "LVM2_member", "mountpoint": null,
                         "children": [
                            {"name": "vg-swap", "path": "/dev/mapper/vg-swap", "size": 8589934592, "type": "lvm", "fstype": "swap", "mountpoint": "[SWAP]"},
                            {"name": "vg-home", "path": "/dev/mapper/vg-home", "size": 502965862912, "type": "lvm", "fstype": "ext4", "mountpoint": "/home"}
                         ]}
                     ]}
                 ]}
            ]
        }"#;
        let (devices, degraded) = parse_lsblk_json(json).expect("nested sample parses"); // test: known-good input
        assert!(degraded.is_empty());

        let nvme = &devices[0];
        assert_eq!(nvme.existing_partitions.len(), 2);
        assert!(!nvme.existing_partitions[0].is_in_use());
        let luks = &nvme.existing_partitions[1];
        assert_eq!(luks.mount_point, None);
        assert!(luks.is_in_use());

        let mounted: Vec<&str> = nvme.mounted_partitions().map(|p| p.id.as_str()).collect();
        assert_eq!(mounted, vec!["/dev/nvme0n1p2"]);
        let described: Vec<String> = nvme.active_mounts().iter().map(ToString::to_string).collect();
        assert_eq!(
            described,
            vec!["/dev/mapper/vg-swap on [SWAP]", "/dev/mapper/vg-home on /home"]
        );
    }

    // =========================================================================
    // sysfs-backed probing
    // =========================================================================

    fn fake_iface(net: &Path, name: &str, if_type: &str, operstate: &str, physical: bool) {
        let dir = net.join(name);
        fs::create_dir_all(&dir).expect("create iface dir"); // test: tempdir
        fs::write(dir.join("type"), format!("{}\n", if_type)).expect("write type"); // test: tempdir
        fs::write(dir.join("operstate"), format!("{}\n", operstate)).expect("write operstate"); // test: tempdir
        if physical {
            fs::create_dir_all(dir.join("device")).expect("create device"); // test: tempdir
        }
    }

    #[test]
    fn test_read_network_interfaces() {
        let tmp = tempfile::tempdir().expect("tempdir"); // test: tempdir
        let net = tmp.path();
        fake_iface(net, "lo", "772", "unknown", false);
        fake_iface(net, "enp1s0", "1", "up", true);
        fake_iface(net, "wlan0", "1", "down", true);
        fs::create_dir_all(net.join("wlan0/wireless")).expect("create wireless"); // test: tempdir
        fake_iface(net, "virbr0", "1", "down", false);

        let ifaces = read_network_interfaces(net);
        let summary: Vec<(&str, InterfaceKind, LinkState)> = ifaces
            .iter()
            .map(|i| (i.id.as_str(), i.kind, i.link_state))
            .collect();

        assert_eq!(
            summary,
            vec![
                ("enp1s0", InterfaceKind::Ethernet, LinkState::Up),
                ("lo", InterfaceKind::Loopback, LinkState::Unknown),
                ("virbr0", InterfaceKind::Virtual, LinkState::Down),
                ("wlan0", InterfaceKind::Wireless, LinkState::Down),
            ]
        );
    }

    #[test]
    fn test_missing_net_dir_yields_no_interfaces() {
        let tmp = tempfile::tempdir().expect("tempdir"); // test: tempdir
        assert!(read_network_interfaces(&tmp.path().join("nope")).is_empty());
    }

    #[test]
    fn test_detect_firmware_mode_from_sys_root() {
        let tmp = tempfile::tempdir().expect("tempdir"); // test: tempdir
        assert_eq!(detect_firmware_mode(tmp.path()), FirmwareMode::Bios);
        fs::create_dir_all(tmp.path().join("firmware/efi")).expect("create efi"); // test: tempdir
        assert_eq!(detect_firmware_mode(tmp.path()), FirmwareMode::Uefi);
    }

    #[test]
    fn test_system_probe_missing_sysfs_is_probe_error() {
        let tmp = tempfile::tempdir().expect("tempdir"); // test: tempdir
        let probe = SystemProbe::with_sys_root(tmp.path().join("absent"));
        assert!(matches!(
            probe.block_devices_json(),
            Err(ProbeError::EnumerationFailed(_))
        ));
    }

    // =========================================================================
    // scan_with
    // =========================================================================

    struct CannedProbe {
        json: Option<&'static str>,
    }

    impl HardwareProbe for CannedProbe {
        fn block_devices_json(&self) -> Result<String, ProbeError> {
            self.json
                .map(str::to_string)
                .ok_or_else(|| ProbeError::AccessDenied("not root".to_string()))
        }

        fn network_interfaces(&self) -> Vec<NetworkInterface> {
            vec![NetworkInterface {
                id: "eth0".to_string(),
                kind: InterfaceKind::Ethernet,
                link_state: LinkState::Up,
            }]
        }

        fn firmware_mode(&self) -> FirmwareMode {
            FirmwareMode::Uefi
        }
    }

    #[test]
    fn test_scan_reports_partial_probe() {
        let report = scan_with(&CannedProbe { json: Some(LSBLK_SAMPLE) }).expect("scan"); // test: canned probe
        assert_eq!(report.snapshot.block_devices.len(), 3);
        assert_eq!(
            report.partial,
            Some(PartialProbeError {
                devices: vec!["/dev/vda".to_string()]
            })
        );
        assert!(report.snapshot.has_network_link());
        assert_eq!(report.snapshot.installable_devices().count(), 2);
    }

    #[test]
    fn test_scan_without_access_fails() {
        let err = scan_with(&CannedProbe { json: None }).unwrap_err();
        assert!(matches!(err, ProbeError::AccessDenied(_)));
        assert!(err.to_string().contains("privileged access"));
    }

    #[test]
    fn test_rescan_produces_new_generation() {
        let probe = CannedProbe { json: Some(LSBLK_SAMPLE) };
        let first = scan_with(&probe).expect("scan"); // test: canned probe
        let second = scan_with(&probe).expect("scan"); // test: canned probe
        assert!(second.snapshot.generation > first.snapshot.generation);
        assert_eq!(first.snapshot.block_devices, second.snapshot.block_devices);
    }

    #[test]
    fn test_spawn_scan_delivers_single_result() {
        let rx = spawn_scan(CannedProbe { json: Some(LSBLK_SAMPLE) }).expect("spawn"); // test: thread spawn
        let report = rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("scan result") // test: background thread delivers
            .expect("scan succeeds"); // test: canned probe
        assert_eq!(report.snapshot.firmware, FirmwareMode::Uefi);
        assert!(rx.recv().is_err(), "only one result is ever sent");
    }
}
