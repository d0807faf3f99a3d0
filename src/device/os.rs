//! Device traits implemented with lsblk, findmnt, mount, umount and mkfs.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, trace};

use super::{BlockDevice, DeviceLister, FsMaker, Mounter};
use crate::error::{DriverError, DriverResult};

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<LsblkEntry>,
}

#[derive(Debug, Deserialize)]
struct LsblkEntry {
    name: String,
    #[serde(default)]
    serial: Option<String>,
    #[serde(default)]
    fstype: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FindmntOutput {
    #[serde(default)]
    filesystems: Vec<FindmntEntry>,
}

#[derive(Debug, Deserialize)]
struct FindmntEntry {
    target: String,
}

/// Run a command, returning stdout on success and stderr in the error.
async fn run(program: &str, args: &[&str]) -> DriverResult<String> {
    let command = format!("{} {}", program, args.join(" "));
    trace!(command = %command, "running");

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| DriverError::io(format!("run {}", program), e))?;

    if !output.status.success() {
        return Err(DriverError::Command {
            command,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn parse_lsblk(json: &str) -> DriverResult<Vec<BlockDevice>> {
    let output: LsblkOutput = serde_json::from_str(json)
        .map_err(|e| DriverError::Internal(format!("unparsable lsblk output: {}", e)))?;

    Ok(output
        .blockdevices
        .into_iter()
        .filter_map(|entry| {
            let serial = entry.serial.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())?;
            Some(BlockDevice {
                serial,
                path: entry.name,
                fs_type: entry.fstype.filter(|fs| !fs.is_empty()),
            })
        })
        .collect())
}

/// Interpret a `findmnt --mountpoint` run. Exit 1 with no output means nothing
/// is mounted there; any other failure is an error.
fn findmnt_result(
    exit_code: Option<i32>,
    stdout: &str,
    stderr: &str,
    target: &str,
) -> DriverResult<bool> {
    match exit_code {
        Some(0) => parse_findmnt(stdout, target),
        Some(1) if stdout.trim().is_empty() => Ok(false),
        _ => Err(DriverError::Command {
            command: format!("findmnt --json --mountpoint {} --output TARGET", target),
            stderr: match exit_code {
                Some(code) => format!("exit code {}: {}", code, stderr.trim()),
                None => format!("terminated by signal: {}", stderr.trim()),
            },
        }),
    }
}

fn parse_findmnt(json: &str, target: &str) -> DriverResult<bool> {
    if json.trim().is_empty() {
        return Ok(false);
    }
    let output: FindmntOutput = serde_json::from_str(json)
        .map_err(|e| DriverError::Internal(format!("unparsable findmnt output: {}", e)))?;
    Ok(output.filesystems.iter().any(|fs| fs.target == target))
}

/// Lists whole disks with `lsblk`; devices without a serial are skipped.
#[derive(Debug, Clone, Default)]
pub struct LsblkDeviceLister;

#[async_trait]
impl DeviceLister for LsblkDeviceLister {
    async fn list_block_devices(&self) -> DriverResult<Vec<BlockDevice>> {
        let json = run(
            "lsblk",
            &["--json", "--paths", "--nodeps", "--output", "NAME,SERIAL,FSTYPE"],
        )
        .await?;
        parse_lsblk(&json)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SystemMounter;

#[async_trait]
impl Mounter for SystemMounter {
    async fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> DriverResult<()> {
        let joined = options.join(",");
        let mut args = Vec::new();
        if !fs_type.is_empty() {
            args.extend(["-t", fs_type]);
        }
        if !joined.is_empty() {
            args.extend(["-o", joined.as_str()]);
        }
        args.extend([source, target]);

        run("mount", &args).await?;
        info!(source = %source, target = %target, fs = %fs_type, options = %joined, "mounted");
        Ok(())
    }

    async fn unmount(&self, target: &str) -> DriverResult<()> {
        run("umount", &[target]).await?;
        info!(target = %target, "unmounted");
        Ok(())
    }

    async fn is_mount_point(&self, target: &str) -> DriverResult<bool> {
        let output = Command::new("findmnt")
            .args(["--json", "--mountpoint", target, "--output", "TARGET"])
            .output()
            .await
            .map_err(|e| DriverError::io("run findmnt", e))?;
        findmnt_result(
            output.status.code(),
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
            target,
        )
    }

    async fn path_exists(&self, path: &str) -> DriverResult<bool> {
        tokio::fs::try_exists(path)
            .await
            .map_err(|e| DriverError::io(format!("check {}", path), e))
    }
}

/// Formats devices with `mkfs.<fs>`.
#[derive(Debug, Clone, Default)]
pub struct MkfsFormatter;

#[async_trait]
impl FsMaker for MkfsFormatter {
    async fn make_filesystem(&self, device: &str, fs_type: &str) -> DriverResult<()> {
        debug!(device = %device, fs = %fs_type, "formatting device");
        run(&format!("mkfs.{}", fs_type), &[device]).await?;
        info!(device = %device, fs = %fs_type, "device formatted");
        Ok(())
    }
}
