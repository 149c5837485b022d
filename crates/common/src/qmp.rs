//! QMP (QEMU Machine Protocol) client
//!
//! Line-delimited JSON over the instance's control UNIX socket. The server
//! accepts one negotiated command stream at a time, so every command opens a
//! fresh connection: read the greeting, negotiate capabilities, send the
//! command, read one reply, close. Each read is bounded by the RPC deadline.

use crate::{Error, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, trace};

/// QMP client bound to one control socket.
#[derive(Clone)]
pub struct QmpClient {
    socket_path: PathBuf,
    rpc_deadline: Duration,
}

impl QmpClient {
    pub fn new(socket_path: impl Into<PathBuf>, rpc_deadline: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            rpc_deadline,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Execute one command over a fresh connection.
    pub async fn execute<A: Serialize, R: DeserializeOwned>(
        &self,
        command: &str,
        arguments: Option<A>,
    ) -> Result<R> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            Error::Qmp(format!(
                "Failed to connect to {}: {}",
                self.socket_path.display(),
                e
            ))
        })?;
        let mut reader = BufReader::new(stream);

        // Greeting
        let line = self.read_line(&mut reader).await?;
        trace!("QMP greeting: {}", line.trim());
        let greeting: QmpMessage = serde_json::from_str(&line)
            .map_err(|e| Error::Qmp(format!("Invalid greeting: {}", e)))?;
        if greeting.qmp.is_none() {
            return Err(Error::Qmp("Invalid QMP greeting".to_string()));
        }

        // Capability negotiation, reply discarded
        self.write_command(
            &mut reader,
            &QmpCommand {
                execute: "qmp_capabilities".to_string(),
                arguments: None::<()>,
            },
        )
        .await?;
        let line = self.read_reply_line(&mut reader).await?;
        let negotiated: QmpResponse<serde_json::Value> = serde_json::from_str(&line)
            .map_err(|e| Error::Qmp(format!("Invalid response: {}", e)))?;
        if let Some(error) = negotiated.error {
            return Err(Error::Qmp(format!(
                "Capabilities negotiation failed: {}: {}",
                error.class, error.desc
            )));
        }

        // The command itself
        let cmd = QmpCommand {
            execute: command.to_string(),
            arguments,
        };
        self.write_command(&mut reader, &cmd).await?;
        let line = self.read_reply_line(&mut reader).await?;
        let response: QmpResponse<R> = serde_json::from_str(&line)
            .map_err(|e| Error::Qmp(format!("Invalid response: {}", e)))?;

        if let Some(error) = response.error {
            return Err(Error::Qmp(format!("{}: {}", error.class, error.desc)));
        }
        response
            .result
            .ok_or_else(|| Error::Qmp("No return value".to_string()))
    }

    /// Execute a command whose return value is an empty object.
    pub async fn execute_void<A: Serialize>(
        &self,
        command: &str,
        arguments: Option<A>,
    ) -> Result<()> {
        let _: serde_json::Value = self.execute(command, arguments).await?;
        Ok(())
    }

    async fn write_command<A: Serialize>(
        &self,
        reader: &mut BufReader<UnixStream>,
        cmd: &QmpCommand<A>,
    ) -> Result<()> {
        let cmd_str = serde_json::to_string(cmd)?;
        trace!("QMP command: {}", cmd_str);
        let writer = reader.get_mut();
        writer.write_all(cmd_str.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_line(&self, reader: &mut BufReader<UnixStream>) -> Result<String> {
        let mut line = String::new();
        let n = tokio::time::timeout(self.rpc_deadline, reader.read_line(&mut line))
            .await
            .map_err(|_| Error::Timeout {
                seconds: self.rpc_deadline.as_secs(),
            })??;
        if n == 0 {
            return Err(Error::Qmp("Control socket closed".to_string()));
        }
        Ok(line)
    }

    /// Read the next non-event line.
    async fn read_reply_line(&self, reader: &mut BufReader<UnixStream>) -> Result<String> {
        loop {
            let line = self.read_line(reader).await?;
            trace!("QMP response: {}", line.trim());
            if line.contains("\"event\"") {
                continue;
            }
            return Ok(line);
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Query block devices
    pub async fn query_block(&self) -> Result<Vec<BlockDevice>> {
        self.execute("query-block", None::<()>).await
    }

    /// Start a full drive backup to `target`, auto-finalized and
    /// auto-dismissed so completion is observed as the job disappearing.
    pub async fn drive_backup(&self, device: &str, job_id: &str, target: &Path) -> Result<()> {
        #[derive(Serialize)]
        struct Args {
            device: String,
            #[serde(rename = "job-id")]
            job_id: String,
            target: String,
            format: String,
            sync: String,
            #[serde(rename = "auto-finalize")]
            auto_finalize: bool,
            #[serde(rename = "auto-dismiss")]
            auto_dismiss: bool,
        }

        debug!("drive-backup {} -> {}", device, target.display());
        self.execute_void(
            "drive-backup",
            Some(Args {
                device: device.to_string(),
                job_id: job_id.to_string(),
                target: target.to_string_lossy().to_string(),
                format: "qcow2".to_string(),
                sync: "full".to_string(),
                auto_finalize: true,
                auto_dismiss: true,
            }),
        )
        .await
    }

    /// Poll running block jobs. With auto-dismiss, a finished job no longer
    /// appears here.
    pub async fn query_block_jobs(&self) -> Result<Vec<BlockJob>> {
        self.execute("query-block-jobs", None::<()>).await
    }

    /// Human-monitor passthrough; returns the monitor's textual output.
    /// Used for `savevm`, `loadvm`, `delvm` and `info snapshots`.
    pub async fn hmp(&self, command_line: &str) -> Result<String> {
        #[derive(Serialize)]
        struct Args {
            #[serde(rename = "command-line")]
            command_line: String,
        }

        self.execute(
            "human-monitor-command",
            Some(Args {
                command_line: command_line.to_string(),
            }),
        )
        .await
    }

    /// Graceful ACPI shutdown request.
    pub async fn system_powerdown(&self) -> Result<()> {
        self.execute_void("system_powerdown", None::<()>).await
    }
}

/// Pick the device a snapshot backup should read from: skip read-only and
/// removable devices, prefer the first writable qcow2/raw drive, fall back
/// to any named device.
pub fn pick_backup_device(devices: &[BlockDevice]) -> Result<String> {
    for dev in devices {
        let Some(inserted) = &dev.inserted else {
            continue;
        };
        if inserted.ro || dev.removable {
            continue;
        }
        let format = inserted
            .image
            .as_ref()
            .and_then(|i| i.format.as_deref())
            .unwrap_or(&inserted.drv);
        if (format == "qcow2" || format == "raw") && !dev.device.is_empty() {
            return Ok(dev.device.clone());
        }
    }

    devices
        .iter()
        .find(|d| !d.device.is_empty())
        .map(|d| d.device.clone())
        .ok_or(Error::NoBackupDevice)
}

// QMP protocol types
#[derive(Debug, Serialize)]
struct QmpCommand<A> {
    execute: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<A>,
}

#[derive(Debug, Deserialize)]
struct QmpMessage {
    #[serde(rename = "QMP")]
    qmp: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct QmpResponse<T> {
    #[serde(rename = "return")]
    result: Option<T>,
    error: Option<QmpError>,
}

#[derive(Debug, Deserialize)]
struct QmpError {
    class: String,
    desc: String,
}

/// Block device info from query-block
#[derive(Debug, Clone, Deserialize)]
pub struct BlockDevice {
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub removable: bool,
    pub inserted: Option<BlockInserted>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockInserted {
    pub file: String,
    pub ro: bool,
    pub drv: String,
    pub image: Option<BlockImage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockImage {
    pub format: Option<String>,
    #[serde(rename = "actual-size")]
    pub actual_size: Option<u64>,
    #[serde(rename = "virtual-size")]
    pub virtual_size: Option<u64>,
}

/// One entry from query-block-jobs
#[derive(Debug, Clone, Deserialize)]
pub struct BlockJob {
    pub device: String,
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub status: Option<String>,
    pub offset: Option<u64>,
    pub len: Option<u64>,
}

/// Whether a job with this id is still present in the job list.
pub fn job_still_running(jobs: &[BlockJob], job_id: &str) -> bool {
    jobs.iter().any(|j| j.device == job_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_serialization() {
        #[derive(Serialize)]
        struct TestArgs {
            name: String,
        }

        let cmd = QmpCommand {
            execute: "drive-backup".to_string(),
            arguments: Some(TestArgs {
                name: "value".to_string(),
            }),
        };

        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"execute\":\"drive-backup\""));
        assert!(json.contains("\"arguments\""));

        let bare = QmpCommand {
            execute: "system_powerdown".to_string(),
            arguments: None::<()>,
        };
        assert_eq!(
            serde_json::to_string(&bare).unwrap(),
            r#"{"execute":"system_powerdown"}"#
        );
    }

    #[test]
    fn error_response_parsing() {
        let json = r#"{"error": {"class": "GenericError", "desc": "Something went wrong"}}"#;
        let response: QmpResponse<serde_json::Value> = serde_json::from_str(json).unwrap();
        assert_eq!(response.error.unwrap().class, "GenericError");
    }

    fn device(name: &str, ro: bool, removable: bool, format: &str) -> BlockDevice {
        BlockDevice {
            device: name.to_string(),
            removable,
            inserted: Some(BlockInserted {
                file: format!("/img/{name}"),
                ro,
                drv: format.to_string(),
                image: Some(BlockImage {
                    format: Some(format.to_string()),
                    actual_size: Some(1 << 20),
                    virtual_size: Some(1 << 30),
                }),
            }),
        }
    }

    #[test]
    fn backup_device_skips_ro_and_removable() {
        let devices = vec![
            device("ide0-cd0", true, true, "raw"),
            device("virtio0", false, false, "qcow2"),
        ];
        assert_eq!(pick_backup_device(&devices).unwrap(), "virtio0");
    }

    #[test]
    fn backup_device_falls_back_to_any_named_device() {
        let devices = vec![device("ide0-cd0", true, true, "raw")];
        assert_eq!(pick_backup_device(&devices).unwrap(), "ide0-cd0");
    }

    #[test]
    fn backup_device_fails_on_empty_list() {
        assert!(matches!(
            pick_backup_device(&[]),
            Err(Error::NoBackupDevice)
        ));
    }

    #[test]
    fn block_query_parsing() {
        let json = r#"[{"device":"virtio0","locked":false,"removable":false,
            "inserted":{"file":"/var/ov/alpine_ab.qcow2","ro":false,"drv":"qcow2",
                        "image":{"format":"qcow2","actual-size":62914560,"virtual-size":1073741824}}}]"#;
        let devices: Vec<BlockDevice> = serde_json::from_str(json).unwrap();
        assert_eq!(devices.len(), 1);
        let image = devices[0].inserted.as_ref().unwrap().image.as_ref().unwrap();
        assert_eq!(image.actual_size, Some(62_914_560));
    }

    #[test]
    fn job_completion_is_absence() {
        let jobs: Vec<BlockJob> = serde_json::from_str(
            r#"[{"device":"snap-ab","type":"backup","status":"running","offset":10,"len":100}]"#,
        )
        .unwrap();
        assert!(job_still_running(&jobs, "snap-ab"));
        assert!(!job_still_running(&jobs, "other"));
        assert!(!job_still_running(&[], "snap-ab"));
    }
}
