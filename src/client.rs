//! Client side of the wire protocol: one connection per operation, used by
//! the admin CLI, tape-server daemons and the integration tests.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{code, MountqError, Result};
use crate::proto::message::{read_message, write_message};
use crate::proto::{
    DedicateMsg, DeleteDriveMsg, DriveRequestMsg, Message, VolumeAck, VolumePriorityMsg,
    VolumeRequestMsg,
};

const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Liveness of the queue server as seen by the CLI ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Hold,
    Dead,
}

impl std::fmt::Display for Liveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Liveness::Alive => write!(f, "ALIVE"),
            Liveness::Hold => write!(f, "HOLD"),
            Liveness::Dead => write!(f, "DEAD"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueClient {
    addr: SocketAddr,
    rpc_timeout: Duration,
}

impl QueueClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    async fn connect(&self) -> Result<TcpStream> {
        Ok(timeout(self.rpc_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| MountqError::protocol("connect timed out"))??)
    }

    async fn round_trip(&self, msg: &Message) -> Result<Message> {
        let mut stream = self.connect().await?;
        write_message(&mut stream, msg).await?;
        timeout(self.rpc_timeout, read_message(&mut stream))
            .await
            .map_err(|_| MountqError::protocol("reply timed out"))?
    }

    fn expect_ok(reply: Message) -> Result<()> {
        match reply {
            Message::DriveAck(a) if a.status == 0 => Ok(()),
            Message::ErrorAck(e) => Err(MountqError::validation(e.code, "request refused")),
            other => Err(MountqError::protocol(format!(
                "unexpected reply type {}",
                other.reqtype()
            ))),
        }
    }

    /// Queue a mount request. Returns the server-assigned request id and
    /// the 1-based queue position.
    pub async fn request_volume(&self, msg: VolumeRequestMsg) -> Result<VolumeAck> {
        match self.round_trip(&Message::VolumeRequest(msg)).await? {
            Message::VolumeAck(ack) => Ok(ack),
            Message::ErrorAck(e) => Err(MountqError::validation(e.code, "request refused")),
            other => Err(MountqError::protocol(format!(
                "unexpected reply type {}",
                other.reqtype()
            ))),
        }
    }

    /// Push a drive status update. Returns the resulting status bitmask.
    pub async fn push_drive_status(&self, msg: DriveRequestMsg) -> Result<i32> {
        match self.round_trip(&Message::DriveRequest(msg)).await? {
            Message::DriveAck(a) => Ok(a.status),
            Message::ErrorAck(e) => Err(MountqError::validation(e.code, "request refused")),
            other => Err(MountqError::protocol(format!(
                "unexpected reply type {}",
                other.reqtype()
            ))),
        }
    }

    /// Queue position of a request: 0 when running, 1-based when queued.
    pub async fn ping(&self, drive_group: &str, request_id: i32) -> Result<i32> {
        let msg = VolumeRequestMsg {
            request_id,
            drive_group: drive_group.to_string(),
            ..Default::default()
        };
        match self.round_trip(&Message::Ping(msg)).await? {
            Message::VolumeAck(ack) => Ok(ack.queue_position),
            Message::ErrorAck(e) => Err(MountqError::validation(e.code, "request refused")),
            other => Err(MountqError::protocol(format!(
                "unexpected reply type {}",
                other.reqtype()
            ))),
        }
    }

    /// Probe the server. Never fails; unreachable or unresponsive maps to
    /// `Dead`, a held server to `Hold`.
    pub async fn liveness(&self) -> Liveness {
        let probe = Message::Ping(VolumeRequestMsg::default());
        match self.round_trip(&probe).await {
            Ok(Message::VolumeAck(_)) => Liveness::Alive,
            Ok(Message::ErrorAck(e)) if e.code == code::SERVER_HELD => Liveness::Hold,
            _ => Liveness::Dead,
        }
    }

    pub async fn hold(&self) -> Result<()> {
        Self::expect_ok(self.round_trip(&Message::Hold).await?)
    }

    pub async fn release(&self) -> Result<()> {
        Self::expect_ok(self.round_trip(&Message::Release).await?)
    }

    pub async fn shutdown(&self) -> Result<()> {
        Self::expect_ok(self.round_trip(&Message::Shutdown).await?)
    }

    pub async fn dedicate(&self, msg: DedicateMsg) -> Result<()> {
        Self::expect_ok(self.round_trip(&Message::Dedicate(msg)).await?)
    }

    pub async fn delete_drive(&self, msg: DeleteDriveMsg) -> Result<()> {
        Self::expect_ok(self.round_trip(&Message::DeleteDrive(msg)).await?)
    }

    pub async fn delete_volume(&self, drive_group: &str, request_id: i32) -> Result<()> {
        let msg = VolumeRequestMsg {
            request_id,
            drive_group: drive_group.to_string(),
            ..Default::default()
        };
        Self::expect_ok(self.round_trip(&Message::DeleteVolume(msg)).await?)
    }

    pub async fn set_priority(&self, msg: VolumePriorityMsg) -> Result<()> {
        Self::expect_ok(self.round_trip(&Message::VolumePriority(msg)).await?)
    }

    pub async fn reselect(&self, drive_group: &str, request_id: i32) -> Result<()> {
        let msg = VolumeRequestMsg {
            request_id,
            drive_group: drive_group.to_string(),
            ..Default::default()
        };
        Self::expect_ok(self.round_trip(&Message::Reselect(msg)).await?)
    }

    /// Fetch the volume queue, optionally filtered by group. Records stream
    /// until the sentinel with request id -1.
    pub async fn volume_queue(&self, drive_group: Option<&str>) -> Result<Vec<VolumeRequestMsg>> {
        let mut stream = self.connect().await?;
        let filter = VolumeRequestMsg {
            drive_group: drive_group.unwrap_or_default().to_string(),
            ..Default::default()
        };
        write_message(&mut stream, &Message::GetVolQueue(filter)).await?;
        let mut rows = Vec::new();
        loop {
            match timeout(self.rpc_timeout, read_message(&mut stream))
                .await
                .map_err(|_| MountqError::protocol("listing timed out"))??
            {
                Message::GetVolQueue(row) if row.request_id == -1 => return Ok(rows),
                Message::GetVolQueue(row) => rows.push(row),
                Message::ErrorAck(e) => {
                    return Err(MountqError::validation(e.code, "listing refused"))
                }
                other => {
                    return Err(MountqError::protocol(format!(
                        "unexpected reply type {}",
                        other.reqtype()
                    )))
                }
            }
        }
    }

    /// Fetch the drive queue, optionally filtered by group.
    pub async fn drive_queue(&self, drive_group: Option<&str>) -> Result<Vec<DriveRequestMsg>> {
        let mut stream = self.connect().await?;
        let filter = DriveRequestMsg {
            drive_group: drive_group.unwrap_or_default().to_string(),
            ..Default::default()
        };
        write_message(&mut stream, &Message::GetDrvQueue(filter)).await?;
        let mut rows = Vec::new();
        loop {
            match timeout(self.rpc_timeout, read_message(&mut stream))
                .await
                .map_err(|_| MountqError::protocol("listing timed out"))??
            {
                Message::GetDrvQueue(row) if row.request_id == -1 => return Ok(rows),
                Message::GetDrvQueue(row) => rows.push(row),
                Message::ErrorAck(e) => {
                    return Err(MountqError::validation(e.code, "listing refused"))
                }
                other => {
                    return Err(MountqError::protocol(format!(
                        "unexpected reply type {}",
                        other.reqtype()
                    )))
                }
            }
        }
    }
}
