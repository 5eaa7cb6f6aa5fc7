//! Typed message structs and the framing codec.
//!
//! Every payload length is computed exactly from the fixed-field sizes plus
//! the actual string lengths and their terminators, matching the legacy
//! marshalled-length formulas.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{MountqError, Result};
use crate::proto::wire::{get_i32, get_i64, get_string, put_i32, put_i64, put_string, string_len};
use crate::proto::{limits, reqtype, COPYD_MAGIC, HDR_LEN, MAGIC, MAX_PAYLOAD};

/// A volume mount request, also carried by ping, delete-volume, reselect and
/// volume-queue-listing messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeRequestMsg {
    pub request_id: i32,
    pub drive_id: i32,
    pub priority: i32,
    pub client_port: i32,
    pub client_uid: i32,
    pub client_gid: i32,
    pub mode: i32,
    pub arrival_time: i32,
    pub client_host: String,
    pub volume_id: String,
    /// Requested tape server, empty for any.
    pub server: String,
    /// Requested drive unit, empty for any.
    pub drive: String,
    pub drive_group: String,
    pub client_name: String,
}

impl VolumeRequestMsg {
    pub fn payload_len(&self) -> usize {
        8 * 4
            + string_len(&self.client_host)
            + string_len(&self.volume_id)
            + string_len(&self.server)
            + string_len(&self.drive)
            + string_len(&self.drive_group)
            + string_len(&self.client_name)
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        put_i32(buf, self.request_id);
        put_i32(buf, self.drive_id);
        put_i32(buf, self.priority);
        put_i32(buf, self.client_port);
        put_i32(buf, self.client_uid);
        put_i32(buf, self.client_gid);
        put_i32(buf, self.mode);
        put_i32(buf, self.arrival_time);
        put_string(buf, &self.client_host, limits::HOST)?;
        put_string(buf, &self.volume_id, limits::VID)?;
        put_string(buf, &self.server, limits::HOST)?;
        put_string(buf, &self.drive, limits::DRIVE)?;
        put_string(buf, &self.drive_group, limits::DGN)?;
        put_string(buf, &self.client_name, limits::CLIENT_NAME)?;
        Ok(())
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            request_id: get_i32(buf)?,
            drive_id: get_i32(buf)?,
            priority: get_i32(buf)?,
            client_port: get_i32(buf)?,
            client_uid: get_i32(buf)?,
            client_gid: get_i32(buf)?,
            mode: get_i32(buf)?,
            arrival_time: get_i32(buf)?,
            client_host: get_string(buf, limits::HOST)?,
            volume_id: get_string(buf, limits::VID)?,
            server: get_string(buf, limits::HOST)?,
            drive: get_string(buf, limits::DRIVE)?,
            drive_group: get_string(buf, limits::DGN)?,
            client_name: get_string(buf, limits::CLIENT_NAME)?,
        })
    }
}

/// A drive status push, also carried by drive-queue-listing messages.
/// `status` is the legacy bitmask (`proto::DriveStatus`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriveRequestMsg {
    pub status: i32,
    pub drive_id: i32,
    pub request_id: i32,
    pub job_id: i32,
    pub last_update: i32,
    pub last_reset: i32,
    pub usage_count: i32,
    pub error_count: i32,
    pub mb_transferred: i32,
    pub mode: i32,
    pub total_mb: i64,
    pub volume_id: String,
    pub server: String,
    pub drive: String,
    pub drive_group: String,
    pub dedicate: String,
}

impl DriveRequestMsg {
    pub fn payload_len(&self) -> usize {
        10 * 4
            + 8
            + string_len(&self.volume_id)
            + string_len(&self.server)
            + string_len(&self.drive)
            + string_len(&self.drive_group)
            + string_len(&self.dedicate)
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        put_i32(buf, self.status);
        put_i32(buf, self.drive_id);
        put_i32(buf, self.request_id);
        put_i32(buf, self.job_id);
        put_i32(buf, self.last_update);
        put_i32(buf, self.last_reset);
        put_i32(buf, self.usage_count);
        put_i32(buf, self.error_count);
        put_i32(buf, self.mb_transferred);
        put_i32(buf, self.mode);
        put_i64(buf, self.total_mb);
        put_string(buf, &self.volume_id, limits::VID)?;
        put_string(buf, &self.server, limits::HOST)?;
        put_string(buf, &self.drive, limits::DRIVE)?;
        put_string(buf, &self.drive_group, limits::DGN)?;
        put_string(buf, &self.dedicate, limits::DEDICATE)?;
        Ok(())
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            status: get_i32(buf)?,
            drive_id: get_i32(buf)?,
            request_id: get_i32(buf)?,
            job_id: get_i32(buf)?,
            last_update: get_i32(buf)?,
            last_reset: get_i32(buf)?,
            usage_count: get_i32(buf)?,
            error_count: get_i32(buf)?,
            mb_transferred: get_i32(buf)?,
            mode: get_i32(buf)?,
            total_mb: get_i64(buf)?,
            volume_id: get_string(buf, limits::VID)?,
            server: get_string(buf, limits::HOST)?,
            drive: get_string(buf, limits::DRIVE)?,
            drive_group: get_string(buf, limits::DGN)?,
            dedicate: get_string(buf, limits::DEDICATE)?,
        })
    }
}

/// Acknowledgement of a volume request or ping: the request id and its
/// queue position, 1-based; 0 means the request is already on a drive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeAck {
    pub request_id: i32,
    pub queue_position: i32,
}

/// Acknowledgement of a drive status push: the resulting status bitmask.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriveAck {
    pub status: i32,
}

/// Negative acknowledgement carrying a stable cause code (`error::code`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorAck {
    pub code: i32,
}

/// Adjusts the priority of queued requests for one volume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumePriorityMsg {
    pub priority: i32,
    pub client_uid: i32,
    pub client_gid: i32,
    pub mode: i32,
    pub lifespan: i32,
    pub client_host: String,
    pub volume_id: String,
}

impl VolumePriorityMsg {
    pub fn payload_len(&self) -> usize {
        5 * 4 + string_len(&self.client_host) + string_len(&self.volume_id)
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        put_i32(buf, self.priority);
        put_i32(buf, self.client_uid);
        put_i32(buf, self.client_gid);
        put_i32(buf, self.mode);
        put_i32(buf, self.lifespan);
        put_string(buf, &self.client_host, limits::HOST)?;
        put_string(buf, &self.volume_id, limits::VID)?;
        Ok(())
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            priority: get_i32(buf)?,
            client_uid: get_i32(buf)?,
            client_gid: get_i32(buf)?,
            mode: get_i32(buf)?,
            lifespan: get_i32(buf)?,
            client_host: get_string(buf, limits::HOST)?,
            volume_id: get_string(buf, limits::VID)?,
        })
    }
}

/// Removes a drive from its group registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteDriveMsg {
    pub client_uid: i32,
    pub client_gid: i32,
    pub client_host: String,
    pub server: String,
    pub drive: String,
    pub drive_group: String,
}

impl DeleteDriveMsg {
    pub fn payload_len(&self) -> usize {
        2 * 4
            + string_len(&self.client_host)
            + string_len(&self.server)
            + string_len(&self.drive)
            + string_len(&self.drive_group)
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        put_i32(buf, self.client_uid);
        put_i32(buf, self.client_gid);
        put_string(buf, &self.client_host, limits::HOST)?;
        put_string(buf, &self.server, limits::HOST)?;
        put_string(buf, &self.drive, limits::DRIVE)?;
        put_string(buf, &self.drive_group, limits::DGN)?;
        Ok(())
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            client_uid: get_i32(buf)?,
            client_gid: get_i32(buf)?,
            client_host: get_string(buf, limits::HOST)?,
            server: get_string(buf, limits::HOST)?,
            drive: get_string(buf, limits::DRIVE)?,
            drive_group: get_string(buf, limits::DGN)?,
        })
    }
}

/// Installs (or, with an empty pattern, clears) a dedication rule on a drive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedicateMsg {
    pub client_uid: i32,
    pub client_gid: i32,
    pub client_host: String,
    pub server: String,
    pub drive: String,
    pub drive_group: String,
    pub dedicate: String,
}

impl DedicateMsg {
    pub fn payload_len(&self) -> usize {
        2 * 4
            + string_len(&self.client_host)
            + string_len(&self.server)
            + string_len(&self.drive)
            + string_len(&self.drive_group)
            + string_len(&self.dedicate)
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        put_i32(buf, self.client_uid);
        put_i32(buf, self.client_gid);
        put_string(buf, &self.client_host, limits::HOST)?;
        put_string(buf, &self.server, limits::HOST)?;
        put_string(buf, &self.drive, limits::DRIVE)?;
        put_string(buf, &self.drive_group, limits::DGN)?;
        put_string(buf, &self.dedicate, limits::DEDICATE)?;
        Ok(())
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            client_uid: get_i32(buf)?,
            client_gid: get_i32(buf)?,
            client_host: get_string(buf, limits::HOST)?,
            server: get_string(buf, limits::HOST)?,
            drive: get_string(buf, limits::DRIVE)?,
            drive_group: get_string(buf, limits::DGN)?,
            dedicate: get_string(buf, limits::DEDICATE)?,
        })
    }
}

/// All messages of the queue-server protocol. Ping, delete-volume, reselect
/// and the queue listings reuse the volume/drive payload layouts under their
/// own request types, as the legacy protocol does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    VolumeRequest(VolumeRequestMsg),
    DriveRequest(DriveRequestMsg),
    Ping(VolumeRequestMsg),
    DeleteVolume(VolumeRequestMsg),
    Reselect(VolumeRequestMsg),
    GetVolQueue(VolumeRequestMsg),
    GetDrvQueue(DriveRequestMsg),
    VolumePriority(VolumePriorityMsg),
    DeleteDrive(DeleteDriveMsg),
    Dedicate(DedicateMsg),
    VolumeAck(VolumeAck),
    DriveAck(DriveAck),
    ErrorAck(ErrorAck),
    Hold,
    Release,
    Shutdown,
}

impl Message {
    pub fn reqtype(&self) -> i32 {
        match self {
            Message::VolumeRequest(_) => reqtype::VOL_REQ,
            Message::DriveRequest(_) => reqtype::DRV_REQ,
            Message::Ping(_) => reqtype::PING,
            Message::DeleteVolume(_) => reqtype::DEL_VOLREQ,
            Message::Reselect(_) => reqtype::RESELECT,
            Message::GetVolQueue(_) => reqtype::GET_VOLQUEUE,
            Message::GetDrvQueue(_) => reqtype::GET_DRVQUEUE,
            Message::VolumePriority(_) => reqtype::SET_PRIORITY,
            Message::DeleteDrive(_) => reqtype::DEL_DRVREQ,
            Message::Dedicate(_) => reqtype::DEDICATE,
            Message::VolumeAck(_) => reqtype::VOL_ACK,
            Message::DriveAck(_) => reqtype::DRV_ACK,
            Message::ErrorAck(_) => reqtype::ERR_ACK,
            Message::Hold => reqtype::HOLD,
            Message::Release => reqtype::RELEASE,
            Message::Shutdown => reqtype::SHUTDOWN,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Message::VolumeRequest(m)
            | Message::Ping(m)
            | Message::DeleteVolume(m)
            | Message::Reselect(m)
            | Message::GetVolQueue(m) => m.payload_len(),
            Message::DriveRequest(m) | Message::GetDrvQueue(m) => m.payload_len(),
            Message::VolumePriority(m) => m.payload_len(),
            Message::DeleteDrive(m) => m.payload_len(),
            Message::Dedicate(m) => m.payload_len(),
            Message::VolumeAck(_) => 8,
            Message::DriveAck(_) | Message::ErrorAck(_) => 4,
            Message::Hold | Message::Release | Message::Shutdown => 0,
        }
    }

    /// Encode header and payload into a single buffer.
    pub fn encode(&self) -> Result<Bytes> {
        let len = self.payload_len();
        let mut buf = BytesMut::with_capacity(HDR_LEN + len);
        put_i32(&mut buf, MAGIC);
        put_i32(&mut buf, self.reqtype());
        put_i32(&mut buf, len as i32);
        match self {
            Message::VolumeRequest(m)
            | Message::Ping(m)
            | Message::DeleteVolume(m)
            | Message::Reselect(m)
            | Message::GetVolQueue(m) => m.encode(&mut buf)?,
            Message::DriveRequest(m) | Message::GetDrvQueue(m) => m.encode(&mut buf)?,
            Message::VolumePriority(m) => m.encode(&mut buf)?,
            Message::DeleteDrive(m) => m.encode(&mut buf)?,
            Message::Dedicate(m) => m.encode(&mut buf)?,
            Message::VolumeAck(a) => {
                put_i32(&mut buf, a.request_id);
                put_i32(&mut buf, a.queue_position);
            }
            Message::DriveAck(a) => put_i32(&mut buf, a.status),
            Message::ErrorAck(a) => put_i32(&mut buf, a.code),
            Message::Hold | Message::Release | Message::Shutdown => {}
        }
        debug_assert_eq!(buf.len(), HDR_LEN + len);
        Ok(buf.freeze())
    }

    /// Decode a payload for a known request type. The whole payload must be
    /// consumed; trailing bytes indicate a length mismatch.
    pub fn decode(reqtype_val: i32, mut payload: Bytes) -> Result<Message> {
        let msg = match reqtype_val {
            reqtype::VOL_REQ => Message::VolumeRequest(VolumeRequestMsg::decode(&mut payload)?),
            reqtype::PING => Message::Ping(VolumeRequestMsg::decode(&mut payload)?),
            reqtype::DEL_VOLREQ => Message::DeleteVolume(VolumeRequestMsg::decode(&mut payload)?),
            reqtype::RESELECT => Message::Reselect(VolumeRequestMsg::decode(&mut payload)?),
            reqtype::GET_VOLQUEUE => Message::GetVolQueue(VolumeRequestMsg::decode(&mut payload)?),
            reqtype::DRV_REQ => Message::DriveRequest(DriveRequestMsg::decode(&mut payload)?),
            reqtype::GET_DRVQUEUE => Message::GetDrvQueue(DriveRequestMsg::decode(&mut payload)?),
            reqtype::SET_PRIORITY => {
                Message::VolumePriority(VolumePriorityMsg::decode(&mut payload)?)
            }
            reqtype::DEL_DRVREQ => Message::DeleteDrive(DeleteDriveMsg::decode(&mut payload)?),
            reqtype::DEDICATE => Message::Dedicate(DedicateMsg::decode(&mut payload)?),
            reqtype::VOL_ACK => Message::VolumeAck(VolumeAck {
                request_id: get_i32(&mut payload)?,
                queue_position: get_i32(&mut payload)?,
            }),
            reqtype::DRV_ACK => Message::DriveAck(DriveAck {
                status: get_i32(&mut payload)?,
            }),
            reqtype::ERR_ACK => Message::ErrorAck(ErrorAck {
                code: get_i32(&mut payload)?,
            }),
            reqtype::HOLD => Message::Hold,
            reqtype::RELEASE => Message::Release,
            reqtype::SHUTDOWN => Message::Shutdown,
            other => {
                return Err(MountqError::protocol(format!(
                    "unknown request type 0x{other:x}"
                )))
            }
        };
        if !payload.is_empty() {
            return Err(MountqError::protocol(format!(
                "{} trailing bytes after payload",
                payload.len()
            )));
        }
        Ok(msg)
    }
}

/// Start-job hand-off to the copy-execution service. Sent under that
/// service's magic number, not the queue server's.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartJobMsg {
    pub request_id: i32,
    pub client_port: i32,
    pub client_uid: i32,
    pub client_gid: i32,
    pub client_host: String,
    pub drive_group: String,
    pub drive: String,
    pub client_name: String,
}

impl StartJobMsg {
    pub fn payload_len(&self) -> usize {
        4 * 4
            + string_len(&self.client_host)
            + string_len(&self.drive_group)
            + string_len(&self.drive)
            + string_len(&self.client_name)
    }

    pub fn encode(&self) -> Result<Bytes> {
        let len = self.payload_len();
        let mut buf = BytesMut::with_capacity(HDR_LEN + len);
        put_i32(&mut buf, COPYD_MAGIC);
        put_i32(&mut buf, reqtype::START_JOB);
        put_i32(&mut buf, len as i32);
        put_i32(&mut buf, self.request_id);
        put_i32(&mut buf, self.client_port);
        put_i32(&mut buf, self.client_uid);
        put_i32(&mut buf, self.client_gid);
        put_string(&mut buf, &self.client_host, limits::HOST)?;
        put_string(&mut buf, &self.drive_group, limits::DGN)?;
        put_string(&mut buf, &self.drive, limits::DRIVE)?;
        put_string(&mut buf, &self.client_name, limits::CLIENT_NAME)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let msg = Self {
            request_id: get_i32(&mut payload)?,
            client_port: get_i32(&mut payload)?,
            client_uid: get_i32(&mut payload)?,
            client_gid: get_i32(&mut payload)?,
            client_host: get_string(&mut payload, limits::HOST)?,
            drive_group: get_string(&mut payload, limits::DGN)?,
            drive: get_string(&mut payload, limits::DRIVE)?,
            client_name: get_string(&mut payload, limits::CLIENT_NAME)?,
        };
        if !payload.is_empty() {
            return Err(MountqError::protocol("trailing bytes after start-job"));
        }
        Ok(msg)
    }
}

/// Copy-execution service reply to a start-job: status 0 on acceptance,
/// otherwise a cause code plus a diagnostic message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartJobAck {
    pub status: i32,
    pub message: String,
}

impl StartJobAck {
    pub fn encode(&self) -> Result<Bytes> {
        let len = 4 + string_len(&self.message);
        let mut buf = BytesMut::with_capacity(HDR_LEN + len);
        put_i32(&mut buf, COPYD_MAGIC);
        put_i32(&mut buf, reqtype::START_JOB);
        put_i32(&mut buf, len as i32);
        put_i32(&mut buf, self.status);
        put_string(&mut buf, &self.message, limits::DEDICATE)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let ack = Self {
            status: get_i32(&mut payload)?,
            message: get_string(&mut payload, limits::DEDICATE)?,
        };
        if !payload.is_empty() {
            return Err(MountqError::protocol("trailing bytes after start-job ack"));
        }
        Ok(ack)
    }
}

/// Read one framed message off the stream. Checks magic and payload bounds
/// before any byte of payload is interpreted.
pub async fn read_message<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Message> {
    let (magic, reqtype_val, payload) = read_frame(stream).await?;
    if magic != MAGIC {
        return Err(MountqError::protocol(format!("bad magic 0x{magic:x}")));
    }
    Message::decode(reqtype_val, payload)
}

/// Read a raw frame (any magic). Used by the dispatcher, which speaks the
/// copy-execution protocol on the same framing.
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<(i32, i32, Bytes)> {
    let mut hdr = [0u8; HDR_LEN];
    stream.read_exact(&mut hdr).await?;
    let mut rd = &hdr[..];
    let magic = get_i32(&mut rd)?;
    let reqtype_val = get_i32(&mut rd)?;
    let len = get_i32(&mut rd)?;
    if len < 0 || len as usize > MAX_PAYLOAD {
        return Err(MountqError::protocol(format!("invalid payload length {len}")));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    Ok((magic, reqtype_val, Bytes::from(payload)))
}

pub async fn write_message<W: AsyncWrite + Unpin>(stream: &mut W, msg: &Message) -> Result<()> {
    let buf = msg.encode()?;
    stream.write_all(&buf).await?;
    Ok(())
}
