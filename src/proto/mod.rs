//! Legacy fixed-framing wire protocol.
//!
//! Every message is a 12-byte header `{magic, reqtype, len}` of big-endian
//! i32 followed by `len` bytes of payload: fixed-width integers and bounded,
//! NUL-terminated strings. The codec is pure; it touches no shared state.

pub mod message;
pub mod wire;

pub use message::{
    DedicateMsg, DeleteDriveMsg, DriveAck, DriveRequestMsg, ErrorAck, Message, StartJobAck,
    StartJobMsg, VolumeAck, VolumePriorityMsg, VolumeRequestMsg,
};

use bitflags::bitflags;

/// Magic number of the queue-server protocol.
pub const MAGIC: i32 = 0x8537;

/// Magic number of the copy-execution service protocol (start-job hand-off).
pub const COPYD_MAGIC: i32 = 0x120D_0301;

/// Header size on the wire: magic + reqtype + len.
pub const HDR_LEN: usize = 12;

/// Largest acceptable payload, derived from the drive-request formula with
/// all string fields at their maxima.
pub const MAX_PAYLOAD: usize = 4096;

/// Request types. The numeric values are part of the external protocol.
pub mod reqtype {
    pub const VOL_REQ: i32 = 1;
    pub const DRV_REQ: i32 = 2;
    pub const PING: i32 = 3;
    pub const START_JOB: i32 = 4;
    pub const SHUTDOWN: i32 = 5;
    pub const HOLD: i32 = 6;
    pub const RELEASE: i32 = 7;
    pub const RESELECT: i32 = 9;
    pub const DEL_VOLREQ: i32 = 12;
    pub const DEL_DRVREQ: i32 = 13;
    pub const GET_VOLQUEUE: i32 = 14;
    pub const GET_DRVQUEUE: i32 = 15;
    pub const SET_PRIORITY: i32 = 16;
    pub const DEDICATE: i32 = 17;
    pub const VOL_ACK: i32 = 20;
    pub const DRV_ACK: i32 = 21;
    pub const ERR_ACK: i32 = 22;
}

/// Maximum string-field content lengths in bytes, excluding the NUL
/// terminator. Overflow is rejected, never truncated.
pub mod limits {
    pub const HOST: usize = 63;
    pub const VID: usize = 6;
    pub const DRIVE: usize = 8;
    pub const DGN: usize = 6;
    pub const CLIENT_NAME: usize = 14;
    pub const DEDICATE: usize = 1023;
}

bitflags! {
    /// Drive status bits as pushed by tape-server daemons. The bit layout is
    /// part of the external protocol; the registry maps it to a typed state
    /// at the API boundary.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DriveStatus: i32 {
        const UNIT_UP      = 0x001;
        const UNIT_DOWN    = 0x002;
        const UNIT_ASSIGN  = 0x008;
        const UNIT_RELEASE = 0x010;
        const UNIT_BUSY    = 0x020;
        const UNIT_FREE    = 0x040;
        const UNIT_UNKNOWN = 0x080;
        const VOL_MOUNT    = 0x100;
        const VOL_UNMOUNT  = 0x200;
        const RESET_COUNTS = 0x400;
    }
}
