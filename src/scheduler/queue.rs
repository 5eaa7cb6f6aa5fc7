use chrono::{DateTime, Utc};

use crate::error::{code, MountqError, Result};
use crate::proto::VolumeRequestMsg;

/// Direction of a requested mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

impl AccessMode {
    pub fn from_wire(v: i32) -> Result<Self> {
        match v {
            0 => Ok(AccessMode::Read),
            1 => Ok(AccessMode::Write),
            other => Err(MountqError::validation(
                code::BAD_ID,
                format!("invalid access mode {other}"),
            )),
        }
    }

    pub fn to_wire(self) -> i32 {
        match self {
            AccessMode::Read => 0,
            AccessMode::Write => 1,
        }
    }
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessMode::Read => write!(f, "read"),
            AccessMode::Write => write!(f, "write"),
        }
    }
}

/// A queued mount request. Immutable once queued except for `priority`,
/// which the set-priority admin operation may adjust.
#[derive(Debug, Clone)]
pub struct VolumeRequest {
    pub id: i32,
    pub volume_id: String,
    pub drive_group: String,
    pub mode: AccessMode,
    pub priority: i32,
    pub client_host: String,
    pub client_port: i32,
    pub client_uid: i32,
    pub client_gid: i32,
    pub client_name: String,
    /// Requested tape server, empty for any.
    pub server: String,
    /// Requested drive unit, empty for any.
    pub drive: String,
    pub arrival: DateTime<Utc>,
}

impl VolumeRequest {
    /// Wire representation, used by queue listings.
    pub fn to_msg(&self) -> VolumeRequestMsg {
        VolumeRequestMsg {
            request_id: self.id,
            drive_id: 0,
            priority: self.priority,
            client_port: self.client_port,
            client_uid: self.client_uid,
            client_gid: self.client_gid,
            mode: self.mode.to_wire(),
            arrival_time: self.arrival.timestamp() as i32,
            client_host: self.client_host.clone(),
            volume_id: self.volume_id.clone(),
            server: self.server.clone(),
            drive: self.drive.clone(),
            drive_group: self.drive_group.clone(),
            client_name: self.client_name.clone(),
        }
    }
}

/// Pending requests of one drive group, kept sorted by descending priority
/// and then ascending request id. Request ids are assigned monotonically at
/// enqueue, so id order is arrival order.
#[derive(Debug)]
pub struct VolumeQueue {
    entries: Vec<VolumeRequest>,
    max_len: usize,
}

impl VolumeQueue {
    pub fn with_capacity(max_len: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_len,
        }
    }

    fn sort(&mut self) {
        self.entries
            .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
    }

    /// Add a new request. Returns its position (0 = next in line). A request
    /// from the same client endpoint for the same volume and mode is a
    /// duplicate and is rejected.
    pub fn insert(&mut self, req: VolumeRequest) -> Result<usize> {
        if self.entries.len() >= self.max_len {
            return Err(MountqError::validation(
                code::SYSTEM,
                format!("queue full ({} entries)", self.max_len),
            ));
        }
        let duplicate = self.entries.iter().any(|e| {
            e.volume_id == req.volume_id
                && e.mode == req.mode
                && e.client_host == req.client_host
                && e.client_port == req.client_port
        });
        if duplicate {
            return Err(MountqError::validation(
                code::ALREADY_QUEUED,
                format!("volume {} already queued by this client", req.volume_id),
            ));
        }
        Ok(self.restore(req))
    }

    /// Put a request back without duplicate or capacity checks. Used by the
    /// dispatch rollback; since ordering is a total order over (priority, id),
    /// the request lands at its original relative position.
    pub fn restore(&mut self, req: VolumeRequest) -> usize {
        let id = req.id;
        self.entries.push(req);
        self.sort();
        self.position(id).unwrap_or(self.entries.len() - 1)
    }

    /// Current position of a request, 0 = next in line.
    pub fn position(&self, id: i32) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }

    pub fn remove(&mut self, id: i32) -> Option<VolumeRequest> {
        let idx = self.position(id)?;
        Some(self.entries.remove(idx))
    }

    /// Adjust the priority of every queued request for a volume, optionally
    /// restricted to one access mode. Returns the number of entries touched.
    pub fn set_priority(
        &mut self,
        volume_id: &str,
        mode: Option<AccessMode>,
        priority: i32,
    ) -> usize {
        let mut touched = 0;
        for e in &mut self.entries {
            if e.volume_id == volume_id && mode.map_or(true, |m| e.mode == m) {
                e.priority = priority;
                touched += 1;
            }
        }
        if touched > 0 {
            self.sort();
        }
        touched
    }

    pub fn entries(&self) -> &[VolumeRequest] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
