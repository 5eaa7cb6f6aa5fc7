use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::error::{MountqError, Result};
use crate::proto::{DriveRequestMsg, DriveStatus};
use crate::scheduler::dedication::DedicationRule;
use crate::scheduler::queue::AccessMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveState {
    Free,
    Busy,
    Down,
    Unknown,
}

impl std::fmt::Display for DriveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriveState::Free => write!(f, "free"),
            DriveState::Busy => write!(f, "busy"),
            DriveState::Down => write!(f, "down"),
            DriveState::Unknown => write!(f, "unknown"),
        }
    }
}

/// One registered tape drive. Created on the first status push from its
/// tape server, removed only by an admin delete.
#[derive(Debug, Clone)]
pub struct DriveRecord {
    pub id: i32,
    pub drive: String,
    pub server: String,
    pub drive_group: String,
    pub state: DriveState,
    pub assigned_request: Option<i32>,
    /// Copy-execution job id, adopted from the ASSIGN status push.
    pub job_id: i32,
    /// Volume physically on the drive; survives release until an explicit
    /// unmount push.
    pub mounted_volume: Option<String>,
    pub mode: AccessMode,
    pub usage_count: i32,
    pub error_count: i32,
    pub mb_transferred: i32,
    pub total_mb: i64,
    pub registered_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub last_reset: DateTime<Utc>,
    pub dedication: Option<DedicationRule>,
    /// After a dispatch failure the drive stays free but is skipped by the
    /// matching engine until this instant.
    pub retry_after: Option<Instant>,
}

impl DriveRecord {
    pub fn new(id: i32, drive: &str, server: &str, drive_group: &str) -> Self {
        let now = Utc::now();
        Self {
            id,
            drive: drive.to_string(),
            server: server.to_string(),
            drive_group: drive_group.to_string(),
            state: DriveState::Free,
            assigned_request: None,
            job_id: 0,
            mounted_volume: None,
            mode: AccessMode::Read,
            usage_count: 0,
            error_count: 0,
            mb_transferred: 0,
            total_mb: 0,
            registered_at: now,
            last_update: now,
            last_reset: now,
            dedication: None,
            retry_after: None,
        }
    }

    /// Eligible for matching: free, up, and not in dispatch-failure backoff.
    pub fn available(&self, now: Instant) -> bool {
        self.state == DriveState::Free && !self.in_backoff(now)
    }

    pub fn in_backoff(&self, now: Instant) -> bool {
        self.retry_after.map_or(false, |until| now < until)
    }

    /// Commit half of a match: free to busy with exactly one request.
    pub fn assign(&mut self, request_id: i32, volume_id: &str, mode: AccessMode) -> Result<()> {
        if self.state != DriveState::Free {
            return Err(MountqError::Conflict(format!(
                "drive {} is {}, cannot assign",
                self.drive, self.state
            )));
        }
        self.state = DriveState::Busy;
        self.assigned_request = Some(request_id);
        self.mounted_volume = Some(volume_id.to_string());
        self.mode = mode;
        self.usage_count += 1;
        self.retry_after = None;
        self.last_update = Utc::now();
        Ok(())
    }

    /// Undo a commit whose dispatch failed. The drive goes back to free but
    /// carries a backoff stamp so a dead copy-execution service is not
    /// hammered by the next matching pass.
    pub fn rollback(&mut self, backoff: std::time::Duration) {
        self.state = DriveState::Free;
        self.assigned_request = None;
        self.mounted_volume = None;
        self.job_id = 0;
        self.usage_count -= 1;
        self.error_count += 1;
        self.retry_after = Some(Instant::now() + backoff);
        self.last_update = Utc::now();
    }

    /// Busy to free on a completion push or admin kill. Returns the request
    /// that was running. The mounted volume stays until an unmount push.
    pub fn release(&mut self) -> Option<i32> {
        let req = self.assigned_request.take();
        self.state = DriveState::Free;
        self.job_id = 0;
        self.last_update = Utc::now();
        req
    }

    /// Take the drive down. Returns an assigned request to re-queue, if any.
    pub fn mark_down(&mut self) -> Option<i32> {
        let req = self.assigned_request.take();
        self.state = DriveState::Down;
        self.job_id = 0;
        self.last_update = Utc::now();
        req
    }

    /// Bring the drive (back) up. A busy drive's tape server restarting means
    /// its job is gone; the assigned request is returned for re-queueing.
    pub fn mark_up(&mut self) -> Option<i32> {
        let req = self.assigned_request.take();
        self.state = DriveState::Free;
        self.job_id = 0;
        self.retry_after = None;
        self.last_update = Utc::now();
        req
    }

    pub fn reset_counters(&mut self) {
        self.usage_count = 0;
        self.error_count = 0;
        self.mb_transferred = 0;
        self.total_mb = 0;
        self.last_reset = Utc::now();
    }

    /// Current status bitmask as reported to clients.
    pub fn status_bits(&self) -> DriveStatus {
        let mut bits = match self.state {
            DriveState::Free => DriveStatus::UNIT_UP | DriveStatus::UNIT_FREE,
            DriveState::Busy => DriveStatus::UNIT_UP | DriveStatus::UNIT_BUSY,
            DriveState::Down => DriveStatus::UNIT_DOWN,
            DriveState::Unknown => DriveStatus::UNIT_UNKNOWN,
        };
        if self.assigned_request.is_some() {
            bits |= DriveStatus::UNIT_ASSIGN;
        }
        if self.mounted_volume.is_some() {
            bits |= DriveStatus::VOL_MOUNT;
        }
        bits
    }

    /// Wire representation, used by drive-queue listings.
    pub fn to_msg(&self) -> DriveRequestMsg {
        DriveRequestMsg {
            status: self.status_bits().bits(),
            drive_id: self.id,
            request_id: self.assigned_request.unwrap_or(0),
            job_id: self.job_id,
            last_update: self.last_update.timestamp() as i32,
            last_reset: self.last_reset.timestamp() as i32,
            usage_count: self.usage_count,
            error_count: self.error_count,
            mb_transferred: self.mb_transferred,
            mode: self.mode.to_wire(),
            total_mb: self.total_mb,
            volume_id: self.mounted_volume.clone().unwrap_or_default(),
            server: self.server.clone(),
            drive: self.drive.clone(),
            drive_group: self.drive_group.clone(),
            dedicate: self
                .dedication
                .as_ref()
                .map(|r| r.as_str().to_string())
                .unwrap_or_default(),
        }
    }
}
