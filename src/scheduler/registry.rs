use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::config::ServerConfig;
use crate::error::{code, MountqError, Result};
use crate::proto::{
    DedicateMsg, DeleteDriveMsg, DriveRequestMsg, DriveStatus, VolumePriorityMsg, VolumeRequestMsg,
};
use crate::scheduler::dedication::DedicationRule;
use crate::scheduler::drive::{DriveRecord, DriveState};
use crate::scheduler::matcher::{self, MatchedJob};
use crate::scheduler::queue::{AccessMode, VolumeQueue, VolumeRequest};

/// Everything the scheduler knows about one drive group. Guarded by a single
/// mutex; scan-and-commit is the only read-then-mutate critical section and
/// it runs entirely under that lock.
#[derive(Debug)]
pub struct GroupState {
    pub name: String,
    pub queue: VolumeQueue,
    pub drives: Vec<DriveRecord>,
    /// Requests committed to a drive, keyed by request id. Moved back to the
    /// queue on rollback, drive-down, reselect or drive delete.
    pub running: HashMap<i32, VolumeRequest>,
}

impl GroupState {
    fn new(name: &str, max_queue_len: usize) -> Self {
        Self {
            name: name.to_string(),
            queue: VolumeQueue::with_capacity(max_queue_len),
            drives: Vec::new(),
            running: HashMap::new(),
        }
    }

    pub fn find_drive(&mut self, server: &str, drive: &str) -> Option<&mut DriveRecord> {
        self.drives
            .iter_mut()
            .find(|d| d.server == server && d.drive == drive)
    }

    /// Move a previously committed request back into the queue.
    fn requeue(&mut self, request_id: i32) {
        if let Some(req) = self.running.remove(&request_id) {
            let pos = self.queue.restore(req);
            tracing::info!(
                request_id,
                group = %self.name,
                position = pos,
                "Request re-queued"
            );
        }
    }
}

/// Result of a drive status push: the bitmask acknowledged to the tape
/// server and whether the push freed capacity worth a matching pass.
#[derive(Debug)]
pub struct DriveUpdate {
    pub status: i32,
    pub needs_match: bool,
}

/// Outcome of a volume-request delete.
#[derive(Debug)]
pub enum DeleteOutcome {
    /// The request was still pending and has been dequeued.
    Dequeued,
    /// The request was running; local state is released and the caller
    /// should attempt a best-effort remote abort.
    Killed {
        server: String,
        drive: String,
    },
}

/// Shared scheduler state: one lock per drive group, a registry-level mutex
/// only for group-map lookup and insert, and lock-free id counters.
pub struct Registry {
    groups: Mutex<HashMap<String, Arc<Mutex<GroupState>>>>,
    held: AtomicBool,
    next_request_id: AtomicI32,
    next_drive_id: AtomicI32,
    config: ServerConfig,
}

impl Registry {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            held: AtomicBool::new(config.start_held),
            next_request_id: AtomicI32::new(1),
            next_drive_id: AtomicI32::new(1),
            config,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Pause matching server-wide. Queued state is untouched.
    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
        tracing::info!("Matching held");
    }

    pub fn release_hold(&self) {
        self.held.store(false, Ordering::SeqCst);
        tracing::info!("Matching released");
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    pub async fn group(&self, name: &str) -> Option<Arc<Mutex<GroupState>>> {
        self.groups.lock().await.get(name).cloned()
    }

    async fn group_or_create(&self, name: &str) -> Arc<Mutex<GroupState>> {
        let mut groups = self.groups.lock().await;
        groups
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::info!(group = name, "Drive group created");
                Arc::new(Mutex::new(GroupState::new(name, self.config.max_queue_len)))
            })
            .clone()
    }

    async fn group_or_err(&self, name: &str) -> Result<Arc<Mutex<GroupState>>> {
        self.group(name).await.ok_or_else(|| {
            MountqError::validation(code::UNKNOWN_GROUP, format!("unknown drive group '{name}'"))
        })
    }

    /// Handles on every group, for cross-group operations and the matching
    /// passes that follow them.
    pub async fn all_groups(&self) -> Vec<Arc<Mutex<GroupState>>> {
        self.groups.lock().await.values().cloned().collect()
    }

    /// Queue a new mount request. Returns the assigned id, its 1-based queue
    /// position and the group handle for the follow-up matching pass.
    pub async fn enqueue(
        &self,
        msg: &VolumeRequestMsg,
    ) -> Result<(i32, usize, Arc<Mutex<GroupState>>)> {
        if msg.volume_id.is_empty() {
            return Err(MountqError::validation(code::BAD_ID, "empty volume id"));
        }
        if msg.drive_group.is_empty() {
            return Err(MountqError::validation(code::BAD_ID, "empty drive group"));
        }
        let mode = AccessMode::from_wire(msg.mode)?;
        let id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let req = VolumeRequest {
            id,
            volume_id: msg.volume_id.clone(),
            drive_group: msg.drive_group.clone(),
            mode,
            priority: msg.priority,
            client_host: msg.client_host.clone(),
            client_port: msg.client_port,
            client_uid: msg.client_uid,
            client_gid: msg.client_gid,
            client_name: msg.client_name.clone(),
            server: msg.server.clone(),
            drive: msg.drive.clone(),
            arrival: Utc::now(),
        };
        let group = self.group_or_create(&msg.drive_group).await;
        let pos = {
            let mut g = group.lock().await;
            g.queue.insert(req)?
        };
        tracing::info!(
            request_id = id,
            volume_id = %msg.volume_id,
            group = %msg.drive_group,
            mode = %mode,
            position = pos + 1,
            "Volume request queued"
        );
        Ok((id, pos + 1, group))
    }

    /// Drop a request whose enqueue acknowledgement could not be delivered.
    pub async fn forget_request(&self, group: &Arc<Mutex<GroupState>>, request_id: i32) {
        let mut g = group.lock().await;
        if g.queue.remove(request_id).is_some() {
            tracing::warn!(request_id, group = %g.name, "Client gone before ack, request dropped");
        }
    }

    /// Apply a drive status push. Registers the drive on its first UP push.
    pub async fn update_drive(&self, msg: &DriveRequestMsg) -> Result<DriveUpdate> {
        if msg.drive.is_empty() || msg.server.is_empty() || msg.drive_group.is_empty() {
            return Err(MountqError::validation(
                code::BAD_ID,
                "drive, server and drive group must be set",
            ));
        }
        let bits = DriveStatus::from_bits(msg.status).ok_or_else(|| {
            MountqError::validation(
                code::BAD_STATE,
                format!("unknown status bits 0x{:x}", msg.status),
            )
        })?;

        let group = if bits.contains(DriveStatus::UNIT_UP) {
            self.group_or_create(&msg.drive_group).await
        } else {
            self.group_or_err(&msg.drive_group).await?
        };
        let mut g = group.lock().await;

        if g.find_drive(&msg.server, &msg.drive).is_none() {
            if !bits.contains(DriveStatus::UNIT_UP) {
                return Err(MountqError::validation(
                    code::DRIVE_NOT_FOUND,
                    format!("unknown drive {}@{}", msg.drive, msg.server),
                ));
            }
            let id = self.next_drive_id.fetch_add(1, Ordering::SeqCst);
            let mut rec = DriveRecord::new(id, &msg.drive, &msg.server, &msg.drive_group);
            rec.usage_count = msg.usage_count;
            rec.error_count = msg.error_count;
            rec.mb_transferred = msg.mb_transferred;
            rec.total_mb = msg.total_mb;
            tracing::info!(
                drive_id = id,
                drive = %msg.drive,
                server = %msg.server,
                group = %msg.drive_group,
                "Drive registered"
            );
            g.drives.push(rec);
        }

        let idx = g
            .drives
            .iter()
            .position(|d| d.server == msg.server && d.drive == msg.drive)
            .ok_or_else(|| MountqError::Conflict("drive vanished during update".into()))?;

        let mut needs_match = false;
        let mut requeue: Option<i32> = None;
        let drive = &mut g.drives[idx];

        if bits.contains(DriveStatus::RESET_COUNTS) {
            drive.reset_counters();
        }

        if bits.contains(DriveStatus::UNIT_DOWN) {
            requeue = drive.mark_down();
            tracing::info!(drive = %drive.drive, server = %drive.server, "Drive down");
        } else if bits.contains(DriveStatus::UNIT_UP) {
            requeue = drive.mark_up();
            needs_match = true;
        } else if bits.intersects(DriveStatus::UNIT_RELEASE | DriveStatus::UNIT_FREE) {
            if drive.state == DriveState::Busy {
                if let Some(done) = drive.release() {
                    g.running.remove(&done);
                    tracing::info!(
                        request_id = done,
                        drive = %msg.drive,
                        "Job finished, drive released"
                    );
                }
            } else {
                drive.state = DriveState::Free;
            }
            needs_match = true;
        } else if bits.contains(DriveStatus::UNIT_ASSIGN) {
            // Tape server confirms the dispatched job and names its job id.
            if drive.assigned_request != Some(msg.request_id) {
                return Err(MountqError::validation(
                    code::BAD_STATE,
                    format!(
                        "assign push for request {} but drive runs {:?}",
                        msg.request_id, drive.assigned_request
                    ),
                ));
            }
            drive.job_id = msg.job_id;
            drive.state = DriveState::Busy;
        } else if bits.contains(DriveStatus::UNIT_UNKNOWN) {
            drive.state = DriveState::Unknown;
        }

        // Modifier bits, applied after the state transition.
        let drive = &mut g.drives[idx];
        if bits.contains(DriveStatus::VOL_UNMOUNT) {
            drive.mounted_volume = None;
        } else if bits.contains(DriveStatus::VOL_MOUNT) && !msg.volume_id.is_empty() {
            drive.mounted_volume = Some(msg.volume_id.clone());
            drive.mode = AccessMode::from_wire(msg.mode).unwrap_or(drive.mode);
        }
        if msg.mb_transferred > 0 {
            drive.mb_transferred = msg.mb_transferred;
        }
        if msg.total_mb > 0 {
            drive.total_mb = msg.total_mb;
        }
        drive.last_update = Utc::now();
        let status = drive.status_bits().bits();

        if let Some(request_id) = requeue {
            g.requeue(request_id);
            needs_match = true;
        }
        Ok(DriveUpdate { status, needs_match })
    }

    /// Queue position of a request: 0 when already running on a drive,
    /// otherwise 1-based position in the queue.
    pub async fn ping(&self, group_name: &str, request_id: i32) -> Result<i32> {
        let group = self.group_or_err(group_name).await?;
        let g = group.lock().await;
        if g.running.contains_key(&request_id) {
            return Ok(0);
        }
        g.queue
            .position(request_id)
            .map(|p| p as i32 + 1)
            .ok_or_else(|| {
                MountqError::validation(
                    code::REQUEST_NOT_FOUND,
                    format!("request {request_id} not found"),
                )
            })
    }

    /// Delete a volume request. A pending request is dequeued; a running one
    /// is released locally and reported for best-effort remote abort.
    pub async fn delete_volume(&self, group_name: &str, request_id: i32) -> Result<DeleteOutcome> {
        let group = self.group_or_err(group_name).await?;
        let mut g = group.lock().await;
        if g.queue.remove(request_id).is_some() {
            tracing::info!(request_id, group = group_name, "Pending request deleted");
            return Ok(DeleteOutcome::Dequeued);
        }
        if g.running.remove(&request_id).is_some() {
            let drive = g
                .drives
                .iter_mut()
                .find(|d| d.assigned_request == Some(request_id))
                .ok_or_else(|| MountqError::Conflict("running request without a drive".into()))?;
            drive.release();
            let outcome = DeleteOutcome::Killed {
                server: drive.server.clone(),
                drive: drive.drive.clone(),
            };
            tracing::info!(request_id, group = group_name, "Running request killed");
            return Ok(outcome);
        }
        Err(MountqError::validation(
            code::REQUEST_NOT_FOUND,
            format!("request {request_id} not found"),
        ))
    }

    /// Remove a drive from its group. A busy drive's request is re-queued
    /// first.
    pub async fn delete_drive(&self, msg: &DeleteDriveMsg) -> Result<bool> {
        let group = self.group_or_err(&msg.drive_group).await?;
        let mut g = group.lock().await;
        let idx = g
            .drives
            .iter()
            .position(|d| d.server == msg.server && d.drive == msg.drive)
            .ok_or_else(|| {
                MountqError::validation(
                    code::DRIVE_NOT_FOUND,
                    format!("unknown drive {}@{}", msg.drive, msg.server),
                )
            })?;
        let mut drive = g.drives.remove(idx);
        let requeued = drive.release();
        if let Some(request_id) = requeued {
            g.requeue(request_id);
        }
        tracing::info!(
            drive = %msg.drive,
            server = %msg.server,
            group = %msg.drive_group,
            "Drive deleted"
        );
        Ok(requeued.is_some())
    }

    /// Install or clear (empty pattern) a dedication rule on a drive.
    pub async fn dedicate(&self, msg: &DedicateMsg) -> Result<()> {
        let rule = if msg.dedicate.is_empty() {
            None
        } else {
            Some(DedicationRule::parse(&msg.dedicate)?)
        };
        let group = self.group_or_err(&msg.drive_group).await?;
        let mut g = group.lock().await;
        let drive = g.find_drive(&msg.server, &msg.drive).ok_or_else(|| {
            MountqError::validation(
                code::DRIVE_NOT_FOUND,
                format!("unknown drive {}@{}", msg.drive, msg.server),
            )
        })?;
        tracing::info!(
            drive = %msg.drive,
            server = %msg.server,
            rule = %msg.dedicate,
            "Dedication updated"
        );
        drive.dedication = rule;
        Ok(())
    }

    /// Adjust the priority of queued requests for a volume across all
    /// groups. Returns the number of entries touched.
    pub async fn set_priority(&self, msg: &VolumePriorityMsg) -> Result<i32> {
        if msg.volume_id.is_empty() {
            return Err(MountqError::validation(code::BAD_ID, "empty volume id"));
        }
        let mode = if msg.mode < 0 {
            None
        } else {
            Some(AccessMode::from_wire(msg.mode)?)
        };
        let mut touched = 0;
        for group in self.all_groups().await {
            let mut g = group.lock().await;
            touched += g.queue.set_priority(&msg.volume_id, mode, msg.priority);
        }
        tracing::info!(
            volume_id = %msg.volume_id,
            priority = msg.priority,
            touched,
            "Priority updated"
        );
        Ok(touched as i32)
    }

    /// Put a running request back in the queue and free its drive without
    /// aborting the request. The next matching pass may pick another drive.
    pub async fn reselect(&self, group_name: &str, request_id: i32) -> Result<()> {
        let group = self.group_or_err(group_name).await?;
        let mut g = group.lock().await;
        let drive = g
            .drives
            .iter_mut()
            .find(|d| d.assigned_request == Some(request_id))
            .ok_or_else(|| {
                MountqError::validation(
                    code::REQUEST_NOT_FOUND,
                    format!("request {request_id} is not running"),
                )
            })?;
        drive.release();
        drive.mounted_volume = None;
        g.requeue(request_id);
        Ok(())
    }

    /// Volume-queue rows for listings: pending entries plus running ones
    /// (with their drive id), optionally filtered by group.
    pub async fn volume_rows(&self, group_filter: Option<&str>) -> Result<Vec<VolumeRequestMsg>> {
        let mut rows = Vec::new();
        for group in self.filtered_groups(group_filter).await? {
            let g = group.lock().await;
            for req in g.queue.entries() {
                rows.push(req.to_msg());
            }
            for drive in &g.drives {
                if let Some(id) = drive.assigned_request {
                    if let Some(req) = g.running.get(&id) {
                        let mut row = req.to_msg();
                        row.drive_id = drive.id;
                        rows.push(row);
                    }
                }
            }
        }
        Ok(rows)
    }

    /// Drive-queue rows for listings, optionally filtered by group.
    pub async fn drive_rows(&self, group_filter: Option<&str>) -> Result<Vec<DriveRequestMsg>> {
        let mut rows = Vec::new();
        for group in self.filtered_groups(group_filter).await? {
            let g = group.lock().await;
            for drive in &g.drives {
                rows.push(drive.to_msg());
            }
        }
        Ok(rows)
    }

    async fn filtered_groups(
        &self,
        group_filter: Option<&str>,
    ) -> Result<Vec<Arc<Mutex<GroupState>>>> {
        match group_filter {
            Some(name) => Ok(vec![self.group_or_err(name).await?]),
            None => Ok(self.all_groups().await),
        }
    }

    /// Run one scan-and-commit pass over a group. Returns the committed
    /// matches for the caller to dispatch outside the lock. A no-op while
    /// held.
    pub async fn run_matching(&self, group: &Arc<Mutex<GroupState>>) -> Vec<MatchedJob> {
        if self.is_held() {
            return Vec::new();
        }
        let mut g = group.lock().await;
        // A hold can land while we wait for the group lock; the flag is only
        // authoritative once the lock is held.
        if self.is_held() {
            return Vec::new();
        }
        matcher::match_group(&mut g)
    }

    /// Undo a committed match whose dispatch failed.
    pub async fn rollback(&self, group: &Arc<Mutex<GroupState>>, job: MatchedJob) {
        let mut g = group.lock().await;
        matcher::rollback(&mut g, job, self.config.dispatch_retry_backoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume_msg(vid: &str, group: &str) -> VolumeRequestMsg {
        VolumeRequestMsg {
            volume_id: vid.into(),
            drive_group: group.into(),
            client_host: "client1.example.org".into(),
            client_port: 5555,
            client_uid: 1000,
            client_gid: 100,
            client_name: "stager".into(),
            ..Default::default()
        }
    }

    fn up_msg(drive: &str, server: &str, group: &str) -> DriveRequestMsg {
        DriveRequestMsg {
            status: (DriveStatus::UNIT_UP | DriveStatus::UNIT_FREE).bits(),
            drive: drive.into(),
            server: server.into(),
            drive_group: group.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn enqueue_assigns_monotonic_ids() {
        let reg = Registry::new(ServerConfig::default());
        let (id1, pos1, _) = reg.enqueue(&volume_msg("V00001", "DGN1")).await.unwrap();
        let mut second = volume_msg("V00002", "DGN1");
        second.client_port = 5556;
        let (id2, pos2, _) = reg.enqueue(&second).await.unwrap();
        assert!(id2 > id1);
        assert_eq!(pos1, 1);
        assert_eq!(pos2, 2);
    }

    #[tokio::test]
    async fn ping_reports_position_and_unknowns() {
        let reg = Registry::new(ServerConfig::default());
        let (id, _, _) = reg.enqueue(&volume_msg("V00001", "DGN1")).await.unwrap();
        assert_eq!(reg.ping("DGN1", id).await.unwrap(), 1);
        let err = reg.ping("DGN1", 9999).await.unwrap_err();
        assert_eq!(err.cause_code(), code::REQUEST_NOT_FOUND);
        let err = reg.ping("NOPE", id).await.unwrap_err();
        assert_eq!(err.cause_code(), code::UNKNOWN_GROUP);
    }

    #[tokio::test]
    async fn drive_registers_on_first_up_push() {
        let reg = Registry::new(ServerConfig::default());
        let upd = reg
            .update_drive(&up_msg("drive0", "tpsrv01.example.org", "DGN1"))
            .await
            .unwrap();
        assert!(upd.needs_match);
        let rows = reg.drive_rows(Some("DGN1")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].drive, "drive0");
    }

    #[tokio::test]
    async fn status_push_for_unknown_drive_rejected() {
        let reg = Registry::new(ServerConfig::default());
        reg.update_drive(&up_msg("drive0", "tpsrv01.example.org", "DGN1"))
            .await
            .unwrap();
        let mut msg = up_msg("drive9", "tpsrv01.example.org", "DGN1");
        msg.status = DriveStatus::UNIT_FREE.bits();
        let err = reg.update_drive(&msg).await.unwrap_err();
        assert_eq!(err.cause_code(), code::DRIVE_NOT_FOUND);
    }

    #[tokio::test]
    async fn down_while_busy_requeues_request() {
        let reg = Registry::new(ServerConfig::default());
        reg.update_drive(&up_msg("drive0", "tpsrv01.example.org", "DGN1"))
            .await
            .unwrap();
        let (id, _, group) = reg.enqueue(&volume_msg("V00001", "DGN1")).await.unwrap();
        let jobs = reg.run_matching(&group).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(reg.ping("DGN1", id).await.unwrap(), 0);

        let mut down = up_msg("drive0", "tpsrv01.example.org", "DGN1");
        down.status = DriveStatus::UNIT_DOWN.bits();
        reg.update_drive(&down).await.unwrap();
        assert_eq!(reg.ping("DGN1", id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn hold_blocks_matching() {
        let reg = Registry::new(ServerConfig::default());
        reg.update_drive(&up_msg("drive0", "tpsrv01.example.org", "DGN1"))
            .await
            .unwrap();
        reg.hold();
        let (_, _, group) = reg.enqueue(&volume_msg("V00001", "DGN1")).await.unwrap();
        assert!(reg.run_matching(&group).await.is_empty());
        reg.release_hold();
        assert_eq!(reg.run_matching(&group).await.len(), 1);
    }

    #[tokio::test]
    async fn hold_during_lock_wait_blocks_commit() {
        let reg = Arc::new(Registry::new(ServerConfig::default()));
        reg.update_drive(&up_msg("drive0", "tpsrv01.example.org", "DGN1"))
            .await
            .unwrap();
        let (_, _, group) = reg.enqueue(&volume_msg("V00001", "DGN1")).await.unwrap();

        // Park the group lock, let a matching pass start and block on it,
        // then hold the server before handing the lock over.
        let guard = group.lock().await;
        let task = {
            let reg = reg.clone();
            let group = group.clone();
            tokio::spawn(async move { reg.run_matching(&group).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        reg.hold();
        drop(guard);

        assert!(task.await.unwrap().is_empty());
        reg.release_hold();
        assert_eq!(reg.run_matching(&group).await.len(), 1);
    }

    #[tokio::test]
    async fn dedicate_validates_rule_and_drive() {
        let reg = Registry::new(ServerConfig::default());
        reg.update_drive(&up_msg("drive0", "tpsrv01.example.org", "DGN1"))
            .await
            .unwrap();
        let mut msg = DedicateMsg {
            client_host: "admin.example.org".into(),
            server: "tpsrv01.example.org".into(),
            drive: "drive0".into(),
            drive_group: "DGN1".into(),
            dedicate: "uid=42".into(),
            ..Default::default()
        };
        reg.dedicate(&msg).await.unwrap();
        msg.dedicate = "bogus".into();
        let err = reg.dedicate(&msg).await.unwrap_err();
        assert_eq!(err.cause_code(), code::BAD_DEDICATION);
        msg.dedicate = String::new();
        msg.drive = "drive9".into();
        let err = reg.dedicate(&msg).await.unwrap_err();
        assert_eq!(err.cause_code(), code::DRIVE_NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_pending_request_dequeues() {
        let reg = Registry::new(ServerConfig::default());
        let (id, _, _) = reg.enqueue(&volume_msg("V00001", "DGN1")).await.unwrap();
        assert!(matches!(
            reg.delete_volume("DGN1", id).await.unwrap(),
            DeleteOutcome::Dequeued
        ));
        let err = reg.ping("DGN1", id).await.unwrap_err();
        assert_eq!(err.cause_code(), code::REQUEST_NOT_FOUND);
    }
}
