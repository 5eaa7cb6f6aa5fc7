//! Greedy scan-and-commit matching. Runs entirely under the group lock;
//! the caller dispatches the returned matches with no lock held and rolls
//! back on dispatch failure.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::scheduler::queue::VolumeRequest;
use crate::scheduler::registry::GroupState;

/// A committed request/drive pairing awaiting dispatch.
#[derive(Debug, Clone)]
pub struct MatchedJob {
    pub request: VolumeRequest,
    pub drive_id: i32,
    pub drive: String,
    pub server: String,
}

/// One pass over a group: for each free eligible drive, commit the
/// highest-priority earliest-arrival request it admits. Greedy per-drive
/// first; a request skipped for one drive may still land on the next.
pub fn match_group(group: &mut GroupState) -> Vec<MatchedJob> {
    let now = Utc::now();
    let mono = Instant::now();
    let mut committed = Vec::new();

    // A volume already mounted for a running request must not be matched to
    // a second drive.
    let mut volumes_in_use: HashSet<String> = group
        .running
        .values()
        .map(|r| r.volume_id.clone())
        .collect();

    for di in 0..group.drives.len() {
        if !group.drives[di].available(mono) {
            continue;
        }
        let pick = group.queue.entries().iter().find_map(|req| {
            let drive = &group.drives[di];
            if volumes_in_use.contains(&req.volume_id) {
                return None;
            }
            if !req.server.is_empty() && req.server != drive.server {
                return None;
            }
            if !req.drive.is_empty() && req.drive != drive.drive {
                return None;
            }
            if let Some(rule) = &drive.dedication {
                if !rule.admits(req, now) {
                    return None;
                }
            }
            Some(req.id)
        });
        let Some(request_id) = pick else { continue };
        let Some(req) = group.queue.remove(request_id) else {
            continue;
        };
        if group.drives[di]
            .assign(req.id, &req.volume_id, req.mode)
            .is_err()
        {
            group.queue.restore(req);
            continue;
        }
        volumes_in_use.insert(req.volume_id.clone());
        group.running.insert(req.id, req.clone());
        let drive = &group.drives[di];
        tracing::info!(
            request_id = req.id,
            volume_id = %req.volume_id,
            drive = %drive.drive,
            server = %drive.server,
            group = %group.name,
            "Request matched to drive"
        );
        committed.push(MatchedJob {
            request: req,
            drive_id: drive.id,
            drive: drive.drive.clone(),
            server: drive.server.clone(),
        });
    }
    committed
}

/// Undo a committed match whose dispatch failed: the request returns to its
/// original queue position and the drive goes back to free with a retry
/// backoff.
pub fn rollback(group: &mut GroupState, job: MatchedJob, backoff: Duration) {
    group.running.remove(&job.request.id);
    if let Some(drive) = group.drives.iter_mut().find(|d| d.id == job.drive_id) {
        drive.rollback(backoff);
    }
    let request_id = job.request.id;
    let pos = group.queue.restore(job.request);
    tracing::warn!(
        request_id,
        drive = %job.drive,
        group = %group.name,
        position = pos,
        "Dispatch failed, match rolled back"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::dedication::DedicationRule;
    use crate::scheduler::drive::{DriveRecord, DriveState};
    use crate::scheduler::queue::{AccessMode, VolumeQueue, VolumeRequest};
    use std::collections::HashMap;

    fn group_with(drives: Vec<DriveRecord>) -> GroupState {
        GroupState {
            name: "DGN1".into(),
            queue: VolumeQueue::with_capacity(100),
            drives,
            running: HashMap::new(),
        }
    }

    fn drive(id: i32, name: &str) -> DriveRecord {
        DriveRecord::new(id, name, "tpsrv01.example.org", "DGN1")
    }

    fn req(id: i32, vid: &str, uid: i32) -> VolumeRequest {
        VolumeRequest {
            id,
            volume_id: vid.into(),
            drive_group: "DGN1".into(),
            mode: AccessMode::Read,
            priority: 0,
            client_host: "client1.example.org".into(),
            client_port: 5000 + id,
            client_uid: uid,
            client_gid: 100,
            client_name: "stager".into(),
            server: String::new(),
            drive: String::new(),
            arrival: Utc::now(),
        }
    }

    #[test]
    fn commits_at_most_one_request_per_drive() {
        let mut g = group_with(vec![drive(1, "drive0")]);
        g.queue.insert(req(1, "V00001", 1000)).unwrap();
        g.queue.insert(req(2, "V00002", 1000)).unwrap();
        let jobs = match_group(&mut g);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].request.id, 1);
        assert_eq!(g.drives[0].state, DriveState::Busy);
        assert_eq!(g.queue.len(), 1);
        // A second pass with no free drive commits nothing.
        assert!(match_group(&mut g).is_empty());
    }

    #[test]
    fn dedication_skips_ineligible_requests() {
        let mut d = drive(1, "drive0");
        d.dedication = Some(DedicationRule::parse("uid=42").unwrap());
        let mut g = group_with(vec![d]);
        g.queue.insert(req(1, "V00001", 1000)).unwrap();
        g.queue.insert(req(2, "V00002", 42)).unwrap();
        let jobs = match_group(&mut g);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].request.id, 2);
        assert_eq!(g.queue.entries()[0].id, 1);
    }

    #[test]
    fn volume_in_use_not_matched_twice() {
        let mut g = group_with(vec![drive(1, "drive0"), drive(2, "drive1")]);
        g.queue.insert(req(1, "V00001", 1000)).unwrap();
        let mut dup = req(2, "V00001", 1001);
        dup.client_host = "client2.example.org".into();
        g.queue.insert(dup).unwrap();
        let jobs = match_group(&mut g);
        assert_eq!(jobs.len(), 1);
        assert_eq!(g.queue.len(), 1);
    }

    #[test]
    fn server_affinity_restricts_placement() {
        let mut other = drive(2, "drive1");
        other.server = "tpsrv02.example.org".into();
        let mut g = group_with(vec![drive(1, "drive0"), other]);
        let mut r = req(1, "V00001", 1000);
        r.server = "tpsrv02.example.org".into();
        g.queue.insert(r).unwrap();
        let jobs = match_group(&mut g);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].server, "tpsrv02.example.org");
    }

    #[test]
    fn backoff_drive_skipped() {
        let mut d = drive(1, "drive0");
        d.retry_after = Some(Instant::now() + Duration::from_secs(30));
        let mut g = group_with(vec![d]);
        g.queue.insert(req(1, "V00001", 1000)).unwrap();
        assert!(match_group(&mut g).is_empty());
    }

    #[test]
    fn rollback_restores_queue_position_and_frees_drive() {
        let mut g = group_with(vec![drive(1, "drive0")]);
        g.queue.insert(req(1, "V00001", 1000)).unwrap();
        let mut second = req(2, "V00002", 1000);
        second.client_host = "client2.example.org".into();
        g.queue.insert(second).unwrap();
        let jobs = match_group(&mut g);
        rollback(&mut g, jobs[0].clone(), Duration::from_secs(30));
        assert_eq!(g.queue.entries()[0].id, 1);
        assert_eq!(g.drives[0].state, DriveState::Free);
        assert!(g.running.is_empty());
        // The drive is in backoff, so the next pass commits nothing.
        assert!(match_group(&mut g).is_empty());
    }
}
