use std::sync::Arc;

use mountq::config::ServerConfig;
use mountq::proto::{DedicateMsg, DeleteDriveMsg, DriveRequestMsg, DriveStatus, VolumePriorityMsg, VolumeRequestMsg};
use mountq::scheduler::{DeleteOutcome, DriveState, Registry};

fn volume_msg(vid: &str, group: &str, port: i32) -> VolumeRequestMsg {
    VolumeRequestMsg {
        client_port: port,
        client_uid: 1000,
        client_gid: 100,
        client_host: "client1.example.org".to_string(),
        volume_id: vid.to_string(),
        drive_group: group.to_string(),
        client_name: "stager".to_string(),
        ..Default::default()
    }
}

fn drive_up(drive: &str, server: &str, group: &str) -> DriveRequestMsg {
    DriveRequestMsg {
        status: (DriveStatus::UNIT_UP | DriveStatus::UNIT_FREE).bits(),
        drive: drive.to_string(),
        server: server.to_string(),
        drive_group: group.to_string(),
        ..Default::default()
    }
}

fn drive_status(drive: &str, server: &str, group: &str, status: DriveStatus) -> DriveRequestMsg {
    DriveRequestMsg {
        status: status.bits(),
        drive: drive.to_string(),
        server: server.to_string(),
        drive_group: group.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_priority_then_fifo_matching_order() {
    let registry = Registry::new(ServerConfig::default());

    // A and B at default priority, C boosted. Expected service order: C, A, B.
    let (id_a, _, group) = registry.enqueue(&volume_msg("VOLA00", "DGN1", 1)).await.unwrap();
    let (id_b, _, _) = registry.enqueue(&volume_msg("VOLB00", "DGN1", 2)).await.unwrap();
    let mut c = volume_msg("VOLC00", "DGN1", 3);
    c.priority = 5;
    let (id_c, _, _) = registry.enqueue(&c).await.unwrap();

    registry
        .update_drive(&drive_up("drive0", "tpsrv01", "DGN1"))
        .await
        .unwrap();

    let mut order = Vec::new();
    for _ in 0..3 {
        let jobs = registry.run_matching(&group).await;
        assert_eq!(jobs.len(), 1);
        order.push(jobs[0].request.id);
        // Tape server reports the job done, freeing the drive.
        registry
            .update_drive(&drive_status(
                "drive0",
                "tpsrv01",
                "DGN1",
                DriveStatus::UNIT_RELEASE | DriveStatus::VOL_UNMOUNT,
            ))
            .await
            .unwrap();
    }
    assert_eq!(order, vec![id_c, id_a, id_b]);
}

#[tokio::test]
async fn test_at_most_one_job_per_drive() {
    let registry = Registry::new(ServerConfig::default());
    registry
        .update_drive(&drive_up("drive0", "tpsrv01", "DGN1"))
        .await
        .unwrap();
    let (_, _, group) = registry.enqueue(&volume_msg("VOL001", "DGN1", 1)).await.unwrap();
    registry.enqueue(&volume_msg("VOL002", "DGN1", 2)).await.unwrap();
    registry.enqueue(&volume_msg("VOL003", "DGN1", 3)).await.unwrap();

    let jobs = registry.run_matching(&group).await;
    assert_eq!(jobs.len(), 1);
    // The drive is busy now, nothing more can commit.
    assert!(registry.run_matching(&group).await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_enqueue_register_match_keeps_one_job_per_drive() {
    let registry = Arc::new(Registry::new(ServerConfig::default()));

    // Race drive registrations against enqueue-and-match tasks on one group.
    let mut tasks = Vec::new();
    for i in 0..8 {
        let registry = registry.clone();
        tasks.push(tokio::spawn(async move {
            registry
                .update_drive(&drive_up(&format!("drive{i}"), "tpsrv01", "DGN1"))
                .await
                .unwrap();
        }));
    }
    for i in 0..64i32 {
        let registry = registry.clone();
        tasks.push(tokio::spawn(async move {
            let vid = format!("VOL{i:03}");
            let (_, _, group) = registry
                .enqueue(&volume_msg(&vid, "DGN1", 6000 + i))
                .await
                .unwrap();
            registry.run_matching(&group).await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let group = registry.group("DGN1").await.unwrap();
    let g = group.lock().await;
    let assigned: Vec<i32> = g
        .drives
        .iter()
        .filter(|d| d.state == DriveState::Busy)
        .filter_map(|d| d.assigned_request)
        .collect();

    // Every committed job occupies exactly one drive and no drive carries
    // more than one request.
    assert_eq!(assigned.len(), g.running.len());
    let mut unique = assigned.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), assigned.len());
    for id in &assigned {
        assert!(g.running.contains_key(id));
    }
    assert_eq!(g.queue.len() + g.running.len(), 64);
}

#[tokio::test]
async fn test_dedicated_drive_only_serves_admitted_requests() {
    let registry = Registry::new(ServerConfig::default());
    registry
        .update_drive(&drive_up("drive0", "tpsrv01", "DGN1"))
        .await
        .unwrap();
    registry
        .dedicate(&DedicateMsg {
            server: "tpsrv01".to_string(),
            drive: "drive0".to_string(),
            drive_group: "DGN1".to_string(),
            dedicate: "uid=42".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    let (_, _, group) = registry.enqueue(&volume_msg("VOL001", "DGN1", 1)).await.unwrap();
    assert!(registry.run_matching(&group).await.is_empty());

    let mut admitted = volume_msg("VOL002", "DGN1", 2);
    admitted.client_uid = 42;
    let (id, _, _) = registry.enqueue(&admitted).await.unwrap();
    let jobs = registry.run_matching(&group).await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].request.id, id);

    // Clearing the rule opens the drive again.
    registry
        .dedicate(&DedicateMsg {
            server: "tpsrv01".to_string(),
            drive: "drive0".to_string(),
            drive_group: "DGN1".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_hold_pauses_matching_without_losing_state() {
    let registry = Registry::new(ServerConfig::default());
    registry
        .update_drive(&drive_up("drive0", "tpsrv01", "DGN1"))
        .await
        .unwrap();
    let (id, _, group) = registry.enqueue(&volume_msg("VOL001", "DGN1", 1)).await.unwrap();

    registry.hold();
    assert!(registry.run_matching(&group).await.is_empty());
    // Still queued at position 1.
    assert_eq!(registry.ping("DGN1", id).await.unwrap(), 1);

    registry.release_hold();
    let jobs = registry.run_matching(&group).await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(registry.ping("DGN1", id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_rollback_restores_queue_position() {
    let registry = Registry::new(ServerConfig::default());
    registry
        .update_drive(&drive_up("drive0", "tpsrv01", "DGN1"))
        .await
        .unwrap();
    let (id1, _, group) = registry.enqueue(&volume_msg("VOL001", "DGN1", 1)).await.unwrap();
    registry.enqueue(&volume_msg("VOL002", "DGN1", 2)).await.unwrap();

    let jobs = registry.run_matching(&group).await;
    assert_eq!(jobs[0].request.id, id1);
    registry.rollback(&group, jobs[0].clone()).await;

    // Back at the head of the queue, drive free but in backoff.
    assert_eq!(registry.ping("DGN1", id1).await.unwrap(), 1);
    assert!(registry.run_matching(&group).await.is_empty());
}

#[tokio::test]
async fn test_delete_drive_requeues_running_request() {
    let registry = Registry::new(ServerConfig::default());
    registry
        .update_drive(&drive_up("drive0", "tpsrv01", "DGN1"))
        .await
        .unwrap();
    let (id, _, group) = registry.enqueue(&volume_msg("VOL001", "DGN1", 1)).await.unwrap();
    assert_eq!(registry.run_matching(&group).await.len(), 1);
    assert_eq!(registry.ping("DGN1", id).await.unwrap(), 0);

    let requeued = registry
        .delete_drive(&DeleteDriveMsg {
            server: "tpsrv01".to_string(),
            drive: "drive0".to_string(),
            drive_group: "DGN1".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(requeued);
    assert_eq!(registry.ping("DGN1", id).await.unwrap(), 1);
    assert!(registry.drive_rows(Some("DGN1")).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_running_request_frees_drive() {
    let registry = Registry::new(ServerConfig::default());
    registry
        .update_drive(&drive_up("drive0", "tpsrv01", "DGN1"))
        .await
        .unwrap();
    let (id, _, group) = registry.enqueue(&volume_msg("VOL001", "DGN1", 1)).await.unwrap();
    assert_eq!(registry.run_matching(&group).await.len(), 1);

    let outcome = registry.delete_volume("DGN1", id).await.unwrap();
    assert!(matches!(outcome, DeleteOutcome::Killed { .. }));

    // The drive is free again and can serve the next request.
    let (id2, _, _) = registry.enqueue(&volume_msg("VOL002", "DGN1", 2)).await.unwrap();
    let jobs = registry.run_matching(&group).await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].request.id, id2);
}

#[tokio::test]
async fn test_reselect_requeues_without_abort() {
    let registry = Registry::new(ServerConfig::default());
    registry
        .update_drive(&drive_up("drive0", "tpsrv01", "DGN1"))
        .await
        .unwrap();
    registry
        .update_drive(&drive_up("drive1", "tpsrv02", "DGN1"))
        .await
        .unwrap();

    let mut pinned = volume_msg("VOL001", "DGN1", 1);
    pinned.server = "tpsrv01".to_string();
    let (id, _, group) = registry.enqueue(&pinned).await.unwrap();
    let jobs = registry.run_matching(&group).await;
    assert_eq!(jobs[0].server, "tpsrv01");

    registry.reselect("DGN1", id).await.unwrap();
    assert_eq!(registry.ping("DGN1", id).await.unwrap(), 1);
    // Affinity still points at tpsrv01, so it lands there again.
    let jobs = registry.run_matching(&group).await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].server, "tpsrv01");
}

#[tokio::test]
async fn test_set_priority_promotes_volume() {
    let registry = Registry::new(ServerConfig::default());
    let (_, _, group) = registry.enqueue(&volume_msg("VOL001", "DGN1", 1)).await.unwrap();
    let (id2, _, _) = registry.enqueue(&volume_msg("VOL002", "DGN1", 2)).await.unwrap();

    let touched = registry
        .set_priority(&VolumePriorityMsg {
            priority: 10,
            mode: -1,
            volume_id: "VOL002".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(touched, 1);

    registry
        .update_drive(&drive_up("drive0", "tpsrv01", "DGN1"))
        .await
        .unwrap();
    let jobs = registry.run_matching(&group).await;
    assert_eq!(jobs[0].request.id, id2);
}

#[tokio::test]
async fn test_volume_rows_include_running_requests() {
    let registry = Registry::new(ServerConfig::default());
    registry
        .update_drive(&drive_up("drive0", "tpsrv01", "DGN1"))
        .await
        .unwrap();
    let (id, _, group) = registry.enqueue(&volume_msg("VOL001", "DGN1", 1)).await.unwrap();
    registry.enqueue(&volume_msg("VOL002", "DGN1", 2)).await.unwrap();
    registry.run_matching(&group).await;

    let rows = registry.volume_rows(Some("DGN1")).await.unwrap();
    assert_eq!(rows.len(), 2);
    let running = rows.iter().find(|r| r.request_id == id).unwrap();
    assert!(running.drive_id > 0);
}
