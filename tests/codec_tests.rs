use bytes::Bytes;
use mountq::error::MountqError;
use mountq::proto::message::{read_message, write_message, StartJobAck, StartJobMsg};
use mountq::proto::{
    reqtype, DedicateMsg, DeleteDriveMsg, DriveAck, DriveRequestMsg, ErrorAck, Message, VolumeAck,
    VolumePriorityMsg, VolumeRequestMsg, COPYD_MAGIC, HDR_LEN,
};

fn volume_request() -> VolumeRequestMsg {
    VolumeRequestMsg {
        request_id: 17,
        drive_id: 0,
        priority: 3,
        client_port: 5555,
        client_uid: 1042,
        client_gid: 100,
        mode: 1,
        arrival_time: 1_766_000_000,
        client_host: "client1.example.org".to_string(),
        volume_id: "V12345".to_string(),
        server: "tpsrv01".to_string(),
        drive: "drive0".to_string(),
        drive_group: "DGN1".to_string(),
        client_name: "stager".to_string(),
    }
}

fn drive_request() -> DriveRequestMsg {
    DriveRequestMsg {
        status: 0x041,
        drive_id: 2,
        request_id: 17,
        job_id: 99,
        last_update: 1_766_000_100,
        last_reset: 1_765_000_000,
        usage_count: 12,
        error_count: 1,
        mb_transferred: 800,
        mode: 0,
        total_mb: 7_340_032,
        volume_id: "V12345".to_string(),
        server: "tpsrv01.example.org".to_string(),
        drive: "drive0".to_string(),
        drive_group: "DGN1".to_string(),
        dedicate: "uid=42,host=client*".to_string(),
    }
}

async fn round_trip(msg: Message) -> Message {
    let (mut a, mut b) = tokio::io::duplex(8192);
    write_message(&mut a, &msg).await.unwrap();
    read_message(&mut b).await.unwrap()
}

#[tokio::test]
async fn test_every_message_type_round_trips() {
    let messages = vec![
        Message::VolumeRequest(volume_request()),
        Message::Ping(volume_request()),
        Message::DeleteVolume(volume_request()),
        Message::Reselect(volume_request()),
        Message::GetVolQueue(volume_request()),
        Message::DriveRequest(drive_request()),
        Message::GetDrvQueue(drive_request()),
        Message::VolumePriority(VolumePriorityMsg {
            priority: 9,
            client_uid: 0,
            client_gid: 0,
            mode: -1,
            lifespan: 0,
            client_host: "admin.example.org".to_string(),
            volume_id: "V12345".to_string(),
        }),
        Message::DeleteDrive(DeleteDriveMsg {
            client_uid: 0,
            client_gid: 0,
            client_host: "admin.example.org".to_string(),
            server: "tpsrv01".to_string(),
            drive: "drive0".to_string(),
            drive_group: "DGN1".to_string(),
        }),
        Message::Dedicate(DedicateMsg {
            client_uid: 0,
            client_gid: 0,
            client_host: "admin.example.org".to_string(),
            server: "tpsrv01".to_string(),
            drive: "drive0".to_string(),
            drive_group: "DGN1".to_string(),
            dedicate: "vid=V12*,timew=22:00-06:00".to_string(),
        }),
        Message::VolumeAck(VolumeAck {
            request_id: 17,
            queue_position: 4,
        }),
        Message::DriveAck(DriveAck { status: 0x041 }),
        Message::ErrorAck(ErrorAck { code: 1002 }),
        Message::Hold,
        Message::Release,
        Message::Shutdown,
    ];
    for msg in messages {
        let got = round_trip(msg.clone()).await;
        assert_eq!(got, msg);
    }
}

#[tokio::test]
async fn test_boundary_length_strings_accepted() {
    let mut msg = volume_request();
    msg.client_host = "h".repeat(63);
    msg.volume_id = "V".repeat(6);
    msg.drive = "d".repeat(8);
    msg.drive_group = "g".repeat(6);
    msg.client_name = "n".repeat(14);
    let got = round_trip(Message::VolumeRequest(msg.clone())).await;
    assert_eq!(got, Message::VolumeRequest(msg));
}

#[test]
fn test_over_length_field_rejected_on_encode() {
    let mut msg = volume_request();
    msg.volume_id = "V123456".to_string();
    let err = Message::VolumeRequest(msg).encode().unwrap_err();
    assert!(matches!(err, MountqError::Protocol(_)));
}

#[test]
fn test_over_length_field_rejected_on_decode() {
    // Hand-build a delete-drive payload whose drive group runs past its
    // 6-byte bound; the decoder must refuse rather than truncate.
    let mut payload = Vec::new();
    payload.extend_from_slice(&0i32.to_be_bytes());
    payload.extend_from_slice(&0i32.to_be_bytes());
    for s in ["admin.example.org", "tpsrv01", "drive0", "toolonggroup"] {
        payload.extend_from_slice(s.as_bytes());
        payload.push(0);
    }
    let err = Message::decode(reqtype::DEL_DRVREQ, Bytes::from(payload)).unwrap_err();
    assert!(matches!(err, MountqError::Protocol(_)));
}

#[test]
fn test_truncated_payload_rejected() {
    let wire = Message::VolumeRequest(volume_request()).encode().unwrap();
    let short = wire.slice(HDR_LEN..wire.len() - 2);
    let err = Message::decode(reqtype::VOL_REQ, short).unwrap_err();
    assert!(matches!(err, MountqError::Protocol(_)));
}

#[tokio::test]
async fn test_start_job_round_trip_under_copyd_magic() {
    let msg = StartJobMsg {
        request_id: 17,
        client_port: 5555,
        client_uid: 1042,
        client_gid: 100,
        client_host: "client1.example.org".to_string(),
        drive_group: "DGN1".to_string(),
        drive: "drive0".to_string(),
        client_name: "stager".to_string(),
    };
    let wire = msg.encode().unwrap();
    assert_eq!(
        i32::from_be_bytes(wire[0..4].try_into().unwrap()),
        COPYD_MAGIC
    );
    assert_eq!(wire.len(), HDR_LEN + msg.payload_len());
    let decoded = StartJobMsg::decode(wire.slice(HDR_LEN..)).unwrap();
    assert_eq!(decoded, msg);

    let ack = StartJobAck {
        status: 0,
        message: String::new(),
    };
    let wire = ack.encode().unwrap();
    let decoded = StartJobAck::decode(wire.slice(HDR_LEN..)).unwrap();
    assert_eq!(decoded, ack);
}

#[test]
fn test_start_job_ack_trailing_bytes_rejected() {
    let mut payload = Vec::new();
    payload.extend_from_slice(&0i32.to_be_bytes());
    payload.push(0);
    payload.extend_from_slice(b"junk");
    let err = StartJobAck::decode(Bytes::from(payload)).unwrap_err();
    assert!(matches!(err, MountqError::Protocol(_)));
}
