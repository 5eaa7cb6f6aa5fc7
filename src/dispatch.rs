//! Job hand-off to the copy-execution service running on each tape server.
//! All calls are made with no scheduler lock held.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{MountqError, Result};
use crate::proto::message::{read_frame, StartJobAck, StartJobMsg};
use crate::proto::{reqtype, COPYD_MAGIC};
use crate::scheduler::MatchedJob;

#[derive(Debug, Clone)]
pub struct Dispatcher {
    copyd_port: u16,
    dispatch_timeout: Duration,
}

impl Dispatcher {
    pub fn new(copyd_port: u16, dispatch_timeout: Duration) -> Self {
        Self {
            copyd_port,
            dispatch_timeout,
        }
    }

    /// Send a start-job to the drive's tape server and await its
    /// acknowledgement. Any failure here triggers a scheduler rollback; the
    /// original client stays queued and is not told.
    pub async fn start_job(&self, job: &MatchedJob) -> Result<()> {
        let msg = StartJobMsg {
            request_id: job.request.id,
            client_port: job.request.client_port,
            client_uid: job.request.client_uid,
            client_gid: job.request.client_gid,
            client_host: job.request.client_host.clone(),
            drive_group: job.request.drive_group.clone(),
            drive: job.drive.clone(),
            client_name: job.request.client_name.clone(),
        };
        let ack = timeout(self.dispatch_timeout, self.round_trip(&job.server, &msg))
            .await
            .map_err(|_| self.failure(job, "copy-execution service timed out"))?
            .map_err(|e| self.failure(job, &e.to_string()))?;
        if ack.status != 0 {
            return Err(self.failure(
                job,
                &format!("rejected with status {}: {}", ack.status, ack.message),
            ));
        }
        tracing::info!(
            request_id = job.request.id,
            drive = %job.drive,
            server = %job.server,
            "Job dispatched"
        );
        Ok(())
    }

    /// Best-effort abort of a running job, used by the volume-request kill
    /// path. Local state is already released; an unreachable remote only
    /// leaves a stale copy job that the tape server reconciles later.
    pub async fn abort_job(&self, server: &str, drive: &str, request_id: i32) {
        let msg = StartJobMsg {
            request_id,
            // Negative client port marks the message as an abort.
            client_port: -1,
            drive: drive.to_string(),
            ..Default::default()
        };
        match timeout(self.dispatch_timeout, self.round_trip(server, &msg)).await {
            Ok(Ok(_)) => {
                tracing::info!(request_id, drive, server, "Remote job aborted");
            }
            Ok(Err(e)) => {
                tracing::warn!(request_id, server, error = %e, "Remote abort failed");
            }
            Err(_) => {
                tracing::warn!(request_id, server, "Remote abort timed out");
            }
        }
    }

    async fn round_trip(&self, server: &str, msg: &StartJobMsg) -> Result<StartJobAck> {
        let mut stream = TcpStream::connect((server, self.copyd_port)).await?;
        let buf = msg.encode()?;
        tokio::io::AsyncWriteExt::write_all(&mut stream, &buf).await?;
        let (magic, rt, payload) = read_frame(&mut stream).await?;
        if magic != COPYD_MAGIC || rt != reqtype::START_JOB {
            return Err(MountqError::protocol(format!(
                "unexpected reply 0x{magic:x}/{rt} from copy-execution service"
            )));
        }
        StartJobAck::decode(payload)
    }

    fn failure(&self, job: &MatchedJob, reason: &str) -> MountqError {
        MountqError::Dispatch {
            request_id: job.request.id,
            drive: job.drive.clone(),
            reason: reason.to_string(),
        }
    }
}
