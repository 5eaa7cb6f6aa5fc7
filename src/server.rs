//! Listener/acceptor: one task per accepted connection, each request decoded
//! and routed, scheduler commits under the group lock, job dispatch with no
//! lock held.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::error::{code, MountqError, Result};
use crate::proto::message::{read_message, write_message};
use crate::proto::{DriveAck, DriveRequestMsg, ErrorAck, Message, VolumeAck, VolumeRequestMsg};
use crate::scheduler::registry::DeleteOutcome;
use crate::scheduler::{GroupState, Registry};

/// The queue server. Bound separately from `run` so tests can learn the
/// listen address before connecting.
pub struct Server {
    listener: TcpListener,
    state: ServerState,
}

#[derive(Clone)]
struct ServerState {
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
}

impl Server {
    pub async fn bind(config: ServerConfig, shutdown: CancellationToken) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let dispatcher = Dispatcher::new(config.copyd_port, config.dispatch_timeout);
        let state = ServerState {
            registry: Arc::new(Registry::new(config)),
            dispatcher,
            shutdown,
        };
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        tracing::info!(listen_addr = %self.local_addr()?, "Queue server listening");
        loop {
            tokio::select! {
                _ = self.state.shutdown.cancelled() => {
                    tracing::info!("Shutdown requested, accept loop draining");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = state.handle_connection(stream).await {
                            tracing::warn!(peer = %peer, error = %e, "Connection closed on error");
                        }
                    });
                }
            }
        }
    }
}

impl ServerState {
    async fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        loop {
            let msg = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                m = read_message(&mut stream) => m,
            };
            let msg = match msg {
                Ok(m) => m,
                // Client closed the connection between requests.
                Err(MountqError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            };
            self.handle_message(&mut stream, msg).await?;
        }
    }

    async fn handle_message(&self, stream: &mut TcpStream, msg: Message) -> Result<()> {
        match msg {
            Message::VolumeRequest(m) => self.on_volume_request(stream, m).await,
            Message::DriveRequest(m) => self.on_drive_request(stream, m).await,
            Message::Ping(m) => self.on_ping(stream, m).await,
            Message::DeleteVolume(m) => self.on_delete_volume(stream, m).await,
            Message::Reselect(m) => self.on_reselect(stream, m).await,
            Message::GetVolQueue(m) => self.on_get_vol_queue(stream, m).await,
            Message::GetDrvQueue(m) => self.on_get_drv_queue(stream, m).await,
            Message::VolumePriority(m) => {
                let result = self.registry.set_priority(&m).await;
                if result.is_ok() {
                    self.spawn_matching_all().await;
                }
                self.ack(stream, result.map(|_| ())).await
            }
            Message::DeleteDrive(m) => {
                let result = self.registry.delete_drive(&m).await;
                if let Ok(requeued) = &result {
                    if *requeued {
                        if let Some(group) = self.registry.group(&m.drive_group).await {
                            self.spawn_matching(group);
                        }
                    }
                }
                self.ack(stream, result.map(|_| ())).await
            }
            Message::Dedicate(m) => {
                let result = self.registry.dedicate(&m).await;
                if result.is_ok() {
                    if let Some(group) = self.registry.group(&m.drive_group).await {
                        self.spawn_matching(group);
                    }
                }
                self.ack(stream, result).await
            }
            Message::Hold => {
                self.registry.hold();
                self.ack(stream, Ok(())).await
            }
            Message::Release => {
                self.registry.release_hold();
                self.spawn_matching_all().await;
                self.ack(stream, Ok(())).await
            }
            Message::Shutdown => {
                self.ack(stream, Ok(())).await?;
                tracing::info!("Shutdown message received");
                self.shutdown.cancel();
                Ok(())
            }
            Message::VolumeAck(_) | Message::DriveAck(_) | Message::ErrorAck(_) => Err(
                MountqError::protocol("unexpected acknowledgement from client"),
            ),
        }
    }

    async fn on_volume_request(&self, stream: &mut TcpStream, m: VolumeRequestMsg) -> Result<()> {
        let (id, pos, group) = match self.registry.enqueue(&m).await {
            Ok(r) => r,
            Err(e) => return self.send_error(stream, e).await,
        };
        let ack = Message::VolumeAck(VolumeAck {
            request_id: id,
            queue_position: pos as i32,
        });
        if let Err(e) = write_message(stream, &ack).await {
            // The client is gone before it learned its request id; it can
            // never ping or delete the request, so drop it now.
            self.registry.forget_request(&group, id).await;
            return Err(e);
        }
        self.spawn_matching(group);
        Ok(())
    }

    async fn on_drive_request(&self, stream: &mut TcpStream, m: DriveRequestMsg) -> Result<()> {
        let update = match self.registry.update_drive(&m).await {
            Ok(u) => u,
            Err(e) => return self.send_error(stream, e).await,
        };
        write_message(
            stream,
            &Message::DriveAck(DriveAck {
                status: update.status,
            }),
        )
        .await?;
        if update.needs_match {
            if let Some(group) = self.registry.group(&m.drive_group).await {
                self.spawn_matching(group);
            }
        }
        Ok(())
    }

    async fn on_ping(&self, stream: &mut TcpStream, m: VolumeRequestMsg) -> Result<()> {
        // A ping for request 0 is a liveness probe.
        if m.request_id == 0 {
            if self.registry.is_held() {
                return self
                    .send_error(
                        stream,
                        MountqError::validation(code::SERVER_HELD, "matching is held"),
                    )
                    .await;
            }
            return write_message(stream, &Message::VolumeAck(VolumeAck::default())).await;
        }
        match self.registry.ping(&m.drive_group, m.request_id).await {
            Ok(pos) => {
                write_message(
                    stream,
                    &Message::VolumeAck(VolumeAck {
                        request_id: m.request_id,
                        queue_position: pos,
                    }),
                )
                .await
            }
            Err(e) => self.send_error(stream, e).await,
        }
    }

    async fn on_delete_volume(&self, stream: &mut TcpStream, m: VolumeRequestMsg) -> Result<()> {
        match self.registry.delete_volume(&m.drive_group, m.request_id).await {
            Ok(DeleteOutcome::Dequeued) => self.ack(stream, Ok(())).await,
            Ok(DeleteOutcome::Killed { server, drive }) => {
                self.ack(stream, Ok(())).await?;
                let dispatcher = self.dispatcher.clone();
                let request_id = m.request_id;
                tokio::spawn(async move {
                    dispatcher.abort_job(&server, &drive, request_id).await;
                });
                if let Some(group) = self.registry.group(&m.drive_group).await {
                    self.spawn_matching(group);
                }
                Ok(())
            }
            Err(e) => self.send_error(stream, e).await,
        }
    }

    async fn on_reselect(&self, stream: &mut TcpStream, m: VolumeRequestMsg) -> Result<()> {
        match self.registry.reselect(&m.drive_group, m.request_id).await {
            Ok(()) => {
                self.ack(stream, Ok(())).await?;
                if let Some(group) = self.registry.group(&m.drive_group).await {
                    self.spawn_matching(group);
                }
                Ok(())
            }
            Err(e) => self.send_error(stream, e).await,
        }
    }

    /// Stream the volume queue as repeated records, terminated by a record
    /// with request id -1.
    async fn on_get_vol_queue(&self, stream: &mut TcpStream, m: VolumeRequestMsg) -> Result<()> {
        let filter = if m.drive_group.is_empty() {
            None
        } else {
            Some(m.drive_group.as_str())
        };
        let rows = match self.registry.volume_rows(filter).await {
            Ok(rows) => rows,
            Err(e) => return self.send_error(stream, e).await,
        };
        for row in rows {
            write_message(stream, &Message::GetVolQueue(row)).await?;
        }
        let sentinel = VolumeRequestMsg {
            request_id: -1,
            ..Default::default()
        };
        write_message(stream, &Message::GetVolQueue(sentinel)).await
    }

    async fn on_get_drv_queue(&self, stream: &mut TcpStream, m: DriveRequestMsg) -> Result<()> {
        let filter = if m.drive_group.is_empty() {
            None
        } else {
            Some(m.drive_group.as_str())
        };
        let rows = match self.registry.drive_rows(filter).await {
            Ok(rows) => rows,
            Err(e) => return self.send_error(stream, e).await,
        };
        for row in rows {
            write_message(stream, &Message::GetDrvQueue(row)).await?;
        }
        let sentinel = DriveRequestMsg {
            request_id: -1,
            ..Default::default()
        };
        write_message(stream, &Message::GetDrvQueue(sentinel)).await
    }

    /// Acknowledge an admin operation: status 0 on success, otherwise an
    /// error acknowledgement.
    async fn ack(&self, stream: &mut TcpStream, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => write_message(stream, &Message::DriveAck(DriveAck { status: 0 })).await,
            Err(e) => self.send_error(stream, e).await,
        }
    }

    /// Validation failures become error acknowledgements; protocol and I/O
    /// failures propagate and close the connection.
    async fn send_error(&self, stream: &mut TcpStream, err: MountqError) -> Result<()> {
        match &err {
            MountqError::Protocol(_) | MountqError::Io(_) => Err(err),
            _ => {
                tracing::debug!(error = %err, "Request refused");
                write_message(
                    stream,
                    &Message::ErrorAck(ErrorAck {
                        code: err.cause_code(),
                    }),
                )
                .await
            }
        }
    }

    fn spawn_matching(&self, group: Arc<Mutex<GroupState>>) {
        let registry = self.registry.clone();
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            run_matching_pass(&registry, &dispatcher, &group).await;
        });
    }

    async fn spawn_matching_all(&self) {
        for group in self.registry.all_groups().await {
            self.spawn_matching(group);
        }
    }
}

/// Commit matches under the group lock, dispatch them with the lock
/// released, roll back any whose dispatch fails. Repeats until a pass
/// commits nothing; rolled-back drives are in backoff and do not re-commit.
pub async fn run_matching_pass(
    registry: &Registry,
    dispatcher: &Dispatcher,
    group: &Arc<Mutex<GroupState>>,
) {
    loop {
        let jobs = registry.run_matching(group).await;
        if jobs.is_empty() {
            return;
        }
        for job in jobs {
            if let Err(e) = dispatcher.start_job(&job).await {
                tracing::warn!(error = %e, "Start-job failed");
                registry.rollback(group, job).await;
            }
        }
    }
}
