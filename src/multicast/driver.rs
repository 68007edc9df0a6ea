use std::sync::Arc;

use anyhow::anyhow;
use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tracing::{debug, error, info, warn};

use crate::membership::GroupView;
use crate::messaging::node_addr::NodeAddr;
use crate::messaging::transport::MulticastTransport;
use crate::multicast::flow_control::FlowGate;
use crate::multicast::group_messages::GroupFrame;
use crate::multicast::multicast_error::ProtocolFault;
use crate::multicast::multicast_message::MessageFlags;
use crate::multicast::protocol::MulticastProtocol;
use crate::multicast::MessageId;


pub enum MulticastCommand {
    Send {
        payload: Bytes,
        flags: MessageFlags,
        reply: Option<oneshot::Sender<MessageId>>,
    },
    /// a raw frame as it came from the transport
    Received {
        from: NodeAddr,
        buf: Bytes,
    },
    MemberFailed(NodeAddr),
    StartFlush(GroupView),
    BeforeProcessFlush,
    ProcessFlush(oneshot::Sender<bool>),
    EndFlush,
}

/// Starts the processing loop for a protocol instance on a new task.
pub fn spawn_multicast(protocol: MulticastProtocol, transport: Arc<dyn MulticastTransport>) -> (MulticastHandle, JoinHandle<anyhow::Result<()>>) {
    let (send, recv) = mpsc::channel(1024);
    let handle = MulticastHandle {
        commands: send,
        gate: protocol.gate(),
    };
    let join_handle = tokio::spawn(run_multicast(protocol, transport, recv));
    (handle, join_handle)
}

/// The processing loop: the single owner of a group's protocol state. It terminates regularly
///  when all command senders were dropped, and with an error on a protocol fault.
pub async fn run_multicast(mut protocol: MulticastProtocol, transport: Arc<dyn MulticastTransport>, mut commands: mpsc::Receiver<MulticastCommand>) -> anyhow::Result<()> {
    let group = protocol.config().group;
    info!("starting multicast for group {:?} on {:?}", group, transport.self_addr());

    let mut ticks = time::interval(protocol.config().tick_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let result = select! {
            cmd = commands.recv() => {
                match cmd {
                    Some(cmd) => on_command(&mut protocol, cmd),
                    None => {
                        info!("all handles for group {:?} were dropped - shutting down", group);
                        return Ok(());
                    }
                }
            }
            _ = ticks.tick() => {
                protocol.on_timer(Instant::now())
            }
        };

        if let Err(e) = result {
            error!("protocol fault in group {:?} - terminating: {}", group, e);
            return Err(e.into());
        }
        send_frames(&mut protocol, transport.as_ref()).await;
    }
}

fn on_command(protocol: &mut MulticastProtocol, command: MulticastCommand) -> Result<(), ProtocolFault> {
    let now = Instant::now();
    match command {
        MulticastCommand::Send { payload, flags, reply } => {
            let message_id = protocol.send(payload, flags, now)?;
            if let Some(reply) = reply {
                let _ = reply.send(message_id);
            }
        }
        MulticastCommand::Received { from, buf } => {
            match GroupFrame::deser(&buf) {
                Ok(frame) => {
                    let outcome = protocol.on_frame(from, frame, now)?;
                    debug!("frame from {:?}: {:?}", from, outcome);
                }
                Err(e) => {
                    warn!("received malformed frame from {:?} - dropping it: {}", from, e);
                }
            }
        }
        MulticastCommand::MemberFailed(member) => protocol.on_member_failed(member, now)?,
        MulticastCommand::StartFlush(view) => protocol.start_flush(view, now)?,
        MulticastCommand::BeforeProcessFlush => protocol.before_process_flush(),
        MulticastCommand::ProcessFlush(reply) => {
            let _ = reply.send(protocol.process_flush());
        }
        MulticastCommand::EndFlush => protocol.end_flush(now)?,
    }
    Ok(())
}

async fn send_frames(protocol: &mut MulticastProtocol, transport: &dyn MulticastTransport) {
    let mut buf = BytesMut::new();
    for (to, frame) in protocol.take_frames() {
        buf.clear();
        frame.ser(&mut buf);
        if let Err(e) = transport.send_raw(to, &buf).await {
            warn!("error sending frame to {:?}: {}", to, e);
        }
    }
}

/// The application's and the membership service's access to a running group. Cloning is cheap,
///  and the processing loop terminates when the last clone is dropped.
#[derive(Clone)]
pub struct MulticastHandle {
    commands: mpsc::Sender<MulticastCommand>,
    gate: Arc<FlowGate>,
}

impl MulticastHandle {
    /// `true` while a receiver throttles this group - [MulticastHandle::send] waits then
    pub fn is_locked(&self) -> bool {
        self.gate.is_locked()
    }

    /// Sends a message to the group, waiting while the group's flow is locked. Returns the
    ///  message's id once the processing loop accepted it.
    pub async fn send(&self, payload: Bytes, flags: MessageFlags) -> anyhow::Result<MessageId> {
        self.gate.wait_unlocked().await;

        let (reply, result) = oneshot::channel();
        self.command(MulticastCommand::Send { payload, flags, reply: Some(reply) }).await?;
        result.await
            .map_err(|_| anyhow!("multicast processing loop terminated before accepting the message"))
    }

    pub async fn on_received(&self, from: NodeAddr, buf: Bytes) -> anyhow::Result<()> {
        self.command(MulticastCommand::Received { from, buf }).await
    }

    pub async fn on_member_failed(&self, member: NodeAddr) -> anyhow::Result<()> {
        self.command(MulticastCommand::MemberFailed(member)).await
    }

    pub async fn start_flush(&self, new_view: GroupView) -> anyhow::Result<()> {
        self.command(MulticastCommand::StartFlush(new_view)).await
    }

    pub async fn before_process_flush(&self) -> anyhow::Result<()> {
        self.command(MulticastCommand::BeforeProcessFlush).await
    }

    pub async fn process_flush(&self) -> anyhow::Result<bool> {
        let (reply, result) = oneshot::channel();
        self.command(MulticastCommand::ProcessFlush(reply)).await?;
        result.await
            .map_err(|_| anyhow!("multicast processing loop terminated"))
    }

    pub async fn end_flush(&self) -> anyhow::Result<()> {
        self.command(MulticastCommand::EndFlush).await
    }

    async fn command(&self, command: MulticastCommand) -> anyhow::Result<()> {
        self.commands.send(command).await
            .map_err(|_| anyhow!("multicast processing loop terminated"))
    }
}
