//! Spawns one coordinator task per client request
//!
//! Coordinators are never restarted: the commands they already sent may
//! have been applied, so a crashed coordinator only reports the crash to
//! its caller and releases its state.

use crate::common::{MemberId, PreferenceList, RequestId, Result, VnodeId};
use crate::coordinator::request::{Operation, Outcome, QuorumConfig, Report, RequestCoordinator};
use crate::coordinator::transport::Dispatcher;
use crate::crdt::OrSet;
use crate::vnode::{Command, Envelope};
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Handle on a request in flight
pub struct PendingReply {
    request_id: RequestId,
    reply: Option<oneshot::Receiver<Result<Outcome>>>,
    task: JoinHandle<Report>,
}

impl PendingReply {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Wait for the quorum outcome.
    pub async fn wait(&mut self) -> Result<Outcome> {
        let Some(reply) = self.reply.take() else {
            return Err(crate::Error::Internal("reply already consumed".into()));
        };
        reply.await.map_err(|_| {
            crate::Error::CoordinatorCrashed(format!("request {} lost its coordinator", self.request_id))
        })?
    }

    /// Wait for the coordinator to finish, read repair included.
    pub async fn finished(self) -> Result<Report> {
        self.task
            .await
            .map_err(|e| crate::Error::CoordinatorCrashed(e.to_string()))
    }
}

struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Supervisor {
    ring: Arc<dyn PreferenceList>,
    dispatcher: Arc<dyn Dispatcher>,
    quorum: QuorumConfig,
    in_flight: Arc<AtomicUsize>,
}

impl Supervisor {
    pub fn new(
        ring: Arc<dyn PreferenceList>,
        dispatcher: Arc<dyn Dispatcher>,
        quorum: QuorumConfig,
    ) -> Self {
        Self {
            ring,
            dispatcher,
            quorum,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Coordinators currently running
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn quorum(&self) -> QuorumConfig {
        self.quorum
    }

    pub fn join(&self, group: impl Into<String>, member: MemberId) -> PendingReply {
        self.spawn(Operation::Join {
            group: group.into(),
            member,
        })
    }

    pub fn leave(&self, group: impl Into<String>, member: MemberId) -> PendingReply {
        self.spawn(Operation::Leave {
            group: group.into(),
            member,
        })
    }

    pub fn publish(&self, channel: impl Into<String>, message: Bytes) -> PendingReply {
        self.spawn(Operation::Publish {
            channel: channel.into(),
            message,
        })
    }

    /// Push an authoritative value to one replica, without waiting.
    pub fn repair(&self, target: &VnodeId, group: impl Into<String>, value: OrSet<MemberId>) {
        let group = group.into();
        let envelope = Envelope::fire_and_forget(
            RequestId::new_v4(),
            Command::Repair {
                group: group.clone(),
                set: value,
            },
        );
        if let Err(e) = self.dispatcher.send(target, envelope) {
            tracing::warn!(replica = %target, group = %group, error = %e, "Repair not delivered");
        }
    }

    fn spawn(&self, operation: Operation) -> PendingReply {
        let request_id = RequestId::new_v4();
        let (tx, rx) = oneshot::channel();

        let span = tracing::info_span!(
            "coordinator",
            request_id = %request_id,
            op = operation.name(),
            key = %operation.routing_key(),
        );
        let coordinator = RequestCoordinator::new(
            request_id,
            operation,
            self.quorum,
            self.ring.clone(),
            self.dispatcher.clone(),
            tx,
        );

        let guard = InFlightGuard::enter(&self.in_flight);
        let task = tokio::spawn(
            async move {
                let _guard = guard;
                let report = coordinator.run().await;
                tracing::debug!(phase = ?report.phase, repaired = report.repaired.len(), "Coordinator finished");
                report
            }
            .instrument(span),
        );

        PendingReply {
            request_id,
            reply: Some(rx),
            task,
        }
    }
}
