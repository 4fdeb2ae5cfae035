//! Quorum request coordinator
//!
//! One `RequestCoordinator` drives one client request through:
//!
//! ```text
//! Prepare ─► Execute ─► WaitingQuorum ─► WaitingRemainder ─► Finalize ─► Done
//!    │          │             │
//!    └──────────┴─────────────┴──► Failed
//! ```
//!
//! The caller is answered once R replicas replied. The coordinator then
//! keeps collecting until every reachable replica replied (or the
//! remainder timeout fires) and sends the merged set to every replier that
//! disagrees with it.

use crate::common::{ClusterConfig, MemberId, PreferenceList, RequestId, Result, VnodeId};
use crate::coordinator::transport::Dispatcher;
use crate::crdt::OrSet;
use crate::vnode::{Command, Envelope, ReplicaReply};
use bytes::Bytes;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout_at, Instant};

/// Client operation carried by a coordinator
#[derive(Debug, Clone)]
pub enum Operation {
    Join { group: String, member: MemberId },
    Leave { group: String, member: MemberId },
    Publish { channel: String, message: Bytes },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Join { .. } => "join",
            Operation::Leave { .. } => "leave",
            Operation::Publish { .. } => "publish",
        }
    }

    /// Group or channel the request is routed by
    pub fn routing_key(&self) -> &str {
        match self {
            Operation::Join { group, .. } | Operation::Leave { group, .. } => group,
            Operation::Publish { channel, .. } => channel,
        }
    }

    fn command(&self) -> Command {
        match self {
            Operation::Join { group, member } => Command::Join {
                group: group.clone(),
                member: member.clone(),
            },
            Operation::Leave { group, member } => Command::Leave {
                group: group.clone(),
                member: member.clone(),
            },
            Operation::Publish { channel, .. } => Command::Publish {
                channel: channel.clone(),
            },
        }
    }
}

/// What the caller gets once quorum is reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Merged membership after a join or leave
    Members(BTreeSet<MemberId>),
    /// Subscribers the message was dispatched to
    Published(Vec<MemberId>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prepare,
    Execute,
    WaitingQuorum,
    WaitingRemainder,
    Finalize,
    Done,
    Failed,
}

/// N/R quorum and its deadlines
#[derive(Debug, Clone, Copy)]
pub struct QuorumConfig {
    pub n_val: usize,
    pub r_val: usize,
    pub request_timeout: Duration,
    pub remainder_timeout: Duration,
}

impl From<&ClusterConfig> for QuorumConfig {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            n_val: config.n_val,
            r_val: config.r_val,
            request_timeout: config.request_timeout(),
            remainder_timeout: config.remainder_timeout(),
        }
    }
}

/// Summary of a finished coordinator
#[derive(Debug, Clone)]
pub struct Report {
    pub request_id: RequestId,
    pub phase: Phase,
    pub replies: usize,
    pub repaired: Vec<VnodeId>,
}

pub struct RequestCoordinator {
    request_id: RequestId,
    operation: Operation,
    quorum: QuorumConfig,
    ring: Arc<dyn PreferenceList>,
    dispatcher: Arc<dyn Dispatcher>,
    client: Option<oneshot::Sender<Result<Outcome>>>,
    phase: Phase,
    preflist: Vec<VnodeId>,
    unreachable: usize,
    replies: BTreeMap<VnodeId, OrSet<MemberId>>,
}

impl RequestCoordinator {
    pub fn new(
        request_id: RequestId,
        operation: Operation,
        quorum: QuorumConfig,
        ring: Arc<dyn PreferenceList>,
        dispatcher: Arc<dyn Dispatcher>,
        client: oneshot::Sender<Result<Outcome>>,
    ) -> Self {
        Self {
            request_id,
            operation,
            quorum,
            ring,
            dispatcher,
            client: Some(client),
            phase: Phase::Prepare,
            preflist: Vec::new(),
            unreachable: 0,
            replies: BTreeMap::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Drive the request to `Done` or `Failed`.
    pub async fn run(mut self) -> Report {
        let deadline = Instant::now() + self.quorum.request_timeout;
        let (tx, mut rx) = mpsc::unbounded_channel();

        if let Err(e) = self.prepare() {
            return self.fail(e);
        }

        self.phase = Phase::Execute;
        if let Err(e) = self.execute(tx) {
            return self.fail(e);
        }

        self.phase = Phase::WaitingQuorum;
        while self.replies.len() < self.quorum.r_val {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some(reply)) => self.record(reply),
                // Every outstanding replica dropped the command
                Ok(None) | Err(_) => {
                    let err = crate::Error::QuorumTimeout {
                        received: self.replies.len(),
                        required: self.quorum.r_val,
                    };
                    return self.fail(err);
                }
            }
        }

        self.reply_quorum();

        let expected = self.preflist.len() - self.unreachable;
        if self.replies.len() < expected {
            self.phase = Phase::WaitingRemainder;
            let remainder_deadline = Instant::now() + self.quorum.remainder_timeout;
            while self.replies.len() < expected {
                match timeout_at(remainder_deadline, rx.recv()).await {
                    Ok(Some(reply)) => self.record(reply),
                    Ok(None) => break,
                    Err(_) => {
                        tracing::warn!(
                            received = self.replies.len(),
                            expected,
                            "Straggling replicas, finalizing with partial replies"
                        );
                        break;
                    }
                }
            }
        }

        self.phase = Phase::Finalize;
        let repaired = self.finalize();
        self.phase = Phase::Done;

        Report {
            request_id: self.request_id,
            phase: self.phase,
            replies: self.replies.len(),
            repaired,
        }
    }

    fn prepare(&mut self) -> Result<()> {
        let key = self.operation.routing_key();
        let preflist = self.ring.resolve(key, self.quorum.n_val)?;
        if preflist.len() < self.quorum.r_val {
            return Err(crate::Error::InsufficientReplicas {
                needed: self.quorum.r_val,
                available: preflist.len(),
            });
        }
        self.preflist = preflist;
        Ok(())
    }

    fn execute(&mut self, tx: mpsc::UnboundedSender<ReplicaReply>) -> Result<()> {
        for target in &self.preflist {
            let envelope = Envelope::new(self.request_id, self.operation.command(), tx.clone());
            if let Err(e) = self.dispatcher.send(target, envelope) {
                tracing::warn!(replica = %target, error = %e, "Replica unreachable");
                self.unreachable += 1;
            }
        }

        let reachable = self.preflist.len() - self.unreachable;
        if reachable < self.quorum.r_val {
            return Err(crate::Error::QuorumTimeout {
                received: 0,
                required: self.quorum.r_val,
            });
        }
        Ok(())
    }

    fn record(&mut self, reply: ReplicaReply) {
        if reply.request_id != self.request_id {
            tracing::debug!(stale = %reply.request_id, "Ignoring reply for another request");
            return;
        }
        if !self.preflist.contains(&reply.replica) {
            tracing::debug!(replica = %reply.replica, "Ignoring reply from outside the preference list");
            return;
        }
        if self.replies.contains_key(&reply.replica) {
            tracing::debug!(replica = %reply.replica, "Ignoring duplicate reply");
            return;
        }
        self.replies.insert(reply.replica, reply.set);
    }

    fn merged(&self) -> OrSet<MemberId> {
        self.replies
            .values()
            .fold(OrSet::new(), |mut acc, set| {
                acc.merge(set);
                acc
            })
    }

    fn reply_quorum(&mut self) {
        let merged = self.merged();
        let outcome = match &self.operation {
            Operation::Join { .. } | Operation::Leave { .. } => Outcome::Members(merged.value()),
            Operation::Publish { message, .. } => {
                Outcome::Published(self.fan_out(&merged, message))
            }
        };

        tracing::debug!(replies = self.replies.len(), "Quorum reached");
        if let Some(client) = self.client.take() {
            if client.send(Ok(outcome)).is_err() {
                tracing::debug!("Caller went away before quorum");
            }
        }
    }

    /// Best-effort, at-most-once delivery to each subscriber's own vnode
    fn fan_out(&self, subscribers: &OrSet<MemberId>, message: &Bytes) -> Vec<MemberId> {
        let mut notified = Vec::new();
        for member in subscribers.value() {
            let target = match self.ring.resolve(member.as_str(), 1) {
                Ok(mut list) if !list.is_empty() => list.swap_remove(0),
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(member = %member, error = %e, "No route for subscriber");
                    continue;
                }
            };
            let envelope = Envelope::fire_and_forget(
                self.request_id,
                Command::Accept {
                    member: member.clone(),
                    message: message.clone(),
                },
            );
            match self.dispatcher.send(&target, envelope) {
                Ok(()) => notified.push(member),
                Err(e) => {
                    tracing::debug!(member = %member, error = %e, "Delivery dropped");
                }
            }
        }
        notified
    }

    /// Repair every replier whose value differs from the merge of all
    /// replies. Replicas that never replied are left alone.
    fn finalize(&self) -> Vec<VnodeId> {
        let merged = self.merged();
        let group = self.operation.routing_key();
        let mut repaired = Vec::new();

        for (replica, set) in &self.replies {
            if set.value_eq(&merged) {
                continue;
            }
            let envelope = Envelope::fire_and_forget(
                self.request_id,
                Command::Repair {
                    group: group.to_string(),
                    set: merged.clone(),
                },
            );
            match self.dispatcher.send(replica, envelope) {
                Ok(()) => {
                    tracing::info!(replica = %replica, group = %group, "Read repair sent");
                    repaired.push(replica.clone());
                }
                Err(e) => {
                    tracing::warn!(replica = %replica, error = %e, "Read repair not delivered");
                }
            }
        }
        repaired
    }

    fn fail(mut self, err: crate::Error) -> Report {
        self.phase = Phase::Failed;
        tracing::warn!(error = %err, "Request failed");
        if let Some(client) = self.client.take() {
            let _ = client.send(Err(err));
        }
        Report {
            request_id: self.request_id,
            phase: self.phase,
            replies: self.replies.len(),
            repaired: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::HashRing;
    use std::sync::Mutex;

    fn member(id: &str) -> MemberId {
        MemberId::from(id)
    }

    fn set_of(ids: &[&str], origin: u64) -> OrSet<MemberId> {
        let mut set = OrSet::new();
        for id in ids {
            set.add(member(id), origin);
        }
        set
    }

    /// Ring returning a fixed list
    struct FixedRing(Vec<VnodeId>);

    impl PreferenceList for FixedRing {
        fn resolve(&self, _key: &str, count: usize) -> Result<Vec<VnodeId>> {
            Ok(self.0.iter().take(count).cloned().collect())
        }
    }

    enum Script {
        /// Reply with this set
        Reply(OrSet<MemberId>),
        /// Accept the command and never answer
        Hold,
        /// Fail the send
        Unreachable,
    }

    /// Dispatcher answering from a per-replica script and recording
    /// every fire-and-forget command
    #[derive(Default)]
    struct ScriptedDispatcher {
        scripts: Mutex<BTreeMap<VnodeId, Script>>,
        held: Mutex<Vec<Envelope>>,
        sent: Mutex<Vec<(VnodeId, Command)>>,
    }

    impl ScriptedDispatcher {
        fn with(scripts: Vec<(VnodeId, Script)>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into_iter().collect()),
                ..Default::default()
            })
        }

        fn repairs(&self) -> Vec<(VnodeId, OrSet<MemberId>)> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|(target, command)| match command {
                    Command::Repair { set, .. } => Some((target.clone(), set.clone())),
                    _ => None,
                })
                .collect()
        }

        fn accepts(&self) -> Vec<MemberId> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|(_, command)| match command {
                    Command::Accept { member, .. } => Some(member.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    impl Dispatcher for ScriptedDispatcher {
        fn send(&self, target: &VnodeId, envelope: Envelope) -> Result<()> {
            let Some(reply_to) = envelope.reply_to.clone() else {
                self.sent
                    .lock()
                    .unwrap()
                    .push((target.clone(), envelope.command));
                return Ok(());
            };
            let scripts = self.scripts.lock().unwrap();
            match scripts.get(target) {
                Some(Script::Reply(set)) => {
                    let _ = reply_to.send(ReplicaReply {
                        request_id: envelope.request_id,
                        replica: target.clone(),
                        group: "g".into(),
                        set: set.clone(),
                    });
                    Ok(())
                }
                Some(Script::Hold) => {
                    self.held.lock().unwrap().push(envelope);
                    Ok(())
                }
                Some(Script::Unreachable) | None => {
                    Err(crate::Error::ReplicaUnreachable(target.to_string()))
                }
            }
        }
    }

    fn p(n: u64) -> VnodeId {
        VnodeId::new(n, "n1")
    }

    fn quorum(n: usize, r: usize) -> QuorumConfig {
        QuorumConfig {
            n_val: n,
            r_val: r,
            request_timeout: Duration::from_secs(5),
            remainder_timeout: Duration::from_secs(1),
        }
    }

    fn coordinator(
        operation: Operation,
        quorum: QuorumConfig,
        ring: Arc<dyn PreferenceList>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> (RequestCoordinator, oneshot::Receiver<Result<Outcome>>) {
        let (tx, rx) = oneshot::channel();
        let coordinator =
            RequestCoordinator::new(RequestId::new_v4(), operation, quorum, ring, dispatcher, tx);
        (coordinator, rx)
    }

    fn join_op() -> Operation {
        Operation::Join {
            group: "g".into(),
            member: member("m1"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_replies_after_r_without_waiting_for_third() {
        let dispatcher = ScriptedDispatcher::with(vec![
            (p(1), Script::Reply(set_of(&["m1"], 1))),
            (p(2), Script::Reply(set_of(&["m1"], 2))),
            (p(3), Script::Hold),
        ]);
        let ring = Arc::new(FixedRing(vec![p(1), p(2), p(3)]));
        let (coordinator, rx) = coordinator(join_op(), quorum(3, 2), ring, dispatcher.clone());

        let task = tokio::spawn(coordinator.run());
        let started = Instant::now();
        let outcome = rx.await.unwrap().unwrap();
        assert_eq!(outcome, Outcome::Members([member("m1")].into()));
        // Answered without any time passing; the held replica is still pending
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert!(!task.is_finished());

        let report = task.await.unwrap();
        assert_eq!(report.phase, Phase::Done);
        assert_eq!(report.replies, 2);
    }

    #[tokio::test]
    async fn test_repairs_only_the_stale_replica() {
        let dispatcher = ScriptedDispatcher::with(vec![
            (p(1), Script::Reply(set_of(&["m1", "m2"], 1))),
            (p(2), Script::Reply(set_of(&["m1"], 2))),
            (p(3), Script::Reply(set_of(&["m1", "m2"], 3))),
        ]);
        let ring = Arc::new(FixedRing(vec![p(1), p(2), p(3)]));
        let (coordinator, _rx) = coordinator(join_op(), quorum(3, 2), ring, dispatcher.clone());

        let report = coordinator.run().await;
        assert_eq!(report.phase, Phase::Done);
        assert_eq!(report.repaired, vec![p(2)]);

        let repairs = dispatcher.repairs();
        assert_eq!(repairs.len(), 1);
        assert_eq!(repairs[0].0, p(2));
        assert_eq!(
            repairs[0].1.value(),
            [member("m1"), member("m2")].into_iter().collect()
        );
    }

    #[tokio::test]
    async fn test_routing_failure_is_reported() {
        let dispatcher = ScriptedDispatcher::with(vec![]);
        let ring = HashRing::new(8, vec!["solo".to_string()]);
        ring.mark_down("solo");
        let (coordinator, rx) =
            coordinator(join_op(), quorum(3, 2), Arc::new(ring), dispatcher);

        let report = coordinator.run().await;
        assert_eq!(report.phase, Phase::Failed);
        assert!(matches!(
            rx.await.unwrap(),
            Err(crate::Error::RoutingFailure(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quorum_timeout_when_replicas_stay_silent() {
        let dispatcher = ScriptedDispatcher::with(vec![
            (p(1), Script::Reply(set_of(&["m1"], 1))),
            (p(2), Script::Hold),
            (p(3), Script::Hold),
        ]);
        let ring = Arc::new(FixedRing(vec![p(1), p(2), p(3)]));
        let (coordinator, rx) = coordinator(join_op(), quorum(3, 2), ring, dispatcher.clone());

        let report = coordinator.run().await;
        assert_eq!(report.phase, Phase::Failed);
        assert!(matches!(
            rx.await.unwrap(),
            Err(crate::Error::QuorumTimeout {
                received: 1,
                required: 2
            })
        ));
        // No repair on partial data
        assert!(dispatcher.repairs().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_replicas_fail_fast() {
        let dispatcher = ScriptedDispatcher::with(vec![
            (p(1), Script::Reply(set_of(&["m1"], 1))),
            (p(2), Script::Unreachable),
            (p(3), Script::Unreachable),
        ]);
        let ring = Arc::new(FixedRing(vec![p(1), p(2), p(3)]));
        let (coordinator, rx) = coordinator(join_op(), quorum(3, 2), ring, dispatcher);

        let report = coordinator.run().await;
        assert_eq!(report.phase, Phase::Failed);
        assert!(matches!(
            rx.await.unwrap(),
            Err(crate::Error::QuorumTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_one_unreachable_replica_is_tolerated() {
        let dispatcher = ScriptedDispatcher::with(vec![
            (p(1), Script::Reply(set_of(&["m1"], 1))),
            (p(2), Script::Unreachable),
            (p(3), Script::Reply(set_of(&["m1"], 3))),
        ]);
        let ring = Arc::new(FixedRing(vec![p(1), p(2), p(3)]));
        let (coordinator, rx) = coordinator(join_op(), quorum(3, 2), ring, dispatcher);

        let report = coordinator.run().await;
        assert_eq!(report.phase, Phase::Done);
        assert!(rx.await.unwrap().is_ok());
        assert!(report.repaired.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remainder_timeout_finalizes_with_partial_replies() {
        let dispatcher = ScriptedDispatcher::with(vec![
            (p(1), Script::Reply(set_of(&["m1", "m2"], 1))),
            (p(2), Script::Reply(set_of(&["m1"], 2))),
            (p(3), Script::Hold),
        ]);
        let ring = Arc::new(FixedRing(vec![p(1), p(2), p(3)]));
        let (coordinator, rx) = coordinator(join_op(), quorum(3, 2), ring, dispatcher.clone());

        let report = coordinator.run().await;
        assert!(rx.await.unwrap().is_ok());
        assert_eq!(report.phase, Phase::Done);
        assert_eq!(report.replies, 2);
        // p2 replied stale, p3 never replied and is left alone
        assert_eq!(report.repaired, vec![p(2)]);
    }

    #[tokio::test]
    async fn test_stale_and_foreign_replies_are_ignored() {
        let dispatcher = ScriptedDispatcher::with(vec![
            (p(1), Script::Hold),
            (p(2), Script::Hold),
        ]);
        let ring = Arc::new(FixedRing(vec![p(1), p(2)]));
        let (coordinator, rx) = coordinator(join_op(), quorum(2, 2), ring, dispatcher.clone());
        let request_id = coordinator.request_id;
        let task = tokio::spawn(coordinator.run());

        // Wait until both commands are held
        while dispatcher.held.lock().unwrap().len() < 2 {
            tokio::task::yield_now().await;
        }
        let reply_to = dispatcher.held.lock().unwrap()[0]
            .reply_to
            .clone()
            .unwrap();
        let reply = |request_id, replica: VnodeId| ReplicaReply {
            request_id,
            replica,
            group: "g".into(),
            set: set_of(&["m1"], 9),
        };

        reply_to.send(reply(RequestId::new_v4(), p(1))).unwrap();
        reply_to.send(reply(request_id, p(7))).unwrap();
        reply_to.send(reply(request_id, p(1))).unwrap();
        reply_to.send(reply(request_id, p(1))).unwrap();
        reply_to.send(reply(request_id, p(2))).unwrap();

        assert!(rx.await.unwrap().is_ok());
        let report = task.await.unwrap();
        assert_eq!(report.replies, 2);
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_merged_subscribers() {
        let dispatcher = ScriptedDispatcher::with(vec![
            (p(1), Script::Reply(set_of(&["alice", "bob"], 1))),
            (p(2), Script::Reply(set_of(&["carol"], 2))),
            (p(3), Script::Hold),
        ]);
        let ring = Arc::new(FixedRing(vec![p(1), p(2), p(3)]));
        let operation = Operation::Publish {
            channel: "news".into(),
            message: Bytes::from_static(b"hello"),
        };
        let (coordinator, rx) = coordinator(operation, quorum(3, 2), ring, dispatcher.clone());
        let task = tokio::spawn(coordinator.run());

        let outcome = rx.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            Outcome::Published(vec![member("alice"), member("bob"), member("carol")])
        );
        assert_eq!(dispatcher.accepts().len(), 3);
        task.abort();
    }

    #[tokio::test]
    async fn test_r_equals_n_skips_remainder() {
        let dispatcher = ScriptedDispatcher::with(vec![
            (p(1), Script::Reply(set_of(&["m1"], 1))),
            (p(2), Script::Reply(set_of(&["m1"], 2))),
        ]);
        let ring = Arc::new(FixedRing(vec![p(1), p(2)]));
        let (coordinator, rx) = coordinator(join_op(), quorum(2, 2), ring, dispatcher);

        let report = coordinator.run().await;
        assert_eq!(report.phase, Phase::Done);
        assert!(rx.await.unwrap().is_ok());
    }
}
