//! Partition handoff and rebalancing
//!
//! A handoff folds the source vnode, merges every item into the target and
//! only then vacates the source. The source keeps serving writes while it
//! hands off, so each finish is checked against the version of the last
//! fold: groups written in between are folded again and shipped before the
//! source may vacate. Any failure on the way cancels the handoff; the
//! source keeps serving with its state untouched.

use crate::common::{HashRing, Result};
use crate::coordinator::transport::LocalCluster;
use crate::vnode::VnodeHandle;
use serde::Serialize;
use std::collections::BTreeSet;

/// Fold rounds attempted before giving up on a source that keeps changing
const MAX_HANDOFF_ROUNDS: usize = 16;

#[derive(Debug, Default, Clone, Serialize)]
pub struct HandoffReport {
    pub vnodes_moved: usize,
    pub groups_transferred: usize,
    pub failures: usize,
}

/// Move every group held by `source` into `target`. Returns the number of
/// groups transferred.
pub async fn handoff(source: &VnodeHandle, target: &VnodeHandle) -> Result<usize> {
    if source.id() == target.id() {
        return Err(crate::Error::Handoff(format!(
            "vnode {} cannot hand off to itself",
            source.id()
        )));
    }

    source.begin_handoff().await?;

    match transfer(source, target).await {
        Ok(groups) => {
            tracing::info!(source = %source.id(), target = %target.id(), groups, "Handoff complete");
            Ok(groups)
        }
        Err(e) => {
            source.cancel_handoff();
            tracing::warn!(source = %source.id(), target = %target.id(), error = %e, "Handoff cancelled");
            Err(e)
        }
    }
}

/// Ship groups until a finish succeeds. Returns the distinct groups moved.
async fn transfer(source: &VnodeHandle, target: &VnodeHandle) -> Result<usize> {
    let mut groups = BTreeSet::new();
    let mut since = None;

    for round in 0..MAX_HANDOFF_ROUNDS {
        let batch = source.fold(since).await?;
        for item in &batch.items {
            target.ingest(item).await?;
            groups.insert(item.group.clone());
        }

        if source.finish_handoff(batch.version).await? {
            return Ok(groups.len());
        }
        tracing::debug!(source = %source.id(), round, "Source changed during handoff, folding again");
        since = Some(batch.version);
    }

    Err(crate::Error::Handoff(format!(
        "vnode {} kept changing after {} rounds",
        source.id(),
        MAX_HANDOFF_ROUNDS
    )))
}

/// Hand every vnode that is not hosted by its partition's current owner
/// over to that owner.
pub async fn rebalance(cluster: &LocalCluster, ring: &HashRing) -> HandoffReport {
    let mut report = HandoffReport::default();

    for source in cluster.running() {
        let partition = source.id().partition;
        let Some(owner) = ring.owner(partition) else {
            continue;
        };
        if owner == source.id().node {
            continue;
        }

        let target = cluster.vnode(&crate::common::VnodeId::new(partition, owner));
        match handoff(&source, &target).await {
            Ok(groups) => {
                cluster.retire(source.id());
                report.vnodes_moved += 1;
                report.groups_transferred += groups;
            }
            Err(e) => {
                tracing::warn!(vnode = %source.id(), error = %e, "Rebalance step failed");
                report.failures += 1;
            }
        }
    }

    tracing::info!(
        moved = report.vnodes_moved,
        groups = report.groups_transferred,
        failures = report.failures,
        "Rebalance finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{MemberId, RequestId, VnodeId};
    use crate::vnode::{Command, Envelope, Lifecycle};
    use tokio::sync::mpsc;

    async fn join(vnode: &VnodeHandle, group: &str, member: &str) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        vnode
            .send(Envelope::new(
                RequestId::new_v4(),
                Command::Join {
                    group: group.into(),
                    member: MemberId::from(member),
                },
                tx,
            ))
            .unwrap();
        rx.recv().await.unwrap();
    }

    #[tokio::test]
    async fn test_handoff_merges_into_target() {
        let cluster = LocalCluster::in_memory();
        let source = cluster.vnode(&VnodeId::new(5, "fallback"));
        let target = cluster.vnode(&VnodeId::new(5, "owner"));

        join(&source, "g", "m1").await;
        join(&source, "g", "m2").await;
        join(&target, "g", "m3").await;

        let groups = handoff(&source, &target).await.unwrap();
        assert_eq!(groups, 1);

        let set = target.get("g").await.unwrap().unwrap();
        let expected: std::collections::BTreeSet<_> =
            ["m1", "m2", "m3"].into_iter().map(MemberId::from).collect();
        assert_eq!(set.value(), expected);

        assert_eq!(source.lifecycle().await.unwrap(), Lifecycle::Vacated);
        assert!(source.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_join_between_fold_and_finish_reaches_target() {
        let cluster = LocalCluster::in_memory();
        let source = cluster.vnode(&VnodeId::new(6, "fallback"));
        let target = cluster.vnode(&VnodeId::new(6, "owner"));
        join(&source, "g", "m1").await;

        source.begin_handoff().await.unwrap();
        let first = source.fold(None).await.unwrap();

        // Acknowledged by the source after the fold was taken
        join(&source, "g", "late").await;

        for item in &first.items {
            target.ingest(item).await.unwrap();
        }
        assert!(!source.finish_handoff(first.version).await.unwrap());
        assert_eq!(source.lifecycle().await.unwrap(), Lifecycle::HandingOff);

        let second = source.fold(Some(first.version)).await.unwrap();
        assert_eq!(second.items.len(), 1);
        for item in &second.items {
            target.ingest(item).await.unwrap();
        }
        assert!(source.finish_handoff(second.version).await.unwrap());

        let set = target.get("g").await.unwrap().unwrap();
        let expected: std::collections::BTreeSet<_> =
            ["m1", "late"].into_iter().map(MemberId::from).collect();
        assert_eq!(set.value(), expected);
        assert_eq!(source.lifecycle().await.unwrap(), Lifecycle::Vacated);
    }

    #[tokio::test]
    async fn test_handoff_under_concurrent_joins_loses_nothing() {
        let cluster = LocalCluster::in_memory();
        let source = cluster.vnode(&VnodeId::new(8, "fallback"));
        let target = cluster.vnode(&VnodeId::new(8, "owner"));
        join(&source, "g", "m0").await;

        let writer = {
            let source = source.clone();
            tokio::spawn(async move {
                let mut acked = vec![MemberId::from("m0")];
                for i in 1..10 {
                    let (tx, mut rx) = mpsc::unbounded_channel();
                    let member = MemberId::from(format!("m{}", i));
                    let sent = source.send(Envelope::new(
                        RequestId::new_v4(),
                        Command::Join {
                            group: "g".into(),
                            member: member.clone(),
                        },
                        tx,
                    ));
                    if sent.is_ok() && rx.recv().await.is_some() {
                        acked.push(member);
                    }
                    tokio::task::yield_now().await;
                }
                acked
            })
        };

        handoff(&source, &target).await.unwrap();
        let acked = writer.await.unwrap();

        // Joins acknowledged before the source vacated must all be on the target
        let set = target.get("g").await.unwrap().unwrap();
        for member in acked {
            assert!(set.contains(&member), "{} lost", member);
        }
    }

    #[tokio::test]
    async fn test_failed_handoff_keeps_source() {
        let cluster = LocalCluster::in_memory();
        let source = cluster.vnode(&VnodeId::new(2, "a"));
        let target = cluster.vnode(&VnodeId::new(2, "b"));
        join(&source, "g", "m1").await;

        // A vacated target refuses ingestion
        target.begin_handoff().await.unwrap();
        let batch = target.fold(None).await.unwrap();
        assert!(target.finish_handoff(batch.version).await.unwrap());

        assert!(handoff(&source, &target).await.is_err());
        assert_eq!(source.lifecycle().await.unwrap(), Lifecycle::Active);
        let set = source.get("g").await.unwrap().unwrap();
        assert!(set.contains(&MemberId::from("m1")));
    }

    #[tokio::test]
    async fn test_rebalance_moves_fallback_vnodes_home() {
        let ring = HashRing::new(4, vec!["a".into(), "b".into()]);
        let cluster = LocalCluster::in_memory();

        let owner = ring.owner(1).unwrap();
        let other = if owner == "a" { "b" } else { "a" };
        let fallback = cluster.vnode(&VnodeId::new(1, other));
        join(&fallback, "g", "m1").await;

        let report = rebalance(&cluster, &ring).await;
        assert_eq!(report.vnodes_moved, 1);
        assert_eq!(report.groups_transferred, 1);
        assert_eq!(report.failures, 0);

        let home = cluster.vnode(&VnodeId::new(1, owner));
        let set = home.get("g").await.unwrap().unwrap();
        assert!(set.contains(&MemberId::from("m1")));
        assert_eq!(cluster.running().len(), 1);
    }
}
