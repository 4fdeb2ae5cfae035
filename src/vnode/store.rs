//! Per-partition membership state
//!
//! A `PartitionStore` maps group names to their OR-set and is owned by a
//! single vnode task, so tags minted here are never minted concurrently.
//! Group entries are never deleted individually; only `vacate` drops the
//! whole map once the partition has been handed off.

use crate::common::{MemberId, PartitionId, Result};
use crate::crdt::OrSet;
use crate::vnode::lookup::FastLookup;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

const SNAPSHOT_MAGIC: &[u8; 8] = b"MPGSNAP1";
/// magic + crc32 + payload length
const SNAPSHOT_HEADER_LEN: u64 = 8 + 4 + 8;

/// Partition lifecycle
///
/// `Created → Active → HandingOff → Vacated`, with `HandingOff → Active`
/// when a handoff is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Created,
    Active,
    HandingOff,
    Vacated,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lifecycle::Created => write!(f, "created"),
            Lifecycle::Active => write!(f, "active"),
            Lifecycle::HandingOff => write!(f, "handing_off"),
            Lifecycle::Vacated => write!(f, "vacated"),
        }
    }
}

pub struct PartitionStore {
    partition: PartitionId,
    groups: BTreeMap<String, OrSet<MemberId>>,
    lifecycle: Lifecycle,
    lookup: Arc<dyn FastLookup>,
    /// Bumped on every mutation
    version: u64,
    /// Version at which each group last changed
    touched: BTreeMap<String, u64>,
}

impl PartitionStore {
    pub fn new(partition: PartitionId, lookup: Arc<dyn FastLookup>) -> Self {
        Self {
            partition,
            groups: BTreeMap::new(),
            lifecycle: Lifecycle::Created,
            lookup,
            version: 0,
            touched: BTreeMap::new(),
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Mutation counter, used to detect writes racing a handoff
    pub fn version(&self) -> u64 {
        self.version
    }

    fn touch(&mut self, group: &str) {
        self.version += 1;
        self.touched.insert(group.to_string(), self.version);
    }

    /// Number of group entries, including ones with no visible member
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// True iff no group entry exists.
    ///
    /// A group whose members all left still has an entry and keeps the
    /// store non-empty.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn get(&self, group: &str) -> Option<&OrSet<MemberId>> {
        self.groups.get(group)
    }

    fn serve(&mut self, what: &str) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Vacated => Err(crate::Error::UnhandledCommand(format!(
                "{} on vacated partition {}",
                what, self.partition
            ))),
            Lifecycle::Created => {
                self.lifecycle = Lifecycle::Active;
                Ok(())
            }
            Lifecycle::Active | Lifecycle::HandingOff => Ok(()),
        }
    }

    fn mirror(&self, group: &str) {
        let Some(set) = self.groups.get(group) else {
            return;
        };
        if let Err(e) = self.lookup.write(group, self.partition, &set.value()) {
            tracing::warn!(
                partition = self.partition,
                group = %group,
                error = %e,
                "Fast lookup write failed"
            );
        }
    }

    /// Add `member` to `group`, creating the group on first use.
    pub fn apply_join(&mut self, group: &str, member: MemberId) -> Result<OrSet<MemberId>> {
        self.serve("join")?;
        let set = self.groups.entry(group.to_string()).or_default();
        set.add(member, self.partition);
        let value = set.clone();
        self.touch(group);
        self.mirror(group);
        Ok(value)
    }

    /// Remove `member` from `group`, creating the group on first use.
    pub fn apply_leave(&mut self, group: &str, member: &MemberId) -> Result<OrSet<MemberId>> {
        self.serve("leave")?;
        let set = self.groups.entry(group.to_string()).or_default();
        set.remove(member, self.partition);
        let value = set.clone();
        self.touch(group);
        self.mirror(group);
        Ok(value)
    }

    /// Replace the local set with an authoritative merge result.
    pub fn apply_repair(&mut self, group: &str, set: OrSet<MemberId>) -> Result<()> {
        self.serve("repair")?;
        self.groups.insert(group.to_string(), set);
        self.touch(group);
        self.mirror(group);
        Ok(())
    }

    /// Current subscribers of a channel. Unknown channels read as empty
    /// and are not created.
    pub fn subscribers(&mut self, channel: &str) -> Result<OrSet<MemberId>> {
        self.serve("publish")?;
        Ok(self.groups.get(channel).cloned().unwrap_or_default())
    }

    /// Visit every (group, set) pair.
    pub fn fold<A, F>(&self, mut f: F, acc: A) -> A
    where
        F: FnMut(A, &str, &OrSet<MemberId>) -> A,
    {
        self.groups
            .iter()
            .fold(acc, |acc, (group, set)| f(acc, group, set))
    }

    /// Visit every (group, set) pair changed after version `since`.
    pub fn fold_changed<A, F>(&self, since: u64, mut f: F, acc: A) -> A
    where
        F: FnMut(A, &str, &OrSet<MemberId>) -> A,
    {
        self.touched
            .iter()
            .filter(|(_, version)| **version > since)
            .filter_map(|(group, _)| self.groups.get_key_value(group))
            .fold(acc, |acc, (group, set)| f(acc, group, set))
    }

    /// Merge a handed-off set into whatever this partition already holds.
    pub fn ingest_handoff_item(&mut self, group: &str, set: &OrSet<MemberId>) -> Result<()> {
        self.serve("handoff ingest")?;
        self.groups.entry(group.to_string()).or_default().merge(set);
        self.touch(group);
        self.mirror(group);
        Ok(())
    }

    pub fn begin_handoff(&mut self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Created | Lifecycle::Active => {
                self.lifecycle = Lifecycle::HandingOff;
                Ok(())
            }
            Lifecycle::HandingOff => Err(crate::Error::Handoff(format!(
                "partition {} is already handing off",
                self.partition
            ))),
            Lifecycle::Vacated => Err(crate::Error::Handoff(format!(
                "partition {} is vacated",
                self.partition
            ))),
        }
    }

    /// Abort a handoff. Nothing was cleared, so the partition just resumes.
    pub fn cancel_handoff(&mut self) {
        if self.lifecycle == Lifecycle::HandingOff {
            self.lifecycle = Lifecycle::Active;
        }
    }

    /// Drop all local state after ownership moved away.
    ///
    /// The fast lookup is left alone: the handoff target mirrors the same
    /// (group, partition) keys with the merged value.
    pub fn vacate(&mut self) {
        self.groups.clear();
        self.touched.clear();
        self.lifecycle = Lifecycle::Vacated;
    }

    /// Vacate if nothing changed since the fold taken at `version`.
    ///
    /// Returns `Ok(false)` when writes landed after that fold; the caller
    /// must ship the changed groups and try again.
    pub fn finish_handoff(&mut self, version: u64) -> Result<bool> {
        if self.lifecycle != Lifecycle::HandingOff {
            return Err(crate::Error::Handoff(format!(
                "partition {} is {}, not handing off",
                self.partition, self.lifecycle
            )));
        }
        if self.version != version {
            return Ok(false);
        }
        self.vacate();
        Ok(true)
    }

    /// Replace this partition's fast lookup entries with its current groups
    pub fn rebuild_lookup(&self) {
        self.lookup.clear_partition(self.partition);
        for group in self.groups.keys() {
            self.mirror(group);
        }
    }

    // === Persistence ===

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.groups)?)
    }

    pub fn decode(
        partition: PartitionId,
        bytes: &[u8],
        lookup: Arc<dyn FastLookup>,
    ) -> Result<Self> {
        let groups: BTreeMap<String, OrSet<MemberId>> = bincode::deserialize(bytes)?;
        let lifecycle = if groups.is_empty() {
            Lifecycle::Created
        } else {
            Lifecycle::Active
        };
        Ok(Self {
            partition,
            groups,
            lifecycle,
            lookup,
            version: 0,
            touched: BTreeMap::new(),
        })
    }

    /// Write `magic | crc32 | len | payload` to `path`.
    ///
    /// The snapshot is written next to `path` and renamed over it, so a
    /// crash mid-write leaves the previous snapshot intact.
    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let payload = self.encode()?;
        let temp_path = path.with_extension("snap.tmp");

        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(SNAPSHOT_MAGIC)?;
        writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
        writer.write_all(&(payload.len() as u64).to_le_bytes())?;
        writer.write_all(&payload)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    pub fn load_snapshot(
        path: impl AsRef<Path>,
        partition: PartitionId,
        lookup: Arc<dyn FastLookup>,
    ) -> Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != SNAPSHOT_MAGIC {
            return Err(crate::Error::Corrupted("Invalid snapshot magic".into()));
        }

        let mut crc_bytes = [0u8; 4];
        reader.read_exact(&mut crc_bytes)?;
        let expected = u32::from_le_bytes(crc_bytes);

        let mut len_bytes = [0u8; 8];
        reader.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes);
        let available = file_len.saturating_sub(SNAPSHOT_HEADER_LEN);
        if len > available {
            return Err(crate::Error::Corrupted(format!(
                "Snapshot claims {} payload bytes, file holds {}",
                len, available
            )));
        }

        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload)?;

        let actual = crc32fast::hash(&payload);
        if actual != expected {
            return Err(crate::Error::ChecksumMismatch { expected, actual });
        }

        let store = Self::decode(partition, &payload, lookup)?;
        store.rebuild_lookup();
        Ok(store)
    }
}
