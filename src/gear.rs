//! Deduplicated gear store.
//!
//! Gear items recur across imports; identical `(name, stats)` pairs are
//! addressed by a 64-bit content hash so repeated imports of unchanged
//! inventory produce zero new rows. The store keeps a dense, 1-indexed
//! in-memory row sequence whose positions always equal the persisted
//! `local_id` primary keys, plus a per-raider hash index for lookups.
//!
//! One store instance is shared by both worker threads; all mutation goes
//! through a single lock.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Mutex;

use rusqlite::{params, Connection, Transaction};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_128;

use crate::config::StatVec;
use crate::database;
use crate::error::{Result, SyncError};
use crate::source::{InventoryItem, RaiderMeta};

/// Flat-dump format version
const DUMP_VERSION: i64 = 1;

/// Content hash of a gear item's identifying fields.
///
/// The name's UTF-8 bytes and the six stats as big-endian 64-bit integers are
/// hashed with 128-bit xxh3 and the halves folded with XOR. Identical
/// `(name, stats)` always yield the identical key, independent of process or
/// ordering.
pub fn gear_hash(name: &str, stats: &StatVec) -> i64 {
    let mut buf = Vec::with_capacity(name.len() + stats.len() * 8);
    buf.extend_from_slice(name.as_bytes());
    for stat in stats {
        buf.extend_from_slice(&stat.to_be_bytes());
    }
    let h = xxh3_128(&buf);
    ((h as u64) ^ ((h >> 64) as u64)) as i64
}

/// One deduplicated gear record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GearRow {
    pub hash: i64,
    pub raider_id: i64,
    pub slot: String,
    pub name: String,
    pub stats: StatVec,
}

/// Outcome of feeding one inventory item through the store
#[derive(Debug, Clone, Copy)]
pub struct InventoryOutcome {
    pub local_id: i64,
    pub was_new: bool,
    pub equipped: bool,
}

#[derive(Default)]
struct Inner {
    /// Dense rows; index 0 is an unused sentinel. `None` marks a placeholder
    /// backfilled for a gap seen when loading persisted rows.
    rows: Vec<Option<GearRow>>,
    /// raider -> hash -> candidate local ids. A vector of candidates so that
    /// colliding distinct `(name, stats)` pairs can coexist; a candidate only
    /// matches after comparing the stored fields.
    index: HashMap<i64, HashMap<i64, Vec<i64>>>,
    /// raider -> last endless-raid timestamp, flushed into `raids`
    extra: HashMap<i64, i64>,
}

impl Inner {
    fn new() -> Self {
        Inner {
            rows: vec![None],
            index: HashMap::new(),
            extra: HashMap::new(),
        }
    }

    fn last_local_id(&self) -> Option<i64> {
        match self.rows.len() {
            0 | 1 => None,
            n => Some(n as i64 - 1),
        }
    }

    fn find(&self, raider_id: i64, hash: i64, name: &str, stats: &StatVec) -> Option<i64> {
        let candidates = self.index.get(&raider_id)?.get(&hash)?;
        for &local_id in candidates {
            match &self.rows[local_id as usize] {
                Some(row) if row.name == name && row.stats == *stats => return Some(local_id),
                Some(_) => {
                    log::warn!(
                        "gear hash collision for raider {raider_id}: {name:?} vs stored id {local_id}"
                    );
                }
                None => {}
            }
        }
        None
    }

    fn add(&mut self, row: GearRow) -> i64 {
        let raider_id = row.raider_id;
        let hash = row.hash;
        self.rows.push(Some(row));
        let local_id = self.rows.len() as i64 - 1;
        self.index
            .entry(raider_id)
            .or_default()
            .entry(hash)
            .or_default()
            .push(local_id);
        local_id
    }
}

/// Process-wide deduplicated gear store
pub struct GearStore {
    inner: Mutex<Inner>,
}

impl Default for GearStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GearStore {
    pub fn new() -> Self {
        GearStore {
            inner: Mutex::new(Inner::new()),
        }
    }

    /// Highest assigned local id, if any rows exist
    pub fn last_local_id(&self) -> Option<i64> {
        self.inner.lock().unwrap().last_local_id()
    }

    /// Look up the local id of an identical record for this owner
    pub fn find(&self, raider_id: i64, name: &str, stats: &StatVec) -> Option<i64> {
        let inner = self.inner.lock().unwrap();
        inner.find(raider_id, gear_hash(name, stats), name, stats)
    }

    /// Append a record unconditionally, assigning the next local id
    pub fn add(&self, raider_id: i64, slot: &str, name: &str, stats: &StatVec) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        inner.add(GearRow {
            hash: gear_hash(name, stats),
            raider_id,
            slot: slot.to_string(),
            name: name.to_string(),
            stats: *stats,
        })
    }

    /// Feed a batch of per-raider inventories through the dedup index.
    ///
    /// Returns one outcome per item, in batch order, and records each
    /// raider's last endless-raid timestamp when present.
    pub fn add_inventory(&self, metas: &[RaiderMeta]) -> Vec<InventoryOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let mut outcomes = Vec::new();
        for meta in metas {
            for item in &meta.inventory {
                let InventoryItem {
                    name,
                    slot,
                    equipped,
                    stats,
                } = item;
                let hash = gear_hash(name, stats);
                let existing = inner.find(meta.raider_id, hash, name, stats);
                let (local_id, was_new) = match existing {
                    Some(id) => (id, false),
                    None => {
                        let id = inner.add(GearRow {
                            hash,
                            raider_id: meta.raider_id,
                            slot: slot.clone(),
                            name: name.clone(),
                            stats: *stats,
                        });
                        (id, true)
                    }
                };
                outcomes.push(InventoryOutcome {
                    local_id,
                    was_new,
                    equipped: *equipped,
                });
            }
            if let Some(endless) = meta.last_endless {
                inner.extra.insert(meta.raider_id, endless);
            }
        }
        outcomes
    }

    /// Flush rows created since the last flush into the gear table, then
    /// upsert the last-endless extras into `raids`. Returns the number of new
    /// gear rows written.
    pub fn save_to_sql(&self, tx: &Transaction<'_>) -> Result<usize> {
        let next_local_id = database::gear_max_local_id(tx)?.unwrap_or(0) + 1;

        let inner = self.inner.lock().unwrap();
        let mut written = 0;
        if let Some(last) = inner.last_local_id() {
            if next_local_id <= last {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO gear (local_id, hash, raider_id, slot, name,
                         strength, intelligence, agility, wisdom, charm, luck)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                )?;
                for local_id in next_local_id..=last {
                    let Some(row) = &inner.rows[local_id as usize] else {
                        continue;
                    };
                    stmt.execute(params![
                        local_id,
                        row.hash,
                        row.raider_id,
                        &row.slot,
                        &row.name,
                        row.stats[0],
                        row.stats[1],
                        row.stats[2],
                        row.stats[3],
                        row.stats[4],
                        row.stats[5],
                    ])?;
                    written += 1;
                }
            }
        }

        let mut stmt = tx.prepare_cached(
            "INSERT INTO raids (raider, last_endless) VALUES (?1, ?2)
             ON CONFLICT (raider) DO UPDATE SET last_endless = excluded.last_endless",
        )?;
        for (raider, endless) in &inner.extra {
            stmt.execute(params![raider, endless])?;
        }

        Ok(written)
    }

    /// Rebuild the in-memory index from persisted rows.
    ///
    /// Gaps in the persisted local_id sequence are backfilled with
    /// placeholders so the in-memory position always equals the primary key.
    pub fn load_from_sql(&self, conn: &Connection) -> Result<()> {
        let mut stmt = conn.prepare(
            "SELECT local_id, hash, raider_id, slot, name,
                    strength, intelligence, agility, wisdom, charm, luck
             FROM gear ORDER BY local_id",
        )?;
        let rows: Vec<(i64, GearRow)> = stmt
            .query_map([], |row| {
                let mut stats: StatVec = [0; 6];
                for (i, stat) in stats.iter_mut().enumerate() {
                    *stat = row.get(5 + i)?;
                }
                Ok((
                    row.get::<_, i64>(0)?,
                    GearRow {
                        hash: row.get(1)?,
                        raider_id: row.get(2)?,
                        slot: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                        name: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                        stats,
                    },
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;

        let mut extra_stmt = conn.prepare(
            "SELECT raider, last_endless FROM raids
             WHERE last_endless IS NOT NULL AND last_endless != 0",
        )?;
        let extra: HashMap<i64, i64> = extra_stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;

        let mut inner = self.inner.lock().unwrap();
        *inner = Inner::new();
        inner.extra = extra;
        let mut next_id = 1;
        for (local_id, row) in rows {
            while local_id > next_id {
                inner.rows.push(None);
                next_id += 1;
            }
            let assigned = inner.add(row);
            debug_assert_eq!(assigned, local_id);
            next_id = local_id + 1;
        }
        Ok(())
    }

    /// Write a versioned flat dump of every row and extra
    pub fn save_json<W: Write>(&self, writer: W) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let dump = GearDump {
            version: DUMP_VERSION,
            raiders: inner.extra.clone(),
            gear: inner.rows[1..].to_vec(),
        };
        serde_json::to_writer(writer, &dump)?;
        Ok(())
    }

    /// Replace the store's contents from a flat dump, verifying every stored
    /// hash against the row it claims to describe.
    pub fn load_json<R: Read>(&self, reader: R) -> Result<()> {
        let dump: GearDump = serde_json::from_reader(reader)?;
        if dump.version != DUMP_VERSION {
            return Err(SyncError::DumpVersion(dump.version));
        }

        let mut inner = self.inner.lock().unwrap();
        *inner = Inner::new();
        inner.extra = dump.raiders;
        for row in dump.gear {
            match row {
                Some(row) => {
                    if gear_hash(&row.name, &row.stats) != row.hash {
                        return Err(SyncError::DumpCorrupt(row.name));
                    }
                    inner.add(row);
                }
                None => inner.rows.push(None),
            }
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct GearDump {
    version: i64,
    raiders: HashMap<i64, i64>,
    gear: Vec<Option<GearRow>>,
}
