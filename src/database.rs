//! Database operations for raider sync
//!
//! Uses parameterized queries exclusively (no SQL string concatenation apart
//! from placeholder lists). All multi-row writes run inside the caller's
//! transaction so a phase commits as one unit.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};

use crate::source::{QuestState, RaiderMeta, RaiderRecord, RecruitTimer};

/// Result type for database operations
pub type DbResult<T> = rusqlite::Result<T>;

/// Meta keys bracketing the most recent completed full rebuild
pub const META_STARTED: &str = "snapshot-started";
pub const META_UPDATED: &str = "snapshot-updated";
pub const META_FINISHED: &str = "snapshot-finished";
pub const META_SCHEMA: &str = "schema-version";

/// Timestamps and version of a finished sync, as written to `meta` and
/// serialized into latest.json with the wire key names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    #[serde(rename = "schema-version")]
    pub schema_version: i64,
    #[serde(rename = "snapshot-started")]
    pub started: i64,
    #[serde(rename = "snapshot-updated")]
    pub updated: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Initialize the database schema
///
/// Creates tables if they don't exist:
/// - `meta`: key/value rows (schema version, snapshot timestamps)
/// - `raiders`: one row per raider, replaced wholesale on import
/// - `gear`: deduplicated inventory items addressed by content hash
/// - `raids`, `recruiting`, `quests`: per-raider timer tables
pub fn init_schema(conn: &Connection) -> DbResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS meta(
            name VARCHAR(255) PRIMARY KEY,
            value INTEGER
        );

        CREATE TABLE IF NOT EXISTS raiders(
            id INTEGER PRIMARY KEY,
            name VARCHAR(255),
            image TEXT,
            race VARCHAR(255),
            generation INTEGER,
            birthday INTEGER,
            experience INTEGER,
            level INTEGER,
            strength INTEGER,
            intelligence INTEGER,
            agility INTEGER,
            wisdom INTEGER,
            charm INTEGER,
            luck INTEGER
        );

        CREATE TABLE IF NOT EXISTS gear(
            local_id INTEGER PRIMARY KEY,
            hash INTEGER NOT NULL,
            raider_id INTEGER NOT NULL,
            name VARCHAR(255),
            equipped INTEGER,
            slot VARCHAR(255),
            strength INTEGER,
            intelligence INTEGER,
            agility INTEGER,
            wisdom INTEGER,
            charm INTEGER,
            luck INTEGER,
            FOREIGN KEY(raider_id) REFERENCES raiders(id)
        );

        CREATE INDEX IF NOT EXISTS gear__hash ON gear(hash);
        CREATE INDEX IF NOT EXISTS gear__raider ON gear(raider_id);

        CREATE TABLE IF NOT EXISTS raids(
            raider INTEGER PRIMARY KEY,
            remaining INTEGER,
            last_raid INTEGER,
            last_endless INTEGER,
            FOREIGN KEY(raider) REFERENCES raiders(id)
        );

        CREATE TABLE IF NOT EXISTS recruiting(
            raider INTEGER PRIMARY KEY,
            next INTEGER,
            cost INTEGER,
            FOREIGN KEY(raider) REFERENCES raiders(id)
        );

        CREATE TABLE IF NOT EXISTS quests(
            raider INTEGER PRIMARY KEY,
            status INTEGER,
            contract VARCHAR(255),
            started_on INTEGER,
            return_divisor INTEGER,
            returns_on INTEGER,
            reward_time INTEGER,
            FOREIGN KEY(raider) REFERENCES raiders(id)
        );
        ",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO meta (name, value) VALUES (?1, ?2)",
        params![META_SCHEMA, crate::migrate::SCHEMA_VERSION],
    )?;

    Ok(())
}

/// Read one integer meta value
pub fn get_meta(conn: &Connection, name: &str) -> DbResult<Option<i64>> {
    conn.query_row(
        "SELECT value FROM meta WHERE name = ?1",
        params![name],
        |row| row.get(0),
    )
    .optional()
}

/// Write one integer meta value
pub fn set_meta(conn: &Connection, name: &str, value: i64) -> DbResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (name, value) VALUES (?1, ?2)",
        params![name, value],
    )?;
    Ok(())
}

/// All raider ids currently in the store
pub fn known_raider_ids(conn: &Connection) -> DbResult<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT id FROM raiders ORDER BY id")?;
    let ids: DbResult<Vec<i64>> = stmt.query_map([], |row| row.get(0))?.collect();
    ids
}

/// Replace raider rows wholesale
///
/// Raiders are never partially updated field-by-field; each import overwrites
/// the full attribute set for that id.
pub fn upsert_raiders_tx(tx: &Transaction<'_>, raiders: &[RaiderRecord]) -> DbResult<usize> {
    let mut stmt = tx.prepare_cached(
        "INSERT OR REPLACE INTO raiders
         (id, name, image, race, generation, birthday, experience, level,
          strength, intelligence, agility, wisdom, charm, luck)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
    )?;

    for r in raiders {
        stmt.execute(params![
            r.id,
            &r.name,
            &r.image,
            &r.race,
            r.generation,
            r.birthday,
            r.experience,
            r.level,
            r.stats[0],
            r.stats[1],
            r.stats[2],
            r.stats[3],
            r.stats[4],
            r.stats[5],
        ])?;
    }
    Ok(raiders.len())
}

/// Upsert raid counters without touching the last_endless column, which is
/// owned by the gear store flush.
pub fn upsert_raid_timers_tx(tx: &Transaction<'_>, metas: &[RaiderMeta]) -> DbResult<()> {
    let mut stmt = tx.prepare_cached(
        "INSERT INTO raids (raider, remaining, last_raid)
         VALUES (?1, ?2, ?3)
         ON CONFLICT (raider) DO UPDATE
         SET remaining = excluded.remaining, last_raid = excluded.last_raid",
    )?;
    for m in metas {
        stmt.execute(params![m.raider_id, m.raids_remaining, m.last_raided])?;
    }
    Ok(())
}

/// Clear the equipped flag for every gear row belonging to the given owners.
/// First half of the clear-then-set update; the source reports a full
/// equipped/unequipped list, not a diff.
pub fn clear_equipped_tx(tx: &Transaction<'_>, owner_ids: &[i64]) -> DbResult<()> {
    if owner_ids.is_empty() {
        return Ok(());
    }
    let placeholders = vec!["?"; owner_ids.len()].join(",");
    let sql = format!("UPDATE gear SET equipped = 0 WHERE raider_id IN ({placeholders})");
    tx.execute(&sql, params_from_iter(owner_ids.iter()))?;
    Ok(())
}

/// Set the equipped flag on the given local ids (second half of the update)
pub fn set_equipped_tx(tx: &Transaction<'_>, local_ids: &[i64]) -> DbResult<()> {
    let mut stmt = tx.prepare_cached("UPDATE gear SET equipped = 1 WHERE local_id = ?1")?;
    for id in local_ids {
        stmt.execute(params![id])?;
    }
    Ok(())
}

/// Highest persisted gear local id, if any rows exist
pub fn gear_max_local_id(conn: &Connection) -> DbResult<Option<i64>> {
    conn.query_row("SELECT MAX(local_id) FROM gear", [], |row| row.get(0))
}

/// Read the cached recruiting timer for one raider
pub fn get_recruiting(conn: &Connection, raider_id: i64) -> DbResult<Option<RecruitTimer>> {
    conn.query_row(
        "SELECT next, cost FROM recruiting WHERE raider = ?1",
        params![raider_id],
        |row| {
            Ok(RecruitTimer {
                next: row.get(0)?,
                cost: row.get(1)?,
            })
        },
    )
    .optional()
}

/// Replace the recruiting timer for one raider
pub fn upsert_recruiting_tx(
    tx: &Transaction<'_>,
    raider_id: i64,
    timer: &RecruitTimer,
) -> DbResult<()> {
    tx.execute(
        "INSERT OR REPLACE INTO recruiting (raider, next, cost) VALUES (?1, ?2, ?3)",
        params![raider_id, timer.next, timer.cost],
    )?;
    Ok(())
}

/// Replace the quest state for one raider. Absent fields become NULL, which
/// matches a wholesale row replacement.
pub fn upsert_quest_tx(tx: &Transaction<'_>, quest: &QuestState) -> DbResult<()> {
    tx.execute(
        "INSERT OR REPLACE INTO quests
         (raider, status, contract, started_on, return_divisor, returns_on, reward_time)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            quest.raider_id,
            quest.status,
            quest.contract,
            quest.started_on,
            quest.return_divisor,
            quest.returns_on,
            quest.reward_time,
        ],
    )?;
    Ok(())
}
