//! Forward-only schema migration chain.
//!
//! Upgrades are ordered by from-version: step *i* transforms version *i* into
//! *i+1*. They run exactly once per open, each inside its own transaction,
//! and the version bump is persisted after the chain completes. There is no
//! downgrade path; a store newer than the code is a fatal, typed error.

use rusqlite::{params, Connection};

use crate::config::StatVec;
use crate::database::{self, META_FINISHED, META_SCHEMA, META_STARTED, META_UPDATED};
use crate::error::{Result, SyncError};
use crate::gear::gear_hash;

/// Schema version this code reads and writes
pub const SCHEMA_VERSION: i64 = 3;

type Upgrade = fn(&mut Connection) -> Result<()>;

/// Upgrade steps indexed by from-version
const UPGRADES: [Upgrade; 3] = [upgrade_v0_meta, upgrade_v1_gear_hashes, upgrade_v2_utc_marker];

enum StoredVersion {
    /// No tables at all; nothing to migrate
    Empty,
    /// Primary tables exist but predate the meta table
    Legacy,
    At(i64),
}

fn stored_version(conn: &Connection) -> Result<StoredVersion> {
    match database::get_meta(conn, META_SCHEMA) {
        Ok(Some(v)) => Ok(StoredVersion::At(v)),
        Ok(None) => Ok(StoredVersion::Legacy),
        Err(rusqlite::Error::SqliteFailure(..)) => {
            // No meta table. An empty db needs no migration; a db with
            // raiders but no meta is the pre-versioning layout.
            let cols: i64 = conn.query_row(
                "SELECT COUNT(*) FROM pragma_table_info('raiders')",
                [],
                |row| row.get(0),
            )?;
            if cols == 0 {
                Ok(StoredVersion::Empty)
            } else {
                Ok(StoredVersion::Legacy)
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// Bring the store up to [`SCHEMA_VERSION`], or fail with
/// [`SyncError::SchemaVersion`] when it is unreachable.
///
/// Opening a store already at the current version performs zero writes.
pub fn check_and_upgrade(conn: &mut Connection) -> Result<()> {
    let mut version = match stored_version(conn)? {
        StoredVersion::Empty => return Ok(()),
        StoredVersion::Legacy => 0,
        StoredVersion::At(v) => v,
    };

    let orig = version;
    while version < SCHEMA_VERSION && (version as usize) < UPGRADES.len() {
        UPGRADES[version as usize](conn)?;
        version += 1;
    }
    if orig != version {
        database::set_meta(conn, META_SCHEMA, version)?;
        log::warn!("upgraded database schema from version {orig} to {version}");
    }
    if version != SCHEMA_VERSION {
        return Err(SyncError::SchemaVersion {
            found: version,
            expected: SCHEMA_VERSION,
        });
    }
    Ok(())
}

/// Operator-facing advice for an incompatible store
pub fn version_advice(found: i64) -> &'static str {
    if found > SCHEMA_VERSION {
        "database is too new for this code, upgrade your code"
    } else {
        "database is too old for this code, rebuild your database"
    }
}

/// v0 -> v1: introduce the meta table. Legacy stores predate snapshot
/// bookkeeping entirely, so all four keys start at zero.
fn upgrade_v0_meta(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        "CREATE TABLE meta(
            name VARCHAR(255) PRIMARY KEY,
            value INTEGER
        );",
    )?;
    tx.execute(
        "INSERT INTO meta (name, value) VALUES (?1, 0), (?2, 0), (?3, 0), (?4, 0)",
        params![META_SCHEMA, META_STARTED, META_UPDATED, META_FINISHED],
    )?;
    tx.commit()?;
    Ok(())
}

/// v1 -> v2: collapse the two-table gear layout (gear_localid referencing
/// deduplicated gear_uniq rows) into one table keyed by content hash.
fn upgrade_v1_gear_hashes(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        "DROP TABLE IF EXISTS gear;
         CREATE TABLE gear(
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
         CREATE INDEX gear__hash ON gear(hash);
         CREATE INDEX gear__raider ON gear(raider_id);",
    )?;

    {
        let mut read = tx.prepare(
            "SELECT l.local_id, l.raider_id, l.equipped, l.slot, u.name,
                    u.strength, u.intelligence, u.agility, u.wisdom, u.charm, u.luck
             FROM gear_localid l, gear_uniq u WHERE l.dedup_id = u.dedup_id",
        )?;
        let mut write = tx.prepare(
            "INSERT INTO gear (local_id, raider_id, equipped, slot, name,
                 strength, intelligence, agility, wisdom, charm, luck, hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )?;

        let mut rows = read.query([])?;
        while let Some(row) = rows.next()? {
            let local_id: i64 = row.get(0)?;
            let raider_id: i64 = row.get(1)?;
            let equipped: Option<i64> = row.get(2)?;
            let slot: Option<String> = row.get(3)?;
            let name: String = row.get(4)?;
            let mut stats: StatVec = [0; 6];
            for (i, stat) in stats.iter_mut().enumerate() {
                *stat = row.get(5 + i)?;
            }
            let hash = gear_hash(&name, &stats);
            write.execute(params![
                local_id, raider_id, equipped, slot, name, stats[0], stats[1], stats[2],
                stats[3], stats[4], stats[5], hash,
            ])?;
        }
    }

    tx.execute_batch("DROP TABLE gear_localid; DROP TABLE gear_uniq;")?;
    tx.commit()?;
    Ok(())
}

/// v2 -> v3: marker only. Snapshot timestamps were previously computed in the
/// local timezone; v3 stores declare their timestamps UTC so freshly built
/// databases compare as newer. No data transform.
fn upgrade_v2_utc_marker(_conn: &mut Connection) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::get_meta;

    /// A pre-versioning store: raiders plus the old two-table gear layout,
    /// no meta table.
    fn legacy_v0_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE raiders(
                id INTEGER PRIMARY KEY,
                name VARCHAR(255),
                strength INTEGER
            );
            CREATE TABLE gear_uniq(
                dedup_id INTEGER PRIMARY KEY,
                name VARCHAR(255),
                strength INTEGER, intelligence INTEGER, agility INTEGER,
                wisdom INTEGER, charm INTEGER, luck INTEGER
            );
            CREATE TABLE gear_localid(
                local_id INTEGER PRIMARY KEY,
                dedup_id INTEGER,
                raider_id INTEGER,
                equipped INTEGER,
                slot VARCHAR(255)
            );
            INSERT INTO raiders (id, name, strength) VALUES (1, 'Ragnar', 9);",
        )
        .unwrap();
        conn
    }

    fn v1_db_with_legacy_gear() -> Connection {
        let mut conn = legacy_v0_db();
        upgrade_v0_meta(&mut conn).unwrap();
        database::set_meta(&conn, META_SCHEMA, 1).unwrap();
        conn.execute_batch(
            "INSERT INTO gear_uniq VALUES (10, 'Rusty Axe', 3, 0, 0, 0, 0, 0);
             INSERT INTO gear_localid VALUES (1, 10, 1, 1, 'main_hand');
             INSERT INTO gear_localid VALUES (2, 10, 1, 0, 'main_hand');",
        )
        .unwrap();
        conn
    }

    #[test]
    fn empty_db_needs_no_migration() {
        let mut conn = Connection::open_in_memory().unwrap();
        check_and_upgrade(&mut conn).unwrap();
        // still no tables
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn legacy_db_upgrades_to_current() {
        let mut conn = legacy_v0_db();
        check_and_upgrade(&mut conn).unwrap();
        assert_eq!(get_meta(&conn, META_SCHEMA).unwrap(), Some(SCHEMA_VERSION));
        // raider data survives
        let name: String = conn
            .query_row("SELECT name FROM raiders WHERE id = 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(name, "Ragnar");
    }

    #[test]
    fn v1_gear_rewrite_computes_hashes() {
        let mut conn = v1_db_with_legacy_gear();
        check_and_upgrade(&mut conn).unwrap();

        let expected = gear_hash("Rusty Axe", &[3, 0, 0, 0, 0, 0]);
        let hashes: Vec<i64> = conn
            .prepare("SELECT hash FROM gear ORDER BY local_id")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(hashes, vec![expected, expected]);

        // legacy tables are gone
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master
                 WHERE type='table' AND name IN ('gear_localid', 'gear_uniq')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn current_version_performs_zero_writes() {
        let conn = Connection::open_in_memory().unwrap();
        database::init_schema(&conn).unwrap();
        let mut conn = conn;
        let changes_before: i64 = conn
            .query_row("SELECT total_changes()", [], |row| row.get(0))
            .unwrap();
        check_and_upgrade(&mut conn).unwrap();
        let changes_after: i64 = conn
            .query_row("SELECT total_changes()", [], |row| row.get(0))
            .unwrap();
        assert_eq!(changes_before, changes_after);
    }

    #[test]
    fn newer_store_is_typed_error() {
        let conn = Connection::open_in_memory().unwrap();
        database::init_schema(&conn).unwrap();
        database::set_meta(&conn, META_SCHEMA, SCHEMA_VERSION + 1).unwrap();
        let mut conn = conn;
        match check_and_upgrade(&mut conn) {
            Err(SyncError::SchemaVersion { found, expected }) => {
                assert_eq!(found, SCHEMA_VERSION + 1);
                assert_eq!(expected, SCHEMA_VERSION);
            }
            other => panic!("expected SchemaVersion error, got {other:?}"),
        }
    }

    #[test]
    fn advice_distinguishes_newer_and_older() {
        assert!(version_advice(SCHEMA_VERSION + 1).contains("upgrade your code"));
        assert!(version_advice(0).contains("rebuild your database"));
    }
}
