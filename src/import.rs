//! Phase-by-phase import of raider data into a working database.
//!
//! Phases run in a fixed order (basic, gear, recruiting, questing), each in
//! its own transaction committed before the next starts. There is no
//! cross-phase atomicity; a crash mid-import leaves later phases stale, which
//! the snapshot timestamps make visible.
//!
//! Failures of individual fetches are logged into the status stream and that
//! unit is skipped; the job keeps going with the remaining units.

use std::collections::BTreeSet;

use rusqlite::Connection;

use crate::database::{self, SnapshotInfo, META_FINISHED, META_STARTED, META_UPDATED};
use crate::error::Result;
use crate::gear::GearStore;
use crate::migrate::SCHEMA_VERSION;
use crate::progress::Reporter;
use crate::source::{DataSource, RaiderMeta};

/// Raiders fetched per request in the basic phase
const FETCH_CHUNK: usize = 50;

/// Recruiting costs above this are garbage from a failed read and force a
/// re-fetch
const RECRUIT_COST_SANE_MAX: i64 = 1_000_000_000;

/// Import parameters: which raiders (None = discover everything) and which
/// phases to run.
#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub raiders: Option<Vec<i64>>,
    pub basic: bool,
    pub gear: bool,
    pub recruiting: bool,
    pub questing: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        ImportOptions {
            raiders: None,
            basic: true,
            gear: true,
            recruiting: true,
            questing: true,
        }
    }
}

pub(crate) fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Run one import job against an open working database.
///
/// Full mode (no id list) discovers the universe and brackets the run with
/// `snapshot-started`/`snapshot-finished`; partial mode imports only the
/// given ids and advances `snapshot-updated`. Returns the snapshot info and
/// the id list the job covered.
pub fn import_or_update(
    conn: &mut Connection,
    gear: &GearStore,
    source: &dyn DataSource,
    opts: &ImportOptions,
    rep: &Reporter<'_>,
) -> Result<(SnapshotInfo, Vec<i64>)> {
    let mut info = SnapshotInfo {
        schema_version: SCHEMA_VERSION,
        started: 0,
        updated: 0,
        path: None,
    };
    let mut questers: Option<BTreeSet<i64>> = None;
    let full = opts.raiders.is_none();

    let ids: Vec<i64> = match &opts.raiders {
        None => {
            rep.section("Updating all raiders")?;
            info.started = now_secs();
            database::set_meta(conn, META_STARTED, info.started)?;

            let discovered = source.discover_ids(rep)?;
            let mut universe: BTreeSet<i64> = discovered.owned.iter().copied().collect();
            universe.extend(discovered.questing.iter().copied());
            questers = Some(discovered.questing.into_iter().collect());

            let known = database::known_raider_ids(conn)?;
            let gone: Vec<i64> = known
                .into_iter()
                .filter(|id| !universe.contains(id))
                .collect();
            if !gone.is_empty() {
                log::warn!("skipping {} raiders no longer owned: {gone:?}", gone.len());
            }
            rep.tick()?;

            let ids: Vec<i64> = universe.into_iter().collect();
            import_raiders(conn, gear, source, &ids, rep)?;
            ids
        }
        Some(list) => {
            let mut ids = list.clone();
            ids.sort_unstable();
            ids.dedup();
            rep.section(&format!("Updating raider(s) {ids:?}"))?;
            info.started = database::get_meta(conn, META_STARTED)?.unwrap_or(0);
            if opts.basic {
                import_raiders(conn, gear, source, &ids, rep)?;
            }
            ids
        }
    };

    if opts.gear {
        import_gear(conn, gear, source, rep)?;
    }
    if opts.recruiting {
        import_recruiting(conn, source, &ids, rep)?;
    }
    if opts.questing {
        import_quests(conn, source, &ids, questers.as_ref(), rep)?;
    }

    info.updated = now_secs();
    database::set_meta(conn, META_UPDATED, info.updated)?;
    if full {
        database::set_meta(conn, META_FINISHED, info.updated)?;
    }
    Ok((info, ids))
}

/// Basic phase: raider attribute rows plus the metadata that travels with
/// them (raid counters, inventory). One transaction for the whole phase.
fn import_raiders(
    conn: &mut Connection,
    gear: &GearStore,
    source: &dyn DataSource,
    ids: &[i64],
    rep: &Reporter<'_>,
) -> Result<()> {
    rep.section("Importing raider data")?;
    let tx = conn.transaction()?;

    let mut metas: Vec<RaiderMeta> = Vec::with_capacity(ids.len());
    let mut imported = 0usize;
    for (first, chunk) in ids.chunks(FETCH_CHUNK).enumerate().map(|(i, c)| (i * FETCH_CHUNK, c)) {
        rep.message(&format!("fetching {} raiders", chunk.len()))?;
        let records = match source.fetch_raiders(chunk, rep) {
            Ok(records) => records,
            Err(e) => {
                rep.message(&format!("error fetching raiders {chunk:?}: {e}"))?;
                log::warn!("skipping raider chunk starting at {first}: {e}");
                continue;
            }
        };

        for (idx, record) in records.iter().enumerate() {
            rep.message(&format!(
                "importing raider {}/{} - {} {}",
                first + idx + 1,
                ids.len(),
                record.id,
                record.name
            ))?;
            database::upsert_raiders_tx(&tx, std::slice::from_ref(record))?;
            imported += 1;

            match source.fetch_raider_meta(record.id, rep) {
                Ok(meta) => metas.push(meta),
                Err(e) => {
                    rep.message(&format!("error fetching raider {} metadata: {e}", record.id))?;
                    log::warn!("no metadata for raider {}: {e}", record.id);
                }
            }
        }
    }

    apply_raider_meta(&tx, gear, &metas, rep)?;
    tx.commit()?;
    rep.message(&format!("imported {imported} raider(s)"))?;
    Ok(())
}

/// Shared tail of the basic and gear phases: raid timers, gear dedup, and the
/// two-step equipped update.
fn apply_raider_meta(
    tx: &rusqlite::Transaction<'_>,
    gear: &GearStore,
    metas: &[RaiderMeta],
    rep: &Reporter<'_>,
) -> Result<()> {
    database::upsert_raid_timers_tx(tx, metas)?;
    rep.tick()?;

    // A freshly rebuilt db has an empty gear table; seed it from everything
    // the store already knows before deduplicating the new batch against it.
    if database::gear_max_local_id(tx)?.is_none() {
        let seeded = gear.save_to_sql(tx)?;
        if seeded > 0 {
            rep.message(&format!("added {seeded} saved gear item(s)"))?;
        }
    }

    let outcomes = gear.add_inventory(metas);
    let equipped_ids: Vec<i64> = outcomes
        .iter()
        .filter(|o| o.equipped)
        .map(|o| o.local_id)
        .collect();
    let added = gear.save_to_sql(tx)?;
    rep.message(&format!("added {added} new gear item(s)"))?;

    let owners: Vec<i64> = metas.iter().map(|m| m.raider_id).collect();
    database::clear_equipped_tx(tx, &owners)?;
    database::set_equipped_tx(tx, &equipped_ids)?;
    rep.tick()?;
    Ok(())
}

/// Gear phase: inventory for owned, non-questing raiders from the private API
fn import_gear(
    conn: &mut Connection,
    gear: &GearStore,
    source: &dyn DataSource,
    rep: &Reporter<'_>,
) -> Result<()> {
    rep.section("Importing raider inventory")?;
    let metas = match source.fetch_owned_inventory(rep) {
        Ok(metas) => metas,
        Err(e) => {
            rep.message(&format!("error: {e}"))?;
            log::warn!("inventory fetch failed, skipping gear phase: {e}");
            return Ok(());
        }
    };
    rep.message(&format!("found {} non-questing raiders", metas.len()))?;

    let tx = conn.transaction()?;
    apply_raider_meta(&tx, gear, &metas, rep)?;
    tx.commit()?;
    Ok(())
}

/// Recruiting phase: refresh per-raider timers, reusing cached rows that are
/// still plausible.
fn import_recruiting(
    conn: &mut Connection,
    source: &dyn DataSource,
    ids: &[i64],
    rep: &Reporter<'_>,
) -> Result<()> {
    rep.section("Importing recruitment data")?;
    let tx = conn.transaction()?;
    let now = now_secs();

    for (idx, &rid) in ids.iter().enumerate() {
        rep.message(&format!("{}/{} - raider {rid}", idx + 1, ids.len()))?;
        let cached = database::get_recruiting(&tx, rid)?;
        let fresh = cached
            .map(|t| t.cost <= RECRUIT_COST_SANE_MAX && t.next >= now)
            .unwrap_or(false);
        if fresh {
            continue;
        }
        match source.fetch_recruiting(rid, rep) {
            Ok(timer) => database::upsert_recruiting_tx(&tx, rid, &timer)?,
            Err(e) => {
                rep.message(&format!("error fetching recruiting for {rid}: {e}"))?;
                log::warn!("skipping recruiting for raider {rid}: {e}");
            }
        }
    }

    tx.commit()?;
    rep.tick()?;
    Ok(())
}

/// Questing phase: refresh per-raider quest state. Discovery results, when
/// available, answer the on-quest question without another probe.
fn import_quests(
    conn: &mut Connection,
    source: &dyn DataSource,
    ids: &[i64],
    questers: Option<&BTreeSet<i64>>,
    rep: &Reporter<'_>,
) -> Result<()> {
    rep.section("Importing quest data")?;
    let tx = conn.transaction()?;

    for (idx, &rid) in ids.iter().enumerate() {
        rep.message(&format!("{}/{} - raider {rid}", idx + 1, ids.len()))?;
        let on_quest = questers.map(|set| set.contains(&rid));
        match source.fetch_quest(rid, on_quest, rep) {
            Ok(quest) => database::upsert_quest_tx(&tx, &quest)?,
            Err(e) => {
                rep.message(&format!("error fetching quest for {rid}: {e}"))?;
                log::warn!("skipping quest state for raider {rid}: {e}");
            }
        }
    }

    tx.commit()?;
    rep.tick()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{get_meta, init_schema};
    use crate::error::SyncError;
    use crate::progress::{CancelToken, NullProgress, Progress, Reporter};
    use crate::source::test_fixtures::{make_item, make_raider, make_raider_meta};
    use crate::source::{DiscoveredIds, QuestState, RaiderRecord, RecruitTimer};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted in-memory data source
    #[derive(Default)]
    struct FakeSource {
        owned: Vec<i64>,
        questing: Vec<i64>,
        raiders: Vec<RaiderRecord>,
        metas: Vec<RaiderMeta>,
        owned_inventory: Vec<RaiderMeta>,
        recruit_calls: AtomicUsize,
        fail_meta_for: Mutex<Vec<i64>>,
    }

    impl DataSource for FakeSource {
        fn discover_ids(&self, _rep: &Reporter<'_>) -> Result<DiscoveredIds> {
            Ok(DiscoveredIds {
                owned: self.owned.clone(),
                questing: self.questing.clone(),
            })
        }

        fn fetch_raiders(&self, ids: &[i64], _rep: &Reporter<'_>) -> Result<Vec<RaiderRecord>> {
            Ok(self
                .raiders
                .iter()
                .filter(|r| ids.contains(&r.id))
                .cloned()
                .collect())
        }

        fn fetch_raider_meta(&self, raider_id: i64, _rep: &Reporter<'_>) -> Result<RaiderMeta> {
            if self.fail_meta_for.lock().unwrap().contains(&raider_id) {
                return Err(SyncError::BadTimestamp("scripted failure".to_string()));
            }
            self.metas
                .iter()
                .find(|m| m.raider_id == raider_id)
                .cloned()
                .ok_or_else(|| SyncError::BadTimestamp("no meta".to_string()))
        }

        fn fetch_owned_inventory(&self, _rep: &Reporter<'_>) -> Result<Vec<RaiderMeta>> {
            Ok(self.owned_inventory.clone())
        }

        fn fetch_recruiting(&self, _raider_id: i64, _rep: &Reporter<'_>) -> Result<RecruitTimer> {
            self.recruit_calls.fetch_add(1, Ordering::SeqCst);
            Ok(RecruitTimer {
                next: now_secs() + 3600,
                cost: 40,
            })
        }

        fn fetch_quest(
            &self,
            raider_id: i64,
            on_quest: Option<bool>,
            _rep: &Reporter<'_>,
        ) -> Result<QuestState> {
            if on_quest.unwrap_or(false) {
                Ok(QuestState {
                    status: crate::source::QUEST_STATUS_OUTBOUND,
                    contract: Some("0xquest".to_string()),
                    started_on: Some(now_secs() - 100),
                    return_divisor: Some(2),
                    reward_time: Some(600),
                    ..QuestState::idle(raider_id)
                })
            } else {
                Ok(QuestState::idle(raider_id))
            }
        }
    }

    fn two_raider_source() -> FakeSource {
        FakeSource {
            owned: vec![1],
            questing: vec![2],
            raiders: vec![make_raider(1, "Bjorn", 3), make_raider(2, "Ingrid", 5)],
            metas: vec![
                make_raider_meta(1, &[make_item("Axe", "main_hand", true)]),
                make_raider_meta(2, &[make_item("Robe", "dress", false)]),
            ],
            ..FakeSource::default()
        }
    }

    fn run(
        conn: &mut Connection,
        gear: &GearStore,
        source: &dyn DataSource,
        opts: &ImportOptions,
    ) -> Result<(SnapshotInfo, Vec<i64>)> {
        let cancel = CancelToken::new();
        let rep = Reporter::new(&NullProgress, &cancel);
        import_or_update(conn, gear, source, opts, &rep)
    }

    fn fresh_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn full_import_covers_discovered_universe() {
        let mut conn = fresh_db();
        let gear = GearStore::new();
        let source = two_raider_source();

        let (info, ids) = run(&mut conn, &gear, &source, &ImportOptions::default()).unwrap();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(info.schema_version, SCHEMA_VERSION);
        assert!(info.started > 0);
        assert!(info.updated >= info.started);

        assert_eq!(database::known_raider_ids(&conn).unwrap(), vec![1, 2]);
        assert_eq!(get_meta(&conn, META_STARTED).unwrap(), Some(info.started));
        assert_eq!(get_meta(&conn, META_UPDATED).unwrap(), Some(info.updated));
        assert_eq!(get_meta(&conn, META_FINISHED).unwrap(), Some(info.updated));

        // gear landed with the equipped flag set
        let (count, equipped): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), SUM(equipped) FROM gear",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(equipped, 1);

        // quests reflect the discovery split
        let status2: i64 = conn
            .query_row("SELECT status FROM quests WHERE raider = 2", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(status2, crate::source::QUEST_STATUS_OUTBOUND);
    }

    #[test]
    fn partial_update_does_not_touch_snapshot_started() {
        let mut conn = fresh_db();
        let gear = GearStore::new();
        let source = two_raider_source();

        let (full_info, _) = run(&mut conn, &gear, &source, &ImportOptions::default()).unwrap();

        let opts = ImportOptions {
            raiders: Some(vec![1]),
            ..ImportOptions::default()
        };
        let (info, ids) = run(&mut conn, &gear, &source, &opts).unwrap();
        assert_eq!(ids, vec![1]);
        assert_eq!(info.started, full_info.started);
        assert_eq!(
            get_meta(&conn, META_FINISHED).unwrap(),
            Some(full_info.updated),
            "partial update must not advance snapshot-finished"
        );
    }

    #[test]
    fn reimporting_unchanged_inventory_adds_zero_rows() {
        let mut conn = fresh_db();
        let gear = GearStore::new();
        let source = two_raider_source();

        run(&mut conn, &gear, &source, &ImportOptions::default()).unwrap();
        let count_before: i64 = conn
            .query_row("SELECT COUNT(*) FROM gear", [], |row| row.get(0))
            .unwrap();

        run(&mut conn, &gear, &source, &ImportOptions::default()).unwrap();
        let count_after: i64 = conn
            .query_row("SELECT COUNT(*) FROM gear", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count_before, count_after);
    }

    #[test]
    fn equipped_exclusive_per_slot_after_swap() {
        let mut conn = fresh_db();
        let gear = GearStore::new();
        let mut source = two_raider_source();

        run(&mut conn, &gear, &source, &ImportOptions::default()).unwrap();

        // raider 1 swaps to a different main hand weapon
        source.metas[0] = make_raider_meta(
            1,
            &[
                make_item("Axe", "main_hand", false),
                make_item("Warhammer", "main_hand", true),
            ],
        );
        run(&mut conn, &gear, &source, &ImportOptions::default()).unwrap();

        let max_per_slot: i64 = conn
            .query_row(
                "SELECT MAX(c) FROM (
                     SELECT COUNT(*) AS c FROM gear
                     WHERE equipped = 1 GROUP BY raider_id, slot
                 )",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(max_per_slot, 1);

        let equipped_name: String = conn
            .query_row(
                "SELECT name FROM gear WHERE raider_id = 1 AND equipped = 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(equipped_name, "Warhammer");
    }

    #[test]
    fn meta_fetch_failure_skips_unit_and_continues() {
        let mut conn = fresh_db();
        let gear = GearStore::new();
        let source = two_raider_source();
        source.fail_meta_for.lock().unwrap().push(1);

        let (_, ids) = run(&mut conn, &gear, &source, &ImportOptions::default()).unwrap();
        assert_eq!(ids, vec![1, 2]);
        // both raiders imported even though raider 1's metadata failed
        assert_eq!(database::known_raider_ids(&conn).unwrap(), vec![1, 2]);
        // only raider 2's gear arrived
        let owners: Vec<i64> = conn
            .prepare("SELECT DISTINCT raider_id FROM gear ORDER BY raider_id")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(owners, vec![2]);
    }

    #[test]
    fn fresh_recruiting_rows_are_not_refetched() {
        let mut conn = fresh_db();
        let gear = GearStore::new();
        let source = two_raider_source();

        run(&mut conn, &gear, &source, &ImportOptions::default()).unwrap();
        let calls_first = source.recruit_calls.load(Ordering::SeqCst);
        assert_eq!(calls_first, 2);

        // second run: both rows are fresh (next is an hour out)
        run(&mut conn, &gear, &source, &ImportOptions::default()).unwrap();
        assert_eq!(source.recruit_calls.load(Ordering::SeqCst), calls_first);
    }

    #[test]
    fn phase_flags_skip_phases() {
        let mut conn = fresh_db();
        let gear = GearStore::new();
        let source = two_raider_source();

        let opts = ImportOptions {
            raiders: Some(vec![1, 2]),
            basic: true,
            gear: false,
            recruiting: false,
            questing: false,
        };
        run(&mut conn, &gear, &source, &opts).unwrap();

        let quests: i64 = conn
            .query_row("SELECT COUNT(*) FROM quests", [], |row| row.get(0))
            .unwrap();
        let recruiting: i64 = conn
            .query_row("SELECT COUNT(*) FROM recruiting", [], |row| row.get(0))
            .unwrap();
        assert_eq!(quests, 0);
        assert_eq!(recruiting, 0);
    }

    #[test]
    fn cancellation_surfaces_at_yield_points() {
        let mut conn = fresh_db();
        let gear = GearStore::new();
        let source = two_raider_source();

        struct CancelAfterFirst<'a>(&'a CancelToken);
        impl Progress for CancelAfterFirst<'_> {
            fn on_progress(&self, _section: Option<&str>, _message: Option<&str>) {
                self.0.cancel();
            }
        }

        let cancel = CancelToken::new();
        let progress = CancelAfterFirst(&cancel);
        let rep = Reporter::new(&progress, &cancel);
        let result = import_or_update(
            &mut conn,
            &gear,
            &source,
            &ImportOptions::default(),
            &rep,
        );
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }
}
