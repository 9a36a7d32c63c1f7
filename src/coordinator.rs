//! Background job coordination.
//!
//! Two dedicated worker threads, one per job kind. The rebuild worker loops
//! on a wait condition and is single-flight: requests arriving while a
//! rebuild is running join its status fan-out instead of starting a second
//! run. The update worker drains a FIFO queue, one request at a time. The two
//! may run concurrently with each other; they work on different files and the
//! structures they share (gear store, latest pointer, known-id set) are each
//! behind their own lock.
//!
//! Status fan-out uses one unbounded channel per subscriber carrying
//! `Option<String>`; `None` is the terminal sentinel and is always delivered,
//! including on job errors and during shutdown.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use rusqlite::Connection;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::config::Config;
use crate::database::{self, SnapshotInfo};
use crate::error::{Result, SyncError};
use crate::gear::GearStore;
use crate::import::{self, ImportOptions};
use crate::migrate;
use crate::progress::{CancelToken, Progress, Reporter, SectionFormatter};
use crate::publish::{self, LatestState};
use crate::source::DataSource;

/// One status line, or `None`: the stream-ended sentinel
pub type StatusMsg = Option<String>;
pub type StatusTx = UnboundedSender<StatusMsg>;
pub type StatusRx = UnboundedReceiver<StatusMsg>;

const UNAVAILABLE: &str = "service unavailable: shutting down";

/// Everything the workers, publisher and web layer share, constructed once at
/// startup.
pub struct SyncContext {
    pub config: Config,
    pub gear: GearStore,
    pub source: Box<dyn DataSource>,
    pub latest: LatestState,
    known_ids: Mutex<HashSet<i64>>,
    pub exiting: CancelToken,
}

impl SyncContext {
    /// Build the context: create directories, load the published pointer,
    /// and seed the gear index and known-id universe from the existing update
    /// base, if one survives from a previous run.
    pub fn initialize(config: Config, source: Box<dyn DataSource>) -> Result<Self> {
        fs::create_dir_all(&config.work_dir)?;
        fs::create_dir_all(&config.www_dir)?;

        let latest = LatestState::load(config.latest_path())?;
        let gear = GearStore::new();
        let mut known = HashSet::new();

        let base = config.update_base_path();
        if base.exists() {
            let mut conn = Connection::open(&base)?;
            migrate::check_and_upgrade(&mut conn)?;
            database::init_schema(&conn)?;
            gear.load_from_sql(&conn)?;
            known = database::known_raider_ids(&conn)?.into_iter().collect();
            log::info!("seeded {} known raiders from {}", known.len(), base.display());
        }

        Ok(SyncContext {
            config,
            gear,
            source,
            latest,
            known_ids: Mutex::new(known),
            exiting: CancelToken::new(),
        })
    }

    /// Ids in the last known universe; /update validates against this
    pub fn known_ids(&self) -> HashSet<i64> {
        self.known_ids.lock().unwrap().clone()
    }

    fn set_known_ids(&self, ids: impl IntoIterator<Item = i64>) {
        *self.known_ids.lock().unwrap() = ids.into_iter().collect();
    }
}

/// Open (migrating if needed) the working db, run the import, compress the
/// result into the snapshot directory and advance the latest pointer.
/// Shared tail of both job kinds.
fn run_sync_job(
    ctx: &SyncContext,
    db_path: &Path,
    opts: &ImportOptions,
    rep: &Reporter<'_>,
) -> Result<(SnapshotInfo, Vec<i64>)> {
    let mut conn = Connection::open(db_path)?;
    migrate::check_and_upgrade(&mut conn)?;
    database::init_schema(&conn)?;
    rep.tick()?;

    let (mut info, ids) =
        import::import_or_update(&mut conn, &ctx.gear, ctx.source.as_ref(), opts, rep)?;
    drop(conn);

    let name = publish::snapshot_filename(info.schema_version, info.updated);
    info.path = Some(format!(
        "{}/{}",
        ctx.config.base_url_path.trim_end_matches('/'),
        name
    ));
    publish::gzip_to(db_path, &ctx.config.www_dir, &name, rep)?;
    ctx.latest.update(&info)?;
    Ok((info, ids))
}

fn error_line(err: &SyncError) -> String {
    match err {
        SyncError::Cancelled => "shutting down".to_string(),
        other => format!("error: {other}"),
    }
}

// ── Rebuild worker ─────────────────────────────────────────────────────────

#[derive(Default)]
struct RebuildState {
    building: bool,
    subs: Vec<StatusTx>,
}

#[derive(Default)]
struct RebuildShared {
    state: Mutex<RebuildState>,
    cond: Condvar,
    runs_started: AtomicU64,
}

/// Fans status lines out to every subscriber of the in-flight rebuild
struct FanProgress {
    shared: Arc<RebuildShared>,
    fmt: SectionFormatter,
}

impl Progress for FanProgress {
    fn on_progress(&self, section: Option<&str>, message: Option<&str>) {
        if let Some(line) = self.fmt.format(section, message) {
            let state = self.shared.state.lock().unwrap();
            for sub in &state.subs {
                let _ = sub.send(Some(line.clone()));
            }
        }
    }
}

/// Handle to the single-flight rebuild worker
pub struct Rebuilder {
    ctx: Arc<SyncContext>,
    shared: Arc<RebuildShared>,
}

impl Rebuilder {
    /// Start the worker thread and return the request handle
    pub fn spawn(ctx: Arc<SyncContext>) -> std::io::Result<(Self, JoinHandle<()>)> {
        let shared = Arc::new(RebuildShared::default());
        let handle = {
            let ctx = Arc::clone(&ctx);
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("rebuilder".to_string())
                .spawn(move || rebuild_loop(&ctx, &shared))?
        };
        Ok((Rebuilder { ctx, shared }, handle))
    }

    /// Request a full rebuild. If one is already in flight the caller joins
    /// its status stream; otherwise the worker is woken.
    pub fn request(&self) -> StatusRx {
        let (tx, rx) = unbounded_channel();
        if self.ctx.exiting.is_cancelled() {
            let _ = tx.send(Some(UNAVAILABLE.to_string()));
            let _ = tx.send(None);
            return rx;
        }
        let mut state = self.shared.state.lock().unwrap();
        state.subs.push(tx);
        state.building = true;
        self.shared.cond.notify_one();
        rx
    }

    /// Wake the worker so it observes the exiting flag
    pub fn kick(&self) {
        let _guard = self.shared.state.lock().unwrap();
        self.shared.cond.notify_all();
    }

    /// Number of rebuild runs actually started (not merely requested)
    pub fn runs_started(&self) -> u64 {
        self.shared.runs_started.load(Ordering::SeqCst)
    }
}

fn rebuild_loop(ctx: &Arc<SyncContext>, shared: &Arc<RebuildShared>) {
    let fan = FanProgress {
        shared: Arc::clone(shared),
        fmt: SectionFormatter::default(),
    };
    loop {
        {
            let mut state = shared.state.lock().unwrap();
            while !state.building && !ctx.exiting.is_cancelled() {
                state = shared.cond.wait(state).unwrap();
            }
        }
        if ctx.exiting.is_cancelled() {
            finish_rebuild(shared, Some(UNAVAILABLE));
            return;
        }

        shared.runs_started.fetch_add(1, Ordering::SeqCst);
        let rep = Reporter::new(&fan, &ctx.exiting);
        if let Err(e) = rebuild_job(ctx, &rep) {
            log::error!("rebuild failed: {e}");
            fan.on_progress(None, Some(&error_line(&e)));
        }
        finish_rebuild(shared, None);
        fan.fmt.reset();
    }
}

/// Deliver the sentinel to every subscriber and return the worker to idle
fn finish_rebuild(shared: &RebuildShared, final_line: Option<&str>) {
    let mut state = shared.state.lock().unwrap();
    for sub in &state.subs {
        if let Some(line) = final_line {
            let _ = sub.send(Some(line.to_string()));
        }
        let _ = sub.send(None);
    }
    state.subs.clear();
    state.building = false;
}

fn rebuild_job(ctx: &SyncContext, rep: &Reporter<'_>) -> Result<()> {
    rep.section("Building new database")?;
    let db_path = ctx.config.rebuild_db_path();
    if db_path.exists() {
        fs::remove_file(&db_path)?;
    }
    let (_info, ids) = run_sync_job(ctx, &db_path, &ImportOptions::default(), rep)?;
    ctx.set_known_ids(ids);
    // the finished build becomes the update worker's next base
    fs::rename(&db_path, ctx.config.pending_base_path())?;
    Ok(())
}

// ── Update worker ──────────────────────────────────────────────────────────

enum UpdateMsg {
    Job(ImportOptions, StatusTx),
    /// Wake-up so the worker observes the exiting flag
    Kick,
}

/// Status delivery to the single subscriber of the running update
struct SubProgress {
    tx: StatusTx,
    fmt: SectionFormatter,
}

impl Progress for SubProgress {
    fn on_progress(&self, section: Option<&str>, message: Option<&str>) {
        if let Some(line) = self.fmt.format(section, message) {
            let _ = self.tx.send(Some(line));
        }
    }
}

/// Handle to the FIFO update worker
pub struct Updater {
    ctx: Arc<SyncContext>,
    tx: mpsc::Sender<UpdateMsg>,
}

impl Updater {
    /// Start the worker thread and return the request handle
    pub fn spawn(ctx: Arc<SyncContext>) -> std::io::Result<(Self, JoinHandle<()>)> {
        let (tx, rx) = mpsc::channel();
        let handle = {
            let ctx = Arc::clone(&ctx);
            thread::Builder::new()
                .name("updater".to_string())
                .spawn(move || update_loop(&ctx, rx))?
        };
        Ok((Updater { ctx, tx }, handle))
    }

    /// Queue a partial update; requests are processed strictly in order
    pub fn request(&self, opts: ImportOptions) -> StatusRx {
        let (tx, rx) = unbounded_channel();
        if self.ctx.exiting.is_cancelled() {
            let _ = tx.send(Some(UNAVAILABLE.to_string()));
            let _ = tx.send(None);
            return rx;
        }
        if let Err(mpsc::SendError(UpdateMsg::Job(_, tx))) =
            self.tx.send(UpdateMsg::Job(opts, tx))
        {
            let _ = tx.send(Some(UNAVAILABLE.to_string()));
            let _ = tx.send(None);
        }
        rx
    }

    /// Wake the worker so it observes the exiting flag
    pub fn kick(&self) {
        let _ = self.tx.send(UpdateMsg::Kick);
    }
}

fn update_loop(ctx: &Arc<SyncContext>, rx: mpsc::Receiver<UpdateMsg>) {
    while let Ok(msg) = rx.recv() {
        let (opts, status) = match msg {
            UpdateMsg::Job(opts, status) => (opts, status),
            UpdateMsg::Kick => {
                if ctx.exiting.is_cancelled() {
                    return;
                }
                continue;
            }
        };
        if ctx.exiting.is_cancelled() {
            let _ = status.send(Some(UNAVAILABLE.to_string()));
            let _ = status.send(None);
            continue;
        }

        let fan = SubProgress {
            tx: status.clone(),
            fmt: SectionFormatter::default(),
        };
        let rep = Reporter::new(&fan, &ctx.exiting);
        if let Err(e) = update_job(ctx, &opts, &rep) {
            log::error!("update failed: {e}");
            fan.on_progress(None, Some(&error_line(&e)));
        }
        let _ = status.send(None);
    }
}

fn update_job(ctx: &SyncContext, opts: &ImportOptions, rep: &Reporter<'_>) -> Result<()> {
    rep.section("Updating database")?;
    let pending = ctx.config.pending_base_path();
    let base = ctx.config.update_base_path();
    if pending.exists() {
        // adopt the most recent finished rebuild as the new base
        fs::rename(&pending, &base)?;
    }
    run_sync_job(ctx, &base, opts, rep)?;
    Ok(())
}
