mod store;

use rusqlite::Connection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::core::bot::{Bot, BotId, BotStatus, NewBot, can_transition, is_valid_name};
use crate::core::error::{SupervisorError, SupervisorResult};
use crate::core::intents::Intent;
use crate::core::logs::LogStream;
use crate::platform::{NativePlatform, Platform};

/// Exclusive right to run lifecycle operations on one bot.
///
/// Held across a whole start, stop, restart or scheduled update; dropping it
/// lets the next queued operation for the same bot proceed.
pub struct BotLease {
    id: BotId,
    _guard: OwnedMutexGuard<()>,
}

impl BotLease {
    pub fn id(&self) -> BotId {
        self.id
    }
}

/// Durable record of every managed bot, keyed by id.
///
/// Rows live in SQLite behind one async mutex; lifecycle serialization is a
/// separate lock per bot so a slow stop never blocks unrelated bots.
pub struct BotRegistry {
    db: Arc<Mutex<Connection>>,
    bots_root: PathBuf,
    leases: std::sync::Mutex<HashMap<BotId, Arc<Mutex<()>>>>,
}

impl BotRegistry {
    pub fn open(db_path: &Path, bots_root: impl Into<PathBuf>) -> SupervisorResult<Self> {
        if let Some(dir) = db_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let db = Connection::open(db_path)?;
        // The CLI writes intents while the supervisor holds the same file.
        db.busy_timeout(std::time::Duration::from_secs(5))?;
        NativePlatform::restrict_file_permissions(db_path);
        Self::with_connection(db, bots_root)
    }

    pub fn open_in_memory(bots_root: impl Into<PathBuf>) -> SupervisorResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, bots_root)
    }

    fn with_connection(db: Connection, bots_root: impl Into<PathBuf>) -> SupervisorResult<Self> {
        store::init_schema(&db)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            bots_root: bots_root.into(),
            leases: std::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn bots_root(&self) -> &Path {
        &self.bots_root
    }

    pub fn workdir_for(&self, name: &str) -> PathBuf {
        self.bots_root.join(name)
    }

    fn lease_lock(&self, id: BotId) -> Arc<Mutex<()>> {
        let mut leases = self
            .leases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        leases.entry(id).or_default().clone()
    }

    /// Wait for exclusive lifecycle access to a bot.
    pub async fn lock(&self, id: BotId) -> BotLease {
        let guard = self.lease_lock(id).lock_owned().await;
        BotLease { id, _guard: guard }
    }

    /// Take the lease only if nobody else holds it.
    pub fn try_lock(&self, id: BotId) -> Option<BotLease> {
        let guard = self.lease_lock(id).try_lock_owned().ok()?;
        Some(BotLease { id, _guard: guard })
    }

    pub async fn create(&self, bot: NewBot) -> SupervisorResult<Bot> {
        if !is_valid_name(&bot.name) {
            return Err(SupervisorError::Config(format!(
                "'{}' is not a valid bot name",
                bot.name
            )));
        }
        let workdir = self.workdir_for(&bot.name);
        let db = self.db.lock().await;
        let id = store::insert_bot(&db, &bot, &workdir)?;
        debug!("Registered bot {} as {}", bot.name, id);
        store::get_bot(&db, id)
    }

    pub async fn delete(&self, id: BotId) -> SupervisorResult<()> {
        {
            let db = self.db.lock().await;
            store::delete_bot(&db, id)?;
        }
        self.leases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id);
        Ok(())
    }

    pub async fn get(&self, id: BotId) -> SupervisorResult<Bot> {
        let db = self.db.lock().await;
        store::get_bot(&db, id)
    }

    pub async fn get_by_name(&self, name: &str) -> SupervisorResult<Bot> {
        let db = self.db.lock().await;
        store::find_bot(&db, name)?.ok_or_else(|| SupervisorError::UnknownBot(name.to_string()))
    }

    pub async fn list(&self) -> SupervisorResult<Vec<Bot>> {
        let db = self.db.lock().await;
        store::list_bots(&db)
    }

    /// Persist a runtime status. `pid` must be present exactly when the status
    /// is live, and the move from the stored status must be a legal transition.
    pub async fn upsert_status(
        &self,
        id: BotId,
        status: BotStatus,
        pid: Option<u32>,
    ) -> SupervisorResult<()> {
        if status.is_live() != pid.is_some() {
            return Err(SupervisorError::InvalidStatus { status, pid });
        }
        let db = self.db.lock().await;
        let current = store::get_status(&db, id)?;
        if !can_transition(current, status) {
            return Err(SupervisorError::InvalidTransition {
                from: current,
                to: status,
            });
        }
        store::update_status(&db, id, status, pid)
    }

    pub async fn record_exit(&self, id: BotId, reason: &str) -> SupervisorResult<()> {
        let db = self.db.lock().await;
        store::update_field(&db, id, "last_exit", Some(reason))
    }

    pub async fn set_last_commit(&self, id: BotId, commit: Option<&str>) -> SupervisorResult<()> {
        let db = self.db.lock().await;
        store::update_field(&db, id, "last_commit", commit)
    }

    pub async fn set_enabled(&self, id: BotId, enabled: bool) -> SupervisorResult<()> {
        let db = self.db.lock().await;
        store::update_enabled(&db, id, enabled)
    }

    pub async fn load_offset(&self, id: BotId, stream: LogStream) -> SupervisorResult<Option<u64>> {
        let db = self.db.lock().await;
        store::load_offset(&db, id, stream)
    }

    pub async fn save_offset(
        &self,
        id: BotId,
        stream: LogStream,
        offset: u64,
    ) -> SupervisorResult<()> {
        let db = self.db.lock().await;
        store::save_offset(&db, id, stream, offset)
    }

    /// Queue a lifecycle request for the running supervisor to execute.
    pub async fn push_intent(&self, bot: Option<BotId>, intent: Intent) -> SupervisorResult<()> {
        let db = self.db.lock().await;
        store::push_intent(&db, bot, intent)
    }

    /// Remove and return all queued intents in submission order.
    pub async fn take_intents(&self) -> SupervisorResult<Vec<(Option<BotId>, Intent)>> {
        let mut db = self.db.lock().await;
        store::take_intents(&mut db)
    }
}
