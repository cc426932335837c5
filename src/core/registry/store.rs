use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::core::bot::{Bot, BotId, BotStatus, NewBot};
use crate::core::error::{SupervisorError, SupervisorResult};
use crate::core::intents::Intent;
use crate::core::logs::LogStream;

const BOT_COLUMNS: &str = "id, name, repo_url, branch, workdir, token, env_json, db_url, enabled, \
     status, pid, last_commit, last_exit, last_started_at, last_stopped_at, created_at";

pub(super) fn init_schema(db: &Connection) -> rusqlite::Result<()> {
    db.execute_batch(
        "CREATE TABLE IF NOT EXISTS bots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            repo_url TEXT NOT NULL,
            branch TEXT NOT NULL DEFAULT 'master',
            workdir TEXT NOT NULL,
            token TEXT,
            env_json TEXT NOT NULL DEFAULT '{}',
            db_url TEXT,
            enabled INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL DEFAULT 'stopped',
            pid INTEGER,
            last_commit TEXT,
            last_exit TEXT,
            last_started_at TEXT,
            last_stopped_at TEXT,
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS log_offsets (
            bot_id INTEGER NOT NULL,
            stream TEXT NOT NULL,
            position INTEGER NOT NULL,
            PRIMARY KEY (bot_id, stream)
        );
        CREATE TABLE IF NOT EXISTS intents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            bot_id INTEGER,
            action TEXT NOT NULL,
            created_at TEXT NOT NULL
        );",
    )
}

fn parse_time(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn map_bot(row: &Row<'_>) -> rusqlite::Result<Bot> {
    let env_json: String = row.get(6)?;
    let env: BTreeMap<String, String> = serde_json::from_str(&env_json).unwrap_or_default();
    let status: String = row.get(9)?;
    let pid: Option<i64> = row.get(10)?;
    let created_at: String = row.get(15)?;
    Ok(Bot {
        id: BotId(row.get(0)?),
        name: row.get(1)?,
        repo_url: row.get(2)?,
        branch: row.get(3)?,
        workdir: PathBuf::from(row.get::<_, String>(4)?),
        token: row.get(5)?,
        env,
        db_url: row.get(7)?,
        enabled: row.get(8)?,
        status: BotStatus::from_status(&status).unwrap_or(BotStatus::Stopped),
        pid: pid.and_then(|p| u32::try_from(p).ok()),
        last_commit: row.get(11)?,
        last_exit: row.get(12)?,
        last_started_at: parse_time(row.get(13)?),
        last_stopped_at: parse_time(row.get(14)?),
        created_at: parse_time(Some(created_at)).unwrap_or_else(Utc::now),
    })
}

fn ensure_changed(changed: usize, id: BotId) -> SupervisorResult<()> {
    if changed == 0 {
        Err(SupervisorError::NotFound(id))
    } else {
        Ok(())
    }
}

pub(super) fn insert_bot(db: &Connection, bot: &NewBot, workdir: &Path) -> SupervisorResult<BotId> {
    let env_json = serde_json::to_string(&bot.env).unwrap_or_else(|_| "{}".to_string());
    let result = db.execute(
        "INSERT INTO bots (name, repo_url, branch, workdir, token, env_json, db_url, enabled, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'stopped', ?9)",
        params![
            bot.name,
            bot.repo_url,
            bot.branch,
            workdir.to_string_lossy().into_owned(),
            bot.token,
            env_json,
            bot.db_url,
            bot.enabled,
            Utc::now().to_rfc3339(),
        ],
    );
    match result {
        Ok(_) => Ok(BotId(db.last_insert_rowid())),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(SupervisorError::DuplicateName(bot.name.clone()))
        }
        Err(e) => Err(e.into()),
    }
}

pub(super) fn delete_bot(db: &Connection, id: BotId) -> SupervisorResult<()> {
    let changed = db.execute("DELETE FROM bots WHERE id = ?1", params![id.0])?;
    ensure_changed(changed, id)?;
    db.execute("DELETE FROM log_offsets WHERE bot_id = ?1", params![id.0])?;
    db.execute("DELETE FROM intents WHERE bot_id = ?1", params![id.0])?;
    Ok(())
}

pub(super) fn get_bot(db: &Connection, id: BotId) -> SupervisorResult<Bot> {
    db.query_row(
        &format!("SELECT {BOT_COLUMNS} FROM bots WHERE id = ?1"),
        params![id.0],
        map_bot,
    )
    .optional()?
    .ok_or(SupervisorError::NotFound(id))
}

pub(super) fn get_status(db: &Connection, id: BotId) -> SupervisorResult<BotStatus> {
    let status: String = db
        .query_row("SELECT status FROM bots WHERE id = ?1", params![id.0], |row| {
            row.get(0)
        })
        .optional()?
        .ok_or(SupervisorError::NotFound(id))?;
    Ok(BotStatus::from_status(&status).unwrap_or(BotStatus::Stopped))
}

pub(super) fn find_bot(db: &Connection, name: &str) -> SupervisorResult<Option<Bot>> {
    Ok(db
        .query_row(
            &format!("SELECT {BOT_COLUMNS} FROM bots WHERE name = ?1"),
            params![name],
            map_bot,
        )
        .optional()?)
}

pub(super) fn list_bots(db: &Connection) -> SupervisorResult<Vec<Bot>> {
    let mut stmt = db.prepare(&format!("SELECT {BOT_COLUMNS} FROM bots ORDER BY id"))?;
    let rows = stmt.query_map([], map_bot)?;
    let mut results = Vec::new();
    for row in rows {
        results.push(row?);
    }
    Ok(results)
}

pub(super) fn update_status(
    db: &Connection,
    id: BotId,
    status: BotStatus,
    pid: Option<u32>,
) -> SupervisorResult<()> {
    let now = Utc::now().to_rfc3339();
    let changed = match status {
        BotStatus::Starting => db.execute(
            "UPDATE bots SET status = ?2, pid = ?3, last_started_at = ?4 WHERE id = ?1",
            params![id.0, status.as_str(), pid.map(i64::from), now],
        )?,
        BotStatus::Stopped | BotStatus::Crashed => db.execute(
            "UPDATE bots SET status = ?2, pid = NULL, last_stopped_at = ?3 WHERE id = ?1",
            params![id.0, status.as_str(), now],
        )?,
        BotStatus::Running | BotStatus::Stopping => db.execute(
            "UPDATE bots SET status = ?2, pid = ?3 WHERE id = ?1",
            params![id.0, status.as_str(), pid.map(i64::from)],
        )?,
    };
    ensure_changed(changed, id)
}

pub(super) fn update_field(
    db: &Connection,
    id: BotId,
    column: &'static str,
    value: Option<&str>,
) -> SupervisorResult<()> {
    let changed = db.execute(
        &format!("UPDATE bots SET {column} = ?2 WHERE id = ?1"),
        params![id.0, value],
    )?;
    ensure_changed(changed, id)
}

pub(super) fn update_enabled(db: &Connection, id: BotId, enabled: bool) -> SupervisorResult<()> {
    let changed = db.execute(
        "UPDATE bots SET enabled = ?2 WHERE id = ?1",
        params![id.0, enabled],
    )?;
    ensure_changed(changed, id)
}

pub(super) fn load_offset(
    db: &Connection,
    id: BotId,
    stream: LogStream,
) -> SupervisorResult<Option<u64>> {
    let offset: Option<i64> = db
        .query_row(
            "SELECT position FROM log_offsets WHERE bot_id = ?1 AND stream = ?2",
            params![id.0, stream.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(offset.and_then(|o| u64::try_from(o).ok()))
}

pub(super) fn save_offset(
    db: &Connection,
    id: BotId,
    stream: LogStream,
    offset: u64,
) -> SupervisorResult<()> {
    let offset = i64::try_from(offset).unwrap_or(i64::MAX);
    db.execute(
        "INSERT OR REPLACE INTO log_offsets (bot_id, stream, position) VALUES (?1, ?2, ?3)",
        params![id.0, stream.as_str(), offset],
    )?;
    Ok(())
}

pub(super) fn push_intent(
    db: &Connection,
    bot: Option<BotId>,
    intent: Intent,
) -> SupervisorResult<()> {
    db.execute(
        "INSERT INTO intents (bot_id, action, created_at) VALUES (?1, ?2, ?3)",
        params![bot.map(|b| b.0), intent.as_str(), Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

pub(super) fn take_intents(db: &mut Connection) -> SupervisorResult<Vec<(Option<BotId>, Intent)>> {
    let tx = db.transaction()?;
    let rows = {
        let mut stmt = tx.prepare("SELECT bot_id, action FROM intents ORDER BY id")?;
        let mapped = stmt.query_map([], |row| {
            Ok((row.get::<_, Option<i64>>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut rows = Vec::new();
        for row in mapped {
            rows.push(row?);
        }
        rows
    };
    tx.execute("DELETE FROM intents", [])?;
    tx.commit()?;

    Ok(rows
        .into_iter()
        .filter_map(|(bot, action)| Intent::from_action(&action).map(|i| (bot.map(BotId), i)))
        .collect())
}
