use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};

use crate::frontier::FrontierCache;
use crate::graph::{Event, EventGraph, GraphError};

const WRITE_RETRY_LIMIT: usize = 5;
const WRITE_RETRY_BASE_DELAY_MS: u64 = 10;

/// One row of the persisted extremity table, with the internal cursor position
/// the cleanup job orders batches by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtremityRow {
    pub rowid: i64,
    pub room_id: String,
    pub event_id: String,
}

struct EventRow {
    room_id: String,
    soft_failed: bool,
    depth: i64,
}

/// SQLite-backed event graph plus the per-room forward extremity table and the
/// cleanup job's progress marker. All writes go through short transactions;
/// every extremity mutation evicts the frontier cache for the room it touched.
pub struct SqliteStore {
    conn: Connection,
    cache: FrontierCache,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, GraphError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn,
            cache: FrontierCache::new(),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, GraphError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn,
            cache: FrontierCache::new(),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), GraphError> {
        self.conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            ",
        )?;

        let version: i64 = self.conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        match version {
            0 => {
                self.create_schema_v1()?;
                self.conn.execute_batch("PRAGMA user_version = 1;")?;
            }
            1 => self.create_schema_v1()?,
            _ => return Err(GraphError::Storage(rusqlite::Error::InvalidQuery)),
        }
        Ok(())
    }

    fn create_schema_v1(&self) -> Result<(), GraphError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS events (
                event_id TEXT PRIMARY KEY,
                room_id TEXT NOT NULL,
                soft_failed INTEGER NOT NULL CHECK (soft_failed IN (0, 1)),
                depth INTEGER NOT NULL,
                received_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_room ON events(room_id);

            CREATE TABLE IF NOT EXISTS event_edges (
                event_id TEXT NOT NULL,
                prev_event_id TEXT NOT NULL,
                UNIQUE(event_id, prev_event_id)
            );

            CREATE INDEX IF NOT EXISTS idx_event_edges_prev ON event_edges(prev_event_id);

            CREATE TABLE IF NOT EXISTS forward_extremities (
                room_id TEXT NOT NULL,
                event_id TEXT NOT NULL,
                UNIQUE(room_id, event_id)
            );

            CREATE INDEX IF NOT EXISTS idx_forward_extremities_room
                ON forward_extremities(room_id);

            CREATE TABLE IF NOT EXISTS cleanup_progress (
                job_name TEXT PRIMARY KEY,
                cursor INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    /// Persists an event, its prev-event edges, and the incremental frontier
    /// update in one transaction. All prev-events must already be committed in
    /// the same room, otherwise nothing is persisted.
    ///
    /// A soft-failed event is stored for graph completeness but leaves the
    /// extremity table untouched. An accepted event joins the frontier and
    /// evicts its prev-events, plus any non-soft-failed ancestor it reaches
    /// backwards through a chain of soft-failed events; that backward walk is
    /// what keeps a live frontier at `{B}` for `A <- SF1 <- SF2 <- B`.
    pub fn insert_event(&self, event: &Event) -> Result<(), GraphError> {
        with_write_retries(|| self.insert_event_once(event))
    }

    fn insert_event_once(&self, event: &Event) -> Result<(), GraphError> {
        Self::validate_id("event_id", &event.event_id)?;
        Self::validate_id("room_id", &event.room_id)?;

        let tx = self.conn.unchecked_transaction()?;

        let mut depth = 0_i64;
        for prev in &event.prev_event_ids {
            let row = Self::event_row_on(&tx, prev)?
                .ok_or_else(|| GraphError::NotFound(prev.clone()))?;
            if row.room_id != event.room_id {
                return Err(GraphError::Invariant(format!(
                    "prev event `{prev}` belongs to room `{}`, not `{}`",
                    row.room_id, event.room_id
                )));
            }
            depth = depth.max(row.depth + 1);
        }

        tx.execute(
            "INSERT INTO events (event_id, room_id, soft_failed, depth, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.event_id,
                event.room_id,
                if event.soft_failed { 1_i64 } else { 0_i64 },
                depth,
                event.received_at
            ],
        )?;
        for prev in &event.prev_event_ids {
            tx.execute(
                "INSERT OR IGNORE INTO event_edges (event_id, prev_event_id) VALUES (?1, ?2)",
                params![event.event_id, prev],
            )?;
        }

        if !event.soft_failed {
            Self::add_extremity_on(&tx, &event.room_id, &event.event_id)?;
            for superseded in Self::superseded_by_on(&tx, &event.prev_event_ids)? {
                Self::remove_extremity_on(&tx, &event.room_id, &superseded)?;
            }
        }

        tx.commit()?;
        self.cache.invalidate(&event.room_id);
        Ok(())
    }

    /// Everything an accepted event with these prev-events supersedes: the
    /// prev-events themselves, and -- walking backwards through soft-failed
    /// links only -- the first non-soft-failed ancestor on each such chain.
    fn superseded_by_on(
        conn: &Connection,
        prev_event_ids: &[String],
    ) -> Result<Vec<String>, GraphError> {
        let mut queue: VecDeque<String> = prev_event_ids.iter().cloned().collect();
        let mut visited: HashSet<String> = HashSet::new();
        let mut superseded = Vec::new();

        while let Some(event_id) = queue.pop_front() {
            if !visited.insert(event_id.clone()) {
                continue;
            }
            superseded.push(event_id.clone());
            let Some(row) = Self::event_row_on(conn, &event_id)? else {
                return Err(GraphError::NotFound(event_id));
            };
            if row.soft_failed {
                for prev in Self::predecessors_on(conn, &event_id)? {
                    if !visited.contains(&prev) {
                        queue.push_back(prev);
                    }
                }
            }
        }

        Ok(superseded)
    }

    pub fn add_extremity(&self, room_id: &str, event_id: &str) -> Result<(), GraphError> {
        with_write_retries(|| {
            Self::add_extremity_on(&self.conn, room_id, event_id)?;
            Ok(())
        })?;
        self.cache.invalidate(room_id);
        Ok(())
    }

    pub fn remove_extremity(&self, room_id: &str, event_id: &str) -> Result<(), GraphError> {
        with_write_retries(|| {
            Self::remove_extremity_on(&self.conn, room_id, event_id)?;
            Ok(())
        })?;
        self.cache.invalidate(room_id);
        Ok(())
    }

    fn add_extremity_on(conn: &Connection, room_id: &str, event_id: &str) -> Result<(), GraphError> {
        conn.execute(
            "INSERT OR IGNORE INTO forward_extremities (room_id, event_id) VALUES (?1, ?2)",
            params![room_id, event_id],
        )?;
        Ok(())
    }

    fn remove_extremity_on(
        conn: &Connection,
        room_id: &str,
        event_id: &str,
    ) -> Result<(), GraphError> {
        conn.execute(
            "DELETE FROM forward_extremities WHERE room_id = ?1 AND event_id = ?2",
            params![room_id, event_id],
        )?;
        Ok(())
    }

    /// Raw table read, stable insertion order. Callers wanting the cached view
    /// go through `current_extremities`.
    pub fn extremity_members(&self, room_id: &str) -> Result<Vec<String>, GraphError> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id FROM forward_extremities WHERE room_id = ?1 ORDER BY rowid ASC",
        )?;
        let mut rows = stmt.query(params![room_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get(0)?);
        }
        Ok(out)
    }

    pub fn contains_extremity(&self, room_id: &str, event_id: &str) -> Result<bool, GraphError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM forward_extremities WHERE room_id = ?1 AND event_id = ?2",
            params![room_id, event_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// The current frontier for a room, served from the per-room cache when
    /// warm. This is the read event-creation builds prev-events from.
    pub fn current_extremities(&self, room_id: &str) -> Result<Vec<String>, GraphError> {
        if let Some(extremities) = self.cache.get(room_id) {
            return Ok(extremities);
        }
        let extremities = self.extremity_members(room_id)?;
        self.cache.put(room_id, extremities.clone());
        Ok(extremities)
    }

    /// For writers mutating `forward_extremities` outside this store's API
    /// (administrative tooling): keeps the cache coherent with their writes.
    pub fn invalidate_extremity_cache(&self, room_id: &str) {
        self.cache.invalidate(room_id);
    }

    pub fn rooms(&self) -> Result<Vec<String>, GraphError> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT room_id FROM events ORDER BY room_id ASC")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get(0)?);
        }
        Ok(out)
    }

    pub fn depth(&self, event_id: &str) -> Result<i64, GraphError> {
        match Self::event_row_on(&self.conn, event_id)? {
            Some(row) => Ok(row.depth),
            None => Err(GraphError::NotFound(event_id.to_string())),
        }
    }

    /// Up to `limit` extremity rows past the cursor, in cursor order across
    /// all rooms. Rowids are monotone for inserts and stable under deletes, so
    /// committed batches are never revisited.
    pub fn extremity_batch_after(
        &self,
        cursor: i64,
        limit: usize,
    ) -> Result<Vec<ExtremityRow>, GraphError> {
        let mut stmt = self.conn.prepare(
            "SELECT rowid, room_id, event_id FROM forward_extremities
             WHERE rowid > ?1 ORDER BY rowid ASC LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![cursor, limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(ExtremityRow {
                rowid: row.get(0)?,
                room_id: row.get(1)?,
                event_id: row.get(2)?,
            });
        }
        Ok(out)
    }

    pub fn cleanup_cursor(&self, job_name: &str) -> Result<Option<i64>, GraphError> {
        let cursor = self
            .conn
            .query_row(
                "SELECT cursor FROM cleanup_progress WHERE job_name = ?1",
                params![job_name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(cursor)
    }

    /// Applies one cleanup batch atomically: the non-genuine removals and the
    /// cursor advance either all commit or none do.
    pub fn commit_cleanup_batch(
        &self,
        job_name: &str,
        cursor: i64,
        removals: &[(String, String)],
    ) -> Result<(), GraphError> {
        with_write_retries(|| {
            let tx = self.conn.unchecked_transaction()?;
            for (room_id, event_id) in removals {
                Self::remove_extremity_on(&tx, room_id, event_id)?;
            }
            tx.execute(
                "INSERT INTO cleanup_progress (job_name, cursor) VALUES (?1, ?2)
                 ON CONFLICT(job_name) DO UPDATE SET cursor = excluded.cursor",
                params![job_name, cursor],
            )?;
            tx.commit()?;
            Ok(())
        })?;

        let mut invalidated: HashSet<&str> = HashSet::new();
        for (room_id, _) in removals {
            if invalidated.insert(room_id.as_str()) {
                self.cache.invalidate(room_id);
            }
        }
        Ok(())
    }

    pub fn clear_cleanup_progress(&self, job_name: &str) -> Result<(), GraphError> {
        with_write_retries(|| {
            self.conn.execute(
                "DELETE FROM cleanup_progress WHERE job_name = ?1",
                params![job_name],
            )?;
            Ok(())
        })
    }

    fn event_row_on(conn: &Connection, event_id: &str) -> Result<Option<EventRow>, GraphError> {
        let row = conn
            .query_row(
                "SELECT room_id, soft_failed, depth FROM events WHERE event_id = ?1",
                params![event_id],
                |row| {
                    Ok(EventRow {
                        room_id: row.get(0)?,
                        soft_failed: row.get::<_, i64>(1)? != 0,
                        depth: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn predecessors_on(conn: &Connection, event_id: &str) -> Result<Vec<String>, GraphError> {
        let mut stmt = conn.prepare(
            "SELECT prev_event_id FROM event_edges WHERE event_id = ?1 ORDER BY rowid ASC",
        )?;
        let mut rows = stmt.query(params![event_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get(0)?);
        }
        Ok(out)
    }

    fn validate_id(field: &'static str, value: &str) -> Result<(), GraphError> {
        if value.is_empty() {
            return Err(GraphError::Storage(rusqlite::Error::InvalidParameterName(
                format!("{field} must not be empty"),
            )));
        }
        Ok(())
    }
}

impl EventGraph for SqliteStore {
    fn predecessors(&self, event_id: &str) -> Result<Vec<String>, GraphError> {
        if Self::event_row_on(&self.conn, event_id)?.is_none() {
            return Err(GraphError::NotFound(event_id.to_string()));
        }
        Self::predecessors_on(&self.conn, event_id)
    }

    fn children(&self, event_id: &str) -> Result<Vec<String>, GraphError> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id FROM event_edges WHERE prev_event_id = ?1 ORDER BY rowid ASC",
        )?;
        let mut rows = stmt.query(params![event_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get(0)?);
        }
        Ok(out)
    }

    fn is_soft_failed(&self, event_id: &str) -> Result<bool, GraphError> {
        match Self::event_row_on(&self.conn, event_id)? {
            Some(row) => Ok(row.soft_failed),
            None => Err(GraphError::NotFound(event_id.to_string())),
        }
    }

    fn room(&self, event_id: &str) -> Result<String, GraphError> {
        match Self::event_row_on(&self.conn, event_id)? {
            Some(row) => Ok(row.room_id),
            None => Err(GraphError::NotFound(event_id.to_string())),
        }
    }
}

fn with_write_retries<T>(
    mut op: impl FnMut() -> Result<T, GraphError>,
) -> Result<T, GraphError> {
    let mut delay = Duration::from_millis(WRITE_RETRY_BASE_DELAY_MS);
    let mut attempts = 0;
    loop {
        match op() {
            Err(err) if err.is_transient() && attempts + 1 < WRITE_RETRY_LIMIT => {
                attempts += 1;
                std::thread::sleep(delay);
                delay *= 2;
            }
            other => return other,
        }
    }
}
