//! Embedded SQL state store: session rows, groups, heartbeats, metadata,
//! and primary election. The single source of truth shared by every UI
//! process on the host; replication is "write here, peers read on their
//! next tick".

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::domain::instance::{Group, Instance, Status, Worktree, DEFAULT_GROUP};
use crate::domain::tool::Tool;
use crate::error::DeckError;

const SCHEMA_VERSION: i64 = 1;

/// Heartbeats older than this are stale; their rows (and primary flag)
/// are fair game for cleanup.
pub const HEARTBEAT_TIMEOUT_SECS: i64 = 30;

/// Replicated status of one instance, as other processes see it.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedStatus {
    pub status: Status,
    pub tool: Tool,
    pub acknowledged: bool,
}

pub struct Store {
    conn: Mutex<Connection>,
    pid: i64,
}

impl Store {
    /// Default on-disk location: `<data-dir>/agent-deck/state.db`.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("agent-deck")
            .join("state.db")
    }

    /// Open (creating if needed) and migrate. Fatal on schema mismatch we
    /// can't migrate.
    pub fn open(path: &Path) -> Result<Self, DeckError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        warn_on_network_fs(path);

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = Self {
            conn: Mutex::new(conn),
            pid: std::process::id() as i64,
        };
        store.migrate()?;
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, DeckError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
            pid: std::process::id() as i64,
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), DeckError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS metadata(
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS instances(
                id TEXT PRIMARY KEY,
                title TEXT,
                project_path TEXT,
                group_path TEXT DEFAULT 'my-sessions',
                sort_order INTEGER DEFAULT 0,
                command TEXT,
                wrapper TEXT,
                tool TEXT DEFAULT 'shell',
                status TEXT DEFAULT 'error',
                tmux_session TEXT,
                created_at INTEGER,
                last_accessed INTEGER,
                parent_session_id TEXT,
                worktree_path TEXT,
                worktree_repo TEXT,
                worktree_branch TEXT,
                tool_data TEXT DEFAULT '{}',
                acknowledged INTEGER DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS groups(
                path TEXT PRIMARY KEY,
                name TEXT,
                expanded INTEGER,
                sort_order INTEGER,
                default_path TEXT
            );
            CREATE TABLE IF NOT EXISTS instance_heartbeats(
                pid INTEGER PRIMARY KEY,
                started INTEGER,
                heartbeat INTEGER,
                is_primary INTEGER DEFAULT 0
            );",
        )?;

        let version: Option<String> = conn
            .query_row(
                "SELECT value FROM metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match version.as_deref().map(str::parse::<i64>) {
            None => {
                conn.execute(
                    "INSERT INTO metadata(key, value) VALUES('schema_version', ?1)",
                    params![SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(Ok(v)) if v == SCHEMA_VERSION => {}
            Some(v) => {
                return Err(DeckError::Store(format!(
                    "unsupported schema version {v:?} (expected {SCHEMA_VERSION})"
                )));
            }
        }
        Ok(())
    }

    // ── instances ───────────────────────────────────────────────────

    pub fn list_instances(&self) -> Result<Vec<Instance>, DeckError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, title, project_path, group_path, sort_order, command, wrapper,
                    tool, status, tmux_session, created_at, last_accessed,
                    parent_session_id, worktree_path, worktree_repo, worktree_branch,
                    tool_data, acknowledged
             FROM instances ORDER BY group_path, sort_order, created_at",
        )?;
        let rows = stmt.query_map([], row_to_instance)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn get_instance(&self, id: &str) -> Result<Option<Instance>, DeckError> {
        let conn = self.conn.lock().unwrap();
        let inst = conn
            .query_row(
                "SELECT id, title, project_path, group_path, sort_order, command, wrapper,
                        tool, status, tmux_session, created_at, last_accessed,
                        parent_session_id, worktree_path, worktree_repo, worktree_branch,
                        tool_data, acknowledged
                 FROM instances WHERE id = ?1",
                params![id],
                row_to_instance,
            )
            .optional()?;
        Ok(inst)
    }

    pub fn save_instance(&self, inst: &Instance) -> Result<(), DeckError> {
        let conn = self.conn.lock().unwrap();
        upsert_instance(&conn, inst).map_err(map_busy)
    }

    /// Bulk save that also deletes rows absent from `list`, so removals
    /// replicate to peers. All-or-nothing.
    pub fn save_instances(&self, list: &[Instance]) -> Result<(), DeckError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(map_busy)?;
        for inst in list {
            upsert_instance(&tx, inst).map_err(map_busy)?;
        }
        if list.is_empty() {
            tx.execute("DELETE FROM instances", [])?;
        } else {
            let placeholders = vec!["?"; list.len()].join(",");
            let sql = format!("DELETE FROM instances WHERE id NOT IN ({placeholders})");
            let ids: Vec<&str> = list.iter().map(|i| i.id.as_str()).collect();
            tx.execute(&sql, rusqlite::params_from_iter(ids))?;
        }
        tx.commit().map_err(map_busy)?;
        Ok(())
    }

    pub fn delete_instance(&self, id: &str) -> Result<(), DeckError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM instances WHERE id = ?1", params![id])
            .map_err(map_busy)?;
        Ok(())
    }

    /// Status write-back. The same statement clears `acknowledged` on any
    /// transition to active so the invariant can't be violated by a
    /// forgotten second write.
    pub fn write_status(&self, id: &str, status: Status, tool: &Tool) -> Result<(), DeckError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE instances SET
                status = ?2,
                tool = ?3,
                acknowledged = CASE WHEN ?2 IN ('active', 'running') THEN 0 ELSE acknowledged END
             WHERE id = ?1",
            params![id, status.as_str(), tool.key()],
        )
        .map_err(map_busy)?;
        Ok(())
    }

    pub fn set_acknowledged(&self, id: &str, acknowledged: bool) -> Result<(), DeckError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE instances SET acknowledged = ?2 WHERE id = ?1",
            params![id, acknowledged as i64],
        )
        .map_err(map_busy)?;
        Ok(())
    }

    pub fn read_all_statuses(&self) -> Result<HashMap<String, SharedStatus>, DeckError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, status, tool, acknowledged FROM instances")?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let status: String = row.get(1)?;
            let tool: String = row.get(2)?;
            let acknowledged: i64 = row.get(3)?;
            Ok((
                id,
                SharedStatus {
                    status: Status::parse(&status),
                    tool: tool.into(),
                    acknowledged: acknowledged != 0,
                },
            ))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (id, shared) = row?;
            out.insert(id, shared);
        }
        Ok(out)
    }

    // ── groups ──────────────────────────────────────────────────────

    pub fn list_groups(&self) -> Result<Vec<Group>, DeckError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT path, name, expanded, sort_order, default_path FROM groups ORDER BY sort_order",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Group {
                path: row.get(0)?,
                name: row.get(1)?,
                expanded: row.get::<_, i64>(2)? != 0,
                sort_order: row.get(3)?,
                default_path: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn save_group(&self, group: &Group) -> Result<(), DeckError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO groups(path, name, expanded, sort_order, default_path)
             VALUES(?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(path) DO UPDATE SET
                name = excluded.name,
                expanded = excluded.expanded,
                sort_order = excluded.sort_order,
                default_path = excluded.default_path",
            params![
                group.path,
                group.name,
                group.expanded as i64,
                group.sort_order,
                group.default_path
            ],
        )
        .map_err(map_busy)?;
        Ok(())
    }

    pub fn delete_group(&self, path: &str) -> Result<(), DeckError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM groups WHERE path = ?1", params![path])
            .map_err(map_busy)?;
        Ok(())
    }

    // ── metadata ────────────────────────────────────────────────────

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>, DeckError> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row(
                "SELECT value FROM metadata WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<(), DeckError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO metadata(key, value) VALUES(?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .map_err(map_busy)?;
        Ok(())
    }

    /// Bump the change beacon peers poll. Nanosecond resolution, forced
    /// monotonic even if the wall clock steps backwards.
    pub fn touch(&self) -> Result<(), DeckError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        let prev = self.last_modified()?.unwrap_or(0);
        let next = now.max(prev + 1);
        self.set_metadata("last_modified", &next.to_string())
    }

    pub fn last_modified(&self) -> Result<Option<i64>, DeckError> {
        Ok(self
            .get_metadata("last_modified")?
            .and_then(|v| v.parse().ok()))
    }

    // ── heartbeats & primary election ───────────────────────────────

    pub fn register_process(&self, is_primary: bool) -> Result<(), DeckError> {
        let now = epoch_secs();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO instance_heartbeats(pid, started, heartbeat, is_primary)
             VALUES(?1, ?2, ?2, ?3)
             ON CONFLICT(pid) DO UPDATE SET
                started = excluded.started,
                heartbeat = excluded.heartbeat,
                is_primary = excluded.is_primary",
            params![self.pid, now, is_primary as i64],
        )
        .map_err(map_busy)?;
        Ok(())
    }

    pub fn heartbeat(&self) -> Result<(), DeckError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE instance_heartbeats SET heartbeat = ?2 WHERE pid = ?1",
            params![self.pid, epoch_secs()],
        )
        .map_err(map_busy)?;
        Ok(())
    }

    pub fn unregister_process(&self) -> Result<(), DeckError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM instance_heartbeats WHERE pid = ?1",
            params![self.pid],
        )
        .map_err(map_busy)?;
        Ok(())
    }

    pub fn alive_process_count(&self, timeout_secs: i64) -> Result<i64, DeckError> {
        let cutoff = epoch_secs() - timeout_secs;
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM instance_heartbeats WHERE heartbeat >= ?1",
            params![cutoff],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn clean_dead_processes(&self, timeout_secs: i64) -> Result<usize, DeckError> {
        let cutoff = epoch_secs() - timeout_secs;
        let conn = self.conn.lock().unwrap();
        let removed = conn
            .execute(
                "DELETE FROM instance_heartbeats WHERE heartbeat < ?1",
                params![cutoff],
            )
            .map_err(map_busy)?;
        if removed > 0 {
            debug!(removed, "cleaned dead heartbeat rows");
        }
        Ok(removed)
    }

    /// Try to become (or confirm being) the primary. One transaction:
    /// stale primaries are demoted, then the flag is claimed only if no
    /// live holder remains. Returns true when we hold it afterwards.
    pub fn elect_primary(&self, timeout_secs: i64) -> Result<bool, DeckError> {
        let cutoff = epoch_secs() - timeout_secs;
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(map_busy)?;

        tx.execute(
            "UPDATE instance_heartbeats SET is_primary = 0 WHERE heartbeat < ?1",
            params![cutoff],
        )?;

        let holder: Option<i64> = tx
            .query_row(
                "SELECT pid FROM instance_heartbeats
                 WHERE is_primary = 1 AND heartbeat >= ?1",
                params![cutoff],
                |row| row.get(0),
            )
            .optional()?;

        let won = match holder {
            Some(pid) if pid == self.pid => true,
            Some(_) => false,
            None => {
                tx.execute(
                    "UPDATE instance_heartbeats SET is_primary = 1 WHERE pid = ?1",
                    params![self.pid],
                )?;
                true
            }
        };
        tx.commit().map_err(map_busy)?;
        Ok(won)
    }

    pub fn resign_primary(&self) -> Result<(), DeckError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE instance_heartbeats SET is_primary = 0 WHERE pid = ?1",
            params![self.pid],
        )
        .map_err(map_busy)?;
        Ok(())
    }

    #[cfg(test)]
    fn insert_heartbeat_row(&self, pid: i64, heartbeat: i64, is_primary: bool) {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO instance_heartbeats(pid, started, heartbeat, is_primary)
             VALUES(?1, ?2, ?2, ?3)",
            params![pid, heartbeat, is_primary as i64],
        )
        .unwrap();
    }
}

fn upsert_instance(conn: &Connection, inst: &Instance) -> Result<(), rusqlite::Error> {
    let wt = inst.worktree.clone().unwrap_or_default();
    conn.execute(
        "INSERT INTO instances(
            id, title, project_path, group_path, sort_order, command, wrapper,
            tool, status, tmux_session, created_at, last_accessed,
            parent_session_id, worktree_path, worktree_repo, worktree_branch,
            tool_data, acknowledged)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
         ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            project_path = excluded.project_path,
            group_path = excluded.group_path,
            sort_order = excluded.sort_order,
            command = excluded.command,
            wrapper = excluded.wrapper,
            tool = excluded.tool,
            status = excluded.status,
            tmux_session = excluded.tmux_session,
            created_at = excluded.created_at,
            last_accessed = excluded.last_accessed,
            parent_session_id = excluded.parent_session_id,
            worktree_path = excluded.worktree_path,
            worktree_repo = excluded.worktree_repo,
            worktree_branch = excluded.worktree_branch,
            tool_data = excluded.tool_data,
            acknowledged = excluded.acknowledged",
        params![
            inst.id,
            inst.title,
            inst.project_path,
            inst.group_path,
            inst.sort_order,
            inst.command,
            inst.wrapper,
            inst.tool.key(),
            inst.status.as_str(),
            inst.tmux_session,
            inst.created_at,
            inst.last_accessed,
            inst.parent_session_id,
            wt.path,
            wt.repo,
            wt.branch,
            inst.tool_data.to_string(),
            inst.acknowledged as i64,
        ],
    )?;
    Ok(())
}

fn row_to_instance(row: &rusqlite::Row<'_>) -> Result<Instance, rusqlite::Error> {
    let tool: String = row.get::<_, Option<String>>(7)?.unwrap_or_default();
    let status: String = row.get::<_, Option<String>>(8)?.unwrap_or_default();
    let worktree = Worktree {
        path: row.get::<_, Option<String>>(13)?.unwrap_or_default(),
        repo: row.get::<_, Option<String>>(14)?.unwrap_or_default(),
        branch: row.get::<_, Option<String>>(15)?.unwrap_or_default(),
    };
    let tool_data: String = row
        .get::<_, Option<String>>(16)?
        .unwrap_or_else(|| "{}".to_string());
    Ok(Instance {
        id: row.get(0)?,
        title: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        project_path: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        group_path: row
            .get::<_, Option<String>>(3)?
            .unwrap_or_else(|| DEFAULT_GROUP.to_string()),
        sort_order: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
        command: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        wrapper: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        tool: tool.into(),
        status: Status::parse(&status),
        tmux_session: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
        created_at: row.get::<_, Option<i64>>(10)?.unwrap_or(0),
        last_accessed: row.get::<_, Option<i64>>(11)?.unwrap_or(0),
        parent_session_id: row.get(12)?,
        worktree: if worktree.is_empty() {
            None
        } else {
            Some(worktree)
        },
        tool_data: serde_json::from_str(&tool_data).unwrap_or_else(|_| serde_json::json!({})),
        acknowledged: row.get::<_, i64>(17)? != 0,
    })
}

fn map_busy(e: rusqlite::Error) -> DeckError {
    if let rusqlite::Error::SqliteFailure(err, _) = &e {
        if err.code == rusqlite::ErrorCode::DatabaseBusy
            || err.code == rusqlite::ErrorCode::DatabaseLocked
        {
            return DeckError::Busy;
        }
    }
    DeckError::Sqlite(e)
}

fn epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// WAL needs a local filesystem. Warn (never fail) when the store lands
/// on a network mount.
fn warn_on_network_fs(path: &Path) {
    let Ok(mounts) = std::fs::read_to_string("/proc/mounts") else {
        return;
    };
    let path_str = path.to_string_lossy();
    let mut best: Option<(&str, &str)> = None;
    for line in mounts.lines() {
        let mut parts = line.split_whitespace();
        let (Some(_dev), Some(mountpoint), Some(fstype)) =
            (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if path_str.starts_with(mountpoint)
            && best.is_none_or(|(mp, _)| mountpoint.len() > mp.len())
        {
            best = Some((mountpoint, fstype));
        }
    }
    if let Some((_, fstype)) = best {
        if matches!(fstype, "9p" | "nfs" | "nfs4" | "cifs" | "fuse.sshfs") {
            warn!(
                fstype,
                path = %path.display(),
                "state store is on a network filesystem; WAL locking may misbehave"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn make(title: &str) -> Instance {
        Instance::new(title, "/tmp/proj", "claude")
    }

    #[test]
    fn test_open_on_disk_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let s = Store::open(&path).unwrap();
            s.save_instance(&make("a")).unwrap();
        }
        let s = Store::open(&path).unwrap();
        assert_eq!(s.list_instances().unwrap().len(), 1);
    }

    #[test]
    fn test_save_and_roundtrip_instance() {
        let s = store();
        let mut inst = make("roundtrip");
        inst.worktree = Some(Worktree {
            path: "/wt".into(),
            repo: "repo".into(),
            branch: "main".into(),
        });
        inst.tool_data = serde_json::json!({"claude_session_id": "abc"});
        s.save_instance(&inst).unwrap();

        let back = s.get_instance(&inst.id).unwrap().unwrap();
        assert_eq!(back.title, "roundtrip");
        assert_eq!(back.worktree, inst.worktree);
        assert_eq!(back.tool_data["claude_session_id"], "abc");
        assert_eq!(back.tool, Tool::Claude);
    }

    #[test]
    fn test_save_instances_deletes_absentees() {
        let s = store();
        let a = make("a");
        let b = make("b");
        let c = make("c");
        s.save_instances(&[a.clone(), b.clone(), c.clone()]).unwrap();
        assert_eq!(s.list_instances().unwrap().len(), 3);

        s.save_instances(&[a.clone(), c.clone()]).unwrap();
        let ids: Vec<String> = s.list_instances().unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a.id));
        assert!(!ids.contains(&b.id));

        s.save_instances(&[]).unwrap();
        assert!(s.list_instances().unwrap().is_empty());
    }

    #[test]
    fn test_write_status_clears_acknowledged_on_active() {
        let s = store();
        let mut inst = make("ack");
        inst.acknowledged = true;
        s.save_instance(&inst).unwrap();

        s.write_status(&inst.id, Status::Waiting, &Tool::Claude).unwrap();
        assert!(s.get_instance(&inst.id).unwrap().unwrap().acknowledged);

        s.write_status(&inst.id, Status::Active, &Tool::Claude).unwrap();
        let row = s.get_instance(&inst.id).unwrap().unwrap();
        assert_eq!(row.status, Status::Active);
        assert!(!row.acknowledged);
    }

    #[test]
    fn test_read_all_statuses() {
        let s = store();
        let mut inst = make("r");
        inst.status = Status::Waiting;
        s.save_instance(&inst).unwrap();
        s.set_acknowledged(&inst.id, true).unwrap();

        let all = s.read_all_statuses().unwrap();
        let shared = &all[&inst.id];
        assert_eq!(shared.status, Status::Waiting);
        assert_eq!(shared.tool, Tool::Claude);
        assert!(shared.acknowledged);
    }

    #[test]
    fn test_groups_crud() {
        let s = store();
        let g = Group {
            path: "work".into(),
            name: "Work".into(),
            expanded: true,
            sort_order: 1,
            default_path: "/home/me/work".into(),
        };
        s.save_group(&g).unwrap();
        let listed = s.list_groups().unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].expanded);
        s.delete_group("work").unwrap();
        assert!(s.list_groups().unwrap().is_empty());
    }

    #[test]
    fn test_touch_is_monotonic() {
        let s = store();
        s.touch().unwrap();
        let first = s.last_modified().unwrap().unwrap();
        s.touch().unwrap();
        let second = s.last_modified().unwrap().unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_heartbeat_lifecycle() {
        let s = store();
        s.register_process(false).unwrap();
        assert_eq!(s.alive_process_count(30).unwrap(), 1);
        s.heartbeat().unwrap();
        s.unregister_process().unwrap();
        assert_eq!(s.alive_process_count(30).unwrap(), 0);
    }

    #[test]
    fn test_clean_dead_processes() {
        let s = store();
        s.insert_heartbeat_row(99991, epoch_secs() - 300, false);
        s.register_process(false).unwrap();
        let removed = s.clean_dead_processes(30).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(s.alive_process_count(30).unwrap(), 1);
    }

    #[test]
    fn test_elect_primary_fresh() {
        let s = store();
        s.register_process(false).unwrap();
        assert!(s.elect_primary(30).unwrap());
        // Re-election while holding stays true.
        assert!(s.elect_primary(30).unwrap());
    }

    #[test]
    fn test_elect_primary_defers_to_live_holder() {
        let s = store();
        s.insert_heartbeat_row(10001, epoch_secs(), true);
        s.register_process(false).unwrap();
        assert!(!s.elect_primary(30).unwrap());
    }

    #[test]
    fn test_elect_primary_takes_over_from_stale_holder() {
        let s = store();
        // Holder last heartbeat 120 s ago, timeout 30 s.
        s.insert_heartbeat_row(10001, epoch_secs() - 120, true);
        s.register_process(false).unwrap();
        assert!(s.elect_primary(30).unwrap());

        // The stale row's flag was cleared; ours is set. At most one
        // primary among non-stale rows.
        let conn = s.conn.lock().unwrap();
        let stale_flag: i64 = conn
            .query_row(
                "SELECT is_primary FROM instance_heartbeats WHERE pid = 10001",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(stale_flag, 0);
        let primaries: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM instance_heartbeats WHERE is_primary = 1",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(primaries, 1);
    }

    #[test]
    fn test_resign_primary() {
        let s = store();
        s.register_process(false).unwrap();
        assert!(s.elect_primary(30).unwrap());
        s.resign_primary().unwrap();
        s.insert_heartbeat_row(20002, epoch_secs(), false);
        // Another process could now win; we no longer hold the flag.
        let conn = s.conn.lock().unwrap();
        let ours: i64 = conn
            .query_row(
                "SELECT is_primary FROM instance_heartbeats WHERE pid = ?1",
                params![s.pid],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(ours, 0);
    }

    #[test]
    fn test_schema_version_gate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let s = Store::open(&path).unwrap();
            s.set_metadata("schema_version", "999").unwrap();
        }
        assert!(Store::open(&path).is_err());
    }
}
