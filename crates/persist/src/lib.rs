//! hotrank system-of-record: SQLite item and category tables.
//! Counter write-back is guarded by a `version` column (optimistic concurrency).

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use hotrank_core::{Category, CategoryId, Counters, Item, ItemId};
use metrics::{counter, histogram};
use rusqlite::OptionalExtension;
use tracing::debug;

/// Columns needed to create an item; counters start at zero and version at 0.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub title: String,
    pub content: String,
    pub category_id: Option<CategoryId>,
    pub created_at_ms: i64,
}

/// Relational read/write boundary used by the loader and the reconciler.
pub trait ItemStore: Send + Sync {
    fn get_item(&self, id: ItemId) -> Result<Option<Item>>;
    /// `UPDATE .. WHERE id = ? AND version = ?`, bumping the version. Returns false on conflict
    /// or when the row is gone.
    fn update_counters(&self, id: ItemId, counters: &Counters, expected_version: i64) -> Result<bool>;
    /// Smallest and largest item id, `None` for an empty corpus.
    fn id_range(&self) -> Result<Option<(ItemId, ItemId)>>;
    fn get_category(&self, id: CategoryId) -> Result<Option<Category>>;
    fn insert_item(&self, item: &NewItem) -> Result<ItemId>;
    fn insert_category(&self, name: &str) -> Result<CategoryId>;
    fn delete_item(&self, id: ItemId) -> Result<bool>;
}

/// SQLite-backed store. Synchronous; async callers go through `spawn_blocking`.
pub struct SqliteStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("HOTRANK_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        let me = Self::init(db)?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(rusqlite::Connection::open_in_memory().context("opening in-memory sqlite")?)
    }

    fn init(db: rusqlite::Connection) -> Result<Self> {
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS categories (
                id   INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS items (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                title       TEXT NOT NULL,
                content     TEXT NOT NULL,
                category_id INTEGER,
                views       INTEGER NOT NULL DEFAULT 0,
                supports    INTEGER NOT NULL DEFAULT 0,
                opposes     INTEGER NOT NULL DEFAULT 0,
                comments    INTEGER NOT NULL DEFAULT 0,
                favorites   INTEGER NOT NULL DEFAULT 0,
                version     INTEGER NOT NULL DEFAULT 0,
                created_at  INTEGER NOT NULL
            );",
        )
        .context("creating tables")?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("sqlite connection mutex poisoned"))
    }
}

fn item_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Item> {
    Ok(Item {
        id: row.get(0)?,
        title: row.get(1)?,
        content: row.get(2)?,
        category_id: row.get(3)?,
        counters: Counters {
            views: row.get(4)?,
            supports: row.get(5)?,
            opposes: row.get(6)?,
            comments: row.get(7)?,
            favorites: row.get(8)?,
        },
        version: row.get(9)?,
        created_at_ms: row.get(10)?,
    })
}

impl ItemStore for SqliteStore {
    fn get_item(&self, id: ItemId) -> Result<Option<Item>> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        let item = db
            .query_row(
                "SELECT id, title, content, category_id, views, supports, opposes, comments, favorites, version, created_at
                 FROM items WHERE id = ?1",
                [id],
                item_from_row,
            )
            .optional()
            .with_context(|| format!("loading item {}", id))?;
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_get_total", 1u64);
        Ok(item)
    }

    fn update_counters(&self, id: ItemId, c: &Counters, expected_version: i64) -> Result<bool> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        let rows = db
            .execute(
                "UPDATE items
                 SET views = ?1, supports = ?2, opposes = ?3, comments = ?4, favorites = ?5, version = version + 1
                 WHERE id = ?6 AND version = ?7",
                (c.views, c.supports, c.opposes, c.comments, c.favorites, id, expected_version),
            )
            .with_context(|| format!("updating counters of item {}", id))?;
        histogram!("persist_update_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(item = id, expected_version, rows, "conditional counter update");
        Ok(rows == 1)
    }

    fn id_range(&self) -> Result<Option<(ItemId, ItemId)>> {
        let db = self.conn()?;
        let (lo, hi): (Option<i64>, Option<i64>) = db
            .query_row("SELECT MIN(id), MAX(id) FROM items", [], |r| Ok((r.get(0)?, r.get(1)?)))
            .context("reading item id range")?;
        Ok(lo.zip(hi))
    }

    fn get_category(&self, id: CategoryId) -> Result<Option<Category>> {
        let db = self.conn()?;
        db.query_row("SELECT id, name FROM categories WHERE id = ?1", [id], |r| {
            Ok(Category { id: r.get(0)?, name: r.get(1)? })
        })
        .optional()
        .with_context(|| format!("loading category {}", id))
    }

    fn insert_item(&self, item: &NewItem) -> Result<ItemId> {
        let db = self.conn()?;
        db.execute(
            "INSERT INTO items(title, content, category_id, created_at) VALUES (?1, ?2, ?3, ?4)",
            (&item.title, &item.content, item.category_id, item.created_at_ms),
        )
        .context("inserting item")?;
        Ok(db.last_insert_rowid())
    }

    fn insert_category(&self, name: &str) -> Result<CategoryId> {
        let db = self.conn()?;
        db.execute("INSERT INTO categories(name) VALUES (?1)", [name]).context("inserting category")?;
        Ok(db.last_insert_rowid())
    }

    fn delete_item(&self, id: ItemId) -> Result<bool> {
        let db = self.conn()?;
        Ok(db.execute("DELETE FROM items WHERE id = ?1", [id]).with_context(|| format!("deleting item {}", id))? == 1)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".hotrank");
        let _ = std::fs::create_dir_all(&p);
        p.push("hotrank.db");
        return p.to_string_lossy().to_string();
    }
    "hotrank.db".to_string()
}

pub fn now_ms() -> i64 {
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_millis() as i64
}
