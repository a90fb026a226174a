use crate::core::{ItemInfo, Result};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

/// Bumped whenever the `items` table layout changes
const INDEX_VERSION: i64 = 1;

/// SQLite caps bound parameters per statement; stay well below it
const MAX_PARAMS: usize = 500;

const INFO_COLUMNS: &str = "key, filename, size, mod_time, access_time, extended_data";

/// An eviction candidate
#[derive(Debug, Clone)]
pub struct Victim {
    pub key: String,
    pub filename: Option<String>,
    pub size: u64,
}

/// The on-disk item index
///
/// One row per key. Inline values live in `inline_data`; file-placed values
/// only record their `filename`.
pub struct Index {
    conn: Connection,
}

impl Index {
    /// Open or create the index database
    ///
    /// An index written by an unknown format version is dropped and rebuilt
    /// empty; blob files it referenced become orphans for the next sweep.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        let journal: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        debug!("Index journal mode: {}", journal);

        let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if version != 0 && version != INDEX_VERSION {
            warn!(
                "Index at {:?} has format version {}, expected {}; rebuilding",
                path, version, INDEX_VERSION
            );
            conn.execute_batch("DROP TABLE IF EXISTS items;")?;
        }

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS items (
                key TEXT PRIMARY KEY NOT NULL,
                filename TEXT,
                size INTEGER NOT NULL DEFAULT 0,
                inline_data BLOB,
                mod_time INTEGER NOT NULL,
                access_time INTEGER NOT NULL,
                extended_data BLOB
            );
            CREATE INDEX IF NOT EXISTS items_access_time ON items(access_time);
            CREATE INDEX IF NOT EXISTS items_filename ON items(filename);",
        )?;
        conn.pragma_update(None, "user_version", INDEX_VERSION)?;

        info!("Index opened at {:?}", path);
        Ok(Self { conn })
    }

    fn info_from_row(row: &Row<'_>) -> rusqlite::Result<ItemInfo> {
        Ok(ItemInfo {
            key: row.get(0)?,
            filename: row.get(1)?,
            size: row.get::<_, i64>(2)? as u64,
            mod_time: row.get(3)?,
            access_time: row.get(4)?,
            extended_data: row.get(5)?,
        })
    }

    fn victim_from_row(row: &Row<'_>) -> rusqlite::Result<Victim> {
        Ok(Victim {
            key: row.get(0)?,
            filename: row.get(1)?,
            size: row.get::<_, i64>(2)? as u64,
        })
    }

    /// Insert or fully replace the row for `info.key`
    pub fn upsert(&mut self, info: &ItemInfo, inline_data: Option<&[u8]>) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO items
                (key, filename, size, inline_data, mod_time, access_time, extended_data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                info.key,
                info.filename,
                info.size as i64,
                inline_data,
                info.mod_time,
                info.access_time,
                info.extended_data,
            ],
        )?;
        Ok(())
    }

    pub fn info(&self, key: &str) -> Result<Option<ItemInfo>> {
        let sql = format!("SELECT {} FROM items WHERE key = ?1", INFO_COLUMNS);
        let info = self
            .conn
            .query_row(&sql, params![key], Self::info_from_row)
            .optional()?;
        Ok(info)
    }

    /// Row metadata plus the inline bytes, if any
    pub fn row(&self, key: &str) -> Result<Option<(ItemInfo, Option<Vec<u8>>)>> {
        let sql = format!(
            "SELECT {}, inline_data FROM items WHERE key = ?1",
            INFO_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![key], |row| {
                Ok((Self::info_from_row(row)?, row.get::<_, Option<Vec<u8>>>(6)?))
            })
            .optional()?;
        Ok(row)
    }

    pub fn infos(&self, keys: &[String]) -> Result<Vec<ItemInfo>> {
        let mut out = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(MAX_PARAMS) {
            let sql = format!(
                "SELECT {} FROM items WHERE key IN ({})",
                INFO_COLUMNS,
                placeholders(chunk.len())
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), Self::info_from_row)?;
            for row in rows {
                out.push(row?);
            }
        }
        Ok(out)
    }

    pub fn exists(&self, key: &str) -> Result<bool> {
        let found = self
            .conn
            .query_row("SELECT 1 FROM items WHERE key = ?1", params![key], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    /// Whether any row still points at `filename`
    pub fn filename_referenced(&self, filename: &str) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM items WHERE filename = ?1 LIMIT 1",
                params![filename],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn touch(&mut self, key: &str, access_time: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE items SET access_time = ?1 WHERE key = ?2",
            params![access_time, key],
        )?;
        Ok(())
    }

    pub fn touch_many(&mut self, keys: &[String], access_time: i64) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare("UPDATE items SET access_time = ?1 WHERE key = ?2")?;
            for key in keys {
                stmt.execute(params![access_time, key])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn delete(&mut self, key: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM items WHERE key = ?1", params![key])?;
        Ok(n > 0)
    }

    /// Delete rows in one transaction, returning how many existed
    pub fn delete_many(&mut self, keys: &[String]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let mut deleted = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM items WHERE key = ?1")?;
            for key in keys {
                deleted += stmt.execute(params![key])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    pub fn clear(&mut self) -> Result<usize> {
        let n = self.conn.execute("DELETE FROM items", [])?;
        Ok(n)
    }

    fn victims(&self, sql: &str, param: i64) -> Result<Vec<Victim>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params![param], Self::victim_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn larger_than(&self, size: u64) -> Result<Vec<Victim>> {
        self.victims(
            "SELECT key, filename, size FROM items WHERE size > ?1",
            size.min(i64::MAX as u64) as i64,
        )
    }

    pub fn modified_before(&self, time: i64) -> Result<Vec<Victim>> {
        self.victims(
            "SELECT key, filename, size FROM items WHERE mod_time < ?1",
            time,
        )
    }

    /// Least recently accessed rows first, ties in insertion order
    pub fn least_recent(&self, limit: usize) -> Result<Vec<Victim>> {
        self.victims(
            "SELECT key, filename, size FROM items
             ORDER BY access_time ASC, rowid ASC LIMIT ?1",
            limit as i64,
        )
    }

    pub fn least_recent_infos(&self, limit: usize) -> Result<Vec<ItemInfo>> {
        let sql = format!(
            "SELECT {} FROM items ORDER BY access_time ASC, rowid ASC LIMIT ?1",
            INFO_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], Self::info_from_row)?;
        let mut out = Vec::with_capacity(limit);
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// First rows in insertion order, for batched wipes
    pub fn first_rows(&self, limit: usize) -> Result<Vec<Victim>> {
        self.victims(
            "SELECT key, filename, size FROM items ORDER BY rowid ASC LIMIT ?1",
            limit as i64,
        )
    }

    pub fn visit_infos<F: FnMut(&ItemInfo)>(&self, mut visit: F) -> Result<()> {
        let sql = format!("SELECT {} FROM items", INFO_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::info_from_row)?;
        for row in rows {
            visit(&row?);
        }
        Ok(())
    }

    pub fn count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn total_size(&self) -> Result<u64> {
        let n: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(size), 0) FROM items",
            [],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    /// Newest timestamp on record, used to seed the engine clock
    pub fn latest_stamp(&self) -> Result<i64> {
        let n: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(MAX(mod_time, access_time)), 0) FROM items",
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    pub fn referenced_filenames(&self) -> Result<HashSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT filename FROM items WHERE filename IS NOT NULL")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = HashSet::new();
        for row in rows {
            out.insert(row?);
        }
        Ok(out)
    }

    /// `(key, filename)` for every file-placed row
    pub fn file_rows(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, filename FROM items WHERE filename IS NOT NULL")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn placeholders(n: usize) -> String {
    let mut s = String::with_capacity(n * 2);
    for i in 0..n {
        if i > 0 {
            s.push(',');
        }
        s.push('?');
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn info(key: &str, size: u64, access_time: i64) -> ItemInfo {
        ItemInfo {
            key: key.to_string(),
            filename: None,
            size,
            mod_time: access_time,
            access_time,
            extended_data: None,
        }
    }

    #[test]
    fn test_upsert_and_row() {
        let dir = tempdir().unwrap();
        let mut index = Index::open(&dir.path().join("index.db")).unwrap();

        index.upsert(&info("a", 3, 10), Some(b"abc")).unwrap();
        let (row, inline) = index.row("a").unwrap().unwrap();
        assert_eq!(row.size, 3);
        assert_eq!(inline.as_deref(), Some(&b"abc"[..]));

        assert!(index.row("missing").unwrap().is_none());
    }

    #[test]
    fn test_least_recent_ties_in_insertion_order() {
        let dir = tempdir().unwrap();
        let mut index = Index::open(&dir.path().join("index.db")).unwrap();

        index.upsert(&info("b", 1, 5), None).unwrap();
        index.upsert(&info("a", 1, 5), None).unwrap();
        index.upsert(&info("c", 1, 1), None).unwrap();

        let keys: Vec<String> = index
            .least_recent(10)
            .unwrap()
            .into_iter()
            .map(|v| v.key)
            .collect();
        assert_eq!(keys, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_aggregates() {
        let dir = tempdir().unwrap();
        let mut index = Index::open(&dir.path().join("index.db")).unwrap();
        assert_eq!(index.count().unwrap(), 0);
        assert_eq!(index.total_size().unwrap(), 0);

        index.upsert(&info("a", 10, 1), None).unwrap();
        index.upsert(&info("b", 20, 7), None).unwrap();
        assert_eq!(index.count().unwrap(), 2);
        assert_eq!(index.total_size().unwrap(), 30);
        assert_eq!(index.latest_stamp().unwrap(), 7);

        assert_eq!(
            index
                .delete_many(&["a".to_string(), "zz".to_string()])
                .unwrap(),
            1
        );
        assert_eq!(index.count().unwrap(), 1);
    }

    #[test]
    fn test_unknown_version_rebuilds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.db");
        {
            let mut index = Index::open(&path).unwrap();
            index.upsert(&info("a", 1, 1), None).unwrap();
            index.conn.pragma_update(None, "user_version", 99).unwrap();
        }

        let index = Index::open(&path).unwrap();
        assert_eq!(index.count().unwrap(), 0);
    }
}
