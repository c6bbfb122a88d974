//! The download cache: bytes pulled on demand (not into a tree).
//!
//! Originally this was going to be a directory of files, but we want to
//! enforce a size ceiling, and racing processes stat-ing and deleting in
//! the same directory is a pain. What if we had some mechanism that was
//! atomic, consistent, isolated, and durable?

use rusqlite::{Connection, OptionalExtension, params};
use tracing::*;

use crate::errors::Result;
use crate::hashing::ContentHash;

/// 200 MB unless the user says otherwise.
pub const DEFAULT_VOLUME: i64 = 200 * 1024 * 1024;

pub struct DownloadCache {
    conn: Connection,
}

impl DownloadCache {
    /// Create a cache given the database connection - let users handle the
    /// creation to make it easy to pass in `Connection::open_in_memory()`,
    /// etc.
    pub fn new(mut conn: Connection) -> Result<Self> {
        let tx = conn.transaction()?;
        let ver: i32 = tx.query_row("PRAGMA user_version", (), |r| r.get(0))?;
        if ver < 1 {
            tx.execute(
                "CREATE TABLE cache (
                    sync TEXT NOT NULL,
                    path TEXT NOT NULL,
                    sha1 BLOB NOT NULL,
                    time INTEGER NOT NULL,
                    data BLOB NOT NULL,
                    PRIMARY KEY (sync, path)
                ) STRICT",
                (),
            )?;
            tx.execute(
                "CREATE TABLE settings (
                    key TEXT NOT NULL PRIMARY KEY,
                    value NOT NULL
                )",
                (),
            )?;
        }
        tx.execute("PRAGMA user_version=1", ())?;
        tx.commit()?;

        let jm: String = conn.query_row("PRAGMA journal_mode=wal", (), |r| r.get(0))?;
        debug_assert!(jm == "wal" || jm == "memory");

        conn.execute(
            "INSERT OR IGNORE INTO settings(key, value) VALUES ('volume', ?1)",
            [DEFAULT_VOLUME],
        )?;

        Ok(Self { conn })
    }

    pub fn volume(&self) -> Result<i64> {
        let v = self
            .conn
            .query_row("SELECT value FROM settings WHERE key = 'volume'", (), |r| {
                r.get(0)
            })?;
        Ok(v)
    }

    /// Change the ceiling and evict down to it right away.
    pub fn set_volume(&mut self, volume: i64) -> Result<()> {
        self.conn.execute(
            "REPLACE INTO settings(key, value) VALUES ('volume', ?1)",
            [volume],
        )?;
        self.reclaim(0)?;
        Ok(())
    }

    pub fn try_read(&mut self, sync: &str, path: &str) -> Result<Option<(ContentHash, Vec<u8>)>> {
        let found = self
            .conn
            .query_row(
                "SELECT sha1, data FROM cache WHERE sync = ?1 AND path = ?2",
                params![sync, path],
                |r| Ok((r.get::<_, Vec<u8>>(0)?, r.get::<_, Vec<u8>>(1)?)),
            )
            .optional()?;
        let Some((sha_bytes, data)) = found else {
            return Ok(None);
        };
        // Freshen for the LRU.
        self.conn.execute(
            "UPDATE cache SET time = ?3 WHERE sync = ?1 AND path = ?2",
            params![sync, path, now_ms()],
        )?;
        Ok(ContentHash::from_bytes(&sha_bytes).map(|h| (h, data)))
    }

    /// Insert, reclaiming space synchronously so the ceiling holds.
    pub fn insert(&mut self, sync: &str, path: &str, sha1: &ContentHash, data: &[u8]) -> Result<()> {
        self.reclaim(data.len() as i64)?;
        self.conn.execute(
            "REPLACE INTO cache (sync, path, sha1, time, data) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![sync, path, sha1.as_bytes(), now_ms(), data],
        )?;
        Ok(())
    }

    /// Evict least-recently-used entries until `incoming` more bytes fit
    /// under the ceiling.
    fn reclaim(&mut self, incoming: i64) -> Result<()> {
        let ceiling = self.volume()?;
        loop {
            let used: i64 = self.conn.query_row(
                "SELECT COALESCE(SUM(LENGTH(data)), 0) FROM cache",
                (),
                |r| r.get(0),
            )?;
            if used + incoming <= ceiling {
                return Ok(());
            }
            let oldest: Option<(String, String)> = self
                .conn
                .query_row(
                    "SELECT sync, path FROM cache ORDER BY time ASC LIMIT 1",
                    (),
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            let Some((sync, path)) = oldest else {
                // Nothing left to evict; the incoming blob is just bigger
                // than the whole cache. Let it through.
                return Ok(());
            };
            debug!("evicting {sync}:{path} from the download cache");
            self.conn.execute(
                "DELETE FROM cache WHERE sync = ?1 AND path = ?2",
                params![sync, path],
            )?;
        }
    }
}

fn now_ms() -> i64 {
    jiff::Timestamp::now().as_millisecond()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn smoke() -> Result<()> {
        let mut cache = DownloadCache::new(Connection::open_in_memory()?)?;
        let buf = [1, 2, 3, 4];
        let sha = ContentHash::hash(&buf);
        cache.insert("s1", "/foo", &sha, &buf)?;
        let (read_sha, read) = cache.try_read("s1", "/foo")?.unwrap();
        assert_eq!(read_sha, sha);
        assert_eq!(read, buf);
        assert!(cache.try_read("s1", "/bar")?.is_none());
        Ok(())
    }

    #[test]
    fn reclaim_evicts_least_recent() -> Result<()> {
        let mut cache = DownloadCache::new(Connection::open_in_memory()?)?;
        cache.set_volume(10)?;

        let a = [0u8; 4];
        let b = [1u8; 4];
        cache.insert("s", "/a", &ContentHash::hash(&a), &a)?;
        cache.insert("s", "/b", &ContentHash::hash(&b), &b)?;

        // Touch /a so /b is the eviction candidate.
        assert!(cache.try_read("s", "/a")?.is_some());

        let c = [2u8; 4];
        cache.insert("s", "/c", &ContentHash::hash(&c), &c)?;
        assert!(cache.try_read("s", "/b")?.is_none());
        assert!(cache.try_read("s", "/a")?.is_some());
        assert!(cache.try_read("s", "/c")?.is_some());
        Ok(())
    }

    #[test]
    fn shrinking_the_volume_reclaims_now() -> Result<()> {
        let mut cache = DownloadCache::new(Connection::open_in_memory()?)?;
        cache.set_volume(100)?;
        for i in 0..5 {
            let data = vec![i as u8; 20];
            cache.insert("s", &format!("/f{i}"), &ContentHash::hash(&data), &data)?;
        }
        cache.set_volume(40)?;
        let survivors: i64 =
            cache
                .conn
                .query_row("SELECT COUNT(*) FROM cache", (), |r| r.get(0))?;
        assert_eq!(survivors, 2);
        Ok(())
    }
}
