// Trawler is a decentralized web crawling and archiving cluster.
// Copyright (C) 2024 Stract ApS
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Per-job url-seen database. A crawler records every url it finished so a
//! restart does not re-archive work it already reported. Durability is
//! deliberately relaxed (`synchronous=OFF`, WAL); losing the last few rows
//! on a crash costs a duplicate fetch, nothing more.

use std::path::Path;

use rusqlite::Connection;

use crate::job::UrlConfig;
use crate::Result;

pub struct UrlSeenDb {
    conn: Connection,
    table: String,
}

impl UrlSeenDb {
    pub fn open(dir: &Path, job: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let conn = Connection::open(dir.join(format!("{job}.db")))?;

        conn.pragma_update(None, "synchronous", "OFF")?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;

        let table = format!("crawler_{}", sanitize(job));
        conn.execute(
            &format!("CREATE TABLE IF NOT EXISTS {table} (url TEXT, depth INTEGER, parent TEXT)"),
            [],
        )?;

        Ok(Self { conn, table })
    }

    pub fn insert(&self, url: &UrlConfig) -> Result<()> {
        self.conn.execute(
            &format!("INSERT INTO {} VALUES (?1, ?2, ?3)", self.table),
            rusqlite::params![
                url.url,
                url.depth as i64,
                url.parent_url.as_deref().unwrap_or(""),
            ],
        )?;

        Ok(())
    }

    pub fn contains(&self, url: &str) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                &format!("SELECT 1 FROM {} WHERE url = ?1 LIMIT 1", self.table),
                rusqlite::params![url],
                |_| Ok(()),
            )
            .map(|_| true)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(false),
                other => Err(other),
            })?;

        Ok(found)
    }
}

fn sanitize(job: &str) -> String {
    job.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(u: &str) -> UrlConfig {
        UrlConfig {
            job: "demo_abc".to_string(),
            url: u.to_string(),
            depth: 1,
            parent_url: Some("https://a/".to_string()),
        }
    }

    #[test]
    fn inserted_urls_are_seen() {
        let dir = tempfile::tempdir().unwrap();
        let db = UrlSeenDb::open(dir.path(), "demo_abc").unwrap();

        assert!(!db.contains("https://a/page").unwrap());
        db.insert(&url("https://a/page")).unwrap();
        assert!(db.contains("https://a/page").unwrap());
        assert!(!db.contains("https://a/other").unwrap());
    }

    #[test]
    fn reopening_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();

        {
            let db = UrlSeenDb::open(dir.path(), "demo_abc").unwrap();
            db.insert(&url("https://a/page")).unwrap();
        }

        let db = UrlSeenDb::open(dir.path(), "demo_abc").unwrap();
        assert!(db.contains("https://a/page").unwrap());
    }

    #[test]
    fn seed_url_without_parent_is_stored() {
        let dir = tempfile::tempdir().unwrap();
        let db = UrlSeenDb::open(dir.path(), "demo_abc").unwrap();

        db.insert(&UrlConfig::seed("demo_abc", "https://a/")).unwrap();
        assert!(db.contains("https://a/").unwrap());
    }
}
