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

//! The fetch driver runs an external wget-style binary against a batch of
//! urls and a fresh working directory. The binary leaves `.warc.gz` files in
//! the directory and appends NUL-separated `parent\0child` lines to the
//! found-urls file; a missing found-urls file falls back to extracting urls
//! from the response records of the produced WARCs.

use std::path::{Path, PathBuf};

use crate::config::FetchConfig;
use crate::warc::{self, WarcFile};
use crate::Result;

const DRIVER_LOG: &str = "wget.log";
const DRIVER_TEMP: &str = "wget.tmp";

pub struct FetchDriver {
    config: FetchConfig,
}

impl FetchDriver {
    pub fn new(config: FetchConfig) -> Self {
        Self { config }
    }

    /// Runs one fetch. `Ok(None)` is the failure sentinel: the driver exited
    /// with a code outside the allowlist and the inputs should be requeued.
    pub async fn fetch(
        &self,
        dir: &Path,
        urls: &[String],
    ) -> Result<Option<Vec<(String, String)>>> {
        std::fs::create_dir_all(dir)?;
        let found_path = dir.join(&self.config.found_urls_file);

        let status = tokio::process::Command::new(&self.config.command)
            .args(self.arguments(dir, urls))
            .env("FOUND_URLS_FILE", &found_path)
            .status()
            .await?;

        let code = status.code().unwrap_or(-1);
        if !self.config.success_exit_codes.contains(&code) {
            tracing::warn!(dir = %dir.display(), code, "fetch driver failed");
            return Ok(None);
        }

        if found_path.is_file() {
            let raw = std::fs::read_to_string(&found_path)?;
            return Ok(Some(parse_found_urls(&raw)));
        }

        Ok(Some(extract_from_warcs(dir)?))
    }

    fn arguments(&self, dir: &Path, urls: &[String]) -> Vec<String> {
        let warc_stem = format!(
            "{}_{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            dir.file_name().and_then(|n| n.to_str()).unwrap_or("crawl"),
        );

        let mut args = vec![
            "--user-agent".to_string(),
            self.config.user_agent.clone(),
            "--no-verbose".to_string(),
            "--no-cookies".to_string(),
            "--no-check-certificate".to_string(),
            "--output-file".to_string(),
            dir.join(DRIVER_LOG).display().to_string(),
            "--output-document".to_string(),
            dir.join(DRIVER_TEMP).display().to_string(),
            "--execute".to_string(),
            "robots=off".to_string(),
            "--no-parent".to_string(),
            "--page-requisites".to_string(),
            "--span-hosts".to_string(),
            "--timeout".to_string(),
            self.config.timeout_secs.to_string(),
            "--tries".to_string(),
            self.config.tries.to_string(),
            "--waitretry".to_string(),
            self.config.wait_retry_secs.to_string(),
            "--warc-file".to_string(),
            dir.join(warc_stem).display().to_string(),
        ];

        args.extend(urls.iter().cloned());
        args
    }
}

fn parse_found_urls(raw: &str) -> Vec<(String, String)> {
    raw.lines()
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            line.split_once('\0')
                .map(|(parent, child)| (parent.to_string(), child.to_string()))
        })
        .collect()
}

fn extract_from_warcs(dir: &Path) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();

    for path in warc_files(dir) {
        let file = WarcFile::open(&path)?;
        for record in file.records() {
            let Ok(record) = record else { break };
            if record.warc_type() != Some("response") {
                continue;
            }
            let Some(parent) = record.target_uri() else {
                continue;
            };
            for url in warc::extract_urls(parent, &record.body) {
                pairs.push((parent.to_string(), url));
            }
        }
    }

    Ok(pairs)
}

/// All `.warc.gz` files in a crawl directory.
pub fn warc_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".warc.gz"))
            {
                files.push(path);
            }
        }
    }

    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn found_urls_are_nul_separated_pairs() {
        let raw = "https://a/\0https://a/b\n\nhttps://a/\0https://a/c\nmalformed\n";

        let pairs = parse_found_urls(raw);

        assert_eq!(
            pairs,
            vec![
                ("https://a/".to_string(), "https://a/b".to_string()),
                ("https://a/".to_string(), "https://a/c".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn allowed_exit_code_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FetchDriver::new(FetchConfig {
            command: "true".to_string(),
            success_exit_codes: vec![0],
            ..FetchConfig::default()
        });

        let res = driver
            .fetch(&dir.path().join("crawl"), &["https://a/".to_string()])
            .await
            .unwrap();

        assert_eq!(res, Some(Vec::new()));
    }

    #[tokio::test]
    async fn disallowed_exit_code_is_the_failure_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FetchDriver::new(FetchConfig {
            command: "false".to_string(),
            success_exit_codes: vec![0],
            ..FetchConfig::default()
        });

        let res = driver
            .fetch(&dir.path().join("crawl"), &["https://a/".to_string()])
            .await
            .unwrap();

        assert_eq!(res, None);
    }

    #[test]
    fn only_warc_gz_files_are_listed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.warc.gz"), b"x").unwrap();
        std::fs::write(dir.path().join("b.warc.gz.uploading"), b"x").unwrap();
        std::fs::write(dir.path().join("wget.log"), b"x").unwrap();

        let files = warc_files(dir.path());

        assert_eq!(files, vec![dir.path().join("a.warc.gz")]);
    }
}
