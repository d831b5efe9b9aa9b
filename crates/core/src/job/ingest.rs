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

//! Job definitions enter the cluster through the filesystem: `add-job`
//! resolves a flat key/value definition into [`JobSettings`] and drops the
//! serialized result into the new-jobs directory, where a stager's scan loop
//! picks it up and marks it consumed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::job::JobSettings;
use crate::{Error, Result};

const JOB_FILE_EXT: &str = "job";
const DUMPING_SUFFIX: &str = ".dumping";
const LOADED_SUFFIX: &str = ".loaded";

/// Parsed `[name]` section of a job definition file.
#[derive(Debug)]
pub struct JobDefinition {
    pub name: String,
    keys: BTreeMap<String, String>,
}

impl JobDefinition {
    /// Parses the flat key/value format: one `[name]` header, `key: value`
    /// lines, and indented continuation lines that extend the previous value
    /// with a newline.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut name = None;
        let mut keys: BTreeMap<String, String> = BTreeMap::new();
        let mut current: Option<String> = None;

        for line in raw.lines() {
            if line.trim().is_empty() || line.trim_start().starts_with(['#', ';']) {
                continue;
            }

            let trimmed = line.trim();
            if trimmed.starts_with('[') && trimmed.ends_with(']') {
                if name.is_some() {
                    return Err(Error::InvalidJobDefinition(
                        "multiple sections in job definition".to_string(),
                    )
                    .into());
                }
                name = Some(trimmed[1..trimmed.len() - 1].trim().to_string());
                continue;
            }

            if line.starts_with([' ', '\t']) {
                // continuation of the previous value
                let key = current.clone().ok_or_else(|| {
                    Error::InvalidJobDefinition(format!("dangling continuation line '{trimmed}'"))
                })?;
                let value = keys.get_mut(&key).unwrap();
                value.push('\n');
                value.push_str(trimmed);
                continue;
            }

            let (key, value) = trimmed
                .split_once([':', '='])
                .ok_or_else(|| Error::InvalidJobDefinition(format!("bad line '{trimmed}'")))?;
            let key = key.trim().to_lowercase();
            keys.insert(key.clone(), value.trim().to_string());
            current = Some(key);
        }

        let name = name.ok_or_else(|| {
            Error::InvalidJobDefinition("missing [name] section header".to_string())
        })?;

        Ok(Self { name, keys })
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.keys.get(key).map(String::as_str)
    }

    fn lines(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Resolves the definition into settings. Seed urls come from up to three
    /// sources: inline `url` lines, `urls file` paths relative to the
    /// definition file, and `urls url` lists fetched over http.
    pub fn into_settings(self, location: &Path) -> Result<JobSettings> {
        let mut urls = self.lines("url");

        for path in self.lines("urls file") {
            let path = location.parent().unwrap_or(Path::new(".")).join(path);
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read url list {}", path.display()))?;
            urls.extend(
                raw.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(String::from),
            );
        }

        for list_url in self.lines("urls url") {
            let response = reqwest::blocking::get(&list_url)
                .map_err(|_| Error::SeedListUnavailable(list_url.clone()))?;
            if response.status() != reqwest::StatusCode::OK {
                return Err(Error::SeedListUnavailable(list_url).into());
            }
            let body = response
                .text()
                .map_err(|_| Error::SeedListUnavailable(list_url.clone()))?;
            urls.extend(
                body.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(String::from),
            );
        }

        let parse_bound = |key: &str| -> Result<u64> {
            match self.get(key) {
                Some(raw) => raw.trim().parse::<u64>().map_err(|_| {
                    Error::InvalidJobDefinition(format!("'{key}' is not an integer: {raw}")).into()
                }),
                None => Ok(u64::MAX),
            }
        };

        JobSettings::new(
            &self.name,
            urls,
            self.lines("allow regex"),
            self.lines("ignore regex"),
            parse_bound("rate")?,
            parse_bound("depth")?,
        )
    }
}

/// Writes a serialized job into the new-jobs directory under
/// `<identifier>.job`, going through a `.dumping` temp name so the scan loop
/// never observes a partial file.
pub fn write_job_file(settings: &JobSettings, jobs_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(jobs_dir)?;

    let path = jobs_dir.join(format!("{}.{}", settings.identifier, JOB_FILE_EXT));
    let mut temp = path.as_os_str().to_owned();
    temp.push(DUMPING_SUFFIX);
    let temp = PathBuf::from(temp);

    let bytes = bincode::encode_to_vec(settings, bincode::config::standard())?;
    std::fs::write(&temp, bytes)?;
    std::fs::rename(&temp, &path)?;

    Ok(path)
}

/// One scan pass over the new-jobs directory. Every `.job` file is decoded
/// and renamed to `<name>.loaded` so it is consumed exactly once. Undecodable
/// files are consumed too; re-reading them every pass would get no further.
pub fn scan_new_jobs(jobs_dir: &Path) -> Vec<JobSettings> {
    let mut found = Vec::new();

    let entries = match std::fs::read_dir(jobs_dir) {
        Ok(entries) => entries,
        Err(_) => return found,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(JOB_FILE_EXT) {
            continue;
        }

        match std::fs::read(&path).map_err(anyhow::Error::from).and_then(|bytes| {
            let (settings, _) =
                bincode::decode_from_slice::<JobSettings, _>(&bytes, bincode::config::standard())?;
            Ok(settings)
        }) {
            Ok(settings) => {
                tracing::info!(job = %settings.identifier, "loaded new job file");
                found.push(settings);
            }
            Err(e) => {
                tracing::error!(path = %path.display(), "failed to load job file: {e}");
            }
        }

        let mut loaded = path.as_os_str().to_owned();
        loaded.push(LOADED_SUFFIX);
        if let Err(e) = std::fs::rename(&path, PathBuf::from(loaded)) {
            tracing::error!(path = %path.display(), "failed to mark job file consumed: {e}");
        }
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFINITION: &str = "\
[demo]
url: https://a/
  https://b/
allow regex: .*
ignore regex:
rate: 10
depth: 2
";

    #[test]
    fn parse_definition_with_continuations() {
        let def = JobDefinition::parse(DEFINITION).unwrap();

        assert_eq!(def.name, "demo");
        assert_eq!(def.lines("url"), vec!["https://a/", "https://b/"]);
        assert_eq!(def.get("rate"), Some("10"));
    }

    #[test]
    fn definition_without_section_is_rejected() {
        assert!(JobDefinition::parse("url: https://a/\n").is_err());
    }

    #[test]
    fn into_settings_applies_defaults() {
        let def = JobDefinition::parse("[demo]\nurl: https://a/\nallow regex: .*\n").unwrap();
        let settings = def.into_settings(Path::new("demo.conf")).unwrap();

        assert_eq!(settings.rate, u64::MAX);
        assert_eq!(settings.depth, u64::MAX);
        assert_eq!(settings.urls, vec!["https://a/"]);
    }

    #[test]
    fn urls_file_is_resolved_relative_to_definition() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("seeds.txt"), "https://c/\n\nhttps://d/\n").unwrap();
        let location = dir.path().join("demo.conf");

        let def =
            JobDefinition::parse("[demo]\nurls file: seeds.txt\nallow regex: .*\n").unwrap();
        let settings = def.into_settings(&location).unwrap();

        assert_eq!(settings.urls, vec!["https://c/", "https://d/"]);
    }

    #[test]
    fn job_files_round_trip_through_the_drop_dir() {
        let dir = tempfile::tempdir().unwrap();
        let settings = JobSettings::new(
            "demo",
            vec!["https://a/".to_string()],
            vec![".*".to_string()],
            vec![],
            10,
            2,
        )
        .unwrap();

        write_job_file(&settings, dir.path()).unwrap();

        let loaded = scan_new_jobs(dir.path());
        assert_eq!(loaded, vec![settings.clone()]);

        // consumed files are renamed and not picked up again
        assert!(scan_new_jobs(dir.path()).is_empty());
        let marker = dir
            .path()
            .join(format!("{}.job.loaded", settings.identifier));
        assert!(marker.exists());
    }
}
