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

pub mod ingest;

use crate::{random_string, Error, Result};

/// The unit of work moved across the cluster.
///
/// Seed urls carry depth 0 and no parent; discovered urls carry their parent
/// and the parent's depth plus one.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct UrlConfig {
    pub job: String,
    pub url: String,
    pub depth: u64,
    pub parent_url: Option<String>,
}

impl UrlConfig {
    pub fn seed(job: &str, url: impl Into<String>) -> Self {
        Self {
            job: job.to_string(),
            url: url.into(),
            depth: 0,
            parent_url: None,
        }
    }
}

/// Immutable job description. The identifier carries a random 8-char suffix
/// so the externally supplied name stays unique across the cluster and acts
/// as the primary key everywhere.
#[derive(
    Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct JobSettings {
    pub identifier: String,
    pub urls: Vec<String>,
    pub allow_regex: Vec<String>,
    pub ignore_regex: Vec<String>,
    pub rate: u64,
    pub depth: u64,
}

impl JobSettings {
    pub fn new(
        name: &str,
        urls: Vec<String>,
        allow_regex: Vec<String>,
        ignore_regex: Vec<String>,
        rate: u64,
        depth: u64,
    ) -> Result<Self> {
        if allow_regex.is_empty() {
            return Err(Error::InvalidJobDefinition(format!(
                "job '{name}' has no allow regex"
            ))
            .into());
        }

        for pattern in allow_regex.iter().chain(ignore_regex.iter()) {
            regex::Regex::new(pattern).map_err(|e| {
                Error::InvalidJobDefinition(format!("bad regex '{pattern}': {e}"))
            })?;
        }

        Ok(Self {
            identifier: format!("{}_{}", name, random_string(8)),
            urls,
            allow_regex,
            ignore_regex,
            rate,
            depth,
        })
    }

    pub fn seed_urls(&self) -> Vec<UrlConfig> {
        self.urls
            .iter()
            .map(|url| UrlConfig::seed(&self.identifier, url.clone()))
            .collect()
    }
}

/// Compiled allow/ignore filter for one job. A url passes when at least one
/// allow pattern matches, no ignore pattern matches and the depth stays
/// within the job bound.
pub struct UrlFilter {
    allow: Vec<regex::Regex>,
    ignore: Vec<regex::Regex>,
    max_depth: u64,
}

impl UrlFilter {
    pub fn new(settings: &JobSettings) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<regex::Regex>> {
            patterns
                .iter()
                .map(|p| regex::Regex::new(p).map_err(anyhow::Error::from))
                .collect()
        };

        Ok(Self {
            allow: compile(&settings.allow_regex)?,
            ignore: compile(&settings.ignore_regex)?,
            max_depth: settings.depth,
        })
    }

    pub fn allowed(&self, url: &UrlConfig) -> bool {
        if url.depth > self.max_depth {
            return false;
        }

        if !self.allow.iter().any(|re| re.is_match(&url.url)) {
            return false;
        }

        !self.ignore.iter().any(|re| re.is_match(&url.url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> JobSettings {
        JobSettings::new(
            "demo",
            vec!["https://a/".to_string()],
            vec!["^https://a/".to_string()],
            vec![r"\.pdf$".to_string()],
            10,
            2,
        )
        .unwrap()
    }

    #[test]
    fn identifier_gets_random_suffix() {
        let a = settings();
        let b = settings();

        assert!(a.identifier.starts_with("demo_"));
        assert_eq!(a.identifier.len(), "demo_".len() + 8);
        assert_ne!(a.identifier, b.identifier);
    }

    #[test]
    fn allow_regex_is_required() {
        assert!(JobSettings::new("demo", vec![], vec![], vec![], 1, 1).is_err());
    }

    #[test]
    fn invalid_regex_is_rejected() {
        assert!(JobSettings::new("demo", vec![], vec!["[".to_string()], vec![], 1, 1).is_err());
    }

    #[test]
    fn seed_urls_have_depth_zero_and_no_parent() {
        let settings = settings();
        let seeds = settings.seed_urls();

        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].depth, 0);
        assert_eq!(seeds[0].parent_url, None);
        assert_eq!(seeds[0].job, settings.identifier);
    }

    #[test]
    fn filter_honors_allow_ignore_and_depth() {
        let settings = settings();
        let filter = UrlFilter::new(&settings).unwrap();

        let ok = UrlConfig {
            job: settings.identifier.clone(),
            url: "https://a/page".to_string(),
            depth: 1,
            parent_url: Some("https://a/".to_string()),
        };
        assert!(filter.allowed(&ok));

        let wrong_host = UrlConfig {
            url: "https://b/page".to_string(),
            ..ok.clone()
        };
        assert!(!filter.allowed(&wrong_host));

        let ignored = UrlConfig {
            url: "https://a/doc.pdf".to_string(),
            ..ok.clone()
        };
        assert!(!filter.allowed(&ignored));

        let too_deep = UrlConfig {
            depth: 3,
            ..ok.clone()
        };
        assert!(!filter.allowed(&too_deep));
    }
}
