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

pub mod defaults;

#[derive(Debug, serde::Deserialize, Clone)]
pub struct StagerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,

    /// Bootstrap stager to join at startup.
    pub stager_host: Option<String>,
    pub stager_port: Option<u16>,

    #[serde(default = "defaults::Stager::max_space")]
    pub max_space: u64,

    #[serde(default = "defaults::Stager::max_backups")]
    pub max_backups: usize,

    #[serde(default = "defaults::Cluster::max_stager")]
    pub max_stager: usize,

    #[serde(default = "defaults::Cluster::ping_secs")]
    pub ping_secs: u64,

    #[serde(default = "defaults::Stager::jobs_check_secs")]
    pub jobs_check_secs: u64,

    #[serde(default = "defaults::Stager::new_jobs_scan_secs")]
    pub new_jobs_scan_secs: u64,

    #[serde(default = "defaults::Stager::jobs_dir")]
    pub jobs_dir: String,

    #[serde(default = "defaults::Stager::warc_dir")]
    pub warc_dir: String,
}

impl Default for StagerConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            stager_host: None,
            stager_port: None,
            max_space: defaults::Stager::max_space(),
            max_backups: defaults::Stager::max_backups(),
            max_stager: defaults::Cluster::max_stager(),
            ping_secs: defaults::Cluster::ping_secs(),
            jobs_check_secs: defaults::Stager::jobs_check_secs(),
            new_jobs_scan_secs: defaults::Stager::new_jobs_scan_secs(),
            jobs_dir: defaults::Stager::jobs_dir(),
            warc_dir: defaults::Stager::warc_dir(),
        }
    }
}

#[derive(Debug, serde::Deserialize, Clone)]
pub struct CrawlerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,

    pub stager_host: Option<String>,
    pub stager_port: Option<u16>,

    #[serde(default = "defaults::Cluster::max_stager")]
    pub max_stager: usize,

    #[serde(default = "defaults::Cluster::ping_secs")]
    pub ping_secs: u64,

    #[serde(default = "defaults::Cluster::request_stager_secs")]
    pub request_stager_secs: u64,

    #[serde(default = "defaults::Crawler::url_quota_secs")]
    pub url_quota_secs: u64,

    #[serde(default = "defaults::Crawler::request_upload_secs")]
    pub request_upload_secs: u64,

    #[serde(default = "defaults::Crawler::min_url_quota")]
    pub min_url_quota: u64,

    #[serde(default = "defaults::Crawler::job_max_urls")]
    pub job_max_urls: usize,

    #[serde(default = "defaults::Crawler::job_max_wait_secs")]
    pub job_max_wait_secs: u64,

    #[serde(default = "defaults::Crawler::job_max_wait_urls_secs")]
    pub job_max_wait_urls_secs: u64,

    #[serde(default = "defaults::Crawler::crawls_dir")]
    pub crawls_dir: String,

    /// Oracle endpoint for payload deduplication. Revisit rewriting is
    /// disabled when unset.
    pub deduplication_server: Option<String>,

    #[serde(default)]
    pub fetch: FetchConfig,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            stager_host: None,
            stager_port: None,
            max_stager: defaults::Cluster::max_stager(),
            ping_secs: defaults::Cluster::ping_secs(),
            request_stager_secs: defaults::Cluster::request_stager_secs(),
            url_quota_secs: defaults::Crawler::url_quota_secs(),
            request_upload_secs: defaults::Crawler::request_upload_secs(),
            min_url_quota: defaults::Crawler::min_url_quota(),
            job_max_urls: defaults::Crawler::job_max_urls(),
            job_max_wait_secs: defaults::Crawler::job_max_wait_secs(),
            job_max_wait_urls_secs: defaults::Crawler::job_max_wait_urls_secs(),
            crawls_dir: defaults::Crawler::crawls_dir(),
            deduplication_server: None,
            fetch: FetchConfig::default(),
        }
    }
}

/// Invocation of the external fetch binary. The binary is expected to write
/// `.warc.gz` files into the working directory it is given and to append
/// NUL-separated `parent\0child` lines to the found-urls file.
#[derive(Debug, serde::Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "defaults::Fetch::command")]
    pub command: String,

    #[serde(default = "defaults::Fetch::success_exit_codes")]
    pub success_exit_codes: Vec<i32>,

    #[serde(default = "defaults::Fetch::user_agent")]
    pub user_agent: String,

    #[serde(default = "defaults::Fetch::timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "defaults::Fetch::tries")]
    pub tries: u64,

    #[serde(default = "defaults::Fetch::wait_retry_secs")]
    pub wait_retry_secs: u64,

    #[serde(default = "defaults::Fetch::found_urls_file")]
    pub found_urls_file: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            command: defaults::Fetch::command(),
            success_exit_codes: defaults::Fetch::success_exit_codes(),
            user_agent: defaults::Fetch::user_agent(),
            timeout_secs: defaults::Fetch::timeout_secs(),
            tries: defaults::Fetch::tries(),
            wait_retry_secs: defaults::Fetch::wait_retry_secs(),
            found_urls_file: defaults::Fetch::found_urls_file(),
        }
    }
}
