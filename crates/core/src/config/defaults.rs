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

pub struct Cluster;

impl Cluster {
    pub fn ping_secs() -> u64 {
        60
    }

    pub fn max_stager() -> usize {
        5
    }

    pub fn request_stager_secs() -> u64 {
        120
    }
}

pub struct Stager;

impl Stager {
    pub fn max_space() -> u64 {
        1_000_000_000
    }

    pub fn max_backups() -> usize {
        3
    }

    pub fn jobs_check_secs() -> u64 {
        5
    }

    pub fn new_jobs_scan_secs() -> u64 {
        10
    }

    pub fn jobs_dir() -> String {
        "jobs".to_string()
    }

    pub fn warc_dir() -> String {
        "warc".to_string()
    }
}

pub struct Crawler;

impl Crawler {
    pub fn crawls_dir() -> String {
        "data".to_string()
    }

    pub fn url_quota_secs() -> u64 {
        2
    }

    pub fn request_upload_secs() -> u64 {
        5
    }

    pub fn min_url_quota() -> u64 {
        100
    }

    pub fn job_max_urls() -> usize {
        1_000
    }

    pub fn job_max_wait_secs() -> u64 {
        300
    }

    pub fn job_max_wait_urls_secs() -> u64 {
        30
    }
}

pub struct Fetch;

impl Fetch {
    pub fn command() -> String {
        "wget".to_string()
    }

    pub fn success_exit_codes() -> Vec<i32> {
        vec![0, 4, 6, 8]
    }

    pub fn user_agent() -> String {
        "ArchiveTeam; Googlebot/2.1".to_string()
    }

    pub fn timeout_secs() -> u64 {
        30
    }

    pub fn tries() -> u64 {
        5
    }

    pub fn wait_retry_secs() -> u64 {
        30
    }

    pub fn found_urls_file() -> String {
        "new_urls.txt".to_string()
    }
}
