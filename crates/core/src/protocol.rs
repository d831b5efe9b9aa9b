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

use crate::job::{JobSettings, UrlConfig};

pub type JobId = String;

/// A node's listener identity. Peers are keyed by the address they declare
/// for their own listener, never by the ephemeral accept-side endpoint.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Everything that moves between nodes. One frame carries exactly one
/// command; dispatch is a `match` on the decoded variant.
#[derive(
    Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum Command {
    AnnounceCrawler { addr: Address },
    AnnounceCrawlerExtra { addr: Address },
    AnnounceStager { addr: Address },
    AnnounceStagerExtra { addr: Address },
    Confirmed { state: i8 },
    AlreadyConfirmed,
    StagerNew { addr: Address },
    RequestStager { needed: usize, known: Vec<Address> },
    AddStager { addr: Address },
    Ping,
    Pong,

    NewJob { settings: JobSettings },
    NewJobStager { job: JobId, initial_owner: Address, peers: Vec<Address> },
    ConfirmedJob { state: i8, job: JobId },
    JobSetCounter { job: JobId, counter: Address },
    NewJobCrawl { settings: JobSettings },
    JobCrawlConfirmed { job: JobId },
    JobStart { job: JobId },
    JobStartCrawl { job: JobId },
    JobStartedCrawl { job: JobId },
    JobStartedStager { job: JobId },

    JobUrl { url: UrlConfig },
    JobUrlBackup { url: UrlConfig, owner: Address },
    JobUrlCrawl { url: UrlConfig },
    JobUrlFinished { job: JobId, url: String, queued_by: Address },
    JobUrlDiscovered { url: UrlConfig },

    RequestUrlQuota { job: JobId },
    RequestUrlQuotaCrawler { job: JobId, crawler: Address },
    AssignedUrlQuota { job: JobId, quota: u64 },
    AssignedUrlQuotaCrawler { job: JobId, quota: u64, crawler: Address },

    RequestUploadPermission { job: JobId, path: String, filesize: u64 },
    UploadPermissionGranted { job: JobId, path: String },
    UploadPermissionDenied { job: JobId, path: String },
    RequestUploadRevoke { job: JobId, path: String },
    WarcFile { path: String, payload: Vec<u8>, job: JobId },
    WarcFileReceived { job: JobId, path: String },
}

impl Command {
    /// Wire verb, used for logging only.
    pub fn verb(&self) -> &'static str {
        match self {
            Command::AnnounceCrawler { .. } => "ANNOUNCE_CRAWLER",
            Command::AnnounceCrawlerExtra { .. } => "ANNOUNCE_CRAWLER_EXTRA",
            Command::AnnounceStager { .. } => "ANNOUNCE_STAGER",
            Command::AnnounceStagerExtra { .. } => "ANNOUNCE_STAGER_EXTRA",
            Command::Confirmed { .. } => "CONFIRMED",
            Command::AlreadyConfirmed => "ALREADY_CONFIRMED",
            Command::StagerNew { .. } => "STAGER_NEW",
            Command::RequestStager { .. } => "REQUEST_STAGER",
            Command::AddStager { .. } => "ADD_STAGER",
            Command::Ping => "PING",
            Command::Pong => "PONG",
            Command::NewJob { .. } => "NEW_JOB",
            Command::NewJobStager { .. } => "NEW_JOB_STAGER",
            Command::ConfirmedJob { .. } => "CONFIRMED_JOB",
            Command::JobSetCounter { .. } => "JOB_SET_COUNTER",
            Command::NewJobCrawl { .. } => "NEW_JOB_CRAWL",
            Command::JobCrawlConfirmed { .. } => "JOB_CRAWL_CONFIRMED",
            Command::JobStart { .. } => "JOB_START",
            Command::JobStartCrawl { .. } => "JOB_START_CRAWL",
            Command::JobStartedCrawl { .. } => "JOB_STARTED_CRAWL",
            Command::JobStartedStager { .. } => "JOB_STARTED_STAGER",
            Command::JobUrl { .. } => "JOB_URL",
            Command::JobUrlBackup { .. } => "JOB_URL_BACKUP",
            Command::JobUrlCrawl { .. } => "JOB_URL_CRAWL",
            Command::JobUrlFinished { .. } => "JOB_URL_FINISHED",
            Command::JobUrlDiscovered { .. } => "JOB_URL_DISCOVERED",
            Command::RequestUrlQuota { .. } => "REQUEST_URL_QUOTA",
            Command::RequestUrlQuotaCrawler { .. } => "REQUEST_URL_QUOTA_CRAWLER",
            Command::AssignedUrlQuota { .. } => "ASSIGNED_URL_QUOTA",
            Command::AssignedUrlQuotaCrawler { .. } => "ASSIGNED_URL_QUOTA_CRAWLER",
            Command::RequestUploadPermission { .. } => "REQUEST_UPLOAD_PERMISSION",
            Command::UploadPermissionGranted { .. } => "UPLOAD_PERMISSION_GRANTED",
            Command::UploadPermissionDenied { .. } => "UPLOAD_PERMISSION_DENIED",
            Command::RequestUploadRevoke { .. } => "REQUEST_UPLOAD_REVOKE",
            Command::WarcFile { .. } => "WARC_FILE",
            Command::WarcFileReceived { .. } => "WARC_FILE_RECEIVED",
        }
    }
}
