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

//! One worker task per job on a crawler. The node loop feeds it urls and
//! quota; the worker batches urls, launches fetches and reports results back
//! through the crawl-event channel. Failed fetches restore their inputs and
//! quota, so nothing is consumed permanently by a crash of the driver.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::{HashMap, HashSet};
use tokio::sync::mpsc;

use crate::config::CrawlerConfig;
use crate::crawler::fetch::{self, FetchDriver};
use crate::distributed::peer::PeerId;
use crate::job::{JobSettings, UrlConfig, UrlFilter};
use crate::protocol::{Address, JobId};
use crate::random_string;
use crate::urlseen::UrlSeenDb;
use crate::warc::Deduplicator;
use crate::Result;

/// Results flowing from fetch tasks back into the node loop.
#[derive(Debug)]
pub enum CrawlEvent {
    Fetched {
        job: JobId,
        finished: Vec<UrlConfig>,
        discovered: Vec<UrlConfig>,
        warcs: Vec<PathBuf>,
    },
}

#[derive(Debug)]
enum WorkerMsg {
    AddUrl(UrlConfig),
    Start,
    Restore { urls: Vec<UrlConfig>, quota: u64 },
}

/// Launch gate parameters, lifted out of [`CrawlerConfig`].
#[derive(Debug, Clone, Copy)]
pub struct Gate {
    pub min_quota: u64,
    pub max_urls: usize,
    pub max_wait: Duration,
    pub max_wait_urls: Duration,
}

impl Gate {
    pub fn from_config(config: &CrawlerConfig) -> Self {
        Self {
            min_quota: config.min_url_quota,
            max_urls: config.job_max_urls,
            max_wait: Duration::from_secs(config.job_max_wait_secs),
            max_wait_urls: Duration::from_secs(config.job_max_wait_urls_secs),
        }
    }
}

/// A fetch launches only when urls are queued, the quota floor is reached
/// and one of the three staleness conditions holds.
fn gate_open(gate: &Gate, queued: usize, quota: u64, since_fetch: Duration, since_url: Duration) -> bool {
    queued > 0
        && quota >= gate.min_quota
        && (since_fetch > gate.max_wait
            || since_url > gate.max_wait_urls
            || queued >= gate.max_urls)
}

/// Node-side record of a job running on this crawler.
pub struct CrawlerJob {
    pub settings: Arc<JobSettings>,
    pub stagers: Vec<PeerId>,
    pub started: bool,
    url_source: HashMap<UrlConfig, Address>,
    quota: Arc<AtomicU64>,
    seen: UrlSeenDb,
    filter: UrlFilter,
    worker: mpsc::UnboundedSender<WorkerMsg>,
}

impl CrawlerJob {
    pub fn new(
        settings: JobSettings,
        config: &CrawlerConfig,
        events: mpsc::Sender<CrawlEvent>,
    ) -> Result<Self> {
        let settings = Arc::new(settings);
        let filter = UrlFilter::new(&settings)?;
        let seen = UrlSeenDb::open(std::path::Path::new(&config.crawls_dir), &settings.identifier)?;
        let quota = Arc::new(AtomicU64::new(0));

        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let worker = JobWorker {
            job: settings.identifier.clone(),
            quota: Arc::clone(&quota),
            urls: HashSet::new(),
            started: false,
            last_fetch: Instant::now(),
            last_url: Instant::now(),
            gate: Gate::from_config(config),
            crawls_dir: PathBuf::from(&config.crawls_dir),
            driver: Arc::new(FetchDriver::new(config.fetch.clone())),
            dedup: config
                .deduplication_server
                .as_ref()
                .map(|oracle| Arc::new(Deduplicator::new(oracle.clone()))),
            events,
            self_tx: worker_tx.clone(),
        };
        tokio::spawn(worker.run(worker_rx));

        Ok(Self {
            settings,
            stagers: Vec::new(),
            started: false,
            url_source: HashMap::new(),
            quota,
            seen,
            filter,
            worker: worker_tx,
        })
    }

    pub fn add_stager(&mut self, peer: PeerId) {
        if !self.stagers.contains(&peer) {
            self.stagers.push(peer);
        }
    }

    pub fn remove_stager(&mut self, peer: PeerId) {
        self.stagers.retain(|&p| p != peer);
    }

    /// Queues a url for fetching unless it was archived before. The queueing
    /// stager is remembered so the finish event can name it.
    pub fn add_url(&mut self, from: Address, url: UrlConfig) {
        if self.seen.contains(&url.url).unwrap_or(false) {
            tracing::debug!(url = %url.url, "skipping already archived url");
            return;
        }

        self.url_source.insert(url.clone(), from);
        let _ = self.worker.send(WorkerMsg::AddUrl(url));
    }

    pub fn start(&mut self) {
        if !self.started {
            self.started = true;
            let _ = self.worker.send(WorkerMsg::Start);
        }
    }

    pub fn increase_quota(&self, n: u64) {
        self.quota.fetch_add(n, Ordering::Relaxed);
    }

    pub fn quota_balance(&self) -> u64 {
        self.quota.load(Ordering::Relaxed)
    }

    pub fn record_finished(&self, url: &UrlConfig) {
        if let Err(e) = self.seen.insert(url) {
            tracing::warn!(url = %url.url, "failed to record finished url: {e}");
        }
    }

    pub fn take_source(&mut self, url: &UrlConfig) -> Option<Address> {
        self.url_source.remove(url)
    }

    pub fn already_seen(&self, url: &str) -> bool {
        self.seen.contains(url).unwrap_or(false)
    }

    pub fn allowed(&self, url: &UrlConfig) -> bool {
        self.filter.allowed(url)
    }
}

struct JobWorker {
    job: JobId,
    quota: Arc<AtomicU64>,
    urls: HashSet<UrlConfig>,
    started: bool,
    last_fetch: Instant,
    last_url: Instant,
    gate: Gate,
    crawls_dir: PathBuf,
    driver: Arc<FetchDriver>,
    dedup: Option<Arc<Deduplicator>>,
    events: mpsc::Sender<CrawlEvent>,
    self_tx: mpsc::UnboundedSender<WorkerMsg>,
}

impl JobWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<WorkerMsg>) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(WorkerMsg::AddUrl(url)) => {
                        self.last_url = Instant::now();
                        self.urls.insert(url);
                    }
                    Some(WorkerMsg::Start) => {
                        self.started = true;
                    }
                    Some(WorkerMsg::Restore { urls, quota }) => {
                        self.urls.extend(urls);
                        self.quota.fetch_add(quota, Ordering::Relaxed);
                    }
                    None => break,
                },
                _ = tick.tick() => {
                    if self.started {
                        self.maybe_fetch();
                    }
                }
            }
        }
    }

    fn maybe_fetch(&mut self) {
        let quota = self.quota.load(Ordering::Relaxed);
        let now = Instant::now();

        if !gate_open(
            &self.gate,
            self.urls.len(),
            quota,
            now.duration_since(self.last_fetch),
            now.duration_since(self.last_url),
        ) {
            return;
        }

        let take = quota.min(self.urls.len() as u64);
        self.quota.fetch_sub(take, Ordering::Relaxed);
        self.last_fetch = now;

        let batch: Vec<UrlConfig> = {
            let mut batch = Vec::with_capacity(take as usize);
            for _ in 0..take {
                // arbitrary element; HashSet has no pop
                let Some(url) = self.urls.iter().next().cloned() else {
                    break;
                };
                self.urls.remove(&url);
                batch.push(url);
            }
            batch
        };

        let dir = self
            .crawls_dir
            .join(format!("{}_{}", self.job, random_string(10)));

        tracing::info!(job = %self.job, urls = batch.len(), dir = %dir.display(), "starting fetch");

        let job = self.job.clone();
        let driver = Arc::clone(&self.driver);
        let dedup = self.dedup.clone();
        let events = self.events.clone();
        let restore = self.self_tx.clone();

        tokio::spawn(async move {
            let input: Vec<String> = batch.iter().map(|u| u.url.clone()).collect();

            match driver.fetch(&dir, &input).await {
                Ok(Some(pairs)) => {
                    let warcs = process_warcs(&dir, dedup.as_deref()).await;
                    let discovered = discovered_configs(&job, &batch, &pairs);

                    let _ = events
                        .send(CrawlEvent::Fetched {
                            job,
                            finished: batch,
                            discovered,
                            warcs,
                        })
                        .await;
                }
                Ok(None) => {
                    let _ = restore.send(WorkerMsg::Restore {
                        urls: batch,
                        quota: take,
                    });
                }
                Err(e) => {
                    tracing::error!(job = %job, "fetch errored: {e}");
                    let _ = restore.send(WorkerMsg::Restore {
                        urls: batch,
                        quota: take,
                    });
                }
            }
        });
    }
}

/// Rewrites each produced WARC against the dedup oracle when one is
/// configured. The rewritten file replaces the raw one on the upload path;
/// a failed rewrite falls back to uploading the raw file.
async fn process_warcs(dir: &std::path::Path, dedup: Option<&Deduplicator>) -> Vec<PathBuf> {
    let raw = fetch::warc_files(dir);

    let Some(dedup) = dedup else {
        return raw;
    };

    let mut processed = Vec::with_capacity(raw.len());
    for path in raw {
        match dedup.deduplicate(&path).await {
            Ok(out) => processed.push(out),
            Err(e) => {
                tracing::warn!(path = %path.display(), "deduplication failed: {e}");
                processed.push(path);
            }
        }
    }

    processed
}

/// Builds the discovered-url configs for a batch: depth is the parent's
/// depth plus one. Pairs whose parent is not part of the batch are dropped.
fn discovered_configs(
    job: &str,
    batch: &[UrlConfig],
    pairs: &[(String, String)],
) -> Vec<UrlConfig> {
    let depths: HashMap<&str, u64> = batch
        .iter()
        .map(|url| (url.url.as_str(), url.depth))
        .collect();

    pairs
        .iter()
        .filter_map(|(parent, child)| {
            depths.get(parent.as_str()).map(|&depth| UrlConfig {
                job: job.to_string(),
                url: child.clone(),
                depth: depth + 1,
                parent_url: Some(parent.clone()),
            })
        })
        .collect()
}
