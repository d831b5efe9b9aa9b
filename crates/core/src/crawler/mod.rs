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

//! The crawler node. It attaches to stagers, pulls url-quota grants, runs
//! fetch jobs through per-job workers and negotiates WARC uploads back to a
//! stager. All protocol state lives in one task; handlers are synchronous
//! and never block on IO.

pub mod fetch;
pub mod job;
pub mod upload;

use std::time::{Duration, Instant};

use hashbrown::{HashMap, HashSet};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::config::CrawlerConfig;
use crate::distributed::peer::{NetEvent, PeerId, PeerRegistry, PeerRole};
use crate::distributed::retry_strategy::ExponentialBackoff;
use crate::distributed::{self, listen_address};
use crate::protocol::{Address, Command};
use crate::{sample, Result};

use self::job::{CrawlEvent, CrawlerJob};
use self::upload::{UploadAction, UploadManager};

pub async fn run(config: CrawlerConfig) -> Result<()> {
    let bootstrap = match (&config.stager_host, config.stager_port) {
        (Some(host), Some(port)) => Address::new(host.clone(), port),
        _ => anyhow::bail!("a crawler needs --stager-host and --stager-port to join a cluster"),
    };

    let addr = listen_address(config.host.clone(), config.port);
    let listener = TcpListener::bind(("0.0.0.0", addr.port)).await?;
    tracing::info!(%addr, "crawler listening");

    let (net_tx, net_rx) = mpsc::channel(1024);
    let (crawl_tx, crawl_rx) = mpsc::channel(1024);

    let mut node = CrawlerNode {
        addr,
        config,
        peers: PeerRegistry::default(),
        jobs: HashMap::new(),
        uploads: UploadManager::default(),
        pending_dials: HashSet::new(),
        last_stager_request: Instant::now(),
        last_url_quota: Instant::now(),
        net_tx: net_tx.clone(),
        crawl_tx,
    };

    node.pending_dials.insert(bootstrap.clone());
    distributed::peer::dial_with_retry(
        bootstrap,
        net_tx,
        ExponentialBackoff::from_millis(1_000)
            .with_limit(Duration::from_secs(30))
            .take(10),
    );

    node.run(listener, net_rx, crawl_rx).await
}

struct CrawlerNode {
    addr: Address,
    config: CrawlerConfig,
    peers: PeerRegistry,
    jobs: HashMap<String, CrawlerJob>,
    uploads: UploadManager,
    pending_dials: HashSet<Address>,
    last_stager_request: Instant,
    last_url_quota: Instant,
    net_tx: mpsc::Sender<NetEvent>,
    crawl_tx: mpsc::Sender<CrawlEvent>,
}

impl CrawlerNode {
    async fn run(
        &mut self,
        listener: TcpListener,
        mut net_rx: mpsc::Receiver<NetEvent>,
        mut crawl_rx: mpsc::Receiver<CrawlEvent>,
    ) -> Result<()> {
        let mut round = tokio::time::interval(Duration::from_secs(1));
        round.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut ping = tokio::time::interval(Duration::from_secs(self.config.ping_secs));
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    if let Ok((stream, remote)) = accepted {
                        tracing::debug!(?remote, "accepted connection");
                        let _ = stream.set_nodelay(true);
                        self.peers.register(stream, self.net_tx.clone());
                    }
                }
                Some(event) = net_rx.recv() => self.handle_net(event),
                Some(event) = crawl_rx.recv() => self.handle_crawl(event),
                _ = round.tick() => {
                    self.request_stager();
                    self.request_url_quota();
                    self.drive_uploads();
                }
                _ = ping.tick() => self.ping_peers(),
            }
        }
    }

    fn handle_net(&mut self, event: NetEvent) {
        match event {
            NetEvent::Message(peer, command) => self.handle_command(peer, command),
            NetEvent::Closed(peer) => self.remove_peer(peer),
            NetEvent::Dialed(addr, Ok(stream)) => {
                self.pending_dials.remove(&addr);

                // the announce form depends on whether this is the first
                // stager this crawler attaches to
                let extra = !self.peers.with_role(PeerRole::Stager).is_empty();

                let id = self.peers.register(stream, self.net_tx.clone());
                if !self.peers.set_addr(id, addr.clone()) {
                    tracing::warn!(%addr, "dialed stager already connected");
                    self.peers.remove(id);
                    return;
                }
                if let Some(peer) = self.peers.get_mut(id) {
                    peer.role = PeerRole::Stager;
                }

                let announce = if extra {
                    Command::AnnounceCrawlerExtra {
                        addr: self.addr.clone(),
                    }
                } else {
                    Command::AnnounceCrawler {
                        addr: self.addr.clone(),
                    }
                };
                self.peers.send(id, announce);
            }
            NetEvent::Dialed(addr, Err(e)) => {
                self.pending_dials.remove(&addr);
                tracing::warn!(%addr, "dial failed: {e}");
            }
        }
    }

    fn handle_command(&mut self, peer: PeerId, command: Command) {
        tracing::debug!(peer, verb = command.verb(), "received message");

        match command {
            Command::Ping => self.peers.send(peer, Command::Pong),
            Command::Pong => self.handle_pong(peer),
            Command::Confirmed { state } => {
                if let Some(p) = self.peers.get_mut(peer) {
                    if !p.confirmed {
                        p.confirmed = true;
                        if state == 0 {
                            p.send(Command::Confirmed { state: 1 });
                        }
                    }
                }
            }
            Command::AlreadyConfirmed => {
                tracing::debug!(peer, "stager reports we were already attached");
            }
            Command::AddStager { addr } => self.add_stager(addr),
            Command::NewJobCrawl { settings } => {
                let id = settings.identifier.clone();

                if !self.jobs.contains_key(&id) {
                    match CrawlerJob::new(settings, &self.config, self.crawl_tx.clone()) {
                        Ok(job) => {
                            tracing::info!(job = %id, "new job");
                            self.jobs.insert(id.clone(), job);
                        }
                        Err(e) => {
                            tracing::error!(job = %id, "failed to create job: {e}");
                            return;
                        }
                    }
                }

                if let Some(job) = self.jobs.get_mut(&id) {
                    job.add_stager(peer);
                }
                self.peers.send(peer, Command::JobCrawlConfirmed { job: id });
            }
            Command::JobStartCrawl { job } => {
                if let Some(state) = self.jobs.get_mut(&job) {
                    state.start();
                    self.peers.send(peer, Command::JobStartedCrawl { job });
                } else {
                    tracing::warn!(job, "start for unknown job");
                }
            }
            Command::JobUrlCrawl { url } => {
                let Some(from) = self.peers.addr_of(peer) else {
                    tracing::warn!(peer, "url from peer without declared address");
                    return;
                };
                match self.jobs.get_mut(&url.job) {
                    Some(job) => job.add_url(from, url),
                    None => tracing::warn!(job = %url.job, "url for unknown job"),
                }
            }
            Command::AssignedUrlQuota { job, quota } => {
                if let Some(state) = self.jobs.get(&job) {
                    tracing::debug!(job, quota, "received url quota");
                    state.increase_quota(quota);
                }
            }
            Command::UploadPermissionGranted { path, .. } => {
                self.uploads
                    .granted(std::path::Path::new(&path), peer, Instant::now());
            }
            Command::UploadPermissionDenied { path, .. } => {
                self.uploads.denied(std::path::Path::new(&path));
            }
            Command::WarcFileReceived { job, path } => {
                tracing::info!(job, path, "warc upload confirmed");
                self.uploads.received(&job, std::path::Path::new(&path));
            }
            other => {
                tracing::warn!(peer, verb = other.verb(), "dropping unexpected message");
            }
        }
    }

    fn handle_pong(&mut self, peer: PeerId) {
        if let Some(p) = self.peers.get_mut(peer) {
            if !p.pong_received {
                p.pong_received = true;
            } else {
                // pong without a pending ping; treat it as a nudge to
                // restart the ping cycle for this peer
                p.pong_received = false;
                p.send(Command::Ping);
            }
        }
    }

    fn handle_crawl(&mut self, event: CrawlEvent) {
        let CrawlEvent::Fetched {
            job: job_id,
            finished,
            discovered,
            warcs,
        } = event;

        let Some(job) = self.jobs.get_mut(&job_id) else {
            tracing::warn!(job = %job_id, "fetch result for unknown job");
            return;
        };

        for warc in warcs {
            self.uploads.add_file(job_id.clone(), warc);
        }

        let stagers = job.stagers.clone();

        for url in finished {
            job.record_finished(&url);

            let Some(queued_by) = job.take_source(&url) else {
                tracing::warn!(url = %url.url, "finished url without recorded source");
                continue;
            };

            for &stager in &stagers {
                self.peers.send(
                    stager,
                    Command::JobUrlFinished {
                        job: job_id.clone(),
                        url: url.url.clone(),
                        queued_by: queued_by.clone(),
                    },
                );
            }
        }

        for url in discovered {
            if job.already_seen(&url.url) || !job.allowed(&url) {
                continue;
            }

            if let Some(&stager) = sample(&stagers, 1).first() {
                self.peers.send(stager, Command::JobUrlDiscovered { url });
            }
        }
    }

    fn remove_peer(&mut self, peer: PeerId) {
        if self.peers.remove(peer).is_some() {
            tracing::info!(peer, "peer disconnected");
        }

        for job in self.jobs.values_mut() {
            job.remove_stager(peer);
        }
    }

    fn add_stager(&mut self, addr: Address) {
        if addr == self.addr
            || self.peers.id_by_addr(&addr).is_some()
            || self.pending_dials.contains(&addr)
        {
            return;
        }
        if self.peers.with_role(PeerRole::Stager).len() >= self.config.max_stager {
            return;
        }

        self.pending_dials.insert(addr.clone());
        distributed::peer::dial(addr, self.net_tx.clone());
    }

    /// Tops the stager set back up to the bound, at most once per
    /// request-stager window.
    fn request_stager(&mut self) {
        let stagers = self.peers.with_role(PeerRole::Stager);
        let needed = self.config.max_stager.saturating_sub(stagers.len());

        if needed == 0
            || stagers.is_empty()
            || self.last_stager_request.elapsed()
                < Duration::from_secs(self.config.request_stager_secs)
        {
            return;
        }

        let known = self.peers.addrs_with_role(PeerRole::Stager);
        if let Some(&target) = sample(&stagers, 1).first() {
            self.peers
                .send(target, Command::RequestStager { needed, known });
            self.last_stager_request = Instant::now();
        }
    }

    /// Asks a random stager of the most starved job for more quota.
    fn request_url_quota(&mut self) {
        if self.last_url_quota.elapsed() < Duration::from_secs(self.config.url_quota_secs) {
            return;
        }
        self.last_url_quota = Instant::now();

        let Some((job_id, job)) = self
            .jobs
            .iter()
            .filter(|(_, job)| job.started && !job.stagers.is_empty())
            .min_by_key(|(_, job)| job.quota_balance())
        else {
            return;
        };

        if let Some(&stager) = sample(&job.stagers, 1).first() {
            self.peers.send(
                stager,
                Command::RequestUrlQuota {
                    job: job_id.clone(),
                },
            );
        }
    }

    fn drive_uploads(&mut self) {
        let window = Duration::from_secs(self.config.request_upload_secs);

        for action in self.uploads.tick(Instant::now(), window) {
            match action {
                UploadAction::Request {
                    job,
                    path,
                    filesize,
                } => {
                    let Some(state) = self.jobs.get(&job) else {
                        continue;
                    };
                    for &stager in &state.stagers {
                        self.peers.send(
                            stager,
                            Command::RequestUploadPermission {
                                job: job.clone(),
                                path: path.display().to_string(),
                                filesize,
                            },
                        );
                    }
                }
                UploadAction::Revoke { job, path, peers } => {
                    for peer in peers {
                        self.peers.send(
                            peer,
                            Command::RequestUploadRevoke {
                                job: job.clone(),
                                path: path.display().to_string(),
                            },
                        );
                    }
                }
                UploadAction::Transfer { job, path, to } => {
                    // the link is monopolized for the duration of the frame,
                    // which is what keeps a transfer atomic per link
                    match std::fs::read(&path) {
                        Ok(payload) => {
                            tracing::info!(
                                job,
                                path = %path.display(),
                                bytes = payload.len(),
                                "transferring warc"
                            );
                            self.peers.send(
                                to,
                                Command::WarcFile {
                                    path: path.display().to_string(),
                                    payload,
                                    job,
                                },
                            );
                        }
                        Err(e) => {
                            tracing::error!(path = %path.display(), "failed to read warc: {e}");
                            let _ = std::fs::remove_file(upload::sentinel_path(&path));
                        }
                    }
                }
            }
        }
    }

    fn ping_peers(&mut self) {
        let ids: Vec<PeerId> = self.peers.iter().map(|p| p.id).collect();
        for id in ids {
            if let Some(peer) = self.peers.get_mut(id) {
                peer.pong_received = false;
                peer.send(Command::Ping);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::frame;
    use crate::job::JobSettings;

    async fn expect_command(
        stream: &mut tokio::net::TcpStream,
        pred: impl Fn(&Command) -> bool,
    ) -> Command {
        loop {
            let command = tokio::time::timeout(Duration::from_secs(10), frame::read(stream))
                .await
                .expect("timed out waiting for command")
                .expect("link closed");
            if pred(&command) {
                return command;
            }
        }
    }

    #[tokio::test]
    async fn crawler_announces_confirms_and_accepts_jobs() {
        let stager_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stager_addr = stager_listener.local_addr().unwrap();

        let crawls = tempfile::tempdir().unwrap();
        let port = crate::free_socket_addr().port();
        let config = CrawlerConfig {
            host: Some("127.0.0.1".to_string()),
            port: Some(port),
            stager_host: Some("127.0.0.1".to_string()),
            stager_port: Some(stager_addr.port()),
            crawls_dir: crawls.path().display().to_string(),
            ..CrawlerConfig::default()
        };

        tokio::spawn(async move {
            let _ = run(config).await;
        });

        let (mut link, _) = stager_listener.accept().await.unwrap();

        // handshake: announce, confirm both ways
        let announced =
            expect_command(&mut link, |c| matches!(c, Command::AnnounceCrawler { .. })).await;
        match announced {
            Command::AnnounceCrawler { addr } => assert_eq!(addr, Address::new("127.0.0.1", port)),
            _ => unreachable!(),
        }
        frame::write(&mut link, &Command::Confirmed { state: 0 })
            .await
            .unwrap();
        expect_command(&mut link, |c| matches!(c, Command::Confirmed { state: 1 })).await;

        // job replication and start barrier
        let settings = JobSettings::new(
            "demo",
            vec!["https://a/".to_string()],
            vec![".*".to_string()],
            vec![],
            10,
            2,
        )
        .unwrap();
        let job = settings.identifier.clone();

        frame::write(&mut link, &Command::NewJobCrawl { settings })
            .await
            .unwrap();
        let confirmed = expect_command(&mut link, |c| {
            matches!(c, Command::JobCrawlConfirmed { .. })
        })
        .await;
        assert_eq!(
            confirmed,
            Command::JobCrawlConfirmed { job: job.clone() }
        );

        frame::write(&mut link, &Command::JobStartCrawl { job: job.clone() })
            .await
            .unwrap();
        let started =
            expect_command(&mut link, |c| matches!(c, Command::JobStartedCrawl { .. })).await;
        assert_eq!(started, Command::JobStartedCrawl { job });
    }

    #[tokio::test]
    async fn crawler_answers_ping_with_pong() {
        let stager_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stager_addr = stager_listener.local_addr().unwrap();

        let crawls = tempfile::tempdir().unwrap();
        let config = CrawlerConfig {
            host: Some("127.0.0.1".to_string()),
            port: Some(crate::free_socket_addr().port()),
            stager_host: Some("127.0.0.1".to_string()),
            stager_port: Some(stager_addr.port()),
            crawls_dir: crawls.path().display().to_string(),
            ..CrawlerConfig::default()
        };

        tokio::spawn(async move {
            let _ = run(config).await;
        });

        let (mut link, _) = stager_listener.accept().await.unwrap();
        expect_command(&mut link, |c| matches!(c, Command::AnnounceCrawler { .. })).await;

        frame::write(&mut link, &Command::Ping).await.unwrap();
        expect_command(&mut link, |c| matches!(c, Command::Pong)).await;
    }
}
