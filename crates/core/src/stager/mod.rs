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

//! The stager node. It holds the authoritative frontier slice for every job
//! it co-owns, assigns urls to crawlers, mirrors slices onto peer stagers as
//! backups, runs the url-quota counter when elected, grants WARC uploads
//! against its space budget and gossips cluster membership.

pub mod job;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::config::StagerConfig;
use crate::distributed::peer::{self, NetEvent, PeerId, PeerRegistry, PeerRole};
use crate::distributed::retry_strategy::ExponentialBackoff;
use crate::distributed::listen_address;
use crate::job::{ingest, JobSettings, UrlConfig};
use crate::protocol::{Address, Command, JobId};
use crate::{sample, write_file, Result};

use self::job::{Counter, Share, ShareTarget, StagerJob};

pub async fn run(config: StagerConfig) -> Result<()> {
    let addr = listen_address(config.host.clone(), config.port);
    let listener = TcpListener::bind(("0.0.0.0", addr.port)).await?;
    tracing::info!(%addr, "stager listening");

    let (net_tx, net_rx) = mpsc::channel(1024);
    let (ingest_tx, ingest_rx) = mpsc::channel(64);

    spawn_ingest_scan(
        PathBuf::from(&config.jobs_dir),
        Duration::from_secs(config.new_jobs_scan_secs),
        ingest_tx,
    );

    let mut node = StagerNode {
        addr,
        config,
        peers: PeerRegistry::default(),
        jobs: HashMap::new(),
        used_space: 0,
        uploading: HashMap::new(),
        pending_dials: HashMap::new(),
        net_tx: net_tx.clone(),
    };

    if let (Some(host), Some(port)) = (&node.config.stager_host, node.config.stager_port) {
        let bootstrap = Address::new(host.clone(), port);
        node.pending_dials
            .insert(bootstrap.clone(), DialIntent::default());
        peer::dial_with_retry(
            bootstrap,
            net_tx,
            ExponentialBackoff::from_millis(1_000)
                .with_limit(Duration::from_secs(30))
                .take(10),
        );
    }

    node.run(listener, net_rx, ingest_rx).await
}

/// Scans the new-jobs directory on a fixed cadence and feeds loaded
/// definitions into the node loop.
fn spawn_ingest_scan(dir: PathBuf, every: Duration, jobs: mpsc::Sender<JobSettings>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(every).await;
            for settings in ingest::scan_new_jobs(&dir) {
                if jobs.send(settings).await.is_err() {
                    return;
                }
            }
        }
    });
}

/// What to do with a peer once an async dial completes: which announce form
/// to use and which jobs it has to be attached to.
#[derive(Default)]
struct DialIntent {
    extra: bool,
    jobs: Vec<JobId>,
}

struct StagerNode {
    addr: Address,
    config: StagerConfig,
    peers: PeerRegistry,
    jobs: HashMap<JobId, StagerJob>,
    used_space: u64,
    /// Reserved upload space by WARC path.
    uploading: HashMap<String, u64>,
    pending_dials: HashMap<Address, DialIntent>,
    net_tx: mpsc::Sender<NetEvent>,
}

impl StagerNode {
    async fn run(
        &mut self,
        listener: TcpListener,
        mut net_rx: mpsc::Receiver<NetEvent>,
        mut ingest_rx: mpsc::Receiver<JobSettings>,
    ) -> Result<()> {
        let mut jobs_check =
            tokio::time::interval(Duration::from_secs(self.config.jobs_check_secs));
        jobs_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
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
                Some(settings) = ingest_rx.recv() => self.create_job(settings, true, None),
                _ = jobs_check.tick() => {
                    self.start_ready_jobs();
                    self.share_job_urls();
                }
                _ = ping.tick() => self.ping_peers(),
            }
        }
    }

    fn handle_net(&mut self, event: NetEvent) {
        match event {
            NetEvent::Message(peer, command) => self.handle_command(peer, command),
            NetEvent::Closed(peer) => self.remove_peer(peer),
            NetEvent::Dialed(addr, Ok(stream)) => self.finish_dial(addr, stream),
            NetEvent::Dialed(addr, Err(e)) => {
                self.pending_dials.remove(&addr);
                tracing::warn!(%addr, "dial failed: {e}");
            }
        }
    }

    fn finish_dial(&mut self, addr: Address, stream: tokio::net::TcpStream) {
        let intent = self.pending_dials.remove(&addr).unwrap_or_default();

        let id = self.peers.register(stream, self.net_tx.clone());
        if !self.peers.set_addr(id, addr.clone()) {
            tracing::warn!(%addr, "dialed stager already connected");
            self.peers.remove(id);
            return;
        }
        if let Some(peer) = self.peers.get_mut(id) {
            peer.role = PeerRole::Stager;
        }

        let announce = if intent.extra {
            Command::AnnounceStagerExtra {
                addr: self.addr.clone(),
            }
        } else {
            Command::AnnounceStager {
                addr: self.addr.clone(),
            }
        };
        self.peers.send(id, announce);

        for job_id in intent.jobs {
            if let Some(job) = self.jobs.get_mut(&job_id) {
                job.add_stager(id);
                self.peers.send(
                    id,
                    Command::ConfirmedJob {
                        state: 0,
                        job: job_id,
                    },
                );
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
            Command::AnnounceCrawler { addr } | Command::AnnounceCrawlerExtra { addr } => {
                self.announce_crawler(peer, addr)
            }
            Command::AnnounceStager { addr } => self.announce_stager(peer, addr, false),
            Command::AnnounceStagerExtra { addr } => self.announce_stager(peer, addr, true),
            Command::StagerNew { addr } => self.connect_stager(addr),
            Command::RequestStager { needed, known } => {
                let stagers = self.peers.with_role(PeerRole::Stager);
                for candidate in sample(&stagers, needed) {
                    if let Some(addr) = self.peers.addr_of(candidate) {
                        if !known.contains(&addr) {
                            self.peers.send(peer, Command::AddStager { addr });
                        }
                    }
                }
            }

            Command::NewJob { settings } => {
                self.create_job(settings, false, Some(peer));
            }
            Command::NewJobStager {
                job,
                initial_owner,
                peers,
            } => self.attach_job_stagers(job, initial_owner, peers),
            Command::ConfirmedJob { state, job } => self.confirmed_job(peer, state, job),
            Command::JobSetCounter { job, counter } => {
                let Some(state) = self.jobs.get_mut(&job) else {
                    tracing::warn!(job, "counter for unknown job");
                    return;
                };
                if counter == self.addr {
                    tracing::info!(job, "elected as url-quota counter");
                    state.set_as_counter(Instant::now());
                } else if let Some(id) = self.peers.id_by_addr(&counter) {
                    state.set_counter_peer(id);
                } else {
                    tracing::warn!(job, %counter, "counter address is not a known peer");
                }
            }
            Command::JobCrawlConfirmed { job } => {
                if let Some(state) = self.jobs.get_mut(&job) {
                    state.crawler_confirmed(peer);
                }
            }
            Command::JobStart { job } => {
                let Some(state) = self.jobs.get(&job) else {
                    tracing::warn!(job, "start for unknown job");
                    return;
                };
                for &crawler in state.crawlers.keys() {
                    self.peers
                        .send(crawler, Command::JobStartCrawl { job: job.clone() });
                }
            }
            Command::JobStartedCrawl { job } => {
                let Some(state) = self.jobs.get_mut(&job) else {
                    return;
                };
                state.crawler_started(peer);
                if state.all_local_crawlers_started() {
                    for &stager in state.stagers.keys() {
                        self.peers
                            .send(stager, Command::JobStartedStager { job: job.clone() });
                    }
                }
            }
            Command::JobStartedStager { job } => {
                if let Some(state) = self.jobs.get_mut(&job) {
                    state.stager_started(peer);
                }
            }

            Command::JobUrl { url } => self.dispatch_url(url),
            Command::JobUrlBackup { url, owner } => {
                match self.jobs.get_mut(&url.job) {
                    Some(state) => state.backup_url(owner, url),
                    None => tracing::warn!(job = %url.job, "backup url for unknown job"),
                }
            }
            Command::JobUrlFinished {
                job,
                url,
                queued_by,
            } => {
                let Some(state) = self.jobs.get_mut(&job) else {
                    return;
                };
                state.finish_url(peer, &url, &queued_by, &self.addr);
            }
            Command::JobUrlDiscovered { url } => {
                match self.jobs.get_mut(&url.job) {
                    Some(state) => state.add_url(url),
                    None => tracing::warn!(job = %url.job, "discovered url for unknown job"),
                }
            }

            Command::RequestUrlQuota { job } => self.request_url_quota(peer, job),
            Command::RequestUrlQuotaCrawler { job, crawler } => {
                let Some(state) = self.jobs.get_mut(&job) else {
                    return;
                };
                let quota = state.grant_quota(Instant::now());
                self.peers.send(
                    peer,
                    Command::AssignedUrlQuotaCrawler {
                        job,
                        quota,
                        crawler,
                    },
                );
            }
            Command::AssignedUrlQuotaCrawler {
                job,
                quota,
                crawler,
            } => {
                // relay leg: route the grant back to the crawler that asked
                match self.peers.id_by_addr(&crawler) {
                    Some(id) => self
                        .peers
                        .send(id, Command::AssignedUrlQuota { job, quota }),
                    None => tracing::warn!(%crawler, "quota for unknown crawler"),
                }
            }

            Command::RequestUploadPermission {
                job,
                path,
                filesize,
            } => {
                if self.free_space() >= filesize {
                    self.uploading.insert(path.clone(), filesize);
                    self.used_space += filesize;
                    self.peers
                        .send(peer, Command::UploadPermissionGranted { job, path });
                } else {
                    self.peers
                        .send(peer, Command::UploadPermissionDenied { job, path });
                }
            }
            Command::RequestUploadRevoke { path, .. } => {
                if let Some(size) = self.uploading.remove(&path) {
                    self.used_space = self.used_space.saturating_sub(size);
                }
            }
            Command::WarcFile { path, payload, job } => self.receive_warc(peer, job, path, payload),

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
                p.pong_received = false;
                p.send(Command::Ping);
            }
        }
    }

    fn announce_crawler(&mut self, peer: PeerId, addr: Address) {
        if !self.peers.set_addr(peer, addr.clone()) {
            self.peers.send(peer, Command::AlreadyConfirmed);
            return;
        }
        if let Some(p) = self.peers.get_mut(peer) {
            p.role = PeerRole::Crawler;
        }
        tracing::info!(%addr, "crawler attached");
        self.peers.send(peer, Command::Confirmed { state: 0 });
    }

    fn announce_stager(&mut self, peer: PeerId, addr: Address, extra: bool) {
        let newly = self.peers.set_addr(peer, addr.clone());
        if let Some(p) = self.peers.get_mut(peer) {
            p.role = PeerRole::Stager;
        }

        // only the initial announce triggers gossip, which bounds the
        // fanout to one round per link
        if newly && !extra {
            let others: Vec<Address> = self
                .peers
                .iter()
                .filter(|p| p.role == PeerRole::Stager && p.id != peer)
                .filter_map(|p| p.addr.clone())
                .collect();
            for other in others {
                self.peers.send(peer, Command::StagerNew { addr: other });
            }
        }

        tracing::info!(%addr, "stager attached");
        self.peers.send(peer, Command::Confirmed { state: 0 });
    }

    /// Dials a gossiped stager if it is genuinely new.
    fn connect_stager(&mut self, addr: Address) {
        if addr == self.addr
            || self.peers.id_by_addr(&addr).is_some()
            || self.pending_dials.contains_key(&addr)
        {
            return;
        }

        self.pending_dials.insert(
            addr.clone(),
            DialIntent {
                extra: true,
                jobs: Vec::new(),
            },
        );
        peer::dial(addr, self.net_tx.clone());
    }

    fn create_job(&mut self, settings: JobSettings, initial: bool, initial_owner: Option<PeerId>) {
        let id = settings.identifier.clone();
        if self.jobs.contains_key(&id) {
            tracing::warn!(job = %id, "job already exists");
            return;
        }

        tracing::info!(job = %id, initial, "creating job");
        self.jobs
            .insert(id.clone(), StagerJob::new(settings, initial, initial_owner));

        if initial {
            self.replicate_job(&id);
        }
        self.attach_crawlers(&id);
    }

    /// Picks co-owner stagers for a fresh job, replicates the settings to
    /// them, tells every co-owner about the full membership and elects the
    /// url-quota counter.
    fn replicate_job(&mut self, id: &JobId) {
        let Some(job) = self.jobs.get_mut(id) else {
            return;
        };

        let candidates = self.peers.with_role(PeerRole::Stager);
        let wanted = self.config.max_stager.saturating_sub(job.stagers.len());
        let chosen = sample(&candidates, wanted);

        for &peer in &chosen {
            job.add_stager(peer);
            self.peers.send(
                peer,
                Command::NewJob {
                    settings: (*job.settings).clone(),
                },
            );
        }

        let co_owners: Vec<(PeerId, Address)> = job
            .stagers
            .keys()
            .filter_map(|&p| self.peers.addr_of(p).map(|a| (p, a)))
            .collect();

        for &(peer, _) in &co_owners {
            let others: Vec<Address> = co_owners
                .iter()
                .filter(|&&(p, _)| p != peer)
                .map(|(_, a)| a.clone())
                .collect();
            self.peers.send(
                peer,
                Command::NewJobStager {
                    job: id.clone(),
                    initial_owner: self.addr.clone(),
                    peers: others,
                },
            );
        }

        // counter election: uniform over this stager and the co-owners
        let mut counter_candidates: Vec<Option<(PeerId, Address)>> = vec![None];
        counter_candidates.extend(co_owners.iter().cloned().map(Some));
        let elected = sample(&counter_candidates, 1).pop().flatten();

        let counter_addr = match &elected {
            Some((_, addr)) => addr.clone(),
            None => self.addr.clone(),
        };
        match elected {
            Some((peer, _)) => job.set_counter_peer(peer),
            None => job.set_as_counter(Instant::now()),
        }
        tracing::info!(job = %id, counter = %counter_addr, "elected url-quota counter");

        for &(peer, _) in &co_owners {
            self.peers.send(
                peer,
                Command::JobSetCounter {
                    job: id.clone(),
                    counter: counter_addr.clone(),
                },
            );
        }
    }

    /// Announces the job to every attached crawler.
    fn attach_crawlers(&mut self, id: &JobId) {
        let Some(job) = self.jobs.get_mut(id) else {
            return;
        };

        for crawler in self.peers.with_role(PeerRole::Crawler) {
            job.add_crawler(crawler);
            self.peers.send(
                crawler,
                Command::NewJobCrawl {
                    settings: (*job.settings).clone(),
                },
            );
        }
    }

    /// A co-owner learned the job's full membership: connect to every listed
    /// stager (dialing the unknown ones) and confirm towards the ones that
    /// are already reachable.
    fn attach_job_stagers(&mut self, id: JobId, initial_owner: Address, listed: Vec<Address>) {
        if !self.jobs.contains_key(&id) {
            tracing::warn!(job = %id, "membership for unknown job");
            return;
        }

        for addr in std::iter::once(initial_owner).chain(listed) {
            if addr == self.addr {
                continue;
            }

            match self.peers.id_by_addr(&addr) {
                Some(peer) => {
                    if let Some(job) = self.jobs.get_mut(&id) {
                        job.add_stager(peer);
                    }
                }
                None => match self.pending_dials.get_mut(&addr) {
                    Some(intent) => intent.jobs.push(id.clone()),
                    None => {
                        self.pending_dials.insert(
                            addr.clone(),
                            DialIntent {
                                extra: true,
                                jobs: vec![id.clone()],
                            },
                        );
                        peer::dial(addr, self.net_tx.clone());
                    }
                },
            }
        }

        if let Some(job) = self.jobs.get(&id) {
            for &peer in job.stagers.keys() {
                self.peers.send(
                    peer,
                    Command::ConfirmedJob {
                        state: 0,
                        job: id.clone(),
                    },
                );
            }
        }
    }

    fn confirmed_job(&mut self, peer: PeerId, state: i8, id: JobId) {
        if state == -1 {
            tracing::warn!(job = %id, peer, "co-owner does not know the job yet");
            return;
        }

        let Some(job) = self.jobs.get_mut(&id) else {
            self.peers
                .send(peer, Command::ConfirmedJob { state: -1, job: id });
            return;
        };

        if let Some(reply) = job.confirm_stager(peer, state) {
            self.peers.send(
                peer,
                Command::ConfirmedJob {
                    state: reply,
                    job: id,
                },
            );
        }
    }

    /// Start barrier: the initial owner waits for every co-owner to confirm,
    /// then starts the job everywhere, its own crawlers included.
    fn start_ready_jobs(&mut self) {
        let ready: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|(_, job)| {
                job.is_initial_owner && !job.start_sent && job.all_stagers_confirmed()
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in ready {
            tracing::info!(job = %id, "starting job");

            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            job.start_sent = true;

            for &stager in job.stagers.keys() {
                self.peers
                    .send(stager, Command::JobStart { job: id.clone() });
            }
            for &crawler in job.crawlers.keys() {
                self.peers
                    .send(crawler, Command::JobStartCrawl { job: id.clone() });
            }
        }
    }

    /// The periodic frontier pass: each job's discovered urls are split into
    /// slices and placed, with backup copies mirrored to peers.
    fn share_job_urls(&mut self) {
        let ids: Vec<JobId> = self.jobs.keys().cloned().collect();

        for id in ids {
            let shares = {
                let Some(job) = self.jobs.get_mut(&id) else {
                    continue;
                };
                // without a local crawler the local slice has nowhere to go;
                // hold the frontier until one attaches
                if job.crawlers.is_empty() {
                    continue;
                }
                job.share_urls(self.config.max_backups)
            };

            for share in shares {
                self.place_share(&id, share);
            }
        }
    }

    fn place_share(&mut self, id: &JobId, share: Share) {
        let Share {
            url,
            owner,
            backups,
        } = share;

        let owner_addr = match owner {
            ShareTarget::Local => self.addr.clone(),
            ShareTarget::Peer(peer) => match self.peers.addr_of(peer) {
                Some(addr) => addr,
                None => {
                    // the co-owner vanished between slicing and placement
                    if let Some(job) = self.jobs.get_mut(id) {
                        job.add_url(url);
                    }
                    return;
                }
            },
        };

        match owner {
            ShareTarget::Local => self.dispatch_url(url.clone()),
            ShareTarget::Peer(peer) => {
                self.peers.send(peer, Command::JobUrl { url: url.clone() });
            }
        }

        for backup in backups {
            match backup {
                ShareTarget::Local => {
                    if let Some(job) = self.jobs.get_mut(id) {
                        job.backup_url(owner_addr.clone(), url.clone());
                    }
                }
                ShareTarget::Peer(peer) => {
                    self.peers.send(
                        peer,
                        Command::JobUrlBackup {
                            url: url.clone(),
                            owner: owner_addr.clone(),
                        },
                    );
                }
            }
        }
    }

    /// Hands a url owned by this stager to one of its crawlers at random.
    fn dispatch_url(&mut self, url: UrlConfig) {
        let Some(job) = self.jobs.get_mut(&url.job) else {
            tracing::warn!(job = %url.job, "url for unknown job");
            return;
        };

        let crawlers: Vec<PeerId> = job.crawlers.keys().copied().collect();
        let Some(&crawler) = sample(&crawlers, 1).first() else {
            // no crawler attached; keep the url in the frontier
            job.add_url(url);
            return;
        };

        job.assign_url(crawler, url.clone());
        self.peers.send(crawler, Command::JobUrlCrawl { url });
    }

    fn request_url_quota(&mut self, peer: PeerId, id: JobId) {
        let Some(job) = self.jobs.get_mut(&id) else {
            tracing::warn!(job = %id, "quota request for unknown job");
            return;
        };

        if job.is_counter() {
            let quota = job.grant_quota(Instant::now());
            self.peers
                .send(peer, Command::AssignedUrlQuota { job: id, quota });
            return;
        }

        let Some(crawler) = self.peers.addr_of(peer) else {
            tracing::warn!(peer, "quota request from peer without address");
            return;
        };

        match job.counter {
            Counter::Peer(counter) => {
                self.peers.send(
                    counter,
                    Command::RequestUrlQuotaCrawler { job: id, crawler },
                );
            }
            _ => tracing::warn!(job = %id, "no counter elected yet"),
        }
    }

    /// Stores a received WARC under `warc/<job>/<basename>` and confirms.
    fn receive_warc(&mut self, peer: PeerId, job: JobId, path: String, payload: Vec<u8>) {
        if !self.jobs.contains_key(&job) {
            tracing::warn!(job, "warc for unknown job");
            return;
        }

        let Some(basename) = Path::new(&path).file_name() else {
            tracing::warn!(path, "warc path without file name");
            return;
        };
        let dest = Path::new(&self.config.warc_dir).join(&job).join(basename);

        match write_file(&dest, &payload) {
            Ok(()) => {
                tracing::info!(job, path = %dest.display(), bytes = payload.len(), "stored warc");
                self.peers
                    .send(peer, Command::WarcFileReceived { job, path });
            }
            Err(e) => {
                tracing::error!(job, path = %dest.display(), "failed to store warc: {e}");
            }
        }
    }

    fn free_space(&self) -> u64 {
        self.config.max_space.saturating_sub(self.used_space)
    }

    /// Repairs cluster state after a link died: crawler assignments return
    /// to the frontier, backup slices held for a dead co-owner are promoted
    /// and a dead counter is deterministically re-elected.
    fn remove_peer(&mut self, peer: PeerId) {
        let Some(removed) = self.peers.remove(peer) else {
            return;
        };
        tracing::info!(peer, addr = ?removed.addr, "peer disconnected");

        let own_addr = self.addr.clone();
        let mut counter_broadcasts: Vec<(JobId, Address, Vec<PeerId>)> = Vec::new();

        for (id, job) in self.jobs.iter_mut() {
            if let Some(state) = job.crawlers.remove(&peer) {
                for url in state.urls {
                    if let Some(config) = job.current_urls.remove(&url) {
                        job.add_url(config);
                    }
                }
            }

            if job.stagers.remove(&peer).is_some() {
                if let Some(dead_addr) = &removed.addr {
                    if let Some(slot) = job.backup.remove(dead_addr) {
                        // auto-promotion: the owner is gone, its mirrored
                        // slice re-enters our frontier
                        tracing::info!(
                            job = %id,
                            owner = %dead_addr,
                            urls = slot.len(),
                            "promoting backup slice"
                        );
                        for (_, url) in slot {
                            job.add_url(url);
                        }
                    }
                }

                if matches!(job.counter, Counter::Peer(p) if p == peer) {
                    // deterministic re-election: lowest surviving address
                    // takes the counter role
                    let mut survivors: Vec<(Option<PeerId>, Address)> =
                        vec![(None, own_addr.clone())];
                    for &p in job.stagers.keys() {
                        if let Some(addr) = self.peers.addr_of(p) {
                            survivors.push((Some(p), addr));
                        }
                    }
                    survivors.sort_by(|a, b| a.1.cmp(&b.1));

                    match survivors.first() {
                        Some((None, _)) => {
                            tracing::info!(job = %id, "taking over as url-quota counter");
                            job.set_as_counter(Instant::now());
                            counter_broadcasts.push((
                                id.clone(),
                                own_addr.clone(),
                                job.stagers.keys().copied().collect(),
                            ));
                        }
                        Some((Some(p), _)) => job.set_counter_peer(*p),
                        None => {}
                    }
                }
            }

            if job.initial_owner == Some(peer) {
                job.initial_owner = None;
            }
        }

        for (id, counter, stagers) in counter_broadcasts {
            for stager in stagers {
                self.peers.send(
                    stager,
                    Command::JobSetCounter {
                        job: id.clone(),
                        counter: counter.clone(),
                    },
                );
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

    async fn expect_command(
        stream: &mut tokio::net::TcpStream,
        pred: impl Fn(&Command) -> bool,
    ) -> Command {
        loop {
            let command = tokio::time::timeout(Duration::from_secs(15), frame::read(stream))
                .await
                .expect("timed out waiting for command")
                .expect("link closed");
            if pred(&command) {
                return command;
            }
        }
    }

    struct TestStager {
        addr: Address,
        _jobs_dir: tempfile::TempDir,
        jobs_dir: PathBuf,
        _warc_dir: tempfile::TempDir,
        warc_dir: PathBuf,
    }

    fn spawn_stager(max_space: u64) -> TestStager {
        let jobs_tmp = tempfile::tempdir().unwrap();
        let warc_tmp = tempfile::tempdir().unwrap();
        let port = crate::free_socket_addr().port();

        let config = StagerConfig {
            host: Some("127.0.0.1".to_string()),
            port: Some(port),
            max_space,
            jobs_check_secs: 1,
            new_jobs_scan_secs: 1,
            jobs_dir: jobs_tmp.path().display().to_string(),
            warc_dir: warc_tmp.path().join("warc").display().to_string(),
            ..StagerConfig::default()
        };

        let jobs_dir = jobs_tmp.path().to_path_buf();
        let warc_dir = warc_tmp.path().join("warc");

        tokio::spawn(async move {
            let _ = run(config).await;
        });

        TestStager {
            addr: Address::new("127.0.0.1", port),
            _jobs_dir: jobs_tmp,
            jobs_dir,
            _warc_dir: warc_tmp,
            warc_dir,
        }
    }

    async fn connect(addr: &Address) -> tokio::net::TcpStream {
        for _ in 0..50 {
            if let Ok(stream) =
                tokio::net::TcpStream::connect((addr.host.as_str(), addr.port)).await
            {
                return stream;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("stager did not come up");
    }

    async fn attach_crawler(stager: &Address, own: Address) -> tokio::net::TcpStream {
        let mut link = connect(stager).await;
        frame::write(&mut link, &Command::AnnounceCrawler { addr: own })
            .await
            .unwrap();
        expect_command(&mut link, |c| matches!(c, Command::Confirmed { state: 0 })).await;
        frame::write(&mut link, &Command::Confirmed { state: 1 })
            .await
            .unwrap();
        link
    }

    fn demo_settings() -> JobSettings {
        JobSettings::new(
            "demo",
            vec!["https://a/".to_string()],
            vec![".*".to_string()],
            vec![],
            10,
            2,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn job_flows_from_drop_dir_to_crawler() {
        let stager = spawn_stager(1_000_000);
        let mut link = attach_crawler(&stager.addr, Address::new("127.0.0.1", 3100)).await;

        let settings = demo_settings();
        let job = settings.identifier.clone();
        ingest::write_job_file(&settings, &stager.jobs_dir).unwrap();

        // the scan loop picks the job up and announces it to the crawler
        let new_job =
            expect_command(&mut link, |c| matches!(c, Command::NewJobCrawl { .. })).await;
        match new_job {
            Command::NewJobCrawl { settings: got } => assert_eq!(got, settings),
            _ => unreachable!(),
        }
        frame::write(&mut link, &Command::JobCrawlConfirmed { job: job.clone() })
            .await
            .unwrap();

        // no co-owners: the start barrier opens immediately
        expect_command(&mut link, |c| matches!(c, Command::JobStartCrawl { .. })).await;
        frame::write(&mut link, &Command::JobStartedCrawl { job: job.clone() })
            .await
            .unwrap();

        // the share pass hands the seed url to the only crawler
        let shared = expect_command(&mut link, |c| matches!(c, Command::JobUrlCrawl { .. })).await;
        match shared {
            Command::JobUrlCrawl { url } => {
                assert_eq!(url.url, "https://a/");
                assert_eq!(url.depth, 0);
                assert_eq!(url.job, job);
            }
            _ => unreachable!(),
        }

        // single-stager cluster: the stager itself is the counter
        frame::write(&mut link, &Command::RequestUrlQuota { job: job.clone() })
            .await
            .unwrap();
        let quota =
            expect_command(&mut link, |c| matches!(c, Command::AssignedUrlQuota { .. })).await;
        match quota {
            Command::AssignedUrlQuota { job: got, quota } => {
                assert_eq!(got, job);
                // 10 urls/sec since job creation; bounded by elapsed time,
                // which stays far below two minutes here
                assert!(quota <= 120 * 10);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn stager_gossips_known_stagers_to_newcomers() {
        let stager = spawn_stager(1_000_000);

        // first stager announces; nothing to gossip yet
        let first_addr = Address::new("127.0.0.1", 3201);
        let mut first = connect(&stager.addr).await;
        frame::write(
            &mut first,
            &Command::AnnounceStager {
                addr: first_addr.clone(),
            },
        )
        .await
        .unwrap();
        expect_command(&mut first, |c| matches!(c, Command::Confirmed { state: 0 })).await;

        // second stager announces and learns about the first
        let mut second = connect(&stager.addr).await;
        frame::write(
            &mut second,
            &Command::AnnounceStager {
                addr: Address::new("127.0.0.1", 3202),
            },
        )
        .await
        .unwrap();

        let gossiped =
            expect_command(&mut second, |c| matches!(c, Command::StagerNew { .. })).await;
        assert_eq!(gossiped, Command::StagerNew { addr: first_addr });
    }

    #[tokio::test]
    async fn upload_grants_respect_the_space_budget() {
        let stager = spawn_stager(1_000);
        let mut link = attach_crawler(&stager.addr, Address::new("127.0.0.1", 3300)).await;

        let request = |path: &str, filesize| Command::RequestUploadPermission {
            job: "demo_x".to_string(),
            path: path.to_string(),
            filesize,
        };

        frame::write(&mut link, &request("a.warc.gz", 600)).await.unwrap();
        expect_command(&mut link, |c| {
            matches!(c, Command::UploadPermissionGranted { .. })
        })
        .await;

        // the second reservation does not fit
        frame::write(&mut link, &request("b.warc.gz", 600)).await.unwrap();
        expect_command(&mut link, |c| {
            matches!(c, Command::UploadPermissionDenied { .. })
        })
        .await;

        // revoking the first frees the space again
        frame::write(
            &mut link,
            &Command::RequestUploadRevoke {
                job: "demo_x".to_string(),
                path: "a.warc.gz".to_string(),
            },
        )
        .await
        .unwrap();
        frame::write(&mut link, &request("c.warc.gz", 600)).await.unwrap();
        expect_command(&mut link, |c| {
            matches!(c, Command::UploadPermissionGranted { .. })
        })
        .await;
    }

    #[tokio::test]
    async fn received_warc_lands_under_the_job_directory() {
        let stager = spawn_stager(1_000_000);
        let mut link = attach_crawler(&stager.addr, Address::new("127.0.0.1", 3400)).await;

        let settings = demo_settings();
        let job = settings.identifier.clone();
        ingest::write_job_file(&settings, &stager.jobs_dir).unwrap();
        expect_command(&mut link, |c| matches!(c, Command::NewJobCrawl { .. })).await;

        let payload = vec![0x1f, 0x8b, 0x00, 0xff, 0x3b];
        frame::write(
            &mut link,
            &Command::WarcFile {
                path: "data/demo_x/1.warc.gz".to_string(),
                payload: payload.clone(),
                job: job.clone(),
            },
        )
        .await
        .unwrap();

        let received =
            expect_command(&mut link, |c| matches!(c, Command::WarcFileReceived { .. })).await;
        assert_eq!(
            received,
            Command::WarcFileReceived {
                job: job.clone(),
                path: "data/demo_x/1.warc.gz".to_string(),
            }
        );

        let stored = stager.warc_dir.join(&job).join("1.warc.gz");
        assert_eq!(std::fs::read(stored).unwrap(), payload);
    }
}
