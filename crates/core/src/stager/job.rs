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

//! Per-job state on a stager: the local share of the frontier, the urls
//! currently out with this stager's crawlers, backup slices held for peer
//! stagers, the co-owner and crawler rosters and the url-quota counter.

use std::sync::Arc;
use std::time::Instant;

use hashbrown::{HashMap, HashSet};

use crate::distributed::peer::PeerId;
use crate::job::{JobSettings, UrlConfig};
use crate::protocol::Address;
use crate::sample;

#[derive(Debug, Default)]
pub struct JobCrawler {
    pub confirmed: bool,
    pub started: bool,
    pub finished: bool,
    pub urls: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct JobStager {
    pub confirmed: bool,
    pub started: bool,
    pub finished: bool,
}

/// The url-quota counter for a job is either this node (holding the grant
/// clock) or a reference to the elected peer.
#[derive(Debug)]
pub enum Counter {
    Unset,
    Local { last_grant: Instant },
    Peer(PeerId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareTarget {
    Local,
    Peer(PeerId),
}

/// One placement decision from [`StagerJob::share_urls`].
#[derive(Debug)]
pub struct Share {
    pub url: UrlConfig,
    pub owner: ShareTarget,
    pub backups: Vec<ShareTarget>,
}

pub struct StagerJob {
    pub settings: Arc<JobSettings>,
    pub is_initial_owner: bool,
    pub initial_owner: Option<PeerId>,

    /// Local share of the frontier, waiting to be placed.
    pub discovered_urls: HashMap<String, UrlConfig>,
    /// Urls assigned to one of this stager's crawlers.
    pub current_urls: HashMap<String, UrlConfig>,

    pub crawlers: HashMap<PeerId, JobCrawler>,
    pub stagers: HashMap<PeerId, JobStager>,

    /// Urls held on behalf of other stagers, keyed by the owning stager's
    /// listener address.
    pub backup: HashMap<Address, HashMap<String, UrlConfig>>,

    pub counter: Counter,

    /// The initial owner emits the start barrier exactly once.
    pub start_sent: bool,
    pub finished: bool,
}

impl StagerJob {
    pub fn new(settings: JobSettings, is_initial_owner: bool, initial_owner: Option<PeerId>) -> Self {
        let mut discovered_urls = HashMap::new();
        if is_initial_owner {
            for url in settings.seed_urls() {
                discovered_urls.insert(url.url.clone(), url);
            }
        }

        Self {
            settings: Arc::new(settings),
            is_initial_owner,
            initial_owner,
            discovered_urls,
            current_urls: HashMap::new(),
            crawlers: HashMap::new(),
            stagers: HashMap::new(),
            backup: HashMap::new(),
            counter: Counter::Unset,
            start_sent: false,
            finished: false,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.settings.identifier
    }

    pub fn add_crawler(&mut self, peer: PeerId) {
        self.crawlers.entry(peer).or_default();
    }

    pub fn add_stager(&mut self, peer: PeerId) {
        self.stagers.entry(peer).or_default();
    }

    pub fn crawler_confirmed(&mut self, peer: PeerId) {
        if let Some(crawler) = self.crawlers.get_mut(&peer) {
            crawler.confirmed = true;
        }
    }

    /// Processes a `CONFIRMED_JOB` from a co-owner. Returns the state to
    /// send back, if any: a `0` is answered with `1`, everything else ends
    /// the exchange.
    pub fn confirm_stager(&mut self, peer: PeerId, state: i8) -> Option<i8> {
        let stager = self.stagers.get_mut(&peer)?;
        if stager.confirmed {
            return None;
        }
        stager.confirmed = true;

        (state == 0).then_some(1)
    }

    pub fn all_stagers_confirmed(&self) -> bool {
        self.stagers.values().all(|s| s.confirmed)
    }

    pub fn stager_started(&mut self, peer: PeerId) {
        if let Some(stager) = self.stagers.get_mut(&peer) {
            stager.started = true;
        }
    }

    pub fn crawler_started(&mut self, peer: PeerId) {
        if let Some(crawler) = self.crawlers.get_mut(&peer) {
            crawler.started = true;
        }
    }

    pub fn all_local_crawlers_started(&self) -> bool {
        self.crawlers.values().all(|c| c.started)
    }

    /// The job counts as started here once every co-owner stager and every
    /// attached crawler reported in.
    pub fn started(&self) -> bool {
        self.stagers.values().all(|s| s.started) && self.all_local_crawlers_started()
    }

    /// Any activity on the job resets the conservative finished state.
    pub fn touch(&mut self) {
        self.finished = false;
        for crawler in self.crawlers.values_mut() {
            crawler.finished = false;
        }
        for stager in self.stagers.values_mut() {
            stager.finished = false;
        }
    }

    pub fn add_url(&mut self, url: UrlConfig) {
        self.touch();
        self.discovered_urls.insert(url.url.clone(), url);
    }

    pub fn backup_url(&mut self, owner: Address, url: UrlConfig) {
        self.touch();
        self.backup
            .entry(owner)
            .or_default()
            .insert(url.url.clone(), url);
    }

    /// Assigns a url to `crawler` and records the assignment.
    pub fn assign_url(&mut self, crawler: PeerId, url: UrlConfig) {
        self.touch();
        if let Some(state) = self.crawlers.get_mut(&crawler) {
            state.urls.insert(url.url.clone());
        }
        self.current_urls.insert(url.url.clone(), url);
    }

    /// Removes a finished url, wherever this stager holds it: from
    /// `current_urls` when this stager queued it, from the owner's backup
    /// slot otherwise. Unknown urls are ignored; finish events are
    /// at-least-once.
    pub fn finish_url(&mut self, crawler: PeerId, url: &str, queued_by: &Address, own_addr: &Address) {
        self.touch();

        if queued_by == own_addr {
            self.current_urls.remove(url);
            if let Some(state) = self.crawlers.get_mut(&crawler) {
                state.urls.remove(url);
            }
        } else if let Some(slot) = self.backup.get_mut(queued_by) {
            slot.remove(url);
        }
    }

    /// Splits the local frontier into one slice per co-owner plus a local
    /// slice and picks backup targets for every slice. The frontier is
    /// drained; an empty frontier yields nothing.
    pub fn share_urls(&mut self, max_backups: usize) -> Vec<Share> {
        if self.discovered_urls.is_empty() {
            return Vec::new();
        }
        self.touch();

        let mut targets = vec![ShareTarget::Local];
        targets.extend(self.stagers.keys().map(|&p| ShareTarget::Peer(p)));

        let urls: Vec<UrlConfig> = self
            .discovered_urls
            .drain()
            .map(|(_, url)| url)
            .collect();
        let slice_size = urls.len().div_ceil(targets.len());

        let mut shares = Vec::with_capacity(urls.len());

        for (slice, &owner) in urls.chunks(slice_size).zip(targets.iter()) {
            let candidates: Vec<ShareTarget> = targets
                .iter()
                .copied()
                .filter(|&t| t != owner)
                .collect();
            let backups = sample(&candidates, max_backups);

            for url in slice {
                shares.push(Share {
                    url: url.clone(),
                    owner,
                    backups: backups.clone(),
                });
            }
        }

        shares
    }

    pub fn set_as_counter(&mut self, now: Instant) {
        self.counter = Counter::Local { last_grant: now };
    }

    pub fn set_counter_peer(&mut self, peer: PeerId) {
        self.counter = Counter::Peer(peer);
    }

    pub fn is_counter(&self) -> bool {
        matches!(self.counter, Counter::Local { .. })
    }

    /// Token-bucket grant: the time since the previous grant times the job
    /// rate, floored. Only meaningful on the counter.
    pub fn grant_quota(&mut self, now: Instant) -> u64 {
        match &mut self.counter {
            Counter::Local { last_grant } => {
                let elapsed = now.saturating_duration_since(*last_grant);
                *last_grant = now;
                (elapsed.as_secs_f64() * self.settings.rate as f64) as u64
            }
            _ => 0,
        }
    }

    /// Conservative quiescence: every roster entry finished and nothing left
    /// in any url set. Reset by [`StagerJob::touch`] on any activity.
    pub fn quiescent(&self) -> bool {
        self.crawlers.values().all(|c| c.finished)
            && self.stagers.values().all(|s| s.finished)
            && self.discovered_urls.is_empty()
            && self.current_urls.is_empty()
            && self.backup.values().all(|slot| slot.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn settings(rate: u64) -> JobSettings {
        JobSettings::new(
            "demo",
            vec!["https://a/".to_string()],
            vec![".*".to_string()],
            vec![],
            rate,
            2,
        )
        .unwrap()
    }

    fn job_with_urls(n: usize, co_owners: &[PeerId]) -> StagerJob {
        let mut job = StagerJob::new(settings(10), false, None);
        for peer in co_owners {
            job.add_stager(*peer);
        }
        for i in 0..n {
            job.add_url(UrlConfig::seed(job.identifier(), format!("https://a/{i}")));
        }
        job
    }

    #[test]
    fn initial_owner_seeds_the_frontier() {
        let job = StagerJob::new(settings(10), true, None);
        assert!(job.discovered_urls.contains_key("https://a/"));

        let job = StagerJob::new(settings(10), false, None);
        assert!(job.discovered_urls.is_empty());
    }

    #[test]
    fn share_urls_with_empty_frontier_is_a_noop() {
        let mut job = job_with_urls(0, &[1, 2]);
        assert!(job.share_urls(3).is_empty());
    }

    #[test]
    fn share_urls_drains_the_frontier_and_covers_every_url() {
        let mut job = job_with_urls(10, &[1, 2]);

        let shares = job.share_urls(2);

        assert_eq!(shares.len(), 10);
        assert!(job.discovered_urls.is_empty());

        // near-equal slices over 3 owners: ceil(10/3) = 4
        let local = shares
            .iter()
            .filter(|s| s.owner == ShareTarget::Local)
            .count();
        assert_eq!(local, 4);
    }

    #[test]
    fn share_urls_with_fewer_urls_than_owners_leaves_tail_slices_empty() {
        let mut job = job_with_urls(2, &[1, 2, 3]);

        let shares = job.share_urls(1);

        assert_eq!(shares.len(), 2);
        // ceil(2/4) = 1 url per slice; only the first two owners get one
        let local = shares
            .iter()
            .filter(|s| s.owner == ShareTarget::Local)
            .count();
        assert_eq!(local, 1);
    }

    #[test]
    fn backups_never_include_the_slice_owner() {
        let mut job = job_with_urls(30, &[1, 2, 3]);

        for share in job.share_urls(2) {
            assert_eq!(share.backups.len(), 2);
            assert!(!share.backups.contains(&share.owner));

            let mut unique = share.backups.clone();
            unique.dedup();
            assert_eq!(unique.len(), share.backups.len());
        }
    }

    #[test]
    fn backups_are_capped_by_available_targets() {
        let mut job = job_with_urls(4, &[1]);

        for share in job.share_urls(3) {
            // only one candidate exists besides the owner
            assert_eq!(share.backups.len(), 1);
        }
    }

    #[test]
    fn finish_url_removes_from_current_when_queued_here() {
        let own = Address::new("127.0.0.1", 3001);
        let mut job = job_with_urls(0, &[1]);

        let url = UrlConfig::seed(job.identifier(), "https://a/x");
        job.add_crawler(9);
        job.assign_url(9, url);

        job.finish_url(9, "https://a/x", &own, &own);

        assert!(job.current_urls.is_empty());
        assert!(job.crawlers[&9].urls.is_empty());
    }

    #[test]
    fn finish_url_removes_from_backup_when_queued_elsewhere() {
        let own = Address::new("127.0.0.1", 3001);
        let other = Address::new("127.0.0.1", 3002);
        let mut job = job_with_urls(0, &[1]);

        job.backup_url(other.clone(), UrlConfig::seed(job.identifier(), "https://a/x"));
        job.finish_url(9, "https://a/x", &other, &own);

        assert!(job.backup[&other].is_empty());

        // unknown url is silently ignored
        job.finish_url(9, "https://a/unknown", &other, &own);
    }

    #[test]
    fn counter_grants_follow_the_rate() {
        let mut job = StagerJob::new(settings(10), true, None);

        let t0 = Instant::now();
        job.set_as_counter(t0);

        let granted = job.grant_quota(t0 + Duration::from_secs(3));
        assert_eq!(granted, 30);

        // the clock advanced; an immediate second grant is empty
        let again = job.grant_quota(t0 + Duration::from_secs(3));
        assert_eq!(again, 0);
    }

    #[test]
    fn grant_total_is_bounded_by_elapsed_time() {
        let mut job = StagerJob::new(settings(7), true, None);

        let t0 = Instant::now();
        job.set_as_counter(t0);

        let mut total = 0;
        for i in 1..=10 {
            total += job.grant_quota(t0 + Duration::from_millis(i * 250));
        }

        // 2.5s at 7 urls/sec
        assert!(total <= 2500 * 7 / 1000 + 1);
    }

    #[test]
    fn non_counter_grants_nothing() {
        let mut job = StagerJob::new(settings(10), true, None);
        job.set_counter_peer(4);

        assert!(!job.is_counter());
        assert_eq!(job.grant_quota(Instant::now()), 0);
    }

    #[test]
    fn confirm_stager_answers_zero_with_one_exactly_once() {
        let mut job = job_with_urls(0, &[1]);

        assert_eq!(job.confirm_stager(1, 0), Some(1));
        assert_eq!(job.confirm_stager(1, 0), None);
        assert_eq!(job.confirm_stager(2, 0), None); // unknown peer
    }

    #[test]
    fn quiescence_is_reset_by_activity() {
        let mut job = job_with_urls(0, &[]);
        assert!(job.quiescent());

        job.add_url(UrlConfig::seed(job.identifier(), "https://a/x"));
        assert!(!job.quiescent());

        job.share_urls(0);
        // shared urls moved out of the frontier but the job saw activity;
        // with no crawlers or stagers the sets drain back to empty
        assert!(job.quiescent());
    }
}
