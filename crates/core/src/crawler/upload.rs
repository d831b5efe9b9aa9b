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

//! Upload negotiation for finished WARC files. Permission is requested from
//! every stager on the job; after the answer window closes one granter is
//! chosen, the others are revoked and the file is transferred. The choice is
//! monotonic: once made it is never revisited, even if the chosen stager
//! disappears.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use hashbrown::HashMap;

use crate::distributed::peer::PeerId;
use crate::protocol::JobId;
use crate::sample;

const UPLOADING_SUFFIX: &str = ".uploading";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chosen {
    Undecided,
    Nobody,
    Peer(PeerId),
}

#[derive(Debug)]
struct WarcUpload {
    filesize: u64,
    requested: bool,
    revoked: bool,
    granted_by: Vec<PeerId>,
    chosen: Chosen,
    last_answer: Instant,
}

impl WarcUpload {
    fn new(filesize: u64, now: Instant) -> Self {
        Self {
            filesize,
            requested: false,
            revoked: false,
            granted_by: Vec::new(),
            chosen: Chosen::Undecided,
            last_answer: now,
        }
    }
}

/// What the node loop should do for a file this tick.
#[derive(Debug, PartialEq, Eq)]
pub enum UploadAction {
    Request {
        job: JobId,
        path: PathBuf,
        filesize: u64,
    },
    Revoke {
        job: JobId,
        path: PathBuf,
        peers: Vec<PeerId>,
    },
    Transfer {
        job: JobId,
        path: PathBuf,
        to: PeerId,
    },
}

#[derive(Default)]
pub struct UploadManager {
    files: BTreeSet<(JobId, PathBuf)>,
    states: HashMap<PathBuf, WarcUpload>,
}

impl UploadManager {
    /// Registers a finished WARC for upload. Files that vanished in the
    /// meantime are ignored.
    pub fn add_file(&mut self, job: JobId, path: PathBuf) {
        if !path.is_file() {
            tracing::warn!(path = %path.display(), "warc file disappeared before upload");
            return;
        }
        self.files.insert((job, path));
    }

    pub fn granted(&mut self, path: &Path, peer: PeerId, now: Instant) {
        if let Some(state) = self.states.get_mut(path) {
            if state.requested {
                state.granted_by.push(peer);
                state.last_answer = now;
            }
        }
    }

    /// A denial carries no state change; the decision simply runs off the
    /// granters that did answer.
    pub fn denied(&self, path: &Path) {
        tracing::debug!(path = %path.display(), "upload permission denied");
    }

    /// The chosen stager confirmed receipt: forget the file and remove it
    /// together with its sentinel from disk.
    pub fn received(&mut self, job: &JobId, path: &Path) {
        self.files.remove(&(job.clone(), path.to_path_buf()));
        self.states.remove(path);

        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!(path = %path.display(), "failed to remove uploaded warc: {e}");
        }
        let _ = std::fs::remove_file(sentinel_path(path));
    }

    pub fn is_pending(&self, path: &Path) -> bool {
        self.states.contains_key(path)
    }

    /// Drives every pending file one step. Called on the 1s transport tick.
    pub fn tick(&mut self, now: Instant, answer_window: Duration) -> Vec<UploadAction> {
        let mut actions = Vec::new();

        for (job, path) in self.files.clone() {
            if !self.states.contains_key(&path) {
                match std::fs::metadata(&path) {
                    Ok(meta) => {
                        self.states
                            .insert(path.clone(), WarcUpload::new(meta.len(), now));
                    }
                    Err(_) => {
                        self.files.remove(&(job.clone(), path.clone()));
                        continue;
                    }
                }
            }
            let Some(state) = self.states.get_mut(&path) else {
                continue;
            };

            if !state.requested {
                state.requested = true;
                state.last_answer = now;
                actions.push(UploadAction::Request {
                    job: job.clone(),
                    path: path.clone(),
                    filesize: state.filesize,
                });
                continue;
            }

            if state.revoked {
                // transfer sent, waiting for WARC_FILE_RECEIVED
                continue;
            }

            if state.chosen == Chosen::Undecided {
                if now.duration_since(state.last_answer) < answer_window {
                    continue;
                }

                state.chosen = match sample(&state.granted_by, 1).first() {
                    Some(&peer) => Chosen::Peer(peer),
                    None => Chosen::Nobody,
                };
            }

            match state.chosen {
                Chosen::Peer(to) => {
                    let peers: Vec<PeerId> = state
                        .granted_by
                        .iter()
                        .copied()
                        .filter(|&p| p != to)
                        .collect();
                    state.revoked = true;

                    if !peers.is_empty() {
                        actions.push(UploadAction::Revoke {
                            job: job.clone(),
                            path: path.clone(),
                            peers,
                        });
                    }

                    let sentinel = sentinel_path(&path);
                    if sentinel.exists() {
                        tracing::warn!(path = %path.display(), "upload already in flight");
                        continue;
                    }
                    if let Err(e) = std::fs::write(&sentinel, b"") {
                        tracing::warn!(path = %path.display(), "failed to create sentinel: {e}");
                        continue;
                    }

                    actions.push(UploadAction::Transfer {
                        job: job.clone(),
                        path: path.clone(),
                        to,
                    });
                }
                Chosen::Nobody => {
                    // nobody answered in time; drop the state and let the
                    // next tick start a fresh request round
                    tracing::debug!(path = %path.display(), "no upload grants, resetting");
                    self.states.remove(&path);
                }
                Chosen::Undecided => unreachable!(),
            }
        }

        actions
    }
}

pub fn sentinel_path(path: &Path) -> PathBuf {
    let mut sentinel = path.as_os_str().to_owned();
    sentinel.push(UPLOADING_SUFFIX);
    PathBuf::from(sentinel)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(5);

    fn manager_with_file(dir: &Path) -> (UploadManager, PathBuf) {
        let path = dir.join("1.warc.gz");
        std::fs::write(&path, vec![0u8; 100]).unwrap();

        let mut manager = UploadManager::default();
        manager.add_file("demo".to_string(), path.clone());
        (manager, path)
    }

    #[test]
    fn first_tick_requests_permission() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, path) = manager_with_file(dir.path());

        let actions = manager.tick(Instant::now(), WINDOW);

        assert_eq!(
            actions,
            vec![UploadAction::Request {
                job: "demo".to_string(),
                path,
                filesize: 100,
            }]
        );

        // pending, no duplicate request before the window closes
        assert!(manager.tick(Instant::now(), WINDOW).is_empty());
    }

    #[test]
    fn grant_then_decision_revokes_losers_and_transfers() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, path) = manager_with_file(dir.path());

        let t0 = Instant::now();
        manager.tick(t0, WINDOW);
        manager.granted(&path, 1, t0);
        manager.granted(&path, 2, t0);

        let actions = manager.tick(t0 + WINDOW, WINDOW);

        let transfer_to = actions
            .iter()
            .find_map(|a| match a {
                UploadAction::Transfer { to, .. } => Some(*to),
                _ => None,
            })
            .expect("transfer action");
        assert!([1, 2].contains(&transfer_to));

        let revoked = actions
            .iter()
            .find_map(|a| match a {
                UploadAction::Revoke { peers, .. } => Some(peers.clone()),
                _ => None,
            })
            .expect("revoke action");
        assert_eq!(revoked, vec![if transfer_to == 1 { 2 } else { 1 }]);

        assert!(sentinel_path(&path).exists());
    }

    #[test]
    fn single_grant_transfers_without_revokes() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, path) = manager_with_file(dir.path());

        let t0 = Instant::now();
        manager.tick(t0, WINDOW);
        manager.granted(&path, 7, t0);

        let actions = manager.tick(t0 + WINDOW, WINDOW);

        assert_eq!(
            actions,
            vec![UploadAction::Transfer {
                job: "demo".to_string(),
                path,
                to: 7,
            }]
        );
    }

    #[test]
    fn no_grants_resets_and_rerequests() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, path) = manager_with_file(dir.path());

        let t0 = Instant::now();
        manager.tick(t0, WINDOW);

        // window passes without any answer
        assert!(manager.tick(t0 + WINDOW, WINDOW).is_empty());
        assert!(!manager.is_pending(&path));

        // next tick starts over with a fresh request
        let actions = manager.tick(t0 + WINDOW * 2, WINDOW);
        assert!(matches!(actions[0], UploadAction::Request { .. }));
    }

    #[test]
    fn received_cleans_up_file_and_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, path) = manager_with_file(dir.path());

        let t0 = Instant::now();
        manager.tick(t0, WINDOW);
        manager.granted(&path, 1, t0);
        manager.tick(t0 + WINDOW, WINDOW);

        manager.received(&"demo".to_string(), &path);

        assert!(!path.exists());
        assert!(!sentinel_path(&path).exists());
        assert!(manager.tick(t0 + WINDOW * 2, WINDOW).is_empty());
    }

    #[test]
    fn late_grant_after_decision_is_not_rechosen() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, path) = manager_with_file(dir.path());

        let t0 = Instant::now();
        manager.tick(t0, WINDOW);
        manager.granted(&path, 1, t0);
        let actions = manager.tick(t0 + WINDOW, WINDOW);
        assert!(matches!(actions[0], UploadAction::Transfer { to: 1, .. }));

        // a straggler grant changes nothing; the transfer is out
        manager.granted(&path, 2, t0 + WINDOW);
        assert!(manager.tick(t0 + WINDOW * 2, WINDOW).is_empty());
    }
}
