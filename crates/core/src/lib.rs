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

pub mod config;
pub mod crawler;
pub mod distributed;
pub mod job;
pub mod protocol;
pub mod stager;
pub mod urlseen;
pub mod warc;

use std::path::Path;

use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid job definition: {0}")]
    InvalidJobDefinition(String),

    #[error("failed to fetch seed list from {0}")]
    SeedListUnavailable(String),

    #[error("failed to parse WARC file: {0}")]
    WarcParse(String),
}

pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;

/// Lowercase alphanumeric suffix, used for job identifiers and temp names.
pub fn random_string(len: usize) -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}

/// Up to `k` elements drawn without replacement. With `k >= collection.len()`
/// the whole collection is returned (shuffled), never an error.
pub fn sample<T: Clone>(collection: &[T], k: usize) -> Vec<T> {
    let mut items: Vec<T> = collection.to_vec();
    items.shuffle(&mut rand::thread_rng());
    items.truncate(k);
    items
}

/// Atomically writes `data` to `path`, creating missing parent directories.
/// The data lands in a temp file with a random suffix first and is renamed
/// into place afterwards.
pub fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut temp = path.as_os_str().to_owned();
    temp.push(format!(".{}", random_string(8)));
    let temp = std::path::PathBuf::from(temp);

    std::fs::write(&temp, data)?;
    std::fs::rename(&temp, path)?;

    Ok(())
}

pub fn free_socket_addr() -> std::net::SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}
