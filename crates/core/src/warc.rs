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

//! WARC record handling at the crawl/upload boundary: iterating the records
//! of a `.warc.gz`, rewriting response records into revisit records when the
//! deduplication oracle knows the payload, and extracting candidate urls
//! from response bodies.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::{Error, Result};

pub const REVISIT_PROFILE: &str =
    "http://netpreserve.org/warc/1.0/revisit/identical-payload-digest";

pub struct WarcFile {
    bytes: Vec<u8>,
}

impl WarcFile {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(std::fs::read(path)?))
    }

    pub fn records(&self) -> RecordIterator<&[u8]> {
        RecordIterator {
            reader: BufReader::new(MultiGzDecoder::new(&self.bytes[..])),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WarcRecord {
    headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl WarcRecord {
    pub fn new(headers: BTreeMap<String, String>, body: Vec<u8>) -> Self {
        let mut record = Self { headers, body };
        record.set_header("Content-Length", record.body.len().to_string());
        record
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_lowercase(), value.into());
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.remove(&name.to_lowercase());
    }

    pub fn warc_type(&self) -> Option<&str> {
        self.header("WARC-Type")
    }

    pub fn target_uri(&self) -> Option<&str> {
        self.header("WARC-Target-URI")
    }

    pub fn payload_digest(&self) -> Option<&str> {
        self.header("WARC-Payload-Digest")
    }

    /// The http header block of a response body, up to and including the
    /// blank line. Falls back to the whole body when no blank line exists.
    pub fn http_headers(&self) -> &[u8] {
        find_subslice(&self.body, b"\r\n\r\n")
            .map(|idx| &self.body[..idx + 4])
            .unwrap_or(&self.body)
    }
}

pub struct RecordIterator<R: Read> {
    reader: BufReader<MultiGzDecoder<R>>,
}

impl<R: Read> RecordIterator<R> {
    fn next_record(&mut self) -> Option<Result<WarcRecord>> {
        let mut version = String::new();

        loop {
            version.clear();
            match self.reader.read_line(&mut version) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
            if !version.trim_end().is_empty() {
                break;
            }
        }

        if !version.starts_with("WARC/") {
            return Some(Err(Error::WarcParse(format!(
                "bad version line: {version:?}"
            ))
            .into()));
        }

        let mut headers = BTreeMap::new();
        let mut line = String::new();
        loop {
            line.clear();
            match self.reader.read_line(&mut line) {
                Ok(0) => {
                    return Some(Err(
                        Error::WarcParse("truncated record header".to_string()).into()
                    ))
                }
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }

            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                break;
            }

            match trimmed.split_once(':') {
                Some((name, value)) => {
                    headers.insert(name.trim().to_lowercase(), value.trim().to_string());
                }
                None => {
                    return Some(Err(
                        Error::WarcParse(format!("bad header line: {trimmed:?}")).into(),
                    ))
                }
            }
        }

        let content_length = match headers
            .get("content-length")
            .and_then(|v| v.parse::<usize>().ok())
        {
            Some(len) => len,
            None => {
                return Some(Err(
                    Error::WarcParse("missing content-length".to_string()).into()
                ))
            }
        };

        let mut body = vec![0; content_length];
        if let Err(e) = self.reader.read_exact(&mut body) {
            return Some(Err(e.into()));
        }

        Some(Ok(WarcRecord { headers, body }))
    }
}

impl<R: Read> Iterator for RecordIterator<R> {
    type Item = Result<WarcRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record()
    }
}

/// Writes records to `writer`, each record as its own gzip member.
pub struct WarcWriter<W: Write> {
    writer: W,
}

impl<W: Write> WarcWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn write(&mut self, record: &WarcRecord) -> Result<()> {
        let mut encoder = GzEncoder::new(&mut self.writer, Compression::default());

        encoder.write_all(b"WARC/1.0\r\n")?;
        for (name, value) in &record.headers {
            encoder.write_all(canonical_header_name(name).as_bytes())?;
            encoder.write_all(b": ")?;
            encoder.write_all(value.as_bytes())?;
            encoder.write_all(b"\r\n")?;
        }
        encoder.write_all(b"\r\n")?;
        encoder.write_all(&record.body)?;
        encoder.write_all(b"\r\n\r\n")?;
        encoder.finish()?;

        Ok(())
    }
}

fn canonical_header_name(lowered: &str) -> String {
    lowered
        .split('-')
        .map(|part| {
            if part.eq_ignore_ascii_case("warc") {
                "WARC".to_string()
            } else if part.eq_ignore_ascii_case("uri") {
                "URI".to_string()
            } else {
                let mut chars = part.chars();
                match chars.next() {
                    Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                    None => String::new(),
                }
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Rewrites response records whose payload the oracle has seen before into
/// revisit records. The oracle is keyed by the SHA-512 of
/// `<sha1-digest>;<scheme-stripped-uri>` and answers `<date>;<uri>` for known
/// payloads, nothing otherwise.
pub struct Deduplicator {
    oracle: String,
    client: reqwest::Client,
}

impl Deduplicator {
    pub fn new(oracle: impl Into<String>) -> Self {
        Self {
            oracle: oracle.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Produces `<stem>-deduplicated.warc.gz` next to `path` and returns its
    /// location.
    pub async fn deduplicate(&self, path: &Path) -> Result<PathBuf> {
        let input = WarcFile::open(path)?;

        let out_path = deduplicated_path(path);
        let mut writer = WarcWriter::new(std::fs::File::create(&out_path)?);

        for record in input.records() {
            let record = record?;

            if record.warc_type() == Some("response") {
                if let Some(duplicate) = self.known_duplicate(&record).await {
                    writer.write(&response_to_revisit(&record, &duplicate))?;
                    continue;
                }
            }

            writer.write(&record)?;
        }

        Ok(out_path)
    }

    async fn known_duplicate(&self, record: &WarcRecord) -> Option<DuplicateRef> {
        let uri = record.target_uri()?;
        let digest = record.payload_digest()?.strip_prefix("sha1:")?;

        let key = sha512_hex(format!("{};{}", digest, strip_url_scheme(uri)).as_bytes());
        let url = format!("{}/{}", self.oracle.trim_end_matches('/'), key);

        let body = self
            .client
            .get(&url)
            .send()
            .await
            .ok()?
            .text()
            .await
            .ok()?;
        let (date, uri) = body.split_once(';')?;

        Some(DuplicateRef {
            date: date.to_string(),
            uri: uri.to_string(),
        })
    }
}

struct DuplicateRef {
    date: String,
    uri: String,
}

fn deduplicated_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("output.warc.gz");
    let stem = name.strip_suffix(".warc.gz").unwrap_or(name);
    path.with_file_name(format!("{stem}-deduplicated.warc.gz"))
}

fn response_to_revisit(record: &WarcRecord, duplicate: &DuplicateRef) -> WarcRecord {
    let mut revisit = WarcRecord::new(
        record.headers.clone(),
        record.http_headers().to_vec(),
    );

    revisit.set_header("WARC-Type", "revisit");
    revisit.set_header("WARC-Profile", REVISIT_PROFILE);
    revisit.set_header("WARC-Truncated", "length");
    revisit.set_header("WARC-Refers-To-Date", iso_date(&duplicate.date));
    revisit.set_header("WARC-Refers-To-Target-URI", duplicate.uri.clone());
    revisit.remove_header("WARC-Block-Digest");

    revisit
}

/// Reformats a compact `YYYYMMDDHHMMSS` oracle date as ISO-8601. Anything
/// malformed passes through unchanged.
fn iso_date(compact: &str) -> String {
    if compact.len() != 14 || !compact.bytes().all(|b| b.is_ascii_digit()) {
        return compact.to_string();
    }

    format!(
        "{}-{}-{}T{}:{}:{}Z",
        &compact[0..4],
        &compact[4..6],
        &compact[6..8],
        &compact[8..10],
        &compact[10..12],
        &compact[12..14],
    )
}

pub fn strip_url_scheme(url: &str) -> &str {
    url.strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url)
}

pub fn sha512_hex(data: &[u8]) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA512, data);
    digest
        .as_ref()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Extracts candidate urls from a response body, resolved against the parent
/// url. Fragments are dropped; anything the `url` crate cannot make sense of
/// is skipped.
pub fn extract_urls(parent: &str, body: &[u8]) -> Vec<String> {
    static PATTERNS: OnceLock<Vec<regex::Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            r#"(?i)href\s*=\s*"([^"]+)""#,
            r#"(?i)href\s*=\s*'([^']+)'"#,
            r#"(?i)src\s*=\s*"([^"]+)""#,
            r#"(?i)src\s*=\s*'([^']+)'"#,
            r#"(?i)url\s*\(([^)]+)\)"#,
            r#"(https?://[^\s"'<>\\^{}|]+)"#,
        ]
        .iter()
        .map(|p| regex::Regex::new(p).unwrap())
        .collect()
    });

    let parent = match url::Url::parse(parent) {
        Ok(parent) => parent,
        Err(_) => return Vec::new(),
    };

    let text = String::from_utf8_lossy(body);
    let mut seen = std::collections::HashSet::new();
    let mut found = Vec::new();

    for pattern in patterns.iter() {
        for capture in pattern.captures_iter(&text) {
            let raw = capture[1].trim().trim_matches(['"', '\'']);
            let raw = raw.replace("&amp;", "&");

            let Ok(mut resolved) = parent.join(&raw) else {
                continue;
            };
            resolved.set_fragment(None);

            if resolved.scheme() != "http" && resolved.scheme() != "https" {
                continue;
            }

            let resolved = resolved.to_string();
            if seen.insert(resolved.clone()) {
                found.push(resolved);
            }
        }
    }

    found
}
