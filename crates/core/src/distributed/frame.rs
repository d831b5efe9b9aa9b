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

//! Frame codec for peer links. Each message is an 8-byte little-endian
//! unsigned length followed by exactly that many bytes of bincode-encoded
//! [`Command`]. File payloads travel inside a command as a byte blob, so a
//! transfer occupies the link for the duration of one frame.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::protocol::Command;

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

const MAX_BODY_SIZE_BYTES: u64 = 1024 * 1024 * 1024; // 1GB

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Got an IO error")]
    IO(#[from] std::io::Error),

    #[error("Failed to encode frame body")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Failed to decode frame body")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("The body size ({body_size}) is larger than the maximum allowed ({max_size})")]
    BodyTooLarge { body_size: u64, max_size: u64 },
}

#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct Header {
    body_size: u64,
}

pub async fn write<W>(writer: &mut W, command: &Command) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let bytes = bincode::encode_to_vec(command, bincode::config::standard())?;

    let header = Header {
        body_size: (bytes.len() as u64).to_le(),
    };

    writer.write_all(bytemuck::bytes_of(&header)).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;

    Ok(())
}

pub async fn read<R>(reader: &mut R) -> Result<Command>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut header_buf = [0; std::mem::size_of::<Header>()];
    reader.read_exact(&mut header_buf).await?;
    let header: Header = bytemuck::pod_read_unaligned(&header_buf);
    let body_size = u64::from_le(header.body_size);

    if body_size > MAX_BODY_SIZE_BYTES {
        return Err(Error::BodyTooLarge {
            body_size,
            max_size: MAX_BODY_SIZE_BYTES,
        });
    }

    let mut buf = vec![0; body_size as usize];
    reader.read_exact(&mut buf).await?;

    let (command, _) = bincode::decode_from_slice(&buf, bincode::config::standard())?;

    Ok(command)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::job::UrlConfig;
    use crate::protocol::Address;

    fn roundtrip(command: &Command) -> Command {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let mut buf = Vec::new();
            write(&mut buf, command).await.unwrap();
            read(&mut std::io::Cursor::new(buf)).await.unwrap()
        })
    }

    #[test]
    fn length_prefix_is_little_endian() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let mut buf = Vec::new();
            write(&mut buf, &Command::Ping).await.unwrap();

            let body_len = u64::from_le_bytes(buf[..8].try_into().unwrap());
            assert_eq!(body_len as usize, buf.len() - 8);
        });
    }

    #[test]
    fn oversized_body_is_rejected() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let mut buf = Vec::new();
            buf.extend_from_slice(&(MAX_BODY_SIZE_BYTES + 1).to_le_bytes());
            buf.extend_from_slice(&[0; 16]);

            let res = read(&mut std::io::Cursor::new(buf)).await;
            assert!(matches!(res, Err(Error::BodyTooLarge { .. })));
        });
    }

    #[test]
    fn file_payload_with_raw_bytes_survives() {
        // embedded blobs must round-trip untouched, including NUL, b';' and
        // invalid utf-8 sequences
        let payload = vec![0x00, 0x3b, 0xff, 0xfe, 0x00, 0x80, 0xc3, 0x28];
        let command = Command::WarcFile {
            path: "data/demo_abc/1.warc.gz".to_string(),
            payload: payload.clone(),
            job: "demo_abc".to_string(),
        };

        match roundtrip(&command) {
            Command::WarcFile {
                payload: decoded, ..
            } => assert_eq!(decoded, payload),
            other => panic!("decoded wrong variant: {other:?}"),
        }
    }

    proptest! {
        #[test]
        fn arbitrary_file_payload_roundtrips(payload: Vec<u8>, path: String, job: String) {
            let command = Command::WarcFile { path, payload, job };
            prop_assert_eq!(roundtrip(&command), command);
        }

        #[test]
        fn url_messages_roundtrip(
            url in ".*",
            parent in proptest::option::of(".*"),
            depth: u64,
            host in "[a-z0-9.]{1,20}",
            port: u16,
        ) {
            let command = Command::JobUrlBackup {
                url: UrlConfig {
                    job: "demo".to_string(),
                    url,
                    depth,
                    parent_url: parent,
                },
                owner: Address::new(host, port),
            };
            prop_assert_eq!(roundtrip(&command), command);
        }
    }
}
