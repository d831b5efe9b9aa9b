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

pub mod frame;
pub mod peer;
pub mod retry_strategy;

use rand::Rng;

use crate::protocol::Address;

/// Listener ports are drawn from this range when none is configured.
pub const PORT_RANGE: std::ops::Range<u16> = 3000..6000;

pub fn listen_address(host: Option<String>, port: Option<u16>) -> Address {
    let host = host.unwrap_or_else(|| "127.0.0.1".to_string());
    let port = port.unwrap_or_else(|| rand::thread_rng().gen_range(PORT_RANGE));
    Address::new(host, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_port_is_in_range() {
        for _ in 0..64 {
            let addr = listen_address(None, None);
            assert!(PORT_RANGE.contains(&addr.port));
        }
    }

    #[test]
    fn configured_endpoint_is_kept() {
        let addr = listen_address(Some("10.0.0.1".to_string()), Some(4000));
        assert_eq!(addr, Address::new("10.0.0.1", 4000));
    }
}
