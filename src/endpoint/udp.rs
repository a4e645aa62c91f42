// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! UDP socket setup for unicast and multicast endpoints.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use log::info;
use tokio::net::UdpSocket;

use crate::consts::{AddressFamily, ALL_COAP_NODES_V4, ALL_COAP_NODES_V6_LL};

/// Binds a unicast UDP socket.
pub(crate) async fn bind_unicast(addr: SocketAddr) -> io::Result<Arc<UdpSocket>> {
    let socket = UdpSocket::bind(addr).await?;
    info!("bound coap://{}", socket.local_addr()?);
    Ok(Arc::new(socket))
}

/// Binds a multicast UDP socket on `addr` and joins `groups`. When
/// `groups` is empty the "All CoAP Nodes" group of the bound family is
/// joined.
pub(crate) async fn bind_multicast(
    addr: SocketAddr,
    groups: &[IpAddr],
) -> io::Result<(Arc<UdpSocket>, Vec<IpAddr>)> {
    let socket = UdpSocket::bind(addr).await?;

    let groups: Vec<IpAddr> = if groups.is_empty() {
        match AddressFamily::of(&addr) {
            AddressFamily::V4 => vec![IpAddr::V4(ALL_COAP_NODES_V4)],
            AddressFamily::V6 => vec![IpAddr::V6(ALL_COAP_NODES_V6_LL)],
        }
    } else {
        groups.to_vec()
    };

    for group in &groups {
        match group {
            IpAddr::V4(group) => {
                socket.join_multicast_v4(*group, Ipv4Addr::UNSPECIFIED)?;
            }
            IpAddr::V6(group) => {
                socket.join_multicast_v6(group, 0)?;
            }
        }
        info!("joined multicast group {} on {}", group, addr);
    }

    Ok((Arc::new(socket), groups))
}
