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

//! Bound sockets and the endpoint multiplexer tables.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::consts::{AddressFamily, Scheme};
use crate::error::Error;

pub mod dtls;
pub mod tcp;
pub mod udp;

pub use dtls::{SecureDatagramSocket, SecureParams, SecureTransportFactory};

/// Options recognized by `add_endpoint`.
#[derive(Debug, Clone, Default)]
pub struct EndpointParams {
    /// Bind a multicast endpoint instead of a unicast one.
    pub multicast: bool,

    /// The groups to join. Empty means the "All CoAP Nodes" group of the
    /// bound family.
    pub multicast_addresses: Vec<IpAddr>,

    /// The port multicast listens on. Defaults to the scheme's port.
    pub multicast_port: Option<u16>,

    /// Certificate file handed to the secure transport factory.
    pub certfile: Option<String>,

    /// Key file handed to the secure transport factory.
    pub keyfile: Option<String>,
}

/// The transport behind an endpoint.
pub(crate) enum Transport {
    /// A plain UDP socket.
    Udp(Arc<UdpSocket>),

    /// An opaque secure datagram socket (DTLS).
    Secure(Arc<dyn SecureDatagramSocket>),

    /// A stream listener; per-connection writers live in the engine's
    /// connection registry.
    Stream,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Udp(_) => f.write_str("Udp"),
            Transport::Secure(_) => f.write_str("Secure"),
            Transport::Stream => f.write_str("Stream"),
        }
    }
}

/// A bound socket with its scheme, family, local address, and multicast
/// metadata. Owned by the multiplexer; lives until the engine closes.
#[derive(Debug)]
pub struct Endpoint {
    scheme: Scheme,
    address: SocketAddr,
    family: AddressFamily,
    multicast_groups: Vec<IpAddr>,
    pub(crate) transport: Transport,
}

impl Endpoint {
    pub(crate) fn new(
        scheme: Scheme,
        address: SocketAddr,
        multicast_groups: Vec<IpAddr>,
        transport: Transport,
    ) -> Endpoint {
        Endpoint {
            scheme,
            address,
            family: AddressFamily::of(&address),
            multicast_groups,
            transport,
        }
    }

    /// The scheme this endpoint serves.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// The bound local address.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// The bound address family.
    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// True when this endpoint listens on multicast groups.
    pub fn is_multicast(&self) -> bool {
        !self.multicast_groups.is_empty()
    }

    /// The joined groups.
    pub fn multicast_groups(&self) -> &[IpAddr] {
        &self.multicast_groups
    }

    /// Transmits a datagram. Stream endpoints transmit through the
    /// engine's connection registry instead.
    pub(crate) async fn send_to(&self, data: &[u8], dest: SocketAddr) -> io::Result<()> {
        match &self.transport {
            Transport::Udp(socket) => {
                socket.send_to(data, dest).await?;
                Ok(())
            }
            Transport::Secure(socket) => {
                socket.send_to(data, dest).await?;
                Ok(())
            }
            Transport::Stream => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "stream endpoints transmit per connection",
            )),
        }
    }
}

/// The multiplexer's two containers:
/// `unicast[scheme][family][host][port]` and
/// `multicast[scheme][family][host]`.
pub(crate) struct EndpointTable {
    unicast: HashMap<Scheme, HashMap<AddressFamily, HashMap<IpAddr, HashMap<u16, Arc<Endpoint>>>>>,
    multicast: HashMap<Scheme, HashMap<AddressFamily, HashMap<IpAddr, Arc<Endpoint>>>>,
}

impl EndpointTable {
    pub fn new() -> EndpointTable {
        EndpointTable {
            unicast: HashMap::new(),
            multicast: HashMap::new(),
        }
    }

    /// Registers a bound endpoint in the matching container.
    pub fn add(&mut self, endpoint: Arc<Endpoint>) {
        let scheme = endpoint.scheme();
        let family = endpoint.family();
        let host = endpoint.address().ip();

        if endpoint.is_multicast() {
            self.multicast
                .entry(scheme)
                .or_insert_with(HashMap::new)
                .entry(family)
                .or_insert_with(HashMap::new)
                .insert(host, endpoint);
        } else {
            self.unicast
                .entry(scheme)
                .or_insert_with(HashMap::new)
                .entry(family)
                .or_insert_with(HashMap::new)
                .entry(host)
                .or_insert_with(HashMap::new)
                .insert(endpoint.address().port(), endpoint);
        }
    }

    /// Selects the endpoint an outbound message leaves through: the exact
    /// source address when the message carries one, otherwise any unicast
    /// endpoint of the destination's family.
    pub fn find_sending(
        &self,
        scheme: Scheme,
        family: AddressFamily,
        source: Option<SocketAddr>,
    ) -> Result<Arc<Endpoint>, Error> {
        if let Some(source) = source {
            let by_port = self
                .unicast
                .get(&scheme)
                .and_then(|families| families.get(&AddressFamily::of(&source)))
                .and_then(|hosts| hosts.get(&source.ip()));
            if let Some(by_port) = by_port {
                if source.port() != 0 {
                    if let Some(endpoint) = by_port.get(&source.port()) {
                        return Ok(endpoint.clone());
                    }
                } else if let Some(endpoint) = by_port.values().next() {
                    return Ok(endpoint.clone());
                }
            }
        }

        self.unicast
            .get(&scheme)
            .and_then(|families| families.get(&family))
            .and_then(|hosts| hosts.values().flat_map(|ports| ports.values()).next())
            .cloned()
            .ok_or(Error::IoError)
    }

    /// Every registered endpoint, unicast and multicast.
    pub fn all(&self) -> Vec<Arc<Endpoint>> {
        let mut endpoints = Vec::new();
        for families in self.unicast.values() {
            for hosts in families.values() {
                for ports in hosts.values() {
                    endpoints.extend(ports.values().cloned());
                }
            }
        }
        for families in self.multicast.values() {
            for hosts in families.values() {
                endpoints.extend(hosts.values().cloned());
            }
        }
        endpoints
    }

    /// Drops every endpoint. The sockets close when the receive tasks
    /// holding them stop.
    pub fn clear(&mut self) {
        self.unicast.clear();
        self.multicast.clear();
    }
}

/// Splits a `coap://host:port` style URI into its scheme and resolved
/// socket address. An empty host binds the IPv4 wildcard, `[::]` the IPv6
/// wildcard.
pub(crate) fn parse_coap_uri(uri: &str) -> Result<(Scheme, SocketAddr), Error> {
    let (scheme_str, rest) = match uri.find("://") {
        Some(at) => (&uri[..at], &uri[at + 3..]),
        None => return Err(Error::InvalidArgument),
    };
    let scheme = Scheme::from_str(scheme_str).ok_or(Error::UnsupportedUriScheme)?;

    // Strip any path or query; only the authority matters here.
    let authority = rest.split(|c| c == '/' || c == '?').next().unwrap_or("");

    let (host, port) = if let Some(end) = authority.find(']') {
        // Bracketed IPv6 literal.
        if !authority.starts_with('[') {
            return Err(Error::InvalidArgument);
        }
        let host = &authority[1..end];
        let port = match authority[end + 1..].strip_prefix(':') {
            Some(port) => port.parse::<u16>().map_err(|_| Error::InvalidArgument)?,
            None => scheme.default_port(),
        };
        (host.to_string(), port)
    } else {
        match authority.rfind(':') {
            Some(at) => {
                let port = authority[at + 1..]
                    .parse::<u16>()
                    .map_err(|_| Error::InvalidArgument)?;
                (authority[..at].to_string(), port)
            }
            None => (authority.to_string(), scheme.default_port()),
        }
    };

    let ip: IpAddr = if host.is_empty() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else if host == "::" {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else if let Ok(ip) = host.parse::<IpAddr>() {
        ip
    } else {
        // Defer to the resolver for names.
        (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|_| Error::HostNotFound)?
            .next()
            .ok_or(Error::HostNotFound)?
            .ip()
    };

    Ok((scheme, SocketAddr::new(ip, port)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_uris() {
        let (scheme, addr) = parse_coap_uri("coap://127.0.0.1:20001").unwrap();
        assert_eq!(scheme, Scheme::Coap);
        assert_eq!(addr, "127.0.0.1:20001".parse().unwrap());

        let (scheme, addr) = parse_coap_uri("coap://127.0.0.1").unwrap();
        assert_eq!(scheme, Scheme::Coap);
        assert_eq!(addr.port(), 5683);

        let (scheme, addr) = parse_coap_uri("coaps://[::1]:7777").unwrap();
        assert_eq!(scheme, Scheme::Coaps);
        assert_eq!(addr, "[::1]:7777".parse().unwrap());

        let (scheme, addr) = parse_coap_uri("coap+tcp://[::1]").unwrap();
        assert_eq!(scheme, Scheme::CoapTcp);
        assert_eq!(addr.port(), 5683);

        let (_, addr) = parse_coap_uri("coap://").unwrap();
        assert!(addr.ip().is_unspecified());

        assert_eq!(
            parse_coap_uri("http://127.0.0.1").unwrap_err(),
            Error::UnsupportedUriScheme
        );
        assert_eq!(
            parse_coap_uri("127.0.0.1:5683").unwrap_err(),
            Error::InvalidArgument
        );
    }

    #[tokio::test]
    async fn table_source_selection() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let endpoint = Arc::new(Endpoint::new(
            Scheme::Coap,
            addr,
            Vec::new(),
            Transport::Udp(Arc::new(socket)),
        ));

        let mut table = EndpointTable::new();
        table.add(endpoint.clone());

        // Exact source.
        let found = table
            .find_sending(Scheme::Coap, AddressFamily::V4, Some(addr))
            .unwrap();
        assert_eq!(found.address(), addr);

        // Source with unspecified port picks any on that host.
        let hint = SocketAddr::new(addr.ip(), 0);
        let found = table
            .find_sending(Scheme::Coap, AddressFamily::V4, Some(hint))
            .unwrap();
        assert_eq!(found.address(), addr);

        // No source: any endpoint of the family.
        let found = table
            .find_sending(Scheme::Coap, AddressFamily::V4, None)
            .unwrap();
        assert_eq!(found.address(), addr);

        // Wrong family fails.
        assert!(table
            .find_sending(Scheme::Coap, AddressFamily::V6, None)
            .is_err());
    }
}
