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

//! Module defining various CoAP-related constants.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// The standard default IP port number used for CoAP-over-UDP.
pub const DEFAULT_PORT_COAP_UDP: u16 = 5683;

/// The standard default IP port number used for CoAP-over-DTLS.
pub const DEFAULT_PORT_COAP_DTLS: u16 = 5684;

/// The standard default IP port number used for CoAP-over-TCP.
pub const DEFAULT_PORT_COAP_TCP: u16 = 5683;

/// The standard default IP port number used for CoAP-over-TLS.
pub const DEFAULT_PORT_COAP_TLS: u16 = 5684;

/// The "All CoAP Nodes" IPv4 multicast address: `224.0.1.187`.
pub const ALL_COAP_NODES_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 1, 187);

/// The "All CoAP Nodes" IPv6 **link**-local multicast address: `FF02::FD`.
pub const ALL_COAP_NODES_V6_LL: Ipv6Addr = Ipv6Addr::new(0xFF02, 0, 0, 0, 0, 0, 0, 0xFD);

/// The "All CoAP Nodes" IPv6 **site**-local multicast address: `FF05::FD`.
pub const ALL_COAP_NODES_V6_SL: Ipv6Addr = Ipv6Addr::new(0xFF05, 0, 0, 0, 0, 0, 0, 0xFD);

/// Absolute path of the implicit CoRE resource-discovery resource.
pub const WELL_KNOWN_CORE: &str = "/.well-known/core";

/// Value for the `Observe` option when registering an observer.
///
/// Defined by [IETF-RFC7641](https://tools.ietf.org/html/rfc7641).
pub const OBSERVE_REGISTER: u32 = 0;

/// Value for the `Observe` option when deregistering an observer.
///
/// Defined by [IETF-RFC7641](https://tools.ietf.org/html/rfc7641).
pub const OBSERVE_DEREGISTER: u32 = 1;

/// Value for the `No-Response` option when "Not interested in 2.xx responses".
/// From [RFC7967](https://tools.ietf.org/html/rfc7967).
pub const NO_RESPONSE_SUCCESS: u8 = 0b00000010;

/// Value for the `No-Response` option when "Not interested in 4.xx responses".
/// From [RFC7967](https://tools.ietf.org/html/rfc7967).
pub const NO_RESPONSE_CLIENT_ERROR: u8 = 0b00001000;

/// Value for the `No-Response` option when "Not interested in 5.xx responses".
/// From [RFC7967](https://tools.ietf.org/html/rfc7967).
pub const NO_RESPONSE_SERVER_ERROR: u8 = 0b00010000;

/// Value for the `No-Response` option when not interested in any error response.
/// From [RFC7967](https://tools.ietf.org/html/rfc7967).
pub const NO_RESPONSE_ERROR: u8 = NO_RESPONSE_CLIENT_ERROR | NO_RESPONSE_SERVER_ERROR;

/// Enum representing the URI scheme / transport a message travels over.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Scheme {
    /// Plain CoAP-over-UDP, `coap:`.
    Coap,

    /// CoAP-over-DTLS, `coaps:`.
    Coaps,

    /// CoAP-over-TCP, `coap+tcp:`.
    CoapTcp,

    /// CoAP-over-TLS, `coaps+tcp:`.
    CoapsTcp,
}

impl Scheme {
    /// Parses a URI scheme string into a `Scheme`, if recognized.
    pub fn from_str(scheme: &str) -> Option<Scheme> {
        match scheme {
            "coap" => Some(Scheme::Coap),
            "coaps" => Some(Scheme::Coaps),
            "coap+tcp" => Some(Scheme::CoapTcp),
            "coaps+tcp" => Some(Scheme::CoapsTcp),
            _ => None,
        }
    }

    /// The canonical URI scheme string.
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Coap => "coap",
            Scheme::Coaps => "coaps",
            Scheme::CoapTcp => "coap+tcp",
            Scheme::CoapsTcp => "coaps+tcp",
        }
    }

    /// The default port for this scheme.
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Coap => DEFAULT_PORT_COAP_UDP,
            Scheme::Coaps => DEFAULT_PORT_COAP_DTLS,
            Scheme::CoapTcp => DEFAULT_PORT_COAP_TCP,
            Scheme::CoapsTcp => DEFAULT_PORT_COAP_TLS,
        }
    }

    /// Returns true if this scheme runs over a reliable byte stream
    /// (length-prefix framing, no message-ID, no retransmission).
    pub fn is_stream(self) -> bool {
        match self {
            Scheme::CoapTcp | Scheme::CoapsTcp => true,
            _ => false,
        }
    }

    /// Returns true if this scheme runs over a secured transport.
    pub fn is_secure(self) -> bool {
        match self {
            Scheme::Coaps | Scheme::CoapsTcp => true,
            _ => false,
        }
    }
}

impl Default for Scheme {
    fn default() -> Self {
        Scheme::Coap
    }
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The address family of a socket address.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum AddressFamily {
    /// IPv4.
    V4,

    /// IPv6.
    V6,
}

impl AddressFamily {
    /// The family of the given socket address.
    pub fn of(addr: &SocketAddr) -> AddressFamily {
        if addr.is_ipv4() {
            AddressFamily::V4
        } else {
            AddressFamily::V6
        }
    }

    /// The family of the given IP address.
    pub fn of_ip(addr: &IpAddr) -> AddressFamily {
        match addr {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }
}

/// The canonical "All CoAP Nodes" group address for the given family.
///
/// Used as the stand-in peer address when indexing multicast exchanges.
pub fn all_nodes_group(family: AddressFamily) -> IpAddr {
    match family {
        AddressFamily::V4 => IpAddr::V4(ALL_COAP_NODES_V4),
        AddressFamily::V6 => IpAddr::V6(ALL_COAP_NODES_V6_LL),
    }
}
