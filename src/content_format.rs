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

/// A type for representing a CoAP Content-Format value.
#[derive(Debug, Copy, Eq, PartialEq, Hash, Clone, Ord, PartialOrd)]
pub struct ContentFormat(pub u16);

impl ContentFormat {
    /// From IETF-RFC7252.
    pub const TEXT_PLAIN_UTF8: ContentFormat = ContentFormat(0);

    /// From IETF-RFC7252.
    pub const APPLICATION_LINK_FORMAT: ContentFormat = ContentFormat(40);

    /// From IETF-RFC7252.
    pub const APPLICATION_XML: ContentFormat = ContentFormat(41);

    /// From IETF-RFC7252.
    pub const APPLICATION_OCTET_STREAM: ContentFormat = ContentFormat(42);

    /// From IETF-RFC7252.
    pub const APPLICATION_EXI: ContentFormat = ContentFormat(47);

    /// From IETF-RFC7252.
    pub const APPLICATION_JSON: ContentFormat = ContentFormat(50);

    /// From IETF-RFC7049 Concise Binary Object Representation (CBOR).
    pub const APPLICATION_CBOR: ContentFormat = ContentFormat(60);

    /// JSON-formatted RFC8428 Sensor Measurement Lists (SenML).
    pub const APPLICATION_SENML_JSON: ContentFormat = ContentFormat(110);

    /// CBOR-formatted RFC8428 Sensor Measurement Lists (SenML).
    pub const APPLICATION_SENML_CBOR: ContentFormat = ContentFormat(112);

    /// Attempts to return the MIME type associated with this content format.
    pub fn static_mime(self) -> Option<&'static str> {
        match self {
            ContentFormat::TEXT_PLAIN_UTF8 => Some("text/plain;charset=utf-8"),
            ContentFormat::APPLICATION_LINK_FORMAT => Some("application/link-format"),
            ContentFormat::APPLICATION_XML => Some("application/xml"),
            ContentFormat::APPLICATION_OCTET_STREAM => Some("application/octet-stream"),
            ContentFormat::APPLICATION_EXI => Some("application/exi"),
            ContentFormat::APPLICATION_JSON => Some("application/json"),
            ContentFormat::APPLICATION_CBOR => Some("application/cbor"),
            ContentFormat::APPLICATION_SENML_JSON => Some("application/senml+json"),
            ContentFormat::APPLICATION_SENML_CBOR => Some("application/senml+cbor"),
            _ => None,
        }
    }
}

impl Default for ContentFormat {
    fn default() -> Self {
        ContentFormat::TEXT_PLAIN_UTF8
    }
}

impl From<u16> for ContentFormat {
    fn from(x: u16) -> Self {
        ContentFormat(x)
    }
}

impl std::fmt::Display for ContentFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(mime) = self.static_mime() {
            f.write_str(mime)
        } else {
            write!(f, "application/x-coap-{}", self.0)
        }
    }
}
