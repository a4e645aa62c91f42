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

use std::fmt::{Debug, Display, Formatter};

use crate::message::MsgCode;

/// Type for errors encountered while sending or receiving CoAP requests and responses.
#[derive(Debug, Eq, PartialEq, Hash, Copy, Clone)]
pub enum Error {
    /// The wire codec rejected the header, the option stream, or the framing.
    MalformedMessage,

    /// Decoding encountered an odd-numbered option that is not in the registry.
    UnknownCriticalOption,

    /// The message matched a transaction that is already live. Handled internally.
    Duplicate,

    /// A confirmable message exhausted `MAX_RETRANSMIT` without an acknowledgement.
    Timeout,

    /// The engine was shut down, or the caller cancelled a wait.
    Cancelled,

    /// An `If-Match` or `If-None-Match` option rejected the request.
    PreconditionFailed,

    /// Resource lookup failed.
    NotFound,

    /// The resource exposes no handler for the request method.
    MethodNotAllowed,

    /// A block arrived out of order.
    RequestEntityIncomplete,

    /// The payload exceeded the size the receiver is willing to accept.
    RequestEntityTooLarge,

    /// The request asked for a representation the resource does not offer.
    NotAcceptable,

    /// A handler raised a failure it expects to recover from.
    ServiceUnavailable,

    /// A handler raised an unexpected failure.
    InternalServerError,

    /// One or more of the supplied arguments are not valid for the given operation.
    InvalidArgument,

    /// An I/O error occurred while performing this operation.
    IoError,

    /// The given URI scheme is not supported by this node.
    UnsupportedUriScheme,

    /// Unable to resolve the given host.
    HostNotFound,

    /// The transaction was reset by the peer.
    Reset,

    /// An unspecified error has occurred.
    Unspecified,
}

impl Error {
    /// The CoAP response code a protocol-level failure maps onto, if any.
    ///
    /// Transport- and caller-level failures (`IoError`, `Timeout`, ...) have no
    /// wire representation and return `None`.
    pub fn response_code(self) -> Option<MsgCode> {
        match self {
            Error::MalformedMessage => Some(MsgCode::ClientErrorBadRequest),
            Error::UnknownCriticalOption => Some(MsgCode::ClientErrorBadRequest),
            Error::PreconditionFailed => Some(MsgCode::ClientErrorPreconditionFailed),
            Error::NotFound => Some(MsgCode::ClientErrorNotFound),
            Error::MethodNotAllowed => Some(MsgCode::ClientErrorMethodNotAllowed),
            Error::RequestEntityIncomplete => {
                Some(MsgCode::ClientErrorRequestEntityIncomplete)
            }
            Error::RequestEntityTooLarge => Some(MsgCode::ClientErrorRequestEntityTooLarge),
            Error::NotAcceptable => Some(MsgCode::ClientErrorNotAcceptable),
            Error::ServiceUnavailable => Some(MsgCode::ServerErrorServiceUnavailable),
            Error::InternalServerError => Some(MsgCode::ServerErrorInternalServerError),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(_: std::io::Error) -> Self {
        Error::IoError
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        <Self as Debug>::fmt(self, f)
    }
}

impl std::error::Error for Error {}

impl Default for Error {
    fn default() -> Self {
        Error::Unspecified
    }
}
