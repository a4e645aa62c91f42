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

//! The layered message-processing pipeline.
//!
//! Inbound: socket, codec, [`message`], ([`block`], [`observe`]),
//! [`request`], resource, response path. Outbound: the same layers in
//! reverse. The [`callback`] layer pairs client requests with their
//! eventual responses.

pub(crate) mod block;
pub(crate) mod callback;
pub(crate) mod message;
pub(crate) mod observe;
pub(crate) mod request;
