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

//! Resources, their method handlers, and the path-indexed resource tree.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::content_format::ContentFormat;
use crate::error::Error;
use crate::message::{Message, Method};

/// What a method handler produced.
///
/// The request layer owns the resource tree; handlers describe the effect
/// they want and the engine applies it.
pub enum Outcome {
    /// A representation: payload plus its content format. Yields 2.05 for
    /// GET and 2.04 (with the payload stored on the resource) for writes.
    Content {
        /// The representation bytes.
        payload: Vec<u8>,
        /// The format of `payload`.
        format: ContentFormat,
    },

    /// A newly created resource, inserted at the request path. Yields 2.01
    /// with `Location-Path`/`Location-Query` taken from the request.
    Created(Resource),

    /// Whether a DELETE succeeded. `true` unlinks the subtree and yields
    /// 2.02.
    Deleted(bool),
}

impl Outcome {
    /// Shorthand for a plain-text representation.
    pub fn text<S: Into<String>>(s: S) -> Outcome {
        Outcome::Content {
            payload: s.into().into_bytes(),
            format: ContentFormat::TEXT_PLAIN_UTF8,
        }
    }

    /// Shorthand for a representation with an explicit format.
    pub fn content(payload: Vec<u8>, format: ContentFormat) -> Outcome {
        Outcome::Content { payload, format }
    }
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Content { payload, format } => f
                .debug_struct("Content")
                .field("len", &payload.len())
                .field("format", format)
                .finish(),
            Outcome::Created(r) => write!(f, "Created({})", r.path()),
            Outcome::Deleted(ok) => write!(f, "Deleted({})", ok),
        }
    }
}

/// A synchronous method handler.
pub type SimpleHandler =
    Arc<dyn Fn(&Resource, &Message) -> Result<Outcome, Error> + Send + Sync>;

/// A handler that defers its outcome. The engine acknowledges the request
/// with an empty Ack and delivers the outcome as a separate confirmable
/// response once the future completes.
pub type DeferredHandler =
    Arc<dyn Fn(&Resource, &Message) -> BoxFuture<'static, Result<Outcome, Error>> + Send + Sync>;

/// A hook that receives the prepared response and may mutate it, e.g. to
/// set ETag, Max-Age, or a non-confirmable type.
pub type AdvancedHandler = Arc<dyn Fn(&Message, &mut Message) + Send + Sync>;

/// A method handler table entry.
#[derive(Clone)]
pub enum MethodHandler {
    /// Produces its outcome inline.
    Simple(SimpleHandler),

    /// Produces its outcome after the Ack, as a separate response.
    Deferred(DeferredHandler),
}

impl std::fmt::Debug for MethodHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MethodHandler::Simple(_) => f.write_str("Simple(..)"),
            MethodHandler::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// A node of the resource tree.
#[derive(Clone)]
pub struct Resource {
    name: String,
    path: String,
    visible: bool,
    observable: bool,
    allow_children: bool,
    payloads: BTreeMap<u16, Vec<u8>>,
    default_format: ContentFormat,
    etag: Vec<Vec<u8>>,
    max_age: Option<u32>,
    attributes: BTreeMap<String, String>,
    changed: bool,
    deleted: bool,
    handlers: HashMap<Method, MethodHandler>,
    advanced: HashMap<Method, AdvancedHandler>,
}

impl Resource {
    /// Creates a new, visible, non-observable resource.
    pub fn new(name: &str) -> Resource {
        Resource {
            name: name.to_string(),
            path: String::new(),
            visible: true,
            observable: false,
            allow_children: false,
            payloads: BTreeMap::new(),
            default_format: ContentFormat::TEXT_PLAIN_UTF8,
            etag: Vec::new(),
            max_age: None,
            attributes: BTreeMap::new(),
            changed: false,
            deleted: false,
            handlers: HashMap::new(),
            advanced: HashMap::new(),
        }
    }

    /// Creates the invisible placeholder used for auto-created intermediate
    /// nodes.
    pub(crate) fn placeholder(name: &str) -> Resource {
        let mut r = Resource::new(name);
        r.visible = false;
        r.allow_children = true;
        r
    }

    /// The resource name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The absolute path this resource is mounted at. Empty until inserted
    /// into a tree.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn set_path(&mut self, path: String) {
        self.path = path;
    }

    /// Whether this resource appears in the discovery listing.
    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// Whether this resource admits observe subscriptions.
    pub fn is_observable(&self) -> bool {
        self.observable
    }

    /// Whether POSTs below this path dispatch to this resource.
    pub fn allows_children(&self) -> bool {
        self.allow_children
    }

    /// Hides the resource from the discovery listing.
    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    /// Marks the resource observable.
    pub fn observable(mut self) -> Self {
        self.observable = true;
        self
    }

    /// Lets POSTs below this path create children through this resource.
    pub fn allow_children(mut self) -> Self {
        self.allow_children = true;
        self
    }

    /// Sets a link-format attribute such as `rt` or `if`.
    pub fn attribute(mut self, key: &str, value: &str) -> Self {
        self.attributes.insert(key.to_string(), value.to_string());
        self
    }

    /// Sets the advertised `Max-Age`.
    pub fn max_age(mut self, seconds: u32) -> Self {
        self.max_age = Some(seconds);
        self
    }

    /// Seeds the stored representation for the default content format.
    pub fn payload<P: Into<Vec<u8>>>(mut self, payload: P) -> Self {
        self.payloads.insert(self.default_format.0, payload.into());
        self
    }

    /// Seeds the stored representation for a specific content format.
    pub fn representation<P: Into<Vec<u8>>>(
        mut self,
        format: ContentFormat,
        payload: P,
    ) -> Self {
        self.payloads.insert(format.0, payload.into());
        self
    }

    /// Sets the resource ETag.
    pub fn etag(mut self, etag: &[u8]) -> Self {
        self.etag = vec![etag.to_vec()];
        self
    }

    /// Installs a handler for the given method.
    pub fn handle<F>(mut self, method: Method, handler: F) -> Self
    where
        F: Fn(&Resource, &Message) -> Result<Outcome, Error> + Send + Sync + 'static,
    {
        self.handlers
            .insert(method, MethodHandler::Simple(Arc::new(handler)));
        self
    }

    /// Installs a deferred handler for the given method.
    pub fn handle_deferred<F>(mut self, method: Method, handler: F) -> Self
    where
        F: Fn(&Resource, &Message) -> BoxFuture<'static, Result<Outcome, Error>>
            + Send
            + Sync
            + 'static,
    {
        self.handlers
            .insert(method, MethodHandler::Deferred(Arc::new(handler)));
        self
    }

    /// Installs an advanced hook for the given method. The hook runs after
    /// the prepared response is built and may mutate it.
    pub fn handle_advanced<F>(mut self, method: Method, hook: F) -> Self
    where
        F: Fn(&Message, &mut Message) + Send + Sync + 'static,
    {
        self.advanced.insert(method, Arc::new(hook));
        self
    }

    /// The handler installed for the given method, if any.
    pub fn handler(&self, method: Method) -> Option<&MethodHandler> {
        self.handlers.get(&method)
    }

    /// The advanced hook installed for the given method, if any.
    pub fn advanced_handler(&self, method: Method) -> Option<&AdvancedHandler> {
        self.advanced.get(&method)
    }

    /// The stored representation best matching `format`, together with the
    /// format actually chosen.
    pub fn stored_payload(
        &self,
        format: Option<ContentFormat>,
    ) -> Option<(&[u8], ContentFormat)> {
        match format {
            Some(f) => self
                .payloads
                .get(&f.0)
                .map(|p| (p.as_slice(), f)),
            None => {
                if let Some(p) = self.payloads.get(&self.default_format.0) {
                    return Some((p.as_slice(), self.default_format));
                }
                self.payloads
                    .iter()
                    .next()
                    .map(|(k, p)| (p.as_slice(), ContentFormat(*k)))
            }
        }
    }

    /// Returns true if the resource stores a representation in `format`.
    pub fn offers(&self, format: ContentFormat) -> bool {
        self.payloads.contains_key(&format.0)
    }

    /// The content formats with stored representations, ascending.
    pub fn content_formats(&self) -> Vec<ContentFormat> {
        self.payloads.keys().map(|k| ContentFormat(*k)).collect()
    }

    /// Replaces the stored representation for `format` and raises the
    /// changed flag.
    pub fn store_payload(&mut self, format: ContentFormat, payload: Vec<u8>) {
        self.payloads.insert(format.0, payload);
        self.changed = true;
    }

    /// The resource ETag list.
    pub fn etags(&self) -> &[Vec<u8>] {
        &self.etag
    }

    /// Replaces the resource ETag.
    pub fn set_etag(&mut self, etag: Vec<u8>) {
        self.etag = vec![etag];
    }

    /// The advertised `Max-Age`, if any.
    pub fn max_age_value(&self) -> Option<u32> {
        self.max_age
    }

    /// The link-format attribute map.
    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub(crate) fn is_changed(&self) -> bool {
        self.changed
    }

    pub(crate) fn clear_changed(&mut self) {
        self.changed = false;
    }

    pub(crate) fn mark_deleted(&mut self) {
        self.deleted = true;
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.deleted
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("visible", &self.visible)
            .field("observable", &self.observable)
            .field("allow_children", &self.allow_children)
            .field("formats", &self.payloads.keys().collect::<Vec<_>>())
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// The path-indexed resource tree.
///
/// Every path from the root to a resource exists as an intermediate node
/// before a descendant can be inserted; `insert` auto-creates invisible
/// placeholders for the missing ones.
#[derive(Debug)]
pub struct ResourceTree {
    nodes: BTreeMap<String, Resource>,
}

impl ResourceTree {
    /// Creates a tree holding only the invisible root node.
    pub fn new() -> ResourceTree {
        let mut nodes = BTreeMap::new();
        let mut root = Resource::placeholder("root");
        root.set_path("/".to_string());
        nodes.insert("/".to_string(), root);
        ResourceTree { nodes }
    }

    /// Normalizes a path to the canonical `/a/b` form.
    pub fn normalize(path: &str) -> String {
        let mut out = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            out.push('/');
            out.push_str(segment);
        }
        if out.is_empty() {
            out.push('/');
        }
        out
    }

    /// Inserts `resource` at `path`, auto-creating missing intermediates.
    pub fn insert(&mut self, path: &str, mut resource: Resource) {
        let path = Self::normalize(path);
        if path == "/" {
            return;
        }

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut prefix = String::new();
        for segment in &segments[..segments.len() - 1] {
            prefix.push('/');
            prefix.push_str(segment);
            if !self.nodes.contains_key(&prefix) {
                let mut placeholder = Resource::placeholder(segment);
                placeholder.set_path(prefix.clone());
                self.nodes.insert(prefix.clone(), placeholder);
            }
        }

        resource.set_path(path.clone());
        self.nodes.insert(path, resource);
    }

    /// Looks up the resource at exactly `path`.
    pub fn get(&self, path: &str) -> Option<&Resource> {
        self.nodes.get(&Self::normalize(path))
    }

    /// Mutable lookup of the resource at exactly `path`.
    pub fn get_mut(&mut self, path: &str) -> Option<&mut Resource> {
        self.nodes.get_mut(&Self::normalize(path))
    }

    /// Returns true if a resource exists at exactly `path`.
    pub fn contains(&self, path: &str) -> bool {
        self.nodes.contains_key(&Self::normalize(path))
    }

    /// Unlinks the subtree rooted at `path`, returning the resource that
    /// was mounted there.
    pub fn remove(&mut self, path: &str) -> Option<Resource> {
        let path = Self::normalize(path);
        if path == "/" {
            return None;
        }
        let removed = self.nodes.remove(&path);
        let prefix = format!("{}/", path);
        let children: Vec<String> = self
            .nodes
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        for child in children {
            self.nodes.remove(&child);
        }
        removed
    }

    /// The deepest existing ancestor of `path` (including `path` itself)
    /// that allows children. POST dispatch uses this.
    pub fn deepest_ancestor(&self, path: &str) -> Option<&Resource> {
        let path = Self::normalize(path);
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        for depth in (0..=segments.len()).rev() {
            let candidate = if depth == 0 {
                "/".to_string()
            } else {
                format!("/{}", segments[..depth].join("/"))
            };
            if let Some(resource) = self.nodes.get(&candidate) {
                if candidate == path || resource.allow_children {
                    return Some(resource);
                }
            }
        }
        None
    }

    /// Iterates every visible resource in path order.
    pub fn visible(&self) -> impl Iterator<Item = &Resource> {
        self.nodes.values().filter(|r| r.is_visible())
    }

    /// Iterates every resource in path order.
    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.nodes.values()
    }
}

impl Default for ResourceTree {
    fn default() -> Self {
        ResourceTree::new()
    }
}
