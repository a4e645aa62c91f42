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

//! The request layer: routing matched requests over the resource tree,
//! conditional semantics, and method dispatch.

use futures::future::BoxFuture;
use log::debug;

use crate::consts::WELL_KNOWN_CORE;
use crate::content_format::ContentFormat;
use crate::error::Error;
use crate::link_format;
use crate::message::{Method, MsgCode};
use crate::resource::{MethodHandler, Outcome, ResourceTree};
use crate::transaction::Transaction;

/// What dispatch produced.
pub(crate) enum Dispatch {
    /// The pipeline may continue; `tx.response` is set (or intentionally
    /// absent).
    Done,

    /// The handler deferred its outcome. The engine acknowledges the
    /// request now and applies the outcome when the future completes.
    Deferred {
        /// The resolved resource path, for the later apply step.
        path: String,
        /// The dispatched method.
        method: Method,
        /// The pending outcome.
        future: BoxFuture<'static, Result<Outcome, Error>>,
    },
}

fn respond(tx: &mut Transaction, code: MsgCode) {
    tx.response = Some(tx.reply(code));
}

/// Routes `tx.request` through the resource tree and invokes the matching
/// method handler.
pub(crate) fn receive_request(tree: &mut ResourceTree, tx: &mut Transaction) -> Dispatch {
    let path = ResourceTree::normalize(&tx.request.uri_path());

    let method = match Method::from_code(tx.request.code) {
        Some(method) => method,
        None => {
            respond(tx, MsgCode::ClientErrorMethodNotAllowed);
            return Dispatch::Done;
        }
    };

    // The discovery listing is the only implicit resource.
    if path == WELL_KNOWN_CORE {
        if method == Method::Get {
            let mut response = tx.reply(MsgCode::SuccessContent);
            response.set_content_format(ContentFormat::APPLICATION_LINK_FORMAT);
            response.payload = link_format::write_link_format(tree).into_bytes();
            tx.response = Some(response);
        } else {
            respond(tx, MsgCode::ClientErrorMethodNotAllowed);
        }
        return Dispatch::Done;
    }

    // POST dispatches to the deepest existing ancestor so a resource with
    // `allow_children` can create the missing child; everything else wants
    // an exact match.
    let target_path = if method == Method::Post {
        tree.deepest_ancestor(&path).map(|r| r.path().to_string())
    } else if tree.contains(&path) {
        Some(path.clone())
    } else {
        None
    };

    let target_path = match target_path {
        Some(target) => target,
        None => {
            respond(tx, MsgCode::ClientErrorNotFound);
            return Dispatch::Done;
        }
    };

    // Conditional semantics run against the resource at the request path.
    let exact = tree.get(&path);
    if tx.request.has_if_match() {
        let matched = match exact {
            Some(resource) => tx
                .request
                .if_match()
                .iter()
                .any(|candidate| resource.etags().iter().any(|e| e == candidate)),
            None => false,
        };
        if !matched {
            debug!("If-Match rejected {} {}", method, path);
            respond(tx, MsgCode::ClientErrorPreconditionFailed);
            return Dispatch::Done;
        }
    }
    if tx.request.if_none_match() && exact.is_some() {
        debug!("If-None-Match rejected {} {}", method, path);
        respond(tx, MsgCode::ClientErrorPreconditionFailed);
        return Dispatch::Done;
    }

    tx.resource_path = Some(target_path.clone());

    let handler = {
        let resource = match tree.get(&target_path) {
            Some(resource) => resource,
            None => {
                respond(tx, MsgCode::ClientErrorNotFound);
                return Dispatch::Done;
            }
        };
        match resource.handler(method) {
            Some(handler) => handler.clone(),
            None => {
                debug!("{} {} has no handler", method, target_path);
                respond(tx, MsgCode::ClientErrorMethodNotAllowed);
                return Dispatch::Done;
            }
        }
    };

    match handler {
        MethodHandler::Simple(f) => {
            let result = match tree.get(&target_path) {
                Some(resource) => f(resource, &tx.request),
                None => Err(Error::NotFound),
            };
            apply_outcome(tree, tx, &target_path, method, result);
            Dispatch::Done
        }
        MethodHandler::Deferred(f) => {
            let future = match tree.get(&target_path) {
                Some(resource) => f(resource, &tx.request),
                None => {
                    respond(tx, MsgCode::ClientErrorNotFound);
                    return Dispatch::Done;
                }
            };
            Dispatch::Deferred {
                path: target_path,
                method,
                future,
            }
        }
    }
}

/// Turns a handler outcome into the prepared response, mutating the tree
/// where the outcome demands it, then lets the advanced hook touch up the
/// response.
pub(crate) fn apply_outcome(
    tree: &mut ResourceTree,
    tx: &mut Transaction,
    target_path: &str,
    method: Method,
    result: Result<Outcome, Error>,
) {
    let request_path = ResourceTree::normalize(&tx.request.uri_path());

    match result {
        Err(error) => {
            let code = error
                .response_code()
                .unwrap_or(MsgCode::ServerErrorInternalServerError);
            respond(tx, code);
        }

        Ok(Outcome::Content { payload, format }) => {
            if method == Method::Get {
                apply_representation(tree, tx, target_path, payload, format);
            } else {
                // A write returning a representation stores it and reports
                // Changed.
                if let Some(resource) = tree.get_mut(target_path) {
                    resource.store_payload(format, payload);
                }
                respond(tx, MsgCode::SuccessChanged);
            }
        }

        Ok(Outcome::Created(resource)) => {
            tree.insert(&request_path, resource);
            tx.resource_path = Some(request_path.clone());

            let mut response = tx.reply(MsgCode::SuccessCreated);
            response.set_location_path(request_path.trim_start_matches('/'));
            if let Some(query) = tx.request.uri_query() {
                response.set_location_query(&query);
            }
            tx.response = Some(response);
        }

        Ok(Outcome::Deleted(true)) => {
            if let Some(resource) = tree.get_mut(target_path) {
                resource.mark_deleted();
            }
            tree.remove(target_path);
            respond(tx, MsgCode::SuccessDeleted);
        }

        Ok(Outcome::Deleted(false)) => {
            respond(tx, MsgCode::ServerErrorInternalServerError);
        }
    }

    // The advanced hook sees the prepared response and may mutate it.
    let hook = tree
        .get(target_path)
        .and_then(|resource| resource.advanced_handler(method).cloned());
    if let Some(hook) = hook {
        if let Some(response) = tx.response.as_mut() {
            hook(&tx.request, response);
        }
    }
}

fn apply_representation(
    tree: &ResourceTree,
    tx: &mut Transaction,
    target_path: &str,
    payload: Vec<u8>,
    format: ContentFormat,
) {
    let resource = match tree.get(target_path) {
        Some(resource) => resource,
        None => {
            respond(tx, MsgCode::ClientErrorNotFound);
            return;
        }
    };

    // Accept negotiation: fall back to a stored representation in the
    // requested format, or refuse.
    let (payload, format) = match tx.request.accept() {
        Some(accept) if accept != format => {
            match resource.stored_payload(Some(accept)) {
                Some((stored, f)) => (stored.to_vec(), f),
                None => {
                    debug!("no {} representation of {}", accept, target_path);
                    respond(tx, MsgCode::ClientErrorNotAcceptable);
                    return;
                }
            }
        }
        _ => (payload, format),
    };

    // A validation GET whose ETag still matches gets 2.03 with no payload.
    let request_etags = tx.request.etags();
    if !request_etags.is_empty() {
        if let Some(current) = resource.etags().first() {
            if request_etags.iter().any(|e| *e == current.as_slice()) {
                let mut response = tx.reply(MsgCode::SuccessValid);
                response.add_etag(current);
                tx.response = Some(response);
                return;
            }
        }
    }

    let mut response = tx.reply(MsgCode::SuccessContent);
    response.set_content_format(format);
    response.payload = payload;
    if let Some(age) = resource.max_age_value() {
        response.set_max_age(age);
    }
    if let Some(etag) = resource.etags().first() {
        response.add_etag(etag);
    }
    tx.response = Some(response);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, Token};
    use crate::resource::Resource;

    fn transaction(method: Method, path: &str) -> Transaction {
        let mut request = Message::request(method);
        request.mid = Some(1);
        request.token = Token::new(&[7]);
        request.source = Some("127.0.0.1:40000".parse().unwrap());
        request.destination = Some("127.0.0.1:5683".parse().unwrap());
        request.set_uri_path(path);
        Transaction::new(request)
    }

    fn demo_tree() -> ResourceTree {
        let mut tree = ResourceTree::new();
        tree.insert(
            "/basic",
            Resource::new("basic")
                .payload("hello")
                .handle(Method::Get, |resource, _request| {
                    let (payload, format) = resource.stored_payload(None).unwrap();
                    Ok(Outcome::content(payload.to_vec(), format))
                })
                .handle(Method::Put, |_resource, request| {
                    Ok(Outcome::content(
                        request.payload.clone(),
                        request
                            .content_format()
                            .unwrap_or(ContentFormat::TEXT_PLAIN_UTF8),
                    ))
                }),
        );
        tree.insert("/void", Resource::new("void"));
        tree.insert(
            "/storage",
            Resource::new("storage")
                .allow_children()
                .handle(Method::Post, |_resource, request| {
                    Ok(Outcome::Created(
                        Resource::new("child").payload(request.payload.clone()),
                    ))
                }),
        );
        tree
    }

    #[test]
    fn get_renders_content() {
        let mut tree = demo_tree();
        let mut tx = transaction(Method::Get, "/basic");
        assert!(matches!(receive_request(&mut tree, &mut tx), Dispatch::Done));

        let response = tx.response.as_ref().unwrap();
        assert_eq!(response.code, MsgCode::SuccessContent);
        assert_eq!(response.payload, b"hello");
        assert_eq!(response.content_format(), Some(ContentFormat::TEXT_PLAIN_UTF8));
    }

    #[test]
    fn missing_resource_is_not_found() {
        let mut tree = demo_tree();
        let mut tx = transaction(Method::Get, "/nope");
        receive_request(&mut tree, &mut tx);
        assert_eq!(
            tx.response.as_ref().unwrap().code,
            MsgCode::ClientErrorNotFound
        );
    }

    #[test]
    fn handlerless_resource_is_not_allowed() {
        let mut tree = demo_tree();
        for method in [Method::Get, Method::Put, Method::Delete].iter() {
            let mut tx = transaction(*method, "/void");
            receive_request(&mut tree, &mut tx);
            assert_eq!(
                tx.response.as_ref().unwrap().code,
                MsgCode::ClientErrorMethodNotAllowed,
                "{}",
                method
            );
        }
        // POST falls back to an ancestor only when one allows children.
        let mut tx = transaction(Method::Post, "/void");
        receive_request(&mut tree, &mut tx);
        assert_eq!(
            tx.response.as_ref().unwrap().code,
            MsgCode::ClientErrorMethodNotAllowed
        );
    }

    #[test]
    fn post_creates_child_with_location() {
        let mut tree = demo_tree();
        let mut tx = transaction(Method::Post, "/storage/new");
        tx.request.set_uri_query("id=1");
        tx.request.set_if_none_match();
        tx.request.payload = b"test".to_vec();

        receive_request(&mut tree, &mut tx);

        let response = tx.response.as_ref().unwrap();
        assert_eq!(response.code, MsgCode::SuccessCreated);
        assert_eq!(response.location_path().as_deref(), Some("storage/new"));
        assert_eq!(response.location_query().as_deref(), Some("id=1"));
        assert!(tree.contains("/storage/new"));
    }

    #[test]
    fn if_none_match_rejects_existing() {
        let mut tree = demo_tree();

        let mut tx = transaction(Method::Post, "/storage/new");
        tx.request.payload = b"test".to_vec();
        receive_request(&mut tree, &mut tx);
        assert!(tree.contains("/storage/new"));

        let mut tx = transaction(Method::Post, "/storage/new");
        tx.request.set_if_none_match();
        receive_request(&mut tree, &mut tx);
        assert_eq!(
            tx.response.as_ref().unwrap().code,
            MsgCode::ClientErrorPreconditionFailed
        );
    }

    #[test]
    fn if_match_compares_etags() {
        let mut tree = demo_tree();
        tree.insert(
            "/tagged",
            Resource::new("tagged")
                .etag(b"v1")
                .payload("x")
                .handle(Method::Put, |_r, request| {
                    Ok(Outcome::content(
                        request.payload.clone(),
                        ContentFormat::TEXT_PLAIN_UTF8,
                    ))
                }),
        );

        let mut tx = transaction(Method::Put, "/tagged");
        tx.request.add_if_match(b"v1");
        receive_request(&mut tree, &mut tx);
        assert_eq!(tx.response.as_ref().unwrap().code, MsgCode::SuccessChanged);

        let mut tx = transaction(Method::Put, "/tagged");
        tx.request.add_if_match(b"not");
        receive_request(&mut tree, &mut tx);
        assert_eq!(
            tx.response.as_ref().unwrap().code,
            MsgCode::ClientErrorPreconditionFailed
        );
    }

    #[test]
    fn put_stores_and_reports_changed() {
        let mut tree = demo_tree();
        let mut tx = transaction(Method::Put, "/basic");
        tx.request.payload = b"updated".to_vec();
        receive_request(&mut tree, &mut tx);

        assert_eq!(tx.response.as_ref().unwrap().code, MsgCode::SuccessChanged);
        let resource = tree.get("/basic").unwrap();
        assert!(resource.is_changed());
        assert_eq!(
            resource.stored_payload(None).unwrap().0,
            b"updated".as_ref()
        );
    }

    #[test]
    fn well_known_core_synthesized() {
        let mut tree = demo_tree();
        let mut tx = transaction(Method::Get, "/.well-known/core");
        receive_request(&mut tree, &mut tx);

        let response = tx.response.as_ref().unwrap();
        assert_eq!(response.code, MsgCode::SuccessContent);
        assert_eq!(
            response.content_format(),
            Some(ContentFormat::APPLICATION_LINK_FORMAT)
        );
        let listing = String::from_utf8(response.payload.clone()).unwrap();
        assert!(listing.contains("</basic>"));
    }

    #[test]
    fn accept_negotiation() {
        let mut tree = demo_tree();
        tree.insert(
            "/multi",
            Resource::new("multi")
                .payload("plain")
                .representation(ContentFormat::APPLICATION_XML, "<x/>")
                .handle(Method::Get, |resource, _request| {
                    let (payload, format) = resource.stored_payload(None).unwrap();
                    Ok(Outcome::content(payload.to_vec(), format))
                }),
        );

        let mut tx = transaction(Method::Get, "/multi");
        tx.request.set_accept(ContentFormat::APPLICATION_XML);
        receive_request(&mut tree, &mut tx);
        let response = tx.response.as_ref().unwrap();
        assert_eq!(response.payload, b"<x/>");
        assert_eq!(response.content_format(), Some(ContentFormat::APPLICATION_XML));

        let mut tx = transaction(Method::Get, "/multi");
        tx.request.set_accept(ContentFormat::APPLICATION_CBOR);
        receive_request(&mut tree, &mut tx);
        assert_eq!(
            tx.response.as_ref().unwrap().code,
            MsgCode::ClientErrorNotAcceptable
        );
    }

    #[test]
    fn delete_unlinks_subtree() {
        let mut tree = demo_tree();
        tree.insert(
            "/tmp",
            Resource::new("tmp").handle(Method::Delete, |_r, _m| Ok(Outcome::Deleted(true))),
        );
        tree.insert("/tmp/leaf", Resource::new("leaf"));

        let mut tx = transaction(Method::Delete, "/tmp");
        receive_request(&mut tree, &mut tx);

        assert_eq!(tx.response.as_ref().unwrap().code, MsgCode::SuccessDeleted);
        assert!(!tree.contains("/tmp"));
        assert!(!tree.contains("/tmp/leaf"));
    }

    #[test]
    fn advanced_hook_mutates_response() {
        let mut tree = demo_tree();
        tree.insert(
            "/adv",
            Resource::new("adv")
                .payload("x")
                .handle(Method::Get, |resource, _request| {
                    let (payload, format) = resource.stored_payload(None).unwrap();
                    Ok(Outcome::content(payload.to_vec(), format))
                })
                .handle_advanced(Method::Get, |_request, response| {
                    response.set_max_age(120);
                    response.add_etag(b"adv-tag");
                }),
        );

        let mut tx = transaction(Method::Get, "/adv");
        receive_request(&mut tree, &mut tx);

        let response = tx.response.as_ref().unwrap();
        assert_eq!(response.max_age(), Some(120));
        assert_eq!(response.etags(), vec![&b"adv-tag"[..]]);
    }
}
