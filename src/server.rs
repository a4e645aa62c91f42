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

//! The engine: one object operating symmetrically as CoAP client and
//! server, multiplexing any number of bound endpoints.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::consts::{AddressFamily, Scheme};
use crate::endpoint::tcp::{ConnectionState, FrameBuffer};
use crate::endpoint::{
    self, udp, Endpoint, EndpointParams, EndpointTable, SecureDatagramSocket, SecureParams,
    SecureTransportFactory, Transport,
};
use crate::error::Error;
use crate::layers::block::BlockLayer;
use crate::layers::callback::CallbackLayer;
use crate::layers::message::{MessageLayer, RequestDisposition, ResponseMatch};
use crate::layers::observe::ObserveLayer;
use crate::layers::request::{self, Dispatch};
use crate::message::framed::{self, CsmSettings};
use crate::message::{codec, Message, MsgCode, MsgType, Token};
use crate::resource::{Resource, ResourceTree};
use crate::trans_params::TransParams;
use crate::transaction::{self, SharedTransaction, Transaction};

/// Which side of an exchange a retransmission task is resending.
#[derive(Copy, Clone, Eq, PartialEq)]
enum Resending {
    Request,
    Response,
}

/// An asynchronous CoAP endpoint, acting as client and server over any
/// number of bound sockets.
///
/// ```no_run
/// # use coap_node::{Server, EndpointParams, Resource, Method, Outcome};
/// # async fn demo() -> Result<(), coap_node::Error> {
/// let server = Server::new();
/// server
///     .add_endpoint("coap://127.0.0.1:5683", EndpointParams::default())
///     .await?;
/// server.add_resource(
///     "basic/",
///     Resource::new("basic")
///         .payload("hello")
///         .handle(Method::Get, |resource, _request| {
///             let (payload, format) = resource.stored_payload(None).unwrap();
///             Ok(Outcome::content(payload.to_vec(), format))
///         }),
/// );
/// # Ok(())
/// # }
/// ```
pub struct Server {
    inner: Arc<ServerInner>,
}

pub(crate) struct ServerInner {
    this: Weak<ServerInner>,
    params: TransParams,
    message_layer: Mutex<MessageLayer>,
    block_layer: Mutex<BlockLayer>,
    observe_layer: Mutex<ObserveLayer>,
    callback_layer: CallbackLayer,
    resources: Mutex<ResourceTree>,
    endpoints: Mutex<EndpointTable>,
    secure_factory: Mutex<Option<Arc<dyn SecureTransportFactory>>>,
    stream_writers: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<Vec<u8>>>>,
    stop: watch::Sender<bool>,
    stopped: AtomicBool,
    purge_started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    /// Creates an engine with the standard transmission parameters.
    pub fn new() -> Server {
        Server::with_params(TransParams::default())
    }

    /// Creates an engine with custom transmission parameters.
    pub fn with_params(params: TransParams) -> Server {
        let (stop, _) = watch::channel(false);
        let max_payload = params.max_payload;
        let inner = Arc::new_cyclic(|this| ServerInner {
            this: this.clone(),
            params,
            message_layer: Mutex::new(MessageLayer::new()),
            block_layer: Mutex::new(BlockLayer::new(max_payload)),
            observe_layer: Mutex::new(ObserveLayer::new()),
            callback_layer: CallbackLayer::new(),
            resources: Mutex::new(ResourceTree::new()),
            endpoints: Mutex::new(EndpointTable::new()),
            secure_factory: Mutex::new(None),
            stream_writers: Mutex::new(HashMap::new()),
            stop,
            stopped: AtomicBool::new(false),
            purge_started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });
        Server { inner }
    }

    /// Installs the factory `coaps://` endpoints bind through.
    pub fn set_secure_transport(&self, factory: Arc<dyn SecureTransportFactory>) {
        *self.inner.secure_factory.lock().expect("Lock failed") = Some(factory);
    }

    /// Binds the endpoints described by `uri` and begins listening.
    /// Returns the bound local addresses.
    pub async fn add_endpoint(
        &self,
        uri: &str,
        params: EndpointParams,
    ) -> Result<Vec<SocketAddr>, Error> {
        self.inner.add_endpoint(uri, params).await
    }

    /// Inserts a resource into the tree, auto-creating missing
    /// intermediate nodes.
    pub fn add_resource(&self, path: &str, resource: Resource) {
        self.inner
            .resources
            .lock()
            .expect("Lock failed")
            .insert(path, resource);
    }

    /// Unlinks the subtree at `path`, telling its observers the resource
    /// is gone.
    pub async fn remove_resource(&self, path: &str) -> Option<Resource> {
        let removed = self
            .inner
            .resources
            .lock()
            .expect("Lock failed")
            .remove(path);
        if removed.is_some() {
            self.inner.notify_deleted(path).await;
        }
        removed
    }

    /// Client send. Requests return the (fully reassembled) response;
    /// `no_response` fires and forgets; `timeout` bounds the wait.
    pub async fn send_message(
        &self,
        message: Message,
        no_response: bool,
        timeout: Option<Duration>,
    ) -> Result<Option<Message>, Error> {
        self.inner.send_message(message, no_response, timeout).await
    }

    /// Rebuilds and delivers a notification to every observer of `path`.
    /// Writes arriving through the request layer trigger this on their
    /// own; call it after changing a resource externally.
    pub async fn notify(&self, path: &str) {
        self.inner.notify_observers(path).await;
    }

    /// Stops the engine: cancels outstanding waits and retransmissions and
    /// releases the sockets. Idempotent.
    pub async fn close(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping engine");
        let _ = self.inner.stop.send(true);
        self.inner.callback_layer.fail_all(Error::Cancelled);

        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.inner.tasks.lock().expect("Lock failed");
            tasks.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }

        self.inner.endpoints.lock().expect("Lock failed").clear();
        self.inner
            .stream_writers
            .lock()
            .expect("Lock failed")
            .clear();
    }
}

impl Default for Server {
    fn default() -> Self {
        Server::new()
    }
}

impl ServerInner {
    fn arc(&self) -> Arc<ServerInner> {
        self.this.upgrade().expect("engine is alive")
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks.lock().expect("Lock failed").push(task);
    }

    // -----------------------------------------------------------------
    // Endpoint multiplexer

    async fn add_endpoint(
        &self,
        uri: &str,
        params: EndpointParams,
    ) -> Result<Vec<SocketAddr>, Error> {
        let (scheme, addr) = endpoint::parse_coap_uri(uri)?;
        self.ensure_purge_task();

        match scheme {
            Scheme::Coap => {
                if params.multicast {
                    let port = params.multicast_port.unwrap_or_else(|| scheme.default_port());
                    let bind = SocketAddr::new(addr.ip(), port);
                    let (socket, groups) =
                        udp::bind_multicast(bind, &params.multicast_addresses).await?;
                    let local = socket.local_addr()?;
                    let endpoint = Arc::new(Endpoint::new(
                        scheme,
                        local,
                        groups,
                        Transport::Udp(socket.clone()),
                    ));
                    self.endpoints.lock().expect("Lock failed").add(endpoint.clone());
                    self.spawn_udp_receiver(endpoint, socket);
                    Ok(vec![local])
                } else {
                    let socket = udp::bind_unicast(addr).await?;
                    let local = socket.local_addr()?;
                    let endpoint = Arc::new(Endpoint::new(
                        scheme,
                        local,
                        Vec::new(),
                        Transport::Udp(socket.clone()),
                    ));
                    self.endpoints.lock().expect("Lock failed").add(endpoint.clone());
                    self.spawn_udp_receiver(endpoint, socket);
                    Ok(vec![local])
                }
            }

            Scheme::Coaps => {
                let factory = self
                    .secure_factory
                    .lock()
                    .expect("Lock failed")
                    .clone()
                    .ok_or(Error::UnsupportedUriScheme)?;
                let secure_params = SecureParams {
                    certfile: params.certfile.clone(),
                    keyfile: params.keyfile.clone(),
                };
                let socket = factory.bind(addr, &secure_params).await?;
                let local = socket.local_addr()?;
                let endpoint = Arc::new(Endpoint::new(
                    scheme,
                    local,
                    Vec::new(),
                    Transport::Secure(socket.clone()),
                ));
                self.endpoints.lock().expect("Lock failed").add(endpoint.clone());
                self.spawn_secure_receiver(endpoint, socket);
                Ok(vec![local])
            }

            Scheme::CoapTcp => {
                let listener = TcpListener::bind(addr).await?;
                let local = listener.local_addr()?;
                let endpoint =
                    Arc::new(Endpoint::new(scheme, local, Vec::new(), Transport::Stream));
                self.endpoints.lock().expect("Lock failed").add(endpoint.clone());
                self.spawn_stream_acceptor(endpoint, listener);
                info!("bound coap+tcp://{}", local);
                Ok(vec![local])
            }

            Scheme::CoapsTcp => Err(Error::UnsupportedUriScheme),
        }
    }

    fn ensure_purge_task(&self) {
        if self.purge_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.arc();
        let mut stop = self.stop.subscribe();
        let task = tokio::spawn(async move {
            let lifetime = inner.params.exchange_lifetime();
            loop {
                tokio::select! {
                    _ = stop.changed() => return,
                    _ = sleep(lifetime) => {
                        let evicted = inner
                            .message_layer
                            .lock()
                            .expect("Lock failed")
                            .purge(lifetime);
                        let mut blocks = inner.block_layer.lock().expect("Lock failed");
                        for key in &evicted {
                            blocks.purge(key);
                        }
                    }
                }
            }
        });
        self.track(task);
    }

    fn spawn_udp_receiver(
        &self,
        endpoint: Arc<Endpoint>,
        socket: Arc<tokio::net::UdpSocket>,
    ) {
        let inner = self.arc();
        let mut stop = self.stop.subscribe();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                tokio::select! {
                    _ = stop.changed() => return,
                    result = socket.recv_from(&mut buf) => match result {
                        Ok((len, source)) => {
                            inner
                                .datagram_received(&buf[..len], source, &endpoint)
                                .await;
                        }
                        Err(e) => {
                            error!("recv_from: io error: {:?}", e);
                            sleep(Duration::from_millis(10)).await;
                        }
                    }
                }
            }
        });
        self.track(task);
    }

    fn spawn_secure_receiver(
        &self,
        endpoint: Arc<Endpoint>,
        socket: Arc<dyn SecureDatagramSocket>,
    ) {
        let inner = self.arc();
        let mut stop = self.stop.subscribe();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                tokio::select! {
                    _ = stop.changed() => return,
                    result = socket.recv_from(&mut buf) => match result {
                        Ok((len, source)) => {
                            inner
                                .datagram_received(&buf[..len], source, &endpoint)
                                .await;
                        }
                        Err(e) => {
                            error!("secure recv_from: io error: {:?}", e);
                            sleep(Duration::from_millis(10)).await;
                        }
                    }
                }
            }
        });
        self.track(task);
    }

    // -----------------------------------------------------------------
    // Datagram reception

    async fn datagram_received(&self, data: &[u8], source: SocketAddr, endpoint: &Endpoint) {
        let mut message = match codec::decode(data) {
            Ok(message) => message,
            Err(error) => {
                debug!("undecodable datagram from {}: {:?}", source, error);
                if endpoint.is_multicast() {
                    return;
                }
                // Reject with a Reset carrying the offending code and the
                // received message-ID, when one could be read.
                let mid = if data.len() >= 4 {
                    (u16::from(data[2]) << 8) | u16::from(data[3])
                } else {
                    0
                };
                let code = error
                    .response_code()
                    .unwrap_or(MsgCode::ClientErrorBadRequest);
                let mut reset = Message::reset(mid, code);
                reset.destination = Some(source);
                reset.source = Some(endpoint.address());
                reset.scheme = endpoint.scheme();
                let _ = self.transmit(&reset).await;
                return;
            }
        };

        message.source = Some(source);
        message.destination = Some(endpoint.address());
        message.scheme = endpoint.scheme();
        message.multicast = endpoint.is_multicast();
        debug!("INBOUND: {} {}", source, message);

        if message.is_request() {
            self.handle_request(message).await;
        } else if message.is_response() {
            self.handle_response(message).await;
        } else if message.is_empty_code() {
            self.handle_empty(message).await;
        }
    }

    async fn handle_request(&self, message: Message) {
        let disposition = self
            .message_layer
            .lock()
            .expect("Lock failed")
            .receive_request(message);

        match disposition {
            RequestDisposition::Duplicate(shared) => {
                let tx = shared.lock().await;
                if tx.completed {
                    if let Some(response) = tx.response.clone() {
                        debug!("duplicate: retransmitting cached response");
                        drop(tx);
                        let _ = self.transmit(&response).await;
                        return;
                    }
                }
                if tx.request.msg_type == Some(MsgType::Con) {
                    debug!("duplicate: acknowledging again");
                    let request = tx.request.clone();
                    drop(tx);
                    self.send_empty_ack(&request).await;
                }
            }
            RequestDisposition::New(shared) => {
                self.process_request(shared).await;
            }
        }
    }

    /// The server-side pipeline: block, observe, request layers, then the
    /// response path. Runs under the per-transaction lock.
    async fn process_request(&self, shared: SharedTransaction) {
        let mut tx = shared.lock().await;

        let separate_timer = self.spawn_separate_timer(shared.clone());

        self.block_layer
            .lock()
            .expect("Lock failed")
            .receive_request(&mut tx);
        if tx.block_transfer {
            separate_timer.abort();
            let response = {
                self.message_layer
                    .lock()
                    .expect("Lock failed")
                    .send_response(&shared, &mut tx);
                tx.response.clone()
            };
            if let Some(response) = response {
                let _ = self.transmit(&response).await;
            }
            return;
        }

        {
            let tree = self.resources.lock().expect("Lock failed");
            self.observe_layer
                .lock()
                .expect("Lock failed")
                .receive_request(&mut tx, &tree);
        }

        let dispatch = {
            let mut tree = self.resources.lock().expect("Lock failed");
            request::receive_request(&mut tree, &mut tx)
        };

        match dispatch {
            Dispatch::Done => {
                separate_timer.abort();
                self.finish_request(&shared, &mut tx).await;
            }
            Dispatch::Deferred {
                path,
                method,
                future,
            } => {
                // Release the exchange lock so the separate-response timer
                // can acknowledge while the handler runs.
                drop(tx);
                let inner = self.arc();
                let shared = shared.clone();
                tokio::spawn(async move {
                    let result = future.await;
                    let mut tx = shared.lock().await;
                    {
                        let mut tree = inner.resources.lock().expect("Lock failed");
                        request::apply_outcome(&mut tree, &mut tx, &path, method, result);
                    }
                    separate_timer.abort();
                    inner.finish_request(&shared, &mut tx).await;
                });
            }
        }
    }

    /// The tail of the pipeline: observe annotation, block segmentation,
    /// message-layer bookkeeping, transmission, retransmission.
    async fn finish_request(&self, shared: &SharedTransaction, tx: &mut Transaction) {
        let changed_path = {
            let mut tree = self.resources.lock().expect("Lock failed");
            match tx.resource_path.as_ref().and_then(|p| tree.get_mut(p)) {
                Some(resource) if resource.is_changed() => {
                    resource.clear_changed();
                    Some(resource.path().to_string())
                }
                _ => None,
            }
        };
        let deleted_path = match tx.response.as_ref() {
            Some(response) if response.code == MsgCode::SuccessDeleted => {
                tx.resource_path.clone()
            }
            _ => None,
        };

        self.observe_layer
            .lock()
            .expect("Lock failed")
            .send_response(tx);
        self.block_layer
            .lock()
            .expect("Lock failed")
            .send_response(tx);
        self.message_layer
            .lock()
            .expect("Lock failed")
            .send_response(shared, tx);

        if let Some(response) = tx.response.clone() {
            let suppressed = tx.request.suppresses_response(response.code)
                || (tx.request.multicast && response.code.is_error());
            if suppressed {
                debug!("response suppressed: {}", response);
            } else if tx.request.multicast {
                // Multicast responses wait a random leisure period.
                let inner = self.arc();
                let delay = self.params.leisure_delay();
                tokio::spawn(async move {
                    sleep(delay).await;
                    let _ = inner.transmit(&response).await;
                });
            } else {
                let _ = self.transmit(&response).await;
                if response.msg_type == Some(MsgType::Con) {
                    self.start_retransmission(shared, tx, response, Resending::Response);
                }
            }
        }

        if let Some(path) = deleted_path {
            self.notify_deleted(&path).await;
        }
        if let Some(path) = changed_path {
            self.notify_observers(&path).await;
        }
    }

    async fn handle_response(&self, message: Message) {
        let matched = self
            .message_layer
            .lock()
            .expect("Lock failed")
            .receive_response(&message);

        match matched {
            ResponseMatch::Matched {
                transaction,
                by_mid,
                send_ack,
            } => {
                let mut tx = transaction.lock().await;
                if by_mid && tx.request.token != message.token {
                    warn!("tokens do not match response from {:?}", message.source);
                    return;
                }
                tx.request_acknowledged = true;
                tx.completed = true;
                tx.stop_retransmit();
                tx.response = Some(message.clone());
                let token = tx.request.token;
                drop(tx);

                if send_ack {
                    self.send_empty_ack(&message).await;
                }
                self.callback_layer.complete(token, Ok(message));
            }
            ResponseMatch::Unmatched => {
                // Log and discard; the warning came from the layer.
            }
        }
    }

    async fn handle_empty(&self, message: Message) {
        if message.msg_type == Some(MsgType::Con) {
            // An empty CON is the CoAP ping; answer with Reset.
            debug!("ping from {:?}", message.source);
            let mut reset = Message::reset(message.mid.unwrap_or(0), MsgCode::Empty);
            reset.destination = message.source;
            reset.scheme = message.scheme;
            let _ = self.transmit(&reset).await;
            return;
        }

        let matched = self
            .message_layer
            .lock()
            .expect("Lock failed")
            .receive_empty(&message);
        let shared = match matched {
            Some(shared) => shared,
            None => return,
        };

        let mut tx = shared.lock().await;
        match message.msg_type {
            Some(MsgType::Ack) => {
                if !tx.request_acknowledged {
                    tx.request_acknowledged = true;
                } else if tx.response.is_some() && !tx.response_acknowledged {
                    tx.response_acknowledged = true;
                    tx.completed = true;
                }
                tx.stop_retransmit();
            }
            Some(MsgType::Rst) => {
                if !tx.request_acknowledged {
                    tx.request_rejected = true;
                } else {
                    tx.response_rejected = true;
                }
                tx.completed = true;
                tx.stop_retransmit();
                let token = tx.request.token;
                let peer = message.source;
                let was_waiting = self.callback_layer.is_waiting(token);
                drop(tx);

                // A Reset against a notification removes the subscription.
                if let Some(peer) = peer {
                    self.observe_layer
                        .lock()
                        .expect("Lock failed")
                        .remove_subscriber(peer, token);
                }
                if was_waiting {
                    self.callback_layer.complete(token, Err(Error::Reset));
                }
            }
            _ => {}
        }
    }

    // -----------------------------------------------------------------
    // Observe notifications

    async fn notify_observers(&self, path: &str) {
        let subscriptions = self.observe_layer.lock().expect("Lock failed").notify(path);
        if subscriptions.is_empty() {
            return;
        }
        debug!("notifying {} observers of {}", subscriptions.len(), path);

        for subscription in subscriptions {
            let shared = transaction::shared(subscription.request.clone());
            let mut tx = shared.lock().await;
            tx.notification = true;
            // The registration exchange is long gone; notifications travel
            // as separate confirmables.
            tx.request_acknowledged = true;

            let dispatch = {
                let mut tree = self.resources.lock().expect("Lock failed");
                request::receive_request(&mut tree, &mut tx)
            };
            if let Dispatch::Deferred {
                path: target,
                method,
                future,
            } = dispatch
            {
                let result = future.await;
                let mut tree = self.resources.lock().expect("Lock failed");
                request::apply_outcome(&mut tree, &mut tx, &target, method, result);
            }

            self.observe_layer
                .lock()
                .expect("Lock failed")
                .send_response(&mut tx);
            self.block_layer
                .lock()
                .expect("Lock failed")
                .send_response(&mut tx);
            self.message_layer
                .lock()
                .expect("Lock failed")
                .send_response(&shared, &mut tx);

            if let Some(response) = tx.response.clone() {
                let _ = self.transmit(&response).await;
                if response.msg_type == Some(MsgType::Con) {
                    self.start_retransmission(&shared, &mut tx, response, Resending::Response);
                }
            }
        }
    }

    /// Tells every observer of a removed resource that it is gone.
    async fn notify_deleted(&self, path: &str) {
        let orphans = self.observe_layer.lock().expect("Lock failed").take_all(path);
        for subscription in orphans {
            let mut notice = Message::response(MsgCode::ClientErrorNotFound);
            notice.msg_type = Some(MsgType::Non);
            notice.mid = Some(self.message_layer.lock().expect("Lock failed").fetch_mid());
            notice.token = subscription.token;
            notice.destination = Some(subscription.peer);
            notice.scheme = subscription.request.scheme;
            let _ = self.transmit(&notice).await;
        }
    }

    // -----------------------------------------------------------------
    // Client sends

    async fn send_message(
        &self,
        mut message: Message,
        no_response: bool,
        timeout: Option<Duration>,
    ) -> Result<Option<Message>, Error> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }

        if !message.is_request() {
            // Bare Ack/Reset emission.
            self.transmit(&message).await?;
            return Ok(None);
        }

        let dest = message.destination.ok_or(Error::InvalidArgument)?;
        message.multicast = dest.ip().is_multicast();

        // The token keys both the block store and the waiter, so settle it
        // before splitting the payload.
        if message.token.is_empty() {
            message.token = self
                .message_layer
                .lock()
                .expect("Lock failed")
                .unique_token(dest);
        }
        let token = message.token;

        self.block_layer
            .lock()
            .expect("Lock failed")
            .send_request(&mut message);

        if no_response {
            if message.msg_type.is_none() {
                message.msg_type = Some(MsgType::Non);
            }
            if message.mid.is_none() && !message.scheme.is_stream() {
                message.mid =
                    Some(self.message_layer.lock().expect("Lock failed").fetch_mid());
            }
            self.transmit(&message).await?;
            return Ok(None);
        }

        let timeout = timeout.unwrap_or(self.params.response_timeout);
        let template = message.clone();
        let mut attempt = message;
        let mut assembled: Vec<u8> = Vec::new();

        loop {
            let response = self.send_and_wait(attempt, timeout).await?;

            // Block1 staging: a Continue asks for the next slice.
            if response.code == MsgCode::SuccessContinue {
                if let Some(acked) = response.block1() {
                    let next = self
                        .block_layer
                        .lock()
                        .expect("Lock failed")
                        .next_block1(dest, token, acked);
                    if let Some((payload, block)) = next {
                        let mut next_request = template.clone();
                        next_request.mid = None;
                        next_request.payload = payload;
                        next_request.set_block1(block);
                        attempt = next_request;
                        continue;
                    }
                }
                return Ok(Some(response));
            }

            // Block2 collection: follow until the more flag clears.
            if let Some(block2) = response.block2() {
                if block2.more {
                    assembled.extend_from_slice(&response.payload);
                    let mut next_request = template.clone();
                    next_request.mid = None;
                    next_request.payload = Vec::new();
                    next_request.clear_option(crate::option::OptionNumber::BLOCK1);
                    next_request.set_block2(crate::block::Block {
                        num: block2.num + 1,
                        more: false,
                        szx: block2.szx,
                    });
                    attempt = next_request;
                    continue;
                }
                if !assembled.is_empty() {
                    assembled.extend_from_slice(&response.payload);
                    let mut full = response;
                    full.payload = std::mem::take(&mut assembled);
                    self.block_layer
                        .lock()
                        .expect("Lock failed")
                        .finish_block1(dest, token);
                    return Ok(Some(full));
                }
            }

            self.block_layer
                .lock()
                .expect("Lock failed")
                .finish_block1(dest, token);
            return Ok(Some(response));
        }
    }

    async fn send_and_wait(
        &self,
        mut message: Message,
        timeout: Duration,
    ) -> Result<Message, Error> {
        let transaction = self
            .message_layer
            .lock()
            .expect("Lock failed")
            .send_request(&mut message)?;

        let receiver = self.callback_layer.register(message.token);
        let token = message.token;

        if let Err(error) = self.transmit(&message).await {
            self.callback_layer.complete(token, Err(error));
        } else if message.msg_type == Some(MsgType::Con) && !message.scheme.is_stream() {
            let mut tx = transaction.lock().await;
            self.start_retransmission(&transaction, &mut tx, message, Resending::Request);
        }

        self.callback_layer.wait(token, receiver, timeout).await
    }

    // -----------------------------------------------------------------
    // Confirmable retransmission

    /// Schedules the binary exponential back-off loop for a confirmable
    /// we just transmitted. Call with the exchange lock held.
    fn start_retransmission(
        &self,
        shared: &SharedTransaction,
        tx: &mut Transaction,
        message: Message,
        resending: Resending,
    ) {
        let stop_notify = Arc::new(Notify::new());
        tx.retransmit_stop = Some(stop_notify.clone());

        let inner = self.arc();
        let shared = shared.clone();
        let mut engine_stop = self.stop.subscribe();

        tokio::spawn(async move {
            let mut delay = inner.params.initial_retransmit_delay();
            let mut count = 0u32;

            loop {
                tokio::select! {
                    _ = stop_notify.notified() => return,
                    _ = engine_stop.changed() => {
                        let mut tx = shared.lock().await;
                        tx.retransmit_stop = None;
                        let token = tx.request.token;
                        drop(tx);
                        if inner.callback_layer.is_waiting(token) {
                            inner.callback_layer.complete(token, Err(Error::Cancelled));
                        }
                        return;
                    }
                    _ = sleep(delay) => {
                        let mut tx = shared.lock().await;
                        let settled = match resending {
                            Resending::Request => {
                                tx.request_acknowledged || tx.request_rejected || tx.completed
                            }
                            Resending::Response => {
                                tx.response_acknowledged || tx.response_rejected
                            }
                        };
                        if settled {
                            tx.retransmit_stop = None;
                            return;
                        }

                        if count >= inner.params.max_retransmit {
                            warn!("give up on message {}", message);
                            tx.timed_out = true;
                            tx.completed = true;
                            tx.retransmit_stop = None;
                            let token = tx.request.token;
                            drop(tx);

                            if inner.callback_layer.is_waiting(token) {
                                inner.callback_layer.complete(token, Err(Error::Timeout));
                            }
                            // An undeliverable notification removes its
                            // subscription.
                            if message.observe().is_some() {
                                if let Some(peer) = message.destination {
                                    inner
                                        .observe_layer
                                        .lock()
                                        .expect("Lock failed")
                                        .remove_subscriber(peer, message.token);
                                }
                            }
                            return;
                        }

                        count += 1;
                        delay *= 2;
                        drop(tx);
                        debug!("retransmission {} of {}", count, message);
                        let _ = inner.transmit(&message).await;
                    }
                }
            }
        });
    }

    /// Arms the separate-response timer: when the pipeline has not
    /// acknowledged the request by `PROCESSING_DELAY`, an empty Ack goes
    /// out and the eventual response travels separately.
    fn spawn_separate_timer(&self, shared: SharedTransaction) -> JoinHandle<()> {
        let inner = self.arc();
        tokio::spawn(async move {
            sleep(inner.params.processing_delay()).await;
            let mut tx = shared.lock().await;
            if tx.request.msg_type == Some(MsgType::Con)
                && !tx.request_acknowledged
                && !tx.completed
            {
                debug!("separate mode: acknowledging early");
                tx.request_acknowledged = true;
                let request = tx.request.clone();
                drop(tx);
                inner.send_empty_ack(&request).await;
            }
        })
    }

    // -----------------------------------------------------------------
    // Transmission

    async fn send_empty_ack(&self, referenced: &Message) {
        let mut ack = Message::empty_ack(referenced.mid.unwrap_or(0));
        ack.destination = referenced.source;
        ack.scheme = referenced.scheme;
        let _ = self.transmit(&ack).await;
    }

    /// Serializes and transmits through the selected endpoint. Stream
    /// messages go through the per-connection writer instead.
    async fn transmit(&self, message: &Message) -> Result<(), Error> {
        let dest = message.destination.ok_or(Error::InvalidArgument)?;

        if message.scheme.is_stream() {
            let data = framed::encode(message)?;
            let writer = self
                .stream_writers
                .lock()
                .expect("Lock failed")
                .get(&dest)
                .cloned()
                .ok_or(Error::IoError)?;
            debug!("OUTBOUND(stream): {} {}", dest, message);
            return writer.send(data).map_err(|_| Error::IoError);
        }

        let endpoint = self.endpoints.lock().expect("Lock failed").find_sending(
            message.scheme,
            AddressFamily::of(&dest),
            message.source,
        )?;

        let mut out = message.clone();
        out.source = Some(endpoint.address());
        let data = codec::encode(&out)?;
        debug!("OUTBOUND: {} {}", dest, out);
        endpoint.send_to(&data, dest).await.map_err(|e| {
            error!("send_to: io error: {:?} (dest={:?})", e, dest);
            Error::IoError
        })
    }

    // -----------------------------------------------------------------
    // Stream transport

    fn spawn_stream_acceptor(&self, endpoint: Arc<Endpoint>, listener: TcpListener) {
        let inner = self.arc();
        let mut stop = self.stop.subscribe();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => return,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!("stream connection from {}", peer);
                            inner.spawn_stream_connection(endpoint.clone(), stream, peer);
                        }
                        Err(e) => {
                            error!("accept: io error: {:?}", e);
                            sleep(Duration::from_millis(10)).await;
                        }
                    }
                }
            }
        });
        self.track(task);
    }

    fn spawn_stream_connection(
        &self,
        endpoint: Arc<Endpoint>,
        stream: tokio::net::TcpStream,
        peer: SocketAddr,
    ) {
        let inner = self.arc();
        let task = tokio::spawn(async move {
            let (mut reader, mut writer) = stream.into_split();
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
            inner
                .stream_writers
                .lock()
                .expect("Lock failed")
                .insert(peer, out_tx.clone());

            let write_task = tokio::spawn(async move {
                while let Some(data) = out_rx.recv().await {
                    if writer.write_all(&data).await.is_err() {
                        break;
                    }
                }
            });

            // Capabilities first, before any request flows.
            let own_csm = framed::csm(CsmSettings {
                max_message_size: 1024 * 1024,
                block_wise_transfer: true,
            });
            if let Ok(data) = framed::encode(&own_csm) {
                let _ = out_tx.send(data);
            }

            let mut state = ConnectionState::new();
            let mut frames = FrameBuffer::new();
            let mut buf = vec![0u8; 8192];

            'connection: loop {
                let n = match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break 'connection,
                    Ok(n) => n,
                };
                frames.extend(&buf[..n]);

                loop {
                    let message = match frames.next_frame() {
                        Ok(Some(message)) => message,
                        Ok(None) => break,
                        Err(error) => {
                            warn!("stream framing error from {}: {:?}", peer, error);
                            inner.send_stream_signal(&out_tx, MsgCode::SignalAbort, Token::EMPTY);
                            break 'connection;
                        }
                    };
                    if !inner
                        .stream_frame_received(message, peer, &endpoint, &mut state, &out_tx)
                        .await
                    {
                        break 'connection;
                    }
                }
            }

            inner
                .stream_writers
                .lock()
                .expect("Lock failed")
                .remove(&peer);
            write_task.abort();
            debug!("stream connection {} closed", peer);
        });
        self.track(task);
    }

    fn send_stream_signal(
        &self,
        out: &mpsc::UnboundedSender<Vec<u8>>,
        code: MsgCode,
        token: Token,
    ) {
        let mut signal = Message::new();
        signal.code = code;
        signal.token = token;
        if let Ok(data) = framed::encode(&signal) {
            let _ = out.send(data);
        }
    }

    /// Returns false when the connection must close.
    async fn stream_frame_received(
        &self,
        mut message: Message,
        peer: SocketAddr,
        endpoint: &Endpoint,
        state: &mut ConnectionState,
        out: &mpsc::UnboundedSender<Vec<u8>>,
    ) -> bool {
        message.source = Some(peer);
        message.destination = Some(endpoint.address());
        message.scheme = endpoint.scheme();
        debug!("INBOUND(stream): {} {}", peer, message);

        if message.code.is_signal() {
            match message.code {
                MsgCode::SignalCsm => {
                    if state.record_csm(&message).is_err() {
                        self.send_stream_signal(out, MsgCode::SignalAbort, Token::EMPTY);
                        return false;
                    }
                    return true;
                }
                MsgCode::SignalPing => {
                    self.send_stream_signal(out, MsgCode::SignalPong, message.token);
                    return true;
                }
                MsgCode::SignalPong => return true,
                MsgCode::SignalRelease | MsgCode::SignalAbort => return false,
                _ => return true,
            }
        }

        // A CSM must lead; anything else before it aborts the connection.
        if !state.csm_received {
            warn!("{} spoke before its CSM", peer);
            self.send_stream_signal(out, MsgCode::SignalAbort, Token::EMPTY);
            return false;
        }

        if message.is_request() {
            self.handle_request(message).await;
        } else if message.is_response() {
            self.handle_response(message).await;
        }
        true
    }
}
