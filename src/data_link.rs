//! A data link is one connection to a remote process, shared by all associations between local
//!  and remote endpoints that communicate through that connection.
//!
//! The link keeps track of its associations in two maps:
//! * `pub_map`: publication -> the subscriptions associated with it
//! * `sub_map`: subscription -> the publications associated with it
//!
//! Both maps hold local and remote endpoints, and every association is present in both of them.
//!  A link lives as long as it has associations: releasing the last one shuts it down and asks
//!  the owning transport to forget it.

use std::sync::{Arc, Mutex, Weak};
use rustc_hash::{FxHashMap, FxHashSet};
#[cfg(test)] use mockall::automock;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use crate::byte_chain::ByteChain;
use crate::byte_sink::{ByteSource, Connection};
use crate::config::TransportConfig;
use crate::error::{ReceiveError, ReservationError};
use crate::ids::{DataLinkId, PublicationId, RepoId, SampleKey};
use crate::queue_element::{sample_element, QueueElement, SendListener};
use crate::receive_strategy::{DeliverySink, ReceiveStrategy};
use crate::reconnect::{ReconnectListener, Reconnector};
use crate::sample_header::{MessageId, SampleHeader};
use crate::send_strategy::SendStrategy;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionNotice {
    /// The connection was lost, and the link is trying to re-establish it
    Disconnected,
    Reconnected,
    /// Re-establishing the connection failed, and the link is shut down
    Lost,
}

/// The subscribing side's view of a link
#[cfg_attr(test, automock)]
pub trait ReceiveListener: Send + Sync {
    fn data_received(&self, header: &SampleHeader, data: &ByteChain);

    /// `remote_ids` are the remote publications associated with the listener's subscription
    fn notify_connection(&self, notice: ConnectionNotice, remote_ids: Vec<RepoId>);
}

/// The owner of a link, i.e. the registry a link removes itself from when it shuts down
#[cfg_attr(test, automock)]
pub trait LinkOwner: Send + Sync {
    fn release_datalink(&self, id: DataLinkId);
}

/// A local endpoint taking part in an association, with the listener for its side of the link
#[derive(Clone)]
pub enum LocalEndpoint {
    Publication(RepoId, Arc<dyn SendListener>),
    Subscription(RepoId, Arc<dyn ReceiveListener>),
}

impl LocalEndpoint {
    pub fn id(&self) -> RepoId {
        match self {
            LocalEndpoint::Publication(id, _) => *id,
            LocalEndpoint::Subscription(id, _) => *id,
        }
    }
}

#[derive(Default)]
struct Associations {
    pub_map: FxHashMap<RepoId, FxHashSet<RepoId>>,
    sub_map: FxHashMap<RepoId, FxHashSet<RepoId>>,
}

impl Associations {
    fn insert(map: &mut FxHashMap<RepoId, FxHashSet<RepoId>>, key: RepoId, value: RepoId) -> bool {
        map.entry(key).or_default().insert(value)
    }

    fn remove(map: &mut FxHashMap<RepoId, FxHashSet<RepoId>>, key: RepoId, value: RepoId) -> bool {
        let Some(values) = map.get_mut(&key) else {
            return false;
        };
        let result = values.remove(&value);
        if values.is_empty() {
            map.remove(&key);
        }
        result
    }

    /// Inserts an association into both maps, starting with `pub_map` if `publication_first` is
    ///  set. If the second insert fails, the first is undone.
    fn reserve(&mut self, publication: RepoId, subscription: RepoId, publication_first: bool) -> Result<(), ReservationError> {
        let (first, second, first_key, second_key) = if publication_first {
            (&mut self.pub_map, &mut self.sub_map, publication, subscription)
        }
        else {
            (&mut self.sub_map, &mut self.pub_map, subscription, publication)
        };

        if !Self::insert(first, first_key, second_key) {
            return Err(ReservationError::AlreadyReserved);
        }
        if !Self::insert(second, second_key, first_key) {
            Self::remove(first, first_key, second_key);
            return Err(ReservationError::Rollback);
        }
        Ok(())
    }

    /// Removes all associations of a remote endpoint, returning the endpoints that have no
    ///  associations left as a result. `None` means the remote endpoint is unknown.
    fn release_remote(&mut self, remote: RepoId) -> Option<Vec<RepoId>> {
        let (counterparts, associated) = if let Some(subscriptions) = self.pub_map.remove(&remote) {
            (&mut self.sub_map, subscriptions)
        }
        else if let Some(publications) = self.sub_map.remove(&remote) {
            (&mut self.pub_map, publications)
        }
        else {
            return None;
        };

        let mut released = Vec::new();
        for local in associated {
            Self::remove(counterparts, local, remote);
            if !counterparts.contains_key(&local) {
                released.push(local);
            }
        }
        released.sort();
        Some(released)
    }

    fn associated(map: &FxHashMap<RepoId, FxHashSet<RepoId>>, key: &RepoId) -> Vec<RepoId> {
        let mut result = map.get(key)
            .map(|values| values.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        result.sort();
        result
    }

    fn is_empty(&self) -> bool {
        self.pub_map.is_empty() && self.sub_map.is_empty()
    }
}

struct DataLinkInner {
    associations: Associations,
    send_listeners: FxHashMap<RepoId, Arc<dyn SendListener>>,
    receive_listeners: FxHashMap<RepoId, Arc<dyn ReceiveListener>>,
    /// the connection's receive half until the receive loop is started
    pending_source: Option<Arc<dyn ByteSource>>,
    receive_task: Option<JoinHandle<()>>,
    /// the peer announced that it releases the link, so losing the connection is expected
    peer_disconnected: bool,
    shut_down: bool,
}

pub struct DataLink {
    id: DataLinkId,
    config: Arc<TransportConfig>,
    send_strategy: SendStrategy,
    owner: Weak<dyn LinkOwner>,
    myself: Weak<DataLink>,
    inner: Mutex<DataLinkInner>,
}

impl DataLink {
    /// Creates a link on an established connection. Nothing is sent or received before
    ///  `start()` is called.
    pub fn new(id: DataLinkId, config: Arc<TransportConfig>, source: u32, connection: Connection, reconnector: Option<Arc<dyn Reconnector>>, owner: Weak<dyn LinkOwner>) -> Arc<DataLink> {
        Arc::new_cyclic(|myself: &Weak<DataLink>| {
            let send_strategy = SendStrategy::new(config.clone(), source, connection.sink, reconnector);
            let reconnect_listener: Weak<dyn ReconnectListener> = myself.clone();
            send_strategy.set_reconnect_listener(reconnect_listener);

            DataLink {
                id,
                config,
                send_strategy,
                owner,
                myself: myself.clone(),
                inner: Mutex::new(DataLinkInner {
                    associations: Default::default(),
                    send_listeners: Default::default(),
                    receive_listeners: Default::default(),
                    pending_source: Some(connection.source),
                    receive_task: None,
                    peer_disconnected: false,
                    shut_down: false,
                }),
            }
        })
    }

    pub fn id(&self) -> DataLinkId {
        self.id
    }

    pub fn send_strategy(&self) -> &SendStrategy {
        &self.send_strategy
    }

    /// Starts the send worker and the receive loop. This requires a tokio runtime.
    pub fn start(&self) {
        debug!("starting {}", self.id);
        self.send_strategy.start();

        let source = self.inner.lock().unwrap().pending_source.take();
        if let Some(source) = source {
            self.start_receiving(source);
        }
    }

    fn start_receiving(&self, source: Arc<dyn ByteSource>) {
        let (Some(link), Ok(handle)) = (self.myself.upgrade(), Handle::try_current()) else {
            error!("unable to start the receive loop of {}", self.id);
            return;
        };

        let receive_strategy = ReceiveStrategy::new(&self.config);
        let task = handle.spawn(async move {
            let sink: Arc<dyn DeliverySink> = link.clone();
            let reason = receive_strategy.run(source, sink).await;
            link.on_receive_failed(reason);
        });

        let previous = {
            let mut inner = self.inner.lock().unwrap();
            if inner.shut_down {
                task.abort();
                return;
            }
            inner.receive_task.replace(task)
        };
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn on_receive_failed(&self, reason: ReceiveError) {
        match &reason {
            ReceiveError::PeerClosed => info!("{}: peer closed the connection", self.id),
            ReceiveError::Codec(e) => warn!("{}: received malformed data, dropping the connection: {}", self.id, e),
            e => warn!("{}: connection failed: {}", self.id, e),
        }

        let peer_disconnected = {
            let inner = self.inner.lock().unwrap();
            if inner.shut_down {
                return;
            }
            inner.peer_disconnected
        };

        //NB: a peer that closes the connection is gone, only failures are worth reconnecting
        if peer_disconnected || matches!(reason, ReceiveError::PeerClosed) {
            self.notify(ConnectionNotice::Lost);
            self.release_resources();
        }
        else {
            self.send_strategy.relink();
        }
    }

    /// Associates a remote endpoint with a local one. Re-reserving an existing association
    ///  fails with `AlreadyReserved`, leaving the link unchanged.
    pub fn make_reservation(&self, remote_id: RepoId, local: LocalEndpoint) -> Result<(), ReservationError> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.shut_down {
                return Err(ReservationError::LinkShutDown);
            }

            let result = match &local {
                LocalEndpoint::Publication(local_id, _) => inner.associations.reserve(*local_id, remote_id, true),
                LocalEndpoint::Subscription(local_id, _) => inner.associations.reserve(remote_id, *local_id, false),
            };
            if let Err(e) = result {
                debug!("{}: reserving {} <-> {} failed: {}", self.id, local.id(), remote_id, e);
                return Err(e);
            }

            match local {
                LocalEndpoint::Publication(local_id, listener) => {
                    inner.send_listeners.insert(local_id, listener);
                }
                LocalEndpoint::Subscription(local_id, listener) => {
                    inner.receive_listeners.insert(local_id, listener);
                }
            }
        }

        self.send_strategy.link_released(false);
        debug!("{}: reserved association with remote {}", self.id, remote_id);
        Ok(())
    }

    /// Removes all associations of a remote endpoint, adding the local endpoints that have no
    ///  associations left on this link to `released_locals`. Releasing the last association
    ///  shuts the link down.
    pub fn release_reservations(&self, remote_id: RepoId, released_locals: &mut Vec<RepoId>) {
        let now_unused = {
            let mut inner = self.inner.lock().unwrap();
            let Some(released) = inner.associations.release_remote(remote_id) else {
                debug!("{}: no associations with remote {} - ignoring release", self.id, remote_id);
                return;
            };

            for local in &released {
                inner.send_listeners.remove(local);
                inner.receive_listeners.remove(local);
            }
            debug!("{}: released remote {}, locals without associations: {:?}", self.id, remote_id, released);
            released_locals.extend(released);
            inner.associations.is_empty()
        };

        if now_unused {
            info!("{}: last association released - shutting down", self.id);
            self.shut_down(true, true);
        }
    }

    /// Forgets all associations after the connection was lost for good, and shuts the link
    ///  down. Returns the local endpoints that were associated.
    pub fn release_resources(&self) -> Vec<RepoId> {
        let released = {
            let mut inner = self.inner.lock().unwrap();
            let mut released = inner.send_listeners.keys()
                .chain(inner.receive_listeners.keys())
                .cloned()
                .collect::<Vec<_>>();
            released.sort();

            inner.associations = Default::default();
            inner.send_listeners.clear();
            inner.receive_listeners.clear();
            released
        };

        debug!("{}: releasing resources, locals were {:?}", self.id, released);
        self.shut_down(true, false);
        released
    }

    /// Shuts the link down as part of shutting down the owning transport
    pub fn transport_shutdown(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.associations = Default::default();
            inner.send_listeners.clear();
            inner.receive_listeners.clear();
        }
        self.shut_down(false, false);
    }

    /// `announce` sends a graceful disconnect to the peer before the send path is stopped
    fn shut_down(&self, request_removal: bool, announce: bool) {
        let receive_task = {
            let mut inner = self.inner.lock().unwrap();
            if inner.shut_down {
                return;
            }
            inner.shut_down = true;
            inner.pending_source = None;
            inner.receive_task.take()
        };

        if request_removal {
            self.send_strategy.link_released(true);
            match self.owner.upgrade() {
                Some(owner) => owner.release_datalink(self.id),
                None => debug!("{}: owner is gone", self.id),
            }
        }

        if announce {
            let announcement = sample_element(MessageId::GracefulDisconnect, PublicationId::from_raw(0), 0, &[], self.config.byte_order, None);
            self.send_strategy.disconnect_gracefully(announcement);
        }
        self.send_strategy.stop();
        if let Some(task) = receive_task {
            task.abort();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.lock().unwrap().shut_down
    }

    /// Hands a received sample to all local subscriptions associated with its publication,
    ///  returning the number of subscriptions it was handed to
    pub fn data_received(&self, header: &SampleHeader, data: &ByteChain) -> usize {
        let publication: RepoId = header.publication_id.into();
        let listeners = {
            let inner = self.inner.lock().unwrap();
            inner.associations.pub_map.get(&publication)
                .map(|subscriptions| subscriptions.iter()
                    .filter_map(|s| inner.receive_listeners.get(s).cloned())
                    .collect::<Vec<_>>())
                .unwrap_or_default()
        };

        if listeners.is_empty() {
            debug!("{}: no subscription for publication {} - dropping sample #{}", self.id, publication, header.sequence);
            return 0;
        }

        trace!("{}: delivering sample #{} of {} to {} subscription(s)", self.id, header.sequence, publication, listeners.len());
        for listener in &listeners {
            listener.data_received(header, data);
        }
        listeners.len()
    }

    /// Tells every local endpoint on this link about a change of the connection's state
    pub fn notify(&self, notice: ConnectionNotice) {
        let (publications, subscriptions) = {
            let inner = self.inner.lock().unwrap();
            let publications = inner.send_listeners.iter()
                .map(|(id, listener)| (listener.clone(), Associations::associated(&inner.associations.pub_map, id)))
                .collect::<Vec<_>>();
            let subscriptions = inner.receive_listeners.iter()
                .map(|(id, listener)| (listener.clone(), Associations::associated(&inner.associations.sub_map, id)))
                .collect::<Vec<_>>();
            (publications, subscriptions)
        };

        debug!("{}: notifying {} publication(s) and {} subscription(s) of {:?}", self.id, publications.len(), subscriptions.len(), notice);
        for (listener, remote_ids) in publications {
            listener.notify_connection(notice, remote_ids);
        }
        for (listener, remote_ids) in subscriptions {
            listener.notify_connection(notice, remote_ids);
        }
    }

    /// true if the subscription has associations on this link
    pub fn is_target(&self, subscription: RepoId) -> bool {
        self.inner.lock().unwrap().associations.sub_map.contains_key(&subscription)
    }

    /// Checks if an association exists. If it does, the result tells whether it is the remote
    ///  endpoint's last association on this link.
    pub fn exist(&self, remote_id: RepoId, local_id: RepoId, pub_side: bool) -> Option<bool> {
        let inner = self.inner.lock().unwrap();
        let map = if pub_side { &inner.associations.sub_map } else { &inner.associations.pub_map };
        let associated = map.get(&remote_id)?;
        if associated.contains(&local_id) {
            Some(associated.len() == 1)
        }
        else {
            None
        }
    }

    pub fn send(&self, element: QueueElement) {
        self.send_strategy.send(element);
    }

    pub fn send_start(&self) {
        self.send_strategy.send_start();
    }

    pub fn send_stop(&self) {
        self.send_strategy.send_stop();
    }

    pub fn remove_sample(&self, key: SampleKey) -> bool {
        self.send_strategy.remove_sample(key)
    }

    pub fn remove_all_control_msgs(&self, publication_id: PublicationId) -> usize {
        self.send_strategy.remove_all_control_msgs(publication_id)
    }
}

impl DeliverySink for DataLink {
    fn on_sample_received(&self, header: SampleHeader, data: ByteChain) {
        if header.message_id == MessageId::GracefulDisconnect {
            debug!("{}: peer announced a graceful disconnect", self.id);
            self.inner.lock().unwrap().peer_disconnected = true;
            return;
        }
        self.data_received(&header, &data);
    }
}

impl ReconnectListener for DataLink {
    fn on_reconnecting(&self) {
        self.notify(ConnectionNotice::Disconnected);
    }

    fn on_reconnected(&self, connection: Connection) {
        info!("{}: connection re-established", self.id);
        self.inner.lock().unwrap().peer_disconnected = false;
        self.start_receiving(connection.source);
        self.notify(ConnectionNotice::Reconnected);
    }

    fn on_reconnect_failed(&self) {
        warn!("{}: connection lost for good", self.id);
        self.notify(ConnectionNotice::Lost);
        self.release_resources();
    }
}
