use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use anyhow::bail;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};
use crate::byte_sink::Connection;
use crate::config::TransportConfig;
use crate::data_link::{DataLink, LinkOwner, LocalEndpoint};
use crate::error::ReservationError;
use crate::ids::{DataLinkId, DataLinkIdGenerator, RepoId};
use crate::reconnect::Reconnector;

struct TransportImplInner {
    links: FxHashMap<DataLinkId, Arc<DataLink>>,
    by_remote_addr: FxHashMap<SocketAddr, DataLinkId>,
    shut_down: bool,
}

/// TransportImpl owns the data links of a process, one per remote address. Links are created on
///  demand when an association is reserved, and remove themselves when their last association
///  is released.
pub struct TransportImpl {
    config: Arc<TransportConfig>,
    source: u32,
    id_generator: DataLinkIdGenerator,
    myself: Weak<TransportImpl>,
    inner: Mutex<TransportImplInner>,
}

impl TransportImpl {
    /// `source` identifies this process in the headers of outgoing packets
    pub fn new(config: TransportConfig, source: u32) -> anyhow::Result<Arc<TransportImpl>> {
        config.validate()?;

        Ok(Arc::new_cyclic(|myself| TransportImpl {
            config: Arc::new(config),
            source,
            id_generator: DataLinkIdGenerator::new(),
            myself: myself.clone(),
            inner: Mutex::new(TransportImplInner {
                links: Default::default(),
                by_remote_addr: Default::default(),
                shut_down: false,
            }),
        }))
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Reserves an association on the link to `remote_addr`, connecting through `connector` if
    ///  there is no such link yet. The connector is kept for re-establishing the connection if
    ///  it is lost.
    pub async fn reserve_datalink(&self, remote_addr: SocketAddr, remote_id: RepoId, local: LocalEndpoint, connector: Arc<dyn Reconnector>) -> anyhow::Result<Arc<DataLink>> {
        let link = self.connected_datalink(remote_addr, &connector).await?;
        match Self::reserve(&link, remote_id, local.clone()) {
            Err(ReservationError::LinkShutDown) => {}
            result => {
                result?;
                return Ok(link);
            }
        }

        //NB: the link shut down after it was looked up, so there is one more try on a new link
        debug!("{} to {:?} is shutting down - reserving on a new link", link.id(), remote_addr);
        self.release_datalink(link.id());
        let link = self.connected_datalink(remote_addr, &connector).await?;
        Self::reserve(&link, remote_id, local)?;
        Ok(link)
    }

    async fn connected_datalink(&self, remote_addr: SocketAddr, connector: &Arc<dyn Reconnector>) -> anyhow::Result<Arc<DataLink>> {
        if let Some(link) = self.find_datalink(remote_addr) {
            return Ok(link);
        }

        debug!("connecting to {:?}", remote_addr);
        let connection = connector.attempt_reconnect().await?;
        self.register(remote_addr, connection, Some(connector.clone()))
    }

    /// Creates a link for a connection that was established by the remote side. Such a link
    ///  does not reconnect: it is the remote side's job to re-establish a lost connection.
    pub fn accept_datalink(&self, remote_addr: SocketAddr, connection: Connection) -> anyhow::Result<Arc<DataLink>> {
        let previous = {
            let mut inner = self.inner.lock().unwrap();
            match inner.by_remote_addr.remove(&remote_addr) {
                Some(id) => inner.links.remove(&id),
                None => None,
            }
        };
        if let Some(previous) = previous {
            warn!("{:?} connected again - replacing {}", remote_addr, previous.id());
            previous.transport_shutdown();
        }

        self.register(remote_addr, connection, None)
    }

    fn reserve(link: &DataLink, remote_id: RepoId, local: LocalEndpoint) -> Result<(), ReservationError> {
        match link.make_reservation(remote_id, local) {
            Err(ReservationError::AlreadyReserved) => {
                debug!("association with {} exists already on {}", remote_id, link.id());
                Ok(())
            }
            result => result,
        }
    }

    fn register(&self, remote_addr: SocketAddr, connection: Connection, reconnector: Option<Arc<dyn Reconnector>>) -> anyhow::Result<Arc<DataLink>> {
        let link = {
            let mut inner = self.inner.lock().unwrap();
            if inner.shut_down {
                bail!("transport is shut down");
            }

            if let Some(existing) = inner.by_remote_addr.get(&remote_addr).and_then(|id| inner.links.get(id)) {
                //NB: the link was created concurrently, and the new connection is just dropped
                debug!("{} to {:?} was created concurrently", existing.id(), remote_addr);
                return Ok(existing.clone());
            }

            let Some(id) = self.id_generator.next_id() else {
                bail!("no more data link ids");
            };

            let owner: Weak<dyn LinkOwner> = self.myself.clone();
            let link = DataLink::new(id, self.config.clone(), self.source, connection, reconnector, owner);
            inner.links.insert(id, link.clone());
            inner.by_remote_addr.insert(remote_addr, id);
            link
        };

        info!("created {} to {:?}", link.id(), remote_addr);
        link.start();
        Ok(link)
    }

    /// Removes all associations of a remote endpoint from all links, returning the local
    ///  endpoints that have no associations left on a link
    pub fn release_reservations(&self, remote_id: RepoId) -> Vec<RepoId> {
        let links = self.inner.lock().unwrap().links.values()
            .cloned()
            .collect::<Vec<_>>();

        let mut released_locals = Vec::new();
        for link in links {
            link.release_reservations(remote_id, &mut released_locals);
        }
        released_locals
    }

    pub fn find_datalink(&self, remote_addr: SocketAddr) -> Option<Arc<DataLink>> {
        let inner = self.inner.lock().unwrap();
        inner.by_remote_addr.get(&remote_addr)
            .and_then(|id| inner.links.get(id))
            .cloned()
    }

    pub fn num_links(&self) -> usize {
        self.inner.lock().unwrap().links.len()
    }

    /// Shuts down all links. No links can be created afterwards.
    pub fn shutdown(&self) {
        let links = {
            let mut inner = self.inner.lock().unwrap();
            inner.shut_down = true;
            inner.by_remote_addr.clear();
            inner.links.drain()
                .map(|(_, link)| link)
                .collect::<Vec<_>>()
        };

        info!("shutting down transport with {} link(s)", links.len());
        for link in links {
            link.transport_shutdown();
        }
    }
}

impl LinkOwner for TransportImpl {
    fn release_datalink(&self, id: DataLinkId) {
        let mut inner = self.inner.lock().unwrap();
        if inner.links.remove(&id).is_some() {
            inner.by_remote_addr.retain(|_, link_id| *link_id != id);
            debug!("released {}", id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::runtime::Builder;
    use crate::data_link::MockReceiveListener;
    use crate::reconnect::MockReconnector;
    use crate::test_util::{FakeSource, RecordingSendListener, ScriptedSink};

    const LOCAL_PUB: RepoId = RepoId::from_raw(1);
    const LOCAL_SUB: RepoId = RepoId::from_raw(2);
    const REMOTE_SUB: RepoId = RepoId::from_raw(101);
    const REMOTE_PUB: RepoId = RepoId::from_raw(201);

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn connection() -> Connection {
        Connection {
            sink: Arc::new(ScriptedSink::new(vec![])),
            source: Arc::new(FakeSource::new()),
        }
    }

    fn connector(times: usize) -> Arc<dyn Reconnector> {
        let mut connector = MockReconnector::new();
        connector.expect_attempt_reconnect()
            .times(times)
            .returning(|| Ok(connection()));
        Arc::new(connector)
    }

    fn publication() -> LocalEndpoint {
        LocalEndpoint::Publication(LOCAL_PUB, Arc::new(RecordingSendListener::default()))
    }

    fn subscription() -> LocalEndpoint {
        LocalEndpoint::Subscription(LOCAL_SUB, Arc::new(MockReceiveListener::new()))
    }

    fn run(f: impl std::future::Future<Output = ()>) {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(f);
    }

    #[test]
    fn test_new_validates_config() {
        let mut config = TransportConfig::default_tcp();
        config.max_samples_per_packet = 0;
        assert!(TransportImpl::new(config, 0).is_err());
    }

    #[test]
    fn test_reserve_reuses_link() {
        run(async {
            let transport = TransportImpl::new(TransportConfig::default_tcp(), 0).unwrap();
            let connector = connector(1);

            let a = transport.reserve_datalink(addr(1000), REMOTE_SUB, publication(), connector.clone()).await.unwrap();
            let b = transport.reserve_datalink(addr(1000), REMOTE_PUB, subscription(), connector.clone()).await.unwrap();
            // re-sent acknowledgement
            let c = transport.reserve_datalink(addr(1000), REMOTE_PUB, subscription(), connector).await.unwrap();

            assert_eq!(a.id(), b.id());
            assert_eq!(b.id(), c.id());
            assert_eq!(transport.num_links(), 1);
            assert_eq!(a.exist(REMOTE_SUB, LOCAL_PUB, true), Some(true));
            assert_eq!(a.exist(REMOTE_PUB, LOCAL_SUB, false), Some(true));
        });
    }

    #[test]
    fn test_links_per_remote_addr() {
        run(async {
            let transport = TransportImpl::new(TransportConfig::default_tcp(), 0).unwrap();

            let a = transport.reserve_datalink(addr(1000), REMOTE_SUB, publication(), connector(1)).await.unwrap();
            let b = transport.reserve_datalink(addr(2000), REMOTE_SUB, publication(), connector(1)).await.unwrap();

            assert_ne!(a.id(), b.id());
            assert_eq!(transport.num_links(), 2);
            assert_eq!(transport.find_datalink(addr(2000)).map(|l| l.id()), Some(b.id()));
        });
    }

    #[test]
    fn test_connect_failure() {
        run(async {
            let transport = TransportImpl::new(TransportConfig::default_tcp(), 0).unwrap();
            let mut connector = MockReconnector::new();
            connector.expect_attempt_reconnect()
                .times(1)
                .returning(|| Err(anyhow::anyhow!("connection refused")));

            assert!(transport.reserve_datalink(addr(1000), REMOTE_SUB, publication(), Arc::new(connector)).await.is_err());
            assert_eq!(transport.num_links(), 0);
        });
    }

    #[test]
    fn test_link_removed_after_last_release() {
        run(async {
            let transport = TransportImpl::new(TransportConfig::default_tcp(), 0).unwrap();
            let link = transport.reserve_datalink(addr(1000), REMOTE_SUB, publication(), connector(1)).await.unwrap();

            assert_eq!(transport.release_reservations(REMOTE_SUB), vec![LOCAL_PUB]);
            assert!(link.is_shut_down());
            assert_eq!(transport.num_links(), 0);
            assert!(transport.find_datalink(addr(1000)).is_none());
        });
    }

    #[test]
    fn test_reserve_on_link_shutting_down() {
        run(async {
            let transport = TransportImpl::new(TransportConfig::default_tcp(), 0).unwrap();
            let first = transport.reserve_datalink(addr(1000), REMOTE_SUB, publication(), connector(1)).await.unwrap();

            // shut down, but still registered
            first.transport_shutdown();
            assert_eq!(transport.find_datalink(addr(1000)).map(|l| l.id()), Some(first.id()));

            let second = transport.reserve_datalink(addr(1000), REMOTE_SUB, publication(), connector(1)).await.unwrap();
            assert_ne!(first.id(), second.id());
            assert!(!second.is_shut_down());
            assert_eq!(second.exist(REMOTE_SUB, LOCAL_PUB, true), Some(true));
            assert_eq!(transport.num_links(), 1);
        });
    }

    #[test]
    fn test_accept_replaces_previous_link() {
        run(async {
            let transport = TransportImpl::new(TransportConfig::default_tcp(), 0).unwrap();

            let first = transport.accept_datalink(addr(1000), connection()).unwrap();
            let second = transport.accept_datalink(addr(1000), connection()).unwrap();

            assert!(first.is_shut_down());
            assert!(!second.is_shut_down());
            assert_eq!(transport.num_links(), 1);
        });
    }

    #[test]
    fn test_shutdown() {
        run(async {
            let transport = TransportImpl::new(TransportConfig::default_tcp(), 0).unwrap();
            let a = transport.reserve_datalink(addr(1000), REMOTE_SUB, publication(), connector(1)).await.unwrap();
            let b = transport.accept_datalink(addr(2000), connection()).unwrap();

            transport.shutdown();

            assert!(a.is_shut_down());
            assert!(b.is_shut_down());
            assert_eq!(transport.num_links(), 0);
            assert!(transport.reserve_datalink(addr(3000), REMOTE_SUB, publication(), connector(1)).await.is_err());
        });
    }
}
