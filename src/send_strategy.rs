//! The send path of a data link: packet building, writing to the connection, and the mode state
//!  machine handling backpressure and connection loss.
//!
//! Samples are sent on the caller's thread as long as the connection accepts them (`Direct`
//!  mode). When the connection pushes back or accepts only part of a packet, the engine switches
//!  to `Queue` mode: further samples go to a FIFO backlog, and a worker task drains the backlog as
//!  the connection becomes writable again, switching back to `Direct` once everything is sent.
//!
//! When the connection is lost, the engine is `Suspend`ed while a reconnect task tries to
//!  re-establish it. Success resumes sending, failure `Terminate`s the engine, dropping every
//!  element it holds.
//!
//! NB: All state is guarded by a single mutex which is never held while listeners are called.
//!      Outcomes are collected while holding the lock and reported after releasing it.

use std::cmp::min;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use bytes::{Buf, Bytes, BytesMut};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};
use crate::byte_sink::{is_backpressure, ByteSink};
use crate::config::TransportConfig;
use crate::ids::{PublicationId, SampleKey};
use crate::packet_header::PacketHeader;
use crate::queue_element::{ElementKind, QueueElement};
use crate::reconnect::{reconnect_with_backoff, ReconnectListener, Reconnector};
use crate::safe_converter::{PrecheckedCast, SafeCast};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SendMode {
    Direct,
    Queue,
    Suspend,
    Terminated,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SendPacketOutcome {
    CompleteSend,
    PartialSend,
    Backpressure,
    PeerLost,
    SendError,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WorkOutcome {
    NoMoreToDo,
    MoreToDo,
    /// wait for the connection to become writable before calling again
    Clogged,
    BrokenResource,
}

enum Outcome {
    Delivered,
    Dropped { by_transport: bool },
}

#[derive(Default)]
struct DeferredOutcomes {
    elements: Vec<(QueueElement, Outcome)>,
    start_reconnect: bool,
    reconnect_failed: bool,
}

impl DeferredOutcomes {
    fn delivered(&mut self, element: QueueElement) {
        self.elements.push((element, Outcome::Delivered));
    }

    fn dropped(&mut self, element: QueueElement, by_transport: bool) {
        self.elements.push((element, Outcome::Dropped { by_transport }));
    }
}

struct PacketSegment {
    bytes: Bytes,
    is_header: bool,
    /// the last segment of an element's bytes
    end_of_element: bool,
}

/// The packet currently being built or sent. Before it is prepared, it is just a list of elements.
///  Preparing it marshals the packet header and lays out all bytes as segments, and sending
///  consumes segments from the front.
///
/// NB: `header.length` is the number of payload bytes that are not sent yet.
struct CurrentPacket {
    header: PacketHeader,
    elems: VecDeque<QueueElement>,
    segments: VecDeque<PacketSegment>,
    prepared: bool,
}

impl CurrentPacket {
    fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    fn payload_len(&self) -> usize {
        self.header.length.safe_cast()
    }

    fn push(&mut self, element: QueueElement) {
        assert!(!self.prepared, "adding an element to a packet that was prepared already");
        let len: u32 = element.byte_length().prechecked_cast();
        self.header.length += len;
        self.elems.push_back(element);
    }

    fn remove_unprepared(&mut self, idx: usize) -> Option<QueueElement> {
        let element = self.elems.remove(idx)?;
        let len: u32 = element.byte_length().prechecked_cast();
        self.header.length -= len;
        Some(element)
    }

    /// Discards the packet layout, keeping the elements that were not sent completely. Elements
    ///  will be sent in full when the packet is prepared again.
    fn unprepare(&mut self) {
        self.segments.clear();
        self.prepared = false;
        let len: usize = self.elems.iter().map(|e| e.byte_length()).sum();
        self.header.length = len.prechecked_cast();
    }

    fn take_all(&mut self) -> Vec<QueueElement> {
        self.segments.clear();
        self.prepared = false;
        self.header.length = 0;
        self.elems.drain(..).collect()
    }

    /// Swaps the element at `idx` for a placeholder. The element's unsent bytes in the packet
    ///  are replaced with copies, so bytes already written to the connection are unaffected
    ///  and the original element's buffers are no longer referenced.
    fn replace_prepared(&mut self, idx: usize) -> QueueElement {
        let mut seg_idx = match self.segments.front() {
            Some(s) if s.is_header => 1,
            _ => 0,
        };
        let mut elem_idx = 0;
        while elem_idx < idx {
            if self.segments[seg_idx].end_of_element {
                elem_idx += 1;
            }
            seg_idx += 1;
        }

        loop {
            let segment = &mut self.segments[seg_idx];
            segment.bytes = Bytes::copy_from_slice(&segment.bytes);
            if segment.end_of_element {
                break;
            }
            seg_idx += 1;
        }

        let replacement = self.elems[idx].replacement();
        std::mem::replace(&mut self.elems[idx], replacement)
    }
}

struct SendStrategyInner {
    config: Arc<TransportConfig>,
    work_available: Arc<Notify>,
    reconnector: Option<Arc<dyn Reconnector>>,
    reconnect_listener: Option<Weak<dyn ReconnectListener>>,

    mode: SendMode,
    mode_before_suspend: Option<SendMode>,
    sink: Option<Arc<dyn ByteSink>>,
    packet: CurrentPacket,
    backlog: VecDeque<QueueElement>,
    start_counter: usize,
    next_sequence: u32,
    link_released: bool,
    reconnecting: bool,

    synch_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
}

impl SendStrategyInner {
    fn dropped_by_transport(&self) -> bool {
        !self.link_released
    }

    fn set_mode(&mut self, mode: SendMode) {
        if self.mode != mode {
            debug!("send mode {:?} -> {:?}", self.mode, mode);
            self.mode = mode;
        }
    }

    fn enter_queue_mode(&mut self) {
        self.set_mode(SendMode::Queue);
        self.work_available.notify_one();
    }

    fn send(&mut self, element: QueueElement, outcomes: &mut DeferredOutcomes) {
        if element.byte_length() > self.config.max_element_len() {
            error!("{:?} does not fit into a packet of max size {} - dropping it", element, self.config.max_packet_size);
            outcomes.dropped(element, true);
            return;
        }

        match self.mode {
            SendMode::Terminated => {
                debug!("send path is terminated - dropping {:?}", element);
                let by_transport = self.dropped_by_transport();
                outcomes.dropped(element, by_transport);
            }
            SendMode::Suspend => {
                trace!("suspended - queueing {:?}", element);
                self.backlog.push_back(element);
            }
            SendMode::Queue => {
                trace!("queueing {:?}", element);
                self.backlog.push_back(element);
                self.work_available.notify_one();
            }
            SendMode::Direct => {
                self.send_direct_mode(element, outcomes);
            }
        }
    }

    fn send_direct_mode(&mut self, element: QueueElement, outcomes: &mut DeferredOutcomes) {
        if !self.packet.is_empty() && (
            self.packet.payload_len() + element.byte_length() > self.config.max_element_len()
                || element.requires_exclusive_packet()
                || self.packet.elems.len() >= self.config.max_samples_per_packet
        ) {
            self.direct_send(outcomes);
        }

        match self.mode {
            SendMode::Direct => {}
            SendMode::Terminated => {
                let by_transport = self.dropped_by_transport();
                outcomes.dropped(element, by_transport);
                return;
            }
            _ => {
                // flushing the previous packet did not go through
                self.backlog.push_back(element);
                return;
            }
        }

        let exclusive = element.requires_exclusive_packet();
        self.packet.push(element);

        let optimum_len: usize = self.config.optimum_packet_size.safe_cast();
        if self.start_counter == 0
            || exclusive
            || self.packet.payload_len() >= optimum_len
            || self.packet.elems.len() >= self.config.max_samples_per_packet
        {
            self.direct_send(outcomes);
        }
    }

    fn direct_send(&mut self, outcomes: &mut DeferredOutcomes) {
        if self.packet.is_empty() {
            return;
        }

        self.prepare_packet();
        match self.send_packet(outcomes) {
            SendPacketOutcome::CompleteSend => {}
            SendPacketOutcome::PartialSend | SendPacketOutcome::Backpressure => self.enter_queue_mode(),
            SendPacketOutcome::PeerLost | SendPacketOutcome::SendError => self.relink(outcomes),
        }
    }

    /// Moves elements from the backlog into the (empty) current packet, in FIFO order and within
    ///  the configured limits. An exclusive element is only ever taken into an empty packet, and
    ///  nothing is added after it.
    fn get_packet_elems_from_queue(&mut self) {
        debug_assert!(self.packet.is_empty());

        let optimum_len: usize = self.config.optimum_packet_size.safe_cast();
        while let Some(front) = self.backlog.front() {
            if self.packet.elems.len() >= self.config.max_samples_per_packet {
                break;
            }
            let len = self.packet.payload_len();
            if len >= optimum_len {
                break;
            }
            if len + front.byte_length() > self.config.max_element_len() {
                break;
            }

            let exclusive = front.requires_exclusive_packet();
            if exclusive && !self.packet.is_empty() {
                break;
            }

            let Some(element) = self.backlog.pop_front() else {
                break;
            };
            self.packet.push(element);

            if exclusive {
                break;
            }
        }
    }

    fn prepare_packet(&mut self) {
        if self.packet.prepared {
            return;
        }

        self.packet.header.sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        let mut header_buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN);
        self.packet.header.ser(&mut header_buf);
        self.packet.segments.push_back(PacketSegment {
            bytes: header_buf.freeze(),
            is_header: true,
            end_of_element: false,
        });

        for element in &self.packet.elems {
            let num_segments = element.chain().num_segments();
            for (i, segment) in element.chain().segments().enumerate() {
                self.packet.segments.push_back(PacketSegment {
                    bytes: segment.clone(),
                    is_header: false,
                    end_of_element: i + 1 == num_segments,
                });
            }
        }

        self.packet.prepared = true;
        trace!("prepared packet #{} with {} sample(s), {} payload bytes", self.packet.header.sequence, self.packet.elems.len(), self.packet.header.length);
    }

    fn send_packet(&mut self, outcomes: &mut DeferredOutcomes) -> SendPacketOutcome {
        let Some(sink) = self.sink.clone() else {
            warn!("attempting to send without a connection");
            return SendPacketOutcome::SendError;
        };

        let bufs = self.packet.segments.iter()
            .map(|s| s.bytes.clone())
            .collect::<Vec<_>>();
        let total: usize = bufs.iter().map(|b| b.len()).sum();

        match sink.send_vectored(&bufs) {
            Ok(0) if total > 0 => {
                debug!("connection closed by peer");
                SendPacketOutcome::PeerLost
            }
            Ok(num_sent) => {
                let num_sent = if num_sent > total {
                    error!("connection reports {} bytes written for a packet of {} bytes", num_sent, total);
                    total
                }
                else {
                    num_sent
                };

                self.adjust_packet_after_send(num_sent, outcomes);
                if num_sent == total {
                    trace!("sent {} bytes", num_sent);
                    SendPacketOutcome::CompleteSend
                }
                else {
                    trace!("sent {} of {} bytes", num_sent, total);
                    SendPacketOutcome::PartialSend
                }
            }
            Err(e) if is_backpressure(&e) => {
                trace!("backpressure");
                SendPacketOutcome::Backpressure
            }
            Err(e) => {
                warn!("error sending packet: {}", e);
                SendPacketOutcome::SendError
            }
        }
    }

    /// Releases the first `num_sent` bytes of the current packet. Elements whose last byte was
    ///  sent are reported as delivered, in packet order.
    fn adjust_packet_after_send(&mut self, num_sent: usize, outcomes: &mut DeferredOutcomes) {
        let mut remaining = num_sent;
        while remaining > 0 {
            let Some(segment) = self.packet.segments.front_mut() else {
                break;
            };

            let consumed = min(segment.bytes.len(), remaining);
            remaining -= consumed;
            if !segment.is_header {
                let consumed: u32 = consumed.prechecked_cast();
                self.packet.header.length -= consumed;
            }

            if consumed < segment.bytes.len() {
                segment.bytes.advance(consumed);
            }
            else {
                let end_of_element = segment.end_of_element;
                self.packet.segments.pop_front();
                if end_of_element {
                    if let Some(element) = self.packet.elems.pop_front() {
                        outcomes.delivered(element);
                    }
                }
            }
        }

        if self.packet.segments.is_empty() {
            debug_assert!(self.packet.elems.is_empty());
            debug_assert_eq!(self.packet.header.length, 0);
            self.packet.prepared = false;
        }
    }

    fn perform_work(&mut self, outcomes: &mut DeferredOutcomes) -> WorkOutcome {
        match self.mode {
            SendMode::Terminated => return WorkOutcome::BrokenResource,
            SendMode::Direct | SendMode::Suspend => return WorkOutcome::NoMoreToDo,
            SendMode::Queue => {}
        }

        if self.packet.is_empty() {
            if self.backlog.is_empty() {
                self.set_mode(SendMode::Direct);
                return WorkOutcome::NoMoreToDo;
            }
            self.get_packet_elems_from_queue();
        }

        self.prepare_packet();
        match self.send_packet(outcomes) {
            SendPacketOutcome::CompleteSend => {
                if self.backlog.is_empty() {
                    self.set_mode(SendMode::Direct);
                    WorkOutcome::NoMoreToDo
                }
                else {
                    WorkOutcome::MoreToDo
                }
            }
            SendPacketOutcome::PartialSend | SendPacketOutcome::Backpressure => WorkOutcome::Clogged,
            SendPacketOutcome::PeerLost | SendPacketOutcome::SendError => {
                self.relink(outcomes);
                WorkOutcome::BrokenResource
            }
        }
    }

    fn relink(&mut self, outcomes: &mut DeferredOutcomes) {
        if self.mode == SendMode::Terminated {
            return;
        }
        self.sink = None;

        if self.reconnector.is_none() {
            warn!("connection lost and no way to reconnect - terminating the send path");
            self.terminate(outcomes);
            outcomes.reconnect_failed = true;
            return;
        }

        self.suspend();
        if !self.reconnecting {
            self.reconnecting = true;
            outcomes.start_reconnect = true;
        }
    }

    fn suspend(&mut self) {
        match self.mode {
            SendMode::Suspend | SendMode::Terminated => {}
            mode => {
                self.mode_before_suspend = Some(mode);
                self.set_mode(SendMode::Suspend);
            }
        }
    }

    fn resume(&mut self) {
        match self.mode {
            SendMode::Suspend => {}
            SendMode::Terminated => {
                debug!("resume ignored - send path is terminated");
                return;
            }
            mode => {
                warn!("resume without prior suspend in mode {:?} - ignoring", mode);
                return;
            }
        }

        let before = self.mode_before_suspend.take();
        if self.packet.is_empty() && self.backlog.is_empty() {
            self.set_mode(SendMode::Direct);
        }
        else {
            self.enter_queue_mode();
        }
        debug!("resumed sending (mode before suspend was {:?})", before);
    }

    fn drop_all(&mut self, outcomes: &mut DeferredOutcomes) {
        let by_transport = self.dropped_by_transport();
        for element in self.packet.take_all() {
            outcomes.dropped(element, by_transport);
        }
        for element in self.backlog.drain(..) {
            outcomes.dropped(element, by_transport);
        }
    }

    fn terminate(&mut self, outcomes: &mut DeferredOutcomes) {
        if self.mode == SendMode::Terminated {
            return;
        }
        self.set_mode(SendMode::Terminated);
        self.mode_before_suspend = None;
        self.sink = None;
        self.drop_all(outcomes);
    }

    /// Drops everything held and, if the connection is between packets, tells the peer that the
    ///  link is going away. The send path is terminated either way.
    fn disconnect(&mut self, announcement: QueueElement, outcomes: &mut DeferredOutcomes) {
        self.link_released = true;
        //NB: a partially sent packet cannot be followed by another packet
        let between_packets = !self.packet.prepared
            && matches!(self.mode, SendMode::Direct | SendMode::Queue)
            && self.sink.is_some();
        self.drop_all(outcomes);

        if between_packets {
            self.packet.push(announcement);
            self.prepare_packet();
            match self.send_packet(outcomes) {
                SendPacketOutcome::CompleteSend => debug!("announced graceful disconnect"),
                outcome => debug!("graceful disconnect was not sent completely: {:?}", outcome),
            }
        }
        else {
            debug!("not announcing graceful disconnect in mode {:?}", self.mode);
            outcomes.dropped(announcement, false);
        }
        self.terminate(outcomes);
    }

    fn remove_matching(&mut self, pred: impl Fn(&QueueElement) -> bool, first_only: bool, outcomes: &mut DeferredOutcomes) -> usize {
        let mut num_removed = 0;

        let mut idx = 0;
        while idx < self.backlog.len() {
            if pred(&self.backlog[idx]) {
                if let Some(element) = self.backlog.remove(idx) {
                    outcomes.dropped(element, false);
                    num_removed += 1;
                    if first_only {
                        return num_removed;
                    }
                }
            }
            else {
                idx += 1;
            }
        }

        let mut idx = 0;
        while idx < self.packet.elems.len() {
            let element = &self.packet.elems[idx];
            if element.kind() == ElementKind::Replaced || !pred(element) {
                idx += 1;
                continue;
            }

            if self.packet.prepared {
                let removed = self.packet.replace_prepared(idx);
                outcomes.dropped(removed, false);
                idx += 1;
            }
            else if let Some(removed) = self.packet.remove_unprepared(idx) {
                outcomes.dropped(removed, false);
            }
            num_removed += 1;
            if first_only {
                break;
            }
        }
        num_removed
    }
}

/// The send half of a data link
#[derive(Clone)]
pub struct SendStrategy {
    inner: Arc<Mutex<SendStrategyInner>>,
    work_available: Arc<Notify>,
}

impl SendStrategy {
    pub fn new(config: Arc<TransportConfig>, source: u32, sink: Arc<dyn ByteSink>, reconnector: Option<Arc<dyn Reconnector>>) -> SendStrategy {
        let work_available = Arc::new(Notify::new());

        let inner = SendStrategyInner {
            packet: CurrentPacket {
                header: PacketHeader::new(config.byte_order, source),
                elems: Default::default(),
                segments: Default::default(),
                prepared: false,
            },
            config,
            work_available: work_available.clone(),
            reconnector,
            reconnect_listener: None,
            mode: SendMode::Direct,
            mode_before_suspend: None,
            sink: Some(sink),
            backlog: Default::default(),
            start_counter: 0,
            next_sequence: 0,
            link_released: false,
            reconnecting: false,
            synch_task: None,
            reconnect_task: None,
        };

        SendStrategy {
            inner: Arc::new(Mutex::new(inner)),
            work_available,
        }
    }

    pub fn set_reconnect_listener(&self, listener: Weak<dyn ReconnectListener>) {
        self.inner.lock().unwrap().reconnect_listener = Some(listener);
    }

    /// Spawns the worker draining the backlog while in `Queue` mode. This requires a tokio
    ///  runtime.
    pub fn start(&self) {
        let Ok(handle) = Handle::try_current() else {
            error!("no async runtime - cannot start the send worker");
            return;
        };

        let strategy = self.clone();
        let task = handle.spawn(async move {
            strategy.synch_loop().await
        });

        if let Some(previous) = self.inner.lock().unwrap().synch_task.replace(task) {
            previous.abort();
        }
    }

    async fn synch_loop(&self) {
        loop {
            self.work_available.notified().await;

            loop {
                match self.perform_work() {
                    WorkOutcome::NoMoreToDo => break,
                    WorkOutcome::MoreToDo => tokio::task::yield_now().await,
                    WorkOutcome::Clogged => {
                        let sink = self.inner.lock().unwrap().sink.clone();
                        let Some(sink) = sink else {
                            break;
                        };
                        if let Err(e) = sink.writable().await {
                            debug!("error waiting for the connection to become writable: {}", e);
                            break;
                        }
                    }
                    WorkOutcome::BrokenResource => {
                        if self.mode() == SendMode::Terminated {
                            debug!("send path terminated - send worker exits");
                            return;
                        }
                        break;
                    }
                }
            }
        }
    }

    fn finish(&self, outcomes: DeferredOutcomes) {
        let DeferredOutcomes { elements, start_reconnect, reconnect_failed } = outcomes;

        for (element, outcome) in elements {
            match outcome {
                Outcome::Delivered => element.mark_delivered(),
                Outcome::Dropped { by_transport } => element.mark_dropped(by_transport),
            }
        }

        if start_reconnect {
            if let Some(listener) = self.reconnect_listener() {
                listener.on_reconnecting();
            }
            self.spawn_reconnect();
        }
        if reconnect_failed {
            let listener = self.reconnect_listener();
            if let Some(listener) = listener {
                listener.on_reconnect_failed();
            }
        }
    }

    fn reconnect_listener(&self) -> Option<Arc<dyn ReconnectListener>> {
        self.inner.lock().unwrap().reconnect_listener.as_ref()
            .and_then(|l| l.upgrade())
    }

    fn spawn_reconnect(&self) {
        let reconnector = self.inner.lock().unwrap().reconnector.clone();
        let (Some(reconnector), Ok(handle)) = (reconnector, Handle::try_current()) else {
            error!("unable to start reconnecting - terminating the send path");
            let mut outcomes = DeferredOutcomes::default();
            {
                let mut inner = self.inner.lock().unwrap();
                inner.reconnecting = false;
                inner.terminate(&mut outcomes);
            }
            outcomes.reconnect_failed = true;
            self.finish(outcomes);
            return;
        };

        let strategy = self.clone();
        let task = handle.spawn(async move {
            strategy.reconnect(reconnector).await
        });
        self.inner.lock().unwrap().reconnect_task = Some(task);
    }

    async fn reconnect(&self, reconnector: Arc<dyn Reconnector>) {
        let config = self.inner.lock().unwrap().config.clone();
        let connection = reconnect_with_backoff(reconnector.as_ref(), &config.reconnect).await;

        let mut outcomes = DeferredOutcomes::default();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.reconnecting = false;
            inner.reconnect_task = None;

            if inner.mode == SendMode::Terminated {
                debug!("send path was terminated while reconnecting");
                return;
            }

            match &connection {
                Some(connection) => {
                    inner.sink = Some(connection.sink.clone());
                    // the new connection's peer never saw the beginning of a partially sent packet
                    inner.packet.unprepare();
                    inner.resume();
                }
                None => {
                    inner.terminate(&mut outcomes);
                }
            }
        }

        match connection {
            Some(connection) => {
                self.finish(outcomes);
                if let Some(listener) = self.reconnect_listener() {
                    listener.on_reconnected(connection);
                }
            }
            None => {
                outcomes.reconnect_failed = true;
                self.finish(outcomes);
            }
        }
    }

    /// Sends the element or queues it for sending. This never blocks.
    pub fn send(&self, element: QueueElement) {
        let mut outcomes = DeferredOutcomes::default();
        self.inner.lock().unwrap().send(element, &mut outcomes);
        self.finish(outcomes);
    }

    /// Starts a burst of sends: elements are accumulated into packets rather than being sent one
    ///  by one, until the matching (outermost) `send_stop()`.
    pub fn send_start(&self) {
        self.inner.lock().unwrap().start_counter += 1;
    }

    pub fn send_stop(&self) {
        let mut outcomes = DeferredOutcomes::default();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.start_counter == 0 {
                warn!("send_stop() without matching send_start() - ignoring");
                return;
            }
            inner.start_counter -= 1;
            if inner.start_counter == 0 && inner.mode == SendMode::Direct {
                inner.direct_send(&mut outcomes);
            }
        }
        self.finish(outcomes);
    }

    /// Does a single step of draining the backlog. This is called by the send worker, and
    ///  exposed for driving the engine explicitly.
    pub fn perform_work(&self) -> WorkOutcome {
        let mut outcomes = DeferredOutcomes::default();
        let result = self.inner.lock().unwrap().perform_work(&mut outcomes);
        self.finish(outcomes);
        result
    }

    /// Removes a sample that was not sent yet, reporting it as dropped. Returns `true` if the
    ///  sample was found.
    pub fn remove_sample(&self, key: SampleKey) -> bool {
        let mut outcomes = DeferredOutcomes::default();
        let num_removed = self.inner.lock().unwrap()
            .remove_matching(|e| e.key() == key, true, &mut outcomes);
        self.finish(outcomes);
        num_removed > 0
    }

    /// Removes all control messages of a publication that were not sent yet, returning the
    ///  number of removed messages.
    pub fn remove_all_control_msgs(&self, publication_id: PublicationId) -> usize {
        let mut outcomes = DeferredOutcomes::default();
        let num_removed = self.inner.lock().unwrap()
            .remove_matching(|e| e.is_control() && e.publication_id() == publication_id, false, &mut outcomes);
        self.finish(outcomes);
        num_removed
    }

    /// Treats the connection as lost, starting to reconnect
    pub fn relink(&self) {
        let mut outcomes = DeferredOutcomes::default();
        self.inner.lock().unwrap().relink(&mut outcomes);
        self.finish(outcomes);
    }

    pub fn suspend_send(&self) {
        self.inner.lock().unwrap().suspend();
    }

    pub fn resume_send(&self) {
        self.inner.lock().unwrap().resume();
    }

    /// Drops everything and stops sending for good. A graceful termination is one requested by
    ///  the upper layer, and elements are reported as not dropped by the transport.
    pub fn terminate_send(&self, graceful_disconnecting: bool) {
        let mut outcomes = DeferredOutcomes::default();
        {
            let mut inner = self.inner.lock().unwrap();
            if graceful_disconnecting {
                inner.link_released = true;
            }
            inner.terminate(&mut outcomes);
        }
        self.finish(outcomes);
    }

    /// Drops all held elements and switches to `mode`. A terminated send path stays terminated.
    pub fn clear(&self, mode: SendMode) {
        let mut outcomes = DeferredOutcomes::default();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.drop_all(&mut outcomes);
            if inner.mode != SendMode::Terminated {
                inner.mode_before_suspend = None;
                inner.set_mode(mode);
            }
        }
        self.finish(outcomes);
    }

    /// Terminates sending after the link was released, announcing the disconnect to the peer
    ///  where the connection allows it. Held elements are dropped gracefully.
    pub fn disconnect_gracefully(&self, announcement: QueueElement) {
        let mut outcomes = DeferredOutcomes::default();
        self.inner.lock().unwrap().disconnect(announcement, &mut outcomes);
        self.finish(outcomes);
    }

    pub fn link_released(&self, released: bool) {
        self.inner.lock().unwrap().link_released = released;
    }

    pub fn mode(&self) -> SendMode {
        self.inner.lock().unwrap().mode
    }

    pub fn is_direct_mode(&self) -> bool {
        self.mode() == SendMode::Direct
    }

    pub fn backlog_len(&self) -> usize {
        self.inner.lock().unwrap().backlog.len()
    }

    /// Terminates sending and stops the worker tasks
    pub fn stop(&self) {
        let mut outcomes = DeferredOutcomes::default();
        let (synch_task, reconnect_task) = {
            let mut inner = self.inner.lock().unwrap();
            inner.terminate(&mut outcomes);
            (inner.synch_task.take(), inner.reconnect_task.take())
        };

        for task in [synch_task, reconnect_task].into_iter().flatten() {
            task.abort();
        }
        self.finish(outcomes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use mockall::Sequence;
    use rstest::rstest;
    use tokio::runtime::Builder;
    use crate::byte_sink::{Connection, MockByteSink};
    use crate::queue_element::sample_element;
    use crate::reconnect::{MockReconnectListener, MockReconnector};
    use crate::sample_header::{MessageId, SampleHeader};
    use crate::test_util::*;

    fn config() -> Arc<TransportConfig> {
        let mut config = TransportConfig::default_tcp();
        config.max_packet_size = 200;
        config.optimum_packet_size = 150;
        config.max_samples_per_packet = 3;
        config.reconnect.max_attempts = 2;
        config.reconnect.initial_delay = Duration::from_millis(100);
        Arc::new(config)
    }

    fn element(listener: &Arc<RecordingSendListener>, sequence: u32, payload_len: usize) -> QueueElement {
        sample_element(MessageId::SampleData, PublicationId::from_raw(1), sequence, &vec![sequence as u8; payload_len], config().byte_order, Some(listener.clone()))
    }

    fn control(listener: &Arc<RecordingSendListener>, sequence: u32) -> QueueElement {
        sample_element(MessageId::RequestAck, PublicationId::from_raw(1), sequence, b"", config().byte_order, Some(listener.clone()))
    }

    fn sequences(packets: &[DecodedPacket]) -> Vec<Vec<u32>> {
        packets.iter()
            .map(|p| p.samples.iter().map(|(h, _)| h.sequence).collect())
            .collect()
    }

    #[test]
    fn test_lone_send_is_flushed() {
        let sink = Arc::new(ScriptedSink::new(vec![]));
        let listener = Arc::new(RecordingSendListener::default());
        let strategy = SendStrategy::new(config(), 7, sink.clone(), None);

        strategy.send(element(&listener, 1, 10));
        strategy.send(element(&listener, 2, 10));

        let packets = decode_packets(&sink.written());
        assert_eq!(sequences(&packets), vec![vec![1], vec![2]]);
        assert_eq!(packets[0].header.source, 7);
        assert_eq!(packets[0].header.sequence, 0);
        assert_eq!(packets[1].header.sequence, 1);
        assert_eq!(listener.events(), vec![delivered(1, 1), delivered(1, 2)]);
        assert!(strategy.is_direct_mode());
    }

    #[rstest]
    #[case::fits_one_packet(vec![10, 10, 10], vec![vec![1, 2, 3]])]
    #[case::max_samples(vec![10, 10, 10, 10], vec![vec![1, 2, 3], vec![4]])]
    #[case::optimum_size(vec![100, 10, 10], vec![vec![1, 2], vec![3]])]
    #[case::max_size(vec![100, 100], vec![vec![1], vec![2]])]
    fn test_burst_packing(#[case] payload_lens: Vec<usize>, #[case] expected: Vec<Vec<u32>>) {
        let sink = Arc::new(ScriptedSink::new(vec![]));
        let listener = Arc::new(RecordingSendListener::default());
        let strategy = SendStrategy::new(config(), 0, sink.clone(), None);

        strategy.send_start();
        for (i, len) in payload_lens.iter().enumerate() {
            strategy.send(element(&listener, i as u32 + 1, *len));
        }
        strategy.send_stop();

        assert_eq!(sequences(&decode_packets(&sink.written())), expected);
        let expected_events = (1..=payload_lens.len() as u32).map(|seq| delivered(1, seq)).collect::<Vec<_>>();
        assert_eq!(listener.events(), expected_events);
    }

    #[test]
    fn test_nested_start_stop() {
        let sink = Arc::new(ScriptedSink::new(vec![]));
        let listener = Arc::new(RecordingSendListener::default());
        let strategy = SendStrategy::new(config(), 0, sink.clone(), None);

        strategy.send_start();
        strategy.send_start();
        strategy.send(element(&listener, 1, 10));
        strategy.send_stop();
        assert!(sink.written().is_empty());
        strategy.send(element(&listener, 2, 10));
        strategy.send_stop();

        assert_eq!(sequences(&decode_packets(&sink.written())), vec![vec![1, 2]]);

        // unmatched stop is ignored
        strategy.send_stop();
    }

    #[test]
    fn test_exclusive_element_gets_own_packet() {
        let sink = Arc::new(ScriptedSink::new(vec![]));
        let listener = Arc::new(RecordingSendListener::default());
        let strategy = SendStrategy::new(config(), 0, sink.clone(), None);

        strategy.send_start();
        strategy.send(element(&listener, 1, 10));
        strategy.send(control(&listener, 2));
        strategy.send(element(&listener, 3, 10));
        strategy.send_stop();

        assert_eq!(sequences(&decode_packets(&sink.written())), vec![vec![1], vec![2], vec![3]]);
    }

    #[test]
    fn test_oversized_element_is_dropped() {
        let sink = Arc::new(ScriptedSink::new(vec![]));
        let listener = Arc::new(RecordingSendListener::default());
        let strategy = SendStrategy::new(config(), 0, sink.clone(), None);

        strategy.send(element(&listener, 1, 200));

        assert!(sink.written().is_empty());
        assert_eq!(listener.events(), vec![dropped(1, 1, true)]);
        assert!(strategy.is_direct_mode());
    }

    #[test]
    fn test_backpressure() {
        let sink = Arc::new(ScriptedSink::new(vec![SinkResponse::WouldBlock]));
        let listener = Arc::new(RecordingSendListener::default());
        let strategy = SendStrategy::new(config(), 0, sink.clone(), None);

        strategy.send_start();
        strategy.send(element(&listener, 1, 10));
        strategy.send(element(&listener, 2, 10));
        strategy.send_stop();

        assert_eq!(strategy.mode(), SendMode::Queue);
        assert!(listener.events().is_empty());

        strategy.send(element(&listener, 3, 10));
        assert_eq!(strategy.backlog_len(), 1);

        assert_eq!(strategy.perform_work(), WorkOutcome::MoreToDo);
        assert_eq!(listener.events(), vec![delivered(1, 1), delivered(1, 2)]);
        assert_eq!(strategy.perform_work(), WorkOutcome::NoMoreToDo);
        assert_eq!(strategy.mode(), SendMode::Direct);
        assert_eq!(listener.events(), vec![delivered(1, 1), delivered(1, 2), delivered(1, 3)]);

        assert_eq!(sequences(&decode_packets(&sink.written())), vec![vec![1, 2], vec![3]]);
    }

    #[test]
    fn test_partial_send() {
        // one byte of publication id
        let element_len = SampleHeader::FIXED_LEN + 1 + 10;

        // the first element and part of the second go through
        let sink = Arc::new(ScriptedSink::new(vec![SinkResponse::AcceptUpTo(PacketHeader::SERIALIZED_LEN + element_len + 5)]));
        let listener = Arc::new(RecordingSendListener::default());
        let strategy = SendStrategy::new(config(), 0, sink.clone(), None);

        strategy.send_start();
        strategy.send(element(&listener, 1, 10));
        strategy.send(element(&listener, 2, 10));
        strategy.send_stop();

        assert_eq!(strategy.mode(), SendMode::Queue);
        assert_eq!(listener.events(), vec![delivered(1, 1)]);

        assert_eq!(strategy.perform_work(), WorkOutcome::NoMoreToDo);
        assert_eq!(listener.events(), vec![delivered(1, 1), delivered(1, 2)]);
        assert!(strategy.is_direct_mode());

        assert_eq!(sequences(&decode_packets(&sink.written())), vec![vec![1, 2]]);
    }

    #[rstest]
    #[case::exclusive_first(vec![true, false, false], vec![vec![1], vec![2, 3]])]
    #[case::exclusive_middle(vec![false, true, false], vec![vec![1], vec![2], vec![3]])]
    #[case::exclusive_last(vec![false, false, true], vec![vec![1, 2], vec![3]])]
    #[case::all_exclusive(vec![true, true], vec![vec![1], vec![2]])]
    fn test_packets_from_backlog(#[case] exclusive: Vec<bool>, #[case] expected: Vec<Vec<u32>>) {
        let sink = Arc::new(ScriptedSink::new(vec![SinkResponse::WouldBlock]));
        let listener = Arc::new(RecordingSendListener::default());
        let strategy = SendStrategy::new(config(), 0, sink.clone(), None);

        // a packet with sequence 0 is stuck, everything after goes to the backlog
        strategy.send(element(&listener, 0, 10));
        assert_eq!(strategy.mode(), SendMode::Queue);

        for (i, &excl) in exclusive.iter().enumerate() {
            let seq = i as u32 + 1;
            strategy.send(if excl { control(&listener, seq) } else { element(&listener, seq, 10) });
        }

        while strategy.perform_work() != WorkOutcome::NoMoreToDo {}

        let mut all_expected = vec![vec![0]];
        all_expected.extend(expected);
        assert_eq!(sequences(&decode_packets(&sink.written())), all_expected);
        assert_eq!(listener.events().len(), exclusive.len() + 1);
    }

    #[test]
    fn test_remove_sample_from_backlog() {
        let sink = Arc::new(ScriptedSink::new(vec![SinkResponse::WouldBlock]));
        let listener = Arc::new(RecordingSendListener::default());
        let strategy = SendStrategy::new(config(), 0, sink.clone(), None);

        strategy.send(element(&listener, 1, 10));
        strategy.send(element(&listener, 2, 10));
        strategy.send(element(&listener, 3, 10));

        assert!(strategy.remove_sample(key(1, 2)));
        assert!(!strategy.remove_sample(key(1, 2)));
        assert_eq!(listener.events(), vec![dropped(1, 2, false)]);

        while strategy.perform_work() != WorkOutcome::NoMoreToDo {}
        assert_eq!(sequences(&decode_packets(&sink.written())), vec![vec![1], vec![3]]);
    }

    #[test]
    fn test_remove_sample_from_partially_sent_packet() {
        let sink = Arc::new(ScriptedSink::new(vec![SinkResponse::AcceptUpTo(PacketHeader::SERIALIZED_LEN + 3)]));
        let listener = Arc::new(RecordingSendListener::default());
        let strategy = SendStrategy::new(config(), 0, sink.clone(), None);

        strategy.send_start();
        strategy.send(element(&listener, 1, 10));
        strategy.send(element(&listener, 2, 10));
        strategy.send_stop();
        assert_eq!(strategy.mode(), SendMode::Queue);

        assert!(strategy.remove_sample(key(1, 1)));
        assert!(strategy.remove_sample(key(1, 2)));
        assert_eq!(listener.events(), vec![dropped(1, 1, false), dropped(1, 2, false)]);

        // the bytes of the removed elements are still sent, the wire stream stays consistent
        while strategy.perform_work() != WorkOutcome::NoMoreToDo {}
        let packets = decode_packets(&sink.written());
        assert_eq!(sequences(&packets), vec![vec![1, 2]]);
        assert_eq!(packets[0].samples[1].1, vec![2u8; 10]);
        assert_eq!(listener.events().len(), 2);
    }

    #[test]
    fn test_remove_all_control_msgs() {
        let sink = Arc::new(ScriptedSink::new(vec![SinkResponse::WouldBlock]));
        let listener = Arc::new(RecordingSendListener::default());
        let strategy = SendStrategy::new(config(), 0, sink.clone(), None);

        strategy.send(control(&listener, 1));
        strategy.send(element(&listener, 2, 10));
        strategy.send(control(&listener, 3));
        strategy.send(control(&listener, 4));

        assert_eq!(strategy.remove_all_control_msgs(PublicationId::from_raw(2)), 0);
        assert_eq!(strategy.remove_all_control_msgs(PublicationId::from_raw(1)), 3);
        assert_eq!(listener.events(), vec![dropped(1, 3, false), dropped(1, 4, false), dropped(1, 1, false)]);

        while strategy.perform_work() != WorkOutcome::NoMoreToDo {}
        assert_eq!(sequences(&decode_packets(&sink.written())), vec![vec![1], vec![2]]);
    }

    #[rstest]
    #[case::peer_closed(SinkResponse::PeerClosed)]
    #[case::error(SinkResponse::Fail)]
    fn test_connection_lost_without_reconnector(#[case] response: SinkResponse) {
        let sink = Arc::new(ScriptedSink::new(vec![SinkResponse::WouldBlock, response]));
        let listener = Arc::new(RecordingSendListener::default());
        let strategy = SendStrategy::new(config(), 0, sink.clone(), None);

        strategy.send(element(&listener, 1, 10));
        strategy.send(element(&listener, 2, 10));
        assert_eq!(strategy.perform_work(), WorkOutcome::BrokenResource);

        assert_eq!(strategy.mode(), SendMode::Terminated);
        assert_eq!(listener.events(), vec![dropped(1, 1, true), dropped(1, 2, true)]);

        strategy.send(element(&listener, 3, 10));
        assert_eq!(listener.events().last(), Some(&dropped(1, 3, true)));
        strategy.resume_send();
        assert_eq!(strategy.mode(), SendMode::Terminated);
    }

    #[test]
    fn test_reconnect_resends_partial_packet() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let old_sink = Arc::new(ScriptedSink::new(vec![SinkResponse::AcceptUpTo(PacketHeader::SERIALIZED_LEN + 3), SinkResponse::PeerClosed]));
            let new_sink = Arc::new(ScriptedSink::new(vec![]));

            let mut reconnector = MockReconnector::new();
            let s = new_sink.clone();
            reconnector.expect_attempt_reconnect()
                .once()
                .returning(move || Ok(Connection { sink: s.clone(), source: Arc::new(FakeSource::new()) }));

            let mut seq = Sequence::new();
            let mut reconnect_listener = MockReconnectListener::new();
            reconnect_listener.expect_on_reconnecting()
                .once()
                .in_sequence(&mut seq)
                .return_const(());
            reconnect_listener.expect_on_reconnected()
                .once()
                .in_sequence(&mut seq)
                .return_const(());
            let reconnect_listener: Arc<dyn ReconnectListener> = Arc::new(reconnect_listener);

            let listener = Arc::new(RecordingSendListener::default());
            let strategy = SendStrategy::new(config(), 0, old_sink.clone(), Some(Arc::new(reconnector)));
            strategy.set_reconnect_listener(Arc::downgrade(&reconnect_listener));

            strategy.send_start();
            strategy.send(element(&listener, 1, 10));
            strategy.send(element(&listener, 2, 10));
            strategy.send_stop();
            assert_eq!(strategy.mode(), SendMode::Queue);

            assert_eq!(strategy.perform_work(), WorkOutcome::BrokenResource);
            assert_eq!(strategy.mode(), SendMode::Suspend);

            strategy.send(element(&listener, 3, 10));
            assert_eq!(strategy.backlog_len(), 1);

            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(strategy.mode(), SendMode::Queue);

            while strategy.perform_work() != WorkOutcome::NoMoreToDo {}
            assert_eq!(sequences(&decode_packets(&new_sink.written())), vec![vec![1, 2], vec![3]]);
            assert_eq!(listener.events(), vec![delivered(1, 1), delivered(1, 2), delivered(1, 3)]);
        });
    }

    #[test]
    fn test_reconnect_exhausted_terminates() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let sink = Arc::new(ScriptedSink::new(vec![SinkResponse::Fail]));

            let mut reconnector = MockReconnector::new();
            reconnector.expect_attempt_reconnect()
                .times(2)
                .returning(|| Err(anyhow::anyhow!("connection refused")));

            let mut seq = Sequence::new();
            let mut reconnect_listener = MockReconnectListener::new();
            reconnect_listener.expect_on_reconnecting()
                .once()
                .in_sequence(&mut seq)
                .return_const(());
            reconnect_listener.expect_on_reconnect_failed()
                .once()
                .in_sequence(&mut seq)
                .return_const(());
            let reconnect_listener: Arc<dyn ReconnectListener> = Arc::new(reconnect_listener);

            let listener = Arc::new(RecordingSendListener::default());
            let strategy = SendStrategy::new(config(), 0, sink, Some(Arc::new(reconnector)));
            strategy.set_reconnect_listener(Arc::downgrade(&reconnect_listener));

            strategy.send(element(&listener, 1, 10));
            assert_eq!(strategy.mode(), SendMode::Suspend);
            strategy.send(element(&listener, 2, 10));
            assert!(listener.events().is_empty());

            tokio::time::sleep(Duration::from_secs(1)).await;
            assert_eq!(strategy.mode(), SendMode::Terminated);
            assert_eq!(listener.events(), vec![dropped(1, 1, true), dropped(1, 2, true)]);
        });
    }

    #[test]
    fn test_synch_worker_drains_backlog() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let mut sink = MockByteSink::new();
            let mut num_calls = 0;
            sink.expect_send_vectored()
                .returning(move |bufs| {
                    num_calls += 1;
                    if num_calls == 1 {
                        Err(std::io::ErrorKind::WouldBlock.into())
                    }
                    else {
                        Ok(bufs.iter().map(|b| b.len()).sum())
                    }
                });
            sink.expect_writable()
                .returning(|| Ok(()));

            let listener = Arc::new(RecordingSendListener::default());
            let strategy = SendStrategy::new(config(), 0, Arc::new(sink), None);
            strategy.start();

            strategy.send(element(&listener, 1, 10));
            strategy.send(element(&listener, 2, 10));
            assert_eq!(strategy.mode(), SendMode::Queue);

            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(strategy.mode(), SendMode::Direct);
            assert_eq!(listener.events(), vec![delivered(1, 1), delivered(1, 2)]);

            strategy.stop();
        });
    }

    #[test]
    fn test_suspend_resume() {
        let sink = Arc::new(ScriptedSink::new(vec![]));
        let listener = Arc::new(RecordingSendListener::default());
        let strategy = SendStrategy::new(config(), 0, sink.clone(), None);

        // resume without suspend is ignored
        strategy.resume_send();
        assert!(strategy.is_direct_mode());

        strategy.suspend_send();
        strategy.resume_send();
        assert!(strategy.is_direct_mode());

        strategy.suspend_send();
        strategy.send(element(&listener, 1, 10));
        assert!(sink.written().is_empty());
        strategy.resume_send();
        assert_eq!(strategy.mode(), SendMode::Queue);

        assert_eq!(strategy.perform_work(), WorkOutcome::NoMoreToDo);
        assert!(strategy.is_direct_mode());
        assert_eq!(listener.events(), vec![delivered(1, 1)]);
    }

    #[rstest]
    #[case::transport_gives_up(false, true)]
    #[case::link_released(true, false)]
    fn test_terminate_drains_everything(#[case] released: bool, #[case] expected_by_transport: bool) {
        let sink = Arc::new(ScriptedSink::new(vec![SinkResponse::WouldBlock]));
        let listener = Arc::new(RecordingSendListener::default());
        let strategy = SendStrategy::new(config(), 0, sink.clone(), None);

        strategy.send(element(&listener, 1, 10));
        strategy.send(element(&listener, 2, 10));
        strategy.link_released(released);
        strategy.terminate_send(false);

        assert_eq!(listener.events(), vec![dropped(1, 1, expected_by_transport), dropped(1, 2, expected_by_transport)]);
        assert_eq!(strategy.perform_work(), WorkOutcome::BrokenResource);

        strategy.clear(SendMode::Direct);
        assert_eq!(strategy.mode(), SendMode::Terminated);
    }

    #[test]
    fn test_disconnect_gracefully() {
        let sink = Arc::new(ScriptedSink::new(vec![]));
        let listener = Arc::new(RecordingSendListener::default());
        let strategy = SendStrategy::new(config(), 0, sink.clone(), None);

        strategy.send_start();
        strategy.send(element(&listener, 1, 10));
        strategy.disconnect_gracefully(sample_element(MessageId::GracefulDisconnect, PublicationId::from_raw(0), 0, b"", config().byte_order, None));

        assert_eq!(listener.events(), vec![dropped(1, 1, false)]);
        assert_eq!(strategy.mode(), SendMode::Terminated);
        let packets = decode_packets(&sink.written());
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].samples.len(), 1);
        assert_eq!(packets[0].samples[0].0.message_id, MessageId::GracefulDisconnect);
    }

    #[test]
    fn test_disconnect_gracefully_after_partial_send() {
        let sink = Arc::new(ScriptedSink::new(vec![SinkResponse::AcceptUpTo(PacketHeader::SERIALIZED_LEN + 3)]));
        let listener = Arc::new(RecordingSendListener::default());
        let strategy = SendStrategy::new(config(), 0, sink.clone(), None);

        strategy.send(element(&listener, 1, 10));
        assert_eq!(strategy.mode(), SendMode::Queue);
        strategy.disconnect_gracefully(sample_element(MessageId::GracefulDisconnect, PublicationId::from_raw(0), 0, b"", config().byte_order, None));

        assert_eq!(listener.events(), vec![dropped(1, 1, false)]);
        assert_eq!(strategy.mode(), SendMode::Terminated);
        assert_eq!(sink.written().len(), PacketHeader::SERIALIZED_LEN + 3);
    }

    #[test]
    fn test_clear() {
        let sink = Arc::new(ScriptedSink::new(vec![SinkResponse::WouldBlock]));
        let listener = Arc::new(RecordingSendListener::default());
        let strategy = SendStrategy::new(config(), 0, sink.clone(), None);

        strategy.send(element(&listener, 1, 10));
        strategy.send(element(&listener, 2, 10));
        strategy.clear(SendMode::Direct);

        assert!(strategy.is_direct_mode());
        assert_eq!(strategy.backlog_len(), 0);
        assert_eq!(listener.events(), vec![dropped(1, 1, true), dropped(1, 2, true)]);
    }

    #[test]
    fn test_listener_may_reenter() {
        let sink = Arc::new(ScriptedSink::new(vec![]));
        let strategy = SendStrategy::new(config(), 0, sink.clone(), None);

        let reentrant = Arc::new(ReentrantSendListener::new(strategy.clone()));
        strategy.send(sample_element(MessageId::SampleData, PublicationId::from_raw(1), 1, b"abc", config().byte_order, Some(reentrant.clone())));

        assert_eq!(sequences(&decode_packets(&sink.written())), vec![vec![1], vec![1001]]);
    }
}
