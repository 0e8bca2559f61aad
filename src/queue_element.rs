use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use bytes::{BufMut, BytesMut};
#[cfg(test)] use mockall::automock;
use tracing::{error, trace};
use crate::byte_chain::ByteChain;
use crate::data_link::ConnectionNotice;
use crate::ids::{PublicationId, RepoId, SampleKey};
use crate::packet_header::ByteOrder;
use crate::safe_converter::PrecheckedCast;
use crate::sample_header::{MessageId, SampleHeader};

/// The upper layer's view of the send path: every element handed to `send()` is reported back
///  exactly once, either as delivered (i.e. completely written to the connection) or dropped.
#[cfg_attr(test, automock)]
pub trait SendListener: Send + Sync {
    fn data_delivered(&self, key: SampleKey);

    /// `dropped_by_transport` is false if the drop was requested by the upper layer (removal,
    ///  release of the link), and true if the transport gave up on the element.
    fn data_dropped(&self, key: SampleKey, dropped_by_transport: bool);

    /// `remote_ids` are the remote subscriptions associated with the listener's publication
    fn notify_connection(&self, _notice: ConnectionNotice, _remote_ids: Vec<RepoId>) {}
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ElementKind {
    Sample,
    Control,
    /// Stands in for an element that was removed from a packet after the packet was built. It
    ///  carries a private copy of the removed element's bytes and reports nothing.
    Replaced,
}

/// A unit of outgoing work: a marshaled sample header plus payload, and the listener to notify
///  about its fate.
///
/// NB: The outcome methods consume the element, so reporting an outcome twice does not compile.
///  Dropping an element without reporting its outcome is a bug and is logged as an error.
pub struct QueueElement {
    kind: ElementKind,
    key: SampleKey,
    message_id: MessageId,
    chain: ByteChain,
    exclusive: bool,
    listener: Option<Arc<dyn SendListener>>,
    outcome_reported: bool,
}

impl Debug for QueueElement {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "QueueElement{{{:?} {:?} {:?}, {} bytes{}}}",
               self.kind, self.message_id, self.key, self.chain.len(),
               if self.exclusive { ", exclusive" } else { "" })
    }
}

impl QueueElement {
    /// Builds an element by marshaling `header` in front of `payload`. The header's
    ///  `message_length` is set to the payload's length.
    pub fn new(mut header: SampleHeader, payload: ByteChain, listener: Option<Arc<dyn SendListener>>) -> QueueElement {
        header.message_length = payload.len().prechecked_cast();

        let mut header_buf = BytesMut::with_capacity(header.serialized_len());
        header.ser(&mut header_buf);

        let mut chain = ByteChain::from_segment(header_buf.freeze());
        chain.append(payload);

        QueueElement {
            kind: if header.message_id == MessageId::SampleData { ElementKind::Sample } else { ElementKind::Control },
            key: SampleKey {
                publication_id: header.publication_id,
                sequence: header.sequence,
            },
            message_id: header.message_id,
            chain,
            exclusive: header.message_id.requires_exclusive_packet(),
            listener,
            outcome_reported: false,
        }
    }

    /// Creates the placeholder for this element in a packet that was built already. The
    ///  placeholder owns a copy of the bytes, so `self` no longer pins the original buffers.
    pub(crate) fn replacement(&self) -> QueueElement {
        QueueElement {
            kind: ElementKind::Replaced,
            key: self.key,
            message_id: self.message_id,
            chain: self.chain.deep_copy(),
            exclusive: self.exclusive,
            listener: None,
            outcome_reported: false,
        }
    }

    pub fn kind(&self) -> ElementKind {
        self.kind
    }

    pub fn key(&self) -> SampleKey {
        self.key
    }

    pub fn publication_id(&self) -> PublicationId {
        self.key.publication_id
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn is_control(&self) -> bool {
        self.kind == ElementKind::Control
    }

    pub fn requires_exclusive_packet(&self) -> bool {
        self.exclusive
    }

    /// The number of bytes this element contributes to a packet, i.e. sample header plus payload
    pub fn byte_length(&self) -> usize {
        self.chain.len()
    }

    pub fn chain(&self) -> &ByteChain {
        &self.chain
    }

    pub fn mark_delivered(mut self) {
        trace!("delivered {:?}", self);
        self.outcome_reported = true;
        if let Some(listener) = &self.listener {
            listener.data_delivered(self.key);
        }
    }

    pub fn mark_dropped(mut self, dropped_by_transport: bool) {
        trace!("dropped {:?} (by transport: {})", self, dropped_by_transport);
        self.outcome_reported = true;
        if let Some(listener) = &self.listener {
            listener.data_dropped(self.key, dropped_by_transport);
        }
    }
}

impl Drop for QueueElement {
    fn drop(&mut self) {
        if !self.outcome_reported && self.kind != ElementKind::Replaced {
            error!("{:?} was discarded without reporting delivered or dropped - this is a bug", self);
        }
    }
}

/// Builds a sample header for `payload` with default timestamps and marshals it into an element.
///  This is a convenience for callers that do not track coherency groups or timestamps.
pub fn sample_element(message_id: MessageId, publication_id: PublicationId, sequence: u32, payload: &[u8], byte_order: ByteOrder, listener: Option<Arc<dyn SendListener>>) -> QueueElement {
    let header = SampleHeader::new(message_id, publication_id, sequence, 0, byte_order);
    let mut buf = BytesMut::with_capacity(payload.len());
    buf.put_slice(payload);
    QueueElement::new(header, ByteChain::from_segment(buf.freeze()), listener)
}
