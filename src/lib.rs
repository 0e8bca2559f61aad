//! A connection-oriented transport for publish/subscribe samples.
//!
//! Samples are framed into packets, each with a packet header followed by samples with their own
//!  sample headers. The send path batches samples into packets, applies backpressure by queueing,
//!  and re-establishes lost connections. The receive path reassembles samples from arbitrarily
//!  chunked input without copying their payload.
//!
//! The main entry points are:
//! * [`transport_impl::TransportImpl`], owning the data links of a process
//! * [`data_link::DataLink`], one connection and the associations using it
//! * [`send_strategy::SendStrategy`] and [`receive_strategy::ReceiveStrategy`] for the two
//!    directions of a link

pub mod byte_chain;
pub mod byte_sink;
pub mod config;
pub mod data_link;
pub mod disjoint_sequence;
pub mod error;
pub mod ids;
pub mod packet_header;
pub mod queue_element;
pub mod receive_ring;
pub mod receive_strategy;
pub mod reconnect;
pub mod safe_converter;
pub mod sample_header;
pub mod send_strategy;
pub mod tcp;
pub mod test_util;
pub mod transport_impl;
