use std::time::Duration;
use anyhow::bail;
use crate::packet_header::{ByteOrder, PacketHeader};
use crate::sample_header::SampleHeader;

pub struct TransportConfig {
    /// The upper bound for a transport packet, including the packet header. A single sample
    ///  (including its sample header) plus the packet header must fit into this size, samples
    ///  exceeding it are rejected as a configuration error rather than fragmented.
    pub max_packet_size: u32,

    /// Packets are sent as soon as their size reaches this threshold, even inside a burst of
    ///  sends bracketed by `send_start()` / `send_stop()`. Bigger packets reduce per-packet
    ///  overhead at the price of latency.
    pub optimum_packet_size: u32,

    /// This is the maximum number of samples combined into a single packet
    pub max_samples_per_packet: usize,

    /// The number of buffers in the receive ring per connection
    pub receive_buffer_count: usize,
    /// The size of each receive buffer. The default is the Ethernet MTU so that a typical TCP
    ///  segment fits into a single buffer.
    pub receive_buffer_size: usize,
    /// A receive buffer that was read completely is retired once its remaining free space drops
    ///  below this threshold, rather than using the rest for the next read.
    pub receive_buffer_low_water: usize,

    /// Byte order used for marshalling outgoing headers. Incoming headers declare their own
    ///  byte order in their flags.
    pub byte_order: ByteOrder,

    pub reconnect: ReconnectConfig,
}

impl TransportConfig {
    pub fn default_tcp() -> TransportConfig {
        TransportConfig {
            max_packet_size: 64*1024,
            optimum_packet_size: 4096,
            max_samples_per_packet: 10,
            receive_buffer_count: 16,
            receive_buffer_size: 1500,
            receive_buffer_low_water: 64,
            byte_order: ByteOrder::native(),
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_samples_per_packet == 0 {
            bail!("max samples per packet must be at least 1");
        }
        if (self.max_packet_size as usize) < PacketHeader::SERIALIZED_LEN + SampleHeader::MAX_SERIALIZED_LEN {
            bail!("max packet size {} is too small to hold a single empty sample", self.max_packet_size);
        }
        if self.optimum_packet_size > self.max_packet_size {
            bail!("optimum packet size {} exceeds the max packet size {}", self.optimum_packet_size, self.max_packet_size);
        }
        if self.receive_buffer_count < 2 {
            bail!("at least two receive buffers are required");
        }
        if self.receive_buffer_size < PacketHeader::SERIALIZED_LEN + SampleHeader::MAX_SERIALIZED_LEN {
            bail!("receive buffer size {} is smaller than the maximum header size", self.receive_buffer_size);
        }
        if self.receive_buffer_low_water >= self.receive_buffer_size {
            bail!("receive buffer low water mark must be smaller than the buffer size");
        }
        self.reconnect.validate()?;
        Ok(())
    }

    /// The largest sample (i.e. sample header + payload) that fits into a single packet
    pub fn max_element_len(&self) -> usize {
        self.max_packet_size as usize - PacketHeader::SERIALIZED_LEN
    }
}

pub struct ReconnectConfig {
    /// Reconnecting is abandoned after this many failed attempts, and the link is terminated
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// The delay between attempts grows by this factor (in eighths, i.e. 16 doubles the delay)
    pub backoff_factor_eighths: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_factor_eighths: 16,
        }
    }
}

impl ReconnectConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backoff_factor_eighths < 8 {
            bail!("reconnect backoff factor must not shrink the delay");
        }
        if self.initial_delay > self.max_delay {
            bail!("initial reconnect delay exceeds the max delay");
        }
        Ok(())
    }
}
