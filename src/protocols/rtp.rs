//! RTP (Real-time Transport Protocol) support
//!
//! RFC 3550 packet codec, extended-sequence tracking for inbound streams,
//! and the clock-paced writer that drives audio playout at codec frame rate.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::trace;

use crate::{Error, Result};

/// Fixed RTP header length in bytes.
const RTP_HEADER_LEN: usize = 12;
const RTP_VERSION: u8 = 2;

/// One RTP packet as the switchboard sends and relays it.
///
/// Only what this crate acts on is modelled: padding and header extensions
/// are stripped during decode and never generated, and the CSRC count is
/// the list length.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc_list: Vec<u32>,
    pub payload: Bytes,
}

impl RtpPacket {
    /// Header for one frame of an outgoing stream. Payload and marker are
    /// chained on.
    pub fn frame(payload_type: u8, sequence_number: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            marker: false,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc_list: Vec::new(),
            payload: Bytes::new(),
        }
    }

    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_marker(mut self) -> Self {
        self.marker = true;
        self
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            RTP_HEADER_LEN + 4 * self.csrc_list.len() + self.payload.len(),
        );

        buf.put_u8(RTP_VERSION << 6 | self.csrc_list.len() as u8 & 0x0F);
        buf.put_u8(u8::from(self.marker) << 7 | self.payload_type & 0x7F);
        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        for csrc in &self.csrc_list {
            buf.put_u32(*csrc);
        }
        buf.put(self.payload.clone());

        buf.freeze()
    }

    pub fn decode(data: Bytes) -> Result<Self> {
        if data.len() < RTP_HEADER_LEN {
            return Err(Error::rtp(format!(
                "Datagram of {} bytes is below the RTP header size",
                data.len()
            )));
        }

        let flags = data[0];
        let version = flags >> 6;
        if version != RTP_VERSION {
            return Err(Error::rtp(format!("Unsupported RTP version {}", version)));
        }
        let has_padding = flags & 0x20 != 0;
        let has_extension = flags & 0x10 != 0;
        let csrc_count = (flags & 0x0F) as usize;

        let marker = data[1] & 0x80 != 0;
        let payload_type = data[1] & 0x7F;
        let sequence_number = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut offset = RTP_HEADER_LEN;
        let mut csrc_list = Vec::with_capacity(csrc_count);
        for _ in 0..csrc_count {
            let word = read_word(&data, offset)
                .ok_or_else(|| Error::rtp("CSRC list runs past the end of the datagram"))?;
            csrc_list.push(word);
            offset += 4;
        }

        if has_extension {
            // profile word carries the extension length in 32-bit words
            let header = read_word(&data, offset)
                .ok_or_else(|| Error::rtp("Truncated RTP extension header"))?;
            let extension_words = (header & 0xFFFF) as usize;
            offset += 4 + extension_words * 4;
            if offset > data.len() {
                return Err(Error::rtp("RTP extension longer than the datagram"));
            }
        }

        let mut payload_end = data.len();
        if has_padding {
            let pad = data[payload_end - 1] as usize;
            if pad == 0 || offset + pad > payload_end {
                return Err(Error::rtp("Invalid RTP padding length"));
            }
            payload_end -= pad;
        }

        Ok(Self {
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc_list,
            payload: data.slice(offset..payload_end),
        })
    }
}

/// Bounds-checked big-endian word read.
fn read_word(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Codec timing parameters for the paced writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecParams {
    pub payload_type: u8,
    pub sample_duration: Duration,
    pub samples_per_frame: u32,
}

impl CodecParams {
    /// G.711 u-law: PT 0, 8 kHz, 20 ms frames of 160 samples.
    pub const fn pcmu() -> Self {
        Self {
            payload_type: 0,
            sample_duration: Duration::from_millis(20),
            samples_per_frame: 160,
        }
    }
}

/// Tracks a 16-bit inbound RTP sequence, extending it to 32 bits across
/// rollovers and counting gaps as loss.
///
/// Negative signed deltas are reordering, never loss. Rollover is detected
/// only by the high/low window test.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    initialized: bool,
    last_seq: u16,
    cycles: u32,
    lost: u64,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next observed sequence number; returns the extended 32-bit
    /// sequence.
    pub fn update(&mut self, seq: u16) -> u32 {
        if !self.initialized {
            self.initialized = true;
            self.last_seq = seq;
            return self.extended(seq);
        }

        if self.last_seq > 0xF000 && seq < 0x1000 {
            self.cycles += 1;
        }

        let diff = seq.wrapping_sub(self.last_seq) as i16;
        if diff > 1 {
            self.lost += (diff - 1) as u64;
        }
        // diff <= 0: reordered or duplicate, ignored

        self.last_seq = seq;
        self.extended(seq)
    }

    fn extended(&self, seq: u16) -> u32 {
        (self.cycles << 16) | seq as u32
    }

    pub fn lost(&self) -> u64 {
        self.lost
    }

    pub fn cycles(&self) -> u32 {
        self.cycles
    }
}

/// Emits RTP packets at the codec frame rate.
///
/// `write` blocks on the next tick; sequence and timestamp advance once per
/// frame. `write_rtp` bypasses the clock for event payloads but pins the
/// packet to this writer's SSRC so the stream stays coherent.
pub struct ClockPacedWriter {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    codec: CodecParams,
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
    ticker: Interval,
    closed: bool,
}

impl ClockPacedWriter {
    pub fn new(socket: Arc<UdpSocket>, remote: SocketAddr, codec: CodecParams) -> Self {
        let mut ticker = interval(codec.sample_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            socket,
            remote,
            codec,
            ssrc: rand::random::<u32>(),
            sequence: rand::random::<u16>(),
            timestamp: rand::random::<u32>(),
            ticker,
            closed: false,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Current stream position: (sequence, timestamp) of the next packet.
    pub fn position(&self) -> (u16, u32) {
        (self.sequence, self.timestamp)
    }

    /// Skip the sequence forward without emitting; used after out-of-band
    /// packets were sent through `write_rtp`.
    pub fn advance_sequence(&mut self, count: u16) {
        self.sequence = self.sequence.wrapping_add(count);
    }

    /// Send one codec frame, paced to the codec tick.
    pub async fn write(&mut self, payload: Bytes) -> Result<()> {
        if self.closed {
            return Err(Error::rtp("Writer is closed"));
        }

        self.ticker.tick().await;

        let packet = RtpPacket::frame(
            self.codec.payload_type,
            self.sequence,
            self.timestamp,
            self.ssrc,
        )
        .with_payload(payload);

        let encoded = packet.encode();
        self.socket
            .send_to(&encoded, self.remote)
            .await
            .map_err(|e| Error::transport(format!("RTP send failed: {}", e)))?;

        trace!(
            seq = self.sequence,
            ts = self.timestamp,
            len = encoded.len(),
            "sent paced RTP frame"
        );

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(self.codec.samples_per_frame);
        Ok(())
    }

    /// Send a pre-built packet immediately, stamping this writer's SSRC.
    pub async fn write_rtp(&mut self, mut packet: RtpPacket) -> Result<()> {
        if self.closed {
            return Err(Error::rtp("Writer is closed"));
        }

        packet.ssrc = self.ssrc;
        let encoded = packet.encode();
        self.socket
            .send_to(&encoded, self.remote)
            .await
            .map_err(|e| Error::transport(format!("RTP send failed: {}", e)))?;
        Ok(())
    }

    /// Stop the ticker; subsequent writes fail fast.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
