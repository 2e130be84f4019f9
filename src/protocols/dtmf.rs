//! RFC 4733 telephone-event (DTMF) handling
//!
//! Encodes and decodes the 4-byte telephone-event payload and provides the
//! sender pacing / receiver gating logic around it. Events ride the same RTP
//! stream as audio: intermediate packets every 20 ms at a fixed timestamp,
//! marker on the first, three redundant end packets 5 ms apart.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::sleep;
use tracing::debug;

use crate::protocols::rtp::{ClockPacedWriter, RtpPacket};
use crate::{Error, Result};

/// Samples at 8 kHz an end event must cover before the digit is accepted.
pub const MIN_EVENT_DURATION: u16 = 400;

/// RTP payload type this deployment uses for telephone-events.
pub const TELEPHONE_EVENT_PAYLOAD_TYPE: u8 = 101;

/// Gap between the intermediate packets of one event.
const PACKET_INTERVAL: Duration = Duration::from_millis(20);
/// Gap between the redundant end-of-event packets.
const END_PACKET_GAP: Duration = Duration::from_millis(5);
/// Samples per intermediate packet at 8 kHz / 20 ms.
const SAMPLES_PER_INTERVAL: u16 = 160;

/// One decoded telephone-event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelephoneEvent {
    pub event: u8,
    pub end: bool,
    pub volume: u8,
    pub duration: u16,
}

impl TelephoneEvent {
    pub fn encode(&self) -> [u8; 4] {
        [
            self.event,
            (if self.end { 0x80 } else { 0 }) | (self.volume & 0x3F),
            (self.duration >> 8) as u8,
            (self.duration & 0xFF) as u8,
        ]
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < 4 {
            return Err(Error::rtp("telephone-event payload too short"));
        }
        Ok(Self {
            event: payload[0],
            end: payload[1] & 0x80 != 0,
            volume: payload[1] & 0x3F,
            duration: ((payload[2] as u16) << 8) | payload[3] as u16,
        })
    }
}

/// Map an event code 0..15 to its digit character.
pub fn event_to_char(event: u8) -> Option<char> {
    match event {
        0..=9 => Some((b'0' + event) as char),
        10 => Some('*'),
        11 => Some('#'),
        12..=15 => Some((b'A' + event - 12) as char),
        _ => None,
    }
}

/// Map a digit character to its event code.
pub fn char_to_event(digit: char) -> Option<u8> {
    match digit.to_ascii_uppercase() {
        '0'..='9' => Some(digit as u8 - b'0'),
        '*' => Some(10),
        '#' => Some(11),
        'A'..='D' => Some(digit.to_ascii_uppercase() as u8 - b'A' + 12),
        _ => None,
    }
}

/// Build the full packet train for one digit: intermediate packets covering
/// `duration_ms`, then three end packets. Sequence numbers advance from
/// `start_seq`; the timestamp is fixed for the whole event and the marker
/// bit is set only on the first packet.
pub fn encode_digit_packets(
    digit: char,
    duration_ms: u32,
    volume: u8,
    payload_type: u8,
    start_seq: u16,
    timestamp: u32,
) -> Result<Vec<RtpPacket>> {
    let event = char_to_event(digit)
        .ok_or_else(|| Error::rtp(format!("Not a DTMF digit: {}", digit)))?;

    let total_samples = (duration_ms as u64 * 8) as u16; // 8 samples per ms
    let intervals = (duration_ms / 20).max(1);

    let mut packets = Vec::with_capacity(intervals as usize + 3);
    let mut seq = start_seq;

    for i in 0..intervals {
        let elapsed = ((i + 1) as u16).saturating_mul(SAMPLES_PER_INTERVAL);
        let ev = TelephoneEvent {
            event,
            end: false,
            volume,
            duration: elapsed.min(total_samples),
        };
        let mut packet = RtpPacket::frame(payload_type, seq, timestamp, 0)
            .with_payload(Bytes::copy_from_slice(&ev.encode()));
        if i == 0 {
            packet = packet.with_marker();
        }
        packets.push(packet);
        seq = seq.wrapping_add(1);
    }

    let end_event = TelephoneEvent {
        event,
        end: true,
        volume,
        duration: total_samples,
    };
    for _ in 0..3 {
        packets.push(
            RtpPacket::frame(payload_type, seq, timestamp, 0)
                .with_payload(Bytes::copy_from_slice(&end_event.encode())),
        );
        seq = seq.wrapping_add(1);
    }

    Ok(packets)
}

/// Send one digit through a paced writer, keeping the writer's sequence in
/// step with the packets emitted.
pub async fn send_digit(
    writer: &mut ClockPacedWriter,
    payload_type: u8,
    digit: char,
    duration_ms: u32,
    volume: u8,
) -> Result<()> {
    let (start_seq, timestamp) = writer.position();
    let packets = encode_digit_packets(digit, duration_ms, volume, payload_type, start_seq, timestamp)?;
    let count = packets.len() as u16;

    for (i, packet) in packets.into_iter().enumerate() {
        let is_end = TelephoneEvent::decode(&packet.payload)?.end;
        writer.write_rtp(packet).await?;
        if i as u16 + 1 < count {
            sleep(if is_end { END_PACKET_GAP } else { PACKET_INTERVAL }).await;
        }
    }

    writer.advance_sequence(count);
    debug!(digit = %digit, duration_ms, "sent DTMF event");
    Ok(())
}

/// Receiver side: collapses the packet train back into digits.
///
/// A first non-end packet opens an event, continuations update the running
/// duration, and a matching end packet of sufficient duration emits the
/// digit. Anything inconsistent clears the pending state without emission.
#[derive(Debug)]
pub struct DtmfReceiver {
    min_duration: u16,
    pending: Option<PendingEvent>,
}

#[derive(Debug, Clone, Copy)]
struct PendingEvent {
    event: u8,
    volume: u8,
    duration: u16,
}

impl Default for DtmfReceiver {
    fn default() -> Self {
        Self::new(MIN_EVENT_DURATION)
    }
}

impl DtmfReceiver {
    pub fn new(min_duration: u16) -> Self {
        Self {
            min_duration,
            pending: None,
        }
    }

    /// Feed one telephone-event payload; returns a digit when an event
    /// completes.
    pub fn on_event(&mut self, ev: TelephoneEvent) -> Option<char> {
        if !ev.end {
            match &mut self.pending {
                Some(pending) if pending.event == ev.event => {
                    pending.duration = ev.duration;
                    pending.volume = ev.volume;
                }
                _ => {
                    self.pending = Some(PendingEvent {
                        event: ev.event,
                        volume: ev.volume,
                        duration: ev.duration,
                    });
                }
            }
            return None;
        }

        // End packet: must match the pending event and satisfy the
        // minimum duration gate.
        match self.pending.take() {
            Some(pending) if pending.event == ev.event && ev.duration >= self.min_duration => {
                event_to_char(ev.event)
            }
            _ => None,
        }
    }
}
