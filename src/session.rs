//! Session Table (C3): `ssrc -> Session` and `call_id -> Session` indices,
//! plus the per-session state the receiver and sender paths mutate.
//!
//! Mirrors `crates/service/src/session/mod.rs`'s `Table<K, V>` wrapper over
//! an `ahash` map behind a `parking_lot::RwLock`, with per-session fields
//! grouped by which activity is allowed to touch them (spec §5) instead of
//! one lock per session guarding everything.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use ahash::RandomState;
use parking_lot::{Mutex, RwLock};

use crate::resampler::{Downsampler16to8, Upsampler8to16};

pub const SAMPLES_PER_PACKET: usize = 160;
const BYTES_PER_SAMPLE: usize = 2;
const FRAME_BYTES: usize = SAMPLES_PER_PACKET * BYTES_PER_SAMPLE;
const TALKSPURT_GAP: Duration = Duration::from_millis(200);

type Map<K, V> = HashMap<K, V, RandomState>;

/// Outcome of applying one inbound sequence number to a session's loss
/// tracker (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOutcome {
    InOrder,
    /// Forward gap of this many packets (added to `packet_loss_count`).
    Loss(u16),
    /// Arrived behind the current expectation; no effect on loss count.
    Reorder,
}

/// Classifies `sequence` against `expected` using the modular forward
/// window from spec §4.3, and returns the outcome plus the new
/// `expected_sequence` (unchanged on reorder, so a late arrival can never
/// rewind or re-advance the tracker).
fn classify_sequence(expected: u16, sequence: u16) -> (SequenceOutcome, u16) {
    if sequence == expected {
        return (SequenceOutcome::InOrder, sequence.wrapping_add(1));
    }

    let forward_gap = sequence.wrapping_sub(expected);
    if forward_gap < 0x8000 {
        (SequenceOutcome::Loss(forward_gap), sequence.wrapping_add(1))
    } else {
        (SequenceOutcome::Reorder, expected)
    }
}

/// Fields written only by the receiver path.
struct Inbound {
    frames_received: u64,
    frames_processed: u64,
    packet_loss_count: u64,
    expected_sequence: Option<u16>,
    last_sequence: Option<u16>,
    non_standard_header_count: u64,
    in_resampler: Upsampler8to16,
}

/// Fields written only by the sender path.
struct Outbound {
    send_sequence: u16,
    send_timestamp: u32,
    send_initialized: bool,
    out_resampler: Downsampler16to8,
    last_send_at: Option<Instant>,
    /// Residual 8 kHz PCM16 bytes shorter than one 20 ms packet.
    carry: Vec<u8>,
}

/// Fields read and written by both paths.
struct Shared {
    remote: Option<std::net::SocketAddr>,
    last_packet_at: Instant,
}

/// One RTP packet ready to be encoded and sent (C5 hands these to the
/// codec + socket layer in `server.rs`).
pub struct OutboundFrame {
    pub marker: bool,
    pub sequence: u16,
    pub timestamp: u32,
    pub pcm16_8k: Vec<u8>,
}

pub struct Session {
    pub call_id: String,
    pub ssrc: u32,
    pub send_ssrc: u32,
    pub created_at: Instant,
    unsupported_codec_logged: AtomicBool,
    inbound: Mutex<Inbound>,
    outbound: Mutex<Outbound>,
    shared: Mutex<Shared>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("call_id", &self.call_id)
            .field("ssrc", &self.ssrc)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InboundSnapshot {
    pub frames_received: u64,
    pub frames_processed: u64,
    pub packet_loss_count: u64,
    pub expected_sequence: Option<u16>,
    pub last_sequence: Option<u16>,
    pub non_standard_header_count: u64,
}

impl Session {
    fn new(call_id: String, ssrc: u32, send_ssrc: u32, now: Instant) -> Self {
        Self {
            call_id,
            ssrc,
            send_ssrc,
            created_at: now,
            unsupported_codec_logged: AtomicBool::new(false),
            inbound: Mutex::new(Inbound {
                frames_received: 0,
                frames_processed: 0,
                packet_loss_count: 0,
                expected_sequence: None,
                last_sequence: None,
                non_standard_header_count: 0,
                in_resampler: Upsampler8to16::new(),
            }),
            outbound: Mutex::new(Outbound {
                send_sequence: 0,
                send_timestamp: 0,
                send_initialized: false,
                out_resampler: Downsampler16to8::new(),
                last_send_at: None,
                carry: Vec::new(),
            }),
            shared: Mutex::new(Shared {
                remote: None,
                last_packet_at: now,
            }),
        }
    }

    /// Updates loss tracking for one inbound sequence number and bumps
    /// `frames_received`. Returns the classification so the caller can
    /// log/count as appropriate.
    pub fn record_inbound_sequence(&self, sequence: u16, non_standard: bool) -> SequenceOutcome {
        let mut inbound = self.inbound.lock();
        inbound.frames_received += 1;
        if non_standard {
            inbound.non_standard_header_count += 1;
        }

        let outcome = match inbound.expected_sequence {
            None => {
                inbound.expected_sequence = Some(sequence.wrapping_add(1));
                inbound.last_sequence = Some(sequence);
                return SequenceOutcome::InOrder;
            }
            Some(expected) => classify_sequence(expected, sequence),
        };

        let (outcome, next_expected) = outcome;
        if let SequenceOutcome::Loss(gap) = outcome {
            inbound.packet_loss_count += gap as u64;
        }
        inbound.expected_sequence = Some(next_expected);
        inbound.last_sequence = Some(sequence);
        outcome
    }

    /// Runs the inbound 8 kHz -> 16 kHz resampler and bumps
    /// `frames_processed`. On a resample failure the frame passes through
    /// unresampled (the raw 8 kHz bytes are handed onward as-is) and the
    /// second return value is `true`, so the caller can count and log the
    /// failure without dropping the session or the frame (spec §4.2).
    pub fn resample_inbound(&self, pcm16_8k: &[u8]) -> (Vec<u8>, bool) {
        let mut inbound = self.inbound.lock();
        inbound.frames_processed += 1;
        match inbound.in_resampler.process(pcm16_8k) {
            Ok(pcm16_16k) => (pcm16_16k, false),
            Err(_) => (pcm16_8k.to_vec(), true),
        }
    }

    /// Returns `true` the first time this is called for the session (used
    /// to implement the "log once per session" contract for
    /// `UnsupportedCodec`, spec §10.5).
    pub fn latch_unsupported_codec(&self) -> bool {
        self.unsupported_codec_logged
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn touch(&self, now: Instant) {
        self.shared.lock().last_packet_at = now;
    }

    /// Learns or updates the remote endpoint. Returns `true` if this call
    /// changed a previously-known address (used to log a rebind event).
    pub fn learn_remote(&self, addr: std::net::SocketAddr) -> bool {
        let mut shared = self.shared.lock();
        let changed = shared.remote.is_some_and(|prev| prev != addr);
        shared.remote = Some(addr);
        changed
    }

    pub fn remote(&self) -> Option<std::net::SocketAddr> {
        self.shared.lock().remote
    }

    pub fn last_packet_at(&self) -> Instant {
        self.shared.lock().last_packet_at
    }

    pub fn is_active(&self, now: Instant, idle_timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_packet_at()) < idle_timeout
    }

    pub fn inbound_snapshot(&self) -> InboundSnapshot {
        let inbound = self.inbound.lock();
        InboundSnapshot {
            frames_received: inbound.frames_received,
            frames_processed: inbound.frames_processed,
            packet_loss_count: inbound.packet_loss_count,
            expected_sequence: inbound.expected_sequence,
            last_sequence: inbound.last_sequence,
            non_standard_header_count: inbound.non_standard_header_count,
        }
    }

    /// Resamples `pcm16_16k` to 8 kHz, combines it with any carried
    /// residue from a previous call, and frames the result into
    /// `SAMPLES_PER_PACKET`-sample packets with strictly monotonic
    /// sequence/timestamp and the talkspurt marker bit (spec §4.5).
    ///
    /// On a resample failure the input passes through unresampled (sent
    /// at its original sample count rather than being halved) and the
    /// second return value is `true`, matching the inbound-path failure
    /// contract in spec §4.2.
    pub fn prepare_outbound(&self, pcm16_16k: &[u8], now: Instant) -> (Vec<OutboundFrame>, bool) {
        let mut outbound = self.outbound.lock();

        if !outbound.send_initialized {
            outbound.send_sequence = rand::random();
            outbound.send_timestamp = rand::random();
            outbound.send_initialized = true;
        }

        let (resampled, resample_failed) = match outbound.out_resampler.process(pcm16_16k) {
            Ok(pcm16_8k) => (pcm16_8k, false),
            Err(_) => (pcm16_16k.to_vec(), true),
        };

        let mut buffer = std::mem::take(&mut outbound.carry);
        buffer.extend_from_slice(&resampled);

        let full_chunks = buffer.len() / FRAME_BYTES;
        let mut frames = Vec::with_capacity(full_chunks);

        let mut first_frame_gap = false;
        if full_chunks > 0 {
            first_frame_gap = outbound
                .last_send_at
                .is_none_or(|last| now.saturating_duration_since(last) >= TALKSPURT_GAP);
        }

        for i in 0..full_chunks {
            let start = i * FRAME_BYTES;
            let pcm16_8k = buffer[start..start + FRAME_BYTES].to_vec();

            frames.push(OutboundFrame {
                marker: i == 0 && first_frame_gap,
                sequence: outbound.send_sequence,
                timestamp: outbound.send_timestamp,
                pcm16_8k,
            });

            outbound.send_sequence = outbound.send_sequence.wrapping_add(1);
            outbound.send_timestamp = outbound
                .send_timestamp
                .wrapping_add(SAMPLES_PER_PACKET as u32);
        }

        outbound.carry = buffer.split_off(full_chunks * FRAME_BYTES);
        if full_chunks > 0 {
            outbound.last_send_at = Some(now);
        }

        (frames, resample_failed)
    }
}

pub struct SessionTable {
    by_ssrc: RwLock<Map<u32, Arc<Session>>>,
    by_call_id: RwLock<Map<String, Arc<Session>>>,
    /// Call-ids pre-bound via `MapSsrcToCallId` before the first packet
    /// for that SSRC has arrived.
    pending_call_ids: RwLock<Map<u32, String>>,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            by_ssrc: RwLock::new(Map::default()),
            by_call_id: RwLock::new(Map::default()),
            pending_call_ids: RwLock::new(Map::default()),
        }
    }

    /// Pre-binds a call-id to an SSRC before any packet has arrived for
    /// it. Has no effect if a session for that SSRC already exists.
    pub fn map_ssrc_to_call_id(&self, ssrc: u32, call_id: String) {
        if self.by_ssrc.read().contains_key(&ssrc) {
            return;
        }
        self.pending_call_ids.write().insert(ssrc, call_id);
    }

    pub fn get_call_id_for_ssrc(&self, ssrc: u32) -> Option<String> {
        if let Some(session) = self.by_ssrc.read().get(&ssrc) {
            return Some(session.call_id.clone());
        }
        self.pending_call_ids.read().get(&ssrc).cloned()
    }

    /// Looks up the session for `ssrc`, creating one if this is the first
    /// packet seen for it. Returns the session and whether it was just
    /// created.
    pub fn get_or_create(&self, ssrc: u32, now: Instant) -> (Arc<Session>, bool) {
        if let Some(session) = self.by_ssrc.read().get(&ssrc) {
            return (Arc::clone(session), false);
        }

        let mut by_ssrc = self.by_ssrc.write();
        if let Some(session) = by_ssrc.get(&ssrc) {
            return (Arc::clone(session), false);
        }

        let call_id = self
            .pending_call_ids
            .write()
            .remove(&ssrc)
            .unwrap_or_else(|| default_call_id(ssrc));

        let send_ssrc = distinct_send_ssrc(ssrc);
        let session = Arc::new(Session::new(call_id.clone(), ssrc, send_ssrc, now));

        by_ssrc.insert(ssrc, Arc::clone(&session));
        self.by_call_id.write().insert(call_id, Arc::clone(&session));

        (session, true)
    }

    pub fn get_by_ssrc(&self, ssrc: u32) -> Option<Arc<Session>> {
        self.by_ssrc.read().get(&ssrc).cloned()
    }

    pub fn get_by_call_id(&self, call_id: &str) -> Option<Arc<Session>> {
        self.by_call_id.read().get(call_id).cloned()
    }

    /// Removes the session from both indices, returning it if it was
    /// still present. Safe to call repeatedly; returns `None` on the
    /// second and subsequent calls (spec §4.6 idempotent cleanup). The
    /// caller uses the returned session to emit a terminal stats
    /// observation before it is dropped.
    pub fn cleanup(&self, call_id: &str) -> Option<Arc<Session>> {
        let removed = self.by_call_id.write().remove(call_id);
        if let Some(session) = &removed {
            self.by_ssrc.write().remove(&session.ssrc);
        }
        removed
    }

    /// Removes every session whose `last_packet_at` is older than
    /// `idle_timeout`. Returns the number of sessions evicted.
    pub fn evict_idle(&self, now: Instant, idle_timeout: Duration) -> usize {
        let stale: Vec<String> = self
            .by_call_id
            .read()
            .values()
            .filter(|session| !session.is_active(now, idle_timeout))
            .map(|session| session.call_id.clone())
            .collect();

        for call_id in &stale {
            self.cleanup(call_id);
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.by_call_id.read().len()
    }

    pub fn active_count(&self, now: Instant, idle_timeout: Duration) -> usize {
        self.by_call_id
            .read()
            .values()
            .filter(|session| session.is_active(now, idle_timeout))
            .count()
    }

    pub fn for_each(&self, mut f: impl FnMut(&Arc<Session>)) {
        for session in self.by_call_id.read().values() {
            f(session);
        }
    }

    /// Evicts every live session, used by `Stop` (spec §4.6).
    pub fn clear(&self) {
        let call_ids: Vec<String> = self.by_call_id.read().keys().cloned().collect();
        for call_id in call_ids {
            self.cleanup(&call_id);
        }
    }
}

fn default_call_id(ssrc: u32) -> String {
    let unix_seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("call_{ssrc:#010x}_{unix_seconds}")
}

fn distinct_send_ssrc(inbound_ssrc: u32) -> u32 {
    loop {
        let candidate: u32 = rand::random();
        if candidate != inbound_ssrc {
            return candidate;
        }
    }
}
