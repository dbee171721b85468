//! Lifecycle & Stats (C6): process-wide observable counters.
//!
//! Mirrors the teacher's `src/statistics.rs` atomic-counter shape, minus
//! the optional Prometheus exporter layer — an observability/metrics
//! surface is out of scope here (spec §1), so this stays a plain
//! in-process snapshot type returned from `GetStats`/`GetSessionStats`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::session::InboundSnapshot;

/// Process-wide counters accumulated across every session's lifetime,
/// including sessions that have since been cleaned up (so `GetStats`
/// reflects totals, not just currently-live sessions).
#[derive(Default)]
pub struct Statistics {
    total_sessions: AtomicU64,
    total_frames_received: AtomicU64,
    total_frames_processed: AtomicU64,
    total_packet_loss: AtomicU64,
    sink_failures: AtomicU64,
    resample_failures: AtomicU64,
    dropped_invalid_header: AtomicU64,
    dropped_unsupported_codec: AtomicU64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_new_session(&self) {
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_inbound_frame(&self) {
        self.total_frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed_frame(&self) {
        self.total_frames_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_packet_loss(&self, count: u64) {
        self.total_packet_loss.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_sink_failure(&self) {
        self.sink_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resample_failure(&self) {
        self.resample_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid_header(&self) {
        self.dropped_invalid_header.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unsupported_codec(&self) {
        self.dropped_unsupported_codec
            .fetch_add(1, Ordering::Relaxed);
    }

    fn load(&self, counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// `GetSessionInfo` (spec §6).
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub call_id: String,
    pub remote: Option<SocketAddr>,
    pub ssrc: u32,
    pub created_at: Instant,
    pub last_packet_at: Instant,
    pub active: bool,
}

/// `GetSessionStats` — `GetSessionInfo` plus the inbound counters (spec
/// §6).
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub info: SessionInfo,
    pub frames_received: u64,
    pub frames_processed: u64,
    pub packet_loss_count: u64,
    pub last_sequence: Option<u16>,
    pub expected_sequence: Option<u16>,
}

impl SessionStats {
    pub fn new(info: SessionInfo, inbound: InboundSnapshot) -> Self {
        Self {
            info,
            frames_received: inbound.frames_received,
            frames_processed: inbound.frames_processed,
            packet_loss_count: inbound.packet_loss_count,
            last_sequence: inbound.last_sequence,
            expected_sequence: inbound.expected_sequence,
        }
    }
}

/// `GetStats` (spec §6).
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub running: bool,
    pub host: SocketAddr,
    pub codec: &'static str,
    pub total_sessions: u64,
    pub active_sessions: usize,
    pub total_frames_received: u64,
    pub total_frames_processed: u64,
    pub total_packet_loss: u64,
    pub ssrc_mappings: usize,
}

impl Statistics {
    pub fn snapshot(
        &self,
        running: bool,
        host: SocketAddr,
        codec: &'static str,
        active_sessions: usize,
        ssrc_mappings: usize,
    ) -> ServerStats {
        ServerStats {
            running,
            host,
            codec,
            total_sessions: self.load(&self.total_sessions),
            active_sessions,
            total_frames_received: self.load(&self.total_frames_received),
            total_frames_processed: self.load(&self.total_frames_processed),
            total_packet_loss: self.load(&self.total_packet_loss),
            ssrc_mappings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_across_cleaned_up_sessions() {
        let stats = Statistics::new();
        stats.record_new_session();
        stats.record_inbound_frame();
        stats.record_inbound_frame();
        stats.record_packet_loss(3);

        let snapshot = stats.snapshot(
            true,
            "127.0.0.1:0".parse().unwrap(),
            "ulaw",
            0,
            0,
        );
        assert_eq!(snapshot.total_sessions, 1);
        assert_eq!(snapshot.total_frames_received, 2);
        assert_eq!(snapshot.total_packet_loss, 3);
    }
}
