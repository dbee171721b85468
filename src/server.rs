//! Receiver Loop (C4), Sender Path (C5) and Lifecycle (§4.6).
//!
//! The receiver is a single `tokio` task reading a non-blocking UDP
//! socket in a loop, grounded directly on the teacher's own UDP server
//! loop shape (`turn-server/src/server/mod.rs`'s `fork_socket`: read,
//! `continue` past a transient error, dispatch, never bail out of the
//! loop on a single bad datagram). The per-packet "parse, look up
//! session state, act" pipeline follows
//! `crates/service/src/forwarding.rs`'s `PacketForwarder::forward`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::codec::{Codec, RtpHeader};
use crate::error::MediaServerError;
use crate::session::{SequenceOutcome, SessionTable};
use crate::statistics::{ServerStats, SessionInfo, SessionStats, Statistics};

const MAX_DATAGRAM: usize = 1500;
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// `MediaSink(ssrc, frame) -> void` (spec §6). Implementations must
/// return promptly; a `false` return models accepting the frame but
/// failing downstream, counted as `SinkError` (spec §7) rather than
/// propagated.
pub trait MediaSink: Send + Sync + 'static {
    fn on_frame(&self, ssrc: u32, frame: &[u8]) -> bool;
}

impl<F> MediaSink for F
where
    F: Fn(u32, &[u8]) -> bool + Send + Sync + 'static,
{
    fn on_frame(&self, ssrc: u32, frame: &[u8]) -> bool {
        self(ssrc, frame)
    }
}

pub struct MediaServerOptions {
    pub listen: SocketAddr,
    pub codec: Codec,
    pub idle_timeout: Duration,
    pub stats_interval_frames: u64,
}

impl MediaServerOptions {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            listen: config.server.listen,
            codec: config
                .server
                .codec
                .to_codec(config.server.slin16_payload_type),
            idle_timeout: Duration::from_secs(config.server.idle_timeout_secs),
            stats_interval_frames: config.server.stats_interval_frames,
        }
    }
}

struct RunningState {
    socket: Arc<UdpSocket>,
    shutdown: Arc<Notify>,
    receiver: JoinHandle<()>,
    eviction: JoinHandle<()>,
    /// The socket's actual bound address, which may differ from the
    /// configured `listen` when the configured port is 0.
    actual_addr: SocketAddr,
}

/// `Starting` is held across the `await` on `UdpSocket::bind` so that a
/// concurrent `start()` call, upon observing it, can return `Ok(())`
/// without itself racing the bind syscall (spec §5/§6: `Start` is
/// idempotent against concurrent calls).
enum ServerState {
    Idle,
    Starting,
    Running(RunningState),
}

/// `NewServer(host, port, sink, codec)` (spec §6): a bidirectional RTP
/// media plane bound to one UDP socket, demultiplexing inbound streams by
/// SSRC and accepting outbound audio keyed by `call_id`.
pub struct MediaServer {
    listen: SocketAddr,
    codec: Codec,
    idle_timeout: Duration,
    stats_interval_frames: u64,
    sink: Arc<dyn MediaSink>,
    sessions: Arc<SessionTable>,
    stats: Arc<Statistics>,
    state: Mutex<ServerState>,
}

impl MediaServer {
    pub fn new(options: MediaServerOptions, sink: Arc<dyn MediaSink>) -> Self {
        Self {
            listen: options.listen,
            codec: options.codec,
            idle_timeout: options.idle_timeout,
            stats_interval_frames: options.stats_interval_frames,
            sink,
            sessions: Arc::new(SessionTable::new()),
            stats: Arc::new(Statistics::new()),
            state: Mutex::new(ServerState::Idle),
        }
    }

    /// Binds the UDP socket and starts the receiver task. Idempotent
    /// against concurrent calls: the state is claimed as `Starting`
    /// synchronously, before the socket bind is awaited, so a second
    /// `start()` racing the first never reaches `UdpSocket::bind` itself
    /// — it observes `Starting`/`Running` and returns `Ok(())`.
    pub async fn start(&self) -> Result<(), MediaServerError> {
        {
            let mut state = self.state.lock();
            match &*state {
                ServerState::Idle => *state = ServerState::Starting,
                ServerState::Starting | ServerState::Running(_) => return Ok(()),
            }
        }

        let bind_result = async {
            let socket = UdpSocket::bind(self.listen)
                .await
                .map_err(MediaServerError::BindError)?;
            let actual_addr = socket.local_addr().map_err(MediaServerError::BindError)?;
            Ok::<_, MediaServerError>((socket, actual_addr))
        }
        .await;

        let (socket, actual_addr) = match bind_result {
            Ok(v) => v,
            Err(e) => {
                *self.state.lock() = ServerState::Idle;
                return Err(e);
            }
        };

        let socket = Arc::new(socket);
        let shutdown = Arc::new(Notify::new());

        let receiver = tokio::spawn(receiver_loop(
            Arc::clone(&socket),
            Arc::clone(&shutdown),
            Arc::clone(&self.sessions),
            Arc::clone(&self.stats),
            Arc::clone(&self.sink),
            self.codec,
            self.stats_interval_frames,
        ));

        let eviction = tokio::spawn(eviction_loop(
            Arc::clone(&shutdown),
            Arc::clone(&self.sessions),
            self.idle_timeout,
        ));

        log::info!("media server listening on {actual_addr}");
        *self.state.lock() = ServerState::Running(RunningState {
            socket,
            shutdown,
            receiver,
            eviction,
            actual_addr,
        });
        Ok(())
    }

    /// Signals the receiver to stop, waits for it to drain, and evicts
    /// every session. Idempotent: calling `stop()` again once stopped is
    /// a no-op that returns `Ok(())`.
    pub async fn stop(&self) -> Result<(), MediaServerError> {
        let running = {
            let mut state = self.state.lock();
            match &*state {
                ServerState::Running(_) => {
                    match std::mem::replace(&mut *state, ServerState::Idle) {
                        ServerState::Running(running) => Some(running),
                        _ => unreachable!(),
                    }
                }
                ServerState::Idle | ServerState::Starting => None,
            }
        };
        let Some(running) = running else {
            return Ok(());
        };

        running.shutdown.notify_waiters();
        let _ = running.receiver.await;
        let _ = running.eviction.await;
        drop(running.socket);

        self.sessions.clear();
        log::info!("media server stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        matches!(&*self.state.lock(), ServerState::Running(_))
    }

    /// `SendAudio(call_id, pcm16_16k_bytes)` (spec §4.5, §6).
    pub async fn send_audio(
        &self,
        call_id: &str,
        pcm16_16k: &[u8],
    ) -> Result<(), MediaServerError> {
        let socket = {
            let state = self.state.lock();
            match &*state {
                ServerState::Running(running) => Arc::clone(&running.socket),
                ServerState::Idle | ServerState::Starting => {
                    return Err(MediaServerError::ServerStopped)
                }
            }
        };

        let session = self
            .sessions
            .get_by_call_id(call_id)
            .ok_or(MediaServerError::UnknownSession)?;
        let remote = session.remote().ok_or(MediaServerError::UnknownSession)?;

        let (frames, resample_failed) = session.prepare_outbound(pcm16_16k, Instant::now());
        if resample_failed {
            self.stats.record_resample_failure();
            log::warn!(
                "outbound resample failure for session {call_id}, passing frame through unresampled"
            );
        }
        for frame in frames {
            let payload = self.codec.encode(&frame.pcm16_8k);
            let mut buf = BytesMut::new();
            RtpHeader::encode(
                frame.marker,
                self.codec.payload_type(),
                frame.sequence,
                frame.timestamp,
                session.send_ssrc,
                &payload,
                &mut buf,
            );

            socket
                .send_to(&buf, remote)
                .await
                .map_err(MediaServerError::IoError)?;
        }

        Ok(())
    }

    /// `MapSsrcToCallId(ssrc, call_id)` (spec §6): pre-binds a call-id
    /// before the first packet for that SSRC arrives.
    pub fn map_ssrc_to_call_id(&self, ssrc: u32, call_id: String) {
        self.sessions.map_ssrc_to_call_id(ssrc, call_id);
    }

    pub fn get_call_id_for_ssrc(&self, ssrc: u32) -> Option<String> {
        self.sessions.get_call_id_for_ssrc(ssrc)
    }

    /// `CleanupSession(call_id)` (spec §4.6): idempotent, and emits a
    /// terminal stats observation on removal (spec.md:130), mirroring the
    /// original's own `_cleanup_session` teardown log
    /// (`examples/original_source/src/rtp_server.py:356-360`).
    pub fn cleanup_session(&self, call_id: &str) {
        if let Some(session) = self.sessions.cleanup(call_id) {
            let snapshot = session.inbound_snapshot();
            log::info!(
                "session {} terminal stats: ssrc={:#010x} received={} processed={} loss={}",
                call_id,
                session.ssrc,
                snapshot.frames_received,
                snapshot.frames_processed,
                snapshot.packet_loss_count,
            );
        }
    }

    pub fn get_session_info(&self, call_id: &str) -> Option<SessionInfo> {
        let session = self.sessions.get_by_call_id(call_id)?;
        let now = Instant::now();
        Some(SessionInfo {
            call_id: session.call_id.clone(),
            remote: session.remote(),
            ssrc: session.ssrc,
            created_at: session.created_at,
            last_packet_at: session.last_packet_at(),
            active: session.is_active(now, self.idle_timeout),
        })
    }

    pub fn get_session_stats(&self, call_id: &str) -> Option<SessionStats> {
        let session = self.sessions.get_by_call_id(call_id)?;
        let info = self.get_session_info(call_id)?;
        Some(SessionStats::new(info, session.inbound_snapshot()))
    }

    pub fn get_stats(&self) -> ServerStats {
        let now = Instant::now();
        let state = self.state.lock();
        let (running, host) = match &*state {
            ServerState::Running(s) => (true, s.actual_addr),
            ServerState::Idle | ServerState::Starting => (false, self.listen),
        };
        drop(state);

        self.stats.snapshot(
            running,
            host,
            self.codec.name(),
            self.sessions.active_count(now, self.idle_timeout),
            self.sessions.len(),
        )
    }
}

async fn receiver_loop(
    socket: Arc<UdpSocket>,
    shutdown: Arc<Notify>,
    sessions: Arc<SessionTable>,
    stats: Arc<Statistics>,
    sink: Arc<dyn MediaSink>,
    codec: Codec,
    stats_interval_frames: u64,
) {
    let mut buf = [0u8; MAX_DATAGRAM];

    loop {
        let (len, addr) = tokio::select! {
            _ = shutdown.notified() => {
                log::debug!("receiver loop draining on shutdown signal");
                return;
            }
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok(v) => v,
                    Err(e) => {
                        log::warn!("udp recv error: {e}");
                        continue;
                    }
                }
            }
        };

        let datagram = &buf[..len];
        let (header, payload) = match RtpHeader::parse(datagram) {
            Ok(v) => v,
            Err(_) => {
                stats.record_invalid_header();
                continue;
            }
        };

        let now = Instant::now();
        let (session, is_new) = sessions.get_or_create(header.ssrc, now);
        if is_new {
            stats.record_new_session();
            log::info!(
                "new session {} for ssrc {:#010x} from {addr}",
                session.call_id,
                header.ssrc
            );
        }

        if session.learn_remote(addr) {
            log::warn!(
                "remote endpoint changed for session {}: now {addr}",
                session.call_id
            );
        }
        session.touch(now);

        let sequence_outcome = session.record_inbound_sequence(header.sequence, header.non_standard);
        stats.record_inbound_frame();
        if let SequenceOutcome::Loss(gap) = sequence_outcome {
            stats.record_packet_loss(gap as u64);
        }

        let pcm16_8k = match codec.decode(header.payload_type, payload) {
            Ok(pcm) => pcm,
            Err(_) => {
                stats.record_unsupported_codec();
                if session.latch_unsupported_codec() {
                    log::warn!(
                        "unsupported codec for session {} (payload type {})",
                        session.call_id,
                        header.payload_type
                    );
                }
                continue;
            }
        };

        let (pcm16_16k, resample_failed) = session.resample_inbound(&pcm16_8k);
        stats.record_processed_frame();
        if resample_failed {
            stats.record_resample_failure();
            log::warn!(
                "resample failure for session {}, passing frame through unresampled",
                session.call_id
            );
        }

        if !sink.on_frame(header.ssrc, &pcm16_16k) {
            stats.record_sink_failure();
            log::debug!("sink dropped a frame for ssrc {:#010x}", header.ssrc);
        }

        if stats_interval_frames > 0 {
            let snapshot = session.inbound_snapshot();
            if snapshot.frames_received % stats_interval_frames == 0 {
                log::debug!(
                    "session {} stats: received={} processed={} loss={}",
                    session.call_id,
                    snapshot.frames_received,
                    snapshot.frames_processed,
                    snapshot.packet_loss_count,
                );
            }
        }
    }
}

async fn eviction_loop(shutdown: Arc<Notify>, sessions: Arc<SessionTable>, idle_timeout: Duration) {
    let mut ticker = tokio::time::interval(IDLE_SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.notified() => return,
            _ = ticker.tick() => {
                let evicted = sessions.evict_idle(Instant::now(), idle_timeout);
                if evicted > 0 {
                    log::debug!("evicted {evicted} idle session(s)");
                }
            }
        }
    }
}
