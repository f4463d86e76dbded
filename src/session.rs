use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::media::engine::{EngineError, RtcEngine};
use crate::media::plan::{self, DestinationPlan, DestinationRequest, PlanError, Sink};
use crate::media::ports::{self, PortAllocator, PortsExhausted};
use crate::media::relay::RelayPipeline;
use crate::media::transcode::{TranscodeError, TranscodeEvent, TranscodeProcess};
use crate::media::types::RelayPorts;

/// File suffixes the post-stop sweep deletes from the output directory.
/// Archival mp4 output is preserved.
const TRANSIENT_SUFFIXES: [&str; 5] = [".ts", ".m3u8", ".mpd", ".m4s", ".tmp"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Negotiating,
    AwaitingProcessReady,
    Streaming,
    Stopping,
    Stopped,
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Negotiating => "negotiating",
            SessionState::AwaitingProcessReady => "awaiting_process_ready",
            SessionState::Streaming => "streaming",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Setup-phase failures, each mapped to a signaling alert. Teardown
/// failures are logged and swallowed instead.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error("no destinations requested")]
    EmptyPlan,
    #[error(transparent)]
    Ports(#[from] PortsExhausted),
    #[error("output directory: {0}")]
    OutputDir(std::io::Error),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Transcode(#[from] TranscodeError),
}

/// Notifications pushed to the signaling connection that owns the
/// session. `Stopped` is emitted at most once per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Started,
    Stopped { reason: Option<String> },
}

/// One publish attempt on one signaling connection. Terminal states are
/// never reused; a new start request builds a fresh session.
pub struct Session {
    id: String,
    state: Mutex<SessionState>,
    relay: RelayPipeline,
    allocator: Arc<PortAllocator>,
    ports: Mutex<Option<RelayPorts>>,
    process: Mutex<Option<TranscodeProcess>>,
    out_dir: PathBuf,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
    terminated: AtomicBool,
}

impl Session {
    /// Validates the destination plan, allocates relay resources,
    /// negotiates the transport and spawns the transcoder. Returns the
    /// session together with the SDP answer for the peer; the `started`
    /// notification follows once the process signals readiness.
    pub async fn start(
        id: &str,
        engine: Arc<dyn RtcEngine>,
        allocator: Arc<PortAllocator>,
        request: &DestinationRequest,
        offer_sdp: &str,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<(Arc<Self>, String), SessionError> {
        let cfg = config::config();
        Self::start_with(
            id,
            engine,
            allocator,
            request,
            offer_sdp,
            events,
            Path::new(cfg.media_root()),
            cfg.ffmpeg(),
        )
        .await
    }

    /// Dependency-injected variant of [`Session::start`].
    #[allow(clippy::too_many_arguments)]
    pub async fn start_with(
        id: &str,
        engine: Arc<dyn RtcEngine>,
        allocator: Arc<PortAllocator>,
        request: &DestinationRequest,
        offer_sdp: &str,
        events: mpsc::UnboundedSender<SessionEvent>,
        media_root: &Path,
        ffmpeg: &str,
    ) -> Result<(Arc<Self>, String), SessionError> {
        // Validation first: a bad request must not allocate anything.
        let plan = plan::build_plan(request, media_root)?;
        if plan.is_empty() {
            return Err(SessionError::EmptyPlan);
        }

        let ports = allocator.allocate()?;
        let session = Arc::new(Session {
            id: id.to_string(),
            state: Mutex::new(SessionState::Idle),
            relay: RelayPipeline::new(engine),
            allocator,
            ports: Mutex::new(Some(ports)),
            process: Mutex::new(None),
            out_dir: plan.out_dir.clone(),
            events,
            cancel: CancellationToken::new(),
            terminated: AtomicBool::new(false),
        });

        match session.negotiate_and_spawn(offer_sdp, &plan, ports, ffmpeg).await {
            Ok(answer) => Ok((session, answer)),
            Err(e) => {
                log::warn!("Session {}: start failed: {}", id, e);
                session.teardown(true, None).await;
                Err(e)
            }
        }
    }

    async fn negotiate_and_spawn(
        self: &Arc<Self>,
        offer_sdp: &str,
        plan: &DestinationPlan,
        ports: RelayPorts,
        ffmpeg: &str,
    ) -> Result<String, SessionError> {
        self.set_state(SessionState::Negotiating);
        for sink in &plan.sinks {
            match sink {
                Sink::Rtmp { address } => {
                    log::info!("Session {}: restream -> {}", self.id, address);
                }
                Sink::Mp4 { path } => {
                    log::info!("Session {}: archive -> {}", self.id, path.display());
                }
                Sink::Hls { path } => {
                    log::info!("Session {}: hls -> {}", self.id, path.display());
                }
                Sink::Dash { path } => {
                    log::info!("Session {}: dash -> {}", self.id, path.display());
                }
            }
        }

        if plan.writes_files() {
            ports::ensure_output_dir(&plan.out_dir)
                .await
                .map_err(SessionError::OutputDir)?;
        }

        let answer = self.relay.negotiate(offer_sdp).await?;
        log::info!(
            "Session {}: negotiated, relay ports {}/{}, tee map '{}'",
            self.id,
            ports.audio,
            ports.video,
            plan.tee_map
        );

        let args = plan.ffmpeg_args();
        let input_sdp = ports.to_input_sdp();
        let (process, events_rx) = TranscodeProcess::spawn(ffmpeg, &args, &input_sdp).await?;
        *self.process.lock().unwrap() = Some(process);
        self.set_state(SessionState::AwaitingProcessReady);

        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.run(events_rx).await;
        });

        Ok(answer)
    }

    /// Drives the session from process events. A stop racing the ready
    /// signal cancels the pending activation instead of activating a
    /// stopped session.
    async fn run(self: Arc<Self>, mut events_rx: mpsc::Receiver<TranscodeEvent>) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                event = events_rx.recv() => match event {
                    Some(TranscodeEvent::Ready) => {
                        if let Err(e) = self.on_process_ready().await {
                            log::error!("Session {}: activation failed: {:#}", self.id, e);
                            self.stop(Some("relay activation failed".to_string())).await;
                            return;
                        }
                    }
                    Some(TranscodeEvent::Ended { code, signal }) => {
                        let reason = match (code, signal) {
                            (Some(0), _) => None,
                            (Some(c), _) => Some(format!("transcoder exited with code {}", c)),
                            (None, Some(s)) => Some(format!("transcoder killed by signal {}", s)),
                            (None, None) => Some("transcoder ended abnormally".to_string()),
                        };
                        self.stop(reason).await;
                        return;
                    }
                    None => {
                        self.stop(Some("transcoder supervisor gone".to_string())).await;
                        return;
                    }
                },
            }
        }
    }

    async fn on_process_ready(&self) -> Result<(), EngineError> {
        let ports = match *self.ports.lock().unwrap() {
            Some(ports) => ports,
            // Already torn down; nothing to activate.
            None => return Ok(()),
        };
        self.relay.activate(ports).await?;
        self.set_state(SessionState::Streaming);
        log::info!("Session {}: streaming", self.id);
        let _ = self.events.send(SessionEvent::Started);
        Ok(())
    }

    /// Idempotent teardown: interrupt the process, deactivate the relay,
    /// release ports and sweep transient files. Emits `stopped` once.
    pub async fn stop(&self, reason: Option<String>) {
        self.teardown(false, reason).await;
    }

    async fn teardown(&self, failed: bool, reason: Option<String>) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(SessionState::Stopping);
        self.cancel.cancel();

        let process = self.process.lock().unwrap().take();
        if let Some(process) = process {
            process.stop();
        }
        self.relay.deactivate().await;
        let ports = self.ports.lock().unwrap().take();
        if let Some(ports) = ports {
            self.allocator.release(ports);
        }
        sweep_transients(&self.out_dir).await;

        self.set_state(if failed {
            SessionState::Failed
        } else {
            SessionState::Stopped
        });
        log::info!("Session {}: {}", self.id, self.state());

        if !failed {
            let _ = self.events.send(SessionEvent::Stopped { reason });
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, next: SessionState) {
        *self.state.lock().unwrap() = next;
    }
}

/// Best-effort deletion of segment artifacts left behind by the
/// transcoder. Errors are logged and swallowed; they must never block
/// teardown.
async fn sweep_transients(dir: &Path) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return,
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if TRANSIENT_SUFFIXES.iter().any(|s| name.ends_with(s)) {
            if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                log::warn!("Session sweep: failed to remove {}: {}", name, e);
            }
        }
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;
