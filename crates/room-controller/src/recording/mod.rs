//! Recording pipeline.
//!
//! Start consumes the streamer's video and every live audio producer through
//! plain RTP transports, describes each stream in an SDP file and hands the
//! files to a transcoder. Stop tears the bridge down, finalises the file and
//! uploads it. Stop never fails outright: transcoder or upload failures
//! degrade the artifact to `FAILED` and are reported alongside it.

pub mod sdp;
pub mod transcoder;

use crate::collaborators::{ArtifactStatus, ObjectStorage, RecordingArtifact};
use crate::errors::RcError;
use crate::media::{
    ConsumeParams, MediaEngine, MediaRegistry, MediaTag, PlainTransportOptions, RouterInfo,
    RECORDING_CONNECTION_ID,
};
use crate::observability::metrics;
use chrono::{DateTime, Utc};
use sdp::StreamDescription;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;
use transcoder::{TranscodeJob, Transcoder, TranscoderProcess};

const RECORDING_CONTENT_TYPE: &str = "video/mp4";

/// Hands out even RTP ports for recording inputs, process-wide.
#[derive(Debug, Clone)]
pub struct RtpPortAllocator {
    base: u16,
    in_use: Arc<Mutex<BTreeSet<u16>>>,
}

impl RtpPortAllocator {
    #[must_use]
    pub fn new(base: u16) -> Self {
        Self {
            base: base & !1,
            in_use: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Lowest free even port at or above the base.
    ///
    /// # Errors
    ///
    /// `CapacityExceeded` once the range is exhausted.
    pub fn allocate(&self) -> Result<u16, RcError> {
        let mut in_use = self.in_use.lock().unwrap_or_else(PoisonError::into_inner);
        let port = (self.base..u16::MAX - 1)
            .step_by(2)
            .find(|port| !in_use.contains(port))
            .ok_or_else(|| RcError::CapacityExceeded("no free recording ports".to_string()))?;
        in_use.insert(port);
        Ok(port)
    }

    pub fn release(&self, ports: &[u16]) {
        let mut in_use = self.in_use.lock().unwrap_or_else(PoisonError::into_inner);
        for port in ports {
            in_use.remove(port);
        }
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.in_use
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Static settings for the pipeline.
#[derive(Debug, Clone)]
pub struct RecordingSettings {
    pub dir: PathBuf,
    pub listen_ip: String,
    pub stop_grace: Duration,
}

/// Engine resources and files owned by one recording.
#[derive(Debug, Default)]
struct Bridge {
    transport_ids: Vec<String>,
    consumer_ids: Vec<String>,
    ports: Vec<u16>,
    sdp_files: Vec<PathBuf>,
}

/// Recording sub-state of a room.
pub struct ActiveRecording {
    pub started_by: String,
    pub started_at: DateTime<Utc>,
    pub file_name: String,
    started: Instant,
    output: PathBuf,
    bridge: Bridge,
    process: Box<dyn TranscoderProcess>,
}

impl std::fmt::Debug for ActiveRecording {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveRecording")
            .field("started_by", &self.started_by)
            .field("started_at", &self.started_at)
            .field("file_name", &self.file_name)
            .field("streams", &self.bridge.consumer_ids.len())
            .finish_non_exhaustive()
    }
}

impl ActiveRecording {
    /// Number of streams being captured.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.bridge.consumer_ids.len()
    }
}

/// Result of a stop.
#[derive(Debug, Clone, PartialEq)]
pub struct StoppedRecording {
    pub artifact: RecordingArtifact,
    /// Why the artifact is degraded, if it is.
    pub degraded: Option<String>,
}

/// Drives the engine, the transcoder and storage for recordings.
#[derive(Clone)]
pub struct RecordingPipeline {
    engine: Arc<dyn MediaEngine>,
    transcoder: Arc<dyn Transcoder>,
    storage: Arc<dyn ObjectStorage>,
    ports: RtpPortAllocator,
    settings: RecordingSettings,
}

impl RecordingPipeline {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        transcoder: Arc<dyn Transcoder>,
        storage: Arc<dyn ObjectStorage>,
        ports: RtpPortAllocator,
        settings: RecordingSettings,
    ) -> Self {
        Self {
            engine,
            transcoder,
            storage,
            ports,
            settings,
        }
    }

    /// Begin recording the streamer's current tracks.
    ///
    /// Nothing is left behind on failure.
    ///
    /// # Errors
    ///
    /// `Provider` if the streamer has no video producer or an engine call
    /// fails; `Pipeline` if the transcoder cannot start.
    pub async fn start(
        &self,
        session_id: &str,
        router: &RouterInfo,
        media: &MediaRegistry,
        streamer_id: &str,
        started_by: &str,
    ) -> Result<ActiveRecording, RcError> {
        let video = media
            .streamer_video(streamer_id)
            .ok_or_else(|| RcError::Provider("no streamer video producer to record".to_string()))?
            .id
            .clone();
        let audio = media.audio_producer_ids();

        let started_at = Utc::now();
        let stem = format!(
            "{session_id}-{}-{}",
            started_at.timestamp_millis(),
            Uuid::new_v4().simple()
        );
        let file_name = format!("{stem}.mp4");
        let output = self.settings.dir.join(&file_name);

        let mut bridge = Bridge::default();
        match self
            .open_bridge(router, &stem, &video, &audio, started_by, &mut bridge)
            .await
        {
            Ok(job_inputs) => {
                let job = TranscodeJob {
                    video_sdp: job_inputs.0,
                    audio_sdps: job_inputs.1,
                    output: output.clone(),
                };
                match self.transcoder.spawn(&job).await {
                    Ok(process) => {
                        for consumer_id in &bridge.consumer_ids {
                            if let Err(e) = self.engine.resume_consumer(consumer_id).await {
                                warn!(target: "rc.recording", consumer_id = %consumer_id, error = %e, "Failed to resume recording consumer");
                            }
                        }
                        info!(
                            target: "rc.recording",
                            session_id = %session_id,
                            streams = bridge.consumer_ids.len(),
                            "Recording started"
                        );
                        Ok(ActiveRecording {
                            started_by: started_by.to_string(),
                            started_at,
                            file_name,
                            started: Instant::now(),
                            output,
                            bridge,
                            process,
                        })
                    }
                    Err(e) => {
                        self.teardown(&mut bridge).await;
                        Err(e)
                    }
                }
            }
            Err(e) => {
                self.teardown(&mut bridge).await;
                Err(e)
            }
        }
    }

    /// Create one plain transport, consumer and SDP file per producer.
    ///
    /// Everything created is recorded in `bridge` as it happens so a failure
    /// part-way can be unwound.
    async fn open_bridge(
        &self,
        router: &RouterInfo,
        stem: &str,
        video: &str,
        audio: &[String],
        started_by: &str,
        bridge: &mut Bridge,
    ) -> Result<(PathBuf, Vec<PathBuf>), RcError> {
        tokio::fs::create_dir_all(&self.settings.dir)
            .await
            .map_err(|e| RcError::Pipeline(format!("create recording dir: {e}")))?;

        let tag = MediaTag {
            socket_id: RECORDING_CONNECTION_ID.to_string(),
            user_id: started_by.to_string(),
            source: None,
        };
        let options = PlainTransportOptions {
            listen_ip: self.settings.listen_ip.clone(),
            rtcp_mux: true,
            comedia: false,
        };

        let mut sdp_files = Vec::with_capacity(audio.len() + 1);
        for (index, producer_id) in std::iter::once(video).chain(audio.iter().map(String::as_str)).enumerate() {
            let port = self.ports.allocate()?;
            bridge.ports.push(port);

            let transport = self
                .engine
                .create_plain_transport(&router.id, &options, &tag)
                .await?;
            bridge.transport_ids.push(transport.id.clone());
            self.engine
                .connect_plain_transport(&transport.id, &self.settings.listen_ip, port)
                .await?;

            let consumer = self
                .engine
                .consume(&ConsumeParams {
                    transport_id: &transport.id,
                    producer_id,
                    rtp_capabilities: &router.rtp_capabilities,
                    paused: true,
                    app_data: &tag,
                })
                .await?;
            bridge.consumer_ids.push(consumer.id.clone());

            let codec = consumer.primary_codec().ok_or_else(|| {
                RcError::Provider(format!("consumer {} has no negotiated codec", consumer.id))
            })?;
            let description = StreamDescription {
                kind: consumer.kind,
                codec,
                ip: self.settings.listen_ip.clone(),
                port,
            };
            let path = self.settings.dir.join(format!("{stem}-{index}.sdp"));
            tokio::fs::write(&path, description.render())
                .await
                .map_err(|e| RcError::Pipeline(format!("write stream description: {e}")))?;
            bridge.sdp_files.push(path.clone());
            sdp_files.push(path);
        }

        let mut files = sdp_files.into_iter();
        let video_sdp = files
            .next()
            .ok_or_else(|| RcError::Internal("recording bridge has no video input".to_string()))?;
        Ok((video_sdp, files.collect()))
    }

    /// Best-effort release of everything in `bridge`.
    async fn teardown(&self, bridge: &mut Bridge) {
        for consumer_id in bridge.consumer_ids.drain(..) {
            if let Err(e) = self.engine.close_consumer(&consumer_id).await {
                warn!(target: "rc.recording", consumer_id = %consumer_id, error = %e, "Failed to close recording consumer");
            }
        }
        for transport_id in bridge.transport_ids.drain(..) {
            if let Err(e) = self.engine.close_transport(&transport_id).await {
                warn!(target: "rc.recording", transport_id = %transport_id, error = %e, "Failed to close recording transport");
            }
        }
        self.ports.release(&bridge.ports);
        bridge.ports.clear();
        for path in bridge.sdp_files.drain(..) {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(target: "rc.recording", path = %path.display(), error = %e, "Failed to remove stream description");
            }
        }
    }

    /// Finish a recording and upload the file.
    pub async fn stop(&self, session_id: &str, mut active: ActiveRecording) -> StoppedRecording {
        let duration = active.started.elapsed().as_secs();
        self.teardown(&mut active.bridge).await;

        let mut degraded = match active.process.stop(self.settings.stop_grace).await {
            Ok(()) => None,
            Err(e) => {
                warn!(target: "rc.recording", session_id = %session_id, error = %e, "Transcoder did not finish cleanly");
                Some("transcoder did not finish cleanly".to_string())
            }
        };

        let size = match tokio::fs::metadata(&active.output).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(target: "rc.recording", session_id = %session_id, error = %e, "Recording output missing");
                degraded.get_or_insert_with(|| "recording output missing".to_string());
                0
            }
        };

        let mut file_url = None;
        if size > 0 {
            let key = format!("recordings/{}", active.file_name);
            match self
                .storage
                .upload(&active.output, &key, RECORDING_CONTENT_TYPE)
                .await
            {
                Ok(url) => {
                    file_url = Some(url);
                    if let Err(e) = tokio::fs::remove_file(&active.output).await {
                        warn!(target: "rc.recording", error = %e, "Failed to remove uploaded recording");
                    }
                }
                Err(e) => {
                    warn!(target: "rc.recording", session_id = %session_id, error = %e, "Recording upload failed");
                    degraded.get_or_insert_with(|| "upload failed".to_string());
                }
            }
        }

        let status = if degraded.is_none() {
            ArtifactStatus::Completed
        } else {
            ArtifactStatus::Failed
        };
        metrics::record_recording(match status {
            ArtifactStatus::Completed => "completed",
            ArtifactStatus::Failed => "failed",
        });
        info!(
            target: "rc.recording",
            session_id = %session_id,
            duration_secs = duration,
            size,
            status = ?status,
            "Recording stopped"
        );

        StoppedRecording {
            artifact: RecordingArtifact {
                file_name: active.file_name,
                file_url,
                duration,
                recorded_at: active.started_at,
                status,
                size,
            },
            degraded,
        }
    }
}
