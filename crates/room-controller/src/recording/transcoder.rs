//! Transcoding subprocess.
//!
//! The transcoder reads one SDP file per consumed stream, mixes every audio
//! input into a single track and muxes it with the video into one MP4.
//! Stopping is graceful first (`q` on stdin) and forced after the grace
//! period.

use crate::errors::RcError;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Inputs and output of one recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeJob {
    pub video_sdp: PathBuf,
    pub audio_sdps: Vec<PathBuf>,
    pub output: PathBuf,
}

/// Starts transcoder processes.
#[async_trait::async_trait]
pub trait Transcoder: Send + Sync {
    async fn spawn(&self, job: &TranscodeJob) -> Result<Box<dyn TranscoderProcess>, RcError>;
}

/// A running transcoder.
#[async_trait::async_trait]
pub trait TranscoderProcess: Send + Sync {
    /// Ask the process to finish, killing it if it outlives `grace`.
    ///
    /// Returns `Err(RcError::Pipeline)` if the process had to be killed or
    /// exited unsuccessfully; the output may then be truncated or missing.
    async fn stop(self: Box<Self>, grace: Duration) -> Result<(), RcError>;
}

/// Command-line arguments for `job`.
#[must_use]
pub fn ffmpeg_args(job: &TranscodeJob) -> Vec<String> {
    let mut args: Vec<String> = vec!["-loglevel".into(), "warning".into(), "-y".into()];

    for input in std::iter::once(&job.video_sdp).chain(job.audio_sdps.iter()) {
        args.push("-protocol_whitelist".into());
        args.push("file,udp,rtp".into());
        args.push("-i".into());
        args.push(input.display().to_string());
    }

    args.push("-map".into());
    args.push("0:v:0".into());

    match job.audio_sdps.len() {
        0 => {}
        1 => {
            args.push("-map".into());
            args.push("1:a:0".into());
        }
        n => {
            let inputs: String = (1..=n).map(|i| format!("[{i}:a]")).collect();
            args.push("-filter_complex".into());
            args.push(format!("{inputs}amix=inputs={n}:duration=longest[aout]"));
            args.push("-map".into());
            args.push("[aout]".into());
        }
    }

    args.extend(
        [
            "-c:v",
            "libx264",
            "-preset",
            "veryfast",
            "-c:a",
            "aac",
            "-b:a",
            "128k",
            "-movflags",
            "+faststart",
        ]
        .into_iter()
        .map(String::from),
    );
    args.push(job.output.display().to_string());
    args
}

/// ffmpeg launched through `tokio::process`.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    program: String,
}

impl FfmpegTranscoder {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait::async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn spawn(&self, job: &TranscodeJob) -> Result<Box<dyn TranscoderProcess>, RcError> {
        let mut child = Command::new(&self.program)
            .args(ffmpeg_args(job))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                warn!(target: "rc.recording", program = %self.program, error = %e, "Failed to start transcoder");
                RcError::Pipeline(format!("spawn {}: {e}", self.program))
            })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "rc.recording", line = %line, "transcoder");
                }
            });
        }

        info!(target: "rc.recording", pid = ?child.id(), output = %job.output.display(), "Transcoder started");
        Ok(Box::new(FfmpegProcess { child }))
    }
}

struct FfmpegProcess {
    child: Child,
}

#[async_trait::async_trait]
impl TranscoderProcess for FfmpegProcess {
    async fn stop(mut self: Box<Self>, grace: Duration) -> Result<(), RcError> {
        if let Some(mut stdin) = self.child.stdin.take() {
            if let Err(e) = stdin.write_all(b"q").await {
                debug!(target: "rc.recording", error = %e, "Transcoder stdin closed early");
            }
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => {
                warn!(target: "rc.recording", status = %status, "Transcoder exited unsuccessfully");
                Err(RcError::Pipeline(format!("transcoder exited with {status}")))
            }
            Ok(Err(e)) => Err(RcError::Pipeline(format!("wait for transcoder: {e}"))),
            Err(_) => {
                warn!(target: "rc.recording", grace_secs = grace.as_secs(), "Transcoder ignored quit, killing");
                if let Err(e) = self.child.kill().await {
                    warn!(target: "rc.recording", error = %e, "Failed to kill transcoder");
                }
                Err(RcError::Pipeline("transcoder killed after grace period".to_string()))
            }
        }
    }
}

/// Scripted transcoder for tests.
pub mod mock {
    use super::{TranscodeJob, Transcoder, TranscoderProcess};
    use crate::errors::RcError;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct State {
        fail_spawn: AtomicBool,
        fail_stop: AtomicBool,
        spawned: AtomicUsize,
        stopped: AtomicUsize,
        jobs: Mutex<Vec<TranscodeJob>>,
    }

    /// Writes a small output file on stop unless told to fail.
    #[derive(Debug, Clone, Default)]
    pub struct MockTranscoder {
        state: Arc<State>,
    }

    impl MockTranscoder {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_fail_spawn(&self, fail: bool) {
            self.state.fail_spawn.store(fail, Ordering::SeqCst);
        }

        pub fn set_fail_stop(&self, fail: bool) {
            self.state.fail_stop.store(fail, Ordering::SeqCst);
        }

        #[must_use]
        pub fn spawned(&self) -> usize {
            self.state.spawned.load(Ordering::SeqCst)
        }

        #[must_use]
        pub fn stopped(&self) -> usize {
            self.state.stopped.load(Ordering::SeqCst)
        }

        /// Jobs passed to `spawn`, in order.
        #[must_use]
        pub fn jobs(&self) -> Vec<TranscodeJob> {
            self.state
                .jobs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    #[async_trait::async_trait]
    impl Transcoder for MockTranscoder {
        async fn spawn(&self, job: &TranscodeJob) -> Result<Box<dyn TranscoderProcess>, RcError> {
            if self.state.fail_spawn.load(Ordering::SeqCst) {
                return Err(RcError::Pipeline("mock transcoder: spawn failed".to_string()));
            }
            self.state.spawned.fetch_add(1, Ordering::SeqCst);
            self.state
                .jobs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(job.clone());
            Ok(Box::new(MockProcess {
                state: Arc::clone(&self.state),
                output: job.output.clone(),
            }))
        }
    }

    struct MockProcess {
        state: Arc<State>,
        output: PathBuf,
    }

    #[async_trait::async_trait]
    impl TranscoderProcess for MockProcess {
        async fn stop(self: Box<Self>, _grace: Duration) -> Result<(), RcError> {
            self.state.stopped.fetch_add(1, Ordering::SeqCst);
            if self.state.fail_stop.load(Ordering::SeqCst) {
                return Err(RcError::Pipeline("mock transcoder: killed".to_string()));
            }
            tokio::fs::write(&self.output, b"mock mp4 payload")
                .await
                .map_err(|e| RcError::Pipeline(format!("mock transcoder output: {e}")))
        }
    }
}
