//! Per-guild live transcription session.
//!
//! One tokio task (the session worker) owns all speaker state for a guild.
//! The voice receiver, grace timers and finished inference calls talk to it
//! exclusively through [`SessionEvent`] messages, so buffer extraction and
//! the per-speaker processing flag never race.

use poise::serenity_prelude::{Http, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::audio::{self, SOURCE_SAMPLES_PER_SECOND};
use super::config::{ConfigSource, TranscribeConfig};
use super::engine::{strip_fillers, SpeechRecognizer};
use super::publish::{MessageRef, TranscriptSink};
use crate::db::{self, DbPool};

/// Grace window after the last audio append before a forced flush
const GRACE_WINDOW: Duration = Duration::from_millis(500);
/// A below-threshold buffer idle longer than this is discarded by the sweep
const STALE_AFTER: Duration = Duration::from_secs(5);

/// Resolves a speaker's display name, snapshotted when the speaker is first
/// seen in a session.
#[async_trait::async_trait]
pub trait SpeakerNames: Send + Sync {
    async fn display_name(&self, user_id: u64) -> Option<String>;
}

/// Fetches the speaker's Discord display name (global name, else username)
/// over the HTTP API.
pub struct GatewayNames {
    http: Arc<Http>,
    guild_id: u64,
}

impl GatewayNames {
    pub fn new(http: Arc<Http>, guild_id: u64) -> Self {
        Self { http, guild_id }
    }
}

#[async_trait::async_trait]
impl SpeakerNames for GatewayNames {
    async fn display_name(&self, user_id: u64) -> Option<String> {
        match self.http.get_user(UserId::new(user_id)).await {
            Ok(user) => {
                let name = user.global_name.as_deref().unwrap_or(user.name.as_str());
                Some(name.to_string())
            }
            Err(e) => {
                warn!("({}) User lookup failed for {}: {}", self.guild_id, user_id, e);
                None
            }
        }
    }
}

/// Name chain for live sessions: the per-guild `/set-transcribe-name`
/// override wins, else the gateway display name.
pub struct DbSpeakerNames {
    pool: DbPool,
    guild_id: u64,
    gateway: Arc<dyn SpeakerNames>,
}

impl DbSpeakerNames {
    pub fn new(pool: DbPool, guild_id: u64, gateway: Arc<dyn SpeakerNames>) -> Self {
        Self {
            pool,
            guild_id,
            gateway,
        }
    }
}

#[async_trait::async_trait]
impl SpeakerNames for DbSpeakerNames {
    async fn display_name(&self, user_id: u64) -> Option<String> {
        match db::get_user_setting(&self.pool, &user_id.to_string(), &self.guild_id.to_string())
            .await
        {
            Ok(Some(setting)) if setting.transcribe_name.is_some() => {
                return setting.transcribe_name;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("({}) Name lookup failed for {}: {}", self.guild_id, user_id, e);
            }
        }
        self.gateway.display_name(user_id).await
    }
}

/// Messages accepted by a session worker.
#[derive(Debug)]
pub enum SessionEvent {
    /// Decoded 48 kHz stereo s16 PCM for one speaker
    Audio { user_id: u64, pcm: Vec<i16> },
    /// The speaker's stream went silent; flush whatever is buffered
    SpeakingEnd { user_id: u64 },
    /// A grace timer elapsed. `seq` identifies the scheduling generation so
    /// a timer aborted just after firing is ignored.
    GraceElapsed { user_id: u64, seq: u64 },
    /// An inference task finished; `text` is None on engine failure
    InferenceDone { user_id: u64, text: Option<String> },
    /// Tear the session down
    Shutdown,
}

/// Buffered state for one speaker in a session. Cleared on session stop,
/// reused (message handle intact) if the speaker resumes after silence.
struct SpeakerState {
    display_name: String,
    /// Raw PCM chunks not yet submitted for recognition
    buffer: Vec<Vec<i16>>,
    buffered_samples: usize,
    last_append: Instant,
    /// Last buffer size we logged a skip for, to avoid repeating the log
    last_logged_samples: usize,
    /// At most one in-flight recognition; the submitted snapshot is already
    /// out of `buffer` while this is set
    processing: bool,
    grace: Option<JoinHandle<()>>,
    grace_seq: u64,
    message: Option<MessageRef>,
    last_text: String,
}

impl SpeakerState {
    fn new(display_name: String) -> Self {
        Self {
            display_name,
            buffer: Vec::new(),
            buffered_samples: 0,
            last_append: Instant::now(),
            last_logged_samples: 0,
            processing: false,
            grace: None,
            grace_seq: 0,
            message: None,
            last_text: String::new(),
        }
    }

    fn append(&mut self, pcm: Vec<i16>) {
        self.buffered_samples += pcm.len();
        self.buffer.push(pcm);
        self.last_append = Instant::now();
    }

    fn buffered_seconds(&self) -> f64 {
        self.buffered_samples as f64 / SOURCE_SAMPLES_PER_SECOND as f64
    }

    /// Concatenate and clear the buffer. Appends after this call land in a
    /// fresh buffer; nothing is duplicated or lost.
    fn take_all(&mut self) -> Vec<i16> {
        let mut combined = Vec::with_capacity(self.buffered_samples);
        for chunk in self.buffer.drain(..) {
            combined.extend_from_slice(&chunk);
        }
        self.buffered_samples = 0;
        self.last_logged_samples = 0;
        self.last_append = Instant::now();
        combined
    }

    fn clear_buffer(&mut self) {
        self.buffer.clear();
        self.buffered_samples = 0;
        self.last_logged_samples = 0;
    }

    fn cancel_grace(&mut self) {
        if let Some(handle) = self.grace.take() {
            handle.abort();
        }
    }
}

/// Outcome of a recognition attempt for one speaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Snapshot taken, inference task spawned
    Dispatched,
    /// A call is already in flight for this speaker
    Skipped,
    /// Non-forced attempt below the minimum-duration threshold
    BelowThreshold,
    /// Nothing buffered (forced attempt on an empty buffer is a no-op)
    Empty,
    /// No engine loaded; the snapshot is dropped
    NoEngine,
    UnknownSpeaker,
}

pub struct SessionWorker {
    guild_id: u64,
    engine: Option<Arc<dyn SpeechRecognizer>>,
    sink: Arc<dyn TranscriptSink>,
    config: Arc<dyn ConfigSource>,
    names: Arc<dyn SpeakerNames>,
    speakers: HashMap<u64, SpeakerState>,
    tunables: TranscribeConfig,
    tx: mpsc::UnboundedSender<SessionEvent>,
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

/// Handle to a running session worker. Owned by the registry; dropping the
/// handle alone does not stop the worker, [`SessionHandle::shutdown`] does.
pub struct SessionHandle {
    guild_id: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn guild_id(&self) -> u64 {
        self.guild_id
    }

    /// Sender for wiring the voice receiver to this session.
    pub fn sender(&self) -> mpsc::UnboundedSender<SessionEvent> {
        self.tx.clone()
    }

    /// Ask the worker to cancel its timers and exit. In-flight inference
    /// calls run to completion; their results land on a closed channel.
    pub fn shutdown(&self) {
        let _ = self.tx.send(SessionEvent::Shutdown);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl SessionWorker {
    pub fn new(
        guild_id: u64,
        engine: Option<Arc<dyn SpeechRecognizer>>,
        sink: Arc<dyn TranscriptSink>,
        config: Arc<dyn ConfigSource>,
        names: Arc<dyn SpeakerNames>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            guild_id,
            engine,
            sink,
            config,
            names,
            speakers: HashMap::new(),
            tunables: TranscribeConfig::default(),
            tx,
            rx,
        }
    }

    /// Spawn the worker loop and return its handle.
    pub fn spawn(
        guild_id: u64,
        engine: Option<Arc<dyn SpeechRecognizer>>,
        sink: Arc<dyn TranscriptSink>,
        config: Arc<dyn ConfigSource>,
        names: Arc<dyn SpeakerNames>,
    ) -> SessionHandle {
        let worker = Self::new(guild_id, engine, sink, config, names);
        let tx = worker.tx.clone();
        let task = tokio::spawn(worker.run());
        SessionHandle { guild_id, tx, task }
    }

    async fn run(mut self) {
        info!("({}) Transcription session worker started", self.guild_id);
        self.tunables = self.config.transcribe_config(self.guild_id).await;
        debug!(
            "({}) session thresholds: min_audio_seconds={}, sweep_interval_ms={}, chunk_seconds={}",
            self.guild_id,
            self.tunables.min_audio_seconds,
            self.tunables.sweep_interval_ms,
            self.tunables.chunk_seconds
        );

        let mut next_sweep = Instant::now() + Duration::from_millis(self.tunables.sweep_interval_ms);

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(next_sweep) => {
                    self.sweep().await;
                    next_sweep = Instant::now()
                        + Duration::from_millis(self.tunables.sweep_interval_ms);
                }
                event = self.rx.recv() => match event {
                    None | Some(SessionEvent::Shutdown) => break,
                    Some(event) => self.handle_event(event).await,
                }
            }
        }

        for speaker in self.speakers.values_mut() {
            speaker.cancel_grace();
            speaker.clear_buffer();
        }
        info!("({}) Transcription session worker stopped", self.guild_id);
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Audio { user_id, pcm } => {
                self.on_audio(user_id, pcm).await;
            }
            SessionEvent::SpeakingEnd { user_id } => {
                debug!("({}) speaking end for {}", self.guild_id, user_id);
                self.attempt(user_id, true);
            }
            SessionEvent::GraceElapsed { user_id, seq } => {
                let Some(speaker) = self.speakers.get_mut(&user_id) else {
                    return;
                };
                if seq != speaker.grace_seq {
                    return;
                }
                speaker.grace = None;
                self.attempt(user_id, true);
            }
            SessionEvent::InferenceDone { user_id, text } => {
                self.on_inference_done(user_id, text).await;
            }
            SessionEvent::Shutdown => unreachable!("handled in run loop"),
        }
    }

    /// Get or create state for a speaker. Creation snapshots the display
    /// name; re-seeing a known speaker is a no-op.
    async fn ensure_speaker(&mut self, user_id: u64) -> &mut SpeakerState {
        if !self.speakers.contains_key(&user_id) {
            let display_name = self
                .names
                .display_name(user_id)
                .await
                .unwrap_or_else(|| format!("User_{}", user_id));
            info!(
                "({}) Started buffering for speaker {} ({})",
                self.guild_id, display_name, user_id
            );
            self.speakers
                .insert(user_id, SpeakerState::new(display_name));
        }
        self.speakers.get_mut(&user_id).expect("just inserted")
    }

    async fn on_audio(&mut self, user_id: u64, pcm: Vec<i16>) {
        let guild_id = self.guild_id;
        let tx = self.tx.clone();
        let speaker = self.ensure_speaker(user_id).await;

        speaker.append(pcm);
        debug!(
            "({}) buffer append for {} ({}), samples={}, seconds={:.3}",
            guild_id,
            speaker.display_name,
            user_id,
            speaker.buffered_samples,
            speaker.buffered_seconds()
        );

        // Reschedule the grace timer so tiny fragments accumulate before a
        // forced flush.
        speaker.cancel_grace();
        speaker.grace_seq = speaker.grace_seq.wrapping_add(1);
        let seq = speaker.grace_seq;
        speaker.grace = Some(tokio::spawn(async move {
            tokio::time::sleep(GRACE_WINDOW).await;
            let _ = tx.send(SessionEvent::GraceElapsed { user_id, seq });
        }));
    }

    /// Periodic pass over all speakers: refresh tunables, reclaim stale
    /// fragments, attempt non-forced recognition where enough is buffered.
    async fn sweep(&mut self) {
        self.tunables = self.config.transcribe_config(self.guild_id).await;
        let min_samples = self.min_samples();

        let user_ids: Vec<u64> = self.speakers.keys().copied().collect();
        for user_id in user_ids {
            let Some(speaker) = self.speakers.get_mut(&user_id) else {
                continue;
            };

            if speaker.buffered_samples < min_samples {
                if speaker.buffered_samples != speaker.last_logged_samples {
                    debug!(
                        "({}) skipping {} ({}) - insufficient audio {:.3}s < {}s",
                        self.guild_id,
                        speaker.display_name,
                        user_id,
                        speaker.buffered_seconds(),
                        self.tunables.min_audio_seconds
                    );
                    speaker.last_logged_samples = speaker.buffered_samples;
                }

                // A fragment that never reached the threshold and stopped
                // growing is noise or a disconnect artifact; drop it. Any
                // pending grace timer fires harmlessly on the empty buffer.
                let staleness = speaker.last_append.elapsed();
                if speaker.buffered_samples > 0 && staleness > STALE_AFTER {
                    debug!(
                        "({}) clearing stale buffer for {} - {:.3}s idle for {:?}",
                        self.guild_id,
                        speaker.display_name,
                        speaker.buffered_seconds(),
                        staleness
                    );
                    speaker.clear_buffer();
                }

                continue;
            }

            self.attempt(user_id, false);
        }
    }

    fn min_samples(&self) -> usize {
        (self.tunables.min_audio_seconds * SOURCE_SAMPLES_PER_SECOND as f64) as usize
    }

    /// Try to submit a speaker's buffer for recognition. `force` bypasses
    /// the minimum-duration threshold. The per-speaker processing flag is
    /// the sole arbiter between racing triggers; "already processing" is a
    /// normal skip.
    fn attempt(&mut self, user_id: u64, force: bool) -> AttemptOutcome {
        let min_samples = self.min_samples();
        let Some(speaker) = self.speakers.get_mut(&user_id) else {
            return AttemptOutcome::UnknownSpeaker;
        };

        if speaker.processing {
            return AttemptOutcome::Skipped;
        }
        if speaker.buffered_samples == 0 {
            return AttemptOutcome::Empty;
        }
        if !force && speaker.buffered_samples < min_samples {
            return AttemptOutcome::BelowThreshold;
        }

        speaker.processing = true;
        let pcm = speaker.take_all();
        debug!(
            "({}) processing buffer for {} ({}) - samples={}, seconds={:.3}, force={}",
            self.guild_id,
            speaker.display_name,
            user_id,
            pcm.len(),
            pcm.len() as f64 / SOURCE_SAMPLES_PER_SECOND as f64,
            force
        );

        let Some(engine) = self.engine.clone() else {
            speaker.processing = false;
            return AttemptOutcome::NoEngine;
        };

        let guild_id = self.guild_id;
        let chunk_seconds = self.tunables.chunk_seconds;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let samples = audio::pcm_to_whisper_input(&pcm);
            let text = match engine.recognize(samples, chunk_seconds).await {
                Ok(text) => Some(text),
                Err(e) => {
                    error!("({}) recognition failed for {}: {}", guild_id, user_id, e);
                    None
                }
            };
            // The worker clears the processing flag when it sees this; a
            // send failure means the session is gone and nothing remains to
            // unlock.
            let _ = tx.send(SessionEvent::InferenceDone { user_id, text });
        });

        AttemptOutcome::Dispatched
    }

    async fn on_inference_done(&mut self, user_id: u64, text: Option<String>) {
        let Some(speaker) = self.speakers.get_mut(&user_id) else {
            return;
        };
        speaker.processing = false;

        let Some(text) = text else {
            return;
        };
        let cleaned = strip_fillers(&text);
        if cleaned.is_empty() {
            debug!(
                "({}) recognizer returned no usable text for {}",
                self.guild_id, speaker.display_name
            );
            return;
        }

        self.publish(user_id, cleaned).await;
    }

    /// Edit the speaker's previous transcript message in place, falling back
    /// to a new message if the edit is rejected. A failed send drops the
    /// text for this tick; the next recognition publishes again.
    async fn publish(&mut self, user_id: u64, text: String) {
        let Some(speaker) = self.speakers.get_mut(&user_id) else {
            return;
        };
        let content = format!("**{}**: {}", speaker.display_name, text);

        if let Some(message) = speaker.message {
            match self.sink.edit(message, &content).await {
                Ok(()) => {
                    speaker.last_text = text;
                    return;
                }
                Err(e) => {
                    debug!(
                        "({}) edit failed for {} ({}), sending new message",
                        self.guild_id, speaker.display_name, e
                    );
                }
            }
        }

        match self.sink.send(&content).await {
            Ok(message) => {
                speaker.message = Some(message);
                speaker.last_text = text;
            }
            Err(e) => {
                warn!(
                    "({}) failed to publish transcript for {}: {}",
                    self.guild_id, speaker.display_name, e
                );
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    fn worker_with(
        engine: Option<Arc<dyn SpeechRecognizer>>,
        sink: Arc<dyn TranscriptSink>,
        cfg: TranscribeConfig,
    ) -> SessionWorker {
        SessionWorker::new(1, engine, sink, fixed_config(cfg), Arc::new(NoNames))
    }

    #[test]
    fn test_take_all_preserves_append_order() {
        let mut speaker = SpeakerState::new("seven".into());
        speaker.append(vec![1, 2]);
        speaker.append(vec![3]);
        speaker.append(vec![4, 5, 6]);
        assert_eq!(speaker.buffered_samples, 6);

        assert_eq!(speaker.take_all(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(speaker.buffered_samples, 0);
        assert!(speaker.buffer.is_empty());

        // An append after extraction lands in the fresh buffer
        speaker.append(vec![9]);
        assert_eq!(speaker.take_all(), vec![9]);
    }

    #[test]
    fn test_buffered_seconds() {
        let mut speaker = SpeakerState::new("seven".into());
        speaker.append(vec![0; SOURCE_SAMPLES_PER_SECOND / 2]);
        assert!((speaker.buffered_seconds() - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_sweep_attempt_below_threshold_is_noop() {
        let engine = MockEngine::returning("hello");
        let sink = MockSink::new();
        let mut worker = worker_with(
            Some(engine.clone()),
            sink.clone(),
            TranscribeConfig::default(),
        );

        worker.ensure_speaker(5).await.append(pcm_seconds(0.2));
        assert_eq!(worker.attempt(5, false), AttemptOutcome::BelowThreshold);

        // Buffer untouched
        let speaker = worker.speakers.get(&5).unwrap();
        assert!((speaker.buffered_seconds() - 0.2).abs() < 1e-3);
        assert_eq!(engine.call_count(), 0);
    }

    #[tokio::test]
    async fn test_forced_attempt_bypasses_threshold() {
        let engine = MockEngine::returning("hello");
        let sink = MockSink::new();
        let mut worker = worker_with(
            Some(engine.clone()),
            sink.clone(),
            TranscribeConfig::default(),
        );

        worker.ensure_speaker(5).await.append(pcm_seconds(0.2));
        assert_eq!(worker.attempt(5, true), AttemptOutcome::Dispatched);
        assert_eq!(worker.speakers.get(&5).unwrap().buffered_samples, 0);
    }

    #[tokio::test]
    async fn test_forced_attempt_on_empty_buffer_is_noop() {
        let engine = MockEngine::returning("hello");
        let mut worker = worker_with(
            Some(engine.clone()),
            MockSink::new(),
            TranscribeConfig::default(),
        );

        worker.ensure_speaker(5).await;
        assert_eq!(worker.attempt(5, true), AttemptOutcome::Empty);
        assert_eq!(engine.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_skips_while_inference_in_flight() {
        let engine = MockEngine::slow("hello", Duration::from_secs(3600));
        let mut worker = worker_with(
            Some(engine.clone()),
            MockSink::new(),
            TranscribeConfig::default(),
        );

        worker.ensure_speaker(5).await.append(one_second_pcm());
        assert_eq!(worker.attempt(5, false), AttemptOutcome::Dispatched);

        // Let the inference task start and call the engine
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.call_count(), 1);

        // New audio arrives while the first call is still running
        worker.speakers.get_mut(&5).unwrap().append(one_second_pcm());
        assert_eq!(worker.attempt(5, false), AttemptOutcome::Skipped);
        assert_eq!(worker.attempt(5, true), AttemptOutcome::Skipped);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.call_count(), 1);
    }

    #[tokio::test]
    async fn test_no_engine_releases_processing_and_drops_snapshot() {
        let mut worker = worker_with(None, MockSink::new(), TranscribeConfig::default());

        worker.ensure_speaker(5).await.append(one_second_pcm());
        assert_eq!(worker.attempt(5, false), AttemptOutcome::NoEngine);

        let speaker = worker.speakers.get(&5).unwrap();
        assert!(!speaker.processing);
        assert_eq!(speaker.buffered_samples, 0);

        // Speaker remains usable
        worker.speakers.get_mut(&5).unwrap().append(one_second_pcm());
        assert_eq!(worker.attempt(5, false), AttemptOutcome::NoEngine);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_clears_stale_fragment() {
        let engine = MockEngine::returning("hello");
        let mut worker = worker_with(
            Some(engine.clone()),
            MockSink::new(),
            TranscribeConfig::default(),
        );

        worker.ensure_speaker(5).await.append(pcm_seconds(0.1));

        // Not stale yet: fragment survives the sweep
        tokio::time::advance(Duration::from_secs(2)).await;
        worker.sweep().await;
        assert!(worker.speakers.get(&5).unwrap().buffered_samples > 0);

        // Past the staleness horizon the sweep discards it
        tokio::time::advance(Duration::from_secs(4)).await;
        worker.sweep().await;
        assert_eq!(worker.speakers.get(&5).unwrap().buffered_samples, 0);

        // A later forced flush then has nothing to do
        assert_eq!(worker.attempt(5, true), AttemptOutcome::Empty);
        assert_eq!(engine.call_count(), 0);
    }

    #[tokio::test]
    async fn test_inference_failure_releases_processing() {
        let engine = MockEngine::failing();
        let sink = MockSink::new();
        let mut worker = worker_with(
            Some(engine.clone()),
            sink.clone(),
            TranscribeConfig::default(),
        );

        worker.ensure_speaker(5).await.append(one_second_pcm());
        assert_eq!(worker.attempt(5, false), AttemptOutcome::Dispatched);

        // Drive the completion event through the worker by hand
        let event = worker.rx.recv().await.unwrap();
        match &event {
            SessionEvent::InferenceDone { user_id: 5, text } => assert!(text.is_none()),
            other => panic!("unexpected event: {:?}", other),
        }
        worker.handle_event(event).await;

        assert!(!worker.speakers.get(&5).unwrap().processing);
        assert!(sink.sent().is_empty());
        assert_eq!(engine.call_count(), 1);
    }

    #[tokio::test]
    async fn test_publish_edits_existing_message() {
        let sink = MockSink::new();
        let mut worker = worker_with(
            Some(MockEngine::returning("x")),
            sink.clone(),
            TranscribeConfig::default(),
        );
        worker.ensure_speaker(5).await;

        worker.publish(5, "first".into()).await;
        worker.publish(5, "first second".into()).await;

        assert_eq!(sink.sent(), vec!["**User_5**: first"]);
        assert_eq!(sink.edited(), vec![(1, "**User_5**: first second".to_string())]);
        assert_eq!(worker.speakers.get(&5).unwrap().last_text, "first second");
    }

    #[tokio::test]
    async fn test_publish_falls_back_to_send_when_edit_rejected() {
        let sink = MockSink::rejecting_edits();
        let mut worker = worker_with(
            Some(MockEngine::returning("x")),
            sink.clone(),
            TranscribeConfig::default(),
        );
        worker.ensure_speaker(5).await;

        worker.publish(5, "first".into()).await;
        worker.publish(5, "second".into()).await;

        assert_eq!(
            sink.sent(),
            vec!["**User_5**: first", "**User_5**: second"]
        );
        assert!(sink.edited().is_empty());
        // The replacement message is remembered
        assert_eq!(worker.speakers.get(&5).unwrap().message, Some(MessageRef(2)));
    }

    #[tokio::test]
    async fn test_publish_uses_gateway_name_without_override() {
        let sink = MockSink::new();
        let mut worker = SessionWorker::new(
            1,
            Some(MockEngine::returning("x")),
            sink.clone(),
            fixed_config(TranscribeConfig::default()),
            Arc::new(StaticNames("Nickname")),
        );
        worker.ensure_speaker(5).await;

        worker.publish(5, "hello".into()).await;
        assert_eq!(sink.sent(), vec!["**Nickname**: hello"]);
    }

    #[tokio::test]
    async fn test_name_chain_prefers_stored_override_over_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("test.db").display());
        let pool = db::init_db(&url).await.unwrap();

        let names = DbSpeakerNames::new(pool.clone(), 2, Arc::new(StaticNames("Nickname")));

        // Nothing stored: the gateway display name is used
        assert_eq!(names.display_name(1).await.as_deref(), Some("Nickname"));

        db::set_transcribe_name(&pool, "1", "2", "StageName")
            .await
            .unwrap();
        assert_eq!(names.display_name(1).await.as_deref(), Some("StageName"));
    }

    #[tokio::test]
    async fn test_filler_only_result_publishes_nothing() {
        let sink = MockSink::new();
        let mut worker = worker_with(
            Some(MockEngine::returning("x")),
            sink.clone(),
            TranscribeConfig::default(),
        );
        worker.ensure_speaker(5).await;

        worker.on_inference_done(5, Some("[Music]".into())).await;
        assert!(sink.sent().is_empty());

        worker.on_inference_done(5, Some("[Music] hello".into())).await;
        assert_eq!(sink.sent(), vec!["**User_5**: hello"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_timer_forces_short_utterance_flush() {
        let engine = MockEngine::returning("hi there");
        let sink = MockSink::new();
        let handle = SessionWorker::spawn(
            1,
            Some(engine.clone()),
            sink.clone(),
            fixed_config(TranscribeConfig::default()),
            Arc::new(NoNames),
        );

        // 0.2s of audio: below the 0.5s threshold, so only the grace timer
        // can flush it
        handle
            .sender()
            .send(SessionEvent::Audio {
                user_id: 42,
                pcm: pcm_seconds(0.2),
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(700)).await;

        assert_eq!(engine.call_count(), 1);
        assert_eq!(sink.sent(), vec!["**User_42**: hi there"]);

        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_speech_publishes_and_silent_speaker_does_not() {
        let engine = MockEngine::returning("continuous speech");
        let sink = MockSink::new();
        let handle = SessionWorker::spawn(
            1,
            Some(engine.clone()),
            sink.clone(),
            fixed_config(TranscribeConfig::default()),
            Arc::new(NoNames),
        );

        // Speaker A talks for 3 seconds in 100ms frames; speaker B is in the
        // channel but never produces audio, so the receiver only ever emits
        // silence notifications on its behalf
        for i in 0..30 {
            handle
                .sender()
                .send(SessionEvent::Audio {
                    user_id: 1,
                    pcm: pcm_seconds(0.1),
                })
                .unwrap();
            if i % 10 == 0 {
                handle
                    .sender()
                    .send(SessionEvent::SpeakingEnd { user_id: 2 })
                    .unwrap();
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let sent = sink.sent();
        assert!(!sent.is_empty(), "expected at least one publish within 3s");
        assert!(sent.iter().all(|m| m.starts_with("**User_1**:")));
        assert!(sent.iter().all(|m| !m.contains("User_2")));
        assert!(engine.call_count() >= 1);

        handle.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_survives_persistent_engine_failure() {
        let engine = MockEngine::failing();
        let sink = MockSink::new();
        let handle = SessionWorker::spawn(
            1,
            Some(engine.clone()),
            sink.clone(),
            fixed_config(TranscribeConfig::default()),
            Arc::new(NoNames),
        );

        // Ten sweep ticks of failing inference
        for _ in 0..10 {
            handle
                .sender()
                .send(SessionEvent::Audio {
                    user_id: 9,
                    pcm: one_second_pcm(),
                })
                .unwrap();
            tokio::time::sleep(Duration::from_millis(2000)).await;
        }

        assert!(!handle.is_finished());
        assert!(sink.sent().is_empty());
        assert!(engine.call_count() >= 1);

        handle.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_speaking_end_flushes_remaining_buffer() {
        let engine = MockEngine::returning("tail");
        let sink = MockSink::new();
        let handle = SessionWorker::spawn(
            1,
            Some(engine.clone()),
            sink.clone(),
            fixed_config(TranscribeConfig {
                // High threshold so neither sweep nor threshold flushes
                min_audio_seconds: 10.0,
                ..TranscribeConfig::default()
            }),
            Arc::new(NoNames),
        );

        handle
            .sender()
            .send(SessionEvent::Audio {
                user_id: 3,
                pcm: pcm_seconds(0.3),
            })
            .unwrap();
        // Flush before the grace window has a chance
        handle
            .sender()
            .send(SessionEvent::SpeakingEnd { user_id: 3 })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(engine.call_count(), 1);
        assert_eq!(sink.sent(), vec!["**User_3**: tail"]);

        handle.shutdown();
    }
}
