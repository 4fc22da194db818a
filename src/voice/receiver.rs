use crate::transcribe::SessionEvent;
use songbird::{
    Event, EventContext, EventHandler, events::context_data::VoiceTick,
    model::payload::{ClientDisconnect, Speaking},
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tracing::debug;

struct ReceiverState {
    /// Maps RTP ssrc -> Discord user id
    ssrc_map: HashMap<u32, u64>,
    /// Ssrcs that produced audio on the last tick
    speaking: HashSet<u32>,
}

/// Songbird event handler feeding decoded voice into a session worker.
///
/// One instance (cloned per registered event type) serves the whole channel:
/// every speaker arrives demultiplexed by ssrc on the shared `VoiceTick`
/// stream, so there is no per-speaker subscription to deduplicate.
#[derive(Clone)]
pub struct VoiceFrameSource {
    tx: UnboundedSender<SessionEvent>,
    state: Arc<Mutex<ReceiverState>>,
}

impl VoiceFrameSource {
    pub fn new(tx: UnboundedSender<SessionEvent>) -> Self {
        Self {
            tx,
            state: Arc::new(Mutex::new(ReceiverState {
                ssrc_map: HashMap::new(),
                speaking: HashSet::new(),
            })),
        }
    }
}

#[async_trait::async_trait]
impl EventHandler for VoiceFrameSource {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        match ctx {
            EventContext::SpeakingStateUpdate(Speaking { ssrc, user_id, .. }) => {
                if let Some(user_id) = user_id {
                    let mut state = self.state.lock().await;
                    state.ssrc_map.insert(*ssrc, user_id.0);
                }
            }
            EventContext::VoiceTick(VoiceTick {
                speaking, silent, ..
            }) => {
                let mut state = self.state.lock().await;

                for (ssrc, voice_data) in speaking {
                    let Some(&user_id) = state.ssrc_map.get(ssrc) else {
                        continue;
                    };

                    // A frame the driver could not decode is a gap in the
                    // stream, not a reason to end it
                    let decoded = match &voice_data.decoded_voice {
                        Some(d) => d,
                        None => {
                            debug!("dropping undecodable frame for ssrc {}", ssrc);
                            continue;
                        }
                    };

                    if decoded.is_empty() {
                        continue;
                    }

                    // Comfort-noise ticks decode to all zeros; skip them
                    if decoded.iter().all(|&s| s == 0) {
                        continue;
                    }

                    state.speaking.insert(*ssrc);
                    let _ = self.tx.send(SessionEvent::Audio {
                        user_id,
                        pcm: decoded.clone(),
                    });
                }

                // A speaking -> silent transition flushes that speaker
                let ReceiverState { ssrc_map, speaking } = &mut *state;
                for ssrc in silent {
                    if speaking.remove(ssrc) {
                        if let Some(&user_id) = ssrc_map.get(ssrc) {
                            let _ = self.tx.send(SessionEvent::SpeakingEnd { user_id });
                        }
                    }
                }
            }
            EventContext::ClientDisconnect(ClientDisconnect { user_id, .. }) => {
                let mut state = self.state.lock().await;
                let user_id = user_id.0;
                let ReceiverState { ssrc_map, speaking } = &mut *state;
                ssrc_map.retain(|ssrc, mapped| {
                    if *mapped == user_id {
                        speaking.remove(ssrc);
                        false
                    } else {
                        true
                    }
                });
                let _ = self.tx.send(SessionEvent::SpeakingEnd { user_id });
            }
            _ => {}
        }

        None
    }
}
