pub mod audio;
pub mod config;
pub mod engine;
pub mod publish;
pub mod registry;
pub mod session;

pub use config::{ConfigSource, DbConfigSource, TranscribeConfig};
pub use engine::{SpeechRecognizer, WhisperEngine, WhisperModel};
pub use publish::{ChannelSink, TranscriptSink};
pub use registry::{SessionError, SessionRegistry};
pub use session::{DbSpeakerNames, GatewayNames, SessionEvent, SessionHandle, SessionWorker};
