pub mod receiver;

pub use receiver::VoiceFrameSource;
