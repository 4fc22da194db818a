pub mod transcribe;
pub mod transcribe_config;
pub mod transcribe_name;

pub use transcribe::transcribe;
pub use transcribe_config::transcribe_config;
pub use transcribe_name::{get_transcribe_name, set_transcribe_name};
