//! Configuration for the command-line front end
//!
//! - Engine defaults (cipher, KDF, compression, history limits) in JSON
//! - Atomic file storage shared with `format::save_to_path`

pub mod settings;
pub mod storage;

pub use settings::{CipherChoice, EngineSettings, KdfChoice};
pub use storage::{read_file, write_atomic};
