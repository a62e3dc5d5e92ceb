//! Audio I/O utilities.
//!
//! WAV read/write at 16 kHz mono 16-bit PCM for generated clips.

mod wav;

pub use wav::{read_wav, write_wav};
