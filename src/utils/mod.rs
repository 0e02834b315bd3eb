pub mod audio;

pub use audio::{AudioError, decode_wav, encode_wav, pcm16_le_bytes, wav_from_pcm16};
