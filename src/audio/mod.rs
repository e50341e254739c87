pub mod decoder;
pub mod fft;
pub mod resample;

pub use decoder::{decode_bytes, decode_file, DecodedClip};
pub use fft::{FftService, FFT_SIZE, SPECTRUM_BINS};
pub use resample::resample_to_target;
