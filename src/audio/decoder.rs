use std::fs::File;
use std::io::{Cursor, ErrorKind};
use std::path::Path;
use symphonia::core::{
    audio::SampleBuffer, codecs::DecoderOptions, formats::FormatOptions, io::MediaSourceStream,
    probe::Hint,
};
use symphonia::default::{get_codecs, get_probe};

use crate::error::{AudioError, Result};

use super::resample::resample_to_target;

/// Decoded clip data, downmixed to mono.
pub struct DecodedClip {
    pub samples: Vec<f32>,
    /// Sample rate in Hz (the engine target rate after resampling)
    pub sample_rate: u32,
}

impl DecodedClip {
    pub fn duration_seconds(&self) -> f32 {
        if self.sample_rate == 0 {
            0.0
        } else {
            self.samples.len() as f32 / self.sample_rate as f32
        }
    }
}

/// Decode an audio file to mono samples at `target_rate`.
pub fn decode_file(path: &Path, target_rate: u32) -> Result<DecodedClip> {
    let file = File::open(path)
        .map_err(|e| AudioError::Decode(format!("failed to open clip for decoding: {}", e)))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|ext| ext.to_str()) {
        hint.with_extension(ext);
    }

    decode_stream(mss, hint, target_rate)
}

/// Decode an in-memory payload (as delivered by the acquisition collaborator)
/// to mono samples at `target_rate`.
pub fn decode_bytes(bytes: Vec<u8>, extension: Option<&str>, target_rate: u32) -> Result<DecodedClip> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    decode_stream(mss, hint, target_rate)
}

fn decode_stream(mss: MediaSourceStream, hint: Hint, target_rate: u32) -> Result<DecodedClip> {
    let probed = get_probe()
        .format(&hint, mss, &FormatOptions::default(), &Default::default())
        .map_err(|e| AudioError::Decode(format!("failed to probe audio payload: {}", e)))?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| AudioError::Decode("audio payload contains no default track".into()))?;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| AudioError::Decode("track missing sample rate".into()))?;

    let mut decoder = get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| AudioError::Decode(format!("failed to create decoder: {}", e)))?;

    // Downmix to mono while draining packets; the chain runs single-channel.
    let mut samples = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(symphonia::core::errors::Error::IoError(err))
                if err.kind() == ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(err) => {
                return Err(AudioError::Decode(format!(
                    "failed to read audio packet: {}",
                    err
                )))
            }
        };

        match decoder.decode(&packet) {
            Ok(audio_buffer) => {
                let spec = *audio_buffer.spec();
                let mut sample_buffer =
                    SampleBuffer::<f32>::new(audio_buffer.capacity() as u64, spec);
                sample_buffer.copy_interleaved_ref(audio_buffer);

                let src_channels = spec.channels.count();
                if src_channels == 0 {
                    continue;
                }

                let interleaved = sample_buffer.samples();
                for frame in interleaved.chunks_exact(src_channels) {
                    let sum: f32 = frame.iter().sum();
                    samples.push(sum / src_channels as f32);
                }
            }
            Err(err) => {
                return Err(AudioError::Decode(format!(
                    "failed to decode audio packet: {}",
                    err
                )));
            }
        }
    }

    if samples.is_empty() {
        return Err(AudioError::Decode("audio payload produced no samples".into()));
    }

    let (final_samples, final_rate) = if target_rate > 0 && sample_rate != target_rate {
        (resample_to_target(&samples, sample_rate, target_rate), target_rate)
    } else {
        (samples, sample_rate)
    };

    Ok(DecodedClip {
        samples: final_samples,
        sample_rate: final_rate,
    })
}
