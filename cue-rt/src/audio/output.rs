//! Device output through cpal
//!
//! The device callback runs on cpal's real-time thread and pulls one
//! [`StereoFrame`] per output frame. `cue-player` hands it the consumer half
//! of the mixer ring, so the callback never touches the runtime itself.
//!
//! The mixing engine follows whatever rate the device ends up at; asking for
//! the configured rate is only a preference.

use super::ring_buffer::StereoFrame;
use crate::error::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BufferSize, Device, FromSample, Host, OutputCallbackInfo, SampleFormat, SampleRate,
    SizedSample, Stream, StreamConfig, SupportedStreamConfigRange,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Sample formats we can write, best first
const FORMAT_PREFERENCE: [SampleFormat; 3] = [SampleFormat::F32, SampleFormat::I16, SampleFormat::U16];

fn device_error(what: &str, e: impl std::fmt::Display) -> Error {
    Error::AudioOutput(format!("{}: {}", what, e))
}

fn device_label(device: &Device) -> String {
    device.name().unwrap_or_else(|_| "<unnamed>".to_string())
}

/// Output device named `name`, or the host default.
///
/// An unknown name falls back to the default device with a warning.
fn find_device(host: &Host, name: Option<&str>) -> Result<Device> {
    if let Some(name) = name {
        let found = host
            .output_devices()
            .map_err(|e| device_error("Failed to enumerate devices", e))?
            .find(|d| d.name().ok().as_deref() == Some(name));
        match found {
            Some(device) => return Ok(device),
            None => warn!("Output device '{}' not found, using the default", name),
        }
    }
    host.default_output_device()
        .ok_or_else(|| Error::AudioOutput("No default output device".to_string()))
}

/// Rank a supported range: stereo, covering `rate`, and an early entry in
/// [`FORMAT_PREFERENCE`] all score higher.
fn score(range: &SupportedStreamConfigRange, rate: u32) -> Option<u32> {
    let format_rank = FORMAT_PREFERENCE
        .iter()
        .position(|f| *f == range.sample_format())?;
    let covers_rate = range.min_sample_rate().0 <= rate && range.max_sample_rate().0 >= rate;
    let stereo = range.channels() == 2;
    Some(u32::from(covers_rate) * 100 + u32::from(stereo) * 10 + (3 - format_rank as u32))
}

/// Pick the stream configuration for `device`, preferring `rate`
fn choose_config(device: &Device, rate: u32) -> Result<(StreamConfig, SampleFormat)> {
    let best = device
        .supported_output_configs()
        .map_err(|e| device_error("Failed to query device configs", e))?
        .filter_map(|range| score(&range, rate).map(|s| (s, range)))
        .max_by_key(|(s, _)| *s);

    if let Some((_, range)) = best {
        let format = range.sample_format();
        let supported = if range.min_sample_rate().0 <= rate && range.max_sample_rate().0 >= rate {
            range.with_sample_rate(SampleRate(rate))
        } else {
            range.with_max_sample_rate()
        };
        return Ok((supported.config(), format));
    }

    let fallback = device
        .default_output_config()
        .map_err(|e| device_error("Failed to query default config", e))?;
    Ok((fallback.config(), fallback.sample_format()))
}

/// Open output stream fed by a frame callback
pub struct AudioOutput {
    device: Device,
    config: StreamConfig,
    sample_format: SampleFormat,
    stream: Option<Stream>,
    /// Set by the stream error callback
    failed: Arc<AtomicBool>,
    frames_played: Arc<AtomicU64>,
}

impl AudioOutput {
    /// Names of every output device on the default host
    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let names: Vec<String> = host
            .output_devices()
            .map_err(|e| device_error("Failed to enumerate devices", e))?
            .map(|d| device_label(&d))
            .collect();
        debug!("{} output devices on {:?}", names.len(), host.id());
        Ok(names)
    }

    /// Open a device without starting it.
    ///
    /// # Arguments
    /// - `device_name`: device to use, `None` for the default
    /// - `preferred_rate`: rate to ask for; the device may settle elsewhere
    /// - `buffer_frames`: fixed callback size, `None` for the device default
    pub fn new(device_name: Option<&str>, preferred_rate: u32, buffer_frames: Option<u32>) -> Result<Self> {
        let host = cpal::default_host();
        let device = find_device(&host, device_name)?;
        let (mut config, sample_format) = choose_config(&device, preferred_rate)?;
        if let Some(frames) = buffer_frames {
            config.buffer_size = BufferSize::Fixed(frames);
        }

        if config.sample_rate.0 != preferred_rate {
            warn!(
                "Device '{}' runs at {} Hz instead of {} Hz; mixing at the device rate",
                device_label(&device),
                config.sample_rate.0,
                preferred_rate
            );
        }
        info!(
            "Output '{}': {} Hz, {} ch, {:?}, buffer {:?}",
            device_label(&device),
            config.sample_rate.0,
            config.channels,
            sample_format,
            config.buffer_size
        );

        Ok(Self {
            device,
            config,
            sample_format,
            stream: None,
            failed: Arc::new(AtomicBool::new(false)),
            frames_played: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Start the stream. `next_frame` runs on the device thread and must
    /// not block.
    pub fn start<F>(&mut self, next_frame: F) -> Result<()>
    where
        F: FnMut() -> StereoFrame + Send + 'static,
    {
        let stream = match self.sample_format {
            SampleFormat::F32 => self.build_stream::<f32, F>(next_frame)?,
            SampleFormat::I16 => self.build_stream::<i16, F>(next_frame)?,
            SampleFormat::U16 => self.build_stream::<u16, F>(next_frame)?,
            other => {
                return Err(Error::AudioOutput(format!("Unsupported sample format {:?}", other)));
            }
        };
        stream.play().map_err(|e| device_error("Failed to start stream", e))?;
        self.stream = Some(stream);
        debug!("Output stream started");
        Ok(())
    }

    fn build_stream<T, F>(&self, mut next_frame: F) -> Result<Stream>
    where
        T: SizedSample + FromSample<f32>,
        F: FnMut() -> StereoFrame + Send + 'static,
    {
        let channels = usize::from(self.config.channels);
        let failed = Arc::clone(&self.failed);
        let played = Arc::clone(&self.frames_played);

        let write = move |data: &mut [T], _: &OutputCallbackInfo| {
            for out in data.chunks_mut(channels) {
                let frame = next_frame();
                let left = frame.left.clamp(-1.0, 1.0);
                let right = frame.right.clamp(-1.0, 1.0);
                match out {
                    [mono] => *mono = T::from_sample((left + right) * 0.5),
                    [l, r, rest @ ..] => {
                        *l = T::from_sample(left);
                        *r = T::from_sample(right);
                        rest.fill(T::EQUILIBRIUM);
                    }
                    [] => {}
                }
            }
            played.fetch_add((data.len() / channels.max(1)) as u64, Ordering::Relaxed);
        };
        let on_error = move |err: cpal::StreamError| {
            error!("Output stream error: {}", err);
            failed.store(true, Ordering::SeqCst);
        };

        self.device
            .build_output_stream(&self.config, write, on_error, None)
            .map_err(|e| device_error("Failed to build stream", e))
    }

    /// Pause and drop the stream
    pub fn stop(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            stream.pause().map_err(|e| device_error("Failed to pause stream", e))?;
            debug!(
                "Output stream stopped after {} frames",
                self.frames_played.load(Ordering::Relaxed)
            );
        }
        Ok(())
    }

    pub fn device_name(&self) -> String {
        device_label(&self.device)
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    /// Frames handed to the device so far
    pub fn frames_played(&self) -> u64 {
        self.frames_played.load(Ordering::Relaxed)
    }

    /// The stream's error callback has fired
    pub fn has_error(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpal::SupportedBufferSize;

    fn range(channels: u16, min: u32, max: u32, format: SampleFormat) -> SupportedStreamConfigRange {
        SupportedStreamConfigRange::new(
            channels,
            SampleRate(min),
            SampleRate(max),
            SupportedBufferSize::Unknown,
            format,
        )
    }

    #[test]
    fn test_rate_coverage_outranks_format() {
        let i16_covering = range(2, 8_000, 96_000, SampleFormat::I16);
        let f32_narrow = range(2, 44_100, 44_100, SampleFormat::F32);
        assert!(score(&i16_covering, 48_000) > score(&f32_narrow, 48_000));
    }

    #[test]
    fn test_stereo_f32_preferred() {
        let mono = range(1, 8_000, 96_000, SampleFormat::F32);
        let stereo_i16 = range(2, 8_000, 96_000, SampleFormat::I16);
        let stereo_f32 = range(2, 8_000, 96_000, SampleFormat::F32);
        assert!(score(&stereo_f32, 48_000) > score(&stereo_i16, 48_000));
        assert!(score(&stereo_i16, 48_000) > score(&mono, 48_000));
    }

    #[test]
    fn test_unwritable_format_is_skipped() {
        assert_eq!(score(&range(2, 8_000, 96_000, SampleFormat::U8), 48_000), None);
    }
}
