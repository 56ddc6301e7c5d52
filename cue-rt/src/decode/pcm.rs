//! PCM passthrough decoder
//!
//! The output block is the queued input block itself. An input counts as
//! consumed once its output has been handed back through `next_output`.

use super::{InputBuffer, OutputBuffer, PcmFormat};

pub struct PcmDecoder {
    format: PcmFormat,
    pending: Option<InputBuffer>,
    /// An output is held by the caller
    outstanding: bool,
    consumed: usize,
}

impl PcmDecoder {
    pub fn new(format: PcmFormat) -> Self {
        Self {
            format,
            pending: None,
            outstanding: false,
            consumed: 0,
        }
    }

    pub fn can_queue_input(&self) -> bool {
        self.pending.is_none()
    }

    pub fn queue_input(&mut self, input: InputBuffer, _is_last: bool) -> bool {
        if self.pending.is_some() {
            return false;
        }
        self.pending = Some(input);
        true
    }

    pub fn next_output(&mut self, previous: Option<OutputBuffer>) -> Option<OutputBuffer> {
        if previous.is_some() && self.outstanding {
            self.outstanding = false;
            self.consumed += 1;
        }
        let input = self.pending.take()?;
        self.outstanding = true;
        Some(OutputBuffer::Pcm {
            input,
            format: self.format,
        })
    }

    pub fn release_consumed_inputs(&mut self) -> usize {
        std::mem::take(&mut self.consumed)
    }

    pub fn is_drained(&self) -> bool {
        self.pending.is_none()
    }

    pub fn flush(&mut self) {
        self.pending = None;
        self.outstanding = false;
        self.consumed = 0;
    }
}
