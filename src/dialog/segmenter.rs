//! Utterance segmentation: turn annotated audio frames into discrete
//! spans of user speech.
//!
//! A frame counts as speech only when the classifier's voice-activity flag
//! is set and, if an energy gate is configured, the frame's mean absolute
//! amplitude clears it. Speech/silence hysteresis decides the endpoint; a
//! bounded pre-roll ring preserves the syllable spoken just before
//! detection caught up.
//!
//! The same state machine serves two modes: batch (assemble the whole
//! utterance, hand it off once) and streaming (emit samples as they
//! arrive, signal the endpoint when it fires).

use std::collections::VecDeque;

use tracing::{debug, info};

use crate::config::SegmenterConfig;
use crate::vad::energy;

/// Endpointing mode. Streaming is only meaningful when the transport can
/// accept a live listen session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointMode {
    Batch,
    Streaming,
}

/// A finalized span of user speech, handed to exactly one consumer.
///
/// In streaming mode the samples were already shipped frame by frame, so
/// `pcm` is empty and only the timing survives.
#[derive(Debug)]
pub struct Utterance {
    pub pcm: Vec<i16>,
    pub sample_rate: u32,
    pub speech_ms: u32,
    pub silence_ms: u32,
    /// Endpoint was forced by a hard cap rather than natural silence.
    pub capped: bool,
    /// Pre-empted mid-accumulation; consumers discard instead of dispatch.
    pub dropped: bool,
}

/// What a pushed frame produced.
#[derive(Debug)]
pub enum SegmentEvent {
    /// Transition into speech.
    Started,
    /// Streaming mode: samples to forward while the utterance is open.
    /// The first such event after `Started` carries the pre-roll.
    Audio { pcm: Vec<i16> },
    /// Endpoint reached.
    Finalized(Utterance),
    /// Open utterance discarded without a usable endpoint (hard cap hit
    /// before enough speech accumulated).
    Cancelled,
}

/// Result of pushing one frame.
#[derive(Debug)]
pub struct FrameResult {
    /// Frame passed the speech test (drives the session keep-alive).
    pub speech: bool,
    pub events: Vec<SegmentEvent>,
}

pub struct Segmenter {
    cfg: SegmenterConfig,
    sample_rate: u32,
    mode: EndpointMode,
    in_speech: bool,
    speech_ms: u32,
    silence_ms: u32,
    buffer: Vec<i16>,
    streamed_samples: usize,
    pre_roll: VecDeque<i16>,
    pre_roll_cap: usize,
    max_pcm_samples: usize,
    drop_pending: bool,
}

impl Segmenter {
    pub fn new(cfg: SegmenterConfig, sample_rate: u32, mode: EndpointMode) -> Self {
        let pre_roll_cap = (cfg.pre_roll_ms as usize * sample_rate as usize) / 1_000;
        let max_pcm_samples = (cfg.max_pcm_ms as usize * sample_rate as usize) / 1_000;
        Self {
            cfg,
            sample_rate,
            mode,
            in_speech: false,
            speech_ms: 0,
            silence_ms: 0,
            buffer: Vec::new(),
            streamed_samples: 0,
            pre_roll: VecDeque::with_capacity(pre_roll_cap),
            pre_roll_cap,
            max_pcm_samples,
            drop_pending: false,
        }
    }

    /// An utterance is currently open.
    pub fn is_active(&self) -> bool {
        self.in_speech
    }

    /// Samples currently held in the pre-roll ring.
    pub fn pre_roll_len(&self) -> usize {
        self.pre_roll.len()
    }

    /// Mark the open utterance as pre-empted; it will be finalized with the
    /// dropped flag set and must be discarded by the consumer.
    pub fn mark_dropped(&mut self) {
        if self.in_speech {
            self.drop_pending = true;
        }
    }

    /// Discard any open utterance and pre-roll immediately.
    /// Returns whether an utterance was open.
    pub fn abort_current(&mut self) -> bool {
        let was_active = self.in_speech;
        self.reset();
        self.pre_roll.clear();
        was_active
    }

    /// Feed one annotated frame through the endpointing state machine.
    pub fn push_frame(&mut self, pcm: &[i16], vad_speech: bool) -> FrameResult {
        let mut events = Vec::new();
        if pcm.is_empty() {
            return FrameResult {
                speech: false,
                events,
            };
        }

        let frame_ms = ((pcm.len() as u32 * 1_000) / self.sample_rate).max(1);
        let mean_abs = energy::mean_abs(pcm);
        let mut speech_frame = vad_speech;
        if self.cfg.energy_gate_mean_abs > 0 && mean_abs < self.cfg.energy_gate_mean_abs {
            speech_frame = false;
        }

        if speech_frame {
            if !self.in_speech {
                self.in_speech = true;
                self.drop_pending = false;
                self.speech_ms = 0;
                self.silence_ms = 0;
                self.buffer.clear();
                self.streamed_samples = 0;
                info!(
                    vad = vad_speech,
                    mean_abs,
                    gate = self.cfg.energy_gate_mean_abs,
                    "Speech start"
                );
                events.push(SegmentEvent::Started);
                let pre_roll = self.take_pre_roll();
                match self.mode {
                    EndpointMode::Batch => self.buffer.extend_from_slice(&pre_roll),
                    EndpointMode::Streaming => {
                        self.streamed_samples += pre_roll.len();
                        if !pre_roll.is_empty() {
                            events.push(SegmentEvent::Audio { pcm: pre_roll });
                        }
                    }
                }
            }
            self.speech_ms += frame_ms;
            self.silence_ms = 0;
        } else if self.in_speech {
            self.silence_ms += frame_ms;
        }

        if !self.in_speech {
            // Idle: remember the most recent audio so onset is not clipped.
            self.push_pre_roll(pcm);
            return FrameResult {
                speech: speech_frame,
                events,
            };
        }

        // Append the frame, trailing silence included; it materially helps
        // downstream recognition.
        match self.mode {
            EndpointMode::Batch => self.buffer.extend_from_slice(pcm),
            EndpointMode::Streaming => {
                self.streamed_samples += pcm.len();
                events.push(SegmentEvent::Audio { pcm: pcm.to_vec() });
            }
        }

        let total_ms = self.speech_ms + self.silence_ms;
        let buffered = match self.mode {
            EndpointMode::Batch => self.buffer.len(),
            EndpointMode::Streaming => self.streamed_samples,
        };

        let mut capped = false;
        if total_ms > self.cfg.max_utterance_ms || buffered > self.max_pcm_samples {
            self.silence_ms = self.cfg.end_silence_ms;
            capped = true;
        }

        if self.speech_ms >= self.cfg.min_speech_ms && self.silence_ms >= self.cfg.end_silence_ms {
            events.push(self.finalize(capped));
        } else if capped {
            // Hit the cap with too little speech to ever ship. Discard
            // instead of letting the buffer grow without bound.
            debug!(
                speech_ms = self.speech_ms,
                "Cap reached below min speech; discarding"
            );
            self.reset();
            events.push(SegmentEvent::Cancelled);
        }

        FrameResult {
            speech: speech_frame,
            events,
        }
    }

    fn finalize(&mut self, capped: bool) -> SegmentEvent {
        let speech_ms = self.speech_ms;
        let silence_ms = self.silence_ms;
        let dropped = self.drop_pending;

        let pcm = if dropped {
            Vec::new()
        } else {
            // Trim excessive tail silence to reduce upload size/latency.
            // Only when the endpoint truly was silence; a forced cap may
            // have cut mid-speech and the tail could be real words.
            if !capped && silence_ms > self.cfg.keep_tail_ms {
                let trim_ms = silence_ms - self.cfg.keep_tail_ms;
                let trim_samples = (trim_ms as usize * self.sample_rate as usize) / 1_000;
                if trim_samples > 0 && trim_samples < self.buffer.len() {
                    let keep = self.buffer.len() - trim_samples;
                    self.buffer.truncate(keep);
                }
            }
            std::mem::take(&mut self.buffer)
        };

        info!(
            speech_ms,
            silence_ms,
            samples = pcm.len(),
            capped,
            dropped,
            "Utterance finalize"
        );

        let utt = Utterance {
            pcm,
            sample_rate: self.sample_rate,
            speech_ms,
            silence_ms,
            capped,
            dropped,
        };
        self.reset();
        SegmentEvent::Finalized(utt)
    }

    fn reset(&mut self) {
        self.in_speech = false;
        self.speech_ms = 0;
        self.silence_ms = 0;
        self.buffer.clear();
        self.streamed_samples = 0;
        self.drop_pending = false;
        self.pre_roll.clear();
    }

    fn push_pre_roll(&mut self, pcm: &[i16]) {
        if self.pre_roll_cap == 0 {
            return;
        }
        self.pre_roll.extend(pcm.iter().copied());
        while self.pre_roll.len() > self.pre_roll_cap {
            self.pre_roll.pop_front();
        }
    }

    fn take_pre_roll(&mut self) -> Vec<i16> {
        self.pre_roll.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 16_000;
    const FRAME: usize = 512; // 32ms

    fn seg(mode: EndpointMode) -> Segmenter {
        Segmenter::new(SegmenterConfig::default(), RATE, mode)
    }

    fn speech_frame() -> Vec<i16> {
        vec![2_000; FRAME]
    }

    fn silence_frame() -> Vec<i16> {
        vec![0; FRAME]
    }

    fn push_n(s: &mut Segmenter, frame: &[i16], vad: bool, n: usize) -> Vec<SegmentEvent> {
        let mut all = Vec::new();
        for _ in 0..n {
            all.extend(s.push_frame(frame, vad).events);
        }
        all
    }

    fn finalized(events: Vec<SegmentEvent>) -> Option<Utterance> {
        events.into_iter().find_map(|e| match e {
            SegmentEvent::Finalized(u) => Some(u),
            _ => None,
        })
    }

    #[test]
    fn natural_finalize_trims_tail_to_margin() {
        let mut s = seg(EndpointMode::Batch);
        // 10 speech frames (320ms), then silence until the 450ms endpoint
        // fires at the 15th silent frame (480ms).
        push_n(&mut s, &speech_frame(), true, 10);
        let utt = finalized(push_n(&mut s, &silence_frame(), false, 15)).unwrap();

        assert_eq!(utt.speech_ms, 320);
        assert_eq!(utt.silence_ms, 480);
        assert!(!utt.capped);
        // 25 frames buffered, tail trimmed from 480ms down to 200ms.
        let trim_samples = (280 * RATE as usize) / 1_000;
        assert_eq!(utt.pcm.len(), 25 * FRAME - trim_samples);
        assert!(!s.is_active());
    }

    #[test]
    fn never_finalizes_below_min_speech() {
        let cfg = SegmenterConfig {
            max_utterance_ms: 2_000,
            ..SegmenterConfig::default()
        };
        let mut s = Segmenter::new(cfg, RATE, EndpointMode::Batch);

        // 160ms of speech, then enough silence to blow past the cap.
        push_n(&mut s, &speech_frame(), true, 5);
        let events = push_n(&mut s, &silence_frame(), false, 100);

        assert!(events
            .iter()
            .all(|e| !matches!(e, SegmentEvent::Finalized(_))));
        assert!(events.iter().any(|e| matches!(e, SegmentEvent::Cancelled)));
        assert!(!s.is_active());
    }

    #[test]
    fn resumed_speech_forgives_pauses() {
        let mut s = seg(EndpointMode::Batch);
        push_n(&mut s, &speech_frame(), true, 10); // 320ms speech
        push_n(&mut s, &silence_frame(), false, 13); // 416ms, under endpoint
        push_n(&mut s, &speech_frame(), true, 1); // pause forgiven
        let events = push_n(&mut s, &silence_frame(), false, 13);
        assert!(finalized(events).is_none());

        let utt = finalized(push_n(&mut s, &silence_frame(), false, 2)).unwrap();
        assert_eq!(utt.silence_ms, 480);
    }

    #[test]
    fn pre_roll_stays_bounded() {
        let mut s = seg(EndpointMode::Batch);
        push_n(&mut s, &silence_frame(), false, 100);
        let cap = (200 * RATE as usize) / 1_000;
        assert!(s.pre_roll_len() <= cap);
        assert_eq!(s.pre_roll_len(), cap); // full after 3.2s of history
    }

    #[test]
    fn batch_pre_roll_lands_in_buffer() {
        let mut s = seg(EndpointMode::Batch);
        push_n(&mut s, &silence_frame(), false, 4); // 2048 samples of history
        push_n(&mut s, &speech_frame(), true, 10);
        let utt = finalized(push_n(&mut s, &silence_frame(), false, 15)).unwrap();

        let trim_samples = (280 * RATE as usize) / 1_000;
        assert_eq!(utt.pcm.len(), 4 * FRAME + 25 * FRAME - trim_samples);
    }

    #[test]
    fn streaming_flushes_pre_roll_ahead_of_first_chunk() {
        let mut s = seg(EndpointMode::Streaming);
        push_n(&mut s, &silence_frame(), false, 4);
        let events = s.push_frame(&speech_frame(), true).events;

        assert!(matches!(events[0], SegmentEvent::Started));
        match &events[1] {
            SegmentEvent::Audio { pcm } => assert_eq!(pcm.len(), 4 * FRAME),
            other => panic!("expected pre-roll audio, got {:?}", other),
        }
        match &events[2] {
            SegmentEvent::Audio { pcm } => assert_eq!(pcm.len(), FRAME),
            other => panic!("expected frame audio, got {:?}", other),
        }
    }

    #[test]
    fn hard_cap_skips_tail_trim() {
        let cfg = SegmenterConfig {
            max_utterance_ms: 1_000,
            ..SegmenterConfig::default()
        };
        let mut s = Segmenter::new(cfg, RATE, EndpointMode::Batch);

        // Continuous speech; the cap fires at 1024ms (32nd frame).
        let utt = finalized(push_n(&mut s, &speech_frame(), true, 40)).unwrap();
        assert!(utt.capped);
        assert_eq!(utt.pcm.len(), 32 * FRAME);
        assert_eq!(utt.speech_ms, 1_024);
    }

    #[test]
    fn streaming_counts_shipped_samples_against_cap() {
        let cfg = SegmenterConfig {
            max_pcm_ms: 1_000,
            ..SegmenterConfig::default()
        };
        let mut s = Segmenter::new(cfg, RATE, EndpointMode::Streaming);

        let events = push_n(&mut s, &speech_frame(), true, 40);
        let utt = finalized(events).unwrap();
        assert!(utt.capped);
        assert!(utt.pcm.is_empty());
    }

    #[test]
    fn dropped_utterance_finalizes_empty() {
        let mut s = seg(EndpointMode::Batch);
        push_n(&mut s, &speech_frame(), true, 10);
        s.mark_dropped();
        let utt = finalized(push_n(&mut s, &silence_frame(), false, 15)).unwrap();
        assert!(utt.dropped);
        assert!(utt.pcm.is_empty());
    }

    #[test]
    fn abort_clears_open_utterance() {
        let mut s = seg(EndpointMode::Batch);
        push_n(&mut s, &speech_frame(), true, 3);
        assert!(s.is_active());
        assert!(s.abort_current());
        assert!(!s.is_active());
        assert_eq!(s.pre_roll_len(), 0);
        assert!(!s.abort_current());
    }

    #[test]
    fn energy_gate_vetoes_vad_flag() {
        let cfg = SegmenterConfig {
            energy_gate_mean_abs: 500,
            ..SegmenterConfig::default()
        };
        let mut s = Segmenter::new(cfg, RATE, EndpointMode::Batch);

        // VAD says speech but the frame is too quiet to clear the gate.
        let quiet = vec![100i16; FRAME];
        let result = s.push_frame(&quiet, true);
        assert!(!result.speech);
        assert!(!s.is_active());

        let result = s.push_frame(&speech_frame(), true);
        assert!(result.speech);
        assert!(s.is_active());
    }
}
