//! Lock-free SPSC ring buffer for audio samples.
//!
//! Uses the `ringbuf` crate to provide a single-producer single-consumer
//! buffer suitable for passing 16-bit samples between an audio callback or
//! network reader and a consumer thread without locks. The capture ring and
//! the playback stream ring are both built on this pair.

use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapRb,
};

/// Default capacity: ~10 seconds of 16 kHz mono audio.
const DEFAULT_CAPACITY: usize = 160_000;

/// Producer half, owned by the writer's thread.
pub struct AudioProducer {
    inner: ringbuf::HeapProd<i16>,
}

/// Consumer half, owned by the reader's thread.
pub struct AudioConsumer {
    inner: ringbuf::HeapCons<i16>,
}

/// Create a matched producer/consumer pair backed by a lock-free ring buffer.
pub fn audio_ring_buffer(capacity: Option<usize>) -> (AudioProducer, AudioConsumer) {
    let cap = capacity.unwrap_or(DEFAULT_CAPACITY);
    let rb = HeapRb::<i16>::new(cap);
    let (prod, cons) = rb.split();
    (AudioProducer { inner: prod }, AudioConsumer { inner: cons })
}

impl AudioProducer {
    /// Push a slice of samples into the ring buffer.
    /// Returns the number of samples actually written (may be less than
    /// `samples.len()` if the buffer is full).
    pub fn push_slice(&mut self, samples: &[i16]) -> usize {
        self.inner.push_slice(samples)
    }

    /// Free slots remaining.
    pub fn vacant(&self) -> usize {
        self.inner.vacant_len()
    }
}

// Safety: the producer half has a single owner; it moves into the audio
// callback thread and is never shared.
unsafe impl Send for AudioProducer {}

impl AudioConsumer {
    /// Pop up to `buf.len()` samples from the ring buffer into `buf`.
    /// Returns the number of samples actually read.
    pub fn pop_slice(&mut self, buf: &mut [i16]) -> usize {
        self.inner.pop_slice(buf)
    }

    /// Number of samples currently available for reading.
    pub fn available(&self) -> usize {
        self.inner.occupied_len()
    }

    /// Drain all available samples into a Vec.
    pub fn drain_all(&mut self) -> Vec<i16> {
        let n = self.available();
        if n == 0 {
            return Vec::new();
        }
        let mut buf = vec![0i16; n];
        let read = self.pop_slice(&mut buf);
        buf.truncate(read);
        buf
    }
}

unsafe impl Send for AudioConsumer {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_round_trip() {
        let (mut prod, mut cons) = audio_ring_buffer(Some(8));
        assert_eq!(prod.push_slice(&[1, 2, 3]), 3);
        assert_eq!(cons.available(), 3);
        let mut out = [0i16; 3];
        assert_eq!(cons.pop_slice(&mut out), 3);
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn full_ring_takes_partial_write() {
        let (mut prod, mut cons) = audio_ring_buffer(Some(4));
        assert_eq!(prod.push_slice(&[1, 2, 3, 4, 5, 6]), 4);
        assert_eq!(cons.drain_all(), vec![1, 2, 3, 4]);
    }
}
