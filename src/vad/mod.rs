//! Voice activity helpers.
//!
//! The wake/command classifier stack annotates frames with a speech flag;
//! this module only supplies the energy measure layered on top of it (the
//! segmenter's gate, and the desktop front-end's stand-in flag).

pub mod energy;
