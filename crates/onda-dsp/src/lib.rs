//! onda-dsp: Render-path DSP primitives for the Onda source mixer
//!
//! Allocation-free building blocks driven once per frame or block by the
//! source render pipeline:
//! - Linear parameter ramps (`Ramp`)
//! - One-pole low/high-pass filters with rampable cutoff
//! - Azimuth panning gains per speaker layout, ambisonic encode
//! - Envelope following

mod envelope;
mod filter;
mod pan;
mod ramp;

pub use envelope::*;
pub use filter::*;
pub use pan::*;
pub use ramp::*;
