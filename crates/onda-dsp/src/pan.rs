//! Azimuth panning across speaker layouts.
//!
//! Azimuth convention: degrees clockwise from front center, so 90 is the
//! listener's right. Elevation is degrees above the horizontal plane.
//! LFE channels receive no panned energy.

use onda_core::{ChannelLayout, Sample};

/// Wrap an azimuth into [0, 360).
#[inline]
pub fn normalize_azimuth(azimuth_degrees: Sample) -> Sample {
    let az = azimuth_degrees % 360.0;
    if az < 0.0 { az + 360.0 } else { az }
}

/// Left/right azimuths for a spread stereo asset.
///
/// `spread` is the world-space width of the stereo image and `distance` the
/// emitter distance; each channel lands `atan(0.5 * spread / distance)`
/// degrees to either side of the base azimuth. At zero distance the image
/// opens to the full 90 degrees per side.
pub fn stereo_spread_azimuths(
    base_azimuth: Sample,
    spread: Sample,
    distance: Sample,
) -> (Sample, Sample) {
    let offset = if spread <= 0.0 {
        0.0
    } else if distance <= 1e-4 {
        90.0
    } else {
        (0.5 * spread / distance).atan().to_degrees()
    };
    (
        normalize_azimuth(base_azimuth - offset),
        normalize_azimuth(base_azimuth + offset),
    )
}

/// Panning ring per layout: (channel index, azimuth degrees), sorted by
/// azimuth. LFE channels are absent so they stay silent.
fn speaker_ring(layout: ChannelLayout) -> &'static [(usize, Sample)] {
    match layout {
        ChannelLayout::Mono => &[(0, 0.0)],
        ChannelLayout::Stereo => &[(1, 30.0), (0, 330.0)],
        ChannelLayout::Quad => &[(1, 45.0), (3, 135.0), (2, 225.0), (0, 315.0)],
        ChannelLayout::Surround51 => &[
            (2, 0.0),
            (1, 30.0),
            (5, 110.0),
            (4, 250.0),
            (0, 330.0),
        ],
        ChannelLayout::Surround71 => &[
            (2, 0.0),
            (1, 30.0),
            (7, 90.0),
            (5, 150.0),
            (4, 210.0),
            (6, 270.0),
            (0, 330.0),
        ],
        ChannelLayout::AmbisonicsFirstOrder => &[],
    }
}

/// Equal-power panning gains for a point source at `azimuth_degrees`.
///
/// `gains` must hold `layout.num_channels()` entries; all are written.
pub fn compute_panning_gains(
    azimuth_degrees: Sample,
    layout: ChannelLayout,
    gains: &mut [Sample],
) {
    debug_assert_eq!(gains.len(), layout.num_channels());
    gains.fill(0.0);
    let az = normalize_azimuth(azimuth_degrees);

    match layout {
        ChannelLayout::Mono => gains[0] = 1.0,
        ChannelLayout::AmbisonicsFirstOrder => {
            encode_first_order_ambisonics(az, 0.0, gains);
        }
        _ => {
            let ring = speaker_ring(layout);

            // Bracketing speaker pair, wrapping past the last entry.
            let mut hi_index = ring.len();
            for (i, &(_, speaker_az)) in ring.iter().enumerate() {
                if speaker_az > az {
                    hi_index = i;
                    break;
                }
            }
            let (lo_index, hi_index) = if hi_index == 0 || hi_index == ring.len() {
                (ring.len() - 1, 0)
            } else {
                (hi_index - 1, hi_index)
            };

            let (lo_ch, lo_az) = ring[lo_index];
            let (hi_ch, hi_az) = ring[hi_index];
            if lo_ch == hi_ch {
                gains[lo_ch] = 1.0;
                return;
            }

            let span = normalize_azimuth(hi_az - lo_az);
            let frac = if span <= Sample::EPSILON {
                0.0
            } else {
                normalize_azimuth(az - lo_az) / span
            };
            let angle = frac * std::f32::consts::FRAC_PI_2;
            gains[lo_ch] = angle.cos();
            gains[hi_ch] = angle.sin();
        }
    }
}

/// First-order ambisonic encode, ACN channel order (W, Y, Z, X) with SN3D
/// normalization. Azimuth follows the engine's clockwise convention, so the
/// ambisonic-domain angle is negated.
pub fn encode_first_order_ambisonics(
    azimuth_degrees: Sample,
    elevation_degrees: Sample,
    gains: &mut [Sample],
) {
    debug_assert!(gains.len() >= 4);
    let az = -azimuth_degrees.to_radians();
    let el = elevation_degrees.to_radians();
    let cos_el = el.cos();
    gains[0] = 1.0;
    gains[1] = az.sin() * cos_el;
    gains[2] = el.sin();
    gains[3] = az.cos() * cos_el;
}
