//! Speaker/channel layouts for sources and mixing destinations.

/// Maximum channel count a source or destination may carry.
pub const MAX_CHANNELS: usize = 8;

/// Channel layout of a source or a mixing destination.
///
/// Channel orderings:
/// - `Mono`: C
/// - `Stereo`: L, R
/// - `Quad`: FL, FR, BL, BR
/// - `Surround51` (SMPTE): FL, FR, FC, LFE, BL, BR
/// - `Surround71` (SMPTE): FL, FR, FC, LFE, BL, BR, SL, SR
/// - `AmbisonicsFirstOrder` (ACN): W, Y, Z, X
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ChannelLayout {
    Mono,
    Stereo,
    Quad,
    Surround51,
    Surround71,
    AmbisonicsFirstOrder,
}

impl ChannelLayout {
    #[inline]
    pub const fn num_channels(self) -> usize {
        match self {
            Self::Mono => 1,
            Self::Stereo => 2,
            Self::Quad => 4,
            Self::Surround51 => 6,
            Self::Surround71 => 8,
            Self::AmbisonicsFirstOrder => 4,
        }
    }

    /// Index of the LFE channel, if the layout carries one.
    #[inline]
    pub const fn lfe_channel(self) -> Option<usize> {
        match self {
            Self::Surround51 | Self::Surround71 => Some(3),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Mono => "Mono",
            Self::Stereo => "Stereo",
            Self::Quad => "Quad",
            Self::Surround51 => "5.1",
            Self::Surround71 => "7.1",
            Self::AmbisonicsFirstOrder => "Ambisonics (FOA)",
        }
    }

    pub fn all() -> [ChannelLayout; 6] {
        [
            Self::Mono,
            Self::Stereo,
            Self::Quad,
            Self::Surround51,
            Self::Surround71,
            Self::AmbisonicsFirstOrder,
        ]
    }
}

impl Default for ChannelLayout {
    fn default() -> Self {
        Self::Stereo
    }
}
