/// GPU architectures with a known L2 cache line size.
///
/// The discriminant is the architecture id carried in every wave header.
#[derive(
    strum::FromRepr,
    strum::EnumString,
    strum::AsRefStr,
    strum::EnumIter,
    Debug,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum Architecture {
    Gfx906 = 1,
    Gfx908 = 2,
    Gfx90a = 3,
    Gfx940 = 4,
    Gfx941 = 5,
    Gfx942 = 6,
}

/// Cache line size used for report metadata when the architecture is unknown.
pub const DEFAULT_CACHE_LINE_SIZE: u32 = 128;

impl Architecture {
    /// Architecture for an id from a wave header.
    ///
    /// Id 0 and ids beyond the table are unsupported hardware.
    #[must_use]
    pub fn from_id(id: u8) -> Option<Self> {
        Self::from_repr(id)
    }

    /// Architecture from a device architecture name.
    ///
    /// Target feature suffixes such as `gfx90a:sramecc+:xnack-` are ignored.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let base = name.split(':').next().unwrap_or_default().trim();
        base.parse().ok()
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Gfx906 => "gfx906",
            Self::Gfx908 => "gfx908",
            Self::Gfx90a => "gfx90a",
            Self::Gfx940 => "gfx940",
            Self::Gfx941 => "gfx941",
            Self::Gfx942 => "gfx942",
        }
    }

    /// L2 cache line size in bytes.
    #[must_use]
    pub fn l2_cache_line_size(self) -> u32 {
        match self {
            Self::Gfx906 | Self::Gfx908 => 64,
            Self::Gfx90a | Self::Gfx940 | Self::Gfx941 | Self::Gfx942 => 128,
        }
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// L2 cache line size for an architecture id, or 0 if the hardware is unsupported.
#[must_use]
pub fn l2_cache_line_size(arch_id: u8) -> u32 {
    Architecture::from_id(arch_id).map_or(0, Architecture::l2_cache_line_size)
}

#[cfg(test)]
mod tests {
    use super::Architecture;
    use similar_asserts as diff;
    use strum::IntoEnumIterator;

    #[test]
    fn test_cache_line_size_table() {
        let sizes: Vec<_> = (0..=7).map(super::l2_cache_line_size).collect();
        diff::assert_eq!(have: sizes, want: vec![0, 64, 64, 128, 128, 128, 128, 0]);
    }

    #[test]
    fn test_from_name_strips_target_features() {
        diff::assert_eq!(
            have: Architecture::from_name("gfx90a:sramecc+:xnack-"),
            want: Some(Architecture::Gfx90a),
        );
        diff::assert_eq!(have: Architecture::from_name("gfx1100"), want: None);
    }

    #[test]
    fn test_names_round_trip() {
        for arch in Architecture::iter() {
            diff::assert_eq!(have: Architecture::from_name(arch.name()), want: Some(arch));
            diff::assert_eq!(have: arch.as_ref(), want: arch.name());
        }
    }
}
