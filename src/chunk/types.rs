//! Four-character chunk type tags

use std::fmt;

/// A chunk type: four ASCII bytes packed big-endian into a `u32`
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkType(u32);

impl ChunkType {
    pub const fn from_tag(tag: &[u8; 4]) -> Self {
        Self(u32::from_be_bytes(*tag))
    }

    pub const fn from_u32(value: u32) -> Self {
        Self(value)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Tag as text; non-printable bytes become `?`
    pub fn name(self) -> String {
        self.0
            .to_be_bytes()
            .iter()
            .map(|&b| if b.is_ascii_graphic() { b as char } else { '?' })
            .collect()
    }
}

impl fmt::Debug for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkType({})", self.name())
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_packing() {
        let hpif = ChunkType::from_tag(b"HPIF");
        assert_eq!(hpif.as_u32(), 0x4850_4946);
        assert_eq!(hpif.name(), "HPIF");
        assert_eq!(ChunkType::from_u32(0x4850_4946), hpif);
        assert_eq!(format!("{}", hpif), "HPIF");
    }

    #[test]
    fn test_unprintable_name() {
        assert_eq!(ChunkType::from_u32(0x0041_4243).name(), "?ABC");
    }
}
