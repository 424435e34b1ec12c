//! Conversions between source conventions and UV random parameters.
//!
//! Antenna numbers here are AIPS numbers (1-based). Sources index antennas
//! from 0, so AIPS number = source index + 1.

/// Encode a baseline id from two 1-based antenna numbers.
///
/// Uses `256 * a1 + a2` while `a2` fits in a byte, otherwise the miriad
/// extension `2048 * a1 + a2 + 65536`.
pub fn encode_baseline(ant1: u32, ant2: u32) -> f32 {
    let id = if ant2 > 255 {
        ant1 * 2048 + ant2 + 65_536
    } else {
        ant1 * 256 + ant2
    };
    id as f32
}

/// Decode a baseline id into its 1-based antenna numbers.
pub fn decode_baseline(baseline: f32) -> (u32, u32) {
    let bl = baseline.round() as u32;
    if bl < 65_536 {
        let ant2 = bl % 256;
        ((bl - ant2) / 256, ant2)
    } else {
        let ant2 = (bl - 65_536) % 2048;
        ((bl - ant2 - 65_536) / 2048, ant2)
    }
}

/// AIPS antenna number for a 0-based source antenna index.
pub fn aips_antenna(index: usize) -> u32 {
    index as u32 + 1
}

/// MeerKAT-style antenna name (`m000`, `m001`, ...) for an AIPS antenna number.
pub fn antenna_name(aips_number: u32) -> String {
    format!("m{:03}", aips_number.saturating_sub(1))
}

/// Convert a UVW coordinate in metres to wavelengths.
pub fn metres_to_wavelengths(metres: f64, reference_wavelength: f64) -> f32 {
    (metres / reference_wavelength) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baseline_roundtrip_small() {
        assert_eq!(encode_baseline(1, 2), 258.0);
        assert_eq!(decode_baseline(258.0), (1, 2));
        assert_eq!(decode_baseline(encode_baseline(64, 64)), (64, 64));
    }

    #[test]
    fn test_baseline_roundtrip_large_antenna() {
        let bl = encode_baseline(3, 300);
        assert_eq!(bl, (3 * 2048 + 300 + 65_536) as f32);
        assert_eq!(decode_baseline(bl), (3, 300));
    }

    #[test]
    fn test_antenna_name_uses_source_index() {
        assert_eq!(aips_antenna(0), 1);
        assert_eq!(antenna_name(1), "m000");
        assert_eq!(antenna_name(64), "m063");
    }

    #[test]
    fn test_metres_to_wavelengths() {
        // 21 cm
        let wl = metres_to_wavelengths(210.0, 0.21);
        assert!((wl - 1000.0).abs() < 1e-3);
    }
}
