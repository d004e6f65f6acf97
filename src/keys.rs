//! Compiled-in AES key material for the metadata regions.
//!
//! Each supported firmware version maps to five (key, IV) pairs, one per
//! metadata region type `1..=5`. Keys are AES-256 (32 bytes), IVs are 16
//! bytes, both stored here as hex. The registry is built once at first use
//! and borrowed immutably everywhere else; lookup order is exact version
//! triple, then `major.minor` prefix, then the documented default set.

use std::sync::OnceLock;

/// Number of keyed metadata region types.
pub const REGION_KEY_COUNT: usize = 5;

/// The five (key, IV) pairs for one firmware version, indexed by region type.
pub struct RegionKeySet {
    keys: [[u8; 32]; REGION_KEY_COUNT],
    ivs: [[u8; 16]; REGION_KEY_COUNT],
}

impl RegionKeySet {
    /// Key and IV for a metadata region type, or `None` outside `1..=5`.
    pub fn for_region(&self, region_type: u64) -> Option<(&[u8; 32], &[u8; 16])> {
        if (1..=REGION_KEY_COUNT as u64).contains(&region_type) {
            let i = (region_type - 1) as usize;
            Some((&self.keys[i], &self.ivs[i]))
        } else {
            None
        }
    }
}

struct VersionedSet {
    version: (u64, u64, u64),
    set: RegionKeySet,
}

// Region keys for firmware version 1.3.0, one (key, iv) pair per region
// type 1..=5.
const V1_3_0_HEX: [(&str, &str); REGION_KEY_COUNT] = [
    (
        "08ed9260dec3807aac3ec00e765186cf4b9c677601ba844f8ec3e8c2fe1e11cb",
        "0797205f6b02c0232cd2798795ba588d",
    ),
    (
        "7cec0ee7e63a703197afa8e09ce40f9b10a5fded6e5f04cb4ba7a435ed600288",
        "01c5aaae7c4001592ea6a2310364a9a1",
    ),
    (
        "76fa1a8d6663aae8b964470c384508f7f974d21af2535cd3549c7c51ed68b0e6",
        "de930fcc2c37009400e21dfa9f7d1363",
    ),
    (
        "1c37c2a0b579512481e8529532909c7c1be72f9bb5e1a4610328a5e2b67c10f4",
        "ab15d90ce88a83680a4074d5bb96d94c",
    ),
    (
        "4ae22e3ae6ff0b65d06fa18df4f99ae59e6a90cb92ca03de65b64fc0fac958ce",
        "eaaa17604ad7dae5773639c217978da5",
    ),
];

fn decode_set(pairs: &[(&str, &str); REGION_KEY_COUNT]) -> RegionKeySet {
    let mut keys = [[0u8; 32]; REGION_KEY_COUNT];
    let mut ivs = [[0u8; 16]; REGION_KEY_COUNT];
    for (i, (key_hex, iv_hex)) in pairs.iter().enumerate() {
        keys[i] = hex::decode(key_hex)
            .expect("key table hex")
            .try_into()
            .expect("key table length");
        ivs[i] = hex::decode(iv_hex)
            .expect("iv table hex")
            .try_into()
            .expect("iv table length");
    }
    RegionKeySet { keys, ivs }
}

fn registry() -> &'static [VersionedSet] {
    static REGISTRY: OnceLock<Vec<VersionedSet>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        vec![VersionedSet {
            version: (1, 3, 0),
            set: decode_set(&V1_3_0_HEX),
        }]
        // Further versions slot in here as their key sets become known.
    })
}

/// Resolve the key set for an archive version.
///
/// Returns the set together with a `used_default` hint: `true` means the
/// version was not recognized and the default (1.3.0) set was substituted,
/// which the host may surface as a warning.
pub fn lookup(major: u64, minor: u64, patch: u64) -> (&'static RegionKeySet, bool) {
    let reg = registry();
    if let Some(v) = reg.iter().find(|v| v.version == (major, minor, patch)) {
        return (&v.set, false);
    }
    if let Some(v) = reg.iter().find(|v| v.version.0 == major && v.version.1 == minor) {
        return (&v.set, false);
    }
    (&reg[0].set, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_version_match() {
        let (set, used_default) = lookup(1, 3, 0);
        assert!(!used_default);
        let (key, iv) = set.for_region(1).unwrap();
        assert_eq!(key[0], 0x08);
        assert_eq!(iv[0], 0x07);
    }

    #[test]
    fn prefix_match_is_not_a_fallback() {
        let (_, used_default) = lookup(1, 3, 9);
        assert!(!used_default);
    }

    #[test]
    fn unknown_version_falls_back_to_default() {
        let (set, used_default) = lookup(9, 9, 9);
        assert!(used_default);
        let (default_key, _) = set.for_region(5).unwrap();
        let (known_key, _) = lookup(1, 3, 0).0.for_region(5).unwrap();
        assert_eq!(default_key, known_key);
    }

    #[test]
    fn region_type_out_of_range() {
        let (set, _) = lookup(1, 3, 0);
        assert!(set.for_region(0).is_none());
        assert!(set.for_region(6).is_none());
    }
}
