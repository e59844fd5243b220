use crate::errors::{ErrorKind, Result};
use rand::Rng;
use std::cmp::Ordering;
use std::fmt;

/// Length, in bytes, of a U160 identifier.
pub const ID_LEN: usize = 20;

/// An opaque 160-bit value stored big-endian, used both as a DHT node id
/// and as a torrent info-hash.
///
/// Total order is lexicographic on bytes, which doubles as the order used
/// to compare XOR distances: the XOR of two ids is itself represented as a
/// `U160` and compared the same way.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct U160([u8; ID_LEN]);

impl U160 {
    pub const ZERO: U160 = U160([0u8; ID_LEN]);

    /// Builds a `U160` uniformly at random.
    pub fn random() -> U160 {
        let mut bytes = [0u8; ID_LEN];
        rand::thread_rng().fill(&mut bytes);
        U160(bytes)
    }

    /// Builds a `U160` whose high `prefix_len` bits equal `prefix`'s, and
    /// whose remaining low bits are uniformly random.
    pub fn random_from_prefix(prefix: &U160, prefix_len: u32) -> U160 {
        let mut bytes = [0u8; ID_LEN];
        rand::thread_rng().fill(&mut bytes);
        let mut out = U160(bytes);
        for i in 0..prefix_len.min(ID_LEN as u32 * 8) {
            out.set_msb(i, prefix.msb(i));
        }
        out
    }

    /// `fake(target, prefix_len)`: low `prefix_len` bits come from `self`,
    /// high bits come from `target`. Used to spoof a sender id whose
    /// leading bits match a lookup target (see `fake_id` in the DHT engine).
    pub fn fake(&self, target: &U160, prefix_len: u32) -> U160 {
        let total_bits = ID_LEN as u32 * 8;
        let mut out = *self;
        for i in prefix_len..total_bits {
            out.set_bit(i, target.bit(i));
        }
        out
    }

    pub fn from_raw_bytes(bytes: &[u8]) -> Result<U160> {
        if bytes.len() != ID_LEN {
            return Err(ErrorKind::InvalidLength.into());
        }
        let mut out = [0u8; ID_LEN];
        out.copy_from_slice(bytes);
        Ok(U160(out))
    }

    pub fn from_array(bytes: [u8; ID_LEN]) -> U160 {
        U160(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn from_hex(s: &str) -> Result<U160> {
        if s.len() != ID_LEN * 2 {
            return Err(ErrorKind::InvalidFormat.into());
        }
        let bytes = hex::decode(s).map_err(|_| ErrorKind::InvalidFormat)?;
        U160::from_raw_bytes(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Bit `i`, counting from the least-significant bit (bit 0) of the
    /// 160-bit integer, i.e. the last byte's low bit.
    pub fn bit(&self, i: u32) -> bool {
        let byte_idx = ID_LEN - 1 - (i / 8) as usize;
        let bit_idx = i % 8;
        (self.0[byte_idx] >> bit_idx) & 1 == 1
    }

    fn set_bit(&mut self, i: u32, value: bool) {
        let byte_idx = ID_LEN - 1 - (i / 8) as usize;
        let bit_idx = i % 8;
        if value {
            self.0[byte_idx] |= 1 << bit_idx;
        } else {
            self.0[byte_idx] &= !(1 << bit_idx);
        }
    }

    /// Bit `i` counting from the most-significant end (bit 0 is the
    /// leading bit of the first byte). This is the numbering used by
    /// routing-table prefixes and bucket depths.
    pub fn msb(&self, i: u32) -> bool {
        self.bit(ID_LEN as u32 * 8 - 1 - i)
    }

    fn set_msb(&mut self, i: u32, value: bool) {
        self.set_bit(ID_LEN as u32 * 8 - 1 - i, value);
    }

    /// Number of leading bits (from the most-significant end) that `self`
    /// and `other` share.
    pub fn common_prefix_length(&self, other: &U160) -> u32 {
        for i in 0..(ID_LEN as u32 * 8) {
            if self.msb(i) != other.msb(i) {
                return i;
            }
        }
        ID_LEN as u32 * 8
    }

    /// XOR distance between `self` and `other`.
    pub fn distance(&self, other: &U160) -> U160 {
        let mut out = [0u8; ID_LEN];
        for i in 0..ID_LEN {
            out[i] = self.0[i] ^ other.0[i];
        }
        U160(out)
    }

    /// `1 << r`, as a `U160` (`r` counted from the most-significant bit).
    pub fn pow2(r: u32) -> U160 {
        let mut out = U160::ZERO;
        if r < ID_LEN as u32 * 8 {
            out.set_msb(r, true);
        }
        out
    }

    /// `(1 << r) - 1`: the low `r` bits (from the most-significant end)
    /// set to one.
    pub fn pow2m1(r: u32) -> U160 {
        let mut out = U160::ZERO;
        let total = ID_LEN as u32 * 8;
        let start = total.saturating_sub(r);
        for i in start..total {
            out.set_bit(i, true);
        }
        out
    }

    /// Bitwise OR.
    pub fn or(&self, other: &U160) -> U160 {
        let mut out = [0u8; ID_LEN];
        for i in 0..ID_LEN {
            out[i] = self.0[i] | other.0[i];
        }
        U160(out)
    }

    /// Bitwise AND.
    pub fn and(&self, other: &U160) -> U160 {
        let mut out = [0u8; ID_LEN];
        for i in 0..ID_LEN {
            out[i] = self.0[i] & other.0[i];
        }
        U160(out)
    }

    /// SHA-1 of an arbitrary byte sequence, as a `U160`. Used to validate
    /// downloaded metadata against its advertised info-hash.
    pub fn sha1(data: &[u8]) -> U160 {
        use sha1::Sha1;
        let mut hasher = Sha1::new();
        hasher.update(data);
        U160(hasher.digest().bytes())
    }
}

impl Ord for U160 {
    fn cmp(&self, other: &U160) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for U160 {
    fn partial_cmp(&self, other: &U160) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for U160 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "U160({})", self.to_hex())
    }
}

impl fmt::Display for U160 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl serde::Serialize for U160 {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serde_bytes::Bytes::new(&self.0).serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for U160 {
    fn deserialize<D>(deserializer: D) -> std::result::Result<U160, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = serde_bytes::ByteBuf::deserialize(deserializer)?;
        U160::from_raw_bytes(bytes.as_ref()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let id = U160::random();
        assert_eq!(U160::from_hex(&id.to_hex()).unwrap(), id);
    }

    #[test]
    fn from_hex_rejects_wrong_length() {
        assert!(U160::from_hex("abcd").is_err());
    }

    #[test]
    fn raw_bytes_round_trip() {
        let id = U160::random();
        let again = U160::from_raw_bytes(id.as_bytes()).unwrap();
        assert_eq!(id, again);
    }

    #[test]
    fn xor_metric_identity_and_symmetry() {
        let a = U160::random();
        let b = U160::random();
        assert_eq!(a.distance(&a), U160::ZERO);
        assert_eq!(a.distance(&b), b.distance(&a));
    }

    #[test]
    fn xor_metric_triangle_inequality() {
        let a = U160::random();
        let b = U160::random();
        let c = U160::random();
        let ac = a.distance(&c);
        let ab_bc = a.distance(&b).or(&b.distance(&c));
        // bitwise: every bit set in a^c must be coverable by bits set in
        // (a^b) or (b^c); this holds because a^c == (a^b)^(b^c), and XOR's
        // result bits are a subset of the OR of its operands' bits.
        for i in 0..(ID_LEN as u32 * 8) {
            if ac.msb(i) {
                assert!(ab_bc.msb(i));
            }
        }
    }

    #[test]
    fn common_prefix_length_full_match() {
        let a = U160::random();
        assert_eq!(a.common_prefix_length(&a), 160);
    }

    #[test]
    fn common_prefix_length_example() {
        let target = U160::from_hex("0000000000000000000000000000000000000000").unwrap_or(U160::ZERO);
        let mut other = [0u8; ID_LEN];
        other[0] = 0b0111_1111;
        let other = U160::from_array(other);
        assert_eq!(target.common_prefix_length(&other), 1);
    }

    #[test]
    fn pow2_and_pow2m1() {
        assert_eq!(U160::pow2(0).msb(0), true);
        assert_eq!(U160::pow2(0).common_prefix_length(&U160::ZERO), 0);
        let mask = U160::pow2m1(8);
        for i in 0..8 {
            assert!(mask.msb(152 + i));
        }
    }

    #[test]
    fn random_from_prefix_matches_prefix() {
        let target = U160::random();
        let sample = U160::random_from_prefix(&target, 40);
        assert_eq!(target.common_prefix_length(&sample) >= 40, true);
    }

    #[test]
    fn fake_mixes_low_bits_from_self_and_high_from_target() {
        let target = U160::random();
        let seed = U160::random();
        let faked = seed.fake(&target, 128);
        assert_eq!(faked.common_prefix_length(&target) >= 128, true);
    }

    #[test]
    fn sha1_is_deterministic() {
        let a = U160::sha1(b"hello world");
        let b = U160::sha1(b"hello world");
        assert_eq!(a, b);
        let c = U160::sha1(b"hello worlds");
        assert_ne!(a, c);
    }
}
