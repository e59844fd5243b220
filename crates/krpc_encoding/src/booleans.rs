//! KRPC encodes booleans as the integers 0/1 rather than bencode having a
//! native boolean type; these helpers bridge that for `serde`.
use serde::{de, Deserialize, Deserializer};

pub fn is_false(value: &bool) -> bool {
    !*value
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = u8::deserialize(deserializer)?;
    match value {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(de::Error::invalid_value(
            de::Unexpected::Unsigned(other as u64),
            &"0 or 1",
        )),
    }
}
