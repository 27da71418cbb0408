/*
Key model for table indexes: heterogeneous tuples of 64-bit integers and
interned strings, with a fixed inline width per component (8 bytes for an
integer, 4 for a string id). The fingerprint of a key tuple is the i64
that goes into an index's B-tree:
 - single integer component: the integer itself
 - single string component: the interned id, widened
 - multiple components: combined 32-bit component hashes, widened

Fingerprints may collide, so every lookup confirms candidates by reading
the row's key prefix back and comparing component-wise.
*/

use anyhow::{bail, Result};

use crate::subfile::SubFile;
use crate::text::{string_hash32, StaticText, NOT_FOUND};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyType {
    Int,
    Str,
}

impl KeyType {
    pub fn from_u8(value: u8) -> Option<KeyType> {
        match value {
            1 => Some(KeyType::Int),
            2 => Some(KeyType::Str),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            KeyType::Int => 1,
            KeyType::Str => 2,
        }
    }

    // inline width of this component inside a row slot
    pub fn width(self) -> u32 {
        match self {
            KeyType::Int => 8,
            KeyType::Str => 4,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum KeyValue {
    Int(i64),
    Str(String),
}

impl KeyValue {
    fn matches(&self, key_type: KeyType) -> bool {
        matches!(
            (self, key_type),
            (KeyValue::Int(_), KeyType::Int) | (KeyValue::Str(_), KeyType::Str)
        )
    }

    fn hash32(&self) -> u32 {
        match self {
            KeyValue::Int(value) => (*value as u64 ^ (*value as u64) >> 32) as u32,
            KeyValue::Str(value) => string_hash32(value),
        }
    }
}

impl From<i64> for KeyValue {
    fn from(value: i64) -> KeyValue {
        KeyValue::Int(value)
    }
}

impl From<&str> for KeyValue {
    fn from(value: &str) -> KeyValue {
        KeyValue::Str(value.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(value: String) -> KeyValue {
        KeyValue::Str(value)
    }
}

pub fn key_width(types: &[KeyType]) -> u32 {
    types.iter().map(|key_type| key_type.width()).sum()
}

fn check_types(keys: &[KeyValue], types: &[KeyType]) -> Result<()> {
    if keys.len() != types.len() {
        bail!(
            "key has {} components, index expects {}",
            keys.len(),
            types.len()
        );
    }
    for (key, &key_type) in keys.iter().zip(types) {
        if !key.matches(key_type) {
            bail!("key component {key:?} does not match declared type {key_type:?}");
        }
    }
    Ok(())
}

fn hash_combine(seed: u32, hash: u32) -> u32 {
    seed ^ hash
        .wrapping_add(0x9E37_79B9)
        .wrapping_add(seed << 6)
        .wrapping_add(seed >> 2)
}

// The i64 a key tuple indexes under. `create` interns unseen strings
// (write path); lookups leave the interner untouched, so a never-seen
// string simply misses.
pub fn fingerprint(
    keys: &[KeyValue],
    types: &[KeyType],
    text: &mut StaticText,
    create: bool,
) -> Result<i64> {
    check_types(keys, types)?;
    if keys.len() == 1 {
        match &keys[0] {
            KeyValue::Int(value) => return Ok(*value),
            KeyValue::Str(value) => {
                let id = if create {
                    text.find_or_create(value)?
                } else {
                    text.find(value)?
                };
                return Ok(id as i64);
            }
        }
    }

    let mut hash = keys[0].hash32();
    for key in &keys[1..] {
        hash = hash_combine(hash, key.hash32());
    }
    Ok(hash as i64)
}

// Write the key components at the file's current write position,
// integers inline and strings as their interned ids.
pub fn write_keys(
    file: &mut SubFile,
    keys: &[KeyValue],
    types: &[KeyType],
    text: &mut StaticText,
) -> Result<()> {
    check_types(keys, types)?;
    for key in keys {
        match key {
            KeyValue::Int(value) => file.write_i64(*value)?,
            KeyValue::Str(value) => file.write_u32(text.find_or_create(value)?)?,
        }
    }
    Ok(())
}

pub fn read_keys(
    file: &mut SubFile,
    types: &[KeyType],
    text: &mut StaticText,
) -> Result<Vec<KeyValue>> {
    let mut keys = Vec::with_capacity(types.len());
    for key_type in types {
        keys.push(match key_type {
            KeyType::Int => KeyValue::Int(file.read_i64()?),
            KeyType::Str => {
                let id = file.read_u32()?;
                match text.get(id)? {
                    Some(value) => KeyValue::Str(value),
                    None => bail!("row references unknown interned string {id}"),
                }
            }
        });
    }
    Ok(keys)
}

// Component-wise comparison of a stored key prefix (at the file's current
// read position) against a query tuple.
pub fn keys_equal(
    file: &mut SubFile,
    keys: &[KeyValue],
    types: &[KeyType],
    text: &mut StaticText,
) -> Result<bool> {
    check_types(keys, types)?;
    for key in keys {
        match key {
            KeyValue::Int(expected) => {
                if file.read_i64()? != *expected {
                    return Ok(false);
                }
            }
            KeyValue::Str(expected) => {
                let id = file.read_u32()?;
                if id == NOT_FOUND {
                    return Ok(false);
                }
                match text.get(id)? {
                    Some(stored) if stored == *expected => {}
                    _ => return Ok(false),
                }
            }
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use crate::pager::FileSystem;
    use std::path::Path;

    #[test]
    fn key_widths_are_fixed_per_type() {
        assert_eq!(key_width(&[KeyType::Int]), 8);
        assert_eq!(key_width(&[KeyType::Str]), 4);
        assert_eq!(key_width(&[KeyType::Int, KeyType::Str, KeyType::Int]), 20);
    }

    #[test]
    fn single_int_fingerprint_is_the_integer() {
        let fs = FileSystem::open(Path::new("unused"), false, BackendKind::Memory).unwrap();
        let text = fs.static_text().unwrap();
        let mut text = text.borrow_mut();

        for value in [-5i64, 0, 1, i64::MAX] {
            let fp = fingerprint(&[KeyValue::Int(value)], &[KeyType::Int], &mut text, false)
                .unwrap();
            assert_eq!(fp, value);
        }
    }

    #[test]
    fn single_string_fingerprint_is_the_interned_id() {
        let fs = FileSystem::open(Path::new("unused"), false, BackendKind::Memory).unwrap();
        let text = fs.static_text().unwrap();
        let mut text = text.borrow_mut();

        // lookup before interning misses
        let missing = fingerprint(
            &[KeyValue::from("pearl")],
            &[KeyType::Str],
            &mut text,
            false,
        )
        .unwrap();
        assert_eq!(missing, NOT_FOUND as i64);

        let created =
            fingerprint(&[KeyValue::from("pearl")], &[KeyType::Str], &mut text, true).unwrap();
        assert_eq!(created, text.find("pearl").unwrap() as i64);
    }

    #[test]
    fn key_prefix_round_trips_and_compares() {
        let fs = FileSystem::open(Path::new("unused"), false, BackendKind::Memory).unwrap();
        let text = fs.static_text().unwrap();
        let mut text = text.borrow_mut();
        let file = fs.create_file().unwrap();
        let mut file = file.borrow_mut();

        let types = [KeyType::Int, KeyType::Str];
        let keys = [KeyValue::Int(99), KeyValue::from("tag")];
        file.seek_write(0).unwrap();
        write_keys(&mut file, &keys, &types, &mut text).unwrap();

        file.seek_read(0).unwrap();
        assert_eq!(read_keys(&mut file, &types, &mut text).unwrap(), keys);

        file.seek_read(0).unwrap();
        assert!(keys_equal(&mut file, &keys, &types, &mut text).unwrap());

        let other = [KeyValue::Int(99), KeyValue::from("other")];
        file.seek_read(0).unwrap();
        assert!(!keys_equal(&mut file, &other, &types, &mut text).unwrap());
    }

    #[test]
    fn mismatched_key_types_are_rejected() {
        let fs = FileSystem::open(Path::new("unused"), false, BackendKind::Memory).unwrap();
        let text = fs.static_text().unwrap();
        let mut text = text.borrow_mut();

        assert!(fingerprint(&[KeyValue::Int(1)], &[KeyType::Str], &mut text, false).is_err());
        assert!(fingerprint(&[KeyValue::Int(1)], &[], &mut text, false).is_err());
    }
}
