/*
String interner ("static text"): every distinct string gets a stable
32-bit id, shared database-wide by all tables that use string keys.

Two well-known named sub-files back it:
 - StaticTextFile: 8-byte header (magic, count), then the raw
   length-prefixed strings. An id is the byte offset of its string.
 - StaticTextFileIndex: a B-tree keyed by a 64-bit composite string hash
   (FNV-1a low half, CRC32 high half) mapping to ids.

Hash hits are confirmed by reading the stored string back and comparing
contents, so hash collisions cost a probe, never a wrong id.
*/

use anyhow::Result;
use crate::btree::BTree;
use crate::pager::{FileSystem, FormatError};
use crate::subfile::FileHandle;

pub const NOT_FOUND: u32 = !0;

const STRINGS_FILE: &str = "StaticTextFile";
const INDEX_FILE: &str = "StaticTextFileIndex";

const TEXT_MAGIC: u32 = 0x57A7_1C27;

fn utf16_bytes(value: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(value.len() * 2);
    for unit in value.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    bytes
}

fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811C_9DC5;
    for &byte in bytes {
        hash = (hash ^ byte as u32).wrapping_mul(0x0100_0193);
    }
    hash
}

// 32-bit FNV-1a over the UTF-16 code units.
pub fn string_hash32(value: &str) -> u32 {
    fnv1a(&utf16_bytes(value))
}

// The interner's B-tree key: FNV-1a in the low word, CRC32 in the high
// word. Content comparison on lookup keeps residual collisions harmless.
pub fn composite_hash(value: &str) -> i64 {
    let bytes = utf16_bytes(value);
    (fnv1a(&bytes) as u64 | (crc32fast::hash(&bytes) as u64) << 32) as i64
}

struct TextHeader {
    magic: u32,
    count: u32,
}

pub struct StaticText {
    file: FileHandle,
    tree: BTree,
    header: TextHeader,
}

impl StaticText {
    pub(crate) fn open_or_create(fs: &FileSystem) -> Result<StaticText> {
        let (file, fresh) = match fs.open_named(STRINGS_FILE)? {
            Some(file) => (file, false),
            None => (fs.create_named(STRINGS_FILE)?, true),
        };

        let mut header = TextHeader {
            magic: TEXT_MAGIC,
            count: 0,
        };
        if fresh {
            let mut file = file.borrow_mut();
            file.seek_write(0)?;
            file.write_u32(header.magic)?;
            file.write_u32(header.count)?;
        } else {
            let mut file = file.borrow_mut();
            file.seek_read(0)?;
            header.magic = file.read_u32()?;
            header.count = file.read_u32()?;
            if header.magic != TEXT_MAGIC {
                return Err(FormatError::BadMagic {
                    expected: TEXT_MAGIC,
                    found: header.magic,
                }
                .into());
            }
        }

        let tree = match fs.open_named(INDEX_FILE)? {
            Some(index_file) => BTree::open(index_file)?,
            None => BTree::init(fs.create_named(INDEX_FILE)?)?,
        };

        Ok(StaticText { file, tree, header })
    }

    // Resolve an id back to its string. Out-of-range ids resolve to None.
    pub fn get(&mut self, id: u32) -> Result<Option<String>> {
        if id == NOT_FOUND || id >= self.file.borrow().size() {
            return Ok(None);
        }
        let mut file = self.file.borrow_mut();
        file.seek_read(id)?;
        Ok(Some(file.read_string()?))
    }

    // Non-creating lookup; NOT_FOUND when the string was never interned.
    pub fn find(&mut self, value: &str) -> Result<u32> {
        let hash = composite_hash(value);
        let file = self.file.clone();
        let mut found = NOT_FOUND;
        self.tree.find_one(hash, |id| {
            let mut file = file.borrow_mut();
            file.seek_read(id)?;
            let stored = file.read_string()?;
            if stored == value {
                found = id;
                Ok(true)
            } else {
                Ok(false)
            }
        })?;
        Ok(found)
    }

    pub fn find_or_create(&mut self, value: &str) -> Result<u32> {
        let existing = self.find(value)?;
        if existing != NOT_FOUND {
            return Ok(existing);
        }

        let id = {
            let mut file = self.file.borrow_mut();
            let id = file.size();
            file.seek_write(id)?;
            file.write_string(value)?;
            id
        };
        self.header.count += 1;
        self.flush_header()?;
        self.tree.insert(composite_hash(value), id)?;
        Ok(id)
    }

    pub fn count(&self) -> u32 {
        self.header.count
    }

    #[cfg(test)]
    pub(crate) fn strings_size(&self) -> u32 {
        self.file.borrow().size()
    }

    fn flush_header(&mut self) -> Result<()> {
        let mut file = self.file.borrow_mut();
        file.seek_write(0)?;
        file.write_u32(self.header.magic)?;
        file.write_u32(self.header.count)
    }
}
