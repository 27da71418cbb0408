/*
Row table with N secondary indexes over a pair of sub-files.

Header sub-file layout
Offset  Size    Description
0       32      table header (magic 0xFDB7AB1E)
32      var     one descriptor per index:
                (name, index file id, key count, key types, key offset)
..      var     fixed-width row slots from data_begin to data_end

A row slot is one concatenated copy of every index's key components
(integers inline, strings as interned ids) followed by a u32 pointer
into the data sub-file, where the payload lives as (size, bytes). A
data pointer of 0xFFFFFFFF tombstones the slot; tombstones are reused
when a later insert's fingerprint collides with them.

Each index maps fingerprint(keys) -> row slot offset in its own B-tree.
Fingerprints can collide, so every candidate is confirmed against the
stored key prefix before it counts as a hit.
*/

use anyhow::{bail, Result};
use itertools::process_results;
use log::debug;
use std::rc::Rc;

use crate::btree::BTree;
use crate::index::{fingerprint, key_width, keys_equal, write_keys, KeyType, KeyValue};
use crate::pager::{FileSystem, FormatError, PageId};
use crate::subfile::FileHandle;

pub const TABLE_MAGIC: u32 = 0xFDB7_AB1E;

const TABLE_HEADER_SIZE: u32 = 32;
const INVALID_DATA_INDEX: u32 = !0;
const DEAD_MAGIC: u32 = 0xDEAD_DEAD;

struct TableHeader {
    magic: u32,
    num_indices: i32,
    data_begin: u32,
    data_end: u32,
    num_rows: i32,
    row_data_offset: i32,
    data_file_id: PageId,
    // reserved; written but never consumed
    free_list: u32,
}

impl TableHeader {
    fn to_bytes(&self) -> [u8; TABLE_HEADER_SIZE as usize] {
        let mut bytes = [0u8; TABLE_HEADER_SIZE as usize];
        bytes[0..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.num_indices.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.data_begin.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.data_end.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.num_rows.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.row_data_offset.to_le_bytes());
        bytes[24..28].copy_from_slice(&self.data_file_id.to_le_bytes());
        bytes[28..32].copy_from_slice(&self.free_list.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8; TABLE_HEADER_SIZE as usize]) -> TableHeader {
        let word =
            |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        TableHeader {
            magic: word(0),
            num_indices: word(4) as i32,
            data_begin: word(8),
            data_end: word(12),
            num_rows: word(16) as i32,
            row_data_offset: word(20) as i32,
            data_file_id: word(24),
            free_list: word(28),
        }
    }
}

struct TableIndex {
    file: FileHandle,
    tree: BTree,
    key_types: Vec<KeyType>,
    key_offset: i32,
}

pub struct Table {
    file: FileHandle,
    data_file: FileHandle,
    header: TableHeader,
    // creation order is the row-slot layout order
    indices: Vec<(String, TableIndex)>,
    // dropped last so the file system outlives the handles above
    fs: Rc<FileSystem>,
}

impl Table {
    pub(crate) fn init(
        fs: Rc<FileSystem>,
        file: FileHandle,
        index_key_types: &[(&str, &[KeyType])],
    ) -> Result<Table> {
        if index_key_types.is_empty() {
            bail!("a table needs at least one index");
        }

        let mut header = TableHeader {
            magic: TABLE_MAGIC,
            num_indices: 0,
            data_begin: 0,
            data_end: 0,
            num_rows: 0,
            row_data_offset: 0,
            data_file_id: 0,
            free_list: INVALID_DATA_INDEX,
        };

        let mut indices = Vec::with_capacity(index_key_types.len());
        let mut key_offset = 0i32;
        for (name, key_types) in index_key_types {
            if key_types.is_empty() {
                bail!("index {name:?} has no key components");
            }
            let index_file = fs.create_file()?;
            let tree = BTree::init(index_file.clone())?;
            indices.push((
                name.to_string(),
                TableIndex {
                    file: index_file,
                    tree,
                    key_types: key_types.to_vec(),
                    key_offset,
                },
            ));
            key_offset += key_width(key_types) as i32;
        }
        header.row_data_offset = key_offset;

        {
            let mut out = file.borrow_mut();
            out.seek_write(TABLE_HEADER_SIZE)?;
            for (name, index) in &indices {
                out.write_string(name)?;
                out.write_u32(index.file.borrow().id())?;
                out.write_i32(index.key_types.len() as i32)?;
                for key_type in &index.key_types {
                    out.write(&[key_type.as_u8()])?;
                }
                out.write_i32(index.key_offset)?;
            }
            header.data_begin = out.tell_write();
            header.data_end = header.data_begin;
        }
        header.num_indices = indices.len() as i32;

        let data_file = fs.create_file()?;
        header.data_file_id = data_file.borrow().id();

        let mut table = Table {
            fs,
            file,
            data_file,
            header,
            indices,
        };
        table.flush_header()?;
        Ok(table)
    }

    pub(crate) fn open(fs: Rc<FileSystem>, file: FileHandle) -> Result<Table> {
        let header = {
            let mut input = file.borrow_mut();
            input.seek_read(0)?;
            let mut bytes = [0u8; TABLE_HEADER_SIZE as usize];
            input.read(&mut bytes)?;
            TableHeader::from_bytes(&bytes)
        };
        if header.magic != TABLE_MAGIC {
            return Err(FormatError::BadMagic {
                expected: TABLE_MAGIC,
                found: header.magic,
            }
            .into());
        }

        let indices: Vec<(String, TableIndex)> = {
            let mut input = file.borrow_mut();
            process_results(
                (0..header.num_indices).map(|_| -> Result<(String, TableIndex)> {
                    let name = input.read_string()?;
                    let id = input.read_u32()?;

                    let key_count = input.read_i32()?;
                    let mut key_types = Vec::with_capacity(key_count.max(0) as usize);
                    for _ in 0..key_count {
                        let mut raw = [0u8; 1];
                        input.read(&mut raw)?;
                        match KeyType::from_u8(raw[0]) {
                            Some(key_type) => key_types.push(key_type),
                            None => bail!("index {name:?} has unknown key type {}", raw[0]),
                        }
                    }
                    let key_offset = input.read_i32()?;

                    let index_file = fs.open_file(id)?;
                    let tree = BTree::open(index_file.clone())?;
                    Ok((
                        name,
                        TableIndex {
                            file: index_file,
                            tree,
                            key_types,
                            key_offset,
                        },
                    ))
                }),
                |entries| entries.collect(),
            )?
        };

        let data_file = fs.open_file(header.data_file_id)?;
        Ok(Table {
            fs,
            file,
            data_file,
            header,
            indices,
        })
    }

    pub fn num_rows(&self) -> i32 {
        self.header.num_rows
    }

    // Insert a row under its keys. With `unique`, an existing live row
    // matching any index's key tuple rejects the insert. A tombstoned
    // slot surfaced by a fingerprint collision is reused in place.
    pub fn add_row(
        &mut self,
        keys_per_index: &[(&str, &[KeyValue])],
        payload: &[u8],
        unique: bool,
    ) -> Result<bool> {
        let mut reserved: Option<u32> = None;

        for (name, keys) in keys_per_index {
            let at = self.position(name)?;
            let hash = self.fingerprint_for(&self.indices[at].1, keys, false)?;
            let slots = self.indices[at].1.tree.find(hash)?;

            let mut candidate = None;
            let entry = &self.indices[at].1;
            for slot in slots {
                if self.is_row_valid(slot)? {
                    if !self.keys_equal(slot, entry, keys)? {
                        continue;
                    }
                    if unique {
                        return Ok(false);
                    }
                } else if candidate.is_none() {
                    candidate = Some(slot);
                }
            }

            if let Some(slot) = candidate {
                match reserved {
                    None => reserved = Some(slot),
                    // every index must surface the same dead slot, or the
                    // indexes disagree about the table's contents
                    Some(agreed) => debug_assert_eq!(agreed, slot),
                }
            }
        }

        if let Some(slot) = reserved {
            debug!("reusing tombstoned row slot {slot}");
            let data_ptr = self.write_data(payload)?;
            self.write_row_at(slot, keys_per_index, data_ptr)?;
            self.header.num_rows += 1;
            self.flush_header()?;
        } else {
            let data_ptr = self.write_data(payload)?;
            let slot = self.append_row(keys_per_index, data_ptr)?;
            for (name, keys) in keys_per_index {
                let at = self.position(name)?;
                let hash = self.fingerprint_for(&self.indices[at].1, keys, true)?;
                self.indices[at].1.tree.insert(hash, slot)?;
            }
        }
        Ok(true)
    }

    // Convenience for string payloads: (count: i32, UTF-16 code units).
    pub fn add_row_str(
        &mut self,
        keys_per_index: &[(&str, &[KeyValue])],
        value: &str,
        unique: bool,
    ) -> Result<bool> {
        self.add_row(keys_per_index, &encode_str_payload(value), unique)
    }

    // Every live row whose key tuple matches, payloads in slot order of
    // the index's candidate list.
    pub fn find(&mut self, index: &str, keys: &[KeyValue]) -> Result<Vec<Vec<u8>>> {
        let at = self.position(index)?;
        let hash = self.fingerprint_for(&self.indices[at].1, keys, false)?;
        let slots = self.indices[at].1.tree.find(hash)?;

        let entry = &self.indices[at].1;
        let mut rows = Vec::new();
        for slot in slots {
            if !self.keys_equal(slot, entry, keys)? {
                continue;
            }
            if let Some(data) = self.read_row_data(slot)? {
                rows.push(data);
            }
        }
        Ok(rows)
    }

    // Visit matching payloads until the visitor answers true; returns
    // whether it ever did.
    pub fn find_one(
        &mut self,
        index: &str,
        keys: &[KeyValue],
        mut visit: impl FnMut(&[u8]) -> bool,
    ) -> Result<bool> {
        let at = self.position(index)?;
        let hash = self.fingerprint_for(&self.indices[at].1, keys, false)?;

        let file = self.file.clone();
        let data_file = self.data_file.clone();
        let text = self.fs.static_text()?;
        let row_offset = self.header.row_data_offset as u32;

        let entry = &mut self.indices[at].1;
        let key_offset = entry.key_offset as u32;
        let key_types = entry.key_types.clone();
        entry.tree.find_one(hash, |slot| {
            let mut file = file.borrow_mut();
            file.seek_read(slot + key_offset)?;
            {
                let mut text = text.borrow_mut();
                if !keys_equal(&mut file, keys, &key_types, &mut text)? {
                    return Ok(false);
                }
            }

            file.seek_read(slot + row_offset)?;
            let data_ptr = file.read_u32()?;
            if data_ptr == INVALID_DATA_INDEX {
                return Ok(false);
            }
            drop(file);

            let mut data_file = data_file.borrow_mut();
            data_file.seek_read(data_ptr)?;
            let size = data_file.read_i32()?;
            if size < 0 {
                bail!("row payload has negative size {size}");
            }
            let mut data = vec![0u8; size as usize];
            data_file.read(&mut data)?;
            Ok(visit(&data))
        })
    }

    pub fn find_one_bytes(&mut self, index: &str, keys: &[KeyValue]) -> Result<Option<Vec<u8>>> {
        let mut found = None;
        self.find_one(index, keys, |data| {
            found = Some(data.to_vec());
            true
        })?;
        Ok(found)
    }

    pub fn find_one_str(&mut self, index: &str, keys: &[KeyValue]) -> Result<Option<String>> {
        let mut found = None;
        self.find_one(index, keys, |data| {
            found = decode_str_payload(data);
            true
        })?;
        Ok(found)
    }

    // Point the matching rows at a freshly appended payload. The old
    // payload bytes are left behind; the data sub-file never reclaims.
    pub fn update_row(&mut self, index: &str, keys: &[KeyValue], payload: &[u8]) -> Result<bool> {
        let at = self.position(index)?;
        let hash = self.fingerprint_for(&self.indices[at].1, keys, false)?;
        let slots = self.indices[at].1.tree.find(hash)?;

        let mut updated = false;
        for slot in slots {
            if !self.is_row_valid(slot)? {
                continue;
            }
            let entry = &self.indices[at].1;
            if !self.keys_equal(slot, entry, keys)? {
                continue;
            }

            let data_ptr = self.write_data(payload)?;
            let mut file = self.file.borrow_mut();
            file.seek_write(slot + self.header.row_data_offset as u32)?;
            file.write_u32(data_ptr)?;
            updated = true;
        }
        Ok(updated)
    }

    // Tombstone the matching rows. The slots stay behind for reuse by a
    // later insert whose fingerprint finds them.
    pub fn remove_row(&mut self, index: &str, keys: &[KeyValue]) -> Result<bool> {
        let at = self.position(index)?;
        let hash = self.fingerprint_for(&self.indices[at].1, keys, false)?;
        let slots = self.indices[at].1.tree.find(hash)?;

        let mut removed = 0;
        for slot in slots {
            if !self.is_row_valid(slot)? {
                continue;
            }
            let entry = &self.indices[at].1;
            if !self.keys_equal(slot, entry, keys)? {
                continue;
            }

            let mut file = self.file.borrow_mut();
            file.seek_write(slot + self.header.row_data_offset as u32)?;
            file.write_u32(INVALID_DATA_INDEX)?;
            removed += 1;
        }

        if removed > 0 {
            self.header.num_rows -= removed;
            self.flush_header()?;
        }
        Ok(removed > 0)
    }

    // Every live payload, in row-slot order.
    pub fn get_rows(&mut self) -> Result<Vec<Vec<u8>>> {
        let stride = self.header.row_data_offset as u32 + 4;
        let mut rows = Vec::with_capacity(self.header.num_rows.max(0) as usize);

        let mut slot = self.header.data_begin;
        while slot < self.header.data_end {
            if let Some(data) = self.read_row_data(slot)? {
                rows.push(data);
            }
            slot += stride;
        }
        Ok(rows)
    }

    // Drop the table's storage: header file, data file, and every index
    // file go back to the page allocator.
    pub(crate) fn delete(&mut self) -> Result<()> {
        self.header.magic = DEAD_MAGIC;
        self.flush_header()?;

        self.file.borrow_mut().delete()?;
        self.data_file.borrow_mut().delete()?;
        for (_, index) in self.indices.drain(..) {
            index.file.borrow_mut().delete()?;
        }
        Ok(())
    }

    fn position(&self, index: &str) -> Result<usize> {
        match self.indices.iter().position(|(name, _)| name == index) {
            Some(at) => Ok(at),
            None => bail!("table has no index named {index:?}"),
        }
    }

    fn fingerprint_for(&self, entry: &TableIndex, keys: &[KeyValue], create: bool) -> Result<i64> {
        let text = self.fs.static_text()?;
        let mut text = text.borrow_mut();
        fingerprint(keys, &entry.key_types, &mut text, create)
    }

    fn is_row_valid(&self, slot: u32) -> Result<bool> {
        let mut file = self.file.borrow_mut();
        file.seek_read(slot + self.header.row_data_offset as u32)?;
        Ok(file.read_u32()? != INVALID_DATA_INDEX)
    }

    fn keys_equal(&self, slot: u32, entry: &TableIndex, keys: &[KeyValue]) -> Result<bool> {
        let text = self.fs.static_text()?;
        let mut text = text.borrow_mut();
        let mut file = self.file.borrow_mut();
        file.seek_read(slot + entry.key_offset as u32)?;
        keys_equal(&mut file, keys, &entry.key_types, &mut text)
    }

    fn read_row_data(&self, slot: u32) -> Result<Option<Vec<u8>>> {
        let data_ptr = {
            let mut file = self.file.borrow_mut();
            file.seek_read(slot + self.header.row_data_offset as u32)?;
            file.read_u32()?
        };
        if data_ptr == INVALID_DATA_INDEX {
            return Ok(None);
        }

        let mut data_file = self.data_file.borrow_mut();
        data_file.seek_read(data_ptr)?;
        let size = data_file.read_i32()?;
        if size < 0 {
            bail!("row payload has negative size {size}");
        }
        let mut data = vec![0u8; size as usize];
        data_file.read(&mut data)?;
        Ok(Some(data))
    }

    // Append (size, bytes) to the data sub-file, returning its offset.
    fn write_data(&self, payload: &[u8]) -> Result<u32> {
        let mut data_file = self.data_file.borrow_mut();
        let data_ptr = data_file.size();
        data_file.seek_write(data_ptr)?;
        data_file.write_i32(payload.len() as i32)?;
        data_file.write(payload)?;
        Ok(data_ptr)
    }

    fn write_row_at(
        &self,
        slot: u32,
        keys_per_index: &[(&str, &[KeyValue])],
        data_ptr: u32,
    ) -> Result<()> {
        let text = self.fs.static_text()?;
        for (name, keys) in keys_per_index {
            let at = self.position(name)?;
            let entry = &self.indices[at].1;

            let mut file = self.file.borrow_mut();
            file.seek_write(slot + entry.key_offset as u32)?;
            let mut text = text.borrow_mut();
            write_keys(&mut file, keys, &entry.key_types, &mut text)?;
        }

        let mut file = self.file.borrow_mut();
        file.seek_write(slot + self.header.row_data_offset as u32)?;
        file.write_u32(data_ptr)
    }

    fn append_row(&mut self, keys_per_index: &[(&str, &[KeyValue])], data_ptr: u32) -> Result<u32> {
        let slot = self.header.data_end;
        self.write_row_at(slot, keys_per_index, data_ptr)?;
        self.header.num_rows += 1;
        self.header.data_end = slot + self.header.row_data_offset as u32 + 4;
        self.flush_header()?;
        Ok(slot)
    }

    fn flush_header(&mut self) -> Result<()> {
        let mut file = self.file.borrow_mut();
        file.seek_write(0)?;
        file.write(&self.header.to_bytes())
    }
}

fn encode_str_payload(value: &str) -> Vec<u8> {
    let units: Vec<u16> = value.encode_utf16().collect();
    let mut data = Vec::with_capacity(4 + units.len() * 2);
    data.extend_from_slice(&(units.len() as i32).to_le_bytes());
    for unit in units {
        data.extend_from_slice(&unit.to_le_bytes());
    }
    data
}

fn decode_str_payload(data: &[u8]) -> Option<String> {
    if data.len() < 4 {
        return None;
    }
    let count = i32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if count < 0 || 4 + count as usize * 2 > data.len() {
        return None;
    }
    let units: Vec<u16> = data[4..4 + count as usize * 2]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).ok()
}
