/*
Disk-resident B-tree multi-map (i64 key -> list of u32 values), stored
entirely inside one sub-file. One node per virtual 16 KiB page of that
sub-file; the tree header occupies virtual page 0.

Node page layout

    | node header | key count | keys ... | data heads ... | children ... |

Offset  Size        Description
0       4           parent node (PAGE_ID_INVALID at the root)
4       4           index of this node in its parent's child array
8       1           leaf flag
9       4           key count
13      8*(M-1)     keys, strictly sorted, first key_count valid
..      8*(M-1)     (value, next) data head per key
..      4*M         children, first key_count+1 valid on internal nodes

M = 16384 / (8 + 8 + 4) - 1 = 818. Duplicate values of one key never add
tree keys; they extend that key's singly linked cell chain, bump-allocated
in dedicated data pages starting at root_data_page. `next` pointers are
virtual byte offsets into the tree's sub-file.
*/

use anyhow::{bail, Result};
use log::debug;

use crate::pager::{FormatError, FILE_PAGE_SIZE, PAGE_ID_INVALID};
use crate::subfile::FileHandle;

pub const BTREE_MAGIC: u32 = 0xFB7CEE;

const KEY_SIZE: usize = 8;
const DATA_SIZE: usize = 8;
const CHILD_SIZE: usize = 4;

pub const M: usize = FILE_PAGE_SIZE as usize / (KEY_SIZE + DATA_SIZE + CHILD_SIZE) - 1;
pub const MAX_NUM_KEYS: usize = M - 1;

const NODE_HEADER_SIZE: u32 = 9;
const KEY_BEGIN: u32 = NODE_HEADER_SIZE + 4;
const DATA_BEGIN: u32 = KEY_BEGIN + (MAX_NUM_KEYS * KEY_SIZE) as u32;
const CHILD_BEGIN: u32 = DATA_BEGIN + (MAX_NUM_KEYS * DATA_SIZE) as u32;
const MAX_SPACE_USAGE: u32 = CHILD_BEGIN + (M * CHILD_SIZE) as u32;

const TREE_HEADER_SIZE: usize = 20;

const INVALID: u32 = PAGE_ID_INVALID;

const _: () = assert!(MAX_SPACE_USAGE <= FILE_PAGE_SIZE);

fn node_offset(node: u32) -> u32 {
    node * FILE_PAGE_SIZE
}

#[derive(Clone, Copy)]
struct NodeHeader {
    parent: u32,
    index: i32,
    is_leaf: bool,
}

#[derive(Clone, Copy)]
struct DataCell {
    value: u32,
    next: u32,
}

struct TreeHeader {
    magic: u32,
    root_data_page: u32,
    data_end: u32,
    root_node: u32,
    page_count: u32,
}

impl TreeHeader {
    fn to_bytes(&self) -> [u8; TREE_HEADER_SIZE] {
        let mut bytes = [0u8; TREE_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.root_data_page.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.data_end.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.root_node.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.page_count.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8; TREE_HEADER_SIZE]) -> TreeHeader {
        let word =
            |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        TreeHeader {
            magic: word(0),
            root_data_page: word(4),
            data_end: word(8),
            root_node: word(12),
            page_count: word(16),
        }
    }
}

pub struct BTree {
    file: FileHandle,
    header: TreeHeader,
    // the root's key vector is memoized so every lookup starts without I/O
    root_keys: Vec<i64>,
}

impl BTree {
    pub fn init(file: FileHandle) -> Result<BTree> {
        let mut tree = BTree {
            file,
            header: TreeHeader {
                magic: BTREE_MAGIC,
                root_data_page: 0,
                data_end: 0,
                root_node: 0,
                page_count: 0,
            },
            root_keys: Vec::new(),
        };

        tree.header.root_data_page = tree.create_page()?;
        tree.header.data_end = node_offset(tree.header.root_data_page);
        tree.header.root_node = tree.create_node(INVALID, 0, true)?;
        tree.flush_header()?;
        Ok(tree)
    }

    pub fn open(file: FileHandle) -> Result<BTree> {
        let mut bytes = [0u8; TREE_HEADER_SIZE];
        {
            let mut file = file.borrow_mut();
            file.seek_read(0)?;
            file.read(&mut bytes)?;
        }
        let header = TreeHeader::from_bytes(&bytes);
        if header.magic != BTREE_MAGIC {
            return Err(FormatError::BadMagic {
                expected: BTREE_MAGIC,
                found: header.magic,
            }
            .into());
        }

        let mut tree = BTree {
            file,
            header,
            root_keys: Vec::new(),
        };
        tree.root_keys = tree.get_keys(tree.header.root_node)?;
        Ok(tree)
    }

    // All duplicates for one key, in insertion order.
    pub fn find(&mut self, key: i64) -> Result<Vec<u32>> {
        let mut values = Vec::new();
        match self.find_slot(key)? {
            Some((node, index)) => {
                self.get_data(node, index, |value| {
                    values.push(value);
                    Ok(false)
                })?;
                Ok(values)
            }
            None => Ok(values),
        }
    }

    // Visit the key's duplicates in insertion order until the visitor
    // answers true. Returns whether it ever did.
    pub fn find_one(&mut self, key: i64, visit: impl FnMut(u32) -> Result<bool>) -> Result<bool> {
        match self.find_slot(key)? {
            Some((node, index)) => self.get_data(node, index, visit),
            None => Ok(false),
        }
    }

    pub fn insert(&mut self, key: i64, value: u32) -> Result<()> {
        let mut keys = self.root_keys.clone();
        let mut node = self.header.root_node;
        loop {
            let bound = keys.partition_point(|&existing| existing < key);
            if bound < keys.len() && keys[bound] == key {
                // duplicate: extend the overflow chain, no new tree key
                return self.insert_data(node, bound, value);
            }

            let next = self.get_next_node(node, bound)?;
            if next != INVALID {
                node = next;
                keys = self.get_keys(node)?;
                continue;
            }

            // at a leaf
            if keys.len() + 1 >= M {
                let mid = keys.len() / 2;
                let goes_left = key < keys[mid];
                let (left, right) = self.split(node)?;
                if goes_left {
                    self.insert_to_node(left, bound, key, value, INVALID, INVALID)?;
                } else {
                    self.insert_to_node(right, bound - mid - 1, key, value, INVALID, INVALID)?;
                }
            } else {
                self.insert_to_node(node, bound, key, value, INVALID, INVALID)?;
            }
            return Ok(());
        }
    }

    // Descend from the memoized root keys to the node holding `key`.
    fn find_slot(&mut self, key: i64) -> Result<Option<(u32, usize)>> {
        let mut keys = self.root_keys.clone();
        let mut node = self.header.root_node;
        loop {
            if keys.is_empty() {
                return Ok(None);
            }
            let index = keys.partition_point(|&existing| existing < key);
            if index < keys.len() && keys[index] == key {
                return Ok(Some((node, index)));
            }

            node = self.get_next_node(node, index)?;
            if node == INVALID {
                return Ok(None);
            }
            keys = self.get_keys(node)?;
        }
    }

    fn get_data(
        &mut self,
        node: u32,
        index: usize,
        mut visit: impl FnMut(u32) -> Result<bool>,
    ) -> Result<bool> {
        let count = self.read_key_count(node)?;
        if index >= count {
            return Ok(false);
        }

        let mut pos = node_offset(node) + DATA_BEGIN + (index * DATA_SIZE) as u32;
        loop {
            let cell = self.read_cell_at(pos)?;
            if visit(cell.value)? {
                return Ok(true);
            }
            if cell.next == INVALID {
                return Ok(false);
            }
            pos = cell.next;
        }
    }

    fn get_keys(&mut self, node: u32) -> Result<Vec<i64>> {
        let count = self.read_key_count(node)?;
        self.read_keys_at(node_offset(node) + KEY_BEGIN, count)
    }

    fn read_key_count(&mut self, node: u32) -> Result<usize> {
        let count = self.read_i32_at(node_offset(node) + NODE_HEADER_SIZE)?;
        if count < 0 || count as usize > MAX_NUM_KEYS {
            bail!("b-tree node {node} has corrupt key count {count}");
        }
        Ok(count as usize)
    }

    fn get_next_node(&mut self, node: u32, index: usize) -> Result<u32> {
        let header = self.read_node_header(node)?;
        let count = self.read_key_count(node)?;
        if header.is_leaf || count == 0 || count + 1 < index {
            return Ok(INVALID);
        }

        self.read_u32_at(node_offset(node) + CHILD_BEGIN + (index * CHILD_SIZE) as u32)
    }

    // Insert (key, data head) at `pos`, shifting the tail of the node
    // right by one. `right_node` is the new right sibling when the
    // insertion comes from a child split; the shifted successors get
    // their index_in_parent restamped.
    fn insert_to_node(
        &mut self,
        node: u32,
        pos: usize,
        key: i64,
        data: u32,
        next: u32,
        right_node: u32,
    ) -> Result<()> {
        let begin = node_offset(node);
        let count = self.read_key_count(node)?;
        debug_assert!(pos <= count);
        self.write_i32_at(begin + NODE_HEADER_SIZE, count as i32 + 1)?;

        let shifted = count - pos;
        let key_begin = begin + KEY_BEGIN + (pos * KEY_SIZE) as u32;
        let mut keys = vec![key];
        keys.extend(self.read_keys_at(key_begin, shifted)?);
        self.write_keys_at(key_begin, &keys)?;

        let data_begin = begin + DATA_BEGIN + (pos * DATA_SIZE) as u32;
        let mut cells = vec![DataCell { value: data, next }];
        cells.extend(self.read_cells_at(data_begin, shifted)?);
        self.write_cells_at(data_begin, &cells)?;
        debug_assert!(data_begin + (cells.len() * DATA_SIZE) as u32 <= begin + MAX_SPACE_USAGE);

        if node == self.header.root_node {
            self.root_keys = self.get_keys(node)?;
        }

        if right_node == INVALID {
            return Ok(());
        }

        let child_begin = begin + CHILD_BEGIN + ((pos + 1) * CHILD_SIZE) as u32;
        let tail_children = self.read_children_at(child_begin, shifted)?;

        if let Some(&first) = tail_children.first() {
            // the shifted children all move one slot right; their headers
            // share parent and leafness, so one read seeds the restamp
            let mut header = self.read_node_header(first)?;
            for &child in &tail_children {
                header.index += 1;
                self.write_node_header(child, header)?;
            }
        }

        let mut children = vec![right_node];
        children.extend_from_slice(&tail_children);
        self.write_children_at(child_begin, &children)?;
        debug_assert!(child_begin + (children.len() * CHILD_SIZE) as u32 <= begin + MAX_SPACE_USAGE);
        Ok(())
    }

    // Append a duplicate: walk to the chain tail, hang a fresh cell off it.
    fn insert_data(&mut self, node: u32, pos: usize, value: u32) -> Result<()> {
        let mut cursor = node_offset(node) + DATA_BEGIN + (pos * DATA_SIZE) as u32;
        loop {
            let cell = self.read_cell_at(cursor)?;
            if cell.next != INVALID {
                cursor = cell.next;
                continue;
            }

            let tail = self.add_data(value)?;
            self.write_cell_at(
                cursor,
                DataCell {
                    value: cell.value,
                    next: tail,
                },
            )?;
            return Ok(());
        }
    }

    // Bump-allocate a chain cell in the tree's data region.
    fn add_data(&mut self, value: u32) -> Result<u32> {
        let cell_pos = self.header.data_end;
        self.header.data_end += DATA_SIZE as u32;
        self.write_cell_at(
            cell_pos,
            DataCell {
                value,
                next: INVALID,
            },
        )?;

        if self.header.data_end % FILE_PAGE_SIZE == 0 {
            let page = self.create_page()?;
            self.header.data_end = node_offset(page);
        }

        self.flush_header()?;
        Ok(cell_pos)
    }

    // Median split. The left half stays in place, the right half moves to
    // a fresh node, and the median key is promoted to the parent
    // (creating a new root when the split node was the root).
    fn split(&mut self, node: u32) -> Result<(u32, u32)> {
        let node_header = self.read_node_header(node)?;
        let count = self.read_key_count(node)?;
        debug_assert_eq!(count, MAX_NUM_KEYS);
        let mid = MAX_NUM_KEYS / 2;

        let begin = node_offset(node);
        let mid_key = self.read_i64_at(begin + KEY_BEGIN + (mid * KEY_SIZE) as u32)?;
        let mid_cell = self.read_cell_at(begin + DATA_BEGIN + (mid * DATA_SIZE) as u32)?;

        // the left half keeps the first `mid` keys in place
        self.write_i32_at(begin + NODE_HEADER_SIZE, mid as i32)?;
        let left = node;

        let tail = count - mid - 1;
        let right_keys = self.read_keys_at(begin + KEY_BEGIN + ((mid + 1) * KEY_SIZE) as u32, tail)?;
        let right_cells =
            self.read_cells_at(begin + DATA_BEGIN + ((mid + 1) * DATA_SIZE) as u32, tail)?;
        let right_children =
            self.read_children_at(begin + CHILD_BEGIN + ((mid + 1) * CHILD_SIZE) as u32, tail + 1)?;

        debug!("splitting b-tree node {node} ({count} keys)");

        if node_header.parent == INVALID {
            // splitting the root: a new root with one key, two children
            debug_assert_eq!(node, self.header.root_node);
            let new_root = self.create_node(INVALID, 0, false)?;
            let right = self.materialize_right(
                new_root,
                1,
                node_header.is_leaf,
                &right_keys,
                &right_cells,
                &right_children,
            )?;

            let root_begin = node_offset(new_root);
            self.write_i32_at(root_begin + NODE_HEADER_SIZE, 1)?;
            self.write_keys_at(root_begin + KEY_BEGIN, &[mid_key])?;
            self.write_cells_at(root_begin + DATA_BEGIN, &[mid_cell])?;
            self.write_children_at(root_begin + CHILD_BEGIN, &[node, right])?;

            self.header.root_node = new_root;
            self.flush_header()?;
            self.root_keys = self.get_keys(new_root)?;

            self.write_node_header(
                node,
                NodeHeader {
                    parent: new_root,
                    index: 0,
                    is_leaf: node_header.is_leaf,
                },
            )?;
            return Ok((left, right));
        }

        // promote the median into the parent, splitting it first if full
        let mut parent = node_header.parent;
        let mut parent_index = node_header.index;
        let parent_keys = self.get_keys(parent)?;
        if parent_keys.len() == MAX_NUM_KEYS {
            let parent_mid = MAX_NUM_KEYS / 2;
            let goes_left = mid_key < parent_keys[parent_mid];
            let (parent_left, parent_right) = self.split(parent)?;
            if goes_left {
                parent = parent_left;
            } else {
                parent = parent_right;
                debug_assert!(parent_index as usize > parent_mid);
                parent_index -= parent_mid as i32 + 1;
            }
        }

        let right = self.materialize_right(
            parent,
            parent_index + 1,
            node_header.is_leaf,
            &right_keys,
            &right_cells,
            &right_children,
        )?;
        self.insert_to_node(
            parent,
            parent_index as usize,
            mid_key,
            mid_cell.value,
            mid_cell.next,
            right,
        )?;
        Ok((left, right))
    }

    // Build the right sibling out of the tail arrays sliced off a split
    // node; adopted children get their back-references restamped.
    fn materialize_right(
        &mut self,
        parent: u32,
        index: i32,
        is_leaf: bool,
        keys: &[i64],
        cells: &[DataCell],
        children: &[u32],
    ) -> Result<u32> {
        let right = self.create_node(parent, index, is_leaf)?;
        let begin = node_offset(right);

        self.write_i32_at(begin + NODE_HEADER_SIZE, keys.len() as i32)?;
        self.write_keys_at(begin + KEY_BEGIN, keys)?;
        self.write_cells_at(begin + DATA_BEGIN, cells)?;
        if is_leaf {
            return Ok(right);
        }

        self.write_children_at(begin + CHILD_BEGIN, children)?;
        if let Some(&first) = children.first() {
            let child_header = self.read_node_header(first)?;
            for (i, &child) in children.iter().enumerate() {
                self.write_node_header(
                    child,
                    NodeHeader {
                        parent: right,
                        index: i as i32,
                        is_leaf: child_header.is_leaf,
                    },
                )?;
            }
        }
        Ok(right)
    }

    // One tree page == one appended sub-file page; tree page ids are
    // virtual page indexes counted from 1 past the header page.
    fn create_page(&mut self) -> Result<u32> {
        self.file.borrow_mut().append_page()?;
        self.header.page_count += 1;
        let page = self.header.page_count;
        self.flush_header()?;
        Ok(page)
    }

    fn create_node(&mut self, parent: u32, index: i32, is_leaf: bool) -> Result<u32> {
        let node = self.create_page()?;
        self.write_node_header(node, NodeHeader { parent, index, is_leaf })?;
        self.write_i32_at(node_offset(node) + NODE_HEADER_SIZE, 0)?;
        Ok(node)
    }

    fn flush_header(&mut self) -> Result<()> {
        let mut file = self.file.borrow_mut();
        file.seek_write(0)?;
        file.write(&self.header.to_bytes())
    }

    fn read_node_header(&mut self, node: u32) -> Result<NodeHeader> {
        let mut bytes = [0u8; NODE_HEADER_SIZE as usize];
        self.read_exact_at(node_offset(node), &mut bytes)?;
        Ok(NodeHeader {
            parent: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            index: i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            is_leaf: bytes[8] != 0,
        })
    }

    fn write_node_header(&mut self, node: u32, header: NodeHeader) -> Result<()> {
        let mut bytes = [0u8; NODE_HEADER_SIZE as usize];
        bytes[0..4].copy_from_slice(&header.parent.to_le_bytes());
        bytes[4..8].copy_from_slice(&header.index.to_le_bytes());
        bytes[8] = header.is_leaf as u8;
        self.write_all_at(node_offset(node), &bytes)
    }

    fn read_exact_at(&mut self, pos: u32, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.borrow_mut();
        file.seek_read(pos)?;
        file.read(buf)
    }

    fn write_all_at(&mut self, pos: u32, buf: &[u8]) -> Result<()> {
        let mut file = self.file.borrow_mut();
        file.seek_write(pos)?;
        file.write(buf)
    }

    fn read_u32_at(&mut self, pos: u32) -> Result<u32> {
        let mut bytes = [0u8; 4];
        self.read_exact_at(pos, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn read_i32_at(&mut self, pos: u32) -> Result<i32> {
        let mut bytes = [0u8; 4];
        self.read_exact_at(pos, &mut bytes)?;
        Ok(i32::from_le_bytes(bytes))
    }

    fn write_i32_at(&mut self, pos: u32, value: i32) -> Result<()> {
        self.write_all_at(pos, &value.to_le_bytes())
    }

    fn read_i64_at(&mut self, pos: u32) -> Result<i64> {
        let mut bytes = [0u8; 8];
        self.read_exact_at(pos, &mut bytes)?;
        Ok(i64::from_le_bytes(bytes))
    }

    fn read_cell_at(&mut self, pos: u32) -> Result<DataCell> {
        let mut bytes = [0u8; DATA_SIZE];
        self.read_exact_at(pos, &mut bytes)?;
        Ok(DataCell {
            value: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            next: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }

    fn write_cell_at(&mut self, pos: u32, cell: DataCell) -> Result<()> {
        let mut bytes = [0u8; DATA_SIZE];
        bytes[0..4].copy_from_slice(&cell.value.to_le_bytes());
        bytes[4..8].copy_from_slice(&cell.next.to_le_bytes());
        self.write_all_at(pos, &bytes)
    }

    fn read_keys_at(&mut self, pos: u32, count: usize) -> Result<Vec<i64>> {
        let mut bytes = vec![0u8; count * KEY_SIZE];
        self.read_exact_at(pos, &mut bytes)?;
        let mut keys = Vec::with_capacity(count);
        for chunk in bytes.chunks_exact(KEY_SIZE) {
            keys.push(i64::from_le_bytes(chunk.try_into()?));
        }
        Ok(keys)
    }

    fn write_keys_at(&mut self, pos: u32, keys: &[i64]) -> Result<()> {
        let mut bytes = Vec::with_capacity(keys.len() * KEY_SIZE);
        for key in keys {
            bytes.extend_from_slice(&key.to_le_bytes());
        }
        self.write_all_at(pos, &bytes)
    }

    fn read_cells_at(&mut self, pos: u32, count: usize) -> Result<Vec<DataCell>> {
        let mut bytes = vec![0u8; count * DATA_SIZE];
        self.read_exact_at(pos, &mut bytes)?;
        let mut cells = Vec::with_capacity(count);
        for chunk in bytes.chunks_exact(DATA_SIZE) {
            cells.push(DataCell {
                value: u32::from_le_bytes(chunk[0..4].try_into()?),
                next: u32::from_le_bytes(chunk[4..8].try_into()?),
            });
        }
        Ok(cells)
    }

    fn write_cells_at(&mut self, pos: u32, cells: &[DataCell]) -> Result<()> {
        let mut bytes = Vec::with_capacity(cells.len() * DATA_SIZE);
        for cell in cells {
            bytes.extend_from_slice(&cell.value.to_le_bytes());
            bytes.extend_from_slice(&cell.next.to_le_bytes());
        }
        self.write_all_at(pos, &bytes)
    }

    fn read_children_at(&mut self, pos: u32, count: usize) -> Result<Vec<u32>> {
        let mut bytes = vec![0u8; count * CHILD_SIZE];
        self.read_exact_at(pos, &mut bytes)?;
        let mut children = Vec::with_capacity(count);
        for chunk in bytes.chunks_exact(CHILD_SIZE) {
            children.push(u32::from_le_bytes(chunk.try_into()?));
        }
        Ok(children)
    }

    fn write_children_at(&mut self, pos: u32, children: &[u32]) -> Result<()> {
        let mut bytes = Vec::with_capacity(children.len() * CHILD_SIZE);
        for child in children {
            bytes.extend_from_slice(&child.to_le_bytes());
        }
        self.write_all_at(pos, &bytes)
    }

    #[cfg(test)]
    pub(crate) fn root_key_count(&self) -> usize {
        self.root_keys.len()
    }

    // Walk every reachable node checking the structural invariants.
    #[cfg(test)]
    pub(crate) fn validate(&mut self) -> Result<()> {
        let root = self.header.root_node;
        self.validate_node(root, INVALID, 0)
    }

    #[cfg(test)]
    fn validate_node(&mut self, node: u32, parent: u32, index: i32) -> Result<()> {
        let header = self.read_node_header(node)?;
        let keys = self.get_keys(node)?;
        assert!(keys.len() <= MAX_NUM_KEYS);
        assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(header.parent, parent);
        if parent != INVALID {
            assert_eq!(header.index, index);
        }

        if header.is_leaf {
            return Ok(());
        }
        let children = self.read_children_at(node_offset(node) + CHILD_BEGIN, keys.len() + 1)?;
        for (i, &child) in children.iter().enumerate() {
            assert_ne!(child, INVALID);
            self.validate_node(child, node, i as i32)?;
        }
        Ok(())
    }
}
