/*
Paged file system: multiplexes many logical sub-files onto one host file.

Host file layout
Offset          Size    Description
0               48      catalog sub-file header (magic 0xF11E), page 0
page boundary   16384   pages, allocated on demand

The 12-byte file-system header (named-file count, page high-water mark,
free-list head) lives at virtual offset 0 of the catalog sub-file, i.e.
inside the catalog's first data page, followed by one (name, head page)
entry per named sub-file. Free pages form a singly linked chain: the
first 4 bytes of a free page hold the id of the next free page.
*/

use anyhow::{anyhow, bail, Result};
use log::debug;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::{Rc, Weak};
use thiserror::Error;

use crate::backend::{open_backend, Backend, BackendKind};
use crate::subfile::{FileHandle, SubFile, SUB_FILE_HEADER_SIZE};
use crate::text::StaticText;

pub type PageId = u32;

pub const FILE_PAGE_SIZE: u32 = 16 * 1024;
pub const PAGE_ID_INVALID: PageId = !0;
pub const SINGLE_FILE_INDEX_PAGE_COUNT: usize = 8;

pub const FILE_SYSTEM_HEADER_SIZE: u32 = 12;

pub fn page_offset(id: PageId) -> u32 {
    id * FILE_PAGE_SIZE
}

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("bad magic number: expected {expected:#x}, found {found:#x}")]
    BadMagic { expected: u32, found: u32 },
    #[error("sub-file is limited to {0} index pages")]
    SubFileOverflow(usize),
    #[error("database is opened read-only")]
    ReadOnly,
}

pub struct FsHeader {
    pub named_file_count: u32,
    pub page_count: u32,
    pub free_list: PageId,
}

impl FsHeader {
    fn to_bytes(&self) -> [u8; FILE_SYSTEM_HEADER_SIZE as usize] {
        let mut bytes = [0u8; FILE_SYSTEM_HEADER_SIZE as usize];
        bytes[0..4].copy_from_slice(&self.named_file_count.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.page_count.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.free_list.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8; FILE_SYSTEM_HEADER_SIZE as usize]) -> FsHeader {
        FsHeader {
            named_file_count: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            page_count: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            free_list: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        }
    }
}

// Backend handle plus the allocator state. Shared by every sub-file, so
// all of them funnel their page I/O through the one host-file handle.
pub struct FsCore {
    backend: Box<dyn Backend>,
    pub header: FsHeader,
    read_only: bool,
}

impl FsCore {
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn read_at(&mut self, pos: u32, buf: &mut [u8]) -> Result<()> {
        self.backend.read_at(pos, buf)
    }

    pub fn write_at(&mut self, pos: u32, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(FormatError::ReadOnly.into());
        }
        self.backend.write_at(pos, buf)
    }

    pub fn read_page(&mut self, id: PageId, offset: u32, buf: &mut [u8]) -> Result<()> {
        debug_assert!(offset as usize + buf.len() <= FILE_PAGE_SIZE as usize);
        self.read_at(page_offset(id) + offset, buf)
    }

    pub fn write_page(&mut self, id: PageId, offset: u32, buf: &[u8]) -> Result<()> {
        debug_assert!(offset as usize + buf.len() <= FILE_PAGE_SIZE as usize);
        self.write_at(page_offset(id) + offset, buf)
    }

    // Pop the free list, or extend the high-water mark. The fresh page is
    // filled (0xCD in debug builds, zero otherwise) so stale data from a
    // recycled life never leaks through.
    pub fn new_page(&mut self) -> Result<PageId> {
        if self.read_only {
            return Err(FormatError::ReadOnly.into());
        }

        let id = if self.header.free_list != PAGE_ID_INVALID {
            let mut next = [0u8; 4];
            self.backend
                .read_at(page_offset(self.header.free_list), &mut next)?;
            let id = self.header.free_list;
            self.header.free_list = u32::from_le_bytes(next);
            id
        } else {
            let id = self.header.page_count;
            self.header.page_count += 1;
            id
        };

        let fill = if cfg!(debug_assertions) { 0xCD } else { 0x00 };
        let block = vec![fill; FILE_PAGE_SIZE as usize];
        self.backend.write_at(page_offset(id), &block)?;

        debug!("allocated page {id}");
        Ok(id)
    }

    // Prepend to the free list; the page's first 4 bytes become the link.
    pub fn recycle_page(&mut self, id: PageId) -> Result<()> {
        if id == PAGE_ID_INVALID {
            return Ok(());
        }

        self.write_at(page_offset(id), &self.header.free_list.to_le_bytes())?;
        self.header.free_list = id;
        debug!("recycled page {id}");
        Ok(())
    }
}

pub struct FileSystem {
    core: Rc<RefCell<FsCore>>,
    files: RefCell<HashMap<PageId, Weak<RefCell<SubFile>>>>,
    named: RefCell<HashMap<String, PageId>>,
    head: RefCell<Option<FileHandle>>,
    text: RefCell<Option<Rc<RefCell<StaticText>>>>,
}

impl FileSystem {
    pub fn open(path: &Path, read_only: bool, kind: BackendKind) -> Result<Rc<FileSystem>> {
        let is_new = kind == BackendKind::Memory || !path.exists();
        if read_only && is_new {
            bail!("cannot open missing database {} read-only", path.display());
        }

        let backend = open_backend(kind, path, read_only, false)?;
        let fs = Rc::new(FileSystem {
            core: Rc::new(RefCell::new(FsCore {
                backend,
                header: FsHeader {
                    named_file_count: 0,
                    page_count: 0,
                    free_list: PAGE_ID_INVALID,
                },
                read_only,
            })),
            files: RefCell::new(HashMap::new()),
            named: RefCell::new(HashMap::new()),
            head: RefCell::new(None),
            text: RefCell::new(None),
        });

        if is_new {
            fs.init_fresh()?;
        } else {
            match fs.open_existing() {
                Ok(()) => {}
                Err(err) if !read_only => {
                    // unreadable catalog on a writable open: start the file over
                    log::warn!("reinitializing unreadable database: {err:#}");
                    fs.core.borrow_mut().backend = open_backend(kind, path, false, true)?;
                    fs.named.borrow_mut().clear();
                    fs.init_fresh()?;
                }
                Err(err) => return Err(err),
            }
        }

        let text = StaticText::open_or_create(&fs)?;
        *fs.text.borrow_mut() = Some(Rc::new(RefCell::new(text)));

        Ok(fs)
    }

    fn init_fresh(&self) -> Result<()> {
        self.core.borrow_mut().header = FsHeader {
            named_file_count: 0,
            page_count: 0,
            free_list: PAGE_ID_INVALID,
        };
        let head_page = self.core.borrow_mut().new_page()?;
        debug_assert_eq!(head_page, 0);
        let head = SubFile::init(self.core.clone(), head_page)?;
        let head = Rc::new(RefCell::new(head));
        self.files
            .borrow_mut()
            .insert(head_page, Rc::downgrade(&head));
        *self.head.borrow_mut() = Some(head);
        self.flush_header()
    }

    fn open_existing(&self) -> Result<()> {
        let head = self.open_file(0)?;
        {
            let mut head = head.borrow_mut();
            head.seek_read(0)?;
            let mut bytes = [0u8; FILE_SYSTEM_HEADER_SIZE as usize];
            head.read(&mut bytes)?;
            self.core.borrow_mut().header = FsHeader::from_bytes(&bytes);

            let count = self.core.borrow().header.named_file_count;
            let mut named = self.named.borrow_mut();
            for _ in 0..count {
                let name = head.read_string()?;
                let id = head.read_u32()?;
                named.insert(name, id);
            }
        }
        *self.head.borrow_mut() = Some(head);
        Ok(())
    }

    pub fn core(&self) -> &Rc<RefCell<FsCore>> {
        &self.core
    }

    pub fn is_read_only(&self) -> bool {
        self.core.borrow().read_only
    }

    pub fn static_text(&self) -> Result<Rc<RefCell<StaticText>>> {
        self.text
            .borrow()
            .clone()
            .ok_or_else(|| anyhow!("string interner is not initialized"))
    }

    // At most one live handle exists per head page; re-opening an open
    // sub-file hands back the same handle with its cursors rewound.
    pub fn open_file(&self, id: PageId) -> Result<FileHandle> {
        if let Some(existing) = self.files.borrow().get(&id).and_then(Weak::upgrade) {
            existing.borrow_mut().rewind();
            return Ok(existing);
        }

        let file = Rc::new(RefCell::new(SubFile::open(self.core.clone(), id)?));
        self.files.borrow_mut().insert(id, Rc::downgrade(&file));
        Ok(file)
    }

    pub fn open_named(&self, name: &str) -> Result<Option<FileHandle>> {
        let id = match self.named.borrow().get(name) {
            Some(&id) => id,
            None => return Ok(None),
        };
        Ok(Some(self.open_file(id)?))
    }

    pub fn create_file(&self) -> Result<FileHandle> {
        let id = self.core.borrow_mut().new_page()?;
        let file = Rc::new(RefCell::new(SubFile::init(self.core.clone(), id)?));
        self.files.borrow_mut().insert(id, Rc::downgrade(&file));
        self.flush_header()?;
        Ok(file)
    }

    pub fn create_named(&self, name: &str) -> Result<FileHandle> {
        if self.named.borrow().contains_key(name) {
            bail!("named sub-file {name:?} already exists");
        }

        let file = self.create_file()?;
        let id = file.borrow().id();
        self.named.borrow_mut().insert(name.to_string(), id);

        {
            let mut core = self.core.borrow_mut();
            core.header.named_file_count += 1;
        }
        if let Some(head) = self.head.borrow().as_ref() {
            let mut head = head.borrow_mut();
            let end = head.size();
            head.seek_write(end)?;
            head.write_string(name)?;
            head.write_u32(id)?;
        }
        self.flush_header()?;

        debug!("created named sub-file {name:?} at page {id}");
        Ok(file)
    }

    pub fn flush_header(&self) -> Result<()> {
        if self.is_read_only() {
            return Ok(());
        }
        if let Some(head) = self.head.borrow().as_ref() {
            let bytes = self.core.borrow().header.to_bytes();
            let mut head = head.borrow_mut();
            head.seek_write(0)?;
            head.write(&bytes)?;
        }
        Ok(())
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        // the interner goes first so its sub-file headers flush while the
        // backend is still owned
        self.text.borrow_mut().take();

        if !self.is_read_only() {
            if let Err(err) = self.flush_header() {
                log::warn!("failed to flush file-system header on close: {err:#}");
            }
        }
        self.head.borrow_mut().take();

        debug_assert!(
            self.files
                .borrow()
                .values()
                .all(|file| file.upgrade().is_none()),
            "sub-file handle still open at file-system close"
        );
    }
}

const _: () = assert!(SUB_FILE_HEADER_SIZE == 16 + 4 * SINGLE_FILE_INDEX_PAGE_COUNT as u32);

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_fs() -> Rc<FileSystem> {
        FileSystem::open(Path::new("unused"), false, BackendKind::Memory).unwrap()
    }

    #[test]
    fn fresh_file_system_has_catalog_on_page_zero() {
        let fs = memory_fs();
        let head = fs.open_file(0).unwrap();
        assert_eq!(head.borrow().id(), 0);
    }

    #[test]
    fn named_files_are_unique_and_reopenable() {
        let fs = memory_fs();
        let file = fs.create_named("alpha").unwrap();
        let id = file.borrow().id();

        assert!(fs.create_named("alpha").is_err());
        let again = fs.open_named("alpha").unwrap().unwrap();
        assert_eq!(again.borrow().id(), id);
        assert!(fs.open_named("missing").unwrap().is_none());
    }

    #[test]
    fn open_file_returns_the_live_handle() {
        let fs = memory_fs();
        let file = fs.create_named("beta").unwrap();
        let id = file.borrow().id();

        let other = fs.open_file(id).unwrap();
        assert!(Rc::ptr_eq(&file, &other));
    }

    #[test]
    fn recycled_pages_are_reused_before_growth() {
        let fs = memory_fs();
        let file = fs.create_file().unwrap();
        let head_page = file.borrow().id();
        let data_page = file.borrow().data_page(0);
        file.borrow_mut().delete().unwrap();
        drop(file);

        // free list is LIFO: the most recently recycled page comes back first
        let first = fs.core().borrow_mut().new_page().unwrap();
        let second = fs.core().borrow_mut().new_page().unwrap();
        assert_eq!(first, data_page);
        assert_eq!(second, head_page);
    }
}
