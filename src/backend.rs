/*
Byte-addressed random-access backends underneath the paged file system.

Three variants, selected at open time:
 - Normal: forwards every transfer to the host file.
 - Memory: an array of 1 MiB chunks, never touches disk. Grows by whole
   chunks when a write crosses the current capacity.
 - Cached: interposes a flat LRU of page-sized buffers (128 x 16 KiB) in
   front of the host file. Reads are served from cache when possible;
   writes go through to disk and patch the cached copy if present.

Every operation carries its absolute position, so interleaved use by many
sub-files through one shared handle needs no cursor discipline.
*/

use anyhow::{bail, Context, Result};
use log::debug;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::lru::FlatLru;

// cache geometry of the Cached variant
const SINGLE_CACHE_SIZE: u32 = 16 * 1024;
const TOTAL_CACHE_SIZE: u32 = 2 * 1024 * 1024;

const MEMORY_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Normal,
    Memory,
    Cached,
}

pub trait Backend {
    fn read_at(&mut self, pos: u32, buf: &mut [u8]) -> Result<()>;
    fn write_at(&mut self, pos: u32, buf: &[u8]) -> Result<()>;
    fn size(&mut self) -> Result<u64>;
}

pub fn open_backend(
    kind: BackendKind,
    path: &Path,
    read_only: bool,
    truncate: bool,
) -> Result<Box<dyn Backend>> {
    Ok(match kind {
        BackendKind::Normal => Box::new(DirectBackend::open(path, read_only, truncate)?),
        BackendKind::Memory => Box::new(MemoryBackend::new()),
        BackendKind::Cached => Box::new(CachedBackend::open(path, read_only, truncate)?),
    })
}

pub struct DirectBackend {
    file: File,
}

impl DirectBackend {
    pub fn open(path: &Path, read_only: bool, truncate: bool) -> Result<DirectBackend> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .truncate(!read_only && truncate)
            .open(path)
            .with_context(|| format!("failed to open database file {}", path.display()))?;
        Ok(DirectBackend { file })
    }
}

impl Backend for DirectBackend {
    fn read_at(&mut self, pos: u32, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(pos as u64))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, pos: u32, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(pos as u64))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn size(&mut self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

pub struct MemoryBackend {
    chunks: Vec<Vec<u8>>,
}

impl MemoryBackend {
    pub fn new() -> MemoryBackend {
        MemoryBackend {
            chunks: vec![vec![0u8; MEMORY_CHUNK_SIZE]],
        }
    }

    fn capacity(&self) -> usize {
        self.chunks.len() * MEMORY_CHUNK_SIZE
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        MemoryBackend::new()
    }
}

impl Backend for MemoryBackend {
    fn read_at(&mut self, pos: u32, buf: &mut [u8]) -> Result<()> {
        let pos = pos as usize;
        if pos + buf.len() > self.capacity() {
            bail!("memory backend read past end: {} + {}", pos, buf.len());
        }
        let mut copied = 0;
        while copied < buf.len() {
            let at = pos + copied;
            let offset = at % MEMORY_CHUNK_SIZE;
            let take = (buf.len() - copied).min(MEMORY_CHUNK_SIZE - offset);
            let chunk = &self.chunks[at / MEMORY_CHUNK_SIZE];
            buf[copied..copied + take].copy_from_slice(&chunk[offset..offset + take]);
            copied += take;
        }
        Ok(())
    }

    fn write_at(&mut self, pos: u32, buf: &[u8]) -> Result<()> {
        let pos = pos as usize;
        while pos + buf.len() > self.capacity() {
            self.chunks.push(vec![0u8; MEMORY_CHUNK_SIZE]);
        }
        let mut copied = 0;
        while copied < buf.len() {
            let at = pos + copied;
            let offset = at % MEMORY_CHUNK_SIZE;
            let take = (buf.len() - copied).min(MEMORY_CHUNK_SIZE - offset);
            let chunk = &mut self.chunks[at / MEMORY_CHUNK_SIZE];
            chunk[offset..offset + take].copy_from_slice(&buf[copied..copied + take]);
            copied += take;
        }
        Ok(())
    }

    fn size(&mut self) -> Result<u64> {
        Ok(self.capacity() as u64)
    }
}

// Write-through page cache in front of the host file. A page enters the
// cache only when the file already holds all of it, so cached bytes are
// never speculative.
pub struct CachedBackend {
    inner: DirectBackend,
    pages: FlatLru<u32, Vec<u8>>,
}

impl CachedBackend {
    pub fn open(path: &Path, read_only: bool, truncate: bool) -> Result<CachedBackend> {
        Ok(CachedBackend {
            inner: DirectBackend::open(path, read_only, truncate)?,
            pages: FlatLru::new((TOTAL_CACHE_SIZE / SINGLE_CACHE_SIZE) as usize),
        })
    }
}

impl Backend for CachedBackend {
    fn read_at(&mut self, pos: u32, buf: &mut [u8]) -> Result<()> {
        let index = pos / SINGLE_CACHE_SIZE;
        let offset = (pos % SINGLE_CACHE_SIZE) as usize;
        let space = SINGLE_CACHE_SIZE as usize - offset;

        // split reads that straddle a cache-page edge
        if space < buf.len() {
            let (head, tail) = buf.split_at_mut(space);
            self.read_at(pos, head)?;
            return self.read_at(pos + space as u32, tail);
        }

        if let Some(page) = self.pages.get_and_refer(&index) {
            buf.copy_from_slice(&page[offset..offset + buf.len()]);
            return Ok(());
        }

        if self.inner.size()? >= (index as u64 + 1) * SINGLE_CACHE_SIZE as u64 {
            // miss on a fully materialized page: load it whole, then serve
            // from the copy. The cache is only populated after a complete
            // read so a short read cannot leave a poisoned entry behind.
            debug!("page cache miss, loading page {index}");
            let mut page = vec![0u8; SINGLE_CACHE_SIZE as usize];
            self.inner.read_at(index * SINGLE_CACHE_SIZE, &mut page)?;
            buf.copy_from_slice(&page[offset..offset + buf.len()]);
            self.pages.insert(index, page);
            return Ok(());
        }

        self.inner.read_at(pos, buf)
    }

    fn write_at(&mut self, pos: u32, buf: &[u8]) -> Result<()> {
        let index = pos / SINGLE_CACHE_SIZE;
        let offset = (pos % SINGLE_CACHE_SIZE) as usize;
        let space = SINGLE_CACHE_SIZE as usize - offset;

        if space < buf.len() {
            let (head, tail) = buf.split_at(space);
            self.write_at(pos, head)?;
            return self.write_at(pos + space as u32, tail);
        }

        // patch the cached copy, then write through
        if let Some(page) = self.pages.get(&index) {
            page[offset..offset + buf.len()].copy_from_slice(buf);
        }
        self.inner.write_at(pos, buf)
    }

    fn size(&mut self) -> Result<u64> {
        self.inner.size()
    }
}
