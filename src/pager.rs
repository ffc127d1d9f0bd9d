//! Reads and writes pages at fixed offsets in one table file.

use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::Result;
use crate::{Page, PageId, PAGE_SIZE};

/// File-backed page I/O. Page `p` occupies bytes `[p * 4096, (p + 1) * 4096)`;
/// page 0 is reserved and never read or written by the layers above.
pub struct Pager {
    file: File,
    pub num_pages: u32,
}

impl Pager {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        crate::basalt_debug_log!("[Pager::open] Opening table file at: {path_ref:?}");
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path_ref)?;

        let file_size = file.metadata()?.len();
        let num_pages = (file_size / PAGE_SIZE as u64) as u32;

        Ok(Self { file, num_pages })
    }

    /// Read one page. A read past the end of the file yields a zeroed page
    /// (new-page semantics), never an error.
    pub fn read_page(&mut self, page_id: PageId) -> Result<Page> {
        let mut page = Page::new(page_id);
        if page_id >= self.num_pages {
            return Ok(page);
        }

        let offset = page_id as u64 * PAGE_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;

        // a short read leaves the tail zeroed
        let mut filled = 0;
        while filled < PAGE_SIZE {
            let n = self.file.read(&mut page.data[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(page)
    }

    /// Write one page at its offset, extending the file with zero bytes when
    /// the offset lies past the current end.
    pub fn write_page(&mut self, page: &Page) -> Result<()> {
        crate::basalt_debug_log!("[Pager::write_page] Writing page_id: {}", page.id);
        let offset = page.id as u64 * PAGE_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&page.data)?;
        self.file.sync_all()?;
        if page.id >= self.num_pages {
            self.num_pages = page.id + 1;
        }
        Ok(())
    }
}
