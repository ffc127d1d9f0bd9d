//! Heap tables: an ordered chain of data pages over one buffer pool.
//!
//! Pages form a singly linked list threaded through each header's
//! `next_page`; rows are appended first-fit. Secondary indexes are
//! in-memory B-trees rebuilt from scans, keyed by the string projection of
//! a column value.

use std::collections::HashMap;
use std::path::Path;

use crate::btree::BTreeIndex;
use crate::buffer_pool::BufferPool;
use crate::error::{Error, Result};
use crate::page;
use crate::value::{Schema, Tuple, Value};
use crate::{PageId, TupleId, INVALID_PAGE_ID, MAX_TUPLE_SIZE, PAGE_SIZE};

pub struct HeapTable {
    name: String,
    schema: Schema,
    first_page_id: PageId,
    next_page_id: PageId,
    next_tuple_id: TupleId,
    buffer_pool: BufferPool,
    indexes: HashMap<String, BTreeIndex>,
}

impl HeapTable {
    /// Open a table over the file at `path`, adopting any existing page
    /// chain and resuming the id counters above what is already stored.
    pub fn open<P: AsRef<Path>>(name: &str, schema: Schema, path: P) -> Result<Self> {
        let buffer_pool = BufferPool::open(path)?;
        let mut table = Self {
            name: name.to_string(),
            schema,
            first_page_id: INVALID_PAGE_ID,
            next_page_id: 1,
            next_tuple_id: 1,
            buffer_pool,
            indexes: HashMap::new(),
        };
        table.load_existing()?;
        if table.first_page_id == INVALID_PAGE_ID {
            table.first_page_id = table.allocate_page()?;
        }
        Ok(table)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn first_page_id(&self) -> PageId {
        self.first_page_id
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.buffer_pool
    }

    /// Adopt a chain already on disk. A formatted page 1 (its header names
    /// itself) means the table existed; a zeroed header means a fresh file.
    fn load_existing(&mut self) -> Result<()> {
        let probe = {
            let guard = self.buffer_pool.get_page(1)?;
            let header = guard.read().header();
            header
        };
        if probe.page_id != 1 {
            return Ok(());
        }

        self.first_page_id = 1;
        let mut max_page_id = 1;
        let mut max_tuple_id = 0;
        let mut current = self.first_page_id;
        while current != INVALID_PAGE_ID {
            let guard = self.buffer_pool.get_page(current)?;
            let page = guard.read();
            let header = page.header();
            if header.page_id != current {
                return Err(Error::Corruption(format!(
                    "page {current} of table '{}' claims id {}",
                    self.name, header.page_id
                )));
            }
            max_page_id = max_page_id.max(current);
            for tuple in page.read_tuples(&self.schema)? {
                max_tuple_id = max_tuple_id.max(tuple.id);
            }
            let next = header.next_page;
            // release the page whose header was just read, then advance
            drop(page);
            drop(guard);
            current = next;
        }
        self.next_page_id = max_page_id + 1;
        self.next_tuple_id = max_tuple_id + 1;
        crate::basalt_debug_log!(
            "[HeapTable::open] Adopted chain of '{}': next_page_id={}, next_tuple_id={}",
            self.name,
            self.next_page_id,
            self.next_tuple_id
        );
        Ok(())
    }

    /// Format a fresh page under the next page id and return it.
    fn allocate_page(&mut self) -> Result<PageId> {
        let page_id = self.next_page_id;
        self.next_page_id += 1;
        let guard = self.buffer_pool.get_page(page_id)?;
        guard.write().format();
        Ok(page_id)
    }

    fn row_fits_limit(size: usize) -> Result<()> {
        if size > MAX_TUPLE_SIZE {
            return Err(Error::SchemaMismatch(format!(
                "row of {size} bytes exceeds the {MAX_TUPLE_SIZE}-byte row limit"
            )));
        }
        Ok(())
    }

    /// Insert a row, assigning the next id when the caller left it 0.
    /// Walks the chain first-fit; when every page is full a new page is
    /// allocated and linked from the tail.
    pub fn insert(&mut self, mut tuple: Tuple) -> Result<TupleId> {
        if tuple.id == 0 {
            tuple.id = self.next_tuple_id;
            self.next_tuple_id += 1;
        } else if tuple.id >= self.next_tuple_id {
            self.next_tuple_id = tuple.id + 1;
        }
        let size = page::tuple_size(&tuple);
        Self::row_fits_limit(size)?;

        let mut current = self.first_page_id;
        let tail;
        loop {
            let guard = self.buffer_pool.get_page(current)?;
            let header = guard.read().header();
            if size <= header.free_space as usize {
                let appended = guard.write().append_tuple(&tuple)?;
                debug_assert!(appended);
                drop(guard);
                self.update_indexes(&tuple);
                return Ok(tuple.id);
            }
            drop(guard);
            if header.next_page == INVALID_PAGE_ID {
                tail = current;
                break;
            }
            current = header.next_page;
        }

        let new_page_id = self.allocate_page()?;
        {
            let guard = self.buffer_pool.get_page(new_page_id)?;
            let appended = guard.write().append_tuple(&tuple)?;
            debug_assert!(appended);
        }
        {
            // link from the tail; linking from the first page would orphan
            // every page after it once the chain is longer than one
            let guard = self.buffer_pool.get_page(tail)?;
            let mut tail_page = guard.write();
            let mut header = tail_page.header();
            header.next_page = new_page_id;
            tail_page.set_header(&header);
        }
        crate::basalt_debug_log!(
            "[HeapTable::insert] Extended '{}' with page {new_page_id}",
            self.name
        );
        self.update_indexes(&tuple);
        Ok(tuple.id)
    }

    /// Where an insert of `tuple` would land: the first page with room, or
    /// the id the next allocation would take. The second element names the
    /// current tail when the insert would extend the chain, whose
    /// `next_page` link changes too, so write-ahead callers capture both.
    pub fn placement_for(&self, tuple: &Tuple) -> Result<(PageId, Option<PageId>)> {
        let size = page::tuple_size(tuple);
        let mut current = self.first_page_id;
        loop {
            let guard = self.buffer_pool.get_page(current)?;
            let header = guard.read().header();
            if size <= header.free_space as usize {
                return Ok((current, None));
            }
            if header.next_page == INVALID_PAGE_ID {
                return Ok((self.next_page_id, Some(current)));
            }
            current = header.next_page;
        }
    }

    /// Every row in chain order.
    pub fn select_all(&self) -> Result<Vec<Tuple>> {
        let mut all = Vec::new();
        let mut current = self.first_page_id;
        while current != INVALID_PAGE_ID {
            let guard = self.buffer_pool.get_page(current)?;
            let page = guard.read();
            all.extend(page.read_tuples(&self.schema)?);
            let next = page.header().next_page;
            drop(page);
            drop(guard);
            current = next;
        }
        Ok(all)
    }

    /// Rows whose `column` equals `value`. Probes the column's index when
    /// one exists, resolving the hit with a scan; otherwise filters a scan.
    pub fn select_where(&self, column: &str, value: &Value) -> Result<Vec<Tuple>> {
        let col_idx = self.schema.column_index(column).ok_or_else(|| {
            Error::NotFound(format!("column '{column}' in table '{}'", self.name))
        })?;

        if let Some(index) = self.indexes.get(column) {
            let Some(tuple_id) = index.get(&value.index_key()) else {
                return Ok(Vec::new());
            };
            return Ok(self
                .select_all()?
                .into_iter()
                .filter(|t| t.id == tuple_id)
                .collect());
        }

        Ok(self
            .select_all()?
            .into_iter()
            .filter(|t| t.values.get(col_idx) == Some(value))
            .collect())
    }

    /// Remove the row with `tuple_id`. Its page is compacted in place; the
    /// id is never reused.
    pub fn delete(&mut self, tuple_id: TupleId) -> Result<()> {
        let mut current = self.first_page_id;
        while current != INVALID_PAGE_ID {
            let guard = self.buffer_pool.get_page(current)?;
            let (removed, next) = {
                let page = guard.read();
                let removed = page
                    .read_tuples(&self.schema)?
                    .into_iter()
                    .find(|t| t.id == tuple_id);
                (removed, page.header().next_page)
            };
            if let Some(removed) = removed {
                guard.write().remove_tuple(tuple_id)?;
                drop(guard);
                self.refresh_indexes_after_remove(&removed)?;
                return Ok(());
            }
            drop(guard);
            current = next;
        }
        Err(Error::NotFound(format!(
            "tuple {tuple_id} in table '{}'",
            self.name
        )))
    }

    /// Replace the values of the row with `tuple_id`, keeping its id.
    /// Rewrites in place when the page still has room for the new size;
    /// otherwise the row moves through the normal insert path.
    pub fn update(&mut self, tuple_id: TupleId, new_values: Vec<Value>) -> Result<()> {
        let replacement = Tuple::with_id(tuple_id, new_values);
        let new_size = page::tuple_size(&replacement);
        Self::row_fits_limit(new_size)?;

        let mut current = self.first_page_id;
        while current != INVALID_PAGE_ID {
            let guard = self.buffer_pool.get_page(current)?;
            let (old, next, fits_in_place) = {
                let page = guard.read();
                let header = page.header();
                let old = page
                    .read_tuples(&self.schema)?
                    .into_iter()
                    .find(|t| t.id == tuple_id);
                let fits = old.as_ref().is_some_and(|o| {
                    new_size <= header.free_space as usize + page::tuple_size(o)
                });
                (old, header.next_page, fits)
            };
            if let Some(old) = old {
                if fits_in_place {
                    let mut page = guard.write();
                    page.remove_tuple(tuple_id)?;
                    let appended = page.append_tuple(&replacement)?;
                    debug_assert!(appended);
                    drop(page);
                    drop(guard);
                } else {
                    guard.write().remove_tuple(tuple_id)?;
                    drop(guard);
                    self.insert(replacement.clone())?;
                }
                self.refresh_indexes_after_remove(&old)?;
                self.update_indexes(&replacement);
                return Ok(());
            }
            drop(guard);
            current = next;
        }
        Err(Error::NotFound(format!(
            "tuple {tuple_id} in table '{}'",
            self.name
        )))
    }

    /// Build a B-tree over `column` from a full scan. A no-op when the
    /// column is already indexed; later inserts maintain every index.
    pub fn create_index(&mut self, column: &str) -> Result<()> {
        if self.indexes.contains_key(column) {
            return Ok(());
        }
        let col_idx = self.schema.column_index(column).ok_or_else(|| {
            Error::NotFound(format!("column '{column}' in table '{}'", self.name))
        })?;

        let mut index = BTreeIndex::new();
        for tuple in self.select_all()? {
            if let Some(value) = tuple.values.get(col_idx) {
                index.insert(&value.index_key(), tuple.id);
            }
        }
        self.indexes.insert(column.to_string(), index);
        Ok(())
    }

    pub fn drop_index(&mut self, column: &str) -> Result<()> {
        self.indexes.remove(column).map(|_| ()).ok_or_else(|| {
            Error::NotFound(format!("index on '{column}' of table '{}'", self.name))
        })
    }

    pub fn has_index(&self, column: &str) -> bool {
        self.indexes.contains_key(column)
    }

    pub fn indexed_columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = self.indexes.keys().cloned().collect();
        columns.sort();
        columns
    }

    /// Total rows, summed from page headers.
    pub fn tuple_count(&self) -> Result<u64> {
        let mut count = 0u64;
        let mut current = self.first_page_id;
        while current != INVALID_PAGE_ID {
            let guard = self.buffer_pool.get_page(current)?;
            let header = guard.read().header();
            count += header.tuple_count as u64;
            current = header.next_page;
        }
        Ok(count)
    }

    /// Raw bytes of one page, via the cache. Used for write-ahead images.
    pub fn page_image(&self, page_id: PageId) -> Result<Box<[u8; PAGE_SIZE]>> {
        self.buffer_pool.page_image(page_id)
    }

    pub fn flush(&self) -> Result<()> {
        self.buffer_pool.flush_all()
    }

    fn update_indexes(&mut self, tuple: &Tuple) {
        for (column, index) in &mut self.indexes {
            if let Some(col_idx) = self.schema.column_index(column) {
                if let Some(value) = tuple.values.get(col_idx) {
                    index.insert(&value.index_key(), tuple.id);
                }
            }
        }
    }

    /// Rebuild any index whose entry for the removed row's key still points
    /// at that row. Indexes map each key to a single id, so a rebuild from
    /// the surviving rows is the simplest way to restore them.
    fn refresh_indexes_after_remove(&mut self, removed: &Tuple) -> Result<()> {
        let mut stale = Vec::new();
        for (column, index) in &self.indexes {
            let Some(col_idx) = self.schema.column_index(column) else {
                continue;
            };
            if let Some(value) = removed.values.get(col_idx) {
                if index.get(&value.index_key()) == Some(removed.id) {
                    stale.push(column.clone());
                }
            }
        }
        if stale.is_empty() {
            return Ok(());
        }

        let rows = self.select_all()?;
        for column in stale {
            let Some(col_idx) = self.schema.column_index(&column) else {
                continue;
            };
            let mut index = BTreeIndex::new();
            for tuple in &rows {
                if let Some(value) = tuple.values.get(col_idx) {
                    index.insert(&value.index_key(), tuple.id);
                }
            }
            self.indexes.insert(column, index);
        }
        Ok(())
    }
}
