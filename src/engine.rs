//! The storage facade and the database session coordinator.
//!
//! `StorageEngine` routes row operations to the owning `HeapTable`; each
//! table lives in its own file `<db>.<name>`. `Database` layers the
//! transactional surface on top: one open transaction per session,
//! write-ahead page images for transactional inserts, checkpointing, and
//! log replay on open.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::heap::HeapTable;
use crate::lock_manager::LockMode;
use crate::meta;
use crate::pager::Pager;
use crate::transaction::TransactionManager;
use crate::value::{Schema, Tuple, Value};
use crate::wal::{LogSummary, WalManager, WalRecord};
use crate::{Page, PageId, TransactionId, TupleId, PAGE_SIZE};

fn derived_path(base: &Path, suffix: &str) -> PathBuf {
    let mut os = base.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

fn validate_values(schema: &Schema, values: &[Value]) -> Result<()> {
    if values.len() != schema.columns.len() {
        return Err(Error::SchemaMismatch(format!(
            "expected {} values, got {}",
            schema.columns.len(),
            values.len()
        )));
    }
    for (column, value) in schema.columns.iter().zip(values) {
        if value.data_type() != column.data_type {
            return Err(Error::SchemaMismatch(format!(
                "column '{}' is {:?}, got {:?}",
                column.name,
                column.data_type,
                value.data_type()
            )));
        }
    }
    Ok(())
}

/// A named collection of heap tables over one base path.
pub struct StorageEngine {
    tables: HashMap<String, HeapTable>,
    base_path: PathBuf,
}

impl StorageEngine {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            tables: HashMap::new(),
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    fn table_path(&self, name: &str) -> PathBuf {
        derived_path(&self.base_path, &format!(".{name}"))
    }

    pub fn create_table(&mut self, name: &str, schema: Schema) -> Result<()> {
        if self.tables.contains_key(name) {
            return Err(Error::AlreadyExists(format!("table '{name}'")));
        }
        let table = HeapTable::open(name, schema, self.table_path(name))?;
        self.tables.insert(name.to_string(), table);
        Ok(())
    }

    /// Forget a table. The data file is left on disk.
    pub fn drop_table(&mut self, name: &str) -> Result<()> {
        self.tables
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("table '{name}'")))
    }

    pub fn get_table(&self, name: &str) -> Result<&HeapTable> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("table '{name}'")))
    }

    pub fn get_table_mut(&mut self, name: &str) -> Result<&mut HeapTable> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("table '{name}'")))
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.keys().cloned().collect();
        names.sort();
        names
    }

    /// The catalog in name order, as persisted to the sidecar.
    pub fn schemas(&self) -> Vec<(String, Schema)> {
        self.table_names()
            .into_iter()
            .map(|name| {
                let schema = self.tables[&name].schema().clone();
                (name, schema)
            })
            .collect()
    }

    pub fn insert_tuple(&mut self, table_name: &str, tuple: Tuple) -> Result<TupleId> {
        let table = self.get_table_mut(table_name)?;
        validate_values(table.schema(), &tuple.values)?;
        table.insert(tuple)
    }

    pub fn select_all(&self, table_name: &str) -> Result<Vec<Tuple>> {
        self.get_table(table_name)?.select_all()
    }

    pub fn select_where(
        &self,
        table_name: &str,
        column: &str,
        value: &Value,
    ) -> Result<Vec<Tuple>> {
        self.get_table(table_name)?.select_where(column, value)
    }

    pub fn delete_tuple(&mut self, table_name: &str, tuple_id: TupleId) -> Result<()> {
        self.get_table_mut(table_name)?.delete(tuple_id)
    }

    pub fn update_tuple(
        &mut self,
        table_name: &str,
        tuple_id: TupleId,
        values: Vec<Value>,
    ) -> Result<()> {
        let table = self.get_table_mut(table_name)?;
        validate_values(table.schema(), &values)?;
        table.update(tuple_id, values)
    }

    pub fn create_index(&mut self, table_name: &str, column: &str) -> Result<()> {
        self.get_table_mut(table_name)?.create_index(column)
    }

    pub fn drop_index(&mut self, table_name: &str, column: &str) -> Result<()> {
        self.get_table_mut(table_name)?.drop_index(column)
    }

    /// Flush every table's buffer pool.
    pub fn flush_all(&self) -> Result<()> {
        for table in self.tables.values() {
            table.flush()?;
        }
        Ok(())
    }
}

/// Replay the write-ahead log at `<db>.log` against the per-table data
/// files: committed transactions have their after-images reapplied in log
/// order, unfinished ones their before-images reversed in reverse order.
/// Returns the highest transaction id seen. Safe to call only while no
/// buffer pool has the data files open.
pub fn recover<P: AsRef<Path>>(db_path: P) -> Result<TransactionId> {
    let base = db_path.as_ref();
    let log_path = derived_path(base, ".log");
    if !log_path.exists() {
        return Ok(0);
    }
    let mut wal = WalManager::open(&log_path)?;
    let records = wal.records()?;
    if records.is_empty() {
        return Ok(0);
    }
    let summary = LogSummary::of(&records);
    let mut pagers: HashMap<String, Pager> = HashMap::new();

    for record in &records {
        if let WalRecord::PageWrite {
            tx_id,
            table,
            page_id,
            after,
            ..
        } = record
        {
            if summary.committed.contains(tx_id) {
                apply_image(&mut pagers, base, table, *page_id, after)?;
            }
        }
    }
    for record in records.iter().rev() {
        if let WalRecord::PageWrite {
            tx_id,
            table,
            page_id,
            before,
            ..
        } = record
        {
            if summary.needs_undo(*tx_id) {
                apply_image(&mut pagers, base, table, *page_id, before)?;
            }
        }
    }
    // every replayed image is synced in the data files, so the log has
    // served its purpose; leaving it would re-run the undo pass over
    // whatever later sessions write to the same pages
    wal.truncate()?;
    crate::basalt_debug_log!(
        "[recover] Replayed {} records; highest tx id {}",
        records.len(),
        summary.highest_tx_id
    );
    Ok(summary.highest_tx_id)
}

fn apply_image(
    pagers: &mut HashMap<String, Pager>,
    base: &Path,
    table: &str,
    page_id: PageId,
    image: &[u8],
) -> Result<()> {
    if image.len() != PAGE_SIZE {
        return Err(Error::Corruption(format!(
            "page image for {table}:{page_id} is {} bytes",
            image.len()
        )));
    }
    let pager = match pagers.entry(table.to_string()) {
        Entry::Occupied(entry) => entry.into_mut(),
        Entry::Vacant(entry) => {
            let path = derived_path(base, &format!(".{table}"));
            entry.insert(Pager::open(path)?)
        }
    };
    let mut page = Page::new(page_id);
    page.data.copy_from_slice(image);
    pager.write_page(&page)
}

/// Per-table statistics.
#[derive(Debug, Clone)]
pub struct TableStats {
    pub name: String,
    pub tuple_count: u64,
    pub page_hits: u64,
    pub page_misses: u64,
    pub hit_ratio: f64,
    pub indexed_columns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DatabaseStats {
    pub tables: Vec<TableStats>,
    pub active_transactions: usize,
}

/// One database session: the storage facade plus the transaction manager,
/// wired the way a single caller uses them. Opening replays the log,
/// loads the schema catalog, and reopens every table.
pub struct Database {
    storage: StorageEngine,
    tm: TransactionManager,
    meta_path: PathBuf,
    current_tx: Option<TransactionId>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let base = db_path.as_ref().to_path_buf();
        let log_path = derived_path(&base, ".log");
        let meta_path = derived_path(&base, ".meta");

        let highest_tx = recover(&base)?;
        let wal = WalManager::open(&log_path)?;
        let tm = TransactionManager::new(wal, highest_tx + 1);

        let mut storage = StorageEngine::new(&base);
        for (name, schema) in meta::load(&meta_path)? {
            storage.create_table(&name, schema)?;
        }

        Ok(Self {
            storage,
            tm,
            meta_path,
            current_tx: None,
        })
    }

    pub fn create_table(&mut self, name: &str, schema: Schema) -> Result<()> {
        self.storage.create_table(name, schema)?;
        self.save_metadata()
    }

    pub fn drop_table(&mut self, name: &str) -> Result<()> {
        self.storage.drop_table(name)?;
        self.save_metadata()
    }

    pub fn list_tables(&self) -> Vec<String> {
        self.storage.table_names()
    }

    pub fn table_schema(&self, name: &str) -> Result<Schema> {
        Ok(self.storage.get_table(name)?.schema().clone())
    }

    /// Insert a row. Outside a transaction this is a plain routed write;
    /// inside one, the destination pages are locked exclusively and their
    /// before/after images logged as part of the operation.
    pub fn insert(&mut self, table_name: &str, values: Vec<Value>) -> Result<TupleId> {
        let Some(tx_id) = self.current_tx else {
            return self.storage.insert_tuple(table_name, Tuple::new(values));
        };

        let tuple = Tuple::new(values);
        let (target, tail) = {
            let table = self.storage.get_table(table_name)?;
            validate_values(table.schema(), &tuple.values)?;
            table.placement_for(&tuple)?
        };

        let mut pages = vec![target];
        pages.extend(tail);
        for &page_id in &pages {
            if !self.tm.acquire_lock(tx_id, page_id, LockMode::Exclusive)? {
                return Err(Error::LockDenied(page_id));
            }
        }

        let mut before = Vec::with_capacity(pages.len());
        for &page_id in &pages {
            before.push(self.storage.get_table(table_name)?.page_image(page_id)?);
        }

        let id = self.storage.get_table_mut(table_name)?.insert(tuple)?;

        for (&page_id, before_image) in pages.iter().zip(&before) {
            let after = self.storage.get_table(table_name)?.page_image(page_id)?;
            self.tm
                .log_page_write(tx_id, table_name, page_id, &before_image[..], &after[..])?;
        }
        Ok(id)
    }

    pub fn select_all(&self, table_name: &str) -> Result<Vec<Tuple>> {
        self.storage.select_all(table_name)
    }

    pub fn select_where(
        &self,
        table_name: &str,
        column: &str,
        value: &Value,
    ) -> Result<Vec<Tuple>> {
        self.storage.select_where(table_name, column, value)
    }

    pub fn delete(&mut self, table_name: &str, tuple_id: TupleId) -> Result<()> {
        self.storage.delete_tuple(table_name, tuple_id)
    }

    pub fn update(
        &mut self,
        table_name: &str,
        tuple_id: TupleId,
        values: Vec<Value>,
    ) -> Result<()> {
        self.storage.update_tuple(table_name, tuple_id, values)
    }

    pub fn create_index(&mut self, table_name: &str, column: &str) -> Result<()> {
        self.storage.create_index(table_name, column)
    }

    pub fn drop_index(&mut self, table_name: &str, column: &str) -> Result<()> {
        self.storage.drop_index(table_name, column)
    }

    /// Start the session's transaction. A second begin fails until the
    /// first commits or rolls back.
    pub fn begin(&mut self) -> Result<TransactionId> {
        if let Some(tx_id) = self.current_tx {
            return Err(Error::TransactionState {
                tx_id,
                reason: "a transaction is already open".to_string(),
            });
        }
        let tx_id = self.tm.begin()?;
        self.current_tx = Some(tx_id);
        Ok(tx_id)
    }

    pub fn commit(&mut self) -> Result<()> {
        let Some(tx_id) = self.current_tx else {
            return Err(Error::TransactionState {
                tx_id: 0,
                reason: "no open transaction".to_string(),
            });
        };
        self.tm.commit(tx_id)?;
        self.current_tx = None;
        self.storage.flush_all()
    }

    /// Abort the open transaction. Locks are released and the abort is
    /// logged; already-dirtied pages are reversed by log replay on the
    /// next open, not here.
    pub fn rollback(&mut self) -> Result<()> {
        let Some(tx_id) = self.current_tx else {
            return Err(Error::TransactionState {
                tx_id: 0,
                reason: "no open transaction".to_string(),
            });
        };
        self.tm.abort(tx_id)?;
        self.current_tx = None;
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.current_tx.is_some()
    }

    pub fn current_transaction_id(&self) -> Option<TransactionId> {
        self.current_tx
    }

    /// Flush every dirty page, then log a checkpoint and truncate the log.
    pub fn checkpoint(&mut self) -> Result<()> {
        self.storage.flush_all()?;
        self.tm.checkpoint()
    }

    pub fn transaction_manager(&self) -> &TransactionManager {
        &self.tm
    }

    pub fn stats(&self) -> Result<DatabaseStats> {
        let mut tables = Vec::new();
        for name in self.storage.table_names() {
            let table = self.storage.get_table(&name)?;
            let pool = table.buffer_pool();
            tables.push(TableStats {
                name,
                tuple_count: table.tuple_count()?,
                page_hits: pool.page_hits(),
                page_misses: pool.page_misses(),
                hit_ratio: pool.hit_ratio(),
                indexed_columns: table.indexed_columns(),
            });
        }
        Ok(DatabaseStats {
            tables,
            active_transactions: self.tm.active_count(),
        })
    }

    fn save_metadata(&self) -> Result<()> {
        meta::save(&self.meta_path, &self.storage.schemas())
    }

    /// Shut down: roll back any open transaction, persist the catalog,
    /// and checkpoint so the data files are self-contained.
    pub fn close(mut self) -> Result<()> {
        if self.current_tx.is_some() {
            self.rollback()?;
        }
        self.save_metadata()?;
        self.checkpoint()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        // close() already consumed by-value callers; this is the safety net
        let _ = self.save_metadata();
        let _ = self.storage.flush_all();
    }
}
