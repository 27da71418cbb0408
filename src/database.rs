/*
Client surface. A database is a paged file system plus one well-known
internal table ("TableRecords", string-indexed by "Name") whose rows map
each user table's name to the head page of that table's header sub-file.
Open tables are cached by name so repeated lookups share one handle.
*/

use anyhow::{bail, Result};
use log::warn;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use crate::backend::BackendKind;
use crate::index::{KeyType, KeyValue};
use crate::pager::{FileSystem, PageId, PAGE_ID_INVALID};
use crate::table::Table;

const TABLE_RECORDS_FILE: &str = "TableRecords";
const NAME_INDEX: &str = "Name";

pub struct Database {
    // declaration order doubles as drop order: user tables first, then
    // the internal table, then the file system itself
    tables: RefCell<HashMap<String, Rc<RefCell<Table>>>>,
    internal: Rc<RefCell<Table>>,
    fs: Rc<FileSystem>,
}

impl Database {
    pub fn open(path: &Path, read_only: bool, kind: BackendKind) -> Result<Database> {
        let fs = FileSystem::open(path, read_only, kind)?;

        let internal = match fs.open_named(TABLE_RECORDS_FILE)? {
            Some(file) => Table::open(fs.clone(), file)?,
            None => {
                let file = fs.create_named(TABLE_RECORDS_FILE)?;
                Table::init(fs.clone(), file, &[(NAME_INDEX, &[KeyType::Str])])?
            }
        };

        Ok(Database {
            tables: RefCell::new(HashMap::new()),
            internal: Rc::new(RefCell::new(internal)),
            fs,
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.fs.is_read_only()
    }

    pub fn create_table(
        &self,
        name: &str,
        index_key_types: &[(&str, &[KeyType])],
    ) -> Result<Rc<RefCell<Table>>> {
        if self.is_table_exists(name)? {
            bail!("table {name:?} already exists");
        }

        let file = self.fs.create_file()?;
        let id = file.borrow().id();
        if !self.internal.borrow_mut().add_row(
            &[(NAME_INDEX, &[KeyValue::from(name)] as &[KeyValue])],
            &id.to_le_bytes(),
            true,
        )? {
            bail!("table {name:?} is already recorded");
        }

        let table = Rc::new(RefCell::new(Table::init(
            self.fs.clone(),
            file,
            index_key_types,
        )?));
        self.tables
            .borrow_mut()
            .insert(name.to_string(), table.clone());
        Ok(table)
    }

    // The cached handle when the table is open, otherwise open it from
    // its record; None for names the database has never seen.
    pub fn table(&self, name: &str) -> Result<Option<Rc<RefCell<Table>>>> {
        if let Some(table) = self.tables.borrow().get(name) {
            return Ok(Some(table.clone()));
        }

        let id = match self.table_file(name)? {
            Some(id) => id,
            None => {
                warn!("cannot open table {name:?}");
                return Ok(None);
            }
        };

        let file = self.fs.open_file(id)?;
        let table = Rc::new(RefCell::new(Table::open(self.fs.clone(), file)?));
        self.tables
            .borrow_mut()
            .insert(name.to_string(), table.clone());
        Ok(Some(table))
    }

    pub fn is_table_exists(&self, name: &str) -> Result<bool> {
        if self.tables.borrow().contains_key(name) {
            return Ok(true);
        }
        Ok(self.table_file(name)?.is_some())
    }

    pub fn delete_table(&self, name: &str) -> Result<bool> {
        let table = match self.table(name)? {
            Some(table) => table,
            None => return Ok(false),
        };

        table.borrow_mut().delete()?;
        self.tables.borrow_mut().remove(name);
        self.internal
            .borrow_mut()
            .remove_row(NAME_INDEX, &[KeyValue::from(name)])?;
        Ok(true)
    }

    pub fn query(&self, table: &str, index: &str, keys: &[KeyValue]) -> Result<Vec<Vec<u8>>> {
        match self.table(table)? {
            Some(table) => table.borrow_mut().find(index, keys),
            None => Ok(Vec::new()),
        }
    }

    pub fn rows(&self, table: &str) -> Result<Vec<Vec<u8>>> {
        match self.table(table)? {
            Some(table) => table.borrow_mut().get_rows(),
            None => Ok(Vec::new()),
        }
    }

    // Look the table's head page up in the internal table.
    fn table_file(&self, name: &str) -> Result<Option<PageId>> {
        let mut id = PAGE_ID_INVALID;
        self.internal.borrow_mut().find_one(
            NAME_INDEX,
            &[KeyValue::from(name)],
            |payload| {
                if payload.len() == 4 {
                    id = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                }
                true
            },
        )?;
        Ok((id != PAGE_ID_INVALID).then_some(id))
    }
}
