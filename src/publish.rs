//! Write the consolidated table to disk, and read it back.
//!
//! The table is a CSV file with the columns
//! `type,country,date,reg_id,registry,status,subnet`. A new table is written
//! next to the published one and renamed over it once complete, so readers
//! only ever see a complete table.
use std::ffi::OsString;
use std::fs::File;
use std::io;
use std::io::BufWriter;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use chrono::NaiveDate;
use crate::delegations::DelegationStatus;
use crate::delegations::Registry;
use crate::delegations::ResourceType;
use crate::identity::RegId;
use crate::ip::IpPrefix;
use crate::table::ConsolidatedTable;
use crate::table::TableEntry;

const COLUMNS: [&str; 7] = [
    "type", "country", "date", "reg_id", "registry", "status", "subnet"
];


//------------ TableRow ------------------------------------------------------

#[derive(Debug, Deserialize, Serialize)]
struct TableRow {
    #[serde(rename = "type")]
    inr_type: String,
    country: String,
    date: String,
    reg_id: String,
    registry: String,
    status: String,
    subnet: String,
}

impl From<&TableEntry> for TableRow {
    fn from(entry: &TableEntry) -> Self {
        TableRow {
            inr_type: entry.resource_type().to_string(),
            country: entry.cc().unwrap_or_default().to_string(),
            date: entry.date().map(|d| d.to_string()).unwrap_or_default(),
            reg_id: entry.reg_id().to_string(),
            registry: entry.registry().to_string(),
            status: entry.status().to_string(),
            subnet: entry.prefix().to_string(),
        }
    }
}

impl TableRow {
    fn into_entry(self) -> Result<TableEntry, String> {
        let TableRow {
            inr_type, country, date, reg_id, registry, status, subnet
        } = self;

        let prefix = IpPrefix::from_str(&subnet).map_err(|e| e.to_string())?;
        let inr_type = ResourceType::from_str(&inr_type)?;
        let registry = Registry::from_str(&registry)?;
        let status = DelegationStatus::from_str(&status)?;
        let cc = Some(country).filter(|cc| !cc.is_empty());
        let date = if date.is_empty() {
            None
        } else {
            let parsed = NaiveDate::from_str(&date)
                .map_err(|_| format!("invalid date: {}", date))?;
            Some(parsed)
        };
        if reg_id.is_empty() {
            return Err("empty reg_id".to_string())
        }

        let entry = TableEntry::new(
            registry, cc, prefix, date, status, RegId::from(reg_id)
        );
        if entry.resource_type() != inr_type {
            return Err(format!("{} is not {}", subnet, inr_type))
        }
        Ok(entry)
    }
}


//------------ TablePublisher ------------------------------------------------

#[derive(Clone, Debug)]
pub struct TablePublisher {
    path: PathBuf
}

impl TablePublisher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        TablePublisher { path: path.into() }
    }

    pub fn path(&self) -> &Path { &self.path }

    /// Replaces the published table. On error the previous table, if any,
    /// is left in place.
    ///
    /// Each call writes its own temporary file, so concurrent publishers
    /// never write into each other's table. The last rename wins.
    pub fn publish(&self, table: &ConsolidatedTable) -> Result<(), PublishError> {
        let dir = self.dir();
        let tmp = tempfile::Builder::new()
            .prefix(&self.temp_prefix())
            .suffix(".tmp")
            .tempfile_in(&dir)?;

        // Dropping the temporary file on error removes it.
        Self::write_table(tmp.as_file(), table)?;
        tmp.persist(&self.path).map_err(|e| PublishError::Swap(e.error))?;
        Self::sync_dir(&dir);

        info!("published {} entries to {}", table.len(), self.path.display());
        Ok(())
    }

    /// Reads the published table, if there is one.
    pub fn load(&self) -> Result<Option<ConsolidatedTable>, PublishError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PublishError::Io(e))
        };

        let mut reader = csv::Reader::from_reader(io::BufReader::new(file));
        let mut entries = vec![];
        for (idx, row) in reader.deserialize::<TableRow>().enumerate() {
            // The header is line 1.
            let line = idx + 2;
            let entry = row
                .map_err(PublishError::Csv)?
                .into_entry()
                .map_err(|reason| PublishError::InvalidRow(line, reason))?;
            entries.push(entry);
        }

        Ok(Some(ConsolidatedTable::from_entries(entries)))
    }

    fn dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from(".")
        }
    }

    fn temp_prefix(&self) -> OsString {
        let mut name = OsString::from(".");
        name.push(self.path.file_name().unwrap_or_else(|| "table".as_ref()));
        name.push(".");
        name
    }

    fn write_table(file: &File, table: &ConsolidatedTable) -> Result<(), PublishError> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(BufWriter::new(file));

        writer.write_record(&COLUMNS)?;
        for entry in table.entries() {
            writer.serialize(TableRow::from(entry))?;
        }

        writer
            .into_inner()
            .map_err(|e| PublishError::Io(e.into_error()))?
            .into_inner()
            .map_err(|e| PublishError::Io(e.into_error()))?;
        file.sync_all()?;
        Ok(())
    }

    /// Makes the rename durable. Not every platform can open a directory,
    /// so failure only gets logged.
    fn sync_dir(dir: &Path) {
        if let Err(err) = File::open(dir).and_then(|dir| dir.sync_all()) {
            debug!("cannot sync {}: {}", dir.display(), err);
        }
    }
}


//------------ PublishError --------------------------------------------------

#[derive(Debug, Display)]
pub enum PublishError {
    #[display(fmt = "{}", _0)]
    Io(io::Error),

    #[display(fmt = "{}", _0)]
    Csv(csv::Error),

    #[display(fmt = "Cannot swap in new table: {}", _0)]
    Swap(io::Error),

    #[display(fmt = "Invalid table row on line {}: {}", _0, _1)]
    InvalidRow(usize, String),
}

impl From<io::Error> for PublishError {
    fn from(e: io::Error) -> Self { PublishError::Io(e) }
}

impl From<csv::Error> for PublishError {
    fn from(e: csv::Error) -> Self { PublishError::Csv(e) }
}

impl std::error::Error for PublishError {}


//------------ Tests --------------------------------------------------------
