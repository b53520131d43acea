//! The consolidated delegation table.
use std::collections::BTreeMap;
use std::mem;
use chrono::NaiveDate;
use crate::delegations::DelegationStatus;
use crate::delegations::Registry;
use crate::delegations::ResourceType;
use crate::identity::RegId;
use crate::ip::IpAddressFamily;
use crate::ip::IpPrefix;
use crate::ip::IpRange;


//------------ TableEntry ----------------------------------------------------

/// One CIDR block as delegated by one registry.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct TableEntry {
    registry: Registry,
    cc: Option<String>,
    prefix: IpPrefix,
    date: Option<NaiveDate>,
    status: DelegationStatus,
    reg_id: RegId,
}

impl TableEntry {
    pub fn new(
        registry: Registry,
        cc: Option<String>,
        prefix: IpPrefix,
        date: Option<NaiveDate>,
        status: DelegationStatus,
        reg_id: RegId,
    ) -> Self {
        TableEntry { registry, cc, prefix, date, status, reg_id }
    }

    pub fn registry(&self) -> Registry { self.registry }
    pub fn cc(&self) -> Option<&str> { self.cc.as_deref() }
    pub fn prefix(&self) -> &IpPrefix { &self.prefix }
    pub fn date(&self) -> Option<NaiveDate> { self.date }
    pub fn status(&self) -> DelegationStatus { self.status }
    pub fn reg_id(&self) -> &RegId { &self.reg_id }

    pub fn resource_type(&self) -> ResourceType {
        match self.prefix.family() {
            IpAddressFamily::Ipv4 => ResourceType::Ipv4,
            IpAddressFamily::Ipv6 => ResourceType::Ipv6,
        }
    }

    /// Rough number of bytes this entry takes in memory.
    fn footprint(&self) -> usize {
        mem::size_of::<Self>()
            + self.cc.as_ref().map(String::len).unwrap_or(0)
            + self.reg_id.as_str().len()
    }
}

impl AsRef<IpRange> for TableEntry {
    fn as_ref(&self) -> &IpRange {
        self.prefix.as_ref()
    }
}


//------------ ConsolidatedTable ---------------------------------------------

/// The entries of all registries, ordered by family, start address and
/// then prefix length. Immutable once built.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConsolidatedTable {
    entries: Vec<TableEntry>
}

impl ConsolidatedTable {
    /// Orders the given entries. Callers make sure there is one entry per
    /// registry and prefix.
    pub(crate) fn from_entries(mut entries: Vec<TableEntry>) -> Self {
        entries.sort_by_key(|e| (e.prefix.sort_key(), e.registry));
        ConsolidatedTable { entries }
    }

    pub fn entries(&self) -> &[TableEntry] { &self.entries }

    pub fn into_entries(self) -> Vec<TableEntry> { self.entries }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Splits the table back into per-registry entry lists.
    pub fn by_registry(&self) -> BTreeMap<Registry, Vec<TableEntry>> {
        let mut res: BTreeMap<Registry, Vec<TableEntry>> = BTreeMap::new();
        for entry in &self.entries {
            res.entry(entry.registry).or_default().push(entry.clone());
        }
        res
    }

    /// Rough number of bytes the table takes in memory.
    pub fn footprint(&self) -> usize {
        self.entries.iter().map(TableEntry::footprint).sum()
    }
}
