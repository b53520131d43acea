//! Longest-match lookups against a published table.
use std::sync::Arc;
use arc_swap::ArcSwap;
use crate::ip::IpAddress;
use crate::ip::IpRange;
use crate::ip::IpRangeTree;
use crate::ip::IpRangeTreeBuilder;
use crate::table::ConsolidatedTable;
use crate::table::TableEntry;


//------------ LookupTable ---------------------------------------------------

/// An index of table entries by the addresses they cover.
#[derive(Debug)]
pub struct LookupTable {
    tree: IpRangeTree<TableEntry>
}

impl LookupTable {
    pub fn empty() -> Self {
        LookupTable { tree: IpRangeTreeBuilder::empty().build() }
    }

    pub fn len(&self) -> usize { self.tree.len() }

    pub fn is_empty(&self) -> bool { self.tree.is_empty() }

    /// Returns the most specific entry covering the address.
    pub fn longest_match(&self, addr: IpAddress) -> Option<&TableEntry> {
        self.matching(addr).into_iter().max_by_key(|entry| entry.prefix().length())
    }

    /// Returns all entries covering the address, least specific first.
    pub fn covering(&self, addr: IpAddress) -> Vec<&TableEntry> {
        let mut res = self.matching(addr);
        res.sort_by_key(|entry| entry.prefix().length());
        res
    }

    // IPv4 lives inside the IPv6 space of the tree, so short IPv6 prefixes
    // cover IPv4 addresses there.
    fn matching(&self, addr: IpAddress) -> Vec<&TableEntry> {
        let mut res = self.tree.matching_or_less_specific(&IpRange::single(addr));
        res.retain(|entry| entry.prefix().family() == addr.family());
        res
    }
}

impl From<ConsolidatedTable> for LookupTable {
    fn from(table: ConsolidatedTable) -> Self {
        let mut builder = IpRangeTreeBuilder::empty();
        for entry in table.into_entries() {
            builder.add(entry);
        }
        LookupTable { tree: builder.build() }
    }
}


//------------ TableHandle ---------------------------------------------------

/// The currently published lookup table.
///
/// Readers take a reference to the table that is current at that moment and
/// keep using it for as long as they like. A refresh swaps in a complete new
/// table without waiting for them.
#[derive(Debug)]
pub struct TableHandle {
    current: ArcSwap<LookupTable>
}

impl TableHandle {
    pub fn new(table: LookupTable) -> Self {
        TableHandle { current: ArcSwap::from_pointee(table) }
    }

    pub fn empty() -> Self {
        Self::new(LookupTable::empty())
    }

    pub fn load(&self) -> Arc<LookupTable> {
        self.current.load_full()
    }

    /// Makes `table` current and returns the one it replaces.
    pub fn swap(&self, table: LookupTable) -> Arc<LookupTable> {
        self.current.swap(Arc::new(table))
    }
}

impl Default for TableHandle {
    fn default() -> Self { Self::empty() }
}


//------------ Tests --------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use chrono::NaiveDate;
    use crate::consolidate::Consolidation;
    use crate::delegations::DelegationStatus;
    use crate::delegations::Registry;
    use crate::identity::RegId;
    use crate::ip::IpPrefix;

    fn entry(registry: Registry, prefix: &str) -> TableEntry {
        TableEntry::new(
            registry,
            Some("NL".to_string()),
            IpPrefix::from_str(prefix).unwrap(),
            NaiveDate::from_ymd_opt(2019, 1, 10),
            DelegationStatus::Allocated,
            RegId::from(format!("{}-holder", prefix))
        )
    }

    fn addr(s: &str) -> IpAddress {
        IpAddress::from_str(s).unwrap()
    }

    fn lookup_table() -> LookupTable {
        let table = Consolidation::merge(vec![
            entry(Registry::RipeNcc, "141.0.0.0/8"),
            entry(Registry::RipeNcc, "141.98.0.0/16"),
            entry(Registry::RipeNcc, "141.98.8.0/22"),
            entry(Registry::RipeNcc, "141.98.12.0/22"),
            entry(Registry::Apnic, "2001:db8::/32"),
        ]).into_parts().0;
        LookupTable::from(table)
    }

    #[test]
    fn should_find_longest_match() {
        let table = lookup_table();

        let found = table.longest_match(addr("141.98.11.145")).unwrap();
        assert_eq!("141.98.8.0/22", found.prefix().to_string());

        let found = table.longest_match(addr("141.98.200.1")).unwrap();
        assert_eq!("141.98.0.0/16", found.prefix().to_string());

        let found = table.longest_match(addr("2001:db8::1")).unwrap();
        assert_eq!(Registry::Apnic, found.registry());

        assert!(table.longest_match(addr("142.0.0.1")).is_none());
        assert!(table.longest_match(addr("::ffff:8d62:b91")).is_some());
    }

    #[test]
    fn should_list_covering_entries() {
        let table = lookup_table();
        let covering: Vec<_> = table.covering(addr("141.98.11.145"))
            .into_iter()
            .map(|e| e.prefix().to_string())
            .collect();
        assert_eq!(
            vec!["141.0.0.0/8", "141.98.0.0/16", "141.98.8.0/22"],
            covering
        );
    }

    #[test]
    fn should_keep_families_apart() {
        let table = LookupTable::from(Consolidation::merge(vec![
            entry(Registry::Iana, "::/8"),
            entry(Registry::RipeNcc, "141.98.8.0/22"),
        ]).into_parts().0);

        let found = table.longest_match(addr("141.98.11.145")).unwrap();
        assert_eq!("141.98.8.0/22", found.prefix().to_string());
        assert_eq!(1, table.covering(addr("141.98.11.145")).len());

        assert!(table.longest_match(addr("10.0.0.1")).is_none());
        assert!(table.covering(addr("10.0.0.1")).is_empty());

        let found = table.longest_match(addr("::1")).unwrap();
        assert_eq!("::/8", found.prefix().to_string());
    }

    #[test]
    fn should_swap_tables() {
        let handle = TableHandle::empty();
        let before = handle.load();
        assert!(before.is_empty());

        let old = handle.swap(lookup_table());
        assert!(old.is_empty());
        assert_eq!(5, handle.load().len());

        // Readers holding the old table keep it.
        assert!(before.is_empty());
    }
}
