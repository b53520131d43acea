//! Merge the entries of all registries into one table.
use std::fmt;
use chrono::NaiveDate;
use crate::delegations::DelegationStatus;
use crate::delegations::Registry;
use crate::ip::IpAddressFamily;
use crate::ip::IpPrefix;
use crate::table::ConsolidatedTable;
use crate::table::TableEntry;

type SortKey = (IpAddressFamily, u128, u8);


//------------ Consolidation -------------------------------------------------

/// The consolidated table with what was dropped to arrive at it.
#[derive(Clone, Debug)]
pub struct Consolidation {
    table: ConsolidatedTable,
    duplicates: usize,
    conflicts: Vec<Conflict>,
}

impl Consolidation {
    /// Merges entries from any number of registries.
    ///
    /// Exact duplicates are dropped. When more than one entry remains for
    /// the same prefix, the most recently dated one is kept and every other
    /// one is reported as a conflict. A missing date loses against any date,
    /// and on equal dates the registry that sorts first wins.
    pub fn merge<I>(entries: I) -> Self
    where I: IntoIterator<Item = TableEntry> {
        let mut entries: Vec<TableEntry> = entries.into_iter().collect();
        entries.sort_by(|a, b| Self::full_key(a).cmp(&Self::full_key(b)));

        let before = entries.len();
        entries.dedup_by(|a, b| {
            a.registry() == b.registry()
                && a.prefix() == b.prefix()
                && a.status() == b.status()
                && a.date() == b.date()
        });
        let duplicates = before - entries.len();

        let mut kept = Vec::with_capacity(entries.len());
        let mut conflicts = vec![];
        let mut entries = entries.into_iter().peekable();

        while let Some(first) = entries.next() {
            let prefix = *first.prefix();
            let mut group = vec![first];
            while let Some(next) = entries.next_if(|e| e.prefix() == &prefix) {
                group.push(next);
            }

            let winner = Self::winner(&group);
            let winner = group.swap_remove(winner);
            for loser in &group {
                let conflict = Conflict::new(&winner, loser);
                warn!("{}", conflict);
                conflicts.push(conflict);
            }
            kept.push(winner);
        }

        if duplicates > 0 {
            debug!("dropped {} duplicate entries", duplicates);
        }

        Consolidation {
            table: ConsolidatedTable::from_entries(kept),
            duplicates,
            conflicts
        }
    }

    pub fn table(&self) -> &ConsolidatedTable { &self.table }
    pub fn duplicates(&self) -> usize { self.duplicates }
    pub fn conflicts(&self) -> &[Conflict] { &self.conflicts }

    pub fn into_parts(self) -> (ConsolidatedTable, Vec<Conflict>) {
        (self.table, self.conflicts)
    }

    // Orders on everything so the outcome does not depend on input order.
    fn full_key(e: &TableEntry) -> (SortKey, Registry, Option<NaiveDate>,
                                    DelegationStatus, Option<&str>, &str) {
        (
            e.prefix().sort_key(),
            e.registry(),
            e.date(),
            e.status(),
            e.cc(),
            e.reg_id().as_str()
        )
    }

    fn winner(group: &[TableEntry]) -> usize {
        let mut best = 0;
        for (idx, entry) in group.iter().enumerate().skip(1) {
            let current = &group[best];
            if entry.date() > current.date()
                || (entry.date() == current.date()
                    && entry.registry() < current.registry())
            {
                best = idx;
            }
        }
        best
    }
}


//------------ Conflict ------------------------------------------------------

/// Two entries claiming the same prefix.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Conflict {
    prefix: IpPrefix,
    kept: ConflictSide,
    dropped: ConflictSide,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ConflictSide {
    registry: Registry,
    date: Option<NaiveDate>,
    status: DelegationStatus,
}

impl ConflictSide {
    fn new(entry: &TableEntry) -> Self {
        ConflictSide {
            registry: entry.registry(),
            date: entry.date(),
            status: entry.status()
        }
    }

    pub fn registry(&self) -> Registry { self.registry }
    pub fn date(&self) -> Option<NaiveDate> { self.date }
}

impl Conflict {
    fn new(kept: &TableEntry, dropped: &TableEntry) -> Self {
        Conflict {
            prefix: *kept.prefix(),
            kept: ConflictSide::new(kept),
            dropped: ConflictSide::new(dropped)
        }
    }

    pub fn prefix(&self) -> &IpPrefix { &self.prefix }
    pub fn kept(&self) -> &ConflictSide { &self.kept }
    pub fn dropped(&self) -> &ConflictSide { &self.dropped }

    pub fn is_cross_registry(&self) -> bool {
        self.kept.registry != self.dropped.registry
    }
}

impl fmt::Display for ConflictSide {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.date {
            Some(date) => write!(f, "{} {} {}", self.registry, self.status, date),
            None => write!(f, "{} {} (no date)", self.registry, self.status),
        }
    }
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "conflict on {}: kept {}, dropped {}",
            self.prefix, self.kept, self.dropped
        )
    }
}


//------------ Tests --------------------------------------------------------
