//! Turn delegated resources into canonical CIDR blocks.
use crate::delegations::DelegationRecord;
use crate::delegations::Registry;
use crate::delegations::Resource;
use crate::identity::RegId;
use crate::ip::IpPrefix;
use crate::ip::IpPrefixError;
use crate::ip::IpRange;
use crate::ip::IpRangeError;
use crate::table::TableEntry;


/// Returns the aligned prefixes that exactly cover the resource.
///
/// IPv4 resources may need several prefixes when the count is not a power
/// of two or the start is not aligned to it. IPv6 resources are prefixes
/// already and must be aligned.
pub fn prefixes(resource: &Resource) -> Result<Vec<IpPrefix>, RangeErrorKind> {
    match *resource {
        Resource::Ipv4 { start, count } => {
            let range = IpRange::from_min_and_number(start, count)?;
            Ok(range.to_prefixes())
        }
        Resource::Ipv6 { start, prefix_len } => {
            Ok(vec![IpPrefix::new(start, prefix_len)?])
        }
        Resource::Asn { .. } => Err(RangeErrorKind::NotAnAddressRange)
    }
}

/// Expands one record into table entries, one per prefix, all sharing the
/// record's resolved registration id.
pub fn entries(record: &DelegationRecord) -> Result<Vec<TableEntry>, RangeError> {
    let prefixes = prefixes(record.resource()).map_err(|kind| RangeError {
        registry: record.registry(),
        line_number: record.line(),
        kind
    })?;

    let reg_id = RegId::for_record(record);
    Ok(prefixes.into_iter().map(|prefix| {
        TableEntry::new(
            record.registry(),
            record.cc().map(str::to_string),
            prefix,
            record.date(),
            record.status(),
            reg_id.clone()
        )
    }).collect())
}


//------------ NormalizedStats -----------------------------------------------

/// The table entries for one registry's records.
#[derive(Clone, Debug, Default)]
pub struct NormalizedStats {
    entries: Vec<TableEntry>,
    failures: Vec<RangeError>,
    asns: usize,
}

impl NormalizedStats {
    /// Normalizes all IP records. ASN records are counted and dropped.
    pub fn from_records(records: &[DelegationRecord]) -> Self {
        let mut res = NormalizedStats::default();

        for record in records {
            if let Resource::Asn { .. } = record.resource() {
                res.asns += 1;
                continue
            }
            match entries(record) {
                Ok(mut entries) => res.entries.append(&mut entries),
                Err(err) => {
                    debug!("{}", err);
                    res.failures.push(err);
                }
            }
        }

        if let Some(first) = res.failures.first() {
            warn!(
                "{} stats: skipped {} records with unusable ranges",
                first.registry, res.failures.len()
            );
        }

        res
    }

    pub fn entries(&self) -> &[TableEntry] { &self.entries }
    pub fn failures(&self) -> &[RangeError] { &self.failures }
    pub fn asns(&self) -> usize { self.asns }

    pub fn into_entries(self) -> Vec<TableEntry> { self.entries }
}


//------------ RangeError ----------------------------------------------------

/// A record whose resource cannot be expressed as CIDR blocks.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
#[display(fmt = "{} line {}: {}", registry, line_number, kind)]
pub struct RangeError {
    pub registry: Registry,
    pub line_number: usize,
    pub kind: RangeErrorKind,
}

#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum RangeErrorKind {
    #[display(fmt = "asn records have no address range")]
    NotAnAddressRange,

    #[display(fmt = "{}", _0)]
    Range(IpRangeError),

    #[display(fmt = "{}", _0)]
    Prefix(IpPrefixError),
}

impl From<IpRangeError> for RangeErrorKind {
    fn from(e: IpRangeError) -> Self { RangeErrorKind::Range(e) }
}

impl From<IpPrefixError> for RangeErrorKind {
    fn from(e: IpPrefixError) -> Self { RangeErrorKind::Prefix(e) }
}


//------------ Tests --------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegations::ParsedStats;
    use crate::ip::IpAddress;
    use std::str::FromStr;

    fn addr(s: &str) -> IpAddress {
        IpAddress::from_str(s).unwrap()
    }

    fn strings(prefixes: &[IpPrefix]) -> Vec<String> {
        prefixes.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn should_decompose_non_power_of_two_count() {
        let res = prefixes(
            &Resource::Ipv4 { start: addr("10.0.0.0"), count: 3 }
        ).unwrap();
        assert_eq!(vec!["10.0.0.0/31", "10.0.0.2/32"], strings(&res));
    }

    #[test]
    fn should_map_aligned_count_to_one_prefix() {
        let res = prefixes(
            &Resource::Ipv4 { start: addr("141.98.8.0"), count: 1024 }
        ).unwrap();
        assert_eq!(vec!["141.98.8.0/22"], strings(&res));
    }

    #[test]
    fn should_validate_ipv6_prefix() {
        let res = prefixes(
            &Resource::Ipv6 { start: addr("2001:db8::"), prefix_len: 32 }
        ).unwrap();
        assert_eq!(vec!["2001:db8::/32"], strings(&res));

        assert_eq!(
            Err(RangeErrorKind::Prefix(IpPrefixError::HostBitsSet)),
            prefixes(&Resource::Ipv6 { start: addr("2001:db8::1"), prefix_len: 32 })
        );
        assert_eq!(
            Err(RangeErrorKind::Prefix(IpPrefixError::LengthTooLong(130))),
            prefixes(&Resource::Ipv6 { start: addr("2001:db8::"), prefix_len: 130 })
        );
    }

    #[test]
    fn should_reject_empty_and_overflowing_ranges() {
        assert_eq!(
            Err(RangeErrorKind::Range(IpRangeError::Empty)),
            prefixes(&Resource::Ipv4 { start: addr("10.0.0.0"), count: 0 })
        );
        assert_eq!(
            Err(RangeErrorKind::Range(IpRangeError::ExceedsAddressSpace)),
            prefixes(&Resource::Ipv4 { start: addr("255.255.255.255"), count: 2 })
        );
        assert_eq!(
            Err(RangeErrorKind::NotAnAddressRange),
            prefixes(&Resource::Asn { start: 3333, count: 1 })
        );
    }

    #[test]
    fn should_share_reg_id_across_split_entries() {
        let text = "2|afrinic|1|2|00000000|20230516|+0000\n\
                    afrinic|ZA|ipv4|196.1.0.0|1280|19970101|allocated|F36B9F4B\n\
                    afrinic||ipv4|41.0.0.0|0||available|\n\
                    afrinic|ZA|asn|36864|1|20050101|allocated|F36B9F4B\n";
        let parsed = ParsedStats::from_text(Registry::Afrinic, text).unwrap();
        let normalized = NormalizedStats::from_records(parsed.records());

        assert_eq!(2, normalized.entries().len());
        assert_eq!(1, normalized.failures().len());
        assert_eq!(3, normalized.failures()[0].line_number);
        assert_eq!(1, normalized.asns());

        for entry in normalized.entries() {
            assert_eq!("F36B9F4B", entry.reg_id().as_str());
            assert_eq!(Some("ZA"), entry.cc());
        }
        assert_eq!("196.1.0.0/22", normalized.entries()[0].prefix().to_string());
        assert_eq!("196.1.4.0/24", normalized.entries()[1].prefix().to_string());
    }
}
