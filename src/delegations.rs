//! Parse delegated extended stats
//!
//! See the NRO description of the format:
//! https://www.nro.net/wp-content/uploads/nro-extended-stats-readme5.txt
use std::fmt;
use std::iter::Enumerate;
use std::str::FromStr;
use std::str::Lines;
use chrono::NaiveDate;
use crate::ip::IpAddress;
use crate::ip::IpAddressFamily;


//------------ Registry -----------------------------------------------------

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize
)]
#[serde(rename_all = "lowercase")]
pub enum Registry {
    Afrinic,
    Apnic,
    Arin,
    Iana,
    Lacnic,
    RipeNcc
}

impl Registry {
    /// The five regional internet registries.
    pub const RIRS: [Registry; 5] = [
        Registry::Afrinic,
        Registry::Apnic,
        Registry::Arin,
        Registry::Lacnic,
        Registry::RipeNcc,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Registry::Afrinic => "afrinic",
            Registry::Apnic   => "apnic",
            Registry::Arin    => "arin",
            Registry::Iana    => "iana",
            Registry::Lacnic  => "lacnic",
            Registry::RipeNcc => "ripencc",
        }
    }
}

impl FromStr for Registry {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "afrinic" => Ok(Registry::Afrinic),
            "apnic"   => Ok(Registry::Apnic),
            "arin"    => Ok(Registry::Arin),
            "iana"    => Ok(Registry::Iana),
            "lacnic"  => Ok(Registry::Lacnic),
            "ripencc" => Ok(Registry::RipeNcc),
            r => Err(format!("unknown registry: {}", r))
        }
    }
}

impl fmt::Display for Registry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.pad(self.as_str())
    }
}


//------------ DelegationStatus ----------------------------------------------

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DelegationStatus {
    Allocated,
    Assigned,
    Available,
    Reserved,
    IanaPool,
    Ietf
}

impl DelegationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DelegationStatus::Allocated => "allocated",
            DelegationStatus::Assigned  => "assigned",
            DelegationStatus::Available => "available",
            DelegationStatus::Reserved  => "reserved",
            DelegationStatus::IanaPool  => "ianapool",
            DelegationStatus::Ietf      => "ietf",
        }
    }
}

impl FromStr for DelegationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allocated" => Ok(DelegationStatus::Allocated),
            "assigned"  => Ok(DelegationStatus::Assigned),
            "available" => Ok(DelegationStatus::Available),
            "reserved"  => Ok(DelegationStatus::Reserved),
            "ianapool"  => Ok(DelegationStatus::IanaPool),
            "ietf"      => Ok(DelegationStatus::Ietf),
            s => Err(format!("unknown status: {}", s))
        }
    }
}

impl fmt::Display for DelegationStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


//------------ ResourceType --------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ResourceType {
    Ipv4,
    Ipv6,
    Asn
}

impl ResourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceType::Ipv4 => "ipv4",
            ResourceType::Ipv6 => "ipv6",
            ResourceType::Asn  => "asn",
        }
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ipv4" => Ok(ResourceType::Ipv4),
            "ipv6" => Ok(ResourceType::Ipv6),
            "asn"  => Ok(ResourceType::Asn),
            t => Err(format!("unsupported resource type: {}", t))
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


//------------ Resource ------------------------------------------------------

/// The number resource a record delegates, in the registry's own encoding.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Resource {
    /// IPv4 is given as a start address and a number of addresses, which
    /// need not be a power of two.
    Ipv4 { start: IpAddress, count: u128 },

    /// IPv6 is given as a start address and a prefix length.
    Ipv6 { start: IpAddress, prefix_len: u8 },

    Asn { start: u32, count: u32 },
}

impl Resource {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Resource::Ipv4 { .. } => ResourceType::Ipv4,
            Resource::Ipv6 { .. } => ResourceType::Ipv6,
            Resource::Asn { .. }  => ResourceType::Asn,
        }
    }

    fn parse(
        inr_type: ResourceType,
        start: &str,
        value: &str
    ) -> Result<Self, String> {
        match inr_type {
            ResourceType::Ipv4 => {
                let start = Self::parse_address(start, IpAddressFamily::Ipv4)?;
                let count = u128::from_str(value)
                    .map_err(|_| format!("invalid address count: {}", value))?;
                Ok(Resource::Ipv4 { start, count })
            }
            ResourceType::Ipv6 => {
                let start = Self::parse_address(start, IpAddressFamily::Ipv6)?;
                let prefix_len = u8::from_str(value)
                    .map_err(|_| format!("invalid prefix length: {}", value))?;
                Ok(Resource::Ipv6 { start, prefix_len })
            }
            ResourceType::Asn => {
                let start = u32::from_str(start)
                    .map_err(|_| format!("invalid asn: {}", start))?;
                let count = u32::from_str(value)
                    .map_err(|_| format!("invalid asn count: {}", value))?;
                Ok(Resource::Asn { start, count })
            }
        }
    }

    fn parse_address(
        s: &str,
        family: IpAddressFamily
    ) -> Result<IpAddress, String> {
        let addr = IpAddress::from_str(s).map_err(|e| e.to_string())?;
        if addr.family() != family {
            return Err(format!("{} is not an {} address", s, family))
        }
        Ok(addr)
    }
}


//------------ DelegationRecord ----------------------------------------------

/// A single record line from a delegated stats file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DelegationRecord {
    registry: Registry,
    cc: Option<String>,
    resource: Resource,
    date: Option<NaiveDate>,
    status: DelegationStatus,
    opaque_id: Option<String>,
    line: usize,
}

impl DelegationRecord {
    pub fn registry(&self) -> Registry { self.registry }
    pub fn cc(&self) -> Option<&str> { self.cc.as_deref() }
    pub fn resource(&self) -> &Resource { &self.resource }
    pub fn resource_type(&self) -> ResourceType { self.resource.resource_type() }
    pub fn date(&self) -> Option<NaiveDate> { self.date }
    pub fn status(&self) -> DelegationStatus { self.status }
    pub fn opaque_id(&self) -> Option<&str> { self.opaque_id.as_deref() }
    pub fn line(&self) -> usize { self.line }

    fn from_fields(
        registry: Registry,
        fields: &[&str],
        line: usize
    ) -> Result<Self, String> {
        if fields.len() < 7 {
            return Err(format!(
                "expected at least 7 fields, found {}", fields.len()
            ))
        }

        let reg = Registry::from_str(fields[0])?;
        if reg != registry {
            return Err(format!("record for {} in {} stats", reg, registry))
        }

        let cc = Self::parse_cc(fields[1])?;
        let inr_type = ResourceType::from_str(fields[2])?;
        let resource = Resource::parse(inr_type, fields[3], fields[4])?;
        let date = parse_date(fields[5])?;
        let status = DelegationStatus::from_str(fields[6])?;
        let opaque_id = fields.get(7)
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .map(str::to_string);

        Ok(DelegationRecord {
            registry, cc, resource, date, status, opaque_id, line
        })
    }

    fn parse_cc(s: &str) -> Result<Option<String>, String> {
        if s.is_empty() || s == "*" {
            Ok(None)
        } else if s.len() == 2 && s.chars().all(|c| c.is_ascii_alphabetic()) {
            Ok(Some(s.to_ascii_uppercase()))
        } else {
            Err(format!("invalid country code: {}", s))
        }
    }
}

/// Dates are `yyyymmdd`. Registries use `00000000` or nothing for unknown.
fn parse_date(s: &str) -> Result<Option<NaiveDate>, String> {
    if s.is_empty() || s == "00000000" {
        return Ok(None)
    }
    if s.len() != 8 || !s.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("invalid date: {}", s))
    }
    NaiveDate::parse_from_str(s, "%Y%m%d")
        .map(Some)
        .map_err(|_| format!("invalid date: {}", s))
}


//------------ StatsHeader ---------------------------------------------------

/// The version line that opens every delegated stats file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StatsHeader {
    version: String,
    registry: String,
    serial: u64,
    records: usize,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
    utc_offset: String,
}

impl StatsHeader {
    pub fn version(&self) -> &str { &self.version }
    pub fn registry(&self) -> &str { &self.registry }
    pub fn serial(&self) -> u64 { self.serial }
    pub fn records(&self) -> usize { self.records }
    pub fn start_date(&self) -> Option<NaiveDate> { self.start_date }
    pub fn end_date(&self) -> Option<NaiveDate> { self.end_date }
    pub fn utc_offset(&self) -> &str { &self.utc_offset }

    fn parse(registry: Registry, line: &str) -> Result<Self, Error> {
        let bad = |reason: &str| {
            Error::BadHeader(registry, format!("{}: {}", reason, line))
        };

        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() != 7 {
            return Err(bad("expected 7 fields"))
        }

        // Only 2.x is known. A new major version may move fields around.
        let version = fields[0].to_string();
        let major = version.split('.').next().unwrap_or_default();
        if major != "2" {
            return Err(Error::UnsupportedVersion(registry, version))
        }

        let serial = u64::from_str(fields[2])
            .map_err(|_| bad("invalid serial"))?;
        let records = usize::from_str(fields[3])
            .map_err(|_| bad("invalid record count"))?;
        let start_date = parse_date(fields[4]).map_err(|e| bad(&e))?;
        let end_date = parse_date(fields[5]).map_err(|e| bad(&e))?;

        Ok(StatsHeader {
            version,
            registry: fields[1].to_string(),
            serial,
            records,
            start_date,
            end_date,
            utc_offset: fields[6].to_string(),
        })
    }
}


//------------ DelegatedStats ------------------------------------------------

/// Lazily parses the records of one registry's stats file.
///
/// Comment, blank and summary lines are skipped. Each remaining line yields
/// either a record or a `ParseError` for that line alone.
pub struct DelegatedStats<'a> {
    registry: Registry,
    header: StatsHeader,
    lines: Enumerate<Lines<'a>>,
    summaries: usize,
}

impl<'a> DelegatedStats<'a> {
    /// Reads up to and including the version line.
    pub fn parse(registry: Registry, text: &'a str) -> Result<Self, Error> {
        let mut lines = text.lines().enumerate();

        let header = loop {
            match lines.next() {
                None => return Err(Error::MissingHeader(registry)),
                Some((_, line)) => {
                    let line = line.trim();
                    if Self::is_skipped(line) {
                        continue
                    }
                    break StatsHeader::parse(registry, line)?
                }
            }
        };

        if header.registry != registry.as_str() {
            warn!(
                "{} stats declare registry '{}' in their version line",
                registry, header.registry
            );
        }

        Ok(DelegatedStats { registry, header, lines, summaries: 0 })
    }

    pub fn header(&self) -> &StatsHeader { &self.header }

    /// The number of summary lines seen so far.
    pub fn summaries(&self) -> usize { self.summaries }

    fn is_skipped(line: &str) -> bool {
        line.is_empty() || line.starts_with('#')
    }
}

impl<'a> Iterator for DelegatedStats<'a> {
    type Item = Result<DelegationRecord, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (idx, line) = self.lines.next()?;
            let line = line.trim();
            if Self::is_skipped(line) {
                continue
            }

            let fields: Vec<&str> = line.split('|').collect();
            if fields.len() >= 6 && fields[5] == "summary" {
                self.summaries += 1;
                continue
            }

            let line_number = idx + 1;
            let res = DelegationRecord::from_fields(
                self.registry, &fields, line_number
            ).map_err(|reason| {
                ParseError { registry: self.registry, line_number, reason }
            });
            return Some(res)
        }
    }
}


//------------ ParsedStats ---------------------------------------------------

/// All records of one stats file, with the lines that failed to parse.
#[derive(Clone, Debug)]
pub struct ParsedStats {
    header: StatsHeader,
    records: Vec<DelegationRecord>,
    failures: Vec<ParseError>,
}

impl ParsedStats {
    pub fn from_text(registry: Registry, text: &str) -> Result<Self, Error> {
        let mut stats = DelegatedStats::parse(registry, text)?;

        let mut records = vec![];
        let mut failures = vec![];
        for res in &mut stats {
            match res {
                Ok(record) => records.push(record),
                Err(err) => {
                    debug!("{}", err);
                    failures.push(err)
                }
            }
        }

        let header = stats.header;
        if header.records != records.len() {
            warn!(
                "{} stats declare {} records, parsed {}",
                registry, header.records, records.len()
            );
        }
        if !failures.is_empty() {
            warn!("{} stats: skipped {} malformed lines", registry, failures.len());
        }

        Ok(ParsedStats { header, records, failures })
    }

    pub fn header(&self) -> &StatsHeader { &self.header }
    pub fn records(&self) -> &[DelegationRecord] { &self.records }
    pub fn failures(&self) -> &[ParseError] { &self.failures }
}


//------------ ParseError ----------------------------------------------------

/// A single line that could not be parsed.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
#[display(fmt = "{} line {}: {}", registry, line_number, reason)]
pub struct ParseError {
    pub registry: Registry,
    pub line_number: usize,
    pub reason: String,
}


//------------ Error --------------------------------------------------------

/// A stats file that cannot be used at all.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum Error {
    #[display(fmt = "{} stats have no version line", _0)]
    MissingHeader(Registry),

    #[display(fmt = "{} stats use unsupported format version {}", _0, _1)]
    UnsupportedVersion(Registry, String),

    #[display(fmt = "{} stats have a malformed version line: {}", _0, _1)]
    BadHeader(Registry, String),
}

impl std::error::Error for Error {}


//------------ Tests --------------------------------------------------------
