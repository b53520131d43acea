//! Reporting on refresh cycles and lookups.
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use chrono::DateTime;
use chrono::Utc;
use crate::consolidate::Conflict;
use crate::delegations::Registry;
use crate::table::TableEntry;


//------------ ReportFormat --------------------------------------------------

/// Output format, defaults to json.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReportFormat {
    Json,
    Text
}

impl ReportFormat {
    /// Prints the report to stdout.
    pub fn print<R>(self, report: &R) -> Result<(), serde_json::Error>
    where R: serde::Serialize + fmt::Display {
        match self {
            ReportFormat::Json => println!("{}", serde_json::to_string(report)?),
            ReportFormat::Text => print!("{}", report),
        }
        Ok(())
    }
}

impl Default for ReportFormat {
    fn default() -> Self { ReportFormat::Json }
}

impl FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(ReportFormat::Json),
            "text" => Ok(ReportFormat::Text),
            f => Err(format!("Unsupported format: {}. Supported are: json|text", f))
        }
    }
}


//------------ RegistryState -------------------------------------------------

/// What a refresh cycle made of one registry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryState {
    /// Fetched and parsed this cycle.
    Current,

    /// The source had not changed, the cached entries were used.
    Unchanged,

    /// Fetching failed, entries from an earlier cycle were used.
    Stale,

    /// Fetching failed and nothing was cached.
    Failed,
}

impl fmt::Display for RegistryState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.pad(match self {
            RegistryState::Current => "current",
            RegistryState::Unchanged => "unchanged",
            RegistryState::Stale => "stale",
            RegistryState::Failed => "failed",
        })
    }
}


//------------ RegistryReport ------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct RegistryReport {
    pub registry: Registry,
    pub state: RegistryState,

    /// Records parsed in the cycle the entries stem from.
    pub records: usize,
    pub skipped_lines: usize,
    pub skipped_records: usize,
    pub entries: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl fmt::Display for RegistryReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:<8} {:<9} records: {}, skipped lines: {}, skipped records: {}, \
             entries: {}",
            self.registry,
            self.state,
            self.records,
            self.skipped_lines,
            self.skipped_records,
            self.entries
        )?;
        if let Some(reason) = self.reason.as_ref() {
            write!(f, " ({})", reason)?;
        }
        Ok(())
    }
}


//------------ CycleReport ---------------------------------------------------

/// The outcome of one refresh cycle.
#[derive(Clone, Debug, Serialize)]
pub struct CycleReport {
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub registries: Vec<RegistryReport>,
    pub entries: usize,
    pub duplicates: usize,
    pub conflicts: Vec<Conflict>,
    pub published: PathBuf,
}

impl CycleReport {
    pub fn registry(&self, registry: Registry) -> Option<&RegistryReport> {
        self.registries.iter().find(|r| r.registry == registry)
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "Refresh started {}, finished {}",
            self.started.to_rfc3339(),
            self.finished.to_rfc3339()
        )?;
        for registry in &self.registries {
            writeln!(f, "  {}", registry)?;
        }
        writeln!(
            f,
            "Published {} entries to {} ({} duplicates, {} conflicts)",
            self.entries,
            self.published.display(),
            self.duplicates,
            self.conflicts.len()
        )?;
        for conflict in &self.conflicts {
            writeln!(f, "  {}", conflict)?;
        }
        Ok(())
    }
}


//------------ LookupReport --------------------------------------------------

/// The entries covering one address.
#[derive(Clone, Debug, Serialize)]
pub struct LookupReport {
    pub address: String,

    /// Covering entries, most specific first.
    pub matches: Vec<LookupMatch>,
}

#[derive(Clone, Debug, Serialize)]
pub struct LookupMatch {
    pub subnet: String,
    pub registry: Registry,
    pub country: Option<String>,
    pub date: Option<String>,
    pub status: String,
    pub reg_id: String,
}

impl LookupReport {
    pub fn new(address: String, covering: &[&TableEntry]) -> Self {
        let mut matches: Vec<LookupMatch> = covering.iter().map(|entry| {
            LookupMatch {
                subnet: entry.prefix().to_string(),
                registry: entry.registry(),
                country: entry.cc().map(str::to_string),
                date: entry.date().map(|d| d.to_string()),
                status: entry.status().to_string(),
                reg_id: entry.reg_id().to_string(),
            }
        }).collect();
        matches.reverse();
        LookupReport { address, matches }
    }
}

impl fmt::Display for LookupReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.matches.is_empty() {
            return writeln!(f, "{}: not found", self.address)
        }
        for m in &self.matches {
            writeln!(
                f,
                "{} {} {} {} {} {} {}",
                self.address,
                m.subnet,
                m.registry,
                m.country.as_deref().unwrap_or("-"),
                m.date.as_deref().unwrap_or("-"),
                m.status,
                m.reg_id
            )?;
        }
        Ok(())
    }
}


//------------ Tests --------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_report(state: RegistryState, reason: Option<&str>) -> RegistryReport {
        RegistryReport {
            registry: Registry::Lacnic,
            state,
            records: 10,
            skipped_lines: 1,
            skipped_records: 0,
            entries: 12,
            reason: reason.map(str::to_string),
        }
    }

    #[test]
    fn should_parse_format() {
        assert_eq!(Ok(ReportFormat::Json), ReportFormat::from_str("json"));
        assert_eq!(Ok(ReportFormat::Text), ReportFormat::from_str("text"));
        assert!(ReportFormat::from_str("html").is_err());
    }

    #[test]
    fn should_serialize_registry_report() {
        let json = serde_json::to_string(
            &registry_report(RegistryState::Stale, Some("HTTP status 503"))
        ).unwrap();
        assert_eq!(
            "{\"registry\":\"lacnic\",\"state\":\"stale\",\"records\":10,\
             \"skipped_lines\":1,\"skipped_records\":0,\"entries\":12,\
             \"reason\":\"HTTP status 503\"}",
            json
        );

        let json = serde_json::to_string(
            &registry_report(RegistryState::Current, None)
        ).unwrap();
        assert!(!json.contains("reason"));
    }

    #[test]
    fn should_show_failed_registries() {
        let report = registry_report(RegistryState::Failed, Some("timed out"));
        assert_eq!(
            "lacnic   failed    records: 10, skipped lines: 1, \
             skipped records: 0, entries: 12 (timed out)",
            report.to_string()
        );
    }
}
