//! Registration identifiers.
//!
//! Extended stats carry an opaque id per record. All records with the same
//! opaque id are registered to the same holder, but only within the
//! registry that issued the id. Records without one, typically available
//! and reserved space, get a synthetic id that only depends on what the
//! record is, so it stays the same from one refresh to the next.
use std::fmt;
use crate::delegations::DelegationRecord;
use crate::delegations::DelegationStatus;
use crate::delegations::Registry;
use crate::delegations::ResourceType;


//------------ RegId ---------------------------------------------------------

/// A grouping key for one holder within one registry.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RegId(String);

impl RegId {
    /// Uses the registry's own identifier when there is one, and a
    /// synthetic one derived from the record's kind otherwise.
    pub fn resolve(
        registry: Registry,
        native: Option<&str>,
        resource_type: ResourceType,
        status: DelegationStatus,
    ) -> Self {
        match native.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => RegId(id.to_string()),
            None => Self::synthetic(registry, resource_type, status)
        }
    }

    pub fn for_record(record: &DelegationRecord) -> Self {
        Self::resolve(
            record.registry(),
            record.opaque_id(),
            record.resource_type(),
            record.status()
        )
    }

    fn synthetic(
        registry: Registry,
        resource_type: ResourceType,
        status: DelegationStatus
    ) -> Self {
        RegId(format!("{}:{}:{}", registry, resource_type, status))
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl From<String> for RegId {
    fn from(s: String) -> Self { RegId(s) }
}

impl AsRef<str> for RegId {
    fn as_ref(&self) -> &str { &self.0 }
}

impl fmt::Display for RegId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}


//------------ Tests --------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_use_native_id() {
        let id = RegId::resolve(
            Registry::Apnic,
            Some("A91872ED"),
            ResourceType::Ipv4,
            DelegationStatus::Assigned
        );
        assert_eq!("A91872ED", id.as_str());
    }

    #[test]
    fn should_derive_stable_id_when_absent() {
        let a = RegId::resolve(
            Registry::Arin,
            None,
            ResourceType::Ipv4,
            DelegationStatus::Available
        );
        let b = RegId::resolve(
            Registry::Arin,
            Some("  "),
            ResourceType::Ipv4,
            DelegationStatus::Available
        );
        assert_eq!(a, b);
        assert_eq!("arin:ipv4:available", a.as_str());

        let other_registry = RegId::resolve(
            Registry::Lacnic,
            None,
            ResourceType::Ipv4,
            DelegationStatus::Available
        );
        let other_status = RegId::resolve(
            Registry::Arin,
            None,
            ResourceType::Ipv4,
            DelegationStatus::Reserved
        );
        assert_ne!(a, other_registry);
        assert_ne!(a, other_status);
    }
}
