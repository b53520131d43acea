//! IP addresses, ranges and prefixes.
//!
//! Both address families share a single `u128` value space: IPv4 addresses
//! live in the IPv4-mapped block `::ffff:0:0/96`. This keeps IPv4 and IPv6
//! ranges comparable and lets one interval tree index both families.
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::ops::Range;
use std::str::FromStr;
use intervaltree::Element;
use intervaltree::IntervalTree;
use serde::Serialize;
use serde::Serializer;

// Idea inspired by the IP implementation in Golang
const IPV4_IN_IPV6: u128 = 0xffff_0000_0000;
const IPV4_MASK: u128 = 0xffff_ffff_ffff_ffff_ffff_ffff_0000_0000;


//------------ IpAddressFamily -----------------------------------------------

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum IpAddressFamily {
    Ipv4,
    Ipv6
}

impl IpAddressFamily {
    /// Number of bits in an address of this family.
    pub fn bits(self) -> u8 {
        match self {
            IpAddressFamily::Ipv4 => 32,
            IpAddressFamily::Ipv6 => 128,
        }
    }
}

impl fmt::Display for IpAddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IpAddressFamily::Ipv4 => write!(f, "ipv4"),
            IpAddressFamily::Ipv6 => write!(f, "ipv6"),
        }
    }
}


//------------ IpAddress -----------------------------------------------------

/// An IPv4 or IPv6 address. IPv4-mapped IPv6 addresses are IPv4.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct IpAddress {
    value: u128
}

impl IpAddress {
    pub fn v4(value: u32) -> Self {
        IpAddress { value: IPV4_IN_IPV6 | u128::from(value) }
    }

    pub fn v6(value: u128) -> Self {
        IpAddress { value }
    }

    /// The value in the shared v4-mapped space.
    pub fn value(&self) -> u128 { self.value }

    pub fn family(&self) -> IpAddressFamily {
        if self.value & IPV4_MASK == IPV4_IN_IPV6 {
            IpAddressFamily::Ipv4
        } else {
            IpAddressFamily::Ipv6
        }
    }

    /// The value within the address family's own space.
    fn host_value(&self) -> u128 {
        match self.family() {
            IpAddressFamily::Ipv4 => self.value & 0xffff_ffff,
            IpAddressFamily::Ipv6 => self.value,
        }
    }

    fn from_host_value(family: IpAddressFamily, value: u128) -> Self {
        match family {
            IpAddressFamily::Ipv4 => IpAddress { value: IPV4_IN_IPV6 | value },
            IpAddressFamily::Ipv6 => IpAddress { value },
        }
    }
}

impl FromStr for IpAddress {
    type Err = IpAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains(':') {
            let addr = Ipv6Addr::from_str(s)
                .map_err(|_| IpAddressError::parse_error(s))?;
            Ok(IpAddress::v6(u128::from(addr)))
        } else if s.contains('.') {
            let addr = Ipv4Addr::from_str(s)
                .map_err(|_| IpAddressError::parse_error(s))?;
            Ok(IpAddress::v4(u32::from(addr)))
        } else {
            Err(IpAddressError::parse_error(s))
        }
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.family() {
            IpAddressFamily::Ipv4 => {
                write!(f, "{}", Ipv4Addr::from(self.host_value() as u32))
            }
            IpAddressFamily::Ipv6 => {
                write!(f, "{}", Ipv6Addr::from(self.value))
            }
        }
    }
}


//------------ IpRange -------------------------------------------------------

/// An inclusive range of addresses within one address family.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct IpRange {
    min: IpAddress,
    max: IpAddress,
}

impl IpRange {
    /// Creates the range of `number` addresses starting at `min`, which is
    /// how delegated stats express IPv4 resources.
    pub fn from_min_and_number(
        min: IpAddress,
        number: u128
    ) -> Result<Self, IpRangeError> {
        if number == 0 {
            return Err(IpRangeError::Empty)
        }
        let family = min.family();
        let last = min.host_value()
            .checked_add(number - 1)
            .filter(|last| *last <= family_max(family))
            .ok_or(IpRangeError::ExceedsAddressSpace)?;

        Ok(IpRange { min, max: IpAddress::from_host_value(family, last) })
    }

    /// The range holding just the one address.
    pub fn single(addr: IpAddress) -> Self {
        IpRange { min: addr, max: addr }
    }

    pub fn min(&self) -> IpAddress { self.min }
    pub fn max(&self) -> IpAddress { self.max }
    pub fn family(&self) -> IpAddressFamily { self.min.family() }

    pub fn contains(&self, other: &IpRange) -> bool {
        self.min.value <= other.min.value && other.max.value <= self.max.value
    }

    pub fn contains_address(&self, addr: IpAddress) -> bool {
        self.min.value <= addr.value && addr.value <= self.max.value
    }

    /// Splits the range into the minimal list of aligned prefixes covering
    /// it exactly, in ascending order.
    ///
    /// At each step the largest block that is aligned on the current address
    /// and does not run past the end of the range is taken.
    pub fn to_prefixes(&self) -> Vec<IpPrefix> {
        let family = self.family();
        let width = u32::from(family.bits());
        let end = self.max.host_value();
        let mut current = self.min.host_value();
        let mut res = vec![];

        loop {
            let align_bits = if current == 0 {
                width
            } else {
                current.trailing_zeros().min(width)
            };

            let remaining = end - current;
            let fit_bits = if remaining == u128::MAX {
                128
            } else {
                127 - (remaining + 1).leading_zeros()
            };

            let bits = align_bits.min(fit_bits);
            let last = current | low_mask(bits);

            let min = IpAddress::from_host_value(family, current);
            let max = IpAddress::from_host_value(family, last);
            res.push(IpPrefix {
                range: IpRange { min, max },
                length: (width - bits) as u8
            });

            if last >= end {
                break
            }
            current = last + 1;
        }

        res
    }
}

fn family_max(family: IpAddressFamily) -> u128 {
    low_mask(u32::from(family.bits()))
}

/// A value with the lowest `bits` bits set.
fn low_mask(bits: u32) -> u128 {
    if bits >= 128 {
        u128::MAX
    } else {
        (1u128 << bits) - 1
    }
}


//------------ IpPrefix ------------------------------------------------------

/// An aligned CIDR block.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct IpPrefix {
    range: IpRange,
    length: u8
}

impl IpPrefix {
    pub fn new(addr: IpAddress, length: u8) -> Result<Self, IpPrefixError> {
        let family = addr.family();
        if length > family.bits() {
            return Err(IpPrefixError::LengthTooLong(length))
        }

        let host_bits = u32::from(family.bits() - length);
        let mask = low_mask(host_bits);
        if addr.host_value() & mask != 0 {
            return Err(IpPrefixError::HostBitsSet)
        }

        let max = IpAddress::from_host_value(family, addr.host_value() | mask);
        Ok(IpPrefix { range: IpRange { min: addr, max }, length })
    }

    pub fn addr(&self) -> IpAddress { self.range.min }
    pub fn length(&self) -> u8 { self.length }
    pub fn family(&self) -> IpAddressFamily { self.range.family() }

    pub fn contains(&self, addr: IpAddress) -> bool {
        self.range.contains_address(addr)
    }

    /// Key ordering prefixes by family, then start address, then length.
    pub fn sort_key(&self) -> (IpAddressFamily, u128, u8) {
        (self.family(), self.range.min.value, self.length)
    }
}

impl AsRef<IpRange> for IpPrefix {
    fn as_ref(&self) -> &IpRange {
        &self.range
    }
}

impl FromStr for IpPrefix {
    type Err = IpPrefixError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut values = s.split('/');
        let addr_str = values.next().ok_or(IpPrefixError::MissingLength)?;
        let len_str = values.next().ok_or(IpPrefixError::MissingLength)?;

        let addr = IpAddress::from_str(addr_str.trim())?;
        let length = u8::from_str(len_str.trim())
            .map_err(|_| IpPrefixError::ParseError(s.to_string()))?;

        IpPrefix::new(addr, length)
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.range.min, self.length)
    }
}

impl Serialize for IpPrefix {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}


//------------ IpRangeTree ---------------------------------------------------

/// An immutable index of values by the IP range they refer to.
pub struct IpRangeTree<V: AsRef<IpRange>> {
    tree: IntervalTree<u128, V>,
    len: usize,
}

impl<V: AsRef<IpRange>> IpRangeTree<V> {
    pub fn len(&self) -> usize { self.len }

    pub fn is_empty(&self) -> bool { self.len == 0 }

    /// Values whose range equals or contains the given range.
    pub fn matching_or_less_specific(&self, range: &IpRange) -> Vec<&V> {
        self.tree.query(Self::interval(range))
            .map(|el| &el.value)
            .filter(|v| v.as_ref().contains(range))
            .collect()
    }

    // Intervals are half open. A range ending on the very last IPv6 address
    // loses that single address.
    fn interval(range: &IpRange) -> Range<u128> {
        range.min.value..range.max.value.saturating_add(1)
    }
}

impl<V: AsRef<IpRange>> fmt::Debug for IpRangeTree<V> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("IpRangeTree").field("len", &self.len).finish()
    }
}

pub struct IpRangeTreeBuilder<V: AsRef<IpRange>> {
    values: Vec<V>
}

impl<V: AsRef<IpRange>> IpRangeTreeBuilder<V> {
    pub fn empty() -> Self {
        IpRangeTreeBuilder { values: vec![] }
    }

    pub fn add(&mut self, value: V) {
        self.values.push(value);
    }

    pub fn build(self) -> IpRangeTree<V> {
        let len = self.values.len();
        let tree = self.values.into_iter().map(|v| {
            let range = IpRangeTree::<V>::interval(v.as_ref());
            Element { range, value: v }
        }).collect();

        IpRangeTree { tree, len }
    }
}


//------------ Errors --------------------------------------------------------

#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum IpAddressError {
    #[display(fmt = "Not an IP address: {}", _0)]
    ParseError(String),
}

impl IpAddressError {
    fn parse_error(s: &str) -> Self {
        IpAddressError::ParseError(s.to_string())
    }
}

#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum IpRangeError {
    #[display(fmt = "Range is empty")]
    Empty,

    #[display(fmt = "Range runs past the end of the address space")]
    ExceedsAddressSpace,
}

#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum IpPrefixError {
    #[display(fmt = "Prefix length {} too long for address family", _0)]
    LengthTooLong(u8),

    #[display(fmt = "Prefix address has host bits set")]
    HostBitsSet,

    #[display(fmt = "Expected address/length")]
    MissingLength,

    #[display(fmt = "Cannot parse prefix: {}", _0)]
    ParseError(String),
}

impl From<IpAddressError> for IpPrefixError {
    fn from(e: IpAddressError) -> Self {
        IpPrefixError::ParseError(e.to_string())
    }
}


//------------ Tests --------------------------------------------------------

#[cfg(test)]
mod tests {

    use super::*;
    use proptest::prelude::*;

    fn addr(s: &str) -> IpAddress {
        IpAddress::from_str(s).unwrap()
    }

    fn prefixes(start: &str, count: u128) -> Vec<String> {
        IpRange::from_min_and_number(addr(start), count).unwrap()
            .to_prefixes()
            .iter()
            .map(|p| p.to_string())
            .collect()
    }

    #[test]
    fn should_make_ipv4_from_string() {
        assert_eq!(IPV4_IN_IPV6, addr("0.0.0.0").value());
        assert_eq!(IPV4_IN_IPV6 | 255, addr("0.0.0.255").value());
        assert_eq!(IPV4_IN_IPV6 | 256, addr("0.0.1.0").value());
        assert_eq!(IPV4_IN_IPV6 | 65536, addr("0.1.0.0").value());
        assert_eq!(IPV4_IN_IPV6 | 16777216, addr("1.0.0.0").value());

        assert!(IpAddress::from_str("yadiyada").is_err());
        assert!(IpAddress::from_str("").is_err());
        assert!(IpAddress::from_str("1.1").is_err());
        assert!(IpAddress::from_str("256.0.0.0").is_err());
    }

    #[test]
    fn should_tell_family() {
        assert_eq!(IpAddressFamily::Ipv4, addr("0.0.0.0").family());
        assert_eq!(IpAddressFamily::Ipv4, addr("255.255.255.255").family());
        assert_eq!(IpAddressFamily::Ipv6, addr("2001:db8::").family());
        assert_eq!(IpAddressFamily::Ipv6, addr("::").family());
    }

    #[test]
    fn should_display_addresses() {
        assert_eq!("141.98.8.0", addr("141.98.8.0").to_string());
        assert_eq!("2001:db8::", addr("2001:0db8:0::").to_string());
    }

    #[test]
    fn should_reject_invalid_range() {
        assert_eq!(
            Err(IpRangeError::Empty),
            IpRange::from_min_and_number(addr("10.0.0.0"), 0)
        );
        assert_eq!(
            Err(IpRangeError::ExceedsAddressSpace),
            IpRange::from_min_and_number(addr("255.255.255.0"), 512)
        );
        assert!(IpRange::from_min_and_number(addr("255.255.255.0"), 256).is_ok());
    }

    #[test]
    fn should_make_single_prefix_for_aligned_range() {
        assert_eq!(vec!["141.98.8.0/22"], prefixes("141.98.8.0", 1024));
        assert_eq!(vec!["10.0.0.0/8"], prefixes("10.0.0.0", 16_777_216));
        assert_eq!(vec!["0.0.0.0/0"], prefixes("0.0.0.0", 1 << 32));
        assert_eq!(vec!["192.0.2.7/32"], prefixes("192.0.2.7", 1));
    }

    #[test]
    fn should_split_unaligned_range() {
        assert_eq!(vec!["10.0.0.0/31", "10.0.0.2/32"], prefixes("10.0.0.0", 3));
        assert_eq!(
            vec!["10.0.0.1/32", "10.0.0.2/31", "10.0.0.4/32"],
            prefixes("10.0.0.1", 4)
        );
        assert_eq!(
            vec!["196.1.0.0/22", "196.1.4.0/24"],
            prefixes("196.1.0.0", 1280)
        );
    }

    #[test]
    fn should_parse_prefix() {
        let pfx = IpPrefix::from_str("2001:db8::/32").unwrap();
        assert_eq!(IpAddressFamily::Ipv6, pfx.family());
        assert_eq!(32, pfx.length());
        assert!(pfx.contains(addr("2001:db8:ffff::1")));
        assert!(!pfx.contains(addr("2001:db9::")));

        assert_eq!(
            Err(IpPrefixError::HostBitsSet),
            IpPrefix::from_str("10.0.0.1/24")
        );
        assert_eq!(
            Err(IpPrefixError::LengthTooLong(33)),
            IpPrefix::from_str("10.0.0.0/33")
        );
        assert_eq!(
            Err(IpPrefixError::LengthTooLong(129)),
            IpPrefix::from_str("2001:db8::/129")
        );
    }

    #[test]
    fn should_find_less_specific() {
        let mut builder = IpRangeTreeBuilder::empty();
        for p in &["10.0.0.0/8", "10.1.0.0/16", "10.1.2.0/24", "11.0.0.0/8"] {
            builder.add(IpPrefix::from_str(p).unwrap());
        }
        let tree = builder.build();
        assert_eq!(4, tree.len());

        let less = tree.matching_or_less_specific(&IpRange::single(addr("10.1.2.3")));
        assert_eq!(3, less.len());

        let less = tree.matching_or_less_specific(&IpRange::single(addr("12.0.0.0")));
        assert!(less.is_empty());
    }

    /// A start address and a count that stay within the IPv4 space.
    fn ipv4_start_and_count() -> impl Strategy<Value = (u32, u128)> {
        any::<u32>().prop_flat_map(|start| {
            let room = (1u128 << 32) - u128::from(start);
            (Just(start), 1..=room)
        })
    }

    proptest! {
        /// The blocks are aligned, follow each other without gaps and
        /// cover exactly the addresses of the range.
        #[test]
        fn prop_prefixes_cover_range_exactly((start, count) in ipv4_start_and_count()) {
            let range = IpRange::from_min_and_number(IpAddress::v4(start), count).unwrap();
            let blocks = range.to_prefixes();

            let mut next = range.min().value();
            let mut total = 0u128;
            for block in &blocks {
                prop_assert_eq!(IpAddressFamily::Ipv4, block.family());
                prop_assert_eq!(next, block.addr().value());
                prop_assert!(IpPrefix::new(block.addr(), block.length()).is_ok());

                let block_range: &IpRange = block.as_ref();
                total += block_range.max().value() - block_range.min().value() + 1;
                next = block_range.max().value() + 1;
            }
            prop_assert_eq!(count, total);
            prop_assert_eq!(range.max().value() + 1, next);
        }

        /// No two neighbouring blocks could be merged into one aligned
        /// block, so the list cannot get any shorter.
        #[test]
        fn prop_prefixes_are_minimal((start, count) in ipv4_start_and_count()) {
            let range = IpRange::from_min_and_number(IpAddress::v4(start), count).unwrap();
            let blocks = range.to_prefixes();

            prop_assert!(blocks.len() <= 62);
            for pair in blocks.windows(2) {
                let (left, right) = (&pair[0], &pair[1]);
                if left.length() == right.length() && left.length() > 0 {
                    let merged = IpPrefix::new(left.addr(), left.length() - 1);
                    prop_assert!(merged.is_err(), "{} and {} merge", left, right);
                }
            }
        }
    }
}
