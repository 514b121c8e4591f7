//! Driver capability tags.
//!
//! A driver publishes its capability set after `initialize`; the
//! orchestrator refuses operations the set omits. Capabilities are dynamic —
//! a driver configured without a write token drops `Writer` at init time.

use serde::{Deserialize, Serialize};

/// One advertised capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    Reader,
    Writer,
    Atomic,
    DirectLink,
    Proxy,
    PagedList,
    Multipart,
    Search,
}

impl Capability {
    const ALL: [Capability; 8] = [
        Capability::Reader,
        Capability::Writer,
        Capability::Atomic,
        Capability::DirectLink,
        Capability::Proxy,
        Capability::PagedList,
        Capability::Multipart,
        Capability::Search,
    ];

    fn bit(self) -> u16 {
        match self {
            Capability::Reader => 1 << 0,
            Capability::Writer => 1 << 1,
            Capability::Atomic => 1 << 2,
            Capability::DirectLink => 1 << 3,
            Capability::Proxy => 1 << 4,
            Capability::PagedList => 1 << 5,
            Capability::Multipart => 1 << 6,
            Capability::Search => 1 << 7,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Reader => "READER",
            Capability::Writer => "WRITER",
            Capability::Atomic => "ATOMIC",
            Capability::DirectLink => "DIRECT_LINK",
            Capability::Proxy => "PROXY",
            Capability::PagedList => "PAGED_LIST",
            Capability::Multipart => "MULTIPART",
            Capability::Search => "SEARCH",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bitset of capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapabilitySet(u16);

impl CapabilitySet {
    pub const EMPTY: CapabilitySet = CapabilitySet(0);

    pub fn new(caps: &[Capability]) -> Self {
        let mut set = CapabilitySet::EMPTY;
        for c in caps {
            set.insert(*c);
        }
        set
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }

    pub fn insert(&mut self, cap: Capability) {
        self.0 |= cap.bit();
    }

    pub fn remove(&mut self, cap: Capability) {
        self.0 &= !cap.bit();
    }

    pub fn with(mut self, cap: Capability) -> Self {
        self.insert(cap);
        self
    }

    pub fn without(mut self, cap: Capability) -> Self {
        self.remove(cap);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(|c| self.contains(*c))
    }
}

impl std::fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for cap in self.iter() {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(cap.as_str())?;
            first = false;
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

impl Serialize for CapabilitySet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

impl<'de> Deserialize<'de> for CapabilitySet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let caps = Vec::<Capability>::deserialize(deserializer)?;
        Ok(CapabilitySet::new(&caps))
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        let mut set = CapabilitySet::EMPTY;
        for c in iter {
            set.insert(c);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_contains_remove() {
        let mut set = CapabilitySet::new(&[Capability::Reader, Capability::Proxy]);
        assert!(set.contains(Capability::Reader));
        assert!(!set.contains(Capability::Writer));
        set.insert(Capability::Writer);
        assert!(set.contains(Capability::Writer));
        set.remove(Capability::Writer);
        assert!(!set.contains(Capability::Writer));
    }

    #[test]
    fn display_joins_with_pipe() {
        let set = CapabilitySet::new(&[Capability::Reader, Capability::DirectLink]);
        assert_eq!(set.to_string(), "READER|DIRECT_LINK");
        assert_eq!(CapabilitySet::EMPTY.to_string(), "-");
    }

    #[test]
    fn serde_round_trips_as_tag_list() {
        let set = CapabilitySet::new(&[Capability::Reader, Capability::Multipart]);
        let json = serde_json::to_string(&set).expect("serialize");
        assert_eq!(json, "[\"READER\",\"MULTIPART\"]");
        let back: CapabilitySet = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, set);
    }

    #[test]
    fn builder_style() {
        let set = CapabilitySet::EMPTY
            .with(Capability::Reader)
            .with(Capability::Writer)
            .without(Capability::Writer);
        assert!(set.contains(Capability::Reader));
        assert!(!set.contains(Capability::Writer));
    }
}
