//! Zone registry - the closed set of output zones for a deployment
//!
//! Concrete zones are fixed at startup. "All Zones" is a derived aggregate:
//! it is selected exactly when every concrete zone is.

use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::models::ZoneSet;

/// Name of the aggregate meta-zone
pub const ALL_ZONES: &str = "All Zones";

/// Ordered set of concrete zones
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneRegistry {
    zones: Vec<String>,
}

impl ZoneRegistry {
    /// Create a registry; names must be non-empty, unique and not the aggregate
    pub fn new(zones: Vec<String>) -> Result<Self> {
        if zones.is_empty() {
            return Err(Error::InvalidZones("zone registry is empty".into()));
        }

        let mut seen = BTreeSet::new();
        for zone in &zones {
            let trimmed = zone.trim();
            if trimmed.is_empty() {
                return Err(Error::InvalidZones("zone name is empty".into()));
            }
            if trimmed == ALL_ZONES {
                return Err(Error::InvalidZones(format!(
                    "\"{}\" is reserved for the aggregate",
                    ALL_ZONES
                )));
            }
            if !seen.insert(trimmed) {
                return Err(Error::InvalidZones(format!("duplicate zone \"{}\"", trimmed)));
            }
        }

        Ok(Self {
            zones: zones.into_iter().map(|z| z.trim().to_string()).collect(),
        })
    }

    /// Concrete zones in display order
    pub fn list(&self) -> &[String] {
        &self.zones
    }

    /// Aggregate first, then concrete zones, as checkbox lists show them
    pub fn list_with_aggregate(&self) -> Vec<String> {
        std::iter::once(ALL_ZONES.to_string())
            .chain(self.zones.iter().cloned())
            .collect()
    }

    pub fn contains(&self, zone: &str) -> bool {
        self.zones.iter().any(|z| z == zone)
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// Every concrete zone
    pub fn full_set(&self) -> ZoneSet {
        self.zones.iter().cloned().collect()
    }

    pub fn is_full(&self, zones: &ZoneSet) -> bool {
        self.zones.iter().all(|z| zones.contains(z))
    }

    /// Expand and check a zone selection.
    ///
    /// "All Zones" expands to every concrete zone. Order and duplicates in
    /// the input do not matter.
    pub fn validate<S: AsRef<str>>(&self, names: &[S]) -> Result<ZoneSet> {
        let mut set = ZoneSet::new();
        for name in names {
            let name = name.as_ref().trim();
            if name == ALL_ZONES {
                set.extend(self.zones.iter().cloned());
            } else if self.contains(name) {
                set.insert(name.to_string());
            } else {
                return Err(Error::InvalidZones(format!("unknown zone \"{}\"", name)));
            }
        }

        if set.is_empty() {
            return Err(Error::InvalidZones("select at least one zone".into()));
        }
        Ok(set)
    }

    /// Display form of a zone set: the aggregate when full, else registry order
    pub fn collapse(&self, zones: &ZoneSet) -> Vec<String> {
        if !zones.is_empty() && self.is_full(zones) {
            return vec![ALL_ZONES.to_string()];
        }
        self.zones
            .iter()
            .filter(|z| zones.contains(*z))
            .cloned()
            .collect()
    }
}

/// Checkbox-style zone selection as the dashboard presents it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneSelection {
    registry: ZoneRegistry,
    selected: ZoneSet,
}

impl ZoneSelection {
    /// Start with nothing selected
    pub fn new(registry: ZoneRegistry) -> Self {
        Self {
            registry,
            selected: ZoneSet::new(),
        }
    }

    pub fn is_selected(&self, zone: &str) -> bool {
        if zone == ALL_ZONES {
            return self.all_selected();
        }
        self.selected.contains(zone)
    }

    pub fn all_selected(&self) -> bool {
        self.registry.is_full(&self.selected)
    }

    pub fn selected(&self) -> &ZoneSet {
        &self.selected
    }

    /// Flip one checkbox.
    ///
    /// Toggling the aggregate selects everything unless everything is
    /// already selected, in which case it clears everything. Partial
    /// selections do not survive a round trip through the aggregate.
    pub fn toggle(&mut self, zone: &str) -> Result<()> {
        self.selected = self.toggled(zone)?;
        Ok(())
    }

    /// Flip one checkbox, refusing to leave zero zones while broadcasting
    pub fn toggle_guarded(&mut self, zone: &str, broadcasting: bool) -> Result<()> {
        let next = self.toggled(zone)?;
        if broadcasting && next.is_empty() {
            let reason = if zone == ALL_ZONES {
                "cannot unselect all zones while broadcasting"
            } else {
                "at least one zone must remain active during broadcast"
            };
            return Err(Error::InvalidZones(reason.into()));
        }
        self.selected = next;
        Ok(())
    }

    /// Validated zone set for an admission request
    pub fn to_zone_set(&self) -> Result<ZoneSet> {
        if self.selected.is_empty() {
            return Err(Error::InvalidZones("select at least one zone".into()));
        }
        Ok(self.selected.clone())
    }

    pub fn labels(&self) -> Vec<String> {
        self.registry.collapse(&self.selected)
    }

    fn toggled(&self, zone: &str) -> Result<ZoneSet> {
        if zone == ALL_ZONES {
            return Ok(if self.all_selected() {
                ZoneSet::new()
            } else {
                self.registry.full_set()
            });
        }

        if !self.registry.contains(zone) {
            return Err(Error::InvalidZones(format!("unknown zone \"{}\"", zone)));
        }

        let mut next = self.selected.clone();
        if !next.remove(zone) {
            next.insert(zone.to_string());
        }
        Ok(next)
    }
}
