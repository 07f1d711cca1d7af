//! Static table of the sensors this daemon accepts and the location each one reports for.
use std::collections::HashMap;

/// Built-in sensor table, used when the configuration does not provide one.
const DEFAULT_SENSORS: [(u32, &str); 3] = [
    (9788, "Garage"),
    (12869, "Porch"),
    (13875, "Outside"),
];

#[derive(Debug, Clone)]
/// Maps a sensor identity to the name of the location it is mounted at.
///
/// The table is built once at startup and is read-only afterwards.
pub struct IdentityAllowlist {
    locations: HashMap<u32, String>,
}

impl IdentityAllowlist {
    /// Creates an allowlist from `(sensor id, location)` pairs.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (u32, S)>,
        S: Into<String>,
    {
        IdentityAllowlist {
            locations: entries.into_iter().map(|(id, name)| (id, name.into())).collect(),
        }
    }

    /// Returns the location of the sensor, or `None` if the sensor is not allowed.
    pub fn location(&self, sensor_id: u32) -> Option<&str> {
        self.locations.get(&sensor_id).map(String::as_str)
    }

    /// Distinct location names, sorted.
    pub fn locations(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.locations.values().map(String::as_str).collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

impl Default for IdentityAllowlist {
    fn default() -> Self {
        IdentityAllowlist::new(DEFAULT_SENSORS.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_maps_known_sensors() {
        let allowlist = IdentityAllowlist::default();
        assert_eq!(allowlist.location(9788), Some("Garage"));
        assert_eq!(allowlist.location(12869), Some("Porch"));
        assert_eq!(allowlist.location(13875), Some("Outside"));
        assert_eq!(allowlist.len(), 3);
    }

    #[test]
    fn unknown_sensor_is_absent() {
        let allowlist = IdentityAllowlist::default();
        assert_eq!(allowlist.location(99999), None);
        assert_eq!(allowlist.location(0), None);
    }

    #[test]
    fn locations_are_sorted_and_unique() {
        let allowlist = IdentityAllowlist::new(vec![(1, "Porch"), (2, "Garage"), (3, "Porch")]);
        assert_eq!(allowlist.locations(), vec!["Garage", "Porch"]);
    }
}
