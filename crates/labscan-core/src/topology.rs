//! Power topology: which switch controls which device

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::device::{DeviceIdentity, DeviceKey, DeviceKind};

/// Words ignored at either end of a switch load name or device name
const NAME_AFFIXES: &[&str] = &["power", "psu", "plug"];

/// How a control relationship was established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkSource {
    /// `power_switch` on a configured device
    Configured,
    /// Stored `controlled_by` from an administrative link
    Persisted,
    /// Switch load name matched the device name
    NameMatch,
}

/// A single switch → device edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerLink {
    pub device: DeviceKey,
    pub switch: DeviceKey,
    pub source: LinkSource,
}

/// Power control relationships derived from a cache snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PowerTopology {
    links: BTreeMap<DeviceKey, PowerLink>,
}

impl PowerTopology {
    /// Build relationships from identity records and configured links.
    ///
    /// `explicit` maps a device key to the key of its power switch.
    pub fn from_identities(
        records: &[DeviceIdentity],
        explicit: &BTreeMap<DeviceKey, DeviceKey>,
    ) -> Self {
        let mut links = BTreeMap::new();

        for (device, switch) in explicit {
            if device == switch {
                continue;
            }
            links.insert(
                device.clone(),
                PowerLink {
                    device: device.clone(),
                    switch: switch.clone(),
                    source: LinkSource::Configured,
                },
            );
        }

        for record in records {
            if links.contains_key(&record.device_key) {
                continue;
            }
            if let Some(switch) = &record.controlled_by {
                if switch != &record.device_key {
                    links.insert(
                        record.device_key.clone(),
                        PowerLink {
                            device: record.device_key.clone(),
                            switch: switch.clone(),
                            source: LinkSource::Persisted,
                        },
                    );
                }
            }
        }

        // Switches sorted by key so a load name claimed twice resolves the same way
        let mut switches: Vec<(&DeviceKey, String)> = records
            .iter()
            .filter_map(|record| match &record.kind {
                DeviceKind::PowerSwitch {
                    load_name: Some(load),
                    ..
                } => normalize_name(load).map(|name| (&record.device_key, name)),
                _ => None,
            })
            .collect();
        switches.sort_by(|a, b| a.0.cmp(b.0));

        for record in records {
            if links.contains_key(&record.device_key)
                || !matches!(record.kind, DeviceKind::Generic)
            {
                continue;
            }

            let names: Vec<String> = [
                record.friendly_name.as_deref(),
                record.hostname.as_deref(),
                Some(record.device_key.as_str()),
            ]
            .into_iter()
            .flatten()
            .filter_map(normalize_name)
            .collect();

            if let Some((switch, _)) = switches
                .iter()
                .find(|(_, load)| names.iter().any(|name| name == load))
            {
                links.insert(
                    record.device_key.clone(),
                    PowerLink {
                        device: record.device_key.clone(),
                        switch: (*switch).clone(),
                        source: LinkSource::NameMatch,
                    },
                );
            }
        }

        Self { links }
    }

    /// Switch controlling a device
    pub fn controller_of(&self, device: &DeviceKey) -> Option<&DeviceKey> {
        self.links.get(device).map(|link| &link.switch)
    }

    pub fn links(&self) -> impl Iterator<Item = &PowerLink> {
        self.links.values()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Set `controlled_by` on every record of a snapshot.
    ///
    /// Records without a relationship are left untouched.
    pub fn apply(&self, records: &mut [DeviceIdentity]) {
        for record in records.iter_mut() {
            if let Some(switch) = self.controller_of(&record.device_key) {
                record.controlled_by = Some(switch.clone());
            }
        }
    }
}

/// Lowercase alphanumeric form of a name with power affixes removed
fn normalize_name(name: &str) -> Option<String> {
    let tokens: Vec<String> = name
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_ascii_lowercase())
        .collect();

    let mut slice = tokens.as_slice();
    while let Some((first, rest)) = slice.split_first() {
        if NAME_AFFIXES.contains(&first.as_str()) {
            slice = rest;
        } else {
            break;
        }
    }
    while let Some((last, rest)) = slice.split_last() {
        if NAME_AFFIXES.contains(&last.as_str()) {
            slice = rest;
        } else {
            break;
        }
    }

    let mut joined = slice.concat();
    for affix in NAME_AFFIXES {
        if joined.len() > affix.len() {
            if let Some(stripped) = joined.strip_suffix(affix) {
                joined = stripped.to_string();
            } else if let Some(stripped) = joined.strip_prefix(affix) {
                joined = stripped.to_string();
            }
        }
    }

    (!joined.is_empty()).then_some(joined)
}
