//! The live in-memory model of a bridge's devices, zones, areas, buttons and
//! occupancy groups. Entities live in arena maps owned by the `Bridge`
//! engine; cross-references between them are ids, resolved on demand, so
//! the maps are never replaced wholesale across a reconnect — only mutated
//! in place.

use std::collections::{HashMap, HashSet};

/// The final numeric segment of a bridge href, e.g. `/zone/3` -> `3`.
pub type Id = u64;

/// Extract the trailing numeric id from a bridge href such as `/device/12`.
pub fn id_from_href(href: &str) -> Option<Id> {
    href.rsplit('/').next()?.parse().ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Occupancy {
    Occupied,
    Unoccupied,
    Unknown,
}

impl Occupancy {
    pub fn from_status(s: &str) -> Self {
        match s {
            "Occupied" => Occupancy::Occupied,
            "Unoccupied" => Occupancy::Unoccupied,
            _ => Occupancy::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanSpeed {
    Off,
    Low,
    Medium,
    MediumHigh,
    High,
}

impl FanSpeed {
    pub fn as_leap_str(self) -> &'static str {
        match self {
            FanSpeed::Off => "Off",
            FanSpeed::Low => "Low",
            FanSpeed::Medium => "Medium",
            FanSpeed::MediumHigh => "MediumHigh",
            FanSpeed::High => "High",
        }
    }

    pub fn from_leap_str(s: &str) -> Option<Self> {
        Some(match s {
            "Off" => FanSpeed::Off,
            "Low" => FanSpeed::Low,
            "Medium" => FanSpeed::Medium,
            "MediumHigh" => FanSpeed::MediumHigh,
            "High" => FanSpeed::High,
            _ => return None,
        })
    }
}

/// Which of the two LEAP topology shapes a bridge speaks, discovered from
/// `/server/1/systemtype` during bootstrap step 1. Caseta/RA2 Select bridges
/// expose a single flat area list; RA3/HomeWorks QSX processors nest areas
/// under one or more `/processor` entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeFlavor {
    CasetaLike,
    ProcessorLike,
}

/// Classify a `/server/1/systemtype` response body into a flavor. Unknown or
/// missing `SystemType` strings default to `CasetaLike`, the simpler, flatter
/// shape: a bridge that doesn't advertise itself as a processor is assumed
/// not to require per-processor area scoping.
pub fn classify_system_type(body: &serde_json::Value) -> BridgeFlavor {
    let system_type = body
        .get("SystemType")
        .and_then(|s| s.as_str())
        .unwrap_or_default();
    match system_type {
        "RA3" | "HWQS" | "HomeWorksQSX" => BridgeFlavor::ProcessorLike,
        _ => BridgeFlavor::CasetaLike,
    }
}

/// The library's classification of a bridge-reported device `type` string,
/// used to pick the right command shape in the public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceDomain {
    Light,
    Fan,
    Cover,
    Switch,
    Sensor,
    Remote,
    KeypadButton,
    Unknown,
}

/// Classify a bridge-reported device type string into a domain. This table
/// is deliberately small and literal: LEAP's device-type vocabulary is
/// stable across firmware revisions and new types are additive.
pub fn classify_device_type(device_type: &str) -> DeviceDomain {
    match device_type {
        "WallDimmer" | "PlugInDimmer" | "SunnataDimmer" | "Dimmed" => DeviceDomain::Light,
        "WallSwitch" | "PlugInSwitch" | "SunnataSwitch" | "OutdoorPlugInSwitch" => {
            DeviceDomain::Switch
        }
        "FanSpeedController" | "CasetaFanSpeedController" => DeviceDomain::Fan,
        "SerenaHoneycombShade" | "SerenaRollerShade" | "TriathlonShade" | "QsWirelessShade" => {
            DeviceDomain::Cover
        }
        "RPSOccupancySensor" | "RPSCeilingMountedOccupancySensor" => DeviceDomain::Sensor,
        "Pico2Button"
        | "Pico3Button"
        | "Pico3ButtonRaiseLower"
        | "Pico4Button"
        | "FourGroupRemote" => DeviceDomain::Remote,
        "SunnataKeypad" | "SeeTouchKeypad" | "HybridSeeTouchKeypad" | "HomeownerKeypad" => {
            DeviceDomain::KeypadButton
        }
        _ => DeviceDomain::Unknown,
    }
}

#[derive(Debug, Clone, Default)]
pub struct Area {
    pub id: Id,
    pub href: String,
    pub name: String,
    pub parent_id: Option<Id>,
    pub children: HashSet<Id>,
    pub control_station_ids: HashSet<Id>,
    pub sensor_ids: HashSet<Id>,
    pub occupancy_group_id: Option<Id>,
    pub occupancy: Option<Occupancy>,
}

#[derive(Debug, Clone, Default)]
pub struct Device {
    pub id: Id,
    pub href: String,
    /// Fully qualified, "/"-joined name as reported by the bridge.
    pub name: String,
    /// Leaf name with the area-name prefix stripped (see `strip_name_prefix`).
    pub device_name: String,
    pub device_type: String,
    pub model: Option<String>,
    pub serial: Option<String>,
    pub area_id: Option<Id>,
    pub zone_id: Option<Id>,
    pub button_group_ids: Vec<Id>,
    pub occupancy_sensor_ids: Vec<Id>,
    pub current_state: Option<i64>,
    pub fan_speed: Option<FanSpeed>,
    pub tilt: Option<i64>,
    pub button_led_ids: Vec<Id>,
    pub type_extras: serde_json::Map<String, serde_json::Value>,
}

impl Device {
    pub fn domain(&self) -> DeviceDomain {
        classify_device_type(&self.device_type)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Zone {
    pub id: Id,
    pub href: String,
    pub name: String,
    pub device_id: Id,
}

#[derive(Debug, Clone, Default)]
pub struct ButtonGroup {
    pub id: Id,
    pub href: String,
    pub parent_device_id: Id,
    pub button_ids: Vec<Id>,
}

#[derive(Debug, Clone, Default)]
pub struct Button {
    pub id: Id,
    pub href: String,
    pub parent_device_id: Id,
    pub number: i64,
    pub name: String,
    pub engraving: Option<String>,
    pub led_id: Option<Id>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonEventType {
    Press,
    Release,
}

impl ButtonEventType {
    pub fn from_leap_str(s: &str) -> Option<Self> {
        match s {
            "Press" => Some(ButtonEventType::Press),
            "Release" => Some(ButtonEventType::Release),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OccupancyGroup {
    pub id: Id,
    pub href: String,
    pub status: Occupancy,
    pub sensor_ids: Vec<Id>,
    pub associated_area_id: Option<Id>,
}

impl Default for Occupancy {
    fn default() -> Self {
        Occupancy::Unknown
    }
}

#[derive(Debug, Clone, Default)]
pub struct Scene {
    pub id: Id,
    pub href: String,
    pub name: String,
}

/// Strip a leading `"<area name><separator>"` prefix from a fully qualified
/// device name, yielding the bridge's `device_name`. This mirrors the
/// deterministic rule firmware decorations must be undone by: if the name
/// doesn't begin with the area name, it is returned unchanged.
pub fn strip_name_prefix(full_name: &str, area_name: &str) -> String {
    for sep in ["_", " ", "/"] {
        let prefix = format!("{area_name}{sep}");
        if let Some(stripped) = full_name.strip_prefix(&prefix) {
            return stripped.to_string();
        }
    }
    full_name.to_string()
}

/// All arena maps for one bridge's worth of entities. Instances of this
/// struct are never replaced across a reconnect: `Bridge::bootstrap` mutates
/// an existing `Model` in place so external holders of e.g. `Arc<Device>`
/// (via the snapshot accessors) keep observing the same identity.
#[derive(Debug, Default)]
pub struct Model {
    pub areas: HashMap<Id, Area>,
    pub devices: HashMap<Id, Device>,
    pub zones: HashMap<Id, Zone>,
    pub button_groups: HashMap<Id, ButtonGroup>,
    pub buttons: HashMap<Id, Button>,
    pub occupancy_groups: HashMap<Id, OccupancyGroup>,
    pub scenes: HashMap<Id, Scene>,
    /// zone id -> device id, kept in sync with `devices[_].zone_id`.
    pub zone_to_device: HashMap<Id, Id>,
}

impl Model {
    pub fn device_by_zone(&self, zone_id: Id) -> Option<&Device> {
        self.zone_to_device
            .get(&zone_id)
            .and_then(|id| self.devices.get(id))
    }

    pub fn device_by_zone_mut(&mut self, zone_id: Id) -> Option<&mut Device> {
        let device_id = *self.zone_to_device.get(&zone_id)?;
        self.devices.get_mut(&device_id)
    }

    pub fn button_by_id(&self, button_id: Id) -> Option<&Button> {
        self.buttons.get(&button_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_from_href_extracts_trailing_segment() {
        assert_eq!(id_from_href("/device/12"), Some(12));
        assert_eq!(id_from_href("/zone/3"), Some(3));
        assert_eq!(id_from_href("/area"), None);
    }

    #[test]
    fn strip_name_prefix_removes_area_prefix() {
        assert_eq!(
            strip_name_prefix("Kitchen_Pendant Light", "Kitchen"),
            "Pendant Light"
        );
        assert_eq!(
            strip_name_prefix("Living Room Lamp", "Living Room"),
            "Lamp"
        );
    }

    #[test]
    fn strip_name_prefix_leaves_unrelated_names_unchanged() {
        assert_eq!(strip_name_prefix("Foyer Sconces", "Kitchen"), "Foyer Sconces");
    }

    #[test]
    fn classify_system_type_detects_processor_like_bridges() {
        assert_eq!(
            classify_system_type(&serde_json::json!({"SystemType": "RA3"})),
            BridgeFlavor::ProcessorLike
        );
        assert_eq!(
            classify_system_type(&serde_json::json!({"SystemType": "CasetaP2"})),
            BridgeFlavor::CasetaLike
        );
        assert_eq!(
            classify_system_type(&serde_json::json!({})),
            BridgeFlavor::CasetaLike
        );
    }

    #[test]
    fn classify_device_type_table() {
        assert_eq!(classify_device_type("WallDimmer"), DeviceDomain::Light);
        assert_eq!(
            classify_device_type("FanSpeedController"),
            DeviceDomain::Fan
        );
        assert_eq!(
            classify_device_type("SerenaRollerShade"),
            DeviceDomain::Cover
        );
        assert_eq!(classify_device_type("Nonsense"), DeviceDomain::Unknown);
    }
}
