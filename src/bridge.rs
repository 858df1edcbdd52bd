//! The bridge engine: discovers a bridge's topology, keeps a live model of
//! it, exposes the device command API, and drives reconnection.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{watch, RwLock};
use tracing::{debug, warn};

use crate::config::Config;
use crate::connection::{Connection, Credentials};
use crate::error::{LeapError, Result};
use crate::model::{
    classify_system_type, id_from_href, strip_name_prefix, Area, BridgeFlavor, Button,
    ButtonEventType, ButtonGroup, Device, DeviceDomain, FanSpeed, Id, Model, Occupancy,
    OccupancyGroup, Scene, Zone,
};
use crate::registry::{Registry, SubscriptionHandle};
use crate::requester::{LeapMessage, Requester};

const AREA_PAGE_SIZE: usize = 99;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// `Idle -> Connecting -> Handshaking -> Bootstrapping -> Live -> (Error|Closing) -> Reconnecting -> Connecting ...`
/// `Closing` is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Connecting,
    Handshaking,
    Bootstrapping,
    Live,
    Error(String),
    Reconnecting,
    Closing,
}

/// A dimmer/switch/cover/fan command target, resolved from a device id to
/// the zone href the command is actually issued against.
struct ZoneTarget {
    href: String,
}

/// The bridge engine. Construct with `Bridge::new`, call `connect()` to
/// start the supervisor task, and use the command methods to control
/// devices. Cloning an `Arc<Bridge>` is the intended way to share it.
pub struct Bridge {
    config: Config,
    model: Arc<RwLock<Model>>,
    requester: Arc<RwLock<Option<Requester>>>,
    state_tx: watch::Sender<BridgeState>,
    device_registry: Arc<Registry<Device>>,
    button_registry: Arc<Registry<(ButtonEventType, Id)>>,
    occupancy_registry: Arc<Registry<OccupancyGroup>>,
    connected_callback: StdMutex<Option<Box<dyn FnMut() + Send>>>,
    closing: Arc<AtomicBool>,
}

impl Bridge {
    pub fn new(config: Config) -> Arc<Self> {
        let (state_tx, _) = watch::channel(BridgeState::Idle);
        Arc::new(Self {
            config,
            model: Arc::new(RwLock::new(Model::default())),
            requester: Arc::new(RwLock::new(None)),
            state_tx,
            device_registry: Arc::new(Registry::default()),
            button_registry: Arc::new(Registry::default()),
            occupancy_registry: Arc::new(Registry::default()),
            connected_callback: StdMutex::new(None),
            closing: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Observe state machine transitions.
    pub fn state(&self) -> watch::Receiver<BridgeState> {
        self.state_tx.subscribe()
    }

    /// Register a callback invoked exactly once per successful bootstrap.
    pub fn on_connected(&self, callback: impl FnMut() + Send + 'static) {
        *self.connected_callback.lock().unwrap() = Some(Box::new(callback));
    }

    /// Start the connection supervisor as a background task. Returns
    /// immediately; observe `state()` to track progress.
    pub fn connect(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            this.supervisor().await;
        });
    }

    /// Tear down the connection and stop the supervisor loop. Outstanding
    /// requests resolve with `ConnectionClosed`.
    pub async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let _ = self.state_tx.send(BridgeState::Closing);
        if let Some(req) = self.requester.read().await.as_ref() {
            req.close();
        }
    }

    async fn supervisor(self: Arc<Self>) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if self.closing.load(Ordering::SeqCst) {
                return;
            }
            let _ = self.state_tx.send(BridgeState::Connecting);
            match self.run_session().await {
                Ok(()) => {
                    // Clean close (caller invoked `close()`).
                    return;
                }
                Err(e) => {
                    if self.closing.load(Ordering::SeqCst) {
                        return;
                    }
                    warn!("LEAP session ended: {}. Reconnecting in {:?}", e, backoff);
                    let _ = self.state_tx.send(BridgeState::Error(e.to_string()));
                    let _ = self.state_tx.send(BridgeState::Reconnecting);
                    let jitter = rand::thread_rng().gen_range(0.8..1.2);
                    let sleep_for = backoff.mul_f64(jitter);
                    tokio::time::sleep(sleep_for).await;
                    backoff = (backoff * 2).min(self.config.reconnect_max());
                }
            }
        }
    }

    /// Open one connection, bootstrap the model, and run until the
    /// connection drops or `close()` is called.
    async fn run_session(self: &Arc<Self>) -> Result<()> {
        let _ = self.state_tx.send(BridgeState::Handshaking);
        let creds = Credentials::load(&self.config.cert_dir(), &self.config.host).await?;
        let conn = Connection::open(&self.config.host, self.config.port, &creds).await?;
        let (requester, io_handle) = Requester::spawn(conn, self.config.request_timeout());

        *self.requester.write().await = Some(requester.clone());

        let _ = self.state_tx.send(BridgeState::Bootstrapping);
        let forwarders = match self.bootstrap(&requester).await {
            Ok(handles) => handles,
            Err(e) => {
                *self.requester.write().await = None;
                io_handle.abort();
                return Err(e);
            }
        };

        let _ = self.state_tx.send(BridgeState::Live);
        if let Some(cb) = self.connected_callback.lock().unwrap().as_mut() {
            cb();
        }

        let io_result = io_handle
            .await
            .unwrap_or_else(|e| Err(LeapError::Protocol(format!("IO task panicked: {e}"))));

        for handle in forwarders {
            handle.abort();
        }
        *self.requester.write().await = None;

        if self.closing.load(Ordering::SeqCst) {
            return Ok(());
        }
        io_result
    }

    async fn current_requester(&self) -> Result<Requester> {
        self.requester
            .read()
            .await
            .clone()
            .ok_or(LeapError::ConnectionClosed)
    }

    // ---------------------------------------------------------------
    // Bootstrap
    // ---------------------------------------------------------------

    async fn bootstrap(&self, req: &Requester) -> Result<Vec<tokio::task::JoinHandle<()>>> {
        // Step 1: bridge type discovery. Failure here aborts bootstrap.
        let systemtype = req.read("/server/1/systemtype").await?;
        let flavor = classify_system_type(&systemtype.body);
        debug!(
            "bridge system type response: {:?} (flavor: {:?})",
            systemtype.body,
            flavor
        );

        let mut forwarders = Vec::new();

        // Step 2: areas (paginated; per-processor on Processor-like bridges).
        if let Err(e) = self.bootstrap_areas(req, flavor).await {
            warn!("area enumeration failed: {}", e);
        }

        // Step 3: devices.
        if let Err(e) = self.bootstrap_devices(req).await {
            warn!("device enumeration failed: {}", e);
        }

        // Step 4: zones, subscribed globally.
        match self.bootstrap_zones(req).await {
            Ok(handle) => forwarders.push(handle),
            Err(e) => warn!("zone enumeration/subscription failed: {}", e),
        }

        // Step 5: button groups and buttons, subscribed per button.
        match self.bootstrap_buttons(req).await {
            Ok(mut handles) => forwarders.append(&mut handles),
            Err(e) => warn!("button enumeration failed: {}", e),
        }

        // Step 6: occupancy groups. Absence is tolerated (older firmware).
        match self.bootstrap_occupancy(req).await {
            Ok(Some(handle)) => forwarders.push(handle),
            Ok(None) => debug!("bridge reports no occupancy groups"),
            Err(e) => warn!("occupancy group enumeration failed: {}", e),
        }

        // Step 7: scenes.
        if let Err(e) = self.bootstrap_scenes(req).await {
            warn!("scene enumeration failed: {}", e);
        }

        Ok(forwarders)
    }

    /// Read one `/area`-shaped endpoint to exhaustion, following
    /// `Page/Next/href` links while a page comes back full.
    async fn read_area_page(req: &Requester, start_url: &str) -> Result<Vec<serde_json::Value>> {
        let mut items = Vec::new();
        let mut url = start_url.to_string();
        loop {
            let resp = req.read(&url).await?;
            let areas = resp
                .body
                .get("Areas")
                .and_then(|a| a.as_array())
                .cloned()
                .unwrap_or_default();
            let full_page = areas.len() >= AREA_PAGE_SIZE;
            items.extend(areas);
            if full_page {
                if let Some(next) = resp
                    .body
                    .pointer("/Page/Next/href")
                    .and_then(|h| h.as_str())
                {
                    url = next.to_string();
                    continue;
                }
            }
            break;
        }
        Ok(items)
    }

    /// On Processor-like bridges, areas are nested under `/processor`
    /// entries rather than exposed as one flat list; enumerate processors
    /// first and read each one's `/area` page. Falls back to the flat
    /// `/area` list when no processors are reported (or the bridge doesn't
    /// actually nest areas despite claiming the flavor).
    async fn bootstrap_areas(&self, req: &Requester, flavor: BridgeFlavor) -> Result<()> {
        let mut items = Vec::new();
        if flavor == BridgeFlavor::ProcessorLike {
            if let Ok(resp) = req.read("/processor").await {
                let processors = resp
                    .body
                    .get("Processors")
                    .and_then(|p| p.as_array())
                    .cloned()
                    .unwrap_or_default();
                for processor in &processors {
                    if let Some(href) = processor.get("href").and_then(|h| h.as_str()) {
                        if let Ok(page) = Self::read_area_page(req, &format!("{href}/area")).await
                        {
                            items.extend(page);
                        }
                    }
                }
            }
        }
        if items.is_empty() {
            items = Self::read_area_page(req, "/area").await?;
        }

        let mut model = self.model.write().await;
        let mut seen = HashSet::new();
        for item in &items {
            let href = match item.get("href").and_then(|h| h.as_str()) {
                Some(h) => h,
                None => continue,
            };
            let id = match id_from_href(href) {
                Some(id) => id,
                None => continue,
            };
            seen.insert(id);
            let name = item
                .get("Name")
                .and_then(|n| n.as_str())
                .unwrap_or_default()
                .to_string();
            let parent_id = item
                .pointer("/Parent/href")
                .and_then(|h| h.as_str())
                .and_then(id_from_href);
            let occupancy_group_id = item
                .pointer("/AssociatedOccupancyGroup/href")
                .and_then(|h| h.as_str())
                .and_then(id_from_href);

            let area = model.areas.entry(id).or_insert_with(Area::default);
            area.id = id;
            area.href = href.to_string();
            area.name = name;
            area.parent_id = parent_id;
            area.occupancy_group_id = occupancy_group_id;

            if let Some(pid) = parent_id {
                model
                    .areas
                    .entry(pid)
                    .or_insert_with(Area::default)
                    .children
                    .insert(id);
            }
        }
        model.areas.retain(|id, _| seen.contains(id));
        Ok(())
    }

    async fn bootstrap_devices(&self, req: &Requester) -> Result<()> {
        let resp = req.read("/device").await?;
        let devices = resp
            .body
            .get("Devices")
            .and_then(|d| d.as_array())
            .cloned()
            .unwrap_or_default();

        let mut model = self.model.write().await;
        let mut seen = HashSet::new();
        for item in &devices {
            let href = match item.get("href").and_then(|h| h.as_str()) {
                Some(h) => h,
                None => continue,
            };
            let id = match id_from_href(href) {
                Some(id) => id,
                None => continue,
            };
            seen.insert(id);

            let segments: Vec<String> = item
                .get("FullyQualifiedName")
                .and_then(|n| n.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(|s| s.to_string()))
                        .collect()
                })
                .unwrap_or_default();
            let full_name = if segments.is_empty() {
                item.get("Name")
                    .and_then(|n| n.as_str())
                    .unwrap_or_default()
                    .to_string()
            } else {
                segments.join("/")
            };

            let area_id = item
                .pointer("/AssociatedArea/href")
                .and_then(|h| h.as_str())
                .and_then(id_from_href);
            let area_name = area_id
                .and_then(|aid| model.areas.get(&aid))
                .map(|a| a.name.clone())
                .unwrap_or_default();
            let device_name = strip_name_prefix(&full_name, &area_name);

            let device_type = item
                .get("DeviceType")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string();

            let device = model.devices.entry(id).or_insert_with(Device::default);
            device.id = id;
            device.href = href.to_string();
            device.name = full_name;
            device.device_name = device_name;
            device.device_type = device_type;
            device.model = item
                .get("ModelNumber")
                .and_then(|m| m.as_str())
                .map(|s| s.to_string());
            device.serial = item.get("SerialNumber").and_then(|s| {
                s.as_u64()
                    .map(|n| n.to_string())
                    .or_else(|| s.as_str().map(|s| s.to_string()))
            });
            device.area_id = area_id;
        }
        model.devices.retain(|id, _| seen.contains(id));
        Ok(())
    }

    async fn bootstrap_zones(&self, req: &Requester) -> Result<tokio::task::JoinHandle<()>> {
        let device_hrefs: Vec<(Id, String)> = {
            let model = self.model.read().await;
            model
                .devices
                .values()
                .map(|d| (d.id, d.href.clone()))
                .collect()
        };

        let mut seen_zones = HashSet::new();
        for (device_id, device_href) in device_hrefs {
            let zone_url = format!("{device_href}/localzone");
            let resp = match req.read(&zone_url).await {
                Ok(r) => r,
                Err(_) => continue,
            };
            let href = match resp.body.pointer("/LocalZone/href").and_then(|h| h.as_str()) {
                Some(h) => h,
                None => continue,
            };
            let zone_id = match id_from_href(href) {
                Some(id) => id,
                None => continue,
            };
            seen_zones.insert(zone_id);
            let name = resp
                .body
                .pointer("/LocalZone/Name")
                .and_then(|n| n.as_str())
                .unwrap_or_default()
                .to_string();

            let mut model = self.model.write().await;
            let zone = model.zones.entry(zone_id).or_insert_with(Zone::default);
            zone.id = zone_id;
            zone.href = href.to_string();
            zone.name = name;
            zone.device_id = device_id;
            model.zone_to_device.insert(zone_id, device_id);
            if let Some(device) = model.devices.get_mut(&device_id) {
                device.zone_id = Some(zone_id);
            }
        }

        {
            let mut model = self.model.write().await;
            model.zones.retain(|id, _| seen_zones.contains(id));
            model.zone_to_device.retain(|id, _| seen_zones.contains(id));
        }

        let (initial, mut rx) = req.subscribe("/zone/status").await?;
        for device in apply_zone_statuses_initial(&self.model, &initial.body).await {
            self.device_registry.fire(device.id, device);
        }
        let model = self.model.clone();
        let registry = self.device_registry.clone();
        let handle = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Some(device) = apply_zone_status(&model, &msg).await {
                    registry.fire(device.id, device);
                }
            }
        });
        Ok(handle)
    }

    async fn bootstrap_buttons(&self, req: &Requester) -> Result<Vec<tokio::task::JoinHandle<()>>> {
        let remotes: Vec<(Id, String)> = {
            let model = self.model.read().await;
            model
                .devices
                .values()
                .filter(|d| {
                    matches!(
                        d.domain(),
                        DeviceDomain::Remote | DeviceDomain::KeypadButton
                    )
                })
                .map(|d| (d.id, d.href.clone()))
                .collect()
        };

        let mut handles = Vec::new();
        for (device_id, device_href) in remotes {
            let bg_url = format!("{device_href}/buttongroup");
            let resp = match req.read(&bg_url).await {
                Ok(r) => r,
                Err(_) => continue,
            };
            let groups = resp
                .body
                .get("ButtonGroups")
                .and_then(|g| g.as_array())
                .cloned()
                .unwrap_or_default();

            for group in groups {
                let group_href = match group.get("href").and_then(|h| h.as_str()) {
                    Some(h) => h,
                    None => continue,
                };
                let group_id = match id_from_href(group_href) {
                    Some(id) => id,
                    None => continue,
                };

                let buttons_resp = match req.read(&format!("{group_href}/button")).await {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                let buttons = buttons_resp
                    .body
                    .get("Buttons")
                    .and_then(|b| b.as_array())
                    .cloned()
                    .unwrap_or_default();

                let mut button_ids = Vec::new();
                for button in &buttons {
                    let button_href = match button.get("href").and_then(|h| h.as_str()) {
                        Some(h) => h,
                        None => continue,
                    };
                    let button_id = match id_from_href(button_href) {
                        Some(id) => id,
                        None => continue,
                    };
                    button_ids.push(button_id);

                    {
                        let mut model = self.model.write().await;
                        let b = model.buttons.entry(button_id).or_insert_with(Button::default);
                        b.id = button_id;
                        b.href = button_href.to_string();
                        b.parent_device_id = device_id;
                        b.number = button
                            .get("ButtonNumber")
                            .and_then(|n| n.as_i64())
                            .unwrap_or_default();
                        b.name = button
                            .get("Name")
                            .and_then(|n| n.as_str())
                            .unwrap_or_default()
                            .to_string();
                        b.engraving = button
                            .pointer("/Engraving/Text")
                            .and_then(|t| t.as_str())
                            .map(|s| s.to_string());
                    }

                    let event_url = format!("{button_href}/status/event");
                    if let Ok((_initial, mut rx)) = req.subscribe(&event_url).await {
                        let model = self.model.clone();
                        let registry = self.button_registry.clone();
                        handles.push(tokio::spawn(async move {
                            while let Some(msg) = rx.recv().await {
                                if let Some((event, id)) = apply_button_event(&model, &msg).await {
                                    registry.fire(id, (event, id));
                                }
                            }
                        }));
                    }
                }

                {
                    let mut model = self.model.write().await;
                    let bg = model
                        .button_groups
                        .entry(group_id)
                        .or_insert_with(ButtonGroup::default);
                    bg.id = group_id;
                    bg.href = group_href.to_string();
                    bg.parent_device_id = device_id;
                    bg.button_ids = button_ids.clone();
                    if let Some(device) = model.devices.get_mut(&device_id) {
                        if !device.button_group_ids.contains(&group_id) {
                            device.button_group_ids.push(group_id);
                        }
                    }
                }
            }
        }
        Ok(handles)
    }

    async fn bootstrap_occupancy(
        &self,
        req: &Requester,
    ) -> Result<Option<tokio::task::JoinHandle<()>>> {
        let resp = match req.read("/occupancygroup").await {
            Ok(r) => r,
            Err(_) => return Ok(None),
        };
        let groups = resp
            .body
            .get("OccupancyGroups")
            .and_then(|g| g.as_array())
            .cloned()
            .unwrap_or_default();
        if groups.is_empty() {
            return Ok(None);
        }

        {
            let mut model = self.model.write().await;
            for item in &groups {
                let href = match item.get("href").and_then(|h| h.as_str()) {
                    Some(h) => h,
                    None => continue,
                };
                let id = match id_from_href(href) {
                    Some(id) => id,
                    None => continue,
                };
                let associated_area_id = item
                    .pointer("/AssociatedAreas/0/href")
                    .and_then(|h| h.as_str())
                    .and_then(id_from_href);
                let group = model
                    .occupancy_groups
                    .entry(id)
                    .or_insert_with(OccupancyGroup::default);
                group.id = id;
                group.href = href.to_string();
                group.associated_area_id = associated_area_id;
            }
        }

        let (initial, mut rx) = req.subscribe("/occupancygroup/status").await?;
        for group in apply_occupancy_statuses_initial(&self.model, &initial.body).await {
            self.occupancy_registry.fire(group.id, group);
        }
        let model = self.model.clone();
        let registry = self.occupancy_registry.clone();
        let handle = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Some(group) = apply_occupancy_status(&model, &msg).await {
                    registry.fire(group.id, group);
                }
            }
        });
        Ok(Some(handle))
    }

    async fn bootstrap_scenes(&self, req: &Requester) -> Result<()> {
        let resp = req.read("/virtualbutton").await?;
        let scenes = resp
            .body
            .get("VirtualButtons")
            .and_then(|s| s.as_array())
            .cloned()
            .unwrap_or_default();

        let mut model = self.model.write().await;
        for item in &scenes {
            let href = match item.get("href").and_then(|h| h.as_str()) {
                Some(h) => h,
                None => continue,
            };
            let id = match id_from_href(href) {
                Some(id) => id,
                None => continue,
            };
            let name = item
                .get("Name")
                .and_then(|n| n.as_str())
                .unwrap_or_default()
                .to_string();
            let scene = model.scenes.entry(id).or_insert_with(Scene::default);
            scene.id = id;
            scene.href = href.to_string();
            scene.name = name;
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Public API: snapshots
    // ---------------------------------------------------------------

    pub async fn get_devices(&self) -> Vec<Device> {
        self.model.read().await.devices.values().cloned().collect()
    }

    pub async fn get_devices_by_domain(&self, domain: DeviceDomain) -> Vec<Device> {
        self.model
            .read()
            .await
            .devices
            .values()
            .filter(|d| d.domain() == domain)
            .cloned()
            .collect()
    }

    pub async fn get_devices_by_type(&self, device_type: &str) -> Vec<Device> {
        self.model
            .read()
            .await
            .devices
            .values()
            .filter(|d| d.device_type == device_type)
            .cloned()
            .collect()
    }

    pub async fn get_areas(&self) -> Vec<Area> {
        self.model.read().await.areas.values().cloned().collect()
    }

    // ---------------------------------------------------------------
    // Public API: commands
    // ---------------------------------------------------------------

    async fn zone_target(&self, device_id: Id) -> Result<ZoneTarget> {
        let model = self.model.read().await;
        let device = model
            .devices
            .get(&device_id)
            .ok_or(LeapError::UnknownEntity { id: device_id })?;
        let zone_id = device
            .zone_id
            .ok_or(LeapError::UnknownEntity { id: device_id })?;
        let zone = model
            .zones
            .get(&zone_id)
            .ok_or(LeapError::UnknownEntity { id: zone_id })?;
        Ok(ZoneTarget {
            href: zone.href.clone(),
        })
    }

    fn device_domain_sync(model: &Model, device_id: Id) -> Option<DeviceDomain> {
        model.devices.get(&device_id).map(|d| d.domain())
    }

    pub async fn turn_on(&self, device_id: Id, fade_time: Option<Duration>) -> Result<()> {
        let domain = {
            let model = self.model.read().await;
            Self::device_domain_sync(&model, device_id)
                .ok_or(LeapError::UnknownEntity { id: device_id })?
        };
        match domain {
            DeviceDomain::Fan => self.set_fan_speed(device_id, FanSpeed::High).await,
            DeviceDomain::Cover => self.raise_cover(device_id).await,
            _ => self.set_value(device_id, 100, fade_time).await,
        }
    }

    pub async fn turn_off(&self, device_id: Id, fade_time: Option<Duration>) -> Result<()> {
        let domain = {
            let model = self.model.read().await;
            Self::device_domain_sync(&model, device_id)
                .ok_or(LeapError::UnknownEntity { id: device_id })?
        };
        match domain {
            DeviceDomain::Fan => self.set_fan_speed(device_id, FanSpeed::Off).await,
            DeviceDomain::Cover => self.lower_cover(device_id).await,
            _ => self.set_value(device_id, 0, fade_time).await,
        }
    }

    pub async fn set_value(&self, device_id: Id, level: u8, fade_time: Option<Duration>) -> Result<()> {
        let target = self.zone_target(device_id).await?;
        let req = self.current_requester().await?;
        let body = if let Some(fade) = fade_time {
            serde_json::json!({
                "Command": {
                    "CommandType": "GoToDimmedLevel",
                    "DimmedLevelParameters": {
                        "Level": level,
                        "FadeTime": format_duration(fade),
                    }
                }
            })
        } else {
            serde_json::json!({
                "Command": {
                    "CommandType": "GoToLevel",
                    "Parameter": [{"Type": "Level", "Value": level}]
                }
            })
        };
        req.execute(&format!("{}/commandprocessor", target.href), body)
            .await?;
        Ok(())
    }

    pub async fn set_fan_speed(&self, device_id: Id, speed: FanSpeed) -> Result<()> {
        let target = self.zone_target(device_id).await?;
        let req = self.current_requester().await?;
        let body = serde_json::json!({
            "Command": {
                "CommandType": "GoToFanSpeed",
                "FanSpeedParameters": {"FanSpeed": speed.as_leap_str()}
            }
        });
        req.execute(&format!("{}/commandprocessor", target.href), body)
            .await?;
        Ok(())
    }

    async fn cover_command(&self, device_id: Id, command_type: &str) -> Result<()> {
        let target = self.zone_target(device_id).await?;
        let req = self.current_requester().await?;
        let body = serde_json::json!({"Command": {"CommandType": command_type}});
        req.execute(&format!("{}/commandprocessor", target.href), body)
            .await?;
        Ok(())
    }

    pub async fn raise_cover(&self, device_id: Id) -> Result<()> {
        self.cover_command(device_id, "Raise").await
    }

    pub async fn lower_cover(&self, device_id: Id) -> Result<()> {
        self.cover_command(device_id, "Lower").await
    }

    pub async fn stop_cover(&self, device_id: Id) -> Result<()> {
        self.cover_command(device_id, "Stop").await
    }

    pub async fn set_tilt(&self, device_id: Id, tilt: u8) -> Result<()> {
        let target = self.zone_target(device_id).await?;
        let req = self.current_requester().await?;
        let body = serde_json::json!({
            "Command": {
                "CommandType": "GoToTilt",
                "Parameter": [{"Type": "Tilt", "Value": tilt}]
            }
        });
        req.execute(&format!("{}/commandprocessor", target.href), body)
            .await?;
        Ok(())
    }

    pub async fn tap_button(&self, button_id: Id) -> Result<()> {
        let href = {
            let model = self.model.read().await;
            model
                .button_by_id(button_id)
                .ok_or(LeapError::UnknownEntity { id: button_id })?
                .href
                .clone()
        };
        let req = self.current_requester().await?;
        let body = serde_json::json!({"Command": {"CommandType": "PressAndRelease"}});
        req.execute(&format!("{href}/commandprocessor"), body).await?;
        Ok(())
    }

    pub async fn activate_scene(&self, scene_id: Id) -> Result<()> {
        let href = {
            let model = self.model.read().await;
            model
                .scenes
                .get(&scene_id)
                .ok_or(LeapError::UnknownEntity { id: scene_id })?
                .href
                .clone()
        };
        let req = self.current_requester().await?;
        let body = serde_json::json!({"Command": {"CommandType": "PressAndRelease"}});
        req.execute(&format!("{href}/commandprocessor"), body).await?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Public API: subscriptions
    // ---------------------------------------------------------------

    pub fn add_subscriber(
        &self,
        device_id: Id,
        callback: impl Fn(Device) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.device_registry.subscribe(device_id, callback)
    }

    pub fn remove_subscriber(&self, handle: SubscriptionHandle) {
        self.device_registry.unsubscribe(handle);
    }

    pub fn add_button_subscriber(
        &self,
        button_id: Id,
        callback: impl Fn((ButtonEventType, Id)) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.button_registry.subscribe(button_id, callback)
    }

    pub fn remove_button_subscriber(&self, handle: SubscriptionHandle) {
        self.button_registry.unsubscribe(handle);
    }

    pub fn add_occupancy_subscriber(
        &self,
        group_id: Id,
        callback: impl Fn(OccupancyGroup) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.occupancy_registry.subscribe(group_id, callback)
    }

    pub fn remove_occupancy_subscriber(&self, handle: SubscriptionHandle) {
        self.occupancy_registry.unsubscribe(handle);
    }
}

fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

/// Apply one `ZoneStatus` object to the model, mutating the owning device in
/// place and returning a snapshot for fan-out. `fallback_url` supplies the
/// zone href when the status object itself omits `Zone.href`, which is how
/// an unsolicited per-zone notification's own `Header.Url` is used.
async fn apply_zone_status_entry(
    model: &Arc<RwLock<Model>>,
    status: &serde_json::Value,
    fallback_url: Option<&str>,
) -> Option<Device> {
    let href = status
        .pointer("/Zone/href")
        .and_then(|h| h.as_str())
        .or(fallback_url)?;
    let zone_id = id_from_href(href)?;

    let mut model = model.write().await;
    let device_id = *model.zone_to_device.get(&zone_id)?;
    let device = model.devices.get_mut(&device_id)?;

    if let Some(level) = status.get("Level").and_then(|l| l.as_i64()) {
        device.current_state = Some(level);
    }
    if let Some(speed) = status.get("FanSpeed").and_then(|s| s.as_str()) {
        device.fan_speed = FanSpeed::from_leap_str(speed);
    }
    if let Some(tilt) = status.get("Tilt").and_then(|t| t.as_i64()) {
        device.tilt = Some(tilt);
    }
    Some(device.clone())
}

/// Apply an unsolicited zone-status message to the model.
async fn apply_zone_status(model: &Arc<RwLock<Model>>, msg: &LeapMessage) -> Option<Device> {
    let status = msg.body.get("ZoneStatus")?;
    apply_zone_status_entry(model, status, msg.url.strip_suffix("/status")).await
}

/// Apply the plural `ZoneStatuses` array a `/zone/status` subscribe
/// response's initial body carries, seeding every device's current state
/// without waiting for the first post-subscribe change notification.
async fn apply_zone_statuses_initial(model: &Arc<RwLock<Model>>, body: &serde_json::Value) -> Vec<Device> {
    let mut updated = Vec::new();
    if let Some(statuses) = body.get("ZoneStatuses").and_then(|v| v.as_array()) {
        for status in statuses {
            if let Some(device) = apply_zone_status_entry(model, status, None).await {
                updated.push(device);
            }
        }
    }
    updated
}

/// Extract a button id from an event-notification URL such as
/// `/device/8/buttongroup/2/button/12/status/event`.
fn extract_button_id(url: &str) -> Option<Id> {
    let segments: Vec<&str> = url.split('/').collect();
    let pos = segments.iter().position(|s| *s == "button")?;
    segments.get(pos + 1)?.parse().ok()
}

async fn apply_button_event(
    model: &Arc<RwLock<Model>>,
    msg: &LeapMessage,
) -> Option<(ButtonEventType, Id)> {
    let event_type = msg
        .body
        .pointer("/ButtonEvent/EventType")
        .and_then(|e| e.as_str())
        .and_then(ButtonEventType::from_leap_str)?;
    let button_id = extract_button_id(&msg.url)?;

    let model = model.read().await;
    if model.buttons.contains_key(&button_id) {
        Some((event_type, button_id))
    } else {
        None
    }
}

/// Apply one `OccupancyGroupStatus` object to the model, mirroring it onto
/// the group's associated area, and returning a snapshot for fan-out.
/// `fallback_url` supplies the group href when the status object itself
/// omits `OccupancyGroup.href` (an unsolicited notification's `Header.Url`).
async fn apply_occupancy_status_entry(
    model: &Arc<RwLock<Model>>,
    status: &serde_json::Value,
    fallback_url: Option<&str>,
) -> Option<OccupancyGroup> {
    let href = status
        .pointer("/OccupancyGroup/href")
        .and_then(|h| h.as_str())
        .or(fallback_url)?;
    let group_id = id_from_href(href)?;
    let status_str = status.get("OccupancyStatus").and_then(|s| s.as_str())?;
    let occupancy = Occupancy::from_status(status_str);

    let mut model = model.write().await;
    let group = model.occupancy_groups.get_mut(&group_id)?;
    group.status = occupancy.clone();

    if let Some(area_id) = group.associated_area_id {
        if let Some(area) = model.areas.get_mut(&area_id) {
            area.occupancy = Some(occupancy);
        }
    }
    model.occupancy_groups.get(&group_id).cloned()
}

/// Apply an unsolicited occupancy-group-status message to the model.
async fn apply_occupancy_status(
    model: &Arc<RwLock<Model>>,
    msg: &LeapMessage,
) -> Option<OccupancyGroup> {
    let status = msg.body.get("OccupancyGroupStatus")?;
    apply_occupancy_status_entry(model, status, msg.url.strip_suffix("/status")).await
}

/// Apply the plural `OccupancyGroupStatuses` array an `/occupancygroup/status`
/// subscribe response's initial body carries, seeding every group's (and its
/// associated area's) occupancy without waiting for a change notification.
async fn apply_occupancy_statuses_initial(
    model: &Arc<RwLock<Model>>,
    body: &serde_json::Value,
) -> Vec<OccupancyGroup> {
    let mut updated = Vec::new();
    if let Some(statuses) = body.get("OccupancyGroupStatuses").and_then(|v| v.as_array()) {
        for status in statuses {
            if let Some(group) = apply_occupancy_status_entry(model, status, None).await {
                updated.push(group);
            }
        }
    }
    updated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_button_id_from_event_url() {
        assert_eq!(
            extract_button_id("/device/8/buttongroup/2/button/12/status/event"),
            Some(12)
        );
        assert_eq!(extract_button_id("/zone/1/status"), None);
    }

    #[test]
    fn format_duration_hh_mm_ss() {
        assert_eq!(format_duration(Duration::from_secs(3725)), "01:02:05");
        assert_eq!(format_duration(Duration::from_secs(0)), "00:00:00");
    }

    fn fake_message(url: &str, body: serde_json::Value) -> LeapMessage {
        LeapMessage {
            communique_type: "ReadResponse".to_string(),
            url: url.to_string(),
            status_code: None,
            client_tag: None,
            body,
        }
    }

    #[tokio::test]
    async fn apply_zone_status_updates_owning_device() {
        let mut model = Model::default();
        model.devices.insert(
            2,
            Device {
                id: 2,
                zone_id: Some(1),
                ..Device::default()
            },
        );
        model.zones.insert(
            1,
            Zone {
                id: 1,
                device_id: 2,
                ..Zone::default()
            },
        );
        model.zone_to_device.insert(1, 2);
        let model = Arc::new(RwLock::new(model));

        let msg = fake_message(
            "/zone/1/status",
            serde_json::json!({"ZoneStatus": {"Level": 50, "Zone": {"href": "/zone/1"}}}),
        );
        let updated = apply_zone_status(&model, &msg).await.unwrap();
        assert_eq!(updated.id, 2);
        assert_eq!(updated.current_state, Some(50));
        assert_eq!(model.read().await.devices[&2].current_state, Some(50));
    }

    #[tokio::test]
    async fn apply_button_event_reports_press_for_known_button() {
        let mut model = Model::default();
        model.buttons.insert(12, Button { id: 12, ..Button::default() });
        let model = Arc::new(RwLock::new(model));

        let msg = fake_message(
            "/device/8/buttongroup/2/button/12/status/event",
            serde_json::json!({"ButtonEvent": {"EventType": "Press"}}),
        );
        let (event, id) = apply_button_event(&model, &msg).await.unwrap();
        assert_eq!(event, ButtonEventType::Press);
        assert_eq!(id, 12);
    }

    #[tokio::test]
    async fn apply_occupancy_status_syncs_associated_area() {
        let mut model = Model::default();
        model.occupancy_groups.insert(
            4,
            OccupancyGroup {
                id: 4,
                associated_area_id: Some(9),
                ..OccupancyGroup::default()
            },
        );
        model.areas.insert(9, Area { id: 9, ..Area::default() });
        let model = Arc::new(RwLock::new(model));

        let msg = fake_message(
            "/occupancygroup/4/status",
            serde_json::json!({
                "OccupancyGroupStatus": {
                    "OccupancyStatus": "Occupied",
                    "OccupancyGroup": {"href": "/occupancygroup/4"}
                }
            }),
        );
        let updated = apply_occupancy_status(&model, &msg).await.unwrap();
        assert_eq!(updated.status, Occupancy::Occupied);
        assert_eq!(model.read().await.areas[&9].occupancy, Some(Occupancy::Occupied));
    }
}
