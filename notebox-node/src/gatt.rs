//! Bluedroid GATT server carrying the note service.
//!
//! Registration is asynchronous in Bluedroid: `register_app` returns at once
//! and the service, characteristic and CCCD are created from the resulting
//! event chain. [`BleServer::register_service`] blocks the caller until that
//! chain finishes or fails, so a broken bring-up surfaces from `main`.
//!
//! Handles are only known once the stack reports them; the note
//! characteristic's value handle is passed to [`NoteService::bind`] as soon
//! as it is added.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use enumset::{enum_set, EnumSet};
use esp_idf_svc::bt::ble::gap::{AdvConfiguration, BleGapEvent, EspBleGap};
use esp_idf_svc::bt::ble::gatt::server::{ConnectionId, EspGatts, GattsEvent, TransferId};
use esp_idf_svc::bt::ble::gatt::{
    AutoResponse, GattCharacteristic, GattDescriptor, GattId, GattInterface, GattResponse,
    GattServiceId, GattStatus, Handle, Permission, Property,
};
use esp_idf_svc::bt::{BdAddr, Ble, BtDriver, BtStatus, BtUuid};
use esp_idf_svc::sys::{EspError, ESP_FAIL};
use log::{error, info, warn};

use notebox::{
    AttrHandle, GattTransport, NoteService, Properties, Rejection, ServiceDescriptor,
    TransportError, Verdict,
};

const APP_ID: u16 = 0;
const CCCD_UUID: u16 = 0x2902;
/// Service declaration, characteristic declaration + value, CCCD.
const SERVICE_HANDLES: u16 = 4;
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

pub type NodeBtDriver = BtDriver<'static, Ble>;
pub type NodeBleGap = Arc<EspBleGap<'static, Ble, Arc<NodeBtDriver>>>;
pub type NodeGatts = Arc<EspGatts<'static, Ble, Arc<NodeBtDriver>>>;

#[derive(Debug, Clone, Copy)]
struct Peer {
    addr: BdAddr,
    conn_id: ConnectionId,
    subscribed: bool,
}

#[derive(Default)]
struct State {
    descriptor: Option<ServiceDescriptor>,
    gatt_if: Option<GattInterface>,
    service_handle: Option<Handle>,
    note_handle: Option<Handle>,
    cccd_handle: Option<Handle>,
    peer: Option<Peer>,
    registration: Option<Result<(), String>>,
    response: GattResponse,
}

pub struct BleServer {
    gap: NodeBleGap,
    gatts: NodeGatts,
    device_name: String,
    service: OnceLock<NoteService>,
    state: Mutex<State>,
    registered: Condvar,
}

impl BleServer {
    pub fn new(gap: NodeBleGap, gatts: NodeGatts, device_name: &str) -> Arc<Self> {
        Arc::new(Self {
            gap,
            gatts,
            device_name: device_name.to_string(),
            service: OnceLock::new(),
            state: Mutex::new(State::default()),
            registered: Condvar::new(),
        })
    }

    /// Routes GAP and GATTS events to `service`. Call before `NoteService::start`.
    pub fn attach(self: &Arc<Self>, service: NoteService) -> anyhow::Result<()> {
        if self.service.set(service).is_err() {
            anyhow::bail!("BLE server already has a service attached");
        }

        let server = self.clone();
        self.gap.subscribe(move |event| {
            server.check_esp_status(server.on_gap_event(event));
        })?;

        let server = self.clone();
        self.gatts.subscribe(move |(gatt_if, event)| {
            server.check_esp_status(server.on_gatts_event(gatt_if, event));
        })?;

        info!("BLE GAP and GATTS subscriptions initialized");
        Ok(())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn service(&self) -> Option<&NoteService> {
        self.service.get()
    }

    // ── GAP ────────────────────────────────────────────────────────────────

    fn on_gap_event(&self, event: BleGapEvent) -> Result<(), EspError> {
        if let BleGapEvent::AdvertisingConfigured(status) = event {
            self.check_bt_status(status)?;
            self.gap.start_advertising()?;
            info!("Advertising as {}", self.device_name);
        }
        Ok(())
    }

    // ── GATTS ──────────────────────────────────────────────────────────────

    fn on_gatts_event(&self, gatt_if: GattInterface, event: GattsEvent) -> Result<(), EspError> {
        match event {
            GattsEvent::ServiceRegistered { status, app_id } => {
                if let Err(e) = self.check_gatt_status(status) {
                    self.finish_registration(Err(format!("app registration: {status:?}")));
                    return Err(e);
                }
                if app_id == APP_ID {
                    self.create_service(gatt_if)?;
                }
            }
            GattsEvent::ServiceCreated {
                status,
                service_handle,
                ..
            } => {
                if let Err(e) = self.check_gatt_status(status) {
                    self.finish_registration(Err(format!("service creation: {status:?}")));
                    return Err(e);
                }
                self.start_service(service_handle)?;
            }
            GattsEvent::CharacteristicAdded {
                status,
                attr_handle,
                service_handle,
                char_uuid,
            } => {
                if let Err(e) = self.check_gatt_status(status) {
                    self.finish_registration(Err(format!("characteristic: {status:?}")));
                    return Err(e);
                }
                self.register_note_characteristic(service_handle, attr_handle, char_uuid)?;
            }
            GattsEvent::DescriptorAdded {
                status,
                attr_handle,
                descr_uuid,
                ..
            } => {
                if let Err(e) = self.check_gatt_status(status) {
                    self.finish_registration(Err(format!("CCCD: {status:?}")));
                    return Err(e);
                }
                self.register_cccd(attr_handle, descr_uuid);
            }
            GattsEvent::PeerConnected { conn_id, addr, .. } => {
                self.on_connect(conn_id, addr);
            }
            GattsEvent::PeerDisconnected { addr, .. } => {
                self.on_disconnect(addr)?;
            }
            GattsEvent::Write {
                conn_id,
                trans_id,
                handle,
                offset,
                need_rsp,
                is_prep,
                value,
                ..
            } => {
                self.on_write(
                    gatt_if, conn_id, trans_id, handle, offset, need_rsp, is_prep, value,
                )?;
            }
            GattsEvent::Read {
                conn_id,
                trans_id,
                handle,
                need_rsp,
                ..
            } => {
                if need_rsp {
                    self.on_read(gatt_if, conn_id, trans_id, handle)?;
                }
            }
            GattsEvent::Confirm { status, .. } => {
                self.check_gatt_status(status)?;
                if let Some(service) = self.service() {
                    service.on_data_sent();
                }
            }
            _ => (),
        }
        Ok(())
    }

    fn create_service(&self, gatt_if: GattInterface) -> Result<(), EspError> {
        let descriptor = {
            let mut state = self.state();
            state.gatt_if = Some(gatt_if);
            state.descriptor.clone()
        };
        let Some(descriptor) = descriptor else {
            warn!("App registered without a service descriptor");
            return Ok(());
        };

        self.gap.set_device_name(&self.device_name)?;
        // Flags + 128-bit UUID + name must fit the 31-byte advertising payload.
        self.gap.set_adv_conf(&AdvConfiguration {
            include_name: true,
            include_txpower: false,
            flag: 2,
            service_uuid: Some(BtUuid::uuid128(descriptor.uuid)),
            ..Default::default()
        })?;
        self.gatts.create_service(
            gatt_if,
            &GattServiceId {
                id: GattId {
                    uuid: BtUuid::uuid128(descriptor.uuid),
                    inst_id: 0,
                },
                is_primary: true,
            },
            SERVICE_HANDLES,
        )?;
        Ok(())
    }

    fn start_service(&self, service_handle: Handle) -> Result<(), EspError> {
        let descriptor = {
            let mut state = self.state();
            state.service_handle = Some(service_handle);
            state.descriptor.clone()
        };
        let Some(descriptor) = descriptor else {
            return Ok(());
        };

        self.gatts.start_service(service_handle)?;

        let chr = &descriptor.characteristic;
        self.gatts.add_characteristic(
            service_handle,
            &GattCharacteristic {
                uuid: BtUuid::uuid128(chr.uuid),
                permissions: enum_set!(Permission::Read | Permission::Write),
                properties: gatt_properties(chr.properties),
                max_len: chr.max_len,
                auto_rsp: AutoResponse::ByApp,
            },
            &[],
        )?;
        Ok(())
    }

    fn register_note_characteristic(
        &self,
        service_handle: Handle,
        attr_handle: Handle,
        char_uuid: BtUuid,
    ) -> Result<(), EspError> {
        let is_note = {
            let mut state = self.state();
            let is_note = state
                .descriptor
                .as_ref()
                .is_some_and(|d| char_uuid == BtUuid::uuid128(d.characteristic.uuid));
            if is_note {
                state.note_handle = Some(attr_handle);
            }
            is_note
        };
        if !is_note {
            return Ok(());
        }

        if let Some(service) = self.service() {
            service.bind(AttrHandle(attr_handle));
        }

        self.gatts.add_descriptor(
            service_handle,
            &GattDescriptor {
                uuid: BtUuid::uuid16(CCCD_UUID),
                permissions: enum_set!(Permission::Read | Permission::Write),
            },
        )?;
        Ok(())
    }

    fn register_cccd(&self, attr_handle: Handle, descr_uuid: BtUuid) {
        if descr_uuid != BtUuid::uuid16(CCCD_UUID) {
            return;
        }
        self.state().cccd_handle = Some(attr_handle);
        self.finish_registration(Ok(()));
    }

    fn finish_registration(&self, result: Result<(), String>) {
        let mut state = self.state();
        if state.registration.is_none() {
            state.registration = Some(result);
            self.registered.notify_all();
        }
    }

    // ── Connections ────────────────────────────────────────────────────────

    fn on_connect(&self, conn_id: ConnectionId, addr: BdAddr) {
        let mut state = self.state();
        if let Some(peer) = &state.peer {
            warn!("Second client {addr} while {} is connected", peer.addr);
            return;
        }
        state.peer = Some(Peer {
            addr,
            conn_id,
            subscribed: false,
        });
        info!("Client {addr} connected");
    }

    fn on_disconnect(&self, addr: BdAddr) -> Result<(), EspError> {
        let (was_subscribed, note_handle) = {
            let mut state = self.state();
            if state.peer.map(|p| p.addr) != Some(addr) {
                return Ok(());
            }
            let peer = state.peer.take();
            (peer.is_some_and(|p| p.subscribed), state.note_handle)
        };
        info!("Client {addr} disconnected");

        if let (true, Some(handle), Some(service)) = (was_subscribed, note_handle, self.service()) {
            service.on_subscription_changed(AttrHandle(handle), false);
        }

        self.gap.start_advertising()?;
        Ok(())
    }

    // ── Attribute access ───────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn on_write(
        &self,
        gatt_if: GattInterface,
        conn_id: ConnectionId,
        trans_id: TransferId,
        handle: Handle,
        offset: u16,
        need_rsp: bool,
        is_prep: bool,
        value: &[u8],
    ) -> Result<(), EspError> {
        let (note_handle, cccd_handle) = {
            let state = self.state();
            (state.note_handle, state.cccd_handle)
        };
        let Some(service) = self.service() else {
            return self.respond(gatt_if, conn_id, trans_id, need_rsp, GattStatus::Ok);
        };

        if Some(handle) == cccd_handle {
            let enabled = value.len() == 2 && u16::from_le_bytes([value[0], value[1]]) & 0x0001 != 0;
            if let Some(peer) = self.state().peer.as_mut().filter(|p| p.conn_id == conn_id) {
                peer.subscribed = enabled;
            }
            if let Some(note) = note_handle {
                service.on_subscription_changed(AttrHandle(note), enabled);
            }
            return self.respond(gatt_if, conn_id, trans_id, need_rsp, GattStatus::Ok);
        }

        if Some(handle) != note_handle {
            return self.respond(gatt_if, conn_id, trans_id, need_rsp, GattStatus::Ok);
        }

        // The whole note buffer fits a default-MTU write; long writes are refused.
        if is_prep || offset != 0 {
            return self.respond(
                gatt_if,
                conn_id,
                trans_id,
                need_rsp,
                GattStatus::ReqNotSupported,
            );
        }

        let handle = AttrHandle(handle);
        let verdict = service.on_write_requested(handle, value);
        self.respond(gatt_if, conn_id, trans_id, need_rsp, write_status(verdict))?;
        if verdict.is_accept() {
            service.on_write_completed(handle, value);
        }
        Ok(())
    }

    fn on_read(
        &self,
        gatt_if: GattInterface,
        conn_id: ConnectionId,
        trans_id: TransferId,
        handle: Handle,
    ) -> Result<(), EspError> {
        let value: Vec<u8> = {
            let state = self.state();
            if Some(handle) == state.cccd_handle {
                let subscribed = state.peer.is_some_and(|p| p.subscribed);
                vec![u8::from(subscribed), 0]
            } else {
                self.service()
                    .and_then(|s| s.on_read(AttrHandle(handle)))
                    .map(|seq| seq.as_slice().to_vec())
                    .unwrap_or_default()
            }
        };

        let mut state = self.state();
        state
            .response
            .attr_handle(handle)
            .auth_req(0)
            .offset(0)
            .value(&value)
            .map_err(|_| EspError::from_infallible::<ESP_FAIL>())?;
        self.gatts
            .send_response(gatt_if, conn_id, trans_id, GattStatus::Ok, Some(&state.response))?;
        Ok(())
    }

    fn respond(
        &self,
        gatt_if: GattInterface,
        conn_id: ConnectionId,
        trans_id: TransferId,
        need_rsp: bool,
        status: GattStatus,
    ) -> Result<(), EspError> {
        if need_rsp {
            self.gatts
                .send_response(gatt_if, conn_id, trans_id, status, None)?;
        }
        Ok(())
    }

    // ── Status helpers ─────────────────────────────────────────────────────

    fn check_esp_status(&self, status: Result<(), EspError>) {
        if let Err(e) = status {
            warn!("BLE event handling failed: {e:?}");
        }
    }

    fn check_bt_status(&self, status: BtStatus) -> Result<(), EspError> {
        if !matches!(status, BtStatus::Success) {
            warn!("Got status: {status:?}");
            Err(EspError::from_infallible::<ESP_FAIL>())
        } else {
            Ok(())
        }
    }

    fn check_gatt_status(&self, status: GattStatus) -> Result<(), EspError> {
        if !matches!(status, GattStatus::Ok) {
            warn!("Got status: {status:?}");
            Err(EspError::from_infallible::<ESP_FAIL>())
        } else {
            Ok(())
        }
    }
}

impl GattTransport for BleServer {
    fn register_service(&self, service: &ServiceDescriptor) -> Result<(), TransportError> {
        self.state().descriptor = Some(service.clone());
        self.gatts
            .register_app(APP_ID)
            .map_err(|e| TransportError::Registration(e.to_string()))?;

        let deadline = Instant::now() + REGISTRATION_TIMEOUT;
        let mut state = self.state();
        loop {
            if let Some(result) = state.registration.clone() {
                return result.map_err(TransportError::Registration);
            }
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                error!("GATT registration timed out");
                return Err(TransportError::Registration("timed out".into()));
            };
            state = self
                .registered
                .wait_timeout(state, left)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn notify(
        &self,
        handle: AttrHandle,
        payload: &[u8],
        local_only: bool,
    ) -> Result<(), TransportError> {
        // Reads are answered from the note buffer, so there is no local value to update.
        if local_only {
            return Ok(());
        }

        let (gatt_if, peer) = {
            let state = self.state();
            (state.gatt_if, state.peer)
        };
        let gatt_if = gatt_if.ok_or(TransportError::NotConnected)?;
        let peer = peer.ok_or(TransportError::NotConnected)?;
        if !peer.subscribed {
            return Err(TransportError::NoSubscribers);
        }

        self.gatts
            .notify(gatt_if, peer.conn_id, handle.0, payload)
            .map_err(|e| TransportError::Stack(e.to_string()))
    }
}

fn gatt_properties(props: Properties) -> EnumSet<Property> {
    let mut set = EnumSet::new();
    if props.contains(Properties::READ) {
        set.insert(Property::Read);
    }
    if props.contains(Properties::WRITE) {
        set.insert(Property::Write);
    }
    if props.contains(Properties::WRITE_WITHOUT_RESPONSE) {
        set.insert(Property::WriteWithoutResponse);
    }
    if props.contains(Properties::NOTIFY) {
        set.insert(Property::Notify);
    }
    set
}

/// ATT error returned to the client for each admission verdict.
fn write_status(verdict: Verdict) -> GattStatus {
    match verdict {
        Verdict::Accept => GattStatus::Ok,
        Verdict::Reject(Rejection::InvalidLength { .. }) => GattStatus::InvalidAttrLen,
        Verdict::Reject(Rejection::InvalidValue { .. }) => GattStatus::WriteNotPermit,
    }
}
