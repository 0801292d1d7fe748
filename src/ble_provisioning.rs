// BLE Provisioning Module
// Bluedroid GATT server for the local configuration session: one characteristic
// takes writes (long writes included), answers reads and carries reply notifications

use std::ffi::CString;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

// Import anyhow for error handling
use anyhow::{anyhow, Result};

// Import ESP-IDF BLE functionality
use esp_idf_svc::bt::{Ble, BtDriver};
use esp_idf_svc::hal::modem::Modem;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::sys as esp_idf_sys;

// Import logging macros
use log::{debug, error, info, warn};

use peep_shared::provisioning::{CredentialSink, IdentitySource, ProvisioningTransport};

use crate::wifi_client::{claim_radio, release_radio, RadioSlot};

// GATT layout
const PROFILE_APP_ID: u16 = 0;
const SERVICE_UUID: u16 = 0x00FF;
const CONFIG_CHAR_UUID: u16 = 0xFF01;
const CCCD_UUID: u16 = 0x2902;
const SERVICE_HANDLE_COUNT: u16 = 4;
const MAX_WRITE_LEN: usize = 4096;

// 0x00FF on the Bluetooth base UUID, little-endian, for the advertising payload
static ADV_SERVICE_UUID: [u8; 16] = [
    0xfb, 0x34, 0x9b, 0x5f, 0x80, 0x00, 0x00, 0x80, 0x00, 0x10, 0x00, 0x00, 0xFF, 0x00, 0x00, 0x00,
];

struct Handlers {
    sink: Arc<dyn CredentialSink>,
    source: Arc<dyn IdentitySource>,
}

// Bluedroid calls back on its own task through plain C function pointers
static HANDLERS: Mutex<Option<Handlers>> = Mutex::new(None);
static PREPARED_WRITE: Mutex<Vec<u8>> = Mutex::new(Vec::new());
static GATT_INTERFACE: AtomicU8 = AtomicU8::new(0);
static CONFIG_CHAR_HANDLE: AtomicU16 = AtomicU16::new(0);
static CONN_ID: AtomicU16 = AtomicU16::new(0);
static CONNECTED: AtomicBool = AtomicBool::new(false);
static ADVERTISING_ENABLED: AtomicBool = AtomicBool::new(false);
static CALLBACKS_REGISTERED: AtomicBool = AtomicBool::new(false);

fn esp_check(result: esp_idf_sys::esp_err_t, context: &str) -> Result<()> {
    if result == esp_idf_sys::ESP_OK {
        Ok(())
    } else {
        Err(anyhow!("{} failed: esp_err {}", context, result))
    }
}

// Errors inside callbacks can only be logged
fn log_esp(result: esp_idf_sys::esp_err_t, context: &str) {
    if let Err(e) = esp_check(result, context) {
        error!("❌ {}", e);
    }
}

fn uuid16(value: u16) -> esp_idf_sys::esp_bt_uuid_t {
    esp_idf_sys::esp_bt_uuid_t {
        len: esp_idf_sys::ESP_UUID_LEN_16 as u16,
        uuid: esp_idf_sys::esp_bt_uuid_t__bindgen_ty_1 { uuid16: value },
    }
}

/// GATT transport for the provisioning session
pub struct BleProvisioning {
    radio: RadioSlot,
    nvs: EspDefaultNvsPartition,
    device_name: String,
    driver: Option<BtDriver<'static, Ble>>,
    radio_token: Option<Modem>,
}

impl BleProvisioning {
    pub fn new(radio: RadioSlot, nvs: EspDefaultNvsPartition, device_name: String) -> Self {
        Self {
            radio,
            nvs,
            device_name,
            driver: None,
            radio_token: None,
        }
    }

    fn start_stack(&mut self) -> Result<()> {
        if self.driver.is_none() {
            let (token, modem) = claim_radio(&self.radio, "WiFi")?;
            let driver = match BtDriver::<Ble>::new(modem, Some(self.nvs.clone())) {
                Ok(driver) => driver,
                Err(e) => {
                    release_radio(&self.radio, token);
                    return Err(anyhow!("Failed to start BT driver: {:?}", e));
                }
            };
            info!("🔧 Bluedroid stack enabled");
            self.driver = Some(driver);
            self.radio_token = Some(token);
        }

        if !CALLBACKS_REGISTERED.swap(true, Ordering::SeqCst) {
            esp_check(
                unsafe { esp_idf_sys::esp_ble_gatts_register_callback(Some(gatts_event_handler)) },
                "GATT callback registration",
            )?;
            esp_check(
                unsafe { esp_idf_sys::esp_ble_gap_register_callback(Some(gap_event_handler)) },
                "GAP callback registration",
            )?;
        }

        let name = CString::new(self.device_name.as_str())
            .map_err(|_| anyhow!("Invalid device name"))?;
        esp_check(
            unsafe { esp_idf_sys::esp_ble_gap_set_device_name(name.as_ptr()) },
            "Device name setting",
        )?;

        // The rest of the bring-up continues from the registration event
        esp_check(
            unsafe { esp_idf_sys::esp_ble_gatts_app_register(PROFILE_APP_ID) },
            "GATT application registration",
        )
    }
}

impl ProvisioningTransport for BleProvisioning {
    fn enable(
        &mut self,
        sink: Arc<dyn CredentialSink>,
        source: Arc<dyn IdentitySource>,
    ) -> Result<()> {
        {
            let mut handlers = HANDLERS
                .lock()
                .map_err(|_| anyhow!("BLE handler lock poisoned"))?;
            *handlers = Some(Handlers { sink, source });
        }

        ADVERTISING_ENABLED.store(true, Ordering::SeqCst);
        if let Err(e) = self.start_stack() {
            ADVERTISING_ENABLED.store(false, Ordering::SeqCst);
            return Err(e);
        }

        info!("📡 BLE provisioning enabled as '{}'", self.device_name);
        Ok(())
    }

    fn disable(&mut self) -> Result<()> {
        ADVERTISING_ENABLED.store(false, Ordering::SeqCst);

        if let Ok(mut handlers) = HANDLERS.lock() {
            *handlers = None;
        }

        let mut unregistered = Ok(());
        if self.driver.is_some() {
            if CONNECTED.load(Ordering::SeqCst) {
                let gatt_interface = GATT_INTERFACE.load(Ordering::SeqCst);
                let conn_id = CONN_ID.load(Ordering::SeqCst);
                log_esp(
                    unsafe { esp_idf_sys::esp_ble_gatts_close(gatt_interface, conn_id) },
                    "Client disconnect",
                );
            }
            log_esp(
                unsafe { esp_idf_sys::esp_ble_gap_stop_advertising() },
                "Advertising stop",
            );

            let gatt_interface = GATT_INTERFACE.swap(0, Ordering::SeqCst);
            if gatt_interface != 0 {
                unregistered = esp_check(
                    unsafe { esp_idf_sys::esp_ble_gatts_app_unregister(gatt_interface) },
                    "GATT application unregister",
                );
            }
        }

        // Dropping the driver deinitializes bluedroid and the controller
        self.driver = None;
        if let Some(token) = self.radio_token.take() {
            release_radio(&self.radio, token);
        }
        CONFIG_CHAR_HANDLE.store(0, Ordering::SeqCst);
        info!("📴 BLE provisioning disabled");
        unregistered
    }
}

fn start_advertising() {
    if !ADVERTISING_ENABLED.load(Ordering::SeqCst) {
        return;
    }

    let mut adv_params = esp_idf_sys::esp_ble_adv_params_t {
        adv_int_min: 0x20,
        adv_int_max: 0x40,
        adv_type: esp_idf_sys::esp_ble_adv_type_t_ADV_TYPE_IND,
        own_addr_type: esp_idf_sys::esp_ble_addr_type_t_BLE_ADDR_TYPE_PUBLIC,
        peer_addr: [0; 6],
        peer_addr_type: esp_idf_sys::esp_ble_addr_type_t_BLE_ADDR_TYPE_PUBLIC,
        channel_map: esp_idf_sys::esp_ble_adv_channel_t_ADV_CHNL_ALL,
        adv_filter_policy: esp_idf_sys::esp_ble_adv_filter_t_ADV_FILTER_ALLOW_SCAN_ANY_CON_ANY,
    };
    log_esp(
        unsafe { esp_idf_sys::esp_ble_gap_start_advertising(&mut adv_params) },
        "Advertising start",
    );
}

fn configure_advertising() {
    let mut adv_data = esp_idf_sys::esp_ble_adv_data_t {
        set_scan_rsp: false,
        include_name: true,
        include_txpower: false,
        min_interval: 0x0006,
        max_interval: 0x0010,
        appearance: 0x00,
        manufacturer_len: 0,
        p_manufacturer_data: std::ptr::null_mut(),
        service_data_len: 0,
        p_service_data: std::ptr::null_mut(),
        service_uuid_len: ADV_SERVICE_UUID.len() as u16,
        p_service_uuid: ADV_SERVICE_UUID.as_ptr() as *mut u8,
        flag: (esp_idf_sys::ESP_BLE_ADV_FLAG_GEN_DISC | esp_idf_sys::ESP_BLE_ADV_FLAG_BREDR_NOT_SPT)
            as u8,
    };
    log_esp(
        unsafe { esp_idf_sys::esp_ble_gap_config_adv_data(&mut adv_data) },
        "Advertising data configuration",
    );
}

fn create_service(gatt_interface: esp_idf_sys::esp_gatt_if_t) {
    let mut service_id = esp_idf_sys::esp_gatt_srvc_id_t {
        is_primary: true,
        id: esp_idf_sys::esp_gatt_id_t {
            uuid: uuid16(SERVICE_UUID),
            inst_id: 0,
        },
    };
    log_esp(
        unsafe {
            esp_idf_sys::esp_ble_gatts_create_service(
                gatt_interface,
                &mut service_id,
                SERVICE_HANDLE_COUNT,
            )
        },
        "GATT service creation",
    );
}

fn add_config_characteristic(service_handle: u16) {
    let mut char_uuid = uuid16(CONFIG_CHAR_UUID);
    log_esp(
        unsafe {
            esp_idf_sys::esp_ble_gatts_add_char(
                service_handle,
                &mut char_uuid,
                (esp_idf_sys::ESP_GATT_PERM_READ | esp_idf_sys::ESP_GATT_PERM_WRITE) as u16,
                (esp_idf_sys::ESP_GATT_CHAR_PROP_BIT_READ
                    | esp_idf_sys::ESP_GATT_CHAR_PROP_BIT_WRITE
                    | esp_idf_sys::ESP_GATT_CHAR_PROP_BIT_NOTIFY) as u8,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        },
        "Config characteristic creation",
    );
}

fn add_notify_descriptor(service_handle: u16) {
    let mut descr_uuid = uuid16(CCCD_UUID);
    log_esp(
        unsafe {
            esp_idf_sys::esp_ble_gatts_add_char_descr(
                service_handle,
                &mut descr_uuid,
                (esp_idf_sys::ESP_GATT_PERM_READ | esp_idf_sys::ESP_GATT_PERM_WRITE) as u16,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        },
        "Notification descriptor creation",
    );
}

fn notify(payload: &[u8]) {
    let handle = CONFIG_CHAR_HANDLE.load(Ordering::SeqCst);
    if handle == 0 || !CONNECTED.load(Ordering::SeqCst) {
        warn!("⚠️ No client to notify");
        return;
    }

    let mut data = payload.to_vec();
    log_esp(
        unsafe {
            esp_idf_sys::esp_ble_gatts_send_indicate(
                GATT_INTERFACE.load(Ordering::SeqCst),
                CONN_ID.load(Ordering::SeqCst),
                handle,
                data.len() as u16,
                data.as_mut_ptr(),
                false,
            )
        },
        "Reply notification",
    );
}

fn send_response(
    gatt_interface: esp_idf_sys::esp_gatt_if_t,
    conn_id: u16,
    trans_id: u32,
    handle: u16,
    offset: u16,
    value: &[u8],
) {
    let mut rsp: esp_idf_sys::esp_gatt_rsp_t = unsafe { core::mem::zeroed() };
    unsafe {
        let attr = &mut rsp.attr_value;
        let len = value.len().min(attr.value.len());
        attr.value[..len].copy_from_slice(&value[..len]);
        attr.len = len as u16;
        attr.handle = handle;
        attr.offset = offset;
        attr.auth_req = 0;
    }
    log_esp(
        unsafe {
            esp_idf_sys::esp_ble_gatts_send_response(
                gatt_interface,
                conn_id,
                trans_id,
                esp_idf_sys::esp_gatt_status_t_ESP_GATT_OK,
                &mut rsp,
            )
        },
        "GATT response",
    );
}

fn deliver_write(payload: &[u8]) {
    let sink = match HANDLERS.lock() {
        Ok(handlers) => handlers.as_ref().map(|h| h.sink.clone()),
        Err(_) => None,
    };

    match sink {
        Some(sink) => {
            if let Some(reply) = sink.on_write(payload) {
                notify(&reply);
            }
        }
        None => warn!("⚠️ Write of {} bytes with provisioning disabled", payload.len()),
    }
}

fn identity_bytes() -> Vec<u8> {
    match HANDLERS.lock() {
        Ok(handlers) => handlers
            .as_ref()
            .map(|h| h.source.on_read())
            .unwrap_or_default(),
        Err(_) => Vec::new(),
    }
}

extern "C" fn gatts_event_handler(
    event: esp_idf_sys::esp_gatts_cb_event_t,
    gatt_interface: esp_idf_sys::esp_gatt_if_t,
    param: *mut esp_idf_sys::esp_ble_gatts_cb_param_t,
) {
    // A panic must not unwind into the C stack
    if std::panic::catch_unwind(|| gatts_event(event, gatt_interface, param)).is_err() {
        error!("🚨 Panic in GATT event handler");
    }
}

fn gatts_event(
    event: esp_idf_sys::esp_gatts_cb_event_t,
    gatt_interface: esp_idf_sys::esp_gatt_if_t,
    param: *mut esp_idf_sys::esp_ble_gatts_cb_param_t,
) {
    if param.is_null() {
        return;
    }

    match event {
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_REG_EVT => {
            info!("📋 GATT application registered, interface {}", gatt_interface);
            GATT_INTERFACE.store(gatt_interface, Ordering::SeqCst);
            configure_advertising();
            create_service(gatt_interface);
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_CREATE_EVT => {
            let create = unsafe { &(*param).create };
            log_esp(
                unsafe { esp_idf_sys::esp_ble_gatts_start_service(create.service_handle) },
                "GATT service start",
            );
            add_config_characteristic(create.service_handle);
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_ADD_CHAR_EVT => {
            let add_char = unsafe { &(*param).add_char };
            debug!("📝 Config characteristic handle {}", add_char.attr_handle);
            CONFIG_CHAR_HANDLE.store(add_char.attr_handle, Ordering::SeqCst);
            add_notify_descriptor(add_char.service_handle);
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_CONNECT_EVT => {
            let connect = unsafe { &(*param).connect };
            info!("📱 Client connected: {:02x?}", connect.remote_bda);
            CONN_ID.store(connect.conn_id, Ordering::SeqCst);
            CONNECTED.store(true, Ordering::SeqCst);
            if let Ok(mut prepared) = PREPARED_WRITE.lock() {
                prepared.clear();
            }
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_DISCONNECT_EVT => {
            let disconnect = unsafe { &(*param).disconnect };
            info!("📱 Client disconnected, reason {}", disconnect.reason);
            CONNECTED.store(false, Ordering::SeqCst);
            // Stay discoverable for the rest of the window
            start_advertising();
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_READ_EVT => {
            let read = unsafe { &(*param).read };
            if !read.need_rsp {
                return;
            }
            let value = if read.handle == CONFIG_CHAR_HANDLE.load(Ordering::SeqCst) {
                identity_bytes()
            } else {
                Vec::new()
            };
            let offset = usize::from(read.offset).min(value.len());
            send_response(
                gatt_interface,
                read.conn_id,
                read.trans_id,
                read.handle,
                read.offset,
                &value[offset..],
            );
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_WRITE_EVT => {
            let write = unsafe { &(*param).write };
            let data = if write.value.is_null() || write.len == 0 {
                &[][..]
            } else {
                unsafe { std::slice::from_raw_parts(write.value, usize::from(write.len)) }
            };

            let is_config = write.handle == CONFIG_CHAR_HANDLE.load(Ordering::SeqCst);
            if write.is_prep {
                if is_config {
                    prepare_write(usize::from(write.offset), data);
                }
                if write.need_rsp {
                    send_response(
                        gatt_interface,
                        write.conn_id,
                        write.trans_id,
                        write.handle,
                        write.offset,
                        data,
                    );
                }
                return;
            }

            if write.need_rsp {
                send_response(
                    gatt_interface,
                    write.conn_id,
                    write.trans_id,
                    write.handle,
                    write.offset,
                    &[],
                );
            }
            if is_config {
                deliver_write(data);
            }
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_EXEC_WRITE_EVT => {
            let exec = unsafe { &(*param).exec_write };
            send_response(gatt_interface, exec.conn_id, exec.trans_id, 0, 0, &[]);

            let payload = match PREPARED_WRITE.lock() {
                Ok(mut prepared) => std::mem::take(&mut *prepared),
                Err(_) => return,
            };
            if u32::from(exec.exec_write_flag) == esp_idf_sys::ESP_GATT_PREP_WRITE_EXEC
                && !payload.is_empty()
            {
                deliver_write(&payload);
            }
        }
        _ => debug!("📡 GATT event {}", event),
    }
}

fn prepare_write(offset: usize, chunk: &[u8]) {
    let mut prepared = match PREPARED_WRITE.lock() {
        Ok(prepared) => prepared,
        Err(_) => return,
    };

    let end = offset + chunk.len();
    if end > MAX_WRITE_LEN {
        warn!("⚠️ Long write exceeds {} bytes, dropped", MAX_WRITE_LEN);
        prepared.clear();
        return;
    }
    if prepared.len() < end {
        prepared.resize(end, 0);
    }
    prepared[offset..end].copy_from_slice(chunk);
}

extern "C" fn gap_event_handler(
    event: esp_idf_sys::esp_gap_ble_cb_event_t,
    _param: *mut esp_idf_sys::esp_ble_gap_cb_param_t,
) {
    match event {
        esp_idf_sys::esp_gap_ble_cb_event_t_ESP_GAP_BLE_ADV_DATA_SET_COMPLETE_EVT => {
            start_advertising();
        }
        esp_idf_sys::esp_gap_ble_cb_event_t_ESP_GAP_BLE_ADV_START_COMPLETE_EVT => {
            info!("📡 Advertising started");
        }
        esp_idf_sys::esp_gap_ble_cb_event_t_ESP_GAP_BLE_ADV_STOP_COMPLETE_EVT => {
            info!("📡 Advertising stopped");
        }
        _ => debug!("📡 GAP event {}", event),
    }
}
