// Device Info Module
// Factory MAC readout used for the BLE advertising name and as the peep id
// until a uuid has been provisioned

/// Read the factory-programmed base MAC address
pub fn mac_address() -> [u8; 6] {
    let mut mac = [0u8; 6];
    unsafe {
        esp_idf_svc::sys::esp_efuse_mac_get_default(mac.as_mut_ptr());
    }
    mac
}

/// Fallback device id, e.g. `peep-a0b1c2d3e4f5`
pub fn device_id() -> String {
    let mac = mac_address();
    format!(
        "peep-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// Advertised BLE name; the MAC tail keeps neighbouring devices apart
pub fn advertising_name() -> String {
    let mac = mac_address();
    format!("Peep-{:02X}{:02X}{:02X}", mac[3], mac[4], mac[5])
}
