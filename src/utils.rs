use std::sync::OnceLock;

use regex::Regex;

fn mac_regex() -> &'static Regex {
    static MAC: OnceLock<Regex> = OnceLock::new();
    MAC.get_or_init(|| {
        Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").expect("MAC pattern is valid")
    })
}

/// Pulls the last MAC address out of a platform device id
/// (e.g. `hci0/dev_A4_C1_38_...` on BlueZ renders with colons).
pub fn extract_mac_address(device_id: &str) -> Option<String> {
    mac_regex()
        .find_iter(device_id)
        .last()
        .map(|m| normalize_address(m.as_str()))
}

/// Upper case, colon separated.
pub fn normalize_address(address: &str) -> String {
    address.trim().replace('-', ":").to_uppercase()
}

/// True if `address` is exactly one MAC address.
pub fn is_mac_address(address: &str) -> bool {
    let address = address.trim();
    mac_regex()
        .find(address)
        .is_some_and(|m| m.start() == 0 && m.end() == address.len())
}
