use mac_address::MacAddress;

/// Key used on the device topic, e.g. `AA-BB-CC-DD-EE-FF`.
pub fn device_key(address: &MacAddress) -> String {
    display(address).replace(':', "-")
}

pub fn display(address: &MacAddress) -> String {
    address.to_string()
}
