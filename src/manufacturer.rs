// No manufacturer data advertised.
pub const UNKNOWN: u16 = 0xFFFF;

// Bluetooth SIG company identifiers, sorted by id.
static COMPANY_IDS: &[(u16, &str)] = &[
    (0x0000, "Ericsson Technology Licensing"),
    (0x0001, "Nokia Mobile Phones"),
    (0x0002, "Intel Corp."),
    (0x0003, "IBM Corp."),
    (0x0004, "Toshiba Corp."),
    (0x0006, "Microsoft"),
    (0x000A, "Qualcomm Technologies International, Ltd. (QTIL)"),
    (0x000D, "Texas Instruments Inc."),
    (0x000F, "Broadcom Corporation"),
    (0x001D, "Qualcomm"),
    (0x004C, "Apple, Inc."),
    (0x0059, "Nordic Semiconductor ASA"),
    (0x0075, "Samsung Electronics Co. Ltd."),
    (0x0087, "Garmin International, Inc."),
    (0x009E, "Bose Corporation"),
    (0x00E0, "Google"),
    (0x0131, "Cypress Semiconductor"),
    (0x0157, "Anhui Huami Information Technology Co., Ltd."),
    (0x0171, "Amazon.com Services, LLC"),
    (0x018E, "Google LLC"),
    (0x02E5, "Espressif Systems (Shanghai) Co., Ltd."),
    (0x038F, "Xiaomi Inc."),
    (0x0499, "Ruuvi Innovations Ltd."),
];

pub fn lookup(id: u16) -> Option<&'static str> {
    COMPANY_IDS
        .binary_search_by_key(&id, |(known, _)| *known)
        .ok()
        .map(|index| COMPANY_IDS[index].1)
}

pub fn name(id: u16) -> &'static str {
    lookup(id).unwrap_or("")
}

pub fn id_hex(id: u16) -> String {
    format!("0x{id:04X}")
}
