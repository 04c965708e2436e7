use alloc::{format, string::String};

use bitflags::bitflags;

bitflags! {
    /// Known controller quirks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Errata: u32 {
        /// The controller wedges after a babble error and needs a reset.
        const RESET_AFTER_BABBLE = 1 << 0;
    }
}

const VENDOR_INTEL: u16 = 0x8086;
const VENDOR_VIA: u16 = 0x1106;

/// PCI identity of the controller function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PciIdentity {
    pub vendor: u16,
    pub device: u16,
    pub revision: u8,
}

impl PciIdentity {
    pub const fn new(vendor: u16, device: u16, revision: u8) -> Self {
        Self {
            vendor,
            device,
            revision,
        }
    }

    pub fn errata(&self) -> Errata {
        match self.vendor {
            VENDOR_VIA => Errata::RESET_AFTER_BABBLE,
            _ => Errata::empty(),
        }
    }

    /// Human readable controller name, e.g.
    /// `"Intel 82801DB (ICH4) USB-A UHCI USB Controller"`.
    pub fn name(&self) -> String {
        match (vendor_name(self.vendor), device_name(self.vendor, self.device)) {
            (Some(vendor), Some(device)) => format!("{vendor} {device} UHCI USB Controller"),
            _ => String::from("Generic UHCI USB Controller"),
        }
    }
}

fn vendor_name(vendor: u16) -> Option<&'static str> {
    match vendor {
        VENDOR_INTEL => Some("Intel"),
        VENDOR_VIA => Some("VIA"),
        _ => None,
    }
}

fn device_name(vendor: u16, device: u16) -> Option<&'static str> {
    let name = match (vendor, device) {
        (VENDOR_INTEL, 0x2412) => "82801AA (ICH)",
        (VENDOR_INTEL, 0x2422) => "82801AB (ICH0)",
        (VENDOR_INTEL, 0x2442) => "82801BA/BAM (ICH2) USB-A",
        (VENDOR_INTEL, 0x2444) => "82801BA/BAM (ICH2) USB-B",
        (VENDOR_INTEL, 0x2452) => "82801E",
        (VENDOR_INTEL, 0x2482) => "82801CA/CAM (ICH3) USB-A",
        (VENDOR_INTEL, 0x2484) => "82801CA/CAM (ICH3) USB-B",
        (VENDOR_INTEL, 0x2487) => "82801CA/CAM (ICH3) USB-C",
        (VENDOR_INTEL, 0x24c2) => "82801DB (ICH4) USB-A",
        (VENDOR_INTEL, 0x24c4) => "82801DB (ICH4) USB-B",
        (VENDOR_INTEL, 0x24c7) => "82801DB (ICH4) USB-C",
        (VENDOR_INTEL, 0x24d2) => "82801EB/ER (ICH5/ICH5R) USB-A",
        (VENDOR_INTEL, 0x24d4) => "82801EB/ER (ICH5/ICH5R) USB-B",
        (VENDOR_INTEL, 0x24d7) => "82801EB/ER (ICH5/ICH5R) USB-C",
        (VENDOR_INTEL, 0x24de) => "82801EB/ER (ICH5/ICH5R) USB-D",
        (VENDOR_INTEL, 0x25a9) => "6300ESB",
        (VENDOR_INTEL, 0x24aa) => "6300ESB",
        (VENDOR_INTEL, 0x7020) => "82371SB (PIIX3)",
        (VENDOR_INTEL, 0x7112) => "82371AB/EB/MB (PIIX4)",
        (VENDOR_INTEL, 0x719a) => "82443MX",
        (VENDOR_INTEL, 0x7602) => "82372FB/82468GX (PIIX5)",
        (VENDOR_VIA, 0x3038) => "VT83C572, VT6202",
        _ => return None,
    };
    Some(name)
}
