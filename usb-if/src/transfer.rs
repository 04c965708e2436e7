use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    Out,
    In,
}

impl Direction {
    pub fn from_address(addr: u8) -> Self {
        if addr & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn reverse(self) -> Self {
        match self {
            Direction::In => Direction::Out,
            Direction::Out => Direction::In,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum EndpointType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum RequestType {
    Standard = 0,
    Class = 1,
    Vendor = 2,
    Reserved = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

/// The 8-byte SETUP packet of a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub direction: Direction,
    pub request_type: RequestType,
    pub recipient: Recipient,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl ControlSetup {
    pub fn to_bytes(&self) -> [u8; 8] {
        let dir = match self.direction {
            Direction::In => 0x80,
            Direction::Out => 0,
        };
        let bm_request_type =
            dir | (u8::from(self.request_type) << 5) | u8::from(self.recipient);
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            bm_request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_packet_layout() {
        let setup = ControlSetup {
            direction: Direction::In,
            request_type: RequestType::Standard,
            recipient: Recipient::Device,
            request: 6,
            value: 0x0100,
            index: 0,
            length: 18,
        };
        assert_eq!(setup.to_bytes(), [0x80, 6, 0x00, 0x01, 0, 0, 18, 0]);
    }

    #[test]
    fn direction_from_endpoint_address() {
        assert_eq!(Direction::from_address(0x81), Direction::In);
        assert_eq!(Direction::from_address(0x02), Direction::Out);
        assert_eq!(Direction::In.reverse(), Direction::Out);
    }
}
