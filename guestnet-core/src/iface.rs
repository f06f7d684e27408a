use crate::{GuestAddress, FAMILY_INET, FAMILY_INET6};

/// Interface is administratively/operationally down.
pub const IFACE_STATUS_DOWN: u32 = 0;
/// Interface is up.
pub const IFACE_STATUS_UP: u32 = 1;

const NAME_CAPACITY: usize = 64;
const HW_ADDR_CAPACITY: usize = 8;
// present + family + port + flow + scope + 16 raw bytes
const ADDR_SLOT_SIZE: usize = 4 + 4 + 4 + 4 + 4 + 16;
const ADDR_SLOT_COUNT: usize = 5;

/// One entry of a network interface snapshot, in the shape the guest
/// consumes it: a fixed-size record fetched one at a time through the
/// interface-control get-option surface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub status: u32,
    pub mtu: i32,
    /// Link speed metric in kbps; 0 when the host does not report one.
    pub speed_metric: i32,
    pub features: u32,
    pub hardware_addr: [u8; HW_ADDR_CAPACITY],
    pub hardware_addr_len: u32,
    pub addr: Option<GuestAddress>,
    pub netmask: Option<GuestAddress>,
    pub broadcast: Option<GuestAddress>,
    pub name_server: Option<GuestAddress>,
    pub gateway: Option<GuestAddress>,
}

impl InterfaceInfo {
    /// Exact size of the guest encoding. Get-option callers must supply a
    /// buffer of exactly this many bytes.
    pub const WIRE_SIZE: usize =
        4 + NAME_CAPACITY + 16 + 4 + HW_ADDR_CAPACITY + ADDR_SLOT_COUNT * ADDR_SLOT_SIZE;

    /// Encodes the record into `buf`, which must be exactly
    /// [`InterfaceInfo::WIRE_SIZE`] bytes. Names longer than the fixed
    /// name field are truncated.
    pub fn encode(&self, buf: &mut [u8]) {
        assert_eq!(buf.len(), Self::WIRE_SIZE);
        let mut w = Writer { buf, at: 0 };

        let name = self.name.as_bytes();
        let name_len = name.len().min(NAME_CAPACITY);
        w.u32(name_len as u32);
        w.bytes_padded(&name[..name_len], NAME_CAPACITY);

        w.u32(self.status);
        w.u32(self.mtu as u32);
        w.u32(self.speed_metric as u32);
        w.u32(self.features);

        let hw_len = (self.hardware_addr_len as usize).min(HW_ADDR_CAPACITY);
        w.u32(hw_len as u32);
        w.bytes_padded(&self.hardware_addr[..hw_len], HW_ADDR_CAPACITY);

        for slot in [
            &self.addr,
            &self.netmask,
            &self.broadcast,
            &self.name_server,
            &self.gateway,
        ] {
            w.addr_slot(slot.as_ref());
        }
        debug_assert_eq!(w.at, Self::WIRE_SIZE);
    }

    /// Decodes a record previously produced by [`InterfaceInfo::encode`].
    /// Returns `None` if the buffer size or a family tag is malformed.
    pub fn decode(buf: &[u8]) -> Option<InterfaceInfo> {
        if buf.len() != Self::WIRE_SIZE {
            return None;
        }
        let mut r = Reader { buf, at: 0 };

        let name_len = r.u32() as usize;
        if name_len > NAME_CAPACITY {
            return None;
        }
        let name_field = r.bytes(NAME_CAPACITY);
        let name = String::from_utf8_lossy(&name_field[..name_len]).into_owned();

        let status = r.u32();
        let mtu = r.u32() as i32;
        let speed_metric = r.u32() as i32;
        let features = r.u32();

        let hw_len = r.u32();
        if hw_len as usize > HW_ADDR_CAPACITY {
            return None;
        }
        let mut hardware_addr = [0u8; HW_ADDR_CAPACITY];
        hardware_addr.copy_from_slice(r.bytes(HW_ADDR_CAPACITY));

        let mut slots = [None, None, None, None, None];
        for slot in slots.iter_mut() {
            *slot = r.addr_slot()?;
        }
        let [addr, netmask, broadcast, name_server, gateway] = slots;

        Some(InterfaceInfo {
            name,
            status,
            mtu,
            speed_metric,
            features,
            hardware_addr,
            hardware_addr_len: hw_len,
            addr,
            netmask,
            broadcast,
            name_server,
            gateway,
        })
    }
}

struct Writer<'a> {
    buf: &'a mut [u8],
    at: usize,
}

impl Writer<'_> {
    fn u32(&mut self, value: u32) {
        self.buf[self.at..self.at + 4].copy_from_slice(&value.to_le_bytes());
        self.at += 4;
    }

    fn bytes_padded(&mut self, src: &[u8], field: usize) {
        self.buf[self.at..self.at + src.len()].copy_from_slice(src);
        for byte in &mut self.buf[self.at + src.len()..self.at + field] {
            *byte = 0;
        }
        self.at += field;
    }

    fn addr_slot(&mut self, addr: Option<&GuestAddress>) {
        match addr {
            None => {
                self.u32(0);
                self.u32(0);
                self.u32(0);
                self.u32(0);
                self.u32(0);
                self.bytes_padded(&[], 16);
            }
            Some(addr) => {
                self.u32(1);
                self.u32(addr.family());
                self.u32(addr.port() as u32);
                match addr {
                    GuestAddress::V4 { .. } => {
                        self.u32(0);
                        self.u32(0);
                    }
                    GuestAddress::V6 { flow, scope, .. } => {
                        self.u32(*flow);
                        self.u32(*scope);
                    }
                }
                self.bytes_padded(addr.raw_bytes(), 16);
            }
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn u32(&mut self) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.buf[self.at..self.at + 4]);
        self.at += 4;
        u32::from_le_bytes(raw)
    }

    fn bytes(&mut self, len: usize) -> &'a [u8] {
        let out = &self.buf[self.at..self.at + len];
        self.at += len;
        out
    }

    // None = malformed, Some(None) = empty slot.
    #[allow(clippy::option_option)]
    fn addr_slot(&mut self) -> Option<Option<GuestAddress>> {
        let present = self.u32();
        let family = self.u32();
        let port = self.u32() as u16;
        let flow = self.u32();
        let scope = self.u32();
        let raw = self.bytes(16);
        if present == 0 {
            return Some(None);
        }
        match family {
            FAMILY_INET => {
                let mut addr = [0u8; 4];
                addr.copy_from_slice(&raw[..4]);
                Some(Some(GuestAddress::v4(addr, port)))
            }
            FAMILY_INET6 => {
                let mut addr = [0u8; 16];
                addr.copy_from_slice(raw);
                Some(Some(GuestAddress::v6(addr, port, flow, scope)))
            }
            _ => None,
        }
    }
}
