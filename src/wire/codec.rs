use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::{Buf, BufMut, Bytes};
use uuid::Uuid;

use crate::error::{WireError, WireResult};
use crate::safe_converter::PrecheckedCast;

/// Marker that every offline (i.e. not connected) message carries to distinguish RakNet traffic
///  from arbitrary garbage arriving at the socket.
pub const MAGIC: [u8; 16] = [
    0x00, 0xFF, 0xFF, 0x00,
    0xFE, 0xFE, 0xFE, 0xFE,
    0xFD, 0xFD, 0xFD, 0xFD,
    0x12, 0x34, 0x56, 0x78,
];

pub const TRIAD_LEN: usize = 3;

/// version byte, 4 address bytes, port
pub const ADDRESS_V4_LEN: usize = 7;

const ADDRESS_VERSION_V4: u8 = 4;

macro_rules! checked_get {
    ($name: ident, $ty: ty, $getter: ident) => {
        fn $name(&mut self) -> WireResult<$ty> {
            self.ensure_remaining(std::mem::size_of::<$ty>())?;
            Ok(self.$getter())
        }
    }
}

/// Checked reads of RakNet's primitive fields. All multi-byte numbers are big-endian except
///  triads, which are little-endian.
pub trait RakBuf: Buf {
    fn ensure_remaining(&self, needed: usize) -> WireResult<()> {
        let remaining = self.remaining();
        if remaining < needed {
            return Err(WireError::BufferUnderrun { needed, remaining });
        }
        Ok(())
    }

    checked_get!(read_u8, u8, get_u8);
    checked_get!(read_u16, u16, get_u16);
    checked_get!(read_u32, u32, get_u32);
    checked_get!(read_u64, u64, get_u64);
    checked_get!(read_i8, i8, get_i8);
    checked_get!(read_i16, i16, get_i16);
    checked_get!(read_i32, i32, get_i32);
    checked_get!(read_i64, i64, get_i64);

    fn read_triad(&mut self) -> WireResult<u32> {
        self.ensure_remaining(TRIAD_LEN)?;
        Ok(self.get_uint_le(TRIAD_LEN) as u32)
    }

    fn read_bool(&mut self) -> WireResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    fn read_bytes(&mut self, len: usize) -> WireResult<Bytes> {
        self.ensure_remaining(len)?;
        Ok(self.copy_to_bytes(len))
    }

    fn read_string(&mut self) -> WireResult<String> {
        let len = self.read_u16()? as usize;
        let raw = self.read_bytes(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| WireError::malformed(format!("string is not valid UTF-8: {}", e)))
    }

    fn read_magic(&mut self) -> WireResult<()> {
        self.ensure_remaining(MAGIC.len())?;
        let mut raw = [0u8; 16];
        self.copy_to_slice(&mut raw);
        if raw != MAGIC {
            return Err(WireError::InvalidMagic);
        }
        Ok(())
    }

    fn read_address(&mut self) -> WireResult<SocketAddr> {
        match self.read_u8()? {
            ADDRESS_VERSION_V4 => {
                self.ensure_remaining(ADDRESS_V4_LEN - 1)?;
                let mut octets = [0u8; 4];
                self.copy_to_slice(&mut octets);
                let ip = Ipv4Addr::from(octets.map(|b| !b));
                let port = self.get_u16();
                Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
            }
            n => Err(WireError::UnsupportedAddressVersion(n)),
        }
    }

    fn read_uuid(&mut self) -> WireResult<Uuid> {
        self.ensure_remaining(16)?;
        Ok(Uuid::from_u128(self.get_u128()))
    }
}

pub trait RakBufMut: BufMut {
    /// NB: only the lower 24 bits of the value are written
    fn put_triad(&mut self, value: u32) {
        self.put_uint_le((value & 0xFF_FFFF) as u64, TRIAD_LEN);
    }

    fn put_bool(&mut self, value: bool) {
        self.put_u8(if value { 1 } else { 0 });
    }

    /// The caller is responsible for ensuring that the string's length fits into a u16.
    fn put_string(&mut self, s: &str) {
        self.put_u16(s.len().prechecked_cast());
        self.put_slice(s.as_bytes());
    }

    fn put_magic(&mut self) {
        self.put_slice(&MAGIC);
    }

    fn put_uuid(&mut self, uuid: Uuid) {
        self.put_u128(uuid.as_u128());
    }

    /// IPv4-mapped IPv6 addresses are written as their IPv4 counterpart, all other IPv6 addresses
    ///  can not be represented.
    fn put_address(&mut self, addr: SocketAddr) -> WireResult<()> {
        let ip = match addr {
            SocketAddr::V4(a) => *a.ip(),
            SocketAddr::V6(a) => match a.ip().to_ipv4_mapped() {
                Some(ip) => ip,
                None => return Err(WireError::UnsupportedAddressVersion(6)),
            },
        };

        self.put_u8(ADDRESS_VERSION_V4);
        self.put_slice(&ip.octets().map(|b| !b));
        self.put_u16(addr.port());
        Ok(())
    }
}

impl <T: Buf> RakBuf for T {}

impl <T: BufMut> RakBufMut for T {}
