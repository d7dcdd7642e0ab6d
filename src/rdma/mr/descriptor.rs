use std::mem;

use crate::fabric::{RKey, RemoteAddr};

/// Remote buffer descriptor.
///
/// This is the only structure that crosses the wire. It travels as the raw
/// payload of a two-sided SEND, so its layout is fixed: a 64-bit address, a
/// 32-bit length and a 32-bit remote key, packed into 16 bytes in native
/// byte order.
#[repr(C, packed)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub addr: u64,
    pub len: u32,
    pub rkey: RKey,
}

const _: () = assert!(mem::size_of::<BufferDescriptor>() == BufferDescriptor::SIZE);

impl BufferDescriptor {
    /// Size on the wire.
    pub const SIZE: usize = 16;

    /// Create a new descriptor.
    pub fn new(addr: u64, len: u32, rkey: RKey) -> Self {
        Self { addr, len, rkey }
    }

    /// Encode into the wire layout.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let (addr, len, rkey) = (self.addr, self.len, self.rkey);
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&addr.to_ne_bytes());
        buf[8..12].copy_from_slice(&len.to_ne_bytes());
        buf[12..16].copy_from_slice(&rkey.to_ne_bytes());
        buf
    }

    /// Decode from the wire layout. Return `None` if `buf` is too short.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        let buf: &[u8; Self::SIZE] = buf.get(..Self::SIZE)?.try_into().ok()?;
        let mut addr = [0u8; 8];
        let mut len = [0u8; 4];
        let mut rkey = [0u8; 4];
        addr.copy_from_slice(&buf[0..8]);
        len.copy_from_slice(&buf[8..12]);
        rkey.copy_from_slice(&buf[12..16]);
        Some(Self {
            addr: u64::from_ne_bytes(addr),
            len: u32::from_ne_bytes(len),
            rkey: u32::from_ne_bytes(rkey),
        })
    }

    /// Target of a one-sided operation at the given offset into the
    /// described region.
    #[inline]
    pub fn at(&self, offset: usize) -> RemoteAddr {
        RemoteAddr {
            addr: self.addr + offset as u64,
            rkey: self.rkey,
        }
    }

    /// Length of the described region in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether the descriptor describes an empty region.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for BufferDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (addr, len, rkey) = (self.addr, self.len, self.rkey);
        f.debug_struct("BufferDescriptor")
            .field("addr", &format_args!("{:#x}", addr))
            .field("len", &len)
            .field("rkey", &format_args!("{:#x}", rkey))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoffset::offset_of;

    #[test]
    fn layout_is_packed() {
        assert_eq!(mem::size_of::<BufferDescriptor>(), 16);
        assert_eq!(mem::align_of::<BufferDescriptor>(), 1);
        assert_eq!(offset_of!(BufferDescriptor, addr), 0);
        assert_eq!(offset_of!(BufferDescriptor, len), 8);
        assert_eq!(offset_of!(BufferDescriptor, rkey), 12);
    }

    #[test]
    fn wire_bytes_match_in_memory_layout() {
        let desc = BufferDescriptor::new(0x7f00_dead_beef_0000, 4096, 0x1234);
        let bytes = desc.to_bytes();
        // SAFETY: `BufferDescriptor` is a packed POD type of exactly 16 bytes.
        let raw: [u8; 16] = unsafe { mem::transmute(desc) };
        assert_eq!(bytes, raw);
        assert_eq!(BufferDescriptor::from_bytes(&bytes), Some(desc));
    }

    #[test]
    fn short_buffers_are_rejected() {
        assert_eq!(BufferDescriptor::from_bytes(&[0u8; 15]), None);
        let mut long = [0u8; 20];
        long[8] = 7;
        assert_eq!(BufferDescriptor::from_bytes(&long).map(|d| d.len()), Some(7));
    }

    #[test]
    fn remote_target_offsets_address() {
        let desc = BufferDescriptor::new(0x1000, 64, 9);
        assert_eq!(desc.at(16), RemoteAddr { addr: 0x1010, rkey: 9 });
    }
}
