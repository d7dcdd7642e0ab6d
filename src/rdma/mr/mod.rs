mod descriptor;
mod perm;

use std::fmt;
use std::mem::ManuallyDrop;

use log::{debug, warn};

pub use self::descriptor::*;
pub use self::perm::*;
use super::pd::Pd;
use crate::error::{Error, Result};
use crate::fabric::{Fabric, LKey, RKey, Sge};

fabric_resource! {
    /// Memory registration.
    ///
    /// The registered memory itself does not belong to this type. Use
    /// [`Region`] to tie a registration to the memory it covers.
    Mr, Mr, dereg_mr, "memory region"
}

impl<F: Fabric> Mr<F> {
    /// Register `len` bytes starting at `addr` with the protection domain.
    ///
    /// # Safety
    ///
    /// The memory must stay valid, and must not move, until the registration
    /// is destroyed.
    pub unsafe fn reg(pd: &Pd<F>, addr: *mut u8, len: usize, perm: Permission) -> Result<Self> {
        let fabric = pd.fabric().clone();
        let raw = fabric
            .reg_mr(pd.as_raw(), addr, len, perm)
            .map_err(|source| Error::Registration { len, source })?;
        Ok(Self::from_raw(fabric, raw))
    }

    /// Local and remote key.
    #[inline]
    pub fn keys(&self) -> (LKey, RKey) {
        self.fabric.mr_keys(self.raw)
    }
}

/// Memory whose bytes stay put when its owner moves.
///
/// # Safety
///
/// `as_mut` must return the same address and length for the whole life of
/// the value, no matter how often the value itself is moved.
pub unsafe trait StableMem: AsRef<[u8]> + AsMut<[u8]> {}

// SAFETY: heap allocations do not move with their owner.
unsafe impl StableMem for Box<[u8]> {}
// SAFETY: as above; `Region` never grows the vector.
unsafe impl StableMem for Vec<u8> {}

/// A registered memory region together with the memory it covers.
///
/// The registration is always undone before the memory is released: on
/// drop, or through [`deregister`](Region::deregister). If deregistration
/// fails the memory is leaked rather than freed while the device may still
/// reach it.
pub struct Region<F: Fabric, M: StableMem = Box<[u8]>> {
    mr: Option<Mr<F>>,
    mem: ManuallyDrop<M>,
    addr: u64,
    len: usize,
    lkey: LKey,
    rkey: RKey,
    perm: Permission,
}

impl<F: Fabric, M: StableMem> Region<F, M> {
    /// Register `mem` with the protection domain. On failure `mem` is
    /// released.
    pub fn register(pd: &Pd<F>, mut mem: M, perm: Permission) -> Result<Self> {
        let buf = mem.as_mut();
        let (addr, len) = (buf.as_mut_ptr(), buf.len());

        // SAFETY: `mem` is owned by the returned region, whose drop
        // deregisters before releasing it; `StableMem` keeps the address put.
        let mr = unsafe { Mr::reg(pd, addr, len, perm) }?;
        let (lkey, rkey) = mr.keys();
        debug!("registered {} bytes at {:p} with {:?}", len, addr, perm);
        Ok(Self {
            mr: Some(mr),
            mem: ManuallyDrop::new(mem),
            addr: addr as u64,
            len,
            lkey,
            rkey,
            perm,
        })
    }

    /// Deregister and hand back the memory.
    ///
    /// On failure the memory is leaked: it may still be reachable by the
    /// device.
    pub fn deregister(mut self) -> Result<M> {
        let ret = self.mr.take().map_or(Ok(()), Mr::destroy);
        // SAFETY: `mr` is now `None`, so `drop` will not touch `mem` again.
        ret.map(|()| unsafe { ManuallyDrop::take(&mut self.mem) })
    }

    /// Start address of the region.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Length of the region in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty. Registrations never are.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn lkey(&self) -> LKey {
        self.lkey
    }

    #[inline]
    pub fn rkey(&self) -> RKey {
        self.rkey
    }

    #[inline]
    pub fn perm(&self) -> Permission {
        self.perm
    }

    /// The registered bytes.
    ///
    /// Only meaningful while no work request that writes into the region is
    /// outstanding.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        (*self.mem).as_ref()
    }

    /// The registered bytes, mutably.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        (*self.mem).as_mut()
    }

    /// Scatter/gather entry covering the whole region.
    #[inline]
    pub fn sge(&self) -> Sge {
        Sge {
            addr: self.addr,
            length: self.len as u32,
            lkey: self.lkey,
        }
    }

    /// Scatter/gather entry covering `len` bytes at `offset`.
    /// Return `None` if the range is out of bounds.
    pub fn slice(&self, offset: usize, len: usize) -> Option<Sge> {
        if offset.checked_add(len)? > self.len {
            return None;
        }
        Some(Sge {
            addr: self.addr + offset as u64,
            length: u32::try_from(len).ok()?,
            lkey: self.lkey,
        })
    }

    /// Descriptor advertising this region to the peer.
    /// Return `None` if the region is not remotely accessible or too long
    /// to describe.
    pub fn descriptor(&self) -> Option<BufferDescriptor> {
        if !self.perm.is_remote_accessible() {
            return None;
        }
        let len = u32::try_from(self.len).ok()?;
        Some(BufferDescriptor::new(self.addr, len, self.rkey))
    }
}

impl<F: Fabric> Region<F> {
    /// Allocate `len` zeroed bytes and register them. The allocation is
    /// released if registration fails.
    pub fn allocate(pd: &Pd<F>, len: usize, perm: Permission) -> Result<Self> {
        Self::register(pd, vec![0u8; len].into_boxed_slice(), perm)
    }
}

impl<F: Fabric, M: StableMem> Drop for Region<F, M> {
    fn drop(&mut self) {
        let Some(mr) = self.mr.take() else {
            return;
        };
        match mr.destroy() {
            // SAFETY: deregistered, and `mem` is never touched again.
            Ok(()) => unsafe { ManuallyDrop::drop(&mut self.mem) },
            Err(e) => warn!(
                "cannot deregister {} bytes at {:#x} on drop, leaking them: {}",
                self.len, self.addr, e
            ),
        }
    }
}

impl<F: Fabric, M: StableMem> fmt::Debug for Region<F, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("len", &self.len)
            .field("lkey", &self.lkey)
            .field("rkey", &self.rkey)
            .field("perm", &self.perm)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::fabric::sim::{Fault, Op, SimFabric};
    use crate::fabric::PortSpace;
    use crate::rdma::cm::{CmId, EventChannel};

    /// Boxed bytes that count their releases.
    struct Tracked(Box<[u8]>, Arc<AtomicUsize>);

    impl AsRef<[u8]> for Tracked {
        fn as_ref(&self) -> &[u8] {
            &self.0
        }
    }

    impl AsMut<[u8]> for Tracked {
        fn as_mut(&mut self) -> &mut [u8] {
            &mut self.0
        }
    }

    // SAFETY: wraps a boxed slice.
    unsafe impl StableMem for Tracked {}

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.1.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn setup(sim: &SimFabric) -> (EventChannel<SimFabric>, CmId<SimFabric>, Pd<SimFabric>) {
        let ec = EventChannel::new(sim).unwrap();
        let id = CmId::new(&ec, PortSpace::Udp).unwrap();
        let pd = Pd::new(&id).unwrap();
        (ec, id, pd)
    }

    #[test]
    fn region_descriptor_reflects_registration() {
        let sim = SimFabric::new();
        let (_ec, _id, pd) = setup(&sim);

        let region = Region::allocate(&pd, 4096, Permission::EXPOSED).unwrap();
        let desc = region.descriptor().unwrap();
        assert_eq!(desc.len(), 4096);
        assert_eq!(desc.at(0).addr, region.addr());
        assert_eq!(desc.at(0).rkey, region.rkey());
        assert_eq!(region.slice(4000, 96).map(|s| s.length), Some(96));
        assert_eq!(region.slice(4000, 97), None);

        let local = Region::allocate(&pd, 16, Permission::LOCAL).unwrap();
        assert!(local.descriptor().is_none());
    }

    #[test]
    fn failed_registration_releases_memory() {
        let sim = SimFabric::new().endpoint("m");
        let (_ec, _id, pd) = setup(&sim);
        let released = Arc::new(AtomicUsize::new(0));

        sim.inject(Fault::FailRegistration);
        let mem = Tracked(vec![0u8; 64].into_boxed_slice(), released.clone());
        let err = Region::register(&pd, mem, Permission::LOCAL).unwrap_err();
        assert!(matches!(err, Error::Registration { len: 64, .. }), "{}", err);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_deregisters_before_release() {
        let sim = SimFabric::new().endpoint("m");
        let (_ec, _id, pd) = setup(&sim);
        let released = Arc::new(AtomicUsize::new(0));

        let mem = Tracked(vec![7u8; 32].into_boxed_slice(), released.clone());
        let region = Region::register(&pd, mem, Permission::EXPOSED).unwrap();
        assert_eq!(region.as_slice(), &[7u8; 32]);
        drop(region);

        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(sim.journal("m").iter().any(|op| matches!(op, Op::DeregMr(_))));
        assert_eq!(sim.live_resources("m"), 3);
    }

    #[test]
    fn deregister_hands_back_memory() {
        let sim = SimFabric::new();
        let (_ec, _id, pd) = setup(&sim);

        let mut region = Region::register(&pd, vec![0u8; 8], Permission::LOCAL).unwrap();
        region.as_mut_slice().copy_from_slice(b"ABCDEFGH");
        let mem = region.deregister().unwrap();
        assert_eq!(mem, b"ABCDEFGH");
    }
}
