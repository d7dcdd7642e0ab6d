use super::cm::CmId;
use crate::error::{Error, Result};
use crate::fabric::Fabric;

fabric_resource! {
    /// Protection domain.
    Pd, Pd, dealloc_pd, "protection domain"
}

impl<F: Fabric> Pd<F> {
    /// Allocate a protection domain on the device the identifier is bound to.
    pub fn new(id: &CmId<F>) -> Result<Self> {
        let fabric = id.fabric().clone();
        let raw = fabric
            .alloc_pd(id.as_raw())
            .map_err(Error::transport("allocate PD"))?;
        Ok(Self::from_raw(fabric, raw))
    }
}
