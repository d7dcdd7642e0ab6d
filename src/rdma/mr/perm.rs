use std::fmt;
use std::ops::{BitOr, BitOrAssign, Sub, SubAssign};

/// Memory region access rights.
///
/// Bit values follow `enum ibv_access_flags`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Permission(u32);

impl Permission {
    pub const EMPTY: Self = Self(0);
    pub const LOCAL_WRITE: Self = Self(1 << 0);
    pub const REMOTE_WRITE: Self = Self(1 << 1);
    pub const REMOTE_READ: Self = Self(1 << 2);
    pub const REMOTE_ATOMIC: Self = Self(1 << 3);

    /// Rights of a region that only the local side writes into (receive
    /// buffers and outgoing descriptors).
    pub const LOCAL: Self = Self::LOCAL_WRITE;

    /// Rights of a data buffer exposed to the peer for one-sided access.
    pub const EXPOSED: Self =
        Self(Self::LOCAL_WRITE.0 | Self::REMOTE_READ.0 | Self::REMOTE_WRITE.0);

    /// Raw `ibv_access_flags` bits.
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every right in `other` is also granted by `self`.
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether the peer may target this region at all.
    #[inline]
    pub const fn is_remote_accessible(self) -> bool {
        self.0 & (Self::REMOTE_READ.0 | Self::REMOTE_WRITE.0 | Self::REMOTE_ATOMIC.0) != 0
    }
}

impl Default for Permission {
    /// Local write only.
    fn default() -> Self {
        Self::LOCAL
    }
}

impl From<Permission> for i32 {
    fn from(p: Permission) -> Self {
        p.0 as _
    }
}

impl BitOr for Permission {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Permission {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl Sub for Permission {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 & !rhs.0)
    }
}

impl SubAssign for Permission {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 &= !rhs.0;
    }
}

impl fmt::Debug for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Permission, &str); 4] = [
            (Permission::LOCAL_WRITE, "LOCAL_WRITE"),
            (Permission::REMOTE_WRITE, "REMOTE_WRITE"),
            (Permission::REMOTE_READ, "REMOTE_READ"),
            (Permission::REMOTE_ATOMIC, "REMOTE_ATOMIC"),
        ];
        let mut set = f.debug_set();
        for (perm, name) in NAMES {
            if self.contains(perm) {
                set.entry(&format_args!("{}", name));
            }
        }
        set.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposed_grants_one_sided_access() {
        let p = Permission::EXPOSED;
        assert!(p.contains(Permission::REMOTE_READ | Permission::REMOTE_WRITE));
        assert!(p.is_remote_accessible());
        assert!(!Permission::LOCAL.is_remote_accessible());
        assert_eq!(p.bits(), 0b111);
    }

    #[test]
    fn subtraction_removes_rights() {
        let mut p = Permission::EXPOSED;
        p -= Permission::REMOTE_WRITE;
        assert!(!p.contains(Permission::REMOTE_WRITE));
        assert!(p.contains(Permission::REMOTE_READ));
        assert_eq!(format!("{:?}", p), "{LOCAL_WRITE, REMOTE_READ}");
    }
}
