use std::io;

/// Convert a libibverbs return value (zero, or a positive errno) to a Rust `Result`.
#[inline(always)]
pub(crate) fn from_c_ret(ret: i32) -> io::Result<()> {
    match ret {
        0 => Ok(()),
        ret => Err(io::Error::from_raw_os_error(ret.abs())),
    }
}

/// Convert a librdmacm return value (zero, or `-1` with `errno` set) to a
/// Rust `Result`.
#[inline(always)]
pub(crate) fn from_cm_ret(ret: i32) -> io::Result<()> {
    match ret {
        0 => Ok(()),
        _ => Err(io::Error::last_os_error()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbs_errors_carry_errno() {
        assert!(from_c_ret(0).is_ok());
        assert_eq!(
            from_c_ret(libc::EINVAL).unwrap_err().raw_os_error(),
            Some(libc::EINVAL)
        );
        assert_eq!(
            from_c_ret(-libc::ENOMEM).unwrap_err().raw_os_error(),
            Some(libc::ENOMEM)
        );
        assert!(from_cm_ret(0).is_ok());
    }
}
