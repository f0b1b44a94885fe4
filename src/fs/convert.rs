use crate::error::BridgeError;
use std::io;

/// Map std::io::Error to the closest libc error code; falls back to EIO.
pub(crate) fn io_error_to_libc(e: &io::Error) -> i32 {
    if let Some(code) = e.raw_os_error() {
        return code;
    }

    match e.kind() {
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::AlreadyExists => libc::EEXIST,
        io::ErrorKind::InvalidInput => libc::EINVAL,
        io::ErrorKind::InvalidData => libc::EINVAL,
        io::ErrorKind::TimedOut => libc::ETIMEDOUT,
        io::ErrorKind::Interrupted => libc::EINTR,
        io::ErrorKind::WriteZero => libc::ENOSPC,
        io::ErrorKind::OutOfMemory => libc::ENOMEM,
        io::ErrorKind::BrokenPipe => libc::EPIPE,
        io::ErrorKind::WouldBlock => libc::EAGAIN,
        _ => libc::EIO,
    }
}

/// Convert a bridge error to the errno handed back to the kernel. Node
/// operations never panic; everything funnels through here at the top of
/// the call tree.
pub(crate) fn error_to_errno(e: &BridgeError) -> i32 {
    match e {
        BridgeError::NoAccessToProject => libc::EPERM,
        BridgeError::NoProjectTransferRequest => libc::ENOENT,
        BridgeError::NoGlobusAccount => libc::EINVAL,
        BridgeError::Globus(_) => libc::EINVAL,
        BridgeError::Db(sqlx::Error::RowNotFound) => libc::ENOENT,
        BridgeError::Db(_) => libc::EIO,
        BridgeError::Io(io_err) => io_error_to_libc(io_err),
        _ => libc::EIO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let not_found = io::Error::new(io::ErrorKind::NotFound, "missing");
        assert_eq!(io_error_to_libc(&not_found), libc::ENOENT);

        let raw = io::Error::from_raw_os_error(libc::ENOSPC);
        assert_eq!(io_error_to_libc(&raw), libc::ENOSPC);
    }

    #[test]
    fn test_bridge_error_mapping() {
        assert_eq!(error_to_errno(&BridgeError::NoAccessToProject), libc::EPERM);
        assert_eq!(
            error_to_errno(&BridgeError::NoProjectTransferRequest),
            libc::ENOENT
        );
        assert_eq!(error_to_errno(&BridgeError::NoGlobusAccount), libc::EINVAL);
        assert_eq!(
            error_to_errno(&BridgeError::Db(sqlx::Error::RowNotFound)),
            libc::ENOENT
        );
    }
}
