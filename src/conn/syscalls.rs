//! The syscall surface: `netopen`/`netread`/`netwrite`/`netclose`, each
//! surfacing every error as `-1`.
//!
//! The raw-pointer `extern "C"` ABI in [`abi`] mirrors one function per
//! socket operation for callers crossing a real syscall boundary; it
//! delegates to the safe, slice-based functions here rather than
//! threading raw pointers through the whole stack.

use std::sync::{Arc, OnceLock};

use crate::error::NetError;
use crate::hal::Hal;
use crate::stack::NetStack;
use crate::StackConfig;

static STACK: OnceLock<NetStack> = OnceLock::new();

/// Wires in the platform's [`Hal`] and brings the device up. Must run
/// exactly once before any other function in this module; a second
/// call is a logic error and panics, matching real once-at-boot device
/// bring-up.
pub fn install(hal: Arc<dyn Hal>, config: StackConfig) -> crate::error::NetResult<()> {
    let built = NetStack::new(hal, config)?;
    STACK
        .set(built)
        .unwrap_or_else(|_| panic!("net stack already installed"));
    Ok(())
}

fn stack() -> &'static NetStack {
    STACK
        .get()
        .expect("net stack not installed; call conn::syscalls::install first")
}

/// `netopen(addr, port, type) -> netfd`.
pub fn netopen(addr: u32, port: u16, typ: u8) -> i32 {
    match stack().open(addr, port, typ) {
        Ok(fd) => fd as i32,
        Err(e) => e.as_retcode(),
    }
}

/// `netread(netfd, buf, n) -> bytes_read`.
pub fn netread(netfd: i32, buf: &mut [u8]) -> i32 {
    let Ok(fd) = usize::try_from(netfd) else {
        return NetError::BadFd.as_retcode();
    };
    match stack().read(fd, buf) {
        Ok(n) => n as i32,
        Err(e) => e.as_retcode(),
    }
}

/// `netwrite(netfd, data, n) -> 0 | -1`.
pub fn netwrite(netfd: i32, data: &[u8]) -> i32 {
    let Ok(fd) = usize::try_from(netfd) else {
        return NetError::BadFd.as_retcode();
    };
    match stack().write(fd, data) {
        Ok(()) => 0,
        Err(e) => e.as_retcode(),
    }
}

/// `netclose(netfd) -> 0`. Idempotent.
pub fn netclose(netfd: i32) -> i32 {
    let Ok(fd) = usize::try_from(netfd) else {
        return NetError::BadFd.as_retcode();
    };
    match stack().close(fd) {
        Ok(()) => 0,
        Err(e) => e.as_retcode(),
    }
}

/// Raw-pointer C ABI mirroring the syscall signatures exactly, for
/// callers crossing a real syscall boundary instead of linking this
/// crate directly.
pub mod abi {
    use super::*;

    #[no_mangle]
    pub extern "C" fn sys_netopen(addr: u32, port: u16, typ: u8) -> i32 {
        netopen(addr, port, typ)
    }

    /// # Safety
    /// `buf` must be valid for writes of `n` bytes.
    #[no_mangle]
    pub unsafe extern "C" fn sys_netread(netfd: i32, buf: *mut u8, n: usize) -> i32 {
        if buf.is_null() {
            return NetError::BadFd.as_retcode();
        }
        // SAFETY: caller guarantees buf is valid for n bytes.
        let slice = unsafe { core::slice::from_raw_parts_mut(buf, n) };
        netread(netfd, slice)
    }

    /// # Safety
    /// `buf` must be valid for reads of `n` bytes.
    #[no_mangle]
    pub unsafe extern "C" fn sys_netwrite(netfd: i32, buf: *const u8, n: usize) -> i32 {
        if buf.is_null() {
            return NetError::BadFd.as_retcode();
        }
        // SAFETY: caller guarantees buf is valid for n bytes.
        let slice = unsafe { core::slice::from_raw_parts(buf, n) };
        netwrite(netfd, slice)
    }

    #[no_mangle]
    pub extern "C" fn sys_netclose(netfd: i32) -> i32 {
        netclose(netfd)
    }
}
