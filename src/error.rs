//! Error kinds returned by the core.
//!
//! Internal ingress errors (malformed packets, buffer overflow) never
//! surface here — they're counted and dropped inside [`crate::dispatch`].
//! Only the syscall surface and device bring-up return [`NetError`].

/// Error kinds returned by `open`/`read`/`write`/`close` and by device
/// bring-up.
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone, Copy)]
pub enum NetError {
    /// PCI probe found no matching 82540EM-class device.
    #[error("no matching NIC found during probe")]
    NoDevice,
    /// The page allocator returned nothing.
    #[error("page allocation failed")]
    AllocFailed,
    /// The connection table is full.
    #[error("no free connection slots")]
    NoSlots,
    /// `netfd` is out of range or names a free slot.
    #[error("bad file descriptor")]
    BadFd,
    /// `open` was called with a protocol type other than UDP.
    #[error("unsupported connection type")]
    BadType,
    /// Egress payload exceeds 4096 bytes minus headers.
    #[error("payload too large for a single frame")]
    PayloadTooLarge,
    /// Ingress payload would overflow the connection's RX buffer.
    #[error("receive buffer would overflow")]
    WouldOverflow,
    /// `open` gave up waiting for an ARP reply.
    #[error("ARP resolution timed out")]
    ArpTimeout,
}

/// Convenience alias used throughout the crate.
pub type NetResult<T> = Result<T, NetError>;

impl NetError {
    /// Maps every error kind to the `-1` the syscall surface reports to
    /// user space.
    pub const fn as_retcode(self) -> i32 {
        -1
    }
}
