//! Ties the NIC driver, connection table, and ARP cache behind one
//! global lock: exactly one mutex protects the connection table, every
//! per-connection RX buffer and counter, the RX drain pointer, and TX
//! serialization. Callers own an explicit [`NetStack`] and lock it
//! themselves around each operation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::arp::{self, ArpCache};
use crate::config::{FIXED_IP, MAX_UDP_PAYLOAD, NUM_SLOTS};
use crate::conn::{self, ConnectionTable};
use crate::dispatch;
use crate::driver::Nic;
use crate::driver::regs::Intr;
use crate::error::{NetError, NetResult};
use crate::hal::Hal;
use crate::StackConfig;

struct StackState {
    nic: Nic,
    conns: ConnectionTable,
    cache: ArpCache,
}

/// Counters with no behavioral effect, useful for tests and diagnostics.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub rx_frames: u64,
    pub tx_frames: u64,
    pub dropped_frames: u64,
}

#[derive(Default)]
struct AtomicStats {
    rx_frames: AtomicU64,
    tx_frames: AtomicU64,
    dropped_frames: AtomicU64,
}

/// The process-wide network core: one NIC, one connection table, one
/// ARP cache, one lock.
pub struct NetStack {
    state: Mutex<StackState>,
    /// One condition variable per slot; waiters re-check their own
    /// predicate in a loop to tolerate spurious wakeups.
    condvars: Vec<Condvar>,
    config: StackConfig,
    stats: AtomicStats,
}

impl NetStack {
    /// Probes for the device and brings up both rings. `NoDevice` or
    /// `AllocFailed` propagate from [`Nic::init`].
    pub fn new(hal: Arc<dyn Hal>, config: StackConfig) -> NetResult<Self> {
        let nic = Nic::init(hal)?;
        Ok(Self {
            state: Mutex::new(StackState {
                nic,
                conns: ConnectionTable::new(),
                cache: ArpCache::new(),
            }),
            condvars: (0..NUM_SLOTS).map(|_| Condvar::new()).collect(),
            config,
            stats: AtomicStats::default(),
        })
    }

    pub fn mac(&self) -> [u8; 6] {
        self.state.lock().unwrap().nic.mac()
    }

    pub fn stats(&self) -> Stats {
        Stats {
            rx_frames: self.stats.rx_frames.load(Ordering::Relaxed),
            tx_frames: self.stats.tx_frames.load(Ordering::Relaxed),
            dropped_frames: self.stats.dropped_frames.load(Ordering::Relaxed),
        }
    }

    /// Services a pending interrupt: reclaims TX descriptors on TXDW,
    /// drains and dispatches RX frames on RXT0.
    pub fn on_interrupt(&self) {
        let mut guard = self.state.lock().unwrap();
        let icr = guard.nic.on_interrupt();

        let mut wakes = Vec::new();
        if icr.contains(Intr::RXT0) {
            let mut frames: Vec<Vec<u8>> = Vec::new();
            guard.nic.read_packets(|buf, _eop| frames.push(buf.to_vec()));
            self.stats
                .rx_frames
                .fetch_add(frames.len() as u64, Ordering::Relaxed);
            for frame in &frames {
                let mut outcome =
                    dispatch::handle_frame(&mut guard.nic, &mut guard.cache, &mut guard.conns, frame);
                if outcome.dropped {
                    self.stats.dropped_frames.fetch_add(1, Ordering::Relaxed);
                }
                wakes.append(&mut outcome.wakes);
            }
        }
        drop(guard);
        for idx in wakes {
            self.condvars[idx].notify_all();
        }
    }

    /// Test-only ingress helper: injects `frame` as if the device had
    /// just DMA'd it in, then services the resulting interrupt. Public
    /// and not `cfg(test)` so integration tests can drive ingress
    /// end-to-end without real hardware.
    pub fn inject_rx_frame_for_test(&self, frame: &[u8]) {
        {
            let mut guard = self.state.lock().unwrap();
            guard.nic.simulate_rx(frame);
        }
        self.on_interrupt();
    }

    /// Opens a UDP connection to `(addr, port)`. Blocks until ARP
    /// resolves or `config.arp_timeout` elapses.
    pub fn open(&self, addr: u32, port: u16, typ: u8) -> NetResult<usize> {
        if typ != 0 {
            return Err(NetError::BadType);
        }

        let mut guard = self.state.lock().unwrap();
        let fd = guard.conns.allocate(addr, port)?;
        log::debug!("open: fd={fd} local_port={} remote={addr:#010x}:{port}", conn::local_port(fd));

        if let Some(mac) = guard.cache.lookup(addr) {
            log::debug!("open: fd={fd} resolved from ARP cache, no wire round trip");
            guard.conns.resolve_all(addr, mac);
            return Ok(fd);
        }

        arp::arp_request(&mut guard.nic, addr);
        let deadline = Instant::now() + self.config.arp_timeout;

        loop {
            if guard.conns.dst_mac_valid(fd).unwrap_or(false) {
                log::info!("open: fd={fd} ARP resolved, connection ready");
                return Ok(fd);
            }
            let now = Instant::now();
            if now >= deadline {
                log::warn!("open: fd={fd} ARP resolution timed out waiting for {addr:#010x}");
                let _ = guard.conns.close(fd);
                return Err(NetError::ArpTimeout);
            }
            let (g, _timeout) = self.condvars[fd]
                .wait_timeout(guard, deadline - now)
                .unwrap();
            guard = g;
        }
    }

    /// Sends `data` as one UDP datagram over the given connection.
    pub fn write(&self, fd: usize, data: &[u8]) -> NetResult<()> {
        if data.len() > MAX_UDP_PAYLOAD {
            return Err(NetError::PayloadTooLarge);
        }
        let mut guard = self.state.lock().unwrap();
        if !guard.conns.is_occupied(fd) {
            return Err(NetError::BadFd);
        }
        let dst_mac = guard.conns.dst_mac(fd)?;
        let (remote_addr, remote_port) = guard.conns.remote(fd)?;
        let local_mac = guard.nic.mac();
        dispatch::send_udp(
            &mut guard.nic,
            local_mac,
            dst_mac,
            FIXED_IP,
            remote_addr,
            fd,
            remote_port,
            data,
        )?;
        self.stats.tx_frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Blocks until data is queued on the connection, then copies it
    /// into `buf`.
    pub fn read(&self, fd: usize, buf: &mut [u8]) -> NetResult<usize> {
        let mut guard = self.state.lock().unwrap();
        if !guard.conns.is_occupied(fd) {
            return Err(NetError::BadFd);
        }
        loop {
            if guard.conns.pending(fd)? {
                return guard.conns.read(fd, buf);
            }
            guard = self.condvars[fd].wait(guard).unwrap();
            if !guard.conns.is_occupied(fd) {
                return Err(NetError::BadFd);
            }
        }
    }

    /// Tears down a connection. Idempotent. Wakes anyone blocked in
    /// `open`/`read` on this slot so they observe `BadFd` instead of
    /// waiting on a condition that will never again become true.
    pub fn close(&self, fd: usize) -> NetResult<()> {
        let mut guard = self.state.lock().unwrap();
        let result = guard.conns.close(fd);
        drop(guard);
        log::debug!("close: fd={fd}");
        if let Some(condvar) = self.condvars.get(fd) {
            condvar.notify_all();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::fake::FakeHal;
    use crate::wire::{ArpPacket, EtherType, EthernetHeader, BROADCAST_MAC};

    fn new_stack() -> (Arc<NetStack>, Arc<FakeHal>) {
        let _ = env_logger::try_init();
        let hal = Arc::new(FakeHal::new([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]));
        let stack = Arc::new(
            NetStack::new(hal.clone() as Arc<dyn Hal>, StackConfig {
                arp_timeout: Duration::from_millis(50),
            })
            .unwrap(),
        );
        (stack, hal)
    }

    fn inject_arp_reply(stack: &NetStack, spa: u32, sha: [u8; 6]) {
        let packet = ArpPacket {
            oper: crate::wire::OPER_REPLY,
            sha,
            spa,
            tha: stack.mac(),
            tpa: FIXED_IP,
        };
        let mut frame = [0u8; crate::wire::ETHERNET_HEADER_LEN + crate::wire::ARP_PACKET_LEN];
        let eth = EthernetHeader {
            dst: stack.mac(),
            src: sha,
            ethertype: EtherType::Arp,
        };
        let off = eth.pack(&mut frame);
        packet.pack(&mut frame[off..]);
        stack.inject_rx_frame_for_test(&frame);
    }

    #[test]
    fn open_blocks_until_arp_reply_then_resolves() {
        let (stack, _hal) = new_stack();
        let s2 = stack.clone();
        let handle = std::thread::spawn(move || s2.open(0x0A00_0001, 5000, 0));
        std::thread::sleep(Duration::from_millis(10));
        inject_arp_reply(&stack, 0x0A00_0001, [0xAA; 6]);
        let fd = handle.join().unwrap().unwrap();
        assert_eq!(fd, 0);
    }

    #[test]
    fn open_times_out_without_reply() {
        let (stack, _hal) = new_stack();
        let result = stack.open(0x0A00_0001, 5000, 0);
        assert_eq!(result, Err(NetError::ArpTimeout));
    }

    #[test]
    fn open_rejects_non_udp_type() {
        let (stack, _hal) = new_stack();
        assert_eq!(stack.open(0x0A00_0001, 5000, 1), Err(NetError::BadType));
    }

    #[test]
    fn hundredth_first_open_fails_with_no_slots() {
        let (stack, _hal) = new_stack();
        for i in 0..NUM_SLOTS {
            let s = stack.clone();
            inject_arp_reply(&stack, 0x0A00_0001 + i as u32, [0xAA; 6]);
            let _ = s.open(0x0A00_0001 + i as u32, 5000, 0);
        }
        assert_eq!(stack.open(0x0A00_0099, 5000, 0), Err(NetError::NoSlots));
    }

    #[test]
    fn read_blocks_then_returns_injected_payload() {
        let (stack, _hal) = new_stack();
        inject_arp_reply(&stack, 0x0A00_0001, [0xAA; 6]);
        let fd = stack.open(0x0A00_0001, 5000, 0).unwrap();
        let port = conn::local_port(fd);

        let s2 = stack.clone();
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 16];
            let n = s2.read(fd, &mut buf).unwrap();
            (n, buf)
        });
        std::thread::sleep(Duration::from_millis(10));

        let frame = dispatch::build_udp_frame([0xAA; 6], stack.mac(), 0x0A00_0001, FIXED_IP, 5000, port, b"abc");
        stack.inject_rx_frame_for_test(&frame);

        let (n, buf) = handle.join().unwrap();
        assert_eq!(&buf[..n], b"abc");
    }

    #[test]
    fn write_produces_expected_frame() {
        let (stack, hal) = new_stack();
        inject_arp_reply(&stack, 0x0A00_0001, [0xAA; 6]);
        let fd = stack.open(0x0A00_0001, 5000, 0).unwrap();
        stack.write(fd, b"hello, world").unwrap();
        assert!(hal.peek_reg(crate::driver::regs::offset::TDT) >= 1);
    }

    #[test]
    fn write_rejects_oversized_payload() {
        let (stack, _hal) = new_stack();
        inject_arp_reply(&stack, 0x0A00_0001, [0xAA; 6]);
        let fd = stack.open(0x0A00_0001, 5000, 0).unwrap();
        let big = vec![0u8; MAX_UDP_PAYLOAD + 1];
        assert_eq!(stack.write(fd, &big), Err(NetError::PayloadTooLarge));
    }

    #[test]
    fn close_is_idempotent_and_frees_the_slot() {
        let (stack, _hal) = new_stack();
        inject_arp_reply(&stack, 0x0A00_0001, [0xAA; 6]);
        let fd = stack.open(0x0A00_0001, 5000, 0).unwrap();
        assert!(stack.close(fd).is_ok());
        assert!(stack.close(fd).is_ok());
        assert_eq!(stack.write(fd, b"x"), Err(NetError::BadFd));
    }

    #[test]
    fn close_wakes_a_blocked_reader_with_bad_fd() {
        let (stack, _hal) = new_stack();
        inject_arp_reply(&stack, 0x0A00_0001, [0xAA; 6]);
        let fd = stack.open(0x0A00_0001, 5000, 0).unwrap();

        let s2 = stack.clone();
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 16];
            s2.read(fd, &mut buf)
        });
        std::thread::sleep(Duration::from_millis(10));
        stack.close(fd).unwrap();

        assert_eq!(handle.join().unwrap(), Err(NetError::BadFd));
    }

    #[test]
    fn frame_to_wrong_ip_is_dropped_without_touching_any_connection() {
        let (stack, _hal) = new_stack();
        inject_arp_reply(&stack, 0x0A00_0001, [0xAA; 6]);
        let fd = stack.open(0x0A00_0001, 5000, 0).unwrap();
        let port = conn::local_port(fd);
        let frame = dispatch::build_udp_frame(
            [0xAA; 6],
            stack.mac(),
            0x0A00_0001,
            0x0A00_0003,
            5000,
            port,
            b"abc",
        );
        stack.inject_rx_frame_for_test(&frame);
        let before = stack.stats();
        assert!(before.dropped_frames >= 1);
    }

    #[test]
    fn arp_request_is_broadcast_to_all_mac() {
        let (stack, _hal) = new_stack();
        let s2 = stack.clone();
        let handle = std::thread::spawn(move || s2.open(0x0A00_0005, 6000, 0));
        std::thread::sleep(Duration::from_millis(5));
        inject_arp_reply(&stack, 0x0A00_0005, BROADCAST_MAC);
        let _ = handle.join().unwrap();
    }
}
