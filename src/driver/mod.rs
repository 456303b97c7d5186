//! The NIC driver: device bring-up, RX/TX descriptor rings, interrupt
//! servicing.

pub mod regs;
pub mod ring;

use std::sync::Arc;

use crate::config::{PAGE_SIZE, RING_SIZE};
use crate::error::{NetError, NetResult};
use crate::hal::{Hal, Page};
use regs::{offset, Intr, Rctl, Tctl, EERD_ADDR_SHIFT, EERD_DATA_SHIFT, EERD_DONE, EERD_START};
use ring::{
    ring_next, ring_prev, RxDescriptor, TxContextDescriptor, TxDescriptor, TX_CMD_DEXT,
    TX_CMD_EOP, TX_CMD_IFCS, TX_CMD_RS,
};

/// One call's worth of offload intent for `transmit`. Currently only
/// UDP/IPv4 checksum offload exists, so this is a bool in spirit; kept
/// as an enum so adding a variant later doesn't change every call
/// site's argument type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offload {
    None,
    UdpChecksum,
}

struct RxRing {
    desc_page: Page,
    buf_pages: [Page; RING_SIZE],
    /// Next descriptor index software expects the device to have filled.
    next: usize,
}

impl RxRing {
    unsafe fn descriptors(&self) -> &mut [RxDescriptor] {
        // SAFETY: desc_page is RING_SIZE * 16 == PAGE_SIZE bytes, exactly
        // sized for RING_SIZE descriptors, allocated for the ring's
        // lifetime and touched only under the stack's single lock.
        unsafe { core::slice::from_raw_parts_mut(self.desc_page.vaddr as *mut RxDescriptor, RING_SIZE) }
    }
}

struct TxRing {
    desc_page: Page,
    /// One scratch page per descriptor slot, reused for its lifetime
    /// instead of allocating and leaking a page per transmit.
    buf_pages: [Page; RING_SIZE],
    /// Next descriptor index to fill on the next transmit.
    next: usize,
    /// Oldest descriptor index not yet confirmed reclaimed.
    reclaim_from: usize,
    ctx_written: bool,
}

impl TxRing {
    unsafe fn data_desc_mut(&self, idx: usize) -> &mut TxDescriptor {
        // SAFETY: idx < RING_SIZE and desc_page holds RING_SIZE 16-byte
        // slots; caller guarantees this slot currently holds a data
        // descriptor, not the one-time context descriptor.
        unsafe { &mut *(self.desc_page.vaddr as *mut TxDescriptor).add(idx) }
    }

    unsafe fn ctx_desc_mut(&self, idx: usize) -> &mut TxContextDescriptor {
        // SAFETY: same layout guarantee as data_desc_mut; caller
        // guarantees this slot is the one-time context descriptor.
        unsafe { &mut *(self.desc_page.vaddr as *mut TxContextDescriptor).add(idx) }
    }
}

/// Driver for one 82540EM-class controller: owns its descriptor rings
/// and scratch buffer pools, and talks to hardware only through [`Hal`].
pub struct Nic {
    hal: Arc<dyn Hal>,
    base: u32,
    mac: [u8; 6],
    rx: RxRing,
    tx: TxRing,
}

/// Reads one 16-bit EEPROM word; the MAC is assembled from three of
/// these.
fn eeprom_read_word(hal: &dyn Hal, base: u32, addr: u8) -> u16 {
    let cmd = EERD_START | ((addr as u32) << EERD_ADDR_SHIFT);
    hal.mmio_write32(base, offset::EERD, cmd);
    loop {
        let v = hal.mmio_read32(base, offset::EERD);
        if v & EERD_DONE != 0 {
            return (v >> EERD_DATA_SHIFT) as u16;
        }
        std::hint::spin_loop();
    }
}

impl Nic {
    /// Probes for the device, reads its MAC, and brings up both
    /// descriptor rings.
    pub fn init(hal: Arc<dyn Hal>) -> NetResult<Self> {
        let base = hal.probe_nic().ok_or_else(|| {
            log::warn!("e82540: no matching NIC found during PCI probe");
            NetError::NoDevice
        })?;
        log::info!("e82540: found device at MMIO base {base:#010x}");

        let w0 = eeprom_read_word(hal.as_ref(), base, 0);
        let w1 = eeprom_read_word(hal.as_ref(), base, 1);
        let w2 = eeprom_read_word(hal.as_ref(), base, 2);
        let [m0, m1] = w0.to_le_bytes();
        let [m2, m3] = w1.to_le_bytes();
        let [m4, m5] = w2.to_le_bytes();
        let mac = [m0, m1, m2, m3, m4, m5];
        log::info!(
            "e82540: MAC address {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
        );

        let ral = u32::from_le_bytes([mac[0], mac[1], mac[2], mac[3]]);
        let rah = u32::from_le_bytes([mac[4], mac[5], 0, 0]);
        hal.mmio_write32(base, offset::RAL, ral);
        hal.mmio_write32(base, offset::RAH, rah);

        let rx = Self::init_rx_ring(hal.as_ref(), base)?;
        let tx = Self::init_tx_ring(hal.as_ref(), base)?;

        hal.mmio_write32(base, offset::IMS, Intr::boot_mask().bits());
        log::info!("e82540: rings configured, interrupts enabled (IMS={:#x})", Intr::boot_mask().bits());

        Ok(Self {
            hal,
            base,
            mac,
            rx,
            tx,
        })
    }

    fn init_rx_ring(hal: &dyn Hal, base: u32) -> NetResult<RxRing> {
        let desc_page = hal.alloc_page().ok_or(NetError::AllocFailed)?;
        let mut buf_pages = [Page { vaddr: core::ptr::null_mut(), paddr: 0 }; RING_SIZE];
        // SAFETY: freshly allocated, RING_SIZE descriptors exactly fill it.
        let descriptors = unsafe {
            core::slice::from_raw_parts_mut(desc_page.vaddr as *mut RxDescriptor, RING_SIZE)
        };
        for (i, slot) in buf_pages.iter_mut().enumerate() {
            let page = hal.alloc_page().ok_or(NetError::AllocFailed)?;
            descriptors[i] = RxDescriptor {
                buf_addr: page.paddr,
                ..RxDescriptor::empty()
            };
            *slot = page;
        }

        hal.mmio_write32(base, offset::RDBAL, desc_page.paddr as u32);
        hal.mmio_write32(base, offset::RDBAH, (desc_page.paddr >> 32) as u32);
        hal.mmio_write32(base, offset::RDLEN, (RING_SIZE * 16) as u32);
        hal.mmio_write32(base, offset::RDH, 0);
        hal.mmio_write32(base, offset::RDT, (RING_SIZE - 1) as u32);
        hal.mmio_write32(base, offset::RCTL, Rctl::boot_config().bits());
        log::debug!(
            "e82540: RX ring programmed, {RING_SIZE} descriptors at phys {:#x}",
            desc_page.paddr
        );

        Ok(RxRing {
            desc_page,
            buf_pages,
            next: 0,
        })
    }

    fn init_tx_ring(hal: &dyn Hal, base: u32) -> NetResult<TxRing> {
        let desc_page = hal.alloc_page().ok_or(NetError::AllocFailed)?;
        let mut buf_pages = [Page { vaddr: core::ptr::null_mut(), paddr: 0 }; RING_SIZE];
        for slot in buf_pages.iter_mut() {
            *slot = hal.alloc_page().ok_or(NetError::AllocFailed)?;
        }

        hal.mmio_write32(base, offset::TDBAL, desc_page.paddr as u32);
        hal.mmio_write32(base, offset::TDBAH, (desc_page.paddr >> 32) as u32);
        hal.mmio_write32(base, offset::TDLEN, (RING_SIZE * 16) as u32);
        hal.mmio_write32(base, offset::TDH, 0);
        hal.mmio_write32(base, offset::TDT, 0);
        hal.mmio_write32(base, offset::TCTL, Tctl::boot_config());
        hal.mmio_write32(base, offset::TIPG, regs::TIPG_VALUE);
        log::debug!(
            "e82540: TX ring programmed, {RING_SIZE} descriptors at phys {:#x}",
            desc_page.paddr
        );

        Ok(TxRing {
            desc_page,
            buf_pages,
            next: 0,
            reclaim_from: 0,
            ctx_written: false,
        })
    }

    pub fn mac(&self) -> [u8; 6] {
        self.mac
    }

    /// Services a pending interrupt. Returns the set of causes handled,
    /// so callers (tests, mainly) can assert on what fired.
    pub fn on_interrupt(&mut self) -> Intr {
        let icr = Intr::from_bits_truncate(self.hal.mmio_read32(self.base, offset::ICR));
        log::trace!("e82540: ICR={icr:?}");
        if icr.contains(Intr::TXDW) {
            self.reclaim_tx();
        }
        icr
    }

    fn reclaim_tx(&mut self) {
        let start = self.tx.reclaim_from;
        // SAFETY: descriptors between reclaim_from and next were all
        // written by transmit() and are read-only here.
        while self.tx.reclaim_from != self.tx.next {
            let done = unsafe { self.tx.data_desc_mut(self.tx.reclaim_from).is_done() };
            if !done {
                break;
            }
            self.tx.reclaim_from = ring_next(self.tx.reclaim_from);
        }
        if self.tx.reclaim_from != start {
            log::debug!(
                "e82540: reclaimed TX scratch buffers [{start}..{})",
                self.tx.reclaim_from
            );
        }
    }

    /// Drains completed RX descriptors, invoking `on_frame(vaddr, len,
    /// eop)` for each, then advances `RDT` (spec.md §4.1 "RX drain").
    pub fn read_packets(&mut self, mut on_frame: impl FnMut(&[u8], bool)) {
        let rdh = self.hal.mmio_read32(self.base, offset::RDH) as usize;
        // SAFETY: descriptors at indices already written by the device
        // (status DD set) are read-only from software's side until RDT
        // is advanced past them below.
        let descriptors = unsafe { self.rx.descriptors() };
        if self.rx.next != rdh {
            log::trace!("e82540: draining RX ring, rx_next={} RDH={rdh}", self.rx.next);
        }
        while self.rx.next != rdh {
            let desc = descriptors[self.rx.next];
            let len = desc.len();
            let eop = desc.is_eop();
            let page = self.rx.buf_pages[self.rx.next];
            // SAFETY: page is a dedicated RX payload page, alive for the
            // ring's lifetime; len <= PAGE_SIZE by construction of the
            // ring (the device never reports more than the buffer size).
            let bytes = unsafe { page.as_slice(len.min(PAGE_SIZE)) };
            on_frame(bytes, eop);
            descriptors[self.rx.next].status = 0;
            self.rx.next = ring_next(self.rx.next);
        }
        let rdt = ring_prev(self.rx.next) as u32;
        self.hal.mmio_write32(self.base, offset::RDT, rdt);
    }

    /// Emits one Ethernet frame (spec.md §4.1 "TX"). `frame` must already
    /// contain the complete Ethernet/IPv4/UDP header and payload.
    pub fn transmit(&mut self, frame: &[u8], offload: Offload) -> NetResult<()> {
        if frame.len() > PAGE_SIZE {
            log::debug!("e82540: refusing to transmit {}-byte frame, exceeds page size", frame.len());
            return Err(NetError::PayloadTooLarge);
        }

        if !self.tx.ctx_written {
            log::debug!("e82540: emitting one-time TX context descriptor for UDP/IPv4 offload");
            let ctx_idx = self.tx.next;
            // SAFETY: this slot has never held a data descriptor.
            unsafe {
                *self.tx.ctx_desc_mut(ctx_idx) = TxContextDescriptor::udp_offload();
            }
            self.tx.next = ring_next(self.tx.next);
            self.tx.ctx_written = true;
            // The context slot never carries a TxDescriptor's DD bit at
            // the same byte offset, so reclaim tracking starts only at
            // the first real data descriptor; this slot is permanently
            // excluded from the scratch pool's rotation.
            self.tx.reclaim_from = self.tx.next;
            self.hal
                .mmio_write32(self.base, offset::TDT, self.tx.next as u32);
        }

        let idx = self.tx.next;
        if ring_next(idx) == self.tx.reclaim_from {
            // Ring exhausted: every slot between reclaim_from and here is
            // still in flight. A production driver would block for TXDW;
            // this core trusts RING_SIZE transmits never queue up faster
            // than the device retires them within one boot.
            log::warn!("tx ring full at slot {idx}, reusing before reclaim");
        }
        let page = self.tx.buf_pages[idx];
        // SAFETY: page is this slot's dedicated scratch buffer, not
        // touched by hardware until TDT is bumped below.
        let dst = unsafe { page.as_slice_mut(PAGE_SIZE) };
        dst[..frame.len()].copy_from_slice(frame);

        // DEXT is always set: every data descriptor this driver emits is
        // the extended layout (see TxDescriptor's docs), not just the
        // ones requesting checksum offload.
        let dcmd = TX_CMD_EOP | TX_CMD_IFCS | TX_CMD_RS | TX_CMD_DEXT;
        let popts = match offload {
            Offload::UdpChecksum => 1,
            Offload::None => 0,
        };
        // SAFETY: this slot currently holds (or is being overwritten to
        // hold) a data descriptor.
        unsafe {
            *self.tx.data_desc_mut(idx) =
                TxDescriptor::extended(page.paddr, frame.len() as u16, dcmd, popts);
        }

        self.tx.next = ring_next(self.tx.next);
        self.hal
            .mmio_write32(self.base, offset::TDT, self.tx.next as u32);
        log::trace!("e82540: queued {}-byte frame at TX slot {idx}", frame.len());
        Ok(())
    }

    pub fn tx_ctx_written(&self) -> bool {
        self.tx.ctx_written
    }

    /// Writes `frame` into the next RX descriptor's backing page, marks
    /// it done, and raises RXT0 — as if the device had just received it
    /// and interrupted. Available unconditionally, not cfg(test), so
    /// integration tests outside this crate can drive ingress without
    /// real hardware (mirrors [`crate::hal::fake::FakeHal`] being a
    /// plain public module for the same reason).
    pub fn simulate_rx(&mut self, frame: &[u8]) {
        assert!(frame.len() <= PAGE_SIZE);
        let idx = self.rx.next;
        let page = self.rx.buf_pages[idx];
        // SAFETY: this slot's payload page is not currently lent out;
        // software owns it until the descriptor below marks it done.
        unsafe {
            page.as_slice_mut(frame.len()).copy_from_slice(frame);
        }
        // SAFETY: idx < RING_SIZE, exclusive access under the caller's lock.
        unsafe {
            self.rx.descriptors()[idx] = RxDescriptor {
                buf_addr: page.paddr,
                length: frame.len() as u16,
                checksum: 0,
                status: ring::RX_STATUS_DD | ring::RX_STATUS_EOP,
                errors: 0,
                vlan: 0,
            };
        }
        let new_rdh = ring_next(idx) as u32;
        self.hal.mmio_write32(self.base, offset::RDH, new_rdh);
        self.hal
            .mmio_write32(self.base, offset::ICR, Intr::RXT0.bits());
    }

    pub fn rx_next(&self) -> usize {
        self.rx.next
    }

    /// Monotonic milliseconds from the underlying [`Hal`], used only to
    /// timestamp ARP cache entries.
    pub fn hal_now_ms(&self) -> u64 {
        self.hal.now_ms()
    }
}

// SAFETY: every field is either Send itself or, for raw pointers inside
// Page, owned exclusively by this Nic and accessed only under the
// stack's single lock.
unsafe impl Send for Nic {}
