//! Loopback backend - both processors in one host process
//!
//! Not real hardware. Each side's doorbell feeds a channel that a
//! dedicated "IRQ line" thread drains, invoking the registered handler the
//! way the interrupt controller would. Shared memory is ordinary heap memory
//! looked up by a fake physical address.
//!
//! Used for unit tests, integration tests and the `avp-loopback` tool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::{
    Doorbell, ImageLoader, InterruptHandler, PhysAddr, PhysicalMemory, Platform, Result,
    SharedRegion, XpcError,
};

/// First fake physical address handed out
const PHYS_BASE: PhysAddr = 0x8000_0000;

/// Fake physical allocations are aligned to this
const PHYS_ALIGN: usize = 0x100;

/// Build a connected CPU/AVP platform pair
///
/// Both sides share one [`LoopbackMemory`] so an address allocated by the CPU
/// can be mapped by the AVP.
pub fn pair() -> (LoopbackSide, LoopbackSide) {
    let (to_avp, avp_line) = unbounded();
    let (to_cpu, cpu_line) = unbounded();
    let memory = Arc::new(LoopbackMemory::new());

    let cpu = LoopbackSide {
        doorbell: Arc::new(LoopbackDoorbell::new("cpu", to_avp, cpu_line)),
        memory: Arc::clone(&memory),
    };
    let avp = LoopbackSide {
        doorbell: Arc::new(LoopbackDoorbell::new("avp", to_cpu, avp_line)),
        memory,
    };
    (cpu, avp)
}

/// One processor's view of the loopback link
#[derive(Clone)]
pub struct LoopbackSide {
    pub doorbell: Arc<LoopbackDoorbell>,
    pub memory: Arc<LoopbackMemory>,
}

impl LoopbackSide {
    /// Type-erased platform for handing to the transport
    pub fn platform(&self) -> Platform {
        Platform::new(self.doorbell.clone(), self.memory.clone())
    }
}

/// Doorbell backed by a channel and an interrupt thread
pub struct LoopbackDoorbell {
    line: &'static str,
    outgoing: Sender<u32>,
    incoming: Mutex<Option<Receiver<u32>>>,
    delivered: Arc<AtomicU32>,
    handler: Arc<Mutex<Option<InterruptHandler>>>,
    rings_sent: AtomicUsize,
}

impl LoopbackDoorbell {
    fn new(line: &'static str, outgoing: Sender<u32>, incoming: Receiver<u32>) -> Self {
        Self {
            line,
            outgoing,
            incoming: Mutex::new(Some(incoming)),
            delivered: Arc::new(AtomicU32::new(0)),
            handler: Arc::new(Mutex::new(None)),
            rings_sent: AtomicUsize::new(0),
        }
    }

    /// Number of times this side rang the far side
    pub fn rings_sent(&self) -> usize {
        self.rings_sent.load(Ordering::Relaxed)
    }

    fn spawn_line(&self, incoming: Receiver<u32>) {
        let delivered = Arc::clone(&self.delivered);
        let handler = Arc::clone(&self.handler);
        let line = self.line;

        let spawned = thread::Builder::new()
            .name(format!("xpc-irq-{}", line))
            .spawn(move || {
                // Exits once the far side's doorbell is dropped
                while let Ok(value) = incoming.recv() {
                    delivered.store(value, Ordering::Release);
                    let current = handler
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone();
                    match current {
                        Some(isr) => isr(),
                        None => log::trace!("xpc[{}]: ring {:#x} with no handler", line, value),
                    }
                }
                log::trace!("xpc[{}]: interrupt line closed", line);
            });

        if let Err(e) = spawned {
            log::error!("xpc[{}]: failed to start interrupt line: {}", line, e);
        }
    }
}

impl Doorbell for LoopbackDoorbell {
    fn signal(&self, value: u32) {
        self.rings_sent.fetch_add(1, Ordering::Relaxed);
        if self.outgoing.send(value).is_err() {
            log::warn!("xpc[{}]: far side is gone, ring {:#x} dropped", self.line, value);
        }
    }

    fn last_delivered_value(&self) -> u32 {
        self.delivered.load(Ordering::Acquire)
    }

    fn register_interrupt(&self, isr: InterruptHandler) -> Result<()> {
        {
            let mut handler = self.handler.lock().unwrap_or_else(PoisonError::into_inner);
            if handler.is_some() {
                return Err(XpcError::HandlerRegistered { line: self.line });
            }
            *handler = Some(isr);
        }

        // Rings sent before the first registration stay queued in the channel
        let incoming = self
            .incoming
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(incoming) = incoming {
            self.spawn_line(incoming);
        }
        Ok(())
    }

    fn unregister_interrupt(&self) {
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Heap memory addressed by fake physical addresses
pub struct LoopbackMemory {
    regions: Mutex<HashMap<PhysAddr, Arc<SharedRegion>>>,
    next: AtomicU32,
    limit: usize,
}

impl LoopbackMemory {
    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Memory that refuses single allocations larger than `limit` bytes
    pub fn with_limit(limit: usize) -> Self {
        Self {
            regions: Mutex::new(HashMap::new()),
            next: AtomicU32::new(PHYS_BASE),
            limit,
        }
    }

    /// Number of live allocations
    pub fn allocations(&self) -> usize {
        self.regions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for LoopbackMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicalMemory for LoopbackMemory {
    fn allocate(&self, size: usize) -> Result<(PhysAddr, Arc<SharedRegion>)> {
        if size > self.limit {
            return Err(XpcError::OutOfMemory { requested: size });
        }

        let span = (size + PHYS_ALIGN - 1) & !(PHYS_ALIGN - 1);
        let span = u32::try_from(span).map_err(|_| XpcError::OutOfMemory { requested: size })?;
        let phys = self.next.fetch_add(span, Ordering::Relaxed);

        let region = Arc::new(SharedRegion::new(size));
        self.regions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(phys, Arc::clone(&region));
        log::debug!("loopback: allocated {} bytes at {:#010x}", size, phys);
        Ok((phys, region))
    }

    fn map(&self, phys: PhysAddr) -> Result<Arc<SharedRegion>> {
        self.regions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&phys)
            .cloned()
            .ok_or(XpcError::NotMapped { phys })
    }

    fn free(&self, phys: PhysAddr) {
        self.regions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&phys);
    }
}

/// Image loader that records requests instead of touching AVP memory
pub struct LoopbackLoader {
    entry_point: u32,
    loaded: Mutex<Vec<String>>,
}

impl LoopbackLoader {
    pub fn new(entry_point: u32) -> Self {
        Self {
            entry_point,
            loaded: Mutex::new(Vec::new()),
        }
    }

    /// Images loaded so far, in order
    pub fn loaded(&self) -> Vec<String> {
        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ImageLoader for LoopbackLoader {
    fn load_and_relocate(&self, image_name: &str) -> Result<u32> {
        if image_name.is_empty() {
            return Err(XpcError::LoadFailed {
                image: String::new(),
                reason: "empty image name".into(),
            });
        }
        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(image_name.to_string());
        Ok(self.entry_point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};

    fn wait_until(cond: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(2) {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_ring_reaches_far_side_handler() {
        let (cpu, avp) = pair();
        let fired = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&fired);
        avp.doorbell
            .register_interrupt(Arc::new(move || flag.store(true, Ordering::SeqCst)))
            .expect("register");

        cpu.doorbell.signal(0x1234);
        assert!(wait_until(|| fired.load(Ordering::SeqCst)));
        assert_eq!(avp.doorbell.last_delivered_value(), 0x1234);
        assert_eq!(cpu.doorbell.rings_sent(), 1);
    }

    #[test]
    fn test_rings_before_registration_are_queued() {
        let (cpu, avp) = pair();
        cpu.doorbell.signal(7);

        let seen = Arc::new(AtomicU32::new(0));
        let value = Arc::clone(&seen);
        let bell = Arc::clone(&avp.doorbell);
        avp.doorbell
            .register_interrupt(Arc::new(move || {
                value.store(bell.last_delivered_value(), Ordering::SeqCst)
            }))
            .expect("register");

        assert!(wait_until(|| seen.load(Ordering::SeqCst) == 7));
    }

    #[test]
    fn test_double_registration_rejected() {
        let (_cpu, avp) = pair();
        avp.doorbell.register_interrupt(Arc::new(|| {})).expect("first");
        assert!(matches!(
            avp.doorbell.register_interrupt(Arc::new(|| {})),
            Err(XpcError::HandlerRegistered { line: "avp" })
        ));
    }

    #[test]
    fn test_memory_shared_between_sides() {
        let (cpu, avp) = pair();
        let (phys, region) = cpu.memory.allocate(544).expect("allocate");
        region.write_word(0, 0xdead_f00d);

        let mapped = avp.memory.map(phys).expect("map");
        assert_eq!(mapped.read_word(0), 0xdead_f00d);

        cpu.memory.free(phys);
        assert!(avp.memory.map(phys).is_err());
    }

    #[test]
    fn test_memory_limit() {
        let memory = LoopbackMemory::with_limit(128);
        assert!(matches!(
            memory.allocate(256),
            Err(XpcError::OutOfMemory { requested: 256 })
        ));
        assert_eq!(memory.allocations(), 0);
    }

    #[test]
    fn test_loader_records_images() {
        let loader = LoopbackLoader::new(0x1000_0000);
        assert_eq!(loader.load_and_relocate("nvrm_avp.bin").expect("load"), 0x1000_0000);
        assert_eq!(loader.loaded(), vec!["nvrm_avp.bin".to_string()]);
        assert!(loader.load_and_relocate("").is_err());
    }
}
