//! Boot sequence, from the bootloader handing over to a kernel ready to run threads.

use arrayvec::ArrayVec;
use limine::{
    request::{HhdmRequest, MemoryMapRequest, RequestsEndMarker, RequestsStartMarker},
    BaseRevision,
};

use crate::{
    constants::memory::MAX_MEMORY_REGIONS,
    info, interrupts, logging,
    memory::{self, DirectMap, MemoryRegion},
    threads, warn,
};

#[used]
#[link_section = ".requests"]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[link_section = ".requests"]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[link_section = ".requests"]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[link_section = ".requests_start_marker"]
static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

#[used]
#[link_section = ".requests_end_marker"]
static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

/// Brings the kernel up in dependency order: logging, descriptor tables and the tick source,
/// frames, the kernel address space and heap, then the scheduler.
///
/// Interrupts are still disabled on return; enabling them starts preemption.
pub fn init() {
    assert!(BASE_REVISION.is_supported());

    logging::init();
    info!("Booting vostok...");

    interrupts::init();

    let direct_map = DirectMap::new(
        HHDM_REQUEST
            .get_response()
            .expect("HHDM request failed")
            .offset(),
    );
    let regions = boot_memory_regions();
    unsafe { memory::init(&regions, direct_map) }.expect("memory initialization failed");

    threads::init();
    info!("Boot complete");
}

fn boot_memory_regions() -> ArrayVec<MemoryRegion, MAX_MEMORY_REGIONS> {
    let entries = MEMORY_MAP_REQUEST
        .get_response()
        .expect("Memory map request failed")
        .entries();

    if entries.len() > MAX_MEMORY_REGIONS {
        warn!(
            "memory map has {} entries, only the first {} are used",
            entries.len(),
            MAX_MEMORY_REGIONS
        );
    }

    entries
        .iter()
        .take(MAX_MEMORY_REGIONS)
        .map(|entry| MemoryRegion::from(&**entry))
        .collect()
}
