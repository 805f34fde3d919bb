#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod kernel {
    extern crate alloc;

    use alloc::{boxed::Box, vec::Vec};
    use core::sync::atomic::{AtomicU64, Ordering};

    use vostok::{
        halt, idle_loop, info, init, interrupts,
        memory::{
            self,
            heap::{KernelHeap, KERNEL_HEAP},
        },
        prelude::*,
        serial, threads,
    };
    use x86_64::{PhysAddr, VirtAddr};

    #[global_allocator]
    static ALLOCATOR: KernelHeap = KernelHeap;

    static PING_COUNT: AtomicU64 = AtomicU64::new(0);
    static PONG_COUNT: AtomicU64 = AtomicU64::new(0);

    const REPORT_EVERY: u64 = 50_000_000;

    const LOCAL_APIC_BASE: u64 = 0xFEE0_0000;
    const LOCAL_APIC_VERSION: usize = 0x30;

    #[no_mangle]
    extern "C" fn kmain() -> ! {
        init::init();

        let boxed = Box::new(0xC0FFEE_u64);
        let squares: Vec<u64> = (0..256).map(|i| i * i).collect();
        info!(
            "Heap object allocated at: {:p}, vector of {} at {:p}",
            Box::as_ref(&boxed) as *const u64,
            squares.len(),
            squares.as_ptr()
        );
        KERNEL_HEAP.log_stats();

        let probe = VirtAddr::from_ptr(Box::as_ref(&boxed) as *const u64);
        memory::with_kernel_address_space(|frames, space| {
            info!(
                "{:?} -> {:?}, {} KiB of frames free",
                probe,
                space.translate(probe),
                frames.free_bytes() / 1024
            );
        });

        let lapic = memory::map_device_memory(PhysAddr::new(LOCAL_APIC_BASE), 1);
        let version = unsafe {
            lapic
                .as_ptr::<u8>()
                .add(LOCAL_APIC_VERSION)
                .cast::<u32>()
                .read_volatile()
        };
        info!("local APIC at {:?}, version register {:#x}", lapic, version);

        let ping_id = threads::spawn(ping);
        let pong_id = threads::spawn(pong);
        info!("spawned threads {} and {}", ping_id, pong_id);

        interrupts::enable();
        idle_loop();
    }

    extern "C" fn ping() {
        spin_and_report("ping", &PING_COUNT);
    }

    extern "C" fn pong() {
        spin_and_report("pong", &PONG_COUNT);
    }

    fn spin_and_report(name: &str, counter: &AtomicU64) -> ! {
        loop {
            let count = counter.fetch_add(1, Ordering::Relaxed);
            if count % REPORT_EVERY == 0 {
                info!(
                    "{} on thread {:?}: {} iterations",
                    name,
                    threads::current_id(),
                    count
                );
            }
            core::hint::spin_loop();
        }
    }

    #[panic_handler]
    fn rust_panic(info: &core::panic::PanicInfo) -> ! {
        interrupts::disable();
        unsafe { serial::force_unlock() };
        serial_println!();
        serial_println!("================ KERNEL PANIC ================");
        serial_println!("{}", info);
        serial_println!("==============================================");
        halt();
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("vostok is a kernel image; build it for x86_64-unknown-none and boot it with Limine");
}
