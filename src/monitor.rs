use crate::runtime::{runtime_heap, Runtime};
use crate::sync::SpinLock;
use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

const REPORT_INTERVAL_MS: u64 = 1000;

/// Low-frequency status reporter: proclet population, runtime-heap usage,
/// and stack high-water mark, logged once a second.
pub struct Monitor {
    done: Arc<AtomicBool>,
    th: SpinLock<Option<std::thread::JoinHandle<()>>>,
}

impl Monitor {
    pub fn start(rt: &Arc<Runtime>) -> Monitor {
        let done = Arc::new(AtomicBool::new(false));
        let weak: Weak<Runtime> = Arc::downgrade(rt);
        let done2 = Arc::clone(&done);
        let th = std::thread::Builder::new()
            .name("drift-monitor".into())
            .spawn(move || {
                let mut slept_ms = 0u64;
                while !done2.load(Ordering::Acquire) {
                    // Sleep in short slices so shutdown is prompt.
                    std::thread::sleep(Duration::from_millis(50));
                    slept_ms += 50;
                    if slept_ms < REPORT_INTERVAL_MS {
                        continue;
                    }
                    slept_ms = 0;
                    let rt = match weak.upgrade() {
                        Some(rt) => rt,
                        None => return,
                    };
                    if rt.is_done() {
                        return;
                    }
                    let stacks_touched = match rt.mode() {
                        crate::runtime::RuntimeMode::Server => rt.stacks().num_touched(),
                        crate::runtime::RuntimeMode::Client => 0,
                    };
                    info!(
                        "monitor: {} proclets, runtime heap {} KiB used, {} stacks touched",
                        rt.proclets().num_present(),
                        runtime_heap().usage() >> 10,
                        stacks_touched
                    );
                }
            })
            .expect("spawn monitor");
        Monitor {
            done,
            th: SpinLock::new(Some(th)),
        }
    }

    pub fn shutdown(&self) {
        self.done.store(true, Ordering::Release);
        let th = self.th.lock().take();
        if let Some(th) = th {
            let _ = th.join();
        }
    }
}
