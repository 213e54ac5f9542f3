use std::sync::{Arc, Condvar, Mutex};

/// Single-shot result channel backing asynchronous proclet calls: safe to
/// block on before the producer completes, safe to complete before any
/// reader looks.
struct Shared<T> {
    slot: Mutex<Option<T>>,
    cv: Condvar,
}

pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

pub fn promise<T>() -> (Promise<T>, Future<T>) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(None),
        cv: Condvar::new(),
    });
    (
        Promise {
            shared: Arc::clone(&shared),
        },
        Future { shared },
    )
}

impl<T> Promise<T> {
    /// Delivers the value and wakes the waiting reader, if any. Consumes
    /// the promise: delivery happens exactly once.
    pub fn set(self, value: T) {
        let mut slot = self.shared.slot.lock().unwrap();
        debug_assert!(slot.is_none());
        *slot = Some(value);
        self.shared.cv.notify_all();
    }
}

impl<T> Future<T> {
    /// Blocks until the promise is fulfilled.
    pub fn get(self) -> T {
        let mut slot = self.shared.slot.lock().unwrap();
        loop {
            if let Some(value) = slot.take() {
                return value;
            }
            slot = self.shared.cv.wait(slot).unwrap();
        }
    }

    pub fn is_ready(&self) -> bool {
        self.shared.slot.lock().unwrap().is_some()
    }

    pub fn try_get(self) -> Result<T, Future<T>> {
        let mut slot = self.shared.slot.lock().unwrap();
        match slot.take() {
            Some(value) => Ok(value),
            None => {
                drop(slot);
                Err(self)
            }
        }
    }
}
