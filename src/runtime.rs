//! Process-wide driver library lifetime.

use std::any::Any;
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};

use tracing::{debug, warn};

use crate::status::describe_last_error;
use crate::traits::{CameraError, CaptureDriver, Operation, Result};

/// The live runtime, if any, type-erased so any driver type fits. A dead
/// reference in the slot means that runtime's teardown has not finished.
static ACTIVE: Mutex<Option<Weak<dyn Any + Send + Sync>>> = Mutex::new(None);

/// Signalled when a teardown empties [`ACTIVE`].
static TEARDOWN: Condvar = Condvar::new();

/// Initialized driver library.
///
/// At most one runtime exists per process. It is created by the first
/// call to [`DeviceRuntime::instance`], shared through `Arc`, and the
/// driver library is shut down when the last reference is dropped.
/// Sessions hold a reference, so the library outlives every session.
/// A new runtime is only initialized once the previous shutdown returned.
pub struct DeviceRuntime<D: CaptureDriver> {
    driver: D,
}

impl<D: CaptureDriver> DeviceRuntime<D> {
    /// The process-wide runtime, initializing a default driver on first use.
    ///
    /// # Errors
    ///
    /// See [`instance_with`](Self::instance_with).
    pub fn instance() -> Result<Arc<Self>>
    where
        D: Default,
    {
        Self::instance_with(D::default)
    }

    /// The process-wide runtime, initializing the driver built by `make`
    /// if none is alive. `make` is not called when a runtime exists.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeConflict` if a runtime over another driver type is
    /// alive, or `Driver` if library initialization fails.
    pub fn instance_with<F>(make: F) -> Result<Arc<Self>>
    where
        F: FnOnce() -> D,
    {
        let mut active = ACTIVE.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match active.as_ref().map(Weak::upgrade) {
                None => break,
                Some(Some(existing)) => {
                    return match existing.downcast::<Self>() {
                        Ok(runtime) => Ok(runtime),
                        Err(other) => {
                            // Releasing the last reference runs teardown, which locks the slot.
                            drop(active);
                            drop(other);
                            Err(CameraError::RuntimeConflict)
                        }
                    };
                }
                Some(None) => {
                    active = TEARDOWN
                        .wait(active)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }

        let driver = make();
        driver.init_lib().map_err(|status| CameraError::Driver {
            operation: Operation::InitLib,
            status,
            detail: describe_last_error(&driver),
        })?;
        debug!("driver library initialized");

        let runtime = Arc::new(Self { driver });
        let erased: Arc<dyn Any + Send + Sync> = Arc::clone(&runtime);
        *active = Some(Arc::downgrade(&erased));
        Ok(runtime)
    }

    /// The initialized driver.
    pub const fn driver(&self) -> &D {
        &self.driver
    }
}

impl<D: CaptureDriver> Drop for DeviceRuntime<D> {
    fn drop(&mut self) {
        let mut active = ACTIVE.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(status) = self.driver.close_lib() {
            warn!(%status, "driver library shutdown failed");
        } else {
            debug!("driver library shut down");
        }
        *active = None;
        drop(active);
        TEARDOWN.notify_all();
    }
}
