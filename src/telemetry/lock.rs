//! Process-shared mutex stored inside the mapped table
//!
//! No timed or robust variant: a process that dies while
//! holding the lock blocks every other attachment.

use std::mem::MaybeUninit;

use super::error::TelemetryError;

pub(crate) struct ProcessMutex {
    raw: *mut libc::pthread_mutex_t,
}

impl ProcessMutex {
    /// # Safety
    ///
    /// `raw` must point into a mapping that outlives the returned value.
    pub(crate) unsafe fn from_raw(raw: *mut libc::pthread_mutex_t) -> Self {
        Self { raw }
    }

    /// Construct the mutex with `PTHREAD_PROCESS_SHARED`; first attach only
    pub(crate) fn init(&self) -> Result<(), TelemetryError> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        unsafe {
            check("pthread_mutexattr_init", libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
            let mut rc = libc::pthread_mutexattr_setpshared(
                attr.as_mut_ptr(),
                libc::PTHREAD_PROCESS_SHARED,
            );
            if rc == 0 {
                rc = libc::pthread_mutex_init(self.raw, attr.as_ptr());
            }
            libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
            check("pthread_mutex_init", rc)
        }
    }

    pub(crate) fn lock(&self) -> Result<(), TelemetryError> {
        check("pthread_mutex_lock", unsafe { libc::pthread_mutex_lock(self.raw) })
    }

    pub(crate) fn unlock(&self) {
        unsafe {
            libc::pthread_mutex_unlock(self.raw);
        }
    }

    pub(crate) fn destroy(&self) {
        unsafe {
            libc::pthread_mutex_destroy(self.raw);
        }
    }
}

#[inline]
fn check(op: &'static str, code: i32) -> Result<(), TelemetryError> {
    if code == 0 {
        Ok(())
    } else {
        Err(TelemetryError::Lock { op, code })
    }
}
