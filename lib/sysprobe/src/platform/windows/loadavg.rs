//! Background sampling of the processor queue length.
//!
//! PDH collects the `\System\Processor Queue Length` counter every [`SAMPLING_INTERVAL`] and signals an event; a
//! thread pool wait on that event folds each sample into the shared [`LoadAverageTracker`].

use std::{ffi::c_void, ptr, sync::Arc};

use tracing::debug;
use windows_sys::Win32::{
    Foundation::{BOOLEAN, HANDLE, INVALID_HANDLE_VALUE},
    System::{
        Performance::{
            PdhAddEnglishCounterW, PdhCloseQuery, PdhCollectQueryData, PdhCollectQueryDataEx,
            PdhGetFormattedCounterValue, PdhOpenQueryW, PDH_FMT_COUNTERVALUE, PDH_FMT_DOUBLE,
        },
        Threading::{CreateEventW, RegisterWaitForSingleObject, UnregisterWaitEx, INFINITE, WT_EXECUTEDEFAULT},
    },
};

use super::{to_wide, HandleGuard};
use crate::{
    error::{Error, Result},
    loadavg::{LoadAverageTracker, SAMPLING_INTERVAL},
};

const QUEUE_LENGTH_COUNTER: &str = r"\System\Processor Queue Length";

/// PDH query and counter handles.
type PdhHandle = isize;

/// State the wait callback reads. Freed only after the wait is unregistered.
struct SamplerState {
    counter: PdhHandle,
    tracker: Arc<LoadAverageTracker>,
}

/// A running sampler. Dropping it stops sampling.
pub(super) struct Sampler {
    query: PdhHandle,
    event: Option<HandleGuard>,
    wait: Option<HANDLE>,
    state: *mut SamplerState,
}

// SAFETY: The raw handles aren't tied to the creating thread, and `state` is only shared with the wait callback,
// which only reads it.
unsafe impl Send for Sampler {}

fn pdh_result(syscall: &str, status: u32) -> Result<()> {
    if status == 0 {
        return Ok(());
    }
    Err(Error::Os {
        syscall: syscall.to_string(),
        source: std::io::Error::from_raw_os_error(status as i32),
    })
}

/// The counter's latest value, if PDH has one.
fn queue_length(counter: PdhHandle) -> Option<f64> {
    // SAFETY: Plain old data.
    let mut value: PDH_FMT_COUNTERVALUE = unsafe { std::mem::zeroed() };
    // SAFETY: `value` is valid for writes, and the type out pointer is optional.
    let status = unsafe { PdhGetFormattedCounterValue(counter, PDH_FMT_DOUBLE, ptr::null_mut(), &mut value) };
    if status != 0 || value.CStatus != 0 {
        return None;
    }
    // SAFETY: `PDH_FMT_DOUBLE` selects the double member.
    Some(unsafe { value.Anonymous.doubleValue })
}

unsafe extern "system" fn on_sample(context: *mut c_void, _timed_out: BOOLEAN) {
    // SAFETY: `context` is the `SamplerState` registered with the wait, alive until the wait is unregistered.
    let state = &*(context as *const SamplerState);
    if let Some(sample) = queue_length(state.counter) {
        state.tracker.record(sample);
    }
}

impl Sampler {
    /// Starts sampling into `tracker`.
    ///
    /// When `sample_now` is set, one sample is taken synchronously first, so the tracker isn't all zeroes right away.
    pub(super) fn start(tracker: Arc<LoadAverageTracker>, sample_now: bool) -> Result<Self> {
        let mut query: PdhHandle = 0;
        // SAFETY: `query` is valid for writes.
        pdh_result("PdhOpenQueryW", unsafe { PdhOpenQueryW(ptr::null(), 0, &mut query) })?;

        // From here on, `Drop` cleans up whatever has been set up so far.
        let mut sampler = Sampler {
            query,
            event: None,
            wait: None,
            state: Box::into_raw(Box::new(SamplerState {
                counter: 0,
                tracker,
            })),
        };

        let path = to_wide(QUEUE_LENGTH_COUNTER);
        // SAFETY: `path` is NUL-terminated; `state` is ours until the wait is registered.
        pdh_result("PdhAddEnglishCounterW", unsafe {
            PdhAddEnglishCounterW(sampler.query, path.as_ptr(), 0, &mut (*sampler.state).counter)
        })?;

        if sample_now {
            // SAFETY: `query` is open.
            pdh_result("PdhCollectQueryData", unsafe { PdhCollectQueryData(sampler.query) })?;
            // SAFETY: Nothing else sees `state` yet.
            let state = unsafe { &*sampler.state };
            if let Some(sample) = queue_length(state.counter) {
                state.tracker.record(sample);
            }
        }

        // SAFETY: No pointer arguments besides the optional ones, passed as null.
        let event = unsafe { CreateEventW(ptr::null(), 0, 0, ptr::null()) };
        let event = HandleGuard::new(event).ok_or_else(|| Error::last_os_error("CreateEventW"))?;
        let event_handle = event.raw();
        sampler.event = Some(event);

        let interval = SAMPLING_INTERVAL.as_secs() as u32;
        // SAFETY: `query` and the event are open.
        pdh_result("PdhCollectQueryDataEx", unsafe {
            PdhCollectQueryDataEx(sampler.query, interval, event_handle)
        })?;

        let mut wait: HANDLE = ptr::null_mut();
        // SAFETY: `on_sample` matches `WAITORTIMERCALLBACK`, and `state` stays alive until the wait is unregistered.
        let ok = unsafe {
            RegisterWaitForSingleObject(
                &mut wait,
                event_handle,
                Some(on_sample),
                sampler.state as *const c_void,
                INFINITE,
                WT_EXECUTEDEFAULT,
            )
        };
        if ok == 0 {
            return Err(Error::last_os_error("RegisterWaitForSingleObject"));
        }
        sampler.wait = Some(wait);

        debug!(counter = QUEUE_LENGTH_COUNTER, interval_secs = interval, "Started load average sampler.");
        Ok(sampler)
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        // SAFETY: Each handle is released once, and the wait is gone (callbacks included) before `state` is freed.
        unsafe {
            if let Some(wait) = self.wait.take() {
                UnregisterWaitEx(wait, INVALID_HANDLE_VALUE);
            }
            PdhCloseQuery(self.query);
            self.event.take();
            drop(Box::from_raw(self.state));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_and_stops() {
        let tracker = Arc::new(LoadAverageTracker::new());
        let sampler = Sampler::start(Arc::clone(&tracker), true).unwrap();
        let avg = tracker.snapshot();
        assert!(avg.one >= 0.0 && avg.one >= avg.fifteen);
        drop(sampler);
        assert_eq!(Arc::strong_count(&tracker), 1);
    }
}
