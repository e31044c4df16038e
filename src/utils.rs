use std::any::Any;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Lock a mutex, recovering the guard if a panicking holder poisoned it.
///
/// Targets may panic inside `on_frame`; the broadcast loop isolates that
/// panic, so the data behind the lock is still the target's own state.
pub fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Period between frames at `frame_rate`, `None` unless the rate is finite
/// and positive
pub fn frame_period(frame_rate: f64) -> Option<Duration> {
    if frame_rate.is_finite() && frame_rate > 0.0 {
        Duration::try_from_secs_f64(1.0 / frame_rate).ok()
    } else {
        None
    }
}

pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
