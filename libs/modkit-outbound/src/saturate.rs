//! Typed decode targets and the status-code keyed lookup that picks one.

use http::StatusCode;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Something a response body can be decoded into.
pub trait DecodeTarget: Send + Sync {
    /// Deserialize `body` as JSON and store the value.
    ///
    /// # Errors
    /// Returns the `serde_json` error if `body` does not match the target shape.
    fn saturate(&self, body: &[u8]) -> Result<(), serde_json::Error>;
}

/// Shared handle to a decoded value.
///
/// The request keeps one clone and populates it; the caller keeps another and
/// reads the value once the exchange completes.
pub struct Saturation<T> {
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> Saturation<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Remove and return the decoded value.
    #[must_use]
    pub fn take(&self) -> Option<T> {
        self.slot.lock().take()
    }

    #[must_use]
    pub fn is_saturated(&self) -> bool {
        self.slot.lock().is_some()
    }
}

impl<T: Clone> Saturation<T> {
    /// Copy of the decoded value, leaving it in place.
    #[must_use]
    pub fn get(&self) -> Option<T> {
        self.slot.lock().clone()
    }
}

impl<T> Default for Saturation<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Saturation<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> fmt::Debug for Saturation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Saturation")
            .field("saturated", &self.is_saturated())
            .finish()
    }
}

impl<T> DecodeTarget for Saturation<T>
where
    T: DeserializeOwned + Send,
{
    fn saturate(&self, body: &[u8]) -> Result<(), serde_json::Error> {
        let value = serde_json::from_slice::<T>(body)?;
        *self.slot.lock() = Some(value);
        Ok(())
    }
}

/// Which tier of [`DecodeTargets`] handled a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetSlot {
    /// Target registered for this exact status code
    Status(StatusCode),
    /// Generic target for statuses outside `[200, 300)`
    Error,
    /// Generic target for statuses in `[200, 300)`
    Success,
}

/// Decode targets keyed by status code, with generic success and error fallbacks.
#[derive(Clone, Default)]
pub struct DecodeTargets {
    success: Option<Arc<dyn DecodeTarget>>,
    error: Option<Arc<dyn DecodeTarget>>,
    by_status: HashMap<StatusCode, Arc<dyn DecodeTarget>>,
}

impl DecodeTargets {
    pub fn set_success(&mut self, target: Arc<dyn DecodeTarget>) {
        self.success = Some(target);
    }

    pub fn set_error(&mut self, target: Arc<dyn DecodeTarget>) {
        self.error = Some(target);
    }

    pub fn set_status(&mut self, status: StatusCode, target: Arc<dyn DecodeTarget>) {
        self.by_status.insert(status, target);
    }

    /// Exact status first, then the error target for non-2xx, then the success target.
    #[must_use]
    pub fn resolve(&self, status: StatusCode) -> Option<(TargetSlot, &dyn DecodeTarget)> {
        if let Some(target) = self.by_status.get(&status) {
            return Some((TargetSlot::Status(status), target.as_ref()));
        }
        if status.is_success() {
            self.success
                .as_deref()
                .map(|target| (TargetSlot::Success, target))
        } else {
            self.error.as_deref().map(|target| (TargetSlot::Error, target))
        }
    }
}

impl fmt::Debug for DecodeTargets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut statuses: Vec<u16> = self.by_status.keys().map(StatusCode::as_u16).collect();
        statuses.sort_unstable();
        f.debug_struct("DecodeTargets")
            .field("success", &self.success.is_some())
            .field("error", &self.error.is_some())
            .field("by_status", &statuses)
            .finish()
    }
}
