//! GPS fix source consumed by the GPS poll event.

use std::sync::{Arc, RwLock};

use crate::record::GpsFix;

/// Provides the latest GPS fix on demand
#[cfg_attr(test, mockall::automock)]
pub trait GpsSource: Send + Sync {
    /// Latest fix, or `None` when the receiver has none
    fn latest_fix(&self) -> Option<GpsFix>;
}

/// Fix shared between a GPS client that writes it and the station that
/// reads it
#[derive(Debug, Clone, Default)]
pub struct SharedGpsState {
    fix: Arc<RwLock<Option<GpsFix>>>,
}

impl SharedGpsState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new fix; fixes with mode below 2 count as no fix
    pub fn update(&self, fix: GpsFix) {
        let fix = (fix.mode >= 2).then_some(fix);
        if let Ok(mut current) = self.fix.write() {
            *current = fix;
        }
    }

    pub fn clear(&self) {
        if let Ok(mut current) = self.fix.write() {
            *current = None;
        }
    }
}

impl GpsSource for SharedGpsState {
    fn latest_fix(&self) -> Option<GpsFix> {
        self.fix.read().ok().and_then(|fix| fix.clone())
    }
}
