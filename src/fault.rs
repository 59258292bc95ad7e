//! Fatal fault boundary
//!
//! Errors the receiver cannot recover from (codec failures, output device
//! failures) end here instead of being handled where they occur. The default
//! handler aborts, leaving restart to whatever supervises the process.

use std::fmt;
use std::sync::Arc;

/// Terminal handler for unrecoverable errors
pub trait FaultHandler: Send + Sync {
    fn fatal(&self, component: &'static str, error: &dyn fmt::Display) -> !;
}

/// Logs the fault and aborts the process
#[derive(Debug, Default, Clone, Copy)]
pub struct AbortOnFault;

impl FaultHandler for AbortOnFault {
    fn fatal(&self, component: &'static str, error: &dyn fmt::Display) -> ! {
        tracing::error!(component, "Fatal fault: {}", error);
        std::process::abort()
    }
}

pub type SharedFaultHandler = Arc<dyn FaultHandler>;

/// The process-wide default
pub fn abort_on_fault() -> SharedFaultHandler {
    Arc::new(AbortOnFault)
}
