use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::PathBuf;

/// Result of a camera permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessState {
    Granted,
    Denied,
    /// No device behind the requested index.
    Missing,
}

/// Platform camera permission capability.
///
/// Capture code asks this before opening a device instead of branching on
/// the target platform itself.
pub trait DeviceAccess: Send + Sync {
    /// Current state without side effects.
    fn check(&self) -> AccessState;

    /// Ask for access where the platform supports prompting. Defaults to a
    /// plain check.
    fn request(&self) -> AccessState {
        self.check()
    }
}

/// For platforms where the capture API handles permission itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysGranted;

impl DeviceAccess for AlwaysGranted {
    fn check(&self) -> AccessState {
        AccessState::Granted
    }
}

/// Access is the ability to open the device node (e.g. `/dev/video0`).
#[derive(Debug, Clone)]
pub struct DeviceNodeAccess {
    path: PathBuf,
}

impl DeviceNodeAccess {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DeviceAccess for DeviceNodeAccess {
    fn check(&self) -> AccessState {
        match OpenOptions::new().read(true).open(&self.path) {
            Ok(_) => AccessState::Granted,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                tracing::debug!("No permission to open {}", self.path.display());
                AccessState::Denied
            }
            Err(e) => {
                tracing::debug!("Cannot open {}: {}", self.path.display(), e);
                AccessState::Missing
            }
        }
    }
}

/// Pick the access check for the platform this binary was built for.
#[cfg(target_os = "linux")]
pub fn platform_access(device_index: u32) -> Box<dyn DeviceAccess> {
    Box::new(DeviceNodeAccess::new(format!("/dev/video{}", device_index)))
}

#[cfg(not(target_os = "linux"))]
pub fn platform_access(_device_index: u32) -> Box<dyn DeviceAccess> {
    Box::new(AlwaysGranted)
}
