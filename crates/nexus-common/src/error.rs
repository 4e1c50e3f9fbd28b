//! Error types for the common layer.

use std::fmt;

/// Result type for common-layer operations
pub type CommonResult<T> = Result<T, CommonError>;

/// Errors raised by configuration, bootstrap and the services in this crate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommonError {
    /// A configuration value could not be parsed as the requested type
    BadConfigValue { key: String, value: String },

    /// A referenced configuration file could not be read
    ConfigFile(String),

    /// A component was registered twice without allow_overwrites
    DuplicateComponent(String),

    /// A component was registered for the first time after Init
    RegisterAfterInit(String),

    /// A required dependency was never registered
    MissingDependency { component: String, dependency: String },

    /// A lifecycle call arrived in the wrong state
    WrongState { wanted: &'static str, current: &'static str },

    /// A component's init failed
    ComponentInit { component: String, detail: String },

    /// Malformed resource URL
    BadUrl(String),

    /// Underlying OS error with errno
    Os(i32),
}

impl fmt::Display for CommonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadConfigValue { key, value } => {
                write!(f, "config value for '{}' could not be parsed: '{}'", key, value)
            }
            Self::ConfigFile(path) => write!(f, "could not read config file '{}'", path),
            Self::DuplicateComponent(name) => {
                write!(f, "component '{}' registered multiple times", name)
            }
            Self::RegisterAfterInit(name) => {
                write!(f, "register of '{}' called after init", name)
            }
            Self::MissingDependency { component, dependency } => {
                write!(f, "component '{}' requires missing component '{}'", component, dependency)
            }
            Self::WrongState { wanted, current } => {
                write!(f, "wrong lifecycle state: wanted {}, currently {}", wanted, current)
            }
            Self::ComponentInit { component, detail } => {
                write!(f, "init of component '{}' failed: {}", component, detail)
            }
            Self::BadUrl(url) => write!(f, "malformed resource url '{}'", url),
            Self::Os(e) => write!(f, "OS error: errno {}", e),
        }
    }
}

impl std::error::Error for CommonError {}

cfg_if::cfg_if! {
    if #[cfg(target_os = "macos")] {
        /// errno of the last failed libc call on this thread.
        pub fn last_errno() -> i32 {
            unsafe { *libc::__error() }
        }
    } else {
        /// errno of the last failed libc call on this thread.
        pub fn last_errno() -> i32 {
            unsafe { *libc::__errno_location() }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = CommonError::DuplicateComponent("whookie".to_string());
        assert_eq!(format!("{}", e), "component 'whookie' registered multiple times");

        let e = CommonError::MissingDependency {
            component: "opbox".to_string(),
            dependency: "nnti".to_string(),
        };
        assert!(format!("{}", e).contains("missing component 'nnti'"));
    }
}
