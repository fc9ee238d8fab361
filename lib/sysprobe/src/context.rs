use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use serde_with::serde_as;
use sysprobe_config::{
    deser::{EmptyPathAsNone, PermissiveBool},
    GenericConfiguration,
};
use sysprobe_error::{ErrorContext as _, GenericError};

use crate::buffer::BufferPolicy;

const DEFAULT_PROCFS_ROOT: &str = "/proc";
const DEFAULT_HANGING_CALL_TIMEOUT: Duration = Duration::from_millis(100);

#[serde_as]
#[derive(Deserialize)]
#[serde(transparent)]
struct Flag(#[serde_as(as = "PermissiveBool")] bool);

#[serde_as]
#[derive(Deserialize)]
#[serde(transparent)]
struct OptionalPath(#[serde_as(as = "EmptyPathAsNone")] Option<PathBuf>);

/// Immutable configuration for the binding layer.
///
/// A context is built once, handed to [`Probe::new`][crate::Probe::new], and never changes afterwards. Two probes built
/// from two different contexts don't share any state, which lets tests run side by side with different settings.
#[derive(Clone, Debug)]
pub struct BindingContext {
    debug: bool,
    testing: bool,
    procfs_root: PathBuf,
    hanging_call_timeout: Duration,
    buffer_policy: BufferPolicy,
}

impl BindingContext {
    /// Returns a builder seeded with the default settings.
    pub fn builder() -> BindingContextBuilder {
        BindingContextBuilder {
            context: Self::default(),
        }
    }

    /// Creates a new `BindingContext` from the given configuration.
    ///
    /// Recognized keys are `debug`, `testing`, `procfs_root`, `hanging_call_timeout_ms`, `buffer.max_size` and
    /// `buffer.max_attempts`. Missing keys keep their defaults.
    ///
    /// ## Errors
    ///
    /// If any of the keys are present but hold a value of the wrong type, an error will be returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let mut builder = Self::builder();

        if let Some(Flag(debug)) = config.try_get_typed("debug").error_context("Invalid `debug` setting.")? {
            builder = builder.debug(debug);
        }

        if let Some(Flag(testing)) = config.try_get_typed("testing").error_context("Invalid `testing` setting.")? {
            builder = builder.testing(testing);
        }

        if let Some(OptionalPath(Some(procfs_root))) = config
            .try_get_typed("procfs_root")
            .error_context("Invalid `procfs_root` setting.")?
        {
            builder = builder.procfs_root(procfs_root);
        }

        if let Some(timeout_ms) = config
            .try_get_typed::<u64>("hanging_call_timeout_ms")
            .error_context("Invalid `hanging_call_timeout_ms` setting.")?
        {
            builder = builder.hanging_call_timeout(Duration::from_millis(timeout_ms));
        }

        let mut policy = BufferPolicy::default();
        if let Some(max_size) = config
            .try_get_typed::<usize>("buffer.max_size")
            .error_context("Invalid `buffer.max_size` setting.")?
        {
            policy = policy.with_max_size(max_size);
        }
        if let Some(max_attempts) = config
            .try_get_typed::<usize>("buffer.max_attempts")
            .error_context("Invalid `buffer.max_attempts` setting.")?
        {
            policy = policy.with_max_attempts(max_attempts);
        }

        Ok(builder.buffer_policy(policy).build())
    }

    /// Whether errors that are deliberately swallowed should be logged.
    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Whether the probe is running under a test harness.
    ///
    /// Some platform quirks, such as Windows' load average sampler, behave slightly differently when this is set.
    pub fn testing(&self) -> bool {
        self.testing
    }

    /// Mount point of procfs.
    pub fn procfs_root(&self) -> &Path {
        &self.procfs_root
    }

    /// How long a call that's known to occasionally hang is waited on before being abandoned.
    pub fn hanging_call_timeout(&self) -> Duration {
        self.hanging_call_timeout
    }

    /// Growth policy for kernel query buffers.
    pub fn buffer_policy(&self) -> &BufferPolicy {
        &self.buffer_policy
    }
}

impl Default for BindingContext {
    fn default() -> Self {
        Self {
            debug: false,
            testing: false,
            procfs_root: PathBuf::from(DEFAULT_PROCFS_ROOT),
            hanging_call_timeout: DEFAULT_HANGING_CALL_TIMEOUT,
            buffer_policy: BufferPolicy::default(),
        }
    }
}

/// Builder for [`BindingContext`].
#[derive(Clone, Debug)]
pub struct BindingContextBuilder {
    context: BindingContext,
}

impl BindingContextBuilder {
    /// Sets the debug flag.
    pub fn debug(mut self, debug: bool) -> Self {
        self.context.debug = debug;
        self
    }

    /// Sets the testing flag.
    pub fn testing(mut self, testing: bool) -> Self {
        self.context.testing = testing;
        self
    }

    /// Sets the procfs mount point, such as `/host/proc` when running in a container with the host's procfs mapped in.
    pub fn procfs_root<P: Into<PathBuf>>(mut self, procfs_root: P) -> Self {
        self.context.procfs_root = procfs_root.into();
        self
    }

    /// Sets the bounded wait used for calls that can hang.
    pub fn hanging_call_timeout(mut self, timeout: Duration) -> Self {
        self.context.hanging_call_timeout = timeout;
        self
    }

    /// Sets the kernel query buffer growth policy.
    pub fn buffer_policy(mut self, policy: BufferPolicy) -> Self {
        self.context.buffer_policy = policy;
        self
    }

    /// Builds the context.
    pub fn build(self) -> BindingContext {
        self.context
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use sysprobe_config::ConfigurationLoader;

    use super::*;

    #[test]
    fn defaults_from_empty_configuration() {
        let context = BindingContext::from_configuration(&GenericConfiguration::empty()).unwrap();
        assert!(!context.debug());
        assert!(!context.testing());
        assert_eq!(context.procfs_root(), Path::new("/proc"));
        assert_eq!(context.hanging_call_timeout(), DEFAULT_HANGING_CALL_TIMEOUT);
        assert_eq!(context.buffer_policy(), &BufferPolicy::default());
    }

    #[test]
    fn values_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sysprobe.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "debug: \"yes\"\nprocfs_root: /host/proc\nhanging_call_timeout_ms: 250\nbuffer:\n  max_size: 4096\n  max_attempts: 3"
        )
        .unwrap();

        let config = ConfigurationLoader::default().from_yaml(&path).unwrap().into_generic();
        let context = BindingContext::from_configuration(&config).unwrap();
        assert!(context.debug());
        assert!(!context.testing());
        assert_eq!(context.procfs_root(), Path::new("/host/proc"));
        assert_eq!(context.hanging_call_timeout(), Duration::from_millis(250));
        assert_eq!(context.buffer_policy().max_size(), 4096);
        assert_eq!(context.buffer_policy().max_attempts(), 3);
    }

    #[test]
    fn empty_procfs_root_keeps_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sysprobe.yaml");
        std::fs::write(&path, "procfs_root: \"\"\n").unwrap();

        let config = ConfigurationLoader::default().from_yaml(&path).unwrap().into_generic();
        let context = BindingContext::from_configuration(&config).unwrap();
        assert_eq!(context.procfs_root(), Path::new("/proc"));
    }

    #[test]
    fn wrong_type_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sysprobe.yaml");
        std::fs::write(&path, "hanging_call_timeout_ms: soon\n").unwrap();

        let config = ConfigurationLoader::default().from_yaml(&path).unwrap().into_generic();
        assert!(BindingContext::from_configuration(&config).is_err());
    }

    #[test]
    fn builder_overrides() {
        let context = BindingContext::builder().testing(true).procfs_root("/tmp/proc").build();
        assert!(context.testing());
        assert_eq!(context.procfs_root(), Path::new("/tmp/proc"));
    }
}
