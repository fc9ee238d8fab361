//! Primitives for working with typed and untyped configuration data.
#![deny(warnings)]
#![deny(missing_docs)]

use std::{borrow::Cow, collections::HashSet, path::Path, sync::Arc};

use figment::{
    error::Kind,
    providers::{Env, Serialized},
    Figment, Provider,
};
use serde::Deserialize;
use snafu::{ResultExt as _, Snafu};
use sysprobe_error::GenericError;
use tracing::debug;

pub mod deser;
mod provider;
use self::provider::ResolvedProvider;

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// Environment variable prefix was empty.
    #[snafu(display("Environment variable prefix must not be empty."))]
    EmptyPrefix,

    /// Requested field was missing from the configuration.
    #[snafu(display("Missing field '{}' in configuration. {}", field, help_text))]
    MissingField {
        /// Help text describing how to set the missing field.
        ///
        /// This is meant to be displayed to the user, and includes environment variable-specific text if environment
        /// variables had been loaded originally.
        help_text: String,

        /// Name of the missing field.
        field: Cow<'static, str>,
    },

    /// Requested field's data type was not the expected data type.
    #[snafu(display(
        "Expected value for field '{}' to be '{}', got '{}' instead.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        /// Name of the invalid field.
        ///
        /// This is a period-separated path to the field.
        field: String,

        /// Expected data type.
        expected_ty: String,

        /// Actual data type.
        actual_ty: String,
    },

    /// Generic configuration error.
    #[snafu(display("Failed to query configuration."))]
    Generic {
        /// Error source.
        source: GenericError,
    },
}

impl From<figment::Error> for ConfigurationError {
    fn from(e: figment::Error) -> Self {
        match e.kind {
            Kind::InvalidType(actual_ty, expected_ty) => Self::InvalidFieldType {
                field: e.path.join("."),
                expected_ty,
                actual_ty: actual_ty.to_string(),
            },
            _ => Self::Generic { source: e.into() },
        }
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
enum LookupSource {
    /// The configuration key is looked up in a form suitable for environment variables.
    Environment { prefix: String },
}

impl LookupSource {
    fn transform_key(&self, key: &str) -> String {
        match self {
            // The prefix is already uppercased with a trailing underscore at this point.
            LookupSource::Environment { prefix } => format!("{}{}", prefix, key.replace('.', "_").to_uppercase()),
        }
    }
}

struct BoxedProvider(Box<dyn Provider + Send + Sync>);

impl Provider for BoxedProvider {
    fn metadata(&self) -> figment::Metadata {
        self.0.metadata()
    }

    fn data(&self) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        self.0.data()
    }
}

/// A configuration loader that can pull from various sources.
///
/// This loader wraps `figment` to expose a small API for loading configuration data from files and the environment,
/// and then querying it. Sources added later take precedence over sources added earlier. Either a typed value can be
/// extracted from the configuration ([`into_typed`][Self::into_typed]), or the raw configuration data can be accessed
/// via a generic API ([`into_generic`][Self::into_generic]).
///
/// # Supported sources
///
/// - YAML file
/// - JSON file
/// - environment variables (must be prefixed; see [`from_environment`][Self::from_environment])
#[derive(Default)]
pub struct ConfigurationLoader {
    lookup_sources: HashSet<LookupSource>,
    providers: Vec<BoxedProvider>,
}

impl ConfigurationLoader {
    /// Loads the given YAML configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or if the file is not valid YAML, an error will be returned.
    pub fn from_yaml<P>(mut self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<Path>,
    {
        let resolved_provider = ResolvedProvider::from_yaml(&path)
            .map_err(GenericError::from)
            .context(Generic)?;
        self.providers.push(BoxedProvider(Box::new(resolved_provider)));
        Ok(self)
    }

    /// Attempts to load the given YAML configuration file, ignoring any errors.
    ///
    /// Errors include the file not existing, not being readable/accessible, and not being valid YAML.
    pub fn try_from_yaml<P>(mut self, path: P) -> Self
    where
        P: AsRef<Path>,
    {
        match ResolvedProvider::from_yaml(&path) {
            Ok(resolved_provider) => {
                self.providers.push(BoxedProvider(Box::new(resolved_provider)));
            }
            Err(e) => {
                debug!(error = %e, file_path = %path.as_ref().to_string_lossy(), "Unable to read YAML configuration file. Ignoring.");
            }
        }
        self
    }

    /// Loads the given JSON configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or if the file is not valid JSON, an error will be returned.
    pub fn from_json<P>(mut self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<Path>,
    {
        let resolved_provider = ResolvedProvider::from_json(&path)
            .map_err(GenericError::from)
            .context(Generic)?;
        self.providers.push(BoxedProvider(Box::new(resolved_provider)));
        Ok(self)
    }

    /// Attempts to load the given JSON configuration file, ignoring any errors.
    ///
    /// Errors include the file not existing, not being readable/accessible, and not being valid JSON.
    pub fn try_from_json<P>(mut self, path: P) -> Self
    where
        P: AsRef<Path>,
    {
        match ResolvedProvider::from_json(&path) {
            Ok(resolved_provider) => {
                self.providers.push(BoxedProvider(Box::new(resolved_provider)));
            }
            Err(e) => {
                debug!(error = %e, file_path = %path.as_ref().to_string_lossy(), "Unable to read JSON configuration file. Ignoring.");
            }
        }
        self
    }

    /// Loads configuration from environment variables.
    ///
    /// The prefix given will have an underscore appended to it if it does not already end with one. For example, with a
    /// prefix of `sysprobe`, any environment variable starting with `SYSPROBE_` would be matched.
    ///
    /// The prefix is case-insensitive.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, or the environment could not be read, an error will be returned.
    pub fn from_environment(mut self, prefix: &'static str) -> Result<Self, ConfigurationError> {
        if prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }

        let prefix = if prefix.ends_with('_') {
            prefix.to_uppercase()
        } else {
            format!("{}_", prefix.to_uppercase())
        };

        // `Env` isn't `Send + Sync`, so snapshot its values into a serialized provider.
        let env = Env::prefixed(&prefix);
        let values = env.data()?;
        if let Some(default_dict) = values.get(&figment::Profile::Default) {
            self.providers
                .push(BoxedProvider(Box::new(Serialized::defaults(default_dict.clone()))));
            self.lookup_sources.insert(LookupSource::Environment { prefix });
        }
        Ok(self)
    }

    /// Adds a set of default values, with the lowest precedence of any source added so far.
    ///
    /// Typically used to seed values that a binary wants to exist even when no file or environment variable sets them.
    pub fn with_defaults<T>(mut self, defaults: T) -> Self
    where
        T: serde::Serialize + Send + Sync + 'static,
    {
        self.providers
            .insert(0, BoxedProvider(Box::new(Serialized::defaults(defaults))));
        self
    }

    fn build_figment(providers: &[BoxedProvider]) -> Figment {
        providers
            .iter()
            .fold(Figment::new(), |figment, provider| figment.admerge(provider))
    }

    /// Consumes the configuration loader, deserializing it as `T`.
    ///
    /// ## Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error will be returned.
    pub fn into_typed<'a, T>(self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        Self::build_figment(&self.providers)
            .extract()
            .map_err(|e| from_figment_error(&self.lookup_sources, e))
    }

    /// Consumes the configuration loader and wraps it in a generic wrapper.
    pub fn into_generic(self) -> GenericConfiguration {
        let figment = Self::build_figment(&self.providers);
        GenericConfiguration {
            inner: Arc::new(Inner {
                figment,
                lookup_sources: self.lookup_sources,
            }),
        }
    }
}

#[derive(Debug)]
struct Inner {
    figment: Figment,
    lookup_sources: HashSet<LookupSource>,
}

/// A generic configuration object.
///
/// This represents the merged configuration derived from [`ConfigurationLoader`] in its raw form. Values can be queried
/// by key, and can be extracted either as typed values or in their raw form.
///
/// Keys must be in the form of `a.b.c`, where periods (`.`) are used to indicate a nested value. For a key that is only
/// present in the environment, the nested form is also looked up with periods replaced by underscores, so that
/// `buffer.max_size` matches `SYSPROBE_BUFFER_MAX_SIZE`.
#[derive(Clone, Debug)]
pub struct GenericConfiguration {
    inner: Arc<Inner>,
}

impl GenericConfiguration {
    /// Creates an empty configuration.
    ///
    /// Every lookup against it returns a missing field, which makes it useful for falling back to defaults.
    pub fn empty() -> Self {
        ConfigurationLoader::default().into_generic()
    }

    fn get<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        match self.inner.figment.extract_inner(key) {
            Ok(value) => Ok(value),
            Err(e) => {
                if matches!(e.kind, Kind::MissingField(_)) {
                    let fallback_key = key.replace('.', "_");
                    self.inner
                        .figment
                        .extract_inner(&fallback_key)
                        .map_err(|fallback_e| from_figment_error(&self.inner.lookup_sources, fallback_e))
                } else {
                    Err(e.into())
                }
            }
        }
    }

    /// Gets a configuration value by key.
    ///
    /// ## Errors
    ///
    /// If the key does not exist in the configuration, or if the value could not be deserialized into `T`, an error
    /// variant will be returned.
    pub fn get_typed<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.get(key)
    }

    /// Gets a configuration value by key, or the default value if a key does not exist or could not be deserialized.
    ///
    /// This swallows any errors and should generally be used sparingly.
    pub fn get_typed_or_default<'a, T>(&self, key: &str) -> T
    where
        T: Default + Deserialize<'a>,
    {
        self.get(key).unwrap_or_default()
    }

    /// Gets a configuration value by key, if it exists.
    ///
    /// If the key exists in the configuration, and can be deserialized, `Ok(Some(value))` is returned. Otherwise,
    /// `Ok(None)` will be returned.
    ///
    /// ## Errors
    ///
    /// If the value could not be deserialized into `T`, an error will be returned.
    pub fn try_get_typed<'a, T>(&self, key: &str) -> Result<Option<T>, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        match self.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(ConfigurationError::MissingField { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Attempts to deserialize the entire configuration as `T`.
    ///
    /// ## Errors
    ///
    /// If the value could not be deserialized into `T`, an error will be returned.
    pub fn as_typed<'a, T>(&self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.inner
            .figment
            .extract()
            .map_err(|e| from_figment_error(&self.inner.lookup_sources, e))
    }
}

fn from_figment_error(lookup_sources: &HashSet<LookupSource>, e: figment::Error) -> ConfigurationError {
    match e.kind {
        Kind::MissingField(field) => {
            let mut valid_keys = lookup_sources
                .iter()
                .map(|source| source.transform_key(&field))
                .collect::<Vec<_>>();

            // Always specify the original key as a valid key to try.
            valid_keys.insert(0, field.to_string());

            let help_text = format!("Try setting `{}`.", valid_keys.join("` or `"));

            ConfigurationError::MissingField { help_text, field }
        }
        Kind::InvalidType(actual_ty, expected_ty) => ConfigurationError::InvalidFieldType {
            field: e.path.join("."),
            expected_ty,
            actual_ty: actual_ty.to_string(),
        },
        _ => ConfigurationError::Generic { source: e.into() },
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use serde::Deserialize;
    use serde_with::serde_as;

    use super::*;
    use crate::deser::PermissiveBool;

    fn write_file(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn yaml_nested_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "sysprobe.yaml", "buffer:\n  max_size: 4096\ndebug: true\n");

        let config = ConfigurationLoader::default().from_yaml(&path).unwrap().into_generic();

        assert_eq!(config.get_typed::<usize>("buffer.max_size").unwrap(), 4096);
        assert!(config.get_typed::<bool>("debug").unwrap());
        assert_eq!(config.try_get_typed::<bool>("testing").unwrap(), None);
    }

    #[test]
    fn missing_yaml_is_ignored_by_try() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigurationLoader::default()
            .try_from_yaml(dir.path().join("absent.yaml"))
            .into_generic();

        assert!(matches!(
            config.get_typed::<bool>("debug"),
            Err(ConfigurationError::MissingField { .. })
        ));
    }

    #[test]
    fn malformed_json_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "sysprobe.json", "{ \"debug\": ");

        let result = ConfigurationLoader::default().from_json(&path);
        assert!(matches!(result, Err(ConfigurationError::Generic { .. })));
    }

    #[test]
    fn environment_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "sysprobe.yaml", "hanging_call_timeout_ms: 100\n");

        std::env::set_var("SPCFGTEST_HANGING_CALL_TIMEOUT_MS", "250");
        std::env::set_var("SPCFGTEST_BUFFER_MAX_ATTEMPTS", "3");

        let config = ConfigurationLoader::default()
            .from_yaml(&path)
            .unwrap()
            .from_environment("spcfgtest")
            .unwrap()
            .into_generic();

        assert_eq!(config.get_typed::<u64>("hanging_call_timeout_ms").unwrap(), 250);

        // Nested keys fall back to their underscore-joined environment form.
        assert_eq!(config.get_typed::<u32>("buffer.max_attempts").unwrap(), 3);
    }

    #[test]
    fn missing_field_help_text_names_env_var() {
        std::env::set_var("SPHELPTEST_UNRELATED", "1");

        let config = ConfigurationLoader::default()
            .from_environment("SPHELPTEST")
            .unwrap()
            .into_generic();

        match config.get_typed::<String>("procfs_root") {
            Err(ConfigurationError::MissingField { help_text, .. }) => {
                assert!(help_text.contains("SPHELPTEST_PROCFS_ROOT"), "{}", help_text);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn empty_prefix_rejected() {
        assert!(matches!(
            ConfigurationLoader::default().from_environment(""),
            Err(ConfigurationError::EmptyPrefix)
        ));
    }

    #[test]
    fn defaults_have_lowest_precedence() {
        #[derive(serde::Serialize)]
        struct Defaults {
            debug: bool,
            testing: bool,
        }

        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "sysprobe.yaml", "debug: true\n");

        let config = ConfigurationLoader::default()
            .from_yaml(&path)
            .unwrap()
            .with_defaults(Defaults {
                debug: false,
                testing: false,
            })
            .into_generic();

        assert!(config.get_typed::<bool>("debug").unwrap());
        assert!(!config.get_typed::<bool>("testing").unwrap());
    }

    #[test]
    fn permissive_bool_in_typed_extraction() {
        #[serde_as]
        #[derive(Deserialize)]
        struct Flags {
            #[serde_as(as = "PermissiveBool")]
            debug: bool,
            #[serde_as(as = "PermissiveBool")]
            testing: bool,
        }

        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "flags.json", "{ \"debug\": \"Yes\", \"testing\": 0 }");

        let flags: Flags = ConfigurationLoader::default().from_json(&path).unwrap().into_typed().unwrap();
        assert!(flags.debug);
        assert!(!flags.testing);
    }
}
