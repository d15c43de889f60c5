//! Owned handle to a parsed OCI runtime configuration.

use std::path::Path;

use oci_spec::runtime::Spec;

use crate::error::{Error, Result};

/// A parsed OCI runtime configuration.
///
/// [`close`](ContainerSpec::close) releases it and may be called any number of times.
/// A closed spec is rejected by every operation that needs it.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    spec: Option<Spec>,
}

impl From<Spec> for ContainerSpec {
    fn from(spec: Spec) -> Self {
        Self { spec: Some(spec) }
    }
}

impl ContainerSpec {
    pub fn from_spec(spec: Spec) -> Self {
        spec.into()
    }

    /// Loads `config.json` style content from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Spec::load(path)?.into())
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let spec: Spec = serde_json::from_str(json)?;
        Ok(spec.into())
    }

    /// The runtime's default configuration. The rootless variant maps the
    /// current user and group to root inside a new user namespace.
    pub fn default_spec(rootless: bool) -> Self {
        let spec = if rootless {
            Spec::rootless(nix::unistd::getuid().as_raw(), nix::unistd::getgid().as_raw())
        } else {
            Spec::default()
        };
        spec.into()
    }

    pub fn spec(&self) -> Result<&Spec> {
        self.spec.as_ref().ok_or_else(Self::released)
    }

    pub fn spec_mut(&mut self) -> Result<&mut Spec> {
        self.spec.as_mut().ok_or_else(Self::released)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self.spec()?)?)
    }

    pub fn is_closed(&self) -> bool {
        self.spec.is_none()
    }

    pub fn close(&mut self) {
        self.spec = None;
    }

    fn released() -> Error {
        Error::InvalidArgument("invalid container spec".into())
    }
}

#[cfg(test)]
mod tests {
    use oci_spec::runtime::{ProcessBuilder, SpecBuilder};

    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_close_is_idempotent() {
        let mut spec = ContainerSpec::default_spec(false);
        assert!(spec.spec().is_ok());
        spec.close();
        spec.close();
        assert!(spec.is_closed());
        assert_eq!(spec.spec().unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(spec.to_json().unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_json_round_trip() -> anyhow::Result<()> {
        let spec = SpecBuilder::default()
            .process(
                ProcessBuilder::default()
                    .cwd("/")
                    .args(vec!["/bin/true".to_string()])
                    .build()?,
            )
            .build()?;
        let json = ContainerSpec::from(spec.clone()).to_json()?;
        let parsed = ContainerSpec::from_json(&json)?;
        assert_eq!(parsed.spec()?, &spec);
        Ok(())
    }

    #[test]
    fn test_invalid_json() {
        let err = ContainerSpec::from_json("{ not json").unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn test_rootless_default_has_user_namespace() -> anyhow::Result<()> {
        let spec = ContainerSpec::default_spec(true);
        let linux = spec.spec()?.linux().as_ref().unwrap();
        assert!(linux.uid_mappings().is_some());
        Ok(())
    }

    #[test]
    fn test_load() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.json");
        Spec::default().save(&path)?;
        let spec = ContainerSpec::load(&path)?;
        assert!(!spec.is_closed());
        Ok(())
    }
}
