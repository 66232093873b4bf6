//! Connection parameters for an agent engine resource.

use std::time::Duration;

use thiserror::Error;

/// Location used when `GOOGLE_CLOUD_LOCATION` is unset.
pub const DEFAULT_LOCATION: &str = "us-central1";

pub const PROJECT_VAR: &str = "GOOGLE_CLOUD_PROJECT";
pub const LOCATION_VAR: &str = "GOOGLE_CLOUD_LOCATION";
pub const BASE_URL_VAR: &str = "AGENT_ENGINE_BASE_URL";
pub const ACCESS_TOKEN_VAR: &str = "AGENT_ENGINE_ACCESS_TOKEN";
pub const TIMEOUT_VAR: &str = "AGENT_ENGINE_TIMEOUT_SECS";

/// Configuration error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} is not set: {hint}")]
    Missing {
        key: &'static str,
        hint: &'static str,
    },
    #[error("Invalid {key} {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Resolved connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Full resource path, `projects/{p}/locations/{l}/reasoningEngines/{id}`.
    pub resource_name: String,
    pub project: String,
    pub location: String,
    /// API root without trailing slash.
    pub base_url: String,
    /// Bearer token passed through as-is.
    pub access_token: Option<String>,
    /// Deadline applied to every HTTP request, streams included.
    pub request_timeout: Option<Duration>,
}

impl EngineConfig {
    /// Load `.env` (if present) and resolve from the process environment.
    ///
    /// # Errors
    /// Returns [`ConfigError`] if a required value is missing or malformed.
    pub fn load(resource: &str) -> Result<Self, ConfigError> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!("Ignoring unreadable .env file: {e}");
            }
        }
        Self::from_lookup(resource, |key| std::env::var(key).ok())
    }

    /// Resolve from an arbitrary variable lookup.
    ///
    /// `resource` is either a full resource path or a bare engine id; a bare
    /// id is expanded with the configured project and location.
    ///
    /// # Errors
    /// Returns [`ConfigError`] if a required value is missing or malformed.
    pub fn from_lookup<F>(resource: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let resource = resource.trim();

        let (project, location, engine_id) = if resource.starts_with("projects/") {
            parse_resource_path(resource)?
        } else {
            if resource.is_empty() || resource.contains('/') {
                return Err(ConfigError::Invalid {
                    key: "resource id",
                    value: resource.to_string(),
                    reason: "expected projects/<p>/locations/<l>/reasoningEngines/<id> or a bare engine id",
                });
            }
            let project = var(PROJECT_VAR).ok_or(ConfigError::Missing {
                key: PROJECT_VAR,
                hint: "required when only the engine id is given",
            })?;
            let location = var(LOCATION_VAR).unwrap_or_else(|| DEFAULT_LOCATION.to_string());
            (project, location, resource.to_string())
        };

        let base_url = var(BASE_URL_VAR)
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("https://{location}-aiplatform.googleapis.com"));

        let request_timeout = match var(TIMEOUT_VAR) {
            None => None,
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(0) | Err(_) => {
                    return Err(ConfigError::Invalid {
                        key: TIMEOUT_VAR,
                        value: raw,
                        reason: "expected a positive number of seconds",
                    });
                }
                Ok(secs) => Some(Duration::from_secs(secs)),
            },
        };

        Ok(Self {
            resource_name: format!("projects/{project}/locations/{location}/reasoningEngines/{engine_id}"),
            project,
            location,
            base_url,
            access_token: var(ACCESS_TOKEN_VAR),
            request_timeout,
        })
    }

    /// URL of the resource itself.
    #[must_use]
    pub fn resource_url(&self) -> String {
        format!("{}/v1/{}", self.base_url, self.resource_name)
    }

    /// URL of the unary query method.
    #[must_use]
    pub fn query_url(&self) -> String {
        format!("{}:query", self.resource_url())
    }

    /// URL of the streaming query method.
    #[must_use]
    pub fn stream_query_url(&self) -> String {
        format!("{}:streamQuery?alt=sse", self.resource_url())
    }
}

fn parse_resource_path(resource: &str) -> Result<(String, String, String), ConfigError> {
    let segments: Vec<&str> = resource.split('/').collect();
    match segments.as_slice() {
        ["projects", project, "locations", location, "reasoningEngines", id]
            if !project.is_empty() && !location.is_empty() && !id.is_empty() =>
        {
            Ok(((*project).to_string(), (*location).to_string(), (*id).to_string()))
        }
        _ => Err(ConfigError::Invalid {
            key: "resource id",
            value: resource.to_string(),
            reason: "expected projects/<p>/locations/<l>/reasoningEngines/<id>",
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn full_resource_path_needs_no_environment() {
        let config = EngineConfig::from_lookup(
            "projects/p1/locations/europe-west4/reasoningEngines/123",
            lookup(&[]),
        )
        .unwrap();

        assert_eq!(config.project, "p1");
        assert_eq!(config.location, "europe-west4");
        assert_eq!(config.base_url, "https://europe-west4-aiplatform.googleapis.com");
        assert_eq!(
            config.stream_query_url(),
            "https://europe-west4-aiplatform.googleapis.com/v1/projects/p1/locations/europe-west4/reasoningEngines/123:streamQuery?alt=sse"
        );
        assert_eq!(config.access_token, None);
        assert_eq!(config.request_timeout, None);
    }

    #[test]
    fn bare_id_is_expanded_with_project_and_default_location() {
        let config =
            EngineConfig::from_lookup("4933874811202961408", lookup(&[(PROJECT_VAR, "demo")]))
                .unwrap();
        assert_eq!(
            config.resource_name,
            "projects/demo/locations/us-central1/reasoningEngines/4933874811202961408"
        );
    }

    #[test]
    fn bare_id_without_project_is_a_missing_value() {
        let err = EngineConfig::from_lookup("123", lookup(&[(PROJECT_VAR, "  ")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { key: PROJECT_VAR, .. }));
        assert!(err.to_string().contains(PROJECT_VAR));
    }

    #[test]
    fn malformed_paths_are_rejected() {
        for resource in ["", "projects/p/locations/l", "a/b", "projects//locations/l/reasoningEngines/1"] {
            let err = EngineConfig::from_lookup(resource, lookup(&[(PROJECT_VAR, "p")])).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { .. }), "{resource}");
        }
    }

    #[test]
    fn overrides_are_applied() {
        let config = EngineConfig::from_lookup(
            "123",
            lookup(&[
                (PROJECT_VAR, "p"),
                (LOCATION_VAR, "asia-east1"),
                (BASE_URL_VAR, "http://localhost:8080/"),
                (ACCESS_TOKEN_VAR, "token"),
                (TIMEOUT_VAR, "30"),
            ]),
        )
        .unwrap();

        assert_eq!(config.location, "asia-east1");
        assert_eq!(
            config.query_url(),
            "http://localhost:8080/v1/projects/p/locations/asia-east1/reasoningEngines/123:query"
        );
        assert_eq!(config.access_token.as_deref(), Some("token"));
        assert_eq!(config.request_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn bad_timeout_is_invalid() {
        for raw in ["0", "soon"] {
            let err = EngineConfig::from_lookup(
                "projects/p/locations/l/reasoningEngines/1",
                lookup(&[(TIMEOUT_VAR, raw)]),
            )
            .unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { key: TIMEOUT_VAR, .. }));
        }
    }
}
