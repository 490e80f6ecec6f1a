//! Request validation, run before any lock is taken.

use modswap_fleet::{Fleet, ModuleDeploymentRequest};

use crate::error::ValidationError;

fn is_module_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

/// Check a module name against `[A-Za-z0-9._-]+`.
pub fn validate_module_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::EmptyModuleName);
    }
    if !name.chars().all(is_module_char) {
        return Err(ValidationError::InvalidModuleName(name.to_string()));
    }
    Ok(())
}

pub fn validate_version(version: &str) -> Result<semver::Version, ValidationError> {
    semver::Version::parse(version).map_err(|e| ValidationError::InvalidVersion {
        version: version.to_string(),
        reason: e.to_string(),
    })
}

/// Validate a request against the fleet registered for its environment.
///
/// Returns the fleet on success so callers do not look it up twice.
pub async fn validate_request<'a>(
    request: &ModuleDeploymentRequest,
    fleet: Option<&'a Fleet>,
) -> Result<&'a Fleet, ValidationError> {
    validate_module_name(&request.module_name)?;
    validate_version(&request.target_version)?;

    let fleet = fleet.ok_or(ValidationError::UnknownFleet(request.environment))?;
    if fleet.environment() != request.environment {
        return Err(ValidationError::EnvironmentMismatch {
            fleet: fleet.name().to_string(),
            actual: fleet.environment(),
            requested: request.environment,
        });
    }
    if fleet.is_empty().await {
        return Err(ValidationError::EmptyFleet(fleet.name().to_string()));
    }
    Ok(fleet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use modswap_fleet::{Environment, NodeRef, SimulatedNode};

    fn fleet(environment: Environment, size: usize) -> Fleet {
        let nodes = (0..size)
            .map(|i| Arc::new(SimulatedNode::new(&format!("n{i}"))) as NodeRef)
            .collect();
        Fleet::new("edge", environment, nodes).unwrap()
    }

    #[test]
    fn module_names() {
        assert!(validate_module_name("payments-api_v2.core").is_ok());
        assert_eq!(validate_module_name(""), Err(ValidationError::EmptyModuleName));
        assert!(matches!(
            validate_module_name("pay ments"),
            Err(ValidationError::InvalidModuleName(_))
        ));
        assert!(validate_module_name("pay/ments").is_err());
        assert!(validate_module_name("pâyments").is_err());
    }

    #[test]
    fn versions_must_be_semver() {
        assert!(validate_version("1.2.3").is_ok());
        assert!(validate_version("1.2.3-rc.1+build.5").is_ok());
        assert!(matches!(
            validate_version("1.2"),
            Err(ValidationError::InvalidVersion { .. })
        ));
        assert!(validate_version("latest").is_err());
    }

    #[tokio::test]
    async fn request_needs_a_matching_non_empty_fleet() {
        let request = ModuleDeploymentRequest::new("payments", "2.0.0", Environment::Qa);

        assert_eq!(
            validate_request(&request, None).await.unwrap_err(),
            ValidationError::UnknownFleet(Environment::Qa)
        );

        let empty = fleet(Environment::Qa, 0);
        assert!(matches!(
            validate_request(&request, Some(&empty)).await,
            Err(ValidationError::EmptyFleet(_))
        ));

        let prod = fleet(Environment::Production, 2);
        assert!(matches!(
            validate_request(&request, Some(&prod)).await,
            Err(ValidationError::EnvironmentMismatch { .. })
        ));

        let qa = fleet(Environment::Qa, 2);
        assert_eq!(validate_request(&request, Some(&qa)).await.unwrap().name(), "edge");
    }
}
