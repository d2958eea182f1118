use serde::Serialize;
use thiserror::Error;

use crate::config::PolicyHandle;

/// The transport-independent shape of an inbound request.
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    pub method: String,
    pub path: String,
    pub ip: String,
}

/// Why a request was turned away. Only the first violation is reported.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestRejection {
    #[error("Method {0} is not allowed")]
    MethodNotAllowed(String),

    #[error("IP address {0} is not allowed")]
    IpNotAllowed(String),

    #[error("Path cannot be empty")]
    EmptyPath,

    #[error("Path is {len} characters long, the maximum is {max}")]
    PathTooLong { len: usize, max: usize },

    #[error("Path contains a disallowed character {0:?}")]
    InvalidPathCharacter(char),

    #[error("Path contains a traversal segment")]
    PathTraversal,
}

/// The result of validating a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    #[serde(serialize_with = "serialize_rejection")]
    pub error: Option<RequestRejection>,
}

fn serialize_rejection<S>(error: &Option<RequestRejection>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match error {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

impl ValidationOutcome {
    fn accept() -> Self {
        Self { valid: true, error: None }
    }

    fn reject(error: RequestRejection) -> Self {
        Self { valid: false, error: Some(error) }
    }
}

/// Returns `true` for characters allowed in a request path.
fn is_allowed_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.' | '~' | '%' | '?' | '=' | '&' | '+')
}

/// Checks method, origin and path shape before any other processing.
#[derive(Clone)]
pub struct RequestValidator {
    policy: PolicyHandle,
}

impl RequestValidator {
    pub fn new(policy: PolicyHandle) -> Self {
        Self { policy }
    }

    /// Validates a request against the current policy.
    ///
    /// # Arguments
    ///
    /// * `req` - The request to check.
    ///
    /// # Returns
    ///
    /// A `ValidationOutcome` carrying the first violation, if any.
    pub fn validate_request(&self, req: &AdmissionRequest) -> ValidationOutcome {
        let policy = self.policy.snapshot();

        let method = req.method.trim().to_ascii_uppercase();
        if !policy.admission.allowed_methods.iter().any(|m| *m == method) {
            return ValidationOutcome::reject(RequestRejection::MethodNotAllowed(method));
        }

        if !policy.ip_access.permits(&req.ip) {
            return ValidationOutcome::reject(RequestRejection::IpNotAllowed(req.ip.clone()));
        }

        if req.path.is_empty() {
            return ValidationOutcome::reject(RequestRejection::EmptyPath);
        }

        let len = req.path.chars().count();
        if len > policy.admission.max_path_length {
            return ValidationOutcome::reject(RequestRejection::PathTooLong {
                len,
                max: policy.admission.max_path_length,
            });
        }

        if let Some(bad) = req.path.chars().find(|c| !is_allowed_path_char(*c)) {
            return ValidationOutcome::reject(RequestRejection::InvalidPathCharacter(bad));
        }

        let path_only = req.path.split('?').next().unwrap_or_default();
        if path_only.split('/').any(|segment| segment == "..")
            || path_only.to_ascii_lowercase().contains("%2e%2e")
        {
            return ValidationOutcome::reject(RequestRejection::PathTraversal);
        }

        ValidationOutcome::accept()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityPolicy;

    fn validator() -> RequestValidator {
        let mut policy = SecurityPolicy::default();
        policy.ip_access.blocked_ips.push("198.51.100.9".to_string());
        RequestValidator::new(PolicyHandle::new(policy).unwrap())
    }

    fn request(method: &str, path: &str, ip: &str) -> AdmissionRequest {
        AdmissionRequest {
            method: method.to_string(),
            path: path.to_string(),
            ip: ip.to_string(),
        }
    }

    #[test]
    fn accepts_ordinary_request() {
        let outcome = validator().validate_request(&request("GET", "/api/session?x=1&y=a+b", "203.0.113.5"));
        assert!(outcome.valid);
        assert!(outcome.error.is_none());
    }

    #[test]
    fn rejects_trace() {
        let outcome = validator().validate_request(&request("TRACE", "/", "203.0.113.5"));
        assert!(!outcome.valid);
        assert_eq!(outcome.error, Some(RequestRejection::MethodNotAllowed("TRACE".to_string())));
    }

    #[test]
    fn method_is_checked_before_ip() {
        let outcome = validator().validate_request(&request("CONNECT", "", "198.51.100.9"));
        assert!(matches!(outcome.error, Some(RequestRejection::MethodNotAllowed(_))));
    }

    #[test]
    fn rejects_blocked_ip() {
        let outcome = validator().validate_request(&request("GET", "/", "198.51.100.9"));
        assert_eq!(outcome.error, Some(RequestRejection::IpNotAllowed("198.51.100.9".to_string())));
    }

    #[test]
    fn rejects_bad_paths() {
        let v = validator();
        let ip = "203.0.113.5";

        assert_eq!(v.validate_request(&request("GET", "", ip)).error, Some(RequestRejection::EmptyPath));
        assert!(matches!(
            v.validate_request(&request("GET", &format!("/{}", "a".repeat(2048)), ip)).error,
            Some(RequestRejection::PathTooLong { len: 2049, max: 2048 })
        ));
        assert_eq!(
            v.validate_request(&request("GET", "/files/<script>", ip)).error,
            Some(RequestRejection::InvalidPathCharacter('<'))
        );
        assert_eq!(
            v.validate_request(&request("GET", "/files;drop", ip)).error,
            Some(RequestRejection::InvalidPathCharacter(';'))
        );
        assert_eq!(
            v.validate_request(&request("GET", "/static/../etc/passwd", ip)).error,
            Some(RequestRejection::PathTraversal)
        );
        assert_eq!(
            v.validate_request(&request("GET", "/static/%2E%2E/secret", ip)).error,
            Some(RequestRejection::PathTraversal)
        );
    }

    #[test]
    fn method_list_changes_apply_immediately() {
        let policy = PolicyHandle::new(SecurityPolicy::default()).unwrap();
        let v = RequestValidator::new(policy.clone());
        assert!(v.validate_request(&request("DELETE", "/x", "203.0.113.5")).valid);

        policy
            .modify(|p| p.admission.allowed_methods.retain(|m| m != "DELETE"))
            .unwrap();
        assert!(!v.validate_request(&request("DELETE", "/x", "203.0.113.5")).valid);
    }
}
