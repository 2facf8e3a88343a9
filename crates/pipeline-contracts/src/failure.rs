//! Failure information attached to broken node executions

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ContractError;

/// Cause classification. A single failure may carry several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    ConnectivityFailure,
    AuthenticationFailure,
    AuthorizationFailure,
    VerificationFailure,
    DelegateProvisioningFailure,
    ApplicationFailure,
    TimeoutFailure,
    PolicyEvaluationFailure,
    InputTimeoutFailure,
    UnknownFailure,
}

impl FailureType {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureType::ConnectivityFailure => "CONNECTIVITY_FAILURE",
            FailureType::AuthenticationFailure => "AUTHENTICATION_FAILURE",
            FailureType::AuthorizationFailure => "AUTHORIZATION_FAILURE",
            FailureType::VerificationFailure => "VERIFICATION_FAILURE",
            FailureType::DelegateProvisioningFailure => "DELEGATE_PROVISIONING_FAILURE",
            FailureType::ApplicationFailure => "APPLICATION_FAILURE",
            FailureType::TimeoutFailure => "TIMEOUT_FAILURE",
            FailureType::PolicyEvaluationFailure => "POLICY_EVALUATION_FAILURE",
            FailureType::InputTimeoutFailure => "INPUT_TIMEOUT_FAILURE",
            FailureType::UnknownFailure => "UNKNOWN_FAILURE",
        }
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureType {
    type Err = ContractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const ALL: [FailureType; 10] = [
            FailureType::ConnectivityFailure,
            FailureType::AuthenticationFailure,
            FailureType::AuthorizationFailure,
            FailureType::VerificationFailure,
            FailureType::DelegateProvisioningFailure,
            FailureType::ApplicationFailure,
            FailureType::TimeoutFailure,
            FailureType::PolicyEvaluationFailure,
            FailureType::InputTimeoutFailure,
            FailureType::UnknownFailure,
        ];
        ALL.into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ContractError::unknown("failure type", s))
    }
}

/// One reported failure with its own causes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureData {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub failure_types: BTreeSet<FailureType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureInfo {
    pub error_message: String,
    #[serde(default)]
    pub failure_types: BTreeSet<FailureType>,
    #[serde(default)]
    pub failure_data: Vec<FailureData>,
}

impl FailureInfo {
    pub fn new(error_message: impl Into<String>) -> Self {
        Self {
            error_message: error_message.into(),
            ..Self::default()
        }
    }

    pub fn with_failure_type(mut self, failure_type: FailureType) -> Self {
        self.failure_types.insert(failure_type);
        self
    }

    pub fn with_data(mut self, data: FailureData) -> Self {
        self.failure_data.push(data);
        self
    }

    /// Top level causes plus those of every data entry.
    pub fn all_failure_types(&self) -> BTreeSet<FailureType> {
        let mut all = self.failure_types.clone();
        for data in &self.failure_data {
            all.extend(data.failure_types.iter().copied());
        }
        all
    }

    /// Fold another failure into this one, used when aggregating children.
    pub fn merge(&mut self, other: &FailureInfo) {
        if self.error_message.is_empty() {
            self.error_message = other.error_message.clone();
        } else if !other.error_message.is_empty() && other.error_message != self.error_message {
            self.error_message = format!("{}; {}", self.error_message, other.error_message);
        }
        self.failure_types.extend(other.failure_types.iter().copied());
        self.failure_data.extend(other.failure_data.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_failure_types_includes_data_entries() {
        let info = FailureInfo::new("boom")
            .with_failure_type(FailureType::ApplicationFailure)
            .with_data(FailureData {
                message: "socket closed".to_string(),
                code: None,
                failure_types: [FailureType::ConnectivityFailure].into(),
            });

        let all = info.all_failure_types();
        assert!(all.contains(&FailureType::ApplicationFailure));
        assert!(all.contains(&FailureType::ConnectivityFailure));
    }

    #[test]
    fn test_merge_joins_messages_and_causes() {
        let mut a = FailureInfo::new("a failed").with_failure_type(FailureType::TimeoutFailure);
        let b = FailureInfo::new("b failed").with_failure_type(FailureType::ConnectivityFailure);
        a.merge(&b);
        assert_eq!(a.error_message, "a failed; b failed");
        assert_eq!(a.failure_types.len(), 2);
    }

    #[test]
    fn test_failure_type_parse() {
        assert_eq!(
            "CONNECTIVITY_FAILURE".parse::<FailureType>().unwrap(),
            FailureType::ConnectivityFailure
        );
        assert!("NETWORK".parse::<FailureType>().is_err());
    }
}
