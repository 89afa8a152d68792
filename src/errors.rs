// Wire Error Taxonomy
// Structured errors that cross the tool/gateway boundary. Internal code uses
// anyhow for fallibility; conversion into this typed form happens once, at
// the boundary, so handlers never panic across the wire and every error
// carries a next concrete step for the caller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of protocol error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidArgs,
    NotIndexed,
    RepoNotFound,
    ErrRootOutOfScope,
    IoError,
    DbError,
    ErrEngineNotInstalled,
    ErrEngineInit,
    ErrEngineQuery,
    ErrEngineIndex,
    ErrEngineUnavailable,
    ErrEngineRebuild,
    BudgetExceeded,
    BudgetSoftLimit,
    BudgetHardLimit,
    SoftLimit,
    SearchFirstRequired,
    SearchRefRequired,
    CandidateRefRequired,
    LowRelevance,
    VersionConflict,
    ErrDaemonSingletonViolation,
    ErrDbWriteNotSingleWriter,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArgs => "INVALID_ARGS",
            ErrorCode::NotIndexed => "NOT_INDEXED",
            ErrorCode::RepoNotFound => "REPO_NOT_FOUND",
            ErrorCode::ErrRootOutOfScope => "ERR_ROOT_OUT_OF_SCOPE",
            ErrorCode::IoError => "IO_ERROR",
            ErrorCode::DbError => "DB_ERROR",
            ErrorCode::ErrEngineNotInstalled => "ERR_ENGINE_NOT_INSTALLED",
            ErrorCode::ErrEngineInit => "ERR_ENGINE_INIT",
            ErrorCode::ErrEngineQuery => "ERR_ENGINE_QUERY",
            ErrorCode::ErrEngineIndex => "ERR_ENGINE_INDEX",
            ErrorCode::ErrEngineUnavailable => "ERR_ENGINE_UNAVAILABLE",
            ErrorCode::ErrEngineRebuild => "ERR_ENGINE_REBUILD",
            ErrorCode::BudgetExceeded => "BUDGET_EXCEEDED",
            ErrorCode::BudgetSoftLimit => "BUDGET_SOFT_LIMIT",
            ErrorCode::BudgetHardLimit => "BUDGET_HARD_LIMIT",
            ErrorCode::SoftLimit => "SOFT_LIMIT",
            ErrorCode::SearchFirstRequired => "SEARCH_FIRST_REQUIRED",
            ErrorCode::SearchRefRequired => "SEARCH_REF_REQUIRED",
            ErrorCode::CandidateRefRequired => "CANDIDATE_REF_REQUIRED",
            ErrorCode::LowRelevance => "LOW_RELEVANCE",
            ErrorCode::VersionConflict => "VERSION_CONFLICT",
            ErrorCode::ErrDaemonSingletonViolation => "ERR_DAEMON_SINGLETON_VIOLATION",
            ErrorCode::ErrDbWriteNotSingleWriter => "ERR_DB_WRITE_NOT_SINGLE_WRITER",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    /// Whether the daemon must stop when this error surfaces.
    ///
    /// Lifecycle invariant breaches are fatal; everything else is isolated
    /// to the failing request or file.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorCode::ErrDaemonSingletonViolation | ErrorCode::ErrDbWriteNotSingleWriter
        )
    }
}

/// Concrete follow-up the client should take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAction {
    ReRead,
    FixArgs,
    SearchSymbol,
    AdjustOldText,
    Reindex,
    Retry,
}

/// Reason codes attached to `ERR_ENGINE_UNAVAILABLE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineUnavailableReason {
    NotInstalled,
    IndexMissing,
    ConfigMismatch,
    EngineMismatch,
    RollbackMode,
}

/// Error type crossing the tool/gateway boundary.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct SariError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_action: Option<ClientAction>,
}

impl SariError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            hint: None,
            client_action: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_action(mut self, action: ClientAction) -> Self {
        self.client_action = Some(action);
        self
    }

    /// Invalid arguments with a per-parameter hint.
    pub fn invalid_args(param: &str, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::InvalidArgs,
            format!("invalid argument '{param}': {}", detail.into()),
        )
        .with_action(ClientAction::FixArgs)
    }

    pub fn not_indexed(target: &str) -> Self {
        Self::new(
            ErrorCode::NotIndexed,
            format!("'{target}' is outside the indexed scope"),
        )
        .with_hint("use search to narrow scope, or run: sari rescan")
    }

    pub fn engine_unavailable(reason: EngineUnavailableReason) -> Self {
        let hint = match reason {
            EngineUnavailableReason::NotInstalled => "run: sari engine install",
            EngineUnavailableReason::IndexMissing => "run: sari engine rebuild",
            EngineUnavailableReason::ConfigMismatch => "run: sari engine rebuild",
            EngineUnavailableReason::EngineMismatch => "run: sari engine verify",
            EngineUnavailableReason::RollbackMode => "wait for rollback to settle, then retry",
        };
        Self::new(
            ErrorCode::ErrEngineUnavailable,
            format!("text engine unavailable: {reason:?}"),
        )
        .with_hint(hint)
    }

    /// Map an internal error into the IO/DB bucket with a generic hint.
    pub fn from_internal(err: &anyhow::Error) -> Self {
        let code = if err.downcast_ref::<std::io::Error>().is_some() {
            ErrorCode::IoError
        } else {
            ErrorCode::DbError
        };
        Self::new(code, err.to_string()).with_hint("run: sari doctor")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_wire_names() {
        assert_eq!(
            ErrorCode::ErrDbWriteNotSingleWriter.as_str(),
            "ERR_DB_WRITE_NOT_SINGLE_WRITER"
        );
        assert_eq!(ErrorCode::SearchRefRequired.as_str(), "SEARCH_REF_REQUIRED");
        // serde and as_str must agree
        let json = serde_json::to_string(&ErrorCode::ErrRootOutOfScope).expect("serialize");
        assert_eq!(json, "\"ERR_ROOT_OUT_OF_SCOPE\"");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ErrorCode::ErrDaemonSingletonViolation.is_fatal());
        assert!(ErrorCode::ErrDbWriteNotSingleWriter.is_fatal());
        assert!(!ErrorCode::InvalidArgs.is_fatal());
        assert!(!ErrorCode::ErrEngineUnavailable.is_fatal());
    }

    #[test]
    fn test_builders_attach_hint_and_action() {
        let err = SariError::invalid_args("limit", "must be a number");
        assert_eq!(err.code, ErrorCode::InvalidArgs);
        assert_eq!(err.client_action, Some(ClientAction::FixArgs));

        let err = SariError::engine_unavailable(EngineUnavailableReason::IndexMissing);
        assert!(err.hint.as_deref().unwrap_or("").contains("rebuild"));
    }
}
