//! Typed error hierarchy for the dashboard core.
//!
//! `DashboardError` covers the four user-facing failure classes (validation,
//! write rejection, access denied, transport) plus the local conditions the
//! data-access layer can hit.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DashboardError {
    /// Rejected before any network call.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("The default column cannot be deleted")]
    DefaultColumnProtected,

    #[error("Write rejected ({status}): {message}")]
    WriteRejected { status: u16, message: String },

    #[error("Access denied")]
    AccessDenied,

    #[error("Network error: {0}")]
    Transport(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("'{0}' is already in progress")]
    MutationInFlight(String),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DashboardError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// True for errors raised before anything left the process.
    pub fn is_client_side(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::DefaultColumnProtected | Self::MutationInFlight(_)
        )
    }
}

impl From<reqwest::Error> for DashboardError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => Self::WriteRejected {
                status: status.as_u16(),
                message: e.to_string(),
            },
            None => Self::Transport(e.to_string()),
        }
    }
}

pub type DashboardResult<T> = Result<T, DashboardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_carries_entity_and_id() {
        let err = DashboardError::not_found("Lead", 42);
        match &err {
            DashboardError::NotFound { entity, id } => {
                assert_eq!(*entity, "Lead");
                assert_eq!(id, "42");
            }
            _ => panic!("Expected NotFound"),
        }
        assert_eq!(err.to_string(), "Lead 42 not found");
    }

    #[test]
    fn write_rejected_message_includes_status() {
        let err = DashboardError::WriteRejected {
            status: 502,
            message: "bad gateway".into(),
        };
        assert!(err.to_string().contains("502"));
        assert!(err.to_string().contains("bad gateway"));
    }

    #[test]
    fn client_side_errors_are_flagged() {
        assert!(DashboardError::Validation("name".into()).is_client_side());
        assert!(DashboardError::DefaultColumnProtected.is_client_side());
        assert!(DashboardError::MutationInFlight("delete_lead".into()).is_client_side());
        assert!(!DashboardError::AccessDenied.is_client_side());
        assert!(!DashboardError::Transport("reset".into()).is_client_side());
    }

    #[test]
    fn anyhow_converts_into_other() {
        let err: DashboardError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, DashboardError::Other(_)));
    }

    #[test]
    fn dashboard_error_implements_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&DashboardError::AccessDenied);
    }
}
