// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the ORM runtime.
///
/// Reads rejected by a policy deliberately surface as `NotFound` (or an empty
/// result) instead of `Policy` so that callers cannot probe for the existence
/// of rows they are not allowed to see. Writes surface `Policy` directly.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid arguments for `{operation}` at `{path}`: {message}")]
    Validation {
        operation: String,
        path: String,
        message: String,
    },

    #[error("no `{model}` record matched the given criteria")]
    NotFound { model: String },

    #[error("`{operation}` on `{model}` denied by policy")]
    Policy { model: String, operation: String },

    #[error("constraint violated on `{model}` ({fields:?}): {message}")]
    Constraint {
        model: String,
        fields: Vec<String>,
        message: String,
    },

    /// Invariant violation inside the runtime. Never a user error.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("database error: {message}")]
    Driver {
        message: String,
        /// The compiled SQL that was being executed, for diagnostics.
        sql: Option<String>,
    },
}

impl Error {
    pub fn validation(operation: impl Into<String>, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            operation: operation.into(),
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn not_found(model: impl Into<String>) -> Self {
        Self::NotFound {
            model: model.into(),
        }
    }

    pub fn policy(model: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Policy {
            model: model.into(),
            operation: operation.into(),
        }
    }

    /// Whether an outer layer may reasonably retry the whole call. The core
    /// itself never retries.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Driver { message, .. } => {
                // Serialization failures and deadlocks; Postgres codes 40001/40P01,
                // SQLite "database is locked".
                message.contains("40001")
                    || message.contains("40P01")
                    || message.contains("deadlock")
                    || message.contains("database is locked")
            }
            _ => false,
        }
    }
}

/// Wraps a database-reported error, attaching the SQL that produced it and
/// recognizing constraint violations where the driver exposes them.
pub(crate) fn from_sqlx(err: sqlx::Error, model: &str, sql: Option<&str>) -> Error {
    match &err {
        sqlx::Error::RowNotFound => Error::not_found(model),
        sqlx::Error::Database(db_err) => {
            let message = db_err.message().to_owned();
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            let is_constraint = code == "23505"
                || code == "23503"
                || code == "2067"
                || code == "1555"
                || code == "787"
                || message.contains("UNIQUE constraint")
                || message.contains("FOREIGN KEY constraint");
            if is_constraint {
                Error::Constraint {
                    model: model.to_owned(),
                    fields: fields_from_message(&message),
                    message,
                }
            } else {
                Error::Driver {
                    message,
                    sql: sql.map(str::to_owned),
                }
            }
        }
        _ => Error::Driver {
            message: err.to_string(),
            sql: sql.map(str::to_owned),
        },
    }
}

/// Best-effort extraction of the offending columns from a driver message,
/// e.g. SQLite's `UNIQUE constraint failed: User.email`.
fn fields_from_message(message: &str) -> Vec<String> {
    let Some(tail) = message.split("failed: ").nth(1) else {
        return vec![];
    };
    tail.split(',')
        .filter_map(|part| part.trim().split('.').nth(1))
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_from_message() {
        assert_eq!(
            fields_from_message("UNIQUE constraint failed: User.email, User.name"),
            vec!["email".to_owned(), "name".to_owned()]
        );
        assert!(fields_from_message("some other error").is_empty());
    }

    #[test]
    fn test_retryable() {
        let err = Error::Driver {
            message: "ERROR: 40001 could not serialize access".into(),
            sql: None,
        };
        assert!(err.is_retryable());
        assert!(!Error::not_found("User").is_retryable());
    }
}
