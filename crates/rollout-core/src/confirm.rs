use crate::error::{Result, RolloutError};

/// Operator confirmation for a destructive operation: the domain typed out.
///
/// Consumed by the operation that checks it, so every invocation needs a
/// fresh one and nothing can retry a destructive step with a stale token.
#[derive(Debug)]
pub struct Confirmation(String);

impl Confirmation {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Fail unless a confirmation was given and it names `domain`.
    pub fn require(confirmation: Option<Confirmation>, domain: &str, operation: &str) -> Result<()> {
        match confirmation {
            None => Err(RolloutError::ConfirmationRequired {
                operation: operation.to_string(),
            }),
            Some(Confirmation(token)) if token == domain => Ok(()),
            Some(_) => Err(RolloutError::ConfirmationMismatch(domain.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirmation_must_name_the_domain() {
        assert!(matches!(
            Confirmation::require(None, "api.example.com", "destructive reset"),
            Err(RolloutError::ConfirmationRequired { .. })
        ));
        assert!(matches!(
            Confirmation::require(
                Some(Confirmation::new("front.example.com")),
                "api.example.com",
                "restore"
            ),
            Err(RolloutError::ConfirmationMismatch(_))
        ));
        Confirmation::require(
            Some(Confirmation::new("api.example.com")),
            "api.example.com",
            "restore",
        )
        .unwrap();
    }
}
