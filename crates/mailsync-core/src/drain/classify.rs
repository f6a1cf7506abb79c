//! Outcome classification for executed actions.

use thiserror::Error;

use crate::config::ErrorCodes;
use crate::send::{SendError, SendFailure};
use crate::transport::{ConnectivityKind, TransportError};

/// Why an action handler failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    /// The remote call failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Passphrase or keys are locked locally.
    #[error("Credentials are locked")]
    CredentialsLocked,

    /// The local record the action refers to no longer exists.
    #[error("Target {0} not found")]
    TargetMissing(String),

    /// Reading or writing the replica failed.
    #[error("Replica store error: {0}")]
    Store(String),

    /// The action cannot be carried out as stored.
    #[error("Rejected: {0}")]
    Rejected(String),
}

impl From<crate::Error> for ActionError {
    fn from(err: crate::Error) -> Self {
        match err {
            crate::Error::Transport(e) => Self::Transport(e),
            crate::Error::CredentialsLocked => Self::CredentialsLocked,
            crate::Error::NotFound(id) => Self::TargetMissing(id),
            crate::Error::Crypto(e) => Self::Rejected(e.to_string()),
            other => Self::Store(other.to_string()),
        }
    }
}

impl From<SendFailure> for ActionError {
    fn from(failure: SendFailure) -> Self {
        match failure.error {
            SendError::Transport(e) => Self::Transport(e),
            SendError::CredentialsLocked => Self::CredentialsLocked,
            SendError::MissingDraft(id) => Self::TargetMissing(id),
            SendError::Store(detail) => Self::Store(detail),
            _ => Self::Rejected(failure.to_string()),
        }
    }
}

/// What to do with an action after one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Succeeded; remove it and run its post-effect.
    Complete,
    /// Remove it without further effect.
    Drop,
    /// Remove it and report the failure to diagnostics.
    DropAndReport,
    /// Park it in the failed queue and remove it.
    Park,
    /// Keep it at the head of the queue and end the pass.
    Retain,
    /// Keep it and wait for a human verification.
    HumanCheck,
    /// Keep it and pause until connectivity returns.
    Offline(ConnectivityKind),
    /// Keep it and pause until credentials are unlocked.
    Locked,
}

impl Verdict {
    /// Returns true if the action stays at the head of the queue.
    #[must_use]
    pub const fn keeps_action(&self) -> bool {
        matches!(
            self,
            Self::Retain | Self::HumanCheck | Self::Offline(_) | Self::Locked
        )
    }
}

/// Map the outcome of one attempt to a verdict.
#[must_use]
pub fn classify(outcome: &Result<(), ActionError>, codes: &ErrorCodes) -> Verdict {
    let error = match outcome {
        Ok(()) => return Verdict::Complete,
        Err(error) => error,
    };

    match error {
        ActionError::Transport(TransportError::Connectivity(kind)) => Verdict::Offline(*kind),
        ActionError::Transport(TransportError::CredentialsLocked) | ActionError::CredentialsLocked => {
            Verdict::Locked
        }
        ActionError::Transport(TransportError::Api { status, code, .. }) => match *status {
            404 => Verdict::Drop,
            500 => Verdict::Park,
            200 if *code == codes.human_verification => Verdict::HumanCheck,
            200 if *code > codes.non_retryable_above || *code < codes.local_below => Verdict::Drop,
            200 => Verdict::Retain,
            _ => Verdict::DropAndReport,
        },
        ActionError::Transport(TransportError::Decode(_)) | ActionError::Rejected(_) => {
            Verdict::DropAndReport
        }
        ActionError::TargetMissing(_) => Verdict::Drop,
        ActionError::Store(_) => Verdict::Retain,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::send::Stage;

    fn api(status: u16, code: i64) -> Result<(), ActionError> {
        Err(TransportError::api(status, code, "boom").into())
    }

    #[test]
    fn test_classification_table() {
        let codes = ErrorCodes::default();
        let cases = [
            (Ok(()), Verdict::Complete),
            (api(404, 2501), Verdict::Drop),
            (api(500, 0), Verdict::Park),
            (api(200, 9001), Verdict::HumanCheck),
            (api(200, 2001), Verdict::Drop),
            (api(200, 150), Verdict::Drop),
            (api(200, 500), Verdict::Retain),
            (api(422, 2001), Verdict::DropAndReport),
            (api(403, 0), Verdict::DropAndReport),
            (
                Err(TransportError::Connectivity(ConnectivityKind::Timeout).into()),
                Verdict::Offline(ConnectivityKind::Timeout),
            ),
            (
                Err(TransportError::Connectivity(ConnectivityKind::NoRoute).into()),
                Verdict::Offline(ConnectivityKind::NoRoute),
            ),
            (Err(TransportError::CredentialsLocked.into()), Verdict::Locked),
            (Err(ActionError::CredentialsLocked), Verdict::Locked),
            (Err(ActionError::TargetMissing("m".into())), Verdict::Drop),
            (Err(ActionError::Store("disk".into())), Verdict::Retain),
            (Err(ActionError::Rejected("bad".into())), Verdict::DropAndReport),
        ];

        for (outcome, expected) in cases {
            assert_eq!(classify(&outcome, &codes), expected, "outcome {outcome:?}");
        }
    }

    #[test]
    fn test_kept_verdicts() {
        assert!(Verdict::Locked.keeps_action());
        assert!(Verdict::Offline(ConnectivityKind::Cancelled).keeps_action());
        assert!(!Verdict::Park.keeps_action());
        assert!(!Verdict::DropAndReport.keeps_action());
    }

    #[test]
    fn test_send_failure_conversion() {
        let offline = SendFailure {
            stage: Stage::ResolveRecipientKeys,
            reached: vec![Stage::LoadDraft, Stage::ResolveCredentials, Stage::ResolveRecipientKeys],
            error: SendError::Transport(TransportError::Connectivity(ConnectivityKind::NoRoute)),
        };
        assert_eq!(
            ActionError::from(offline),
            ActionError::Transport(TransportError::Connectivity(ConnectivityKind::NoRoute))
        );

        let locked = SendFailure {
            stage: Stage::ResolveCredentials,
            reached: vec![Stage::LoadDraft, Stage::ResolveCredentials],
            error: SendError::CredentialsLocked,
        };
        assert_eq!(ActionError::from(locked), ActionError::CredentialsLocked);

        let mismatch = SendFailure {
            stage: Stage::DecideRecipientPolicy,
            reached: Vec::new(),
            error: SendError::Policy(crate::send::PolicyError::KeyMismatch("bob@example.com".into())),
        };
        assert!(matches!(ActionError::from(mismatch), ActionError::Rejected(_)));
    }
}
