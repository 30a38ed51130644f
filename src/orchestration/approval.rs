use crate::config::ApprovalSettings;
use crate::orchestration::run_store::Run;
use std::collections::BTreeSet;

/// Decides whether `sender` may approve or deny `run`.
pub trait ApproverPolicy: Send + Sync {
    fn may_decide(&self, run: &Run, sender: &str) -> bool;
}

/// Only the address that requested the run may decide on it.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequesterOnly;

impl ApproverPolicy for RequesterOnly {
    fn may_decide(&self, run: &Run, sender: &str) -> bool {
        run.requested_by == sender
    }
}

/// A fixed set of approver addresses, optionally extended by the requester.
#[derive(Debug, Clone, Default)]
pub struct ApproverList {
    allow_requester: bool,
    approvers: BTreeSet<String>,
}

impl ApproverList {
    pub fn new(allow_requester: bool, approvers: impl IntoIterator<Item = String>) -> Self {
        Self {
            allow_requester,
            approvers: approvers.into_iter().collect(),
        }
    }

    pub fn from_settings(settings: &ApprovalSettings) -> Self {
        Self::new(settings.allow_requester, settings.approvers.iter().cloned())
    }
}

impl ApproverPolicy for ApproverList {
    fn may_decide(&self, run: &Run, sender: &str) -> bool {
        (self.allow_requester && run.requested_by == sender) || self.approvers.contains(sender)
    }
}

impl<F> ApproverPolicy for F
where
    F: Fn(&Run, &str) -> bool + Send + Sync,
{
    fn may_decide(&self, run: &Run, sender: &str) -> bool {
        self(run, sender)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::run_store::RunStatus;
    use crate::shared::RunId;
    use chrono::Utc;

    fn run() -> Run {
        Run {
            run_id: RunId::parse("run-1").expect("run id"),
            job_key: "deploy".to_string(),
            status: RunStatus::AwaitingApproval,
            created_at: Utc::now(),
            requested_by: "alice".to_string(),
            channel_id: "chat".to_string(),
            conversation_id: "ops".to_string(),
        }
    }

    #[test]
    fn requester_only_matches_exact_address() {
        assert!(RequesterOnly.may_decide(&run(), "alice"));
        assert!(!RequesterOnly.may_decide(&run(), "Alice"));
        assert!(!RequesterOnly.may_decide(&run(), "mallory"));
    }

    #[test]
    fn approver_list_can_exclude_requester() {
        let policy = ApproverList::new(false, ["lead".to_string()]);
        assert!(policy.may_decide(&run(), "lead"));
        assert!(!policy.may_decide(&run(), "alice"));

        let with_requester = ApproverList::new(true, ["lead".to_string()]);
        assert!(with_requester.may_decide(&run(), "alice"));
    }

    #[test]
    fn closures_are_policies() {
        let policy = |run: &Run, sender: &str| sender.ends_with("@ops") || run.job_key == "noop";
        assert!(policy.may_decide(&run(), "bob@ops"));
        assert!(!policy.may_decide(&run(), "bob@dev"));
    }
}
