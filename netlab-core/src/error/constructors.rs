//! Constructor methods and classification helpers for NetlabError

use super::types::NetlabError;
use crate::state_machine::Phase;

impl NetlabError {
    /// Create a configuration error with component and message
    ///
    /// # Examples
    /// ```rust
    /// use netlab_core::error::NetlabError;
    ///
    /// let err = NetlabError::configuration("orchestrator.max_workers", "must not exceed 1024");
    /// assert!(err.to_string().contains("orchestrator.max_workers"));
    /// ```
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        NetlabError::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create a runtime collaborator error
    pub fn runtime(operation: impl Into<String>, details: impl Into<String>) -> Self {
        NetlabError::Runtime {
            operation: operation.into(),
            details: details.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        NetlabError::Internal {
            message: message.into(),
        }
    }

    /// Create a netlink error carrying the kernel errno
    pub fn netlink(operation: impl Into<String>, errno: i32, message: impl Into<String>) -> Self {
        NetlabError::Netlink {
            operation: operation.into(),
            errno,
            message: message.into(),
        }
    }

    /// Create an interface naming error
    pub fn interface_invalid(
        node: impl Into<String>,
        interface: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        NetlabError::InterfaceNameInvalid {
            node: node.into(),
            interface: interface.into(),
            reason: reason.into(),
        }
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        NetlabError::Cancelled {
            operation: operation.into(),
        }
    }

    /// Wrap a hook error into the error of the phase it happened in.
    ///
    /// Errors that already carry a phase classification (or a readiness
    /// timeout, or a cancellation) are passed through untouched.
    pub fn for_phase(phase: Phase, node: impl Into<String>, source: NetlabError) -> Self {
        if source.phase().is_some() || source.is_cancelled() {
            return source;
        }
        let node = node.into();
        let source = Box::new(source);
        match phase {
            Phase::CheckConditions => NetlabError::ConditionCheckFailed { node, source },
            Phase::PreDeploy => NetlabError::PreDeploy { node, source },
            Phase::Deploy => NetlabError::Deploy { node, source },
            Phase::PostDeploy | Phase::Readiness => NetlabError::PostDeploy { node, source },
            Phase::Init | Phase::Delete => *source,
        }
    }

    /// Wrap a netlink or runtime error raised while wiring `link`.
    pub fn wiring(link: impl Into<String>, source: NetlabError) -> Self {
        match source {
            e @ (NetlabError::NamespaceGone { .. }
            | NetlabError::AlreadyWired { .. }
            | NetlabError::InterfaceNameInvalid { .. }
            | NetlabError::Wiring { .. }) => e,
            other => NetlabError::Wiring {
                link: link.into(),
                errno: other.errno().unwrap_or(0),
                source: Box::new(other),
            },
        }
    }

    /// The phase classification of a node failure, if any
    pub fn phase(&self) -> Option<Phase> {
        match self {
            NetlabError::ConditionCheckFailed { .. } => Some(Phase::CheckConditions),
            NetlabError::PreDeploy { .. } => Some(Phase::PreDeploy),
            NetlabError::Deploy { .. } => Some(Phase::Deploy),
            NetlabError::PostDeploy { .. } => Some(Phase::PostDeploy),
            NetlabError::ReadinessTimeout { .. } => Some(Phase::Readiness),
            _ => None,
        }
    }

    /// Kernel errno preserved by netlink and wiring errors
    pub fn errno(&self) -> Option<i32> {
        match self {
            NetlabError::Netlink { errno, .. } | NetlabError::Wiring { errno, .. } => Some(*errno),
            NetlabError::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }

    /// Errors that abort a run before any node unit starts
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            NetlabError::DuplicateKind { .. }
                | NetlabError::UnknownKind { .. }
                | NetlabError::CycleDetected { .. }
                | NetlabError::UnknownWaitForTarget { .. }
                | NetlabError::UnknownStage { .. }
                | NetlabError::Configuration { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, NetlabError::Cancelled { .. })
    }
}
