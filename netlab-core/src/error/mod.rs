//! Error handling for netlab
//!
//! One error enum covers the whole crate. Pre-flight errors abort a run
//! before anything is created; phase errors are recovered per node and end up
//! in the deployment report; wiring errors are recovered per link.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                     netlab error taxonomy                      │
//! ├────────────────────────────────────────────────────────────────┤
//! │  Pre-flight           │  Per-node phase        │  Per-link     │
//! │  • DuplicateKind      │  • ConditionCheckFailed│  • NamespaceGone
//! │  • UnknownKind        │  • PreDeploy           │  • Wiring     │
//! │  • CycleDetected      │  • Deploy              │  • AlreadyWired
//! │  • UnknownWaitFor...  │  • PostDeploy          │  • InterfaceNameInvalid
//! │                       │  • ReadinessTimeout    │               │
//! └────────────────────────────────────────────────────────────────┘
//! ```

mod constructors;
mod types;

pub use types::{NetlabError, NetlabResult};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::Phase;

    #[test]
    fn test_for_phase_wraps_plain_errors() {
        let err = NetlabError::for_phase(
            Phase::CheckConditions,
            "spine",
            NetlabError::internal("license missing"),
        );
        assert_eq!(err.phase(), Some(Phase::CheckConditions));
        assert!(err.to_string().contains("spine"));
        assert!(err.to_string().contains("license missing"));
    }

    #[test]
    fn test_for_phase_keeps_existing_classification() {
        let inner = NetlabError::for_phase(Phase::Deploy, "r1", NetlabError::internal("boom"));
        let outer = NetlabError::for_phase(Phase::PostDeploy, "r1", inner);
        assert_eq!(outer.phase(), Some(Phase::Deploy));
    }

    #[test]
    fn test_wiring_preserves_errno() {
        let err = NetlabError::wiring(
            "r1:eth1__r2:eth1",
            NetlabError::netlink("link add", 17, "File exists"),
        );
        assert_eq!(err.errno(), Some(17));
        assert!(matches!(err, NetlabError::Wiring { .. }));
    }

    #[test]
    fn test_wiring_passes_namespace_gone_through() {
        let err = NetlabError::wiring(
            "r1:eth1__r2:eth1",
            NetlabError::NamespaceGone {
                node: "r1".into(),
                path: "/proc/1/ns/net".into(),
            },
        );
        assert!(matches!(err, NetlabError::NamespaceGone { .. }));
    }

    #[test]
    fn test_unknown_kind_lists_supported() {
        let err = NetlabError::UnknownKind {
            kind: "foo".into(),
            supported: vec!["bridge".into(), "linux".into()],
        };
        assert_eq!(
            err.to_string(),
            "kind \"foo\" is not supported. Supported kinds are [\"bridge\", \"linux\"]"
        );
        assert!(err.is_preflight());
    }
}
