//! Property-based tests for stage ordering across nodes

mod common;

use common::{fast_config, scripted, TestLab};
use netlab_core::node::NodeConfig;
use netlab_core::stages::{Stage, Stages};
use netlab_core::test_helpers::EventKind;
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

// Per-hook delays in milliseconds for one node
fn delays_strategy() -> impl Strategy<Value = (u64, u64, u64)> {
    (0u64..20, 0u64..20, 0u64..20)
}

fn with_delays(cfg: NodeConfig, (check, pre, deploy): (u64, u64, u64)) -> NodeConfig {
    cfg.with_extra(
        "delay-ms",
        serde_json::json!({
            "check-deployment-conditions": check,
            "pre-deploy": pre,
            "deploy": deploy,
        }),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn test_waiting_node_starts_after_dependencies(
        a in delays_strategy(),
        b in delays_strategy(),
        c in delays_strategy(),
        workers in 0usize..3,
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let t = TestLab::new();
        let stages = Stages::default()
            .with_wait_for(Stage::Create, "a", Stage::Create)
            .with_wait_for(Stage::Create, "b", Stage::Create);
        let lab = t
            .lab("order")
            .with_node(with_delays(scripted("a"), a))
            .with_node(with_delays(scripted("b"), b))
            .with_node(with_delays(scripted("c"), c).with_stages(stages));

        let orchestrator = t.orchestrator(fast_config().with_max_workers(workers));
        let deployment = runtime
            .block_on(orchestrator.deploy(&lab, CancellationToken::new()))
            .unwrap();
        prop_assert!(deployment.report().is_success());

        let c_pre_deploy = t.log.position("c", "pre-deploy", EventKind::Start).unwrap();
        for dependency in ["a", "b"] {
            let deployed = t.log.position(dependency, "deploy", EventKind::End).unwrap();
            prop_assert!(
                deployed < c_pre_deploy,
                "c started pre-deploy before {} finished deploy",
                dependency
            );
        }
        // nothing of c ran before its conditions were checked
        let c_check = t
            .log
            .position("c", "check-deployment-conditions", EventKind::End)
            .unwrap();
        prop_assert!(c_check < c_pre_deploy);
    }

    #[test]
    fn test_chain_deploys_in_order(len in 2usize..6) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let t = TestLab::new();
        let mut lab = t.lab("chain");
        for i in 0..len {
            let mut cfg = scripted(&format!("n{}", i));
            if i > 0 {
                cfg = cfg.with_stages(Stages::default().with_wait_for(
                    Stage::Create,
                    format!("n{}", i - 1),
                    Stage::Healthy,
                ));
            }
            lab = lab.with_node(cfg);
        }

        let deployment = runtime
            .block_on(t.orchestrator(fast_config()).deploy(&lab, CancellationToken::new()))
            .unwrap();
        prop_assert!(deployment.report().is_success());

        let starts: Vec<usize> = (0..len)
            .map(|i| t.log.position(&format!("n{}", i), "deploy", EventKind::Start).unwrap())
            .collect();
        prop_assert!(starts.windows(2).all(|w| w[0] < w[1]));
    }
}
