//! Property-based tests for array bookkeeping invariants.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use proptest::prelude::*;
use tokio_test::block_on;

use fanout_array::backend::pod::{PodPhase, PodStatus};
use fanout_array::cluster::ObjectStatus;
use fanout_array::error_collector::TRUNCATION_MARKER;
use fanout_array::prelude::*;
use fanout_core::{MemoryBackend, OutputPaths};

fn arb_phase() -> impl Strategy<Value = TaskPhase> {
    prop::sample::select(TaskPhase::ALL.to_vec())
}

fn arb_pod_phase() -> impl Strategy<Value = PodPhase> {
    prop::sample::select(vec![
        PodPhase::Pending,
        PodPhase::Running,
        PodPhase::Succeeded,
        PodPhase::Failed,
        PodPhase::Unknown,
    ])
}

proptest! {
    #[test]
    fn summary_moves_preserve_total(
        initial in prop::collection::vec(arb_phase(), 1..50),
        moves in prop::collection::vec((any::<prop::sample::Index>(), arb_phase()), 0..50),
    ) {
        let mut phases = initial.clone();
        let mut summary: ArraySummary = initial.iter().map(|p| (*p, 1)).collect();

        for (index, to) in moves {
            let slot = index.index(phases.len());
            summary.dec(phases[slot]);
            summary.inc(to);
            phases[slot] = to;
        }

        prop_assert_eq!(summary.total(), phases.len() as i64);
        for phase in TaskPhase::ALL {
            let expected = phases.iter().filter(|p| **p == phase).count() as i64;
            prop_assert_eq!(summary.count(phase), expected);
        }
        prop_assert!(summary.iter().all(|(_, count)| count != 0));
    }

    #[test]
    fn zero_delta_is_a_no_op(entries in prop::collection::vec((arb_phase(), 1i64..10), 0..9), phase in arb_phase()) {
        let mut summary: ArraySummary = entries.into_iter().collect();
        let before = summary.clone();
        summary.inc_by_count(phase, 0);
        prop_assert_eq!(summary, before);
    }

    #[test]
    fn merge_makes_equal_and_is_idempotent(
        left in prop::collection::vec((arb_phase(), 1i64..10), 0..9),
        right in prop::collection::vec((arb_phase(), 1i64..10), 0..9),
    ) {
        let mut target: ArraySummary = left.into_iter().collect();
        let source: ArraySummary = right.into_iter().collect();

        target.merge_from(&source);
        prop_assert_eq!(&target, &source);
        prop_assert!(!target.merge_from(&source));
    }

    #[test]
    fn compact_array_stores_what_was_set(
        max_value in 1u64..100_000,
        writes in prop::collection::vec((any::<prop::sample::Index>(), any::<u64>()), 1..100),
        count in 1usize..200,
    ) {
        let mut array = CompactArray::new(count, max_value);
        let mut model = vec![0u64; count];

        for (index, raw) in writes {
            let slot = index.index(count);
            let value = raw % (max_value + 1);
            array.set_item(slot, value);
            model[slot] = value;
        }

        prop_assert_eq!(array.get_items(), model);
        prop_assert!(array.max_value() >= max_value);
    }

    #[test]
    fn collector_summary_respects_cap(
        messages in prop::collection::vec("[a-zé ]{0,40}", 0..30),
        max_length in 0usize..300,
    ) {
        let mut collector = ErrorMessageCollector::new();
        for (index, message) in messages.iter().enumerate() {
            collector.collect(index, message.clone());
        }

        let summary = collector.summary(max_length);
        prop_assert!(summary.len() <= max_length);

        let full = collector.summary(usize::MAX);
        if full.len() <= max_length {
            prop_assert_eq!(summary, full);
        } else if max_length >= TRUNCATION_MARKER.len() {
            prop_assert!(summary.ends_with(TRUNCATION_MARKER));
        }
    }

    #[test]
    fn round_summary_covers_every_index(pod_phases in prop::collection::vec(arb_pod_phase(), 1..20)) {
        let size = pod_phases.len();
        let store = Arc::new(MemoryBackend::new());
        let ctx = InMemoryTaskContext::new(
            "exec",
            "ns",
            OutputPaths::new("mem://bucket/exec").unwrap(),
            store,
        )
        .with_template(TaskTemplate {
            task_type: "container".into(),
            output_variables: Vec::new(),
            array: ArrayJob::new(size),
        });
        let executor = ArrayExecutor::new(ArrayConfig::default()).unwrap();
        let client = InMemoryClusterClient::new();
        let resources = InMemoryResourceManager::new();

        let state = block_on(async {
            let mut state = ArrayState::default();
            for _ in 0..2 {
                state = executor.handle(&ctx, &client, &resources, &state).await?.state;
            }
            for (index, phase) in pod_phases.iter().enumerate() {
                let key = ObjectKey::new(ObjectKind::Pod, "ns", format!("exec-{index}"));
                client.set_status(
                    &key,
                    ObjectStatus::Pod(PodStatus { phase: *phase, ..PodStatus::default() }),
                );
            }
            executor.handle(&ctx, &client, &resources, &state).await.map(|t| t.state)
        })
        .unwrap();

        prop_assert_eq!(state.array_status.summary.total(), size as i64);
        for (index, phase) in pod_phases.iter().enumerate() {
            let undefined = state.array_status.phase_at(index) == TaskPhase::Undefined;
            prop_assert_eq!(undefined, *phase == PodPhase::Unknown);
        }
        let successes = pod_phases.iter().filter(|p| **p == PodPhase::Succeeded).count();
        prop_assert_eq!(
            state.array_status.summary.count(TaskPhase::Success),
            successes as i64
        );
    }
}
