//! Property tests: structural guarantees of the pipeline on random synthetic sequences.

use mitotrack_core::TrackTable;
use mitotrack_sim::scenarios::ScenarioId;
use mitotrack_sim::ScenarioRunner;
use proptest::prelude::*;

fn scenario_strategy() -> impl Strategy<Value = ScenarioId> {
    (0usize..ScenarioId::all().len()).prop_map(|i| ScenarioId::all()[i])
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_graph_stays_consistent(seed in 1u64..10_000, scenario in scenario_strategy(), frames in 16usize..32) {
        let runner = ScenarioRunner::new(seed).with_frames(frames);
        let (_, output) = runner.execute(scenario).unwrap();

        prop_assert!(output.violations.is_empty(), "{:?}", output.violations);
        for node in output.graph.nodes() {
            prop_assert!(output.graph.out_degree(*node) <= 2);
            prop_assert!(output.graph.in_degree(*node) <= 1);
        }
    }

    #[test]
    fn prop_track_table_round_trips(seed in 1u64..10_000, scenario in scenario_strategy()) {
        let runner = ScenarioRunner::new(seed).with_frames(24);
        let (_, output) = runner.execute(scenario).unwrap();

        let table = &output.export.table;
        prop_assert!(table.validate().is_ok());

        let reparsed = TrackTable::parse(&table.to_text()).unwrap();
        prop_assert_eq!(reparsed.rebuild_tracks(), table.rebuild_tracks());
        prop_assert_eq!(&reparsed, table);
    }

    #[test]
    fn prop_every_component_gets_a_track(seed in 1u64..10_000, scenario in scenario_strategy()) {
        let runner = ScenarioRunner::new(seed).with_frames(20);
        let (_, output) = runner.execute(scenario).unwrap();

        for (node, _) in output.stack.iter() {
            let id = output.export.track_of(node);
            prop_assert!(id.is_some());
            let row = output.export.table.get(id.unwrap_or(0));
            prop_assert!(row.map_or(false, |r| r.start_frame <= node.frame && node.frame <= r.end_frame));
        }
    }
}

#[test]
fn test_same_seed_same_table_across_scenarios() {
    for scenario in ScenarioId::all() {
        let a = ScenarioRunner::new(11).with_frames(20).execute(scenario).unwrap();
        let b = ScenarioRunner::new(11).with_frames(20).execute(scenario).unwrap();
        assert_eq!(a.1.export.table, b.1.export.table, "{}", scenario);
    }
}
