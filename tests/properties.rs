use std::collections::{BTreeMap, BTreeSet};

use clinic_snapshot_lib::discovery::{topological_order, DiscoveryError, TableDiscoveryService};
use clinic_snapshot_lib::import::RestoreOptions;
use clinic_snapshot_lib::snapshot::pack_bundle;
use clinic_snapshot_lib::snapshot::{compute_checksums, table_checksum};
use proptest::prelude::*;
use serde_json::{json, Value};

mod util;

use util::{created_by, export_request, seed_clinic, seed_demo, temp_pool, Engine};

/// Random acyclic dependency graph: table `i` may only depend on tables with
/// a smaller index. Names are shuffled so index order does not leak into the
/// alphabetical tie-breaking.
fn acyclic_graph() -> impl Strategy<Value = BTreeMap<String, BTreeSet<String>>> {
    (2usize..14)
        .prop_flat_map(|n| {
            (
                Just(n),
                proptest::collection::vec(any::<bool>(), n * n),
                Just((0..n).collect::<Vec<_>>()).prop_shuffle(),
            )
        })
        .prop_map(|(n, edges, names)| {
            let name = |i: usize| format!("t{:02}", names[i]);
            let mut graph = BTreeMap::new();
            for i in 0..n {
                let deps: BTreeSet<String> = (0..i)
                    .filter(|&j| edges[i * n + j])
                    .map(name)
                    .collect();
                graph.insert(name(i), deps);
            }
            graph
        })
}

fn rows() -> impl Strategy<Value = Vec<Value>> {
    proptest::collection::btree_set(0u32..10_000, 0..40).prop_map(|ids| {
        ids.into_iter()
            .map(|id| json!({"id": format!("row-{id}"), "clinic_id": "c1", "amount_cents": id * 3}))
            .collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

    #[test]
    fn every_table_follows_its_dependencies(graph in acyclic_graph()) {
        let order = topological_order(&graph).unwrap();
        prop_assert_eq!(order.len(), graph.len());
        let position: BTreeMap<&str, usize> =
            order.iter().enumerate().map(|(i, t)| (t.as_str(), i)).collect();
        for (table, deps) in &graph {
            for dep in deps {
                prop_assert!(position[dep.as_str()] < position[table.as_str()]);
            }
        }
        // Deterministic for a given graph.
        prop_assert_eq!(topological_order(&graph).unwrap(), order);
    }

    #[test]
    fn a_back_edge_is_always_a_cycle(graph in acyclic_graph()) {
        let mut graph = graph;
        let Some((child, parent)) = graph
            .iter()
            .find_map(|(t, deps)| deps.iter().next().map(|d| (t.clone(), d.clone())))
        else {
            return Ok(());
        };
        graph.entry(parent.clone()).or_default().insert(child.clone());
        match topological_order(&graph) {
            Err(DiscoveryError::Cycle { tables }) => {
                prop_assert!(tables.contains(&child));
                prop_assert!(tables.contains(&parent));
            }
            other => prop_assert!(false, "expected a cycle, got {:?}", other),
        }
    }

    #[test]
    fn checksums_ignore_row_order(rows in rows(), seed in any::<u64>()) {
        let mut shuffled = rows.clone();
        let len = shuffled.len();
        if len > 1 {
            shuffled.rotate_left((seed as usize) % len);
            shuffled.reverse();
        }
        prop_assert_eq!(table_checksum(&rows), table_checksum(&shuffled));

        let a = compute_checksums(&BTreeMap::from([("expenses".to_string(), rows)]));
        let b = compute_checksums(&BTreeMap::from([("expenses".to_string(), shuffled)]));
        prop_assert_eq!(a, b);
    }

    #[test]
    fn changing_any_row_changes_the_checksum(rows in rows(), pick in any::<usize>()) {
        prop_assume!(!rows.is_empty());
        let mut tampered = rows.clone();
        let index = pick % tampered.len();
        tampered[index]["amount_cents"] = json!(-1);
        prop_assert_ne!(table_checksum(&rows), table_checksum(&tampered));
    }
}

#[tokio::test]
async fn a_cycle_in_the_live_schema_stops_discovery_and_restore() {
    let pool = temp_pool().await;
    seed_clinic(&pool, "ws-1", "clinic-a").await;
    seed_demo(&pool, "clinic-a").await;
    let engine = Engine::new(&pool);
    let bundle = engine.exporter.export(&export_request("clinic-a")).await.unwrap();
    let packed = pack_bundle(&bundle, engine.config.max_bundle_bytes).unwrap();

    // patients -> quotes -> patients
    sqlx::query("ALTER TABLE patients ADD COLUMN last_quote_id TEXT REFERENCES quotes(id)")
        .execute(&pool)
        .await
        .unwrap();
    let discovery = TableDiscoveryService::new(pool.clone());
    match discovery.discover(true).await.unwrap_err() {
        DiscoveryError::Cycle { tables } => {
            assert!(tables.contains(&"patients".to_string()));
            assert!(tables.contains(&"quotes".to_string()));
        }
        other => panic!("unexpected {other:?}"),
    }

    engine.discovery.invalidate().await;
    let result = engine
        .restorer
        .restore(&packed.bytes, "clinic-a", &created_by(), &RestoreOptions::default())
        .await;
    assert!(!result.success);
    assert!(result.errors[0].message.contains("cycle"));
    assert!(result.pre_restore_snapshot_id.is_none());
    assert_eq!(util::count(&pool, "patients", "clinic-a").await, 3);
}
