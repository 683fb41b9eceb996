mod support;

use ckv_client::{key_slot, ErrorKind, Expiry};

#[test]
fn keys_land_on_their_slot_owner() {
    let cluster = support::cluster(3);
    let client = support::cluster_client(&cluster);

    for node in 0..3 {
        let key = support::key_on(&cluster, node, "item:");
        client.set(&key, &node, Expiry::Never).unwrap();
        assert!(cluster.node(node).with_store(|store| store.exists(key.as_bytes())));
        assert_eq!(client.get::<usize>(&key).unwrap(), Some(node));
    }
}

#[test]
fn bulk_operations_span_every_node() {
    let cluster = support::cluster(3);
    let client = support::cluster_client(&cluster);

    let items: Vec<(String, usize)> = (0..1000).map(|i| (format!("bulk:{i}"), i)).collect();
    assert!(client.set_many(&items, Expiry::Never).unwrap().is_empty());
    let stored: usize = cluster.nodes().iter().map(|n| n.with_store(|s| s.len())).sum();
    assert_eq!(stored, 1000);
    assert!(cluster.nodes().iter().all(|n| n.with_store(|s| s.len()) > 0));

    let keys = ["bulk:7", "missing", "bulk:999", "bulk:0"];
    let values: Vec<Option<usize>> = client.get_many(&keys).unwrap();
    assert_eq!(values, vec![Some(7), None, Some(999), Some(0)]);

    assert_eq!(client.keys("bulk:1*").unwrap().len(), 111);
    let walked = client.iter_keys("bulk:*", Some(50)).count();
    assert_eq!(walked, 1000);
    assert_eq!(client.delete_many(&keys).unwrap(), 3);
    assert_eq!(client.delete_pattern("bulk:*").unwrap(), 997);
}

#[test]
fn moved_slots_are_followed_and_the_map_rebuilt() {
    let cluster = support::cluster(2);
    let client = support::cluster_client(&cluster);

    let key = support::key_on(&cluster, 0, "moving:");
    client.set(&key, "v", Expiry::Never).unwrap();
    cluster.move_slot(key_slot(key.as_bytes()), 1);

    assert_eq!(client.get::<String>(&key).unwrap(), Some("v".into()));
    assert_eq!(cluster.node(1).commands_named("GET").len(), 1);

    cluster.node(0).clear_log();
    assert_eq!(client.get::<String>(&key).unwrap(), Some("v".into()));
    assert!(cluster.node(0).commands_named("GET").is_empty());
    assert_eq!(cluster.node(1).commands_named("GET").len(), 2);
}

#[test]
fn ask_redirects_reach_the_importing_node() {
    let cluster = support::cluster(2);
    let client = support::cluster_client(&cluster);

    let tag = support::key_on(&cluster, 0, "tag");
    let old = format!("{{{tag}}}:old");
    let new = format!("{{{tag}}}:new");
    client.set(&old, &1, Expiry::Never).unwrap();

    let slot = key_slot(tag.as_bytes());
    cluster.migrate_slot(slot, 1);
    assert_eq!(client.get::<i64>(&old).unwrap(), Some(1));
    client.set(&new, &2, Expiry::Never).unwrap();
    assert!(cluster.node(1).with_store(|s| s.exists(new.as_bytes())));
    assert!(!cluster.node(1).commands_named("ASKING").is_empty());

    cluster.finish_migration(slot);
    assert_eq!(client.get::<i64>(&new).unwrap(), Some(2));
}

#[test]
fn transactions_must_stay_in_one_slot() {
    let cluster = support::cluster(3);
    let client = support::cluster_client(&cluster);

    let mut spread = client.transaction();
    spread.set("a", &1, Expiry::Never).unwrap();
    spread.set("b", &2, Expiry::Never).unwrap();
    let err = client.execute(&spread).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Topology);
    assert_eq!(err.keys(), ["a".to_string(), "b".to_string()]);

    let mut tagged = client.transaction();
    tagged.set("{cart}:items", &3, Expiry::Never).unwrap();
    tagged.incr("{cart}:items", 1).incr("{cart}:version", 1);
    let results = client.execute(&tagged).unwrap();
    assert_eq!(results.integer(1).unwrap(), 4);
    assert_eq!(results.integer(2).unwrap(), 1);
    let owner = cluster.owner_of("{cart}");
    assert_eq!(cluster.node(owner).commands_named("EXEC").len(), 1);
}

#[test]
fn plain_pipelines_fan_out_per_node() {
    let cluster = support::cluster(3);
    let client = support::cluster_client(&cluster);

    let keys: Vec<String> = (0..3).map(|n| support::key_on(&cluster, n, "p:")).collect();
    let mut pipeline = client.pipeline();
    for (i, key) in keys.iter().enumerate() {
        pipeline.set(key, &i, Expiry::Never).unwrap();
    }
    for key in &keys {
        pipeline.get(key);
    }
    let results = client.execute(&pipeline).unwrap();
    for i in 0..3 {
        assert_eq!(results.value::<usize>(3 + i).unwrap(), Some(i));
    }
}

#[test]
fn server_side_cross_slot_errors_are_topology_errors() {
    let cluster = support::cluster(3);
    let client = support::cluster_client(&cluster);

    let a = support::key_on(&cluster, 0, "s:");
    let b = support::key_on(&cluster, 1, "s:");
    let err = client.sinter::<_, String>(&[a, b]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Topology);
}

#[test]
fn cursor_scan_is_refused_but_introspection_fans_out() {
    let cluster = support::cluster(3);
    let client = support::cluster_client(&cluster);

    assert_eq!(client.scan(0, "*", None).unwrap_err().kind(), ErrorKind::NotSupported);

    let info = client.info(Some("server")).unwrap();
    let servers = info.sections.keys().filter(|name| name.ends_with("/server")).count();
    assert_eq!(servers, 3);

    cluster.node(2).add_slowlog_entry(std::time::Duration::from_millis(3), &["KEYS", "*"]);
    assert_eq!(client.slowlog_len().unwrap(), 1);
    client.ping().unwrap();
}
