mod support;

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use ckv_client::{CacheOptions, Client, Cmd, ErrorKind, Expiry, KeyType, RespValue, SerializerKind, SetCondition, Ttl};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Profile {
    name: String,
    visits: u32,
    tags: Vec<String>,
}

#[test]
fn values_round_trip_through_the_codec() {
    let server = support::server();
    let client = support::client(&server);

    let profile = Profile {
        name: "ada".into(),
        visits: 3,
        tags: vec!["admin".into()],
    };
    assert!(client.set("user:1", &profile, Expiry::Never).unwrap());
    assert_eq!(client.get::<Profile>("user:1").unwrap(), Some(profile));
    assert_eq!(client.get::<Profile>("user:2").unwrap(), None);
}

#[test]
fn integers_are_stored_as_digits_and_count() {
    let server = support::server();
    let client = support::client(&server);

    client.set("hits", &41, Expiry::Never).unwrap();
    let raw = server.with_store(|store| store.get_str(b"hits")).unwrap();
    assert_eq!(raw, Some(b"41".to_vec()));

    assert_eq!(client.incr("hits", 1).unwrap(), 42);
    assert_eq!(client.decr("hits", 2).unwrap(), 40);
    assert_eq!(client.get::<i64>("hits").unwrap(), Some(40));
}

#[test]
fn incr_on_a_missing_key_is_not_found() {
    let server = support::server();
    let client = support::client(&server);

    let err = client.incr("nope", 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(!client.has_key("nope").unwrap());
}

#[test]
fn zero_timeout_deletes_instead_of_writing() {
    let server = support::server();
    let client = support::client(&server);

    client.set("k", "v", Expiry::Never).unwrap();
    client.set("k", "w", Expiry::After(Duration::ZERO)).unwrap();
    assert!(!client.has_key("k").unwrap());
    assert_eq!(server.commands_named("SET").len(), 1);
}

#[test]
fn incr_handles_values_written_through_a_serializer() {
    let server = support::server();
    let options = support::options(&server)
        .serializers(vec![SerializerKind::MessagePack])
        .build()
        .unwrap();
    let client = Client::new(options).unwrap();

    // MessagePack encodes 5 as the single byte 0x05, which INCRBY refuses.
    server.with_store(|store| store.set_str(b"n", vec![0x05], Some(Duration::from_secs(60))));
    assert_eq!(client.incr("n", 2).unwrap(), 7);
    let raw = server.with_store(|store| store.get_str(b"n")).unwrap();
    assert_eq!(raw, Some(b"7".to_vec()));
    assert!(matches!(client.ttl("n").unwrap(), Ttl::ExpiresIn(_)));
    assert_eq!(client.incr("n", 1).unwrap(), 8);
}

#[test]
fn counter_overflow_is_reported_and_leaves_the_value() {
    let server = support::server();
    let client = support::client(&server);

    client.set("max", &i64::MAX, Expiry::Never).unwrap();
    assert_eq!(client.incr("max", 1).unwrap_err().kind(), ErrorKind::Server);
    assert_eq!(client.get::<i64>("max").unwrap(), Some(i64::MAX));

    client.set("n", &0, Expiry::Never).unwrap();
    assert_eq!(client.decr("n", i64::MIN).unwrap_err().kind(), ErrorKind::Config);
    assert!(server.commands_named("INCRBY").iter().all(|cmd| cmd[1] != "n"));
    assert_eq!(client.get::<i64>("n").unwrap(), Some(0));
}

#[test]
fn conditional_writes_with_zero_timeout_keep_existing_keys() {
    let server = support::server();
    let client = support::client(&server);

    client.set("k", "v", Expiry::Never).unwrap();
    let zero = Expiry::After(Duration::ZERO);
    assert!(!client.set_with_flags("k", "w", zero, SetCondition::IfExists).unwrap());
    assert!(!client.set_with_flags("k", "w", zero, SetCondition::IfMissing).unwrap());
    assert_eq!(client.get::<String>("k").unwrap(), Some("v".into()));
    assert!(server.commands_named("DEL").is_empty());
}

#[test]
fn add_only_writes_missing_keys() {
    let server = support::server();
    let client = support::client(&server);

    assert!(client.add("k", &1, Expiry::Never).unwrap());
    assert!(!client.add("k", &2, Expiry::Never).unwrap());
    assert_eq!(client.get::<i64>("k").unwrap(), Some(1));
}

#[test]
fn expiration_queries_and_updates() {
    let server = support::server();
    let client = support::client(&server);

    client.set("k", "v", Expiry::After(Duration::from_secs(2))).unwrap();
    let remaining = client.pttl("k").unwrap().remaining().unwrap();
    assert!(remaining > Duration::ZERO && remaining <= Duration::from_secs(2));
    assert!(client.expire_time("k").unwrap().unwrap() > SystemTime::now());

    assert!(client.persist("k").unwrap());
    assert_eq!(client.ttl("k").unwrap(), Ttl::NoExpiry);
    assert_eq!(client.expire_time("k").unwrap(), None);
    assert_eq!(client.ttl("missing").unwrap(), Ttl::Missing);

    assert!(client.expire("k", Duration::from_secs(60)).unwrap());
    assert!(client.ttl("k").unwrap().remaining().unwrap() > Duration::from_secs(58));
    assert!(client.touch("k", Expiry::Never).unwrap());
    assert_eq!(client.ttl("k").unwrap(), Ttl::NoExpiry);
}

#[test]
fn sub_second_expire_does_not_drop_the_key() {
    let server = support::server();
    let client = support::client(&server);

    client.set("k", "v", Expiry::Never).unwrap();
    assert!(client.expire("k", Duration::from_millis(500)).unwrap());
    assert!(client.has_key("k").unwrap());
    assert!(matches!(client.ttl("k").unwrap(), Ttl::ExpiresIn(_)));
    assert_eq!(server.commands_named("EXPIRE")[0][2], "1");
}

#[test]
fn default_timeout_applies_to_default_expiry() {
    let server = support::server();
    let options = support::options(&server)
        .default_timeout(Some(Duration::from_secs(30)))
        .build()
        .unwrap();
    let client = Client::new(options).unwrap();

    client.set("k", "v", Expiry::Default).unwrap();
    client.set("forever", "v", Expiry::Never).unwrap();
    assert!(matches!(client.ttl("k").unwrap(), Ttl::ExpiresIn(_)));
    assert_eq!(client.ttl("forever").unwrap(), Ttl::NoExpiry);
}

#[test]
fn bulk_reads_keep_caller_order() {
    let server = support::server();
    let client = support::client(&server);

    let failed = client
        .set_many(&[("a", 1), ("b", 2), ("d", 4)], Expiry::Never)
        .unwrap();
    assert!(failed.is_empty());
    let values: Vec<Option<i64>> = client.get_many(&["a", "b", "c", "d"]).unwrap();
    assert_eq!(values, vec![Some(1), Some(2), None, Some(4)]);
    assert_eq!(client.delete_many(&["a", "c", "d"]).unwrap(), 2);
}

#[test]
fn set_many_writes_ten_thousand_keys() {
    let server = support::server();
    let client = support::client(&server);

    let items: Vec<(String, usize)> = (0..10_000).map(|i| (format!("key:{i}"), i)).collect();
    let failed = client.set_many(&items, Expiry::After(Duration::from_secs(60))).unwrap();
    assert!(failed.is_empty());
    assert_eq!(server.with_store(|store| store.len()), 10_000);
    let sample: Vec<Option<usize>> = client.get_many(&["key:0", "key:9999"]).unwrap();
    assert_eq!(sample, vec![Some(0), Some(9999)]);
}

#[test]
fn rename_reports_missing_source() {
    let server = support::server();
    let client = support::client(&server);

    assert_eq!(client.rename("a", "b").unwrap_err().kind(), ErrorKind::NotFound);
    client.set("a", &1, Expiry::Never).unwrap();
    client.set("b", &2, Expiry::Never).unwrap();
    assert!(!client.renamenx("a", "b").unwrap());
    client.rename("a", "b").unwrap();
    assert_eq!(client.get::<i64>("b").unwrap(), Some(1));
    assert!(!client.has_key("a").unwrap());
}

#[test]
fn collections_round_trip() {
    let server = support::server();
    let client = support::client(&server);

    assert_eq!(client.sadd("s", &["a", "b", "c"]).unwrap(), 3);
    client.sadd("t", &["b", "c", "d"]).unwrap();
    assert!(client.sismember("s", "a").unwrap());
    assert_eq!(client.scard("s").unwrap(), 3);
    let mut inter: Vec<String> = client.sinter(&["s", "t"]).unwrap();
    inter.sort();
    assert_eq!(inter, vec!["b", "c"]);
    let union: Vec<String> = client.sunion(&["s", "t"]).unwrap();
    assert_eq!(union.len(), 4);
    let diff: Vec<String> = client.sdiff(&["s", "t"]).unwrap();
    assert_eq!(diff, vec!["a"]);
    assert_eq!(client.srem("s", &["a"]).unwrap(), 1);

    assert_eq!(client.rpush("l", &[1, 2, 3]).unwrap(), 3);
    assert_eq!(client.lpush("l", &[0]).unwrap(), 4);
    assert_eq!(client.lrange::<i64>("l", 0, -1).unwrap(), vec![0, 1, 2, 3]);
    assert_eq!(client.lpop::<i64>("l").unwrap(), Some(0));
    assert_eq!(client.rpop::<i64>("l").unwrap(), Some(3));
    assert_eq!(client.llen("l").unwrap(), 2);
    assert_eq!(client.key_type("l").unwrap(), Some(KeyType::List));
    assert_eq!(client.size("l").unwrap(), 2);

    assert!(client.hset("h", "name", "ada").unwrap());
    client.hset("h", "visits", &3).unwrap();
    assert_eq!(client.hget::<String>("h", "name").unwrap(), Some("ada".into()));
    assert_eq!(client.hlen("h").unwrap(), 2);
    let all: BTreeMap<String, serde_json::Value> = client.hgetall("h").unwrap();
    assert_eq!(all["visits"], serde_json::json!(3));
    assert_eq!(client.hdel("h", &["name"]).unwrap(), 1);

    assert_eq!(client.key_type("missing").unwrap(), None);
    assert_eq!(client.size("missing").unwrap(), 0);
}

#[test]
fn key_iteration_and_pattern_delete() {
    let server = support::server();
    let client = support::client(&server);

    let items: Vec<(String, i64)> = (0..250).map(|i| (format!("user:{i}"), i)).collect();
    client.set_many(&items, Expiry::Never).unwrap();
    client.set("other", &1, Expiry::Never).unwrap();

    let mut seen: Vec<String> = client
        .iter_keys("user:*", Some(20))
        .collect::<Result<_, _>>()
        .unwrap();
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 250);

    let page = client.scan(0, "*", Some(1000)).unwrap();
    assert!(page.is_last());
    assert_eq!(page.keys.len(), 251);

    assert_eq!(client.keys("user:1?").unwrap().len(), 10);
    assert_eq!(client.delete_pattern("user:*").unwrap(), 250);
    assert_eq!(client.keys("*").unwrap(), vec!["other".to_string()]);

    client.clear().unwrap();
    assert_eq!(server.with_store(|store| store.len()), 0);
}

#[test]
fn cursor_steps_stay_on_one_node_with_replicas() {
    let primary = support::server();
    let replicas = [support::server(), support::server()];
    let options = CacheOptions::builder()
        .server(primary.url())
        .server(replicas[0].url())
        .server(replicas[1].url())
        .connect_timeout(Some(Duration::from_millis(500)))
        .build()
        .unwrap();
    let client = Client::new(options).unwrap();

    let expected: Vec<String> = (0..12).map(|i| format!("scan:{i:02}")).collect();
    for replica in &replicas {
        // Replicas hold a different key space, so a step landing there
        // would show up as foreign keys.
        replica.with_store(|store| store.set_str(b"stray", b"1".to_vec(), None));
    }
    primary.with_store(|store| {
        for key in &expected {
            store.set_str(key.as_bytes(), b"1".to_vec(), None);
        }
    });

    let mut seen = Vec::new();
    let mut cursor = 0;
    loop {
        let page = client.scan(cursor, "*", Some(2)).unwrap();
        seen.extend(page.keys.iter().cloned());
        if page.is_last() {
            break;
        }
        cursor = page.cursor;
    }
    seen.sort();
    assert_eq!(seen, expected);
    assert!(primary.commands_named("SCAN").len() > 1);
    assert!(replicas.iter().all(|r| r.commands_named("SCAN").is_empty()));
}

#[test]
fn pipelines_return_replies_in_queue_order() {
    let server = support::server();
    let client = support::client(&server);

    let mut pipeline = client.pipeline();
    pipeline.set("a", &1, Expiry::Never).unwrap();
    pipeline.get("a").incr("a", 5).get("missing").delete("a");
    let results = client.execute(&pipeline).unwrap();

    assert_eq!(results.len(), 5);
    assert!(results.boolean(0).unwrap());
    assert_eq!(results.value::<i64>(1).unwrap(), Some(1));
    assert_eq!(results.integer(2).unwrap(), 6);
    assert_eq!(results.value::<i64>(3).unwrap(), None);
    assert!(results.boolean(4).unwrap());
    assert!(server.commands_named("MULTI").is_empty());
}

#[test]
fn transactions_wrap_commands_in_multi_exec() {
    let server = support::server();
    let client = support::client(&server);

    let mut tx = client.transaction();
    tx.set("a", &10, Expiry::Never).unwrap();
    tx.incr("a", 1).get("a");
    let results = client.execute(&tx).unwrap();

    assert_eq!(results.integer(1).unwrap(), 11);
    assert_eq!(results.value::<i64>(2).unwrap(), Some(11));
    assert_eq!(server.commands_named("MULTI").len(), 1);
    assert_eq!(server.commands_named("EXEC").len(), 1);
}

#[test]
fn introspection_reads_info_and_slowlog() {
    let server = support::server();
    let client = support::client(&server);

    client.ping().unwrap();
    client.set("k", "v", Expiry::Never).unwrap();
    let info = client.info(None).unwrap();
    assert_eq!(info.get("redis_version"), Some("7.2.4"));
    let keyspace = client.info(Some("keyspace")).unwrap();
    assert!(keyspace.section("keyspace").unwrap().contains_key("db0"));
    assert!(keyspace.section("server").is_none());

    server.add_slowlog_entry(Duration::from_micros(1500), &["GET", "k"]);
    server.add_slowlog_entry(Duration::from_micros(2500), &["SET", "k", "v"]);
    assert_eq!(client.slowlog_len().unwrap(), 2);
    let entries = client.slowlog_get(10).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].id, 1);
    assert_eq!(entries[0].duration, Duration::from_micros(2500));
    assert_eq!(entries[1].command, vec!["GET", "k"]);
}

#[test]
fn scoped_connections_run_raw_commands() {
    let server = support::server();
    let client = support::client(&server);

    let mut conn = client.get_connection(Some(0), true).unwrap();
    let reply = conn.exec(&Cmd::new("ECHO").arg("hello")).unwrap();
    assert_eq!(reply, RespValue::Bulk(Some(b"hello".to_vec())));
    drop(conn);

    let mut conn = client.get_connection(None, false).unwrap();
    assert_eq!(conn.index(), 0);
    assert_eq!(conn.exec(&Cmd::new("PING")).unwrap(), RespValue::Simple(b"PONG".to_vec()));
}

#[test]
fn outage_is_absorbed_when_ignoring_exceptions() {
    let server = support::server();
    let options = support::options(&server)
        .ignore_exceptions(true)
        .log_ignored_exceptions(true)
        .build()
        .unwrap();
    let client = Client::new(options).unwrap();
    client.set("k", "v", Expiry::Never).unwrap();

    server.shutdown();

    assert_eq!(client.get::<String>("k").unwrap(), None);
    assert!(!client.set("k", "w", Expiry::Never).unwrap());
    assert!(!client.delete("k").unwrap());
    assert!(!client.has_key("k").unwrap());
    assert_eq!(client.incr("k", 1).unwrap_err().kind(), ErrorKind::Transport);
}

#[test]
fn outage_propagates_by_default() {
    let server = support::server();
    let client = support::client(&server);
    client.set("k", "v", Expiry::Never).unwrap();

    server.shutdown();

    let err = client.get::<String>("k").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(err.keys(), ["k".to_string()]);
}

#[test]
fn slow_replies_time_out() {
    let server = support::server();
    let options = support::options(&server)
        .read_timeout(Some(Duration::from_millis(100)))
        .ignore_exceptions(true)
        .build()
        .unwrap();
    let client = Client::new(options).unwrap();
    client.set("k", "v", Expiry::Never).unwrap();

    server.set_latency(Duration::from_millis(500));
    assert_eq!(client.get::<String>("k").unwrap(), None);
}

#[test]
fn closed_clients_reconnect_on_next_use() {
    let server = support::server();
    let client = support::client(&server);
    client.set("k", "v", Expiry::Never).unwrap();

    client.close();
    assert_eq!(client.get::<String>("k").unwrap(), Some("v".into()));
    assert!(!server.commands_named("QUIT").is_empty());
}
