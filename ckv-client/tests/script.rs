mod support;

use ckv_client::{hooks, sha1_hex, Client, ErrorKind};
use ckv_testkit::{Reply, Store};
use serde_json::{json, Value};

const GET_SCRIPT: &str = "return redis.call('GET', KEYS[1])";
const STORE_SCRIPT: &str = "redis.call('SET', KEYS[1], ARGV[1]) return ARGV[1]";
const SHAPES_SCRIPT: &str = "return {1, 'a', false}";
const FAIL_SCRIPT: &str = "return redis.error_reply('boom')";

fn get_handler(store: &mut Store, keys: &[Vec<u8>], _: &[Vec<u8>]) -> Reply {
    match store.get_str(&keys[0]) {
        Ok(value) => Reply::Bulk(value),
        Err(_) => Reply::wrong_type(),
    }
}

fn store_handler(store: &mut Store, keys: &[Vec<u8>], argv: &[Vec<u8>]) -> Reply {
    store.set_str(&keys[0], argv[0].clone(), None);
    Reply::bulk(argv[0].clone())
}

#[test]
fn keys_go_through_the_key_transform() {
    let server = support::server();
    server.register_script(GET_SCRIPT, get_handler);
    let client = Client::builder(support::options(&server).build().unwrap())
        .key_transform(|key| format!(":1:{key}"))
        .build()
        .unwrap();
    client.register_script("get", GET_SCRIPT, None, None).unwrap();

    server.with_store(|store| store.set_str(b":1:greeting", b"hello".to_vec(), None));
    let value = client.eval_script("get", &["greeting"], vec![]).unwrap();
    assert_eq!(value, json!("hello"));
}

#[test]
fn missing_scripts_are_resubmitted_by_source() {
    let server = support::server();
    server.register_script(GET_SCRIPT, get_handler);
    let client = support::client(&server);
    client.register_script("get", GET_SCRIPT, None, None).unwrap();

    for _ in 0..3 {
        assert_eq!(client.eval_script("get", &["k"], vec![]).unwrap(), Value::Null);
    }
    assert_eq!(server.commands_named("EVAL").len(), 1);
    let evalsha = server.commands_named("EVALSHA");
    assert_eq!(evalsha.len(), 3);
    assert_eq!(evalsha[0][1], sha1_hex(GET_SCRIPT));

    server.flush_scripts();
    client.eval_script("get", &["k"], vec![]).unwrap();
    assert_eq!(server.commands_named("EVAL").len(), 2);
}

#[test]
fn codec_hooks_encode_arguments_and_decode_replies() {
    let server = support::server();
    server.register_script(STORE_SCRIPT, store_handler);
    let client = support::client(&server);
    client
        .register_script(
            "store",
            STORE_SCRIPT,
            Some(hooks::full_encode()),
            Some(hooks::decode_single()),
        )
        .unwrap();

    let value = client
        .eval_script("store", &["doc"], vec![json!({"n": 1})])
        .unwrap();
    assert_eq!(value, json!({"n": 1}));
    assert_eq!(client.get::<Value>("doc").unwrap(), Some(json!({"n": 1})));
}

#[test]
fn structural_replies_convert_to_json() {
    let server = support::server();
    server.register_script(SHAPES_SCRIPT, |_: &mut Store, _: &[Vec<u8>], _: &[Vec<u8>]| {
        Reply::array(vec![Reply::Integer(1), Reply::bulk("a"), Reply::nil()])
    });
    let client = support::client(&server);
    client.register_script("shapes", SHAPES_SCRIPT, None, None).unwrap();

    let keys: [&str; 0] = [];
    let value = client.eval_script("shapes", &keys, vec![]).unwrap();
    assert_eq!(value, json!([1, "a", null]));
}

#[test]
fn script_errors_and_registration_errors() {
    let server = support::server();
    server.register_script(FAIL_SCRIPT, |_: &mut Store, _: &[Vec<u8>], _: &[Vec<u8>]| {
        Reply::err("ERR boom")
    });
    let client = support::client(&server);
    client.register_script("fail", FAIL_SCRIPT, None, None).unwrap();

    let keys: [&str; 0] = [];
    assert_eq!(
        client.eval_script("fail", &keys, vec![]).unwrap_err().kind(),
        ErrorKind::Server
    );
    assert_eq!(
        client.eval_script("unknown", &keys, vec![]).unwrap_err().kind(),
        ErrorKind::ScriptNotRegistered
    );
    assert_eq!(
        client
            .register_script("fail", GET_SCRIPT, None, None)
            .unwrap_err()
            .kind(),
        ErrorKind::Config
    );
}

#[test]
fn scripts_route_by_first_key_on_a_cluster() {
    let cluster = support::cluster(3);
    cluster.register_script(STORE_SCRIPT, store_handler);
    let client = support::cluster_client(&cluster);
    client
        .register_script("store", STORE_SCRIPT, Some(hooks::full_encode()), Some(hooks::decode_single()))
        .unwrap();

    for node in 0..3 {
        let key = support::key_on(&cluster, node, "script:");
        client.eval_script("store", &[key.as_str()], vec![json!(node)]).unwrap();
        assert!(cluster.node(node).with_store(|s| s.exists(key.as_bytes())));
    }
}
