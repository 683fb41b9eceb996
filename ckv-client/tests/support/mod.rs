//! Shared fixtures: test servers with the lock scripts installed, and
//! clients pointed at them.

#![allow(dead_code)]

use std::sync::Once;
use std::time::Duration;

use ckv_client::{CacheOptions, CacheOptionsBuilder, Client, ACQUIRE_SCRIPT, EXTEND_SCRIPT, RELEASE_SCRIPT};
use ckv_testkit::{Reply, Store, TestCluster, TestServer};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn server() -> TestServer {
    init_tracing();
    let server = TestServer::start().expect("start test server");
    server.register_script(ACQUIRE_SCRIPT, acquire);
    server.register_script(RELEASE_SCRIPT, release);
    server.register_script(EXTEND_SCRIPT, extend);
    server
}

pub fn cluster(size: usize) -> TestCluster {
    init_tracing();
    let cluster = TestCluster::start(size).expect("start test cluster");
    cluster.register_script(ACQUIRE_SCRIPT, acquire);
    cluster.register_script(RELEASE_SCRIPT, release);
    cluster.register_script(EXTEND_SCRIPT, extend);
    cluster
}

pub fn options(server: &TestServer) -> CacheOptionsBuilder {
    CacheOptions::builder()
        .server(server.url())
        .connect_timeout(Some(Duration::from_millis(500)))
        .read_timeout(Some(Duration::from_secs(2)))
}

pub fn client(server: &TestServer) -> Client {
    Client::new(options(server).build().expect("valid options")).expect("client")
}

pub fn cluster_options(cluster: &TestCluster) -> CacheOptionsBuilder {
    cluster
        .urls()
        .into_iter()
        .fold(CacheOptions::builder().cluster(true), |builder, url| builder.server(url))
        .connect_timeout(Some(Duration::from_millis(500)))
        .read_timeout(Some(Duration::from_secs(2)))
}

pub fn cluster_client(cluster: &TestCluster) -> Client {
    Client::new(cluster_options(cluster).build().expect("valid options")).expect("client")
}

/// Key whose slot is owned by cluster node `node`.
pub fn key_on(cluster: &TestCluster, node: usize, prefix: &str) -> String {
    (0..)
        .map(|i| format!("{prefix}{i}"))
        .find(|key| cluster.owner_of(key) == node)
        .expect("some key lands on every node")
}

// ========== Lock scripts ==========

fn lease(argv: &[Vec<u8>]) -> u64 {
    argv.get(1)
        .and_then(|raw| std::str::from_utf8(raw).ok())
        .and_then(|text| text.parse().ok())
        .unwrap_or(0)
}

fn acquire(store: &mut Store, keys: &[Vec<u8>], argv: &[Vec<u8>]) -> Reply {
    let (key, token, lease) = (&keys[0], &argv[0], lease(argv));
    match store.get_str(key) {
        Err(_) => Reply::wrong_type(),
        Ok(Some(current)) if &current == token => {
            if lease > 0 {
                store.pexpire(key, Duration::from_millis(lease));
            }
            Reply::Integer(1)
        }
        Ok(Some(_)) => Reply::Integer(0),
        Ok(None) => {
            let ttl = (lease > 0).then(|| Duration::from_millis(lease));
            store.set_str(key, token.clone(), ttl);
            Reply::Integer(1)
        }
    }
}

fn release(store: &mut Store, keys: &[Vec<u8>], argv: &[Vec<u8>]) -> Reply {
    match store.get_str(&keys[0]) {
        Ok(Some(current)) if current == argv[0] => Reply::Integer(store.delete(&keys[0]) as i64),
        _ => Reply::Integer(0),
    }
}

fn extend(store: &mut Store, keys: &[Vec<u8>], argv: &[Vec<u8>]) -> Reply {
    let key = &keys[0];
    match store.get_str(key) {
        Ok(None) => Reply::Integer(-2),
        Ok(Some(current)) if current == argv[0] => {
            let ttl = store.pttl(key);
            if ttl < 0 {
                return Reply::Integer(-1);
            }
            store.pexpire(key, Duration::from_millis(ttl as u64 + lease(argv)));
            Reply::Integer(1)
        }
        _ => Reply::Integer(0),
    }
}
