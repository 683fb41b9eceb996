mod support;

use std::time::Duration;

use ckv_client::{ErrorKind, Expiry, Scheduler, Ttl};
use futures::TryStreamExt;

#[tokio::test]
async fn async_operations_share_the_core() {
    let server = support::server();
    let client = support::client(&server);
    let scheduler = Scheduler::new();
    let cooperative = client.cooperative(&scheduler);

    cooperative.set("k", "v", Expiry::After(Duration::from_secs(30))).await.unwrap();
    assert_eq!(client.get::<String>("k").unwrap(), Some("v".into()));
    assert_eq!(cooperative.get::<String>("k").await.unwrap(), Some("v".into()));
    assert!(matches!(cooperative.ttl("k").await.unwrap(), Ttl::ExpiresIn(_)));

    cooperative.set("n", &5, Expiry::Never).await.unwrap();
    assert_eq!(cooperative.incr("n", 2).await.unwrap(), 7);
    assert_eq!(
        cooperative.incr("missing", 1).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );

    let failed = cooperative
        .set_many(&[("a", 1), ("b", 2)], Expiry::Never)
        .await
        .unwrap();
    assert!(failed.is_empty());
    let values: Vec<Option<i64>> = cooperative.get_many(&["b", "x", "a"]).await.unwrap();
    assert_eq!(values, vec![Some(2), None, Some(1)]);
    assert_eq!(cooperative.delete_many(&["a", "b", "x"]).await.unwrap(), 2);
}

#[tokio::test]
async fn async_key_stream_walks_every_key() {
    let server = support::server();
    let client = support::client(&server);
    let cooperative = client.cooperative(&Scheduler::new());

    let items: Vec<(String, i64)> = (0..120).map(|i| (format!("stream:{i}"), i)).collect();
    cooperative.set_many(&items, Expiry::Never).await.unwrap();

    let keys: Vec<String> = cooperative
        .iter_keys("stream:*", Some(25))
        .try_collect()
        .await
        .unwrap();
    assert_eq!(keys.len(), 120);
    assert_eq!(cooperative.delete_pattern("stream:*").await.unwrap(), 120);
    assert!(cooperative.keys("*").await.unwrap().is_empty());
}

#[tokio::test]
async fn async_pipelines_and_transactions() {
    let server = support::server();
    let client = support::client(&server);
    let cooperative = client.cooperative(&Scheduler::new());

    let mut tx = cooperative.transaction();
    tx.set("a", &1, Expiry::Never).unwrap();
    tx.incr("a", 9).get("a");
    let results = cooperative.execute(&tx).await.unwrap();
    assert_eq!(results.integer(1).unwrap(), 10);
    assert_eq!(results.value::<i64>(2).unwrap(), Some(10));
    assert_eq!(server.commands_named("MULTI").len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn async_locks_exclude_concurrent_tasks() {
    let server = support::server();
    let client = support::client(&server);
    let cooperative = client.cooperative(&Scheduler::new());
    cooperative.set("counter", &0, Expiry::Never).await.unwrap();

    let tasks: Vec<_> = (0..6)
        .map(|_| {
            let client = cooperative.clone();
            tokio::spawn(async move {
                let lock = client.lock("locks:async").with_sleep(Duration::from_millis(2));
                for _ in 0..5 {
                    assert!(lock.acquire(true, Some(Duration::from_secs(10))).await.unwrap());
                    let value: i64 = client.get("counter").await.unwrap().unwrap();
                    client.set("counter", &(value + 1), Expiry::Never).await.unwrap();
                    lock.release().await.unwrap();
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(cooperative.get::<i64>("counter").await.unwrap(), Some(30));

    let lock = cooperative.lock("locks:async");
    let rival = cooperative.lock("locks:async");
    assert!(lock.acquire(false, None).await.unwrap());
    assert!(!rival.acquire(false, None).await.unwrap());
    assert_eq!(rival.release().await.unwrap_err().kind(), ErrorKind::Lock);
    assert!(lock.owned().await.unwrap());
    lock.release().await.unwrap();
    assert!(!lock.locked().await.unwrap());
}

#[tokio::test]
async fn closing_one_scheduler_leaves_the_others_working() {
    let server = support::server();
    let client = support::client(&server);
    let first = client.cooperative(&Scheduler::new());
    let second = client.cooperative(&Scheduler::new());

    first.set("k", &1, Expiry::Never).await.unwrap();
    second.set("k", &2, Expiry::Never).await.unwrap();
    first.close().await;
    assert!(!server.commands_named("QUIT").is_empty());

    assert_eq!(second.get::<i64>("k").await.unwrap(), Some(2));
    // A closed scheduler gets fresh pools on next use.
    assert_eq!(first.get::<i64>("k").await.unwrap(), Some(2));

    second.close_now();
    assert_eq!(second.get::<i64>("k").await.unwrap(), Some(2));
    client.ping().unwrap();
}

#[tokio::test]
async fn async_scripts_fall_back_and_absorb_outages() {
    let server = support::server();
    let options = support::options(&server).ignore_exceptions(true).build().unwrap();
    let client = ckv_client::Client::new(options).unwrap();
    let cooperative = client.cooperative(&Scheduler::new());

    let lock = cooperative.lock("locks:script");
    assert!(lock.acquire(false, None).await.unwrap());
    assert_eq!(server.commands_named("EVAL").len(), 1);
    lock.release().await.unwrap();

    cooperative.set("k", "v", Expiry::Never).await.unwrap();
    server.shutdown();
    assert_eq!(cooperative.get::<String>("k").await.unwrap(), None);
    assert!(!cooperative.has_key("k").await.unwrap());
}
