//! Many calls in flight over one reply channel.

use futures_util::future::join_all;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use todo_bridge::lifecycle::Shutdown;
use todo_bridge::broker::InMemoryBroker;
use todo_sdk::NewTodo;

mod common;

use common::EchoHandler;

#[tokio::test]
async fn test_concurrent_calls_get_their_own_replies() {
    let broker = InMemoryBroker::new();
    let shutdown = Shutdown::new();
    let worker = common::spawn_worker(&broker, EchoHandler, "echo", 16, &shutdown).await;
    let client = Arc::new(common::rpc_client(&broker, Duration::from_secs(5)));

    let words: Vec<String> = (0..64)
        .map(|_| {
            rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(24)
                .map(char::from)
                .collect::<String>()
                .to_lowercase()
        })
        .collect();
    let distinct: HashSet<&String> = words.iter().collect();
    assert_eq!(distinct.len(), words.len());

    let calls = words.iter().map(|word| {
        let client = Arc::clone(&client);
        async move {
            let payload = serde_json::to_vec(&json!(word)).unwrap();
            let outcome = client.call("echo", payload).await.unwrap();
            (word, outcome.into_result().unwrap())
        }
    });

    for (word, data) in join_all(calls).await {
        assert_eq!(data, json!({ "echo": word.to_uppercase() }));
    }
    assert_eq!(client.outstanding(), 0);
    assert_eq!(worker.stats.replied(), 64);
    assert_eq!(worker.stats.acked(), 64);

    shutdown.trigger();
    worker.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_competing_workers_share_one_queue() {
    let broker = InMemoryBroker::new();
    let shutdown = Shutdown::new();
    let first = common::spawn_worker(&broker, EchoHandler, "echo", 2, &shutdown).await;
    let second = common::spawn_worker(&broker, EchoHandler, "echo", 2, &shutdown).await;
    let client = Arc::new(common::rpc_client(&broker, Duration::from_secs(5)));

    let calls = (0..40).map(|n| {
        let client = Arc::clone(&client);
        async move {
            let payload = serde_json::to_vec(&json!([n])).unwrap();
            (n, client.call("echo", payload).await.unwrap().into_result().unwrap())
        }
    });
    let replies = join_all(calls).await;

    assert_eq!(replies.len(), 40);
    for (n, reply) in replies {
        assert_eq!(reply, json!({ "echo": [n] }));
    }
    assert_eq!(first.stats.replied() + second.stats.replied(), 40);
    assert_eq!(broker.stats().acked, 40);
    assert_eq!(broker.stats().requeued, 0);

    shutdown.trigger();
    first.handle.await.unwrap().unwrap();
    second.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_concurrent_http_creates() {
    let stack = common::start_stack(Duration::from_secs(5)).await;
    let sdk = Arc::new(stack.sdk());

    let creates = (0..50).map(|n| {
        let sdk = Arc::clone(&sdk);
        async move {
            sdk.create(&NewTodo {
                text: format!("item {n}"),
                done: n % 2 == 0,
            })
            .await
            .unwrap()
            .0
        }
    });
    let created = join_all(creates).await;

    let ids: HashSet<String> = created.iter().map(|t| t.id.clone()).collect();
    assert_eq!(ids.len(), 50);
    assert_eq!(stack.store.len(), 50);

    let listed = sdk.list().await.unwrap();
    assert_eq!(listed.len(), 50);
    assert!(listed.iter().all(|t| ids.contains(&t.id)));
    assert_eq!(stack.todos.rpc().outstanding(), 0);
}
