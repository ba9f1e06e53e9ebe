use crate::{fast_retry, node, selector, WAIT};
use sentiero::{Error, RoundRobin, Selector};
use std::collections::HashSet;
use std::error::Error as StdError;
use std::time::Duration;
use tests::eventually;
use tests::registry::FlakyRegistry;
use tests::strategy::CountingStrategy;
use tokio::task::JoinSet;

#[tokio::test]
async fn concurrent_first_selects_share_one_coordinator() {
    // Arrange
    let registry = FlakyRegistry::new();
    registry
        .memory()
        .set_nodes("svc", vec![node("a:1111"), node("b:2222")]);
    let selector = selector(&registry);

    // Act
    let mut selects = JoinSet::new();
    for _ in 0..16 {
        let selector = selector.clone();
        selects.spawn(async move { selector.select("svc").await });
    }
    let mut pickers = Vec::new();
    while let Some(picker) = selects.join_next().await {
        pickers.push(picker.expect("select panicked").expect("select failed"));
    }

    // Assert
    assert!(pickers
        .windows(2)
        .all(|pair| pair[0].shares_nodes_with(&pair[1])));
    eventually(WAIT, || registry.subscribe_calls() == 1).await;
    assert_eq!(registry.get_calls(), 1);
}

#[tokio::test]
async fn mark_without_failure_keeps_every_node() {
    let registry = FlakyRegistry::new();
    registry
        .memory()
        .set_nodes("svc", vec![node("a:1111"), node("b:2222")]);
    let selector = selector(&registry);
    let picker = selector.select("svc").await.unwrap();

    selector.mark("svc", &node("a:1111"), None).await.unwrap();

    let picked: HashSet<_> = (0..4).map(|_| picker.pick().unwrap().address).collect();
    assert_eq!(picked.len(), 2);
}

#[tokio::test]
async fn excluded_node_comes_back_with_the_next_full_snapshot() {
    // Steps:
    //  1. Select a service with nodes A and B.
    //  2. Report A as unreachable.
    //  3. Register C; the registry pushes A, B and C.
    // What we want to test:
    //  A is never picked between 2 and 3, and is picked again after 3.

    // Arrange
    let registry = FlakyRegistry::new();
    registry
        .memory()
        .set_nodes("svc", vec![node("a:1111"), node("b:2222")]);
    let selector = selector(&registry);
    let picker = selector.select("svc").await.unwrap();
    eventually(WAIT, || registry.memory().subscriber_count("svc") == 1).await;

    // Act
    let unavailable = tonic::Status::unavailable("connection refused");
    selector
        .mark("svc", &node("a:1111"), Some(&unavailable))
        .await
        .unwrap();

    // Assert
    for _ in 0..10 {
        assert_eq!(picker.pick().unwrap().address, "b:2222");
    }

    registry.memory().add_node("svc", node("c:3333"));
    eventually(WAIT, || picker.nodes().len() == 3).await;

    let picked: HashSet<_> = (0..3).map(|_| picker.pick().unwrap().address).collect();
    assert!(picked.contains("a:1111"));
}

#[tokio::test]
async fn excluded_node_comes_back_with_the_next_refresh() {
    let registry = FlakyRegistry::new();
    registry
        .memory()
        .set_nodes("svc", vec![node("a:1111"), node("b:2222")]);
    let selector = Selector::builder(registry.clone())
        .refresh_interval(Duration::from_millis(20))
        .refresh_jitter(Duration::ZERO)
        .retry_policy(fast_retry())
        .build();
    let picker = selector.select("svc").await.unwrap();

    let deadline_exceeded = tonic::Status::deadline_exceeded("too slow");
    selector
        .mark("svc", &node("a:1111"), Some(&deadline_exceeded))
        .await
        .unwrap();

    eventually(WAIT, || picker.nodes().len() == 2).await;
    assert!(registry.get_calls() >= 2);
}

#[tokio::test]
async fn failures_not_deemed_fatal_keep_the_node() {
    let registry = FlakyRegistry::new();
    registry
        .memory()
        .set_nodes("svc", vec![node("a:1111"), node("b:2222")]);
    let selector = Selector::builder(registry.clone())
        .strategy(RoundRobin)
        .failure_classifier(|_: &(dyn StdError + 'static)| false)
        .build();
    let picker = selector.select("svc").await.unwrap();

    let unavailable = tonic::Status::unavailable("connection refused");
    selector
        .mark("svc", &node("a:1111"), Some(&unavailable))
        .await
        .unwrap();

    assert_eq!(picker.nodes().len(), 2);
}

#[tokio::test]
async fn empty_service_fills_up_through_pushes() {
    let registry = FlakyRegistry::new();
    let selector = selector(&registry);

    let picker = selector.select("svc").await.unwrap();
    assert_eq!(picker.pick(), Err(Error::NoAvailableNode));

    eventually(WAIT, || registry.memory().subscriber_count("svc") == 1).await;
    registry.memory().add_node("svc", node("a:1111"));

    eventually(WAIT, || picker.pick().is_ok()).await;
    assert_eq!(picker.pick().unwrap().address, "a:1111");
}

#[tokio::test]
async fn unchanged_pushes_do_not_rebuild_the_picker() {
    // Arrange
    let registry = FlakyRegistry::new();
    registry.memory().set_nodes("svc", vec![node("a:1111")]);
    let strategy = CountingStrategy::new();
    let selector = Selector::builder(registry.clone())
        .strategy(strategy.clone())
        .refresh_interval(Duration::from_secs(300))
        .build();
    let picker = selector.select("svc").await.unwrap();
    eventually(WAIT, || registry.memory().subscriber_count("svc") == 1).await;

    // Act
    registry.memory().renotify("svc");
    registry.memory().renotify("svc");
    registry.memory().add_node("svc", node("b:2222"));
    eventually(WAIT, || picker.nodes().len() == 2).await;

    // Assert
    assert_eq!(strategy.builds(), 2);
}

#[tokio::test]
async fn subscription_failure_fails_the_first_select() {
    let registry = FlakyRegistry::new();
    registry.hang_get();
    registry.reject_subscription("svc");
    let selector = selector(&registry);

    let err = selector.select("svc").await.unwrap_err();

    assert!(matches!(err, Error::Subscribe { ref service, .. } if service == "svc"));
    assert_eq!(registry.subscribe_calls(), fast_retry().max_attempts as usize);
}

#[tokio::test]
async fn subscription_failure_after_the_first_snapshot_is_tolerated() {
    let registry = FlakyRegistry::new();
    registry.memory().set_nodes("svc", vec![node("a:1111")]);
    registry.reject_subscription("svc");
    let retry = sentiero::RetryPolicy {
        max_attempts: 3,
        delay: Duration::from_millis(50),
    };
    let selector = Selector::builder(registry.clone())
        .retry_policy(retry)
        .refresh_interval(Duration::from_secs(300))
        .build();

    let picker = selector.select("svc").await.unwrap();
    eventually(WAIT, || registry.subscribe_calls() == 3).await;

    // Without pushes the service keeps running on periodic refreshes.
    assert_eq!(picker.pick().unwrap().address, "a:1111");
    let again = selector.select("svc").await.unwrap();
    assert!(again.shares_nodes_with(&picker));
}

#[tokio::test]
async fn startup_times_out_without_a_snapshot() {
    let registry = FlakyRegistry::new();
    registry.hang_get();
    let selector = selector(&registry);
    let timeout = Duration::from_millis(50);

    let err = selector
        .select_with_timeout("svc", timeout)
        .await
        .unwrap_err();

    assert_eq!(
        err,
        Error::StartupTimeout {
            service: "svc".into(),
            timeout
        }
    );
}

#[tokio::test]
async fn failed_refreshes_keep_the_last_known_nodes() {
    let registry = FlakyRegistry::new();
    registry.memory().set_nodes("svc", vec![node("a:1111")]);
    let selector = Selector::builder(registry.clone())
        .refresh_interval(Duration::from_millis(10))
        .refresh_jitter(Duration::ZERO)
        .retry_policy(fast_retry())
        .build();
    let picker = selector.select("svc").await.unwrap();

    registry.fail_get(usize::MAX);
    let calls = registry.get_calls();
    eventually(WAIT, || registry.get_calls() > calls + fast_retry().max_attempts as usize).await;

    assert_eq!(picker.pick().unwrap().address, "a:1111");
}

#[tokio::test]
async fn services_are_followed_independently() {
    let registry = FlakyRegistry::new();
    registry.memory().set_nodes("one", vec![node("a:1111")]);
    registry.memory().set_nodes("two", vec![node("b:2222")]);
    let selector = selector(&registry);

    let one = selector.select("one").await.unwrap();
    let two = selector.select("two").await.unwrap();

    assert!(!one.shares_nodes_with(&two));
    assert_eq!(one.pick().unwrap().address, "a:1111");
    assert_eq!(two.pick().unwrap().address, "b:2222");
}

#[tokio::test]
async fn node_registered_again_after_the_service_emptied_is_pushed() {
    // Steps:
    //  1. B is the only node left, then it deregisters; the empty push is dropped
    //     and a refresh applies the empty list.
    //  2. Refreshes start failing.
    //  3. B registers again; the registry pushes B.
    // What we want to test:
    //  The push in 3 reaches the picker even though B was the last set delivered.

    // Arrange
    let registry = FlakyRegistry::new();
    registry
        .memory()
        .set_nodes("svc", vec![node("a:1111"), node("b:2222")]);
    let selector = Selector::builder(registry.clone())
        .refresh_interval(Duration::from_millis(20))
        .refresh_jitter(Duration::ZERO)
        .retry_policy(fast_retry())
        .build();
    let picker = selector.select("svc").await.unwrap();
    eventually(WAIT, || registry.memory().subscriber_count("svc") == 1).await;

    registry.memory().remove_node("svc", "a:1111");
    eventually(WAIT, || picker.nodes().len() == 1).await;
    registry.memory().remove_node("svc", "b:2222");
    eventually(WAIT, || picker.nodes().is_empty()).await;
    registry.fail_get(usize::MAX);

    // Act
    registry.memory().add_node("svc", node("b:2222"));

    // Assert
    eventually(WAIT, || picker.nodes().len() == 1).await;
    assert_eq!(picker.pick().unwrap().address, "b:2222");
}
