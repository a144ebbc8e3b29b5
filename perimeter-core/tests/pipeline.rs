mod support;

use std::time::Duration;

use perimeter_core::{
    model::{AddressHash, DiscoveryMethod, GroupKey, GroupStatus},
    pipeline::{DispatchEvent, StartOutcome},
    store::WorkQueue,
};
use support::{
    Instance, Linker, Resolver, Shared, ZoneWalker, broken, ctx, sluggish,
    test_config, wait_terminal,
};

#[tokio::test]
async fn single_seed_resolves_and_completes_once() {
    let shared = Shared::new();
    let key = GroupKey::new(1, 1);
    shared.add_group(key).await;
    shared.seed_hosts(key, &["a.com"]).await;
    let node =
        Instance::start(&shared, vec![Resolver::new(&[("a.com", "1.1.1.1")])])
            .await;
    let mut rx = node.dispatcher.subscribe();

    let outcome = node.coordinator.start_group(&ctx(1), key.group_id).await;
    assert_eq!(outcome.unwrap(), StartOutcome::Started);
    let event = wait_terminal(&mut rx, key).await;
    assert!(
        matches!(event, DispatchEvent::GroupCompleted { processed: 2, .. }),
        "{event:?}"
    );
    shared.wait_for_status(key, GroupStatus::Stopped).await;

    let persisted = shared.addresses.snapshot(key).await;
    assert_eq!(persisted.len(), 2);
    let resolved = persisted
        .iter()
        .find(|address| address.ip_address == "1.1.1.1")
        .expect("resolved pair persisted");
    assert_eq!(resolved.host_address, "a.com");
    assert_eq!(resolved.found_from, Some(AddressHash::of("", "a.com")));
    assert_eq!(resolved.discovered_by, DiscoveryMethod::NsQueryNameToIp);

    assert_eq!(shared.events.completions_for(key).await, 1);
    assert_eq!(node.dispatcher.get_active_addresses(), 0);
    assert_eq!(node.dispatcher.get_active_groups(), 0);
    assert_eq!(shared.store.queue_len(key).await.unwrap(), 0);
    node.shutdown().await;
}

#[tokio::test]
async fn cyclic_graph_converges_with_each_address_analyzed_once() {
    let shared = Shared::new();
    let key = GroupKey::new(1, 2);
    shared.add_group(key).await;
    shared.seed_hosts(key, &["a.com"]).await;
    let linker = Linker::new(
        DiscoveryMethod::NsAxfr,
        &[
            ("a.com", "www.a.com"),
            ("a.com", "mail.a.com"),
            ("www.a.com", "a.com"),
            ("mail.a.com", "mx.a.com"),
            ("mx.a.com", "www.a.com"),
        ],
    );
    let node = Instance::start(&shared, vec![linker]).await;
    let mut rx = node.dispatcher.subscribe();

    node.coordinator.start_group(&ctx(1), key.group_id).await.unwrap();
    let event = wait_terminal(&mut rx, key).await;
    assert!(
        matches!(event, DispatchEvent::GroupCompleted { processed: 4, .. }),
        "{event:?}"
    );

    let mut hosts: Vec<String> = shared
        .addresses
        .snapshot(key)
        .await
        .into_iter()
        .map(|address| address.host_address)
        .collect();
    hosts.sort();
    assert_eq!(hosts, ["a.com", "mail.a.com", "mx.a.com", "www.a.com"]);
    node.shutdown().await;
}

#[tokio::test]
async fn shared_discovery_is_persisted_and_queued_once() {
    let shared = Shared::new();
    let key = GroupKey::new(1, 3);
    shared.add_group(key).await;
    shared.seed_hosts(key, &["a.com", "b.com"]).await;
    let linker = Linker::new(
        DiscoveryMethod::NsAxfr,
        &[("a.com", "shared.example"), ("b.com", "shared.example")],
    );
    let node = Instance::start(&shared, vec![linker]).await;
    let mut rx = node.dispatcher.subscribe();

    node.coordinator.start_group(&ctx(1), key.group_id).await.unwrap();
    let event = wait_terminal(&mut rx, key).await;
    assert!(
        matches!(event, DispatchEvent::GroupCompleted { processed: 3, .. }),
        "{event:?}"
    );

    let persisted = shared.addresses.snapshot(key).await;
    assert_eq!(persisted.len(), 3);
    let child = persisted
        .iter()
        .find(|address| address.host_address == "shared.example")
        .expect("shared child persisted");
    let parents = [AddressHash::of("", "a.com"), AddressHash::of("", "b.com")];
    assert!(parents.contains(child.found_from.as_ref().unwrap()));
    node.shutdown().await;
}

#[tokio::test]
async fn low_confidence_discoveries_are_kept_but_not_expanded() {
    let shared = Shared::new();
    let key = GroupKey::new(1, 4);
    shared.add_group(key).await;
    shared.seed_hosts(key, &["a.com"]).await;
    let crawler = Linker::new(
        DiscoveryMethod::WebCrawl,
        &[
            ("a.com", "w1.a.com"),
            ("w1.a.com", "w2.a.com"),
            ("w2.a.com", "w3.a.com"),
        ],
    );
    let node = Instance::start(&shared, vec![crawler]).await;
    let mut rx = node.dispatcher.subscribe();

    node.coordinator.start_group(&ctx(1), key.group_id).await.unwrap();
    wait_terminal(&mut rx, key).await;

    let persisted = shared.addresses.snapshot(key).await;
    let find = |host: &str| {
        persisted
            .iter()
            .find(|address| address.host_address == host)
            .cloned()
    };
    let w1 = find("w1.a.com").expect("first hop persisted");
    assert_eq!(w1.confidence_score, 75.0);
    assert!(w1.last_scanned_time.is_some());

    let w2 = find("w2.a.com").expect("second hop persisted");
    assert!(w2.confidence_score < 75.0);
    assert!(w2.last_scanned_time.is_none(), "below floor; never analyzed");
    assert!(find("w3.a.com").is_none());
    node.shutdown().await;
}

#[tokio::test]
async fn failing_module_does_not_stop_the_group() {
    let shared = Shared::new();
    let key = GroupKey::new(1, 5);
    shared.add_group(key).await;
    shared.seed_hosts(key, &["a.com"]).await;
    let node = Instance::start(
        &shared,
        vec![broken(), Resolver::new(&[("a.com", "1.1.1.1")])],
    )
    .await;
    let mut rx = node.dispatcher.subscribe();

    node.coordinator.start_group(&ctx(1), key.group_id).await.unwrap();
    let event = wait_terminal(&mut rx, key).await;
    assert!(matches!(event, DispatchEvent::GroupCompleted { .. }));
    assert_eq!(shared.addresses.snapshot(key).await.len(), 2);
    assert_eq!(shared.events.completions_for(key).await, 1);
    node.shutdown().await;
}

#[tokio::test]
async fn concurrent_starts_across_instances_admit_one() {
    let shared = Shared::new();
    let key = GroupKey::new(1, 6);
    shared.add_group(key).await;
    shared.seed_hosts(key, &["a.com"]).await;
    let first =
        Instance::start(&shared, vec![sluggish(Duration::from_millis(300))])
            .await;
    let second =
        Instance::start(&shared, vec![sluggish(Duration::from_millis(300))])
            .await;
    let mut rx_first = first.dispatcher.subscribe();
    let mut rx_second = second.dispatcher.subscribe();

    let caller = ctx(1);
    let (a, b) = tokio::join!(
        first.coordinator.start_group(&caller, key.group_id),
        second.coordinator.start_group(&caller, key.group_id),
    );
    let outcomes = [a.unwrap(), b.unwrap()];
    assert_eq!(
        outcomes
            .iter()
            .filter(|outcome| **outcome == StartOutcome::Started)
            .count(),
        1,
        "{outcomes:?}"
    );
    assert!(outcomes.contains(&StartOutcome::AlreadyStarted));

    if outcomes[0] == StartOutcome::Started {
        wait_terminal(&mut rx_first, key).await;
    } else {
        wait_terminal(&mut rx_second, key).await;
    }
    shared.wait_for_status(key, GroupStatus::Stopped).await;
    assert_eq!(shared.events.completions_for(key).await, 1);
    first.shutdown().await;
    second.shutdown().await;
}

#[tokio::test]
async fn stop_cancels_in_flight_work_without_completion() {
    let shared = Shared::new();
    let key = GroupKey::new(1, 7);
    shared.add_group(key).await;
    shared.seed_hosts(key, &["a.com"]).await;
    let mut config = test_config();
    config.analyzers.call_timeout_ms = 60_000;
    let node = Instance::start_with(
        &shared,
        vec![sluggish(Duration::from_secs(30))],
        config,
    )
    .await;
    let mut rx = node.dispatcher.subscribe();

    node.coordinator.start_group(&ctx(1), key.group_id).await.unwrap();
    assert!(node.dispatcher.is_running(key).await);
    node.coordinator.stop_group(&ctx(1), key.group_id).await.unwrap();

    let event = wait_terminal(&mut rx, key).await;
    assert!(matches!(event, DispatchEvent::GroupStopped { .. }), "{event:?}");
    assert_eq!(shared.status(key).await, Some(GroupStatus::Stopped));
    assert_eq!(shared.events.completions_for(key).await, 0);
    assert_eq!(node.dispatcher.get_active_addresses(), 0);
    // Interrupted work is still written back, just not marked scanned.
    let persisted = shared.addresses.snapshot(key).await;
    assert_eq!(persisted.len(), 1);
    assert!(persisted[0].last_scanned_time.is_none());
    node.shutdown().await;
}

#[tokio::test]
async fn pausing_a_running_group_stops_its_loop() {
    let shared = Shared::new();
    let key = GroupKey::new(1, 8);
    shared.add_group(key).await;
    let hosts: Vec<String> = (0..256).map(|i| format!("h{i}.a.com")).collect();
    let host_refs: Vec<&str> = hosts.iter().map(String::as_str).collect();
    shared.seed_hosts(key, &host_refs).await;
    let node =
        Instance::start(&shared, vec![sluggish(Duration::from_millis(100))])
            .await;
    let mut rx = node.dispatcher.subscribe();

    node.coordinator.start_group(&ctx(1), key.group_id).await.unwrap();
    let paused = shared
        .groups
        .modify(key, |group| group.paused = true)
        .await
        .unwrap();
    perimeter_core::store::GroupStateStore::put_group(
        shared.store.as_ref(),
        &paused,
    )
    .await
    .unwrap();

    match wait_terminal(&mut rx, key).await {
        DispatchEvent::GroupStopped { reason, .. } => {
            assert_eq!(reason, "group paused")
        }
        other => panic!("expected a stop, got {other:?}"),
    }
    shared.wait_for_status(key, GroupStatus::Stopped).await;
    assert_eq!(shared.events.completions_for(key).await, 0);
    node.shutdown().await;
}

#[tokio::test]
async fn invalidation_reaches_every_instance_cache() {
    let shared = Shared::new();
    let key = GroupKey::new(1, 9);
    shared.add_group(key).await;
    let first = Instance::start(&shared, Vec::new()).await;
    let second = Instance::start(&shared, Vec::new()).await;
    let caller = ctx(1);
    for node in [&first, &second] {
        let snapshot = node.cache.get_group_by_ids(&caller, key).await;
        assert!(snapshot.unwrap().is_some());
    }

    let renamed = shared
        .groups
        .modify(key, |group| group.group_name = "renamed".into())
        .await
        .unwrap();
    perimeter_core::store::GroupStateStore::put_group(
        shared.store.as_ref(),
        &renamed,
    )
    .await
    .unwrap();

    for node in [&first, &second] {
        tokio::time::timeout(support::WAIT, async {
            loop {
                let snapshot = node
                    .cache
                    .get_group_by_ids(&caller, key)
                    .await
                    .unwrap()
                    .unwrap();
                if snapshot.group.group_name == "renamed" {
                    assert_eq!(snapshot.group.modified_time, renamed.modified_time);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("cache picked up the new configuration");
    }
    first.shutdown().await;
    second.shutdown().await;
}

#[tokio::test]
async fn failed_dispatch_leaves_the_group_stopped() {
    let shared = Shared::new();
    let key = GroupKey::new(1, 10);
    shared.add_group(key).await;
    shared.seed_hosts(key, &["a.com"]).await;
    let node = Instance::start(&shared, Vec::new()).await;
    node.dispatcher.shutdown().await;

    let result = node.coordinator.start_group(&ctx(1), key.group_id).await;
    assert!(result.is_err());
    assert_eq!(shared.status(key).await, Some(GroupStatus::Stopped));
    node.shutdown().await;
}

#[tokio::test]
async fn reconcile_starts_groups_in_every_org() {
    let shared = Shared::new();
    let keys = [GroupKey::new(1, 11), GroupKey::new(2, 11)];
    for key in keys {
        shared.add_group(key).await;
        shared.seed_hosts(key, &["a.com"]).await;
    }
    let node =
        Instance::start(&shared, vec![Resolver::new(&[("a.com", "1.1.1.1")])])
            .await;

    let report = node.coordinator.reconcile_once().await.unwrap();
    assert_eq!(report.started.len(), 2);
    assert!(report.failed.is_empty());

    for key in keys {
        shared.wait_for_status(key, GroupStatus::Stopped).await;
        assert_eq!(shared.events.completions_for(key).await, 1);
        assert_eq!(shared.addresses.snapshot(key).await.len(), 2);
    }
    node.shutdown().await;
}

#[tokio::test]
async fn large_group_is_written_back_in_bounded_batches() {
    let shared = Shared::new();
    let key = GroupKey::new(1, 12);
    shared.add_group(key).await;
    let hosts: Vec<String> = (0..300).map(|i| format!("n{i}.a.com")).collect();
    let host_refs: Vec<&str> = hosts.iter().map(String::as_str).collect();
    shared.seed_hosts(key, &host_refs).await;
    let node = Instance::start(&shared, Vec::new()).await;
    let mut rx = node.dispatcher.subscribe();

    node.coordinator.start_group(&ctx(1), key.group_id).await.unwrap();
    let event = wait_terminal(&mut rx, key).await;
    assert!(
        matches!(event, DispatchEvent::GroupCompleted { processed: 300, .. }),
        "{event:?}"
    );

    let calls = shared.addresses.update_calls().await;
    assert!(!calls.is_empty());
    assert!(calls.iter().all(|size| *size <= 100), "{calls:?}");
    assert_eq!(calls.iter().sum::<usize>(), 300);
    let persisted = shared.addresses.snapshot(key).await;
    assert!(persisted.iter().all(|a| a.last_scanned_time.is_some()));
    node.shutdown().await;
}

#[tokio::test]
async fn in_place_update_keeps_identity_and_provenance() {
    let shared = Shared::new();
    let key = GroupKey::new(1, 21);
    shared.add_group(key).await;
    shared.seed_hosts(key, &["a.com"]).await;
    let walker = ZoneWalker::new(&[("a.com", "1.2.3.4", &["b.a.com"][..])]);
    let node = Instance::start(&shared, vec![walker]).await;
    let mut rx = node.dispatcher.subscribe();

    node.coordinator.start_group(&ctx(1), key.group_id).await.unwrap();
    let event = wait_terminal(&mut rx, key).await;
    assert!(
        matches!(event, DispatchEvent::GroupCompleted { processed: 2, .. }),
        "{event:?}"
    );

    let seed_hash = AddressHash::of("", "a.com");
    let persisted = shared.addresses.snapshot(key).await;
    assert_eq!(persisted.len(), 2);
    let seed = persisted
        .iter()
        .find(|address| address.host_address == "a.com")
        .expect("seed persisted");
    assert_eq!(seed.address_hash, seed_hash);
    assert_eq!(seed.ip_address, "1.2.3.4");
    assert!(seed.last_scanned_time.is_some());

    let child = persisted
        .iter()
        .find(|address| address.host_address == "b.a.com")
        .expect("zone name persisted");
    assert_eq!(child.found_from, Some(seed_hash));
    assert_eq!(child.discovered_by, DiscoveryMethod::NsAxfr);
    node.shutdown().await;
}

#[tokio::test]
async fn long_running_group_is_not_taken_over_by_another_instance() {
    let shared = Shared::new();
    let key = GroupKey::new(1, 22);
    shared.add_group(key).await;
    shared.seed_hosts(key, &["a.com"]).await;
    let mut config = test_config();
    config.coordinator.stale_started_secs = 1;
    config.analyzers.call_timeout_ms = 60_000;
    let first = Instance::start_with(
        &shared,
        vec![sluggish(Duration::from_secs(5))],
        config.clone(),
    )
    .await;
    let second = Instance::start_with(
        &shared,
        vec![sluggish(Duration::from_secs(5))],
        config,
    )
    .await;
    let mut rx = first.dispatcher.subscribe();

    let outcome = first.coordinator.start_group(&ctx(1), key.group_id).await;
    assert_eq!(outcome.unwrap(), StartOutcome::Started);
    // Outlive the stale window while the first instance is mid-call.
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    let report = second.coordinator.reconcile_once().await.unwrap();
    assert!(report.recovered.is_empty(), "{report:?}");
    assert_eq!(report.already_started, 1);
    assert!(first.dispatcher.is_running(key).await);
    assert!(!second.dispatcher.is_running(key).await);
    assert_eq!(shared.status(key).await, Some(GroupStatus::Started));

    first.coordinator.stop_group(&ctx(1), key.group_id).await.unwrap();
    wait_terminal(&mut rx, key).await;
    shared.wait_for_status(key, GroupStatus::Stopped).await;
    first.shutdown().await;
    second.shutdown().await;
}

#[tokio::test]
async fn silent_run_is_recovered_after_the_stale_window() {
    let shared = Shared::new();
    let key = GroupKey::new(1, 23);
    shared.add_group(key).await;
    shared.seed_hosts(key, &["a.com"]).await;
    let mut config = test_config();
    config.coordinator.stale_started_secs = 1;
    let node = Instance::start_with(
        &shared,
        vec![Resolver::new(&[("a.com", "1.1.1.1")])],
        config,
    )
    .await;
    let mut rx = node.dispatcher.subscribe();

    // A run whose instance died without releasing the status.
    let dead = perimeter_core::store::GroupStateStore::try_start(
        shared.store.as_ref(),
        key,
    )
    .await
    .unwrap()
    .expect("status lock free");
    let report = node.coordinator.reconcile_once().await.unwrap();
    assert!(report.recovered.is_empty(), "{report:?}");

    tokio::time::sleep(Duration::from_millis(1_200)).await;
    let report = node.coordinator.reconcile_once().await.unwrap();
    assert_eq!(report.recovered, vec![key]);
    match wait_terminal(&mut rx, key).await {
        DispatchEvent::GroupCompleted { run_id, .. } => assert_ne!(run_id, dead),
        other => panic!("expected completion, got {other:?}"),
    }
    shared.wait_for_status(key, GroupStatus::Stopped).await;
    assert_eq!(shared.events.completions_for(key).await, 1);
    node.shutdown().await;
}
