// Integration tests for conversation aggregation across gateway instances

mod common;

use common::{chat, inbox, inbox_with, MockGateway};
use std::sync::Arc;
use switchboard::inbox::{DiscoveryOrder, InboxError, InboxSettings};
use switchboard::models::PipelineStage;

const ANA: &str = "5511999990000@s.whatsapp.net";

fn two_shops() -> Arc<MockGateway> {
    let mock = MockGateway::new();
    mock.set_instances(&[("shop-1", "open"), ("shop-2", "open"), ("shop-3", "close")]);
    mock.set_chats("shop-1", vec![chat(ANA, "Ana", "oi", 1)]);
    mock.set_chats(
        "shop-2",
        vec![
            chat("5511999990000:7@s.whatsapp.net", "Ana (shop 2)", "hello again", 2),
            chat("5521888880000@s.whatsapp.net", "Bruno", "tudo bem?", 0),
        ],
    );
    mock.set_chats("shop-3", vec![chat("5531777770000@s.whatsapp.net", "Carla", "hidden", 0)]);
    mock
}

#[tokio::test]
async fn test_same_contact_on_two_instances_is_one_conversation() {
    let mock = two_shops();
    let inbox = inbox(&mock);

    let report = inbox.sync().await.unwrap();
    assert_eq!(report.synced, ["shop-1", "shop-2"]);
    assert!(!report.is_partial());
    assert_eq!(report.merge.created, 2);
    assert_eq!(report.merge.duplicates, 1);

    let ana = inbox.conversation("5511999990000").await.unwrap();
    assert_eq!(ana.owner_instance, "shop-1");
    assert_eq!(ana.contact_name, "Ana");
    assert_eq!(ana.contact_phone, "5511999990000");
    assert_eq!(ana.last_message_preview, "oi");
    assert!(!ana.is_group);
    assert_eq!(ana.pipeline_status, PipelineStage::New);

    let conversations = inbox.conversations().await;
    let ids: Vec<&str> = conversations.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, ["5511999990000", "5521888880000"]);

    // Disconnected instances are never asked for chats
    assert_eq!(mock.calls("find_chats:shop-3"), 0);
    assert!(inbox.conversation("5531777770000").await.is_none());
}

#[tokio::test]
async fn test_resync_is_idempotent() {
    let mock = two_shops();
    let inbox = inbox(&mock);

    inbox.sync().await.unwrap();
    let first = inbox.conversations().await;

    let report = inbox.sync().await.unwrap();
    assert_eq!(report.merge.created, 0);
    assert_eq!(report.merge.refreshed, 2);
    assert_eq!(inbox.conversations().await, first);
}

#[tokio::test]
async fn test_owner_is_kept_when_first_instance_goes_away() {
    let mock = two_shops();
    let inbox = inbox(&mock);
    inbox.sync().await.unwrap();

    mock.set_status("shop-1", "close");
    mock.set_chats("shop-2", vec![chat(ANA, "Ana", "new text", 4)]);
    inbox.sync().await.unwrap();

    let ana = inbox.conversation("5511999990000").await.unwrap();
    assert_eq!(ana.owner_instance, "shop-1");
    assert_eq!(ana.last_message_preview, "new text");
    assert_eq!(ana.unread_count, 4);
    // Not reported this pass, but never removed
    assert!(inbox.conversation("5521888880000").await.is_some());
}

#[tokio::test]
async fn test_stage_survives_resync() {
    let mock = two_shops();
    let inbox = inbox(&mock);
    inbox.sync().await.unwrap();

    inbox.set_stage("5521888880000", PipelineStage::Waiting).await.unwrap();
    inbox.sync().await.unwrap();

    let bruno = inbox.conversation("5521888880000").await.unwrap();
    assert_eq!(bruno.pipeline_status, PipelineStage::Waiting);
    assert!(matches!(
        inbox.set_stage("nobody", PipelineStage::Done).await,
        Err(InboxError::UnknownConversation(_))
    ));
}

#[tokio::test]
async fn test_no_connected_instances_leaves_map_untouched() {
    let mock = two_shops();
    let inbox = inbox(&mock);
    inbox.sync().await.unwrap();
    let before = inbox.conversations().await;

    mock.set_instances(&[("shop-1", "close"), ("shop-2", "connecting")]);
    assert!(matches!(inbox.sync().await, Err(InboxError::NoConnectedInstances)));
    assert_eq!(inbox.conversations().await, before);
}

#[tokio::test]
async fn test_unreachable_gateway_is_a_transport_error() {
    let mock = two_shops();
    mock.set_instances_down(true);
    let inbox = inbox(&mock);

    assert!(matches!(inbox.sync().await, Err(InboxError::Transport(_))));
    assert!(inbox.conversations().await.is_empty());
}

#[tokio::test]
async fn test_partial_failure_merges_the_rest() {
    let mock = two_shops();
    mock.fail_chats("shop-1");
    let inbox = inbox(&mock);

    let report = inbox.sync().await.unwrap();
    assert!(report.is_partial());
    assert_eq!(report.synced, ["shop-2"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].instance, "shop-1");
    assert_eq!(report.summary(), "1 of 2 instances synced, 2 conversations (2 new)");

    // shop-2 reported Ana first this time, so it owns her
    let ana = inbox.conversation("5511999990000").await.unwrap();
    assert_eq!(ana.owner_instance, "shop-2");

    assert!(matches!(report.ensure_complete(), Err(InboxError::PartialSyncFailure { .. })));
}

#[tokio::test]
async fn test_every_instance_failing_is_reported_as_degraded() {
    let mock = two_shops();
    mock.fail_chats("shop-1");
    mock.fail_chats("shop-2");
    let inbox = inbox(&mock);

    match inbox.sync().await {
        Err(InboxError::AllInstancesFailed { failed }) => {
            let names: Vec<&str> = failed.iter().map(|f| f.instance.as_str()).collect();
            assert_eq!(names, ["shop-1", "shop-2"]);
        }
        other => panic!("expected AllInstancesFailed, got {:?}", other),
    }
    assert!(inbox.conversations().await.is_empty());
}

#[tokio::test]
async fn test_overlapping_sync_is_rejected() {
    let mock = two_shops();
    let inbox = Arc::new(inbox(&mock));
    let gate = mock.hold_instances();

    let first = tokio::spawn({
        let inbox = inbox.clone();
        async move { inbox.sync().await }
    });
    gate.wait_started().await;

    assert!(matches!(inbox.sync().await, Err(InboxError::SyncInProgress)));

    gate.release();
    let report = first.await.unwrap().unwrap();
    assert_eq!(report.synced.len(), 2);
}

#[tokio::test]
async fn test_priority_order_decides_ownership() {
    let mock = two_shops();
    let settings = InboxSettings {
        discovery_order: DiscoveryOrder::Priority(vec!["shop-2".to_string()]),
        ..InboxSettings::default()
    };
    let inbox = inbox_with(&mock, settings);

    let report = inbox.sync().await.unwrap();
    assert_eq!(report.synced, ["shop-2", "shop-1"]);

    let ana = inbox.conversation("5511999990000").await.unwrap();
    assert_eq!(ana.owner_instance, "shop-2");
    assert_eq!(ana.contact_name, "Ana (shop 2)");
    // The first discovered address is the one used for sends and history
    assert_eq!(ana.remote_jid, "5511999990000:7@s.whatsapp.net");
}

#[tokio::test]
async fn test_groups_and_unaddressable_chats() {
    let mock = MockGateway::new();
    mock.set_instances(&[("shop-1", "open")]);
    let mut nameless = chat("", "Nobody", "?", 0);
    nameless.remote_jid = None;
    mock.set_chats(
        "shop-1",
        vec![
            chat("120363040000000000@g.us", "Suppliers", "order shipped", 3),
            chat("status@broadcast", "Status", "story", 0),
            nameless,
        ],
    );
    let inbox = inbox(&mock);

    let report = inbox.sync().await.unwrap();
    assert_eq!(report.merge.created, 1);
    assert_eq!(report.merge.dropped, 2);

    let group = inbox.conversation("120363040000000000").await.unwrap();
    assert!(group.is_group);
    assert_eq!(group.contact_phone, "");
    assert_eq!(group.unread_count, 3);
}

#[tokio::test]
async fn test_list_observable_follows_sync() {
    let mock = two_shops();
    let inbox = inbox(&mock);
    let mut rx = inbox.subscribe_conversations();

    inbox.sync().await.unwrap();
    assert!(rx.has_changed().unwrap());
    assert_eq!(rx.borrow_and_update().len(), 2);
}

#[tokio::test]
async fn test_ownership_follows_discovery_order_not_arrival() {
    let mock = two_shops();
    let inbox = Arc::new(inbox(&mock));
    let gate = mock.hold_chats("shop-1");

    let sync = tokio::spawn({
        let inbox = inbox.clone();
        async move { inbox.sync().await }
    });
    gate.wait_started().await;
    // shop-2 has answered while shop-1 is still pending
    assert_eq!(mock.calls("find_chats:shop-2"), 1);

    gate.release();
    let report = sync.await.unwrap().unwrap();
    assert_eq!(report.synced, ["shop-1", "shop-2"]);

    let ana = inbox.conversation("5511999990000").await.unwrap();
    assert_eq!(ana.owner_instance, "shop-1");
    assert_eq!(ana.contact_name, "Ana");
}
